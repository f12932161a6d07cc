//! Bounded status polling for submitted jobs.
//!
//! One [`PollingReconciler`] run drives exactly one record to a terminal
//! state. Each iteration is a single async step scheduled after the previous
//! one completes, so status queries never overlap for a given job.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::provider::{JobHandle, StatusReport};
use crate::store::TaskStore;
use crate::types::{CoreError, ErrorInfo, TaskId, TaskPatch, TaskState};

/// Tuning for the polling loop.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Delay between consecutive status queries.
    pub interval: Duration,
    /// Maximum number of status queries before the job is failed with a
    /// timeout, regardless of provider state.
    pub max_retries: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(3000),
            max_retries: 100,
        }
    }
}

/// Drives one job record to a terminal state by repeated status queries.
///
/// Holds nothing beyond the store handle and its options; run one instance
/// per job record, never two against the same record id.
pub struct PollingReconciler<S> {
    store: Arc<S>,
    opts: PollOptions,
}

impl<S: TaskStore> PollingReconciler<S> {
    pub fn new(store: Arc<S>, opts: PollOptions) -> Self {
        Self { store, opts }
    }

    /// Poll `query` until a terminal report, a query error, or retry
    /// exhaustion, updating the record accordingly.
    ///
    /// On a successful terminal report the record moves to `Success` with
    /// `use_time_ms = polls * interval` and `deduct` is invoked exactly once
    /// with the actual cost (provider-reported usage, falling back to
    /// `estimate`). Every failure path performs zero deductions.
    pub async fn reconcile<Q, QF, D, DF>(
        &self,
        task_id: TaskId,
        handle: JobHandle,
        estimate: i64,
        mut query: Q,
        deduct: D,
    ) where
        Q: FnMut(JobHandle) -> QF,
        QF: Future<Output = Result<StatusReport, CoreError>>,
        D: FnOnce(i64) -> DF,
        DF: Future<Output = ()>,
    {
        let mut polls: u32 = 0;
        loop {
            if polls >= self.opts.max_retries {
                warn!(
                    task_id,
                    polls, "status polling exhausted without a terminal provider state"
                );
                self.fail(
                    task_id,
                    polls,
                    CoreError::Timeout.to_error_info(),
                )
                .await;
                return;
            }

            tokio::time::sleep(self.opts.interval).await;
            polls += 1;

            match query(handle.clone()).await {
                Ok(report) if !report.terminal => {
                    debug!(task_id, polls, "job still running");
                }
                Ok(report) if report.success => {
                    let actual = report.cost.unwrap_or(estimate);
                    self.apply(
                        task_id,
                        TaskPatch {
                            state: Some(TaskState::Success),
                            use_time_ms: Some(self.elapsed_ms(polls)),
                            used_points: Some(actual),
                            result: Some(report.payload.into_iter().collect()),
                            ..Default::default()
                        },
                    )
                    .await;
                    debug!(task_id, polls, points = actual, "job succeeded");
                    deduct(actual).await;
                    return;
                }
                Ok(report) => {
                    let info = report
                        .error
                        .unwrap_or_else(|| ErrorInfo::new("provider reported failure"));
                    self.fail(task_id, polls, info).await;
                    return;
                }
                Err(e) => {
                    warn!(task_id, polls, error = %e, "status query failed");
                    self.fail(task_id, polls, e.to_error_info()).await;
                    return;
                }
            }
        }
    }

    fn elapsed_ms(&self, polls: u32) -> i64 {
        polls as i64 * self.opts.interval.as_millis() as i64
    }

    async fn apply(&self, task_id: TaskId, patch: TaskPatch) {
        if let Err(e) = self.store.update_task(task_id, patch).await {
            warn!(task_id, error = %e, "failed to persist task transition");
        }
    }

    async fn fail(&self, task_id: TaskId, polls: u32, info: ErrorInfo) {
        self.apply(
            task_id,
            TaskPatch {
                state: Some(TaskState::Failed),
                use_time_ms: Some(self.elapsed_ms(polls)),
                error_infos: Some(vec![info]),
                ..Default::default()
            },
        )
        .await;
    }
}
