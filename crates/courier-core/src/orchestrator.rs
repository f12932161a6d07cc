//! Submission glue: ledger pre-check, record creation, provider submission,
//! and exactly one spawned reconciliation task per record.
//!
//! All three submission paths share the same shape: validate input, check
//! affordability with the caller's pre-estimate, persist a `Processing`
//! record, then hand the record to a background driver that moves it to a
//! terminal state and bills the actual measured cost on success. The task id
//! is returned as soon as the record exists; callers observe progress
//! through the store only.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::batch::{BatchEvent, BatchOptions, BatchQueue};
use crate::duplex::{StreamDriver, StreamOptions, StreamOutcome};
use crate::ledger::ResourceLedger;
use crate::poll::{PollOptions, PollingReconciler};
use crate::provider::{JobHandle, StatusReport, StreamConn};
use crate::store::TaskStore;
use crate::types::{CoreError, ErrorInfo, NewTask, PrincipalId, TaskId, TaskPatch, TaskState};

/// Tuning for the orchestrator's three reconciliation paths.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub poll: PollOptions,
    pub stream: StreamOptions,
    pub batch: BatchOptions,
}

/// One job submission as seen by the engine.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub principal_id: PrincipalId,
    /// Provider / application identifier the job runs against.
    pub app_id: String,
    /// Opaque provider parameters, forwarded verbatim.
    pub params: serde_json::Value,
    /// Pre-estimated cost in points, checked against the ledger before any
    /// record is created or provider called.
    pub cost_estimate: i64,
}

/// Output of one successfully processed batch item.
#[derive(Debug, Clone)]
pub struct BatchItemOutput {
    /// Units actually processed, summed into the batch deduction.
    pub units: i64,
    /// Provider payload for the item, if any.
    pub payload: Option<serde_json::Value>,
}

/// The engine facade request handlers talk to.
///
/// Holds the store and ledger handles plus tuning; every submission spawns
/// its own driver task, so the orchestrator itself is cheap to clone.
pub struct JobOrchestrator<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    opts: OrchestratorOptions,
}

impl<S, L> Clone for JobOrchestrator<S, L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ledger: Arc::clone(&self.ledger),
            opts: self.opts.clone(),
        }
    }
}

impl<S: TaskStore, L: ResourceLedger> JobOrchestrator<S, L> {
    pub fn new(store: Arc<S>, ledger: Arc<L>, opts: OrchestratorOptions) -> Self {
        Self {
            store,
            ledger,
            opts,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Submit a job reconciled by status polling.
    ///
    /// `submit` performs the provider call and returns the external job
    /// handle; `query` answers one status poll. Both run inside the spawned
    /// driver, after the record exists.
    pub async fn submit_polled_job<Sub, SubF, Q, QF>(
        &self,
        req: JobRequest,
        submit: Sub,
        query: Q,
    ) -> Result<TaskId, CoreError>
    where
        Sub: FnOnce(serde_json::Value) -> SubF + Send + 'static,
        SubF: Future<Output = Result<JobHandle, CoreError>> + Send + 'static,
        Q: FnMut(JobHandle) -> QF + Send + 'static,
        QF: Future<Output = Result<StatusReport, CoreError>> + Send + 'static,
    {
        let record = self.admit(&req).await?;
        let task_id = record.id;

        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let poll_opts = self.opts.poll.clone();
        let principal = req.principal_id;
        let estimate = req.cost_estimate;
        let params = req.params;

        tokio::spawn(async move {
            let handle = match submit(params).await {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(task_id, error = %e, "provider submission failed");
                    fail_record(store.as_ref(), task_id, 0, e.to_error_info()).await;
                    return;
                }
            };
            debug!(task_id, %handle, "job submitted; polling for completion");

            let reconciler = PollingReconciler::new(store, poll_opts);
            reconciler
                .reconcile(task_id, handle, estimate, query, move |actual| {
                    bill(ledger, task_id, principal, actual)
                })
                .await;
        });

        Ok(task_id)
    }

    /// Submit a job reconciled over a duplex stream.
    ///
    /// `open` establishes the channel; `post` is the provider-specific
    /// post-processing of the accumulated output (upload, transform) and
    /// returns the record's result fragments.
    pub async fn submit_streaming_job<O, OF, P, PF>(
        &self,
        req: JobRequest,
        open: O,
        post: P,
    ) -> Result<TaskId, CoreError>
    where
        O: FnOnce() -> OF + Send + 'static,
        OF: Future<Output = Result<StreamConn, CoreError>> + Send + 'static,
        P: FnOnce(StreamOutcome) -> PF + Send + 'static,
        PF: Future<Output = Result<Vec<serde_json::Value>, CoreError>> + Send + 'static,
    {
        let record = self.admit(&req).await?;
        let task_id = record.id;

        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let stream_opts = self.opts.stream.clone();
        let principal = req.principal_id;
        let estimate = req.cost_estimate;
        let params = req.params;

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let elapsed = |t: tokio::time::Instant| t.elapsed().as_millis() as i64;

            let conn = match open().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(task_id, error = %e, "failed to open job stream");
                    fail_record(store.as_ref(), task_id, elapsed(started), e.to_error_info())
                        .await;
                    return;
                }
            };

            let driver = StreamDriver::new(stream_opts);
            let outcome = match driver.run(params, conn).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(task_id, error = %e, "stream job failed");
                    fail_record(store.as_ref(), task_id, elapsed(started), e.to_error_info())
                        .await;
                    return;
                }
            };

            // Bill the units the provider reported, not the pre-estimate.
            let actual = outcome.billed_units.unwrap_or(estimate);
            let result = match post(outcome).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(task_id, error = %e, "stream post-processing failed");
                    fail_record(store.as_ref(), task_id, elapsed(started), e.to_error_info())
                        .await;
                    return;
                }
            };

            apply_patch(
                store.as_ref(),
                task_id,
                TaskPatch {
                    state: Some(TaskState::Completed),
                    use_time_ms: Some(elapsed(started)),
                    used_points: Some(actual),
                    result: Some(result),
                    ..Default::default()
                },
            )
            .await;
            info!(task_id, points = actual, "stream job completed");
            bill(ledger, task_id, principal, actual).await;
        });

        Ok(task_id)
    }

    /// Submit a fan-out batch as one record.
    ///
    /// Every item runs through `run_item` under the batch queue's bounded
    /// concurrency. The record fails only when *all* items failed; the
    /// deduction charges the units of the successful items only.
    pub async fn submit_batch<R, RF>(
        &self,
        req: JobRequest,
        items: Vec<serde_json::Value>,
        run_item: R,
    ) -> Result<TaskId, CoreError>
    where
        R: Fn(serde_json::Value) -> RF + Send + Sync + 'static,
        RF: Future<Output = Result<BatchItemOutput, CoreError>> + Send + 'static,
    {
        if items.is_empty() {
            return Err(CoreError::Input("batch contains no items".to_owned()));
        }
        let record = self.admit(&req).await?;
        let task_id = record.id;

        let store = Arc::clone(&self.store);
        let ledger = Arc::clone(&self.ledger);
        let batch_opts = self.opts.batch.clone();
        let principal = req.principal_id;

        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            let total = items.len();

            let (queue, mut events) = BatchQueue::new(task_id, batch_opts, run_item);
            for item in items {
                queue.add(item);
            }

            // Settled items arrive in completion order; collect them all
            // before aggregating.
            let mut settled: Vec<Option<BatchEvent<BatchItemOutput>>> = Vec::new();
            settled.resize_with(total, || None);
            let mut seen = 0usize;
            while seen < total {
                match events.recv().await {
                    Some(event) => {
                        let index = event.index();
                        settled[index] = Some(event);
                        seen += 1;
                    }
                    None => break,
                }
            }

            let mut result = Vec::with_capacity(total);
            let mut errors = Vec::new();
            let mut success_units: i64 = 0;
            let mut succeeded = 0usize;
            for (index, slot) in settled.into_iter().enumerate() {
                match slot {
                    Some(BatchEvent::Completed { output, .. }) => {
                        succeeded += 1;
                        success_units += output.units;
                        result.push(serde_json::json!({
                            "index": index,
                            "ok": true,
                            "units": output.units,
                            "payload": output.payload,
                        }));
                    }
                    Some(BatchEvent::Failed { error, .. }) => {
                        errors.push(ErrorInfo::new(format!("item {index}: {error}")));
                        result.push(serde_json::json!({
                            "index": index,
                            "ok": false,
                            "error": error.to_string(),
                        }));
                    }
                    None => {
                        errors.push(ErrorInfo::new(format!("item {index}: never settled")));
                        result.push(serde_json::json!({
                            "index": index,
                            "ok": false,
                            "error": "never settled",
                        }));
                    }
                }
            }

            let use_time_ms = started.elapsed().as_millis() as i64;
            if succeeded == 0 {
                warn!(task_id, total, "every batch item failed");
                apply_patch(
                    store.as_ref(),
                    task_id,
                    TaskPatch {
                        state: Some(TaskState::Failed),
                        use_time_ms: Some(use_time_ms),
                        result: Some(result),
                        error_infos: Some(errors),
                        ..Default::default()
                    },
                )
                .await;
                return;
            }

            apply_patch(
                store.as_ref(),
                task_id,
                TaskPatch {
                    state: Some(TaskState::Completed),
                    use_time_ms: Some(use_time_ms),
                    used_points: Some(success_units),
                    result: Some(result),
                    error_infos: Some(errors),
                    ..Default::default()
                },
            )
            .await;
            info!(
                task_id,
                succeeded,
                failed = total - succeeded,
                points = success_units,
                "batch completed"
            );
            bill(ledger, task_id, principal, success_units).await;
        });

        Ok(task_id)
    }

    /// Shared admission path: validate, ledger pre-check, record creation.
    /// No record reaches `Processing` when either check fails.
    async fn admit(&self, req: &JobRequest) -> Result<crate::types::TaskRecord, CoreError> {
        if req.app_id.is_empty() {
            return Err(CoreError::Input("app_id must not be empty".to_owned()));
        }
        if req.cost_estimate < 0 {
            return Err(CoreError::Input(
                "cost_estimate must not be negative".to_owned(),
            ));
        }

        let affordability = self
            .ledger
            .is_affordable(req.principal_id, req.cost_estimate)
            .await?;
        if !affordability.ok {
            debug!(
                principal = req.principal_id,
                required = req.cost_estimate,
                balance = affordability.balance,
                "job rejected: insufficient points"
            );
            return Err(CoreError::InsufficientPoints {
                required: req.cost_estimate,
                balance: affordability.balance,
            });
        }

        self.store
            .create_task(NewTask {
                principal_id: req.principal_id,
                app_id: req.app_id.clone(),
                start_time: chrono::Utc::now(),
            })
            .await
    }
}

/// Attempt the single post-success deduction. Failures are logged and never
/// touch the already-terminal record.
async fn bill<L: ResourceLedger>(
    ledger: Arc<L>,
    task_id: TaskId,
    principal: PrincipalId,
    amount: i64,
) {
    if amount <= 0 {
        return;
    }
    match ledger.deduct(principal, amount).await {
        Ok(true) => debug!(task_id, principal, amount, "points deducted"),
        Ok(false) => warn!(
            task_id,
            principal, amount, "deduction declined: balance below amount"
        ),
        Err(e) => warn!(task_id, principal, amount, error = %e, "deduction failed"),
    }
}

async fn apply_patch<S: TaskStore>(store: &S, task_id: TaskId, patch: TaskPatch) {
    if let Err(e) = store.update_task(task_id, patch).await {
        warn!(task_id, error = %e, "failed to persist task transition");
    }
}

async fn fail_record<S: TaskStore>(store: &S, task_id: TaskId, use_time_ms: i64, info: ErrorInfo) {
    apply_patch(
        store,
        task_id,
        TaskPatch {
            state: Some(TaskState::Failed),
            use_time_ms: Some(use_time_ms),
            error_infos: Some(vec![info]),
            ..Default::default()
        },
    )
    .await;
}
