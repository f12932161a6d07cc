//! Job-record persistence abstraction.
//!
//! [`TaskStore`] is the single source of truth for job lifecycle state. The
//! server backs it with SQLite; [`MemoryTaskStore`] is a process-local
//! implementation used by tests and embedded deployments.
//!
//! All trait methods use `impl Future` in their signatures so no extra
//! `async-trait` crate is required.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tokio::sync::RwLock;

use crate::types::{CoreError, NewTask, TaskId, TaskPatch, TaskRecord, TaskState};

/// Trait for persisting job records.
///
/// Implementations must uphold the terminal-immutability contract: once a
/// record's state is terminal, [`TaskStore::update_task`] silently drops any
/// further patch (re-writing the same terminal data is therefore a no-op, not
/// an error).
pub trait TaskStore: Send + Sync + 'static {
    /// Persist a fresh `Processing` record and return it with its allocated id.
    fn create_task(
        &self,
        new: NewTask,
    ) -> impl std::future::Future<Output = Result<TaskRecord, CoreError>> + Send;

    /// Apply a partial update to a record that is still `Processing`.
    fn update_task(
        &self,
        id: TaskId,
        patch: TaskPatch,
    ) -> impl std::future::Future<Output = Result<(), CoreError>> + Send;

    /// Fetch a record by id.
    fn get_task(
        &self,
        id: TaskId,
    ) -> impl std::future::Future<Output = Result<Option<TaskRecord>, CoreError>> + Send;

    /// Remove a record. Ownership checks are the caller's responsibility.
    fn delete_task(
        &self,
        id: TaskId,
    ) -> impl std::future::Future<Output = Result<(), CoreError>> + Send;
}

/// In-memory [`TaskStore`] backed by a `RwLock<HashMap>`.
///
/// Many readers may observe records concurrently while the single
/// reconciliation task per record writes its transitions.
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    inner: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held. Test helper.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl TaskStore for MemoryTaskStore {
    async fn create_task(&self, new: NewTask) -> Result<TaskRecord, CoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let record = TaskRecord {
            id,
            principal_id: new.principal_id,
            app_id: new.app_id,
            state: TaskState::Processing,
            start_time: new.start_time,
            use_time_ms: 0,
            used_points: 0,
            result: Vec::new(),
            error_infos: Vec::new(),
        };
        self.inner.write().await.insert(id, record.clone());
        Ok(record)
    }

    async fn update_task(&self, id: TaskId, patch: TaskPatch) -> Result<(), CoreError> {
        let mut guard = self.inner.write().await;
        let record = guard
            .get_mut(&id)
            .ok_or_else(|| CoreError::Store(format!("task {id} not found")))?;

        // Terminal records accept no further mutation.
        if record.state.is_terminal() {
            return Ok(());
        }

        if let Some(state) = patch.state {
            record.state = state;
        }
        if let Some(use_time_ms) = patch.use_time_ms {
            record.use_time_ms = use_time_ms;
        }
        if let Some(used_points) = patch.used_points {
            record.used_points = used_points;
        }
        if let Some(result) = patch.result {
            record.result = result;
        }
        if let Some(error_infos) = patch.error_infos {
            record.error_infos = error_infos;
        }
        Ok(())
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, CoreError> {
        Ok(self.inner.read().await.get(&id).cloned())
    }

    async fn delete_task(&self, id: TaskId) -> Result<(), CoreError> {
        self.inner.write().await.remove(&id);
        Ok(())
    }
}
