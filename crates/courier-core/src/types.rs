use chrono::{DateTime, Utc};
use thiserror::Error;

/// Unique identifier of a persisted job record, allocated by the store.
pub type TaskId = i64;

/// The account on whose behalf a job is submitted and billed.
pub type PrincipalId = i64;

/// Lifecycle state of a job record.
///
/// Records move only forward: `Processing` into exactly one of the terminal
/// states. `Success` is used by polled jobs, `Completed` by streaming and
/// batch jobs; both count as successful outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Processing,
    Success,
    Completed,
    Failed,
}

impl TaskState {
    /// Returns `true` once no further transitions may occur.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Success | TaskState::Completed | TaskState::Failed
        )
    }

    /// Returns `true` for the successful terminal states.
    pub fn is_succeeded(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Completed)
    }

    /// Stable string form used for persistence and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Processing => "processing",
            TaskState::Success => "success",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    /// Parse the persisted string form back into a state.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(TaskState::Processing),
            "success" => Some(TaskState::Success),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }
}

/// One captured job-level error: a human-readable message plus optional
/// provider detail (error code, upstream body, ...).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorInfo {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Some(details.into()),
        }
    }
}

/// A job record as held by the store.
///
/// Created in `Processing` by the submission path, then mutated only by the
/// reconciliation task driving it to a terminal state. Once terminal the
/// record is immutable; stores drop any further patch.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    pub principal_id: PrincipalId,
    /// Provider / application identifier the job was submitted against.
    pub app_id: String,
    pub state: TaskState,
    pub start_time: DateTime<Utc>,
    /// Wall-clock duration of the job in milliseconds.
    pub use_time_ms: i64,
    /// Resource units actually charged for the job.
    pub used_points: i64,
    /// Ordered, opaque result fragments (output URLs, text, ...).
    pub result: Vec<serde_json::Value>,
    /// Ordered job-level errors captured on the failure path.
    pub error_infos: Vec<ErrorInfo>,
}

/// Fields required to create a fresh `Processing` record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub principal_id: PrincipalId,
    pub app_id: String,
    pub start_time: DateTime<Utc>,
}

/// Partial update applied to a record by the reconciliation path.
///
/// `None` fields are left untouched. Stores ignore the whole patch when the
/// record is already terminal.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    pub use_time_ms: Option<i64>,
    pub used_points: Option<i64>,
    pub result: Option<Vec<serde_json::Value>>,
    pub error_infos: Option<Vec<ErrorInfo>>,
}

/// Errors produced by the orchestration engine.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Missing or invalid job parameters, rejected before any resource check.
    #[error("invalid input: {0}")]
    Input(String),

    /// The ledger pre-check failed; no record was created.
    #[error("insufficient points: required {required}, balance {balance}")]
    InsufficientPoints { required: i64, balance: i64 },

    /// Network-level failure talking to a provider. Retryable.
    #[error("provider transport error: {0}")]
    Transport(String),

    /// The provider explicitly reported the job as failed. Not retryable.
    #[error("provider failure: {message}")]
    Provider {
        code: Option<String>,
        message: String,
    },

    /// Retry budget or hard timeout exhausted without a terminal signal.
    #[error("operation timed out")]
    Timeout,

    /// The duplex channel closed before any terminal event arrived.
    #[error("connection closed before completion")]
    StreamClosed,

    /// Credential refresh failed after its retry budget.
    #[error("credential refresh failed: {0}")]
    Credential(String),

    /// Persistence-layer failure.
    #[error("store error: {0}")]
    Store(String),
}

impl CoreError {
    /// Transport-class errors may be retried by the batch queue; everything
    /// else is terminal for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transport(_))
    }

    /// Capture this error as a record-level [`ErrorInfo`].
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            CoreError::Provider {
                code: Some(code),
                message,
            } => ErrorInfo::with_details(message.clone(), format!("provider code {code}")),
            other => ErrorInfo::new(other.to_string()),
        }
    }
}
