pub mod batch;
pub mod credentials;
pub mod duplex;
pub mod ledger;
pub mod orchestrator;
pub mod poll;
pub mod provider;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use batch::{BatchEvent, BatchJob, BatchOptions, BatchQueue};
pub use credentials::{CredentialCache, CredentialOptions};
pub use duplex::{StreamDriver, StreamOptions, StreamOutcome};
pub use ledger::{Affordability, MemoryLedger, ResourceLedger};
pub use orchestrator::{BatchItemOutput, JobOrchestrator, JobRequest, OrchestratorOptions};
pub use poll::{PollOptions, PollingReconciler};
pub use provider::{
    Frame, IssuedToken, JobHandle, STREAM_CHANNEL_CAPACITY, StatusReport, StreamConn, StreamPeer,
    TokenSource, stream_pair,
};
pub use store::{MemoryTaskStore, TaskStore};
pub use types::{
    CoreError, ErrorInfo, NewTask, PrincipalId, TaskId, TaskPatch, TaskRecord, TaskState,
};
