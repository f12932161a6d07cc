//! Provider-facing seam types.
//!
//! The engine never speaks a concrete wire format. Submission, status
//! queries and stream opening are injected as closures or small traits;
//! this module defines the types flowing across that seam.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::types::{CoreError, ErrorInfo, PrincipalId};

/// Opaque handle to a job on the provider's side, returned by submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle(pub String);

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One answer from a provider status query.
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    /// The provider considers the job finished (successfully or not).
    pub terminal: bool,
    /// Only meaningful when `terminal` is set.
    pub success: bool,
    /// Provider result payload on success.
    pub payload: Option<serde_json::Value>,
    /// Provider error on failure.
    pub error: Option<ErrorInfo>,
    /// Actual resource units consumed, when the provider reports true usage.
    pub cost: Option<i64>,
}

impl StatusReport {
    /// Job is still running.
    pub fn running() -> Self {
        Self::default()
    }

    pub fn succeeded(payload: Option<serde_json::Value>, cost: Option<i64>) -> Self {
        Self {
            terminal: true,
            success: true,
            payload,
            error: None,
            cost,
        }
    }

    pub fn failed(error: ErrorInfo) -> Self {
        Self {
            terminal: true,
            success: false,
            payload: None,
            error: Some(error),
            cost: None,
        }
    }
}

/// A single frame on a duplex job stream.
///
/// Providers interleave JSON control messages with raw binary output on one
/// channel; the variant is decided once per frame by [`Frame::classify`].
#[derive(Debug, Clone)]
pub enum Frame {
    /// A JSON control message (`task-started`, `task-finished`, ...).
    Control(serde_json::Value),
    /// A chunk of raw job output. Arrival order defines output order.
    Binary(Bytes),
}

impl Frame {
    /// Classify a raw frame: a payload whose first non-whitespace byte is `{`
    /// and which parses as a JSON object is a control frame, everything else
    /// is binary output.
    pub fn classify(raw: Bytes) -> Frame {
        let looks_like_json = raw
            .iter()
            .find(|b| !b.is_ascii_whitespace())
            .is_some_and(|b| *b == b'{');
        if looks_like_json {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&raw) {
                if value.is_object() {
                    return Frame::Control(value);
                }
            }
        }
        Frame::Binary(raw)
    }
}

/// Default capacity of each direction of a [`StreamConn`].
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// The engine's end of one duplex job channel.
///
/// `outgoing` carries control frames toward the provider; `incoming` yields
/// frames from the provider and ends (`None`) when the channel closes.
#[derive(Debug)]
pub struct StreamConn {
    pub outgoing: mpsc::Sender<Frame>,
    pub incoming: mpsc::Receiver<Frame>,
}

/// The provider's end of one duplex job channel, mirror of [`StreamConn`].
/// Transport adapters (and tests) drive this side.
#[derive(Debug)]
pub struct StreamPeer {
    /// Frames the engine sent.
    pub incoming: mpsc::Receiver<Frame>,
    /// Sender feeding frames to the engine; dropping it closes the channel.
    pub outgoing: mpsc::Sender<Frame>,
}

/// Create a connected duplex channel pair with the given per-direction capacity.
pub fn stream_pair(capacity: usize) -> (StreamConn, StreamPeer) {
    let (to_provider_tx, to_provider_rx) = mpsc::channel(capacity);
    let (to_engine_tx, to_engine_rx) = mpsc::channel(capacity);
    (
        StreamConn {
            outgoing: to_provider_tx,
            incoming: to_engine_rx,
        },
        StreamPeer {
            incoming: to_provider_rx,
            outgoing: to_engine_tx,
        },
    )
}

/// A short-lived provider token as issued by a [`TokenSource`].
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    /// Validity window from the moment of issuance.
    pub ttl: std::time::Duration,
}

/// Exchanges a signed assertion for a short-lived provider token.
///
/// Implementations perform the actual network exchange; deduplication of
/// concurrent calls is the [`CredentialCache`]'s job.
///
/// [`CredentialCache`]: crate::credentials::CredentialCache
pub trait TokenSource: Send + Sync + 'static {
    fn fetch(
        &self,
        principal: PrincipalId,
        scope: &str,
    ) -> impl std::future::Future<Output = Result<IssuedToken, CoreError>> + Send;
}
