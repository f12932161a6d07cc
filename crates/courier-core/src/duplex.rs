//! Duplex stream protocol for providers that push job progress and raw
//! output over one bidirectional channel.
//!
//! Wire shape (control frames are JSON objects, see [`Frame::classify`]):
//!
//! - engine → provider: `{"command": "run", "params": ...}`, then optionally
//!   `{"command": "continue"}` and `{"command": "finish"}` once the provider
//!   signals start.
//! - provider → engine: `{"event": "task-started"}`,
//!   `{"event": "task-finished", "units": n, "payload": ...}`,
//!   `{"event": "task-failed", "code": ..., "message": ...}`, interleaved
//!   with raw binary output frames.
//!
//! The driver is store-free: it returns a [`StreamOutcome`] (or error) and
//! the orchestrator applies the record transition and billing.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tracing::debug;

use crate::provider::{Frame, StreamConn};
use crate::types::CoreError;

/// Tuning for one protocol run.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// Hard ceiling on the whole run, independent of channel activity.
    pub run_timeout: Duration,
    /// Grace delay between `continue` and `finish`, letting trailing
    /// continue-phase data arrive first.
    pub finish_grace: Duration,
    /// Whether the protocol requires the caller to drive input in two
    /// phases (`continue` + `finish` after `task-started`).
    pub two_phase: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(120),
            finish_grace: Duration::from_secs(1),
            two_phase: true,
        }
    }
}

/// Protocol phase. Terminal phases are `Finished` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Opened,
    Started,
    Finished,
    Failed,
}

/// Result of a completed protocol run.
#[derive(Debug)]
pub struct StreamOutcome {
    /// Binary output frames concatenated in exact arrival order.
    pub data: Bytes,
    /// Actual units consumed as reported by `task-finished`, when present.
    pub billed_units: Option<i64>,
    /// Provider payload attached to `task-finished`, when present.
    pub payload: Option<serde_json::Value>,
}

/// State-machine driver for one duplex job channel.
///
/// Events on a channel are handled strictly sequentially; distinct channels
/// (one per job) are independent.
pub struct StreamDriver {
    opts: StreamOptions,
}

impl StreamDriver {
    pub fn new(opts: StreamOptions) -> Self {
        Self { opts }
    }

    /// Run the protocol to a terminal phase.
    ///
    /// Fails with [`CoreError::Timeout`] when the hard ceiling elapses first,
    /// and with [`CoreError::StreamClosed`] when the channel ends before any
    /// terminal event.
    pub async fn run(
        &self,
        params: serde_json::Value,
        conn: StreamConn,
    ) -> Result<StreamOutcome, CoreError> {
        match tokio::time::timeout(self.opts.run_timeout, self.drive(params, conn)).await {
            Ok(outcome) => { eprintln!("DRIVE_OUTCOME={outcome:?}"); outcome },
            Err(_) => { eprintln!("DRIVE_TIMEOUT"); Err(CoreError::Timeout) },
        }
    }

    async fn drive(
        &self,
        params: serde_json::Value,
        mut conn: StreamConn,
    ) -> Result<StreamOutcome, CoreError> {
        let mut phase = StreamPhase::Opened;
        let mut output = BytesMut::new();

        let sc = send_control(&conn, json!({ "command": "run", "params": params })).await;
        eprintln!("SENT_RUN={sc:?}");
        sc?;

        loop {
            eprintln!("AWAIT_RECV");
            let frame = match conn.incoming.recv().await {
                Some(frame) => { eprintln!("GOT_FRAME"); frame },
                None => {
                    debug!(?phase, "stream channel closed before a terminal event");
                    return Err(CoreError::StreamClosed);
                }
            };

            match frame {
                Frame::Binary(chunk) => {
                    output.extend_from_slice(&chunk);
                }
                Frame::Control(event) => match event_name(&event) {
                    Some("task-started") => {
                        phase = StreamPhase::Started;
                        if self.opts.two_phase {
                            send_control(&conn, json!({ "command": "continue" })).await?;
                            tokio::time::sleep(self.opts.finish_grace).await;
                            send_control(&conn, json!({ "command": "finish" })).await?;
                        }
                    }
                    Some("task-finished") => {
                        let billed_units = event.get("units").and_then(|v| v.as_i64());
                        let payload = event.get("payload").cloned();
                        debug!(bytes = output.len(), ?billed_units, "stream finished");
                        return Ok(StreamOutcome {
                            data: output.freeze(),
                            billed_units,
                            payload,
                        });
                    }
                    Some("task-failed") => {
                        let code = event
                            .get("code")
                            .and_then(|v| v.as_str())
                            .map(str::to_owned);
                        let message = event
                            .get("message")
                            .and_then(|v| v.as_str())
                            .unwrap_or("provider reported stream failure")
                            .to_owned();
                        return Err(CoreError::Provider { code, message });
                    }
                    other => {
                        // Unknown control events are ignored, not fatal.
                        debug!(event = ?other, "ignoring unrecognised control event");
                    }
                },
            }
        }
    }
}

fn event_name(event: &serde_json::Value) -> Option<&str> {
    event.get("event").and_then(|v| v.as_str())
}

async fn send_control(conn: &StreamConn, value: serde_json::Value) -> Result<(), CoreError> {
    conn.outgoing
        .send(Frame::Control(value))
        .await
        .map_err(|_| CoreError::Transport("stream send failed: channel closed".to_owned()))
}
