// Synchronous control channel to the board: raw JSON documents over a
// persistent TCP socket, one request / one reply. The reply carries a
// `feedback` array whose entries are classified by severity keyword and
// forwarded to the issue stream; any error entry fails the exchange.

use crate::error::CtbError;
use serde::Deserialize;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

// The only commands the lifecycle coordinator ever sends, besides the
// configuration blob itself.
pub const START_RUN_CMD: &str = r#"{"command":"StartRun"}"#;
pub const STOP_RUN_CMD: &str = r#"{"command":"StopRun"}"#;
pub const HARD_RESET_CMD: &str = r#"{"command":"HardReset"}"#;

// The protocol guarantees a reply fits in a single read of this size.
const REPLY_BUF_SIZE: usize = 1024;

#[derive(Debug, Deserialize)]
struct BoardReply {
    #[serde(default)]
    feedback: Vec<FeedbackEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedbackEntry {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Error,
    Warning,
    Info,
    Unclassified,
}

// Keyword match, case-insensitive, substring: the board is not consistent
// about capitalization.
fn classify(kind: &str) -> Severity {
    let kind = kind.to_ascii_lowercase();
    if kind.contains("error") {
        Severity::Error
    } else if kind.contains("warning") {
        Severity::Warning
    } else if kind.contains("info") {
        Severity::Info
    } else {
        Severity::Unclassified
    }
}

/// Owns the control TCP connection, established at `conf` and held until the
/// module is dropped. Only the command thread touches it.
#[derive(Debug)]
pub struct ControlClient {
    stream: TcpStream,
    messages_sent: AtomicU64,
    responses_received: AtomicU64,
}

impl ControlClient {
    /// Resolve and connect the control endpoint. Resolution failures are
    /// configuration errors; connection failures are communication errors.
    pub fn connect(host: &str, port: u16) -> Result<Self, CtbError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| CtbError::Configuration(format!("cannot resolve {host}:{port}: {e}")))?
            .next()
            .ok_or_else(|| {
                CtbError::Configuration(format!("no address found for {host}:{port}"))
            })?;
        let stream = TcpStream::connect(addr).map_err(|e| {
            CtbError::ControlCommunication(format!("cannot connect control socket to {addr}: {e}"))
        })?;
        info!(%addr, "control connection established");
        Ok(ControlClient {
            stream,
            messages_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
        })
    }

    /// Send one JSON document and process the board's feedback.
    ///
    /// Every feedback entry is reported regardless of severity; the call
    /// fails if any entry classifies as an error.
    pub fn send(&mut self, message: &str) -> Result<(), CtbError> {
        debug!(message, "sending control message");
        self.messages_sent.fetch_add(1, Ordering::Relaxed);

        self.stream
            .write_all(message.as_bytes())
            .map_err(|e| CtbError::ControlCommunication(format!("control write failed: {e}")))?;

        let mut buf = [0u8; REPLY_BUF_SIZE];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| CtbError::ControlCommunication(format!("control read failed: {e}")))?;
        if n == 0 {
            return Err(CtbError::ControlCommunication(
                "control socket closed by the board".to_string(),
            ));
        }

        let reply: BoardReply = serde_json::from_slice(&buf[..n]).map_err(|e| {
            CtbError::ControlCommunication(format!("malformed control reply: {e}"))
        })?;
        debug!(entries = reply.feedback.len(), "received control feedback");

        let mut board_errors = 0usize;
        for entry in &reply.feedback {
            self.responses_received.fetch_add(1, Ordering::Relaxed);
            match classify(&entry.kind) {
                Severity::Error => {
                    board_errors += 1;
                    error!(message = %entry.message, "error from the board");
                }
                Severity::Warning => warn!(message = %entry.message, "warning from the board"),
                Severity::Info => info!(message = %entry.message, "message from the board"),
                Severity::Unclassified => {
                    info!(kind = %entry.kind, message = %entry.message,
                        "unformatted message from the board");
                }
            }
        }

        if board_errors > 0 {
            return Err(CtbError::ControlCommunication(format!(
                "board reported {board_errors} error(s)"
            )));
        }
        Ok(())
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent.load(Ordering::Relaxed)
    }

    pub fn responses_received(&self) -> u64 {
        self.responses_received.load(Ordering::Relaxed)
    }
}
