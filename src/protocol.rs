//! Daemon <-> server wire protocol
//!
//! Every frame is a JSON document with a mandatory `type` discriminator and a
//! `v` envelope field. Unknown `type` values fail to decode; callers log and
//! drop them rather than acting on a guess.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current protocol version. Frames from a newer major version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Versioned envelope wrapped around every frame in both directions.
#[derive(Debug, Serialize, Deserialize)]
pub struct Frame<T> {
    #[serde(default = "protocol_version")]
    pub v: u32,
    #[serde(flatten)]
    pub msg: T,
}

/// Commands the server issues to a connected daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerCommand {
    SpawnAgent {
        agent_id: String,
        goal: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_directory: Option<String>,
        #[serde(default)]
        options: SpawnOptions,
    },
    KillAgent {
        agent_id: String,
    },
    Ping,
}

/// Per-spawn knobs carried alongside the goal.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SpawnOptions {
    /// Stream raw terminal output back as `log` frames (rate-limited).
    #[serde(default)]
    pub stream_logs: bool,
}

/// Messages a daemon sends up to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    Pong,
    Heartbeat {
        running_agent_ids: Vec<String>,
        capacity: u32,
    },
    StatusUpdate {
        agent_id: String,
        status: ObservedStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        observation: Option<String>,
    },
    Log {
        agent_id: String,
        line: String,
        stream: LogStream,
    },
    Complete {
        agent_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Non-terminal status as classified by the daemon-side observer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObservedStatus {
    Running,
    AwaitingInput,
}

/// Which side of the merged PTY stream a log line came from. The PTY merges
/// stdout and stderr, so `Pty` is the only value real agents produce; the
/// variant space exists for non-PTY executors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Pty,
    Stdout,
    Stderr,
}

/// Encode a frame for the wire.
pub fn encode<T: Serialize>(msg: &T) -> String {
    // Frame<T> serialization cannot fail for our closed message set.
    serde_json::to_string(&Frame {
        v: PROTOCOL_VERSION,
        msg,
    })
    .unwrap_or_default()
}

/// Decode a frame, enforcing the version envelope.
///
/// Returns `Err` for malformed JSON, unknown `type` values, and frames from a
/// future protocol version. Callers log the frame and drop it.
pub fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, DecodeError> {
    let raw: Value = serde_json::from_str(text).map_err(|e| DecodeError::Json(e.to_string()))?;
    let version = raw.get("v").and_then(Value::as_u64).unwrap_or(1) as u32;
    if version > PROTOCOL_VERSION {
        return Err(DecodeError::Version(version));
    }
    let frame: Frame<T> =
        serde_json::from_value(raw).map_err(|e| DecodeError::Json(e.to_string()))?;
    Ok(frame.msg)
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Json(String),
    #[error("unsupported protocol version {0}")]
    Version(u32),
}
