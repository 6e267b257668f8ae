//! Live daemon connection handle.
//!
//! The registry owns exactly one of these per connected user. All outbound
//! commands funnel through the bounded `tx` queue so a single writer drains
//! them onto the socket in order; senders feel back-pressure instead of
//! interleaving writes.

use crate::protocol::ServerCommand;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound command queue depth per connection.
pub const COMMAND_QUEUE_DEPTH: usize = 32;

pub struct DaemonConnection {
    /// Distinguishes this connection from a replacement for the same user.
    pub connection_id: String,
    pub user_id: String,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<ServerCommand>,
    last_heartbeat: Mutex<Instant>,
    capacity: AtomicU32,
    cancel: CancellationToken,
}

impl DaemonConnection {
    /// Create a handle plus the receiver its socket writer drains.
    pub fn new(user_id: &str) -> (Self, mpsc::Receiver<ServerCommand>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let conn = Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            connected_at: Utc::now(),
            tx,
            last_heartbeat: Mutex::new(Instant::now()),
            capacity: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        };
        (conn, rx)
    }

    /// Queue a command for the socket writer. Awaits when the queue is full;
    /// errors once the connection is gone.
    pub async fn send(&self, command: ServerCommand) -> Result<(), SendError> {
        self.tx.send(command).await.map_err(|_| SendError)
    }

    /// Record daemon liveness. Both `heartbeat` and `pong` count.
    pub fn touch(&self) {
        *self.last_heartbeat.lock().unwrap() = Instant::now();
    }

    /// Milliseconds since the last liveness signal.
    pub fn heartbeat_age_ms(&self) -> u64 {
        self.last_heartbeat.lock().unwrap().elapsed().as_millis() as u64
    }

    pub fn set_capacity(&self, capacity: u32) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> u32 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Signal fired when the registry drops this connection.
    pub fn cancelled(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, thiserror::Error)]
#[error("daemon connection closed")]
pub struct SendError;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_drain_in_order() {
        let (conn, mut rx) = DaemonConnection::new("u@x");
        conn.send(ServerCommand::Ping).await.unwrap();
        conn.send(ServerCommand::KillAgent {
            agent_id: "a-1".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(rx.recv().await.unwrap(), ServerCommand::Ping);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerCommand::KillAgent { .. }
        ));
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_drops() {
        let (conn, rx) = DaemonConnection::new("u@x");
        drop(rx);
        assert!(conn.send(ServerCommand::Ping).await.is_err());
    }

    #[test]
    fn test_touch_resets_age() {
        let (conn, _rx) = DaemonConnection::new("u@x");
        conn.touch();
        assert!(conn.heartbeat_age_ms() < 1000);
    }
}
