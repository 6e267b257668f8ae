//! Reconnecting WebSocket link to the server.
//!
//! Outbound messages are fire-and-forget from the agents' point of view.
//! While the socket is down, terminal events are buffered for exactly-once
//! replay and status updates collapse to latest-wins per agent; everything
//! else is droppable (heartbeats regenerate, logs are best-effort).

use crate::config::DaemonConfig;
use crate::protocol::{self, DaemonMessage, ServerCommand};
use futures::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

/// Reconnect backoff: base 1 s, multiplier 1.5, cap 30 s, max 10 attempts.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 10;

/// Bound on buffered terminal events across an outage.
const MAX_BUFFERED_COMPLETES: usize = 64;

/// Handle agents use to report upstream. Cheap to clone.
#[derive(Clone)]
pub struct ServerLink {
    tx: mpsc::UnboundedSender<DaemonMessage>,
}

impl ServerLink {
    pub fn send(&self, msg: DaemonMessage) {
        // Link task gone means the daemon is shutting down; drop silently.
        let _ = self.tx.send(msg);
    }
}

/// Buffer for messages produced while disconnected.
#[derive(Default)]
pub(crate) struct OfflineBuffer {
    completes: VecDeque<DaemonMessage>,
    complete_ids: HashSet<String>,
    statuses: HashMap<String, DaemonMessage>,
}

impl OfflineBuffer {
    /// Queue a message for replay. Terminal events are kept exactly once per
    /// agent; status updates latest-wins; the rest is dropped.
    pub(crate) fn push(&mut self, msg: DaemonMessage) {
        match &msg {
            DaemonMessage::Complete { agent_id, .. } => {
                if self.complete_ids.contains(agent_id) {
                    return;
                }
                if self.completes.len() >= MAX_BUFFERED_COMPLETES {
                    tracing::warn!("Offline buffer full, dropping oldest terminal event");
                    if let Some(DaemonMessage::Complete { agent_id, .. }) =
                        self.completes.pop_front()
                    {
                        self.complete_ids.remove(&agent_id);
                    }
                }
                self.complete_ids.insert(agent_id.clone());
                self.completes.push_back(msg);
            }
            DaemonMessage::StatusUpdate { agent_id, .. } => {
                self.statuses.insert(agent_id.clone(), msg);
            }
            _ => {}
        }
    }

    /// Drain for replay: terminal events first (oldest first), then the
    /// surviving status updates.
    pub(crate) fn drain(&mut self) -> Vec<DaemonMessage> {
        let mut out: Vec<DaemonMessage> = self.completes.drain(..).collect();
        self.complete_ids.clear();
        out.extend(self.statuses.drain().map(|(_, msg)| msg));
        out
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.completes.is_empty() && self.statuses.is_empty()
    }
}

/// Shared view of which agents are running, for heartbeats.
pub type RunningAgents = Arc<Mutex<HashSet<String>>>;

/// Start the link task. Returns the send handle and the stream of server
/// commands. The command channel closes when the link gives up for good.
pub fn spawn_link(
    config: DaemonConfig,
    running: RunningAgents,
) -> (ServerLink, mpsc::Receiver<ServerCommand>) {
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (command_tx, command_rx) = mpsc::channel(32);

    tokio::spawn(run_link(config, running, outbound_rx, command_tx));

    (ServerLink { tx: outbound_tx }, command_rx)
}

async fn run_link(
    config: DaemonConfig,
    running: RunningAgents,
    mut outbound: mpsc::UnboundedReceiver<DaemonMessage>,
    commands: mpsc::Sender<ServerCommand>,
) {
    let mut buffer = OfflineBuffer::default();
    let mut backoff = BACKOFF_BASE;
    let mut attempts: u32 = 0;

    loop {
        let url = config.ws_url();
        match tokio_tungstenite::connect_async(url).await {
            Ok((stream, _)) => {
                tracing::info!("Connected to server");
                attempts = 0;
                backoff = BACKOFF_BASE;

                run_connection(
                    &config,
                    &running,
                    &mut outbound,
                    &commands,
                    &mut buffer,
                    stream,
                )
                .await;

                tracing::warn!("Server connection lost");
            }
            Err(e) => {
                attempts += 1;
                tracing::warn!(error = %e, attempt = attempts, "Connect failed");
                if attempts >= MAX_ATTEMPTS {
                    tracing::error!("Giving up after {MAX_ATTEMPTS} connect attempts");
                    return; // command channel closes; the daemon can exit
                }
                tokio::time::sleep(backoff).await;
                backoff = Duration::from_secs_f64(
                    (backoff.as_secs_f64() * BACKOFF_MULTIPLIER).min(BACKOFF_CAP.as_secs_f64()),
                );
            }
        }
    }
}

/// Service one live socket until it drops.
async fn run_connection<S>(
    config: &DaemonConfig,
    running: &RunningAgents,
    outbound: &mut mpsc::UnboundedReceiver<DaemonMessage>,
    commands: &mpsc::Sender<ServerCommand>,
    buffer: &mut OfflineBuffer,
    stream: tokio_tungstenite::WebSocketStream<S>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut source) = stream.split();

    // Replay what accumulated during the outage, terminal events first.
    for msg in buffer.drain() {
        if sink
            .send(Message::Text(protocol::encode(&msg).into()))
            .await
            .is_err()
        {
            buffer.push(msg);
            return;
        }
    }
    debug_assert!(buffer.is_empty());

    let mut heartbeat = tokio::time::interval(config.heartbeat);

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { return };
                if sink
                    .send(Message::Text(protocol::encode(&msg).into()))
                    .await
                    .is_err()
                {
                    buffer.push(msg);
                    return;
                }
            }
            _ = heartbeat.tick() => {
                let running_agent_ids: Vec<String> =
                    running.lock().unwrap().iter().cloned().collect();
                let msg = DaemonMessage::Heartbeat {
                    running_agent_ids,
                    capacity: config.capacity,
                };
                if sink
                    .send(Message::Text(protocol::encode(&msg).into()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match protocol::decode::<ServerCommand>(&text) {
                        Ok(command) => {
                            if commands.send(command).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping undecodable server frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Socket error");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ObservedStatus;

    fn complete(agent_id: &str) -> DaemonMessage {
        DaemonMessage::Complete {
            agent_id: agent_id.to_string(),
            result: Some("done".to_string()),
            error: None,
        }
    }

    fn status(agent_id: &str, observation: &str) -> DaemonMessage {
        DaemonMessage::StatusUpdate {
            agent_id: agent_id.to_string(),
            status: ObservedStatus::Running,
            observation: Some(observation.to_string()),
        }
    }

    #[test]
    fn test_completes_buffer_exactly_once_per_agent() {
        let mut buffer = OfflineBuffer::default();
        buffer.push(complete("a-1"));
        buffer.push(complete("a-1"));
        buffer.push(complete("a-2"));

        let drained = buffer.drain();
        let completes: Vec<_> = drained
            .iter()
            .filter(|m| matches!(m, DaemonMessage::Complete { .. }))
            .collect();
        assert_eq!(completes.len(), 2);
    }

    #[test]
    fn test_statuses_are_latest_wins() {
        let mut buffer = OfflineBuffer::default();
        buffer.push(status("a-1", "step 1"));
        buffer.push(status("a-1", "step 2"));
        buffer.push(status("a-2", "other"));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        let a1 = drained.iter().find_map(|m| match m {
            DaemonMessage::StatusUpdate {
                agent_id,
                observation,
                ..
            } if agent_id == "a-1" => observation.clone(),
            _ => None,
        });
        assert_eq!(a1.as_deref(), Some("step 2"));
    }

    #[test]
    fn test_drain_orders_completes_before_statuses() {
        let mut buffer = OfflineBuffer::default();
        buffer.push(status("a-1", "late progress"));
        buffer.push(complete("a-2"));

        let drained = buffer.drain();
        assert!(matches!(drained[0], DaemonMessage::Complete { .. }));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_heartbeats_and_logs_are_not_buffered() {
        let mut buffer = OfflineBuffer::default();
        buffer.push(DaemonMessage::Pong);
        buffer.push(DaemonMessage::Heartbeat {
            running_agent_ids: vec![],
            capacity: 3,
        });
        assert!(buffer.is_empty());
    }
}
