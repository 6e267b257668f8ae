//! Daemon registry: the server side of the control plane.
//!
//! Owns every live daemon connection and is the only writer of SubAgent state
//! into persistence. Events from one connection are applied in arrival order;
//! terminal events are absorbing, so a `complete` racing a kill resolves to
//! whichever lands first and the loser is dropped with a warning.

mod connection;

pub use connection::{DaemonConnection, COMMAND_QUEUE_DEPTH};

use crate::config::ServerConfig;
use crate::db::{AgentStatus, Database, DbError, SubAgent};
use crate::protocol::{DaemonMessage, ObservedStatus, ServerCommand, SpawnOptions};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Grace period between sending `kill_agent` and forcing the record killed.
const KILL_GRACE: Duration = Duration::from_secs(15);

/// A daemon is absent after this many missed heartbeat windows.
const MISSED_HEARTBEAT_WINDOWS: u32 = 2;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no daemon connected for user")]
    DaemonUnavailable,
    #[error("user is at the concurrent-agent cap")]
    QuotaExceeded,
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Outcome of waiting on an agent.
#[derive(Debug)]
pub enum WaitOutcome {
    /// Agent reached a terminal state; the record carries result or error.
    Terminal(SubAgent),
    /// The wait budget expired. The agent keeps running.
    Timeout,
    /// The caller's scope was cancelled.
    Cancelled,
}

/// Daemon liveness as reported to tools and handlers.
#[derive(Debug, Clone, Copy)]
pub struct DaemonStatus {
    pub connected: bool,
    pub last_heartbeat_age_ms: Option<u64>,
}

pub struct DaemonRegistry {
    db: Database,
    connections: Mutex<HashMap<String, Arc<DaemonConnection>>>,
    terminal_notify: Mutex<HashMap<String, Arc<Notify>>>,
    kills_in_flight: Arc<Mutex<HashSet<String>>>,
    heartbeat: Duration,
    max_agents_per_user: u32,
    kill_grace: Duration,
}

impl DaemonRegistry {
    pub fn new(db: Database, config: &ServerConfig) -> Self {
        Self {
            db,
            connections: Mutex::new(HashMap::new()),
            terminal_notify: Mutex::new(HashMap::new()),
            kills_in_flight: Arc::new(Mutex::new(HashSet::new())),
            heartbeat: config.heartbeat,
            max_agents_per_user: config.max_agents_per_user,
            kill_grace: KILL_GRACE,
        }
    }

    #[cfg(test)]
    fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    // ==================== Connection lifecycle ====================

    /// Install a connection for a user, displacing any previous one. Returns
    /// the handle and the command receiver its socket writer must drain.
    pub fn register(
        &self,
        user_id: &str,
    ) -> (
        Arc<DaemonConnection>,
        tokio::sync::mpsc::Receiver<ServerCommand>,
    ) {
        let (conn, rx) = DaemonConnection::new(user_id);
        let conn = Arc::new(conn);

        let previous = self
            .connections
            .lock()
            .unwrap()
            .insert(user_id.to_string(), conn.clone());
        if let Some(old) = previous {
            tracing::info!(user_id = %user_id, "Replacing existing daemon connection");
            old.close();
        } else {
            tracing::info!(user_id = %user_id, "Daemon connected");
        }

        (conn, rx)
    }

    /// Drop a connection if it is still the current one for its user.
    pub fn unregister(&self, conn: &DaemonConnection) {
        let mut connections = self.connections.lock().unwrap();
        let current = connections
            .get(&conn.user_id)
            .map(|c| c.connection_id == conn.connection_id)
            .unwrap_or(false);
        if current {
            connections.remove(&conn.user_id);
            tracing::info!(user_id = %conn.user_id, "Daemon disconnected");
        }
        conn.close();
    }

    fn connection(&self, user_id: &str) -> Option<Arc<DaemonConnection>> {
        self.connections.lock().unwrap().get(user_id).cloned()
    }

    /// Liveness projection. A connection past two heartbeat windows counts as
    /// absent even though the socket may still be open.
    pub fn daemon_status(&self, user_id: &str) -> DaemonStatus {
        match self.connection(user_id) {
            Some(conn) => {
                let age = conn.heartbeat_age_ms();
                let window = self.heartbeat.as_millis() as u64 * u64::from(MISSED_HEARTBEAT_WINDOWS);
                DaemonStatus {
                    connected: age <= window,
                    last_heartbeat_age_ms: Some(age),
                }
            }
            None => DaemonStatus {
                connected: false,
                last_heartbeat_age_ms: None,
            },
        }
    }

    // ==================== Public operations ====================

    /// Spawn an agent on the user's desktop.
    ///
    /// The SubAgent record is written in `spawning` state before the command
    /// goes out, and the command is sent exactly once per agent id.
    pub async fn spawn_agent(
        &self,
        user_id: &str,
        goal: &str,
        working_directory: Option<&str>,
        options: SpawnOptions,
    ) -> Result<String, RegistryError> {
        let conn = self
            .connection(user_id)
            .ok_or(RegistryError::DaemonUnavailable)?;
        if !self.daemon_status(user_id).connected {
            return Err(RegistryError::DaemonUnavailable);
        }

        if self.db.count_active_subagents(user_id)? >= self.max_agents_per_user {
            return Err(RegistryError::QuotaExceeded);
        }

        let agent_id = uuid::Uuid::new_v4().to_string();
        self.db
            .create_subagent(&agent_id, user_id, goal, working_directory)?;

        let command = ServerCommand::SpawnAgent {
            agent_id: agent_id.clone(),
            goal: goal.to_string(),
            working_directory: working_directory.map(String::from),
            options,
        };
        if conn.send(command).await.is_err() {
            // The connection died between the liveness check and the send.
            // The record is already durable; fail it so nothing dangles.
            self.db.complete_subagent(
                &agent_id,
                AgentStatus::Failed,
                None,
                Some("spawn_send_failed"),
            )?;
            self.notify_terminal(&agent_id);
            return Err(RegistryError::DaemonUnavailable);
        }

        tracing::info!(user_id = %user_id, agent_id = %agent_id, "Agent spawn dispatched");
        Ok(agent_id)
    }

    /// Suspend until the agent reaches a terminal state, the timeout expires,
    /// or the caller's scope is cancelled. Timing out never kills the agent.
    pub async fn wait_for_completion(
        &self,
        agent_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, RegistryError> {
        let deadline = Instant::now() + timeout;
        let notify = self.notify_for(agent_id);

        loop {
            // Arm the waiter before the read so a terminal event landing
            // between the two cannot be missed.
            let notified = notify.notified();

            let agent = self.db.get_subagent(agent_id)?;
            if agent.status.is_terminal() {
                return Ok(WaitOutcome::Terminal(agent));
            }

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return Ok(WaitOutcome::Timeout),
                () = cancel.cancelled() => return Ok(WaitOutcome::Cancelled),
            }
        }
    }

    /// Request an agent's death. Idempotent: a terminal record or an
    /// in-flight kill short-circuits without sending another command.
    pub async fn kill_agent(&self, agent_id: &str) -> Result<(), RegistryError> {
        let agent = self.db.get_subagent(agent_id)?;
        if agent.status.is_terminal() {
            return Ok(());
        }

        if !self.kills_in_flight.lock().unwrap().insert(agent_id.to_string()) {
            return Ok(());
        }

        if let Some(conn) = self.connection(&agent.user_id) {
            let _ = conn
                .send(ServerCommand::KillAgent {
                    agent_id: agent_id.to_string(),
                })
                .await;
        }

        // Grace timer: if no terminal event lands in time, force the record.
        let db = self.db.clone();
        let notify = self.notify_for(agent_id);
        let kills = Arc::clone(&self.kills_in_flight);
        let grace = self.kill_grace;
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let still_live = db
                .get_subagent(&agent_id)
                .map(|a| !a.status.is_terminal())
                .unwrap_or(false);
            if still_live {
                tracing::warn!(agent_id = %agent_id, "No terminal event within kill grace, forcing killed");
                let forced = db
                    .complete_subagent(&agent_id, AgentStatus::Killed, None, Some("timeout_on_kill"))
                    .unwrap_or(false);
                if forced {
                    notify.notify_waiters();
                }
            }
            kills.lock().unwrap().remove(&agent_id);
        });

        Ok(())
    }

    /// Read-through projection of one agent.
    pub fn get_agent(&self, agent_id: &str) -> Result<SubAgent, RegistryError> {
        Ok(self.db.get_subagent(agent_id)?)
    }

    /// Read-through projection of a user's agents.
    pub fn list_agents(&self, user_id: &str) -> Result<Vec<SubAgent>, RegistryError> {
        Ok(self.db.list_subagents(user_id)?)
    }

    // ==================== Inbound events ====================

    /// Apply one daemon event. Called from the connection's receive loop and
    /// from the REST fallback handlers, so per-connection FIFO order holds.
    pub fn handle_message(&self, user_id: &str, msg: DaemonMessage) {
        match msg {
            DaemonMessage::Pong => {
                if let Some(conn) = self.connection(user_id) {
                    conn.touch();
                }
            }
            DaemonMessage::Heartbeat {
                running_agent_ids,
                capacity,
            } => {
                if let Some(conn) = self.connection(user_id) {
                    conn.touch();
                    conn.set_capacity(capacity);
                }
                tracing::debug!(
                    user_id = %user_id,
                    running = running_agent_ids.len(),
                    capacity,
                    "Heartbeat"
                );
            }
            DaemonMessage::StatusUpdate {
                agent_id,
                status,
                observation,
            } => {
                if self.owned_agent(user_id, &agent_id).is_none() {
                    tracing::warn!(
                        user_id = %user_id,
                        agent_id = %agent_id,
                        "Status update for foreign or unknown agent dropped"
                    );
                    return;
                }
                let mapped = match status {
                    ObservedStatus::Running => AgentStatus::Running,
                    ObservedStatus::AwaitingInput => AgentStatus::AwaitingInput,
                };
                match self
                    .db
                    .observe_subagent(&agent_id, mapped, observation.as_deref())
                {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(agent_id = %agent_id, "Dropping status update for terminal agent");
                    }
                    Err(e) => {
                        tracing::error!(agent_id = %agent_id, error = %e, "Status update failed");
                    }
                }
            }
            DaemonMessage::Log {
                agent_id,
                line,
                stream,
            } => {
                if self.owned_agent(user_id, &agent_id).is_some() {
                    tracing::debug!(agent_id = %agent_id, stream = ?stream, line = %line, "Agent log");
                }
            }
            DaemonMessage::Complete {
                agent_id,
                result,
                error,
            } => {
                if self.owned_agent(user_id, &agent_id).is_none() {
                    tracing::warn!(
                        user_id = %user_id,
                        agent_id = %agent_id,
                        "Complete for foreign or unknown agent dropped"
                    );
                    return;
                }
                // A daemon acking kill_agent reports `error: "killed"`.
                let status = match (&result, &error) {
                    (_, Some(e)) if e == "killed" => AgentStatus::Killed,
                    (_, Some(_)) => AgentStatus::Failed,
                    _ => AgentStatus::Completed,
                };
                match self
                    .db
                    .complete_subagent(&agent_id, status, result.as_deref(), error.as_deref())
                {
                    Ok(true) => {
                        self.kills_in_flight.lock().unwrap().remove(&agent_id);
                        self.notify_terminal(&agent_id);
                        tracing::info!(agent_id = %agent_id, status = %status, "Agent reached terminal state");
                    }
                    Ok(false) => {
                        // Duplicate replay after reconnect, or a lost race
                        // against the kill path. The first terminal event won.
                        tracing::warn!(agent_id = %agent_id, "Dropping complete for already-terminal agent");
                    }
                    Err(e) => {
                        tracing::error!(agent_id = %agent_id, error = %e, "Complete failed");
                    }
                }
            }
        }
    }

    fn owned_agent(&self, user_id: &str, agent_id: &str) -> Option<SubAgent> {
        match self.db.get_subagent(agent_id) {
            Ok(agent) if agent.user_id == user_id => Some(agent),
            _ => None,
        }
    }

    fn notify_for(&self, agent_id: &str) -> Arc<Notify> {
        self.terminal_notify
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default()
            .clone()
    }

    fn notify_terminal(&self, agent_id: &str) {
        if let Some(notify) = self.terminal_notify.lock().unwrap().get(agent_id) {
            notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> (Arc<DaemonRegistry>, Database) {
        let db = Database::open_in_memory().unwrap();
        let config = ServerConfig::default();
        (Arc::new(DaemonRegistry::new(db.clone(), &config)), db)
    }

    #[tokio::test]
    async fn test_spawn_without_daemon_fails_fast() {
        let (registry, _db) = registry();
        let err = registry
            .spawn_agent("u@x", "list files", None, SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DaemonUnavailable));
    }

    #[tokio::test]
    async fn test_spawn_writes_record_before_command() {
        let (registry, db) = registry();
        let (_conn, mut rx) = registry.register("u@x");

        let agent_id = registry
            .spawn_agent("u@x", "list files", Some("/home/u"), SpawnOptions::default())
            .await
            .unwrap();

        // Record is durable and in spawning state.
        let agent = db.get_subagent(&agent_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Spawning);
        assert_eq!(agent.user_id, "u@x");

        // Exactly one spawn command went out.
        match rx.recv().await.unwrap() {
            ServerCommand::SpawnAgent {
                agent_id: cmd_id,
                goal,
                working_directory,
                ..
            } => {
                assert_eq!(cmd_id, agent_id);
                assert_eq!(goal, "list files");
                assert_eq!(working_directory.as_deref(), Some("/home/u"));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_quota_enforced_at_cap() {
        let (registry, _db) = registry();
        let (_conn, _rx) = registry.register("u@x");

        for _ in 0..3 {
            registry
                .spawn_agent("u@x", "work", None, SpawnOptions::default())
                .await
                .unwrap();
        }
        let err = registry
            .spawn_agent("u@x", "one too many", None, SpawnOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::QuotaExceeded));

        // Terminal agents free quota.
        let agents = registry.list_agents("u@x").unwrap();
        registry
            .handle_message(
                "u@x",
                DaemonMessage::Complete {
                    agent_id: agents[0].agent_id.clone(),
                    result: Some("done".to_string()),
                    error: None,
                },
            );
        registry
            .spawn_agent("u@x", "now it fits", None, SpawnOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_status_update_and_first_terminal_event_wins() {
        let (registry, db) = registry();
        let (_conn, _rx) = registry.register("u@x");
        let agent_id = registry
            .spawn_agent("u@x", "work", None, SpawnOptions::default())
            .await
            .unwrap();

        registry.handle_message(
            "u@x",
            DaemonMessage::StatusUpdate {
                agent_id: agent_id.clone(),
                status: ObservedStatus::Running,
                observation: Some("compiling".to_string()),
            },
        );
        assert_eq!(
            db.get_subagent(&agent_id).unwrap().status,
            AgentStatus::Running
        );

        registry.handle_message(
            "u@x",
            DaemonMessage::Complete {
                agent_id: agent_id.clone(),
                result: Some("all tests pass".to_string()),
                error: None,
            },
        );
        // A replayed duplicate after reconnect changes nothing.
        registry.handle_message(
            "u@x",
            DaemonMessage::Complete {
                agent_id: agent_id.clone(),
                result: None,
                error: Some("late failure".to_string()),
            },
        );

        let agent = db.get_subagent(&agent_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(agent.result.as_deref(), Some("all tests pass"));
        assert!(agent.error.is_none());
    }

    #[tokio::test]
    async fn test_foreign_agent_events_dropped() {
        let (registry, db) = registry();
        let (_conn_a, _rx_a) = registry.register("a@x");
        let (_conn_b, _rx_b) = registry.register("b@x");
        let agent_id = registry
            .spawn_agent("a@x", "private work", None, SpawnOptions::default())
            .await
            .unwrap();

        // b's daemon cannot complete a's agent.
        registry.handle_message(
            "b@x",
            DaemonMessage::Complete {
                agent_id: agent_id.clone(),
                result: Some("hijacked".to_string()),
                error: None,
            },
        );
        assert_eq!(
            db.get_subagent(&agent_id).unwrap().status,
            AgentStatus::Spawning
        );
    }

    #[tokio::test]
    async fn test_wait_for_completion_sees_terminal_event() {
        let (registry, _db) = registry();
        let (_conn, _rx) = registry.register("u@x");
        let agent_id = registry
            .spawn_agent("u@x", "work", None, SpawnOptions::default())
            .await
            .unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            let agent_id = agent_id.clone();
            tokio::spawn(async move {
                registry
                    .wait_for_completion(
                        &agent_id,
                        Duration::from_secs(5),
                        &CancellationToken::new(),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.handle_message(
            "u@x",
            DaemonMessage::Complete {
                agent_id,
                result: Some("done".to_string()),
                error: None,
            },
        );

        match waiter.await.unwrap().unwrap() {
            WaitOutcome::Terminal(agent) => {
                assert_eq!(agent.result.as_deref(), Some("done"));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_completion_times_out_without_killing() {
        let (registry, db) = registry();
        let (_conn, _rx) = registry.register("u@x");
        let agent_id = registry
            .spawn_agent("u@x", "slow work", None, SpawnOptions::default())
            .await
            .unwrap();

        let outcome = registry
            .wait_for_completion(&agent_id, Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Timeout));
        assert!(!db.get_subagent(&agent_id).unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn test_wait_for_completion_cancellable() {
        let (registry, _db) = registry();
        let (_conn, _rx) = registry.register("u@x");
        let agent_id = registry
            .spawn_agent("u@x", "work", None, SpawnOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = registry
            .wait_for_completion(&agent_id, Duration::from_secs(5), &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, WaitOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent_and_sends_once() {
        let db = Database::open_in_memory().unwrap();
        let config = ServerConfig::default();
        let registry = Arc::new(
            DaemonRegistry::new(db.clone(), &config).with_kill_grace(Duration::from_millis(50)),
        );
        let (_conn, mut rx) = registry.register("u@x");
        let agent_id = registry
            .spawn_agent("u@x", "work", None, SpawnOptions::default())
            .await
            .unwrap();
        let _ = rx.recv().await; // drain the spawn command

        registry.kill_agent(&agent_id).await.unwrap();
        registry.kill_agent(&agent_id).await.unwrap();

        // Exactly one kill command despite two calls.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerCommand::KillAgent { .. }
        ));
        assert!(rx.try_recv().is_err());

        // No terminal event from the daemon: the grace timer forces the record.
        tokio::time::sleep(Duration::from_millis(120)).await;
        let agent = db.get_subagent(&agent_id).unwrap();
        assert_eq!(agent.status, AgentStatus::Killed);
        assert_eq!(agent.error.as_deref(), Some("timeout_on_kill"));

        // Killing a terminal agent stays a no-op.
        registry.kill_agent(&agent_id).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_daemon_status_projection() {
        let (registry, _db) = registry();
        assert!(!registry.daemon_status("u@x").connected);

        let (conn, _rx) = registry.register("u@x");
        let status = registry.daemon_status("u@x");
        assert!(status.connected);
        assert!(status.last_heartbeat_age_ms.unwrap() < 1000);

        registry.unregister(&conn);
        assert!(!registry.daemon_status("u@x").connected);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let (registry, _db) = registry();
        let (first, _rx1) = registry.register("u@x");
        let (_second, _rx2) = registry.register("u@x");

        assert!(first.cancelled().is_cancelled());
        // Unregistering the stale handle must not drop the fresh one.
        registry.unregister(&first);
        assert!(registry.daemon_status("u@x").connected);
    }
}
