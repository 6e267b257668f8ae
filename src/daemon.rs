//! Desktop daemon runtime.
//!
//! Single process per user. Holds the server link, enforces local capacity
//! and runs one `TerminalAgent` per spawn command, each cancellable for the
//! kill path.

mod link;
mod observer;
mod terminal_agent;

pub use link::{spawn_link, ServerLink};
pub use observer::{Classification, LlmObserver, ObserverClient};
pub use terminal_agent::{AgentReporter, TerminalAgent, TerminalAgentConfig};

use crate::config::DaemonConfig;
use crate::protocol::{DaemonMessage, ObservedStatus, ServerCommand};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("DAEMON_TOKEN is not set")]
    MissingToken,
}

/// Reporter wiring agent events onto the server link.
struct LinkReporter {
    link: ServerLink,
    stream_logs: bool,
}

impl AgentReporter for LinkReporter {
    fn status(&self, agent_id: &str, status: ObservedStatus, observation: Option<String>) {
        self.link.send(DaemonMessage::StatusUpdate {
            agent_id: agent_id.to_string(),
            status,
            observation,
        });
    }

    fn log(&self, agent_id: &str, line: String) {
        if self.stream_logs {
            self.link.send(DaemonMessage::Log {
                agent_id: agent_id.to_string(),
                line,
                stream: crate::protocol::LogStream::Pty,
            });
        }
    }

    fn complete(&self, agent_id: &str, result: Option<String>, error: Option<String>) {
        self.link.send(DaemonMessage::Complete {
            agent_id: agent_id.to_string(),
            result,
            error,
        });
    }
}

/// Run the daemon until the link gives up or the process is stopped.
pub async fn run_daemon(
    config: DaemonConfig,
    observer: Arc<dyn ObserverClient>,
) -> Result<(), DaemonError> {
    if config.token.trim().is_empty() {
        return Err(DaemonError::MissingToken);
    }

    let running: link::RunningAgents = Arc::new(Mutex::new(HashSet::new()));
    let (server, mut commands) = spawn_link(config.clone(), Arc::clone(&running));

    let agent_config = TerminalAgentConfig::from_daemon(&config);
    let cancels: Arc<Mutex<HashMap<String, CancellationToken>>> =
        Arc::new(Mutex::new(HashMap::new()));

    tracing::info!(server = %config.server_url, capacity = config.capacity, "Daemon running");

    while let Some(command) = commands.recv().await {
        match command {
            ServerCommand::Ping => {
                server.send(DaemonMessage::Pong);
            }
            ServerCommand::KillAgent { agent_id } => {
                match cancels.lock().unwrap().get(&agent_id) {
                    Some(token) => {
                        tracing::info!(agent_id = %agent_id, "Kill requested");
                        token.cancel();
                    }
                    None => {
                        tracing::warn!(agent_id = %agent_id, "Kill for unknown agent ignored");
                    }
                }
            }
            ServerCommand::SpawnAgent {
                agent_id,
                goal,
                working_directory,
                options,
            } => {
                // The server enforces the quota; this is the local backstop.
                if running.lock().unwrap().len() >= config.capacity as usize {
                    server.send(DaemonMessage::Complete {
                        agent_id,
                        result: None,
                        error: Some("capacity_exceeded".to_string()),
                    });
                    continue;
                }

                let cancel = CancellationToken::new();
                cancels
                    .lock()
                    .unwrap()
                    .insert(agent_id.clone(), cancel.clone());
                running.lock().unwrap().insert(agent_id.clone());

                let agent = TerminalAgent::new(
                    agent_config.clone(),
                    Arc::clone(&observer),
                    Arc::new(LinkReporter {
                        link: server.clone(),
                        stream_logs: options.stream_logs,
                    }),
                );
                let running = Arc::clone(&running);
                let cancels = Arc::clone(&cancels);
                tokio::spawn(async move {
                    agent
                        .run(
                            &agent_id,
                            &goal,
                            working_directory.as_deref(),
                            options.stream_logs,
                            cancel,
                        )
                        .await;
                    running.lock().unwrap().remove(&agent_id);
                    cancels.lock().unwrap().remove(&agent_id);
                });
            }
        }
    }

    tracing::error!("Server link closed; shutting down");
    Ok(())
}
