//! Environment-driven configuration for both binaries.

use std::time::Duration;

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP bind port.
    pub port: u16,
    /// Persistence endpoint (sqlite path).
    pub db_path: String,
    /// Planner/synthesis credential.
    pub anthropic_api_key: Option<String>,
    /// Maximum accepted query length in characters.
    pub query_max_len: usize,
    /// Overall per-task budget.
    pub task_budget: Duration,
    /// Expected daemon heartbeat period.
    pub heartbeat: Duration,
    /// Conversation freshness window.
    pub conversation_ttl: Duration,
    /// Concurrent-agent cap per user.
    pub max_agents_per_user: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            db_path: default_db_path(),
            anthropic_api_key: None,
            query_max_len: 2000,
            task_budget: Duration::from_millis(120_000),
            heartbeat: Duration::from_millis(30_000),
            conversation_ttl: Duration::from_millis(14_400_000),
            max_agents_per_user: 3,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("SPECTACLE_PORT")
                .or_else(|| env_parse("PORT"))
                .unwrap_or(defaults.port),
            db_path: std::env::var("SPECTACLE_DB_PATH").unwrap_or(defaults.db_path),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            query_max_len: env_parse("QUERY_MAX_LEN").unwrap_or(defaults.query_max_len),
            task_budget: env_millis("TASK_BUDGET_MS").unwrap_or(defaults.task_budget),
            heartbeat: env_millis("HEARTBEAT_MS").unwrap_or(defaults.heartbeat),
            conversation_ttl: env_millis("CONVERSATION_TTL_MS")
                .unwrap_or(defaults.conversation_ttl),
            max_agents_per_user: env_parse("MAX_AGENTS_PER_USER")
                .unwrap_or(defaults.max_agents_per_user),
        }
    }
}

/// Daemon-side configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Server bootstrap target, e.g. `https://cloud.example.com`.
    pub server_url: String,
    /// Bearer token carrying the userId.
    pub token: String,
    /// Observer credential.
    pub gemini_api_key: Option<String>,
    /// CLI binary each terminal agent wraps.
    pub cli_binary: String,
    /// Fixed arguments passed before the goal.
    pub cli_args: Vec<String>,
    /// Concurrent-agent capacity advertised in heartbeats.
    pub capacity: u32,
    /// Heartbeat period.
    pub heartbeat: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8000".to_string(),
            token: String::new(),
            gemini_api_key: None,
            cli_binary: "claude".to_string(),
            cli_args: vec!["--dangerously-skip-permissions".to_string()],
            capacity: 3,
            heartbeat: Duration::from_millis(30_000),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: std::env::var("DAEMON_SERVER_URL").unwrap_or(defaults.server_url),
            token: std::env::var("DAEMON_TOKEN").unwrap_or_default(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            cli_binary: std::env::var("AGENT_CLI_BINARY").unwrap_or(defaults.cli_binary),
            cli_args: std::env::var("AGENT_CLI_ARGS")
                .map(|raw| raw.split_whitespace().map(String::from).collect())
                .unwrap_or(defaults.cli_args),
            capacity: env_parse("MAX_AGENTS_PER_USER").unwrap_or(defaults.capacity),
            heartbeat: env_millis("HEARTBEAT_MS").unwrap_or(defaults.heartbeat),
        }
    }

    /// Derive the control-plane WebSocket URL from the HTTP bootstrap target.
    pub fn ws_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let base = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/ws/daemon?token={}", self.token)
    }
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    format!("{home}/.spectacle/spectacle.db")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
