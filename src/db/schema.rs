//! Persistence schema and record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subagents (
    agent_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    goal TEXT NOT NULL,
    working_directory TEXT,
    result TEXT,
    error TEXT,
    last_observation TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_subagents_user ON subagents(user_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    query TEXT NOT NULL,
    status TEXT NOT NULL,
    decision TEXT,
    spawned_agent_id TEXT,
    glasses_display TEXT,
    webview_content TEXT,
    error TEXT,
    error_code TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_tasks_user ON tasks(user_id, updated_at DESC);

CREATE TABLE IF NOT EXISTS conversations (
    conversation_id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_activity_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_user
    ON conversations(user_id, last_activity_at DESC);

CREATE TABLE IF NOT EXISTS turns (
    conversation_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    associated_task_id TEXT,
    created_at TEXT NOT NULL,

    PRIMARY KEY (conversation_id, seq),
    FOREIGN KEY (conversation_id)
        REFERENCES conversations(conversation_id) ON DELETE CASCADE
);
"#;

/// SubAgent lifecycle states. Completed, Failed and Killed are absorbing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Spawning,
    Running,
    AwaitingInput,
    Completed,
    Failed,
    Killed,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Killed
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Spawning => "spawning",
            AgentStatus::Running => "running",
            AgentStatus::AwaitingInput => "awaiting_input",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Killed => "killed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "spawning" => AgentStatus::Spawning,
            "running" => AgentStatus::Running,
            "awaiting_input" => AgentStatus::AwaitingInput,
            "completed" => AgentStatus::Completed,
            "failed" => AgentStatus::Failed,
            "killed" => AgentStatus::Killed,
            other => return Err(format!("unknown agent status '{other}'")),
        })
    }
}

/// Terminal agent record as projected by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgent {
    pub agent_id: String,
    pub user_id: String,
    pub status: AgentStatus,
    pub goal: String,
    pub working_directory: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub last_observation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Task lifecycle states. Done and Error are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Deciding,
    Spawning,
    Waiting,
    Synthesizing,
    Done,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Error)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Deciding => "deciding",
            TaskStatus::Spawning => "spawning",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Synthesizing => "synthesizing",
            TaskStatus::Done => "done",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "pending" => TaskStatus::Pending,
            "deciding" => TaskStatus::Deciding,
            "spawning" => TaskStatus::Spawning,
            "waiting" => TaskStatus::Waiting,
            "synthesizing" => TaskStatus::Synthesizing,
            "done" => TaskStatus::Done,
            "error" => TaskStatus::Error,
            other => return Err(format!("unknown task status '{other}'")),
        })
    }
}

/// The dual-surface answer every finished task carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    /// Plain single-line text for the HUD, at most 100 Unicode scalar values.
    pub glasses_display: String,
    /// Markdown for the companion webview, unbounded.
    pub webview_content: String,
}

/// Task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub user_id: String,
    pub query: String,
    pub status: TaskStatus,
    pub decision: Option<String>,
    pub spawned_agent_id: Option<String>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

/// Conversation header; turns live in their own table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnRole::User => f.write_str("user"),
            TurnRole::Assistant => f.write_str("assistant"),
        }
    }
}

impl std::str::FromStr for TurnRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, String> {
        Ok(match s {
            "user" => TurnRole::User,
            "assistant" => TurnRole::Assistant,
            other => return Err(format!("unknown turn role '{other}'")),
        })
    }
}

/// One message in a conversation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub conversation_id: String,
    pub seq: i64,
    pub role: TurnRole,
    pub content: String,
    pub associated_task_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
