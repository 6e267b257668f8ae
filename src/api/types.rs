//! API request and response types
//!
//! Wire field names are camelCase to match the mobile and webview clients.

use crate::db::{SubAgent, Task, TaskResult};
use serde::{Deserialize, Serialize};

/// Request to submit a query
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub query: String,
}

/// Response for a submitted query
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub success: bool,
    pub task_id: String,
    pub status: String,
    pub message: String,
}

/// Task projection returned by the poll endpoint
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProjection {
    pub task_id: String,
    pub user_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spawned_agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResultProjection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultProjection {
    pub glasses_display: String,
    pub webview_content: String,
}

impl From<TaskResult> for TaskResultProjection {
    fn from(result: TaskResult) -> Self {
        Self {
            glasses_display: result.glasses_display,
            webview_content: result.webview_content,
        }
    }
}

impl From<Task> for TaskProjection {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            user_id: task.user_id,
            status: task.status.to_string(),
            decision: task.decision,
            spawned_agent_id: task.spawned_agent_id,
            result: task.result.map(Into::into),
            error: task.error,
            error_code: task.error_code,
            created_at: task.created_at.to_rfc3339(),
            updated_at: task.updated_at.to_rfc3339(),
        }
    }
}

/// SubAgent projection for the diagnostic endpoints
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProjection {
    pub agent_id: String,
    pub user_id: String,
    pub status: String,
    pub goal: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_observation: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<SubAgent> for AgentProjection {
    fn from(agent: SubAgent) -> Self {
        Self {
            agent_id: agent.agent_id,
            user_id: agent.user_id,
            status: agent.status.to_string(),
            goal: agent.goal,
            working_directory: agent.working_directory,
            result: agent.result,
            error: agent.error,
            last_observation: agent.last_observation,
            created_at: agent.created_at.to_rfc3339(),
            updated_at: agent.updated_at.to_rfc3339(),
        }
    }
}

/// Health probe response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Response for a task cancellation. `cancelled` is false when the task had
/// already reached a terminal state.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Diagnostic direct-spawn request
#[derive(Debug, Deserialize)]
pub struct TestSpawnRequest {
    pub email: String,
    pub goal: String,
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// Diagnostic direct-spawn response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpawnResponse {
    pub agent_id: String,
}

/// Recent-tasks listing
#[derive(Debug, Serialize)]
pub struct TasksResponse {
    pub tasks: Vec<TaskProjection>,
}

/// Diagnostic agent listing
#[derive(Debug, Serialize)]
pub struct AgentsResponse {
    pub agents: Vec<AgentProjection>,
}

/// Active-conversation projection
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationProjection {
    pub conversation_id: String,
    pub turns: Vec<TurnProjection>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnProjection {
    pub role: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub associated_task_id: Option<String>,
    pub timestamp: String,
}

/// REST fallback: heartbeat body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub running_agent_ids: Vec<String>,
    #[serde(default)]
    pub capacity: u32,
}

/// REST fallback: status update body
#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: crate::protocol::ObservedStatus,
    #[serde(default)]
    pub observation: Option<String>,
}

/// REST fallback: completion body
#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// REST fallback: log body
#[derive(Debug, Deserialize)]
pub struct LogRequest {
    pub line: String,
    #[serde(default = "default_log_stream")]
    pub stream: crate::protocol::LogStream,
}

fn default_log_stream() -> crate::protocol::LogStream {
    crate::protocol::LogStream::Pty
}

/// Error response. Every error carries a stable `code` discriminator.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            error: message.into(),
        }
    }
}
