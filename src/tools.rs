//! Planner-facing tools.
//!
//! A closed, read-only set. Every invocation carries the caller's user id via
//! `ToolContext`; a tool must never return a row owned by anyone else. There
//! is deliberately no mutating tool here — spawning and killing stay with the
//! orchestrator.

use crate::conversation::ConversationService;
use crate::db::Database;
use crate::registry::DaemonRegistry;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Cap on rows any listing tool returns.
const MAX_LISTED_ROWS: u32 = 20;

/// Webview content is truncated to this many characters in tool output.
const WEBVIEW_PREVIEW_LEN: usize = 200;

/// Result from tool execution
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
        }
    }

    fn forbidden() -> Self {
        Self::error("FORBIDDEN: requested record belongs to another user")
    }

    fn json(value: &Value) -> Self {
        Self::success(value.to_string())
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh per call with the orchestrator-injected caller identity.
/// Tools are stateless and derive everything from this struct.
#[derive(Clone)]
pub struct ToolContext {
    /// Identity every returned row is checked against.
    pub caller_user_id: String,
    pub db: Database,
    pub conversations: ConversationService,
    pub registry: Arc<DaemonRegistry>,
}

/// Trait for tools exposed to the planner
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool with context
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// The fixed tool set available to the planner
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(GetRecentTasksTool),
            Arc::new(GetRunningAgentsTool),
            Arc::new(GetAgentStatusTool),
            Arc::new(GetDaemonStatusTool),
            Arc::new(GetConversationSummaryTool),
        ];
        Self { tools }
    }

    /// Get all tool definitions for the LLM
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name with context
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}

// ==================== get_recent_tasks ====================

struct GetRecentTasksTool;

#[derive(Debug, Deserialize)]
struct RecentTasksInput {
    #[serde(default = "default_task_limit")]
    limit: u32,
}

fn default_task_limit() -> u32 {
    10
}

#[async_trait]
impl Tool for GetRecentTasksTool {
    fn name(&self) -> &str {
        "get_recent_tasks"
    }

    fn description(&self) -> String {
        "Returns the caller's recent tasks: id, status, query, timestamps and a truncated \
         webview preview. Newest first."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": MAX_LISTED_ROWS,
                    "description": "Maximum number of tasks to return (default 10)"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: RecentTasksInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };
        let limit = input.limit.clamp(1, MAX_LISTED_ROWS);

        match ctx.db.list_recent_tasks(&ctx.caller_user_id, limit) {
            Ok(tasks) => {
                let rows: Vec<Value> = tasks
                    .iter()
                    .filter(|t| t.user_id == ctx.caller_user_id)
                    .map(|t| {
                        json!({
                            "task_id": t.task_id,
                            "status": t.status,
                            "query": t.query,
                            "created_at": t.created_at.to_rfc3339(),
                            "updated_at": t.updated_at.to_rfc3339(),
                            "webview_preview": t.result.as_ref().map(|r| truncate(&r.webview_content, WEBVIEW_PREVIEW_LEN)),
                        })
                    })
                    .collect();
                ToolOutput::json(&json!({ "tasks": rows }))
            }
            Err(e) => ToolOutput::error(format!("Lookup failed: {e}")),
        }
    }
}

// ==================== get_running_agents ====================

struct GetRunningAgentsTool;

#[async_trait]
impl Tool for GetRunningAgentsTool {
    fn name(&self) -> &str {
        "get_running_agents"
    }

    fn description(&self) -> String {
        "Returns the caller's non-terminal desktop agents with their goal, status and \
         latest observation."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn run(&self, _input: Value, ctx: ToolContext) -> ToolOutput {
        match ctx.db.list_active_subagents(&ctx.caller_user_id) {
            Ok(agents) => {
                let rows: Vec<Value> = agents
                    .iter()
                    .filter(|a| a.user_id == ctx.caller_user_id)
                    .map(agent_row)
                    .collect();
                ToolOutput::json(&json!({ "agents": rows }))
            }
            Err(e) => ToolOutput::error(format!("Lookup failed: {e}")),
        }
    }
}

// ==================== get_agent_status ====================

struct GetAgentStatusTool;

#[derive(Debug, Deserialize)]
struct AgentStatusInput {
    agent_id: String,
}

#[async_trait]
impl Tool for GetAgentStatusTool {
    fn name(&self) -> &str {
        "get_agent_status"
    }

    fn description(&self) -> String {
        "Returns one desktop agent by id, including result or error once finished.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["agent_id"],
            "properties": {
                "agent_id": {
                    "type": "string",
                    "description": "Agent id as returned by get_running_agents or get_recent_tasks"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: AgentStatusInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        match ctx.db.get_subagent(&input.agent_id) {
            Ok(agent) if agent.user_id == ctx.caller_user_id => {
                let mut row = agent_row(&agent);
                if let Some(obj) = row.as_object_mut() {
                    obj.insert("result".to_string(), json!(agent.result));
                    obj.insert("error".to_string(), json!(agent.error));
                }
                ToolOutput::json(&row)
            }
            Ok(_) => ToolOutput::forbidden(),
            Err(e) => ToolOutput::error(format!("Lookup failed: {e}")),
        }
    }
}

// ==================== get_daemon_status ====================

struct GetDaemonStatusTool;

#[async_trait]
impl Tool for GetDaemonStatusTool {
    fn name(&self) -> &str {
        "get_daemon_status"
    }

    fn description(&self) -> String {
        "Reports whether the caller's desktop daemon is connected and how stale its last \
         heartbeat is."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn run(&self, _input: Value, ctx: ToolContext) -> ToolOutput {
        let status = ctx.registry.daemon_status(&ctx.caller_user_id);
        ToolOutput::json(&json!({
            "connected": status.connected,
            "lastHeartbeatAgeMs": status.last_heartbeat_age_ms,
        }))
    }
}

// ==================== get_conversation_summary ====================

struct GetConversationSummaryTool;

#[async_trait]
impl Tool for GetConversationSummaryTool {
    fn name(&self) -> &str {
        "get_conversation_summary"
    }

    fn description(&self) -> String {
        "Returns the caller's active conversation as (role, content, timestamp) rows, \
         oldest first."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn run(&self, _input: Value, ctx: ToolContext) -> ToolOutput {
        let conversation = match ctx.conversations.get_or_create_active(&ctx.caller_user_id) {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Lookup failed: {e}")),
        };

        match ctx.conversations.recent_turns(&conversation.conversation_id) {
            Ok(turns) => {
                let rows: Vec<Value> = turns
                    .iter()
                    .map(|t| {
                        json!({
                            "role": t.role,
                            "content": t.content,
                            "timestamp": t.created_at.to_rfc3339(),
                        })
                    })
                    .collect();
                ToolOutput::json(&json!({ "turns": rows }))
            }
            Err(e) => ToolOutput::error(format!("Lookup failed: {e}")),
        }
    }
}

fn agent_row(agent: &crate::db::SubAgent) -> Value {
    json!({
        "agent_id": agent.agent_id,
        "status": agent.status,
        "goal": agent.goal,
        "working_directory": agent.working_directory,
        "last_observation": agent.last_observation,
        "created_at": agent.created_at.to_rfc3339(),
        "updated_at": agent.updated_at.to_rfc3339(),
    })
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{AgentStatus, Database, TaskResult};
    use crate::registry::DaemonRegistry;
    use std::time::Duration;

    fn context(db: &Database, caller: &str) -> ToolContext {
        let config = ServerConfig::default();
        ToolContext {
            caller_user_id: caller.to_string(),
            db: db.clone(),
            conversations: ConversationService::new(db.clone(), Duration::from_secs(4 * 3600)),
            registry: Arc::new(DaemonRegistry::new(db.clone(), &config)),
        }
    }

    #[tokio::test]
    async fn test_definitions_cover_the_five_tools() {
        let registry = ToolRegistry::new();
        let names: Vec<String> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "get_recent_tasks",
                "get_running_agents",
                "get_agent_status",
                "get_daemon_status",
                "get_conversation_summary",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_tool_returns_none() {
        let db = Database::open_in_memory().unwrap();
        let registry = ToolRegistry::new();
        let out = registry
            .execute("rm_rf", json!({}), context(&db, "u@x"))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_recent_tasks_only_see_callers_rows() {
        let db = Database::open_in_memory().unwrap();
        db.create_task("t-mine", "u@x", "mine").unwrap();
        db.create_task("t-theirs", "b@x", "theirs").unwrap();
        db.finish_task_done(
            "t-mine",
            &TaskResult {
                glasses_display: "ok".to_string(),
                webview_content: "x".repeat(500),
            },
        )
        .unwrap();

        let registry = ToolRegistry::new();
        let out = registry
            .execute("get_recent_tasks", json!({"limit": 20}), context(&db, "u@x"))
            .await
            .unwrap();
        assert!(out.success);
        let parsed: Value = serde_json::from_str(&out.output).unwrap();
        let tasks = parsed["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["task_id"], "t-mine");
        // Preview is truncated, not the full 500 chars.
        let preview = tasks[0]["webview_preview"].as_str().unwrap();
        assert!(preview.chars().count() <= 201);
    }

    #[tokio::test]
    async fn test_agent_status_refuses_cross_user_access() {
        let db = Database::open_in_memory().unwrap();
        db.create_subagent("a-1", "a@x", "their goal", None).unwrap();

        let registry = ToolRegistry::new();
        let out = registry
            .execute(
                "get_agent_status",
                json!({"agent_id": "a-1"}),
                context(&db, "b@x"),
            )
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.output.starts_with("FORBIDDEN"));
    }

    #[tokio::test]
    async fn test_running_agents_excludes_terminal() {
        let db = Database::open_in_memory().unwrap();
        db.create_subagent("a-1", "u@x", "active", None).unwrap();
        db.create_subagent("a-2", "u@x", "done", None).unwrap();
        db.complete_subagent("a-2", AgentStatus::Completed, Some("fin"), None)
            .unwrap();

        let registry = ToolRegistry::new();
        let out = registry
            .execute("get_running_agents", json!({}), context(&db, "u@x"))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out.output).unwrap();
        let agents = parsed["agents"].as_array().unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0]["agent_id"], "a-1");
    }

    #[tokio::test]
    async fn test_daemon_status_reports_disconnected() {
        let db = Database::open_in_memory().unwrap();
        let registry = ToolRegistry::new();
        let out = registry
            .execute("get_daemon_status", json!({}), context(&db, "u@x"))
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out.output).unwrap();
        assert_eq!(parsed["connected"], false);
        assert!(parsed["lastHeartbeatAgeMs"].is_null());
    }

    #[tokio::test]
    async fn test_conversation_summary_rows() {
        let db = Database::open_in_memory().unwrap();
        let ctx = context(&db, "u@x");
        let conv = ctx.conversations.get_or_create_active("u@x").unwrap();
        ctx.conversations
            .append_turn(&conv.conversation_id, crate::db::TurnRole::User, "hi", None)
            .unwrap();

        let registry = ToolRegistry::new();
        let out = registry
            .execute("get_conversation_summary", json!({}), ctx)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out.output).unwrap();
        let turns = parsed["turns"].as_array().unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[0]["content"], "hi");
    }
}
