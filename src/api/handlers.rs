//! HTTP request handlers

use super::types::{
    AgentProjection, AgentsResponse, CancelResponse, CompleteRequest, ConversationProjection,
    ErrorResponse, HealthResponse, HeartbeatRequest, LogRequest, QueryRequest, QueryResponse,
    StatusUpdateRequest, TaskProjection, TasksResponse, TestSpawnRequest, TestSpawnResponse,
    TurnProjection,
};
use super::{authenticate_token, ws, AppState};
use crate::error::{ErrorClass, ErrorCode};
use crate::master_agent::TaskAccessError;
use crate::protocol::DaemonMessage;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Master agent surface
        .route("/api/master-agent/query", post(submit_query))
        .route("/api/master-agent/task/:task_id", get(get_task))
        .route("/api/master-agent/task/:task_id/cancel", post(cancel_task))
        .route("/api/master-agent/tasks", get(list_tasks))
        .route("/api/master-agent/conversation", get(get_conversation))
        .route("/api/master-agent/health", get(health))
        // Daemon control plane
        .route("/ws/daemon", get(ws::daemon_ws))
        // Daemon REST fallback for non-urgent state
        .route("/api/daemon/heartbeat", post(daemon_heartbeat))
        .route("/api/subagent/:agent_id/status", post(subagent_status))
        .route("/api/subagent/:agent_id/complete", post(subagent_complete))
        .route("/api/subagent/:agent_id/log", post(subagent_log))
        // Diagnostics
        .route("/daemon-api/test/spawn", post(test_spawn))
        .route("/daemon-api/test/agent/:agent_id", get(test_get_agent))
        .route("/daemon-api/test/agents", get(test_list_agents))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserIdParams {
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    #[serde(default)]
    user_id: String,
    #[serde(default = "default_list_limit")]
    limit: u32,
}

fn default_list_limit() -> u32 {
    10
}

// ============================================================
// Master agent surface
// ============================================================

async fn submit_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let task_id = state
        .master_agent
        .submit_query(&req.user_id, &req.query)
        .map_err(|e| {
            // Validation failures are the caller's 400; a persistence failure
            // is a retryable server-side 503.
            let code = e.code();
            let status = if code.kind() == ErrorClass::Validation {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            AppError::new(status, code, e.to_string())
        })?;

    Ok(Json(QueryResponse {
        success: true,
        task_id,
        status: "pending".to_string(),
        message: "query accepted; poll the task endpoint for progress".to_string(),
    }))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(params): Query<UserIdParams>,
) -> Result<Json<TaskProjection>, AppError> {
    if params.user_id.trim().is_empty() {
        return Err(AppError::missing_user_id());
    }

    let task = state
        .master_agent
        .get_task(&task_id, params.user_id.trim())
        .map_err(|e| match e {
            TaskAccessError::NotFound => AppError::new(
                StatusCode::NOT_FOUND,
                ErrorCode::TaskNotFound,
                "task not found",
            ),
            TaskAccessError::Storage(e) => AppError::internal(e.to_string()),
        })?;

    Ok(Json(task.into()))
}

/// Kill a task: its scope is cancelled, any in-flight model call aborts and
/// the wait on a spawned agent returns. The agent itself is not killed.
async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(params): Query<UserIdParams>,
) -> Result<Json<CancelResponse>, AppError> {
    if params.user_id.trim().is_empty() {
        return Err(AppError::missing_user_id());
    }
    let user_id = params.user_id.trim();

    // Cross-user cancellation leaks nothing, same as the poll endpoint.
    state.master_agent.get_task(&task_id, user_id).map_err(|e| match e {
        TaskAccessError::NotFound => AppError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::TaskNotFound,
            "task not found",
        ),
        TaskAccessError::Storage(e) => AppError::internal(e.to_string()),
    })?;

    let cancelled = state.master_agent.cancel_task(&task_id, user_id);
    Ok(Json(CancelResponse { cancelled }))
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<TasksResponse>, AppError> {
    if params.user_id.trim().is_empty() {
        return Err(AppError::missing_user_id());
    }
    let limit = params.limit.clamp(1, 20);

    let tasks = state
        .db
        .list_recent_tasks(params.user_id.trim(), limit)
        .map_err(|e| AppError::internal(e.to_string()))?;

    Ok(Json(TasksResponse {
        tasks: tasks.into_iter().map(Into::into).collect(),
    }))
}

async fn get_conversation(
    State(state): State<AppState>,
    Query(params): Query<UserIdParams>,
) -> Result<Json<ConversationProjection>, AppError> {
    if params.user_id.trim().is_empty() {
        return Err(AppError::missing_user_id());
    }

    let conversation = state
        .conversations
        .get_or_create_active(params.user_id.trim())
        .map_err(|e| AppError::internal(e.to_string()))?;
    let turns = state
        .conversations
        .recent_turns(&conversation.conversation_id)
        .map_err(|e| AppError::internal(e.to_string()))?;

    Ok(Json(ConversationProjection {
        conversation_id: conversation.conversation_id,
        turns: turns
            .into_iter()
            .map(|t| TurnProjection {
                role: t.role.to_string(),
                content: t.content,
                associated_task_id: t.associated_task_id,
                timestamp: t.created_at.to_rfc3339(),
            })
            .collect(),
    }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ============================================================
// Daemon REST fallback
// ============================================================

fn bearer_user(headers: &HeaderMap) -> Result<String, AppError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(AppError::unauthorized)?;
    authenticate_token(token).ok_or_else(AppError::unauthorized)
}

async fn daemon_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HealthResponse>, AppError> {
    let user_id = bearer_user(&headers)?;
    state.registry.handle_message(
        &user_id,
        DaemonMessage::Heartbeat {
            running_agent_ids: req.running_agent_ids,
            capacity: req.capacity,
        },
    );
    Ok(Json(HealthResponse { status: "ok" }))
}

async fn subagent_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<HealthResponse>, AppError> {
    let user_id = bearer_user(&headers)?;
    state.registry.handle_message(
        &user_id,
        DaemonMessage::StatusUpdate {
            agent_id,
            status: req.status,
            observation: req.observation,
        },
    );
    Ok(Json(HealthResponse { status: "ok" }))
}

async fn subagent_complete(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<HealthResponse>, AppError> {
    let user_id = bearer_user(&headers)?;
    state.registry.handle_message(
        &user_id,
        DaemonMessage::Complete {
            agent_id,
            result: req.result,
            error: req.error,
        },
    );
    Ok(Json(HealthResponse { status: "ok" }))
}

async fn subagent_log(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<LogRequest>,
) -> Result<Json<HealthResponse>, AppError> {
    let user_id = bearer_user(&headers)?;
    state.registry.handle_message(
        &user_id,
        DaemonMessage::Log {
            agent_id,
            line: req.line,
            stream: req.stream,
        },
    );
    Ok(Json(HealthResponse { status: "ok" }))
}

// ============================================================
// Diagnostics
// ============================================================

async fn test_spawn(
    State(state): State<AppState>,
    Json(req): Json<TestSpawnRequest>,
) -> Result<Json<TestSpawnResponse>, AppError> {
    if req.email.trim().is_empty() {
        return Err(AppError::missing_user_id());
    }
    if req.goal.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidQuery,
            "goal must not be empty",
        ));
    }

    let agent_id = state
        .registry
        .spawn_agent(
            req.email.trim(),
            &req.goal,
            req.working_directory.as_deref(),
            Default::default(),
        )
        .await
        .map_err(AppError::from_registry)?;

    Ok(Json(TestSpawnResponse { agent_id }))
}

async fn test_get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentProjection>, AppError> {
    let agent = state.registry.get_agent(&agent_id).map_err(|_| {
        AppError::new(
            StatusCode::NOT_FOUND,
            ErrorCode::AgentNotFound,
            "agent not found",
        )
    })?;
    Ok(Json(agent.into()))
}

async fn test_list_agents(
    State(state): State<AppState>,
    Query(params): Query<UserIdParams>,
) -> Result<Json<AgentsResponse>, AppError> {
    if params.user_id.trim().is_empty() {
        return Err(AppError::missing_user_id());
    }
    let agents = state
        .registry
        .list_agents(params.user_id.trim())
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(AgentsResponse {
        agents: agents.into_iter().map(Into::into).collect(),
    }))
}

// ============================================================
// Error mapping
// ============================================================

pub(super) struct AppError {
    status: StatusCode,
    code: ErrorCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn missing_user_id() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            ErrorCode::MissingUserId,
            "userId is required",
        )
    }

    fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden,
            "missing or invalid bearer token",
        )
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Internal,
            message,
        )
    }

    fn from_registry(err: crate::registry::RegistryError) -> Self {
        match err {
            crate::registry::RegistryError::DaemonUnavailable => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::DaemonUnavailable,
                "no daemon connected for this user",
            ),
            crate::registry::RegistryError::QuotaExceeded => Self::new(
                StatusCode::CONFLICT,
                ErrorCode::QuotaExceeded,
                "concurrent agent cap reached",
            ),
            crate::registry::RegistryError::Db(e) => Self::internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse::new(self.code.as_str(), self.message));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::conversation::ConversationService;
    use crate::db::Database;
    use crate::llm::LlmService;
    use crate::master_agent::testing::ScriptedLlm;
    use crate::master_agent::{MasterAgent, MasterAgentConfig};
    use crate::registry::DaemonRegistry;
    use crate::tools::ToolRegistry;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn test_state() -> (AppState, Arc<ScriptedLlm>) {
        let db = Database::open_in_memory().unwrap();
        let config = ServerConfig::default();
        let registry = Arc::new(DaemonRegistry::new(db.clone(), &config));
        let conversations = ConversationService::new(db.clone(), Duration::from_secs(4 * 3600));
        let planner = Arc::new(ScriptedLlm::new("planner"));
        let synthesizer = Arc::new(ScriptedLlm::new("synthesizer"));
        let master_agent = Arc::new(MasterAgent::new(
            db.clone(),
            conversations.clone(),
            Arc::clone(&registry),
            ToolRegistry::new(),
            planner.clone() as Arc<dyn LlmService>,
            synthesizer as Arc<dyn LlmService>,
            MasterAgentConfig::default(),
        ));
        (
            AppState {
                db,
                registry,
                master_agent,
                conversations,
            },
            planner,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (state, _) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::get("/api/master-agent/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_query_validation_codes() {
        let (state, _) = test_state();
        let app = create_router(state);

        // Missing userId.
        let response = app
            .clone()
            .oneshot(
                Request::post("/api/master-agent/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"query":"hi"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "MISSING_USER_ID");

        // Over-long query.
        let long = "q".repeat(2001);
        let body = serde_json::json!({"userId": "u@x", "query": long}).to_string();
        let response = app
            .oneshot(
                Request::post("/api/master-agent/query")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "QUERY_TOO_LONG");
    }

    #[tokio::test]
    async fn test_submit_then_poll_task() {
        let (state, planner) = test_state();
        planner.queue_text(
            r#"{"decision":"direct_response","glasses_display":"4","webview_content":"four"}"#,
        );
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/master-agent/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"userId":"u@x","query":"What is 2+2?"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let submitted = body_json(response).await;
        assert_eq!(submitted["success"], true);
        let task_id = submitted["taskId"].as_str().unwrap().to_string();

        // Cross-user poll leaks nothing.
        let response = app
            .clone()
            .oneshot(
                Request::get(format!(
                    "/api/master-agent/task/{task_id}?userId=someone-else"
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], "TASK_NOT_FOUND");

        // Owner sees the task reach done.
        let mut last_status = String::new();
        for _ in 0..200 {
            let response = app
                .clone()
                .oneshot(
                    Request::get(format!("/api/master-agent/task/{task_id}?userId=u@x"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            let task = body_json(response).await;
            last_status = task["status"].as_str().unwrap_or("").to_string();
            if last_status == "done" {
                assert_eq!(task["result"]["glassesDisplay"], "4");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(last_status, "done");
    }

    #[tokio::test]
    async fn test_daemon_rest_fallback_requires_token() {
        let (state, _) = test_state();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/daemon/heartbeat")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"runningAgentIds":[],"capacity":3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::post("/api/daemon/heartbeat")
                    .header("content-type", "application/json")
                    .header("authorization", "Bearer user:u@x")
                    .body(Body::from(r#"{"runningAgentIds":[],"capacity":3}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_diagnostic_spawn_without_daemon() {
        let (state, _) = test_state();
        let app = create_router(state);

        let response = app
            .oneshot(
                Request::post("/daemon-api/test/spawn")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"email":"u@x","goal":"echo hello"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "DAEMON_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_diagnostic_agent_read() {
        let (state, _) = test_state();
        state
            .db
            .create_subagent("a-1", "u@x", "list files", None)
            .unwrap();
        let app = create_router(state);

        let response = app
            .clone()
            .oneshot(
                Request::get("/daemon-api/test/agent/a-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let agent = body_json(response).await;
        assert_eq!(agent["agentId"], "a-1");
        assert_eq!(agent["status"], "spawning");

        let response = app
            .oneshot(
                Request::get("/daemon-api/test/agent/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_task_endpoint() {
        let (state, planner) = test_state();
        // Daemon connected but its agent never completes, so the task parks
        // in waiting until cancelled.
        let (_conn, mut rx) = state.registry.register("u@x");
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        planner.queue_text(
            r#"{"decision":"spawn_agent","goal":"long job","rationale":"local"}"#,
        );
        let app = create_router(state.clone());

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/master-agent/query")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"userId":"u@x","query":"start a long job"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        let task_id = body_json(response).await["taskId"]
            .as_str()
            .unwrap()
            .to_string();

        for _ in 0..200 {
            if state
                .master_agent
                .get_task(&task_id, "u@x")
                .map(|t| t.status.to_string() == "waiting")
                .unwrap_or(false)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Cross-user cancel leaks nothing.
        let response = app
            .clone()
            .oneshot(
                Request::post(format!(
                    "/api/master-agent/task/{task_id}/cancel?userId=someone-else"
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // Owner cancels; the task ends in error CANCELLED.
        let response = app
            .clone()
            .oneshot(
                Request::post(format!(
                    "/api/master-agent/task/{task_id}/cancel?userId=u@x"
                ))
                .body(Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["cancelled"], true);

        let mut last = serde_json::Value::Null;
        for _ in 0..200 {
            let response = app
                .clone()
                .oneshot(
                    Request::get(format!("/api/master-agent/task/{task_id}?userId=u@x"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            last = body_json(response).await;
            if last["status"] == "error" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(last["status"], "error");
        assert_eq!(last["errorCode"], "CANCELLED");
    }
}
