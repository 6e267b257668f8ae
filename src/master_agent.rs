//! MasterAgent: turns a user query into a persisted, dual-surface Task.
//!
//! `submit_query` is non-blocking: it validates, writes the Task and user
//! turn, then hands the pipeline to its own tokio task. Every failure past
//! validation becomes a Task in `error` state with user-facing text; callers
//! polling `get_task` never see a stuck record.

mod decision;
#[cfg(test)]
pub mod testing;

pub use decision::{parse_decision, parse_surfaces, sanitize_glasses, Decision, GLASSES_MAX_CHARS};

use crate::config::ServerConfig;
use crate::conversation::ConversationService;
use crate::db::{Database, DbError, SubAgent, Task, TaskResult, TaskStatus, TurnRole};
use crate::error::ErrorCode;
use crate::llm::{
    ContentBlock, LlmError, LlmErrorKind, LlmMessage, LlmRequest, LlmService, SystemContent,
};
use crate::registry::{DaemonRegistry, RegistryError, WaitOutcome};
use crate::tools::{ToolContext, ToolRegistry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const PLANNER_SYSTEM: &str = r#"You are the orchestrator for a smart-glasses assistant. The user speaks a short query; you decide how it resolves.

You may call the provided read-only tools (at most a few calls) to inspect the user's recent tasks, running desktop agents, daemon connectivity and conversation.

Then emit EXACTLY ONE JSON object, nothing else, in one of these shapes:
{"decision":"direct_response","glasses_display":"...","webview_content":"..."}
  - the query is answerable from the conversation and tool results alone
{"decision":"clarifying_question","glasses_display":"...","webview_content":"..."}
  - the query is ambiguous; ask one short follow-up
{"decision":"spawn_agent","goal":"...","working_directory":"...","rationale":"..."}
  - the query needs work on the user's desktop (files, code, local apps);
    working_directory is optional

glasses_display is rendered on a HUD: plain text, one line, 100 characters maximum.
webview_content is markdown for the companion app and may be long."#;

const SYNTHESIS_SYSTEM: &str = r#"You write the final answer for a smart-glasses assistant after a desktop agent finished working on the user's behalf.

Emit EXACTLY ONE JSON object:
{"glasses_display":"...","webview_content":"..."}

glasses_display: plain text, one line, 100 characters maximum, the essence of the outcome.
webview_content: markdown; include the agent's conclusive output verbatim (in a code block if it is raw terminal text). If the agent failed, say so plainly and summarize the cause."#;

/// Budgets for one task. All intermediate overruns only shrink what is left;
/// the task dies only when the total is gone.
#[derive(Debug, Clone)]
pub struct MasterAgentConfig {
    pub total_budget: Duration,
    pub planner_timeout: Duration,
    pub tool_timeout: Duration,
    pub synthesis_timeout: Duration,
    pub max_tool_calls: u32,
    pub query_max_len: usize,
}

impl Default for MasterAgentConfig {
    fn default() -> Self {
        Self {
            total_budget: Duration::from_secs(120),
            planner_timeout: Duration::from_secs(15),
            tool_timeout: Duration::from_secs(5),
            synthesis_timeout: Duration::from_secs(20),
            max_tool_calls: 6,
            query_max_len: 2000,
        }
    }
}

impl MasterAgentConfig {
    pub fn from_server(config: &ServerConfig) -> Self {
        Self {
            total_budget: config.task_budget,
            query_max_len: config.query_max_len,
            ..Self::default()
        }
    }
}

/// Synchronous `submit_query` failures. The validation variants surface as
/// HTTP 400s and never create Task records; `Storage` is a server-side
/// persistence failure and maps to 503.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("userId is required")]
    MissingUserId,
    #[error("query must not be empty")]
    InvalidQuery,
    #[error("query exceeds the maximum length")]
    QueryTooLong,
    #[error(transparent)]
    Storage(#[from] DbError),
}

impl SubmitError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SubmitError::MissingUserId => ErrorCode::MissingUserId,
            SubmitError::InvalidQuery => ErrorCode::InvalidQuery,
            SubmitError::QueryTooLong => ErrorCode::QueryTooLong,
            SubmitError::Storage(_) => ErrorCode::ServiceUnavailable,
        }
    }
}

/// Task reads refuse cross-user access with NotFound so existence never
/// leaks.
#[derive(Debug, thiserror::Error)]
pub enum TaskAccessError {
    #[error("task not found")]
    NotFound,
    #[error(transparent)]
    Storage(DbError),
}

/// Internal pipeline failure carried to `finalize_error`.
#[derive(Debug)]
struct TaskFailure {
    code: ErrorCode,
    message: String,
}

impl TaskFailure {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One model-call failure inside the pipeline.
enum StepError {
    Cancelled,
    BudgetExhausted,
    StepTimeout,
    Llm(LlmError),
}

pub struct MasterAgent {
    db: Database,
    conversations: ConversationService,
    registry: Arc<DaemonRegistry>,
    tools: ToolRegistry,
    planner: Arc<dyn LlmService>,
    synthesizer: Arc<dyn LlmService>,
    config: MasterAgentConfig,
    task_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel_tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl MasterAgent {
    pub fn new(
        db: Database,
        conversations: ConversationService,
        registry: Arc<DaemonRegistry>,
        tools: ToolRegistry,
        planner: Arc<dyn LlmService>,
        synthesizer: Arc<dyn LlmService>,
        config: MasterAgentConfig,
    ) -> Self {
        Self {
            db,
            conversations,
            registry,
            tools,
            planner,
            synthesizer,
            config,
            task_locks: Mutex::new(HashMap::new()),
            cancel_tokens: Mutex::new(HashMap::new()),
        }
    }

    // ==================== Entry points ====================

    /// Validate and enqueue a query. Returns the task id immediately; the
    /// pipeline runs on its own tokio task.
    pub fn submit_query(self: &Arc<Self>, user_id: &str, query: &str) -> Result<String, SubmitError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(SubmitError::MissingUserId);
        }
        if query.trim().is_empty() {
            return Err(SubmitError::InvalidQuery);
        }
        if query.chars().count() > self.config.query_max_len {
            return Err(SubmitError::QueryTooLong);
        }

        let conversation = self.conversations.get_or_create_active(user_id)?;
        let task_id = uuid::Uuid::new_v4().to_string();
        self.db.create_task(&task_id, user_id, query)?;
        self.conversations.append_turn(
            &conversation.conversation_id,
            TurnRole::User,
            query,
            Some(&task_id),
        )?;

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .lock()
            .unwrap()
            .insert(task_id.clone(), cancel.clone());

        let agent = Arc::clone(self);
        let spawned_task_id = task_id.clone();
        let user = user_id.to_string();
        let query = query.to_string();
        let conversation_id = conversation.conversation_id;
        tokio::spawn(async move {
            agent
                .process_task(&spawned_task_id, &user, &query, &conversation_id, cancel)
                .await;
        });

        tracing::info!(task_id = %task_id, user_id = %user_id, "Query accepted");
        Ok(task_id)
    }

    /// Current task record, refusing cross-user reads.
    pub fn get_task(&self, task_id: &str, user_id: &str) -> Result<Task, TaskAccessError> {
        match self.db.get_task(task_id) {
            Ok(task) if task.user_id == user_id => Ok(task),
            Ok(_) | Err(DbError::TaskNotFound(_)) => Err(TaskAccessError::NotFound),
            Err(e) => Err(TaskAccessError::Storage(e)),
        }
    }

    /// Cancel a task's scope: outstanding model calls abort and the wait on
    /// any spawned agent returns. Best-effort; returns whether a live task
    /// was signalled.
    pub fn cancel_task(&self, task_id: &str, user_id: &str) -> bool {
        if self.get_task(task_id, user_id).is_err() {
            return false;
        }
        match self.cancel_tokens.lock().unwrap().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ==================== Pipeline ====================

    async fn process_task(
        self: Arc<Self>,
        task_id: &str,
        user_id: &str,
        query: &str,
        conversation_id: &str,
        cancel: CancellationToken,
    ) {
        let deadline = Instant::now() + self.config.total_budget;

        let outcome = self
            .run_pipeline(task_id, user_id, query, conversation_id, deadline, &cancel)
            .await;

        match outcome {
            Ok(result) => self.finalize_done(task_id, conversation_id, result).await,
            Err(failure) => self.finalize_error(task_id, conversation_id, failure).await,
        }

        self.cancel_tokens.lock().unwrap().remove(task_id);
        self.task_locks.lock().unwrap().remove(task_id);
    }

    async fn run_pipeline(
        &self,
        task_id: &str,
        user_id: &str,
        query: &str,
        conversation_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TaskFailure> {
        self.advance(task_id, TaskStatus::Deciding, None, None).await?;

        let history = self
            .conversations
            .history_for_planner(conversation_id)
            .map_err(|e| TaskFailure::new(ErrorCode::ServiceUnavailable, e.to_string()))?;

        let decision = self
            .decide(user_id, query, &history, deadline, cancel)
            .await?;
        tracing::info!(task_id = %task_id, decision = decision.kind(), "Planner decided");

        let kind = decision.kind();
        match decision {
            Decision::DirectResponse {
                glasses_display,
                webview_content,
            }
            | Decision::ClarifyingQuestion {
                glasses_display,
                webview_content,
            } => {
                self.advance(task_id, TaskStatus::Deciding, Some(kind), None)
                    .await?;
                Ok(finish_direct(glasses_display, webview_content))
            }
            Decision::SpawnAgent {
                goal,
                working_directory,
                rationale,
            } => {
                tracing::info!(task_id = %task_id, goal = %goal, rationale = %rationale, "Spawning agent");
                self.advance(task_id, TaskStatus::Spawning, Some(kind), None)
                    .await?;

                let agent_id = self
                    .registry
                    .spawn_agent(
                        user_id,
                        &goal,
                        working_directory.as_deref(),
                        Default::default(),
                    )
                    .await
                    .map_err(failure_from_registry)?;

                self.advance(task_id, TaskStatus::Waiting, None, Some(&agent_id))
                    .await?;

                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(TaskFailure::new(
                        ErrorCode::Timeout,
                        "task budget exhausted before the agent finished",
                    ));
                }

                let outcome = self
                    .registry
                    .wait_for_completion(&agent_id, remaining, cancel)
                    .await
                    .map_err(failure_from_registry)?;

                match outcome {
                    WaitOutcome::Terminal(agent) => {
                        self.advance(task_id, TaskStatus::Synthesizing, None, None)
                            .await?;
                        self.synthesize(query, &history, &agent, deadline, cancel).await
                    }
                    WaitOutcome::Timeout => Err(TaskFailure::new(
                        ErrorCode::Timeout,
                        "the desktop agent did not finish within the task budget",
                    )),
                    WaitOutcome::Cancelled => Err(TaskFailure::new(
                        ErrorCode::Cancelled,
                        "the query was cancelled while waiting on the desktop agent",
                    )),
                }
            }
        }
    }

    /// Planner phase: bounded tool loop, then a parsed decision.
    async fn decide(
        &self,
        user_id: &str,
        query: &str,
        history: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Decision, TaskFailure> {
        let ctx = ToolContext {
            caller_user_id: user_id.to_string(),
            db: self.db.clone(),
            conversations: self.conversations.clone(),
            registry: Arc::clone(&self.registry),
        };

        let mut messages = vec![LlmMessage::user(format!(
            "Conversation so far:\n{history}\n\nNew query: {query}"
        ))];
        let mut tool_calls_used: u32 = 0;
        let mut reprompted = false;
        let mut step_timeouts: u32 = 0;

        loop {
            let request = LlmRequest {
                system: vec![SystemContent::cached(PLANNER_SYSTEM)],
                messages: messages.clone(),
                tools: self.tools.definitions(),
                max_tokens: Some(1024),
            };

            let response = match self
                .call_model(&self.planner, &request, self.config.planner_timeout, deadline, cancel)
                .await
            {
                Ok(r) => r,
                Err(StepError::StepTimeout) if step_timeouts == 0 => {
                    // One more try while total budget remains.
                    step_timeouts += 1;
                    continue;
                }
                Err(e) => return Err(failure_from_step(e, "planner")),
            };

            let tool_uses: Vec<(String, String, serde_json::Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if !tool_uses.is_empty() && tool_calls_used < self.config.max_tool_calls {
                messages.push(LlmMessage::assistant(response.content.clone()));
                let mut results = Vec::new();
                for (id, name, input) in tool_uses {
                    if tool_calls_used >= self.config.max_tool_calls {
                        results.push(ContentBlock::tool_result(
                            id,
                            "tool budget exhausted; emit your decision now",
                            true,
                        ));
                        continue;
                    }
                    tool_calls_used += 1;
                    let output = tokio::time::timeout(
                        self.config.tool_timeout,
                        self.tools.execute(&name, input, ctx.clone()),
                    )
                    .await;
                    let block = match output {
                        Ok(Some(out)) => ContentBlock::tool_result(id, out.output, !out.success),
                        Ok(None) => {
                            ContentBlock::tool_result(id, format!("Unknown tool: {name}"), true)
                        }
                        Err(_) => ContentBlock::tool_result(id, "tool call timed out", true),
                    };
                    results.push(block);
                }
                messages.push(LlmMessage {
                    role: crate::llm::MessageRole::User,
                    content: results,
                });
                continue;
            }

            match parse_decision(&response.text()) {
                Ok(decision) => return Ok(decision),
                Err(e) if !reprompted => {
                    reprompted = true;
                    messages.push(LlmMessage::assistant(response.content.clone()));
                    messages.push(LlmMessage::user(
                        "Respond now with exactly one JSON decision object and no other text.",
                    ));
                    tracing::warn!(error = %e, "Planner output unparseable, reprompting");
                }
                Err(e) => {
                    return Err(TaskFailure::new(
                        ErrorCode::Internal,
                        format!("planner never produced a decision: {e}"),
                    ));
                }
            }
        }
    }

    /// Synthesis phase: fold the agent outcome into the dual-surface answer.
    async fn synthesize(
        &self,
        query: &str,
        history: &str,
        agent: &SubAgent,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TaskFailure> {
        let outcome = match (&agent.result, &agent.error) {
            (Some(result), _) => format!("The agent completed with this output:\n{result}"),
            (None, Some(error)) => format!("The agent FAILED: {error}"),
            (None, None) => "The agent finished without output.".to_string(),
        };
        let observation = agent
            .last_observation
            .as_deref()
            .unwrap_or("(no observation)");

        let request = LlmRequest {
            system: vec![SystemContent::cached(SYNTHESIS_SYSTEM)],
            messages: vec![LlmMessage::user(format!(
                "Conversation so far:\n{history}\n\nUser query: {query}\n\nAgent goal: {goal}\n{outcome}\n\nLast observation: {observation}",
                goal = agent.goal,
            ))],
            tools: vec![],
            max_tokens: Some(4096),
        };

        let response = self
            .call_model(
                &self.synthesizer,
                &request,
                self.config.synthesis_timeout,
                deadline,
                cancel,
            )
            .await
            .map_err(|e| failure_from_step(e, "synthesis"))?;

        Ok(parse_surfaces(&response.text(), agent.result.as_deref()))
    }

    /// One model call bounded by its step budget, the total budget and the
    /// task's cancellation scope.
    async fn call_model(
        &self,
        service: &Arc<dyn LlmService>,
        request: &LlmRequest,
        step: Duration,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<crate::llm::LlmResponse, StepError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(StepError::BudgetExhausted);
        }
        let allowed = step.min(remaining);

        tokio::select! {
            () = cancel.cancelled() => Err(StepError::Cancelled),
            result = tokio::time::timeout(allowed, service.complete(request)) => match result {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e)) => Err(StepError::Llm(e)),
                Err(_elapsed) => {
                    if deadline.saturating_duration_since(Instant::now()).is_zero() {
                        Err(StepError::BudgetExhausted)
                    } else {
                        Err(StepError::StepTimeout)
                    }
                }
            }
        }
    }

    // ==================== Task state transitions ====================

    /// Linearized transition: the per-task lock is held until the durable
    /// write commits.
    async fn advance(
        &self,
        task_id: &str,
        status: TaskStatus,
        decision: Option<&str>,
        spawned_agent_id: Option<&str>,
    ) -> Result<(), TaskFailure> {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        match self.db.advance_task(task_id, status, decision, spawned_agent_id) {
            Ok(true) => Ok(()),
            Ok(false) => Err(TaskFailure::new(
                ErrorCode::Cancelled,
                "task was finalized concurrently",
            )),
            Err(e) => Err(TaskFailure::new(ErrorCode::ServiceUnavailable, e.to_string())),
        }
    }

    async fn finalize_done(&self, task_id: &str, conversation_id: &str, result: TaskResult) {
        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        match self.db.finish_task_done(task_id, &result) {
            Ok(true) => {
                tracing::info!(task_id = %task_id, "Task done");
                if let Err(e) = self.conversations.append_turn(
                    conversation_id,
                    TurnRole::Assistant,
                    &result.glasses_display,
                    Some(task_id),
                ) {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to append assistant turn");
                }
            }
            Ok(false) => {
                tracing::warn!(task_id = %task_id, "Task already finalized, dropping result");
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to finalize task");
            }
        }
    }

    async fn finalize_error(&self, task_id: &str, conversation_id: &str, failure: TaskFailure) {
        let surfaces = TaskResult {
            glasses_display: sanitize_glasses(apology_for(failure.code)),
            webview_content: format!(
                "**Something went wrong.**\n\n`{}`: {}",
                failure.code, failure.message
            ),
        };

        let lock = self.task_lock(task_id);
        let _guard = lock.lock().await;
        match self
            .db
            .finish_task_error(task_id, failure.code.as_str(), &failure.message, &surfaces)
        {
            Ok(true) => {
                tracing::warn!(task_id = %task_id, code = %failure.code, message = %failure.message, "Task failed");
                // The conversation history still reflects the outcome.
                if let Err(e) = self.conversations.append_turn(
                    conversation_id,
                    TurnRole::Assistant,
                    &surfaces.glasses_display,
                    Some(task_id),
                ) {
                    tracing::error!(task_id = %task_id, error = %e, "Failed to append assistant turn");
                }
            }
            Ok(false) => {
                tracing::warn!(task_id = %task_id, "Task already finalized, dropping error");
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Failed to finalize task error");
            }
        }
    }

    fn task_lock(&self, task_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.task_locks
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .clone()
    }
}

fn finish_direct(glasses: String, webview: String) -> TaskResult {
    TaskResult {
        glasses_display: sanitize_glasses(&glasses),
        webview_content: if webview.trim().is_empty() {
            "(no content)".to_string()
        } else {
            webview
        },
    }
}

fn apology_for(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::DaemonUnavailable => "Sorry, your desktop isn't reachable right now",
        ErrorCode::QuotaExceeded => "Too many desktop agents are already running",
        ErrorCode::Timeout => "Sorry, that took too long to finish",
        ErrorCode::Cancelled => "Okay, cancelled that",
        ErrorCode::ServiceUnavailable => "Sorry, the assistant is having trouble right now",
        _ => "Sorry, something went wrong",
    }
}

fn failure_from_registry(err: RegistryError) -> TaskFailure {
    match err {
        RegistryError::DaemonUnavailable => TaskFailure::new(
            ErrorCode::DaemonUnavailable,
            "no desktop daemon is connected for this user",
        ),
        RegistryError::QuotaExceeded => TaskFailure::new(
            ErrorCode::QuotaExceeded,
            "the concurrent desktop agent cap is reached",
        ),
        RegistryError::Db(e) => TaskFailure::new(ErrorCode::ServiceUnavailable, e.to_string()),
    }
}

fn failure_from_step(err: StepError, phase: &str) -> TaskFailure {
    match err {
        StepError::Cancelled => {
            TaskFailure::new(ErrorCode::Cancelled, format!("{phase} was cancelled"))
        }
        StepError::BudgetExhausted => TaskFailure::new(
            ErrorCode::Timeout,
            format!("task budget exhausted during {phase}"),
        ),
        StepError::StepTimeout => TaskFailure::new(
            ErrorCode::Timeout,
            format!("{phase} repeatedly exceeded its time budget"),
        ),
        StepError::Llm(e) => match e.kind {
            LlmErrorKind::Network | LlmErrorKind::RateLimit | LlmErrorKind::ServerError => {
                TaskFailure::new(
                    ErrorCode::ServiceUnavailable,
                    format!("{phase} model unavailable: {e}"),
                )
            }
            LlmErrorKind::Timeout => {
                TaskFailure::new(ErrorCode::Timeout, format!("{phase} timed out: {e}"))
            }
            _ => TaskFailure::new(ErrorCode::Internal, format!("{phase} failed: {e}")),
        },
    }
}
