//! Deterministic fakes for pipeline tests.
//!
//! The planner and synthesizer seams take any `LlmService`, so tests script
//! exact model behavior without real I/O.

use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, LlmService, Usage};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

/// LLM fake that replays queued responses and records every request.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<LlmResponse, LlmError>>>,
    pub requests: Mutex<Vec<LlmRequest>>,
    model_id: String,
}

impl ScriptedLlm {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            model_id: model_id.into(),
        }
    }

    /// Queue a plain-text response.
    pub fn queue_text(&self, text: impl Into<String>) {
        self.queue_response(LlmResponse {
            content: vec![ContentBlock::text(text)],
            end_turn: true,
            usage: Usage::default(),
        });
    }

    /// Queue a response containing one tool call.
    pub fn queue_tool_use(&self, id: &str, name: &str, input: serde_json::Value) {
        self.queue_response(LlmResponse {
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
            end_turn: false,
            usage: Usage::default(),
        });
    }

    pub fn queue_response(&self, response: LlmResponse) {
        self.responses.lock().unwrap().push_back(Ok(response));
    }

    pub fn queue_error(&self, error: LlmError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmService for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No scripted response queued")))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
