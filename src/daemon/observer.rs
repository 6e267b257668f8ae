//! Terminal output observer.
//!
//! A cheap LLM watches the rolling output window and folds it into a small
//! state alphabet. The model is behind `ObserverClient` so agent tests script
//! classifications instead of calling a provider.

use crate::llm::{LlmError, LlmMessage, LlmRequest, LlmService, SystemContent};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

const OBSERVER_SYSTEM: &str = r#"You watch the output of a CLI coding agent running in a terminal and classify its current state.

Reply with EXACTLY ONE JSON object, nothing else:
{"state":"working","detail":"<one concise line describing current progress>"}
{"state":"awaiting_input","detail":"<the prompt the tool is blocked on>"}
{"state":"success","detail":"<the final answer or result text>"}
{"state":"failure","detail":"<why the tool gave up or errored>"}

Only report success or failure when the session is clearly finished. Partial
progress, compiler chatter and intermediate tool output are "working"."#;

/// Classifier verdict over one output window.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Working { observation: String },
    AwaitingInput { prompt: String },
    Success { summary: String },
    Failure { summary: String },
}

impl Classification {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Classification::Success { .. } | Classification::Failure { .. }
        )
    }
}

/// Capability seam for the observer model.
#[async_trait]
pub trait ObserverClient: Send + Sync {
    async fn classify(&self, window: &str) -> Result<Classification, LlmError>;
}

/// Production observer backed by any `LlmService` (Gemini Flash by default).
pub struct LlmObserver {
    service: Arc<dyn LlmService>,
}

impl LlmObserver {
    pub fn new(service: Arc<dyn LlmService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl ObserverClient for LlmObserver {
    async fn classify(&self, window: &str) -> Result<Classification, LlmError> {
        let request = LlmRequest {
            system: vec![SystemContent::new(OBSERVER_SYSTEM)],
            messages: vec![LlmMessage::user(format!(
                "Terminal output (most recent last):\n\n{window}"
            ))],
            tools: vec![],
            max_tokens: Some(256),
        };

        let response = self.service.complete(&request).await?;
        parse_classification(&response.text())
            .ok_or_else(|| LlmError::unknown("observer produced no parseable classification"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
enum WireClassification {
    Working {
        #[serde(default)]
        detail: String,
    },
    AwaitingInput {
        #[serde(default)]
        detail: String,
    },
    Success {
        #[serde(default)]
        detail: String,
    },
    Failure {
        #[serde(default)]
        detail: String,
    },
}

/// Pull the classification object out of model text, tolerating prose and
/// code fences around it.
pub fn parse_classification(text: &str) -> Option<Classification> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    let wire: WireClassification = serde_json::from_str(&text[start..=end]).ok()?;
    Some(match wire {
        WireClassification::Working { detail } => Classification::Working {
            observation: detail,
        },
        WireClassification::AwaitingInput { detail } => {
            Classification::AwaitingInput { prompt: detail }
        }
        WireClassification::Success { detail } => Classification::Success { summary: detail },
        WireClassification::Failure { detail } => Classification::Failure { summary: detail },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_all_states() {
        assert_eq!(
            parse_classification(r#"{"state":"working","detail":"compiling crate 3 of 12"}"#),
            Some(Classification::Working {
                observation: "compiling crate 3 of 12".to_string()
            })
        );
        assert_eq!(
            parse_classification(r#"{"state":"awaiting_input","detail":"Proceed? [y/N]"}"#),
            Some(Classification::AwaitingInput {
                prompt: "Proceed? [y/N]".to_string()
            })
        );
        assert!(matches!(
            parse_classification(r#"{"state":"success","detail":"4 files listed"}"#),
            Some(Classification::Success { .. })
        ));
        assert!(matches!(
            parse_classification(r#"{"state":"failure","detail":"command not found"}"#),
            Some(Classification::Failure { .. })
        ));
    }

    #[test]
    fn test_parse_tolerates_fences() {
        let text = "Sure!\n```json\n{\"state\":\"working\",\"detail\":\"running tests\"}\n```";
        assert!(matches!(
            parse_classification(text),
            Some(Classification::Working { .. })
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_classification("the tool is probably working").is_none());
        assert!(parse_classification(r#"{"state":"meditating"}"#).is_none());
    }

    #[test]
    fn test_terminal_predicate() {
        assert!(Classification::Success {
            summary: String::new()
        }
        .is_terminal());
        assert!(!Classification::Working {
            observation: String::new()
        }
        .is_terminal());
    }
}
