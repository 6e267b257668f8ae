//! Planner decision schema and output parsing.
//!
//! The planner is instructed to emit exactly one JSON object. Models wrap
//! JSON in prose or code fences often enough that parsing scans for the
//! outermost object instead of trusting the raw text.

use crate::db::TaskResult;
use serde::Deserialize;

/// Upper bound on the HUD surface, in Unicode scalar values.
pub const GLASSES_MAX_CHARS: usize = 100;

/// The three ways a query can resolve.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    DirectResponse {
        glasses_display: String,
        webview_content: String,
    },
    ClarifyingQuestion {
        glasses_display: String,
        webview_content: String,
    },
    SpawnAgent {
        goal: String,
        #[serde(default)]
        working_directory: Option<String>,
        #[serde(default)]
        rationale: String,
    },
}

impl Decision {
    /// Stable name recorded on the Task.
    pub fn kind(&self) -> &'static str {
        match self {
            Decision::DirectResponse { .. } => "direct_response",
            Decision::ClarifyingQuestion { .. } => "clarifying_question",
            Decision::SpawnAgent { .. } => "spawn_agent",
        }
    }
}

/// Synthesizer output: the same dual-surface shape without a decision tag.
#[derive(Debug, Deserialize)]
struct SurfacePair {
    glasses_display: String,
    webview_content: String,
}

#[derive(Debug, thiserror::Error)]
#[error("no parseable decision in model output: {0}")]
pub struct ParseError(String);

/// Parse a planner decision out of model text.
pub fn parse_decision(text: &str) -> Result<Decision, ParseError> {
    let json = extract_object(text).ok_or_else(|| ParseError(preview(text)))?;
    serde_json::from_str(json).map_err(|_| ParseError(preview(text)))
}

/// Parse a synthesizer answer, falling back to building surfaces from the raw
/// text so a malformed model reply still yields a usable result.
pub fn parse_surfaces(text: &str, verbatim: Option<&str>) -> TaskResult {
    if let Some(json) = extract_object(text) {
        if let Ok(pair) = serde_json::from_str::<SurfacePair>(json) {
            return finish_surfaces(pair.glasses_display, pair.webview_content, verbatim);
        }
    }
    let fallback_webview = match verbatim {
        Some(v) => format!("{text}\n\n```\n{v}\n```"),
        None => text.to_string(),
    };
    finish_surfaces(text.to_string(), fallback_webview, None)
}

fn finish_surfaces(glasses: String, webview: String, verbatim: Option<&str>) -> TaskResult {
    let webview_content = match verbatim {
        // The agent's conclusive output rides along verbatim when the model
        // left it out.
        Some(v) if !webview.contains(v.trim()) => format!("{webview}\n\n```\n{v}\n```"),
        _ => webview,
    };
    TaskResult {
        glasses_display: sanitize_glasses(&glasses),
        webview_content: if webview_content.trim().is_empty() {
            "(no content)".to_string()
        } else {
            webview_content
        },
    }
}

/// Force a string into the HUD contract: single line, no markdown sigils,
/// 1..=100 scalar values.
pub fn sanitize_glasses(raw: &str) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    let mut last_was_space = true;
    for c in raw.chars() {
        let c = match c {
            '\n' | '\r' | '\t' => ' ',
            '*' | '`' | '#' | '_' => continue,
            other => other,
        };
        if c == ' ' {
            if last_was_space {
                continue;
            }
            last_was_space = true;
        } else {
            last_was_space = false;
        }
        cleaned.push(c);
    }
    let cleaned = cleaned.trim();

    let mut out: String = cleaned.chars().take(GLASSES_MAX_CHARS).collect();
    if cleaned.chars().count() > GLASSES_MAX_CHARS {
        // Reserve the last scalar for the ellipsis.
        out = cleaned.chars().take(GLASSES_MAX_CHARS - 1).collect();
        out.push('…');
    }
    if out.is_empty() {
        out.push_str("Done");
    }
    out
}

/// Find the outermost balanced JSON object in free-form model text.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    text.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_direct_response() {
        let decision = parse_decision(
            r#"{"decision":"direct_response","glasses_display":"4","webview_content":"The answer is **4**."}"#,
        )
        .unwrap();
        assert_eq!(decision.kind(), "direct_response");
    }

    #[test]
    fn test_parse_decision_inside_prose_and_fences() {
        let text = "Here is my decision:\n```json\n{\"decision\":\"spawn_agent\",\"goal\":\"list files in ~\",\"rationale\":\"needs the desktop\"}\n```\nDone.";
        let decision = parse_decision(text).unwrap();
        match decision {
            Decision::SpawnAgent { goal, working_directory, .. } => {
                assert_eq!(goal, "list files in ~");
                assert!(working_directory.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_decision_with_nested_braces() {
        let text = r#"{"decision":"direct_response","glasses_display":"ok","webview_content":"use `{ a: 1 }` here"}"#;
        assert!(parse_decision(text).is_ok());
    }

    #[test]
    fn test_unparseable_decision_is_an_error() {
        assert!(parse_decision("I think we should spawn an agent.").is_err());
        assert!(parse_decision(r#"{"decision":"do_a_dance"}"#).is_err());
    }

    #[test]
    fn test_sanitize_strips_newlines_and_markdown() {
        let out = sanitize_glasses("**Bold**\nanswer\twith   `code`");
        assert_eq!(out, "Bold answer with code");
        assert!(!out.contains('\n'));
    }

    #[test]
    fn test_sanitize_enforces_length() {
        let long = "x".repeat(250);
        let out = sanitize_glasses(&long);
        assert_eq!(out.chars().count(), GLASSES_MAX_CHARS);
        assert!(out.ends_with('…'));

        let exact = "y".repeat(GLASSES_MAX_CHARS);
        assert_eq!(sanitize_glasses(&exact).chars().count(), GLASSES_MAX_CHARS);
    }

    #[test]
    fn test_sanitize_never_empty() {
        assert_eq!(sanitize_glasses("  \n "), "Done");
        assert_eq!(sanitize_glasses("***"), "Done");
    }

    #[test]
    fn test_parse_surfaces_embeds_verbatim_output() {
        let result = parse_surfaces(
            r#"{"glasses_display":"3 crates need updates","webview_content":"Summary of the audit."}"#,
            Some("crate-a 1.0 -> 1.2\ncrate-b 0.3 -> 0.4"),
        );
        assert!(result.webview_content.contains("crate-a 1.0 -> 1.2"));
        assert_eq!(result.glasses_display, "3 crates need updates");
    }

    #[test]
    fn test_parse_surfaces_fallback_from_prose() {
        let result = parse_surfaces("The listing finished fine.", Some("src tests Cargo.toml"));
        assert!(result.glasses_display.starts_with("The listing"));
        assert!(result.webview_content.contains("src tests Cargo.toml"));
    }

    proptest! {
        #[test]
        fn prop_sanitized_glasses_always_within_contract(raw in ".*") {
            let out = sanitize_glasses(&raw);
            prop_assert!(!out.is_empty());
            prop_assert!(out.chars().count() <= GLASSES_MAX_CHARS);
            prop_assert!(!out.contains('\n'));
        }
    }
}
