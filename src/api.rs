//! HTTP and WebSocket surface of the server.

mod handlers;
mod types;
mod ws;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::conversation::ConversationService;
use crate::db::Database;
use crate::master_agent::MasterAgent;
use crate::registry::DaemonRegistry;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub registry: Arc<DaemonRegistry>,
    pub master_agent: Arc<MasterAgent>,
    pub conversations: ConversationService,
}

/// Resolve a bearer token to a user id.
///
/// Development scheme: `user:<userId>`. A production verifier (signed tokens
/// from the identity provider) replaces this single function; everything else
/// treats the returned id as authoritative.
pub fn authenticate_token(token: &str) -> Option<String> {
    let user_id = token.strip_prefix("user:")?.trim();
    if user_id.is_empty() {
        return None;
    }
    Some(user_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authenticate_token() {
        assert_eq!(authenticate_token("user:u@x").as_deref(), Some("u@x"));
        assert!(authenticate_token("user:").is_none());
        assert!(authenticate_token("bearer-something").is_none());
        assert!(authenticate_token("").is_none());
    }
}
