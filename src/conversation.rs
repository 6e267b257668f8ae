//! Conversation service
//!
//! Owns the append-only dialog history. One conversation per user is "active"
//! at a time, selected by recency; everything older is an immutable archive
//! kept for inspection but never prompted from.

use crate::db::{Conversation, Database, DbError, DbResult, Turn, TurnRole};
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Turns handed to planners; older turns stay in persistence only.
pub const PLANNER_HISTORY_LIMIT: u32 = 20;

/// Sole mutator of conversation turns.
#[derive(Clone)]
pub struct ConversationService {
    db: Database,
    ttl: Duration,
}

impl ConversationService {
    pub fn new(db: Database, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    /// Fetch the user's active conversation, minting a new one if the most
    /// recent has fallen out of the freshness window.
    pub fn get_or_create_active(&self, user_id: &str) -> DbResult<Conversation> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::hours(4));

        if let Some(conversation) = self.db.active_conversation(user_id, cutoff)? {
            return Ok(conversation);
        }

        let conversation_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(user_id = %user_id, conversation_id = %conversation_id, "Minting conversation");
        self.db.create_conversation(&conversation_id, user_id)
    }

    /// Append a turn. Bumps `last_activity_at` atomically with the insert.
    pub fn append_turn(
        &self,
        conversation_id: &str,
        role: TurnRole,
        content: &str,
        task_id: Option<&str>,
    ) -> DbResult<Turn> {
        self.db.append_turn(conversation_id, role, content, task_id)
    }

    /// Last 20 turns, oldest first, for tools and summaries.
    pub fn recent_turns(&self, conversation_id: &str) -> DbResult<Vec<Turn>> {
        self.db.recent_turns(conversation_id, PLANNER_HISTORY_LIMIT)
    }

    /// Planner context: the recent turns formatted one per line.
    pub fn history_for_planner(&self, conversation_id: &str) -> DbResult<String> {
        let turns = self.recent_turns(conversation_id)?;
        if turns.is_empty() {
            return Ok("(no prior conversation)".to_string());
        }
        Ok(turns
            .iter()
            .map(|t| format!("{}: {}", t.role, t.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Guarded read used by tools: refuses conversations owned by another user.
    pub fn conversation_for_user(&self, conversation_id: &str, user_id: &str) -> DbResult<Conversation> {
        let conversation = self.db.get_conversation(conversation_id)?;
        if conversation.user_id != user_id {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }
        Ok(conversation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ConversationService {
        ConversationService::new(
            Database::open_in_memory().unwrap(),
            Duration::from_secs(4 * 3600),
        )
    }

    #[test]
    fn test_get_or_create_reuses_fresh_conversation() {
        let service = service();
        let first = service.get_or_create_active("u@x").unwrap();
        let second = service.get_or_create_active("u@x").unwrap();
        assert_eq!(first.conversation_id, second.conversation_id);
    }

    #[test]
    fn test_stale_conversation_is_archived() {
        let service = ConversationService::new(
            Database::open_in_memory().unwrap(),
            Duration::from_millis(0),
        );
        let first = service.get_or_create_active("u@x").unwrap();
        // ttl of zero: nothing is ever fresh, so a new conversation is minted.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = service.get_or_create_active("u@x").unwrap();
        assert_ne!(first.conversation_id, second.conversation_id);
    }

    #[test]
    fn test_users_get_distinct_conversations() {
        let service = service();
        let a = service.get_or_create_active("a@x").unwrap();
        let b = service.get_or_create_active("b@x").unwrap();
        assert_ne!(a.conversation_id, b.conversation_id);
        assert!(service
            .conversation_for_user(&a.conversation_id, "b@x")
            .is_err());
    }

    #[test]
    fn test_history_format_and_trim() {
        let service = service();
        let conv = service.get_or_create_active("u@x").unwrap();

        assert_eq!(
            service.history_for_planner(&conv.conversation_id).unwrap(),
            "(no prior conversation)"
        );

        for i in 0..22 {
            service
                .append_turn(&conv.conversation_id, TurnRole::User, &format!("q{i}"), None)
                .unwrap();
            service
                .append_turn(
                    &conv.conversation_id,
                    TurnRole::Assistant,
                    &format!("a{i}"),
                    None,
                )
                .unwrap();
        }

        let history = service.history_for_planner(&conv.conversation_id).unwrap();
        let lines: Vec<&str> = history.lines().collect();
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[19], "assistant: a21");
        assert!(lines[0].starts_with("user:") || lines[0].starts_with("assistant:"));
    }
}
