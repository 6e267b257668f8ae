//! Persistence for the orchestration subsystem.
//!
//! Three logical collections (`subagents`, `tasks`, `conversations` plus the
//! `turns` rows hanging off them) behind one thread-safe handle. Writes to a
//! single record go through compare-and-swap on its `version` column with a
//! bounded retry, so concurrent mutators never silently clobber each other.

mod schema;

pub use schema::*;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// CAS retry bound for contended writes.
const WRITE_MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Write conflict on {0} after {WRITE_MAX_ATTEMPTS} attempts")]
    WriteConflict(String),
    #[error("Corrupt record {id}: {reason}")]
    CorruptRecord { id: String, reason: String },
}

pub type DbResult<T> = Result<T, DbError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== SubAgent Operations ====================

    /// Create a SubAgent record in `spawning` state. Written before the spawn
    /// command goes out so a crash cannot orphan an untracked child.
    pub fn create_subagent(
        &self,
        agent_id: &str,
        user_id: &str,
        goal: &str,
        working_directory: Option<&str>,
    ) -> DbResult<SubAgent> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO subagents (agent_id, user_id, status, goal, working_directory, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0)",
            params![
                agent_id,
                user_id,
                AgentStatus::Spawning.to_string(),
                goal,
                working_directory,
                now.to_rfc3339(),
            ],
        )?;

        Ok(SubAgent {
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            status: AgentStatus::Spawning,
            goal: goal.to_string(),
            working_directory: working_directory.map(String::from),
            result: None,
            error: None,
            last_observation: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        })
    }

    /// Get a SubAgent by id
    pub fn get_subagent(&self, agent_id: &str) -> DbResult<SubAgent> {
        let conn = self.conn.lock().unwrap();
        Self::query_subagent(&conn, agent_id)
    }

    fn query_subagent(conn: &Connection, agent_id: &str) -> DbResult<SubAgent> {
        let mut stmt = conn.prepare(
            "SELECT agent_id, user_id, status, goal, working_directory, result, error,
                    last_observation, created_at, updated_at, completed_at, version
             FROM subagents WHERE agent_id = ?1",
        )?;

        stmt.query_row(params![agent_id], parse_subagent_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    DbError::AgentNotFound(agent_id.to_string())
                }
                other => DbError::Sqlite(other),
            })
    }

    /// List all SubAgents for a user, most recently updated first
    pub fn list_subagents(&self, user_id: &str) -> DbResult<Vec<SubAgent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT agent_id, user_id, status, goal, working_directory, result, error,
                    last_observation, created_at, updated_at, completed_at, version
             FROM subagents WHERE user_id = ?1 ORDER BY updated_at DESC",
        )?;

        let rows = stmt.query_map(params![user_id], parse_subagent_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// List a user's non-terminal SubAgents
    pub fn list_active_subagents(&self, user_id: &str) -> DbResult<Vec<SubAgent>> {
        Ok(self
            .list_subagents(user_id)?
            .into_iter()
            .filter(|a| !a.status.is_terminal())
            .collect())
    }

    /// Count of non-terminal SubAgents for quota enforcement
    pub fn count_active_subagents(&self, user_id: &str) -> DbResult<u32> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM subagents
             WHERE user_id = ?1 AND status NOT IN ('completed', 'failed', 'killed')",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Apply a non-terminal status observation.
    ///
    /// Returns `Ok(false)` without mutating when the record is already in a
    /// terminal state; terminal states are absorbing and late updates are the
    /// caller's cue to warn and drop.
    pub fn observe_subagent(
        &self,
        agent_id: &str,
        status: AgentStatus,
        observation: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(!status.is_terminal(), "terminal states go through complete_subagent");
        for _ in 0..WRITE_MAX_ATTEMPTS {
            let conn = self.conn.lock().unwrap();
            let current = Self::query_subagent(&conn, agent_id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE subagents
                 SET status = ?1,
                     last_observation = COALESCE(?2, last_observation),
                     updated_at = ?3,
                     version = version + 1
                 WHERE agent_id = ?4 AND version = ?5",
                params![status.to_string(), observation, now, agent_id, current.version],
            )?;
            if changed == 1 {
                return Ok(true);
            }
        }
        Err(DbError::WriteConflict(agent_id.to_string()))
    }

    /// Apply a terminal outcome. The first terminal event wins; returns
    /// `Ok(false)` if the record was already terminal.
    pub fn complete_subagent(
        &self,
        agent_id: &str,
        status: AgentStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(status.is_terminal());
        for _ in 0..WRITE_MAX_ATTEMPTS {
            let conn = self.conn.lock().unwrap();
            let current = Self::query_subagent(&conn, agent_id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE subagents
                 SET status = ?1, result = ?2, error = ?3,
                     updated_at = ?4, completed_at = ?4,
                     version = version + 1
                 WHERE agent_id = ?5 AND version = ?6",
                params![
                    status.to_string(),
                    result,
                    error,
                    now,
                    agent_id,
                    current.version
                ],
            )?;
            if changed == 1 {
                return Ok(true);
            }
        }
        Err(DbError::WriteConflict(agent_id.to_string()))
    }

    // ==================== Task Operations ====================

    /// Create a Task record in `pending` state
    pub fn create_task(&self, task_id: &str, user_id: &str, query: &str) -> DbResult<Task> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO tasks (task_id, user_id, query, status, created_at, updated_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0)",
            params![
                task_id,
                user_id,
                query,
                TaskStatus::Pending.to_string(),
                now.to_rfc3339(),
            ],
        )?;

        Ok(Task {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            query: query.to_string(),
            status: TaskStatus::Pending,
            decision: None,
            spawned_agent_id: None,
            result: None,
            error: None,
            error_code: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        })
    }

    /// Get a Task by id
    pub fn get_task(&self, task_id: &str) -> DbResult<Task> {
        let conn = self.conn.lock().unwrap();
        Self::query_task(&conn, task_id)
    }

    fn query_task(conn: &Connection, task_id: &str) -> DbResult<Task> {
        let mut stmt = conn.prepare(
            "SELECT task_id, user_id, query, status, decision, spawned_agent_id,
                    glasses_display, webview_content, error, error_code,
                    created_at, updated_at, completed_at, version
             FROM tasks WHERE task_id = ?1",
        )?;

        stmt.query_row(params![task_id], parse_task_row)
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::TaskNotFound(task_id.to_string()),
                other => DbError::Sqlite(other),
            })
    }

    /// List a user's recent tasks, newest first
    pub fn list_recent_tasks(&self, user_id: &str, limit: u32) -> DbResult<Vec<Task>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT task_id, user_id, query, status, decision, spawned_agent_id,
                    glasses_display, webview_content, error, error_code,
                    created_at, updated_at, completed_at, version
             FROM tasks WHERE user_id = ?1 ORDER BY updated_at DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![user_id, limit], parse_task_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Move a task to a non-terminal pipeline state, optionally recording the
    /// planner decision and spawned agent. Refuses to leave a terminal state.
    pub fn advance_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        decision: Option<&str>,
        spawned_agent_id: Option<&str>,
    ) -> DbResult<bool> {
        debug_assert!(!status.is_terminal(), "terminal states go through finish_task");
        for _ in 0..WRITE_MAX_ATTEMPTS {
            let conn = self.conn.lock().unwrap();
            let current = Self::query_task(&conn, task_id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = ?1,
                     decision = COALESCE(?2, decision),
                     spawned_agent_id = COALESCE(?3, spawned_agent_id),
                     updated_at = ?4,
                     version = version + 1
                 WHERE task_id = ?5 AND version = ?6",
                params![
                    status.to_string(),
                    decision,
                    spawned_agent_id,
                    now,
                    task_id,
                    current.version
                ],
            )?;
            if changed == 1 {
                return Ok(true);
            }
        }
        Err(DbError::WriteConflict(task_id.to_string()))
    }

    /// Finish a task as `done` with its dual-surface result.
    pub fn finish_task_done(&self, task_id: &str, result: &TaskResult) -> DbResult<bool> {
        self.finish_task(task_id, TaskStatus::Done, Some(result), None, None)
    }

    /// Finish a task as `error`. The apology/diagnostic pair still renders on
    /// both surfaces, so it is stored alongside the error fields.
    pub fn finish_task_error(
        &self,
        task_id: &str,
        code: &str,
        message: &str,
        surfaces: &TaskResult,
    ) -> DbResult<bool> {
        self.finish_task(
            task_id,
            TaskStatus::Error,
            Some(surfaces),
            Some(code),
            Some(message),
        )
    }

    fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
        error_code: Option<&str>,
        error: Option<&str>,
    ) -> DbResult<bool> {
        for _ in 0..WRITE_MAX_ATTEMPTS {
            let conn = self.conn.lock().unwrap();
            let current = Self::query_task(&conn, task_id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }

            let now = Utc::now().to_rfc3339();
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = ?1, glasses_display = ?2, webview_content = ?3,
                     error = ?4, error_code = ?5,
                     updated_at = ?6, completed_at = ?6,
                     version = version + 1
                 WHERE task_id = ?7 AND version = ?8",
                params![
                    status.to_string(),
                    result.map(|r| r.glasses_display.as_str()),
                    result.map(|r| r.webview_content.as_str()),
                    error,
                    error_code,
                    now,
                    task_id,
                    current.version
                ],
            )?;
            if changed == 1 {
                return Ok(true);
            }
        }
        Err(DbError::WriteConflict(task_id.to_string()))
    }

    // ==================== Conversation Operations ====================

    /// Create a new conversation
    pub fn create_conversation(&self, conversation_id: &str, user_id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO conversations (conversation_id, user_id, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![conversation_id, user_id, now.to_rfc3339()],
        )?;

        Ok(Conversation {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            created_at: now,
            last_activity_at: now,
        })
    }

    /// Most recent conversation for the user whose `last_activity_at` is at or
    /// after the cutoff. Older conversations are immutable archives.
    pub fn active_conversation(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Option<Conversation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, user_id, created_at, last_activity_at
             FROM conversations
             WHERE user_id = ?1 AND last_activity_at >= ?2
             ORDER BY last_activity_at DESC LIMIT 1",
        )?;

        stmt.query_row(params![user_id, cutoff.to_rfc3339()], |row| {
            Ok(Conversation {
                conversation_id: row.get(0)?,
                user_id: row.get(1)?,
                created_at: parse_datetime(&row.get::<_, String>(2)?),
                last_activity_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })
        .optional()
        .map_err(DbError::from)
    }

    /// Get a conversation by id
    pub fn get_conversation(&self, conversation_id: &str) -> DbResult<Conversation> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, user_id, created_at, last_activity_at
             FROM conversations WHERE conversation_id = ?1",
        )?;

        stmt.query_row(params![conversation_id], |row| {
            Ok(Conversation {
                conversation_id: row.get(0)?,
                user_id: row.get(1)?,
                created_at: parse_datetime(&row.get::<_, String>(2)?),
                last_activity_at: parse_datetime(&row.get::<_, String>(3)?),
            })
        })
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                DbError::ConversationNotFound(conversation_id.to_string())
            }
            other => DbError::Sqlite(other),
        })
    }

    /// Append a turn and bump `last_activity_at` in one transaction.
    pub fn append_turn(
        &self,
        conversation_id: &str,
        role: TurnRole,
        content: &str,
        associated_task_id: Option<&str>,
    ) -> DbResult<Turn> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        let now = Utc::now();

        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;

        tx.execute(
            "INSERT INTO turns (conversation_id, seq, role, content, associated_task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                conversation_id,
                seq,
                role.to_string(),
                content,
                associated_task_id,
                now.to_rfc3339(),
            ],
        )?;

        let updated = tx.execute(
            "UPDATE conversations SET last_activity_at = ?1 WHERE conversation_id = ?2",
            params![now.to_rfc3339(), conversation_id],
        )?;
        if updated == 0 {
            return Err(DbError::ConversationNotFound(conversation_id.to_string()));
        }

        tx.commit()?;

        Ok(Turn {
            conversation_id: conversation_id.to_string(),
            seq,
            role,
            content: content.to_string(),
            associated_task_id: associated_task_id.map(String::from),
            created_at: now,
        })
    }

    /// Last `limit` turns in chronological order.
    pub fn recent_turns(&self, conversation_id: &str, limit: u32) -> DbResult<Vec<Turn>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT conversation_id, seq, role, content, associated_task_id, created_at
             FROM (SELECT * FROM turns WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2)
             ORDER BY seq ASC",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit], parse_turn_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Total number of turns in a conversation.
    pub fn turn_count(&self, conversation_id: &str) -> DbResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )
        .map_err(DbError::from)
    }
}

fn parse_subagent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubAgent> {
    let status_str: String = row.get(2)?;
    Ok(SubAgent {
        agent_id: row.get(0)?,
        user_id: row.get(1)?,
        status: status_str.parse().unwrap_or(AgentStatus::Failed),
        goal: row.get(3)?,
        working_directory: row.get(4)?,
        result: row.get(5)?,
        error: row.get(6)?,
        last_observation: row.get(7)?,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
        updated_at: parse_datetime(&row.get::<_, String>(9)?),
        completed_at: row.get::<_, Option<String>>(10)?.map(|s| parse_datetime(&s)),
        version: row.get(11)?,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get(3)?;
    let glasses: Option<String> = row.get(6)?;
    let webview: Option<String> = row.get(7)?;
    let result = match (glasses, webview) {
        (Some(glasses_display), Some(webview_content)) => Some(TaskResult {
            glasses_display,
            webview_content,
        }),
        _ => None,
    };

    Ok(Task {
        task_id: row.get(0)?,
        user_id: row.get(1)?,
        query: row.get(2)?,
        status: status_str.parse().unwrap_or(TaskStatus::Error),
        decision: row.get(4)?,
        spawned_agent_id: row.get(5)?,
        result,
        error: row.get(8)?,
        error_code: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        updated_at: parse_datetime(&row.get::<_, String>(11)?),
        completed_at: row.get::<_, Option<String>>(12)?.map(|s| parse_datetime(&s)),
        version: row.get(13)?,
    })
}

fn parse_turn_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Turn> {
    let role_str: String = row.get(2)?;
    Ok(Turn {
        conversation_id: row.get(0)?,
        seq: row.get(1)?,
        role: role_str.parse().unwrap_or(TurnRole::Assistant),
        content: row.get(3)?,
        associated_task_id: row.get(4)?,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_create_and_get_subagent() {
        let db = Database::open_in_memory().unwrap();

        let agent = db
            .create_subagent("a-1", "u@x", "list files", Some("/home/u"))
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Spawning);

        let fetched = db.get_subagent("a-1").unwrap();
        assert_eq!(fetched.agent_id, "a-1");
        assert_eq!(fetched.user_id, "u@x");
        assert_eq!(fetched.working_directory.as_deref(), Some("/home/u"));
        assert_eq!(fetched.version, 0);
    }

    #[test]
    fn test_observe_subagent_advances_and_bumps_version() {
        let db = Database::open_in_memory().unwrap();
        db.create_subagent("a-1", "u@x", "goal", None).unwrap();

        let applied = db
            .observe_subagent("a-1", AgentStatus::Running, Some("compiling"))
            .unwrap();
        assert!(applied);

        let agent = db.get_subagent("a-1").unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.last_observation.as_deref(), Some("compiling"));
        assert_eq!(agent.version, 1);
    }

    #[test]
    fn test_terminal_state_is_absorbing() {
        let db = Database::open_in_memory().unwrap();
        db.create_subagent("a-1", "u@x", "goal", None).unwrap();

        let applied = db
            .complete_subagent("a-1", AgentStatus::Completed, Some("done"), None)
            .unwrap();
        assert!(applied);

        // A racing kill or late observation must not mutate the record.
        assert!(!db
            .complete_subagent("a-1", AgentStatus::Killed, None, Some("kill"))
            .unwrap());
        assert!(!db
            .observe_subagent("a-1", AgentStatus::Running, Some("late"))
            .unwrap());

        let agent = db.get_subagent("a-1").unwrap();
        assert_eq!(agent.status, AgentStatus::Completed);
        assert_eq!(agent.result.as_deref(), Some("done"));
        assert!(agent.completed_at.is_some());
    }

    #[test]
    fn test_active_subagent_count_excludes_terminal() {
        let db = Database::open_in_memory().unwrap();
        db.create_subagent("a-1", "u@x", "one", None).unwrap();
        db.create_subagent("a-2", "u@x", "two", None).unwrap();
        db.create_subagent("a-3", "u@x", "three", None).unwrap();
        db.create_subagent("b-1", "other", "theirs", None).unwrap();

        db.complete_subagent("a-3", AgentStatus::Failed, None, Some("boom"))
            .unwrap();

        assert_eq!(db.count_active_subagents("u@x").unwrap(), 2);
        assert_eq!(db.list_active_subagents("u@x").unwrap().len(), 2);
        assert_eq!(db.list_subagents("u@x").unwrap().len(), 3);
    }

    #[test]
    fn test_task_lifecycle() {
        let db = Database::open_in_memory().unwrap();
        db.create_task("t-1", "u@x", "what is 2+2?").unwrap();

        assert!(db
            .advance_task("t-1", TaskStatus::Deciding, None, None)
            .unwrap());
        assert!(db
            .advance_task("t-1", TaskStatus::Waiting, Some("spawn_agent"), Some("a-1"))
            .unwrap());

        let result = TaskResult {
            glasses_display: "4".to_string(),
            webview_content: "The answer is **4**.".to_string(),
        };
        assert!(db.finish_task_done("t-1", &result).unwrap());

        let task = db.get_task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert_eq!(task.decision.as_deref(), Some("spawn_agent"));
        assert_eq!(task.spawned_agent_id.as_deref(), Some("a-1"));
        assert_eq!(task.result.unwrap(), result);

        // Terminal tasks stay terminal.
        assert!(!db
            .advance_task("t-1", TaskStatus::Deciding, None, None)
            .unwrap());
        assert!(!db.finish_task_done("t-1", &TaskResult {
            glasses_display: "5".to_string(),
            webview_content: "no".to_string(),
        })
        .unwrap());
    }

    #[test]
    fn test_finish_task_error_keeps_surfaces() {
        let db = Database::open_in_memory().unwrap();
        db.create_task("t-1", "u@x", "do something local").unwrap();

        let surfaces = TaskResult {
            glasses_display: "Sorry, your desktop isn't reachable".to_string(),
            webview_content: "No daemon connection for this account.".to_string(),
        };
        db.finish_task_error("t-1", "DAEMON_UNAVAILABLE", "no daemon connected", &surfaces)
            .unwrap();

        let task = db.get_task("t-1").unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.error_code.as_deref(), Some("DAEMON_UNAVAILABLE"));
        assert_eq!(task.result.unwrap().glasses_display, surfaces.glasses_display);
    }

    #[test]
    fn test_get_missing_task() {
        let db = Database::open_in_memory().unwrap();
        assert!(matches!(
            db.get_task("nope"),
            Err(DbError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_conversation_turns_and_activity() {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("c-1", "u@x").unwrap();

        let before = db.get_conversation("c-1").unwrap().last_activity_at;
        let t1 = db
            .append_turn("c-1", TurnRole::User, "hello", Some("t-1"))
            .unwrap();
        let t2 = db.append_turn("c-1", TurnRole::Assistant, "hi", None).unwrap();
        assert_eq!(t1.seq, 1);
        assert_eq!(t2.seq, 2);

        let after = db.get_conversation("c-1").unwrap().last_activity_at;
        assert!(after >= before);

        let turns = db.recent_turns("c-1", 20).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[0].associated_task_id.as_deref(), Some("t-1"));
        assert_eq!(turns[1].content, "hi");
    }

    #[test]
    fn test_recent_turns_trims_to_limit_in_order() {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("c-1", "u@x").unwrap();
        for i in 0..25 {
            db.append_turn("c-1", TurnRole::User, &format!("turn {i}"), None)
                .unwrap();
        }

        let turns = db.recent_turns("c-1", 20).unwrap();
        assert_eq!(turns.len(), 20);
        assert_eq!(turns[0].content, "turn 5");
        assert_eq!(turns[19].content, "turn 24");
        assert_eq!(db.turn_count("c-1").unwrap(), 25);
    }

    #[test]
    fn test_active_conversation_respects_cutoff() {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("c-1", "u@x").unwrap();

        let fresh_cutoff = Utc::now() - ChronoDuration::hours(4);
        let found = db.active_conversation("u@x", fresh_cutoff).unwrap();
        assert_eq!(found.unwrap().conversation_id, "c-1");

        // A cutoff in the future makes every conversation stale.
        let future_cutoff = Utc::now() + ChronoDuration::hours(1);
        assert!(db.active_conversation("u@x", future_cutoff).unwrap().is_none());

        // Other users never see it.
        assert!(db.active_conversation("b@x", fresh_cutoff).unwrap().is_none());
    }
}
