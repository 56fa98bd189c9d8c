//! SQLite-backed session store.
//!
//! Every append runs in its own transaction with `synchronous = FULL`, so a
//! turn is on disk before the append returns.

use super::{keep_most_recent, plan_append, AppendOutcome, SessionStore};
use crate::error::{DialogueError, Result};
use crate::types::{Role, SafetyLevel, SafetyVerdict, Session, SessionStatus, Turn, TurnDraft};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Durable session store on a single SQLite database file.
#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DialogueError::Storage(format!(
                        "failed to create {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        Self::init(Connection::open(db_path)?)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| DialogueError::Storage(format!("connection lock poisoned: {e}")))?;
            f(&mut *guard)
        })
        .await?
    }
}

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DialogueError::Storage(format!("bad timestamp '{raw}': {e}")))
}

const SESSION_COLUMNS: &str =
    "id, user_id, title, status, created_at, last_activity_at, turn_count";

const TURN_COLUMNS: &str =
    "session_id, sequence, role, text, timestamp, verdict_level, verdict_reason, summary";

/// Raw session row, converted outside the rusqlite row closure.
struct SessionRow {
    id: String,
    user_id: Option<String>,
    title: Option<String>,
    status: String,
    created_at: String,
    last_activity_at: String,
    turn_count: i64,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            title: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            last_activity_at: row.get(5)?,
            turn_count: row.get(6)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let status = SessionStatus::parse(&self.status)
            .ok_or_else(|| DialogueError::Storage(format!("bad status '{}'", self.status)))?;

        Ok(Session {
            id: self.id,
            user_id: self.user_id,
            title: self.title,
            status,
            created_at: parse_ts(&self.created_at)?,
            last_activity_at: parse_ts(&self.last_activity_at)?,
            turn_count: self.turn_count.max(0) as u64,
        })
    }
}

struct TurnRow {
    session_id: String,
    sequence: i64,
    role: String,
    text: String,
    timestamp: String,
    verdict_level: String,
    verdict_reason: Option<String>,
    summary: Option<String>,
}

impl TurnRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            session_id: row.get(0)?,
            sequence: row.get(1)?,
            role: row.get(2)?,
            text: row.get(3)?,
            timestamp: row.get(4)?,
            verdict_level: row.get(5)?,
            verdict_reason: row.get(6)?,
            summary: row.get(7)?,
        })
    }

    fn into_turn(self) -> Result<Turn> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| DialogueError::Storage(format!("bad role '{}'", self.role)))?;
        let level = SafetyLevel::parse(&self.verdict_level).ok_or_else(|| {
            DialogueError::Storage(format!("bad verdict '{}'", self.verdict_level))
        })?;

        Ok(Turn {
            session_id: self.session_id,
            sequence: self.sequence.max(0) as u64,
            role,
            text: self.text,
            timestamp: parse_ts(&self.timestamp)?,
            verdict: SafetyVerdict {
                level,
                reason: self.verdict_reason,
            },
            summary: self.summary,
        })
    }
}

fn session_exists(conn: &Connection, session_id: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn turn_at(conn: &Connection, session_id: &str, sequence: u64) -> Result<Option<Turn>> {
    let sql = format!("SELECT {TURN_COLUMNS} FROM turns WHERE session_id = ?1 AND sequence = ?2");
    let row = conn
        .query_row(&sql, params![session_id, sequence as i64], TurnRow::from_row)
        .optional()?;
    row.map(TurnRow::into_turn).transpose()
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, title, status, created_at, last_activity_at, turn_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    session.id,
                    session.user_id,
                    session.title,
                    session.status.as_str(),
                    format_ts(&session.created_at),
                    format_ts(&session.last_activity_at),
                    session.turn_count as i64,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1");
            let row = conn
                .query_row(&sql, params![session_id], SessionRow::from_row)
                .optional()?;
            row.map(SessionRow::into_session).transpose()
        })
        .await
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let session = session.clone();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET status = ?2, title = ?3, last_activity_at = ?4 WHERE id = ?1",
                params![
                    session.id,
                    session.status.as_str(),
                    session.title,
                    format_ts(&session.last_activity_at),
                ],
            )?;

            if changed == 0 {
                return Err(DialogueError::UnknownSession(session.id));
            }
            Ok(())
        })
        .await
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        let user_id = user_id.map(str::to_string);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE ?1 IS NULL OR user_id = ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![user_id], SessionRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut sessions = rows
                .into_iter()
                .map(SessionRow::into_session)
                .collect::<Result<Vec<_>>>()?;
            sessions.sort_by(|a, b| {
                b.last_activity_at
                    .cmp(&a.last_activity_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(sessions)
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM turns WHERE session_id = ?1", params![session_id])?;
            let removed = tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
            tx.commit()?;
            Ok(removed > 0)
        })
        .await
    }

    async fn append_turn(
        &self,
        session_id: &str,
        draft: &TurnDraft,
        expected: Option<u64>,
    ) -> Result<AppendOutcome> {
        let session_id = session_id.to_string();
        let draft = draft.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            if !session_exists(&tx, &session_id)? {
                return Err(DialogueError::UnknownSession(session_id));
            }

            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM turns WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )?;
            let last = last.max(0) as u64;

            let existing = match expected {
                Some(seq) if seq <= last => turn_at(&tx, &session_id, seq)?,
                _ => None,
            };

            let outcome = plan_append(&session_id, last, expected, existing.as_ref(), &draft)?;
            if let AppendOutcome::Appended(seq) = outcome {
                tx.execute(
                    "INSERT INTO turns (session_id, sequence, role, text, timestamp, verdict_level, verdict_reason, summary)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        session_id,
                        seq as i64,
                        draft.role.as_str(),
                        draft.text,
                        format_ts(&draft.timestamp),
                        draft.verdict.level.as_str(),
                        draft.verdict.reason,
                        draft.summary,
                    ],
                )?;
                tx.execute(
                    "UPDATE sessions SET turn_count = ?2 WHERE id = ?1",
                    params![session_id, seq as i64],
                )?;
            }

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn record_turn(&self, session: &Session, draft: &TurnDraft) -> Result<u64> {
        let session = session.clone();
        let draft = draft.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;

            let last: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM turns WHERE session_id = ?1",
                params![session.id],
                |row| row.get(0),
            )?;
            let seq = last.max(0) + 1;

            let changed = tx.execute(
                "UPDATE sessions
                 SET status = ?2, title = ?3, last_activity_at = ?4, turn_count = ?5
                 WHERE id = ?1",
                params![
                    session.id,
                    session.status.as_str(),
                    session.title,
                    format_ts(&session.last_activity_at),
                    seq,
                ],
            )?;
            if changed == 0 {
                return Err(DialogueError::UnknownSession(session.id));
            }

            tx.execute(
                "INSERT INTO turns (session_id, sequence, role, text, timestamp, verdict_level, verdict_reason, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    session.id,
                    seq,
                    draft.role.as_str(),
                    draft.text,
                    format_ts(&draft.timestamp),
                    draft.verdict.level.as_str(),
                    draft.verdict.reason,
                    draft.summary,
                ],
            )?;

            tx.commit()?;
            Ok(seq as u64)
        })
        .await
    }

    async fn read_turns(
        &self,
        session_id: &str,
        limit: Option<usize>,
        since: Option<u64>,
    ) -> Result<Vec<Turn>> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            if !session_exists(conn, &session_id)? {
                return Err(DialogueError::UnknownSession(session_id));
            }

            let since = since.unwrap_or(0) as i64;
            // Newest first so LIMIT keeps the most recent, then flip to ascending.
            let sql = format!(
                "SELECT {TURN_COLUMNS} FROM turns
                 WHERE session_id = ?1 AND sequence > ?2
                 ORDER BY sequence DESC
                 LIMIT ?3"
            );
            let sql_limit = limit.map_or(-1, |l| l.min(i64::MAX as usize) as i64);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![session_id, since, sql_limit], TurnRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut turns = rows
                .into_iter()
                .map(TurnRow::into_turn)
                .collect::<Result<Vec<_>>>()?;
            turns.reverse();
            Ok(keep_most_recent(turns, limit))
        })
        .await
    }

    async fn health_check(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
        .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn session_roundtrip() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let session = Session::new("s1", Some("student-7".into()), ts(100));
        store.create_session(&session).await.unwrap();

        let loaded = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded, session);
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let session = Session::new("s1", None, ts(0));
        store.create_session(&session).await.unwrap();
        assert!(matches!(
            store.create_session(&session).await,
            Err(DialogueError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn turns_preserve_verdict_and_summary() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();

        let user = TurnDraft::user("I feel hopeless", ts(1), SafetyVerdict::sensitive("distress"));
        let reply = TurnDraft::assistant("Let's talk it through.", ts(2), SafetyVerdict::clear(), 200);
        store.append_turn("s1", &user, None).await.unwrap();
        store.append_turn("s1", &reply, None).await.unwrap();

        let turns = store.read_turns("s1", None, None).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].verdict, SafetyVerdict::sensitive("distress"));
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].summary.as_deref(), Some("Let's talk it through."));

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.turn_count, 2);
    }

    #[tokio::test]
    async fn read_limit_keeps_most_recent() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();
        for i in 0..6 {
            let draft = TurnDraft::user(format!("m{i}"), ts(i), SafetyVerdict::clear());
            store.append_turn("s1", &draft, None).await.unwrap();
        }

        let turns = store.read_turns("s1", Some(3), None).await.unwrap();
        assert_eq!(turns.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![4, 5, 6]);

        let turns = store.read_turns("s1", Some(10), Some(4)).await.unwrap();
        assert_eq!(turns.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![5, 6]);
    }

    #[tokio::test]
    async fn append_to_unknown_session_fails() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let draft = TurnDraft::user("hi", ts(0), SafetyVerdict::clear());
        assert!(matches!(
            store.append_turn("nope", &draft, None).await,
            Err(DialogueError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn retry_detection_by_sequence() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();
        let draft = TurnDraft::user("hello", ts(1), SafetyVerdict::clear());

        assert_eq!(
            store.append_turn("s1", &draft, Some(1)).await.unwrap(),
            AppendOutcome::Appended(1)
        );
        assert_eq!(
            store.append_turn("s1", &draft, Some(1)).await.unwrap(),
            AppendOutcome::Duplicate(1)
        );

        let other = TurnDraft::user("something else", ts(1), SafetyVerdict::clear());
        assert!(matches!(
            store.append_turn("s1", &other, Some(1)).await,
            Err(DialogueError::SequenceConflict { expected: 2, got: 1, .. })
        ));
    }

    #[tokio::test]
    async fn record_turn_writes_turn_and_session_together() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut session = Session::new("s1", None, ts(0));
        store.create_session(&session).await.unwrap();
        let first = TurnDraft::user("hello", ts(1), SafetyVerdict::clear());
        store.append_turn("s1", &first, None).await.unwrap();

        session.status = SessionStatus::Escalated;
        session.last_activity_at = ts(5);
        let blocked = TurnDraft::user("blocked text", ts(5), SafetyVerdict::blocked("self_harm"));
        assert_eq!(store.record_turn(&session, &blocked).await.unwrap(), 2);

        let loaded = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Escalated);
        assert_eq!(loaded.last_activity_at, ts(5));
        assert_eq!(loaded.turn_count, 2);
        let turns = store.read_turns("s1", None, None).await.unwrap();
        assert!(turns[1].verdict.is_blocked());

        let ghost = Session::new("ghost", None, ts(0));
        assert!(matches!(
            store.record_turn(&ghost, &blocked).await,
            Err(DialogueError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn update_persists_status_and_title_only() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut session = Session::new("s1", None, ts(0));
        store.create_session(&session).await.unwrap();

        session.status = SessionStatus::Closed;
        session.title = Some("Choosing a major".into());
        session.last_activity_at = ts(500);
        session.turn_count = 42;
        store.update_session(&session).await.unwrap();

        let loaded = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Closed);
        assert_eq!(loaded.title.as_deref(), Some("Choosing a major"));
        assert_eq!(loaded.last_activity_at, ts(500));
        assert_eq!(loaded.turn_count, 0);
    }

    #[tokio::test]
    async fn health_check_passes() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert!(store.health_check().await);
    }
}
