//! The `SessionStore` capability and its backends.
//!
//! The dialogue core never talks to a database directly; it goes through
//! [`SessionStore`]. Two backends ship with the crate:
//! - [`InMemorySessionStore`] for tests and ephemeral deployments
//! - [`SqliteSessionStore`] for durable storage

mod memory;
mod sqlite;

pub use memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;

use crate::error::{DialogueError, Result};
use crate::types::{Session, Turn, TurnDraft};
use async_trait::async_trait;

/// Result of appending a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The turn was written at this sequence number.
    Appended(u64),
    /// An identical turn already sits at this sequence number (retried append).
    Duplicate(u64),
}

impl AppendOutcome {
    pub fn sequence(self) -> u64 {
        match self {
            Self::Appended(seq) | Self::Duplicate(seq) => seq,
        }
    }
}

/// Storage capability for sessions and their turns.
///
/// Implementations must make `append_turn` and `record_turn` durable before
/// returning and must assign sequence numbers atomically.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Backend name (e.g., "sqlite", "memory")
    fn name(&self) -> &str;

    /// Insert a new session record. Fails if the id is taken.
    async fn create_session(&self, session: &Session) -> Result<()>;

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>>;

    /// Persist status, title, and last activity of an existing session.
    ///
    /// `turn_count` is owned by `append_turn` and is not written here.
    async fn update_session(&self, session: &Session) -> Result<()>;

    /// Sessions ordered by most recent activity, optionally filtered by owner.
    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>>;

    /// Remove a session and all of its turns.
    ///
    /// Returns true if the session existed.
    async fn delete_session(&self, session_id: &str) -> Result<bool>;

    /// Append a turn.
    ///
    /// With `expected = None` the next sequence number is assigned. With
    /// `expected = Some(n)` the append is an idempotent retry: an identical
    /// turn already at `n` yields [`AppendOutcome::Duplicate`].
    async fn append_turn(
        &self,
        session_id: &str,
        draft: &TurnDraft,
        expected: Option<u64>,
    ) -> Result<AppendOutcome>;

    /// Append a turn at the next sequence number and persist the status,
    /// title, and last activity of `session` in the same write.
    ///
    /// Either both land or neither does. Returns the new sequence number.
    async fn record_turn(&self, session: &Session, draft: &TurnDraft) -> Result<u64>;

    /// Turns with sequence greater than `since`, in ascending order,
    /// keeping only the most recent `limit`.
    async fn read_turns(
        &self,
        session_id: &str,
        limit: Option<usize>,
        since: Option<u64>,
    ) -> Result<Vec<Turn>>;

    /// Health check: returns true if the backend is operational.
    async fn health_check(&self) -> bool;
}

/// Decide where an append lands, given the last sequence in the session and
/// the turn already stored at the expected position (if any).
pub(crate) fn plan_append(
    session_id: &str,
    last: u64,
    expected: Option<u64>,
    existing: Option<&Turn>,
    draft: &TurnDraft,
) -> Result<AppendOutcome> {
    let next = last + 1;

    match expected {
        None => Ok(AppendOutcome::Appended(next)),
        Some(seq) if seq == next => Ok(AppendOutcome::Appended(next)),
        Some(seq) => match existing {
            Some(turn) if seq <= last && draft.matches(turn) => Ok(AppendOutcome::Duplicate(seq)),
            _ => Err(DialogueError::SequenceConflict {
                session_id: session_id.to_string(),
                expected: next,
                got: seq,
            }),
        },
    }
}

/// Apply `limit` to an ascending list of turns, keeping the newest.
pub(crate) fn keep_most_recent(mut turns: Vec<Turn>, limit: Option<usize>) -> Vec<Turn> {
    if let Some(limit) = limit {
        if turns.len() > limit {
            turns.drain(..turns.len() - limit);
        }
    }
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SafetyVerdict;
    use chrono::Utc;

    fn draft(text: &str) -> TurnDraft {
        TurnDraft::user(text, Utc::now(), SafetyVerdict::clear())
    }

    #[test]
    fn plan_assigns_next_sequence() {
        assert_eq!(
            plan_append("s", 0, None, None, &draft("a")).unwrap(),
            AppendOutcome::Appended(1)
        );
        assert_eq!(
            plan_append("s", 4, Some(5), None, &draft("a")).unwrap(),
            AppendOutcome::Appended(5)
        );
    }

    #[test]
    fn plan_detects_duplicate_retry() {
        let existing = draft("hello").into_turn("s", 3);
        assert_eq!(
            plan_append("s", 4, Some(3), Some(&existing), &draft("hello")).unwrap(),
            AppendOutcome::Duplicate(3)
        );
    }

    #[test]
    fn plan_rejects_mismatched_retry_and_gaps() {
        let existing = draft("hello").into_turn("s", 3);
        assert!(matches!(
            plan_append("s", 4, Some(3), Some(&existing), &draft("different")),
            Err(DialogueError::SequenceConflict { expected: 5, got: 3, .. })
        ));
        assert!(matches!(
            plan_append("s", 4, Some(7), None, &draft("gap")),
            Err(DialogueError::SequenceConflict { expected: 5, got: 7, .. })
        ));
    }

    #[test]
    fn keep_most_recent_trims_front() {
        let turns: Vec<Turn> = (1..=5).map(|i| draft("t").into_turn("s", i)).collect();
        let kept = keep_most_recent(turns.clone(), Some(2));
        assert_eq!(kept.iter().map(|t| t.sequence).collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(keep_most_recent(turns, None).len(), 5);
    }
}
