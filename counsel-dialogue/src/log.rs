//! Message Log: append-only ordered record of turns for a session.

use crate::error::Result;
use crate::store::{AppendOutcome, SessionStore};
use crate::types::{Turn, TurnDraft};
use std::sync::Arc;

/// Append and read turns through the configured [`SessionStore`].
#[derive(Clone)]
pub struct MessageLog {
    store: Arc<dyn SessionStore>,
}

impl MessageLog {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    /// Append a turn and return the sequence number it was written at.
    ///
    /// Fails with `UnknownSession` if the session does not exist.
    pub async fn append(&self, session_id: &str, draft: &TurnDraft) -> Result<u64> {
        let outcome = self.store.append_turn(session_id, draft, None).await?;
        tracing::debug!(
            session_id,
            sequence = outcome.sequence(),
            role = draft.role.as_str(),
            verdict = draft.verdict.level.as_str(),
            "Turn appended"
        );
        Ok(outcome.sequence())
    }

    /// Append at a known sequence number.
    ///
    /// Re-sending a turn that is already stored at `sequence` returns
    /// [`AppendOutcome::Duplicate`] without writing.
    pub async fn append_at(
        &self,
        session_id: &str,
        sequence: u64,
        draft: &TurnDraft,
    ) -> Result<AppendOutcome> {
        let outcome = self
            .store
            .append_turn(session_id, draft, Some(sequence))
            .await?;

        if let AppendOutcome::Duplicate(seq) = outcome {
            tracing::debug!(session_id, sequence = seq, "Duplicate append ignored");
        }
        Ok(outcome)
    }

    /// Turns in ascending sequence order, newer than `since`, keeping the
    /// most recent `limit`.
    pub async fn read(
        &self,
        session_id: &str,
        limit: Option<usize>,
        since: Option<u64>,
    ) -> Result<Vec<Turn>> {
        if limit == Some(0) {
            // Still reject unknown sessions.
            self.store.read_turns(session_id, Some(0), since).await?;
            return Ok(Vec::new());
        }
        self.store.read_turns(session_id, limit, since).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DialogueError;
    use crate::store::InMemorySessionStore;
    use crate::types::{SafetyVerdict, Session};
    use chrono::{DateTime, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    async fn log_with_session(id: &str) -> MessageLog {
        let store = Arc::new(InMemorySessionStore::new());
        store.create_session(&Session::new(id, None, ts(0))).await.unwrap();
        MessageLog::new(store)
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_increase() {
        let log = log_with_session("s1").await;
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            let seq = log
                .append("s1", &TurnDraft::user(*text, ts(i as i64), SafetyVerdict::clear()))
                .await
                .unwrap();
            assert_eq!(seq, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn append_to_missing_session_is_unknown() {
        let log = MessageLog::new(Arc::new(InMemorySessionStore::new()));
        let err = log
            .append("ghost", &TurnDraft::user("hi", ts(0), SafetyVerdict::clear()))
            .await
            .unwrap_err();
        assert!(matches!(err, DialogueError::UnknownSession(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn read_with_zero_limit_is_empty() {
        let log = log_with_session("s1").await;
        log.append("s1", &TurnDraft::user("hi", ts(0), SafetyVerdict::clear()))
            .await
            .unwrap();

        assert!(log.read("s1", Some(0), None).await.unwrap().is_empty());
        assert!(log.read("missing", Some(0), None).await.is_err());
    }

    #[tokio::test]
    async fn append_at_retry_is_idempotent() {
        let log = log_with_session("s1").await;
        let draft = TurnDraft::user("hello", ts(1), SafetyVerdict::clear());

        assert_eq!(log.append_at("s1", 1, &draft).await.unwrap(), AppendOutcome::Appended(1));
        assert_eq!(log.append_at("s1", 1, &draft).await.unwrap(), AppendOutcome::Duplicate(1));
        assert_eq!(log.read("s1", None, None).await.unwrap().len(), 1);
    }
}
