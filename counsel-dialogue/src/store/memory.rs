//! In-process session store.

use super::{keep_most_recent, plan_append, AppendOutcome, SessionStore};
use crate::error::{DialogueError, Result};
use crate::types::{Session, Turn, TurnDraft};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

struct SessionEntry {
    session: Session,
    turns: Vec<Turn>,
}

/// Session store kept entirely in memory. Nothing survives a restart.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(DialogueError::Storage(format!(
                "session '{}' already exists",
                session.id
            )));
        }

        sessions.insert(
            session.id.clone(),
            SessionEntry {
                session: session.clone(),
                turns: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).map(|entry| entry.session.clone()))
    }

    async fn update_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(&session.id)
            .ok_or_else(|| DialogueError::UnknownSession(session.id.clone()))?;

        entry.session.status = session.status;
        entry.session.title = session.title.clone();
        entry.session.last_activity_at = session.last_activity_at;
        Ok(())
    }

    async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut listed: Vec<Session> = sessions
            .values()
            .map(|entry| &entry.session)
            .filter(|s| user_id.map_or(true, |u| s.user_id.as_deref() == Some(u)))
            .cloned()
            .collect();

        listed.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(listed)
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn append_turn(
        &self,
        session_id: &str,
        draft: &TurnDraft,
        expected: Option<u64>,
    ) -> Result<AppendOutcome> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(session_id)
            .ok_or_else(|| DialogueError::UnknownSession(session_id.to_string()))?;

        let last = entry.turns.last().map_or(0, |t| t.sequence);
        let existing = expected
            .and_then(|seq| seq.checked_sub(1))
            .and_then(|idx| entry.turns.get(idx as usize));

        let outcome = plan_append(session_id, last, expected, existing, draft)?;
        if let AppendOutcome::Appended(seq) = outcome {
            entry.turns.push(draft.clone().into_turn(session_id, seq));
            entry.session.turn_count = seq;
        }
        Ok(outcome)
    }

    async fn record_turn(&self, session: &Session, draft: &TurnDraft) -> Result<u64> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions
            .get_mut(&session.id)
            .ok_or_else(|| DialogueError::UnknownSession(session.id.clone()))?;

        let seq = entry.turns.last().map_or(0, |t| t.sequence) + 1;
        entry.turns.push(draft.clone().into_turn(&session.id, seq));
        entry.session.turn_count = seq;
        entry.session.status = session.status;
        entry.session.title = session.title.clone();
        entry.session.last_activity_at = session.last_activity_at;
        Ok(seq)
    }

    async fn read_turns(
        &self,
        session_id: &str,
        limit: Option<usize>,
        since: Option<u64>,
    ) -> Result<Vec<Turn>> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| DialogueError::UnknownSession(session_id.to_string()))?;

        let since = since.unwrap_or(0);
        let turns = entry
            .turns
            .iter()
            .filter(|t| t.sequence > since)
            .cloned()
            .collect();
        Ok(keep_most_recent(turns, limit))
    }

    async fn health_check(&self) -> bool {
        true
    }
}
