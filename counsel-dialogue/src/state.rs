//! Session State Machine.
//!
//! ```text
//!              message / clear
//!   (new) ──→ Active ⇄ Escalated        blocked content or escalate: Active → Escalated
//!               │          │            clear:                       Escalated → Active
//!               └────┬─────┘
//!                    ▼ close / inactivity timeout
//!                  Closed (terminal)
//! ```
//!
//! Inactivity is checked lazily: whenever a session is loaded, it is closed
//! first if it has been idle longer than the configured timeout.

use crate::error::{DialogueError, Result};
use crate::store::SessionStore;
use crate::types::{Session, SessionStatus, TurnDraft};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

static SESSION_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("valid session id regex"));

/// Events that drive session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// Inbound user message.
    Message,
    /// Safety triage blocked inbound or outbound text.
    SafetyBlocked,
    /// Explicit escalation signal.
    Escalate,
    /// Explicit escalation clearance.
    Clear,
    /// Explicit end of the conversation.
    Close,
    InactivityTimeout,
}

impl SessionEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::SafetyBlocked => "safety_blocked",
            Self::Escalate => "escalate",
            Self::Clear => "clear",
            Self::Close => "close",
            Self::InactivityTimeout => "inactivity_timeout",
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition table. `Closed` accepts nothing.
pub fn next_status(from: SessionStatus, event: SessionEvent) -> Result<SessionStatus> {
    use SessionEvent as E;
    use SessionStatus as S;

    let to = match (from, event) {
        (S::Closed, _) => None,
        (_, E::Close | E::InactivityTimeout) => Some(S::Closed),
        (_, E::SafetyBlocked | E::Escalate) => Some(S::Escalated),
        (S::Escalated, E::Clear) => Some(S::Active),
        (S::Active, E::Clear) => None,
        (status, E::Message) => Some(status),
    };

    to.ok_or(DialogueError::InvalidTransition { from, event })
}

/// Validate a caller-supplied session id.
pub fn validate_session_id(session_id: &str) -> Result<()> {
    if SESSION_ID_RE.is_match(session_id) {
        Ok(())
    } else {
        Err(DialogueError::InvalidInput(
            "session id must be 1-128 characters of [A-Za-z0-9_-]".to_string(),
        ))
    }
}

/// Owns session lifecycle: creation, lazy expiry, and status transitions.
///
/// Callers must hold the per-session lock while using it; the state machine
/// itself does no locking.
#[derive(Clone)]
pub struct SessionStateMachine {
    store: Arc<dyn SessionStore>,
    inactivity_timeout: Duration,
}

impl SessionStateMachine {
    pub fn new(store: Arc<dyn SessionStore>, inactivity_timeout: Duration) -> Self {
        Self {
            store,
            inactivity_timeout,
        }
    }

    /// Resolve the session an inbound message belongs to.
    ///
    /// A missing id, or an id never seen before, creates a fresh `Active`
    /// session. A known session is returned after the inactivity check, so
    /// the result may be `Closed`.
    pub async fn open(
        &self,
        session_id: Option<&str>,
        user_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Session> {
        let session_id = match session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        match self.store.get_session(&session_id).await? {
            Some(session) => self.expire_if_idle(session, at).await,
            None => {
                let session = Session::new(session_id, user_id.map(str::to_string), at);
                self.store.create_session(&session).await?;
                tracing::info!(session_id = %session.id, "Session created");
                Ok(session)
            }
        }
    }

    /// Load an existing session, applying the inactivity check.
    pub async fn load(&self, session_id: &str, at: DateTime<Utc>) -> Result<Session> {
        self.find(session_id, at)
            .await?
            .ok_or_else(|| DialogueError::UnknownSession(session_id.to_string()))
    }

    /// Like [`SessionStateMachine::load`], but a missing session is `None`.
    pub async fn find(&self, session_id: &str, at: DateTime<Utc>) -> Result<Option<Session>> {
        match self.store.get_session(session_id).await? {
            Some(session) => self.expire_if_idle(session, at).await.map(Some),
            None => Ok(None),
        }
    }

    /// Apply `event` to the session and persist the result.
    pub async fn transition(
        &self,
        session_id: &str,
        event: SessionEvent,
        at: DateTime<Utc>,
    ) -> Result<SessionStatus> {
        let mut session = self.load(session_id, at).await?;
        self.apply(&mut session, event, at).await
    }

    /// Apply `event` to an already loaded session and persist the result.
    pub async fn apply(
        &self,
        session: &mut Session,
        event: SessionEvent,
        at: DateTime<Utc>,
    ) -> Result<SessionStatus> {
        let from = session.status;
        let next = advance(session, event, at)?;
        self.store.update_session(&next).await?;

        *session = next;
        log_change(session, from, event);
        Ok(session.status)
    }

    /// Append `draft` and apply `event` (as activity at `at`) in a single
    /// store write.
    ///
    /// On failure neither the turn nor the new status is stored, and
    /// `session` is left as it was.
    pub async fn record(
        &self,
        session: &mut Session,
        event: SessionEvent,
        draft: &TurnDraft,
        at: DateTime<Utc>,
    ) -> Result<(u64, SessionStatus)> {
        let from = session.status;
        let next = advance(session, event, at)?;
        let sequence = self.store.record_turn(&next, draft).await?;

        *session = next;
        session.turn_count = sequence;
        tracing::debug!(
            session_id = %session.id,
            sequence,
            role = draft.role.as_str(),
            verdict = draft.verdict.level.as_str(),
            "Turn recorded"
        );
        log_change(session, from, event);
        Ok((sequence, session.status))
    }

    /// Replace the session title. Allowed in any status.
    pub async fn set_title(&self, session_id: &str, title: &str) -> Result<Session> {
        let mut session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| DialogueError::UnknownSession(session_id.to_string()))?;

        session.title = Some(title.to_string());
        self.store.update_session(&session).await?;
        Ok(session)
    }

    async fn expire_if_idle(&self, mut session: Session, at: DateTime<Utc>) -> Result<Session> {
        if session.status == SessionStatus::Closed
            || !session.is_idle(at, self.inactivity_timeout)
        {
            return Ok(session);
        }

        // Keep the last real activity; expiry is not activity.
        session.status = next_status(session.status, SessionEvent::InactivityTimeout)?;
        self.store.update_session(&session).await?;
        tracing::info!(
            session_id = %session.id,
            idle_secs = (at - session.last_activity_at).num_seconds(),
            "Session closed after inactivity"
        );
        Ok(session)
    }
}

fn advance(session: &Session, event: SessionEvent, at: DateTime<Utc>) -> Result<Session> {
    let mut next = session.clone();
    next.status = next_status(session.status, event)?;
    next.last_activity_at = session.last_activity_at.max(at);
    Ok(next)
}

fn log_change(session: &Session, from: SessionStatus, event: SessionEvent) {
    if from != session.status {
        tracing::info!(
            session_id = %session.id,
            from = from.as_str(),
            to = session.status.as_str(),
            event = event.as_str(),
            "Session status changed"
        );
    }
}
