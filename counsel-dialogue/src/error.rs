//! Error taxonomy of the dialogue core.
//!
//! Safety outcomes and generation failures are not errors: they surface as
//! [`crate::Reply`] values. Everything here aborts the request.

use crate::state::SessionEvent;
use crate::types::SessionStatus;
use thiserror::Error;

/// Result type alias using the dialogue error type.
pub type Result<T> = std::result::Result<T, DialogueError>;

#[derive(Error, Debug)]
pub enum DialogueError {
    /// Append or read against a session that does not exist.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// The session is closed; the caller must start a new one.
    #[error("Session {0} is closed")]
    SessionClosed(String),

    /// The state machine does not allow this event in this state.
    #[error("Invalid transition: {event} while {from}")]
    InvalidTransition {
        from: SessionStatus,
        event: SessionEvent,
    },

    /// A retried append named a sequence number that is neither the next free
    /// slot nor an identical duplicate.
    #[error("Sequence conflict in session {session_id}: expected {expected}, got {got}")]
    SequenceConflict {
        session_id: String,
        expected: u64,
        got: u64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage backend failure; opaque to the caller.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl DialogueError {
    /// Whether the caller can recover by starting a new session.
    pub const fn is_session_closed(&self) -> bool {
        matches!(self, Self::SessionClosed(_))
    }
}

impl From<rusqlite::Error> for DialogueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for DialogueError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(format!("storage task failed: {e}"))
    }
}

impl From<DialogueError> for counsel_common::Error {
    fn from(e: DialogueError) -> Self {
        use counsel_common::Error;

        match e {
            DialogueError::SessionClosed(_) => Error::Gone(e.to_string()),
            DialogueError::InvalidTransition { .. } | DialogueError::SequenceConflict { .. } => {
                Error::Conflict(e.to_string())
            }
            DialogueError::InvalidInput(msg) => Error::InvalidInput(msg),
            DialogueError::UnknownSession(_) | DialogueError::Storage(_) => {
                Error::Internal(e.to_string())
            }
        }
    }
}
