//! Counsel Dialogue - the dialogue session manager.
//!
//! Turns a stream of inbound user messages into a coherent, stateful
//! conversation:
//! - Message Log: append-only, gap-free ordered turns per session
//! - Safety Triage: classifies inbound and outbound text as clear, sensitive, or blocked
//! - Context Assembler: bounded window of recent turns passed to the generator
//! - Session State Machine: `Active`, `Escalated`, `Closed` lifecycle
//! - Session Manager: the per-message pipeline composing all of the above
//!
//! ## Pipeline
//!
//! ```text
//! inbound ─→ resolve session ─→ triage ─┬─ blocked ─→ log + escalate ─→ safe-harbor reply
//!                                       └─ clear/sensitive ─→ log ─→ context ─→ generate
//!                                                                                  │
//!            reply ←─ log ←─ triage (blocked → safe-harbor + escalate) ←───────────┘
//! ```
//!
//! Storage and generation are capabilities ([`SessionStore`], [`Generator`]);
//! the crate ships an in-memory and a SQLite store.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod context;
pub mod error;
pub mod generator;
pub mod log;
pub mod manager;
pub mod safety;
pub mod state;
pub mod store;
pub mod types;

pub use context::ContextAssembler;
pub use error::{DialogueError, Result};
pub use generator::Generator;
pub use log::MessageLog;
pub use manager::{InboundMessage, Reply, ReplyOutcome, SessionManager};
pub use safety::SafetyTriage;
pub use state::{SessionEvent, SessionStateMachine};
pub use store::{AppendOutcome, InMemorySessionStore, SessionStore, SqliteSessionStore};
pub use types::{
    ContextWindow, Role, SafetyLevel, SafetyVerdict, Session, SessionStatus, Turn, TurnDraft,
};
