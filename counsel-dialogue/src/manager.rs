//! Session Manager: the per-message pipeline.
//!
//! Every inbound message runs to completion under its session's lock.
//! Each turn is written together with the status change it causes, so a
//! dropped request or a failed write never leaves a logged turn without its
//! transition:
//!
//! 1. resolve or create the session (inactivity checked lazily)
//! 2. reject if the session is closed
//! 3. classify inbound text; on `Blocked` log it, escalate, return safe-harbor
//! 4. append the inbound turn
//! 5. assemble the context window
//! 6. generate under a timeout; on failure return an apology, nothing else changes
//! 7. classify outbound text; on `Blocked` substitute safe-harbor and escalate
//! 8. append the assistant turn
//! 9. return the reply and the session status

use crate::context::ContextAssembler;
use crate::error::{DialogueError, Result};
use crate::generator::Generator;
use crate::log::MessageLog;
use crate::safety::SafetyTriage;
use crate::state::{validate_session_id, SessionEvent, SessionStateMachine};
use crate::store::SessionStore;
use crate::types::{Role, SafetyVerdict, Session, SessionStatus, Turn, TurnDraft};
use chrono::{DateTime, Utc};
use counsel_common::{DialogueConfig, SafetyConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::Instrument;

/// Title used when no better one can be generated.
pub const DEFAULT_TITLE: &str = "New Conversation";

/// Generator answer meaning "not enough context for a title".
const NO_TITLE_YET: &str = "No Title Yet";

/// Number of opening user turns a title is built from.
const TITLE_TURNS: usize = 4;

/// An inbound user message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Existing session, or `None` to start a new one
    pub session_id: Option<String>,
    /// Owner recorded when the session is created
    pub user_id: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(session_id: Option<String>, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            session_id,
            user_id: None,
            text: text.into(),
            timestamp,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// How the reply text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// Generated text, released as-is.
    Generated,
    /// Inbound or outbound content was blocked.
    SafeHarbor,
    /// Generation failed or timed out.
    Apology,
}

/// Result of handling one inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub session_id: String,
    pub text: String,
    pub status: SessionStatus,
    pub inbound: SafetyVerdict,
    /// Verdict on the generated text; `None` when nothing was generated
    pub outbound: Option<SafetyVerdict>,
    pub outcome: ReplyOutcome,
}

impl Reply {
    /// Whether either side of the exchange was flagged for review.
    pub fn needs_review(&self) -> bool {
        self.inbound.is_sensitive() || self.outbound.as_ref().is_some_and(SafetyVerdict::is_sensitive)
    }
}

/// Per-session mutual exclusion.
///
/// Entries are weak so the map only holds sessions that are in use.
#[derive(Default)]
struct SessionLocks {
    locks: std::sync::Mutex<HashMap<String, Weak<Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get(session_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    locks.retain(|_, weak| weak.strong_count() > 0);
                    let lock = Arc::new(Mutex::new(()));
                    locks.insert(session_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }
}

/// Public entry point of the dialogue core.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn Generator>,
    log: MessageLog,
    triage: SafetyTriage,
    assembler: ContextAssembler,
    states: SessionStateMachine,
    locks: SessionLocks,
    safe_harbor_reply: String,
    apology_reply: String,
    generation_timeout: Duration,
    summary_chars: usize,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn Generator>,
        dialogue: &DialogueConfig,
        safety: &SafetyConfig,
    ) -> anyhow::Result<Self> {
        let log = MessageLog::new(Arc::clone(&store));
        let assembler = ContextAssembler::new(
            log.clone(),
            dialogue.context_window_turns,
            dialogue.context_window_chars,
        );
        let states = SessionStateMachine::new(Arc::clone(&store), dialogue.inactivity_timeout());

        Ok(Self {
            store,
            generator,
            log,
            triage: SafetyTriage::new(safety)?,
            assembler,
            states,
            locks: SessionLocks::default(),
            safe_harbor_reply: dialogue.safe_harbor_reply.clone(),
            apology_reply: dialogue.apology_reply.clone(),
            generation_timeout: dialogue.generation_timeout(),
            summary_chars: dialogue.summary_chars,
        })
    }

    /// Name of the storage backend.
    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    /// Name of the generation backend.
    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }

    /// Handle a message for `session_id` (or a new session).
    pub async fn handle_message(
        &self,
        session_id: Option<&str>,
        text: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Reply> {
        self.handle(InboundMessage::new(session_id.map(str::to_string), text, timestamp))
            .await
    }

    /// Run the full pipeline for one inbound message.
    ///
    /// Safety outcomes and generation failures are successful replies;
    /// errors are reserved for closed sessions, bad input, and storage.
    pub async fn handle(&self, msg: InboundMessage) -> Result<Reply> {
        let session_id = match &msg.session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let span = tracing::info_span!("session", session_id = %session_id);
        async {
            let _guard = self.locks.acquire(&session_id).await;
            self.process(&session_id, msg).await.inspect_err(log_failure)
        }
        .instrument(span)
        .await
    }

    async fn process(&self, session_id: &str, msg: InboundMessage) -> Result<Reply> {
        let text = msg.text.trim();
        if text.is_empty() {
            return Err(DialogueError::InvalidInput(
                "message text must not be empty".to_string(),
            ));
        }
        let at = msg.timestamp;

        let mut session = self
            .states
            .open(Some(session_id), msg.user_id.as_deref(), at)
            .await?;
        if session.status == SessionStatus::Closed {
            tracing::info!("Message rejected: session closed");
            return Err(DialogueError::SessionClosed(session_id.to_string()));
        }

        let inbound = self.triage.classify(text);
        let draft = TurnDraft::user(text, at, inbound.clone());

        if inbound.is_blocked() {
            tracing::warn!(
                reason = inbound.reason.as_deref().unwrap_or_default(),
                chars = text.chars().count(),
                "Inbound message blocked"
            );
            let (_, status) = self
                .states
                .record(&mut session, SessionEvent::SafetyBlocked, &draft, at)
                .await?;
            return Ok(self.safe_harbor(session_id, status, inbound, None));
        }
        if inbound.is_sensitive() {
            tracing::info!(
                reason = inbound.reason.as_deref().unwrap_or_default(),
                "Inbound message flagged sensitive"
            );
        }

        let (sequence, status) = self
            .states
            .record(&mut session, SessionEvent::Message, &draft, at)
            .await?;

        let new_turn = draft.into_turn(session_id, sequence);
        let context = self.assembler.build(session_id, &new_turn).await?;

        let Some(generated) = self.generate(&context).await else {
            return Ok(Reply {
                session_id: session_id.to_string(),
                text: self.apology_reply.clone(),
                status,
                inbound,
                outbound: None,
                outcome: ReplyOutcome::Apology,
            });
        };

        let outbound = self.triage.classify(&generated);
        let replied_at = Utc::now().max(at);

        if outbound.is_blocked() {
            tracing::warn!(
                reason = outbound.reason.as_deref().unwrap_or_default(),
                chars = generated.chars().count(),
                "Generated reply blocked"
            );
            let substitute = TurnDraft::assistant(
                self.safe_harbor_reply.as_str(),
                replied_at,
                outbound.clone(),
                self.summary_chars,
            );
            let (_, status) = self
                .states
                .record(&mut session, SessionEvent::SafetyBlocked, &substitute, at)
                .await?;
            return Ok(self.safe_harbor(session_id, status, inbound, Some(outbound)));
        }
        if outbound.is_sensitive() {
            tracing::info!(
                reason = outbound.reason.as_deref().unwrap_or_default(),
                "Generated reply flagged sensitive"
            );
        }

        let reply = TurnDraft::assistant(
            generated.as_str(),
            replied_at,
            outbound.clone(),
            self.summary_chars,
        );
        let sequence = self.log.append(session_id, &reply).await?;
        tracing::debug!(sequence, status = status.as_str(), "Reply recorded");

        Ok(Reply {
            session_id: session_id.to_string(),
            text: generated,
            status,
            inbound,
            outbound: Some(outbound),
            outcome: ReplyOutcome::Generated,
        })
    }

    /// Call the generator under the configured timeout. `None` on any failure.
    async fn generate(&self, context: &crate::types::ContextWindow) -> Option<String> {
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(self.generation_timeout, self.generator.generate(context)).await;

        match result {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                tracing::debug!(
                    generator = self.generator.name(),
                    turns = context.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reply generated"
                );
                Some(text.trim().to_string())
            }
            Ok(Ok(_)) => {
                tracing::warn!(generator = self.generator.name(), "Generator returned an empty reply");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(generator = self.generator.name(), error = %e, "Generation failed");
                None
            }
            Err(_) => {
                tracing::warn!(
                    generator = self.generator.name(),
                    timeout_secs = self.generation_timeout.as_secs_f64(),
                    "Generation timed out"
                );
                None
            }
        }
    }

    fn safe_harbor(
        &self,
        session_id: &str,
        status: SessionStatus,
        inbound: SafetyVerdict,
        outbound: Option<SafetyVerdict>,
    ) -> Reply {
        Reply {
            session_id: session_id.to_string(),
            text: self.safe_harbor_reply.clone(),
            status,
            inbound,
            outbound,
            outcome: ReplyOutcome::SafeHarbor,
        }
    }

    /// End the conversation. Closed is terminal.
    pub async fn close(&self, session_id: &str, at: DateTime<Utc>) -> Result<SessionStatus> {
        self.signal(session_id, SessionEvent::Close, at).await
    }

    /// Mark the session for handling outside the automated flow.
    pub async fn escalate(&self, session_id: &str, at: DateTime<Utc>) -> Result<SessionStatus> {
        self.signal(session_id, SessionEvent::Escalate, at).await
    }

    /// Lift an escalation. Only valid while `Escalated`.
    pub async fn clear(&self, session_id: &str, at: DateTime<Utc>) -> Result<SessionStatus> {
        self.signal(session_id, SessionEvent::Clear, at).await
    }

    async fn signal(
        &self,
        session_id: &str,
        event: SessionEvent,
        at: DateTime<Utc>,
    ) -> Result<SessionStatus> {
        let span = tracing::info_span!("session", session_id = %session_id, event = event.as_str());
        async {
            let _guard = self.locks.acquire(session_id).await;
            self.states
                .transition(session_id, event, at)
                .await
                .inspect_err(log_failure)
        }
        .instrument(span)
        .await
    }

    /// Session record as of `at`, after the inactivity check.
    pub async fn get_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<Option<Session>> {
        let _guard = self.locks.acquire(session_id).await;
        self.states.find(session_id, at).await
    }

    /// Stored sessions, newest activity first, optionally for one owner.
    pub async fn list_sessions(&self, user_id: Option<&str>) -> Result<Vec<Session>> {
        self.store.list_sessions(user_id).await
    }

    /// Read the Message Log of a session.
    pub async fn read_turns(
        &self,
        session_id: &str,
        limit: Option<usize>,
        since: Option<u64>,
    ) -> Result<Vec<Turn>> {
        self.log.read(session_id, limit, since).await
    }

    /// Remove a session and its turns. Returns false if it did not exist.
    pub async fn delete_session(&self, session_id: &str) -> Result<bool> {
        let _guard = self.locks.acquire(session_id).await;
        let removed = self.store.delete_session(session_id).await?;
        if removed {
            tracing::info!(session_id, "Session deleted");
        }
        Ok(removed)
    }

    /// Regenerate the session title from its opening user turns.
    ///
    /// Blocked turns are never sent to the generator. Falls back to
    /// [`DEFAULT_TITLE`] when there is nothing to title or generation fails.
    pub async fn retitle(&self, session_id: &str) -> Result<Session> {
        let span = tracing::info_span!("session", session_id = %session_id);
        async {
            let _guard = self.locks.acquire(session_id).await;

            let opening: Vec<String> = self
                .log
                .read(session_id, None, None)
                .await?
                .into_iter()
                .filter(|t| t.role == Role::User && !t.verdict.is_blocked())
                .take(TITLE_TURNS)
                .map(|t| t.text)
                .collect();

            let title = if opening.is_empty() {
                DEFAULT_TITLE.to_string()
            } else {
                self.generate_title(session_id, &opening).await
            };

            self.states.set_title(session_id, &title).await
        }
        .instrument(span)
        .await
    }

    async fn generate_title(&self, session_id: &str, opening: &[String]) -> String {
        let result = tokio::time::timeout(
            self.generation_timeout,
            self.generator.generate_title(session_id, opening),
        )
        .await;

        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Title generation failed");
                return DEFAULT_TITLE.to_string();
            }
            Err(_) => {
                tracing::warn!("Title generation timed out");
                return DEFAULT_TITLE.to_string();
            }
        };

        let title = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        if title.is_empty()
            || title.eq_ignore_ascii_case(NO_TITLE_YET)
            || self.triage.classify(title).is_blocked()
        {
            DEFAULT_TITLE.to_string()
        } else {
            title.to_string()
        }
    }
}

fn log_failure(e: &DialogueError) {
    match e {
        DialogueError::Storage(_) | DialogueError::UnknownSession(_) => {
            tracing::error!(error = %e, "Dialogue request failed")
        }
        DialogueError::InvalidTransition { .. } | DialogueError::SequenceConflict { .. } => {
            tracing::warn!(error = %e, "Dialogue request rejected")
        }
        DialogueError::SessionClosed(_) | DialogueError::InvalidInput(_) => {
            tracing::debug!(error = %e, "Dialogue request refused")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;
    use crate::types::ContextWindow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[derive(Default)]
    struct CountingGenerator {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for CountingGenerator {
        fn name(&self) -> &str {
            "counting"
        }

        async fn generate(&self, context: &ContextWindow) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("reply to turn {}", context.latest().map_or(0, |t| t.sequence)))
        }
    }

    fn manager(generator: Arc<dyn Generator>) -> SessionManager {
        SessionManager::new(
            Arc::new(InMemorySessionStore::new()),
            generator,
            &DialogueConfig::default(),
            &SafetyConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn locks_are_released_after_use() {
        let locks = SessionLocks::default();
        {
            let _a = locks.acquire("a").await;
            let _b = locks.acquire("b").await;
            assert_eq!(locks.tracked(), 2);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn same_session_lock_is_exclusive() {
        let locks = Arc::new(SessionLocks::default());
        let guard = locks.acquire("s1").await;

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("s1").await;
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn conversation_alternates_user_and_assistant() {
        let generator = Arc::new(CountingGenerator::default());
        let manager = manager(generator.clone());

        let first = manager.handle_message(Some("s1"), "Hello there", ts(0)).await.unwrap();
        assert_eq!(first.text, "reply to turn 1");
        assert_eq!(first.outcome, ReplyOutcome::Generated);

        let second = manager.handle_message(Some("s1"), "Thanks", ts(10)).await.unwrap();
        assert_eq!(second.text, "reply to turn 3");

        let turns = manager.read_turns("s1", None, None).await.unwrap();
        let roles: Vec<Role> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::User, Role::Assistant]);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);

        let session = manager.get_session("s1", ts(10)).await.unwrap().unwrap();
        assert_eq!(session.turn_count, 4);
        assert_eq!(session.last_activity_at, ts(10));
    }

    #[tokio::test]
    async fn missing_session_id_starts_new_session() {
        let manager = manager(Arc::new(CountingGenerator::default()));
        let reply = manager.handle_message(None, "hi", ts(0)).await.unwrap();
        assert!(uuid::Uuid::parse_str(&reply.session_id).is_ok());
        assert_eq!(reply.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn empty_text_is_invalid_input() {
        let manager = manager(Arc::new(CountingGenerator::default()));
        assert!(matches!(
            manager.handle_message(Some("s1"), "   ", ts(0)).await,
            Err(DialogueError::InvalidInput(_))
        ));
        assert!(matches!(
            manager.handle_message(Some("bad id!"), "hello", ts(0)).await,
            Err(DialogueError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn sensitive_inbound_is_flagged_but_answered() {
        let manager = manager(Arc::new(CountingGenerator::default()));
        let reply = manager
            .handle_message(Some("s1"), "I feel hopeless about my grades", ts(0))
            .await
            .unwrap();

        assert_eq!(reply.outcome, ReplyOutcome::Generated);
        assert_eq!(reply.inbound, SafetyVerdict::sensitive("distress"));
        assert!(reply.needs_review());
        assert_eq!(reply.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn escalation_can_be_cleared() {
        let manager = manager(Arc::new(CountingGenerator::default()));
        manager.handle_message(Some("s1"), "hi", ts(0)).await.unwrap();

        assert_eq!(manager.escalate("s1", ts(1)).await.unwrap(), SessionStatus::Escalated);
        let reply = manager.handle_message(Some("s1"), "still there?", ts(2)).await.unwrap();
        assert_eq!(reply.status, SessionStatus::Escalated);

        assert_eq!(manager.clear("s1", ts(3)).await.unwrap(), SessionStatus::Active);
        assert!(matches!(
            manager.clear("s1", ts(4)).await,
            Err(DialogueError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let manager = manager(Arc::new(CountingGenerator::default()));
        manager.handle_message(Some("s1"), "hi", ts(0)).await.unwrap();

        assert!(manager.delete_session("s1").await.unwrap());
        assert!(manager.get_session("s1", ts(0)).await.unwrap().is_none());
        assert!(!manager.delete_session("s1").await.unwrap());
    }

    #[tokio::test]
    async fn retitle_without_user_turns_uses_default() {
        let store = Arc::new(InMemorySessionStore::new());
        store.create_session(&Session::new("s1", None, ts(0))).await.unwrap();
        let manager = SessionManager::new(
            store,
            Arc::new(CountingGenerator::default()),
            &DialogueConfig::default(),
            &SafetyConfig::default(),
        )
        .unwrap();

        let session = manager.retitle("s1").await.unwrap();
        assert_eq!(session.title.as_deref(), Some(DEFAULT_TITLE));
    }
}
