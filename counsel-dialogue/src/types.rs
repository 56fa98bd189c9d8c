//! Session, turn, and verdict types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Session
// ============================================================================

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    /// Marked for handling outside the automated flow.
    Escalated,
    /// Terminal.
    Closed,
}

impl SessionStatus {
    /// Convert to string representation for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Escalated => "escalated",
            Self::Closed => "closed",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "escalated" => Some(Self::Escalated),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded, stateful conversation between one user and the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Owner, when the first message named one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Number of turns in the log; equal to the last sequence number
    pub turn_count: u64,
}

impl Session {
    /// Create a fresh `Active` session.
    pub fn new(id: impl Into<String>, user_id: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            user_id,
            title: None,
            status: SessionStatus::Active,
            created_at: at,
            last_activity_at: at,
            turn_count: 0,
        }
    }

    /// Whether the session has been idle longer than `timeout` at `now`.
    pub fn is_idle(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now - self.last_activity_at > timeout,
            Err(_) => false,
        }
    }
}

// ============================================================================
// Safety verdict
// ============================================================================

/// Outcome of safety triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyLevel {
    Clear,
    /// Allowed through, flagged for review.
    Sensitive,
    /// Never forwarded to the generator, never released to the user.
    Blocked,
}

impl SafetyLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Sensitive => "sensitive",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "clear" => Some(Self::Clear),
            "sensitive" => Some(Self::Sensitive),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

/// Safety verdict attached to a turn at creation; never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub level: SafetyLevel,
    /// Risk category that triggered the verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn clear() -> Self {
        Self {
            level: SafetyLevel::Clear,
            reason: None,
        }
    }

    pub fn sensitive(reason: impl Into<String>) -> Self {
        Self {
            level: SafetyLevel::Sensitive,
            reason: Some(reason.into()),
        }
    }

    pub fn blocked(reason: impl Into<String>) -> Self {
        Self {
            level: SafetyLevel::Blocked,
            reason: Some(reason.into()),
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.level == SafetyLevel::Blocked
    }

    pub fn is_sensitive(&self) -> bool {
        self.level == SafetyLevel::Sensitive
    }
}

impl Default for SafetyVerdict {
    fn default() -> Self {
        Self::clear()
    }
}

// ============================================================================
// Turn
// ============================================================================

/// Message role in a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Convert to string representation for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// One recorded message within a session. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: String,
    /// Monotonic, gap-free, starting at 1
    pub sequence: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub verdict: SafetyVerdict,
    /// Short form of an assistant reply, used when assembling context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Turn {
    /// Text used when this turn is placed in a context window.
    ///
    /// Assistant turns contribute their summary when one is stored.
    pub fn context_text(&self) -> &str {
        match (self.role, &self.summary) {
            (Role::Assistant, Some(summary)) => summary,
            _ => &self.text,
        }
    }

    /// Character length of [`Turn::context_text`].
    pub fn context_chars(&self) -> usize {
        self.context_text().chars().count()
    }
}

/// A turn before the Message Log has assigned its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDraft {
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub verdict: SafetyVerdict,
    pub summary: Option<String>,
}

impl TurnDraft {
    pub fn user(text: impl Into<String>, timestamp: DateTime<Utc>, verdict: SafetyVerdict) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            timestamp,
            verdict,
            summary: None,
        }
    }

    /// An assistant reply, summarised to at most `summary_chars` characters.
    pub fn assistant(
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
        verdict: SafetyVerdict,
        summary_chars: usize,
    ) -> Self {
        let text = text.into();
        let summary = Some(summarize(&text, summary_chars));
        Self {
            role: Role::Assistant,
            text,
            timestamp,
            verdict,
            summary,
        }
    }

    /// Whether `turn` records the same message as this draft.
    pub fn matches(&self, turn: &Turn) -> bool {
        self.role == turn.role && self.text == turn.text
    }

    pub fn into_turn(self, session_id: impl Into<String>, sequence: u64) -> Turn {
        Turn {
            session_id: session_id.into(),
            sequence,
            role: self.role,
            text: self.text,
            timestamp: self.timestamp,
            verdict: self.verdict,
            summary: self.summary,
        }
    }
}

/// Truncate `text` to `max_chars` characters, marking the cut with "...".
pub fn summarize(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let mut summary: String = text.chars().take(max_chars).collect();
    summary.push_str("...");
    summary
}

// ============================================================================
// Context window
// ============================================================================

/// Ordered turns selected for one generation call. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextWindow {
    pub session_id: String,
    pub turns: Vec<Turn>,
}

impl ContextWindow {
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Total characters the window contributes to a prompt.
    pub fn total_chars(&self) -> usize {
        self.turns.iter().map(Turn::context_chars).sum()
    }

    /// The turn that prompted this generation.
    pub fn latest(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn status_roundtrip() {
        for status in [SessionStatus::Active, SessionStatus::Escalated, SessionStatus::Closed] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("archived"), None);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&SessionStatus::Escalated).unwrap(), "\"escalated\"");
    }

    #[test]
    fn role_parse_rejects_unknown() {
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn session_idle_detection() {
        let session = Session::new("s1", None, ts(1_000));
        let timeout = std::time::Duration::from_secs(60);
        assert!(!session.is_idle(ts(1_060), timeout));
        assert!(session.is_idle(ts(1_061), timeout));
    }

    #[test]
    fn verdict_serialization_omits_empty_reason() {
        let json = serde_json::to_string(&SafetyVerdict::clear()).unwrap();
        assert_eq!(json, r#"{"level":"clear"}"#);

        let json = serde_json::to_string(&SafetyVerdict::blocked("self_harm")).unwrap();
        assert_eq!(json, r#"{"level":"blocked","reason":"self_harm"}"#);
    }

    #[test]
    fn summarize_truncates_long_text() {
        assert_eq!(summarize("short reply", 200), "short reply");

        let long = "a".repeat(250);
        let summary = summarize(&long, 200);
        assert_eq!(summary.chars().count(), 203);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn summarize_counts_characters_not_bytes() {
        let text = "é".repeat(10);
        assert_eq!(summarize(&text, 10), text);
        assert_eq!(summarize(&text, 4), "éééé...");
    }

    #[test]
    fn assistant_context_text_prefers_summary() {
        let draft = TurnDraft::assistant("x".repeat(50), ts(0), SafetyVerdict::clear(), 10);
        let turn = draft.into_turn("s1", 2);
        assert_eq!(turn.context_text(), format!("{}...", "x".repeat(10)));
        assert_eq!(turn.context_chars(), 13);

        let user = TurnDraft::user("hello", ts(0), SafetyVerdict::clear()).into_turn("s1", 1);
        assert_eq!(user.context_text(), "hello");
    }

    #[test]
    fn draft_matches_same_role_and_text() {
        let draft = TurnDraft::user("hi", ts(5), SafetyVerdict::clear());
        let turn = draft.clone().into_turn("s1", 1);
        assert!(draft.matches(&turn));

        let other = TurnDraft::user("hello", ts(5), SafetyVerdict::clear());
        assert!(!other.matches(&turn));
    }
}
