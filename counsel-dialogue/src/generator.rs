//! Generation capability.

use crate::types::{ContextWindow, Role, SafetyVerdict, TurnDraft};
use async_trait::async_trait;
use chrono::Utc;

/// Instruction placed before the user turns when asking for a title.
pub const TITLE_INSTRUCTION: &str = "Summarise the topic of the following conversation in at \
    most six words. Reply with the title only. If there is not enough to go on, reply exactly \
    \"No Title Yet\".";

/// Response generator backing the assistant.
///
/// Implementations are fallible and may be slow; the session manager bounds
/// every call with its own timeout.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generator name (e.g., "openai", "mock").
    fn name(&self) -> &str;

    /// Produce the assistant reply for the last turn of `context`.
    async fn generate(&self, context: &ContextWindow) -> anyhow::Result<String>;

    /// Produce a short title from the opening user messages.
    ///
    /// The default asks [`Generator::generate`] with a system instruction
    /// followed by the messages.
    async fn generate_title(&self, session_id: &str, user_texts: &[String]) -> anyhow::Result<String> {
        let now = Utc::now();
        let mut drafts = vec![TurnDraft {
            role: Role::System,
            text: TITLE_INSTRUCTION.to_string(),
            timestamp: now,
            verdict: SafetyVerdict::clear(),
            summary: None,
        }];
        drafts.extend(
            user_texts
                .iter()
                .map(|text| TurnDraft::user(text.clone(), now, SafetyVerdict::clear())),
        );

        let context = ContextWindow {
            session_id: session_id.to_string(),
            turns: drafts
                .into_iter()
                .enumerate()
                .map(|(i, draft)| draft.into_turn(session_id, i as u64 + 1))
                .collect(),
        };
        self.generate(&context).await
    }

    /// Warm up the generator (e.g., pre-connect).
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoGenerator;

    #[async_trait]
    impl Generator for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, context: &ContextWindow) -> anyhow::Result<String> {
            let texts: Vec<&str> = context.turns.iter().map(|t| t.text.as_str()).collect();
            Ok(texts.join("|"))
        }
    }

    #[tokio::test]
    async fn default_title_prompt_leads_with_instruction() {
        let generator = EchoGenerator;
        let title = generator
            .generate_title("s1", &["exams".to_string(), "stress".to_string()])
            .await
            .unwrap();
        assert_eq!(title, format!("{TITLE_INSTRUCTION}|exams|stress"));
    }

    #[tokio::test]
    async fn warmup_default_succeeds() {
        assert!(EchoGenerator.warmup().await.is_ok());
        assert_eq!(EchoGenerator.name(), "echo");
    }
}
