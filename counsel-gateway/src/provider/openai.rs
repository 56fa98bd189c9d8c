//! OpenAI-compatible chat-completions generator.

use super::ProviderError;
use async_trait::async_trait;
use counsel_common::LlmConfig;
use counsel_dialogue::{ContextWindow, Generator, Role};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const PROVIDER: &str = "openai";

/// Generator backed by a `/v1/chat/completions` endpoint.
///
/// Works with OpenAI and any API that speaks the same format.
pub struct ChatCompletionsGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: Option<i64>,
    system_prompt: String,
}

impl ChatCompletionsGenerator {
    pub fn new(config: &LlmConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &config.api_key {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
        })
    }

    fn build_request(&self, context: &ContextWindow) -> ChatCompletionRequest {
        let mut messages = Vec::with_capacity(context.len() + 1);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage {
                role: Role::System.as_str().into(),
                content: self.system_prompt.clone(),
            });
        }
        messages.extend(context.turns.iter().map(|turn| ChatMessage {
            role: turn.role.as_str().into(),
            content: turn.context_text().to_string(),
        }));

        ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: Some(self.temperature),
        }
    }

    fn error(&self, message: String, status_code: Option<u16>) -> ProviderError {
        ProviderError {
            provider: PROVIDER.into(),
            model: self.model.clone(),
            message,
            status_code,
        }
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(&self, context: &ContextWindow) -> anyhow::Result<String> {
        let start = Instant::now();
        let url = format!("{}/v1/chat/completions", self.base_url);
        let request = self.build_request(context);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {e}"), None))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self
                .error(format!("API error: {body}"), Some(status.as_u16()))
                .into());
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| self.error(format!("Failed to parse response: {e}"), None))?;

        tracing::debug!(
            model = %parsed.model,
            latency_ms = start.elapsed().as_millis() as u64,
            total_tokens = parsed.usage.as_ref().map_or(0, |u| u.total_tokens),
            "Chat completion received"
        );

        Ok(parsed.into_content())
    }
}

// ============================================================================
// Chat Completions API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

impl ChatCompletionResponse {
    fn into_content(self) -> String {
        self.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    total_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use counsel_dialogue::{SafetyVerdict, TurnDraft};

    fn generator() -> ChatCompletionsGenerator {
        ChatCompletionsGenerator::new(&LlmConfig {
            base_url: "http://localhost:8080/".into(),
            api_key: Some("test-key".into()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn request_leads_with_system_prompt() {
        let now = Utc::now();
        let context = ContextWindow {
            session_id: "s1".into(),
            turns: vec![
                TurnDraft::user("How do I pick electives?", now, SafetyVerdict::clear())
                    .into_turn("s1", 1),
                TurnDraft::assistant("x".repeat(300), now, SafetyVerdict::clear(), 20)
                    .into_turn("s1", 2),
                TurnDraft::user("Thanks!", now, SafetyVerdict::clear()).into_turn("s1", 3),
            ],
        };

        let generator = generator();
        let request = generator.build_request(&context);
        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(request.messages[0].content, LlmConfig::default().system_prompt);
        // Assistant history goes out as its summary.
        assert_eq!(request.messages[2].content.chars().count(), 23);
        assert_eq!(generator.base_url, "http://localhost:8080");
    }

    #[test]
    fn request_serialization_skips_unset_max_tokens() {
        let context = ContextWindow {
            session_id: "s1".into(),
            turns: vec![],
        };
        let json = serde_json::to_value(generator().build_request(&context)).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn response_content_is_extracted() {
        let body = r#"{
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "Try a study plan."}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.into_content(), "Try a study plan.");
    }

    #[test]
    fn empty_choices_yield_empty_text() {
        let parsed: ChatCompletionResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert_eq!(parsed.into_content(), "");
    }
}
