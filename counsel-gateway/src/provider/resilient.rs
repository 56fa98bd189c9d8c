//! Retry wrapper for generators.
//!
//! Failed calls are retried with exponential backoff. Errors a backend marks
//! as permanent (see [`ProviderError::is_retryable`]) fail immediately.

use super::ProviderError;
use async_trait::async_trait;
use counsel_common::LlmConfig;
use counsel_dialogue::{ContextWindow, Generator};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry behaviour.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds (doubles with each retry).
    pub base_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 250,
            max_backoff_ms: 10_000,
        }
    }
}

impl From<&LlmConfig> for RetryConfig {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff_ms: config.base_backoff_ms,
            ..Default::default()
        }
    }
}

/// Wraps a generator with retry and exponential backoff.
///
/// The session manager's generation timeout bounds the whole sequence,
/// retries included.
pub struct RetryingGenerator {
    inner: Arc<dyn Generator>,
    config: RetryConfig,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn Generator>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let delay_ms = self
            .config
            .base_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.config.max_backoff_ms);
        Duration::from_millis(delay_ms)
    }

    async fn with_retries<F, Fut>(&self, mut call: F) -> anyhow::Result<String>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = anyhow::Result<String>> + Send,
    {
        let backend = self.inner.name();
        let mut attempt = 0;

        loop {
            match call().await {
                Ok(text) => {
                    if attempt > 0 {
                        tracing::info!(
                            generator = backend,
                            attempt = attempt + 1,
                            "Generator recovered after retries"
                        );
                    }
                    return Ok(text);
                }
                Err(e) => {
                    let permanent = e
                        .downcast_ref::<ProviderError>()
                        .is_some_and(|pe| !pe.is_retryable());
                    if permanent || attempt >= self.config.max_retries {
                        return Err(e.context(format!(
                            "{backend} failed after {} attempt(s)",
                            attempt + 1
                        )));
                    }

                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        generator = backend,
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generator call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl Generator for RetryingGenerator {
    fn name(&self) -> &str {
        "retrying"
    }

    async fn generate(&self, context: &ContextWindow) -> anyhow::Result<String> {
        self.with_retries(|| self.inner.generate(context)).await
    }

    async fn generate_title(&self, session_id: &str, user_texts: &[String]) -> anyhow::Result<String> {
        self.with_retries(|| self.inner.generate_title(session_id, user_texts))
            .await
    }

    async fn warmup(&self) -> anyhow::Result<()> {
        self.inner.warmup().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyGenerator {
        calls: AtomicUsize,
        fail_until: usize,
        status_code: Option<u16>,
    }

    impl FlakyGenerator {
        fn new(fail_until: usize, status_code: Option<u16>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_until,
                status_code,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for FlakyGenerator {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(&self, _context: &ContextWindow) -> anyhow::Result<String> {
            let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_until {
                return Err(ProviderError {
                    provider: "flaky".into(),
                    model: "test-model".into(),
                    message: "unavailable".into(),
                    status_code: self.status_code,
                }
                .into());
            }
            Ok("recovered".to_string())
        }
    }

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_backoff_ms: 1,
            max_backoff_ms: 10,
        }
    }

    fn context() -> ContextWindow {
        ContextWindow {
            session_id: "s1".into(),
            turns: vec![],
        }
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let flaky = FlakyGenerator::new(0, Some(500));
        let retrying = RetryingGenerator::new(flaky.clone(), fast(2));

        assert_eq!(retrying.generate(&context()).await.unwrap(), "recovered");
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let flaky = FlakyGenerator::new(2, Some(503));
        let retrying = RetryingGenerator::new(flaky.clone(), fast(2));

        assert_eq!(retrying.generate(&context()).await.unwrap(), "recovered");
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let flaky = FlakyGenerator::new(usize::MAX, None);
        let retrying = RetryingGenerator::new(flaky.clone(), fast(1));

        let err = retrying.generate(&context()).await.unwrap_err();
        assert!(err.to_string().contains("flaky failed after 2 attempt(s)"));
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let flaky = FlakyGenerator::new(usize::MAX, Some(401));
        let retrying = RetryingGenerator::new(flaky.clone(), fast(3));

        assert!(retrying.generate(&context()).await.is_err());
        assert_eq!(flaky.calls(), 1);
    }

    #[tokio::test]
    async fn title_generation_is_retried() {
        let flaky = FlakyGenerator::new(1, Some(502));
        let retrying = RetryingGenerator::new(flaky.clone(), fast(2));

        let title = retrying.generate_title("s1", &["exams".to_string()]).await.unwrap();
        assert_eq!(title, "recovered");
        assert_eq!(flaky.calls(), 2);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retrying = RetryingGenerator::new(
            FlakyGenerator::new(0, None),
            RetryConfig {
                max_retries: 10,
                base_backoff_ms: 100,
                max_backoff_ms: 500,
            },
        );

        assert_eq!(retrying.backoff_delay(0).as_millis(), 100);
        assert_eq!(retrying.backoff_delay(1).as_millis(), 200);
        assert_eq!(retrying.backoff_delay(2).as_millis(), 400);
        assert_eq!(retrying.backoff_delay(3).as_millis(), 500);
    }
}
