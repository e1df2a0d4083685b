use crate::gemini::{Content, GenerateResponse, GenerationConfig, ImageGenerator, ProviderError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            delay: Duration::from_secs(3),
        }
    }
}

/// Retries rate-limited generation calls on a fixed delay. Anything else
/// is returned after the first attempt.
#[derive(Clone)]
pub struct RetryClient {
    inner: Arc<dyn ImageGenerator>,
    policy: RetryPolicy,
}

impl RetryClient {
    pub fn new(inner: Arc<dyn ImageGenerator>, policy: RetryPolicy) -> Self {
        RetryClient { inner, policy }
    }

    #[instrument(name = "retry.generate", skip_all, fields(model = %model))]
    pub async fn generate(
        &self,
        credential: &str,
        model: &str,
        content: &Content,
        config: &GenerationConfig,
    ) -> Result<GenerateResponse, ProviderError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            info!(attempt, max_attempts, "Calling image provider");
            let err = match self.inner.generate(credential, model, content, config).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            if !err.is_rate_limited() {
                warn!(attempt, error = %err, "Provider call failed");
                return Err(err);
            }
            if attempt >= max_attempts {
                warn!(attempt, error = %err, "Provider still rate limited, giving up");
                return Err(ProviderError::Blocked {
                    attempts: attempt,
                    last: err.to_string(),
                });
            }

            warn!(
                attempt,
                delay_ms = self.policy.delay.as_millis() as u64,
                error = %err,
                "Provider rate limited, retrying"
            );
            tokio::time::sleep(self.policy.delay).await;
            attempt += 1;
        }
    }
}
