//! services/api/src/chat/gateway.rs
//!
//! Bounded, non-retrying access to the text generation provider.

use research_assistant_core::ports::{GeneratedText, Prompt, TextGenerationService};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// The only failure callers ever see. Timeouts and provider errors are
/// indistinguishable; the raw cause is logged here and nowhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("text generation failed")]
pub struct GenerationFailure;

pub struct GenerationGateway {
    provider: Arc<dyn TextGenerationService>,
    timeout: Duration,
}

impl GenerationGateway {
    pub fn new(provider: Arc<dyn TextGenerationService>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub async fn generate(&self, prompt: &Prompt) -> Result<GeneratedText, GenerationFailure> {
        match tokio::time::timeout(self.timeout, self.provider.generate(prompt)).await {
            Ok(Ok(generated)) => Ok(generated),
            Ok(Err(e)) => {
                error!(error = %e, "Generation provider returned an error");
                Err(GenerationFailure)
            }
            Err(_) => {
                error!(timeout_ms = self.timeout.as_millis() as u64, "Generation provider timed out");
                Err(GenerationFailure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use research_assistant_core::ports::{PortError, PortResult};

    struct Slow;

    #[async_trait]
    impl TextGenerationService for Slow {
        async fn generate(&self, _prompt: &Prompt) -> PortResult<GeneratedText> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(GeneratedText {
                text: "too late".into(),
                token_count: 1,
                model: "slow".into(),
            })
        }
    }

    struct Broken;

    #[async_trait]
    impl TextGenerationService for Broken {
        async fn generate(&self, _prompt: &Prompt) -> PortResult<GeneratedText> {
            Err(PortError::Unexpected("upstream 503".into()))
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            instructions: String::new(),
            query: "hi".into(),
        }
    }

    #[tokio::test]
    async fn timeout_and_error_look_the_same() {
        let slow = GenerationGateway::new(Arc::new(Slow), Duration::from_millis(20));
        let broken = GenerationGateway::new(Arc::new(Broken), Duration::from_secs(1));

        assert_eq!(slow.generate(&prompt()).await, Err(GenerationFailure));
        assert_eq!(broken.generate(&prompt()).await, Err(GenerationFailure));
    }
}
