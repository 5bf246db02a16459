use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use weft_core::error::Result;
use weft_core::traits::LlmBackend;
use weft_core::types::{LlmRequest, LlmResponse};

use crate::{CircuitBreaker, CostTracker, RateLimiter};

/// An LLM backend wrapped by a circuit breaker, an optional rate limiter,
/// and cost accounting.
pub struct GuardedBackend {
    inner: Arc<dyn LlmBackend>,
    key: String,
    breaker: Arc<CircuitBreaker>,
    limiter: Option<Arc<RateLimiter>>,
    costs: Option<Arc<CostTracker>>,
}

impl GuardedBackend {
    /// `key` names the caller for rate limiting and cost attribution.
    pub fn new(inner: Arc<dyn LlmBackend>, key: impl Into<String>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            inner,
            key: key.into(),
            breaker,
            limiter: None,
            costs: None,
        }
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_cost_tracker(mut self, costs: Arc<CostTracker>) -> Self {
        self.costs = Some(costs);
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

impl LlmBackend for GuardedBackend {
    fn generate(&self, request: LlmRequest) -> BoxFuture<'_, Result<LlmResponse>> {
        Box::pin(async move {
            if let Some(limiter) = &self.limiter {
                limiter.wait_if_needed(&self.key)?;
            }
            let model = request.model.clone();
            let response = self
                .breaker
                .call(|| self.inner.generate(request))
                .await?;
            if let (Some(costs), Some(usage)) = (&self.costs, response.usage) {
                let cost = costs.record_usage(
                    &self.key,
                    &model,
                    usage.prompt_tokens,
                    usage.completion_tokens,
                );
                debug!(key = %self.key, model = %model, cost, "Recorded LLM usage");
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_core::error::WeftError;
    use weft_core::types::{ChatMessage, Usage};
    use weft_test_utils::ScriptedLlm;

    fn request() -> LlmRequest {
        LlmRequest {
            messages: vec![ChatMessage::user("hi")],
            model: "gpt-4".into(),
            temperature: 0.0,
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn records_cost_on_success() {
        let llm = Arc::new(ScriptedLlm::new().with_usage_text("ok", Usage::new(1_000_000, 0)));
        let costs = Arc::new(CostTracker::new());
        let guarded = GuardedBackend::new(
            llm,
            "writer",
            Arc::new(CircuitBreaker::new("writer", 3, Duration::from_secs(60))),
        )
        .with_cost_tracker(costs.clone());

        let resp = guarded.generate(request()).await.unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(costs.get_total_cost(Some("writer")), 30.0);
    }

    #[tokio::test]
    async fn breaker_opens_on_backend_errors() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .with_error("503 unavailable")
                .with_error("503 unavailable")
                .with_text("never reached"),
        );
        let guarded = GuardedBackend::new(
            llm.clone(),
            "writer",
            Arc::new(CircuitBreaker::new("writer", 2, Duration::from_secs(60))),
        );
        assert!(guarded.generate(request()).await.is_err());
        assert!(guarded.generate(request()).await.is_err());
        let err = guarded.generate(request()).await.unwrap_err();
        assert!(matches!(err, WeftError::CircuitOpen { .. }));
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn rate_limit_rejects_before_calling() {
        let llm = Arc::new(ScriptedLlm::new().with_text("a").with_text("b"));
        let guarded = GuardedBackend::new(
            llm.clone(),
            "writer",
            Arc::new(CircuitBreaker::new("writer", 2, Duration::from_secs(60))),
        )
        .with_rate_limiter(Arc::new(RateLimiter::new(1, Duration::from_secs(60))));
        guarded.generate(request()).await.unwrap();
        let err = guarded.generate(request()).await.unwrap_err();
        assert!(matches!(err, WeftError::RateLimited { .. }));
        assert_eq!(llm.call_count(), 1);
        assert_eq!(guarded.breaker().failure_count(), 0);
    }
}
