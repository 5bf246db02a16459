use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use weft_core::config::CircuitBreakerConfig;
use weft_core::error::{Result, WeftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Decides whether an error counts against the circuit.
pub type FailurePredicate = Arc<dyn Fn(&WeftError) -> bool + Send + Sync>;

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Fail-fast guard around one external dependency.
///
/// Closed -> Open after `failure_threshold` consecutive counted failures.
/// Open rejects calls until `recovery_timeout` has passed since the last
/// failure, then lets the next call through as HalfOpen. HalfOpen closes
/// after `success_threshold` consecutive successes and reopens on any
/// counted failure.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    is_failure: FailurePredicate,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            success_threshold: 2,
            recovery_timeout,
            is_failure: Arc::new(|_| true),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.recovery_timeout())
        .with_success_threshold(config.success_threshold)
    }

    pub fn with_success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n.max(1);
        self
    }

    /// Only errors matching the predicate count as failures; others pass
    /// through without touching the circuit.
    pub fn with_failure_predicate(
        mut self,
        pred: impl Fn(&WeftError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_failure = Arc::new(pred);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Admit or reject a call, moving Open -> HalfOpen once recovery is due.
    fn before_call(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == CircuitState::Open {
            let due = inner
                .last_failure
                .map_or(true, |t| t.elapsed() >= self.recovery_timeout);
            if !due {
                return Err(WeftError::CircuitOpen {
                    name: self.name.clone(),
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!(breaker = %self.name, "Circuit breaker half-open");
        }
        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(breaker = %self.name, "Circuit breaker closed after recovery");
                }
            }
            _ => inner.failure_count = 0,
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        let reopen = inner.state == CircuitState::HalfOpen;
        if reopen || inner.failure_count >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
            inner.success_count = 0;
        }
    }

    /// Run `f` under the breaker. While open, `f` is not invoked and
    /// `CircuitOpen` is returned.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.before_call()?;
        match f().await {
            Ok(v) => {
                self.on_success();
                Ok(v)
            }
            Err(e) => {
                if (self.is_failure)(&e) {
                    self.on_failure();
                }
                Err(e)
            }
        }
    }

    /// Record an outcome produced outside `call`, e.g. a Failed agent record.
    pub fn record(&self, success: bool) {
        if success {
            self.on_success();
        } else {
            self.on_failure();
        }
    }

    /// Admission check for callers that use [`record`](Self::record).
    pub fn try_acquire(&self) -> Result<()> {
        self.before_call()
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        info!(breaker = %self.name, "Circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fail(breaker: &CircuitBreaker) -> Result<()> {
        breaker
            .call(|| async { Err::<(), _>(WeftError::Llm("503".into())) })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32> {
        breaker.call(|| async { Ok(7) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("llm", 3, Duration::from_secs(60));
        for _ in 0..2 {
            assert!(fail(&breaker).await.is_err());
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);

        let invoked = AtomicUsize::new(0);
        let res = breaker
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(res, Err(WeftError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("llm", 2, Duration::from_secs(60));
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_through_half_open() {
        let breaker = CircuitBreaker::new("llm", 1, Duration::from_secs(30));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(matches!(succeed(&breaker).await, Err(WeftError::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("llm", 3, Duration::from_secs(10));
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(10)).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(succeed(&breaker).await, Err(WeftError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn unmatched_errors_pass_through() {
        let breaker = CircuitBreaker::new("llm", 1, Duration::from_secs(60))
            .with_failure_predicate(|e| matches!(e, WeftError::Llm(_)));
        let res = breaker
            .call(|| async { Err::<(), _>(WeftError::InvalidArguments("bad".into())) })
            .await;
        assert!(matches!(res, Err(WeftError::InvalidArguments(_))));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[tokio::test]
    async fn reset_closes() {
        let breaker = CircuitBreaker::new("llm", 1, Duration::from_secs(60));
        let _ = fail(&breaker).await;
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn unbounded_recovery_timeout_keeps_circuit_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_secs: f64::INFINITY,
            success_threshold: 1,
        };
        let breaker = CircuitBreaker::from_config("llm", &config);
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(matches!(
            succeed(&breaker).await,
            Err(WeftError::CircuitOpen { .. })
        ));
    }
}
