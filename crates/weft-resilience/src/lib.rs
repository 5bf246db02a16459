pub mod circuit_breaker;
pub mod cost;
pub mod guarded;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use cost::CostTracker;
pub use guarded::GuardedBackend;
pub use rate_limiter::RateLimiter;
