use std::time::Duration;

use weft_core::workflow::RetryConfig;

/// Longest sleep between attempts, whatever the retry config asks for.
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before retry number `attempt + 1`:
/// `initial_delay * exponential_base^attempt`, capped at `max_delay`, then
/// scaled by 0.8x to 1.2x when jitter is on. Never exceeds [`MAX_BACKOFF`].
pub fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = (config.initial_delay * config.exponential_base.powi(exponent)).min(config.max_delay);
    let secs = if config.jitter {
        secs * (0.8 + rand::random::<f64>() * 0.4)
    } else {
        secs
    };
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .unwrap_or(MAX_BACKOFF)
        .min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: bool) -> RetryConfig {
        RetryConfig {
            max_retries: 5,
            initial_delay: 1.0,
            max_delay: 10.0,
            exponential_base: 2.0,
            jitter,
        }
    }

    #[test]
    fn grows_exponentially_and_caps() {
        let c = config(false);
        assert_eq!(calculate_backoff(&c, 0), Duration::from_secs(1));
        assert_eq!(calculate_backoff(&c, 1), Duration::from_secs(2));
        assert_eq!(calculate_backoff(&c, 3), Duration::from_secs(8));
        assert_eq!(calculate_backoff(&c, 4), Duration::from_secs(10));
        assert_eq!(calculate_backoff(&c, 60), Duration::from_secs(10));
    }

    #[test]
    fn huge_delays_clamp_instead_of_panicking() {
        let huge = RetryConfig {
            max_retries: 1,
            initial_delay: 1e20,
            max_delay: 1e20,
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(calculate_backoff(&huge, 0), MAX_BACKOFF);
        assert_eq!(calculate_backoff(&huge, u32::MAX), MAX_BACKOFF);

        let unbounded = RetryConfig {
            initial_delay: 1.0,
            max_delay: f64::INFINITY,
            jitter: true,
            ..huge.clone()
        };
        assert_eq!(calculate_backoff(&unbounded, 5_000), MAX_BACKOFF);

        let nan = RetryConfig {
            initial_delay: 0.0,
            exponential_base: f64::INFINITY,
            max_delay: f64::NAN,
            ..huge
        };
        assert_eq!(calculate_backoff(&nan, 3), Duration::ZERO);
    }

    #[test]
    fn jitter_stays_in_band() {
        let c = config(true);
        for _ in 0..100 {
            let d = calculate_backoff(&c, 2).as_secs_f64();
            assert!((3.2..=4.8).contains(&d), "{}", d);
        }
    }
}
