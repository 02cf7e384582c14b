use std::time::Duration;

use stepgraph_core::config::{BackoffKind, RetryConfig};

/// Delay before retry number `attempt + 1` of a recoverable node failure.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = match config.backoff {
        BackoffKind::Fixed => config.initial_backoff_ms,
        BackoffKind::Exponential => config
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt)),
    }
    .min(config.max_backoff_ms);

    if !config.jitter {
        return Duration::from_millis(ms);
    }
    // 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_backoff() {
        let config = RetryConfig::default();
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(200));
        assert_eq!(calculate_backoff(5, &config), Duration::from_millis(200));
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let config = RetryConfig {
            backoff: BackoffKind::Exponential,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            ..RetryConfig::default()
        };
        assert_eq!(calculate_backoff(0, &config), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, &config), Duration::from_millis(400));
        assert_eq!(calculate_backoff(10, &config), Duration::from_millis(1_000));
        assert_eq!(calculate_backoff(200, &config), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_range() {
        let config = RetryConfig {
            jitter: true,
            initial_backoff_ms: 1_000,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let ms = calculate_backoff(0, &config).as_millis();
            assert!((800..=1_200).contains(&ms), "backoff {} out of range", ms);
        }
    }
}
