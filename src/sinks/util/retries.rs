//! Retry policy with exponential backoff and jitter.
//!
//! Backoff delays are produced as plain values; the caller owns the sleep so
//! it can select against the shutdown signal instead of blocking through a
//! cancellation request.

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use serde_with::serde_as;

/// Jitter applied to computed backoff delays.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JitterMode {
    None,
    /// Delay is sampled uniformly from `[delay/2, delay]`, keeping growth
    /// monotonic on average while decorrelating concurrent retriers.
    #[default]
    Half,
}

/// Retry settings for the ingestion writer.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retry attempts after the initial one. The batch is dead-lettered once
    /// these are exhausted.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: usize,

    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_initial_backoff_ms", default = "default_initial_backoff")]
    pub retry_initial_backoff: Duration,

    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_max_backoff_ms", default = "default_max_backoff")]
    pub retry_max_backoff: Duration,

    #[serde(default)]
    pub jitter: JitterMode,
}

const fn default_retry_attempts() -> usize {
    9
}

const fn default_initial_backoff() -> Duration {
    Duration::from_millis(1000)
}

const fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_initial_backoff: default_initial_backoff(),
            retry_max_backoff: default_max_backoff(),
            jitter: JitterMode::default(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            remaining: self.retry_attempts,
            backoff: ExponentialBackoff::new(self.retry_initial_backoff, self.retry_max_backoff),
            jitter: self.jitter,
        }
    }
}

/// Doubling backoff capped at a maximum delay.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    next: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { next: initial, max }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next.min(self.max);
        self.next = current.saturating_mul(2).min(self.max);
        Some(current)
    }
}

/// One retry run: a bounded sequence of (possibly jittered) delays.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    remaining: usize,
    backoff: ExponentialBackoff,
    jitter: JitterMode,
}

impl RetryPolicy {
    /// The next delay to wait before retrying, or `None` once attempts are
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.backoff.next().expect("backoff iterator is infinite");
        Some(match self.jitter {
            JitterMode::None => delay,
            JitterMode::Half => {
                let millis = delay.as_millis() as u64;
                let jittered = rand::rng().random_range(millis / 2..=millis.max(1));
                Duration::from_millis(jittered)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = backoff.take(5).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn policy_is_bounded() {
        let config = RetryConfig {
            retry_attempts: 3,
            jitter: JitterMode::None,
            ..RetryConfig::default()
        };
        let mut policy = config.policy();
        let mut delays = Vec::new();
        while let Some(delay) = policy.next_delay() {
            delays.push(delay);
        }
        assert_eq!(delays.len(), 3);
        assert!(delays.windows(2).all(|w| w[0] <= w[1]), "delays must not shrink");
    }

    #[test]
    fn half_jitter_stays_within_bounds() {
        let config = RetryConfig {
            retry_attempts: 50,
            retry_initial_backoff: Duration::from_millis(100),
            retry_max_backoff: Duration::from_millis(100),
            jitter: JitterMode::Half,
        };
        let mut policy = config.policy();
        while let Some(delay) = policy.next_delay() {
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }
}
