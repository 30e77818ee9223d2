//! Exponential backoff for transient apply failures.

use std::time::Duration;

use rand::Rng;

use crate::config::OrchestratorConfig;

/// How many times an operation is attempted and how long to wait between attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts including the first one. Never less than 1.
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base_delay,
      max_delay,
    }
  }

  pub fn from_config(config: &OrchestratorConfig) -> Self {
    Self::new(
      config.max_attempts,
      Duration::from_millis(config.backoff_base_ms),
      Duration::from_millis(config.backoff_max_ms),
    )
  }

  /// Whether another attempt is allowed after `attempts` failed ones.
  pub fn should_retry(&self, attempts: u32) -> bool {
    attempts < self.max_attempts
  }

  /// `base * 2^(attempt-1)`, capped at `max_delay`. `attempt` is the 1-based failed attempt.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self
      .base_delay
      .checked_mul(factor)
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Backoff plus up to 50% random jitter, still capped at `max_delay`.
  pub fn jittered_backoff(&self, attempt: u32) -> Duration {
    let delay = self.backoff(attempt);
    let jitter_ms = delay.as_millis() as u64 / 2;
    let jitter = if jitter_ms > 0 {
      Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    } else {
      Duration::ZERO
    };
    (delay + jitter).min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&OrchestratorConfig::default())
  }
}

#[cfg(test)]
mod tests {
  use super::RetryPolicy;
  use std::time::Duration;

  fn policy() -> RetryPolicy {
    RetryPolicy::new(4, Duration::from_millis(100), Duration::from_secs(1))
  }

  #[test]
  fn backoff_doubles_until_capped() {
    let p = policy();
    assert_eq!(p.backoff(1), Duration::from_millis(100));
    assert_eq!(p.backoff(2), Duration::from_millis(200));
    assert_eq!(p.backoff(3), Duration::from_millis(400));
    assert_eq!(p.backoff(5), Duration::from_secs(1));
    assert_eq!(p.backoff(60), Duration::from_secs(1));
  }

  #[test]
  fn jitter_stays_within_bounds() {
    let p = policy();
    for _ in 0..50 {
      let d = p.jittered_backoff(2);
      assert!(d >= Duration::from_millis(200));
      assert!(d <= Duration::from_millis(300));
    }
    assert!(p.jittered_backoff(10) <= Duration::from_secs(1));
  }

  #[test]
  fn retry_budget_counts_first_attempt() {
    let p = policy();
    assert!(p.should_retry(3));
    assert!(!p.should_retry(4));
    assert_eq!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO).max_attempts, 1);
  }
}
