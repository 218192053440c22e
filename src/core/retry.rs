//! Transient-failure backoff shared by every provider.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::providers::ProviderError;

/// Exponential backoff with jitter and a cap on total attempts.
///
/// Only `RateLimited` and `Unavailable` failures are retried. A delay suggested
/// by the provider wins over the computed backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    /// Fraction of the computed delay randomly added or removed.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn is_retryable(error: &ProviderError) -> bool {
        error.is_transient()
    }

    /// Delay before the next attempt after `attempts_made` attempts ended in
    /// `error`, or `None` when the failure is final. Provider hints are
    /// capped at `max_delay`.
    pub fn next_delay(&self, error: &ProviderError, attempts_made: u32) -> Option<Duration> {
        if !Self::is_retryable(error) || attempts_made >= self.max_attempts {
            return None;
        }
        Some(match error.retry_after() {
            Some(hint) => hint.min(self.max_delay),
            None => self.backoff(attempts_made),
        })
    }

    /// Computed backoff for the retry following attempt number `attempt`
    /// (1-based): `base * 2^(attempt - 1)`, capped and jittered.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = raw.min(self.max_delay);
        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }

        // Uniform factor in [1 - jitter, 1 + jitter].
        let factor = 1.0 + self.jitter * (2.0 * random_unit() - 1.0);
        capped.mul_f64(factor.max(0.0)).min(self.max_delay)
    }
}

fn random_unit() -> f64 {
    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        return 0.5;
    }
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3)
            .with_base_delay(Duration::from_millis(100))
            .with_jitter(0.0)
    }

    #[test]
    fn permanent_failures_are_never_retried() {
        let policy = policy();
        for error in [
            ProviderError::Auth("bad key".into()),
            ProviderError::ContextTooLarge("too long".into()),
            ProviderError::Malformed("garbage".into()),
        ] {
            assert_eq!(policy.next_delay(&error, 1), None, "{error}");
        }
    }

    #[test]
    fn transient_failures_retry_until_attempt_cap() {
        let policy = policy();
        let error = ProviderError::Unavailable("503".into());
        assert_eq!(
            policy.next_delay(&error, 1),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_delay(&error, 2),
            Some(Duration::from_millis(200))
        );
        assert_eq!(policy.next_delay(&error, 3), None);
    }

    #[test]
    fn provider_suggested_delay_takes_precedence() {
        let policy = policy();
        let error = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
            message: "slow down".into(),
        };
        assert_eq!(policy.next_delay(&error, 1), Some(Duration::from_secs(7)));

        let without_hint = ProviderError::RateLimited {
            retry_after: None,
            message: "slow down".into(),
        };
        assert_eq!(
            policy.next_delay(&without_hint, 2),
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn provider_hint_is_capped_at_max_delay() {
        let policy = policy().with_max_delay(Duration::from_secs(5));
        let error = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(1_000_000)),
            message: "slow down".into(),
        };
        assert_eq!(policy.next_delay(&error, 1), Some(Duration::from_secs(5)));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = policy().with_max_delay(Duration::from_millis(250));
        assert_eq!(policy.backoff(5), Duration::from_millis(250));
        assert_eq!(policy.backoff(40), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = policy().with_jitter(0.5);
        for _ in 0..50 {
            let delay = policy.backoff(2);
            assert!(delay >= Duration::from_millis(100), "{delay:?}");
            assert!(delay <= Duration::from_millis(300), "{delay:?}");
        }
    }

    #[test]
    fn policy_reads_from_toml_with_defaults() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 5\nbase_delay = 250")
            .expect("retry policy parses");
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }
}
