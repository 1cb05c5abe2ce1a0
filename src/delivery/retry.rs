//! Bounded exponential backoff.

use crate::db::PostbackProfile;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts per pair, the first one included.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(1800),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt_number`-th (1-based) failed attempt:
    /// `min(base * 2^(attempt_number - 1), max)`.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let exp = attempt_number.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn max_attempts_for(&self, profile: &PostbackProfile) -> u32 {
        profile.max_attempts.unwrap_or(self.max_attempts).max(1)
    }

    pub fn next_attempt_at(&self, attempt_number: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_for(attempt_number);
        now + ChronoDuration::milliseconds(delay.as_millis() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240, 480]);
    }

    #[test]
    fn test_delay_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(7).as_secs(), 1800);
        assert_eq!(policy.delay_for(100).as_secs(), 1800);
    }

    #[test]
    fn test_profile_override() {
        let policy = RetryPolicy::default();
        let mut profile = PostbackProfile::default();
        assert_eq!(policy.max_attempts_for(&profile), 5);
        profile.max_attempts = Some(2);
        assert_eq!(policy.max_attempts_for(&profile), 2);
        profile.max_attempts = Some(0);
        assert_eq!(policy.max_attempts_for(&profile), 1);
    }

    #[test]
    fn test_next_attempt_at() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.next_attempt_at(2, now) - now, ChronoDuration::seconds(60));
    }
}
