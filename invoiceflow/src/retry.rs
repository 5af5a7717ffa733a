use std::time::Duration;

/// Exponential backoff parameters shared by requeue delays, broker
/// reconnects, and the posting stage's local retry loop.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Base delay in milliseconds.
    pub base_ms: u64,
    /// Maximum delay in milliseconds.
    pub cap_ms: u64,
}

impl BackoffPolicy {
    pub fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    /// Delay before the given attempt, doubling per attempt and capped.
    ///
    /// Formula: `min(base * 2^(attempt-1), cap)`; attempt 0 means "no
    /// failures yet" and yields no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let exp = attempt.saturating_sub(1).min(63);
        let scaled = self
            .base_ms
            .saturating_mul(1u64.checked_shl(exp).unwrap_or(u64::MAX));
        Duration::from_millis(scaled.min(self.cap_ms))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 300_000,
        }
    }
}

/// Whether a message that has been redelivered `redeliveries` times has
/// exhausted its ceiling and must be dead-lettered instead of requeued.
pub fn exceeds_redelivery_ceiling(redeliveries: u32, ceiling: u32) -> bool {
    redeliveries >= ceiling
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = BackoffPolicy::new(1_000, 300_000);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(0));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4_000));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = BackoffPolicy::new(1_000, 5_000);
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(5_000));
        // Shift overflow territory stays capped rather than wrapping.
        assert_eq!(policy.delay_for_attempt(200), Duration::from_millis(5_000));
    }

    #[test]
    fn redelivery_ceiling() {
        assert!(!exceeds_redelivery_ceiling(0, 3));
        assert!(!exceeds_redelivery_ceiling(2, 3));
        assert!(exceeds_redelivery_ceiling(3, 3));
        assert!(exceeds_redelivery_ceiling(4, 3));
    }
}
