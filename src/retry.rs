//! Reconnect budget and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream worker uses
//! [`ReconnectPolicy`] to decide whether another attempt is allowed and how
//! long to wait before it.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Policy controlling automatic reconnect attempts and exponential backoff.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether transport failures schedule a reconnect at all.
    pub auto_reconnect: bool,
    /// Maximum number of automatic reconnect attempts in one cycle.
    ///
    /// The initial `connect` is not counted; a successful connection resets
    /// the cycle.
    pub max_attempts: u32,
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Maximum random jitter added to each delay. Zero disables jitter.
    pub jitter: Duration,
}

impl ReconnectPolicy {
    /// Policy with the dashboard defaults: 10 attempts, 5s doubling to 30s.
    pub fn dashboard() -> Self {
        Self {
            auto_reconnect: true,
            max_attempts: 10,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::ZERO,
        }
    }

    /// Policy that never schedules automatic reconnects.
    pub fn manual() -> Self {
        Self {
            auto_reconnect: false,
            ..Self::dashboard()
        }
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// `attempt` is 1-based: `min(initial * 2^(attempt - 1), max)`, plus
    /// jitter when configured.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = std::cmp::min(self.initial_backoff, self.max_backoff);
        for _ in 1..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        delay + jitter_duration(self.jitter, attempt)
    }

    /// Returns the 1-based attempt number to schedule after `completed`
    /// attempts, or `None` when the budget is exhausted or reconnects are
    /// disabled.
    pub fn next_attempt(&self, completed: u32) -> Option<u32> {
        if !self.auto_reconnect || completed >= self.max_attempts {
            return None;
        }
        Some(completed + 1)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::dashboard()
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(max_jitter: Duration, attempt: u32) -> Duration {
    if max_jitter.is_zero() {
        return Duration::ZERO;
    }

    let limit_nanos = max_jitter.as_nanos().min(u64::MAX as u128) as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }

    let now_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let mixed = now_nanos ^ (u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    Duration::from_nanos(mixed % (limit_nanos + 1))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{with_timeout, ReconnectPolicy};

    fn policy(base_ms: u64, cap_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(base_ms),
            max_backoff: Duration::from_millis(cap_ms),
            ..ReconnectPolicy::dashboard()
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = policy(5_000, 30_000);
        let delays: Vec<u128> = (1..=6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![5_000, 10_000, 20_000, 30_000, 30_000, 30_000]);
    }

    #[test]
    fn backoff_survives_huge_attempt_numbers() {
        let policy = policy(5_000, 30_000);
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn initial_backoff_above_cap_is_clamped() {
        let policy = policy(60_000, 30_000);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let plain = policy(100, 1_000);
        let jittered = ReconnectPolicy {
            jitter: Duration::from_millis(50),
            ..plain.clone()
        };
        for attempt in 1..=8 {
            let delay = jittered.delay_for_attempt(attempt);
            let base = plain.delay_for_attempt(attempt);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(50));
        }
    }

    #[test]
    fn next_attempt_respects_budget() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::dashboard()
        };
        assert_eq!(policy.next_attempt(0), Some(1));
        assert_eq!(policy.next_attempt(2), Some(3));
        assert_eq!(policy.next_attempt(3), None);
        assert_eq!(ReconnectPolicy::manual().next_attempt(0), None);
    }

    #[test]
    fn timeout_reports_elapsed() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let slow = with_timeout(
                Duration::from_millis(10),
                tokio::time::sleep(Duration::from_secs(1)),
            )
            .await;
            assert!(slow.is_err());

            let fast = with_timeout(Duration::from_secs(1), async { 7 }).await;
            assert_eq!(fast.expect("completes"), 7);
        });
    }
}
