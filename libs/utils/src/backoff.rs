//! Exponential backoff schedule for reconnect loops.

use std::cmp::min;
use std::time::Duration;

/// Delay before the n-th consecutive retry (1-based): `initial` doubled on
/// every further attempt, capped at `cap`. Attempt 0 yields no delay.
pub fn exponential_backoff(attempt: u32, initial: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let mut delay = initial;
    for _ in 1..attempt {
        delay = delay.saturating_mul(2);
        if delay >= cap {
            return cap;
        }
    }
    min(delay, cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let initial = Duration::from_secs(2);
        let cap = Duration::from_secs(30);
        let delays: Vec<u64> = (0..=7)
            .map(|n| exponential_backoff(n, initial, cap).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn large_attempt_does_not_overflow() {
        let d = exponential_backoff(500, Duration::from_secs(2), Duration::from_secs(30));
        assert_eq!(d, Duration::from_secs(30));
    }
}
