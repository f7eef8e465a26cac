//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before retry number `attempt` (1 = first retry).
///
/// Doubles from `base` per attempt, capped at `cap`, plus up to 10% jitter.
/// The jittered value never exceeds `cap`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    let exponential = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential).min(cap_ms);

    let jitter_range = delay_ms / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis((delay_ms + jitter).min(cap_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(10);
        let first = backoff_delay(1, base, cap);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(110));
        let third = backoff_delay(3, base, cap);
        assert!(third >= Duration::from_millis(400) && third < Duration::from_millis(440));
    }

    #[test]
    fn test_backoff_is_capped() {
        let delay = backoff_delay(30, Duration::from_millis(100), Duration::from_millis(1000));
        assert_eq!(delay, Duration::from_millis(1000));
    }

    #[test]
    fn test_zero_attempt_has_no_delay() {
        assert_eq!(
            backoff_delay(0, Duration::from_millis(100), Duration::from_secs(1)),
            Duration::ZERO
        );
    }
}
