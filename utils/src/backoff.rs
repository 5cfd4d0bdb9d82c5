use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter: `base * 2^(attempt-1)`, capped, plus a
/// random jitter of up to a fifth of the capped delay so a burst of throttled
/// workers does not retry in lockstep.
///
/// `attempt` counts from 1; 0 is treated as 1.
pub fn with_jitter(base_ms: u64, cap_ms: u64, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
    let exp = base_ms.saturating_mul(factor);
    let capped = exp.min(cap_ms);
    let jitter = if capped >= 10 {
        rand::thread_rng().gen_range(0..=capped / 5)
    } else {
        0
    };
    Duration::from_millis(capped.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_then_caps() {
        for _ in 0..50 {
            let first = with_jitter(500, 30_000, 1);
            assert!(first >= Duration::from_millis(500));
            assert!(first <= Duration::from_millis(600));

            let capped = with_jitter(500, 30_000, 12);
            assert!(capped >= Duration::from_millis(30_000));
            assert!(capped <= Duration::from_millis(36_000));
        }
    }

    #[test]
    fn test_zero_attempt_treated_as_first() {
        let d = with_jitter(100, 1_000, 0);
        assert!(d >= Duration::from_millis(100));
        assert!(d <= Duration::from_millis(120));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let d = with_jitter(500, 30_000, u32::MAX);
        assert!(d <= Duration::from_millis(36_000));
    }
}
