use std::time::Duration;

use rand::Rng;

use crate::config::{BackoffKind, BackoffPolicy};

/// Delay before attempt `attempt + 1`, given that `attempt` (1-based) failed.
///
/// Linear: `base * attempt`. Exponential: `base * 2^(attempt - 1)`.
/// `jitter_ms` is added verbatim; the caller draws it.
pub fn delay_for(policy: &BackoffPolicy, attempt: u32, jitter_ms: u64) -> Duration {
    let attempt = attempt.max(1);
    let base = policy.base_delay_ms;

    let ms = match policy.kind {
        BackoffKind::Linear => base.saturating_mul(attempt as u64),
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        }
    };

    Duration::from_millis(ms.saturating_add(jitter_ms))
}

/// [`delay_for`] with uniform jitter in `0..=policy.jitter_ms`.
pub fn next_delay<R: Rng + ?Sized>(policy: &BackoffPolicy, attempt: u32, rng: &mut R) -> Duration {
    let jitter = if policy.jitter_ms == 0 {
        0
    } else {
        rng.random_range(0..=policy.jitter_ms)
    };
    delay_for(policy, attempt, jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn policy(kind: BackoffKind, jitter_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay_ms: 500,
            kind,
            jitter_ms,
        }
    }

    #[test]
    fn exponential_doubles() {
        let p = policy(BackoffKind::Exponential, 0);
        let got: Vec<u64> = (1..=4).map(|a| delay_for(&p, a, 0).as_millis() as u64).collect();
        assert_eq!(got, vec![500, 1000, 2000, 4000]);
    }

    #[test]
    fn linear_scales_with_attempt() {
        let p = policy(BackoffKind::Linear, 0);
        let got: Vec<u64> = (1..=3).map(|a| delay_for(&p, a, 0).as_millis() as u64).collect();
        assert_eq!(got, vec![500, 1000, 1500]);
    }

    #[test]
    fn huge_attempts_saturate_instead_of_overflowing() {
        let p = policy(BackoffKind::Exponential, 0);
        assert_eq!(delay_for(&p, 200, 0), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let p = policy(BackoffKind::Exponential, 100);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let d = next_delay(&p, 2, &mut rng).as_millis();
            assert!((1000..=1100).contains(&d), "{d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sleeping_the_delay_advances_virtual_time_only() {
        let p = policy(BackoffKind::Exponential, 0);
        let start = tokio::time::Instant::now();

        for attempt in 1..=3 {
            tokio::time::sleep(delay_for(&p, attempt, 0)).await;
        }

        assert_eq!(start.elapsed(), Duration::from_millis(500 + 1000 + 2000));
    }
}
