//! Balanced picker.
//!
//! Chooses a fixed quota per pool, least-assigned first, ties broken
//! uniformly at random, then shuffles the combined batch so presentation
//! order carries no information about pool or priority. Randomness comes
//! from the caller's RNG.

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::config::ShortfallPolicy;
use crate::error::AssignError;
use crate::ledger::availability::{Availability, AvailableImage};

/// Orders images by priority (descending) with uniformly random order
/// inside each priority band.
pub fn order_by_priority<R: Rng + ?Sized>(
    images: &[AvailableImage],
    rng: &mut R,
) -> Vec<AvailableImage> {
    let mut ordered = images.to_vec();
    // Shuffle first, then a stable sort keeps the random order within a band.
    ordered.shuffle(rng);
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));
    ordered
}

/// Picks `per_pool` images from every pool in `availability`.
///
/// Under `ShortfallPolicy::Reject` a short pool fails the whole pick.
/// Under `Backfill` the missing images come from the other pools' leftovers,
/// still least-assigned first; the pick fails only if the total is short.
pub fn pick_balanced<R: Rng + ?Sized>(
    availability: &Availability,
    per_pool: usize,
    policy: ShortfallPolicy,
    rng: &mut R,
) -> Result<Vec<AvailableImage>, AssignError> {
    if policy == ShortfallPolicy::Reject {
        availability.require(per_pool)?;
    }

    let wanted = per_pool * availability.pools.len();
    let mut picked = Vec::with_capacity(wanted);
    let mut leftovers = Vec::new();

    for pool in &availability.pools {
        let mut ordered = order_by_priority(&pool.images, rng);
        let take = per_pool.min(ordered.len());
        leftovers.extend(ordered.split_off(take));
        picked.extend(ordered);
    }

    let missing = wanted - picked.len();
    if missing > 0 {
        // Only reachable under Backfill.
        if leftovers.len() < missing {
            return Err(AssignError::InsufficientCapacity {
                pool: "all pools".to_string(),
                available: picked.len() + leftovers.len(),
                required: wanted,
            });
        }

        debug!(missing, "backfilling short pool from other pools");
        let ordered = order_by_priority(&leftovers, rng);
        picked.extend(ordered.into_iter().take(missing));
    }

    picked.shuffle(rng);
    Ok(picked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssignmentConfig, PoolConfig};
    use crate::ledger::availability::available_by_pool;
    use crate::ledger::model::{ImageRef, Ledger};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::{HashMap, HashSet};

    fn cfg(size: u32, per_participant: usize) -> AssignmentConfig {
        AssignmentConfig {
            pools: vec![
                PoolConfig::new("set1", 1, size),
                PoolConfig::new("set2", 1 + size, size),
            ],
            max_assignments_per_image: 5,
            images_per_participant: per_participant,
            ..Default::default()
        }
    }

    fn set(l: &mut Ledger, pool: &str, n: u32, count: u32) {
        l.pools.get_mut(pool).unwrap().get_mut(&n).unwrap().assignment_count = count;
    }

    #[test]
    fn picks_exact_quota_per_pool_without_duplicates() {
        let c = cfg(10, 10);
        let av = available_by_pool(&Ledger::initial(&c, 0), &c);
        let mut rng = StdRng::seed_from_u64(1);

        let picked = pick_balanced(&av, 5, ShortfallPolicy::Reject, &mut rng).unwrap();

        assert_eq!(picked.len(), 10);
        let ids: HashSet<_> = picked.iter().map(|p| p.image.clone()).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(picked.iter().filter(|p| p.image.pool == "set1").count(), 5);
        assert_eq!(picked.iter().filter(|p| p.image.pool == "set2").count(), 5);
    }

    #[test]
    fn least_assigned_images_win() {
        let c = cfg(8, 8);
        let mut l = Ledger::initial(&c, 0);
        // set1: 1..=4 at count 3, 5..=8 at count 0
        for n in 1..=4 {
            set(&mut l, "set1", n, 3);
        }
        let av = available_by_pool(&l, &c);
        let mut rng = StdRng::seed_from_u64(9);

        let picked = pick_balanced(&av, 4, ShortfallPolicy::Reject, &mut rng).unwrap();
        let set1: Vec<u32> = picked
            .iter()
            .filter(|p| p.image.pool == "set1")
            .map(|p| p.image.number)
            .collect();

        assert!(set1.iter().all(|n| *n >= 5), "picked busy images: {set1:?}");
    }

    #[test]
    fn short_pool_is_rejected_not_backfilled_by_default() {
        let c = cfg(6, 10);
        let mut l = Ledger::initial(&c, 0);
        for n in 7..=8 {
            set(&mut l, "set2", n, 5);
        }
        let av = available_by_pool(&l, &c);
        let mut rng = StdRng::seed_from_u64(3);

        let err = pick_balanced(&av, 5, ShortfallPolicy::Reject, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            AssignError::InsufficientCapacity { ref pool, available: 4, required: 5 } if pool == "set2"
        ));
    }

    #[test]
    fn backfill_fills_the_gap_from_other_pools() {
        let c = cfg(6, 10);
        let mut l = Ledger::initial(&c, 0);
        for n in 7..=8 {
            set(&mut l, "set2", n, 5);
        }
        let av = available_by_pool(&l, &c);
        let mut rng = StdRng::seed_from_u64(3);

        let picked = pick_balanced(&av, 5, ShortfallPolicy::Backfill, &mut rng).unwrap();
        assert_eq!(picked.len(), 10);
        assert_eq!(picked.iter().filter(|p| p.image.pool == "set1").count(), 6);
        assert_eq!(picked.iter().filter(|p| p.image.pool == "set2").count(), 4);
    }

    #[test]
    fn backfill_still_fails_when_total_is_short() {
        let c = cfg(4, 10);
        let av = available_by_pool(&Ledger::initial(&c, 0), &c);
        let mut rng = StdRng::seed_from_u64(3);

        let err = pick_balanced(&av, 5, ShortfallPolicy::Backfill, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            AssignError::InsufficientCapacity { available: 8, required: 10, .. }
        ));
    }

    #[test]
    fn near_cap_image_is_never_preferred_over_fresh_peers() {
        let c = cfg(10, 10);
        let mut l = Ledger::initial(&c, 0);
        set(&mut l, "set1", 4, 4);
        let av = available_by_pool(&l, &c);
        let busy = ImageRef::new("set1", 4);

        let mut rng = StdRng::seed_from_u64(42);
        let mut hits: HashMap<ImageRef, u32> = HashMap::new();
        let trials = 2_000;
        for _ in 0..trials {
            for p in pick_balanced(&av, 5, ShortfallPolicy::Reject, &mut rng).unwrap() {
                *hits.entry(p.image).or_default() += 1;
            }
        }

        assert_eq!(hits.get(&busy).copied().unwrap_or(0), 0);

        // The nine fresh set1 images share 5 slots: each ~5/9 of trials.
        for n in (1..=10).filter(|n| *n != 4) {
            let h = hits[&ImageRef::new("set1", n)] as f64 / trials as f64;
            assert!((0.45..0.66).contains(&h), "set1_{n} frequency {h}");
        }
    }

    #[test]
    fn presentation_order_mixes_pools() {
        let c = cfg(10, 10);
        let av = available_by_pool(&Ledger::initial(&c, 0), &c);
        let mut rng = StdRng::seed_from_u64(5);

        // With a final shuffle the first slot is not always the same pool.
        let firsts: HashSet<String> = (0..50)
            .map(|_| {
                pick_balanced(&av, 5, ShortfallPolicy::Reject, &mut rng).unwrap()[0]
                    .image
                    .pool
                    .clone()
            })
            .collect();
        assert_eq!(firsts.len(), 2);
    }
}
