//! Read-only capacity and statistics reporting over a ledger snapshot.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::config::{AssignmentConfig, ShortfallPolicy};
use crate::ledger::availability::available_by_pool;
use crate::ledger::model::Ledger;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapacityReport {
    pub can_assign: bool,
    /// `min over pools of floor(available / images_per_pool)`.
    pub estimated_remaining_participants: u64,
    pub per_pool_available: BTreeMap<String, usize>,
    /// Sum of `cap - count` over every image.
    pub remaining_slots: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_images: usize,
    pub available: usize,
    pub unassigned: usize,
    pub partially_assigned: usize,
    pub fully_assigned: usize,
    /// Available images exactly one assignment below the cap.
    pub near_limit: usize,
    pub total_assignments: u64,
    pub average_assignments: f64,
    /// Index `k` holds the number of images assigned exactly `k` times.
    pub distribution: Vec<usize>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerStats {
    pub pools: BTreeMap<String, PoolStats>,
    pub max_assignments_per_image: u32,
    pub total_assignments: u64,
    pub last_updated_ms: u64,
    pub reset_at_ms: Option<u64>,
    pub capacity: CapacityReport,
}

pub fn capacity(ledger: &Ledger, cfg: &AssignmentConfig) -> CapacityReport {
    let per_pool = cfg.images_per_pool().max(1);
    let av = available_by_pool(ledger, cfg);

    let remaining_slots: u64 = av.pools.iter().map(|p| p.remaining_slots()).sum();

    // Backfill may draw from any pool, so only the total matters; a batch
    // still needs `images_per_participant` distinct images.
    let estimated = match cfg.shortfall {
        ShortfallPolicy::Reject => av
            .pools
            .iter()
            .map(|p| (p.len() / per_pool) as u64)
            .min()
            .unwrap_or(0),
        ShortfallPolicy::Backfill if av.total_available() < cfg.images_per_participant => 0,
        ShortfallPolicy::Backfill => remaining_slots / cfg.images_per_participant.max(1) as u64,
    };
    let can_assign = estimated > 0;

    CapacityReport {
        can_assign,
        estimated_remaining_participants: estimated,
        per_pool_available: av.pools.iter().map(|p| (p.pool.clone(), p.len())).collect(),
        remaining_slots,
    }
}

pub fn statistics(ledger: &Ledger, cfg: &AssignmentConfig) -> LedgerStats {
    let cap = cfg.max_assignments_per_image;

    let pools = cfg
        .pools
        .iter()
        .map(|p| {
            let records = ledger.pools.get(&p.name);
            let mut s = PoolStats {
                total_images: p.size as usize,
                available: 0,
                unassigned: 0,
                partially_assigned: 0,
                fully_assigned: 0,
                near_limit: 0,
                total_assignments: 0,
                average_assignments: 0.0,
                distribution: vec![0; cap as usize + 1],
            };

            for n in p.numbers() {
                let count = records
                    .and_then(|r| r.get(&n))
                    .map(|r| r.assignment_count)
                    .unwrap_or(0);

                s.total_assignments += count as u64;
                let bucket = count.min(cap) as usize;
                s.distribution[bucket] += 1;

                if count >= cap {
                    s.fully_assigned += 1;
                    continue;
                }

                s.available += 1;
                if count == 0 {
                    s.unassigned += 1;
                } else {
                    s.partially_assigned += 1;
                }
                if count + 1 == cap {
                    s.near_limit += 1;
                }
            }

            if s.total_images > 0 {
                s.average_assignments = s.total_assignments as f64 / s.total_images as f64;
            }

            (p.name.clone(), s)
        })
        .collect();

    LedgerStats {
        pools,
        max_assignments_per_image: cap,
        total_assignments: ledger.meta.total_assignments,
        last_updated_ms: ledger.meta.last_updated_ms,
        reset_at_ms: ledger.meta.reset_at_ms,
        capacity: capacity(ledger, cfg),
    }
}
