//! Availability selector.
//!
//! Pure function of a ledger snapshot: which images in each pool are still
//! under the cap, and how much room each one has left.

use crate::config::AssignmentConfig;
use crate::error::AssignError;
use crate::ledger::model::{ImageRef, Ledger};

/// An image still under the cap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvailableImage {
    pub image: ImageRef,
    pub assignment_count: u32,
    /// `cap - assignment_count`; higher means less assigned.
    pub priority: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolAvailability {
    pub pool: String,
    pub images: Vec<AvailableImage>,
}

impl PoolAvailability {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Remaining assignment slots across the pool.
    pub fn remaining_slots(&self) -> u64 {
        self.images.iter().map(|i| i.priority as u64).sum()
    }
}

/// Pool in a shortfall: fewer available images than the per-pool quota.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shortfall {
    pub pool: String,
    pub available: usize,
    pub required: usize,
}

/// Available images per pool, in configuration order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Availability {
    pub pools: Vec<PoolAvailability>,
}

impl Availability {
    pub fn pool(&self, name: &str) -> Option<&PoolAvailability> {
        self.pools.iter().find(|p| p.pool == name)
    }

    pub fn total_available(&self) -> usize {
        self.pools.iter().map(PoolAvailability::len).sum()
    }

    pub fn shortfalls(&self, required_per_pool: usize) -> Vec<Shortfall> {
        self.pools
            .iter()
            .filter(|p| p.len() < required_per_pool)
            .map(|p| Shortfall {
                pool: p.pool.clone(),
                available: p.len(),
                required: required_per_pool,
            })
            .collect()
    }

    /// Fails with `InsufficientCapacity` naming the tightest short pool.
    pub fn require(&self, required_per_pool: usize) -> Result<(), AssignError> {
        match self
            .shortfalls(required_per_pool)
            .into_iter()
            .min_by_key(|s| s.available)
        {
            None => Ok(()),
            Some(s) => Err(AssignError::InsufficientCapacity {
                pool: s.pool,
                available: s.available,
                required: s.required,
            }),
        }
    }
}

/// Computes the available set of every configured pool.
///
/// The configured cap is authoritative; images missing from the ledger
/// count as never assigned.
pub fn available_by_pool(ledger: &Ledger, cfg: &AssignmentConfig) -> Availability {
    let cap = cfg.max_assignments_per_image;

    let pools = cfg
        .pools
        .iter()
        .map(|p| {
            let records = ledger.pools.get(&p.name);
            let images = p
                .numbers()
                .filter_map(|n| {
                    let count = records
                        .and_then(|r| r.get(&n))
                        .map(|r| r.assignment_count)
                        .unwrap_or(0);
                    (count < cap).then(|| AvailableImage {
                        image: ImageRef::new(p.name.clone(), n),
                        assignment_count: count,
                        priority: cap - count,
                    })
                })
                .collect();

            PoolAvailability {
                pool: p.name.clone(),
                images,
            }
        })
        .collect();

    Availability { pools }
}
