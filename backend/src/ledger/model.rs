use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AssignmentConfig;

/// Identity of one image: `(pool, number)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    pub pool: String,
    pub number: u32,
}

impl ImageRef {
    pub fn new(pool: impl Into<String>, number: u32) -> Self {
        Self {
            pool: pool.into(),
            number,
        }
    }

    /// Stable identifier, e.g. `set1_17`.
    pub fn id(&self) -> String {
        format!("{}_{}", self.pool, self.number)
    }

    /// Blob path, e.g. `set1/17.png`.
    pub fn path(&self) -> String {
        format!("{}/{}.png", self.pool, self.number)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.pool, self.number)
    }
}

/// Per-image assignment state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub assignment_count: u32,
    pub last_assigned_to: Option<String>,
    pub last_assigned_at_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub max_assignments_per_image: u32,
    pub images_per_participant: usize,
    pub images_per_pool: usize,
    /// Sum of all increments since the last reset.
    pub total_assignments: u64,
    pub last_updated_ms: u64,
    pub last_assigned_to: Option<String>,
    pub reset_at_ms: Option<u64>,
}

/// Aggregate of every image record across all pools.
///
/// Mutated only through [`Ledger::apply`] inside a guarded commit, or
/// replaced wholesale by an admin reset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub meta: LedgerMeta,
    pub pools: BTreeMap<String, BTreeMap<u32, ImageRecord>>,
}

/// A ledger as read from a store, tagged with its write version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub version: u64,
    pub ledger: Ledger,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LedgerError {
    #[error("image {0} selected twice")]
    Duplicate(String),

    #[error("image {image} would exceed the cap ({count} + 1 > {max})")]
    CapExceeded { image: String, count: u32, max: u32 },

    #[error("image {0} is not in the ledger")]
    UnknownImage(String),
}

impl Ledger {
    /// One zero-count record per configured image.
    pub fn initial(cfg: &AssignmentConfig, now_ms: u64) -> Self {
        let pools = cfg
            .pools
            .iter()
            .map(|p| {
                let records = p.numbers().map(|n| (n, ImageRecord::default())).collect();
                (p.name.clone(), records)
            })
            .collect();

        Self {
            meta: LedgerMeta {
                max_assignments_per_image: cfg.max_assignments_per_image,
                images_per_participant: cfg.images_per_participant,
                images_per_pool: cfg.images_per_pool(),
                total_assignments: 0,
                last_updated_ms: now_ms,
                last_assigned_to: None,
                reset_at_ms: None,
            },
            pools,
        }
    }

    /// A zeroed ledger stamped with the reset time.
    pub fn reset(cfg: &AssignmentConfig, now_ms: u64) -> Self {
        let mut ledger = Self::initial(cfg, now_ms);
        ledger.meta.reset_at_ms = Some(now_ms);
        ledger
    }

    /// Adds zero records for configured images the ledger has never seen,
    /// e.g. after a pool was added. Returns how many were added.
    pub fn ensure_configured(&mut self, cfg: &AssignmentConfig) -> usize {
        let mut added = 0;
        for p in &cfg.pools {
            let records = self.pools.entry(p.name.clone()).or_default();
            for n in p.numbers() {
                if let std::collections::btree_map::Entry::Vacant(e) = records.entry(n) {
                    e.insert(ImageRecord::default());
                    added += 1;
                }
            }
        }
        added
    }

    /// Current count of an image; images without a record count as zero.
    pub fn count(&self, image: &ImageRef) -> u32 {
        self.pools
            .get(&image.pool)
            .and_then(|p| p.get(&image.number))
            .map(|r| r.assignment_count)
            .unwrap_or(0)
    }

    pub fn record(&self, image: &ImageRef) -> Option<&ImageRecord> {
        self.pools.get(&image.pool)?.get(&image.number)
    }

    /// Increments every selected image by exactly one.
    ///
    /// All-or-nothing: validates the whole selection against `cap` before
    /// touching any record.
    pub fn apply(
        &mut self,
        images: &[ImageRef],
        cap: u32,
        participant_id: &str,
        now_ms: u64,
    ) -> Result<(), LedgerError> {
        let mut seen = HashSet::with_capacity(images.len());
        for img in images {
            if !seen.insert(img) {
                return Err(LedgerError::Duplicate(img.id()));
            }
            let Some(rec) = self.record(img) else {
                return Err(LedgerError::UnknownImage(img.id()));
            };
            let count = rec.assignment_count;
            if count >= cap {
                return Err(LedgerError::CapExceeded {
                    image: img.id(),
                    count,
                    max: cap,
                });
            }
        }

        for img in images {
            let Some(rec) = self
                .pools
                .get_mut(&img.pool)
                .and_then(|p| p.get_mut(&img.number))
            else {
                continue;
            };
            rec.assignment_count += 1;
            rec.last_assigned_to = Some(participant_id.to_string());
            rec.last_assigned_at_ms = Some(now_ms);
        }

        self.meta.total_assignments += images.len() as u64;
        self.meta.last_updated_ms = now_ms;
        self.meta.last_assigned_to = Some(participant_id.to_string());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn small_cfg() -> AssignmentConfig {
        AssignmentConfig {
            pools: vec![PoolConfig::new("a", 1, 3), PoolConfig::new("b", 4, 3)],
            max_assignments_per_image: 2,
            images_per_participant: 2,
            ..Default::default()
        }
    }

    #[test]
    fn initial_has_one_zero_record_per_image() {
        let l = Ledger::initial(&small_cfg(), 10);
        assert_eq!(l.pools["a"].len(), 3);
        assert_eq!(l.pools["b"].keys().copied().collect::<Vec<_>>(), vec![4, 5, 6]);
        assert!(l.pools.values().flat_map(|p| p.values()).all(|r| r.assignment_count == 0));
        assert_eq!(l.meta.images_per_pool, 1);
        assert_eq!(l.meta.reset_at_ms, None);
    }

    #[test]
    fn apply_increments_and_stamps() {
        let mut l = Ledger::initial(&small_cfg(), 0);
        let sel = vec![ImageRef::new("a", 1), ImageRef::new("b", 5)];

        l.apply(&sel, 2, "p1", 99).unwrap();

        assert_eq!(l.count(&sel[0]), 1);
        let rec = l.record(&sel[1]).unwrap();
        assert_eq!(rec.assignment_count, 1);
        assert_eq!(rec.last_assigned_to.as_deref(), Some("p1"));
        assert_eq!(rec.last_assigned_at_ms, Some(99));
        assert_eq!(l.meta.total_assignments, 2);
        assert_eq!(l.meta.last_updated_ms, 99);
    }

    #[test]
    fn apply_refuses_cap_overflow_without_partial_write() {
        let mut l = Ledger::initial(&small_cfg(), 0);
        let a1 = ImageRef::new("a", 1);
        let b4 = ImageRef::new("b", 4);
        l.apply(&[a1.clone()], 2, "p1", 1).unwrap();
        l.apply(&[a1.clone()], 2, "p2", 2).unwrap();

        let before = l.clone();
        let err = l.apply(&[b4, a1], 2, "p3", 3).unwrap_err();

        assert!(matches!(err, LedgerError::CapExceeded { count: 2, max: 2, .. }));
        assert_eq!(l, before);
    }

    #[test]
    fn apply_refuses_a_saturated_count_from_a_corrupt_document() {
        let mut l = Ledger::initial(&small_cfg(), 0);
        let a1 = ImageRef::new("a", 1);
        l.pools.get_mut("a").unwrap().get_mut(&1).unwrap().assignment_count = u32::MAX;

        let err = l.apply(&[a1], 2, "p", 0).unwrap_err();
        assert!(matches!(err, LedgerError::CapExceeded { count: u32::MAX, max: 2, .. }));
    }

    #[test]
    fn apply_refuses_duplicates() {
        let mut l = Ledger::initial(&small_cfg(), 0);
        let a1 = ImageRef::new("a", 1);
        let err = l.apply(&[a1.clone(), a1], 2, "p", 0).unwrap_err();
        assert_eq!(err, LedgerError::Duplicate("a_1".into()));
    }

    #[test]
    fn apply_refuses_images_outside_the_ledger() {
        let mut l = Ledger::initial(&small_cfg(), 0);
        let err = l.apply(&[ImageRef::new("a", 99)], 2, "p", 0).unwrap_err();
        assert_eq!(err, LedgerError::UnknownImage("a_99".into()));
        assert_eq!(l.meta.total_assignments, 0);
    }

    #[test]
    fn ensure_configured_fills_new_pools_only() {
        let c = small_cfg();
        let mut l = Ledger::initial(&c, 0);
        l.apply(&[ImageRef::new("a", 1)], 2, "p", 0).unwrap();
        l.pools.remove("b");

        assert_eq!(l.ensure_configured(&c), 3);
        assert_eq!(l.ensure_configured(&c), 0);
        assert_eq!(l.count(&ImageRef::new("a", 1)), 1);
        assert_eq!(l.pools["b"].len(), 3);
    }

    #[test]
    fn json_document_round_trips() {
        let mut l = Ledger::initial(&small_cfg(), 0);
        l.apply(&[ImageRef::new("a", 2)], 2, "p", 5).unwrap();

        let doc = serde_json::to_string(&l).unwrap();
        let back: Ledger = serde_json::from_str(&doc).unwrap();
        assert_eq!(back, l);
    }

    #[test]
    fn image_ref_naming() {
        let img = ImageRef::new("set2", 1201);
        assert_eq!(img.id(), "set2_1201");
        assert_eq!(img.path(), "set2/1201.png");
        assert_eq!(img.to_string(), "set2_1201");
    }
}
