use std::collections::HashSet;
use std::str::FromStr;

use crate::error::AssignError;

/// A named, contiguous range of image numbers.
///
/// Pools are static configuration: they are never mutated at runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    pub name: String,
    /// First image number in the pool (inclusive).
    pub first_number: u32,
    /// Number of images in the pool.
    pub size: u32,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>, first_number: u32, size: u32) -> Self {
        Self {
            name: name.into(),
            first_number,
            size,
        }
    }

    /// Last image number in the pool (inclusive).
    pub fn last_number(&self) -> u32 {
        self.first_number + self.size.saturating_sub(1)
    }

    pub fn numbers(&self) -> std::ops::RangeInclusive<u32> {
        self.first_number..=self.last_number()
    }

    pub fn contains(&self, number: u32) -> bool {
        self.size > 0 && self.numbers().contains(&number)
    }
}

impl FromStr for PoolConfig {
    type Err = AssignError;

    /// Parses `name:first:size`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let [name, first, size] = parts.as_slice() else {
            return Err(AssignError::Config(format!(
                "invalid pool spec '{s}', expected name:first:size"
            )));
        };

        let first_number = first
            .parse::<u32>()
            .map_err(|e| AssignError::Config(format!("invalid first number in '{s}': {e}")))?;
        let size = size
            .parse::<u32>()
            .map_err(|e| AssignError::Config(format!("invalid size in '{s}': {e}")))?;

        Ok(Self::new(*name, first_number, size))
    }
}

/// How the delay between attempts grows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffKind {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    Exponential,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay_ms: u64,
    pub kind: BackoffKind,
    /// Upper bound of the uniform random jitter added to every delay.
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            kind: BackoffKind::Exponential,
            jitter_ms: 100,
        }
    }
}

/// Primary mechanism used to serialize concurrent writers of the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Optimistic compare-and-swap on the ledger version.
    Transaction,
    /// Application-level lock document; for stores without a native
    /// conditional write.
    AdvisoryLock,
}

/// What happens once every retry has been spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExhaustionPolicy {
    /// Surface `AssignmentFailed`.
    Fail,
    /// Degraded mode: one unguarded read-pick-write. May overshoot the cap
    /// under heavy contention.
    Fallback,
}

/// What the picker does when a pool cannot supply its quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShortfallPolicy {
    /// Fail with `InsufficientCapacity`; keeps the per-pool balance exact.
    Reject,
    /// Fill the deficit from other pools, least-assigned first.
    Backfill,
}

/// Knobs for the balanced assignment engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssignmentConfig {
    pub pools: Vec<PoolConfig>,

    /// Maximum number of participants a single image may be shown to.
    pub max_assignments_per_image: u32,

    /// Images handed to each participant, split evenly across pools.
    pub images_per_participant: usize,

    /// Attempts of the guarded select-and-commit before giving up.
    pub max_retries: u32,

    pub backoff: BackoffPolicy,

    pub concurrency: ConcurrencyMode,

    /// Age after which an advisory lock is considered abandoned.
    pub lock_timeout_ms: u64,

    pub on_exhaustion: ExhaustionPolicy,

    pub shortfall: ShortfallPolicy,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            pools: vec![
                PoolConfig::new("set1", 1, 1200),
                PoolConfig::new("set2", 1201, 1200),
            ],
            max_assignments_per_image: 5,
            images_per_participant: 10,
            max_retries: 3,
            backoff: BackoffPolicy::default(),
            concurrency: ConcurrencyMode::Transaction,
            lock_timeout_ms: 30_000,
            on_exhaustion: ExhaustionPolicy::Fail,
            shortfall: ShortfallPolicy::Reject,
        }
    }
}

impl AssignmentConfig {
    /// Quota drawn from each pool.
    pub fn images_per_pool(&self) -> usize {
        if self.pools.is_empty() {
            return 0;
        }
        self.images_per_participant / self.pools.len()
    }

    pub fn validate(&self) -> Result<(), AssignError> {
        if self.pools.is_empty() {
            return Err(AssignError::Config("no pools configured".into()));
        }

        let mut names = HashSet::new();
        for p in &self.pools {
            if p.size == 0 {
                return Err(AssignError::Config(format!("pool '{}' is empty", p.name)));
            }
            if p.name.is_empty() {
                return Err(AssignError::Config("pool with empty name".into()));
            }
            if p.first_number.checked_add(p.size - 1).is_none() {
                return Err(AssignError::Config(format!(
                    "pool '{}' numbering overflows",
                    p.name
                )));
            }
            if !names.insert(p.name.as_str()) {
                return Err(AssignError::Config(format!(
                    "duplicate pool name '{}'",
                    p.name
                )));
            }
        }

        for (i, a) in self.pools.iter().enumerate() {
            for b in &self.pools[i + 1..] {
                if a.contains(b.first_number) || b.contains(a.first_number) {
                    return Err(AssignError::Config(format!(
                        "pools '{}' and '{}' overlap",
                        a.name, b.name
                    )));
                }
            }
        }

        if self.max_assignments_per_image == 0 {
            return Err(AssignError::Config(
                "max_assignments_per_image must be > 0".into(),
            ));
        }
        if self.images_per_participant == 0
            || self.images_per_participant % self.pools.len() != 0
        {
            return Err(AssignError::Config(format!(
                "images_per_participant ({}) must be a positive multiple of the pool count ({})",
                self.images_per_participant,
                self.pools.len()
            )));
        }
        if self.max_retries == 0 {
            return Err(AssignError::Config("max_retries must be > 0".into()));
        }

        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string.
    pub database_url: String,

    /// Base URL images are served from; used to verify pools at init.
    pub blob_base_url: Option<String>,

    /// Emit JSON logs instead of the pretty format.
    pub json_logs: bool,

    pub assignment: AssignmentConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AssignError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unset keys fall back
    /// to defaults; malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AssignError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://allocator.db?mode=rwc".to_string());

        let mut a = AssignmentConfig::default();

        if let Some(raw) = lookup("ALLOC_POOLS") {
            a.pools = raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect::<Result<Vec<PoolConfig>, _>>()?;
        }
        if let Some(v) = parse_opt(&lookup, "ALLOC_MAX_PER_IMAGE")? {
            a.max_assignments_per_image = v;
        }
        if let Some(v) = parse_opt(&lookup, "ALLOC_IMAGES_PER_PARTICIPANT")? {
            a.images_per_participant = v;
        }
        if let Some(v) = parse_opt(&lookup, "ALLOC_MAX_RETRIES")? {
            a.max_retries = v;
        }
        if let Some(v) = parse_opt(&lookup, "ALLOC_BASE_DELAY_MS")? {
            a.backoff.base_delay_ms = v;
        }
        if let Some(v) = parse_opt(&lookup, "ALLOC_JITTER_MS")? {
            a.backoff.jitter_ms = v;
        }
        if let Some(v) = parse_opt(&lookup, "ALLOC_LOCK_TIMEOUT_MS")? {
            a.lock_timeout_ms = v;
        }
        if let Some(v) = lookup("ALLOC_BACKOFF") {
            a.backoff.kind = match v.as_str() {
                "linear" => BackoffKind::Linear,
                "exponential" => BackoffKind::Exponential,
                other => return Err(invalid("ALLOC_BACKOFF", other)),
            };
        }
        if let Some(v) = lookup("ALLOC_CONCURRENCY") {
            a.concurrency = match v.as_str() {
                "transaction" => ConcurrencyMode::Transaction,
                "lock" => ConcurrencyMode::AdvisoryLock,
                other => return Err(invalid("ALLOC_CONCURRENCY", other)),
            };
        }
        if let Some(v) = lookup("ALLOC_ON_EXHAUSTION") {
            a.on_exhaustion = match v.as_str() {
                "fail" => ExhaustionPolicy::Fail,
                "fallback" => ExhaustionPolicy::Fallback,
                other => return Err(invalid("ALLOC_ON_EXHAUSTION", other)),
            };
        }
        if let Some(v) = lookup("ALLOC_SHORTFALL") {
            a.shortfall = match v.as_str() {
                "reject" => ShortfallPolicy::Reject,
                "backfill" => ShortfallPolicy::Backfill,
                other => return Err(invalid("ALLOC_SHORTFALL", other)),
            };
        }

        a.validate()?;

        Ok(Self {
            database_url,
            blob_base_url: lookup("BLOB_BASE_URL").filter(|s| !s.is_empty()),
            json_logs: lookup("APP_ENV").as_deref() == Some("production"),
            assignment: a,
        })
    }
}

fn parse_opt<F, T>(lookup: &F, key: &str) -> Result<Option<T>, AssignError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AssignError::Config(format!("{key}='{raw}': {e}"))),
    }
}

fn invalid(key: &str, value: &str) -> AssignError {
    AssignError::Config(format!("{key}: unsupported value '{value}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_match_original_deployment() {
        let cfg = AppConfig::from_lookup(|_| None).unwrap();
        let a = &cfg.assignment;

        assert_eq!(a.pools.len(), 2);
        assert_eq!(a.pools[1].first_number, 1201);
        assert_eq!(a.pools[1].last_number(), 2400);
        assert_eq!(a.images_per_pool(), 5);
        assert_eq!(a.max_assignments_per_image, 5);
        assert_eq!(a.concurrency, ConcurrencyMode::Transaction);
        assert_eq!(a.on_exhaustion, ExhaustionPolicy::Fail);
        assert!(!cfg.json_logs);
    }

    #[test]
    fn env_overrides_are_applied() {
        let cfg = AppConfig::from_lookup(lookup_from(&[
            ("ALLOC_POOLS", "a:1:10, b:11:10"),
            ("ALLOC_MAX_PER_IMAGE", "3"),
            ("ALLOC_IMAGES_PER_PARTICIPANT", "4"),
            ("ALLOC_CONCURRENCY", "lock"),
            ("ALLOC_ON_EXHAUSTION", "fallback"),
            ("ALLOC_SHORTFALL", "backfill"),
            ("ALLOC_BACKOFF", "linear"),
            ("APP_ENV", "production"),
        ]))
        .unwrap();

        let a = &cfg.assignment;
        assert_eq!(a.pools, vec![PoolConfig::new("a", 1, 10), PoolConfig::new("b", 11, 10)]);
        assert_eq!(a.max_assignments_per_image, 3);
        assert_eq!(a.images_per_pool(), 2);
        assert_eq!(a.concurrency, ConcurrencyMode::AdvisoryLock);
        assert_eq!(a.on_exhaustion, ExhaustionPolicy::Fallback);
        assert_eq!(a.shortfall, ShortfallPolicy::Backfill);
        assert_eq!(a.backoff.kind, BackoffKind::Linear);
        assert!(cfg.json_logs);
    }

    #[test]
    fn malformed_value_is_an_error_not_a_default() {
        let err = AppConfig::from_lookup(lookup_from(&[("ALLOC_MAX_RETRIES", "three")]))
            .unwrap_err();
        assert!(matches!(err, AssignError::Config(_)));

        let err = AppConfig::from_lookup(lookup_from(&[("ALLOC_SHORTFALL", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, AssignError::Config(_)));
    }

    #[test]
    fn uneven_split_is_rejected() {
        let cfg = AssignmentConfig {
            images_per_participant: 9,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overlapping_pools_are_rejected() {
        let cfg = AssignmentConfig {
            pools: vec![PoolConfig::new("a", 1, 10), PoolConfig::new("b", 10, 10)],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn duplicate_and_empty_pools_are_rejected() {
        let dup = AssignmentConfig {
            pools: vec![PoolConfig::new("a", 1, 10), PoolConfig::new("a", 11, 10)],
            ..Default::default()
        };
        assert!(dup.validate().is_err());

        let empty = AssignmentConfig {
            pools: vec![PoolConfig::new("a", 1, 0), PoolConfig::new("b", 11, 10)],
            ..Default::default()
        };
        assert!(empty.validate().is_err());
    }

    #[test]
    fn pool_spec_parsing() {
        let p: PoolConfig = "set2:1201:1200".parse().unwrap();
        assert_eq!(p, PoolConfig::new("set2", 1201, 1200));
        assert!(p.contains(2400));
        assert!(!p.contains(2401));
        assert!("set2:1201".parse::<PoolConfig>().is_err());
    }
}
