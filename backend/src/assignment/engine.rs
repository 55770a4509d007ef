use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::assignment::backoff::next_delay;
use crate::assignment::commit::{Settled, select_and_commit};
use crate::assignment::lock::{lock_holder_id, with_lock};
use crate::assignment::types::{AssignmentLogEntry, AssignmentMethod, ImageAssignment};
use crate::blob::{BlobStore, StorageReport, verify_pools};
use crate::config::{AssignmentConfig, ConcurrencyMode, ExhaustionPolicy};
use crate::error::AssignError;
use crate::ledger::model::{Ledger, LedgerSnapshot};
use crate::ledger::stats::{self, CapacityReport, LedgerStats};
use crate::logger::warn_if_slow;
use crate::metrics::counters::Counters;
use crate::store::AssignmentStore;
use crate::time::now_ms;

#[derive(Clone, Debug, Serialize)]
pub struct InitReport {
    pub ledger_version: u64,
    pub storage: Option<StorageReport>,
}

/// Balanced, cap-bounded image assignment over a shared store.
///
/// Holds no in-process ledger state: every operation reads the store, so
/// any number of engines may run against the same backend.
pub struct AssignmentEngine {
    store: Arc<dyn AssignmentStore>,
    cfg: AssignmentConfig,
    counters: Counters,
}

impl AssignmentEngine {
    pub fn new(store: Arc<dyn AssignmentStore>, cfg: AssignmentConfig) -> Result<Self, AssignError> {
        cfg.validate()?;
        Ok(Self {
            store,
            cfg,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &AssignmentConfig {
        &self.cfg
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Verifies pool storage (when given) and creates the ledger if absent.
    #[instrument(skip_all, target = "engine")]
    pub async fn initialize(&self, blobs: Option<&dyn BlobStore>) -> Result<InitReport, AssignError> {
        let storage = match blobs {
            Some(b) => Some(verify_pools(b, &self.cfg).await?),
            None => {
                debug!("no blob store given; skipping storage verification");
                None
            }
        };

        let snap = self
            .store
            .create_ledger_if_absent(Ledger::initial(&self.cfg, now_ms()))
            .await
            .context("failed to initialize ledger")?;

        info!(
            version = snap.version,
            pools = self.cfg.pools.len(),
            "ledger ready"
        );

        Ok(InitReport {
            ledger_version: snap.version,
            storage,
        })
    }

    /// Hands `participant_id` a balanced batch, or returns the one they
    /// already hold.
    ///
    /// The batch size is `images_per_participant` from the configuration.
    #[instrument(skip(self), target = "engine")]
    pub async fn assign(&self, participant_id: &str) -> Result<ImageAssignment, AssignError> {
        if participant_id.trim().is_empty() {
            return Err(AssignError::InvalidParticipant(participant_id.to_string()));
        }

        let existing = warn_if_slow(
            "find_assignment",
            Duration::from_millis(100),
            self.store.find_assignment(participant_id),
        )
        .await
        .context("failed to look up existing assignment")?;

        if let Some(a) = existing {
            Counters::bump(&self.counters.reused);
            info!(log_id = %a.log_id, "participant already assigned; returning existing batch");
            return Ok(a);
        }

        let max = self.cfg.max_retries;
        let mut last_error = String::new();

        for attempt in 1..=max {
            match self.attempt(participant_id, attempt).await {
                Ok(settled) => return Ok(self.settle(settled)),
                Err(e @ AssignError::InsufficientCapacity { .. }) => {
                    Counters::bump(&self.counters.insufficient);
                    warn!(attempt, error = %e, "capacity exhausted");
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    if matches!(e, AssignError::Store(_)) {
                        Counters::bump(&self.counters.store_errors);
                    } else {
                        Counters::bump(&self.counters.contention);
                    }
                    last_error = e.to_string();

                    if attempt < max {
                        let delay = {
                            let mut rng = rand::rng();
                            next_delay(&self.cfg.backoff, attempt, &mut rng)
                        };
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "attempt failed; backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        match self.cfg.on_exhaustion {
            ExhaustionPolicy::Fail => {
                Counters::bump(&self.counters.failed);
                error!(attempts = max, last_error = %last_error, "assignment failed");
                Err(AssignError::AssignmentFailed {
                    attempts: max,
                    last_error,
                })
            }
            ExhaustionPolicy::Fallback => self.fallback(participant_id, max, last_error).await,
        }
    }

    async fn attempt(&self, participant_id: &str, attempt: u32) -> Result<Settled, AssignError> {
        let store = self.store.as_ref();
        match self.cfg.concurrency {
            ConcurrencyMode::Transaction => {
                select_and_commit(
                    store,
                    &self.cfg,
                    participant_id,
                    attempt,
                    AssignmentMethod::Transaction,
                )
                .await
            }
            ConcurrencyMode::AdvisoryLock => {
                let holder = lock_holder_id();
                with_lock(
                    store,
                    &holder,
                    self.cfg.lock_timeout_ms,
                    &self.counters,
                    || {
                        select_and_commit(
                            store,
                            &self.cfg,
                            participant_id,
                            attempt,
                            AssignmentMethod::AdvisoryLock,
                        )
                    },
                )
                .await
            }
        }
    }

    /// Degraded mode: one unguarded read-pick-write. Concurrent fallbacks
    /// can overshoot the cap.
    async fn fallback(
        &self,
        participant_id: &str,
        retries: u32,
        last_error: String,
    ) -> Result<ImageAssignment, AssignError> {
        Counters::bump(&self.counters.fallback);
        warn!(
            attempts = retries,
            last_error = %last_error,
            "retries exhausted; falling back to unguarded assignment"
        );

        let attempt = retries + 1;
        match select_and_commit(
            self.store.as_ref(),
            &self.cfg,
            participant_id,
            attempt,
            AssignmentMethod::Fallback,
        )
        .await
        {
            Ok(settled) => Ok(self.settle(settled)),
            Err(e @ AssignError::InsufficientCapacity { .. }) => {
                Counters::bump(&self.counters.insufficient);
                Err(e)
            }
            Err(e) => {
                Counters::bump(&self.counters.failed);
                error!(error = %e, "fallback assignment failed");
                Err(AssignError::AssignmentFailed {
                    attempts: attempt,
                    last_error: e.to_string(),
                })
            }
        }
    }

    fn settle(&self, settled: Settled) -> ImageAssignment {
        match settled {
            Settled::Committed {
                assignment,
                version,
            } => {
                Counters::bump(&self.counters.committed);
                info!(
                    log_id = %assignment.log_id,
                    method = %assignment.method,
                    attempt = assignment.attempt,
                    version,
                    "assignment committed"
                );
                assignment
            }
            Settled::Existing(a) => {
                Counters::bump(&self.counters.reused);
                info!(log_id = %a.log_id, "concurrent request already assigned participant");
                a
            }
        }
    }

    /// Current ledger, or a fresh one if none was stored yet. Never writes.
    async fn snapshot(&self) -> Result<LedgerSnapshot, AssignError> {
        let loaded = self
            .store
            .load_ledger()
            .await
            .context("failed to load ledger")?;

        Ok(loaded.unwrap_or_else(|| LedgerSnapshot {
            version: 0,
            ledger: Ledger::initial(&self.cfg, now_ms()),
        }))
    }

    #[instrument(skip(self), target = "engine")]
    pub async fn capacity(&self) -> Result<CapacityReport, AssignError> {
        let snap = self.snapshot().await?;
        Ok(stats::capacity(&snap.ledger, &self.cfg))
    }

    #[instrument(skip(self), target = "engine")]
    pub async fn statistics(&self) -> Result<LedgerStats, AssignError> {
        let snap = self.snapshot().await?;
        Ok(stats::statistics(&snap.ledger, &self.cfg))
    }

    /// Zeroes every count. Idempotent; in-flight compare-and-swap commits
    /// observe the version bump and retry against the zeroed ledger.
    #[instrument(skip(self), target = "engine")]
    pub async fn reset_all_counts(&self) -> Result<u64, AssignError> {
        let version = self
            .store
            .reset_ledger(Ledger::reset(&self.cfg, now_ms()))
            .await
            .context("failed to reset ledger")?;

        warn!(version, "all assignment counts reset");
        Ok(version)
    }

    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<AssignmentLogEntry>, AssignError> {
        Ok(self
            .store
            .recent_logs(limit)
            .await
            .context("failed to read assignment logs")?)
    }
}
