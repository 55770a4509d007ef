//! Atomic commit: one read-decide-write attempt against the store.
//!
//! [`decide`] is a pure function of a ledger snapshot; [`select_and_commit`]
//! is the thin shell that reads fresh state, calls it, and hands the result
//! to the store as a single all-or-nothing write.

use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::assignment::picker::pick_balanced;
use crate::assignment::types::{
    AssignedImage, AssignmentLogEntry, AssignmentMethod, ImageAssignment,
};
use crate::config::AssignmentConfig;
use crate::error::AssignError;
use crate::ledger::availability::available_by_pool;
use crate::ledger::model::{ImageRef, Ledger, LedgerSnapshot};
use crate::logger::warn_if_slow;
use crate::store::{AssignmentStore, CommitOutcome, CommitRequest};
use crate::time::now_ms;

/// The next ledger plus the batch that produced it.
#[derive(Clone, Debug)]
pub struct Decision {
    pub ledger: Ledger,
    pub assignment: ImageAssignment,
}

/// How an attempt settled.
#[derive(Clone, Debug)]
pub enum Settled {
    Committed {
        assignment: ImageAssignment,
        version: u64,
    },
    /// Another request for the same participant committed first.
    Existing(ImageAssignment),
}

/// Picks a batch from `ledger` and applies it to a copy.
///
/// A selection the ledger refuses means the snapshot was inconsistent with
/// itself; that is reported as contention so the caller re-reads.
pub fn decide<R: Rng + ?Sized>(
    ledger: &Ledger,
    cfg: &AssignmentConfig,
    participant_id: &str,
    attempt: u32,
    method: AssignmentMethod,
    now_ms: u64,
    rng: &mut R,
) -> Result<Decision, AssignError> {
    let mut next = ledger.clone();
    next.ensure_configured(cfg);
    next.meta.max_assignments_per_image = cfg.max_assignments_per_image;
    next.meta.images_per_participant = cfg.images_per_participant;
    next.meta.images_per_pool = cfg.images_per_pool();

    let availability = available_by_pool(&next, cfg);
    let picked = pick_balanced(&availability, cfg.images_per_pool(), cfg.shortfall, rng)?;

    let refs: Vec<ImageRef> = picked.iter().map(|p| p.image.clone()).collect();
    next.apply(&refs, cfg.max_assignments_per_image, participant_id, now_ms)
        .map_err(|e| AssignError::Contention(format!("ledger rejected selection: {e}")))?;

    let images = picked
        .into_iter()
        .map(|p| AssignedImage {
            path: p.image.path(),
            pool: p.image.pool,
            number: p.image.number,
            assignment_count_at_assignment: p.assignment_count,
        })
        .collect();

    Ok(Decision {
        ledger: next,
        assignment: ImageAssignment {
            participant_id: participant_id.to_string(),
            images,
            log_id: Uuid::new_v4().to_string(),
            method,
            attempt,
            assigned_at_ms: now_ms,
        },
    })
}

/// Reads the ledger, creating a fresh one on first use.
pub async fn load_or_create_ledger(
    store: &dyn AssignmentStore,
    cfg: &AssignmentConfig,
) -> anyhow::Result<LedgerSnapshot> {
    let loaded = warn_if_slow("load_ledger", Duration::from_millis(100), store.load_ledger())
        .await
        .context("failed to load ledger")?;

    match loaded {
        Some(snap) => Ok(snap),
        None => {
            debug!("no ledger yet; creating");
            store
                .create_ledger_if_absent(Ledger::initial(cfg, now_ms()))
                .await
                .context("failed to create ledger")
        }
    }
}

/// One guarded attempt.
///
/// `Transaction` and `AdvisoryLock` commit with a compare-and-swap on the
/// version read here. The lock only serializes assigners; an admin reset
/// does not take it and is caught by the version check. `Fallback` writes
/// unconditionally.
#[instrument(
    skip(store, cfg),
    target = "engine",
    fields(version = tracing::field::Empty)
)]
pub async fn select_and_commit(
    store: &dyn AssignmentStore,
    cfg: &AssignmentConfig,
    participant_id: &str,
    attempt: u32,
    method: AssignmentMethod,
) -> Result<Settled, AssignError> {
    let snapshot = load_or_create_ledger(store, cfg).await?;
    tracing::Span::current().record("version", snapshot.version);

    let decision = {
        let mut rng = rand::rng();
        decide(
            &snapshot.ledger,
            cfg,
            participant_id,
            attempt,
            method,
            now_ms(),
            &mut rng,
        )?
    };

    let expected_version = match method {
        AssignmentMethod::Transaction | AssignmentMethod::AdvisoryLock => {
            Some(snapshot.version)
        }
        AssignmentMethod::Fallback => None,
    };

    let assignment = decision.assignment;
    let req = CommitRequest {
        expected_version,
        ledger: decision.ledger,
        log: AssignmentLogEntry::for_assignment(&assignment),
        assignment: assignment.clone(),
    };

    let outcome = warn_if_slow("commit", Duration::from_millis(200), store.commit(req))
        .await
        .context("failed to commit assignment")?;

    match outcome {
        CommitOutcome::Committed { version } => {
            debug!(version, images = assignment.images.len(), "assignment committed");
            Ok(Settled::Committed {
                assignment,
                version,
            })
        }
        CommitOutcome::Conflict => Err(AssignError::Contention(format!(
            "ledger moved past version {} before commit",
            snapshot.version
        ))),
        CommitOutcome::AlreadyAssigned(existing) => Ok(Settled::Existing(existing)),
    }
}
