//! Persistence seam between the assignment engine and a backing store.

pub mod memory;
pub mod repository_sqlx;

use anyhow::Result;
use async_trait::async_trait;

use crate::assignment::types::{AssignmentLogEntry, ImageAssignment};
use crate::ledger::model::{Ledger, LedgerSnapshot};

/// Everything one assignment writes, committed as a unit.
#[derive(Clone, Debug)]
pub struct CommitRequest {
    /// Compare-and-swap guard. `None` writes unconditionally.
    pub expected_version: Option<u64>,
    pub ledger: Ledger,
    pub assignment: ImageAssignment,
    pub log: AssignmentLogEntry,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { version: u64 },
    /// The ledger moved on since it was read; nothing was written.
    Conflict,
    /// The participant already holds an assignment; nothing was written.
    AlreadyAssigned(ImageAssignment),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockAcquisition {
    Acquired,
    /// A lock older than the timeout was taken over.
    Overrode { previous_holder: String, age_ms: u64 },
    Held { holder: String, age_ms: u64 },
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        !matches!(self, LockAcquisition::Held { .. })
    }
}

#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>>;

    /// Stores `ledger` at version 1 unless a ledger exists; returns whichever
    /// is current afterwards.
    async fn create_ledger_if_absent(&self, ledger: Ledger) -> Result<LedgerSnapshot>;

    async fn find_assignment(&self, participant_id: &str) -> Result<Option<ImageAssignment>>;

    async fn commit(&self, req: CommitRequest) -> Result<CommitOutcome>;

    /// Replaces the ledger and bumps its version. Participant records and
    /// logs are kept.
    async fn reset_ledger(&self, ledger: Ledger) -> Result<u64>;

    async fn try_acquire_lock(
        &self,
        holder: &str,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Result<LockAcquisition>;

    /// Deletes the lock only if `holder` still owns it.
    async fn release_lock(&self, holder: &str) -> Result<bool>;

    /// Newest first.
    async fn recent_logs(&self, limit: usize) -> Result<Vec<AssignmentLogEntry>>;
}

/// Decides whether an existing lock may be taken over.
pub fn classify_existing_lock(
    holder: &str,
    acquired_at_ms: u64,
    now_ms: u64,
    timeout_ms: u64,
) -> LockAcquisition {
    let age_ms = now_ms.saturating_sub(acquired_at_ms);
    if age_ms > timeout_ms {
        LockAcquisition::Overrode {
            previous_holder: holder.to_string(),
            age_ms,
        }
    } else {
        LockAcquisition::Held {
            holder: holder.to_string(),
            age_ms,
        }
    }
}
