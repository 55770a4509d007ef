use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::assignment::types::{AssignmentLogEntry, ImageAssignment};
use crate::ledger::model::{Ledger, LedgerSnapshot};
use crate::store::{
    AssignmentStore, CommitOutcome, CommitRequest, LockAcquisition, classify_existing_lock,
};

#[derive(Default)]
struct State {
    ledger: Option<LedgerSnapshot>,
    assignments: HashMap<String, ImageAssignment>,
    logs: Vec<AssignmentLogEntry>,
    lock: Option<(String, u64)>,
}

/// In-process store. A single mutex makes every operation atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored participant assignments.
    pub fn assignment_count(&self) -> usize {
        self.state.lock().assignments.len()
    }

    /// Current lock holder, if any.
    pub fn lock_holder(&self) -> Option<String> {
        self.state.lock().lock.as_ref().map(|(h, _)| h.clone())
    }

    /// Plants a lock as if another process held it since `acquired_at_ms`.
    pub fn plant_lock(&self, holder: &str, acquired_at_ms: u64) {
        self.state.lock().lock = Some((holder.to_string(), acquired_at_ms));
    }
}

#[async_trait]
impl AssignmentStore for MemoryStore {
    async fn load_ledger(&self) -> Result<Option<LedgerSnapshot>> {
        Ok(self.state.lock().ledger.clone())
    }

    async fn create_ledger_if_absent(&self, ledger: Ledger) -> Result<LedgerSnapshot> {
        let mut st = self.state.lock();
        let snap = st
            .ledger
            .get_or_insert_with(|| LedgerSnapshot { version: 1, ledger });
        Ok(snap.clone())
    }

    async fn find_assignment(&self, participant_id: &str) -> Result<Option<ImageAssignment>> {
        Ok(self.state.lock().assignments.get(participant_id).cloned())
    }

    async fn commit(&self, req: CommitRequest) -> Result<CommitOutcome> {
        let mut st = self.state.lock();

        if let Some(existing) = st.assignments.get(&req.assignment.participant_id) {
            return Ok(CommitOutcome::AlreadyAssigned(existing.clone()));
        }

        let current = st.ledger.as_ref().map(|s| s.version).unwrap_or(0);
        if let Some(expected) = req.expected_version {
            if expected != current {
                return Ok(CommitOutcome::Conflict);
            }
        }

        let version = current + 1;
        st.ledger = Some(LedgerSnapshot {
            version,
            ledger: req.ledger,
        });
        st.assignments
            .insert(req.assignment.participant_id.clone(), req.assignment);
        st.logs.push(req.log);

        Ok(CommitOutcome::Committed { version })
    }

    async fn reset_ledger(&self, ledger: Ledger) -> Result<u64> {
        let mut st = self.state.lock();
        let version = st.ledger.as_ref().map(|s| s.version).unwrap_or(0) + 1;
        st.ledger = Some(LedgerSnapshot { version, ledger });
        Ok(version)
    }

    async fn try_acquire_lock(
        &self,
        holder: &str,
        now_ms: u64,
        timeout_ms: u64,
    ) -> Result<LockAcquisition> {
        let mut st = self.state.lock();

        let outcome = match &st.lock {
            None => LockAcquisition::Acquired,
            Some((current, at)) => classify_existing_lock(current, *at, now_ms, timeout_ms),
        };

        if outcome.is_acquired() {
            st.lock = Some((holder.to_string(), now_ms));
        }
        Ok(outcome)
    }

    async fn release_lock(&self, holder: &str) -> Result<bool> {
        let mut st = self.state.lock();
        match &st.lock {
            Some((current, _)) if current == holder => {
                st.lock = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recent_logs(&self, limit: usize) -> Result<Vec<AssignmentLogEntry>> {
        let st = self.state.lock();
        Ok(st.logs.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment::types::AssignmentMethod;
    use crate::config::{AssignmentConfig, PoolConfig};

    fn ledger() -> Ledger {
        let cfg = AssignmentConfig {
            pools: vec![PoolConfig::new("a", 1, 2)],
            images_per_participant: 1,
            ..Default::default()
        };
        Ledger::initial(&cfg, 0)
    }

    fn request(pid: &str, expected: Option<u64>) -> CommitRequest {
        let assignment = ImageAssignment {
            participant_id: pid.into(),
            images: vec![],
            log_id: format!("log-{pid}"),
            method: AssignmentMethod::Transaction,
            attempt: 1,
            assigned_at_ms: 0,
        };
        CommitRequest {
            expected_version: expected,
            ledger: ledger(),
            log: AssignmentLogEntry::for_assignment(&assignment),
            assignment,
        }
    }

    #[tokio::test]
    async fn create_if_absent_keeps_the_first_ledger() {
        let store = MemoryStore::new();
        let first = store.create_ledger_if_absent(ledger()).await.unwrap();

        let mut other = ledger();
        other.meta.total_assignments = 99;
        let second = store.create_ledger_if_absent(other).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn stale_version_conflicts() {
        let store = MemoryStore::new();
        store.create_ledger_if_absent(ledger()).await.unwrap();

        let ok = store.commit(request("p1", Some(1))).await.unwrap();
        assert_eq!(ok, CommitOutcome::Committed { version: 2 });

        let stale = store.commit(request("p2", Some(1))).await.unwrap();
        assert_eq!(stale, CommitOutcome::Conflict);
        assert_eq!(store.assignment_count(), 1);
        assert_eq!(store.recent_logs(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_commit_for_participant_returns_the_first() {
        let store = MemoryStore::new();
        store.create_ledger_if_absent(ledger()).await.unwrap();
        store.commit(request("p1", None)).await.unwrap();

        match store.commit(request("p1", None)).await.unwrap() {
            CommitOutcome::AlreadyAssigned(a) => assert_eq!(a.log_id, "log-p1"),
            other => panic!("expected AlreadyAssigned, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reset_bumps_version_and_keeps_assignments() {
        let store = MemoryStore::new();
        store.create_ledger_if_absent(ledger()).await.unwrap();
        store.commit(request("p1", Some(1))).await.unwrap();

        let v = store.reset_ledger(ledger()).await.unwrap();
        assert_eq!(v, 3);
        assert!(store.find_assignment("p1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lock_lifecycle() {
        let store = MemoryStore::new();

        assert_eq!(
            store.try_acquire_lock("a", 0, 30_000).await.unwrap(),
            LockAcquisition::Acquired
        );
        assert!(matches!(
            store.try_acquire_lock("b", 10, 30_000).await.unwrap(),
            LockAcquisition::Held { .. }
        ));
        assert!(!store.release_lock("b").await.unwrap());
        assert_eq!(store.lock_holder().as_deref(), Some("a"));

        let taken = store.try_acquire_lock("b", 40_000, 30_000).await.unwrap();
        assert_eq!(
            taken,
            LockAcquisition::Overrode {
                previous_holder: "a".into(),
                age_ms: 40_000
            }
        );
        assert!(!store.release_lock("a").await.unwrap());
        assert!(store.release_lock("b").await.unwrap());
        assert_eq!(store.lock_holder(), None);
    }
}
