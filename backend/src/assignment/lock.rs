use std::future::Future;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::AssignError;
use crate::metrics::counters::Counters;
use crate::store::{AssignmentStore, LockAcquisition};
use crate::time::now_ms;

/// Unique per attempt: `{pid}#{uuid}`.
pub fn lock_holder_id() -> String {
    format!("{}#{}", std::process::id(), Uuid::new_v4())
}

/// Runs `f` while holding the advisory lock.
///
/// A live lock held by someone else is `Contention`. A stale one is taken
/// over and counted. The lock is released after `f` whatever it returned;
/// a failed release is logged, never surfaced.
pub async fn with_lock<F, Fut, T>(
    store: &dyn AssignmentStore,
    holder: &str,
    timeout_ms: u64,
    counters: &Counters,
    f: F,
) -> Result<T, AssignError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AssignError>>,
{
    match store.try_acquire_lock(holder, now_ms(), timeout_ms).await? {
        LockAcquisition::Acquired => debug!(holder, "advisory lock acquired"),
        LockAcquisition::Overrode {
            previous_holder,
            age_ms,
        } => {
            Counters::bump(&counters.stale_lock_overrides);
            warn!(
                holder,
                previous_holder = %previous_holder,
                age_ms,
                "overriding stale advisory lock"
            );
        }
        LockAcquisition::Held {
            holder: other,
            age_ms,
        } => {
            return Err(AssignError::Contention(format!(
                "advisory lock held by {other} for {age_ms}ms"
            )));
        }
    }

    let out = f().await;

    match store.release_lock(holder).await {
        Ok(true) => debug!(holder, "advisory lock released"),
        Ok(false) => warn!(holder, "advisory lock was taken over before release"),
        Err(e) => warn!(holder, error = %e, "failed to release advisory lock"),
    }

    out
}
