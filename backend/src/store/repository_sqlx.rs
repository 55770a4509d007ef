use anyhow::{Context, anyhow};
use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::{debug, warn};

use crate::assignment::types::{AssignedImage, AssignmentLogEntry, ImageAssignment};
use crate::ledger::model::{Ledger, LedgerSnapshot};
use crate::store::{
    AssignmentStore, CommitOutcome, CommitRequest, LockAcquisition, classify_existing_lock,
};

/// SQLx-backed implementation of AssignmentStore.
///
/// The ledger is a single JSON document guarded by a version column; every
/// commit is one database transaction.
pub struct SqlxAssignmentStore {
    pool: AnyPool,
}

impl SqlxAssignmentStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssignmentStore for SqlxAssignmentStore {
    async fn load_ledger(&self) -> anyhow::Result<Option<LedgerSnapshot>> {
        let row = sqlx::query(r#"SELECT version, document FROM ledger WHERE id = 1;"#)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_snapshot(&r)?)),
            None => Ok(None),
        }
    }

    async fn create_ledger_if_absent(&self, ledger: Ledger) -> anyhow::Result<LedgerSnapshot> {
        let doc = serde_json::to_string(&ledger).context("serialize ledger")?;
        let updated = u64_to_i64(ledger.meta.last_updated_ms)?;

        let inserted = sqlx::query(INSERT_LEDGER_IF_ABSENT)
        .bind(doc)
        .bind(updated)
        .execute(&self.pool)
        .await
        .context("insert initial ledger")?;

        if inserted.rows_affected() > 0 {
            debug!("created ledger document");
            return Ok(LedgerSnapshot { version: 1, ledger });
        }

        self.load_ledger()
            .await?
            .ok_or_else(|| anyhow!("ledger vanished right after create"))
    }

    async fn find_assignment(
        &self,
        participant_id: &str,
    ) -> anyhow::Result<Option<ImageAssignment>> {
        let row = sqlx::query(SELECT_ASSIGNMENT)
        .bind(participant_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(row_to_assignment(&r)?)),
            None => Ok(None),
        }
    }

    async fn commit(&self, req: CommitRequest) -> anyhow::Result<CommitOutcome> {
        match self.commit_tx(&req).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if is_contention(&e) || is_unique_violation(&e) => {
                debug!(error = %e, "commit lost a write race");
                Ok(CommitOutcome::Conflict)
            }
            Err(e) => Err(anyhow::Error::new(e).context("commit assignment")),
        }
    }

    async fn reset_ledger(&self, ledger: Ledger) -> anyhow::Result<u64> {
        let doc = serde_json::to_string(&ledger).context("serialize ledger")?;
        let updated = u64_to_i64(ledger.meta.last_updated_ms)?;

        let mut tx = self.pool.begin().await?;
        let current = current_version(&mut tx).await?;

        let version = match current {
            Some(v) => {
                sqlx::query(OVERWRITE_LEDGER)
                .bind(doc)
                .bind(updated)
                .execute(&mut *tx)
                .await?;
                v + 1
            }
            None => {
                sqlx::query(INSERT_LEDGER)
                .bind(doc)
                .bind(updated)
                .execute(&mut *tx)
                .await?;
                1
            }
        };

        tx.commit().await.context("commit ledger reset")?;
        Ok(version)
    }

    async fn try_acquire_lock(
        &self,
        holder: &str,
        now_ms: u64,
        timeout_ms: u64,
    ) -> anyhow::Result<LockAcquisition> {
        let now = u64_to_i64(now_ms)?;

        let existing = sqlx::query(r#"SELECT holder, acquired_ms FROM assignment_lock WHERE id = 1;"#)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = existing else {
            let res = sqlx::query(INSERT_LOCK)
            .bind(holder.to_string())
            .bind(now)
            .execute(&self.pool)
            .await;

            return match res {
                Ok(_) => Ok(LockAcquisition::Acquired),
                // Someone inserted between our read and write.
                Err(e) if is_unique_violation(&e) || is_contention(&e) => {
                    Ok(LockAcquisition::Held {
                        holder: "unknown".to_string(),
                        age_ms: 0,
                    })
                }
                Err(e) => Err(anyhow::Error::new(e).context("insert lock")),
            };
        };

        let current: String = row.get("holder");
        let acquired_ms = i64_to_u64(row.get("acquired_ms"))?;

        let outcome = classify_existing_lock(&current, acquired_ms, now_ms, timeout_ms);
        if !outcome.is_acquired() {
            return Ok(outcome);
        }

        // Take over only the exact stale row we saw.
        let res = sqlx::query(TAKE_OVER_LOCK)
        .bind(holder.to_string())
        .bind(now)
        .bind(current.clone())
        .bind(u64_to_i64(acquired_ms)?)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Ok(LockAcquisition::Held {
                holder: "unknown".to_string(),
                age_ms: 0,
            });
        }
        Ok(outcome)
    }

    async fn release_lock(&self, holder: &str) -> anyhow::Result<bool> {
        let res = sqlx::query(DELETE_LOCK)
            .bind(holder.to_string())
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn recent_logs(&self, limit: usize) -> anyhow::Result<Vec<AssignmentLogEntry>> {
        let rows = sqlx::query(SELECT_RECENT_LOGS)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_log(&r) {
                Ok(l) => out.push(l),
                Err(e) => {
                    warn!(error = %e, "skipping malformed log row");
                }
            }
        }
        Ok(out)
    }
}

impl SqlxAssignmentStore {
    async fn commit_tx(&self, req: &CommitRequest) -> Result<CommitOutcome, sqlx::Error> {
        let a = &req.assignment;
        let doc = serde_json::to_string(&req.ledger).map_err(encode_err)?;
        let images = serde_json::to_string(&a.images).map_err(encode_err)?;
        let image_ids = serde_json::to_string(&req.log.image_ids).map_err(encode_err)?;
        let updated = u64_to_i64(req.ledger.meta.last_updated_ms).map_err(encode_err)?;
        let assigned = u64_to_i64(a.assigned_at_ms).map_err(encode_err)?;
        let created = u64_to_i64(req.log.created_ms).map_err(encode_err)?;

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(SELECT_ASSIGNMENT)
        .bind(a.participant_id.clone())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(r) = existing {
            tx.rollback().await?;
            let prior = row_to_assignment(&r).map_err(encode_err)?;
            return Ok(CommitOutcome::AlreadyAssigned(prior));
        }

        let res = match req.expected_version {
            Some(expected) => {
                sqlx::query(SWAP_LEDGER)
                .bind(doc)
                .bind(updated)
                .bind(u64_to_i64(expected).map_err(encode_err)?)
                .execute(&mut *tx)
                .await?
            }
            None => {
                sqlx::query(OVERWRITE_LEDGER)
                .bind(doc)
                .bind(updated)
                .execute(&mut *tx)
                .await?
            }
        };

        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(CommitOutcome::Conflict);
        }

        let version = current_version(&mut tx)
            .await?
            .ok_or_else(|| encode_err(anyhow!("ledger row missing inside commit")))?;

        sqlx::query(INSERT_ASSIGNMENT)
        .bind(a.participant_id.clone())
        .bind(a.log_id.clone())
        .bind(a.method.as_str().to_string())
        .bind(a.attempt as i64)
        .bind(assigned)
        .bind(images)
        .execute(&mut *tx)
        .await?;

        sqlx::query(INSERT_LOG)
        .bind(req.log.log_id.clone())
        .bind(req.log.participant_id.clone())
        .bind(image_ids)
        .bind(created)
        .bind(req.log.attempt as i64)
        .bind(req.log.method.as_str().to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CommitOutcome::Committed { version })
    }
}

async fn current_version(tx: &mut Transaction<'_, Any>) -> Result<Option<u64>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT version FROM ledger WHERE id = 1;"#)
        .fetch_optional(&mut **tx)
        .await?;

    match row {
        Some(r) => Ok(Some(i64_to_u64(r.get("version")).map_err(encode_err)?)),
        None => Ok(None),
    }
}

/* =========================
Statements
========================= */

// Numbered placeholders: the Any driver hands SQL through verbatim, and
// `$N` is the one form both SQLite and Postgres accept.

const INSERT_LEDGER_IF_ABSENT: &str = r#"
INSERT INTO ledger (id, version, document, updated_ms)
VALUES (1, 1, $1, $2)
ON CONFLICT (id) DO NOTHING;
"#;

const INSERT_LEDGER: &str =
    r#"INSERT INTO ledger (id, version, document, updated_ms) VALUES (1, 1, $1, $2);"#;

const OVERWRITE_LEDGER: &str =
    r#"UPDATE ledger SET version = version + 1, document = $1, updated_ms = $2 WHERE id = 1;"#;

const SWAP_LEDGER: &str = r#"
UPDATE ledger SET version = version + 1, document = $1, updated_ms = $2
WHERE id = 1 AND version = $3;
"#;

const SELECT_ASSIGNMENT: &str = r#"
SELECT participant_id, log_id, method, attempt, assigned_ms, images
FROM participant_assignments
WHERE participant_id = $1;
"#;

const INSERT_ASSIGNMENT: &str = r#"
INSERT INTO participant_assignments (participant_id, log_id, method, attempt, assigned_ms, images)
VALUES ($1, $2, $3, $4, $5, $6);
"#;

const INSERT_LOG: &str = r#"
INSERT INTO assignment_logs (log_id, participant_id, image_ids, created_ms, attempt, method)
VALUES ($1, $2, $3, $4, $5, $6);
"#;

const SELECT_RECENT_LOGS: &str = r#"
SELECT log_id, participant_id, image_ids, created_ms, attempt, method
FROM assignment_logs
ORDER BY created_ms DESC, log_id DESC
LIMIT $1;
"#;

const INSERT_LOCK: &str =
    r#"INSERT INTO assignment_lock (id, holder, acquired_ms) VALUES (1, $1, $2);"#;

const TAKE_OVER_LOCK: &str = r#"
UPDATE assignment_lock SET holder = $1, acquired_ms = $2
WHERE id = 1 AND holder = $3 AND acquired_ms = $4;
"#;

const DELETE_LOCK: &str = r#"DELETE FROM assignment_lock WHERE id = 1 AND holder = $1;"#;

/* =========================
Error classification
========================= */

/// SQLite BUSY/LOCKED, Postgres serialization failure or deadlock, and
/// pool exhaustion all mean "someone else is writing": retry.
fn is_contention(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if matches!(code.as_str(), "5" | "6" | "262" | "517" | "40001" | "40P01") {
                return true;
            }
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked")
                || msg.contains("database table is locked")
                || msg.contains("could not serialize")
        }
        _ => false,
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            db.is_unique_violation() || db.message().contains("UNIQUE constraint failed")
        }
        _ => false,
    }
}

fn encode_err(e: impl Into<anyhow::Error>) -> sqlx::Error {
    let e: anyhow::Error = e.into();
    sqlx::Error::Encode(e.into())
}

/* =========================
Row mapping + conversions
========================= */

fn row_to_snapshot(r: &AnyRow) -> anyhow::Result<LedgerSnapshot> {
    let doc: String = r.get("document");
    let ledger: Ledger = serde_json::from_str(&doc).context("invalid ledger document")?;

    Ok(LedgerSnapshot {
        version: i64_to_u64(r.get("version"))?,
        ledger,
    })
}

fn row_to_assignment(r: &AnyRow) -> anyhow::Result<ImageAssignment> {
    let images: String = r.get("images");
    let images: Vec<AssignedImage> =
        serde_json::from_str(&images).context("invalid images column")?;
    let method: String = r.get("method");

    Ok(ImageAssignment {
        participant_id: r.get::<String, _>("participant_id"),
        images,
        log_id: r.get::<String, _>("log_id"),
        method: method.parse()?,
        attempt: i64_to_u32(r.get("attempt"))?,
        assigned_at_ms: i64_to_u64(r.get("assigned_ms"))?,
    })
}

fn row_to_log(r: &AnyRow) -> anyhow::Result<AssignmentLogEntry> {
    let ids: String = r.get("image_ids");
    let method: String = r.get("method");

    Ok(AssignmentLogEntry {
        log_id: r.get::<String, _>("log_id"),
        participant_id: r.get::<String, _>("participant_id"),
        image_ids: serde_json::from_str(&ids).context("invalid image_ids column")?,
        created_ms: i64_to_u64(r.get("created_ms"))?,
        attempt: i64_to_u32(r.get("attempt"))?,
        method: method.parse()?,
    })
}

/* =========================
Numeric safety helpers
========================= */

fn i64_to_u32(v: i64) -> anyhow::Result<u32> {
    if v < 0 || v > u32::MAX as i64 {
        return Err(anyhow!("out of range for u32: {v}"));
    }
    Ok(v as u32)
}

fn i64_to_u64(v: i64) -> anyhow::Result<u64> {
    if v < 0 {
        return Err(anyhow!("negative i64 where u64 expected: {v}"));
    }
    Ok(v as u64)
}

fn u64_to_i64(v: u64) -> anyhow::Result<i64> {
    if v > i64::MAX as u64 {
        return Err(anyhow!("u64 too large for i64: {v}"));
    }
    Ok(v as i64)
}
