use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Ledger: single row, whole aggregate as a JSON document
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS ledger (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version BIGINT NOT NULL,
  document TEXT NOT NULL,
  updated_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // One immutable batch per participant
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS participant_assignments (
  participant_id TEXT PRIMARY KEY,
  log_id TEXT NOT NULL,
  method TEXT NOT NULL,
  attempt BIGINT NOT NULL,
  assigned_ms BIGINT NOT NULL,
  images TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Audit trail
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS assignment_logs (
  log_id TEXT PRIMARY KEY,
  participant_id TEXT NOT NULL,
  image_ids TEXT NOT NULL,
  created_ms BIGINT NOT NULL,
  attempt BIGINT NOT NULL,
  method TEXT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    // Advisory lock: at most one row
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS assignment_lock (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  holder TEXT NOT NULL,
  acquired_ms BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_assignment_logs_created ON assignment_logs(created_ms);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
