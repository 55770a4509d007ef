pub mod schema;

use std::time::Duration;

use anyhow::Context;
use sqlx::AnyPool;
use sqlx::any::AnyPoolOptions;
use tracing::info;

use crate::store::repository_sqlx::SqlxAssignmentStore;

/// Connection pool for the assignment tables.
#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
}

impl Db {
    /// Connects and brings the schema up to date.
    ///
    /// Acquisition is bounded so a saturated pool surfaces as a retryable
    /// timeout instead of a hang.
    pub async fn open(database_url: &str) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .with_context(|| format!("failed to connect to {database_url}"))?;

        schema::migrate(&pool)
            .await
            .context("schema migration failed")?;
        info!("database ready");

        Ok(Self { pool })
    }

    pub fn assignment_store(&self) -> SqlxAssignmentStore {
        SqlxAssignmentStore::new(self.pool.clone())
    }
}
