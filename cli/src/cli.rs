use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use allocator::assignment::AssignmentEngine;
use allocator::blob::{BlobStore, HttpBlobStore, LocalBlobStore};
use allocator::config::AppConfig;
use allocator::db::Db;

#[derive(Debug, Parser)]
#[command(name = "allocator", version, about = "Balanced image assignment")]
pub struct Cli {
    /// Overrides DATABASE_URL
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Emit JSON logs (also enabled by APP_ENV=production)
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Verify image storage and create the ledger if absent
    Init {
        /// Directory laid out as {pool}/{number}.png
        #[arg(long, conflicts_with = "blob_url")]
        blob_dir: Option<PathBuf>,

        /// Base URL images are served from (defaults to BLOB_BASE_URL)
        #[arg(long)]
        blob_url: Option<String>,
    },

    /// Assign a batch to a participant, or print the one they hold
    Assign { participant: String },

    /// Remaining participant capacity
    Capacity,

    /// Per-pool assignment statistics
    Stats,

    /// Zero every assignment count
    Reset {
        /// Required; this cannot be undone
        #[arg(long)]
        yes: bool,
    },

    /// Most recent assignment log entries
    Logs {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

/// Config from the environment with command-line overrides applied.
pub(crate) fn resolve_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let mut cfg = AppConfig::from_env()?;
    if let Some(url) = &cli.database_url {
        cfg.database_url = url.clone();
    }
    if cli.json_logs {
        cfg.json_logs = true;
    }
    Ok(cfg)
}

/// Opens the database and wires the engine to the SQL store.
pub(crate) async fn build_engine(cfg: &AppConfig) -> anyhow::Result<AssignmentEngine> {
    let db = Db::open(&cfg.database_url).await?;
    let store = Arc::new(db.assignment_store());
    Ok(AssignmentEngine::new(store, cfg.assignment.clone())?)
}

/// Picks the blob store for `init`: explicit flags first, then BLOB_BASE_URL.
pub(crate) fn blob_store_for(
    blob_dir: Option<PathBuf>,
    blob_url: Option<String>,
    cfg: &AppConfig,
) -> anyhow::Result<Option<Box<dyn BlobStore>>> {
    if let Some(dir) = blob_dir {
        return Ok(Some(Box::new(LocalBlobStore::new(dir))));
    }
    match blob_url.or_else(|| cfg.blob_base_url.clone()) {
        Some(url) => Ok(Some(Box::new(HttpBlobStore::new(url)?))),
        None => Ok(None),
    }
}
