//! Image storage probes, run once at initialization.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AssignmentConfig, PoolConfig};
use crate::error::AssignError;
use crate::ledger::model::ImageRef;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether the asset at `path` (e.g. `set1/17.png`) is retrievable.
    async fn exists(&self, path: &str) -> anyhow::Result<bool>;
}

/// Assets served over HTTP, probed with `HEAD`.
pub struct HttpBlobStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        let url = format!("{}/{}", self.base_url, path);
        let resp = self
            .client
            .head(&url)
            .send()
            .await
            .with_context(|| format!("HEAD {url}"))?;
        Ok(resp.status().is_success())
    }
}

/// Assets in a local directory laid out as `{root}/{pool}/{number}.png`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, path: &str) -> anyhow::Result<bool> {
        let full = self.root.join(path);
        tokio::fs::try_exists(&full)
            .await
            .with_context(|| format!("stat {}", full.display()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Probe {
    pub pool: String,
    pub path: String,
    pub reachable: bool,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StorageReport {
    pub probes: Vec<Probe>,
}

impl StorageReport {
    pub fn reachable_in(&self, pool: &str) -> usize {
        self.probes
            .iter()
            .filter(|p| p.pool == pool && p.reachable)
            .count()
    }
}

/// First, middle and last image of a pool.
pub fn probe_images(pool: &PoolConfig) -> Vec<ImageRef> {
    let mut numbers = vec![
        pool.first_number,
        pool.first_number + pool.size / 2,
        pool.last_number(),
    ];
    numbers.dedup();
    numbers
        .into_iter()
        .map(|n| ImageRef::new(pool.name.clone(), n))
        .collect()
}

/// Probes every pool concurrently. A pool without a single reachable probe
/// is a configuration error.
pub async fn verify_pools(
    blobs: &dyn BlobStore,
    cfg: &AssignmentConfig,
) -> Result<StorageReport, AssignError> {
    let targets: Vec<ImageRef> = cfg.pools.iter().flat_map(probe_images).collect();

    let results = join_all(targets.iter().map(|img| {
        let path = img.path();
        async move {
            let res = blobs.exists(&path).await;
            (path, res)
        }
    }))
    .await;

    let probes: Vec<Probe> = targets
        .iter()
        .zip(results)
        .map(|(img, (path, res))| match res {
            Ok(reachable) => Probe {
                pool: img.pool.clone(),
                path,
                reachable,
                error: None,
            },
            Err(e) => Probe {
                pool: img.pool.clone(),
                path,
                reachable: false,
                error: Some(format!("{e:#}")),
            },
        })
        .collect();

    let report = StorageReport { probes };

    for pool in &cfg.pools {
        let ok = report.reachable_in(&pool.name);
        if ok == 0 {
            warn!(pool = %pool.name, "no probe image reachable");
            return Err(AssignError::Config(format!(
                "pool '{}' has no reachable images",
                pool.name
            )));
        }
        info!(pool = %pool.name, reachable = ok, "pool storage verified");
    }

    Ok(report)
}
