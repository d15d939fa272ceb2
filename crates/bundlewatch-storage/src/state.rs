//! Persisted discovery state: the confirmed id set of the last full scan.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use bundlewatch_core::{BundleId, DiscoveryDiff, DiscoveryState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use uuid::Uuid;

#[async_trait]
pub trait DiscoveryStateStore: Send + Sync {
    async fn load_state(&self) -> anyhow::Result<DiscoveryState>;

    /// Replaces the persisted state wholesale.
    async fn save_known_identifiers(&self, ids: &BTreeSet<BundleId>, diff: &DiscoveryDiff) -> anyhow::Result<()>;

    async fn load_known_identifiers(&self) -> anyhow::Result<BTreeSet<BundleId>> {
        Ok(self.load_state().await?.known_ids)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFileDiff {
    added: BTreeSet<BundleId>,
    removed: BTreeSet<BundleId>,
    added_count: usize,
    removed_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    last_updated: DateTime<Utc>,
    total: usize,
    bundle_ids: BTreeSet<BundleId>,
    #[serde(default)]
    diff: Option<StateFileDiff>,
}

/// JSON file written through a temp file and an atomic rename.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DiscoveryStateStore for JsonStateFile {
    async fn load_state(&self) -> anyhow::Result<DiscoveryState> {
        if !fs::try_exists(&self.path)
            .await
            .with_context(|| format!("checking state file {}", self.path.display()))?
        {
            return Ok(DiscoveryState::default());
        }
        let bytes = fs::read(&self.path)
            .await
            .with_context(|| format!("reading state file {}", self.path.display()))?;
        let file: StateFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing state file {}", self.path.display()))?;
        let last_scan_diff = file
            .diff
            .map(|d| DiscoveryDiff {
                added: d.added,
                removed: d.removed,
            })
            .unwrap_or_default();
        Ok(DiscoveryState {
            known_ids: file.bundle_ids,
            last_scan_diff,
            last_updated: Some(file.last_updated),
        })
    }

    async fn save_known_identifiers(&self, ids: &BTreeSet<BundleId>, diff: &DiscoveryDiff) -> anyhow::Result<()> {
        let file = StateFile {
            last_updated: Utc::now(),
            total: ids.len(),
            bundle_ids: ids.clone(),
            diff: Some(StateFileDiff {
                added: diff.added.clone(),
                removed: diff.removed.clone(),
                added_count: diff.added.len(),
                removed_count: diff.removed.len(),
            }),
        };
        let bytes = serde_json::to_vec_pretty(&file).context("serializing discovery state")?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.state.tmp", Uuid::new_v4()));
        let mut out = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        out.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        out.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(out);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming state file {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStateStore {
    state: RwLock<DiscoveryState>,
}

impl MemoryStateStore {
    pub fn with_known(ids: impl IntoIterator<Item = BundleId>) -> Self {
        Self {
            state: RwLock::new(DiscoveryState {
                known_ids: ids.into_iter().collect(),
                ..DiscoveryState::default()
            }),
        }
    }
}

#[async_trait]
impl DiscoveryStateStore for MemoryStateStore {
    async fn load_state(&self) -> anyhow::Result<DiscoveryState> {
        Ok(self.state.read().await.clone())
    }

    async fn save_known_identifiers(&self, ids: &BTreeSet<BundleId>, diff: &DiscoveryDiff) -> anyhow::Result<()> {
        *self.state.write().await = DiscoveryState {
            known_ids: ids.clone(),
            last_scan_diff: diff.clone(),
            last_updated: Some(Utc::now()),
        };
        Ok(())
    }
}
