//! Upsert-with-history over a [`BundleStore`], serialized per bundle id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bundlewatch_core::{BundleId, BundleRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::store::{BundleStore, RunLog, StoreError};

/// Per-record result of a gateway write.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WriteOutcome {
    Stored { id: BundleId, history_len: usize },
    SkippedInvalid { id: BundleId },
    Failed { id: BundleId, error: String },
}

impl WriteOutcome {
    pub fn id(&self) -> BundleId {
        match self {
            WriteOutcome::Stored { id, .. } | WriteOutcome::SkippedInvalid { id } | WriteOutcome::Failed { id, .. } => *id,
        }
    }
}

/// Sole owner of authoritative records. Constructed explicitly and closed
/// explicitly; writes after [`PersistenceGateway::close`] fail with
/// [`StoreError::Closed`].
pub struct PersistenceGateway {
    store: Arc<dyn BundleStore>,
    locks: Mutex<HashMap<BundleId, Arc<Mutex<()>>>>,
    open: AtomicBool,
}

impl PersistenceGateway {
    pub fn open(store: Arc<dyn BundleStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            open: AtomicBool::new(true),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.store.close().await;
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    async fn id_lock(&self, id: BundleId) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn release_id_lock(&self, id: BundleId, lock: Arc<Mutex<()>>) {
        let mut map = self.locks.lock().await;
        // map + this handle
        if Arc::strong_count(&lock) == 2 {
            map.remove(&id);
        }
    }

    /// Merges `candidate` into the stored record. Returns `None` when the
    /// candidate is invalid and not awaiting rendering fallback.
    pub async fn upsert(&self, candidate: BundleRecord) -> Result<Option<BundleRecord>, StoreError> {
        self.upsert_at(candidate, Utc::now()).await
    }

    pub async fn upsert_at(&self, candidate: BundleRecord, now: DateTime<Utc>) -> Result<Option<BundleRecord>, StoreError> {
        self.ensure_open()?;
        if !candidate.is_writable() {
            return Ok(None);
        }

        let id = candidate.id;
        let lock = self.id_lock(id).await;
        let result = {
            let _guard = lock.lock().await;
            self.merge_locked(candidate, now).await
        };
        self.release_id_lock(id, lock).await;
        result.map(Some)
    }

    async fn merge_locked(&self, candidate: BundleRecord, now: DateTime<Utc>) -> Result<BundleRecord, StoreError> {
        let stored = self.store.load_record(candidate.id).await?;
        let merged = BundleRecord::merge(stored, candidate, now);
        self.store.save_record(&merged).await?;
        debug!(bundle_id = merged.id, history = merged.price_history.len(), "record merged");
        Ok(merged)
    }

    pub async fn write(&self, candidate: BundleRecord) -> WriteOutcome {
        let id = candidate.id;
        match self.upsert(candidate).await {
            Ok(Some(record)) => WriteOutcome::Stored {
                id,
                history_len: record.price_history.len(),
            },
            Ok(None) => WriteOutcome::SkippedInvalid { id },
            Err(err) => {
                warn!(bundle_id = id, error = %err, "record write failed");
                WriteOutcome::Failed {
                    id,
                    error: err.to_string(),
                }
            }
        }
    }

    /// Writes every candidate; a failed write does not stop the rest.
    pub async fn write_all(&self, candidates: Vec<BundleRecord>) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            outcomes.push(self.write(candidate).await);
        }
        outcomes
    }

    pub async fn load_record(&self, id: BundleId) -> Result<Option<BundleRecord>, StoreError> {
        self.ensure_open()?;
        self.store.load_record(id).await
    }

    pub async fn list_records(&self) -> Result<Vec<BundleRecord>, StoreError> {
        self.ensure_open()?;
        self.store.list_records().await
    }

    pub async fn query_top_discounted(&self, limit: usize, currency: Option<&str>) -> Result<Vec<BundleRecord>, StoreError> {
        self.ensure_open()?;
        self.store.query_top_discounted(limit, currency).await
    }

    pub async fn query_needing_rendering_fallback(&self) -> Result<Vec<BundleId>, StoreError> {
        self.ensure_open()?;
        self.store.query_needing_rendering_fallback().await
    }

    pub async fn query_best_deals(&self, limit: usize, min_discount: u8) -> Result<Vec<BundleRecord>, StoreError> {
        self.ensure_open()?;
        self.store.query_best_deals(limit, min_discount).await
    }

    pub async fn record_run(&self, run: &RunLog) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.store.record_run(run).await
    }
}
