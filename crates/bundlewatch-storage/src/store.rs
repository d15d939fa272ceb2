//! Record store contract and the in-memory implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bundlewatch_core::{BundleId, BundleRecord, CatalogueStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("json column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store is closed")]
    Closed,
}

/// One scrape-run log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub found: usize,
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
    pub stats: CatalogueStats,
}

/// Backing store behind the persistence gateway. Implementations only move
/// records in and out; the merge rule lives in the gateway.
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn load_record(&self, id: BundleId) -> Result<Option<BundleRecord>, StoreError>;
    async fn save_record(&self, record: &BundleRecord) -> Result<(), StoreError>;
    async fn list_records(&self) -> Result<Vec<BundleRecord>, StoreError>;
    /// Valid records ordered by discount, highest first.
    async fn query_top_discounted(&self, limit: usize, currency: Option<&str>) -> Result<Vec<BundleRecord>, StoreError>;
    async fn query_needing_rendering_fallback(&self) -> Result<Vec<BundleId>, StoreError>;
    /// Valid, priced records ranked by `discount * games`.
    async fn query_best_deals(&self, limit: usize, min_discount: u8) -> Result<Vec<BundleRecord>, StoreError>;
    async fn record_run(&self, run: &RunLog) -> Result<(), StoreError>;
    async fn close(&self) {}
}

pub(crate) fn top_discounted(mut records: Vec<BundleRecord>, limit: usize, currency: Option<&str>) -> Vec<BundleRecord> {
    records.retain(|r| {
        r.flags.is_valid
            && currency.map_or(true, |c| {
                r.current_price
                    .as_ref()
                    .is_some_and(|p| p.currency_code.eq_ignore_ascii_case(c))
            })
    });
    records.sort_by(|a, b| {
        b.discount_percent()
            .cmp(&a.discount_percent())
            .then_with(|| price_of(a).cmp(&price_of(b)))
            .then_with(|| a.id.cmp(&b.id))
    });
    records.truncate(limit);
    records
}

pub(crate) fn best_deals(mut records: Vec<BundleRecord>, limit: usize, min_discount: u8) -> Vec<BundleRecord> {
    records.retain(|r| r.flags.is_valid && price_of(r) > 0 && r.discount_percent() >= min_discount);
    records.sort_by(|a, b| {
        deal_score(b)
            .cmp(&deal_score(a))
            .then_with(|| a.id.cmp(&b.id))
    });
    records.truncate(limit);
    records
}

pub fn deal_score(record: &BundleRecord) -> u64 {
    u64::from(record.discount_percent()) * record.games_count() as u64
}

fn price_of(record: &BundleRecord) -> i64 {
    record.current_price.as_ref().map_or(0, |p| p.final_amount)
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<BundleId, BundleRecord>>,
    runs: RwLock<Vec<RunLog>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<RunLog> {
        self.runs.read().await.clone()
    }
}

#[async_trait]
impl BundleStore for MemoryStore {
    async fn load_record(&self, id: BundleId) -> Result<Option<BundleRecord>, StoreError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn save_record(&self, record: &BundleRecord) -> Result<(), StoreError> {
        self.records.write().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<BundleRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn query_top_discounted(&self, limit: usize, currency: Option<&str>) -> Result<Vec<BundleRecord>, StoreError> {
        Ok(top_discounted(self.list_records().await?, limit, currency))
    }

    async fn query_needing_rendering_fallback(&self) -> Result<Vec<BundleId>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.flags.needs_rendering_fallback)
            .map(|r| r.id)
            .collect())
    }

    async fn query_best_deals(&self, limit: usize, min_discount: u8) -> Result<Vec<BundleRecord>, StoreError> {
        Ok(best_deals(self.list_records().await?, limit, min_discount))
    }

    async fn record_run(&self, run: &RunLog) -> Result<(), StoreError> {
        self.runs.write().await.push(run.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlewatch_core::{GameRef, Price};

    fn record(id: BundleId, final_amount: i64, original: i64, currency: &str, games: usize) -> BundleRecord {
        let mut r = BundleRecord::candidate(id, Utc::now());
        r.name = Some(format!("Bundle {id}"));
        r.current_price = Some(Price::new(final_amount, original, currency));
        r.games = (0..games as u64).map(GameRef::app).collect();
        r.refresh_validity();
        r
    }

    #[tokio::test]
    async fn top_discounted_orders_and_filters_currency() {
        let store = MemoryStore::new();
        store.save_record(&record(1, 500, 1000, "BRL", 1)).await.unwrap();
        store.save_record(&record(2, 250, 1000, "BRL", 1)).await.unwrap();
        store.save_record(&record(3, 100, 1000, "USD", 1)).await.unwrap();
        let mut invalid = BundleRecord::candidate(4, Utc::now());
        invalid.flags.needs_rendering_fallback = true;
        store.save_record(&invalid).await.unwrap();

        let top = store.query_top_discounted(10, Some("brl")).await.unwrap();
        assert_eq!(top.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);

        let all = store.query_top_discounted(2, None).await.unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2]);

        assert_eq!(store.query_needing_rendering_fallback().await.unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn best_deals_weights_discount_by_game_count() {
        let store = MemoryStore::new();
        store.save_record(&record(1, 500, 1000, "BRL", 2)).await.unwrap(); // 100
        store.save_record(&record(2, 250, 1000, "BRL", 1)).await.unwrap(); // 75
        store.save_record(&record(3, 900, 1000, "BRL", 20)).await.unwrap(); // 200
        store.save_record(&record(4, 0, 1000, "BRL", 30)).await.unwrap();

        let deals = store.query_best_deals(10, 0).await.unwrap();
        assert_eq!(deals.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 1, 2]);

        let deals = store.query_best_deals(10, 50).await.unwrap();
        assert_eq!(deals.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2]);
    }
}
