use std::str::FromStr;

use async_trait::async_trait;
use bundlewatch_core::{BundleId, BundleRecord, Platforms, Price, RecordFlags};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::store::{BundleStore, RunLog, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bundles (
    id INTEGER PRIMARY KEY,
    name TEXT,
    url TEXT NOT NULL,
    final_amount INTEGER,
    original_amount INTEGER,
    discount_percent INTEGER NOT NULL DEFAULT 0,
    currency_code TEXT,
    price_history TEXT NOT NULL,
    games TEXT NOT NULL,
    games_count INTEGER NOT NULL DEFAULT 0,
    is_valid INTEGER NOT NULL,
    is_nsfw INTEGER NOT NULL,
    needs_rendering_fallback INTEGER NOT NULL,
    image_url TEXT,
    platforms TEXT,
    coming_soon INTEGER NOT NULL DEFAULT 0,
    package_ids TEXT NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bundles_discount ON bundles (discount_percent DESC);
CREATE INDEX IF NOT EXISTS idx_bundles_fallback ON bundles (needs_rendering_fallback);
CREATE TABLE IF NOT EXISTS scrape_runs (
    run_id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL,
    found INTEGER NOT NULL,
    stored INTEGER NOT NULL,
    skipped INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    stats TEXT NOT NULL
);
"#;

const SELECT_COLUMNS: &str = "id, name, url, final_amount, original_amount, discount_percent, currency_code, \
     price_history, games, is_valid, is_nsfw, needs_rendering_fallback, image_url, platforms, coming_soon, \
     package_ids, first_seen_at, last_updated_at";

/// SQLite-backed record store. History, games and package ids are JSON text
/// columns; price and flags are plain columns so queries can filter on them.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("bundle schema ready");
        Ok(())
    }

    fn decode(row: &SqliteRow) -> Result<BundleRecord, StoreError> {
        let final_amount: Option<i64> = row.try_get("final_amount")?;
        let original_amount: Option<i64> = row.try_get("original_amount")?;
        let currency_code: Option<String> = row.try_get("currency_code")?;
        let discount_percent: i64 = row.try_get("discount_percent")?;
        let current_price = match (final_amount, original_amount, currency_code) {
            (Some(final_amount), Some(original_amount), Some(currency_code)) => Some(Price {
                final_amount,
                original_amount,
                discount_percent: discount_percent.clamp(0, 100) as u8,
                currency_code,
            }),
            _ => None,
        };
        let platforms: Option<String> = row.try_get("platforms")?;
        let platforms: Option<Platforms> = platforms.as_deref().map(serde_json::from_str).transpose()?;

        Ok(BundleRecord {
            id: row.try_get::<i64, _>("id")? as BundleId,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            current_price,
            price_history: serde_json::from_str(row.try_get::<&str, _>("price_history")?)?,
            games: serde_json::from_str(row.try_get::<&str, _>("games")?)?,
            flags: RecordFlags {
                is_valid: row.try_get("is_valid")?,
                is_nsfw: row.try_get("is_nsfw")?,
                needs_rendering_fallback: row.try_get("needs_rendering_fallback")?,
            },
            image_url: row.try_get("image_url")?,
            platforms,
            coming_soon: row.try_get("coming_soon")?,
            package_ids: serde_json::from_str(row.try_get::<&str, _>("package_ids")?)?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_updated_at: row.try_get("last_updated_at")?,
        })
    }

    fn decode_all(rows: &[SqliteRow]) -> Result<Vec<BundleRecord>, StoreError> {
        rows.iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl BundleStore for SqliteStore {
    async fn load_record(&self, id: BundleId) -> Result<Option<BundleRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM bundles WHERE id = ?1"))
            .bind(id as i64)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn save_record(&self, record: &BundleRecord) -> Result<(), StoreError> {
        let price = record.current_price.as_ref();
        let platforms = record.platforms.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO bundles (
                id, name, url, final_amount, original_amount, discount_percent, currency_code,
                price_history, games, games_count, is_valid, is_nsfw, needs_rendering_fallback,
                image_url, platforms, coming_soon, package_ids, first_seen_at, last_updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                url = excluded.url,
                final_amount = excluded.final_amount,
                original_amount = excluded.original_amount,
                discount_percent = excluded.discount_percent,
                currency_code = excluded.currency_code,
                price_history = excluded.price_history,
                games = excluded.games,
                games_count = excluded.games_count,
                is_valid = excluded.is_valid,
                is_nsfw = excluded.is_nsfw,
                needs_rendering_fallback = excluded.needs_rendering_fallback,
                image_url = excluded.image_url,
                platforms = excluded.platforms,
                coming_soon = excluded.coming_soon,
                package_ids = excluded.package_ids,
                last_updated_at = excluded.last_updated_at
            "#,
        )
        .bind(record.id as i64)
        .bind(&record.name)
        .bind(&record.url)
        .bind(price.map(|p| p.final_amount))
        .bind(price.map(|p| p.original_amount))
        .bind(i64::from(record.discount_percent()))
        .bind(price.map(|p| p.currency_code.as_str()))
        .bind(serde_json::to_string(&record.price_history)?)
        .bind(serde_json::to_string(&record.games)?)
        .bind(record.games_count() as i64)
        .bind(record.flags.is_valid)
        .bind(record.flags.is_nsfw)
        .bind(record.flags.needs_rendering_fallback)
        .bind(&record.image_url)
        .bind(platforms)
        .bind(record.coming_soon)
        .bind(serde_json::to_string(&record.package_ids)?)
        .bind(record.first_seen_at)
        .bind(record.last_updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<BundleRecord>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {SELECT_COLUMNS} FROM bundles ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Self::decode_all(&rows)
    }

    async fn query_top_discounted(&self, limit: usize, currency: Option<&str>) -> Result<Vec<BundleRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM bundles \
             WHERE is_valid = 1 AND (?1 IS NULL OR upper(currency_code) = upper(?1)) \
             ORDER BY discount_percent DESC, final_amount ASC, id ASC LIMIT ?2"
        ))
        .bind(currency)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_all(&rows)
    }

    async fn query_needing_rendering_fallback(&self) -> Result<Vec<BundleId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM bundles WHERE needs_rendering_fallback = 1 ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().map(|id| id as BundleId).collect())
    }

    async fn query_best_deals(&self, limit: usize, min_discount: u8) -> Result<Vec<BundleRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SELECT_COLUMNS} FROM bundles \
             WHERE is_valid = 1 AND final_amount > 0 AND discount_percent >= ?1 \
             ORDER BY discount_percent * games_count DESC, id ASC LIMIT ?2"
        ))
        .bind(i64::from(min_discount))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Self::decode_all(&rows)
    }

    async fn record_run(&self, run: &RunLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO scrape_runs (run_id, started_at, finished_at, found, stored, skipped, failed, stats) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(run.run_id.to_string())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.found as i64)
        .bind(run.stored as i64)
        .bind(run.skipped as i64)
        .bind(run.failed as i64)
        .bind(serde_json::to_string(&run.stats)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bundlewatch_core::{CatalogueStats, GameRef, PriceSnapshot};
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;
    use uuid::Uuid;

    fn sample(id: BundleId) -> BundleRecord {
        let at = Utc.with_ymd_and_hms(2026, 1, 10, 8, 0, 0).single().unwrap();
        let price = Price::new(4999, 9999, "BRL");
        let mut r = BundleRecord::candidate(id, at);
        r.name = Some("Roguelike Essentials".into());
        r.price_history = vec![PriceSnapshot::of(&price, at)];
        r.current_price = Some(price);
        r.games = vec![GameRef::app(620), GameRef::app(400)];
        r.platforms = Some(Platforms {
            windows: true,
            mac: false,
            linux: true,
        });
        r.package_ids = vec![7];
        r.refresh_validity();
        r
    }

    #[tokio::test]
    async fn records_round_trip_through_sqlite() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("bundles.db").display());
        let store = SqliteStore::connect(&url).await.expect("connect");

        assert!(store.load_record(1).await.unwrap().is_none());
        let record = sample(1);
        store.save_record(&record).await.expect("save");
        store.save_record(&record).await.expect("save twice");

        let loaded = store.load_record(1).await.unwrap().expect("stored");
        assert_eq!(loaded, record);
        assert_eq!(store.list_records().await.unwrap().len(), 1);
        assert_eq!(store.query_best_deals(5, 10).await.unwrap().len(), 1);
        assert_eq!(store.query_top_discounted(5, Some("USD")).await.unwrap().len(), 0);

        let mut pending = BundleRecord::candidate(2, record.first_seen_at);
        pending.flags.needs_rendering_fallback = true;
        store.save_record(&pending).await.unwrap();
        assert_eq!(store.query_needing_rendering_fallback().await.unwrap(), vec![2]);

        store
            .record_run(&RunLog {
                run_id: Uuid::new_v4(),
                started_at: record.first_seen_at,
                finished_at: record.first_seen_at,
                found: 2,
                stored: 2,
                skipped: 0,
                failed: 0,
                stats: CatalogueStats::default(),
            })
            .await
            .expect("run log");
        store.close().await;
    }
}
