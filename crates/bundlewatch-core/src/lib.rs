//! Canonical bundle record model, merge-with-history rule and discovery diff.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod authenticity;
pub mod stats;

pub use authenticity::{analyze, AuthenticityPolicy, AuthenticityVerdict, InflationEvidence, VerdictReason};
pub use stats::CatalogueStats;

pub const CRATE_NAME: &str = "bundlewatch-core";

/// Upstream bundle identifier. Stable across time, primary key of a record.
pub type BundleId = u64;

pub const BUNDLE_URL_PREFIX: &str = "https://store.steampowered.com/bundle/";

/// Content descriptor the storefront uses for adult-only content.
pub const NSFW_CONTENT_DESCRIPTOR: u32 = 3;

pub fn bundle_url(id: BundleId) -> String {
    format!("{BUNDLE_URL_PREFIX}{id}/")
}

/// Integer discount recomputed from minor-unit amounts; `0` when there is no reference price.
pub fn discount_percent(original_amount: i64, final_amount: i64) -> u8 {
    if original_amount <= 0 {
        return 0;
    }
    let pct = ((original_amount - final_amount) as f64 / original_amount as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

/// Current price of a bundle. Amounts are minor units (cents).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub final_amount: i64,
    pub original_amount: i64,
    pub discount_percent: u8,
    pub currency_code: String,
}

impl Price {
    /// Builds a price, deriving the discount from the two amounts.
    pub fn new(final_amount: i64, original_amount: i64, currency_code: impl Into<String>) -> Self {
        Self {
            final_amount,
            original_amount,
            discount_percent: discount_percent(original_amount, final_amount),
            currency_code: currency_code.into(),
        }
    }

    /// Builds a price when the reference amount may be missing. Without one the
    /// upstream-claimed discount is the only information available and is kept.
    pub fn from_parts(
        final_amount: i64,
        original_amount: Option<i64>,
        claimed_discount: Option<u8>,
        currency_code: impl Into<String>,
    ) -> Self {
        match original_amount {
            Some(original) if original > 0 => Self::new(final_amount, original, currency_code),
            _ => Self {
                final_amount,
                original_amount: final_amount,
                discount_percent: claimed_discount.unwrap_or(0).min(100),
                currency_code: currency_code.into(),
            },
        }
    }

    pub fn is_ghost(&self) -> bool {
        self.final_amount == 0 && self.original_amount == 0
    }
}

/// One observation in a bundle's append-only price history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub recorded_at: DateTime<Utc>,
    pub final_amount: i64,
    pub original_amount: i64,
    pub discount_percent: u8,
    pub currency_code: String,
}

impl PriceSnapshot {
    pub fn of(price: &Price, recorded_at: DateTime<Utc>) -> Self {
        Self {
            recorded_at,
            final_amount: price.final_amount,
            original_amount: price.original_amount,
            discount_percent: price.discount_percent,
            currency_code: price.currency_code.clone(),
        }
    }

    fn differs_from(&self, price: &Price) -> bool {
        self.final_amount != price.final_amount || self.discount_percent != price.discount_percent
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameRef {
    pub app_id: Option<u64>,
    pub name: Option<String>,
    pub url: Option<String>,
}

impl GameRef {
    pub fn app(app_id: u64) -> Self {
        Self {
            app_id: Some(app_id),
            name: None,
            url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Platforms {
    pub windows: bool,
    pub mac: bool,
    pub linux: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordFlags {
    pub is_valid: bool,
    pub is_nsfw: bool,
    pub needs_rendering_fallback: bool,
}

/// One tracked storefront bundle.
///
/// Candidates built by the mappers carry at most a current price and an empty
/// history; the authoritative history only grows through [`BundleRecord::merge`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub id: BundleId,
    pub name: Option<String>,
    pub url: String,
    pub current_price: Option<Price>,
    pub price_history: Vec<PriceSnapshot>,
    pub games: Vec<GameRef>,
    pub flags: RecordFlags,
    pub image_url: Option<String>,
    pub platforms: Option<Platforms>,
    pub coming_soon: bool,
    pub package_ids: Vec<u64>,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl BundleRecord {
    /// Empty candidate for `id` observed at `observed_at`.
    pub fn candidate(id: BundleId, observed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name: None,
            url: bundle_url(id),
            current_price: None,
            price_history: Vec::new(),
            games: Vec::new(),
            flags: RecordFlags::default(),
            image_url: None,
            platforms: None,
            coming_soon: false,
            package_ids: Vec::new(),
            first_seen_at: observed_at,
            last_updated_at: observed_at,
        }
    }

    /// A record is valid when it has a non-empty name and a resolvable final price.
    pub fn is_valid(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty()) && self.current_price.is_some()
    }

    pub fn refresh_validity(&mut self) {
        self.flags.is_valid = self.is_valid();
    }

    /// Whether the gateway should write this candidate at all. Invalid
    /// candidates are still written when they carry the fallback flag, so the
    /// rendering path can find them later.
    pub fn is_writable(&self) -> bool {
        self.is_valid() || self.flags.needs_rendering_fallback
    }

    pub fn discount_percent(&self) -> u8 {
        self.current_price.as_ref().map_or(0, |p| p.discount_percent)
    }

    pub fn games_count(&self) -> usize {
        self.games.len()
    }

    /// Overlays `candidate` onto `stored` (or inserts it) and appends a price
    /// snapshot when the price moved. `first_seen_at` and existing history are
    /// never rewritten.
    pub fn merge(stored: Option<BundleRecord>, candidate: BundleRecord, now: DateTime<Utc>) -> BundleRecord {
        // Only a valid candidate may move the price, and it always records it.
        let incoming_price = candidate.current_price.clone().filter(|_| candidate.is_valid());
        let mut merged = match stored {
            None => BundleRecord {
                current_price: None,
                price_history: Vec::new(),
                ..candidate
            },
            Some(mut stored) => {
                if candidate.name.is_some() {
                    stored.name = candidate.name;
                }
                stored.url = candidate.url;
                if !candidate.games.is_empty() {
                    stored.games = candidate.games;
                }
                if candidate.image_url.is_some() {
                    stored.image_url = candidate.image_url;
                }
                if candidate.platforms.is_some() {
                    stored.platforms = candidate.platforms;
                }
                if !candidate.package_ids.is_empty() {
                    stored.package_ids = candidate.package_ids;
                }
                stored.coming_soon = candidate.coming_soon;
                stored.flags = candidate.flags;
                stored
            }
        };

        if let Some(price) = incoming_price {
            merged.append_snapshot_if_changed(&price, now);
            merged.current_price = Some(price);
        }
        merged.last_updated_at = now;
        merged.refresh_validity();
        merged
    }

    fn append_snapshot_if_changed(&mut self, price: &Price, now: DateTime<Utc>) {
        let changed = self
            .price_history
            .last()
            .map_or(true, |last| last.differs_from(price));
        if changed {
            self.price_history.push(PriceSnapshot::of(price, now));
        }
    }
}

/// Set difference between two successive full scans.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryDiff {
    pub added: BTreeSet<BundleId>,
    pub removed: BTreeSet<BundleId>,
}

impl DiscoveryDiff {
    pub fn between(old_ids: &BTreeSet<BundleId>, new_ids: &BTreeSet<BundleId>) -> Self {
        Self {
            added: new_ids.difference(old_ids).copied().collect(),
            removed: old_ids.difference(new_ids).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Persisted result of the most recent full scan. Replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveryState {
    pub known_ids: BTreeSet<BundleId>,
    pub last_scan_diff: DiscoveryDiff,
    pub last_updated: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn priced(id: BundleId, final_amount: i64, original_amount: i64, at: DateTime<Utc>) -> BundleRecord {
        let mut record = BundleRecord::candidate(id, at);
        record.name = Some("Puzzle Pack".into());
        record.current_price = Some(Price::new(final_amount, original_amount, "BRL"));
        record
    }

    #[test]
    fn discount_is_recomputed_from_amounts() {
        assert_eq!(Price::new(1000, 2000, "BRL").discount_percent, 50);
        assert_eq!(Price::new(1999, 1999, "BRL").discount_percent, 0);
        assert_eq!(Price::new(0, 0, "BRL").discount_percent, 0);
        assert_eq!(discount_percent(2999, 1499), 50);
    }

    #[test]
    fn from_parts_keeps_claimed_discount_without_reference() {
        let price = Price::from_parts(1500, None, Some(25), "USD");
        assert_eq!(price.discount_percent, 25);
        assert_eq!(price.original_amount, 1500);

        let price = Price::from_parts(1500, Some(3000), Some(10), "USD");
        assert_eq!(price.discount_percent, 50);
    }

    #[test]
    fn url_is_derived_from_id() {
        assert_eq!(bundle_url(232), "https://store.steampowered.com/bundle/232/");
        assert_eq!(BundleRecord::candidate(232, t0()).url, bundle_url(232));
    }

    #[test]
    fn validity_requires_name_and_price() {
        let mut record = BundleRecord::candidate(1, t0());
        assert!(!record.is_valid());
        record.name = Some("  ".into());
        record.current_price = Some(Price::new(100, 100, "BRL"));
        assert!(!record.is_valid());
        record.name = Some("Bundle".into());
        assert!(record.is_valid());
    }

    #[test]
    fn upserting_identical_price_twice_keeps_single_snapshot() {
        let first = BundleRecord::merge(None, priced(7, 1000, 1000, t0()), t0());
        let second = BundleRecord::merge(Some(first), priced(7, 1000, 1000, t0()), t0() + Duration::hours(6));
        assert_eq!(second.price_history.len(), 1);
        assert_eq!(second.last_updated_at, t0() + Duration::hours(6));
    }

    #[test]
    fn price_change_appends_in_order() {
        let first = BundleRecord::merge(None, priced(7, 1000, 1000, t0()), t0());
        let later = t0() + Duration::days(1);
        let second = BundleRecord::merge(Some(first), priced(7, 800, 1000, later), later);

        assert_eq!(second.price_history.len(), 2);
        assert_eq!(second.price_history[0].final_amount, 1000);
        assert_eq!(second.price_history[0].discount_percent, 0);
        assert_eq!(second.price_history[1].final_amount, 800);
        assert_eq!(second.price_history[1].discount_percent, 20);
        assert_eq!(second.first_seen_at, t0());
    }

    #[test]
    fn first_seen_is_immutable_and_fields_overlay() {
        let mut stored = priced(9, 500, 500, t0());
        stored.games = vec![GameRef::app(10), GameRef::app(20)];
        stored.image_url = Some("https://cdn/header.jpg".into());
        let stored = BundleRecord::merge(None, stored, t0());

        let later = t0() + Duration::days(3);
        let mut candidate = priced(9, 500, 500, later);
        candidate.name = Some("Puzzle Pack Deluxe".into());
        candidate.flags.is_nsfw = true;
        let merged = BundleRecord::merge(Some(stored), candidate, later);

        assert_eq!(merged.first_seen_at, t0());
        assert_eq!(merged.name.as_deref(), Some("Puzzle Pack Deluxe"));
        assert_eq!(merged.games.len(), 2, "empty candidate games keep stored games");
        assert_eq!(merged.image_url.as_deref(), Some("https://cdn/header.jpg"));
        assert!(merged.flags.is_nsfw);
        assert!(merged.flags.is_valid);
    }

    #[test]
    fn invalid_candidate_never_touches_history() {
        let stored = BundleRecord::merge(None, priced(3, 1200, 1200, t0()), t0());
        let later = t0() + Duration::days(1);
        let mut candidate = BundleRecord::candidate(3, later);
        candidate.flags.needs_rendering_fallback = true;
        let merged = BundleRecord::merge(Some(stored), candidate, later);

        assert_eq!(merged.price_history.len(), 1);
        assert_eq!(merged.current_price.as_ref().map(|p| p.final_amount), Some(1200));
        assert!(merged.flags.needs_rendering_fallback);
    }

    #[test]
    fn nameless_priced_candidate_leaves_price_and_history_alone() {
        let stored = BundleRecord::merge(None, priced(4, 1200, 1200, t0()), t0());
        let later = t0() + Duration::days(1);
        let mut candidate = priced(4, 600, 1200, later);
        candidate.name = None;
        let merged = BundleRecord::merge(Some(stored), candidate, later);

        assert_eq!(merged.price_history.len(), 1);
        assert_eq!(merged.current_price.as_ref().map(|p| p.final_amount), Some(1200));
        assert_eq!(merged.price_history[0].final_amount, 1200);
    }

    #[test]
    fn flagged_insert_without_price_has_empty_history() {
        let mut candidate = BundleRecord::candidate(11, t0());
        candidate.name = Some("Complete Your Collection".into());
        candidate.flags.needs_rendering_fallback = true;
        assert!(candidate.is_writable());

        let merged = BundleRecord::merge(None, candidate, t0());
        assert!(merged.price_history.is_empty());
        assert!(!merged.flags.is_valid);
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let old: BTreeSet<BundleId> = [1, 2, 3].into_iter().collect();
        let new: BTreeSet<BundleId> = [2, 3, 4].into_iter().collect();
        let diff = DiscoveryDiff::between(&old, &new);
        assert_eq!(diff.added, [4].into_iter().collect());
        assert_eq!(diff.removed, [1].into_iter().collect());
        assert!(!diff.is_empty());
    }

    #[test]
    fn record_serializes_with_history() {
        let record = BundleRecord::merge(None, priced(5, 990, 1990, t0()), t0());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["price_history"][0]["discount_percent"], 50);
        assert_eq!(json["flags"]["is_valid"], true);
    }
}
