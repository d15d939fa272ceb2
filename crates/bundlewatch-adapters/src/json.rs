//! Batch-lookup JSON shapes.

use std::collections::BTreeSet;

use bundlewatch_core::{BundleId, BundleRecord, GameRef, Platforms, Price, NSFW_CONTENT_DESCRIPTOR};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::money::currency_code;
use crate::{AdapterError, MapperContext, PayloadKind, PayloadMapper};

pub const ASSET_CDN_BASE: &str = "https://shared.akamai.steamstatic.com/store_item_assets/";

/// The storefront serializes 64-bit integers as strings in some fields.
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(lenient_i64(deserializer)?.and_then(|v| u64::try_from(v).ok()))
}

fn non_empty(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty())
}

enum PriceBlock {
    Missing,
    Ghost,
    Priced(Price),
}

fn resolve_price(
    final_amount: Option<i64>,
    original_amount: Option<i64>,
    claimed_discount: Option<i64>,
    formatted: Option<&str>,
    ctx: &MapperContext,
) -> PriceBlock {
    let Some(final_amount) = final_amount else {
        return PriceBlock::Missing;
    };
    if final_amount == 0 && original_amount.unwrap_or(0) == 0 {
        return PriceBlock::Ghost;
    }
    let currency = formatted
        .map(|f| currency_code(f, &ctx.fallback_currency))
        .unwrap_or_else(|| ctx.fallback_currency.clone());
    let claimed = claimed_discount.and_then(|d| u8::try_from(d.clamp(0, 100)).ok());
    PriceBlock::Priced(Price::from_parts(final_amount, original_amount, claimed, currency))
}

fn finish(mut record: BundleRecord) -> BundleRecord {
    record.flags.needs_rendering_fallback = record.current_price.is_none();
    record.refresh_validity();
    record
}

// --- store browse --------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct StoreBrowseEnvelope {
    #[serde(default)]
    response: StoreBrowseResponse,
}

#[derive(Debug, Default, Deserialize)]
struct StoreBrowseResponse {
    #[serde(default)]
    store_items: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct StoreItem {
    #[serde(default, deserialize_with = "lenient_u64")]
    id: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    best_purchase_option: Option<PurchaseOption>,
    #[serde(default)]
    assets: Option<Assets>,
    #[serde(default)]
    content_descriptorids: Vec<u32>,
    #[serde(default)]
    included_items: Vec<IncludedItem>,
    #[serde(default)]
    included_appids: Vec<u64>,
    #[serde(default)]
    included_packageids: Vec<u64>,
    #[serde(default)]
    platforms: Option<StorePlatforms>,
    #[serde(default)]
    coming_soon: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct PurchaseOption {
    #[serde(default, deserialize_with = "lenient_i64")]
    final_price_in_cents: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    original_price_in_cents: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    discount_pct: Option<i64>,
    #[serde(default)]
    formatted_final_price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Assets {
    #[serde(default)]
    asset_url_format: Option<String>,
    #[serde(default)]
    header: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncludedItem {
    #[serde(default, deserialize_with = "lenient_u64")]
    id: Option<u64>,
    #[serde(default)]
    item_type: Option<u32>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorePlatforms {
    #[serde(default)]
    windows: bool,
    #[serde(default)]
    mac: bool,
    #[serde(default)]
    steamos_linux: bool,
}

impl Assets {
    fn header_url(&self) -> Option<String> {
        let format = self.asset_url_format.as_deref()?;
        let header = self.header.as_deref()?;
        Some(format!("{ASSET_CDN_BASE}{}", format.replace("${FILENAME}", header)))
    }
}

/// `IStoreBrowseService/GetItems` responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreBrowseMapper;

impl StoreBrowseMapper {
    /// Items that fail to decode are skipped one by one.
    fn items(body: &str) -> Result<Vec<StoreItem>, AdapterError> {
        let envelope: StoreBrowseEnvelope = serde_json::from_str(body)?;
        Ok(envelope
            .response
            .store_items
            .into_iter()
            .filter_map(|value| match serde_json::from_value(value) {
                Ok(item) => Some(item),
                Err(err) => {
                    debug!(error = %err, "skipping malformed store item");
                    None
                }
            })
            .collect())
    }

    fn to_record(item: StoreItem, ctx: &MapperContext) -> Option<BundleRecord> {
        let id = item.id?;
        let name = non_empty(item.name)?;
        let block = match item.best_purchase_option {
            Some(option) => resolve_price(
                option.final_price_in_cents,
                option.original_price_in_cents,
                option.discount_pct,
                option.formatted_final_price.as_deref(),
                ctx,
            ),
            None => PriceBlock::Missing,
        };
        let current_price = match block {
            PriceBlock::Priced(price) => Some(price),
            PriceBlock::Missing => None,
            PriceBlock::Ghost => {
                debug!(bundle_id = id, "dropping ghost entry");
                return None;
            }
        };

        let mut record = BundleRecord::candidate(id, ctx.observed_at);
        record.name = Some(name);
        record.current_price = current_price;
        record.flags.is_nsfw = item.content_descriptorids.contains(&NSFW_CONTENT_DESCRIPTOR);
        record.image_url = item.assets.as_ref().and_then(Assets::header_url);
        record.platforms = item.platforms.map(|p| Platforms {
            windows: p.windows,
            mac: p.mac,
            linux: p.steamos_linux,
        });
        record.coming_soon = item.coming_soon.unwrap_or(false);

        let mut games: Vec<GameRef> = item
            .included_items
            .iter()
            .filter(|i| i.item_type.unwrap_or(0) == 0)
            .filter_map(|i| {
                i.id.map(|app_id| GameRef {
                    app_id: Some(app_id),
                    name: non_empty(i.name.clone()),
                    url: None,
                })
            })
            .collect();
        if games.is_empty() {
            games = item.included_appids.iter().copied().map(GameRef::app).collect();
        }
        record.games = games;
        record.package_ids = item.included_packageids;
        Some(finish(record))
    }
}

impl PayloadMapper for StoreBrowseMapper {
    fn kind(&self) -> PayloadKind {
        PayloadKind::StoreBrowseJson
    }

    fn map(&self, body: &str, _hint: Option<BundleId>, ctx: &MapperContext) -> Result<Vec<BundleRecord>, AdapterError> {
        Ok(Self::items(body)?
            .into_iter()
            .filter_map(|item| Self::to_record(item, ctx))
            .collect())
    }

    fn confirmed_ids(&self, body: &str, _hint: Option<BundleId>) -> Result<BTreeSet<BundleId>, AdapterError> {
        Ok(Self::items(body)?
            .into_iter()
            .filter(|item| non_empty(item.name.clone()).is_some())
            .filter_map(|item| item.id)
            .collect())
    }
}

// --- legacy resolve-bundles ---------------------------------------------

#[derive(Debug, Deserialize)]
struct LegacyBundle {
    #[serde(default, deserialize_with = "lenient_u64")]
    bundleid: Option<u64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    final_price: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    initial_price: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    discount_percent: Option<i64>,
    #[serde(default)]
    formatted_final_price: Option<String>,
    #[serde(default)]
    header_image_url: Option<String>,
    #[serde(default)]
    appids: Vec<u64>,
    #[serde(default)]
    packageids: Vec<u64>,
    #[serde(default)]
    available_windows: bool,
    #[serde(default)]
    available_mac: bool,
    #[serde(default)]
    available_linux: bool,
    #[serde(default)]
    coming_soon: bool,
}

/// `actions/ajaxresolvebundles` responses: a bare array of bundles.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveBundlesMapper;

impl ResolveBundlesMapper {
    fn entries(body: &str) -> Result<Vec<LegacyBundle>, AdapterError> {
        match serde_json::from_str::<Value>(body)? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect()),
            Value::Null => Ok(Vec::new()),
            other => Err(AdapterError::Message(format!(
                "expected an array of bundles, got {}",
                json_type(&other)
            ))),
        }
    }

    fn to_record(entry: LegacyBundle, ctx: &MapperContext) -> Option<BundleRecord> {
        let id = entry.bundleid?;
        let name = non_empty(entry.name)?;
        let current_price = match resolve_price(
            entry.final_price,
            entry.initial_price,
            entry.discount_percent,
            entry.formatted_final_price.as_deref(),
            ctx,
        ) {
            PriceBlock::Priced(price) => Some(price),
            PriceBlock::Missing => None,
            PriceBlock::Ghost => {
                debug!(bundle_id = id, "dropping ghost entry");
                return None;
            }
        };

        let mut record = BundleRecord::candidate(id, ctx.observed_at);
        record.name = Some(name);
        record.current_price = current_price;
        record.image_url = entry.header_image_url.filter(|u| !u.is_empty());
        record.platforms = Some(Platforms {
            windows: entry.available_windows,
            mac: entry.available_mac,
            linux: entry.available_linux,
        });
        record.coming_soon = entry.coming_soon;
        record.games = entry.appids.into_iter().map(GameRef::app).collect();
        record.package_ids = entry.packageids;
        Some(finish(record))
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl PayloadMapper for ResolveBundlesMapper {
    fn kind(&self) -> PayloadKind {
        PayloadKind::ResolveBundlesJson
    }

    fn map(&self, body: &str, _hint: Option<BundleId>, ctx: &MapperContext) -> Result<Vec<BundleRecord>, AdapterError> {
        Ok(Self::entries(body)?
            .into_iter()
            .filter_map(|entry| Self::to_record(entry, ctx))
            .collect())
    }

    fn confirmed_ids(&self, body: &str, _hint: Option<BundleId>) -> Result<BTreeSet<BundleId>, AdapterError> {
        Ok(Self::entries(body)?
            .into_iter()
            .filter(|entry| non_empty(entry.name.clone()).is_some())
            .filter_map(|entry| entry.bundleid)
            .collect())
    }
}
