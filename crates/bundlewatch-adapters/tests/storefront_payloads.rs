use bundlewatch_adapters::{confirmed_ids, map_batch, map_to_record, MapperContext, RawPayload};
use bundlewatch_core::BundleRecord;
use chrono::{Duration, TimeZone, Utc};

const STORE_BROWSE_BATCH: &str = r#"{
  "response": {
    "store_items": [
      {
        "id": 232,
        "name": "Half-Life Complete",
        "best_purchase_option": {
          "final_price_in_cents": "2499",
          "original_price_in_cents": "9999",
          "discount_pct": 75,
          "formatted_final_price": "R$ 24,99"
        },
        "assets": { "asset_url_format": "steam/bundles/232/${FILENAME}", "header": "header.jpg" },
        "content_descriptorids": [2, 5],
        "included_items": [
          { "id": 70, "item_type": 0, "name": "Half-Life" },
          { "id": 220, "item_type": 0, "name": "Half-Life 2" },
          { "id": 9001, "item_type": 4, "name": "Soundtrack" }
        ],
        "included_packageids": [36, 37],
        "platforms": { "windows": true, "mac": true, "steamos_linux": true }
      },
      {
        "id": 8800,
        "name": "After Dark Collection",
        "content_descriptorids": [3],
        "included_appids": [500, 501]
      },
      {
        "id": 9100,
        "name": "Retired Pack",
        "best_purchase_option": { "final_price_in_cents": 0, "original_price_in_cents": 0 }
      },
      { "id": 9200 }
    ]
  }
}"#;

const LEGACY_BATCH: &str = r#"[
  {
    "bundleid": 232,
    "name": "Half-Life Complete",
    "final_price": 4999,
    "initial_price": 9999,
    "discount_percent": 50,
    "formatted_final_price": "R$ 49,99",
    "header_image_url": "https://cdn.example/232/header.jpg",
    "appids": [70, 220],
    "packageids": [36],
    "available_windows": true,
    "available_mac": false,
    "available_linux": true,
    "coming_soon": false
  }
]"#;

fn ctx(day: u32) -> MapperContext {
    MapperContext::new("BRL", Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap())
}

#[test]
fn store_browse_batch_maps_priced_flagged_and_dropped_entries() {
    let payload = RawPayload::StoreBrowseJson(STORE_BROWSE_BATCH.to_string());
    let records = map_batch(&payload, &ctx(1)).unwrap();
    let ids: Vec<u64> = records.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![232, 8800]);

    let hl = &records[0];
    let price = hl.current_price.as_ref().unwrap();
    assert_eq!((price.final_amount, price.original_amount, price.discount_percent), (2499, 9999, 75));
    assert_eq!(price.currency_code, "BRL");
    assert_eq!(hl.games_count(), 2);
    assert_eq!(hl.package_ids, vec![36, 37]);
    assert!(hl.platforms.as_ref().is_some_and(|p| p.windows && p.mac && p.linux));
    assert!(hl.image_url.as_deref().is_some_and(|u| u.ends_with("steam/bundles/232/header.jpg")));
    assert!(hl.is_valid() && !hl.flags.is_nsfw && !hl.flags.needs_rendering_fallback);

    let adult = &records[1];
    assert!(adult.current_price.is_none());
    assert!(adult.flags.needs_rendering_fallback);
    assert!(adult.flags.is_nsfw);
    assert!(!adult.is_valid() && adult.is_writable());
    assert_eq!(adult.games_count(), 2);

    // Ghosts still prove the id exists; nameless entries do not.
    assert_eq!(confirmed_ids(&payload).unwrap(), [232, 8800, 9100].into_iter().collect());
}

#[test]
fn legacy_batch_maps_the_same_bundle() {
    let payload = RawPayload::ResolveBundlesJson(LEGACY_BATCH.to_string());
    let record = map_to_record(&payload, Some(232), &ctx(1)).unwrap().unwrap();
    assert_eq!(record.current_price.as_ref().map(|p| p.discount_percent), Some(50));
    assert_eq!(record.image_url.as_deref(), Some("https://cdn.example/232/header.jpg"));
    assert!(record.platforms.as_ref().is_some_and(|p| p.windows && !p.mac && p.linux));
    assert_eq!(record.package_ids, vec![36]);
}

#[test]
fn mapped_candidates_merge_into_history() {
    let browse = RawPayload::StoreBrowseJson(STORE_BROWSE_BATCH.to_string());
    let legacy = RawPayload::ResolveBundlesJson(LEGACY_BATCH.to_string());

    let first = map_to_record(&browse, Some(232), &ctx(1)).unwrap().unwrap();
    let stored = BundleRecord::merge(None, first, ctx(1).observed_at);
    let again = map_to_record(&browse, Some(232), &ctx(2)).unwrap().unwrap();
    let stored = BundleRecord::merge(Some(stored), again, ctx(2).observed_at);
    assert_eq!(stored.price_history.len(), 1);

    let moved = map_to_record(&legacy, Some(232), &ctx(3)).unwrap().unwrap();
    let stored = BundleRecord::merge(Some(stored), moved, ctx(3).observed_at);
    assert_eq!(stored.price_history.len(), 2);
    assert_eq!(stored.price_history[1].final_amount, 4999);
    assert_eq!(stored.first_seen_at, ctx(1).observed_at);
    assert_eq!(stored.last_updated_at - stored.first_seen_at, Duration::days(2));
}
