//! Catalogue-wide counts and discount aggregates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::BundleRecord;

/// Aggregate view over a set of records, reported with every run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CatalogueStats {
    pub total: usize,
    pub with_discount: usize,
    pub average_discount: f64,
    /// Minor units, over records with a known price.
    pub average_final_amount: f64,
    pub average_games: f64,
    pub currencies: BTreeMap<String, usize>,
}

impl CatalogueStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a BundleRecord>) -> Self {
        let mut stats = CatalogueStats::default();
        let mut discount_sum = 0u64;
        let mut games_sum = 0usize;
        let mut priced = 0usize;
        let mut price_sum = 0i64;

        for record in records {
            stats.total += 1;
            games_sum += record.games_count();
            let discount = record.discount_percent();
            discount_sum += u64::from(discount);
            if discount > 0 {
                stats.with_discount += 1;
            }
            if let Some(price) = &record.current_price {
                priced += 1;
                price_sum += price.final_amount;
                *stats.currencies.entry(price.currency_code.clone()).or_default() += 1;
            }
        }

        if stats.total > 0 {
            stats.average_discount = round2(discount_sum as f64 / stats.total as f64);
            stats.average_games = round2(games_sum as f64 / stats.total as f64);
        }
        if priced > 0 {
            stats.average_final_amount = round2(price_sum as f64 / priced as f64);
        }
        stats
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GameRef, Price};
    use chrono::Utc;

    #[test]
    fn empty_input_is_all_zero() {
        let stats = CatalogueStats::from_records(std::iter::empty());
        assert_eq!(stats, CatalogueStats::default());
    }

    #[test]
    fn aggregates_discount_price_and_currency() {
        let now = Utc::now();
        let mut a = BundleRecord::candidate(1, now);
        a.current_price = Some(Price::new(500, 1000, "BRL"));
        a.games = vec![GameRef::app(1), GameRef::app(2)];
        let mut b = BundleRecord::candidate(2, now);
        b.current_price = Some(Price::new(1500, 1500, "USD"));
        let c = BundleRecord::candidate(3, now);

        let stats = CatalogueStats::from_records([&a, &b, &c]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.with_discount, 1);
        assert_eq!(stats.average_discount, 16.67);
        assert_eq!(stats.average_final_amount, 1000.0);
        assert_eq!(stats.average_games, 0.67);
        assert_eq!(stats.currencies.get("BRL"), Some(&1));
        assert_eq!(stats.currencies.get("USD"), Some(&1));
    }
}
