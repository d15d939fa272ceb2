//! Discount authenticity check over a record's price history.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::BundleRecord;

/// Tunables for [`analyze`]. Neither value has a statistical derivation; they
/// are operator knobs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticityPolicy {
    pub lookback_days: i64,
    pub inflation_threshold: f64,
}

impl Default for AuthenticityPolicy {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            inflation_threshold: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictReason {
    InsufficientHistory,
    NoRegularPriceObservations,
    InflatedReferencePrice,
    ConsistentWithHistory,
}

impl VerdictReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerdictReason::InsufficientHistory => "insufficient history",
            VerdictReason::NoRegularPriceObservations => "no regular-price observations",
            VerdictReason::InflatedReferencePrice => "inflated reference price",
            VerdictReason::ConsistentWithHistory => "consistent with history",
        }
    }
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflationEvidence {
    /// Mean final amount of regular-price observations, minor units.
    pub avg_regular: f64,
    pub claimed_original: i64,
    pub inflation_percent: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticityVerdict {
    pub is_real: bool,
    pub reason: VerdictReason,
    pub evidence: Option<InflationEvidence>,
}

impl AuthenticityVerdict {
    fn real(reason: VerdictReason) -> Self {
        Self {
            is_real: true,
            reason,
            evidence: None,
        }
    }
}

/// Judges whether the record's claimed original price is backed by regular
/// prices observed within the lookback window ending at `now`.
pub fn analyze(record: &BundleRecord, policy: &AuthenticityPolicy, now: DateTime<Utc>) -> AuthenticityVerdict {
    if record.price_history.len() < 2 {
        return AuthenticityVerdict::real(VerdictReason::InsufficientHistory);
    }

    let since = now - Duration::days(policy.lookback_days);
    let regular: Vec<i64> = record
        .price_history
        .iter()
        .filter(|s| (since..=now).contains(&s.recorded_at) && s.discount_percent == 0)
        .map(|s| s.final_amount)
        .collect();
    if regular.is_empty() {
        return AuthenticityVerdict::real(VerdictReason::NoRegularPriceObservations);
    }

    let avg_regular = regular.iter().sum::<i64>() as f64 / regular.len() as f64;
    let Some(claimed_original) = record.current_price.as_ref().map(|p| p.original_amount) else {
        return AuthenticityVerdict::real(VerdictReason::ConsistentWithHistory);
    };

    if avg_regular > 0.0 && claimed_original as f64 > avg_regular * policy.inflation_threshold {
        let inflation_percent = ((claimed_original as f64 / avg_regular - 1.0) * 100.0).round() as i64;
        return AuthenticityVerdict {
            is_real: false,
            reason: VerdictReason::InflatedReferencePrice,
            evidence: Some(InflationEvidence {
                avg_regular,
                claimed_original,
                inflation_percent,
            }),
        };
    }

    AuthenticityVerdict::real(VerdictReason::ConsistentWithHistory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Price, PriceSnapshot};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 0, 0, 0).single().unwrap()
    }

    fn snapshot(days_ago: i64, final_amount: i64, discount: u8) -> PriceSnapshot {
        PriceSnapshot {
            recorded_at: now() - Duration::days(days_ago),
            final_amount,
            original_amount: final_amount,
            discount_percent: discount,
            currency_code: "BRL".into(),
        }
    }

    fn record_with(history: Vec<PriceSnapshot>, current: Price) -> BundleRecord {
        let mut record = BundleRecord::candidate(42, now());
        record.name = Some("Strategy Bundle".into());
        record.current_price = Some(current);
        record.price_history = history;
        record
    }

    #[test]
    fn single_snapshot_is_insufficient_history() {
        let record = record_with(vec![snapshot(1, 1000, 0)], Price::new(500, 2500, "BRL"));
        let verdict = analyze(&record, &AuthenticityPolicy::default(), now());
        assert!(verdict.is_real);
        assert_eq!(verdict.reason, VerdictReason::InsufficientHistory);
        assert_eq!(verdict.reason.to_string(), "insufficient history");
    }

    #[test]
    fn inflated_reference_price_is_flagged() {
        let record = record_with(
            vec![snapshot(20, 1000, 0), snapshot(10, 1000, 0), snapshot(5, 1000, 0)],
            Price::new(1250, 2500, "BRL"),
        );
        let verdict = analyze(&record, &AuthenticityPolicy::default(), now());
        assert!(!verdict.is_real);
        assert_eq!(verdict.reason, VerdictReason::InflatedReferencePrice);
        let evidence = verdict.evidence.unwrap();
        assert_eq!(evidence.inflation_percent, 150);
        assert_eq!(evidence.claimed_original, 2500);
        assert!((evidence.avg_regular - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn discounted_or_stale_observations_are_not_regular() {
        let record = record_with(
            vec![snapshot(90, 1000, 0), snapshot(3, 700, 30), snapshot(1, 500, 50)],
            Price::new(500, 2500, "BRL"),
        );
        let verdict = analyze(&record, &AuthenticityPolicy::default(), now());
        assert!(verdict.is_real);
        assert_eq!(verdict.reason, VerdictReason::NoRegularPriceObservations);
    }

    #[test]
    fn snapshots_after_now_are_ignored() {
        let record = record_with(
            vec![snapshot(6, 1000, 0), snapshot(-2, 3000, 0), snapshot(-3, 3000, 0)],
            Price::new(1250, 2500, "BRL"),
        );
        let verdict = analyze(&record, &AuthenticityPolicy::default(), now());
        assert_eq!(verdict.reason, VerdictReason::InflatedReferencePrice);
        assert!((verdict.evidence.unwrap().avg_regular - 1000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn modest_reference_is_consistent() {
        let record = record_with(
            vec![snapshot(8, 1000, 0), snapshot(2, 1100, 0)],
            Price::new(700, 1400, "BRL"),
        );
        let verdict = analyze(&record, &AuthenticityPolicy::default(), now());
        assert!(verdict.is_real);
        assert_eq!(verdict.reason, VerdictReason::ConsistentWithHistory);
        assert!(verdict.evidence.is_none());
    }

    #[test]
    fn policy_knobs_change_the_outcome() {
        let record = record_with(
            vec![snapshot(8, 1000, 0), snapshot(2, 1000, 0)],
            Price::new(700, 1400, "BRL"),
        );
        let strict = AuthenticityPolicy {
            lookback_days: 30,
            inflation_threshold: 1.2,
        };
        let verdict = analyze(&record, &strict, now());
        assert!(!verdict.is_real);
        assert_eq!(verdict.evidence.unwrap().inflation_percent, 40);

        let short_window = AuthenticityPolicy {
            lookback_days: 1,
            inflation_threshold: 1.2,
        };
        let verdict = analyze(&record, &short_window, now());
        assert_eq!(verdict.reason, VerdictReason::NoRegularPriceObservations);
    }
}
