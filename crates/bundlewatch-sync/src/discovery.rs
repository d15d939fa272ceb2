//! Windowed identifier scan against the batch lookup endpoint.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bundlewatch_adapters::{confirmed_ids, RawPayload};
use bundlewatch_core::{BundleId, DiscoveryDiff};
use bundlewatch_storage::{DiscoveryStateStore, LookupContext, StoreUpstream, MAX_BATCH_IDS};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::CancelFlag;

const PROGRESS_EVERY_WINDOWS: usize = 10;

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub range_start: BundleId,
    /// Exclusive.
    pub range_end: BundleId,
    pub window_size: usize,
    pub inter_window_delay: Duration,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            range_start: 1,
            range_end: 35_000,
            window_size: 100,
            inter_window_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanResult {
    pub ids: BTreeSet<BundleId>,
    pub windows_total: usize,
    pub windows_failed: usize,
    /// False when cancellation stopped the scan before the last window.
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub scan: ScanResult,
    pub diff: DiscoveryDiff,
    pub persisted: bool,
}

pub struct DiscoveryScanner {
    upstream: Arc<dyn StoreUpstream>,
    ctx: LookupContext,
    settings: ScanSettings,
    cancel: CancelFlag,
}

impl DiscoveryScanner {
    pub fn new(upstream: Arc<dyn StoreUpstream>, ctx: LookupContext, settings: ScanSettings) -> Self {
        Self {
            upstream,
            ctx,
            settings,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    /// Probes `[start, end)` in windows of `window` ids, one lookup per
    /// window. A window that fails is logged and skipped.
    pub async fn scan(&self, start: BundleId, end: BundleId, window: usize) -> ScanResult {
        let window = window.clamp(1, MAX_BATCH_IDS) as u64;
        let mut result = ScanResult {
            windows_total: end.saturating_sub(start).div_ceil(window) as usize,
            ..ScanResult::default()
        };

        let mut lo = start;
        let mut index = 0usize;
        while lo < end {
            if self.cancel.is_cancelled() {
                warn!(next_id = lo, "discovery scan cancelled");
                return result;
            }
            let hi = lo.saturating_add(window).min(end);
            let ids: Vec<BundleId> = (lo..hi).collect();

            match self.probe(&ids).await {
                Ok(found) => {
                    debug!(lo, hi, found = found.len(), "window scanned");
                    result.ids.extend(found);
                }
                Err(err) => {
                    result.windows_failed += 1;
                    warn!(lo, hi, error = %err, "window lookup failed; skipping");
                }
            }

            index += 1;
            if index % PROGRESS_EVERY_WINDOWS == 0 {
                info!(
                    windows = index,
                    of = result.windows_total,
                    found = result.ids.len(),
                    "discovery progress"
                );
            }

            lo = hi;
            if lo < end && !self.settings.inter_window_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_window_delay).await;
            }
        }

        result.completed = true;
        result
    }

    async fn probe(&self, ids: &[BundleId]) -> anyhow::Result<BTreeSet<BundleId>> {
        let body = self.upstream.lookup_batch(ids, &self.ctx).await?;
        let payload = RawPayload::from_batch(body);
        let found = confirmed_ids(&payload)?;
        // The upstream may echo entries outside the window; keep only what was asked.
        Ok(found.into_iter().filter(|id| ids.binary_search(id).is_ok()).collect())
    }

    /// Full scan over the configured range, diffed against the stored
    /// identifier set. The new set replaces the stored one only when the scan
    /// ran to completion.
    pub async fn discover(&self, state: &dyn DiscoveryStateStore) -> anyhow::Result<DiscoveryReport> {
        let previous = state
            .load_known_identifiers()
            .await
            .context("loading known bundle identifiers")?;
        let s = &self.settings;
        let scan = self.scan(s.range_start, s.range_end, s.window_size).await;
        let diff = DiscoveryDiff::between(&previous, &scan.ids);

        let persisted = scan.completed;
        if persisted {
            state
                .save_known_identifiers(&scan.ids, &diff)
                .await
                .context("saving known bundle identifiers")?;
        }
        info!(
            total = scan.ids.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            failed_windows = scan.windows_failed,
            persisted,
            "discovery finished"
        );
        Ok(DiscoveryReport { scan, diff, persisted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockUpstream;
    use bundlewatch_storage::MemoryStateStore;

    fn scanner(upstream: Arc<MockUpstream>, delay_ms: u64) -> DiscoveryScanner {
        DiscoveryScanner::new(
            upstream,
            LookupContext::default(),
            ScanSettings {
                range_start: 1,
                range_end: 5,
                window_size: 2,
                inter_window_delay: Duration::from_millis(delay_ms),
            },
        )
    }

    #[tokio::test]
    async fn windows_cover_the_half_open_range() {
        let upstream = Arc::new(MockUpstream::with_named([1, 2, 3]));
        let result = scanner(upstream.clone(), 0).scan(1, 5, 2).await;
        assert_eq!(upstream.batch_calls(), vec![vec![1, 2], vec![3, 4]]);
        assert_eq!(result.ids, [1, 2, 3].into_iter().collect());
        assert_eq!(result.windows_total, 2);
        assert!(result.completed);
    }

    #[tokio::test(start_paused = true)]
    async fn no_delay_follows_the_last_window() {
        let upstream = Arc::new(MockUpstream::with_named([1]));
        let started = tokio::time::Instant::now();
        scanner(upstream, 300).scan(1, 7, 2).await;
        assert_eq!(started.elapsed(), Duration::from_millis(600));
    }

    #[tokio::test]
    async fn failed_windows_are_skipped() {
        let upstream = Arc::new(MockUpstream::with_named([1, 2, 3, 4]).failing_batches_containing([3]));
        let result = scanner(upstream, 0).scan(1, 5, 2).await;
        assert_eq!(result.ids, [1, 2].into_iter().collect());
        assert_eq!(result.windows_failed, 1);
    }

    #[tokio::test]
    async fn discover_diffs_against_stored_set() {
        let upstream = Arc::new(MockUpstream::with_named([2, 3, 4]));
        let state = MemoryStateStore::with_known([1, 2, 3]);
        let report = scanner(upstream, 0).discover(&state).await.unwrap();

        assert_eq!(report.diff.added, [4].into_iter().collect());
        assert_eq!(report.diff.removed, [1].into_iter().collect());
        assert!(report.persisted);
        let stored = state.load_state().await.unwrap();
        assert_eq!(stored.known_ids, [2, 3, 4].into_iter().collect());
        assert_eq!(stored.last_scan_diff, report.diff);
    }

    #[tokio::test]
    async fn cancelled_scan_leaves_state_untouched() {
        let upstream = Arc::new(MockUpstream::with_named([2]));
        let state = MemoryStateStore::with_known([1, 2, 3]);
        let cancel = CancelFlag::default();
        cancel.cancel();
        let report = scanner(upstream.clone(), 0).with_cancel(cancel).discover(&state).await.unwrap();

        assert!(!report.persisted);
        assert!(upstream.batch_calls().is_empty());
        assert_eq!(state.load_known_identifiers().await.unwrap(), [1, 2, 3].into_iter().collect());
    }
}
