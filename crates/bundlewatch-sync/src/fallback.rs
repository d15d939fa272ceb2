//! Rendering fallback for bundles whose price only appears after scripts run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bundlewatch_adapters::{map_to_record, MapperContext, RawPayload};
use bundlewatch_core::{bundle_url, BundleId, BundleRecord};
use bundlewatch_storage::{PageRenderer, RenderOptions};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::CancelFlag;

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub batch_size: usize,
    pub per_id_delay: Duration,
    pub inter_batch_pause: Duration,
    pub options: RenderOptions,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            batch_size: 3,
            per_id_delay: Duration::from_secs(2),
            inter_batch_pause: Duration::from_secs(5),
            options: RenderOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderFailure {
    pub id: BundleId,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FallbackReport {
    pub submitted: Vec<BundleId>,
    pub records: Vec<BundleRecord>,
    pub failures: Vec<RenderFailure>,
}

/// Sequential, paced rendering. Invocations share one session lock, so no
/// id is ever rendered by two invocations at once.
pub struct RenderingFallback {
    renderer: Arc<dyn PageRenderer>,
    session: Mutex<()>,
    settings: RenderSettings,
    fallback_currency: String,
    cancel: CancelFlag,
}

impl RenderingFallback {
    pub fn new(renderer: Arc<dyn PageRenderer>, fallback_currency: impl Into<String>, settings: RenderSettings) -> Self {
        Self {
            renderer,
            session: Mutex::new(()),
            settings,
            fallback_currency: fallback_currency.into(),
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Renders each id's store page and maps it. Every returned record has
    /// `needs_rendering_fallback` cleared; ids that fail are reported, not
    /// retried.
    pub async fn resolve_with_rendering(&self, ids: &[BundleId]) -> FallbackReport {
        let _session = self.session.lock().await;

        let mut seen = HashSet::new();
        let ids: Vec<BundleId> = ids.iter().copied().filter(|id| seen.insert(*id)).collect();
        let mut report = FallbackReport {
            submitted: ids.clone(),
            ..FallbackReport::default()
        };
        let batch_size = self.settings.batch_size.max(1);
        let batches = ids.len().div_ceil(batch_size);

        for (batch_index, batch) in ids.chunks(batch_size).enumerate() {
            for (pos, &id) in batch.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    warn!(id, "rendering fallback cancelled");
                    return report;
                }
                match self.render_one(id).await {
                    Ok(record) => report.records.push(record),
                    Err(error) => {
                        warn!(id, %error, "rendering fallback failed");
                        report.failures.push(RenderFailure { id, error });
                    }
                }
                if pos + 1 < batch.len() {
                    tokio::time::sleep(self.settings.per_id_delay).await;
                }
            }
            if batch_index + 1 < batches {
                info!(batch = batch_index + 1, of = batches, "render batch done; pausing");
                tokio::time::sleep(self.settings.inter_batch_pause).await;
            }
        }

        info!(
            submitted = report.submitted.len(),
            resolved = report.records.len(),
            failed = report.failures.len(),
            "rendering fallback finished"
        );
        report
    }

    async fn render_one(&self, id: BundleId) -> Result<BundleRecord, String> {
        let url = bundle_url(id);
        let html = self
            .renderer
            .render(&url, &self.settings.options)
            .instrument(info_span!("render_bundle", bundle_id = id))
            .await
            .map_err(|err| err.to_string())?;

        let ctx = MapperContext::new(self.fallback_currency.clone(), Utc::now());
        let mut record = map_to_record(&RawPayload::html(id, html), Some(id), &ctx)
            .map_err(|err| err.to_string())?
            .ok_or_else(|| "rendered page yielded no bundle".to_string())?;
        record.flags.needs_rendering_fallback = false;
        record.refresh_validity();
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRenderer;

    fn fallback(renderer: Arc<MockRenderer>) -> RenderingFallback {
        RenderingFallback::new(renderer, "BRL", RenderSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn paces_ids_and_batches() {
        let renderer = Arc::new(MockRenderer::priced([1, 2, 3, 4]));
        let started = tokio::time::Instant::now();
        let report = fallback(renderer.clone()).resolve_with_rendering(&[1, 2, 3, 4]).await;

        assert_eq!(report.records.len(), 4);
        assert!(report.records.iter().all(|r| !r.flags.needs_rendering_fallback && r.is_valid()));
        // [1,2,3]: two 2s gaps, then a 5s pause, then [4].
        assert_eq!(started.elapsed(), Duration::from_secs(9));
        assert_eq!(renderer.rendered(), vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_ids_render_once() {
        let renderer = Arc::new(MockRenderer::priced([5]));
        let report = fallback(renderer.clone()).resolve_with_rendering(&[5, 5, 5]).await;
        assert_eq!(report.submitted, vec![5]);
        assert_eq!(renderer.rendered(), vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn per_id_failures_are_reported_and_skipped() {
        let renderer = Arc::new(MockRenderer::priced([1, 3]).timing_out([2]));
        let report = fallback(renderer).resolve_with_rendering(&[1, 2, 3]).await;
        assert_eq!(report.records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unpriced_render_clears_the_flag_but_stays_invalid() {
        let renderer = Arc::new(MockRenderer::default().unpriced([8]));
        let report = fallback(renderer).resolve_with_rendering(&[8]).await;
        let record = &report.records[0];
        assert!(!record.flags.needs_rendering_fallback);
        assert!(!record.is_valid());
        assert!(!record.is_writable());
    }

    #[tokio::test(start_paused = true)]
    async fn selector_timeout_still_yields_a_terminal_record() {
        let renderer = Arc::new(MockRenderer::priced([1]).selector_missed([6]));
        let report = fallback(renderer).resolve_with_rendering(&[1, 6]).await;

        assert!(report.failures.is_empty());
        let record = report.records.iter().find(|r| r.id == 6).unwrap();
        assert_eq!(record.name.as_deref(), Some("Bundle 6"));
        assert!(record.current_price.is_none());
        assert!(!record.flags.needs_rendering_fallback);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_invocations_do_not_overlap() {
        let renderer = Arc::new(MockRenderer::priced([1, 2]));
        let fallback = Arc::new(fallback(renderer.clone()));
        let a = tokio::spawn({
            let fallback = fallback.clone();
            async move { fallback.resolve_with_rendering(&[1, 2]).await }
        });
        let b = tokio::spawn({
            let fallback = fallback.clone();
            async move { fallback.resolve_with_rendering(&[1, 2]).await }
        });
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(renderer.max_in_flight(), 1);
        assert_eq!(renderer.rendered(), vec![1, 2, 1, 2]);
    }
}
