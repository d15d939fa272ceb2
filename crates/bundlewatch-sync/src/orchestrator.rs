//! Concurrent batch lookups behind a shared throttle gate.

use std::sync::Arc;
use std::time::Duration;

use bundlewatch_adapters::{map_batch, map_to_record, MapperContext, RawPayload};
use bundlewatch_core::{BundleId, BundleRecord};
use bundlewatch_storage::{
    BackoffPolicy, BlockPolicy, LookupContext, RetryDisposition, StoreUpstream, ThrottleGate, UpstreamError,
    MAX_BATCH_IDS,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::CancelFlag;

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    /// Minimum spacing between batch submissions.
    pub inter_batch_delay: Duration,
    pub block: BlockPolicy,
    pub detail_backoff: BackoffPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: MAX_BATCH_IDS,
            inter_batch_delay: Duration::from_millis(500),
            block: BlockPolicy::default(),
            detail_backoff: BackoffPolicy::default(),
        }
    }
}

/// What happened to one batch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Fetched { ids: usize, records: usize },
    /// The gate was BLOCKED, or the call itself was throttled.
    Throttled { ids: usize },
    Failed { ids: usize, error: String },
    /// Cancelled before the call went out.
    Skipped { ids: usize },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub records: Vec<BundleRecord>,
    pub batches: Vec<BatchOutcome>,
}

impl FetchReport {
    pub fn throttled_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b, BatchOutcome::Throttled { .. }))
            .count()
    }

    pub fn failed_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b, BatchOutcome::Failed { .. }))
            .count()
    }
}

/// Runs batch lookups with bounded concurrency. All calls issued by one
/// orchestrator (and its clones) share a single [`ThrottleGate`].
#[derive(Clone)]
pub struct FetchOrchestrator {
    upstream: Arc<dyn StoreUpstream>,
    gate: Arc<ThrottleGate>,
    limiter: Arc<Semaphore>,
    lookup: LookupContext,
    fallback_currency: String,
    settings: FetchSettings,
    cancel: CancelFlag,
}

impl FetchOrchestrator {
    pub fn new(
        upstream: Arc<dyn StoreUpstream>,
        lookup: LookupContext,
        fallback_currency: impl Into<String>,
        settings: FetchSettings,
    ) -> Self {
        let gate = Arc::new(ThrottleGate::new(settings.block));
        let limiter = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            upstream,
            gate,
            limiter,
            lookup,
            fallback_currency: fallback_currency.into(),
            settings,
            cancel: CancelFlag::default(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<ThrottleGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn gate(&self) -> &Arc<ThrottleGate> {
        &self.gate
    }

    fn mapper_context(&self) -> MapperContext {
        MapperContext::new(self.fallback_currency.clone(), Utc::now())
    }

    /// One lookup for at most [`MAX_BATCH_IDS`] ids. Ids beyond the ceiling
    /// are not requested.
    pub async fn fetch_batch(&self, ids: &[BundleId]) -> (Vec<BundleRecord>, BatchOutcome) {
        let ids = &ids[..ids.len().min(MAX_BATCH_IDS)];
        let Ok(_permit) = self.limiter.acquire().await else {
            return (
                Vec::new(),
                BatchOutcome::Failed {
                    ids: ids.len(),
                    error: "fetch limiter closed".to_string(),
                },
            );
        };

        if self.cancel.is_cancelled() {
            debug!(ids = ids.len(), "batch skipped after cancellation");
            return (Vec::new(), BatchOutcome::Skipped { ids: ids.len() });
        }
        if self.gate.defer_if_blocked().await {
            debug!(ids = ids.len(), "batch short-circuited by throttle gate");
            return (Vec::new(), BatchOutcome::Throttled { ids: ids.len() });
        }

        match self.upstream.lookup_batch(ids, &self.lookup).await {
            Ok(body) => match map_batch(&RawPayload::from_batch(body), &self.mapper_context()) {
                Ok(records) => {
                    let outcome = BatchOutcome::Fetched {
                        ids: ids.len(),
                        records: records.len(),
                    };
                    (records, outcome)
                }
                Err(err) => {
                    warn!(ids = ids.len(), error = %err, "batch payload could not be mapped");
                    (
                        Vec::new(),
                        BatchOutcome::Failed {
                            ids: ids.len(),
                            error: err.to_string(),
                        },
                    )
                }
            },
            Err(UpstreamError::Throttled { status, retry_after }) => {
                let blocked = self.gate.block_on_status(status, retry_after);
                warn!(status, blocked_secs = blocked.as_secs(), "batch throttled");
                (Vec::new(), BatchOutcome::Throttled { ids: ids.len() })
            }
            Err(err) => {
                warn!(ids = ids.len(), error = %err, "batch lookup failed");
                (
                    Vec::new(),
                    BatchOutcome::Failed {
                        ids: ids.len(),
                        error: err.to_string(),
                    },
                )
            }
        }
    }

    /// Splits `ids` into batches and runs them with bounded concurrency.
    /// Records come back in submission order.
    pub async fn fetch_all(&self, ids: &[BundleId]) -> FetchReport {
        let chunk = self.settings.batch_size.clamp(1, MAX_BATCH_IDS);
        let mut set = JoinSet::new();

        for (index, batch) in ids.chunks(chunk).enumerate() {
            if self.cancel.is_cancelled() {
                warn!(submitted = index, "fetch cancelled; no further batches submitted");
                break;
            }
            if index > 0 && !self.settings.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.settings.inter_batch_delay).await;
            }
            let this = self.clone();
            let batch = batch.to_vec();
            set.spawn(async move { (index, this.fetch_batch(&batch).await) });
        }

        let mut done = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => done.push(entry),
                Err(err) => warn!(error = %err, "batch task aborted"),
            }
        }
        done.sort_by_key(|(index, _)| *index);

        let mut report = FetchReport::default();
        for (_, (records, outcome)) in done {
            report.records.extend(records);
            report.batches.push(outcome);
        }
        info!(
            ids = ids.len(),
            batches = report.batches.len(),
            records = report.records.len(),
            throttled = report.throttled_batches(),
            failed = report.failed_batches(),
            "fetch finished"
        );
        report
    }

    /// Single-bundle fetch from the store page, retried with linear backoff.
    /// Throttling feeds the shared gate; a BLOCKED gate consumes an attempt
    /// without a network call.
    pub async fn fetch_detail(&self, id: BundleId) -> Result<Option<BundleRecord>, UpstreamError> {
        let policy = self.settings.detail_backoff;
        let attempts = policy.max_attempts.max(1);
        let mut last_err = None;

        for attempt in 0..attempts {
            if self.gate.defer_if_blocked().await {
                continue;
            }
            match self.upstream.fetch_detail_page(id).await {
                Ok(html) => {
                    let payload = RawPayload::html(id, html);
                    return map_to_record(&payload, Some(id), &self.mapper_context())
                        .map_err(|err| UpstreamError::Decode(err.to_string()));
                }
                Err(err) => {
                    let disposition = err.disposition();
                    if let UpstreamError::Throttled { status, retry_after } = &err {
                        self.gate.block_on_status(*status, *retry_after);
                    }
                    if disposition == RetryDisposition::NonRetryable {
                        return Err(err);
                    }
                    warn!(id, attempt = attempt + 1, error = %err, "detail fetch failed");
                    last_err = Some(err);
                    if disposition == RetryDisposition::Retryable && attempt + 1 < attempts {
                        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(UpstreamError::Throttled {
            status: 429,
            retry_after: self.gate.remaining(),
        }))
    }
}
