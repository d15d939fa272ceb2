//! One pipeline run end to end, plus the cron wrapper around it.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bundlewatch_core::{AuthenticityPolicy, BundleId, CatalogueStats};
use bundlewatch_storage::{
    BundleStore, DiscoveryStateStore, JsonStateFile, PageRenderer, PersistenceGateway, RenderClient, RunLog,
    SqliteStore, SteamStoreClient, SteamStoreConfig, StoreUpstream, WriteOutcome,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::discovery::{DiscoveryReport, DiscoveryScanner};
use crate::fallback::{FallbackReport, RenderingFallback};
use crate::orchestrator::FetchOrchestrator;
use crate::reports::write_run_reports;
use crate::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Rescan the id range first; otherwise fetch the stored known ids.
    pub discover: bool,
    pub render: bool,
    /// Fetch only the ids the scan added since the previous one. Needs
    /// `discover`.
    pub only_added: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            discover: true,
            render: true,
            only_added: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteTally {
    pub stored: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WriteTally {
    pub fn add(&mut self, outcomes: &[WriteOutcome]) {
        for outcome in outcomes {
            match outcome {
                WriteOutcome::Stored { .. } => self.stored += 1,
                WriteOutcome::SkippedInvalid { .. } => self.skipped += 1,
                WriteOutcome::Failed { .. } => self.failed += 1,
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoverySummary {
    pub total: usize,
    pub added: BTreeSet<BundleId>,
    pub removed: BTreeSet<BundleId>,
    pub failed_windows: usize,
    pub persisted: bool,
}

impl From<&DiscoveryReport> for DiscoverySummary {
    fn from(report: &DiscoveryReport) -> Self {
        Self {
            total: report.scan.ids.len(),
            added: report.diff.added.clone(),
            removed: report.diff.removed.clone(),
            failed_windows: report.scan.windows_failed,
            persisted: report.persisted,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderingSummary {
    pub submitted: Vec<BundleId>,
    pub resolved: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovery: Option<DiscoverySummary>,
    pub requested: usize,
    pub batches: usize,
    pub throttled_batches: usize,
    pub failed_batches: usize,
    pub writes: WriteTally,
    pub rendering: Option<RenderingSummary>,
    pub stats: CatalogueStats,
}

/// Collaborators for [`Pipeline::new`].
pub struct PipelineParts {
    pub scanner: DiscoveryScanner,
    pub orchestrator: FetchOrchestrator,
    pub fallback: Option<RenderingFallback>,
    pub gateway: Arc<PersistenceGateway>,
    pub state: Arc<dyn DiscoveryStateStore>,
    pub reports_dir: PathBuf,
    pub policy: AuthenticityPolicy,
}

pub struct Pipeline {
    scanner: DiscoveryScanner,
    orchestrator: FetchOrchestrator,
    fallback: Option<RenderingFallback>,
    gateway: Arc<PersistenceGateway>,
    state: Arc<dyn DiscoveryStateStore>,
    reports_dir: PathBuf,
    policy: AuthenticityPolicy,
    running: Mutex<()>,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            scanner: parts.scanner,
            orchestrator: parts.orchestrator,
            fallback: parts.fallback,
            gateway: parts.gateway,
            state: parts.state,
            reports_dir: parts.reports_dir,
            policy: parts.policy,
            running: Mutex::new(()),
        }
    }

    /// Wires the production collaborators. Missing credentials fail here,
    /// before any network call.
    pub async fn from_config(config: &PipelineConfig, with_renderer: bool, cancel: CancelFlag) -> Result<Self> {
        config.validate_upstream()?;
        if with_renderer {
            config.validate_render()?;
        }

        let http = config.http();
        let upstream: Arc<dyn StoreUpstream> = Arc::new(SteamStoreClient::new(SteamStoreConfig {
            api: config.batch_api,
            api_key: config.api_key.clone(),
            http: http.clone(),
            ..SteamStoreConfig::default()
        })?);

        let fallback = match (&config.render_url, with_renderer) {
            (Some(url), true) => {
                let renderer: Arc<dyn PageRenderer> = Arc::new(RenderClient::new(url.clone(), &http)?);
                Some(
                    RenderingFallback::new(renderer, config.fallback_currency.clone(), config.render_settings())
                        .with_cancel(cancel.clone()),
                )
            }
            _ => None,
        };

        let store: Arc<dyn BundleStore> = Arc::new(
            SqliteStore::connect(&config.database_url)
                .await
                .with_context(|| format!("opening {}", config.database_url))?,
        );

        Ok(Self::new(PipelineParts {
            scanner: DiscoveryScanner::new(upstream.clone(), config.lookup_context(), config.scan_settings())
                .with_cancel(cancel.clone()),
            orchestrator: FetchOrchestrator::new(
                upstream,
                config.lookup_context(),
                config.fallback_currency.clone(),
                config.fetch_settings(),
            )
            .with_cancel(cancel),
            fallback,
            gateway: Arc::new(PersistenceGateway::open(store)),
            state: Arc::new(JsonStateFile::new(config.state_file.clone())),
            reports_dir: config.reports_dir.clone(),
            policy: config.tuning.analyzer,
        }))
    }

    pub fn gateway(&self) -> &Arc<PersistenceGateway> {
        &self.gateway
    }

    pub fn policy(&self) -> &AuthenticityPolicy {
        &self.policy
    }

    pub async fn discover(&self) -> Result<DiscoveryReport> {
        self.scanner
            .discover(self.state.as_ref())
            .instrument(info_span!("discover"))
            .await
    }

    /// Re-renders every stored bundle still flagged for the fallback.
    pub async fn render_pending(&self) -> Result<(FallbackReport, Vec<WriteOutcome>)> {
        let pending: BTreeSet<BundleId> = self
            .gateway
            .query_needing_rendering_fallback()
            .await?
            .into_iter()
            .collect();
        self.render_and_store(&pending).await
    }

    async fn render_and_store(&self, ids: &BTreeSet<BundleId>) -> Result<(FallbackReport, Vec<WriteOutcome>)> {
        let Some(fallback) = &self.fallback else {
            anyhow::bail!("no rendering service configured; {} bundles left pending", ids.len());
        };
        let ids: Vec<BundleId> = ids.iter().copied().collect();
        let report = fallback
            .resolve_with_rendering(&ids)
            .instrument(info_span!("rendering_fallback", ids = ids.len()))
            .await;
        let outcomes = self.gateway.write_all(report.records.clone()).await;
        Ok((report, outcomes))
    }

    /// Fetches a single bundle's store page and stores the result.
    pub async fn refresh(&self, id: BundleId) -> Result<Option<WriteOutcome>> {
        match self.orchestrator.fetch_detail(id).await? {
            Some(record) => Ok(Some(self.gateway.write(record).await)),
            None => {
                warn!(id, "store page yielded no bundle");
                Ok(None)
            }
        }
    }

    pub async fn run_once(&self, options: RunOptions) -> Result<RunSummary> {
        let Ok(_running) = self.running.try_lock() else {
            anyhow::bail!("a pipeline run is already in progress");
        };
        if options.only_added && !options.discover {
            anyhow::bail!("fetching only added bundles requires a discovery scan");
        }
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        async move {
            info!(?options, "pipeline run started");

            let (ids, discovery) = if options.discover {
                let report = self.discover().await?;
                let ids = if options.only_added {
                    report.diff.added.clone()
                } else {
                    report.scan.ids.clone()
                };
                (ids, Some(DiscoverySummary::from(&report)))
            } else {
                let ids = self
                    .state
                    .load_known_identifiers()
                    .await
                    .context("loading known bundle identifiers")?;
                (ids, None)
            };
            if ids.is_empty() {
                warn!("no known bundle identifiers; nothing to fetch");
            }

            let ids: Vec<BundleId> = ids.into_iter().collect();
            let fetch = self
                .orchestrator
                .fetch_all(&ids)
                .instrument(info_span!("fetch", ids = ids.len()))
                .await;

            let mut pending: BTreeSet<BundleId> = fetch
                .records
                .iter()
                .filter(|r| r.flags.needs_rendering_fallback)
                .map(|r| r.id)
                .collect();
            let mut writes = WriteTally::default();
            writes.add(&self.gateway.write_all(fetch.records.clone()).await);

            let rendering = if options.render {
                pending.extend(self.gateway.query_needing_rendering_fallback().await?);
                if pending.is_empty() {
                    None
                } else if self.fallback.is_none() {
                    warn!(pending = pending.len(), "no rendering service configured; bundles left pending");
                    None
                } else {
                    let (report, outcomes) = self.render_and_store(&pending).await?;
                    writes.add(&outcomes);
                    Some(RenderingSummary {
                        submitted: report.submitted,
                        resolved: report.records.len(),
                        failed: report.failures.len(),
                    })
                }
            } else {
                None
            };

            let records = self.gateway.list_records().await?;
            let stats = CatalogueStats::from_records(records.iter());
            let summary = RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                discovery,
                requested: ids.len(),
                batches: fetch.batches.len(),
                throttled_batches: fetch.throttled_batches(),
                failed_batches: fetch.failed_batches(),
                writes,
                rendering,
                stats,
            };

            self.gateway
                .record_run(&RunLog {
                    run_id,
                    started_at,
                    finished_at: summary.finished_at,
                    found: fetch.records.len(),
                    stored: writes.stored,
                    skipped: writes.skipped,
                    failed: writes.failed,
                    stats: summary.stats.clone(),
                })
                .await
                .context("recording run log")?;

            let dir = write_run_reports(&self.reports_dir, &summary, &records, &self.policy).await?;
            info!(
                stored = writes.stored,
                skipped = writes.skipped,
                failed = writes.failed,
                reports = %dir.display(),
                "pipeline run finished"
            );
            Ok(summary)
        }
        .instrument(info_span!("pipeline_run", %run_id))
        .await
    }
}

/// Cron-driven runs. Returns `None` when scheduling is disabled.
pub async fn maybe_build_scheduler(
    pipeline: Arc<Pipeline>,
    enabled: bool,
    cron: &str,
    options: RunOptions,
) -> Result<Option<JobScheduler>> {
    if !enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once(options).await {
                Ok(summary) => info!(run_id = %summary.run_id, "scheduled run finished"),
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
