//! Pipeline orchestration: discovery, batch fetch, rendering fallback,
//! persistence, reports and scheduling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod config;
pub mod discovery;
pub mod fallback;
pub mod orchestrator;
pub mod pipeline;
pub mod reports;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, PipelineConfig, Tuning};
pub use discovery::{DiscoveryReport, DiscoveryScanner, ScanResult, ScanSettings};
pub use fallback::{FallbackReport, RenderFailure, RenderSettings, RenderingFallback};
pub use orchestrator::{BatchOutcome, FetchOrchestrator, FetchReport, FetchSettings};
pub use pipeline::{maybe_build_scheduler, Pipeline, PipelineParts, RunOptions, RunSummary, WriteTally};
pub use reports::{recent_runs_markdown, render_brief, write_run_reports};

pub const CRATE_NAME: &str = "bundlewatch-sync";

/// Cooperative stop signal checked between windows, batches and renders.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
