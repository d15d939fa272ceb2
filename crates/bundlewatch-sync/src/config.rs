//! Pipeline configuration: environment plus an optional YAML tuning overlay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bundlewatch_core::AuthenticityPolicy;
use bundlewatch_storage::{BackoffPolicy, BatchApi, BlockPolicy, HttpClientConfig, LookupContext, RenderOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::discovery::ScanSettings;
use crate::fallback::RenderSettings;
use crate::orchestrator::FetchSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required credential {0}")]
    MissingCredential(&'static str),
    #[error("missing required target {0}")]
    MissingTarget(&'static str),
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("reading tuning file {path}: {source}")]
    TuningIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing tuning file {path}: {source}")]
    TuningYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanTuning {
    pub range_start: u64,
    pub range_end: u64,
    pub window_size: usize,
    pub inter_window_delay_ms: u64,
}

impl Default for ScanTuning {
    fn default() -> Self {
        Self {
            range_start: 1,
            range_end: 35_000,
            window_size: 100,
            inter_window_delay_ms: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchTuning {
    pub concurrency: usize,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub rate_limited_block_secs: u64,
    pub access_denied_block_secs: u64,
    pub max_block_sleep_secs: u64,
    pub detail_attempts: usize,
    pub detail_backoff_ms: u64,
}

impl Default for FetchTuning {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 100,
            inter_batch_delay_ms: 500,
            rate_limited_block_secs: 60,
            access_denied_block_secs: 300,
            max_block_sleep_secs: 5,
            detail_attempts: 3,
            detail_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderTuning {
    pub batch_size: usize,
    pub per_id_delay_ms: u64,
    pub inter_batch_pause_ms: u64,
    pub navigation_timeout_ms: u64,
    pub selector_timeout_ms: u64,
}

impl Default for RenderTuning {
    fn default() -> Self {
        Self {
            batch_size: 3,
            per_id_delay_ms: 2_000,
            inter_batch_pause_ms: 5_000,
            navigation_timeout_ms: 30_000,
            selector_timeout_ms: 5_000,
        }
    }
}

/// Numeric knobs read from `bundlewatch.yaml`. Every section is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub scan: ScanTuning,
    pub fetch: FetchTuning,
    pub render: RenderTuning,
    pub analyzer: AuthenticityPolicy,
}

impl Tuning {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_yaml(&raw).map_err(|source| ConfigError::TuningYaml {
                path: path.to_path_buf(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::TuningIo {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub state_file: PathBuf,
    pub reports_dir: PathBuf,
    pub tuning_file: PathBuf,
    pub api_key: Option<String>,
    pub batch_api: BatchApi,
    pub render_url: Option<String>,
    pub country_code: String,
    pub language: String,
    pub fallback_currency: String,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub cron: String,
    pub tuning: Tuning,
}

fn truthy(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.tuning = Tuning::load(&config.tuning_file)?;
        Ok(config)
    }

    /// Reads settings through `lookup`; the tuning overlay is left at defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| non_blank(lookup(key));
        let batch_api = match get("BUNDLEWATCH_BATCH_API").as_deref() {
            None | Some("store_browse") => BatchApi::StoreBrowse,
            Some("resolve_bundles") => BatchApi::ResolveBundles,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "BUNDLEWATCH_BATCH_API",
                    reason: format!("unknown batch api {other:?}"),
                })
            }
        };
        let http_timeout_secs = match get("BUNDLEWATCH_HTTP_TIMEOUT_SECS") {
            None => 30,
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                name: "BUNDLEWATCH_HTTP_TIMEOUT_SECS",
                reason: format!("not a number: {raw:?}"),
            })?,
        };

        Ok(Self {
            database_url: get("BUNDLEWATCH_DATABASE_URL").unwrap_or_else(|| "sqlite://bundlewatch.db".to_string()),
            state_file: get("BUNDLEWATCH_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/known_bundles.json")),
            reports_dir: get("BUNDLEWATCH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("reports")),
            tuning_file: get("BUNDLEWATCH_TUNING_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("bundlewatch.yaml")),
            api_key: get("STEAM_API_KEY"),
            batch_api,
            render_url: get("BUNDLEWATCH_RENDER_URL"),
            country_code: get("BUNDLEWATCH_COUNTRY").unwrap_or_else(|| "BR".to_string()),
            language: get("BUNDLEWATCH_LANGUAGE").unwrap_or_else(|| "brazilian".to_string()),
            fallback_currency: get("BUNDLEWATCH_FALLBACK_CURRENCY").unwrap_or_else(|| "BRL".to_string()),
            user_agent: get("BUNDLEWATCH_USER_AGENT"),
            http_timeout_secs,
            scheduler_enabled: get("BUNDLEWATCH_SCHEDULER_ENABLED").is_some_and(|v| truthy(&v)),
            cron: get("BUNDLEWATCH_CRON").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            tuning: Tuning::default(),
        })
    }

    /// Credentials and limits needed before any batch-lookup call.
    pub fn validate_upstream(&self) -> Result<(), ConfigError> {
        if self.batch_api == BatchApi::StoreBrowse && self.api_key.is_none() {
            return Err(ConfigError::MissingCredential("STEAM_API_KEY"));
        }
        let scan = &self.tuning.scan;
        if scan.range_end <= scan.range_start {
            return Err(ConfigError::Invalid {
                name: "scan.range_end",
                reason: format!("{} is not above range_start {}", scan.range_end, scan.range_start),
            });
        }
        if scan.window_size == 0 || self.tuning.fetch.batch_size == 0 || self.tuning.fetch.concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "window/batch/concurrency",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn validate_render(&self) -> Result<(), ConfigError> {
        if self.render_url.is_none() {
            return Err(ConfigError::MissingTarget("BUNDLEWATCH_RENDER_URL"));
        }
        if self.tuning.render.batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "render.batch_size",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    pub fn http(&self) -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone().or(defaults.user_agent),
            ..defaults
        }
    }

    pub fn lookup_context(&self) -> LookupContext {
        LookupContext {
            country_code: self.country_code.clone(),
            language: self.language.clone(),
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        let t = &self.tuning.scan;
        ScanSettings {
            range_start: t.range_start,
            range_end: t.range_end,
            window_size: t.window_size,
            inter_window_delay: Duration::from_millis(t.inter_window_delay_ms),
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        let t = &self.tuning.fetch;
        FetchSettings {
            concurrency: t.concurrency,
            batch_size: t.batch_size,
            inter_batch_delay: Duration::from_millis(t.inter_batch_delay_ms),
            block: BlockPolicy {
                rate_limited_fallback: Duration::from_secs(t.rate_limited_block_secs),
                access_denied_fallback: Duration::from_secs(t.access_denied_block_secs),
                max_sleep: Duration::from_secs(t.max_block_sleep_secs),
            },
            detail_backoff: BackoffPolicy {
                max_attempts: t.detail_attempts,
                base_delay: Duration::from_millis(t.detail_backoff_ms),
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn render_settings(&self) -> RenderSettings {
        let t = &self.tuning.render;
        RenderSettings {
            batch_size: t.batch_size,
            per_id_delay: Duration::from_millis(t.per_id_delay_ms),
            inter_batch_pause: Duration::from_millis(t.inter_batch_pause_ms),
            options: RenderOptions {
                navigation_timeout: Duration::from_millis(t.navigation_timeout_ms),
                selector_timeout: Duration::from_millis(t.selector_timeout_ms),
                ..RenderOptions::default()
            },
        }
    }
}
