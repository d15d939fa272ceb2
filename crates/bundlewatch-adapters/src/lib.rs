//! Response mapping: raw upstream payloads into candidate bundle records.

use std::collections::BTreeSet;

use bundlewatch_core::{BundleId, BundleRecord};
use bundlewatch_storage::{BatchApi, BatchBody};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod html;
pub mod json;
pub mod money;

pub use html::HtmlPageMapper;
pub use json::{ResolveBundlesMapper, StoreBrowseMapper};

pub const CRATE_NAME: &str = "bundlewatch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    StoreBrowseJson,
    ResolveBundlesJson,
    RenderedHtml,
}

/// Every payload shape the upstream surface has produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    StoreBrowseJson(String),
    ResolveBundlesJson(String),
    RenderedHtml { id: BundleId, html: String },
}

impl RawPayload {
    pub fn from_batch(batch: BatchBody) -> Self {
        match batch.api {
            BatchApi::StoreBrowse => RawPayload::StoreBrowseJson(batch.body),
            BatchApi::ResolveBundles => RawPayload::ResolveBundlesJson(batch.body),
        }
    }

    pub fn html(id: BundleId, html: impl Into<String>) -> Self {
        RawPayload::RenderedHtml { id, html: html.into() }
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            RawPayload::StoreBrowseJson(_) => PayloadKind::StoreBrowseJson,
            RawPayload::ResolveBundlesJson(_) => PayloadKind::ResolveBundlesJson,
            RawPayload::RenderedHtml { .. } => PayloadKind::RenderedHtml,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            RawPayload::StoreBrowseJson(body) | RawPayload::ResolveBundlesJson(body) => body,
            RawPayload::RenderedHtml { html, .. } => html,
        }
    }

    /// Identifier carried by the payload itself, if any.
    pub fn id_hint(&self) -> Option<BundleId> {
        match self {
            RawPayload::RenderedHtml { id, .. } => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapperContext {
    /// ISO code used when price text carries no recognizable symbol.
    pub fallback_currency: String,
    pub observed_at: DateTime<Utc>,
}

impl MapperContext {
    pub fn new(fallback_currency: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            fallback_currency: fallback_currency.into(),
            observed_at,
        }
    }
}

/// One implementation per [`PayloadKind`].
///
/// Data-shape problems inside a payload (missing name, ghost price, bad
/// price text) drop the entry silently. Only a payload that cannot be read
/// at all is an error.
pub trait PayloadMapper: Send + Sync {
    fn kind(&self) -> PayloadKind;

    fn map(&self, body: &str, hint: Option<BundleId>, ctx: &MapperContext) -> Result<Vec<BundleRecord>, AdapterError>;

    /// Ids the payload proves exist: an entry is present and carries a name.
    fn confirmed_ids(&self, body: &str, hint: Option<BundleId>) -> Result<BTreeSet<BundleId>, AdapterError>;
}

static STORE_BROWSE: StoreBrowseMapper = StoreBrowseMapper;
static RESOLVE_BUNDLES: ResolveBundlesMapper = ResolveBundlesMapper;
static HTML_PAGE: HtmlPageMapper = HtmlPageMapper;

pub fn mapper_for(kind: PayloadKind) -> &'static dyn PayloadMapper {
    match kind {
        PayloadKind::StoreBrowseJson => &STORE_BROWSE,
        PayloadKind::ResolveBundlesJson => &RESOLVE_BUNDLES,
        PayloadKind::RenderedHtml => &HTML_PAGE,
    }
}

pub fn map_batch(payload: &RawPayload, ctx: &MapperContext) -> Result<Vec<BundleRecord>, AdapterError> {
    mapper_for(payload.kind()).map(payload.body(), payload.id_hint(), ctx)
}

/// Single-record form. `hint` selects the entry in a batch payload and
/// supplies the id for an HTML payload that does not carry one.
pub fn map_to_record(
    payload: &RawPayload,
    hint: Option<BundleId>,
    ctx: &MapperContext,
) -> Result<Option<BundleRecord>, AdapterError> {
    let hint = payload.id_hint().or(hint);
    let records = mapper_for(payload.kind()).map(payload.body(), hint, ctx)?;
    Ok(match hint {
        Some(id) => records.into_iter().find(|r| r.id == id),
        None => records.into_iter().next(),
    })
}

pub fn confirmed_ids(payload: &RawPayload) -> Result<BTreeSet<BundleId>, AdapterError> {
    mapper_for(payload.kind()).confirmed_ids(payload.body(), payload.id_hint())
}
