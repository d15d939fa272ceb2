//! Storefront batch-lookup and detail-page clients.

use async_trait::async_trait;
use bundlewatch_core::{bundle_url, BundleId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info_span, Instrument};

use crate::http::{build_client, status_error, HttpClientConfig, UpstreamError};

pub const STORE_BROWSE_URL: &str = "https://api.steampowered.com/IStoreBrowseService/GetItems/v1/";
pub const RESOLVE_BUNDLES_URL: &str = "https://store.steampowered.com/actions/ajaxresolvebundles";

/// Upstream ceiling on identifiers per batch call.
pub const MAX_BATCH_IDS: usize = 100;

/// Which batch-lookup surface produced a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchApi {
    #[default]
    StoreBrowse,
    ResolveBundles,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupContext {
    pub country_code: String,
    pub language: String,
}

impl Default for LookupContext {
    fn default() -> Self {
        Self {
            country_code: "BR".to_string(),
            language: "brazilian".to_string(),
        }
    }
}

/// Undecoded batch response, tagged with the surface that produced it.
#[derive(Debug, Clone)]
pub struct BatchBody {
    pub api: BatchApi,
    pub body: String,
}

#[async_trait]
pub trait StoreUpstream: Send + Sync {
    /// One batch call for at most [`MAX_BATCH_IDS`] identifiers.
    async fn lookup_batch(&self, ids: &[BundleId], ctx: &LookupContext) -> Result<BatchBody, UpstreamError>;

    /// Plain HTTP fetch of the bundle's store page.
    async fn fetch_detail_page(&self, id: BundleId) -> Result<String, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct SteamStoreConfig {
    pub api: BatchApi,
    pub api_key: Option<String>,
    pub store_browse_url: String,
    pub resolve_bundles_url: String,
    pub http: HttpClientConfig,
}

impl Default for SteamStoreConfig {
    fn default() -> Self {
        Self {
            api: BatchApi::StoreBrowse,
            api_key: None,
            store_browse_url: STORE_BROWSE_URL.to_string(),
            resolve_bundles_url: RESOLVE_BUNDLES_URL.to_string(),
            http: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SteamStoreClient {
    client: reqwest::Client,
    config: SteamStoreConfig,
}

impl SteamStoreClient {
    pub fn new(config: SteamStoreConfig) -> anyhow::Result<Self> {
        if config.api == BatchApi::StoreBrowse && config.api_key.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("the store browse batch api requires an api key");
        }
        let client = build_client(&config.http)?;
        Ok(Self { client, config })
    }

    async fn get_text(&self, request: reqwest::RequestBuilder) -> Result<String, UpstreamError> {
        let resp = request.send().await?;
        let status = resp.status();
        let url = resp.url().to_string();
        if !status.is_success() {
            return Err(status_error(status, resp.headers(), &url));
        }
        Ok(resp.text().await?)
    }
}

/// `input_json` parameter for the store-browse surface.
pub fn store_browse_input(ids: &[BundleId], ctx: &LookupContext) -> serde_json::Value {
    json!({
        "ids": ids.iter().map(|id| json!({ "bundleid": id })).collect::<Vec<_>>(),
        "context": { "language": ctx.language, "country_code": ctx.country_code },
        "data_request": {
            "include_assets": true,
            "include_platforms": true,
            "include_included_items": true,
            "include_basic_info": true,
        },
    })
}

pub fn join_ids(ids: &[BundleId]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
}

#[async_trait]
impl StoreUpstream for SteamStoreClient {
    async fn lookup_batch(&self, ids: &[BundleId], ctx: &LookupContext) -> Result<BatchBody, UpstreamError> {
        let ids = &ids[..ids.len().min(MAX_BATCH_IDS)];
        let first = ids.first().copied().unwrap_or_default();
        let span = info_span!("upstream_batch", api = ?self.config.api, first_id = first, size = ids.len());

        async {
            let request = match self.config.api {
                BatchApi::StoreBrowse => self.client.get(&self.config.store_browse_url).query(&[
                    ("key", self.config.api_key.clone().unwrap_or_default()),
                    ("input_json", store_browse_input(ids, ctx).to_string()),
                ]),
                BatchApi::ResolveBundles => self.client.get(&self.config.resolve_bundles_url).query(&[
                    ("bundleids", join_ids(ids)),
                    ("cc", ctx.country_code.clone()),
                    ("l", ctx.language.clone()),
                ]),
            };
            let body = self.get_text(request).await?;
            debug!(bytes = body.len(), "batch response received");
            Ok(BatchBody {
                api: self.config.api,
                body,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_detail_page(&self, id: BundleId) -> Result<String, UpstreamError> {
        let url = bundle_url(id);
        let span = info_span!("upstream_detail", bundle_id = id, %url);
        self.get_text(self.client.get(&url)).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_browse_input_lists_every_id_with_context() {
        let input = store_browse_input(&[10, 11], &LookupContext::default());
        assert_eq!(input["ids"][0]["bundleid"], 10);
        assert_eq!(input["ids"][1]["bundleid"], 11);
        assert_eq!(input["context"]["country_code"], "BR");
        assert_eq!(input["context"]["language"], "brazilian");
    }

    #[test]
    fn legacy_ids_are_comma_joined() {
        assert_eq!(join_ids(&[1, 22, 333]), "1,22,333");
    }

    #[test]
    fn store_browse_requires_api_key() {
        assert!(SteamStoreClient::new(SteamStoreConfig::default()).is_err());
        let legacy = SteamStoreConfig {
            api: BatchApi::ResolveBundles,
            ..SteamStoreConfig::default()
        };
        assert!(SteamStoreClient::new(legacy).is_ok());
    }
}
