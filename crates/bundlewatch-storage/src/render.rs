//! Client for a headless rendering service that returns post-JavaScript HTML.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info_span, Instrument};

use crate::http::{build_client, HttpClientConfig};

/// Elements whose presence means the client-side price has been computed.
pub const PRICE_SELECTOR: &str = ".game_purchase_price, .discount_final_price";

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("rendering {url} timed out")]
    Timeout { url: String },
    #[error("rendering service returned status {status} for {url}")]
    Navigation { status: u16, url: String },
    #[error("rendering request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub navigation_timeout: Duration,
    pub selector: String,
    pub selector_timeout: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            selector: PRICE_SELECTOR.to_string(),
            selector_timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Loads `url`, waits for network idle and then for the selector (or its
    /// timeout), and returns the rendered document. Only a failed or timed
    /// out navigation is an error; a selector that never appears is not.
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, RenderError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest<'a> {
    url: &'a str,
    goto_options: GotoOptions,
    wait_for_selector: WaitForSelector<'a>,
    /// Return whatever loaded when the selector wait runs out.
    best_attempt: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    wait_until: &'static str,
    timeout: u64,
}

#[derive(Debug, Serialize)]
struct WaitForSelector<'a> {
    selector: &'a str,
    timeout: u64,
}

/// Talks to a `/content`-style endpoint that drives a headless browser.
#[derive(Debug, Clone)]
pub struct RenderClient {
    client: reqwest::Client,
    endpoint: String,
}

impl RenderClient {
    pub fn new(endpoint: impl Into<String>, http: &HttpClientConfig) -> anyhow::Result<Self> {
        let endpoint = endpoint.into();
        if endpoint.trim().is_empty() {
            anyhow::bail!("rendering endpoint is empty");
        }
        Ok(Self {
            client: build_client(http)?,
            endpoint,
        })
    }
}

#[async_trait]
impl PageRenderer for RenderClient {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<String, RenderError> {
        let body = ContentRequest {
            url,
            goto_options: GotoOptions {
                wait_until: "networkidle2",
                timeout: options.navigation_timeout.as_millis() as u64,
            },
            wait_for_selector: WaitForSelector {
                selector: &options.selector,
                timeout: options.selector_timeout.as_millis() as u64,
            },
            best_attempt: true,
        };
        let budget = options.navigation_timeout + options.selector_timeout + Duration::from_secs(5);

        async {
            let resp = self
                .client
                .post(&self.endpoint)
                .timeout(budget)
                .json(&body)
                .send()
                .await
                .map_err(|err| classify(err, url))?;
            let status = resp.status();
            if status.as_u16() == 408 || status.as_u16() == 504 {
                return Err(RenderError::Timeout { url: url.to_string() });
            }
            if !status.is_success() {
                return Err(RenderError::Navigation {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            resp.text().await.map_err(|err| classify(err, url))
        }
        .instrument(info_span!("render_page", %url))
        .await
    }
}

fn classify(err: reqwest::Error, url: &str) -> RenderError {
    if err.is_timeout() {
        RenderError::Timeout { url: url.to_string() }
    } else {
        RenderError::Request(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_request_uses_browser_wire_names() {
        let body = ContentRequest {
            url: "https://store.steampowered.com/bundle/5/",
            goto_options: GotoOptions {
                wait_until: "networkidle2",
                timeout: 30_000,
            },
            wait_for_selector: WaitForSelector {
                selector: PRICE_SELECTOR,
                timeout: 5_000,
            },
            best_attempt: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["gotoOptions"]["waitUntil"], "networkidle2");
        assert_eq!(json["waitForSelector"]["timeout"], 5_000);
        assert_eq!(json["bestAttempt"], true);
    }

    #[test]
    fn empty_endpoint_is_rejected() {
        assert!(RenderClient::new("  ", &HttpClientConfig::default()).is_err());
    }
}
