//! In-process upstream and renderer doubles.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bundlewatch_core::BundleId;
use bundlewatch_storage::{
    BatchApi, BatchBody, LookupContext, PageRenderer, RenderError, RenderOptions, StoreUpstream, UpstreamError,
};
use serde_json::json;

use crate::CancelFlag;

fn priced_page(id: BundleId) -> String {
    format!(
        r#"<html><body><h2 class="pageheader">Bundle {id}</h2>
        <div class="discount_block"><div class="discount_pct">-50%</div>
        <div class="discount_original_price">R$ 20,00</div>
        <div class="discount_final_price">R$ 10,00</div></div></body></html>"#
    )
}

fn unpriced_page(id: BundleId) -> String {
    format!(r#"<html><body><h2 class="pageheader">Bundle {id}</h2><div class="game_area_purchase_game"></div></body></html>"#)
}

#[derive(Default)]
pub(crate) struct MockUpstream {
    priced: BTreeSet<BundleId>,
    unpriced: BTreeSet<BundleId>,
    failing: BTreeSet<BundleId>,
    throttle_first: Option<(u16, Option<Duration>)>,
    detail_failures: (usize, u16),
    cancel_on_first: Option<CancelFlag>,
    batches: Mutex<Vec<Vec<BundleId>>>,
    details: AtomicUsize,
}

impl MockUpstream {
    pub(crate) fn with_named(ids: impl IntoIterator<Item = BundleId>) -> Self {
        Self {
            priced: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub(crate) fn with_unpriced(mut self, ids: impl IntoIterator<Item = BundleId>) -> Self {
        self.unpriced.extend(ids);
        self
    }

    /// Any batch containing one of `ids` answers with a 500.
    pub(crate) fn failing_batches_containing(mut self, ids: impl IntoIterator<Item = BundleId>) -> Self {
        self.failing.extend(ids);
        self
    }

    pub(crate) fn throttle_first(mut self, status: u16, retry_after: Option<Duration>) -> Self {
        self.throttle_first = Some((status, retry_after));
        self
    }

    /// Trips `cancel` while the first batch call is in flight.
    pub(crate) fn cancel_on_first_call(mut self, cancel: CancelFlag) -> Self {
        self.cancel_on_first = Some(cancel);
        self
    }

    pub(crate) fn detail_failures(mut self, count: usize, status: u16) -> Self {
        self.detail_failures = (count, status);
        self
    }

    pub(crate) fn batch_calls(&self) -> Vec<Vec<BundleId>> {
        self.batches.lock().unwrap().clone()
    }

    pub(crate) fn detail_calls(&self) -> usize {
        self.details.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreUpstream for MockUpstream {
    async fn lookup_batch(&self, ids: &[BundleId], _ctx: &LookupContext) -> Result<BatchBody, UpstreamError> {
        let first = {
            let mut calls = self.batches.lock().unwrap();
            calls.push(ids.to_vec());
            calls.len() == 1
        };
        if let (true, Some(cancel)) = (first, &self.cancel_on_first) {
            cancel.cancel();
        }
        if let (true, Some((status, retry_after))) = (first, self.throttle_first) {
            return Err(UpstreamError::Throttled { status, retry_after });
        }
        if ids.iter().any(|id| self.failing.contains(id)) {
            return Err(UpstreamError::HttpStatus {
                status: 500,
                url: "mock://batch".to_string(),
            });
        }

        let entries: Vec<_> = ids
            .iter()
            .filter_map(|id| {
                if self.priced.contains(id) {
                    Some(json!({
                        "bundleid": id,
                        "name": format!("Bundle {id}"),
                        "final_price": 1000,
                        "initial_price": 2000,
                        "discount_percent": 50,
                        "formatted_final_price": "R$ 10,00",
                        "appids": [id * 10, id * 10 + 1],
                    }))
                } else if self.unpriced.contains(id) {
                    Some(json!({ "bundleid": id, "name": format!("Bundle {id}") }))
                } else {
                    None
                }
            })
            .collect();
        Ok(BatchBody {
            api: BatchApi::ResolveBundles,
            body: serde_json::Value::Array(entries).to_string(),
        })
    }

    async fn fetch_detail_page(&self, id: BundleId) -> Result<String, UpstreamError> {
        let n = self.details.fetch_add(1, Ordering::SeqCst);
        let (failures, status) = self.detail_failures;
        let url = format!("mock://bundle/{id}");
        if n < failures {
            return Err(UpstreamError::HttpStatus { status, url });
        }
        if self.priced.contains(&id) {
            Ok(priced_page(id))
        } else {
            Err(UpstreamError::HttpStatus { status: 404, url })
        }
    }
}

/// What the service returns when the price never rendered in time.
fn stalled_page(id: BundleId) -> String {
    format!(r#"<html><body><h2 class="pageheader">Bundle {id}</h2><p>Complete your collection</p></body></html>"#)
}

#[derive(Default)]
pub(crate) struct MockRenderer {
    priced: BTreeSet<BundleId>,
    unpriced: BTreeSet<BundleId>,
    selector_missed: BTreeSet<BundleId>,
    timeouts: BTreeSet<BundleId>,
    rendered: Mutex<Vec<BundleId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockRenderer {
    pub(crate) fn priced(ids: impl IntoIterator<Item = BundleId>) -> Self {
        Self {
            priced: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    pub(crate) fn unpriced(mut self, ids: impl IntoIterator<Item = BundleId>) -> Self {
        self.unpriced.extend(ids);
        self
    }

    /// The price selector never shows up; the service hands back the
    /// document as loaded.
    pub(crate) fn selector_missed(mut self, ids: impl IntoIterator<Item = BundleId>) -> Self {
        self.selector_missed.extend(ids);
        self
    }

    pub(crate) fn timing_out(mut self, ids: impl IntoIterator<Item = BundleId>) -> Self {
        self.timeouts.extend(ids);
        self
    }

    pub(crate) fn rendered(&self) -> Vec<BundleId> {
        self.rendered.lock().unwrap().clone()
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageRenderer for MockRenderer {
    async fn render(&self, url: &str, _options: &RenderOptions) -> Result<String, RenderError> {
        let id: BundleId = url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.rendered.lock().unwrap().push(id);

        if self.timeouts.contains(&id) {
            Err(RenderError::Timeout { url: url.to_string() })
        } else if self.priced.contains(&id) {
            Ok(priced_page(id))
        } else if self.unpriced.contains(&id) {
            Ok(unpriced_page(id))
        } else if self.selector_missed.contains(&id) {
            Ok(stalled_page(id))
        } else {
            Err(RenderError::Navigation {
                status: 404,
                url: url.to_string(),
            })
        }
    }
}
