//! Upstream HTTP plumbing and bundle persistence.

pub mod gateway;
pub mod http;
pub mod render;
pub mod sqlite;
pub mod state;
pub mod store;
pub mod throttle;
pub mod upstream;

pub use gateway::{PersistenceGateway, WriteOutcome};
pub use http::{
    build_client, classify_reqwest_error, classify_status, parse_retry_after, BackoffPolicy, HttpClientConfig,
    RetryDisposition, UpstreamError,
};
pub use render::{PageRenderer, RenderClient, RenderError, RenderOptions};
pub use sqlite::SqliteStore;
pub use state::{DiscoveryStateStore, JsonStateFile, MemoryStateStore};
pub use store::{BundleStore, MemoryStore, RunLog, StoreError};
pub use throttle::{BlockPolicy, GateState, ThrottleGate};
pub use upstream::{BatchApi, BatchBody, LookupContext, SteamStoreClient, SteamStoreConfig, StoreUpstream, MAX_BATCH_IDS};

pub const CRATE_NAME: &str = "bundlewatch-storage";
