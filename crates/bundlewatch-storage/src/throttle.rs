//! Shared OPEN/BLOCKED state for upstream throttling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

/// Observable state of a [`ThrottleGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    Blocked { until: Instant },
}

/// How long to stay blocked when the upstream gives no retry hint, and how
/// long a deferred caller may sleep before handing control back.
#[derive(Debug, Clone, Copy)]
pub struct BlockPolicy {
    pub rate_limited_fallback: Duration,
    pub access_denied_fallback: Duration,
    pub max_sleep: Duration,
}

impl Default for BlockPolicy {
    fn default() -> Self {
        Self {
            rate_limited_fallback: Duration::from_secs(60),
            access_denied_fallback: Duration::from_secs(300),
            max_sleep: Duration::from_secs(5),
        }
    }
}

/// Block deadline shared by every concurrent batch call of one orchestrator.
///
/// The deadline is a single atomic holding milliseconds since `origin`; `0`
/// means OPEN. Blocking only ever moves the deadline forward, so callers that
/// observe the same throttling response concurrently converge on one value.
#[derive(Debug)]
pub struct ThrottleGate {
    origin: Instant,
    blocked_until_ms: AtomicU64,
    policy: BlockPolicy,
}

impl ThrottleGate {
    pub fn new(policy: BlockPolicy) -> Self {
        Self {
            origin: Instant::now(),
            blocked_until_ms: AtomicU64::new(0),
            policy,
        }
    }

    pub fn policy(&self) -> &BlockPolicy {
        &self.policy
    }

    pub fn state(&self) -> GateState {
        match self.remaining() {
            Some(left) => GateState::Blocked {
                until: Instant::now() + left,
            },
            None => GateState::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.remaining().is_none()
    }

    /// Time left until the gate reopens, `None` when OPEN.
    pub fn remaining(&self) -> Option<Duration> {
        let until = self.blocked_until_ms.load(Ordering::Acquire);
        if until == 0 {
            return None;
        }
        let now = self.millis_since_origin(Instant::now());
        (until > now).then(|| Duration::from_millis(until - now))
    }

    /// Moves the gate to BLOCKED for `duration` from now. Returns the
    /// effective remaining block, which may be longer if another caller
    /// already blocked further out.
    pub fn block_for(&self, duration: Duration) -> Duration {
        let now = self.millis_since_origin(Instant::now());
        let until = now.saturating_add(duration.as_millis() as u64).max(1);
        let previous = self.blocked_until_ms.fetch_max(until, Ordering::AcqRel);
        if previous < until {
            warn!(block_secs = duration.as_secs(), "upstream throttled; gate blocked");
        }
        Duration::from_millis(previous.max(until).saturating_sub(now))
    }

    /// Blocks using the upstream hint, or the policy fallback for `status`.
    pub fn block_on_status(&self, status: u16, retry_after: Option<Duration>) -> Duration {
        let fallback = if status == 403 {
            self.policy.access_denied_fallback
        } else {
            self.policy.rate_limited_fallback
        };
        self.block_for(retry_after.unwrap_or(fallback))
    }

    /// When BLOCKED, sleeps for the remaining block (capped at
    /// `max_sleep`) and returns `true`; the caller must then skip its request.
    pub async fn defer_if_blocked(&self) -> bool {
        let Some(left) = self.remaining() else {
            return false;
        };
        let nap = left.min(self.policy.max_sleep);
        debug!(remaining_ms = left.as_millis() as u64, nap_ms = nap.as_millis() as u64, "gate blocked; deferring call");
        tokio::time::sleep(nap).await;
        true
    }

    fn millis_since_origin(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_millis() as u64
    }
}

impl Default for ThrottleGate {
    fn default() -> Self {
        Self::new(BlockPolicy::default())
    }
}
