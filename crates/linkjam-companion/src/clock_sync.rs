//! Round-trip clock offset estimation against the authority.
//!
//! Each round sends a `time_sync_ping` stamped with local `t0`, waits for
//! the matching pong carrying the authority's receive time `t1`, and stamps
//! local `t3` on arrival. Assuming a symmetric path, the authority read
//! `t1` half a round trip after `t0`:
//!
//! ```text
//! rtt    = t3 - t0
//! sample = t1 - (t0 + rtt / 2)
//! ```
//!
//! The median of the samples becomes the offset, so one slow round cannot
//! skew the result. Rounds that fail or time out are skipped.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use linkjam_core::config::SyncConfig;
use linkjam_core::time::TimeSource;
use linkjam_types::TimeSyncPong;
use tracing::{debug, info, warn};

use crate::error::CompanionError;

/// Something that can carry one ping/pong exchange.
pub trait TimeSyncTransport: Send + Sync {
    /// Send a ping stamped `t0_client` and resolve with its pong.
    fn round_trip(
        &self,
        t0_client: i64,
    ) -> impl Future<Output = Result<TimeSyncPong, CompanionError>> + Send;
}

/// Result of a synchronization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Estimated `authority - local` in milliseconds.
    pub offset_ms: i64,
    /// Per-round samples that contributed, in arrival order.
    pub samples: Vec<i64>,
    /// True if no round succeeded and the offset fell back to zero.
    pub degraded: bool,
}

/// Offset implied by one exchange.
pub const fn offset_sample(t0_client: i64, t1_server: i64, t3_client: i64) -> i64 {
    let rtt = t3_client.saturating_sub(t0_client);
    t1_server.saturating_sub(t0_client.saturating_add(rtt.div_euclid(2)))
}

/// Median of `samples`; the upper of the two middle values for an even
/// count, so the result is always one of the samples. `None` when empty.
pub fn median(samples: &[i64]) -> Option<i64> {
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    sorted.get(sorted.len().checked_div(2)?).copied()
}

/// Run `config.rounds` exchanges and estimate the offset.
///
/// Never fails: with no successful round the offset is zero and the
/// outcome is flagged degraded.
pub async fn synchronize<T, C>(transport: &T, clock: &C, config: &SyncConfig) -> SyncOutcome
where
    T: TimeSyncTransport + ?Sized,
    C: TimeSource + ?Sized,
{
    let mut samples = Vec::with_capacity(usize::try_from(config.rounds).unwrap_or_default());

    for round in 0..config.rounds {
        if round > 0 {
            tokio::time::sleep(config.round_pause()).await;
        }
        let t0 = clock.now_ms();
        match tokio::time::timeout(config.round_timeout(), transport.round_trip(t0)).await {
            Ok(Ok(pong)) => {
                let t3 = clock.now_ms();
                let sample = offset_sample(t0, pong.t1_server, t3);
                debug!(round, t0, t1 = pong.t1_server, t3, sample, "Clock sync round");
                samples.push(sample);
            }
            Ok(Err(e)) => debug!(round, "Clock sync round failed: {e}"),
            Err(_) => debug!(round, "Clock sync round timed out"),
        }
    }

    match median(&samples) {
        Some(offset_ms) => {
            info!(
                offset_ms,
                rounds = config.rounds,
                successful = samples.len(),
                "Clock synchronized"
            );
            SyncOutcome {
                offset_ms,
                samples,
                degraded: false,
            }
        }
        None => {
            warn!(
                rounds = config.rounds,
                "No clock sync round succeeded, assuming zero offset"
            );
            SyncOutcome {
                offset_ms: 0,
                samples,
                degraded: true,
            }
        }
    }
}

/// Shared, updatable clock offset.
///
/// Clones share the same value. Every client-side conversion to authority
/// time goes through [`Self::authority_now`].
#[derive(Debug, Clone, Default)]
pub struct ClockOffset {
    inner: Arc<OffsetInner>,
}

#[derive(Debug, Default)]
struct OffsetInner {
    offset_ms: AtomicI64,
    degraded: AtomicBool,
}

impl ClockOffset {
    /// A zero offset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current `authority - local` estimate.
    pub fn get(&self) -> i64 {
        self.inner.offset_ms.load(Ordering::Acquire)
    }

    /// Whether the last sync fell back to zero.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Acquire)
    }

    /// Store a sync result.
    pub fn apply(&self, outcome: &SyncOutcome) {
        self.inner.offset_ms.store(outcome.offset_ms, Ordering::Release);
        self.inner.degraded.store(outcome.degraded, Ordering::Release);
    }

    /// Convert a local instant to authority time.
    pub fn to_authority(&self, local_ms: i64) -> i64 {
        local_ms.saturating_add(self.get())
    }

    /// Authority time now, according to `local`.
    pub fn authority_now<C: TimeSource + ?Sized>(&self, local: &C) -> i64 {
        self.to_authority(local.now_ms())
    }
}
