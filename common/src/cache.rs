use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::frame::Frame;

/// Maximum age a published frame may reach before reads treat it as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StalenessPolicy {
    max_age: Option<Duration>,
}

impl StalenessPolicy {
    pub fn new(max_age: Option<Duration>) -> Self {
        Self { max_age }
    }

    /// Frames never age out.
    pub fn disabled() -> Self {
        Self { max_age: None }
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    /// `true` once `now - published_at` is strictly greater than the max age.
    pub fn is_stale(&self, published_at: Instant, now: Instant) -> bool {
        match self.max_age {
            Some(max_age) => now.saturating_duration_since(published_at) > max_age,
            None => false,
        }
    }
}

struct Slot {
    frame: Option<Arc<Frame>>,
    /// Highest sequence ever accepted; survives `clear()`.
    last_sequence: Option<u64>,
}

/// Point-in-time view of the cache for status reporting.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    pub last_sequence: Option<u64>,
    pub frame: Option<Arc<Frame>>,
    pub stale: bool,
}

/// Single-slot holder of the newest published frame.
///
/// One writer publishes, any number of sessions read. The frame is fully
/// built before `publish` and installed by swapping one `Arc`, so readers
/// only ever see a whole frame. Reads clone the `Arc` and drop the lock
/// immediately.
pub struct LatestFrameCache {
    slot: RwLock<Slot>,
    policy: StalenessPolicy,
}

impl LatestFrameCache {
    pub fn new(policy: StalenessPolicy) -> Self {
        Self {
            slot: RwLock::new(Slot {
                frame: None,
                last_sequence: None,
            }),
            policy,
        }
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    /// Install `candidate` if its sequence is newer than anything accepted so far.
    ///
    /// Returns `false` for duplicate or out-of-order sequences; those are
    /// dropped without touching the stored frame.
    pub fn publish(&self, candidate: Frame) -> bool {
        let candidate = Arc::new(candidate);
        let mut slot = self.write_slot();
        if let Some(last) = slot.last_sequence {
            if candidate.sequence() <= last {
                debug!(
                    seq = candidate.sequence(),
                    last_seq = last,
                    "rejecting stale or duplicate publish"
                );
                return false;
            }
        }
        slot.last_sequence = Some(candidate.sequence());
        slot.frame = Some(candidate);
        true
    }

    /// Newest frame, or `None` if nothing is stored or it has aged out.
    pub fn read(&self) -> Option<Arc<Frame>> {
        self.read_at(Instant::now())
    }

    pub fn read_at(&self, now: Instant) -> Option<Arc<Frame>> {
        let frame = self.read_slot().frame.clone()?;
        if self.policy.is_stale(frame.published_at(), now) {
            None
        } else {
            Some(frame)
        }
    }

    /// Empty the slot. The sequence high-water mark is kept.
    pub fn clear(&self) {
        self.write_slot().frame = None;
    }

    /// `true` when a frame is stored but too old to serve.
    pub fn is_stale(&self, now: Instant) -> bool {
        match &self.read_slot().frame {
            Some(frame) => self.policy.is_stale(frame.published_at(), now),
            None => false,
        }
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.read_slot().last_sequence
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let now = Instant::now();
        let slot = self.read_slot();
        let stale = slot
            .frame
            .as_ref()
            .map(|f| self.policy.is_stale(f.published_at(), now))
            .unwrap_or(false);
        CacheSnapshot {
            last_sequence: slot.last_sequence,
            frame: slot.frame.clone(),
            stale,
        }
    }

    // Writes are single assignments, so a poisoned slot is still consistent.
    fn read_slot(&self) -> RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LatestFrameCache {
    fn default() -> Self {
        Self::new(StalenessPolicy::default())
    }
}
