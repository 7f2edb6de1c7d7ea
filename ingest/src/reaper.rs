use std::sync::Arc;
use std::time::Duration;

use frame_relay_common::cache::LatestFrameCache;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::info;

/// Periodically empty the cache once its frame has aged out.
///
/// Reads already treat an aged frame as absent; clearing the slot just makes
/// the transition visible once in the logs and drops the old payload.
pub async fn run_reaper(source: String, cache: Arc<LatestFrameCache>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        reap_once(&source, &cache, Instant::now());
    }
}

/// Clear the slot if its frame is stale at `now`. Returns whether it did.
pub fn reap_once(source: &str, cache: &LatestFrameCache, now: Instant) -> bool {
    if !cache.is_stale(now) {
        return false;
    }
    cache.clear();
    info!(
        source,
        last_seq = cache.last_sequence(),
        "frame aged out, no signal until the next publish"
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_relay_common::cache::StalenessPolicy;
    use frame_relay_common::frame::Frame;

    fn cache_with_max_age(secs: u64) -> Arc<LatestFrameCache> {
        Arc::new(LatestFrameCache::new(StalenessPolicy::new(Some(
            Duration::from_secs(secs),
        ))))
    }

    #[test]
    fn reap_once_clears_only_stale_frames() {
        let cache = cache_with_max_age(5);
        let t0 = Instant::now();
        cache.publish(Frame::with_timestamp(vec![1], 1, t0));

        assert!(!reap_once("s", &cache, t0 + Duration::from_secs(5)));
        assert!(cache.read_at(t0).is_some());

        assert!(reap_once("s", &cache, t0 + Duration::from_secs(6)));
        assert!(cache.read_at(t0).is_none());
        assert_eq!(cache.last_sequence(), Some(1));
        assert!(!reap_once("s", &cache, t0 + Duration::from_secs(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn background_reaper_clears_after_max_age() {
        let cache = cache_with_max_age(2);
        cache.publish(Frame::new(vec![1, 2], 1));
        let handle = tokio::spawn(run_reaper("s".into(), Arc::clone(&cache), Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(cache.snapshot().frame.map(|f| f.sequence()), Some(1));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(cache.snapshot().frame.is_none());

        // A fresh publish is served again.
        assert!(cache.publish(Frame::new(vec![3], 2)));
        assert_eq!(cache.read().map(|f| f.sequence()), Some(2));
        handle.abort();
    }
}
