//! Replay cache: tracks Sphinx replay tags seen within a sliding window so
//! a resubmitted onion layer is dropped instead of forwarded twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

const DEFAULT_WINDOW: Duration = Duration::from_secs(600);

/// Sharded-by-caller replay cache (callers lock once per check via the
/// shared `tokio::sync::Mutex`, matching the rest of this pipeline's
/// concurrency idiom).
pub struct ReplayCache {
    seen: Mutex<HashMap<[u8; 32], Instant>>,
    window: Duration,
}

impl ReplayCache {
    pub fn new() -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Record `tag` if not already present and not expired; returns `true`
    /// if this is the first time the tag has been seen within the window
    /// (i.e. the packet should proceed), `false` if it's a replay.
    pub async fn check_and_insert(&self, tag: [u8; 32]) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;

        if let Some(&seen_at) = seen.get(&tag) {
            if now.duration_since(seen_at) < self.window {
                return false;
            }
        }

        seen.insert(tag, now);
        true
    }

    /// Drop entries older than the window. Intended to run on a periodic
    /// `tokio::time::interval`.
    pub async fn evict_expired(&self) {
        let now = Instant::now();
        let window = self.window;
        let mut seen = self.seen.lock().await;
        seen.retain(|_, &mut seen_at| now.duration_since(seen_at) < window);
    }

    pub async fn len(&self) -> usize {
        self.seen.lock().await.len()
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_sighting_passes_second_is_replay() {
        let cache = ReplayCache::new();
        let tag = [1u8; 32];
        assert!(cache.check_and_insert(tag).await);
        assert!(!cache.check_and_insert(tag).await);
    }

    #[tokio::test]
    async fn distinct_tags_are_independent() {
        let cache = ReplayCache::new();
        assert!(cache.check_and_insert([1u8; 32]).await);
        assert!(cache.check_and_insert([2u8; 32]).await);
    }

    #[tokio::test]
    async fn expired_entries_are_forgotten_after_eviction() {
        let cache = ReplayCache::with_window(Duration::from_millis(1));
        let tag = [3u8; 32];
        assert!(cache.check_and_insert(tag).await);
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.evict_expired().await;
        assert_eq!(cache.len().await, 0);
    }
}
