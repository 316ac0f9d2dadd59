//! Dedup Filter - bounded, time-windowed memory of processed transfer logs

use alloy_primitives::B256;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Identity of one transfer log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessedKey {
    pub tx_hash: B256,
    pub log_index: u64,
}

impl ProcessedKey {
    pub fn new(tx_hash: B256, log_index: u64) -> Self {
        Self { tx_hash, log_index }
    }
}

/// LRU of processed keys with a wall-clock expiry. Whichever bound is hit first evicts.
pub struct DedupFilter {
    entries: Mutex<LruCache<ProcessedKey, Instant>>,
    window: Duration,
}

impl DedupFilter {
    pub fn new(capacity: NonZeroUsize, window: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            window,
        }
    }

    /// Atomically test for `key` and record it if absent. `true` on first sighting.
    pub fn check_and_mark(&self, key: ProcessedKey) -> bool {
        self.check_and_mark_at(key, Instant::now())
    }

    fn check_and_mark_at(&self, key: ProcessedKey, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        Self::evict_expired(&mut entries, self.window, now);

        if entries.peek(&key).is_some() {
            return false;
        }
        if let Some((evicted, _)) = entries.push(key, now) {
            if evicted != key {
                debug!(target: "DEDUP", "Capacity eviction of {}:{}", evicted.tx_hash, evicted.log_index);
            }
        }
        true
    }

    /// Forget `key` so a later delivery is treated as new. Used when processing could not
    /// complete (transient failure or shutdown).
    pub fn release(&self, key: &ProcessedKey) {
        self.entries.lock().pop(key);
    }

    pub fn contains(&self, key: &ProcessedKey) -> bool {
        let mut entries = self.entries.lock();
        Self::evict_expired(&mut entries, self.window, Instant::now());
        entries.peek(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Entries are inserted in time order and never refreshed, so the LRU tail is the oldest.
    fn evict_expired(entries: &mut LruCache<ProcessedKey, Instant>, window: Duration, now: Instant) {
        while let Some((_, seen_at)) = entries.peek_lru() {
            if now.saturating_duration_since(*seen_at) < window {
                break;
            }
            entries.pop_lru();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn key(byte: u8, log_index: u64) -> ProcessedKey {
        ProcessedKey::new(B256::repeat_byte(byte), log_index)
    }

    fn filter(capacity: usize, window_secs: u64) -> DedupFilter {
        DedupFilter::new(
            NonZeroUsize::new(capacity).unwrap(),
            Duration::from_secs(window_secs),
        )
    }

    #[test]
    fn test_first_sighting_only_once() {
        let dedup = filter(10, 60);
        assert!(dedup.check_and_mark(key(1, 0)));
        assert!(!dedup.check_and_mark(key(1, 0)));
        // Same tx, different log index is a different event
        assert!(dedup.check_and_mark(key(1, 1)));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn test_capacity_bound_evicts_oldest() {
        let dedup = filter(2, 60);
        assert!(dedup.check_and_mark(key(1, 0)));
        assert!(dedup.check_and_mark(key(2, 0)));
        assert!(dedup.check_and_mark(key(3, 0)));
        assert_eq!(dedup.len(), 2);
        assert!(!dedup.contains(&key(1, 0)));
        assert!(dedup.contains(&key(3, 0)));
    }

    #[test]
    fn test_time_window_expires_entries() {
        let dedup = filter(100, 10);
        let start = Instant::now();
        assert!(dedup.check_and_mark_at(key(1, 0), start));
        assert!(dedup.check_and_mark_at(key(2, 0), start + Duration::from_secs(5)));

        // Inside the window: still a duplicate
        assert!(!dedup.check_and_mark_at(key(1, 0), start + Duration::from_secs(9)));
        // First key has aged out, second has not
        assert!(dedup.check_and_mark_at(key(1, 0), start + Duration::from_secs(11)));
        assert!(!dedup.check_and_mark_at(key(2, 0), start + Duration::from_secs(11)));
    }

    #[test]
    fn test_duplicate_does_not_extend_window() {
        let dedup = filter(100, 10);
        let start = Instant::now();
        assert!(dedup.check_and_mark_at(key(1, 0), start));
        assert!(!dedup.check_and_mark_at(key(1, 0), start + Duration::from_secs(8)));
        assert!(dedup.check_and_mark_at(key(1, 0), start + Duration::from_secs(10)));
    }

    #[test]
    fn test_release_allows_reprocessing() {
        let dedup = filter(10, 60);
        assert!(dedup.check_and_mark(key(7, 3)));
        dedup.release(&key(7, 3));
        assert!(dedup.is_empty());
        assert!(dedup.check_and_mark(key(7, 3)));
    }

    #[test]
    fn test_concurrent_check_and_mark_admits_one() {
        let dedup = Arc::new(filter(1_000, 60));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = Arc::clone(&dedup);
                thread::spawn(move || (0..100u64).filter(|i| dedup.check_and_mark(key(9, *i))).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
