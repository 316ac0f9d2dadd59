//! Whale Registry - immutable roster snapshots behind an atomic swap
//!
//! Readers take an `Arc` clone of the active snapshot and keep using it for as long as they
//! like; a publish only swaps the pointer. Reads never take a lock. Publishers serialize on
//! a mutex so the generation check and the swap happen together.

use alloy_primitives::Address;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::utils::address::checksum;

pub const DEFAULT_LABEL: &str = "unknown";

/// A ranked holder. Immutable once placed in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhaleEntry {
    pub address: Address,
    pub rank: u32,
    pub label: String,
    pub last_known_balance: Decimal,
}

impl WhaleEntry {
    pub fn new(address: Address, rank: u32, last_known_balance: Decimal) -> Self {
        Self {
            address,
            rank,
            label: DEFAULT_LABEL.to_string(),
            last_known_balance,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// A complete roster generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhaleSnapshot {
    pub generation: u64,
    pub entries: HashMap<Address, WhaleEntry>,
    pub built_at: DateTime<Utc>,
}

impl WhaleSnapshot {
    /// The snapshot active before any roster has been loaded
    pub fn empty() -> Self {
        Self {
            generation: 0,
            entries: HashMap::new(),
            built_at: Utc::now(),
        }
    }

    pub fn build(generation: u64, entries: Vec<WhaleEntry>) -> Self {
        Self {
            generation,
            entries: entries.into_iter().map(|e| (e.address, e)).collect(),
            built_at: Utc::now(),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&WhaleEntry> {
        self.entries.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.entries.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in rank order
    pub fn ranked(&self) -> Vec<&WhaleEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.rank);
        entries
    }
}

/// Holder of the single active snapshot
pub struct WhaleRegistry {
    active: ArcSwap<WhaleSnapshot>,
    publish_lock: Mutex<()>,
}

impl WhaleRegistry {
    pub fn new() -> Self {
        Self::with_snapshot(WhaleSnapshot::empty())
    }

    pub fn with_snapshot(snapshot: WhaleSnapshot) -> Self {
        Self {
            active: ArcSwap::from_pointee(snapshot),
            publish_lock: Mutex::new(()),
        }
    }

    /// Latest published snapshot
    pub fn read(&self) -> Arc<WhaleSnapshot> {
        self.active.load_full()
    }

    /// Install `snapshot`, discarding the previous one. A snapshot whose generation does not
    /// move forward is rejected and `false` is returned.
    pub fn publish(&self, snapshot: WhaleSnapshot) -> bool {
        self.publish_shared(Arc::new(snapshot))
    }

    /// [`publish`](Self::publish) for a snapshot the caller keeps a handle to
    pub fn publish_shared(&self, snapshot: Arc<WhaleSnapshot>) -> bool {
        let previous = {
            let _writer = self.publish_lock.lock();
            let active = self.active.load();
            if snapshot.generation <= active.generation {
                warn!(
                    target: "REGISTRY",
                    "Rejected stale roster generation {} (active {})",
                    snapshot.generation,
                    active.generation
                );
                return false;
            }
            self.active.swap(Arc::clone(&snapshot))
        };

        info!(
            target: "REGISTRY",
            "Published roster generation {} ({} whales, replaced generation {})",
            snapshot.generation,
            snapshot.len(),
            previous.generation
        );
        if let Some(top) = snapshot.ranked().first() {
            info!(target: "REGISTRY", "Top whale: #{} {}", top.rank, checksum(&top.address));
        }
        true
    }

    pub fn generation(&self) -> u64 {
        self.active.load().generation
    }
}

impl Default for WhaleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn roster(generation: u64, bytes: &[u8]) -> WhaleSnapshot {
        WhaleSnapshot::build(
            generation,
            bytes
                .iter()
                .enumerate()
                .map(|(i, b)| WhaleEntry::new(addr(*b), i as u32 + 1, Decimal::from(1_000)))
                .collect(),
        )
    }

    #[test]
    fn test_starts_empty() {
        let registry = WhaleRegistry::new();
        let snapshot = registry.read();
        assert_eq!(snapshot.generation, 0);
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_publish_replaces_snapshot() {
        let registry = WhaleRegistry::new();
        assert!(registry.publish(roster(1, &[1, 2])));
        let first = registry.read();

        assert!(registry.publish(roster(2, &[3])));
        let second = registry.read();

        // Old readers keep their complete snapshot
        assert_eq!(first.len(), 2);
        assert!(first.contains(&addr(1)));
        assert_eq!(second.generation, 2);
        assert!(!second.contains(&addr(1)));
        assert!(second.contains(&addr(3)));
    }

    #[test]
    fn test_stale_generation_rejected() {
        let registry = WhaleRegistry::new();
        assert!(registry.publish(roster(5, &[1])));
        assert!(!registry.publish(roster(5, &[2])));
        assert!(!registry.publish(roster(3, &[2])));
        assert_eq!(registry.generation(), 5);
        assert!(registry.read().contains(&addr(1)));
    }

    #[test]
    fn test_ranked_order_and_default_label() {
        let snapshot = roster(1, &[9, 8, 7]);
        let ranks: Vec<u32> = snapshot.ranked().iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(snapshot.get(&addr(9)).unwrap().label, DEFAULT_LABEL);
    }

    #[test]
    fn test_readers_never_see_torn_snapshot() {
        let registry = Arc::new(WhaleRegistry::new());
        let writer = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for generation in 1..=200u64 {
                    // Every generation holds exactly `generation % 7 + 1` entries
                    let size = (generation % 7 + 1) as u8;
                    let bytes: Vec<u8> = (1..=size).collect();
                    registry.publish(roster(generation, &bytes));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = registry.read();
                        if snapshot.generation > 0 {
                            assert_eq!(snapshot.len() as u64, snapshot.generation % 7 + 1);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(registry.generation(), 200);
    }

    #[test]
    fn test_concurrent_publishers_only_move_forward() {
        let registry = Arc::new(WhaleRegistry::new());
        let writers: Vec<_> = (0..4u64)
            .map(|offset| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let mut accepted = 0;
                    for step in 0..100u64 {
                        if registry.publish(roster(step * 4 + offset + 1, &[1])) {
                            accepted += 1;
                        }
                    }
                    accepted
                })
            })
            .collect();

        let mut last_seen = 0;
        for _ in 0..2_000 {
            let generation = registry.generation();
            assert!(generation >= last_seen);
            last_seen = generation;
        }

        let accepted: u32 = writers.into_iter().map(|w| w.join().unwrap()).sum();
        assert!(accepted >= 1);
        assert_eq!(registry.generation(), 400);
    }
}
