//! # Seen Cache
//!
//! Hash-keyed cache of every transaction the pool has accepted or is still
//! considering. Entries are removed either at once (rejects, drops) or after
//! a delay (committed transactions), so a block's transactions relayed by a
//! slow peer right after commit are still recognised as duplicates.
//!
//! ## Design
//!
//! The key space is split into shards by the first hash byte. Each shard has
//! its own map and a min-heap of pending deletions, so a delayed delete is
//! `O(log n)` and purging never touches more than one shard lock at a time.
//! An optional capacity bounds the total entry count; a full cache first
//! purges due deletions in the target shard before refusing.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use super::tx::TxHash;

struct Shard<V> {
    entries: HashMap<TxHash, V>,
    expiry: BinaryHeap<Reverse<(Instant, TxHash)>>,
}

impl<V> Shard<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            expiry: BinaryHeap::new(),
        }
    }
}

/// Outcome of [`TxCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Put {
    Inserted,
    Present,
    Full,
}

pub struct TxCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    delay: Duration,
    capacity: usize,
    len: AtomicUsize,
}

impl<V: Clone> TxCache<V> {
    /// An unbounded cache.
    pub fn new(shards: usize, delay: Duration) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::new())).collect(),
            delay,
            capacity: usize::MAX,
            len: AtomicUsize::new(0),
        }
    }

    /// Caps the total number of entries. Zero means unbounded.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = if capacity == 0 { usize::MAX } else { capacity };
        self
    }

    fn shard(&self, hash: &TxHash) -> &Mutex<Shard<V>> {
        &self.shards[hash.0[0] as usize % self.shards.len()]
    }

    /// Inserts `value` unless the hash is present or the cache is full.
    pub fn put(&self, hash: TxHash, value: V) -> Put {
        let mut shard = self.shard(&hash).lock();
        if shard.entries.contains_key(&hash) {
            return Put::Present;
        }
        if self.len.load(Ordering::Relaxed) >= self.capacity {
            let purged = purge_shard(&mut shard, Instant::now());
            self.len.fetch_sub(purged, Ordering::Relaxed);
            if self.len.load(Ordering::Relaxed) >= self.capacity {
                return Put::Full;
            }
        }
        shard.entries.insert(hash, value);
        self.len.fetch_add(1, Ordering::Relaxed);
        Put::Inserted
    }

    pub fn get(&self, hash: &TxHash) -> Option<V> {
        self.shard(hash).lock().entries.get(hash).cloned()
    }

    pub fn exists(&self, hash: &TxHash) -> bool {
        self.shard(hash).lock().entries.contains_key(hash)
    }

    pub fn delete(&self, hash: &TxHash) {
        if self.shard(hash).lock().entries.remove(hash).is_some() {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Schedules removal after the cache's delay.
    pub fn delay_delete(&self, hash: TxHash) {
        self.delay_delete_at(hash, Instant::now() + self.delay);
    }

    fn delay_delete_at(&self, hash: TxHash, at: Instant) {
        self.shard(&hash).lock().expiry.push(Reverse((at, hash)));
    }

    /// Drops every entry whose delayed deletion is due. Returns the count.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            removed += purge_shard(&mut shard.lock(), now);
        }
        self.len.fetch_sub(removed, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            self.len.fetch_sub(shard.entries.len(), Ordering::Relaxed);
            shard.entries.clear();
            shard.expiry.clear();
        }
    }
}

/// Removes the shard's entries whose delayed deletion is due at `now`.
fn purge_shard<V>(shard: &mut Shard<V>, now: Instant) -> usize {
    let mut removed = 0;
    while let Some(Reverse((at, _))) = shard.expiry.peek() {
        if *at > now {
            break;
        }
        if let Some(Reverse((_, hash))) = shard.expiry.pop() {
            if shard.entries.remove(&hash).is_some() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(b: u8) -> TxHash {
        TxHash([b; 32])
    }

    #[test]
    fn put_is_idempotent() {
        let cache = TxCache::new(4, Duration::from_secs(30));
        assert_eq!(cache.put(hash(1), 10u32), Put::Inserted);
        assert_eq!(cache.put(hash(1), 11u32), Put::Present);
        assert_eq!(cache.get(&hash(1)), Some(10));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_is_immediate() {
        let cache = TxCache::new(4, Duration::from_secs(30));
        cache.put(hash(2), ());
        cache.delete(&hash(2));
        assert!(!cache.exists(&hash(2)));
    }

    #[test]
    fn delayed_delete_waits_for_deadline() {
        let cache = TxCache::new(4, Duration::from_secs(30));
        for b in 0..8 {
            cache.put(hash(b), ());
        }
        let now = Instant::now();
        cache.delay_delete_at(hash(1), now + Duration::from_secs(5));
        cache.delay_delete_at(hash(6), now + Duration::from_secs(60));

        assert_eq!(cache.purge_expired_at(now), 0);
        assert_eq!(cache.purge_expired_at(now + Duration::from_secs(10)), 1);
        assert!(!cache.exists(&hash(1)));
        assert!(cache.exists(&hash(6)));
        assert_eq!(cache.len(), 7);
    }

    #[test]
    fn capacity_refuses_until_a_delete_is_due() {
        let cache = TxCache::new(4, Duration::ZERO).with_capacity(2);
        assert_eq!(cache.put(hash(1), ()), Put::Inserted);
        assert_eq!(cache.put(hash(2), ()), Put::Inserted);
        assert_eq!(cache.put(hash(3), ()), Put::Full);

        cache.delete(&hash(2));
        assert_eq!(cache.put(hash(3), ()), Put::Inserted);

        // Same shard as hash(5): the due entry is purged to make room.
        cache.delay_delete_at(hash(1), Instant::now());
        assert_eq!(cache.put(hash(5), ()), Put::Inserted);
        assert!(!cache.exists(&hash(1)));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn delayed_delete_of_missing_entry_is_harmless() {
        let cache: TxCache<()> = TxCache::new(2, Duration::ZERO);
        cache.delay_delete(hash(3));
        assert_eq!(cache.purge_expired_at(Instant::now() + Duration::from_secs(1)), 0);
    }
}
