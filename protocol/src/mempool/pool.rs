//! # Transaction Pool
//!
//! Holds transactions between arrival and block inclusion, in four places:
//!
//! | List      | Holds                                          | Bound          |
//! |-----------|------------------------------------------------|----------------|
//! | `pending` | executable account txs, in arrival order       | `size`         |
//! | `utxo`    | pure UTXO txs (no account input)               | `utxo_size`    |
//! | `special` | multi-sign txs                                 | `spec_size`    |
//! | `future`  | per-sender nonce queues waiting on a gap       | `future_size`  |
//!
//! Every hash in any list is also in the seen cache, and every keyimage of
//! a pooled UTXO tx is in the keyimage set.
//!
//! ## Design
//!
//! - One coarse `Mutex` covers the lists. Signature checks run before it is
//!   taken, so the critical section is metadata plus the state check.
//! - Consensus takes the same lock through [`Mempool::lock`] to run
//!   `update` after a commit, so `reap` never observes a half-done recheck.
//! - A sender's future queue is promoted whenever one of its transactions
//!   lands in `pending`, and for every sender after `update`.

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::{Put, TxCache};
use super::error::MempoolError;
use super::keyimage::KeyImageSet;
use super::tx::{Address, App, CheckKind, KeyImage, Tx, TxHash, TxKind};
use super::tx_list::TxList;
use crate::config::{
    EVICTION_INTERVAL, SEEN_CACHE_DELAY_SECS, SEEN_CACHE_SHARDS, STATS_REPORT_INTERVAL,
};
use crate::p2p::NodeId;

/// `(origin peer, tx)`; the origin is `None` for locally submitted txs.
pub type BroadcastItem<T> = (Option<NodeId>, Arc<T>);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Capacity of the pending list.
    pub size: usize,

    /// Total capacity of all future queues.
    pub future_size: usize,

    /// Capacity of the multi-sign list.
    pub spec_size: usize,

    /// Per-sender future queue cap, applied after promotion.
    pub account_queue: usize,

    /// Capacity of the seen cache. Zero leaves it unbounded.
    pub cache_size: usize,

    /// Dormant senders lose their future queue after this long. Multi-sign
    /// txs older than this are dropped at recheck.
    pub lifetime_secs: u64,

    /// Enables future-queue overflow trimming and lifetime eviction.
    pub remove_future_tx: bool,

    /// Announce admitted txs to peers.
    pub broadcast: bool,

    pub broadcast_chan_size: usize,

    /// Accept txs gossiped by peers.
    pub receive_p2p_tx: bool,

    /// Capacity of the pure UTXO list, and the UTXO cap per reap.
    pub utxo_size: usize,

    pub max_reap_size: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            size: 3000,
            future_size: 100_000,
            spec_size: 100,
            account_queue: 1000,
            cache_size: 203_000,
            lifetime_secs: 60,
            remove_future_tx: false,
            broadcast: true,
            broadcast_chan_size: 10_000,
            receive_p2p_tx: false,
            utxo_size: 1000,
            max_reap_size: 10_000,
        }
    }
}

impl MempoolConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs)
    }
}

// ---------------------------------------------------------------------------
// Pool state
// ---------------------------------------------------------------------------

struct PoolEntry<T> {
    tx: Arc<T>,
    height: u64,
    added: Instant,
}

impl<T> PoolEntry<T> {
    fn new(tx: Arc<T>, height: u64) -> Self {
        Self {
            tx,
            height,
            added: Instant::now(),
        }
    }
}

struct PoolState<T> {
    height: u64,
    pending: VecDeque<PoolEntry<T>>,
    utxo: VecDeque<PoolEntry<T>>,
    special: VecDeque<PoolEntry<T>>,
    future: HashMap<Address, TxList<T>>,
    future_count: usize,
    beats: HashMap<Address, Instant>,
    notified: bool,
}

impl<T: Tx> PoolState<T> {
    fn new() -> Self {
        Self {
            height: 0,
            pending: VecDeque::new(),
            utxo: VecDeque::new(),
            special: VecDeque::new(),
            future: HashMap::new(),
            future_count: 0,
            beats: HashMap::new(),
            notified: false,
        }
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MempoolStats {
    pub height: u64,
    pub pending: usize,
    pub utxo: usize,
    pub special: usize,
    pub future: usize,
    pub senders: usize,
    pub cached: usize,
    pub key_images: usize,
    pub rejected: u64,
}

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

pub struct Mempool<T: Tx> {
    config: MempoolConfig,
    app: Arc<dyn App<T>>,
    state: Mutex<PoolState<T>>,
    cache: TxCache<Arc<T>>,
    key_images: KeyImageSet,
    receive_p2p_tx: AtomicBool,
    txs_available_enabled: AtomicBool,
    txs_available: watch::Sender<u64>,
    broadcast_tx: mpsc::Sender<BroadcastItem<T>>,
    broadcast_rx: Mutex<Option<mpsc::Receiver<BroadcastItem<T>>>>,
    rejected: AtomicU64,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Tx> Mempool<T> {
    pub fn new(config: MempoolConfig, app: Arc<dyn App<T>>) -> Arc<Self> {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(config.broadcast_chan_size.max(1));
        let (txs_available, _) = watch::channel(0);
        let (quit, _) = watch::channel(false);
        let cache = TxCache::new(SEEN_CACHE_SHARDS, Duration::from_secs(SEEN_CACHE_DELAY_SECS))
            .with_capacity(config.cache_size);
        Arc::new(Self {
            receive_p2p_tx: AtomicBool::new(config.receive_p2p_tx),
            config,
            app,
            state: Mutex::new(PoolState::new()),
            cache,
            key_images: KeyImageSet::new(),
            txs_available_enabled: AtomicBool::new(false),
            txs_available,
            broadcast_tx,
            broadcast_rx: Mutex::new(Some(broadcast_rx)),
            rejected: AtomicU64::new(0),
            quit,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &MempoolConfig {
        &self.config
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Starts the eviction, stats and cache purge loop.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let mut quit = self.quit.subscribe();
        let handle = tokio::spawn(async move {
            let mut evict = tokio::time::interval(EVICTION_INTERVAL);
            let mut stats = tokio::time::interval(STATS_REPORT_INTERVAL);
            let mut purge = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = evict.tick() => {
                        let dropped = pool.evict();
                        if dropped > 0 {
                            debug!(dropped, "evicted future transactions");
                        }
                    }
                    _ = stats.tick() => {
                        let s = pool.stats();
                        info!(
                            height = s.height,
                            pending = s.pending,
                            utxo = s.utxo,
                            special = s.special,
                            future = s.future,
                            cached = s.cached,
                            "mempool stats"
                        );
                    }
                    _ = purge.tick() => {
                        pool.cache.purge_expired();
                    }
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    pub fn stop(&self) {
        self.quit.send_replace(true);
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    /// Hands the broadcast queue to its single consumer, the reactor.
    pub fn take_broadcast_rx(&self) -> Option<mpsc::Receiver<BroadcastItem<T>>> {
        self.broadcast_rx.lock().take()
    }

    /// Fires once per height, the first time `pending` is non-empty.
    pub fn enable_txs_available(&self) {
        self.txs_available_enabled.store(true, Ordering::Relaxed);
    }

    /// Yields the height at which txs became available.
    pub fn txs_available(&self) -> watch::Receiver<u64> {
        self.txs_available.subscribe()
    }

    pub fn set_receive_p2p_tx(&self, on: bool) {
        self.receive_p2p_tx.store(on, Ordering::Relaxed);
    }

    pub fn receive_p2p_tx(&self) -> bool {
        self.receive_p2p_tx.load(Ordering::Relaxed)
    }

    // -- Admission ----------------------------------------------------------

    /// Validates `tx` and stages it. `peer` is the sender on the gossip
    /// network and is excluded from the rebroadcast.
    pub fn add_tx(&self, peer: Option<NodeId>, tx: impl Into<Arc<T>>) -> Result<(), MempoolError> {
        let tx: Arc<T> = tx.into();
        let hash = tx.hash();
        match self.cache.put(hash, Arc::clone(&tx)) {
            Put::Inserted => {}
            Put::Present => return Err(MempoolError::Duplicate),
            Put::Full => return Err(MempoolError::MempoolFull),
        }

        if let Err(err) = self.admit(&tx) {
            self.cache.delete(&hash);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(hash = %hash, kind = %tx.kind(), err = %err, "rejected transaction");
            return Err(err);
        }

        if self.config.broadcast {
            if let Err(mpsc::error::TrySendError::Full(_)) =
                self.broadcast_tx.try_send((peer, Arc::clone(&tx)))
            {
                debug!(hash = %hash, "broadcast queue full, dropping announcement");
            }
        }
        Ok(())
    }

    fn admit(&self, tx: &Arc<T>) -> Result<(), MempoolError> {
        self.app.check_tx(tx, CheckKind::Basic, &self.key_images)?;

        let mut guard = self.state.lock();
        let state = &mut *guard;
        self.check_blacklist(tx)?;
        match tx.kind() {
            TxKind::MultiSign => self.add_special_tx(state, tx),
            TxKind::Utxo if tx.is_pure_utxo() => self.add_pure_utxo_tx(state, tx),
            _ => self.add_account_tx(state, tx),
        }
    }

    fn check_blacklist(&self, tx: &Arc<T>) -> Result<(), MempoolError> {
        let token = tx.token();
        let listed = match tx.kind() {
            TxKind::MultiSign => false,
            TxKind::Utxo => {
                tx.account_outputs()
                    .iter()
                    .any(|to| self.app.is_blacklisted(&Address::ZERO, to, &token))
                    || tx
                        .from()
                        .is_some_and(|from| self.app.is_blacklisted(&from, &Address::ZERO, &token))
            }
            _ => {
                let from = tx.from().unwrap_or(Address::ZERO);
                let to = tx.to().unwrap_or(Address::ZERO);
                self.app.is_blacklisted(&from, &to, &token)
            }
        };
        if listed {
            Err(MempoolError::BlacklistAddress)
        } else {
            Ok(())
        }
    }

    fn add_special_tx(&self, state: &mut PoolState<T>, tx: &Arc<T>) -> Result<(), MempoolError> {
        if state.special.len() >= self.config.spec_size {
            return Err(MempoolError::MempoolFull);
        }
        self.app.check_tx(tx, CheckKind::State, &self.key_images)?;
        state.special.push_back(PoolEntry::new(Arc::clone(tx), state.height));
        Ok(())
    }

    fn add_pure_utxo_tx(&self, state: &mut PoolState<T>, tx: &Arc<T>) -> Result<(), MempoolError> {
        if state.utxo.len() >= self.config.utxo_size {
            return Err(MempoolError::MempoolFull);
        }
        self.app.check_tx(tx, CheckKind::State, &self.key_images)?;
        self.reserve_key_images(tx);
        state.utxo.push_back(PoolEntry::new(Arc::clone(tx), state.height));
        self.notify_txs_available(state);
        Ok(())
    }

    /// Nonce-ordered txs: the pending list when executable and there is room,
    /// the sender's future queue otherwise.
    fn add_account_tx(&self, state: &mut PoolState<T>, tx: &Arc<T>) -> Result<(), MempoolError> {
        let Some(from) = tx.from() else {
            return Err(MempoolError::Params("account transaction without sender".into()));
        };
        let expected = self.app.nonce(&from);
        if tx.nonce() > expected {
            if self.key_images.contains_any(&tx.key_images()) {
                return Err(MempoolError::UtxoDoubleSpend);
            }
            return self.add_to_future(state, from, tx);
        }
        if state.pending.len() >= self.config.size {
            self.app.check_tx(tx, CheckKind::Staged, &self.key_images)?;
            return self.add_to_future(state, from, tx);
        }

        match self.app.check_tx(tx, CheckKind::State, &self.key_images) {
            Ok(()) => {
                self.reserve_key_images(tx);
                self.add_pending(state, Arc::clone(tx));
                Ok(())
            }
            Err(MempoolError::NonceTooHigh { .. }) => self.add_to_future(state, from, tx),
            Err(err) => Err(err),
        }
    }

    fn add_pending(&self, state: &mut PoolState<T>, tx: Arc<T>) {
        let promote = tx.kind().is_promotable().then(|| tx.from()).flatten();
        state.pending.push_back(PoolEntry::new(tx, state.height));
        self.notify_txs_available(state);
        if let Some(from) = promote {
            self.promote(state, Some(vec![from]));
        }
    }

    fn add_to_future(
        &self,
        state: &mut PoolState<T>,
        from: Address,
        tx: &Arc<T>,
    ) -> Result<(), MempoolError> {
        if state.future_count >= self.config.future_size {
            return Err(MempoolError::MempoolFull);
        }
        if !state.future.entry(from).or_default().add(Arc::clone(tx)) {
            return Err(MempoolError::Duplicate);
        }
        state.future_count += 1;
        state.beats.entry(from).or_insert_with(Instant::now);
        self.reserve_key_images(tx);
        if self.config.remove_future_tx {
            self.trim_future(state, self.config.future_size);
        }
        Ok(())
    }

    // -- Promotion & eviction -----------------------------------------------

    /// Moves executable txs of `senders` (all senders if `None`) from their
    /// future queue into `pending`.
    fn promote(&self, state: &mut PoolState<T>, senders: Option<Vec<Address>>) {
        let senders = senders.unwrap_or_else(|| state.future.keys().copied().collect());
        for addr in senders {
            let Some(list) = state.future.get_mut(&addr) else {
                continue;
            };
            let nonce = self.app.nonce(&addr);

            for stale in list.forward(nonce) {
                state.future_count -= 1;
                self.discard(&stale);
            }

            let room = self.config.size.saturating_sub(state.pending.len());
            let mut ready = list.ready(nonce, nonce.saturating_add(room as u64)).into_iter();
            let mut promoted = 0;
            while let Some(tx) = ready.next() {
                match self.recheck(&tx) {
                    Ok(()) => {
                        state.future_count -= 1;
                        state.pending.push_back(PoolEntry::new(tx, state.height));
                        promoted += 1;
                    }
                    Err(MempoolError::NonceTooHigh { .. }) => {
                        list.add(tx);
                        for rest in ready.by_ref() {
                            list.add(rest);
                        }
                        break;
                    }
                    Err(err) => {
                        debug!(hash = %tx.hash(), err = %err, "dropping future transaction");
                        state.future_count -= 1;
                        self.discard(&tx);
                    }
                }
            }
            if promoted > 0 {
                state.beats.insert(addr, Instant::now());
            }

            if self.config.remove_future_tx {
                for tail in list.cap(self.config.account_queue) {
                    state.future_count -= 1;
                    self.discard(&tail);
                }
            }
            if list.is_empty() {
                state.future.remove(&addr);
                state.beats.remove(&addr);
            }
        }
        if !state.pending.is_empty() {
            self.notify_txs_available(state);
        }
    }

    /// Trims future queues back to `cap` txs, oldest heartbeat first.
    fn trim_future(&self, state: &mut PoolState<T>, cap: usize) -> usize {
        if state.future_count <= cap {
            return 0;
        }
        let mut senders: Vec<(Address, Instant)> =
            state.beats.iter().map(|(a, t)| (*a, *t)).collect();
        senders.sort_by_key(|(_, beat)| *beat);

        let mut dropped = 0;
        let mut excess = state.future_count - cap;
        for (addr, _) in senders {
            if excess == 0 {
                break;
            }
            let Some(list) = state.future.get_mut(&addr) else {
                continue;
            };
            if list.len() <= excess {
                for tx in list.drain() {
                    self.discard(&tx);
                    excess -= 1;
                    dropped += 1;
                }
                state.future.remove(&addr);
                state.beats.remove(&addr);
            } else {
                while excess > 0 {
                    match list.pop_last() {
                        Some(tx) => {
                            self.discard(&tx);
                            excess -= 1;
                            dropped += 1;
                        }
                        None => break,
                    }
                }
            }
        }
        state.future_count -= dropped;
        dropped
    }

    /// Overflow trimming plus lifetime eviction of dormant senders. A no-op
    /// unless `remove_future_tx` is set.
    pub fn evict(&self) -> usize {
        if !self.config.remove_future_tx {
            return 0;
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut dropped = self.trim_future(state, self.config.future_size);

        let lifetime = self.config.lifetime();
        let dormant: Vec<Address> = state
            .beats
            .iter()
            .filter(|(_, beat)| beat.elapsed() >= lifetime)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in dormant {
            state.beats.remove(&addr);
            if let Some(mut list) = state.future.remove(&addr) {
                for tx in list.drain() {
                    self.discard(&tx);
                    state.future_count -= 1;
                    dropped += 1;
                }
            }
        }
        dropped
    }

    // -- Helpers ------------------------------------------------------------

    fn reserve_key_images(&self, tx: &Arc<T>) {
        for image in tx.key_images() {
            if !self.key_images.push(image) {
                warn!(hash = %tx.hash(), "keyimage already reserved");
            }
        }
    }

    /// State check of a tx that already holds its keyimages. The images stay
    /// reserved unless the tx is rejected for good.
    fn recheck(&self, tx: &Arc<T>) -> Result<(), MempoolError> {
        let images = tx.key_images();
        self.key_images.remove_keys(&images);
        let result = self.app.check_tx(tx, CheckKind::State, &self.key_images);
        if matches!(result, Ok(()) | Err(MempoolError::NonceTooHigh { .. })) {
            for image in images {
                self.key_images.push(image);
            }
        }
        result
    }

    /// Forgets a tx that leaves the pool without being committed.
    fn discard(&self, tx: &Arc<T>) {
        self.cache.delete(&tx.hash());
        self.key_images.remove_keys(&tx.key_images());
    }

    fn notify_txs_available(&self, state: &mut PoolState<T>) {
        if !self.txs_available_enabled.load(Ordering::Relaxed) || state.notified {
            return;
        }
        if state.pending.is_empty() && state.utxo.is_empty() {
            return;
        }
        state.notified = true;
        self.txs_available.send_replace(state.height);
    }

    // -- Consensus interface ------------------------------------------------

    /// Exclusive access for the commit path.
    pub fn lock(&self) -> MempoolGuard<'_, T> {
        MempoolGuard {
            pool: self,
            state: self.state.lock(),
        }
    }

    pub fn update(&self, height: u64, committed: &[T]) {
        self.lock().update(height, committed);
    }

    pub fn reap(&self, max: usize) -> Vec<Arc<T>> {
        self.lock().reap(max)
    }

    fn update_locked(&self, state: &mut PoolState<T>, height: u64, committed: &[T]) {
        state.height = height;
        state.notified = false;

        let committed: HashSet<TxHash> = committed.iter().map(|tx| tx.hash()).collect();
        for hash in &committed {
            self.cache.delay_delete(*hash);
        }
        let release = |entry: &PoolEntry<T>| -> bool {
            if committed.contains(&entry.tx.hash()) {
                self.key_images.remove_keys(&entry.tx.key_images());
                false
            } else {
                true
            }
        };
        state.pending.retain(release);
        state.utxo.retain(release);
        state.special.retain(release);

        // Pending: keep, send back to the future queue, or drop.
        for entry in std::mem::take(&mut state.pending) {
            match self.recheck(&entry.tx) {
                Ok(()) => state.pending.push_back(entry),
                Err(MempoolError::NonceTooHigh { .. }) => {
                    let Some(from) = entry.tx.from() else {
                        self.discard(&entry.tx);
                        continue;
                    };
                    if state.future.entry(from).or_default().add(Arc::clone(&entry.tx)) {
                        state.future_count += 1;
                        state.beats.entry(from).or_insert_with(Instant::now);
                    } else {
                        self.discard(&entry.tx);
                    }
                }
                Err(err) => {
                    debug!(
                        hash = %entry.tx.hash(),
                        added_at = entry.height,
                        err = %err,
                        "recheck dropped pending tx"
                    );
                    self.discard(&entry.tx);
                }
            }
        }

        let lifetime = self.config.lifetime();
        for entry in std::mem::take(&mut state.special) {
            if entry.added.elapsed() > lifetime {
                debug!(hash = %entry.tx.hash(), "multisign tx expired");
                self.discard(&entry.tx);
                continue;
            }
            match self.recheck(&entry.tx) {
                Ok(()) => state.special.push_back(entry),
                Err(err) => {
                    debug!(hash = %entry.tx.hash(), err = %err, "recheck dropped multisign tx");
                    self.discard(&entry.tx);
                }
            }
        }

        for entry in std::mem::take(&mut state.utxo) {
            match self.recheck(&entry.tx) {
                Ok(()) => state.utxo.push_back(entry),
                Err(err) => {
                    debug!(hash = %entry.tx.hash(), err = %err, "recheck dropped utxo tx");
                    self.discard(&entry.tx);
                }
            }
        }

        self.promote(state, None);
        if state.pending.len() + state.utxo.len() > 0 {
            self.notify_txs_available(state);
        }
    }

    fn reap_locked(&self, state: &PoolState<T>, max: usize) -> Vec<Arc<T>> {
        if max == 0 {
            return Vec::new();
        }
        let max = max.min(self.config.max_reap_size);
        let utxo_cap = self.config.utxo_size;

        // UTXO and special txs are taken whole, then pending gets what is left.
        let utxo = collect(&state.utxo, utxo_cap, utxo_cap);
        let special = collect(&state.special, self.config.spec_size, utxo_cap);
        let room = max.saturating_sub(utxo.len() + special.len());
        let mut out = collect(&state.pending, room, utxo_cap);
        debug!(
            pending = out.len(),
            utxo = utxo.len(),
            special = special.len(),
            "reaped"
        );
        out.extend(utxo);
        out.extend(special);
        out
    }

    // -- Queries ------------------------------------------------------------

    /// Transactions in `pending`, `utxo` and `special`.
    pub fn size(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.utxo.len() + state.special.len()
    }

    pub fn future_count(&self) -> usize {
        self.state.lock().future_count
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    pub fn stats(&self) -> MempoolStats {
        let state = self.state.lock();
        MempoolStats {
            height: state.height,
            pending: state.pending.len(),
            utxo: state.utxo.len(),
            special: state.special.len(),
            future: state.future_count,
            senders: state.future.len(),
            cached: self.cache.len(),
            key_images: self.key_images.len(),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn has_tx(&self, hash: &TxHash) -> bool {
        self.cache.exists(hash)
    }

    pub fn get_tx_from_cache(&self, hash: &TxHash) -> Option<Arc<T>> {
        self.cache.get(hash)
    }

    /// Hashes of everything ready for a block, in broadcast order: pure
    /// UTXO, pending, special.
    pub fn ready_hashes(&self) -> Vec<TxHash> {
        let state = self.state.lock();
        state
            .utxo
            .iter()
            .chain(state.pending.iter())
            .chain(state.special.iter())
            .map(|e| e.tx.hash())
            .collect()
    }

    /// Nonces queued for `addr` in its future queue.
    pub fn future_nonces(&self, addr: &Address) -> Vec<u64> {
        self.state
            .lock()
            .future
            .get(addr)
            .map(|l| l.flatten().iter().map(|tx| tx.nonce()).collect())
            .unwrap_or_default()
    }

    /// Drops everything, including the seen cache and keyimages.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        let height = state.height;
        *state = PoolState::new();
        state.height = height;
        self.cache.clear();
        self.key_images.reset();
    }

    // -- Keyimages ----------------------------------------------------------

    pub fn key_image_reset(&self) {
        self.key_images.reset();
    }

    pub fn key_image_exists(&self, image: &KeyImage) -> bool {
        self.key_images.exists(image)
    }

    pub fn key_image_push(&self, image: KeyImage) -> bool {
        self.key_images.push(image)
    }

    pub fn key_image_remove(&self, image: &KeyImage) -> bool {
        self.key_images.remove(image)
    }

    pub fn key_image_remove_keys(&self, images: &[KeyImage]) {
        self.key_images.remove_keys(images);
    }
}

impl<T: Tx> fmt::Debug for Mempool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats();
        f.debug_struct("Mempool")
            .field("pending", &s.pending)
            .field("utxo", &s.utxo)
            .field("special", &s.special)
            .field("future", &s.future)
            .finish()
    }
}

/// Takes entries in order until `limit`, or until `utxo_cap` UTXO txs
/// were taken.
fn collect<T: Tx>(list: &VecDeque<PoolEntry<T>>, limit: usize, utxo_cap: usize) -> Vec<Arc<T>> {
    let mut out = Vec::new();
    let mut utxo_count = 0;
    for entry in list {
        if out.len() >= limit {
            break;
        }
        out.push(Arc::clone(&entry.tx));
        if entry.tx.kind() == TxKind::Utxo {
            utxo_count += 1;
            if utxo_count >= utxo_cap {
                break;
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// MempoolGuard
// ---------------------------------------------------------------------------

/// Holds the pool lock. Admission blocks until it is dropped.
pub struct MempoolGuard<'a, T: Tx> {
    pool: &'a Mempool<T>,
    state: MutexGuard<'a, PoolState<T>>,
}

impl<T: Tx> MempoolGuard<'_, T> {
    /// Removes `committed`, rechecks what is left against the post-commit
    /// state and promotes future queues.
    pub fn update(&mut self, height: u64, committed: &[T]) {
        self.pool.update_locked(&mut self.state, height, committed);
    }

    /// Pending txs first, then pure UTXO, then multi-sign. Pending fills
    /// `min(max, max_reap_size)` minus the other two, which are capped only
    /// by `utxo_size` and `spec_size`.
    pub fn reap(&self, max: usize) -> Vec<Arc<T>> {
        self.pool.reap_locked(&self.state, max)
    }

    pub fn height(&self) -> u64 {
        self.state.height
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;
    use crate::mempool::state::MemoryApp;
    use crate::mempool::transaction::{Transaction, TxInput, TxOutput};

    // -- Helpers ---------------------------------------------------------------

    struct Account {
        key: NodeKey,
        addr: Address,
    }

    impl Account {
        fn new(seed: u8) -> Self {
            let key = NodeKey::from_seed(&[seed; 32]);
            let addr = Address::from_public_key(&key.public_key());
            Self { key, addr }
        }

        fn transfer(&self, nonce: u64) -> Transaction {
            Transaction::transfer(nonce, Address([0xee; 20]), 1).sign(&self.key)
        }
    }

    fn setup(config: MempoolConfig) -> (Arc<MemoryApp>, Arc<Mempool<Transaction>>) {
        let app = Arc::new(MemoryApp::new());
        let pool = Mempool::new(config, app.clone() as Arc<dyn App<Transaction>>);
        (app, pool)
    }

    fn funded(app: &MemoryApp, seed: u8, nonce: u64) -> Account {
        let acct = Account::new(seed);
        app.set_nonce(acct.addr, nonce);
        app.set_balance(acct.addr, 1_000_000);
        acct
    }

    fn utxo_tx(image: u8) -> Transaction {
        Transaction::utxo(
            vec![TxInput::Utxo {
                key_image: KeyImage([image; 32]),
            }],
            vec![TxOutput::Utxo {
                commitment: [image; 32],
                amount: 1,
            }],
        )
    }

    fn multisign(acct: &Account, nonce: u64) -> Transaction {
        Transaction::new(TxKind::MultiSign, nonce).sign(&acct.key)
    }

    fn nonces(txs: &[Arc<Transaction>]) -> Vec<u64> {
        txs.iter().map(|t| t.nonce).collect()
    }

    // -- Admission ---------------------------------------------------------------

    #[test]
    fn executable_tx_goes_pending() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 5);

        pool.add_tx(None, a.transfer(5)).unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.future_count(), 0);
        assert_eq!(App::nonce(app.as_ref(), &a.addr), 6);
    }

    #[test]
    fn duplicate_is_idempotent() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        let tx = a.transfer(0);

        pool.add_tx(None, tx.clone()).unwrap();
        assert_eq!(pool.add_tx(None, tx), Err(MempoolError::Duplicate));
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.stats().cached, 1);
    }

    #[test]
    fn rejected_tx_leaves_cache() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 3);
        let stale = a.transfer(1);

        assert!(matches!(
            pool.add_tx(None, stale.clone()),
            Err(MempoolError::NonceTooLow { .. })
        ));
        assert!(!pool.has_tx(&stale.hash()));
        assert_eq!(pool.rejected_total(), 1);
    }

    #[test]
    fn unsigned_tx_is_rejected() {
        let (_app, pool) = setup(MempoolConfig::default());
        let tx = Transaction::transfer(0, Address([1; 20]), 1);
        assert_eq!(pool.add_tx(None, tx), Err(MempoolError::InvalidSig));
    }

    #[test]
    fn blacklisted_recipient_is_rejected() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        app.blacklist(Address([0xee; 20]));
        assert_eq!(
            pool.add_tx(None, a.transfer(0)),
            Err(MempoolError::BlacklistAddress)
        );
    }

    #[test]
    fn blacklisted_utxo_output_is_rejected() {
        let (app, pool) = setup(MempoolConfig::default());
        app.blacklist(Address([5; 20]));
        let tx = Transaction::utxo(
            vec![TxInput::Utxo {
                key_image: KeyImage([1; 32]),
            }],
            vec![TxOutput::Account {
                to: Address([5; 20]),
                amount: 1,
            }],
        );
        assert_eq!(pool.add_tx(None, tx), Err(MempoolError::BlacklistAddress));
        assert!(pool.key_images.is_empty());
    }

    // -- Future queue ------------------------------------------------------------

    #[test]
    fn gap_fill_promotes_in_order() {
        let (app, pool) = setup(MempoolConfig::default());
        let b = funded(&app, 2, 0);

        for n in [2, 3, 1] {
            pool.add_tx(None, b.transfer(n)).unwrap();
        }
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.future_count(), 3);

        pool.add_tx(None, b.transfer(0)).unwrap();
        assert_eq!(pool.future_count(), 0);
        assert_eq!(nonces(&pool.reap(10)), vec![0, 1, 2, 3]);
    }

    #[test]
    fn future_full_rejects() {
        let config = MempoolConfig {
            future_size: 2,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);

        pool.add_tx(None, a.transfer(5)).unwrap();
        pool.add_tx(None, a.transfer(6)).unwrap();
        let tx = a.transfer(7);
        assert_eq!(pool.add_tx(None, tx.clone()), Err(MempoolError::MempoolFull));
        assert!(!pool.has_tx(&tx.hash()));
        assert_eq!(pool.future_count(), 2);
    }

    #[test]
    fn full_pending_overflows_into_future() {
        let config = MempoolConfig {
            size: 1,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        let b = funded(&app, 2, 0);

        pool.add_tx(None, a.transfer(0)).unwrap();
        pool.add_tx(None, b.transfer(0)).unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.future_nonces(&b.addr), vec![0]);
        assert_eq!(App::nonce(app.as_ref(), &b.addr), 0);
    }

    #[test]
    fn full_pending_still_checks_funds() {
        let config = MempoolConfig {
            size: 1,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        let broke = Account::new(2);

        pool.add_tx(None, a.transfer(0)).unwrap();
        let tx = broke.transfer(0);
        assert!(matches!(
            pool.add_tx(None, tx.clone()),
            Err(MempoolError::InsufficientFunds { .. })
        ));
        assert!(pool.future_nonces(&broke.addr).is_empty());
        assert_eq!(pool.future_count(), 0);
        assert!(!pool.has_tx(&tx.hash()));
    }

    #[test]
    fn overflow_trim_drops_oldest_sender_first() {
        let config = MempoolConfig {
            future_size: 3,
            remove_future_tx: true,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let old = funded(&app, 1, 0);
        let new = funded(&app, 2, 0);

        pool.add_tx(None, old.transfer(4)).unwrap();
        pool.add_tx(None, old.transfer(5)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        pool.add_tx(None, new.transfer(4)).unwrap();

        let mut guard = pool.state.lock();
        let dropped = pool.trim_future(&mut guard, 1);
        assert_eq!(dropped, 2);
        assert!(!guard.future.contains_key(&old.addr));
        assert!(guard.future.contains_key(&new.addr));
    }

    #[test]
    fn lifetime_eviction_drops_dormant_senders() {
        let config = MempoolConfig {
            lifetime_secs: 0,
            remove_future_tx: true,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        let tx = a.transfer(3);

        pool.add_tx(None, tx.clone()).unwrap();
        assert_eq!(pool.evict(), 1);
        assert_eq!(pool.future_count(), 0);
        assert!(!pool.has_tx(&tx.hash()));
    }

    #[test]
    fn eviction_is_off_by_default() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        pool.add_tx(None, a.transfer(3)).unwrap();
        assert_eq!(pool.evict(), 0);
        assert_eq!(pool.future_count(), 1);
    }

    // -- Special & UTXO ------------------------------------------------------------

    #[test]
    fn multisign_respects_spec_size() {
        let config = MempoolConfig {
            spec_size: 1,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        let b = funded(&app, 2, 0);

        pool.add_tx(None, multisign(&a, 0)).unwrap();
        assert_eq!(
            pool.add_tx(None, multisign(&b, 0)),
            Err(MempoolError::MempoolFull)
        );
        assert_eq!(pool.stats().special, 1);
    }

    #[test]
    fn keyimage_double_spend() {
        let (_app, pool) = setup(MempoolConfig::default());
        pool.add_tx(None, utxo_tx(1)).unwrap();

        let mut conflicting = utxo_tx(1);
        conflicting.outputs.push(TxOutput::Utxo {
            commitment: [9; 32],
            amount: 2,
        });
        assert_eq!(
            pool.add_tx(None, conflicting),
            Err(MempoolError::UtxoDoubleSpend)
        );
        assert_eq!(pool.stats().key_images, 1);
        assert_eq!(pool.stats().utxo, 1);
    }

    #[test]
    fn pure_utxo_list_is_bounded() {
        let config = MempoolConfig {
            utxo_size: 1,
            ..MempoolConfig::default()
        };
        let (_app, pool) = setup(config);
        pool.add_tx(None, utxo_tx(1)).unwrap();
        assert_eq!(pool.add_tx(None, utxo_tx(2)), Err(MempoolError::MempoolFull));
    }

    // -- Update ----------------------------------------------------------------

    #[test]
    fn update_drops_stale_nonce() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 5);
        let mut tx = Transaction::utxo(
            vec![
                TxInput::Account { amount: 1 },
                TxInput::Utxo {
                    key_image: KeyImage([4; 32]),
                },
            ],
            vec![TxOutput::Utxo {
                commitment: [4; 32],
                amount: 2,
            }],
        );
        tx.nonce = 5;
        let tx = tx.sign(&a.key);
        let hash = tx.hash();
        pool.add_tx(None, tx).unwrap();
        assert_eq!(pool.stats().key_images, 1);

        // Another block advanced the account past our tx.
        app.set_nonce(a.addr, 7);
        app.reset_check_state();
        pool.update(1, &[]);

        assert_eq!(pool.size(), 0);
        assert!(pool.reap(10).is_empty());
        assert_eq!(pool.height(), 1);
        assert!(!pool.has_tx(&hash));
        assert_eq!(pool.stats().cached, 0);
        assert_eq!(pool.stats().key_images, 0);
    }

    #[test]
    fn update_removes_committed_and_keeps_rest() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        let first = a.transfer(0);
        let second = a.transfer(1);
        pool.add_tx(None, first.clone()).unwrap();
        pool.add_tx(None, second.clone()).unwrap();

        app.commit(std::slice::from_ref(&first));
        pool.update(1, std::slice::from_ref(&first));

        assert_eq!(nonces(&pool.reap(10)), vec![1]);
        // Committed hashes stay known until the delayed delete fires.
        assert!(pool.has_tx(&first.hash()));
        assert_eq!(
            pool.add_tx(None, first),
            Err(MempoolError::Duplicate)
        );
    }

    #[test]
    fn update_sends_gapped_tx_back_to_future() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        let first = a.transfer(0);
        pool.add_tx(None, first).unwrap();
        pool.add_tx(None, a.transfer(1)).unwrap();

        // Drain the account so nonce 0 fails its recheck; nonce 1 then has
        // a gap in front of it.
        app.set_balance(a.addr, 0);
        app.reset_check_state();
        pool.update(1, &[]);

        assert_eq!(pool.size(), 0);
        assert_eq!(pool.future_nonces(&a.addr), vec![1]);
    }

    #[test]
    fn update_expires_old_multisign() {
        let config = MempoolConfig {
            lifetime_secs: 0,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        pool.add_tx(None, multisign(&a, 0)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        app.reset_check_state();
        pool.update(1, &[]);
        assert_eq!(pool.stats().special, 0);
    }

    #[test]
    fn update_through_guard() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        pool.add_tx(None, a.transfer(0)).unwrap();

        let mut guard = pool.lock();
        app.reset_check_state();
        guard.update(4, &[]);
        assert_eq!(guard.height(), 4);
        assert_eq!(guard.reap(10).len(), 1);
    }

    // -- Reap ------------------------------------------------------------------

    #[test]
    fn reap_orders_and_caps() {
        let config = MempoolConfig {
            max_reap_size: 3,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        let m = funded(&app, 2, 0);

        pool.add_tx(None, multisign(&m, 0)).unwrap();
        pool.add_tx(None, utxo_tx(1)).unwrap();
        for n in 0..3 {
            pool.add_tx(None, a.transfer(n)).unwrap();
        }

        let reaped = pool.reap(100);
        assert_eq!(reaped.len(), 3);
        assert_eq!(reaped[0].kind, TxKind::Normal);
        assert_eq!(reaped[1].kind, TxKind::Utxo);
        assert_eq!(reaped[2].kind, TxKind::MultiSign);
        assert!(pool.reap(0).is_empty());
    }

    #[test]
    fn special_and_utxo_can_exceed_reap_cap() {
        let config = MempoolConfig {
            max_reap_size: 1,
            ..MempoolConfig::default()
        };
        let (app, pool) = setup(config);
        let a = funded(&app, 1, 0);
        let m = funded(&app, 2, 0);

        pool.add_tx(None, multisign(&m, 0)).unwrap();
        pool.add_tx(None, utxo_tx(1)).unwrap();
        pool.add_tx(None, a.transfer(0)).unwrap();

        let reaped = pool.reap(100);
        assert_eq!(reaped.len(), 2);
        assert!(reaped.iter().all(|tx| tx.kind != TxKind::Normal));
    }

    #[test]
    fn reap_caps_utxo_txs() {
        let config = MempoolConfig {
            utxo_size: 2,
            ..MempoolConfig::default()
        };
        let (_app, pool) = setup(config);
        pool.add_tx(None, utxo_tx(1)).unwrap();
        pool.add_tx(None, utxo_tx(2)).unwrap();
        let reaped = pool.reap(10);
        assert_eq!(reaped.len(), 2);
    }

    // -- Notifications ---------------------------------------------------------

    #[tokio::test]
    async fn txs_available_fires_once_per_height() {
        let (app, pool) = setup(MempoolConfig::default());
        pool.enable_txs_available();
        let mut rx = pool.txs_available();
        let a = funded(&app, 1, 0);

        pool.add_tx(None, a.transfer(0)).unwrap();
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        pool.add_tx(None, a.transfer(1)).unwrap();
        assert!(!rx.has_changed().unwrap());

        app.reset_check_state();
        pool.update(1, &[]);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn admitted_tx_is_queued_for_broadcast() {
        let (app, pool) = setup(MempoolConfig::default());
        let mut rx = pool.take_broadcast_rx().unwrap();
        assert!(pool.take_broadcast_rx().is_none());
        let a = funded(&app, 1, 0);
        let peer = NodeId::random();

        let tx = a.transfer(0);
        pool.add_tx(Some(peer), tx.clone()).unwrap();
        let (origin, queued) = rx.recv().await.unwrap();
        assert_eq!(origin, Some(peer));
        assert_eq!(queued.hash(), tx.hash());
    }

    #[test]
    fn flush_clears_everything() {
        let (app, pool) = setup(MempoolConfig::default());
        let a = funded(&app, 1, 0);
        pool.add_tx(None, a.transfer(0)).unwrap();
        pool.add_tx(None, a.transfer(4)).unwrap();
        pool.add_tx(None, utxo_tx(3)).unwrap();

        pool.flush();
        let s = pool.stats();
        assert_eq!((s.pending, s.future, s.utxo, s.cached, s.key_images), (0, 0, 0, 0, 0));
    }
}
