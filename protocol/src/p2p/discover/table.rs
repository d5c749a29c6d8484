//! # Kademlia Routing Table
//!
//! Seventeen buckets indexed by log XOR distance from the local id; every
//! distance at or below [`BUCKET_MIN_DISTANCE`] folds into bucket 0. Each
//! bucket keeps up to 16 live entries (most recently verified first) and up
//! to 10 replacements.
//!
//! ## Maintenance
//!
//! | Task        | Period           | Work                                              |
//! |-------------|------------------|---------------------------------------------------|
//! | refresh     | 30 min / on demand | ping DB + fallback seeds, self lookup, 3 random lookups |
//! | revalidate  | random < 10 s    | ping the tail of a random bucket                   |
//! | copy-live   | 45 min           | persist entries checked at least once and ≥ 5 min old |
//!
//! The table counts as initialized once the first refresh completes; until
//! then pings from strangers do not add entries.
//!
//! ## IP Limits
//!
//! Outside LAN space at most 2 entries per /24 per bucket and 10 per /24
//! across the table.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::db::PeerDb;
use super::udp::{NodeSink, Udp, UdpError};
use super::{split_seeds, DiscoverError, DiscoverTable};
use crate::config::{
    ALPHA, BUCKET_IP_LIMIT, BUCKET_MIN_DISTANCE, BUCKET_SIZE, COPY_NODES_INTERVAL,
    MAX_FINDNODE_FAILURES, MAX_REPLACEMENTS, N_BUCKETS, REFRESH_INTERVAL, REVALIDATE_INTERVAL,
    SEED_COUNT, SEED_MAX_AGE, SEED_MIN_TABLE_TIME, TABLE_IP_LIMIT, TABLE_SUBNET,
};
use crate::crypto::keccak256;
use crate::p2p::netutil::{is_lan, DistinctNetSet};
use crate::p2p::node::{dist_cmp, log_dist, Node, NodeId, TableNode};

// ---------------------------------------------------------------------------
// NodesByDistance
// ---------------------------------------------------------------------------

/// A bounded list kept sorted by XOR distance to `target`.
#[derive(Debug, Clone)]
pub struct NodesByDistance {
    pub target: NodeId,
    pub entries: Vec<Node>,
}

impl NodesByDistance {
    pub fn new(target: NodeId) -> Self {
        Self {
            target,
            entries: Vec::new(),
        }
    }

    /// Inserts `node` at its distance rank, dropping the farthest entry when
    /// the list would exceed `max`.
    pub fn push(&mut self, node: Node, max: usize) {
        let ix = self
            .entries
            .partition_point(|e| dist_cmp(&self.target, &e.id, &node.id) != Ordering::Greater);
        if ix >= max {
            return;
        }
        self.entries.insert(ix, node);
        self.entries.truncate(max);
    }
}

// ---------------------------------------------------------------------------
// Table state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Bucket {
    entries: Vec<TableNode>,
    replacements: Vec<TableNode>,
    ips: DistinctNetSet,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            replacements: Vec::new(),
            ips: DistinctNetSet::new(TABLE_SUBNET, BUCKET_IP_LIMIT),
        }
    }
}

enum Revalidation {
    Alive,
    Replaced(Node),
    Removed,
}

/// Everything guarded by the table mutex.
struct TableState {
    local: NodeId,
    buckets: Vec<Bucket>,
    ips: DistinctNetSet,
    seeds: Vec<Node>,
    rng: StdRng,
}

/// Pushes `n` to the front of `list`, keeping at most `max` items.
/// Returns the entry that fell off the end.
fn push_front(list: &mut Vec<TableNode>, n: TableNode, max: usize) -> Option<TableNode> {
    list.insert(0, n);
    if list.len() > max {
        list.pop()
    } else {
        None
    }
}

fn remove_id(list: &mut Vec<TableNode>, id: &NodeId) -> Option<TableNode> {
    let pos = list.iter().position(|e| e.id() == *id)?;
    Some(list.remove(pos))
}

impl TableState {
    fn new(local: NodeId, seeds: Vec<Node>) -> Self {
        Self {
            local,
            buckets: (0..N_BUCKETS).map(|_| Bucket::new()).collect(),
            ips: DistinctNetSet::new(TABLE_SUBNET, TABLE_IP_LIMIT),
            seeds,
            rng: StdRng::from_entropy(),
        }
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        let d = log_dist(&self.local, id);
        if d <= BUCKET_MIN_DISTANCE {
            0
        } else {
            d - BUCKET_MIN_DISTANCE - 1
        }
    }

    fn add_ip(&mut self, bi: usize, ip: &IpAddr) -> bool {
        if is_lan(ip) {
            return true;
        }
        if !self.ips.add(ip) {
            debug!(%ip, "ip exceeds table limit");
            return false;
        }
        if !self.buckets[bi].ips.add(ip) {
            debug!(%ip, "ip exceeds bucket limit");
            self.ips.remove(ip);
            return false;
        }
        true
    }

    fn remove_ip(&mut self, bi: usize, ip: &IpAddr) {
        if is_lan(ip) {
            return;
        }
        self.ips.remove(ip);
        self.buckets[bi].ips.remove(ip);
    }

    fn contains(&self, id: &NodeId) -> bool {
        let bi = self.bucket_index(id);
        self.buckets[bi].entries.iter().any(|e| e.id() == *id)
    }

    fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    /// Appends a node that may or may not be live to the tail of its bucket,
    /// or to the replacements when the bucket is full.
    fn add_seen_node(&mut self, node: Node) {
        if node.id == self.local {
            return;
        }
        let bi = self.bucket_index(&node.id);
        if self.buckets[bi].entries.iter().any(|e| e.id() == node.id) {
            return;
        }
        if self.buckets[bi].entries.len() >= BUCKET_SIZE {
            self.add_replacement(bi, node);
            return;
        }
        if !self.add_ip(bi, &node.ip()) {
            return;
        }
        let id = node.id;
        let b = &mut self.buckets[bi];
        b.entries.push(TableNode::new(node));
        remove_id(&mut b.replacements, &id);
    }

    /// Moves a node that just proved liveness to the head of its bucket.
    fn add_verified_node(&mut self, node: Node) {
        if node.id == self.local {
            return;
        }
        let bi = self.bucket_index(&node.id);
        if self.bump_in_bucket(bi, &node, true) {
            return;
        }
        if self.buckets[bi].entries.len() >= BUCKET_SIZE {
            self.add_replacement(bi, node);
            return;
        }
        if !self.add_ip(bi, &node.ip()) {
            return;
        }
        let id = node.id;
        let b = &mut self.buckets[bi];
        push_front(&mut b.entries, TableNode::new(node), BUCKET_SIZE);
        remove_id(&mut b.replacements, &id);
    }

    fn add_replacement(&mut self, bi: usize, node: Node) {
        if self.buckets[bi].replacements.iter().any(|e| e.id() == node.id) {
            return;
        }
        if !self.add_ip(bi, &node.ip()) {
            return;
        }
        let removed = push_front(
            &mut self.buckets[bi].replacements,
            TableNode::new(node),
            MAX_REPLACEMENTS,
        );
        if let Some(r) = removed {
            self.remove_ip(bi, &r.node.ip());
        }
    }

    /// Moves `node` to the front of bucket `bi` if present. An endpoint
    /// change is accepted only if the new IP fits the limits.
    fn bump_in_bucket(&mut self, bi: usize, node: &Node, replace_live: bool) -> bool {
        let Some(i) = self.buckets[bi].entries.iter().position(|e| e.id() == node.id) else {
            return false;
        };
        let old_ip = self.buckets[bi].entries[i].node.ip();
        if old_ip != node.ip() {
            self.remove_ip(bi, &old_ip);
            if !self.add_ip(bi, &node.ip()) {
                self.add_ip(bi, &old_ip);
                return false;
            }
        }
        let b = &mut self.buckets[bi];
        let mut entry = b.entries.remove(i);
        if replace_live {
            entry.node = node.clone();
        }
        b.entries.insert(0, entry);
        true
    }

    /// Replaces the tail `last` of bucket `bi` with a random replacement, or
    /// removes it when there is none. No-op if `last` moved meanwhile.
    fn replace(&mut self, bi: usize, last: &NodeId) -> Option<Node> {
        let tail_matches = self.buckets[bi]
            .entries
            .last()
            .map_or(false, |e| e.id() == *last);
        if !tail_matches {
            return None;
        }
        if self.buckets[bi].replacements.is_empty() {
            self.delete_in_bucket(bi, last);
            return None;
        }
        let ri = self.rng.gen_range(0..self.buckets[bi].replacements.len());
        let b = &mut self.buckets[bi];
        let r = b.replacements.remove(ri);
        let replacement = r.node.clone();
        let old = std::mem::replace(b.entries.last_mut()?, r);
        self.remove_ip(bi, &old.node.ip());
        Some(replacement)
    }

    /// Applies the answer to a revalidation ping of `last`, the tail of
    /// bucket `bi`. `reply` is the id that answered, if any. An answer from
    /// a different id counts as a failed check.
    fn revalidated(&mut self, bi: usize, last: &NodeId, reply: Option<NodeId>) -> Revalidation {
        if reply != Some(*last) {
            return match self.replace(bi, last) {
                Some(r) => Revalidation::Replaced(r),
                None => Revalidation::Removed,
            };
        }
        let b = &mut self.buckets[bi];
        if let Some(mut entry) = remove_id(&mut b.entries, last) {
            entry.liveness_checks += 1;
            b.entries.insert(0, entry);
        }
        Revalidation::Alive
    }

    fn delete_in_bucket(&mut self, bi: usize, id: &NodeId) {
        if let Some(removed) = remove_id(&mut self.buckets[bi].entries, id) {
            self.remove_ip(bi, &removed.node.ip());
        }
    }

    fn closest(&self, target: &NodeId, n: usize, check_live: bool) -> NodesByDistance {
        let mut close = NodesByDistance::new(*target);
        for b in &self.buckets {
            for e in &b.entries {
                if check_live && e.liveness_checks == 0 {
                    continue;
                }
                close.push(e.node.clone(), n);
            }
        }
        close
    }

    /// Heads of randomly ordered buckets, round robin, until `max` nodes.
    fn read_random(&mut self, max: usize, exclude: &HashSet<NodeId>) -> Vec<Node> {
        let mut buckets: Vec<Vec<Node>> = self
            .buckets
            .iter()
            .map(|b| {
                b.entries
                    .iter()
                    .filter(|e| !exclude.contains(&e.id()))
                    .map(|e| e.node.clone())
                    .collect::<Vec<_>>()
            })
            .filter(|v| !v.is_empty())
            .collect();
        buckets.shuffle(&mut self.rng);

        let mut out = Vec::with_capacity(max);
        let mut j = 0;
        while out.len() < max && !buckets.is_empty() {
            j %= buckets.len();
            let b = &mut buckets[j];
            out.push(b.remove(0));
            if b.is_empty() {
                buckets.remove(j);
            } else {
                j += 1;
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// DhtTable
// ---------------------------------------------------------------------------

struct DhtInner {
    local: NodeId,
    max_dial_out: usize,
    udp: Arc<Udp>,
    db: Arc<PeerDb>,
    state: Mutex<TableState>,
    init_done: watch::Sender<bool>,
    closing: watch::Sender<bool>,
    refresh_tx: mpsc::UnboundedSender<oneshot::Sender<()>>,
    refresh_rx: Mutex<Option<mpsc::UnboundedReceiver<oneshot::Sender<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Kademlia table for ordinary peers. Cloning shares the same table.
#[derive(Clone)]
pub struct DhtTable {
    inner: Arc<DhtInner>,
}

impl NodeSink for DhtInner {
    fn add_verified_node(&self, node: Node) {
        if !*self.init_done.borrow() {
            return;
        }
        self.state.lock().add_verified_node(node);
    }

    fn closest_live(&self, target: &NodeId, n: usize) -> Vec<Node> {
        self.state.lock().closest(target, n, true).entries
    }
}

impl DhtTable {
    /// Builds a table on top of a bound transport. `seeds` are the fallback
    /// nodes tried whenever the table runs empty.
    pub fn new(
        udp: Arc<Udp>,
        db: Arc<PeerDb>,
        max_dial_out: usize,
        seeds: Vec<Node>,
    ) -> Result<Self, DiscoverError> {
        if max_dial_out == 0 {
            return Err(DiscoverError::Config("max dial out must be positive".into()));
        }
        let local = udp.local_node().id;
        let (seeds, distinct) = split_seeds(seeds, &local, true);
        info!(seeds = distinct, "dht table created");

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (init_done, _) = watch::channel(false);
        let (closing, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(DhtInner {
                local,
                max_dial_out,
                udp,
                db,
                state: Mutex::new(TableState::new(local, seeds)),
                init_done,
                closing,
                refresh_tx,
                refresh_rx: Mutex::new(Some(refresh_rx)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.inner.local
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_init_done(&self) -> bool {
        *self.inner.init_done.borrow()
    }

    /// All live entries, bucket by bucket.
    pub fn nodes(&self) -> Vec<Node> {
        let state = self.inner.state.lock();
        state
            .buckets
            .iter()
            .flat_map(|b| b.entries.iter().map(|e| e.node.clone()))
            .collect()
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        let state = self.inner.state.lock();
        let bi = state.bucket_index(id);
        state.buckets[bi]
            .entries
            .iter()
            .find(|e| e.id() == *id)
            .map(|e| e.node.clone())
    }

    /// Requests a refresh and waits until it (or the one already running)
    /// completes.
    pub async fn refresh(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.refresh_tx.send(tx).is_err() || *self.inner.closing.borrow() {
            return;
        }
        let mut closing = self.inner.closing.subscribe();
        tokio::select! {
            _ = rx => {}
            _ = closing.changed() => {}
        }
    }

    /// Kademlia lookup for nodes close to `target`.
    pub async fn lookup(&self, target: NodeId) -> Vec<Node> {
        self.inner.clone().lookup(target).await
    }
}

impl DhtInner {
    async fn lookup(self: Arc<Self>, target: NodeId) -> Vec<Node> {
        let mut closing = self.closing.subscribe();
        if *closing.borrow() {
            return Vec::new();
        }

        let mut asked: HashSet<NodeId> = HashSet::from([self.local]);
        let mut result = self.state.lock().closest(&target, BUCKET_SIZE, false);
        let mut seen: HashSet<NodeId> = result.entries.iter().map(|n| n.id).collect();
        let mut queries = FuturesUnordered::new();

        loop {
            let candidates: Vec<Node> = result
                .entries
                .iter()
                .filter(|n| !asked.contains(&n.id))
                .take(ALPHA.saturating_sub(queries.len()))
                .cloned()
                .collect();
            for n in candidates {
                asked.insert(n.id);
                queries.push(Arc::clone(&self).lookup_worker(n, target));
            }
            if queries.is_empty() {
                break;
            }
            tokio::select! {
                Some(nodes) = queries.next() => {
                    for n in nodes {
                        if n.id != self.local && seen.insert(n.id) {
                            result.push(n, BUCKET_SIZE);
                        }
                    }
                }
                _ = closing.changed() => return Vec::new(),
            }
        }
        result.entries
    }

    async fn lookup_worker(self: Arc<Self>, n: Node, target: NodeId) -> Vec<Node> {
        let mut fails = self.db.find_fails(&n.id, &n.ip());
        let found = match self.udp.find_node(&n, target).await {
            Err(UdpError::Closed) => return Vec::new(),
            Ok(found) => found,
            Err(_) => Vec::new(),
        };

        if found.is_empty() {
            fails += 1;
            if let Err(e) = self.db.update_find_fails(&n.id, &n.ip(), fails) {
                warn!(error = %e, "failed to record findnode failure");
            }
            debug!(id = %n.id.short(), ip = %n.ip(), fails, "findnode failed");
            if fails >= MAX_FINDNODE_FAILURES {
                info!(id = %n.id.short(), ip = %n.ip(), fails, "too many findnode failures, dropping");
                let mut state = self.state.lock();
                let bi = state.bucket_index(&n.id);
                state.delete_in_bucket(bi, &n.id);
            }
        } else if fails > 0 {
            // Failures are counted consecutively.
            let _ = self.db.update_find_fails(&n.id, &n.ip(), 0);
        }

        {
            let mut state = self.state.lock();
            for node in &found {
                state.add_seen_node(node.clone());
            }
        }
        found
    }

    async fn lookup_random(self: Arc<Self>) -> Vec<Node> {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let target = NodeId::from(keccak256(&seed));
        self.lookup(target).await
    }

    async fn do_refresh(self: Arc<Self>) {
        self.load_seed_nodes().await;
        let local = self.local;
        Arc::clone(&self).lookup(local).await;
        for _ in 0..3 {
            Arc::clone(&self).lookup_random().await;
        }
    }

    async fn load_seed_nodes(&self) {
        let mut seeds = self.db.query_seeds(SEED_COUNT, SEED_MAX_AGE);
        seeds.extend(self.state.lock().seeds.iter().cloned());
        for seed in seeds {
            if seed.id == self.local || self.state.lock().contains(&seed.id) {
                continue;
            }
            match self.udp.ping(&seed).await {
                Ok(_) => {
                    trace!(id = %seed.id.short(), addr = %seed.endpoint.udp_addr(), "seed answered");
                    self.state.lock().add_seen_node(seed);
                }
                Err(e) => {
                    debug!(id = %seed.id.short(), addr = %seed.endpoint.udp_addr(), error = %e, "seed ping failed");
                }
            }
        }
    }

    fn node_to_revalidate(&self) -> Option<(Node, usize)> {
        let mut state = self.state.lock();
        let mut order: Vec<usize> = (0..N_BUCKETS).collect();
        order.shuffle(&mut state.rng);
        order.into_iter().find_map(|bi| {
            state.buckets[bi]
                .entries
                .last()
                .map(|e| (e.node.clone(), bi))
        })
    }

    async fn do_revalidate(self: Arc<Self>) {
        let Some((last, bi)) = self.node_to_revalidate() else {
            return;
        };
        let reply = match self.udp.ping(&last).await {
            Ok(pong) => {
                if pong.my_node.id != last.id {
                    info!(old = %last.id.short(), new = %pong.my_node.id.short(), "revalidated node answered with another id");
                }
                Some(pong.my_node.id)
            }
            Err(_) => None,
        };
        let outcome = self.state.lock().revalidated(bi, &last.id, reply);
        match outcome {
            Revalidation::Alive => trace!(bucket = bi, id = %last.id.short(), "revalidated node"),
            Revalidation::Replaced(r) => {
                info!(bucket = bi, id = %last.id.short(), replacement = %r.id.short(), "replaced dead node")
            }
            Revalidation::Removed => info!(bucket = bi, id = %last.id.short(), "removed dead node"),
        }
    }

    fn next_revalidate_time(&self) -> Duration {
        let max = REVALIDATE_INTERVAL.as_millis() as u64;
        Duration::from_millis(self.state.lock().rng.gen_range(0..max))
    }

    /// Persists entries that have been checked at least once and have sat in
    /// the table for the minimum time.
    fn copy_live_nodes(&self) {
        let state = self.state.lock();
        let now = Instant::now();
        for b in &state.buckets {
            for e in &b.entries {
                if e.liveness_checks > 0 && now.duration_since(e.added_at) >= SEED_MIN_TABLE_TIME {
                    if let Err(err) = self.db.update_node(&e.node) {
                        warn!(error = %err, "failed to persist node");
                    }
                }
            }
        }
    }

    async fn run_loop(
        self: Arc<Self>,
        mut refresh_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
        mut closing: watch::Receiver<bool>,
    ) {
        let (refresh_done_tx, mut refresh_done_rx) = mpsc::unbounded_channel::<()>();
        let (revalidate_done_tx, mut revalidate_done_rx) = mpsc::unbounded_channel::<()>();

        let start = tokio::time::Instant::now();
        let mut refresh_tick = tokio::time::interval_at(start + REFRESH_INTERVAL, REFRESH_INTERVAL);
        let mut copy_tick = tokio::time::interval_at(start + COPY_NODES_INTERVAL, COPY_NODES_INTERVAL);
        let revalidate = tokio::time::sleep(self.next_revalidate_time());
        tokio::pin!(revalidate);

        let spawn_refresh = |inner: Arc<Self>, done: mpsc::UnboundedSender<()>| {
            tokio::spawn(async move {
                inner.do_refresh().await;
                let _ = done.send(());
            })
        };

        let mut refreshing = true;
        let mut revalidating = false;
        let mut waiting: Vec<oneshot::Sender<()>> = Vec::new();
        let mut workers: Vec<JoinHandle<()>> = vec![spawn_refresh(Arc::clone(&self), refresh_done_tx.clone())];

        loop {
            tokio::select! {
                _ = refresh_tick.tick() => {
                    self.state.lock().rng = StdRng::from_entropy();
                    if !refreshing {
                        refreshing = true;
                        workers.push(spawn_refresh(Arc::clone(&self), refresh_done_tx.clone()));
                    }
                }
                Some(req) = refresh_rx.recv() => {
                    waiting.push(req);
                    if !refreshing {
                        refreshing = true;
                        workers.push(spawn_refresh(Arc::clone(&self), refresh_done_tx.clone()));
                    }
                }
                Some(()) = refresh_done_rx.recv() => {
                    refreshing = false;
                    self.init_done.send_replace(true);
                    for w in waiting.drain(..) {
                        let _ = w.send(());
                    }
                }
                _ = &mut revalidate, if !revalidating => {
                    revalidating = true;
                    let inner = Arc::clone(&self);
                    let done = revalidate_done_tx.clone();
                    workers.push(tokio::spawn(async move {
                        inner.do_revalidate().await;
                        let _ = done.send(());
                    }));
                }
                Some(()) = revalidate_done_rx.recv() => {
                    revalidating = false;
                    let next = self.next_revalidate_time();
                    revalidate.as_mut().reset(tokio::time::Instant::now() + next);
                }
                _ = copy_tick.tick() => self.copy_live_nodes(),
                _ = closing.changed() => break,
            }
            workers.retain(|w| !w.is_finished());
        }

        for w in workers {
            w.abort();
        }
        for w in waiting {
            let _ = w.send(());
        }
    }
}

#[async_trait]
impl DiscoverTable for DhtTable {
    async fn start(&self) -> Result<(), DiscoverError> {
        let Some(rx) = self.inner.refresh_rx.lock().take() else {
            return Ok(());
        };
        let sink: Arc<dyn NodeSink> = self.inner.clone();
        self.inner.udp.start(Arc::downgrade(&sink));
        let handle = tokio::spawn(Arc::clone(&self.inner).run_loop(rx, self.inner.closing.subscribe()));
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    async fn stop(&self) {
        self.inner.closing.send_replace(true);
        self.inner.udp.close().await;
        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for t in tasks {
            let _ = t.await;
        }
    }

    async fn lookup_random(&self) -> Vec<Node> {
        if self.is_empty() {
            // First query, or every node dropped: bootstrap again.
            self.refresh().await;
        }
        Arc::clone(&self.inner).lookup_random().await
    }

    fn read_random_nodes(&self, max: usize, exclude: &HashSet<NodeId>) -> Vec<Node> {
        if !self.is_init_done() {
            debug!("table not initialized yet");
            return Vec::new();
        }
        self.inner.state.lock().read_random(max, exclude)
    }

    fn max_dial_out_num(&self) -> usize {
        self.inner.max_dial_out
    }

    fn max_con_num_from_cache(&self) -> usize {
        self.inner.max_dial_out / 2
    }

    fn is_dht_table(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKey;
    use crate::p2p::node::Endpoint;
    use std::net::{Ipv4Addr, SocketAddr};

    // -- Helpers ------------------------------------------------------------

    /// An id whose log distance to `local` is exactly `dist`.
    fn id_at_distance(local: &NodeId, dist: usize) -> NodeId {
        let mut id = *local;
        let bit = dist - 1;
        let byte = 31 - bit / 8;
        id.as_mut_bytes()[byte] ^= 1 << (bit % 8);
        // Randomize lower bits so ids differ.
        let mut rng = rand::thread_rng();
        for b in (byte + 1)..32 {
            id.as_mut_bytes()[b] = rng.gen();
        }
        id
    }

    fn wan_node(id: NodeId, a: u8, b: u8) -> Node {
        Node::new(id, Endpoint::new(IpAddr::V4(Ipv4Addr::new(50, a, b, 1)), 30301, 30302))
    }

    async fn spawn_table(seeds: Vec<Node>) -> DhtTable {
        let db = Arc::new(PeerDb::open_temporary().unwrap());
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let udp = Udp::bind(addr, 30000, NodeKey::generate(), db.clone()).await.unwrap();
        DhtTable::new(udp, db, 8, seeds).unwrap()
    }

    // -- Bucket policy ------------------------------------------------------

    #[test]
    fn close_distances_share_bucket_zero() {
        let local = NodeId::random();
        let state = TableState::new(local, Vec::new());
        assert_eq!(state.bucket_index(&id_at_distance(&local, 1)), 0);
        assert_eq!(state.bucket_index(&id_at_distance(&local, BUCKET_MIN_DISTANCE)), 0);
        assert_eq!(state.bucket_index(&id_at_distance(&local, BUCKET_MIN_DISTANCE + 1)), 0);
        assert_eq!(state.bucket_index(&id_at_distance(&local, 256)), N_BUCKETS - 1);
    }

    #[test]
    fn full_bucket_spills_into_replacements() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        for i in 0..(BUCKET_SIZE + 3) {
            state.add_seen_node(wan_node(id_at_distance(&local, 256), i as u8, 0));
        }
        let b = &state.buckets[N_BUCKETS - 1];
        assert_eq!(b.entries.len(), BUCKET_SIZE);
        assert_eq!(b.replacements.len(), 3);
    }

    #[test]
    fn self_is_never_added() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        state.add_seen_node(wan_node(local, 1, 1));
        state.add_verified_node(wan_node(local, 1, 1));
        assert_eq!(state.len(), 0);
    }

    #[test]
    fn bucket_ip_limit_applies_outside_lan() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        for _ in 0..4 {
            state.add_seen_node(wan_node(id_at_distance(&local, 256), 7, 7));
        }
        assert_eq!(state.buckets[N_BUCKETS - 1].entries.len(), BUCKET_IP_LIMIT);

        for i in 0..4u8 {
            let lan = Node::new(
                id_at_distance(&local, 255),
                Endpoint::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, i + 1)), 1, 2),
            );
            state.add_seen_node(lan);
        }
        assert_eq!(state.buckets[N_BUCKETS - 2].entries.len(), 4);
    }

    #[test]
    fn table_ip_limit_spans_buckets() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        for d in 0..N_BUCKETS {
            state.add_seen_node(wan_node(id_at_distance(&local, 256 - d), 9, 9));
        }
        assert_eq!(state.len(), TABLE_IP_LIMIT);
    }

    #[test]
    fn verified_node_moves_to_front() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        let a = wan_node(id_at_distance(&local, 256), 1, 0);
        let b = wan_node(id_at_distance(&local, 256), 2, 0);
        state.add_seen_node(a.clone());
        state.add_seen_node(b.clone());
        state.add_verified_node(b.clone());
        let entries = &state.buckets[N_BUCKETS - 1].entries;
        assert_eq!(entries[0].id(), b.id);
        assert_eq!(entries[1].id(), a.id);
    }

    #[test]
    fn replace_uses_replacement_or_removes() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        let bi = N_BUCKETS - 1;
        let nodes: Vec<Node> = (0..=BUCKET_SIZE)
            .map(|i| wan_node(id_at_distance(&local, 256), i as u8, 1))
            .collect();
        for n in &nodes {
            state.add_seen_node(n.clone());
        }
        let tail = state.buckets[bi].entries.last().unwrap().id();
        let r = state.replace(bi, &tail).unwrap();
        assert_eq!(r.id, nodes[BUCKET_SIZE].id);
        assert!(!state.contains(&tail));

        // No replacements left: the tail is simply removed.
        let tail = state.buckets[bi].entries.last().unwrap().id();
        assert!(state.replace(bi, &tail).is_none());
        assert_eq!(state.buckets[bi].entries.len(), BUCKET_SIZE - 1);
    }

    #[test]
    fn revalidation_keeps_ids_stable() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        let bi = N_BUCKETS - 1;
        let nodes: Vec<Node> = (0..=BUCKET_SIZE)
            .map(|i| wan_node(id_at_distance(&local, 256), i as u8, 2))
            .collect();
        for n in &nodes {
            state.add_seen_node(n.clone());
        }

        // An answer from another id replaces the entry instead of renaming it.
        let tail = state.buckets[bi].entries.last().unwrap().id();
        let impostor = NodeId::random();
        match state.revalidated(bi, &tail, Some(impostor)) {
            Revalidation::Replaced(r) => assert_eq!(r.id, nodes[BUCKET_SIZE].id),
            _ => panic!("expected replacement"),
        }
        assert!(!state.contains(&tail));
        assert!(!state.contains(&impostor));
        assert_eq!(state.buckets[bi].entries.len(), BUCKET_SIZE);

        let tail = state.buckets[bi].entries.last().unwrap().id();
        assert!(matches!(state.revalidated(bi, &tail, Some(tail)), Revalidation::Alive));
        let front = &state.buckets[bi].entries[0];
        assert_eq!(front.id(), tail);
        assert_eq!(front.liveness_checks, 1);

        let tail = state.buckets[bi].entries.last().unwrap().id();
        assert!(matches!(state.revalidated(bi, &tail, None), Revalidation::Removed));
        assert_eq!(state.buckets[bi].entries.len(), BUCKET_SIZE - 1);
    }

    #[test]
    fn closest_is_sorted_and_bounded() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        for d in 0..N_BUCKETS {
            for i in 0..2u8 {
                state.add_seen_node(wan_node(id_at_distance(&local, 256 - d), d as u8, i));
            }
        }
        let target = NodeId::random();
        let close = state.closest(&target, BUCKET_SIZE, false);
        assert_eq!(close.entries.len(), BUCKET_SIZE);
        for w in close.entries.windows(2) {
            assert_ne!(dist_cmp(&target, &w[0].id, &w[1].id), Ordering::Greater);
        }
        assert!(state.closest(&target, BUCKET_SIZE, true).entries.is_empty());
    }

    #[test]
    fn read_random_honors_exclusions() {
        let local = NodeId::random();
        let mut state = TableState::new(local, Vec::new());
        let nodes: Vec<Node> = (0..6u8)
            .map(|i| wan_node(id_at_distance(&local, 256 - i as usize), i, 0))
            .collect();
        for n in &nodes {
            state.add_seen_node(n.clone());
        }
        let exclude: HashSet<NodeId> = nodes[..2].iter().map(|n| n.id).collect();
        let got = state.read_random(10, &exclude);
        assert_eq!(got.len(), 4);
        assert!(got.iter().all(|n| !exclude.contains(&n.id)));
        assert_eq!(state.read_random(3, &HashSet::new()).len(), 3);
    }

    #[test]
    fn nodes_by_distance_keeps_closest() {
        let target = NodeId::zero();
        let mut list = NodesByDistance::new(target);
        let mk = |b: u8| {
            let mut raw = [0u8; 32];
            raw[0] = b;
            wan_node(NodeId::from(raw), b, 0)
        };
        for b in [9u8, 3, 7, 1, 5] {
            list.push(mk(b), 3);
        }
        let firsts: Vec<u8> = list.entries.iter().map(|n| n.id.as_bytes()[0]).collect();
        assert_eq!(firsts, vec![1, 3, 5]);
    }

    // -- Live tables --------------------------------------------------------

    #[tokio::test]
    async fn rejects_zero_dial_out() {
        let db = Arc::new(PeerDb::open_temporary().unwrap());
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let udp = Udp::bind(addr, 1, NodeKey::generate(), db.clone()).await.unwrap();
        assert!(DhtTable::new(udp, db, 0, Vec::new()).is_err());
    }

    #[tokio::test]
    async fn tables_discover_each_other_through_a_seed() {
        let seed = spawn_table(Vec::new()).await;
        seed.start().await.unwrap();
        let seed_node = seed.inner.udp.local_node();

        let a = spawn_table(vec![seed_node.clone()]).await;
        let b = spawn_table(vec![seed_node.clone()]).await;
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.refresh().await;
        b.refresh().await;

        assert!(a.is_init_done());
        assert!(a.get_node(&seed_node.id).is_some());
        let cached = a.read_random_nodes(10, &HashSet::new());
        assert!(cached.iter().any(|n| n.id == seed_node.id));

        let found = a.lookup_random().await;
        assert!(found.iter().all(|n| n.id != a.local_id()));
        let mut ids: Vec<_> = found.iter().map(|n| n.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), found.len());
        assert!(found.len() <= BUCKET_SIZE);

        a.stop().await;
        b.stop().await;
        seed.stop().await;
    }
}
