//! # Mempool Reactor
//!
//! Gossips transactions on channel `0x30` by hash: peers announce what they
//! hold, and bodies move only on request.
//!
//! ```text
//!   A                                B
//!   │── TxHash{Notify, [h1, h2]} ──►│  h1 unknown, h2 known
//!   │◄── TxHash{Request, [h1]} ─────│
//!   │── Tx(body of h1) ────────────►│  queued, then Mempool::add_tx
//! ```
//!
//! ## Tasks
//!
//! | Task           | Work                                                   |
//! |----------------|--------------------------------------------------------|
//! | receive        | admits gossiped txs, `⌈cores / 4⌉` at a time            |
//! | multisign      | admits gossiped multi-sign txs one by one              |
//! | requests       | sends hash requests and requested bodies               |
//! | broadcast      | announces each newly admitted tx to all other peers    |
//! | per peer       | announces the current pool once, on connect            |
//!
//! A hash requested from one peer is remembered for 15 s, so an
//! announcement from a second peer in that window does not fetch the body
//! again.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::{Put, TxCache};
use super::error::MempoolError;
use super::pool::{BroadcastItem, Mempool};
use super::tx::{Tx, TxHash, TxKind};
use crate::config::{
    HASH_BATCH_BASE, MEMPOOL_CHANNEL, MEMPOOL_CHANNEL_PRIORITY, MEMPOOL_FULL_BACKOFF,
    MEMPOOL_SEND_QUEUE_CAPACITY, PEER_CATCHUP_SLEEP, RECEIVE_CACHE_MAX_LENGTH,
    REQUEST_CACHE_DELAY_SECS, TX_REQUEST_QUEUE_SIZE,
};
use crate::p2p::{ChannelDescriptor, NodeId, P2pResult, Peer, Reactor, Switch};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashKind {
    Notify,
    Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHashMessage {
    pub kind: HashKind,
    pub hashes: Vec<TxHash>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MempoolMessage<T> {
    Tx(T),
    TxHash(TxHashMessage),
}

/// Borrowing twin of [`MempoolMessage`]; encodes to the same bytes.
#[derive(Serialize)]
enum MempoolMessageRef<'a, T> {
    Tx(&'a T),
    TxHash(&'a TxHashMessage),
}

pub fn encode_tx<T: Serialize>(tx: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&MempoolMessageRef::Tx(tx))
}

pub fn encode_hashes<T: Serialize>(msg: &TxHashMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&MempoolMessageRef::<T>::TxHash(msg))
}

pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<MempoolMessage<T>, bincode::Error> {
    bincode::deserialize(bytes)
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

type Received<T> = (NodeId, T);

enum TxRequest<T> {
    /// Ask `peer` for the body of `hash`.
    Fetch { peer: Arc<Peer>, hash: TxHash },
    /// Send `tx` to `peer`.
    Deliver { peer: Arc<Peer>, tx: Arc<T> },
}

pub struct MempoolReactor<T: Tx> {
    me: Weak<Self>,
    mempool: Arc<Mempool<T>>,
    switch: Weak<Switch>,
    requested: TxCache<()>,

    received_tx: mpsc::Sender<Received<T>>,
    received_rx: Mutex<Option<mpsc::Receiver<Received<T>>>>,
    multisign_tx: mpsc::Sender<Received<T>>,
    multisign_rx: Mutex<Option<mpsc::Receiver<Received<T>>>>,
    requests_tx: mpsc::Sender<TxRequest<T>>,
    requests_rx: Mutex<Option<mpsc::Receiver<TxRequest<T>>>>,

    peer_tasks: Mutex<HashMap<NodeId, JoinHandle<()>>>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T> MempoolReactor<T>
where
    T: Tx + Serialize + DeserializeOwned,
{
    pub fn new(mempool: Arc<Mempool<T>>, switch: Weak<Switch>) -> Arc<Self> {
        let (received_tx, received_rx) = mpsc::channel(RECEIVE_CACHE_MAX_LENGTH);
        let (multisign_tx, multisign_rx) = mpsc::channel(RECEIVE_CACHE_MAX_LENGTH);
        let (requests_tx, requests_rx) = mpsc::channel(TX_REQUEST_QUEUE_SIZE);
        let (quit, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            mempool,
            switch,
            requested: TxCache::new(1, Duration::from_secs(REQUEST_CACHE_DELAY_SECS)),
            received_tx,
            received_rx: Mutex::new(Some(received_rx)),
            multisign_tx,
            multisign_rx: Mutex::new(Some(multisign_rx)),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            peer_tasks: Mutex::new(HashMap::new()),
            quit,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn mempool(&self) -> &Arc<Mempool<T>> {
        &self.mempool
    }

    fn admit_width() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ((cpus + 3) >> 2).max(1)
    }

    fn arc_self(&self) -> Option<Arc<Self>> {
        self.me.upgrade()
    }

    fn start_routines(self: &Arc<Self>) {
        let quit = self.quit.subscribe();
        if let Some(rx) = self.received_rx.lock().take() {
            let width = Self::admit_width();
            self.spawn(Arc::clone(self).admit_loop(rx, width, quit.clone()));
        }
        if let Some(rx) = self.multisign_rx.lock().take() {
            self.spawn(Arc::clone(self).admit_loop(rx, 1, quit.clone()));
        }
        if let Some(rx) = self.requests_rx.lock().take() {
            self.spawn(Arc::clone(self).request_loop(rx, quit.clone()));
        }
        if let Some(rx) = self.mempool.take_broadcast_rx() {
            self.spawn(Arc::clone(self).broadcast_loop(rx, quit));
        }
    }

    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        self.tasks.lock().push(tokio::spawn(fut));
    }

    // -- Inbound ------------------------------------------------------------

    fn handle_tx(&self, peer: &Arc<Peer>, tx: T) {
        if !self.mempool.receive_p2p_tx() {
            return;
        }
        let hash = tx.hash();
        let queue = if tx.kind() == TxKind::MultiSign {
            &self.multisign_tx
        } else {
            &self.received_tx
        };
        if queue.try_send((peer.id(), tx)).is_err() {
            info!(peer = %peer.id(), hash = %hash, "receive queue full, dropping tx");
        }
    }

    fn handle_hashes(&self, peer: &Arc<Peer>, msg: TxHashMessage) {
        match msg.kind {
            HashKind::Notify => {
                if !self.mempool.receive_p2p_tx() {
                    return;
                }
                for hash in msg.hashes {
                    if self.mempool.has_tx(&hash) || self.requested.put(hash, ()) != Put::Inserted {
                        continue;
                    }
                    let req = TxRequest::Fetch {
                        peer: Arc::clone(peer),
                        hash,
                    };
                    if self.requests_tx.try_send(req).is_err() {
                        self.requested.delete(&hash);
                        debug!(peer = %peer.id(), "request queue full");
                    }
                }
            }
            HashKind::Request => {
                for hash in msg.hashes {
                    let Some(tx) = self.mempool.get_tx_from_cache(&hash) else {
                        continue;
                    };
                    let req = TxRequest::Deliver {
                        peer: Arc::clone(peer),
                        tx,
                    };
                    if self.requests_tx.try_send(req).is_err() {
                        debug!(peer = %peer.id(), "request queue full");
                    }
                }
            }
        }
    }

    /// Drains a receive queue. `width` bounds concurrent admissions; with a
    /// width of one, txs are admitted in arrival order.
    async fn admit_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Received<T>>,
        width: usize,
        mut quit: watch::Receiver<bool>,
    ) {
        let permits = Arc::new(Semaphore::new(width));
        loop {
            let (peer, tx) = tokio::select! {
                _ = quit.changed() => return,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            if width == 1 {
                self.admit(peer, tx).await;
                continue;
            }
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                return;
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.admit(peer, tx).await;
                drop(permit);
            });
        }
    }

    async fn admit(&self, peer: NodeId, tx: T) {
        let tx = Arc::new(tx);
        loop {
            match self.mempool.add_tx(Some(peer), Arc::clone(&tx)) {
                Ok(()) | Err(MempoolError::Duplicate) => return,
                Err(MempoolError::MempoolFull) => {
                    if *self.quit.borrow() {
                        return;
                    }
                    tokio::time::sleep(MEMPOOL_FULL_BACKOFF).await;
                }
                Err(err) => {
                    debug!(peer = %peer, hash = %tx.hash(), err = %err, "gossiped tx rejected");
                    return;
                }
            }
        }
    }

    // -- Outbound -----------------------------------------------------------

    async fn request_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<TxRequest<T>>,
        mut quit: watch::Receiver<bool>,
    ) {
        let mut purge = tokio::time::interval(Duration::from_secs(1));
        loop {
            let req = tokio::select! {
                _ = quit.changed() => return,
                _ = purge.tick() => {
                    self.requested.purge_expired();
                    continue;
                }
                req = rx.recv() => match req {
                    Some(req) => req,
                    None => return,
                },
            };
            match req {
                TxRequest::Fetch { peer, hash } => {
                    self.requested.delay_delete(hash);
                    let msg = TxHashMessage {
                        kind: HashKind::Request,
                        hashes: vec![hash],
                    };
                    match encode_hashes::<T>(&msg) {
                        Ok(data) => send_or_spawn(peer, Bytes::from(data)),
                        Err(err) => warn!(err = %err, "encode hash request"),
                    }
                }
                TxRequest::Deliver { peer, tx } => {
                    let data = match encode_tx(tx.as_ref()) {
                        Ok(data) => Bytes::from(data),
                        Err(err) => {
                            warn!(hash = %tx.hash(), err = %err, "encode tx");
                            continue;
                        }
                    };
                    if tx.kind() == TxKind::MultiSign {
                        if !peer.send(MEMPOOL_CHANNEL, data).await {
                            debug!(peer = %peer.id(), "multisign tx send failed");
                        }
                    } else {
                        send_or_spawn(peer, data);
                    }
                }
            }
        }
    }

    /// Announces every newly admitted tx to all peers but its origin.
    async fn broadcast_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<BroadcastItem<T>>,
        mut quit: watch::Receiver<bool>,
    ) {
        loop {
            let (origin, tx) = tokio::select! {
                _ = quit.changed() => return,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => return,
                },
            };
            let Some(switch) = self.switch.upgrade() else {
                continue;
            };
            let msg = TxHashMessage {
                kind: HashKind::Notify,
                hashes: vec![tx.hash()],
            };
            let data = match encode_hashes::<T>(&msg) {
                Ok(data) => Bytes::from(data),
                Err(err) => {
                    warn!(err = %err, "encode hash notify");
                    continue;
                }
            };
            match origin {
                Some(origin) => {
                    drop(switch.broadcast_except(MEMPOOL_CHANNEL, &origin, data));
                }
                None => {
                    drop(switch.broadcast(MEMPOOL_CHANNEL, data));
                }
            }
        }
    }

    /// Announces the pool's current contents to a new peer.
    async fn announce_pool(self: Arc<Self>, peer: Arc<Peer>) {
        let hashes = self.mempool.ready_hashes();
        let started = std::time::Instant::now();
        let mut quit = self.quit.subscribe();
        let mut sent = 0usize;
        let mut rest = hashes.as_slice();

        while !rest.is_empty() {
            if *quit.borrow_and_update() || !peer.is_running() {
                return;
            }
            let batch = HASH_BATCH_BASE + rand::thread_rng().gen_range(0..HASH_BATCH_BASE);
            let (chunk, tail) = rest.split_at(batch.min(rest.len()));
            let msg = TxHashMessage {
                kind: HashKind::Notify,
                hashes: chunk.to_vec(),
            };
            let data = match encode_hashes::<T>(&msg) {
                Ok(data) => Bytes::from(data),
                Err(err) => {
                    warn!(err = %err, "encode hash notify");
                    return;
                }
            };
            if peer.send(MEMPOOL_CHANNEL, data).await {
                sent += chunk.len();
                rest = tail;
            } else {
                warn!(peer = %peer.id(), "pool announcement send timed out");
                tokio::time::sleep(PEER_CATCHUP_SLEEP).await;
            }
        }
        debug!(peer = %peer.id(), sent, elapsed = ?started.elapsed(), "pool announced");
    }
}

fn send_or_spawn(peer: Arc<Peer>, data: Bytes) {
    if peer.try_send(MEMPOOL_CHANNEL, data.clone()) {
        return;
    }
    tokio::spawn(async move {
        peer.send(MEMPOOL_CHANNEL, data).await;
    });
}

#[async_trait]
impl<T> Reactor for MempoolReactor<T>
where
    T: Tx + Serialize + DeserializeOwned,
{
    fn name(&self) -> &str {
        "mempool"
    }

    fn channels(&self) -> Vec<ChannelDescriptor> {
        vec![ChannelDescriptor::new(MEMPOOL_CHANNEL, MEMPOOL_CHANNEL_PRIORITY)
            .with_send_queue_capacity(MEMPOOL_SEND_QUEUE_CAPACITY)]
    }

    async fn start(&self) -> P2pResult<()> {
        if let Some(this) = self.arc_self() {
            this.start_routines();
        }
        Ok(())
    }

    async fn stop(&self) {
        self.quit.send_replace(true);
        for (_, task) in self.peer_tasks.lock().drain() {
            task.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn add_peer(&self, peer: Arc<Peer>) {
        if !self.mempool.config().broadcast {
            return;
        }
        let Some(this) = self.arc_self() else {
            return;
        };
        let id = peer.id();
        let task = tokio::spawn(this.announce_pool(peer));
        if let Some(old) = self.peer_tasks.lock().insert(id, task) {
            old.abort();
        }
    }

    fn remove_peer(&self, peer: &Arc<Peer>, _reason: &str) {
        if let Some(task) = self.peer_tasks.lock().remove(&peer.id()) {
            task.abort();
        }
    }

    fn receive(&self, _channel: u8, peer: &Arc<Peer>, msg: Vec<u8>) {
        match decode_message::<T>(&msg) {
            Ok(MempoolMessage::Tx(tx)) => self.handle_tx(peer, tx),
            Ok(MempoolMessage::TxHash(hashes)) => self.handle_hashes(peer, hashes),
            Err(err) => {
                warn!(peer = %peer.id(), err = %err, "undecodable mempool message");
                if let Some(switch) = self.switch.upgrade() {
                    switch.stop_peer_for_misbehavior(peer, &format!("mempool decode: {err}"));
                }
            }
        }
    }
}
