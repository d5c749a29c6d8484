//! # Connection Manager
//!
//! Keeps the outbound peer count near the discovery table's target and
//! swaps the table when the node's role changes.
//!
//! ## Loops
//!
//! | Task          | Trigger                         | Action                                        |
//! |---------------|---------------------------------|-----------------------------------------------|
//! | dial-out      | every 20 s                      | dial from the table cache, then ask the net   |
//! | net lookup    | dial-out could not fill the gap | `lookup_random` and dial the results          |
//! | role check    | new validator candidate set     | re-fetch seeds, rebuild the table, reconnect  |
//!
//! Net lookups go through a channel of capacity one; a round that finds the
//! lookup task busy skips the lookup instead of queueing another.
//! Privileged tables hit the bootnode over HTTP, so their lookups run at
//! most once every five minutes.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bootnode::SeedSource;
use super::discover::{DhtTable, DiscoverError, DiscoverTable, HttpTable, PeerDb, Udp};
use super::node::{Node, NodeId};
use super::profile::{NodeProfile, NodeRole};
use super::switch::Switch;
use crate::config::{
    DIAL_OUT_INTERVAL, GET_SEEDS_RETRIES, HTTP_LOOKUP_INTERVAL, WAIT_NEW_SEEDS_TIMEOUT,
};
use crate::crypto::{NodeKey, PublicKey};

const SEEDS_RETRY_DELAY: Duration = Duration::from_secs(1);
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Table construction
// ---------------------------------------------------------------------------

/// Builds the discovery table for a role.
#[async_trait]
pub trait TableFactory: Send + Sync {
    async fn build(&self, role: NodeRole, seeds: Vec<Node>) -> Result<Arc<dyn DiscoverTable>, DiscoverError>;
}

/// Seed-list table for privileged roles, UDP Kademlia table otherwise.
pub struct DefaultTableFactory {
    pub key: NodeKey,
    pub udp_addr: SocketAddr,
    pub tcp_port: u16,
    pub db: Arc<PeerDb>,
    pub max_dial_out: usize,
    pub source: Arc<dyn SeedSource>,
}

#[async_trait]
impl TableFactory for DefaultTableFactory {
    async fn build(&self, role: NodeRole, seeds: Vec<Node>) -> Result<Arc<dyn DiscoverTable>, DiscoverError> {
        if role.is_privileged() {
            info!(seeds = seeds.len(), "building http table");
            return Ok(Arc::new(HttpTable::new(self.key.node_id(), self.source.clone(), seeds)));
        }
        info!(seeds = seeds.len(), addr = %self.udp_addr, "building dht table");
        let udp = Udp::bind(self.udp_addr, self.tcp_port, self.key.clone(), self.db.clone()).await?;
        let table = DhtTable::new(udp, self.db.clone(), self.max_dial_out, seeds)?;
        Ok(Arc::new(table))
    }
}

// ---------------------------------------------------------------------------
// ConManager
// ---------------------------------------------------------------------------

pub struct ConManager {
    switch: Arc<Switch>,
    profile: Arc<NodeProfile>,
    source: Arc<dyn SeedSource>,
    factory: Arc<dyn TableFactory>,
    dial_interval: Duration,
    last_net_lookup: Mutex<Option<Instant>>,
    lookup_tx: mpsc::Sender<usize>,
    lookup_rx: Mutex<Option<mpsc::Receiver<usize>>>,
    candidates_tx: mpsc::Sender<Vec<PublicKey>>,
    candidates_rx: Mutex<Option<mpsc::Receiver<Vec<PublicKey>>>>,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConManager {
    pub fn new(
        switch: Arc<Switch>,
        profile: Arc<NodeProfile>,
        source: Arc<dyn SeedSource>,
        factory: Arc<dyn TableFactory>,
    ) -> Arc<Self> {
        let (lookup_tx, lookup_rx) = mpsc::channel(1);
        let (candidates_tx, candidates_rx) = mpsc::channel(2);
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            switch,
            profile,
            source,
            factory,
            dial_interval: DIAL_OUT_INTERVAL,
            last_net_lookup: Mutex::new(None),
            lookup_tx,
            lookup_rx: Mutex::new(Some(lookup_rx)),
            candidates_tx,
            candidates_rx: Mutex::new(Some(candidates_rx)),
            quit,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn switch(&self) -> &Arc<Switch> {
        &self.switch
    }

    pub fn start(self: &Arc<Self>) {
        let lookup_rx = self.lookup_rx.lock().take();
        let candidates_rx = self.candidates_rx.lock().take();
        let (Some(lookup_rx), Some(candidates_rx)) = (lookup_rx, candidates_rx) else {
            return;
        };
        info!(interval = ?self.dial_interval, "connection manager starting");
        let tasks = [
            tokio::spawn(Arc::clone(self).dial_out_loop(self.quit.subscribe())),
            tokio::spawn(Arc::clone(self).net_lookup_loop(lookup_rx, self.quit.subscribe())),
            tokio::spawn(Arc::clone(self).role_check_loop(candidates_rx, self.quit.subscribe())),
        ];
        self.tasks.lock().extend(tasks);
    }

    pub async fn stop(&self) {
        self.quit.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Feeds a new validator set. Dropped when two updates are already
    /// waiting.
    pub fn set_candidates(&self, candidates: Vec<PublicKey>) {
        debug!(count = candidates.len(), "candidate set changed");
        if self.candidates_tx.try_send(candidates).is_err() {
            info!("candidate queue is full");
        }
    }

    // -- Dial out -----------------------------------------------------------

    async fn dial_out_loop(self: Arc<Self>, mut quit: watch::Receiver<bool>) {
        let mut next = tokio::time::Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next) => {}
                _ = quit.changed() => return,
            }
            self.dial_round().await;
            next = tokio::time::Instant::now() + self.dial_interval;
        }
    }

    /// One dial-out round. Returns how many dials are still missing.
    pub async fn dial_round(&self) -> usize {
        let Some(table) = self.switch.table() else {
            return 0;
        };
        let (out, _, dialing) = self.switch.num_peers();
        let mut need = table.max_dial_out_num().saturating_sub(out + dialing);
        debug!(out, dialing, need, "dial-out round");
        if need > 0 {
            need = self.dial_from_cache(table.as_ref(), need).await;
        }
        if need > 0 && self.lookup_tx.try_send(need).is_err() {
            debug!("net lookup already running");
        }
        need
    }

    async fn dial_from_cache(&self, table: &dyn DiscoverTable, need: usize) -> usize {
        let mut exclude: HashSet<NodeId> = self.switch.peers().list().iter().map(|p| p.id()).collect();
        exclude.insert(self.switch.node_id());
        let nodes = table.read_random_nodes(table.max_con_num_from_cache(), &exclude);
        self.dial_nodes(nodes, need).await
    }

    async fn net_lookup_loop(self: Arc<Self>, mut rx: mpsc::Receiver<usize>, mut quit: watch::Receiver<bool>) {
        loop {
            let need = tokio::select! {
                Some(need) = rx.recv() => need,
                _ = quit.changed() => return,
            };
            let Some(table) = self.switch.table() else {
                continue;
            };
            if !table.is_dht_table() && !self.net_lookup_due() {
                debug!("privileged lookup rate limited");
                continue;
            }
            let nodes = tokio::select! {
                nodes = table.lookup_random() => nodes,
                _ = quit.changed() => return,
            };
            debug!(found = nodes.len(), need, "net lookup finished");
            self.dial_nodes(nodes, need).await;
        }
    }

    fn net_lookup_due(&self) -> bool {
        let mut last = self.last_net_lookup.lock();
        match *last {
            Some(at) if at.elapsed() < HTTP_LOOKUP_INTERVAL => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Dials distinct nodes from `nodes`, `need` at a time, until `need`
    /// succeeded or the list ran out. Returns the remaining need.
    async fn dial_nodes(&self, nodes: Vec<Node>, mut need: usize) -> usize {
        let mut seen = HashSet::new();
        let mut pending = nodes.into_iter().filter(|n| seen.insert(n.id));
        while need > 0 {
            let batch: Vec<Node> = pending.by_ref().take(need).collect();
            if batch.is_empty() {
                break;
            }
            let results = join_all(batch.iter().map(|n| self.switch.add_dial(n))).await;
            let ok = results.into_iter().filter(|ok| *ok).count();
            need = need.saturating_sub(ok);
        }
        need
    }

    // -- Role change --------------------------------------------------------

    async fn role_check_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Vec<PublicKey>>,
        mut quit: watch::Receiver<bool>,
    ) {
        loop {
            let candidates = tokio::select! {
                Some(c) = rx.recv() => c,
                _ = quit.changed() => return,
            };
            self.try_switch_network(&candidates).await;
        }
    }

    /// Rebuilds discovery when the candidate set flips our role. The
    /// bootnode may lag behind consensus, so the seed fetch is retried
    /// until it reports the new role.
    pub async fn try_switch_network(self: &Arc<Self>, candidates: &[PublicKey]) -> bool {
        let current = self.profile.role();
        let ours = self.switch.key().public_key();
        let elected = candidates.contains(&ours);
        let changed = match current {
            NodeRole::Peer => elected,
            NodeRole::Validator => !elected,
        };
        if !changed {
            return false;
        }
        info!(role = %current, elected, "role change detected");

        for attempt in 0..GET_SEEDS_RETRIES {
            let (seeds, role) = match self.source.get_seeds().await {
                Ok(res) => res,
                Err(e) => {
                    warn!(error = %e, "seed fetch failed, keeping current network");
                    return false;
                }
            };
            if role == current {
                debug!(attempt, "bootnode has not seen the role change yet");
                tokio::time::sleep(SEEDS_RETRY_DELAY).await;
                continue;
            }
            if let Err(e) = self.renew_table(seeds.clone(), role).await {
                warn!(error = %e, "rebuilding discovery table failed");
                return false;
            }
            let this = Arc::clone(self);
            let handle = tokio::spawn(async move {
                this.wait_con_to_new_seeds(seeds, role).await;
            });
            self.tasks.lock().push(handle);
            return true;
        }
        warn!(role = %current, "role change failed: bootnode never refreshed");
        false
    }

    /// Replaces the switch's discovery table with a fresh one for `role`.
    /// The old table is stopped first so its UDP port is free again.
    pub async fn renew_table(&self, seeds: Vec<Node>, role: NodeRole) -> Result<(), DiscoverError> {
        if let Some(old) = self.switch.take_table() {
            old.stop().await;
        }
        let table = self.factory.build(role, seeds).await?;
        table.start().await?;
        self.profile.set_role(role);
        self.switch.set_local_role(role);
        self.switch.set_table(Some(table));
        info!(%role, "discovery table renewed");
        Ok(())
    }

    /// Dials the new seeds and drops the old peers once at least one new
    /// outbound connection came up. Gives up after a minute and keeps the
    /// old network.
    pub async fn wait_con_to_new_seeds(&self, seeds: Vec<Node>, role: NodeRole) -> bool {
        let (prev_out, _, _) = self.switch.num_peers();
        let old_peers = self.switch.peers().list();
        info!(seeds = seeds.len(), prev_out, "connecting to new seeds");
        self.dial_nodes(seeds.clone(), seeds.len()).await;

        let deadline = Instant::now() + WAIT_NEW_SEEDS_TIMEOUT;
        loop {
            let (out, _, _) = self.switch.num_peers();
            if out > prev_out {
                break;
            }
            if Instant::now() >= deadline {
                info!(%role, "role change failed, still on old network");
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        for peer in &old_peers {
            self.switch.stop_peer_for_error(peer, "network change, closing old connection");
        }
        info!(%role, dropped = old_peers.len(), "role change complete");
        true
    }

    /// Dials `seeds` and then drops every peer connected before the call.
    /// Used when the node has fallen behind the chain.
    pub async fn connect_to_new_seeds(&self, seeds: Vec<Node>) {
        let old_peers = self.switch.peers().list();
        info!(seeds = seeds.len(), "reconnecting to fresh seeds");
        self.dial_nodes(seeds.clone(), seeds.len()).await;
        for peer in &old_peers {
            self.switch.stop_peer_for_error(peer, "network change, closing old connection");
        }
    }
}
