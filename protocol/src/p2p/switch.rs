//! # Switch
//!
//! Owns every peer connection. Accepts inbound TCP, dials outbound on
//! request, runs the handshake, and hands established peers to the
//! reactors that registered for their channels.
//!
//! ## Admission
//!
//! Inbound connections pass, in order:
//!
//! | Check              | Rejects when                                          |
//! |--------------------|-------------------------------------------------------|
//! | per-IP limit       | a WAN address made `max_inbound_per_ip` attempts within the throttle window, or holds that many peers |
//! | inbound cap        | inbound peers would exceed `max_num_peers - outbound`  |
//! | address filter     | the optional filter hook refuses the address          |
//! | handshake          | timeout, bad signature, oversized `NodeInfo`           |
//! | blacklist          | the node id was marked bad recently                    |
//! | self / duplicate   | the node id is ours or already connected               |
//! | compatibility      | network or major version differ                        |
//!
//! Outbound dials skip the inbound checks and instead consult the dial
//! white- and blacklists.
//!
//! ## Failure Handling
//!
//! Peers report broken connections over a channel; one task removes them
//! from the peer set and then notifies every reactor. Reactors therefore
//! never see a peer that is still in the set after `remove_peer`.

use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::conn::{ChannelDescriptor, MConnConfig};
use super::discover::DiscoverTable;
use super::error::{P2pError, P2pResult};
use super::handshake::handshake;
use super::netutil::{is_lan, Netlist};
use super::node::{Node, NodeId};
use super::node_info::NodeInfo;
use super::peer::{Peer, PeerFailure, ReactorMap};
use super::peer_set::PeerSet;
use super::profile::NodeRole;
use super::reactor::Reactor;
use crate::config::{
    BLACKLIST_TIMEOUT, DEFAULT_MAX_PACKET_PAYLOAD, DEFAULT_P2P_PORT, DEFAULT_RECV_RATE,
    DEFAULT_SEND_RATE, DEFAULT_SEND_TIMEOUT, DIAL_RANDOMIZER, DIAL_TIMEOUT, FLUSH_THROTTLE,
    HANDSHAKE_TIMEOUT, INBOUND_THROTTLE_TIME, MAX_INBOUND_PER_IP, MAX_NUM_PEERS, MAX_OUTBOUND,
    PING_CHANNEL, PING_INTERVAL, PONG_TIMEOUT,
};
use crate::crypto::NodeKey;

/// Extra admission hook applied to every connection before the handshake.
pub type AddrFilter = Arc<dyn Fn(&SocketAddr) -> Result<(), String> + Send + Sync>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    pub listen_address: String,
    /// Advertised `ip:port`, when the listener sits behind NAT.
    pub external_address: Option<String>,
    pub max_num_peers: usize,
    /// Outbound target for general peers.
    pub max_outbound: usize,
    pub handshake_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub pong_timeout_secs: u64,
    pub send_timeout_secs: u64,
    pub send_rate: u64,
    pub recv_rate: u64,
    pub max_packet_payload: usize,
    pub inbound_throttle_secs: u64,
    pub max_inbound_per_ip: usize,
    pub blacklist_timeout_secs: u64,
    /// Static seed nodes, `<hex id>@<ip>:<tcp port>[:<udp port>]`.
    pub seeds: Vec<String>,
    /// CIDR ranges we may dial. Empty means any.
    pub dial_whitelist: Vec<String>,
    /// CIDR ranges we never dial.
    pub dial_blacklist: Vec<String>,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_address: format!("0.0.0.0:{DEFAULT_P2P_PORT}"),
            external_address: None,
            max_num_peers: MAX_NUM_PEERS,
            max_outbound: MAX_OUTBOUND,
            handshake_timeout_secs: HANDSHAKE_TIMEOUT.as_secs(),
            dial_timeout_secs: DIAL_TIMEOUT.as_secs(),
            ping_interval_secs: PING_INTERVAL.as_secs(),
            pong_timeout_secs: PONG_TIMEOUT.as_secs(),
            send_timeout_secs: DEFAULT_SEND_TIMEOUT.as_secs(),
            send_rate: DEFAULT_SEND_RATE,
            recv_rate: DEFAULT_RECV_RATE,
            max_packet_payload: DEFAULT_MAX_PACKET_PAYLOAD,
            inbound_throttle_secs: INBOUND_THROTTLE_TIME.as_secs(),
            max_inbound_per_ip: MAX_INBOUND_PER_IP,
            blacklist_timeout_secs: BLACKLIST_TIMEOUT.as_secs(),
            seeds: Vec::new(),
            dial_whitelist: Vec::new(),
            dial_blacklist: Vec::new(),
        }
    }
}

impl P2pConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn inbound_throttle(&self) -> Duration {
        Duration::from_secs(self.inbound_throttle_secs)
    }

    pub fn blacklist_timeout(&self) -> Duration {
        Duration::from_secs(self.blacklist_timeout_secs)
    }

    pub fn mconn_config(&self) -> MConnConfig {
        MConnConfig {
            send_rate: self.send_rate,
            recv_rate: self.recv_rate,
            max_packet_payload: self.max_packet_payload,
            flush_throttle: FLUSH_THROTTLE,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            send_timeout: Duration::from_secs(self.send_timeout_secs),
        }
    }

    /// Parses [`seeds`](Self::seeds), skipping malformed entries.
    pub fn seed_nodes(&self) -> Vec<Node> {
        self.seeds
            .iter()
            .filter_map(|s| match s.parse::<Node>() {
                Ok(node) => Some(node),
                Err(e) => {
                    warn!(seed = %s, error = %e, "ignoring malformed seed");
                    None
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Switch
// ---------------------------------------------------------------------------

struct InboundWindow {
    expiry: Instant,
    attempts: usize,
}

pub struct Switch {
    key: NodeKey,
    config: P2pConfig,
    mconn_config: MConnConfig,
    local_info: RwLock<NodeInfo>,
    local_addr: RwLock<Option<SocketAddr>>,

    reactors: RwLock<Vec<Arc<dyn Reactor>>>,
    reactors_by_ch: RwLock<ReactorMap>,
    descriptors: RwLock<Vec<ChannelDescriptor>>,

    peers: PeerSet,
    dialing: DashSet<SocketAddr>,
    bad_nodes: Mutex<HashMap<NodeId, Instant>>,
    inbound_history: Mutex<HashMap<IpAddr, InboundWindow>>,
    inbound_counts: Mutex<HashMap<IpAddr, usize>>,
    dial_whitelist: Option<Netlist>,
    dial_blacklist: Option<Netlist>,
    addr_filter: RwLock<Option<AddrFilter>>,

    table: RwLock<Option<Arc<dyn DiscoverTable>>>,

    failures_tx: mpsc::UnboundedSender<PeerFailure>,
    failures_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerFailure>>>,
    listener: Mutex<Option<TcpListener>>,
    running: AtomicBool,
    quit: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Switch {
    /// Creates a stopped switch. `info` is our `NodeInfo` template; its key,
    /// channels and addresses are filled in by the switch.
    pub fn new(key: NodeKey, config: P2pConfig, mut info: NodeInfo) -> P2pResult<Arc<Self>> {
        let parse_list = |entries: &[String]| -> P2pResult<Option<Netlist>> {
            if entries.is_empty() {
                return Ok(None);
            }
            Netlist::parse(entries)
                .map(Some)
                .map_err(|reason| P2pError::InvalidAddress {
                    addr: entries.join(","),
                    reason,
                })
        };
        let dial_whitelist = parse_list(&config.dial_whitelist)?;
        let dial_blacklist = parse_list(&config.dial_blacklist)?;

        info.pub_key = key.public_key();
        info.channels.clear();
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let (quit, _) = watch::channel(false);

        Ok(Arc::new(Self {
            key,
            mconn_config: config.mconn_config(),
            peers: PeerSet::new(config.max_num_peers),
            config,
            local_info: RwLock::new(info),
            local_addr: RwLock::new(None),
            reactors: RwLock::new(Vec::new()),
            reactors_by_ch: RwLock::new(Arc::new(HashMap::new())),
            descriptors: RwLock::new(Vec::new()),
            dialing: DashSet::new(),
            bad_nodes: Mutex::new(HashMap::new()),
            inbound_history: Mutex::new(HashMap::new()),
            inbound_counts: Mutex::new(HashMap::new()),
            dial_whitelist,
            dial_blacklist,
            addr_filter: RwLock::new(None),
            table: RwLock::new(None),
            failures_tx,
            failures_rx: Mutex::new(Some(failures_rx)),
            listener: Mutex::new(None),
            running: AtomicBool::new(false),
            quit,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    // -- Setup --------------------------------------------------------------

    /// Registers `reactor` for its channels.
    ///
    /// # Panics
    ///
    /// If a channel is already taken or is the keepalive channel. Both are
    /// wiring mistakes caught at startup.
    pub fn add_reactor(&self, reactor: Arc<dyn Reactor>) {
        let mut by_ch = self.reactors_by_ch.write();
        let mut map = HashMap::clone(&by_ch);
        let mut descriptors = self.descriptors.write();
        for desc in reactor.channels() {
            if desc.id == PING_CHANNEL {
                panic!("reactor {} claims the keepalive channel", reactor.name());
            }
            if let Some(existing) = map.get(&desc.id) {
                panic!(
                    "channel {:#04x} has multiple reactors: {} and {}",
                    desc.id,
                    existing.name(),
                    reactor.name()
                );
            }
            map.insert(desc.id, reactor.clone());
            self.local_info.write().channels.push(desc.id);
            descriptors.push(desc);
        }
        *by_ch = Arc::new(map);
        self.reactors.write().push(reactor);
    }

    pub fn reactor(&self, name: &str) -> Option<Arc<dyn Reactor>> {
        self.reactors.read().iter().find(|r| r.name() == name).cloned()
    }

    pub fn set_addr_filter(&self, filter: AddrFilter) {
        *self.addr_filter.write() = Some(filter);
    }

    pub fn set_table(&self, table: Option<Arc<dyn DiscoverTable>>) {
        *self.table.write() = table;
    }

    pub fn table(&self) -> Option<Arc<dyn DiscoverTable>> {
        self.table.read().clone()
    }

    pub fn take_table(&self) -> Option<Arc<dyn DiscoverTable>> {
        self.table.write().take()
    }

    pub fn set_local_role(&self, role: NodeRole) {
        self.local_info.write().role = role;
    }

    // -- Accessors ----------------------------------------------------------

    pub fn key(&self) -> &NodeKey {
        &self.key
    }

    pub fn node_id(&self) -> NodeId {
        self.key.node_id()
    }

    pub fn config(&self) -> &P2pConfig {
        &self.config
    }

    pub fn local_info(&self) -> NodeInfo {
        self.local_info.read().clone()
    }

    /// Bound listener address, once [`listen`](Self::listen) ran.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn get_by_id(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.peers.get_by_id(id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// `(outbound, inbound, dialing)`.
    pub fn num_peers(&self) -> (usize, usize, usize) {
        let (mut out, mut inbound) = (0, 0);
        for peer in self.peers.list() {
            if peer.is_outbound() {
                out += 1;
            } else {
                inbound += 1;
            }
        }
        (out, inbound, self.dialing.len())
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Binds the TCP listener and fills in our advertised addresses.
    pub async fn listen(&self) -> P2pResult<SocketAddr> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }
        let listener = TcpListener::bind(&self.config.listen_address).await?;
        let bound = listener.local_addr()?;

        let listen_addr = match &self.config.external_address {
            Some(ext) => ext.clone(),
            None => bound.to_string(),
        };
        let mut local_addrs = Vec::new();
        if bound.ip().is_unspecified() {
            local_addrs.push(format!("127.0.0.1:{}", bound.port()));
        }
        {
            let mut info = self.local_info.write();
            info.listen_addr = listen_addr.clone();
            info.local_addrs = local_addrs.clone();
        }
        self.peers.add_our_address(&listen_addr, &local_addrs);
        *self.listener.lock() = Some(listener);
        *self.local_addr.write() = Some(bound);
        info!(addr = %bound, advertised = %listen_addr, "p2p listener bound");
        Ok(bound)
    }

    /// Starts reactors, the accept loop, the failure handler and the
    /// discovery table.
    pub async fn start(self: &Arc<Self>) -> P2pResult<()> {
        self.listen().await?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(node = %self.node_id().short(), "switch starting");

        let reactors: Vec<_> = self.reactors.read().clone();
        for reactor in &reactors {
            reactor.start().await?;
        }

        let mut tasks = Vec::new();
        if let Some(listener) = self.listener.lock().take() {
            tasks.push(tokio::spawn(
                Arc::clone(self).accept_loop(listener, self.quit.subscribe()),
            ));
        }
        if let Some(rx) = self.failures_rx.lock().take() {
            tasks.push(tokio::spawn(
                Arc::clone(self).failure_loop(rx, self.quit.subscribe()),
            ));
        }
        self.tasks.lock().extend(tasks);

        if let Some(table) = self.table() {
            table.start().await?;
        }
        Ok(())
    }

    /// Stops accepting, closes every peer, stops reactors and discovery.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.quit.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        for peer in self.peers.list() {
            self.stop_and_remove_peer(&peer, "switch stopping");
        }
        let reactors: Vec<_> = self.reactors.read().clone();
        for reactor in &reactors {
            reactor.stop().await;
        }
        if let Some(table) = self.table() {
            table.stop().await;
        }
        info!("switch stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut quit: watch::Receiver<bool>) {
        loop {
            let (stream, addr) = tokio::select! {
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                _ = quit.changed() => break,
            };
            debug!(%addr, "inbound connection");
            if let Err(e) = self.admit_inbound(addr.ip()) {
                info!(%addr, peers = self.peers.len(), error = %e, "ignoring inbound connection");
                continue;
            }
            let sw = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = sw.add_peer(stream, addr, false, None).await {
                    log_add_peer_error(&addr, &e);
                }
            });
        }
    }

    async fn failure_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<PeerFailure>,
        mut quit: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                Some(failure) = rx.recv() => {
                    if let Some(peer) = failure.peer.upgrade() {
                        if failure.misbehaved {
                            self.stop_peer_for_misbehavior(&peer, &failure.reason);
                        } else {
                            self.stop_peer_for_error(&peer, &failure.reason);
                        }
                    }
                }
                _ = quit.changed() => break,
            }
        }
    }

    // -- Inbound Limits -----------------------------------------------------

    /// Per-IP limit for WAN addresses. Attempts are counted over a window
    /// of `inbound_throttle` that opens with the first attempt; the limit
    /// applies to whichever is larger, attempts in the window or live
    /// inbound peers. Records the attempt on success.
    pub(crate) fn check_inbound_conn(&self, ip: IpAddr) -> P2pResult<()> {
        if is_lan(&ip) {
            return Ok(());
        }
        let now = Instant::now();
        let mut history = self.inbound_history.lock();
        history.retain(|_, window| window.expiry > now);
        let window = history.entry(ip).or_insert(InboundWindow {
            expiry: now + self.config.inbound_throttle(),
            attempts: 0,
        });
        let count = window.attempts.max(self.inbound_count(ip));
        if count >= self.config.max_inbound_per_ip {
            return Err(P2pError::InboundLimit { ip, count });
        }
        window.attempts += 1;
        Ok(())
    }

    /// Every check the accept loop runs before spending a handshake.
    fn admit_inbound(&self, ip: IpAddr) -> P2pResult<()> {
        self.check_inbound_conn(ip)?;
        if self.inbound_cap_reached(ip) {
            return Err(P2pError::TooManyPeers);
        }
        Ok(())
    }

    fn inbound_cap_reached(&self, ip: IpAddr) -> bool {
        let (max_in, outbound) = if is_lan(&ip) {
            (self.config.max_num_peers / 2, 0)
        } else {
            let outbound = self.table().map(|t| t.max_dial_out_num()).unwrap_or(0);
            (self.config.max_num_peers.saturating_sub(outbound), outbound)
        };
        max_in as i64 <= self.peers.len() as i64 - outbound as i64
    }

    fn inbound_count(&self, ip: IpAddr) -> usize {
        self.inbound_counts.lock().get(&ip).copied().unwrap_or(0)
    }

    fn add_inbound_con(&self, ip: IpAddr) {
        *self.inbound_counts.lock().entry(ip).or_insert(0) += 1;
    }

    fn sub_inbound_con(&self, ip: IpAddr) {
        let mut counts = self.inbound_counts.lock();
        match counts.get_mut(&ip) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                counts.remove(&ip);
            }
            None => warn!(%ip, "inbound counter underflow"),
        }
    }

    // -- Peers --------------------------------------------------------------

    /// Handshakes on `stream` and, if every check passes, adds and starts
    /// the peer. The stream is closed on error.
    pub(crate) async fn add_peer(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
        expected: Option<NodeId>,
    ) -> P2pResult<()> {
        let filter = self.addr_filter.read().clone();
        if let Some(filter) = filter {
            filter(&addr).map_err(|reason| P2pError::Filtered { addr, reason })?;
        }
        let _ = stream.set_nodelay(true);

        let ours = self.local_info();
        let info = handshake(&mut stream, &self.key, &ours, self.config.handshake_timeout()).await?;
        let id = info.id();

        if self.is_blacklisted(&id) {
            return Err(P2pError::Blacklisted(id));
        }
        if let Err(e) = info.validate() {
            self.mark_bad_node(id);
            return Err(e);
        }
        if info.pub_key == ours.pub_key {
            return Err(P2pError::ConnectToSelf(addr.to_string()));
        }
        if let Some(expected) = expected {
            if expected != id {
                return Err(P2pError::UnexpectedId { expected, got: id });
            }
        }
        if self.peers.has_id(&id) {
            self.peers.record_conn_addr(addr.to_string(), id);
            return Err(P2pError::DuplicatePeerId(id));
        }
        ours.compatible_with(&info)?;

        let reactors = self.reactors_by_ch.read().clone();
        let descriptors = self.descriptors.read().clone();
        info!(%addr, peer = %info, "successful handshake");
        let peer = Peer::new(
            stream,
            info,
            addr,
            outbound,
            &descriptors,
            reactors,
            self.failures_tx.clone(),
            self.mconn_config.clone(),
        );

        self.peers.add(peer.clone())?;
        if !outbound {
            self.add_inbound_con(addr.ip());
        }
        if self.is_running() {
            peer.start();
            let reactors: Vec<_> = self.reactors.read().clone();
            for reactor in &reactors {
                reactor.add_peer(peer.clone());
            }
        }
        info!(%peer, "added peer");
        Ok(())
    }

    pub fn stop_peer_for_error(&self, peer: &Arc<Peer>, reason: &str) {
        warn!(%peer, %reason, "stopping peer for error");
        self.stop_and_remove_peer(peer, reason);
    }

    /// Disconnects a peer that broke the protocol and blacklists its node
    /// id so it cannot reconnect for the blacklist timeout.
    pub fn stop_peer_for_misbehavior(&self, peer: &Arc<Peer>, reason: &str) {
        self.mark_bad_node(peer.id());
        self.stop_peer_for_error(peer, reason);
    }

    /// Disconnects every peer, e.g. after a network change.
    pub fn close_all_connections(&self) {
        for peer in self.peers.list() {
            self.stop_and_remove_peer(&peer, "network change, closing all connections");
        }
    }

    fn stop_and_remove_peer(&self, peer: &Arc<Peer>, reason: &str) {
        if !self.peers.remove(peer) {
            return;
        }
        peer.stop();
        if !peer.is_outbound() {
            self.sub_inbound_con(peer.remote_ip());
        }
        let reactors: Vec<_> = self.reactors.read().clone();
        for reactor in &reactors {
            reactor.remove_peer(peer, reason);
        }
    }

    /// Sends `msg` to every peer concurrently. The receiver yields one
    /// result per peer and closes when all sends finished.
    pub fn broadcast(&self, channel: u8, msg: Bytes) -> mpsc::Receiver<bool> {
        self.broadcast_to(self.peers.list(), channel, msg)
    }

    /// Like [`broadcast`](Self::broadcast), skipping the peer `except`.
    pub fn broadcast_except(&self, channel: u8, except: &NodeId, msg: Bytes) -> mpsc::Receiver<bool> {
        let peers = self.peers.list().into_iter().filter(|p| p.id() != *except).collect();
        self.broadcast_to(peers, channel, msg)
    }

    fn broadcast_to(&self, peers: Vec<Arc<Peer>>, channel: u8, msg: Bytes) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(peers.len().max(1));
        for peer in peers {
            let tx = tx.clone();
            let msg = msg.clone();
            tokio::spawn(async move {
                let ok = peer.send(channel, msg).await;
                if !ok {
                    trace!(peer = %peer.id().short(), channel, "broadcast send failed");
                }
                let _ = tx.send(ok).await;
            });
        }
        rx
    }

    // -- Blacklist ----------------------------------------------------------

    /// Refuses `id` for the blacklist timeout. Marking an already-marked
    /// node does not extend the window.
    pub fn mark_bad_node(&self, id: NodeId) {
        let now = Instant::now();
        let mut bad = self.bad_nodes.lock();
        bad.retain(|_, expiry| *expiry > now);
        if !bad.contains_key(&id) {
            info!(node = %id.short(), "marking bad node");
            bad.insert(id, now + self.config.blacklist_timeout());
        }
    }

    pub fn is_blacklisted(&self, id: &NodeId) -> bool {
        let mut bad = self.bad_nodes.lock();
        match bad.get(id) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                bad.remove(id);
                false
            }
            None => false,
        }
    }

    // -- Dialing ------------------------------------------------------------

    pub fn is_dialing(&self, addr: &SocketAddr) -> bool {
        self.dialing.contains(addr)
    }

    /// Dials `addr` and adds the peer. With `expected` set, the remote must
    /// prove that node id in the handshake.
    pub async fn dial_peer_with_address(&self, addr: SocketAddr, expected: Option<NodeId>) -> P2pResult<()> {
        self.dialing.insert(addr);
        let res = self.dial(addr, expected).await;
        self.dialing.remove(&addr);
        res
    }

    async fn dial(&self, addr: SocketAddr, expected: Option<NodeId>) -> P2pResult<()> {
        debug!(%addr, "dialing peer");
        let stream = tokio::time::timeout(self.config.dial_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| P2pError::DialTimeout(addr))??;
        self.add_peer(stream, addr, true, expected).await
    }

    /// Dials a discovered node unless it is filtered, being dialed, or
    /// already connected. Returns whether the node should count towards the
    /// outbound target.
    pub async fn add_dial(&self, node: &Node) -> bool {
        if node.id == self.node_id() {
            return false;
        }
        let addr = node.endpoint.tcp_addr();
        if let Some(white) = &self.dial_whitelist {
            if !white.contains(&addr.ip()) {
                debug!(%addr, "dial target not whitelisted");
                return false;
            }
        }
        if let Some(black) = &self.dial_blacklist {
            if black.contains(&addr.ip()) {
                debug!(%addr, "dial target blacklisted");
                return false;
            }
        }
        if self.is_dialing(&addr) {
            return true;
        }
        if self.peers.has_addr(&addr.to_string()) || self.peers.has_id(&node.id) {
            // Already ours as an outbound peer: pick someone else instead.
            return !self
                .peers
                .get_by_id(&node.id)
                .map(|p| p.is_outbound())
                .unwrap_or(false);
        }
        match self.dial_peer_with_address(addr, Some(node.id)).await {
            Ok(()) => true,
            Err(e) => {
                log_add_peer_error(&addr, &e);
                false
            }
        }
    }

    /// Dials `addrs` in random order, each after a random delay.
    pub fn dial_peers_async(self: &Arc<Self>, addrs: &[String]) {
        let mut targets: Vec<SocketAddr> = Vec::new();
        for raw in addrs {
            if self.peers.has_addr(raw) {
                continue;
            }
            match raw.parse() {
                Ok(addr) => targets.push(addr),
                Err(e) => warn!(addr = %raw, error = %e, "invalid peer address"),
            }
        }
        let mut rng = rand::thread_rng();
        targets.shuffle(&mut rng);
        let max_delay = DIAL_RANDOMIZER.as_millis() as u64;
        for addr in targets {
            let delay = Duration::from_millis(rng.gen_range(0..max_delay.max(1)));
            let sw = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = sw.dial_peer_with_address(addr, None).await {
                    log_add_peer_error(&addr, &e);
                }
            });
        }
    }
}

fn log_add_peer_error(addr: &SocketAddr, err: &P2pError) {
    if err.is_routine() {
        debug!(%addr, error = %err, "peer rejected");
    } else {
        info!(%addr, error = %err, "peer rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_NETWORK, PROTOCOL_VERSION};
    use crate::p2p::conn::packet::write_packet;
    use crate::p2p::conn::Packet;
    use tokio::io::AsyncWriteExt;

    // -- Helpers ---

    fn template() -> NodeInfo {
        NodeInfo {
            pub_key: NodeKey::generate().public_key(),
            network: DEFAULT_NETWORK.into(),
            version: PROTOCOL_VERSION.into(),
            channels: Vec::new(),
            moniker: "sw".into(),
            role: NodeRole::Peer,
            listen_addr: String::new(),
            local_addrs: Vec::new(),
        }
    }

    fn switch_with(config: P2pConfig) -> Arc<Switch> {
        Switch::new(NodeKey::generate(), config, template()).unwrap()
    }

    /// Starts a peer over an in-memory pipe and registers it as an inbound
    /// peer from a WAN address. The far end of the pipe is returned.
    fn attach_peer(sw: &Arc<Switch>, config: MConnConfig) -> (Arc<Peer>, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(64);
        let mut info = template();
        info.pub_key = NodeKey::generate().public_key();
        let peer = Peer::new(
            near,
            info,
            "1.2.3.4:13500".parse().unwrap(),
            false,
            &[ChannelDescriptor::new(0x30, 1).with_send_queue_capacity(1)],
            Arc::new(HashMap::new()),
            sw.failures_tx.clone(),
            config,
        );
        sw.peers.add(peer.clone()).unwrap();
        sw.add_inbound_con(peer.remote_ip());
        peer.start();
        (peer, far)
    }

    async fn started_switch() -> Arc<Switch> {
        let sw = switch_with(P2pConfig {
            listen_address: "127.0.0.1:0".into(),
            ..P2pConfig::default()
        });
        sw.start().await.unwrap();
        sw
    }

    async fn wait_removed(sw: &Switch, id: &NodeId) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while sw.peers.has_id(id) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("peer should be removed");
    }

    struct Silent(Vec<u8>);

    impl Reactor for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        fn channels(&self) -> Vec<ChannelDescriptor> {
            self.0.iter().map(|id| ChannelDescriptor::new(*id, 1)).collect()
        }

        fn add_peer(&self, _peer: Arc<Peer>) {}

        fn remove_peer(&self, _peer: &Arc<Peer>, _reason: &str) {}

        fn receive(&self, _channel: u8, _peer: &Arc<Peer>, _msg: Vec<u8>) {}
    }

    // -- Tests ---

    #[test]
    fn test_eleventh_attempt_in_window_is_refused() {
        let sw = switch_with(P2pConfig::default());
        let wan: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..MAX_INBOUND_PER_IP {
            assert!(sw.admit_inbound(wan).is_ok());
            sw.add_inbound_con(wan);
        }
        assert!(matches!(
            sw.admit_inbound(wan),
            Err(P2pError::InboundLimit { count: MAX_INBOUND_PER_IP, .. })
        ));

        let other: IpAddr = "5.6.7.8".parse().unwrap();
        assert!(sw.admit_inbound(other).is_ok());

        let lan: IpAddr = "192.168.0.7".parse().unwrap();
        for _ in 0..20 {
            assert!(sw.check_inbound_conn(lan).is_ok());
        }
    }

    #[test]
    fn test_attempts_count_even_without_live_peers() {
        let sw = switch_with(P2pConfig::default());
        let wan: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..MAX_INBOUND_PER_IP {
            assert!(sw.check_inbound_conn(wan).is_ok());
        }
        assert!(matches!(sw.check_inbound_conn(wan), Err(P2pError::InboundLimit { .. })));
    }

    #[test]
    fn test_expired_window_resets_attempts() {
        let config = P2pConfig {
            inbound_throttle_secs: 0,
            ..P2pConfig::default()
        };
        let sw = switch_with(config);
        let wan: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..MAX_INBOUND_PER_IP * 2 {
            assert!(sw.check_inbound_conn(wan).is_ok());
        }
    }

    #[test]
    fn test_inbound_counter_limits_wan_ips() {
        let config = P2pConfig {
            inbound_throttle_secs: 0,
            ..P2pConfig::default()
        };
        let sw = switch_with(config);
        let wan: IpAddr = "1.2.3.4".parse().unwrap();
        for _ in 0..MAX_INBOUND_PER_IP {
            assert!(sw.check_inbound_conn(wan).is_ok());
            sw.add_inbound_con(wan);
        }
        assert!(matches!(
            sw.check_inbound_conn(wan),
            Err(P2pError::InboundLimit { count: MAX_INBOUND_PER_IP, .. })
        ));

        sw.sub_inbound_con(wan);
        assert!(sw.check_inbound_conn(wan).is_ok());
    }

    #[test]
    fn test_blacklist_is_idempotent_and_expires() {
        let config = P2pConfig {
            blacklist_timeout_secs: 0,
            ..P2pConfig::default()
        };
        let expiring = switch_with(config);
        let id = NodeId::random();
        expiring.mark_bad_node(id);
        assert!(!expiring.is_blacklisted(&id));

        let sw = switch_with(P2pConfig::default());
        sw.mark_bad_node(id);
        let first = sw.bad_nodes.lock()[&id];
        sw.mark_bad_node(id);
        assert_eq!(sw.bad_nodes.lock()[&id], first);
        assert!(sw.is_blacklisted(&id));
    }

    #[tokio::test]
    async fn test_send_timeout_removes_peer() {
        let sw = started_switch().await;
        let config = MConnConfig {
            send_timeout: Duration::from_millis(50),
            ..MConnConfig::default()
        };
        let (peer, _far) = attach_peer(&sw, config);

        let big = Bytes::from(vec![0u8; 64 * 1024]);
        let mut queued = 0;
        while peer.send(0x30, big.clone()).await {
            queued += 1;
            assert!(queued < 10, "queue never filled");
        }
        wait_removed(&sw, &peer.id()).await;
        assert_eq!(sw.inbound_count(peer.remote_ip()), 0);
        assert!(!sw.is_blacklisted(&peer.id()));
        sw.stop().await;
    }

    #[tokio::test]
    async fn test_protocol_violation_blacklists_peer() {
        let sw = started_switch().await;
        let (peer, mut far) = attach_peer(&sw, MConnConfig::default());

        write_packet(&mut far, &Packet::msg(0x31, true, b"x".to_vec())).await.unwrap();
        far.flush().await.unwrap();
        wait_removed(&sw, &peer.id()).await;
        assert!(sw.is_blacklisted(&peer.id()));
        sw.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_reports_failed_sends() {
        let sw = started_switch().await;
        let (peer, _far) = attach_peer(&sw, MConnConfig::default());

        let mut results = sw.broadcast(0x31, Bytes::from_static(b"x"));
        assert_eq!(results.recv().await, Some(false));
        assert_eq!(results.recv().await, None);

        let mut results = sw.broadcast_except(0x30, &peer.id(), Bytes::from_static(b"x"));
        assert_eq!(results.recv().await, None);
        sw.stop().await;
    }

    #[test]
    fn test_add_reactor_records_channels() {
        let sw = switch_with(P2pConfig::default());
        sw.add_reactor(Arc::new(Silent(vec![0x30, 0x31])));
        assert_eq!(sw.local_info().channels, vec![0x30, 0x31]);
        assert!(sw.reactor("silent").is_some());
    }

    #[test]
    #[should_panic(expected = "multiple reactors")]
    fn test_duplicate_channel_panics() {
        let sw = switch_with(P2pConfig::default());
        sw.add_reactor(Arc::new(Silent(vec![0x30])));
        sw.add_reactor(Arc::new(Silent(vec![0x30])));
    }

    #[test]
    fn test_invalid_dial_list_rejected() {
        let config = P2pConfig {
            dial_blacklist: vec!["10.0.0.0/40".into()],
            ..P2pConfig::default()
        };
        assert!(Switch::new(NodeKey::generate(), config, template()).is_err());
    }

    #[tokio::test]
    async fn test_add_dial_skips_blacklisted_and_self() {
        let config = P2pConfig {
            dial_blacklist: vec!["10.0.0.0/8".into()],
            ..P2pConfig::default()
        };
        let sw = switch_with(config);
        let blocked: Node = format!("{}@10.1.2.3:13500", NodeId::random().to_hex()).parse().unwrap();
        assert!(!sw.add_dial(&blocked).await);
        assert!(!sw.is_dialing(&blocked.endpoint.tcp_addr()));

        let me: Node = format!("{}@8.8.8.8:13500", sw.node_id().to_hex()).parse().unwrap();
        assert!(!sw.add_dial(&me).await);
    }

    #[test]
    fn test_seed_nodes_skip_malformed() {
        let id = NodeId::random();
        let config = P2pConfig {
            seeds: vec![format!("{}@1.2.3.4:13500:13501", id.to_hex()), "garbage".into()],
            ..P2pConfig::default()
        };
        let seeds = config.seed_nodes();
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, id);
        assert_eq!(seeds[0].endpoint.udp_port, 13501);
    }
}
