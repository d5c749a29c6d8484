//! # Discovery Transport
//!
//! Request/response RPC over a single UDP socket. Two tasks run per
//! transport:
//!
//! - the **read loop** decodes datagrams and dispatches them by kind;
//! - the **matcher loop** owns the queue of pending replies. Requests
//!   register a matcher keyed by `(node id, ip, expected kind)` before the
//!   request leaves the socket; incoming replies are offered to every
//!   matching entry, whose callback decides whether the reply was
//!   acceptable and whether more replies are still expected.
//!
//! Registration and replies share one ordered channel into the matcher
//! loop, so a matcher is always in place before any reply to its request
//! can be looked at.
//!
//! ## Endpoint Proof
//!
//! `findnode` is only answered for senders that answered one of our pings
//! from the same IP within the bond window. Before sending `findnode`
//! ourselves we make sure the remote has seen a recent ping from us.

use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Instant, SystemTime};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::db::PeerDb;
use super::packet::{
    decode, encode, expiration_in, is_expired, max_neighbors, FindNode, Neighbors, Packet,
    PacketError, PacketKind, Ping, Pong, RpcEndpoint, RpcNode,
};
use crate::config::{
    BOND_EXPIRATION, BUCKET_SIZE, DISCOVERY_PING_VERSION, MAX_FINDNODE_FAILURES,
    NTP_FAILURE_THRESHOLD, UDP_MAX_PACKET_SIZE, UDP_PACKET_EXPIRATION, UDP_RESPONSE_TIMEOUT,
};
use crate::crypto::NodeKey;
use crate::p2p::netutil::check_relay_ip;
use crate::p2p::node::{Endpoint, Node, NodeId};

const NTP_WARNING_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(10 * 60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum UdpError {
    #[error("expired")]
    Expired,

    #[error("unsolicited reply")]
    UnsolicitedReply,

    #[error("unknown node")]
    UnknownNode,

    #[error("RPC timeout")]
    Timeout,

    #[error("reply deadline too far in the future")]
    ClockWarp,

    #[error("socket closed")]
    Closed,

    #[error("invalid neighbor: {0}")]
    InvalidNeighbor(String),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// NodeSink
// ---------------------------------------------------------------------------

/// What the transport needs from the routing table.
pub trait NodeSink: Send + Sync {
    /// A node proved it owns its endpoint.
    fn add_verified_node(&self, node: Node);

    /// Up to `n` nodes closest to `target` that passed at least one
    /// liveness check.
    fn closest_live(&self, target: &NodeId, n: usize) -> Vec<Node>;
}

// ---------------------------------------------------------------------------
// Matcher loop types
// ---------------------------------------------------------------------------

type MatchFn = Box<dyn FnMut(&Packet) -> (bool, bool) + Send>;
type ReplyResult = Result<Option<Packet>, UdpError>;

struct ReplyMatcher {
    from: NodeId,
    ip: IpAddr,
    kind: PacketKind,
    deadline: Instant,
    /// Returns `(matched, request_done)`.
    callback: MatchFn,
    done: oneshot::Sender<ReplyResult>,
}

struct IncomingReply {
    from: NodeId,
    ip: IpAddr,
    packet: Packet,
    matched: oneshot::Sender<bool>,
}

enum LoopEvent {
    AddMatcher(ReplyMatcher),
    Reply(IncomingReply),
}

/// v4-mapped v6 addresses compare equal to their v4 form.
fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

// ---------------------------------------------------------------------------
// Udp
// ---------------------------------------------------------------------------

pub struct Udp {
    socket: Arc<UdpSocket>,
    key: NodeKey,
    local: RwLock<Node>,
    db: Arc<PeerDb>,
    sink: OnceLock<Weak<dyn NodeSink>>,
    events: mpsc::UnboundedSender<LoopEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<LoopEvent>>>,
    closing: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Udp {
    /// Binds the discovery socket. `tcp_port` is advertised alongside the
    /// socket's own address.
    pub async fn bind(
        addr: SocketAddr,
        tcp_port: u16,
        key: NodeKey,
        db: Arc<PeerDb>,
    ) -> Result<Arc<Self>, UdpError> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        let local = Node::new(
            key.node_id(),
            Endpoint::new(local_addr.ip(), local_addr.port(), tcp_port),
        );
        let (events, events_rx) = mpsc::unbounded_channel();
        let (closing, _) = watch::channel(false);
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            key,
            local: RwLock::new(local),
            db,
            sink: OnceLock::new(),
            events,
            events_rx: Mutex::new(Some(events_rx)),
            closing,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_node(&self) -> Node {
        self.local.read().clone()
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UdpError> {
        Ok(self.socket.local_addr()?)
    }

    /// Replaces the IP advertised in pings and pongs.
    pub fn set_advertised_ip(&self, ip: IpAddr) {
        self.local.write().endpoint.ip = ip;
    }

    /// Starts the read and matcher loops. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>, sink: Weak<dyn NodeSink>) {
        let Some(rx) = self.events_rx.lock().take() else {
            return;
        };
        let _ = self.sink.set(sink);

        let matcher = tokio::spawn(run_matcher_loop(rx, self.closing.subscribe()));
        let reader = tokio::spawn(Arc::clone(self).read_loop(self.closing.subscribe()));
        self.tasks.lock().extend([matcher, reader]);
    }

    /// Stops both loops and fails every pending request with `Closed`.
    pub async fn close(&self) {
        self.closing.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    fn sink(&self) -> Option<Arc<dyn NodeSink>> {
        self.sink.get().and_then(Weak::upgrade)
    }

    // -- Sending ------------------------------------------------------------

    async fn send(&self, to: SocketAddr, to_id: &NodeId, packet: &Packet) -> Result<[u8; 32], UdpError> {
        let (buf, hash) = encode(&self.key, packet)?;
        self.write(to, to_id, packet.name(), &buf).await?;
        Ok(hash)
    }

    async fn write(&self, to: SocketAddr, to_id: &NodeId, what: &str, buf: &[u8]) -> Result<(), UdpError> {
        let res = self.socket.send_to(buf, to).await;
        trace!(id = %to_id.short(), addr = %to, ok = res.is_ok(), ">> {what}");
        res?;
        Ok(())
    }

    /// Registers a reply matcher. The returned receiver yields once the
    /// callback reports completion, the deadline passes, or the transport
    /// closes.
    fn pending(&self, from: NodeId, ip: IpAddr, kind: PacketKind, callback: MatchFn) -> oneshot::Receiver<ReplyResult> {
        let (done, rx) = oneshot::channel();
        let matcher = ReplyMatcher {
            from,
            ip: canonical_ip(ip),
            kind,
            deadline: Instant::now() + UDP_RESPONSE_TIMEOUT,
            callback,
            done,
        };
        if let Err(mpsc::error::SendError(LoopEvent::AddMatcher(m))) =
            self.events.send(LoopEvent::AddMatcher(matcher))
        {
            let _ = m.done.send(Err(UdpError::Closed));
        }
        rx
    }

    /// Offers a reply to the matcher loop. Returns whether any pending
    /// request accepted it.
    async fn handle_reply(&self, from: NodeId, ip: IpAddr, packet: Packet) -> bool {
        let (matched, rx) = oneshot::channel();
        let reply = IncomingReply {
            from,
            ip: canonical_ip(ip),
            packet,
            matched,
        };
        if self.events.send(LoopEvent::Reply(reply)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    fn make_ping(&self, to: SocketAddr) -> Packet {
        let local = self.local.read();
        Packet::Ping(Ping {
            version: DISCOVERY_PING_VERSION,
            from: RpcEndpoint {
                ip: local.endpoint.ip,
                udp: local.endpoint.udp_port,
                tcp: local.endpoint.tcp_port,
            },
            to: RpcEndpoint::from_addr(to, 0),
            expiration: expiration_in(UDP_PACKET_EXPIRATION.as_secs()),
        })
    }

    /// Sends a ping and registers a matcher for the pong echoing its hash.
    /// `on_pong` runs inside the matcher loop when the pong arrives.
    async fn send_ping(
        &self,
        to_id: NodeId,
        to: SocketAddr,
        on_pong: Option<Box<dyn FnOnce() + Send>>,
    ) -> oneshot::Receiver<ReplyResult> {
        let packet = self.make_ping(to);
        let (buf, hash) = match encode(&self.key, &packet) {
            Ok(v) => v,
            Err(e) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(e.into()));
                return rx;
            }
        };
        let mut on_pong = on_pong;
        let rx = self.pending(
            to_id,
            to.ip(),
            PacketKind::Pong,
            Box::new(move |p| {
                let matched = matches!(p, Packet::Pong(pong) if pong.reply_tok == hash);
                if matched {
                    if let Some(cb) = on_pong.take() {
                        cb();
                    }
                }
                (matched, matched)
            }),
        );
        if let Err(e) = self.write(to, &to_id, packet.name(), &buf).await {
            debug!(addr = %to, error = %e, "ping write failed");
        }
        rx
    }

    // -- RPCs ---------------------------------------------------------------

    /// Pings `node` and waits for its pong.
    pub async fn ping(&self, node: &Node) -> Result<Pong, UdpError> {
        let rx = self.send_ping(node.id, node.endpoint.udp_addr(), None).await;
        match rx.await {
            Ok(Ok(Some(Packet::Pong(pong)))) => Ok(pong),
            Ok(Ok(_)) => Err(UdpError::Timeout),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(UdpError::Closed),
        }
    }

    /// Asks `to` for the nodes closest to `target`.
    ///
    /// Collects neighbors until [`BUCKET_SIZE`] have arrived or the reply
    /// deadline passes. A timeout after some nodes arrived still returns
    /// what was received.
    pub async fn find_node(&self, to: &Node, target: NodeId) -> Result<Vec<Node>, UdpError> {
        let addr = to.endpoint.udp_addr();
        self.ensure_bond(to.id, addr).await;

        let nodes = Arc::new(Mutex::new(Vec::with_capacity(BUCKET_SIZE)));
        let collected = Arc::clone(&nodes);
        let mut received = 0usize;
        let sender_ip = addr.ip();
        let rx = self.pending(
            to.id,
            sender_ip,
            PacketKind::Neighbors,
            Box::new(move |p| {
                let Packet::Neighbors(reply) = p else {
                    return (false, false);
                };
                for rn in &reply.nodes {
                    received += 1;
                    match node_from_rpc(&sender_ip, *rn) {
                        Ok(n) => collected.lock().push(n),
                        Err(e) => debug!(id = %rn.id.short(), ip = %rn.ip, error = %e, "invalid neighbor"),
                    }
                }
                (true, received >= BUCKET_SIZE)
            }),
        );

        let req = Packet::FindNode(FindNode {
            target,
            expiration: expiration_in(UDP_PACKET_EXPIRATION.as_secs()),
        });
        if let Err(e) = self.send(addr, &to.id, &req).await {
            debug!(addr = %addr, error = %e, "findnode write failed");
        }

        let outcome = rx.await.unwrap_or(Err(UdpError::Closed));
        let nodes = std::mem::take(&mut *nodes.lock());
        match outcome {
            Ok(_) => Ok(nodes),
            Err(UdpError::Closed) => Err(UdpError::Closed),
            Err(e) if nodes.is_empty() => Err(e),
            Err(_) => Ok(nodes),
        }
    }

    /// Solicits a ping from `id` if it has not pinged us within the bond
    /// window, so the remote will answer our `findnode`.
    async fn ensure_bond(&self, id: NodeId, addr: SocketAddr) {
        let last_ping = self.db.last_ping_received(&id, &addr.ip());
        let too_old = SystemTime::now()
            .duration_since(last_ping)
            .map(|d| d > BOND_EXPIRATION)
            .unwrap_or(false);
        let fails = self.db.find_fails(&id, &addr.ip());
        if too_old || fails > MAX_FINDNODE_FAILURES {
            debug!(id = %id.short(), %addr, too_old, fails, "renewing bond");
            let rx = self.send_ping(id, addr, None).await;
            if let Ok(Err(e)) = rx.await {
                debug!(id = %id.short(), %addr, error = %e, "bond ping failed");
            }
            // Give the remote time to ping back and see our pong.
            tokio::time::sleep(UDP_RESPONSE_TIMEOUT).await;
        }
    }

    /// Whether `id` answered one of our pings from `ip` recently.
    fn check_bond(&self, id: &NodeId, ip: &IpAddr) -> bool {
        SystemTime::now()
            .duration_since(self.db.last_pong_received(id, ip))
            .map(|d| d < BOND_EXPIRATION)
            .unwrap_or(true)
    }

    // -- Receiving ----------------------------------------------------------

    async fn read_loop(self: Arc<Self>, mut closing: watch::Receiver<bool>) {
        let mut buf = vec![0u8; UDP_MAX_PACKET_SIZE];
        loop {
            tokio::select! {
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok((n, from)) => {
                        if let Err(e) = self.handle_packet(from, &buf[..n]).await {
                            debug!(addr = %from, error = %e, "bad discovery packet");
                        }
                    }
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms.
                        trace!(error = %e, "udp read error");
                    }
                },
                _ = closing.changed() => return,
            }
        }
    }

    /// Decodes and dispatches one datagram.
    pub async fn handle_packet(&self, from: SocketAddr, buf: &[u8]) -> Result<(), UdpError> {
        let decoded = decode(buf)?;
        let from_id = decoded.from_id;
        trace!(id = %from_id.short(), addr = %from, "<< {}", decoded.packet.name());
        if is_expired(decoded.packet.expiration()) {
            return Err(UdpError::Expired);
        }

        match decoded.packet {
            Packet::Ping(ping) => {
                self.handle_ping(from, from_id, decoded.hash, ping).await;
                Ok(())
            }
            packet @ Packet::Pong(_) => {
                if !self.handle_reply(from_id, from.ip(), packet).await {
                    return Err(UdpError::UnsolicitedReply);
                }
                if let Err(e) = self.db.update_last_pong_received(&from_id, &from.ip(), SystemTime::now()) {
                    warn!(error = %e, "failed to record pong");
                }
                Ok(())
            }
            Packet::FindNode(req) => {
                if !self.check_bond(&from_id, &from.ip()) {
                    return Err(UdpError::UnknownNode);
                }
                self.handle_find_node(from, from_id, req).await;
                Ok(())
            }
            packet @ Packet::Neighbors(_) => {
                if !self.handle_reply(from_id, from.ip(), packet).await {
                    return Err(UdpError::UnsolicitedReply);
                }
                Ok(())
            }
        }
    }

    async fn handle_ping(&self, from: SocketAddr, from_id: NodeId, hash: [u8; 32], ping: Ping) {
        let pong = Packet::Pong(Pong {
            my_node: RpcNode::from(&self.local_node()),
            reply_tok: hash,
            expiration: expiration_in(UDP_PACKET_EXPIRATION.as_secs()),
        });
        if let Err(e) = self.send(from, &from_id, &pong).await {
            debug!(addr = %from, error = %e, "pong write failed");
        }

        let node = Node::new(from_id, Endpoint::new(from.ip(), from.port(), ping.from.tcp));
        let stale = SystemTime::now()
            .duration_since(self.db.last_pong_received(&from_id, &from.ip()))
            .map(|d| d > BOND_EXPIRATION)
            .unwrap_or(false);
        if stale {
            // Ping back; only add once the sender proves its endpoint.
            let sink = self.sink.get().cloned();
            let _ = self
                .send_ping(
                    from_id,
                    from,
                    Some(Box::new(move || {
                        if let Some(sink) = sink.and_then(|w| w.upgrade()) {
                            sink.add_verified_node(node);
                        }
                    })),
                )
                .await;
        } else if let Some(sink) = self.sink() {
            sink.add_verified_node(node);
        }

        if let Err(e) = self.db.update_last_ping_received(&from_id, &from.ip(), SystemTime::now()) {
            warn!(error = %e, "failed to record ping");
        }
    }

    async fn handle_find_node(&self, from: SocketAddr, from_id: NodeId, req: FindNode) {
        let closest = self
            .sink()
            .map(|s| s.closest_live(&req.target, BUCKET_SIZE))
            .unwrap_or_default();

        let per_packet = max_neighbors();
        let relayable: Vec<RpcNode> = closest
            .iter()
            .filter(|n| check_relay_ip(&from.ip(), &n.ip()).is_ok())
            .map(RpcNode::from)
            .collect();

        let expiration = expiration_in(UDP_PACKET_EXPIRATION.as_secs());
        let mut chunks: Vec<&[RpcNode]> = relayable.chunks(per_packet).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        for chunk in chunks {
            let reply = Packet::Neighbors(Neighbors {
                nodes: chunk.to_vec(),
                expiration,
            });
            if let Err(e) = self.send(from, &from_id, &reply).await {
                debug!(addr = %from, error = %e, "neighbors write failed");
            }
        }
    }
}

fn node_from_rpc(sender: &IpAddr, rn: RpcNode) -> Result<Node, UdpError> {
    if rn.udp == 0 || rn.tcp == 0 {
        return Err(UdpError::InvalidNeighbor("missing port".into()));
    }
    check_relay_ip(sender, &rn.ip).map_err(|e| UdpError::InvalidNeighbor(e.to_string()))?;
    let node = Node::from(rn);
    node.validate_complete().map_err(UdpError::InvalidNeighbor)?;
    Ok(node)
}

// ---------------------------------------------------------------------------
// Matcher loop
// ---------------------------------------------------------------------------

/// Counts consecutive reply timeouts. A long run of them usually means
/// our clock is off and every packet we send looks expired.
#[derive(Default)]
struct ClockWatch {
    cont_timeouts: u32,
    warned_at: Option<Instant>,
}

impl ClockWatch {
    fn reply(&mut self) {
        self.cont_timeouts = 0;
    }

    /// Records `n` timeouts. Returns whether a clock warning was logged.
    fn timeouts(&mut self, n: u32) -> bool {
        self.cont_timeouts += n;
        if self.cont_timeouts <= NTP_FAILURE_THRESHOLD {
            return false;
        }
        let timeouts = self.cont_timeouts;
        self.cont_timeouts = 0;
        if self.warned_at.is_some_and(|t| t.elapsed() < NTP_WARNING_COOLDOWN) {
            return false;
        }
        self.warned_at = Some(Instant::now());
        warn!(timeouts, "many consecutive discovery timeouts, local clock may be off");
        true
    }
}

async fn run_matcher_loop(mut events: mpsc::UnboundedReceiver<LoopEvent>, mut closing: watch::Receiver<bool>) {
    let mut pending: VecDeque<ReplyMatcher> = VecDeque::new();
    let mut clock = ClockWatch::default();

    loop {
        // Drop matchers whose deadline is implausibly far out.
        let now = Instant::now();
        while let Some(front) = pending.front() {
            if front.deadline.saturating_duration_since(now) < 2 * UDP_RESPONSE_TIMEOUT {
                break;
            }
            if let Some(m) = pending.pop_front() {
                let _ = m.done.send(Err(UdpError::ClockWarp));
            }
        }
        let next_deadline = pending.iter().map(|m| m.deadline).min();
        let sleep = async {
            match next_deadline {
                Some(d) => tokio::time::sleep_until(d.into()).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = closing.changed() => {
                for m in pending.drain(..) {
                    let _ = m.done.send(Err(UdpError::Closed));
                }
                return;
            }
            event = events.recv() => match event {
                Some(LoopEvent::AddMatcher(mut m)) => {
                    m.deadline = Instant::now() + UDP_RESPONSE_TIMEOUT;
                    pending.push_back(m);
                }
                Some(LoopEvent::Reply(r)) => {
                    let mut matched = false;
                    let mut keep = VecDeque::with_capacity(pending.len());
                    for mut m in pending.drain(..) {
                        if m.from == r.from && m.kind == r.packet.kind() && m.ip == r.ip {
                            let (ok, done) = (m.callback)(&r.packet);
                            matched |= ok;
                            clock.reply();
                            if done {
                                let _ = m.done.send(Ok(Some(r.packet.clone())));
                                continue;
                            }
                        }
                        keep.push_back(m);
                    }
                    pending = keep;
                    let _ = r.matched.send(matched);
                }
                None => return,
            },
            _ = sleep => {
                let now = Instant::now();
                let mut keep = VecDeque::with_capacity(pending.len());
                let mut expired = 0u32;
                for m in pending.drain(..) {
                    if m.deadline <= now {
                        let _ = m.done.send(Err(UdpError::Timeout));
                        expired += 1;
                    } else {
                        keep.push_back(m);
                    }
                }
                pending = keep;
                clock.timeouts(expired);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    // -- Helpers ------------------------------------------------------------

    #[derive(Default)]
    struct RecordingSink {
        verified: Mutex<Vec<Node>>,
        closest: Mutex<Vec<Node>>,
    }

    impl NodeSink for RecordingSink {
        fn add_verified_node(&self, node: Node) {
            self.verified.lock().push(node);
        }

        fn closest_live(&self, _target: &NodeId, n: usize) -> Vec<Node> {
            self.closest.lock().iter().take(n).cloned().collect()
        }
    }

    async fn spawn_udp() -> (Arc<Udp>, Arc<RecordingSink>) {
        let db = Arc::new(PeerDb::open_temporary().unwrap());
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let udp = Udp::bind(addr, 30303, NodeKey::generate(), db).await.unwrap();
        let sink = Arc::new(RecordingSink::default());
        let weak: Weak<dyn NodeSink> = Arc::downgrade(&(sink.clone() as Arc<dyn NodeSink>));
        udp.start(weak);
        (udp, sink)
    }

    fn loopback_node(port_seed: u16) -> Node {
        Node::new(
            NodeId::random(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 40000 + port_seed, 41000 + port_seed),
        )
    }

    // -- Tests --------------------------------------------------------------

    #[tokio::test]
    async fn ping_pong_and_ping_back() {
        let (a, _sink_a) = spawn_udp().await;
        let (b, sink_b) = spawn_udp().await;

        let pong = a.ping(&b.local_node()).await.unwrap();
        assert_eq!(pong.my_node.id, b.local_node().id);

        // B pings A back before it accepts A as verified.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let verified = sink_b.verified.lock().clone();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].id, a.local_node().id);
        assert_eq!(verified[0].endpoint.tcp_port, 30303);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn ping_to_silent_port_times_out() {
        let (a, _) = spawn_udp().await;
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = Node::new(
            NodeId::random(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), silent.local_addr().unwrap().port(), 1),
        );
        assert!(matches!(a.ping(&target).await, Err(UdpError::Timeout)));
        a.close().await;
    }

    #[tokio::test]
    async fn find_node_returns_partial_neighbors() {
        let (a, _) = spawn_udp().await;
        let (b, sink_b) = spawn_udp().await;
        *sink_b.closest.lock() = (1..=3).map(loopback_node).collect();

        a.ping(&b.local_node()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let found = a.find_node(&b.local_node(), NodeId::random()).await.unwrap();
        assert_eq!(found.len(), 3);

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn find_node_without_bond_is_ignored() {
        let (a, _) = spawn_udp().await;
        let (b, sink_b) = spawn_udp().await;
        *sink_b.closest.lock() = vec![loopback_node(1)];

        // Bypass ensure_bond by sending the raw request.
        let req = Packet::FindNode(FindNode {
            target: NodeId::random(),
            expiration: expiration_in(20),
        });
        let (buf, _) = encode(&a.key, &req).unwrap();
        let from = a.local_addr().unwrap();
        assert!(matches!(
            b.handle_packet(from, &buf).await,
            Err(UdpError::UnknownNode)
        ));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn unsolicited_pong_is_rejected() {
        let (a, _) = spawn_udp().await;
        let (b, _) = spawn_udp().await;
        let pong = Packet::Pong(Pong {
            my_node: RpcNode::from(&a.local_node()),
            reply_tok: [7u8; 32],
            expiration: expiration_in(20),
        });
        let (buf, _) = encode(&a.key, &pong).unwrap();
        assert!(matches!(
            b.handle_packet(a.local_addr().unwrap(), &buf).await,
            Err(UdpError::UnsolicitedReply)
        ));
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn expired_packet_is_dropped() {
        let (a, _) = spawn_udp().await;
        let (b, _) = spawn_udp().await;
        let ping = Packet::Ping(Ping {
            version: DISCOVERY_PING_VERSION,
            from: RpcEndpoint::from_addr(a.local_addr().unwrap(), 1),
            to: RpcEndpoint::from_addr(b.local_addr().unwrap(), 0),
            expiration: 1,
        });
        let (buf, _) = encode(&a.key, &ping).unwrap();
        assert!(matches!(
            b.handle_packet(a.local_addr().unwrap(), &buf).await,
            Err(UdpError::Expired)
        ));
        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (a, _) = spawn_udp().await;
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = Node::new(
            NodeId::random(),
            Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), silent.local_addr().unwrap().port(), 1),
        );
        let a2 = Arc::clone(&a);
        let handle = tokio::spawn(async move { a2.ping(&target).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        a.close().await;
        assert!(matches!(handle.await.unwrap(), Err(UdpError::Closed)));
    }

    #[tokio::test]
    async fn close_right_after_start_returns() {
        let (a, _) = spawn_udp().await;
        tokio::time::timeout(Duration::from_secs(2), a.close())
            .await
            .expect("close should not wait on unstarted loops");
    }

    #[test]
    fn clock_warning_after_consecutive_timeouts() {
        let mut clock = ClockWatch::default();
        assert!(!clock.timeouts(NTP_FAILURE_THRESHOLD));
        clock.reply();
        assert!(!clock.timeouts(NTP_FAILURE_THRESHOLD));
        assert!(clock.timeouts(1));
        // Cooldown holds the next warning back.
        assert!(!clock.timeouts(NTP_FAILURE_THRESHOLD + 1));
        assert_eq!(clock.cont_timeouts, 0);
    }

    #[test]
    fn neighbor_validation() {
        let wan: IpAddr = "1.2.3.4".parse().unwrap();
        let good = RpcNode {
            ip: "5.6.7.8".parse().unwrap(),
            udp: 1,
            tcp: 2,
            id: NodeId::random(),
        };
        assert!(node_from_rpc(&wan, good).is_ok());
        assert!(node_from_rpc(&wan, RpcNode { tcp: 0, ..good }).is_err());
        assert!(node_from_rpc(&wan, RpcNode { ip: "10.0.0.1".parse().unwrap(), ..good }).is_err());
    }
}
