//! A connected, handshaken remote node.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::warn;

use super::conn::{ChannelDescriptor, ConnError, ConnHandler, ConnectionStatus, MConnConfig, MConnection};
use super::node::NodeId;
use super::node_info::NodeInfo;
use super::reactor::Reactor;

pub(crate) type ReactorMap = Arc<HashMap<u8, Arc<dyn Reactor>>>;

/// Sent to the switch when a peer's connection breaks.
pub(crate) struct PeerFailure {
    pub peer: Weak<Peer>,
    pub reason: String,
    /// The remote broke the protocol and should be blacklisted.
    pub misbehaved: bool,
}

struct PeerHandler {
    peer: Weak<Peer>,
    reactors: ReactorMap,
    failures: mpsc::UnboundedSender<PeerFailure>,
}

impl PeerHandler {
    fn fail(&self, reason: String, misbehaved: bool) {
        let _ = self.failures.send(PeerFailure {
            peer: self.peer.clone(),
            reason,
            misbehaved,
        });
    }
}

impl ConnHandler for PeerHandler {
    fn on_receive(&self, channel: u8, msg: Vec<u8>) {
        let Some(peer) = self.peer.upgrade() else {
            return;
        };
        match self.reactors.get(&channel) {
            Some(reactor) => reactor.receive(channel, &peer, msg),
            None => {
                warn!(peer = %peer.id.short(), channel, "message on channel without reactor");
                self.fail(format!("unknown channel {channel:#04x}"), true);
            }
        }
    }

    fn on_error(&self, err: ConnError) {
        self.fail(err.to_string(), err.is_protocol_violation());
    }
}

pub struct Peer {
    id: NodeId,
    info: NodeInfo,
    remote_addr: SocketAddr,
    outbound: bool,
    conn: MConnection,
}

impl Peer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<S>(
        stream: S,
        info: NodeInfo,
        remote_addr: SocketAddr,
        outbound: bool,
        descriptors: &[ChannelDescriptor],
        reactors: ReactorMap,
        failures: mpsc::UnboundedSender<PeerFailure>,
        config: MConnConfig,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Arc::new_cyclic(|weak| {
            let handler = PeerHandler {
                peer: weak.clone(),
                reactors,
                failures,
            };
            Peer {
                id: info.id(),
                info,
                remote_addr,
                outbound,
                conn: MConnection::new(stream, descriptors, Arc::new(handler), config),
            }
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_addr.ip()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn status(&self) -> ConnectionStatus {
        self.conn.status()
    }

    /// Blocks up to the send timeout for queue room.
    pub async fn send(&self, channel: u8, msg: impl Into<Bytes>) -> bool {
        self.conn.send(channel, msg).await
    }

    pub fn try_send(&self, channel: u8, msg: impl Into<Bytes>) -> bool {
        self.conn.try_send(channel, msg)
    }

    pub fn can_send(&self, channel: u8) -> bool {
        self.conn.can_send(channel)
    }

    pub fn is_running(&self) -> bool {
        self.conn.is_running()
    }

    pub(crate) fn start(&self) {
        self.conn.start();
    }

    pub(crate) fn stop(&self) {
        self.conn.stop();
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.outbound { "out" } else { "in" };
        write!(f, "Peer{{{}@{} {dir}}}", self.id.short(), self.remote_addr)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::config::{DEFAULT_NETWORK, PROTOCOL_VERSION};
    use crate::crypto::NodeKey;
    use crate::p2p::profile::NodeRole;

    pub fn node_info(key: &NodeKey, listen: &str, local_addrs: Vec<String>) -> NodeInfo {
        NodeInfo {
            pub_key: key.public_key(),
            network: DEFAULT_NETWORK.into(),
            version: PROTOCOL_VERSION.into(),
            channels: vec![0x30],
            moniker: "test".into(),
            role: NodeRole::Peer,
            listen_addr: listen.into(),
            local_addrs,
        }
    }

    /// An unstarted peer over an in-memory pipe. The other end is returned
    /// so the pipe stays open.
    pub fn detached_peer(info: NodeInfo, remote: &str, outbound: bool) -> (Arc<Peer>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = Peer::new(
            a,
            info,
            remote.parse().unwrap(),
            outbound,
            &[ChannelDescriptor::new(0x30, 1)],
            Arc::new(HashMap::new()),
            tx,
            MConnConfig::default(),
        );
        (peer, b)
    }
}
