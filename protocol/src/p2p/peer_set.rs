//! The set of live peers, keyed by node id, with an address index for
//! spotting duplicate connections.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::error::{P2pError, P2pResult};
use super::node::NodeId;
use super::peer::Peer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AddrOwner {
    Local,
    Peer(NodeId),
}

#[derive(Default)]
struct Inner {
    lookup: HashMap<NodeId, Arc<Peer>>,
    list: Vec<Arc<Peer>>,
    /// `ip:port` strings we know belong to a peer or to ourselves.
    addrs: HashMap<String, AddrOwner>,
}

pub struct PeerSet {
    max: usize,
    inner: Mutex<Inner>,
}

impl PeerSet {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn add(&self, peer: Arc<Peer>) -> P2pResult<()> {
        let mut inner = self.inner.lock();
        let id = peer.id();
        if inner.lookup.contains_key(&id) {
            return Err(P2pError::DuplicatePeerId(id));
        }
        if inner.list.len() >= self.max {
            return Err(P2pError::TooManyPeers);
        }
        let info = peer.info();
        if !info.listen_addr.is_empty() {
            inner.addrs.insert(info.listen_addr.clone(), AddrOwner::Peer(id));
        }
        for addr in &info.local_addrs {
            inner.addrs.insert(addr.clone(), AddrOwner::Peer(id));
        }
        inner.list.push(peer.clone());
        inner.lookup.insert(id, peer);
        Ok(())
    }

    /// Registers our own addresses so we never dial ourselves.
    pub fn add_our_address(&self, listen_addr: &str, local_addrs: &[String]) {
        let mut inner = self.inner.lock();
        if !listen_addr.is_empty() {
            inner.addrs.insert(listen_addr.to_string(), AddrOwner::Local);
        }
        for addr in local_addrs {
            inner.addrs.insert(addr.clone(), AddrOwner::Local);
        }
    }

    /// Remembers that `addr` reached an already-connected peer.
    pub fn record_conn_addr(&self, addr: String, id: NodeId) {
        self.inner.lock().addrs.insert(addr, AddrOwner::Peer(id));
    }

    pub fn has_id(&self, id: &NodeId) -> bool {
        self.inner.lock().lookup.contains_key(id)
    }

    /// True for addresses of connected peers and our own addresses.
    pub fn has_addr(&self, addr: &str) -> bool {
        self.inner.lock().addrs.contains_key(addr)
    }

    pub fn get_by_id(&self, id: &NodeId) -> Option<Arc<Peer>> {
        self.inner.lock().lookup.get(id).cloned()
    }

    pub fn get_by_addr(&self, addr: &str) -> Option<Arc<Peer>> {
        let inner = self.inner.lock();
        match inner.addrs.get(addr)? {
            AddrOwner::Peer(id) => inner.lookup.get(id).cloned(),
            AddrOwner::Local => None,
        }
    }

    /// Removes `peer` if this exact instance is in the set. Returns whether
    /// it was.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut inner = self.inner.lock();
        let id = peer.id();
        match inner.lookup.get(&id) {
            Some(current) if Arc::ptr_eq(current, peer) => {}
            _ => return false,
        }
        inner.lookup.remove(&id);
        inner.list.retain(|p| p.id() != id);
        inner.addrs.retain(|_, owner| *owner != AddrOwner::Peer(id));
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot in insertion order.
    pub fn list(&self) -> Vec<Arc<Peer>> {
        self.inner.lock().list.clone()
    }
}
