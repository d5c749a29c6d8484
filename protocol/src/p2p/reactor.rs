//! Plug-in point for protocols that run over peer connections.

use async_trait::async_trait;
use std::sync::Arc;

use super::error::P2pResult;
use super::peer::Peer;
pub use super::conn::ChannelDescriptor;

/// A protocol bound to a set of channels.
///
/// The switch owns every peer. Reactors get shared handles in `add_peer`
/// and must drop them in `remove_peer`; by then the peer is already out of
/// the peer set. `receive` runs on the peer's read task and must not block.
#[async_trait]
pub trait Reactor: Send + Sync {
    fn name(&self) -> &str;

    fn channels(&self) -> Vec<ChannelDescriptor>;

    async fn start(&self) -> P2pResult<()> {
        Ok(())
    }

    async fn stop(&self) {}

    fn add_peer(&self, peer: Arc<Peer>);

    fn remove_peer(&self, peer: &Arc<Peer>, reason: &str);

    fn receive(&self, channel: u8, peer: &Arc<Peer>, msg: Vec<u8>);
}
