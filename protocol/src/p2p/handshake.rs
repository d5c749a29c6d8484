//! # Authenticated Handshake
//!
//! Runs on a fresh TCP stream before the multiplexed connection takes over:
//!
//! 1. Both sides send a 32-byte random challenge.
//! 2. Both sides send `bincode(NodeInfo)` with an Ed25519 signature over
//!    `keccak256(challenge_from_peer || bincode(NodeInfo))`.
//! 3. Each side checks the signature against the public key inside the
//!    received `NodeInfo`.
//!
//! A peer therefore cannot replay another node's `NodeInfo`, and the node id
//! we attach to the connection is backed by the key that signed our
//! challenge. Writes and reads run concurrently so neither side can stall
//! on a full socket buffer.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::node_info::NodeInfo;
use crate::config::MAX_NODE_INFO_SIZE;
use crate::crypto::{keccak256_concat, NodeKey, Signature};

const CHALLENGE_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out")]
    Timeout,

    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("node info of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("bad node info signature")]
    BadSignature,
}

#[derive(Serialize, Deserialize)]
struct SignedInfo {
    info: Vec<u8>,
    signature: Signature,
}

/// Exchanges `ours` for the peer's `NodeInfo`, giving up after `timeout`.
pub async fn handshake<S>(
    stream: &mut S,
    key: &NodeKey,
    ours: &NodeInfo,
    timeout: Duration,
) -> Result<NodeInfo, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, exchange(stream, key, ours))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn exchange<S>(stream: &mut S, key: &NodeKey, ours: &NodeInfo) -> Result<NodeInfo, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let mut my_challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut my_challenge);
    let mut their_challenge = [0u8; CHALLENGE_LEN];
    tokio::try_join!(
        async {
            writer.write_all(&my_challenge).await?;
            writer.flush().await
        },
        reader.read_exact(&mut their_challenge),
    )?;

    let info = bincode::serialize(ours)?;
    let signature = key.sign(&keccak256_concat(&[&their_challenge[..], &info[..]]));
    let out = bincode::serialize(&SignedInfo { info, signature })?;
    if out.len() > MAX_NODE_INFO_SIZE {
        return Err(HandshakeError::TooLarge(out.len()));
    }

    let (_, received) = tokio::try_join!(
        write_frame(&mut writer, &out),
        read_frame(&mut reader, MAX_NODE_INFO_SIZE),
    )?;

    let signed: SignedInfo = bincode::deserialize(&received)?;
    let theirs: NodeInfo = bincode::deserialize(&signed.info)?;
    let digest = keccak256_concat(&[&my_challenge[..], &signed.info[..]]);
    if !theirs.pub_key.verify(&digest, &signed.signature) {
        return Err(HandshakeError::BadSignature);
    }
    Ok(theirs)
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, body: &[u8]) -> Result<(), HandshakeError> {
    let len = u32::try_from(body.len()).map_err(|_| HandshakeError::TooLarge(body.len()))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(body).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, max: usize) -> Result<Vec<u8>, HandshakeError> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(HandshakeError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_NETWORK, PROTOCOL_VERSION};
    use crate::p2p::profile::NodeRole;

    fn info_for(key: &NodeKey, moniker: &str) -> NodeInfo {
        NodeInfo {
            pub_key: key.public_key(),
            network: DEFAULT_NETWORK.into(),
            version: PROTOCOL_VERSION.into(),
            channels: vec![0x30],
            moniker: moniker.into(),
            role: NodeRole::Peer,
            listen_addr: "127.0.0.1:13500".into(),
            local_addrs: vec![],
        }
    }

    #[tokio::test]
    async fn test_handshake_exchanges_info() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let (ka, kb) = (NodeKey::generate(), NodeKey::generate());
        let (ia, ib) = (info_for(&ka, "a"), info_for(&kb, "b"));
        let timeout = Duration::from_secs(2);

        let (ra, rb) = tokio::join!(
            handshake(&mut a, &ka, &ia, timeout),
            handshake(&mut b, &kb, &ib, timeout),
        );
        let got_b = ra.unwrap();
        let got_a = rb.unwrap();
        assert_eq!(got_b, ib);
        assert_eq!(got_a, ia);
        assert_eq!(got_b.id(), kb.node_id());
    }

    #[tokio::test]
    async fn test_forged_info_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let ka = NodeKey::generate();
        let victim = NodeKey::generate();
        let forger = NodeKey::generate();
        let timeout = Duration::from_secs(2);

        // Claims the victim's key but signs with its own.
        let forged = info_for(&victim, "mallory");
        let ia = info_for(&ka, "a");
        let (ra, _) = tokio::join!(
            handshake(&mut a, &ka, &ia, timeout),
            handshake(&mut b, &forger, &forged, timeout),
        );
        assert!(matches!(ra, Err(HandshakeError::BadSignature)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let (mut a, _b) = tokio::io::duplex(1024);
        let ka = NodeKey::generate();
        let res = handshake(&mut a, &ka, &info_for(&ka, "a"), Duration::from_millis(50)).await;
        assert!(matches!(res, Err(HandshakeError::Timeout)));
    }
}
