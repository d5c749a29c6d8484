//! Frame codec for the multiplexed connection.
//!
//! A frame is a big-endian `u32` length followed by a bincode-encoded
//! [`Packet`]. Ping and pong are bare tags, so they stay a few bytes long.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ConnError;

/// Bincode overhead on top of the payload of a `Msg` frame: enum tag,
/// channel, eof flag and the payload length prefix.
pub const MSG_OVERHEAD: usize = 4 + 1 + 1 + 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    Ping,
    Pong,
    Msg { channel: u8, eof: bool, data: Vec<u8> },
}

impl Packet {
    pub fn msg(channel: u8, eof: bool, data: Vec<u8>) -> Self {
        Packet::Msg { channel, eof, data }
    }
}

/// Largest encoded frame body accepted for a given payload limit.
pub fn max_frame_size(max_payload: usize) -> usize {
    max_payload + MSG_OVERHEAD
}

/// Writes one frame without flushing. Returns the number of bytes written.
pub async fn write_packet<W>(w: &mut W, packet: &Packet) -> Result<usize, ConnError>
where
    W: AsyncWrite + Unpin,
{
    let body = bincode::serialize(packet)?;
    let len = u32::try_from(body.len()).map_err(|_| ConnError::FrameTooLarge(body.len()))?;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&body).await?;
    Ok(4 + body.len())
}

/// Reads one frame. Frames longer than `max_frame` are rejected before the
/// body is read.
pub async fn read_packet<R>(r: &mut R, max_frame: usize) -> Result<(Packet, usize), ConnError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame {
        return Err(ConnError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    let packet = bincode::deserialize(&body)?;
    Ok((packet, 4 + len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_msg_frame_fits_overhead() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let packet = Packet::msg(0x30, true, vec![7u8; 1024]);
        let written = write_packet(&mut a, &packet).await.unwrap();
        assert_eq!(written, 4 + max_frame_size(1024));

        let (got, read) = read_packet(&mut b, max_frame_size(1024)).await.unwrap();
        assert_eq!(got, packet);
        assert_eq!(read, written);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_packet(&mut a, &Packet::msg(1, true, vec![0u8; 200])).await.unwrap();
        let err = read_packet(&mut b, max_frame_size(100)).await.unwrap_err();
        assert!(matches!(err, ConnError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn test_ping_is_small() {
        let (mut a, _b) = tokio::io::duplex(64);
        assert!(write_packet(&mut a, &Packet::Ping).await.unwrap() <= 8);
    }
}
