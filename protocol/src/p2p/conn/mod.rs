//! # Multiplexed Connection
//!
//! One TCP stream per peer carries many logical channels. Messages are cut
//! into frames of at most `max_packet_payload` bytes and reassembled on the
//! other side. When several channels have data queued the sender picks the
//! one with the lowest `recently_sent / priority`, so busy low-priority
//! channels cannot starve the rest.
//!
//! ## Frames
//!
//! | Packet | Contents                          |
//! |--------|-----------------------------------|
//! | `Ping` | keepalive request                 |
//! | `Pong` | keepalive reply                   |
//! | `Msg`  | channel id, eof flag, payload     |

pub mod connection;
pub mod packet;
pub mod throttle;

pub use connection::{
    ChannelDescriptor, ChannelStatus, ConnHandler, ConnectionStatus, MConnConfig, MConnection,
};
pub use packet::Packet;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decode failed: {0}")]
    Decode(#[from] bincode::Error),

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("unknown channel {0:#04x}")]
    UnknownChannel(u8),

    #[error("message of {size} bytes on channel {channel:#04x} exceeds limit")]
    MessageTooLarge { channel: u8, size: usize },

    #[error("pong timeout")]
    PongTimeout,

    #[error("send on channel {0:#04x} timed out")]
    SendTimeout(u8),
}

impl ConnError {
    /// Errors only a misbehaving remote can cause, as opposed to a slow or
    /// broken link.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ConnError::Decode(_)
                | ConnError::FrameTooLarge(_)
                | ConnError::UnknownChannel(_)
                | ConnError::MessageTooLarge { .. }
        )
    }
}
