//! Logical channels and the transport seam.
//!
//! The replication pipeline only ever polls: `send` never blocks and
//! `receive` returns `None` once a channel is drained for this tick.

use netsync_core::ConnectionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery class of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelType {
    /// Ordered and delivered: structural events and reliable components.
    Reliable = 0,
    /// Best effort: high-frequency deltas and inputs.
    Unreliable = 1,
}

impl ChannelType {
    /// Drain order: reliable first so structure is never stale.
    pub const DRAIN_ORDER: [ChannelType; 2] = [ChannelType::Reliable, ChannelType::Unreliable];

    /// Check if this channel type uses reliable delivery.
    pub fn is_reliable(&self) -> bool {
        matches!(self, ChannelType::Reliable)
    }

    /// Pick the channel for a message.
    pub fn select(reliable: bool) -> Self {
        if reliable {
            ChannelType::Reliable
        } else {
            ChannelType::Unreliable
        }
    }
}

impl TryFrom<u8> for ChannelType {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChannelType::Reliable),
            1 => Ok(ChannelType::Unreliable),
            other => Err(TransportError::InvalidChannel(other)),
        }
    }
}

/// Destination of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendTarget {
    /// A single peer.
    Connection(ConnectionId),
    /// Every connected peer.
    Broadcast,
}

/// Transport failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The destination is not connected.
    #[error("peer {0} is not connected")]
    UnknownPeer(ConnectionId),
    /// The local endpoint was shut down.
    #[error("endpoint is closed")]
    Closed,
    /// Channel byte outside the known range.
    #[error("invalid channel type: {0}")]
    InvalidChannel(u8),
}

/// Non-blocking datagram transport with two logical channels.
pub trait Transport {
    /// Connection id of this endpoint.
    fn local_id(&self) -> ConnectionId;

    /// Queue bytes for delivery.
    fn send(
        &mut self,
        channel: ChannelType,
        target: SendTarget,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Next received datagram on `channel`, with its sender.
    fn receive(&mut self, channel: ChannelType) -> Option<(ConnectionId, Vec<u8>)>;
}
