//! Typed message endpoint on top of a transport and a codec.

use crate::channel::{ChannelType, SendTarget, Transport, TransportError};
use crate::codec::{Codec, CodecError};
use crate::protocol::{Envelope, Message};
use netsync_core::ConnectionId;
use thiserror::Error;
use tracing::{trace, warn};

/// Failure to hand a message to the transport.
#[derive(Debug, Error)]
pub enum SendError {
    /// Encoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The transport refused the datagram.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Capability to send replication messages.
pub trait MessageSink {
    /// Send `message` on `channel` to `target`.
    fn send(
        &mut self,
        channel: ChannelType,
        target: SendTarget,
        message: &Message,
    ) -> Result<(), SendError>;
}

/// A decoded message with its origin.
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    /// Sending connection.
    pub from: ConnectionId,
    /// Channel the message arrived on.
    pub channel: ChannelType,
    /// Sender tick.
    pub tick: u64,
    /// Payload.
    pub message: Message,
}

/// Traffic counters of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages handed to the transport.
    pub messages_sent: u64,
    /// Encoded bytes handed to the transport.
    pub bytes_sent: u64,
    /// Messages decoded and accepted.
    pub messages_received: u64,
    /// Encoded bytes received.
    pub bytes_received: u64,
    /// Datagrams that failed to decode.
    pub decode_failures: u64,
    /// Messages that decoded but failed verification.
    pub invalid_messages: u64,
}

/// Endpoint that encodes outgoing and decodes incoming messages.
pub struct Connection {
    transport: Box<dyn Transport>,
    codec: Box<dyn Codec>,
    tick: u64,
    stats: ConnectionStats,
}

impl Connection {
    /// Wrap a transport endpoint with a codec.
    pub fn new(transport: Box<dyn Transport>, codec: Box<dyn Codec>) -> Self {
        Self {
            transport,
            codec,
            tick: 0,
            stats: ConnectionStats::default(),
        }
    }

    /// Connection id of the local endpoint.
    pub fn local_id(&self) -> ConnectionId {
        self.transport.local_id()
    }

    /// Stamp outgoing envelopes with `tick`.
    pub fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    /// Traffic counters so far.
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// Name of the codec in use.
    pub fn codec_name(&self) -> &'static str {
        self.codec.name()
    }

    /// Drain every pending message, reliable channel first.
    ///
    /// Undecodable or invalid datagrams are logged and dropped.
    pub fn drain(&mut self) -> Vec<Received> {
        let mut received = Vec::new();
        for channel in ChannelType::DRAIN_ORDER {
            while let Some((from, data)) = self.transport.receive(channel) {
                self.stats.bytes_received += data.len() as u64;
                let envelope = match self.codec.decode(&data) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        self.stats.decode_failures += 1;
                        warn!(%from, ?channel, error = %e, "dropping undecodable message");
                        continue;
                    }
                };
                if let Err(reason) = envelope.message.verify() {
                    self.stats.invalid_messages += 1;
                    warn!(%from, kind = envelope.message.kind(), reason, "dropping invalid message");
                    continue;
                }
                self.stats.messages_received += 1;
                trace!(%from, kind = envelope.message.kind(), ?channel, "received");
                received.push(Received {
                    from,
                    channel,
                    tick: envelope.tick,
                    message: envelope.message,
                });
            }
        }
        received
    }
}

impl MessageSink for Connection {
    fn send(
        &mut self,
        channel: ChannelType,
        target: SendTarget,
        message: &Message,
    ) -> Result<(), SendError> {
        let envelope = Envelope::new(self.tick, message.clone());
        let data = self.codec.encode(&envelope)?;
        self.transport.send(channel, target, &data)?;
        self.stats.messages_sent += 1;
        self.stats.bytes_sent += data.len() as u64;
        trace!(kind = message.kind(), ?channel, ?target, len = data.len(), "sent");
        Ok(())
    }
}

/// In-memory sink that records messages instead of sending them.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Recorded messages in send order.
    pub sent: Vec<(ChannelType, SendTarget, Message)>,
}

impl Outbox {
    /// Empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every recorded message.
    pub fn take(&mut self) -> Vec<(ChannelType, SendTarget, Message)> {
        std::mem::take(&mut self.sent)
    }

    /// Recorded messages addressed to `target`.
    pub fn to(&self, target: SendTarget) -> Vec<&Message> {
        self.sent
            .iter()
            .filter(|(_, t, _)| *t == target)
            .map(|(_, _, m)| m)
            .collect()
    }
}

impl MessageSink for Outbox {
    fn send(
        &mut self,
        channel: ChannelType,
        target: SendTarget,
        message: &Message,
    ) -> Result<(), SendError> {
        self.sent.push((channel, target, message.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameCodec, JsonCodec};
    use crate::transport::LoopbackHub;
    use netsync_core::NetId;

    #[test]
    fn test_reliable_drained_before_unreliable() {
        let hub = LoopbackHub::new();
        let mut server = Connection::new(Box::new(hub.server_endpoint()), Box::new(FrameCodec));
        let mut client = Connection::new(Box::new(hub.connect_client()), Box::new(FrameCodec));

        server
            .send(
                ChannelType::Unreliable,
                SendTarget::Broadcast,
                &Message::ResyncRequest { net_id: NetId(1) },
            )
            .expect("send");
        server
            .send(
                ChannelType::Reliable,
                SendTarget::Broadcast,
                &Message::Despawn { net_id: NetId(1) },
            )
            .expect("send");

        let received = client.drain();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].channel, ChannelType::Reliable);
        assert_eq!(received[0].message, Message::Despawn { net_id: NetId(1) });
        assert_eq!(received[1].channel, ChannelType::Unreliable);
        assert_eq!(client.stats().messages_received, 2);
    }

    #[test]
    fn test_garbage_is_counted_and_dropped() {
        let hub = LoopbackHub::new();
        let mut raw = hub.server_endpoint();
        let mut client = Connection::new(Box::new(hub.connect_client()), Box::new(JsonCodec));

        raw.send(ChannelType::Reliable, SendTarget::Broadcast, b"\x00\x01garbage")
            .expect("send");
        assert!(client.drain().is_empty());
        assert_eq!(client.stats().decode_failures, 1);
    }

    #[test]
    fn test_outbox_records_targets() {
        let mut outbox = Outbox::new();
        let target = SendTarget::Connection(ConnectionId(2));
        outbox
            .send(
                ChannelType::Reliable,
                target,
                &Message::Despawn { net_id: NetId(5) },
            )
            .expect("send");
        assert_eq!(outbox.to(target).len(), 1);
        assert!(outbox.to(SendTarget::Broadcast).is_empty());
        assert_eq!(outbox.take().len(), 1);
    }
}
