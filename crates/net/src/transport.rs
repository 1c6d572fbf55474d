//! In-process loopback transport.
//!
//! A [`LoopbackHub`] connects one server endpoint with any number of client
//! endpoints in a star. Reliable datagrams are always delivered in order.
//! Unreliable datagrams can be dropped with a fixed probability drawn from a
//! seeded RNG, so lossy runs are reproducible.

use crate::channel::{ChannelType, SendTarget, Transport, TransportError};
use netsync_core::ConnectionId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, trace};

/// Delivery counters of a hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Datagrams queued for delivery.
    pub delivered: u64,
    /// Unreliable datagrams dropped by the loss model.
    pub dropped: u64,
    /// Bytes queued on the reliable channel.
    pub reliable_bytes: u64,
    /// Bytes queued on the unreliable channel.
    pub unreliable_bytes: u64,
}

#[derive(Default)]
struct Inbox {
    reliable: VecDeque<(ConnectionId, Vec<u8>)>,
    unreliable: VecDeque<(ConnectionId, Vec<u8>)>,
}

impl Inbox {
    fn queue(&mut self, channel: ChannelType) -> &mut VecDeque<(ConnectionId, Vec<u8>)> {
        match channel {
            ChannelType::Reliable => &mut self.reliable,
            ChannelType::Unreliable => &mut self.unreliable,
        }
    }
}

struct HubState {
    inboxes: BTreeMap<ConnectionId, Inbox>,
    next_client: u32,
    loss: f64,
    rng: StdRng,
    stats: LinkStats,
}

impl HubState {
    fn deliver(
        &mut self,
        from: ConnectionId,
        to: ConnectionId,
        channel: ChannelType,
        data: &[u8],
    ) -> Result<(), TransportError> {
        if !self.inboxes.contains_key(&to) {
            return Err(TransportError::UnknownPeer(to));
        }
        if !channel.is_reliable() && self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.stats.dropped += 1;
            trace!(%from, %to, len = data.len(), "loopback dropped datagram");
            return Ok(());
        }

        match channel {
            ChannelType::Reliable => self.stats.reliable_bytes += data.len() as u64,
            ChannelType::Unreliable => self.stats.unreliable_bytes += data.len() as u64,
        }
        self.stats.delivered += 1;
        if let Some(inbox) = self.inboxes.get_mut(&to) {
            inbox.queue(channel).push_back((from, data.to_vec()));
        }
        Ok(())
    }
}

/// Shared in-process switchboard.
#[derive(Clone)]
pub struct LoopbackHub {
    state: Rc<RefCell<HubState>>,
}

impl LoopbackHub {
    /// Lossless hub.
    pub fn new() -> Self {
        Self::with_loss(0.0, 0)
    }

    /// Hub that drops unreliable datagrams with probability `loss`.
    pub fn with_loss(loss: f64, seed: u64) -> Self {
        let mut inboxes = BTreeMap::new();
        inboxes.insert(ConnectionId::SERVER, Inbox::default());
        Self {
            state: Rc::new(RefCell::new(HubState {
                inboxes,
                next_client: 1,
                loss: loss.clamp(0.0, 1.0),
                rng: StdRng::seed_from_u64(seed),
                stats: LinkStats::default(),
            })),
        }
    }

    /// Endpoint of the server side.
    pub fn server_endpoint(&self) -> LoopbackEndpoint {
        LoopbackEndpoint {
            id: ConnectionId::SERVER,
            state: Rc::clone(&self.state),
        }
    }

    /// Attach a new client and return its endpoint.
    pub fn connect_client(&self) -> LoopbackEndpoint {
        let mut state = self.state.borrow_mut();
        let id = ConnectionId(state.next_client);
        state.next_client += 1;
        state.inboxes.insert(id, Inbox::default());
        debug!(connection = %id, "loopback client attached");
        LoopbackEndpoint {
            id,
            state: Rc::clone(&self.state),
        }
    }

    /// Detach a client; its queued datagrams are discarded.
    pub fn disconnect(&self, id: ConnectionId) {
        if id == ConnectionId::SERVER {
            return;
        }
        if self.state.borrow_mut().inboxes.remove(&id).is_some() {
            debug!(connection = %id, "loopback client detached");
        }
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> LinkStats {
        self.state.borrow().stats
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One side of the loopback star.
pub struct LoopbackEndpoint {
    id: ConnectionId,
    state: Rc<RefCell<HubState>>,
}

impl Transport for LoopbackEndpoint {
    fn local_id(&self) -> ConnectionId {
        self.id
    }

    fn send(
        &mut self,
        channel: ChannelType,
        target: SendTarget,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state.borrow_mut();
        if !state.inboxes.contains_key(&self.id) {
            return Err(TransportError::Closed);
        }
        match target {
            SendTarget::Connection(to) => state.deliver(self.id, to, channel, data),
            SendTarget::Broadcast if self.id == ConnectionId::SERVER => {
                let peers: Vec<ConnectionId> = state
                    .inboxes
                    .keys()
                    .copied()
                    .filter(|id| *id != ConnectionId::SERVER)
                    .collect();
                for to in peers {
                    state.deliver(self.id, to, channel, data)?;
                }
                Ok(())
            }
            SendTarget::Broadcast => state.deliver(self.id, ConnectionId::SERVER, channel, data),
        }
    }

    fn receive(&mut self, channel: ChannelType) -> Option<(ConnectionId, Vec<u8>)> {
        self.state
            .borrow_mut()
            .inboxes
            .get_mut(&self.id)
            .and_then(|inbox| inbox.queue(channel).pop_front())
    }
}
