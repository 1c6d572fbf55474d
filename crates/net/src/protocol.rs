//! Replication message definitions.
//!
//! Every message travels inside an [`Envelope`] that carries the protocol
//! version and the sender's tick. Payloads are plain serde types so both the
//! JSON and the postcard codec can carry them.

use netsync_core::{Authority, ComponentMap, ComponentValue, ConnectionId, NetId};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u16 = 1;

/// Protocol magic bytes mixed into the schema hash.
pub const PROTOCOL_MAGIC: &[u8; 8] = b"NSYNC\x00\x01\x00";

/// Maximum components carried by one spawn or update.
pub const MAX_COMPONENTS: usize = 64;

/// Maximum length of a component-type name.
pub const MAX_COMPONENT_NAME_LEN: usize = 64;

pub use netsync_core::MAX_VALUE_DEPTH;

/// Maximum number of elements in a list or map value.
pub const MAX_VALUE_ELEMENTS: usize = 1024;

/// Maximum string length inside a component value.
pub const MAX_STRING_LEN: usize = 4096;

/// Maximum input frames per input message.
pub const MAX_INPUT_FRAMES: usize = 64;

/// Versioned wrapper around every message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Protocol version of the sender.
    pub version: u16,
    /// Sender tick when the message was built.
    pub tick: u64,
    /// Message payload.
    pub message: Message,
}

impl Envelope {
    /// Wrap a message with the current protocol version.
    pub fn new(tick: u64, message: Message) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            tick,
            message,
        }
    }
}

/// Replication messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    /// Full state of an entity the receiver does not know yet.
    Spawn(SpawnMessage),
    /// Changed components of a known entity.
    Update(UpdateMessage),
    /// The entity is gone.
    Despawn {
        /// Despawned entity.
        net_id: NetId,
    },
    /// Ownership or entity-level authority changed.
    OwnerChange {
        /// Affected entity.
        net_id: NetId,
        /// New owner, `None` for server-owned.
        new_owner: Option<ConnectionId>,
        /// New entity-level authority.
        authority: Authority,
    },
    /// Server tells a client who it is.
    IdentityAssignment {
        /// The client's own character, if one is assigned.
        net_id: Option<NetId>,
        /// Connection id of the receiver.
        connection: ConnectionId,
        /// Net id prefix the receiver must allocate from.
        prefix: u32,
        /// Schema hash of the server build.
        schema_hash: u64,
    },
    /// Client missed an entity and asks for its full state.
    ResyncRequest {
        /// Entity the client could not resolve.
        net_id: NetId,
    },
    /// Client movement inputs for its predicted entity.
    Input(InputMessage),
}

impl Message {
    /// Short kind name used in logs and event records.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Spawn(_) => "spawn",
            Message::Update(_) => "update",
            Message::Despawn { .. } => "despawn",
            Message::OwnerChange { .. } => "owner_change",
            Message::IdentityAssignment { .. } => "identity_assignment",
            Message::ResyncRequest { .. } => "resync_request",
            Message::Input(_) => "input",
        }
    }

    /// Entity this message is about, if any.
    pub fn net_id(&self) -> Option<NetId> {
        match self {
            Message::Spawn(spawn) => Some(spawn.net_id),
            Message::Update(update) => Some(update.net_id),
            Message::Despawn { net_id }
            | Message::OwnerChange { net_id, .. }
            | Message::ResyncRequest { net_id } => Some(*net_id),
            Message::IdentityAssignment { net_id, .. } => *net_id,
            Message::Input(input) => Some(input.net_id),
        }
    }

    /// Returns true for structural messages that always travel reliably.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Message::Update(_) | Message::Input(_))
    }

    /// Verify message limits and validity.
    ///
    /// Called on every received message before it is applied.
    pub fn verify(&self) -> Result<(), &'static str> {
        match self {
            Message::Spawn(spawn) => verify_components(&spawn.components),
            Message::Update(update) => {
                if update.components.is_empty() {
                    return Err("Update carries no components");
                }
                verify_components(&update.components)
            }
            Message::Input(input) => input.verify(),
            Message::IdentityAssignment {
                net_id: Some(net_id),
                prefix,
                ..
            } if net_id.prefix() != *prefix && net_id.prefix() != 0 => {
                Err("Assigned net id belongs to a foreign prefix")
            }
            _ => Ok(()),
        }
    }
}

/// Full entity state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnMessage {
    /// Entity id.
    pub net_id: NetId,
    /// Owning connection.
    pub owner_client: Option<ConnectionId>,
    /// Entity-level authority at the origin.
    pub authority: Authority,
    /// Parent entity, if the origin links one.
    pub parent_net_id: Option<NetId>,
    /// Every declared component plus the identity component.
    pub components: ComponentMap,
}

/// Component delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateMessage {
    /// Entity id.
    pub net_id: NetId,
    /// Owning connection.
    pub owner_client: Option<ConnectionId>,
    /// Changed components.
    pub components: ComponentMap,
    /// Input sequence that produced this state, if any.
    pub seq: Option<u32>,
    /// Highest input sequence of the receiver the sender has applied.
    pub ack_seq: Option<u32>,
}

/// Batch of input frames, oldest first.
///
/// Clients resend every unacknowledged frame so a lost datagram is covered
/// by the next one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputMessage {
    /// Predicted entity the inputs drive.
    pub net_id: NetId,
    /// Unacknowledged frames in ascending sequence order.
    pub frames: Vec<InputFrame>,
}

impl InputMessage {
    /// Verify frame count, ordering and step sizes.
    pub fn verify(&self) -> Result<(), &'static str> {
        if self.frames.is_empty() {
            return Err("Input message carries no frames");
        }
        if self.frames.len() > MAX_INPUT_FRAMES {
            return Err("Too many input frames");
        }
        if self.frames.windows(2).any(|w| w[0].seq >= w[1].seq) {
            return Err("Input frames out of order");
        }
        for frame in &self.frames {
            if !frame.dt.is_finite() || frame.dt <= 0.0 || frame.dt > 1.0 {
                return Err("Invalid input frame step");
            }
            verify_value(&frame.input, 0)?;
        }
        Ok(())
    }
}

/// One predicted input step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputFrame {
    /// Prediction sequence number.
    pub seq: u32,
    /// Step length in seconds.
    pub dt: f32,
    /// Input payload (a `PlayerInput` value).
    pub input: ComponentValue,
}

fn verify_components(components: &ComponentMap) -> Result<(), &'static str> {
    if components.len() > MAX_COMPONENTS {
        return Err("Too many components");
    }
    for (name, value) in components.iter() {
        if name.is_empty() || name.len() > MAX_COMPONENT_NAME_LEN {
            return Err("Invalid component name");
        }
        verify_value(value, 0)?;
    }
    Ok(())
}

fn verify_value(value: &ComponentValue, depth: usize) -> Result<(), &'static str> {
    if depth > MAX_VALUE_DEPTH {
        return Err("Component value nested too deeply");
    }
    match value {
        ComponentValue::Str(s) if s.len() > MAX_STRING_LEN => Err("Component string too long"),
        ComponentValue::List(items) => {
            if items.len() > MAX_VALUE_ELEMENTS {
                return Err("Component list too long");
            }
            items.iter().try_for_each(|v| verify_value(v, depth + 1))
        }
        ComponentValue::Map(entries) => {
            if entries.len() > MAX_VALUE_ELEMENTS {
                return Err("Component map too large");
            }
            for (key, v) in entries {
                if key.len() > MAX_STRING_LEN {
                    return Err("Component map key too long");
                }
                verify_value(v, depth + 1)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
