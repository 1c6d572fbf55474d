#![warn(missing_docs)]
//! Entity replication pipeline: wire protocol, codecs, transports, the
//! replicated entity store, outbound and inbound passes, client prediction
//! and interpolation.

pub mod change_cache;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod event_log;
pub mod inbound;
pub mod interpolation;
pub mod outbound;
pub mod pending;
pub mod prediction;
pub mod protocol;
pub mod registry;
pub mod scope;
pub mod store;
pub mod transport;

pub use change_cache::{ChangeCache, SendDecision, SentRecord};
pub use channel::{ChannelType, SendTarget, Transport, TransportError};
pub use codec::{compute_schema_hash, Codec, CodecError, FrameCodec, JsonCodec};
pub use config::{
    DisconnectPolicy, InterpolationConfig, NetSyncConfig, PredictionConfig, ReplicationConfig,
    ServerConfig,
};
pub use connection::{Connection, ConnectionStats, MessageSink, Outbox, Received, SendError};
pub use event_log::{load_events, EventLogger, SyncEvent};
pub use inbound::{ApplyEffect, Applier, InboundStats, UpdateValidator};
pub use interpolation::{InterpolationTarget, Interpolator};
pub use outbound::{ReplicationStats, Replicator};
pub use pending::{PendingChildren, PendingSpawn};
pub use prediction::{
    ClientPredictor, KinematicMovement, MovementModel, MovementState, PredictedFrame,
    PredictionMetrics, PredictionState, Reconciliation, ServerState,
};
pub use protocol::{
    Envelope, InputFrame, InputMessage, Message, SpawnMessage, UpdateMessage, PROTOCOL_VERSION,
};
pub use registry::{IdAllocError, IdentityRegistry, NetIdAllocator};
pub use scope::ScopeTable;
pub use store::{ReplicatedEntityStore, SharedRegistry, Unregistered};
pub use transport::{LinkStats, LoopbackEndpoint, LoopbackHub};
