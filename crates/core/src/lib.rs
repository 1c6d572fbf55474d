#![warn(missing_docs)]
//! Core replication primitives shared across the workspace.

pub mod authority;
pub mod builtin;
pub mod components;
pub mod host;
pub mod identity;
pub mod registry;

use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use authority::{resolve_authority, Authority, Origin};
pub use builtin::{PlayerInput, Transform, Velocity};
pub use components::{ComponentMap, ComponentValue, MAX_VALUE_DEPTH};
pub use host::{EntityStore, EntityStoreExt};
pub use identity::{ConnectionId, NetId, NetworkIdentity, SyncRule, NET_ID_BLOCK};
pub use registry::{ComponentError, ComponentRegistry, NetComponent};

/// Name under which the identity component is stored on host entities.
pub const IDENTITY_COMPONENT: &str = NetworkIdentity::NAME;

/// Fixed simulation tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick in any timeline.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}
