//! Write authority over replicated components.

use crate::identity::ConnectionId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which peer may originate authoritative writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Authority {
    /// The owning connection (or the server, for unowned entities).
    Owner,
    /// Only the server.
    #[default]
    Server,
    /// Adopted from the network; never originated locally.
    Remote,
    /// Any peer.
    Any,
}

impl Authority {
    /// Stable lowercase name used in component payloads.
    pub fn as_str(self) -> &'static str {
        match self {
            Authority::Owner => "owner",
            Authority::Server => "server",
            Authority::Remote => "remote",
            Authority::Any => "any",
        }
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Authority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(Authority::Owner),
            "server" => Ok(Authority::Server),
            "remote" => Ok(Authority::Remote),
            "any" => Ok(Authority::Any),
            other => Err(format!("unknown authority '{other}'")),
        }
    }
}

/// Effective authority for a component: the component-level override if
/// present, otherwise the entity default.
pub fn resolve_authority(component_override: Option<Authority>, entity_default: Authority) -> Authority {
    component_override.unwrap_or(entity_default)
}

/// The local peer's role, used to decide what it may originate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// The authoritative server.
    Server,
    /// A client; the connection id is known once the server assigned it.
    Client(Option<ConnectionId>),
}

impl Origin {
    /// True for the server role.
    pub fn is_server(self) -> bool {
        matches!(self, Origin::Server)
    }

    /// Connection id of a client origin.
    pub fn connection(self) -> Option<ConnectionId> {
        match self {
            Origin::Server => None,
            Origin::Client(id) => id,
        }
    }

    /// Whether this peer may originate a write under `authority` for an
    /// entity owned by `owner`.
    ///
    /// The server relays everything except adopted (`Remote`) state. A client
    /// only writes `Any` components and `Owner` components of entities it owns.
    pub fn may_originate(self, authority: Authority, owner: Option<ConnectionId>) -> bool {
        match (self, authority) {
            (_, Authority::Remote) => false,
            (Origin::Server, _) => true,
            (Origin::Client(_), Authority::Any) => true,
            (Origin::Client(me), Authority::Owner) => me.is_some() && owner == me,
            (Origin::Client(_), Authority::Server) => false,
        }
    }
}
