//! Network identity attached to replicated entities.

use crate::authority::Authority;
use crate::components::ComponentValue;
use crate::registry::{ComponentError, NetComponent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Size of the id block reserved for each connection prefix.
pub const NET_ID_BLOCK: u64 = 10_000;

/// Process-independent identifier of a replicated entity.
///
/// Ids are namespaced as `prefix * 10000 + counter` so peers with distinct
/// prefixes never collide without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetId(pub u64);

impl NetId {
    /// Compose an id from a connection prefix and a local counter.
    pub fn compose(prefix: u32, counter: u64) -> Self {
        Self(prefix as u64 * NET_ID_BLOCK + counter)
    }

    /// Prefix of the peer that allocated this id.
    pub fn prefix(self) -> u32 {
        (self.0 / NET_ID_BLOCK) as u32
    }
}

impl fmt::Display for NetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u32);

impl ConnectionId {
    /// The server side of every client connection.
    pub const SERVER: Self = Self(0);

    /// Net id prefix assigned to this connection.
    pub fn prefix(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Per-component replication rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncRule {
    /// Maximum send rate; `0` means every tick.
    pub rate_hz: f32,
    /// Send on the reliable channel.
    pub reliable: bool,
    /// Component-level authority override.
    pub authority: Option<Authority>,
    /// Receivers smooth toward the value instead of applying it.
    pub interpolate: bool,
}

impl Default for SyncRule {
    fn default() -> Self {
        Self {
            rate_hz: 0.0,
            reliable: false,
            authority: None,
            interpolate: false,
        }
    }
}

impl SyncRule {
    /// Rule limited to `rate_hz` sends per second.
    pub fn rate(rate_hz: f32) -> Self {
        Self {
            rate_hz,
            ..Self::default()
        }
    }

    /// Mark as reliable.
    pub fn reliable(mut self) -> Self {
        self.reliable = true;
        self
    }

    /// Mark as interpolated on receivers.
    pub fn interpolated(mut self) -> Self {
        self.interpolate = true;
        self
    }

    /// Override the entity-level authority.
    pub fn with_authority(mut self, authority: Authority) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Minimum seconds between two sends.
    pub fn min_interval(&self) -> f64 {
        if self.rate_hz > 0.0 {
            1.0 / self.rate_hz as f64
        } else {
            0.0
        }
    }

    fn to_value(self) -> ComponentValue {
        ComponentValue::map([
            ("rate_hz", ComponentValue::from(self.rate_hz)),
            ("reliable", ComponentValue::Bool(self.reliable)),
            (
                "authority",
                self.authority
                    .map(|a| ComponentValue::from(a.as_str()))
                    .unwrap_or(ComponentValue::Null),
            ),
            ("interpolate", ComponentValue::Bool(self.interpolate)),
        ])
    }

    fn from_value(value: &ComponentValue) -> Result<Self, ComponentError> {
        const NAME: &str = NetworkIdentity::NAME;
        let rate_hz = match value.field("rate_hz") {
            None | Some(ComponentValue::Null) => 0.0,
            Some(v) => v.as_float().ok_or(ComponentError::InvalidField {
                component: NAME,
                field: "rate_hz",
            })? as f32,
        };
        let flag = |field: &'static str| -> Result<bool, ComponentError> {
            match value.field(field) {
                None | Some(ComponentValue::Null) => Ok(false),
                Some(v) => v.as_bool().ok_or(ComponentError::InvalidField {
                    component: NAME,
                    field,
                }),
            }
        };
        let authority = match value.field("authority") {
            None | Some(ComponentValue::Null) => None,
            Some(v) => Some(
                v.as_str()
                    .and_then(|s| s.parse::<Authority>().ok())
                    .ok_or(ComponentError::InvalidField {
                        component: NAME,
                        field: "authority",
                    })?,
            ),
        };
        Ok(Self {
            rate_hz,
            reliable: flag("reliable")?,
            authority,
            interpolate: flag("interpolate")?,
        })
    }
}

/// Identity component carried by every replicated entity.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NetworkIdentity {
    /// Assigned network id, if any.
    pub net_id: Option<NetId>,
    /// Entity-level authority.
    pub authority: Authority,
    /// Owning connection (server-side bookkeeping).
    pub owner_client: Option<ConnectionId>,
    /// Replicated components and their rules.
    pub sync_components: BTreeMap<String, SyncRule>,
    /// Local placeholder waiting for the server to confirm it.
    pub predicted: bool,
}

impl NetworkIdentity {
    /// Identity with the given entity-level authority and no components.
    pub fn new(authority: Authority) -> Self {
        Self {
            authority,
            ..Self::default()
        }
    }

    /// Builder-style: declare a replicated component.
    pub fn sync(mut self, component: impl Into<String>, rule: SyncRule) -> Self {
        self.sync_components.insert(component.into(), rule);
        self
    }

    /// Builder-style: set the owner.
    pub fn owned_by(mut self, owner: ConnectionId) -> Self {
        self.owner_client = Some(owner);
        self
    }

    /// Rule for a component, if it is replicated.
    pub fn rule(&self, component: &str) -> Option<&SyncRule> {
        self.sync_components.get(component)
    }

    /// Effective authority of a declared component.
    pub fn authority_for(&self, component: &str) -> Option<Authority> {
        self.rule(component)
            .map(|rule| crate::authority::resolve_authority(rule.authority, self.authority))
    }
}

impl NetComponent for NetworkIdentity {
    const NAME: &'static str = "NetworkIdentity";

    fn to_value(&self) -> ComponentValue {
        let sync = self
            .sync_components
            .iter()
            .map(|(name, rule)| (name.clone(), rule.to_value()))
            .collect();
        ComponentValue::map([
            (
                "net_id",
                self.net_id
                    .map(|id| ComponentValue::Int(id.0 as i64))
                    .unwrap_or(ComponentValue::Null),
            ),
            ("authority", ComponentValue::from(self.authority.as_str())),
            (
                "owner_client",
                self.owner_client
                    .map(|c| ComponentValue::Int(c.0 as i64))
                    .unwrap_or(ComponentValue::Null),
            ),
            ("sync_components", ComponentValue::Map(sync)),
            ("predicted", ComponentValue::Bool(self.predicted)),
        ])
    }

    fn from_value(value: &ComponentValue) -> Result<Self, ComponentError> {
        let map = value.as_map().ok_or(ComponentError::Shape(Self::NAME))?;
        let invalid = |field: &'static str| ComponentError::InvalidField {
            component: Self::NAME,
            field,
        };

        let net_id = match map.get("net_id") {
            None | Some(ComponentValue::Null) => None,
            Some(v) => {
                let raw = v.as_int().filter(|id| *id >= 0).ok_or(invalid("net_id"))?;
                Some(NetId(raw as u64))
            }
        };
        let authority = match map.get("authority") {
            None | Some(ComponentValue::Null) => Authority::default(),
            Some(v) => v
                .as_str()
                .and_then(|s| s.parse().ok())
                .ok_or(invalid("authority"))?,
        };
        let owner_client = match map.get("owner_client") {
            None | Some(ComponentValue::Null) => None,
            Some(v) => {
                let raw = v
                    .as_int()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or(invalid("owner_client"))?;
                Some(ConnectionId(raw))
            }
        };
        let mut sync_components = BTreeMap::new();
        match map.get("sync_components") {
            None | Some(ComponentValue::Null) => {}
            Some(ComponentValue::Map(rules)) => {
                for (name, rule) in rules {
                    sync_components.insert(name.clone(), SyncRule::from_value(rule)?);
                }
            }
            Some(_) => return Err(invalid("sync_components")),
        }
        let predicted = match map.get("predicted") {
            None | Some(ComponentValue::Null) => false,
            Some(v) => v.as_bool().ok_or(invalid("predicted"))?,
        };

        Ok(Self {
            net_id,
            authority,
            owner_client,
            sync_components,
            predicted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_id_composition_matches_prefix_blocks() {
        assert_eq!(NetId::compose(3, 1), NetId(30001));
        assert_eq!(NetId(30002).prefix(), 3);
        assert_eq!(NetId::compose(0, 42).prefix(), 0);
    }

    #[test]
    fn identity_value_round_trip() {
        let mut identity = NetworkIdentity::new(Authority::Owner)
            .sync("Transform", SyncRule::rate(20.0).interpolated())
            .sync(
                "Health",
                SyncRule::default().reliable().with_authority(Authority::Server),
            )
            .owned_by(ConnectionId(7));
        identity.net_id = Some(NetId(70001));

        let decoded = NetworkIdentity::from_value(&identity.to_value()).expect("decode");
        assert_eq!(decoded, identity);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let decoded =
            NetworkIdentity::from_value(&ComponentValue::Map(BTreeMap::new())).expect("decode");
        assert_eq!(decoded, NetworkIdentity::default());
        assert_eq!(decoded.authority, Authority::Server);
    }

    #[test]
    fn bad_authority_is_rejected() {
        let value = ComponentValue::map([("authority", ComponentValue::from("root"))]);
        assert_eq!(
            NetworkIdentity::from_value(&value),
            Err(ComponentError::InvalidField {
                component: "NetworkIdentity",
                field: "authority",
            })
        );
    }

    #[test]
    fn authority_for_uses_override() {
        let identity = NetworkIdentity::new(Authority::Server)
            .sync("Transform", SyncRule::default())
            .sync("Emote", SyncRule::default().with_authority(Authority::Owner));
        assert_eq!(identity.authority_for("Transform"), Some(Authority::Server));
        assert_eq!(identity.authority_for("Emote"), Some(Authority::Owner));
        assert_eq!(identity.authority_for("Inventory"), None);
    }

    #[test]
    fn zero_rate_means_every_tick() {
        assert_eq!(SyncRule::default().min_interval(), 0.0);
        assert!((SyncRule::rate(10.0).min_interval() - 0.1).abs() < 1e-9);
    }
}
