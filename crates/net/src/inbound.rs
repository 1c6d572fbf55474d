//! Inbound message application.
//!
//! The [`Applier`] mutates the host store and the replicated entity store
//! for structural messages and plain component writes. Everything a role has
//! to act on itself (prediction input, interpolation targets, resync
//! requests, inputs) comes back as an [`ApplyEffect`].

use crate::config::ReplicationConfig;
use crate::connection::Received;
use crate::pending::PendingChildren;
use crate::protocol::{InputMessage, Message, SpawnMessage, UpdateMessage};
use crate::store::SharedRegistry;
use glam::Vec3;
use netsync_core::{
    Authority, ComponentMap, ComponentRegistry, ComponentValue, ConnectionId, EntityStore,
    EntityStoreExt, NetComponent, NetId, NetworkIdentity, Origin, SyncRule, Transform, Velocity,
    IDENTITY_COMPONENT,
};
use std::rc::Rc;
use tracing::{debug, warn};

/// Extra acceptance check for component writes arriving from clients.
pub type UpdateValidator = Box<dyn Fn(ConnectionId, NetId, &str, &ComponentValue) -> bool>;

/// Follow-up work produced by applying a message.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyEffect<E> {
    /// A local entity was materialized.
    Spawned {
        /// Entity id.
        net_id: NetId,
        /// New local handle.
        entity: E,
    },
    /// A local entity was destroyed.
    Despawned {
        /// Entity id.
        net_id: NetId,
        /// Destroyed handle.
        entity: E,
    },
    /// Authoritative state of the local player's predicted entity.
    ServerState {
        /// Entity id.
        net_id: NetId,
        /// Local handle.
        entity: E,
        /// Authoritative position.
        position: Vec3,
        /// Authoritative velocity, if it was part of the update.
        velocity: Option<Vec3>,
        /// Highest input sequence the server applied.
        ack_seq: Option<u32>,
    },
    /// New smoothing target for a remote entity.
    Interpolate {
        /// Entity id.
        net_id: NetId,
        /// Local handle.
        entity: E,
        /// Target transform.
        target: Transform,
        /// Sender tick of the update.
        sent_tick: u64,
    },
    /// An update named an entity this peer does not know.
    ResyncNeeded {
        /// Unknown entity.
        net_id: NetId,
    },
    /// The server assigned this client its identity.
    IdentityAssigned {
        /// Own connection id.
        connection: ConnectionId,
        /// Net id prefix to allocate from.
        prefix: u32,
        /// Own character, if any.
        net_id: Option<NetId>,
        /// Schema hash of the server build.
        schema_hash: u64,
    },
    /// Ownership changed.
    OwnerChanged {
        /// Entity id.
        net_id: NetId,
        /// New owner.
        new_owner: Option<ConnectionId>,
    },
    /// A client asked for the full state of an entity.
    ResyncRequested {
        /// Requesting connection.
        from: ConnectionId,
        /// Requested entity.
        net_id: NetId,
    },
    /// Client inputs for an entity it owns.
    Input {
        /// Sending connection.
        from: ConnectionId,
        /// Inputs.
        message: InputMessage,
    },
    /// A message or component was refused.
    Rejected {
        /// Sending connection.
        from: ConnectionId,
        /// Entity concerned, if any.
        net_id: Option<NetId>,
        /// Why it was refused.
        reason: &'static str,
    },
}

/// Inbound counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InboundStats {
    /// Entities materialized.
    pub spawned: u64,
    /// Entities destroyed.
    pub despawned: u64,
    /// Component values written to the host store.
    pub applied: u64,
    /// Spawns parked until their parent arrives.
    pub deferred: u64,
    /// Parked spawns dropped after the timeout.
    pub expired: u64,
    /// Updates for unknown entities.
    pub unknown: u64,
    /// Messages or components refused.
    pub rejected: u64,
}

/// Inbound half of the replication pipeline.
pub struct Applier<E> {
    registry: SharedRegistry<E>,
    side: Origin,
    components: ComponentRegistry,
    pending: PendingChildren,
    validator: Option<UpdateValidator>,
    predict_own: bool,
    config: ReplicationConfig,
    stats: InboundStats,
}

impl<E: Copy + Ord + std::fmt::Debug> Applier<E> {
    /// Server-side applier.
    pub fn server(
        registry: SharedRegistry<E>,
        components: ComponentRegistry,
        config: ReplicationConfig,
    ) -> Self {
        Self::new(registry, Origin::Server, components, config)
    }

    /// Client-side applier.
    pub fn client(
        registry: SharedRegistry<E>,
        components: ComponentRegistry,
        config: ReplicationConfig,
    ) -> Self {
        Self::new(registry, Origin::Client(None), components, config)
    }

    fn new(
        registry: SharedRegistry<E>,
        side: Origin,
        components: ComponentRegistry,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            registry,
            side,
            components,
            pending: PendingChildren::new(),
            validator: None,
            predict_own: true,
            config,
            stats: InboundStats::default(),
        }
    }

    /// Install an extra check for client component writes (server side).
    pub fn set_validator(&mut self, validator: UpdateValidator) {
        self.validator = Some(validator);
    }

    /// Component kinds accepted on receipt.
    pub fn components_mut(&mut self) -> &mut ComponentRegistry {
        &mut self.components
    }

    /// Route the own entity's transform to prediction (default) or apply it.
    pub fn set_predict_own(&mut self, enabled: bool) {
        self.predict_own = enabled;
    }

    /// Inbound counters so far.
    pub fn stats(&self) -> InboundStats {
        self.stats
    }

    /// Spawns waiting for a parent.
    pub fn pending(&self) -> &PendingChildren {
        &self.pending
    }

    /// Apply one received message.
    pub fn apply<S>(&mut self, world: &mut S, received: Received, now: f64) -> Vec<ApplyEffect<E>>
    where
        S: EntityStore<Entity = E>,
    {
        let mut effects = Vec::new();
        let from = received.from;
        match received.message {
            Message::Spawn(spawn) => {
                self.apply_spawn(world, from, spawn, received.tick, now, &mut effects)
            }
            Message::Update(update) => {
                self.apply_update(world, from, update, received.tick, &mut effects)
            }
            Message::Despawn { net_id } => self.apply_despawn(world, from, net_id, &mut effects),
            Message::OwnerChange {
                net_id,
                new_owner,
                authority,
            } => self.apply_owner_change(world, from, net_id, new_owner, authority, &mut effects),
            Message::IdentityAssignment {
                net_id,
                connection,
                prefix,
                schema_hash,
            } => {
                if self.side.is_server() {
                    self.reject(&mut effects, from, net_id, "identity assignment sent to server");
                } else {
                    self.side = Origin::Client(Some(connection));
                    self.registry
                        .borrow_mut()
                        .identities_mut()
                        .set_my_net_id(net_id);
                    debug!(%connection, prefix, "identity assigned");
                    effects.push(ApplyEffect::IdentityAssigned {
                        connection,
                        prefix,
                        net_id,
                        schema_hash,
                    });
                }
            }
            Message::ResyncRequest { net_id } => {
                if self.side.is_server() {
                    effects.push(ApplyEffect::ResyncRequested { from, net_id });
                } else {
                    self.reject(&mut effects, from, Some(net_id), "resync request sent to client");
                }
            }
            Message::Input(input) => self.apply_input(world, from, input, &mut effects),
        }
        effects
    }

    /// Drop parked spawns older than the configured timeout.
    pub fn expire_pending(&mut self, now: f64) -> Vec<NetId> {
        let expired = self
            .pending
            .expire(now, self.config.pending_child_timeout);
        for net_id in &expired {
            debug!(%net_id, "dropping orphaned child spawn");
        }
        self.stats.expired += expired.len() as u64;
        expired
    }

    fn apply_spawn<S>(
        &mut self,
        world: &mut S,
        from: ConnectionId,
        spawn: SpawnMessage,
        sent_tick: u64,
        now: f64,
        effects: &mut Vec<ApplyEffect<E>>,
    ) where
        S: EntityStore<Entity = E>,
    {
        let net_id = spawn.net_id;
        if self.side.is_server() {
            if net_id.prefix() != from.prefix() {
                self.reject(effects, from, Some(net_id), "spawn uses a foreign net id prefix");
                return;
            }
            if !matches!(spawn.authority, Authority::Owner | Authority::Any) {
                self.reject(effects, from, Some(net_id), "client spawn claims server authority");
                return;
            }
        }

        let known = self.registry.borrow().resolve(net_id);
        if known.is_some() {
            let update = UpdateMessage {
                net_id,
                owner_client: spawn.owner_client,
                components: spawn.components,
                seq: None,
                ack_seq: None,
            };
            self.apply_update(world, from, update, sent_tick, effects);
            return;
        }

        let parent = match spawn.parent_net_id {
            Some(parent_net_id) => match self.registry.borrow().resolve(parent_net_id) {
                Some(parent) => Some(parent),
                None => {
                    debug!(%net_id, parent = %parent_net_id, "parent unknown; deferring spawn");
                    self.pending.defer(from, spawn, sent_tick, now);
                    self.stats.deferred += 1;
                    return;
                }
            },
            None => None,
        };

        let mut identity = match spawn.components.get(IDENTITY_COMPONENT) {
            Some(value) => match NetworkIdentity::from_value(value) {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(%net_id, error = %err, "spawn carries a malformed identity");
                    self.reject(effects, from, Some(net_id), "malformed identity");
                    return;
                }
            },
            None => NetworkIdentity {
                sync_components: spawn
                    .components
                    .names()
                    .map(|name| (name.to_string(), SyncRule::default()))
                    .collect(),
                ..NetworkIdentity::default()
            },
        };
        identity.net_id = Some(net_id);
        identity.predicted = false;
        match self.side {
            Origin::Server => {
                identity.owner_client = Some(from);
                identity.authority = spawn.authority;
            }
            Origin::Client(me) => {
                identity.owner_client = spawn.owner_client;
                let mine = me.is_some() && spawn.owner_client == me;
                identity.authority = if mine && spawn.authority == Authority::Owner {
                    Authority::Owner
                } else {
                    Authority::Remote
                };
            }
        }

        let mut components = ComponentMap::new();
        for (name, value) in spawn.components {
            if name == IDENTITY_COMPONENT {
                continue;
            }
            if let Err(err) = self.components.validate(&name, &value) {
                warn!(%net_id, component = %name, error = %err, "dropping invalid component");
                self.reject(effects, from, Some(net_id), "invalid component");
                continue;
            }
            components.insert(name, value);
        }

        let hashes: Vec<(String, u64)> = components
            .iter()
            .map(|(name, value)| (name.clone(), value.canonical_hash()))
            .collect();
        components.insert(IDENTITY_COMPONENT, identity.to_value());
        let placeholder = match self.side {
            Origin::Client(_) => find_placeholder(world, net_id),
            Origin::Server => None,
        };
        let entity = match placeholder {
            Some(entity) => {
                debug!(%net_id, ?entity, "server spawn adopts prediction placeholder");
                for (name, value) in components {
                    world.set(entity, &name, value);
                }
                entity
            }
            None => world.spawn(components),
        };
        if parent.is_some() {
            world.set_parent(entity, parent);
        }

        {
            let mut store = self.registry.borrow_mut();
            store.register(net_id, entity);
            match self.side {
                Origin::Server => {
                    store.scope_mut().insert(from, net_id);
                    store.scope_mut().set_owner(net_id, Some(from));
                }
                Origin::Client(_) => {
                    for (name, hash) in &hashes {
                        store.changes_mut().remember(net_id, name, *hash);
                    }
                }
            }
        }
        self.stats.spawned += 1;
        debug!(%net_id, ?entity, %from, "materialized replicated entity");
        effects.push(ApplyEffect::Spawned { net_id, entity });

        for child in self.pending.take_children_of(net_id) {
            self.apply_spawn(world, child.from, child.spawn, child.sent_tick, now, effects);
        }
    }

    fn apply_update<S>(
        &mut self,
        world: &mut S,
        from: ConnectionId,
        update: UpdateMessage,
        sent_tick: u64,
        effects: &mut Vec<ApplyEffect<E>>,
    ) where
        S: EntityStore<Entity = E>,
    {
        let net_id = update.net_id;
        let Some(entity) = self.registry.borrow().resolve(net_id) else {
            self.stats.unknown += 1;
            debug!(%net_id, %from, "update for unknown entity dropped");
            if !self.side.is_server() && self.config.request_resync {
                effects.push(ApplyEffect::ResyncNeeded { net_id });
            }
            return;
        };
        let identity = match world.get_typed::<NetworkIdentity>(entity) {
            Some(Ok(identity)) => identity,
            _ => {
                debug!(%net_id, "update for entity without identity dropped");
                return;
            }
        };

        let is_own_predicted = self.predict_own
            && !self.side.is_server()
            && self.registry.borrow().identities().my_net_id() == Some(net_id);
        let mut server_position: Option<Vec3> = None;
        let mut server_velocity: Option<Vec3> = None;

        for (name, value) in update.components {
            if name == IDENTITY_COMPONENT {
                continue;
            }
            let rule = identity.rule(&name).copied();
            if self.side.is_server() {
                let Some(rule) = rule else {
                    self.reject(effects, from, Some(net_id), "undeclared component");
                    continue;
                };
                let authority = netsync_core::resolve_authority(rule.authority, identity.authority);
                if !Origin::Client(Some(from)).may_originate(authority, identity.owner_client) {
                    warn!(%net_id, %from, component = %name, %authority, "rejected unauthorized write");
                    self.reject(effects, from, Some(net_id), "not authorized");
                    continue;
                }
                if let Some(validator) = &self.validator {
                    if !validator(from, net_id, &name, &value) {
                        warn!(%net_id, %from, component = %name, "write refused by validator");
                        self.reject(effects, from, Some(net_id), "refused by validator");
                        continue;
                    }
                }
            }
            if let Err(err) = self.components.validate(&name, &value) {
                warn!(%net_id, component = %name, error = %err, "dropping invalid component");
                self.reject(effects, from, Some(net_id), "invalid component");
                continue;
            }

            if is_own_predicted && (name == Transform::NAME || name == Velocity::NAME) {
                if name == Transform::NAME {
                    server_position = Transform::from_value(&value).ok().map(|t| t.position);
                } else {
                    server_velocity = Velocity::from_value(&value).ok().map(|v| v.0);
                }
                continue;
            }

            if !self.side.is_server()
                && name == Transform::NAME
                && rule.map(|r| r.interpolate).unwrap_or(false)
            {
                if let Ok(target) = Transform::from_value(&value) {
                    self.registry
                        .borrow_mut()
                        .changes_mut()
                        .remember(net_id, &name, value.canonical_hash());
                    effects.push(ApplyEffect::Interpolate {
                        net_id,
                        entity,
                        target,
                        sent_tick,
                    });
                    continue;
                }
            }

            if !self.side.is_server() {
                self.registry
                    .borrow_mut()
                    .changes_mut()
                    .remember(net_id, &name, value.canonical_hash());
            }
            world.set(entity, &name, value);
            self.stats.applied += 1;
        }

        if let Some(position) = server_position {
            effects.push(ApplyEffect::ServerState {
                net_id,
                entity,
                position,
                velocity: server_velocity,
                ack_seq: update.ack_seq,
            });
        }
    }

    fn apply_despawn<S>(
        &mut self,
        world: &mut S,
        from: ConnectionId,
        net_id: NetId,
        effects: &mut Vec<ApplyEffect<E>>,
    ) where
        S: EntityStore<Entity = E>,
    {
        if self.pending.remove(net_id).is_some() {
            debug!(%net_id, "despawn cancelled a parked spawn");
            return;
        }
        let Some(entity) = self.registry.borrow().resolve(net_id) else {
            debug!(%net_id, "despawn for unknown entity ignored");
            return;
        };

        if self.side.is_server() {
            if self.owner_of(world, net_id, entity) != Some(from) {
                warn!(%net_id, %from, "rejected despawn from non-owner");
                self.reject(effects, from, Some(net_id), "despawn from non-owner");
                return;
            }
            // The outbound pass unregisters and tells every connection in scope.
            world.despawn(entity);
        } else {
            self.registry.borrow_mut().unregister(net_id);
            world.despawn(entity);
        }
        self.stats.despawned += 1;
        debug!(%net_id, ?entity, "despawned replicated entity");
        effects.push(ApplyEffect::Despawned { net_id, entity });
    }

    fn apply_owner_change<S>(
        &mut self,
        world: &mut S,
        from: ConnectionId,
        net_id: NetId,
        new_owner: Option<ConnectionId>,
        authority: Authority,
        effects: &mut Vec<ApplyEffect<E>>,
    ) where
        S: EntityStore<Entity = E>,
    {
        if self.side.is_server() {
            self.reject(effects, from, Some(net_id), "owner change sent to server");
            return;
        }
        let Some(entity) = self.registry.borrow().resolve(net_id) else {
            debug!(%net_id, "owner change for unknown entity ignored");
            return;
        };
        let Some(Ok(mut identity)) = world.get_typed::<NetworkIdentity>(entity) else {
            return;
        };
        let mine = self.side.connection().is_some() && new_owner == self.side.connection();
        identity.owner_client = new_owner;
        identity.authority = if mine && authority == Authority::Owner {
            Authority::Owner
        } else {
            Authority::Remote
        };
        world.set_typed(entity, &identity);
        effects.push(ApplyEffect::OwnerChanged { net_id, new_owner });
    }

    fn apply_input<S>(
        &mut self,
        world: &S,
        from: ConnectionId,
        input: InputMessage,
        effects: &mut Vec<ApplyEffect<E>>,
    ) where
        S: EntityStore<Entity = E>,
    {
        if !self.side.is_server() {
            self.reject(effects, from, Some(input.net_id), "input sent to client");
            return;
        }
        let Some(entity) = self.registry.borrow().resolve(input.net_id) else {
            debug!(net_id = %input.net_id, "input for unknown entity ignored");
            return;
        };
        if self.owner_of(world, input.net_id, entity) != Some(from) {
            warn!(net_id = %input.net_id, %from, "rejected input from non-owner");
            self.reject(effects, from, Some(input.net_id), "input from non-owner");
            return;
        }
        effects.push(ApplyEffect::Input {
            from,
            message: input,
        });
    }

    fn owner_of<S>(&self, world: &S, net_id: NetId, entity: E) -> Option<ConnectionId>
    where
        S: EntityStore<Entity = E>,
    {
        let store = self.registry.borrow();
        store.scope().owner(net_id).or_else(|| {
            world
                .get_typed::<NetworkIdentity>(entity)
                .and_then(Result::ok)
                .and_then(|identity| identity.owner_client)
        })
    }

    fn reject(
        &mut self,
        effects: &mut Vec<ApplyEffect<E>>,
        from: ConnectionId,
        net_id: Option<NetId>,
        reason: &'static str,
    ) {
        self.stats.rejected += 1;
        effects.push(ApplyEffect::Rejected {
            from,
            net_id,
            reason,
        });
    }

    /// Shared store handle.
    pub fn registry(&self) -> SharedRegistry<E> {
        Rc::clone(&self.registry)
    }
}

/// Local entity spawned ahead of the server's confirmation for `net_id`.
fn find_placeholder<S: EntityStore>(world: &S, net_id: NetId) -> Option<S::Entity> {
    world
        .query(&[IDENTITY_COMPONENT])
        .into_iter()
        .find(|&entity| {
            matches!(
                world.get_typed::<NetworkIdentity>(entity),
                Some(Ok(identity)) if identity.predicted && identity.net_id == Some(net_id)
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelType;
    use crate::store::ReplicatedEntityStore;
    use netsync_ecs::HostWorld;

    type Entity = <HostWorld as EntityStore>::Entity;

    fn client_applier() -> Applier<Entity> {
        let mut applier = Applier::client(
            ReplicatedEntityStore::shared(),
            ComponentRegistry::with_builtin(),
            ReplicationConfig::default(),
        );
        applier.components.register_opaque("Health");
        applier
    }

    fn received(message: Message) -> Received {
        Received {
            from: ConnectionId::SERVER,
            channel: ChannelType::Reliable,
            tick: 1,
            message,
        }
    }

    fn spawn_msg(net_id: u64, parent: Option<u64>, hp: i64) -> Message {
        let identity = NetworkIdentity::new(Authority::Server).sync("Health", SyncRule::default());
        Message::Spawn(SpawnMessage {
            net_id: NetId(net_id),
            owner_client: None,
            authority: Authority::Server,
            parent_net_id: parent.map(NetId),
            components: ComponentMap::new()
                .with("Health", ComponentValue::Int(hp))
                .with(IDENTITY_COMPONENT, identity.to_value()),
        })
    }

    #[test]
    fn test_spawn_is_forced_remote() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        let effects = applier.apply(&mut world, received(spawn_msg(5, None, 10)), 0.0);

        let [ApplyEffect::Spawned { entity, .. }] = effects.as_slice() else {
            panic!("unexpected effects {effects:?}");
        };
        let identity = world
            .get_typed::<NetworkIdentity>(*entity)
            .expect("identity")
            .expect("valid");
        assert_eq!(identity.authority, Authority::Remote);
        assert_eq!(identity.net_id, Some(NetId(5)));
    }

    #[test]
    fn test_second_spawn_degrades_to_update() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        applier.apply(&mut world, received(spawn_msg(5, None, 10)), 0.0);
        let effects = applier.apply(&mut world, received(spawn_msg(5, None, 4)), 0.1);

        assert!(effects.is_empty());
        assert_eq!(world.len(), 1);
        let entity = applier.registry().borrow().resolve(NetId(5)).expect("known");
        assert_eq!(world.get(entity, "Health"), Some(&ComponentValue::Int(4)));
    }

    #[test]
    fn test_child_waits_for_parent() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();

        let effects = applier.apply(&mut world, received(spawn_msg(5, Some(9), 1)), 0.0);
        assert!(effects.is_empty());
        assert!(applier.pending().contains(NetId(5)));
        assert_eq!(world.len(), 0);

        let effects = applier.apply(&mut world, received(spawn_msg(9, None, 2)), 0.1);
        assert_eq!(effects.len(), 2);
        let registry = applier.registry();
        let store = registry.borrow();
        let parent = store.resolve(NetId(9)).expect("parent");
        let child = store.resolve(NetId(5)).expect("child");
        assert_eq!(world.parent(child), Some(parent));
    }

    #[test]
    fn test_unknown_update_requests_resync() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        let effects = applier.apply(
            &mut world,
            received(Message::Update(UpdateMessage {
                net_id: NetId(77),
                owner_client: None,
                components: ComponentMap::new().with("Health", ComponentValue::Int(1)),
                seq: None,
                ack_seq: None,
            })),
            0.0,
        );
        assert_eq!(effects, vec![ApplyEffect::ResyncNeeded { net_id: NetId(77) }]);
        assert_eq!(applier.stats().unknown, 1);
    }

    #[test]
    fn test_unknown_component_is_rejected() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        applier.apply(&mut world, received(spawn_msg(5, None, 10)), 0.0);
        let effects = applier.apply(
            &mut world,
            received(Message::Update(UpdateMessage {
                net_id: NetId(5),
                owner_client: None,
                components: ComponentMap::new().with("Mystery", ComponentValue::Int(1)),
                seq: None,
                ack_seq: None,
            })),
            0.1,
        );
        assert!(matches!(
            effects.as_slice(),
            [ApplyEffect::Rejected { reason: "invalid component", .. }]
        ));
    }

    #[test]
    fn test_client_despawn_purges_store() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        applier.apply(&mut world, received(spawn_msg(5, None, 10)), 0.0);
        let effects = applier.apply(
            &mut world,
            received(Message::Despawn { net_id: NetId(5) }),
            0.1,
        );
        assert!(matches!(effects.as_slice(), [ApplyEffect::Despawned { .. }]));
        assert!(world.is_empty());
        assert!(applier.registry().borrow().is_forgotten(NetId(5)));
    }

    #[test]
    fn test_orphans_expire() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        applier.apply(&mut world, received(spawn_msg(5, Some(9), 1)), 0.0);
        assert!(applier.expire_pending(1.0).is_empty());
        assert_eq!(applier.expire_pending(10.0), vec![NetId(5)]);
        assert_eq!(applier.stats().expired, 1);
    }

    #[test]
    fn test_server_spawn_adopts_prediction_placeholder() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        let mut identity = NetworkIdentity::new(Authority::Owner).sync("Health", SyncRule::default());
        identity.net_id = Some(NetId(5));
        identity.predicted = true;
        let placeholder = world.spawn(
            ComponentMap::new()
                .with("Health", ComponentValue::Int(1))
                .with(IDENTITY_COMPONENT, identity.to_value()),
        );

        let effects = applier.apply(&mut world, received(spawn_msg(5, None, 10)), 0.0);
        assert_eq!(
            effects,
            vec![ApplyEffect::Spawned {
                net_id: NetId(5),
                entity: placeholder
            }]
        );
        assert_eq!(world.len(), 1);
        assert_eq!(world.get(placeholder, "Health"), Some(&ComponentValue::Int(10)));
        let adopted = world
            .get_typed::<NetworkIdentity>(placeholder)
            .expect("identity")
            .expect("valid");
        assert!(!adopted.predicted);
        assert_eq!(applier.registry().borrow().resolve(NetId(5)), Some(placeholder));
    }

    #[test]
    fn test_placeholder_for_other_net_id_is_left_alone() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        let mut identity = NetworkIdentity::new(Authority::Owner).sync("Health", SyncRule::default());
        identity.net_id = Some(NetId(6));
        identity.predicted = true;
        world.spawn(ComponentMap::new().with(IDENTITY_COMPONENT, identity.to_value()));

        applier.apply(&mut world, received(spawn_msg(5, None, 10)), 0.0);
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn test_repeated_spawn_keeps_sender_tick() {
        let mut applier = client_applier();
        let mut world = HostWorld::new();
        let identity = NetworkIdentity::new(Authority::Server)
            .sync(Transform::NAME, SyncRule::default().interpolated());
        let spawn = |x: f32| {
            Message::Spawn(SpawnMessage {
                net_id: NetId(5),
                owner_client: None,
                authority: Authority::Server,
                parent_net_id: None,
                components: ComponentMap::new()
                    .with(
                        Transform::NAME,
                        Transform::from_position(Vec3::new(x, 0.0, 0.0)).to_value(),
                    )
                    .with(IDENTITY_COMPONENT, identity.to_value()),
            })
        };
        applier.apply(&mut world, received(spawn(0.0)), 0.0);

        let resync = Received {
            tick: 42,
            ..received(spawn(2.0))
        };
        let effects = applier.apply(&mut world, resync, 0.5);
        assert!(
            matches!(
                effects.as_slice(),
                [ApplyEffect::Interpolate { net_id: NetId(5), sent_tick: 42, .. }]
            ),
            "unexpected effects {effects:?}"
        );
    }
}
