//! Authoritative replication server.

use anyhow::{Context, Result};
use glam::Quat;
use netsync_core::{
    Authority, ComponentMap, ConnectionId, EntityStore, EntityStoreExt, NetComponent, NetId,
    NetworkIdentity, PlayerInput, SimTick, SyncRule, Transform, Velocity, IDENTITY_COMPONENT,
};
use netsync_net::{
    compute_schema_hash, ApplyEffect, Applier, ChannelType, Connection, ConnectionStats,
    DisconnectPolicy, InboundStats, InputMessage, KinematicMovement, Message, MessageSink,
    MovementModel, MovementState, NetSyncConfig, ReplicationStats, Replicator, SendTarget,
    SharedRegistry, SyncEvent, UpdateValidator,
};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Replication rate of character transforms.
const CHARACTER_RATE_HZ: f32 = 20.0;

/// Identity of a player character owned by `owner`: server-authoritative,
/// moved by the owner's inputs, interpolated on other clients.
pub fn character_identity(owner: ConnectionId) -> NetworkIdentity {
    NetworkIdentity::new(Authority::Server)
        .owned_by(owner)
        .sync(Transform::NAME, SyncRule::rate(CHARACTER_RATE_HZ).interpolated())
        .sync(Velocity::NAME, SyncRule::rate(CHARACTER_RATE_HZ))
}

/// Client state tracked by the server.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    /// Player character, once assigned.
    character: Option<NetId>,

    /// Tick the client joined at.
    connected_at: SimTick,
}

impl ConnectedClient {
    /// Get the player character.
    pub fn character(&self) -> Option<NetId> {
        self.character
    }

    /// Get the tick the client joined at.
    pub fn connected_at(&self) -> SimTick {
        self.connected_at
    }
}

/// Authoritative replication server over a host entity store.
pub struct ReplicationServer<S: EntityStore> {
    world: S,
    connection: Connection,
    registry: SharedRegistry<S::Entity>,
    replicator: Replicator<S::Entity>,
    applier: Applier<S::Entity>,
    movement: Box<dyn MovementModel>,
    movement_states: BTreeMap<NetId, MovementState>,
    clients: BTreeMap<ConnectionId, ConnectedClient>,
    config: NetSyncConfig,
    current_tick: SimTick,
    schema_hash: u64,
    events: Vec<SyncEvent>,
}

impl<S: EntityStore> ReplicationServer<S> {
    /// Create a server around `world`, sending through `connection`.
    pub fn new(
        world: S,
        connection: Connection,
        registry: SharedRegistry<S::Entity>,
        config: NetSyncConfig,
    ) -> Self {
        info!(codec = connection.codec_name(), "replication server started");
        Self {
            world,
            connection,
            replicator: Replicator::server(registry.clone()),
            applier: Applier::server(
                registry.clone(),
                netsync_core::ComponentRegistry::with_builtin(),
                config.replication.clone(),
            ),
            registry,
            movement: Box::new(KinematicMovement::default()),
            movement_states: BTreeMap::new(),
            clients: BTreeMap::new(),
            config,
            current_tick: SimTick::ZERO,
            schema_hash: compute_schema_hash(),
            events: Vec::new(),
        }
    }

    /// Replace the movement model applied to client inputs.
    pub fn set_movement(&mut self, movement: Box<dyn MovementModel>) {
        self.movement = movement;
    }

    /// Install an extra check for client component writes.
    pub fn set_validator(&mut self, validator: UpdateValidator) {
        self.applier.set_validator(validator);
    }

    /// Accept component `name` from clients without validation.
    pub fn register_opaque(&mut self, name: &str) {
        self.applier.components_mut().register_opaque(name);
    }

    /// Accept typed component `T` from clients.
    pub fn register_component<T: NetComponent>(&mut self) {
        self.applier.components_mut().register::<T>();
    }

    /// Register a new client: hand out its identity and bring it up to date
    /// with every entity that already exists.
    #[instrument(skip(self), fields(tick = self.current_tick.0))]
    pub fn connect(&mut self, connection: ConnectionId) -> Result<()> {
        if self.clients.contains_key(&connection) {
            warn!(%connection, "client already connected");
            return Ok(());
        }
        self.clients.insert(
            connection,
            ConnectedClient {
                character: None,
                connected_at: self.current_tick,
            },
        );
        self.send_identity(connection, None)?;
        self.replicator
            .sync_scope(&self.world, connection, &mut self.connection);
        self.events.push(SyncEvent::Connected {
            tick: self.current_tick.0,
            connection,
        });
        info!(%connection, "client connected");
        Ok(())
    }

    /// Spawn a player character for `connection` at `position` and tell the
    /// client which entity it predicts.
    pub fn assign_character(&mut self, connection: ConnectionId, position: glam::Vec3) -> Result<NetId> {
        if !self.clients.contains_key(&connection) {
            anyhow::bail!("unknown connection {connection}");
        }
        let net_id = self
            .replicator
            .allocate_net_id()
            .context("Failed to allocate character net id")?;
        let mut identity = character_identity(connection);
        identity.net_id = Some(net_id);

        let components = ComponentMap::new()
            .with(Transform::NAME, Transform::from_position(position).to_value())
            .with(Velocity::NAME, Velocity::default().to_value())
            .with(IDENTITY_COMPONENT, identity.to_value());
        self.world.spawn(components);
        self.movement_states
            .insert(net_id, MovementState::at(position));

        if let Some(client) = self.clients.get_mut(&connection) {
            client.character = Some(net_id);
        }
        self.send_identity(connection, Some(net_id))?;
        info!(%connection, %net_id, "character assigned");
        Ok(net_id)
    }

    fn send_identity(&mut self, connection: ConnectionId, net_id: Option<NetId>) -> Result<()> {
        let message = Message::IdentityAssignment {
            net_id,
            connection,
            prefix: connection.prefix(),
            schema_hash: self.schema_hash,
        };
        self.connection
            .send(
                ChannelType::Reliable,
                SendTarget::Connection(connection),
                &message,
            )
            .with_context(|| format!("Failed to send identity assignment to {connection}"))
    }

    /// Tear down a client: its scope is dropped and its entities are
    /// despawned or handed to the server, per the disconnect policy.
    #[instrument(skip(self), fields(tick = self.current_tick.0))]
    pub fn disconnect(&mut self, connection: ConnectionId) -> Result<()> {
        let Some(client) = self.clients.remove(&connection) else {
            warn!(%connection, "disconnect for unknown client");
            return Ok(());
        };
        let owned = {
            let mut store = self.registry.borrow_mut();
            let owned = store.scope().owned_by(connection);
            store.scope_mut().remove_connection(connection);
            owned
        };

        match self.config.server.disconnect_policy {
            DisconnectPolicy::Despawn => {
                for net_id in &owned {
                    let entity = self.registry.borrow().resolve(*net_id);
                    if let Some(entity) = entity {
                        self.world.despawn(entity);
                    }
                    self.movement_states.remove(net_id);
                }
            }
            DisconnectPolicy::TransferToServer => {
                for net_id in &owned {
                    self.replicator.change_owner(
                        &mut self.world,
                        *net_id,
                        None,
                        Authority::Server,
                        &mut self.connection,
                    );
                }
            }
        }

        self.events.push(SyncEvent::Disconnected {
            tick: self.current_tick.0,
            connection,
        });
        info!(
            %connection,
            owned = owned.len(),
            character = ?client.character,
            policy = ?self.config.server.disconnect_policy,
            "client disconnected"
        );
        Ok(())
    }

    /// Hand `net_id` to a new owner.
    pub fn set_owner(
        &mut self,
        net_id: NetId,
        new_owner: Option<ConnectionId>,
        authority: Authority,
    ) -> bool {
        self.replicator.change_owner(
            &mut self.world,
            net_id,
            new_owner,
            authority,
            &mut self.connection,
        )
    }

    /// Run a single replication tick: apply inbound messages, then send
    /// everything that changed.
    #[instrument(skip(self), fields(tick = self.current_tick.0, client_count = self.clients.len()))]
    pub fn tick(&mut self) -> Result<()> {
        let now = self.now();
        self.connection.set_tick(self.current_tick.0);

        for received in self.connection.drain() {
            if !self.clients.contains_key(&received.from) {
                warn!(from = %received.from, kind = received.message.kind(), "message from unknown client dropped");
                continue;
            }
            for effect in self.applier.apply(&mut self.world, received, now) {
                self.handle_effect(effect);
            }
        }
        for net_id in self.applier.expire_pending(now) {
            debug!(%net_id, "pending child spawn expired");
        }

        self.replicator
            .tick(&mut self.world, now, Some(&mut self.connection));
        self.world.clear_trackers();
        self.current_tick = self.current_tick.advance(1);
        Ok(())
    }

    fn handle_effect(&mut self, effect: ApplyEffect<S::Entity>) {
        let tick = self.current_tick.0;
        match effect {
            ApplyEffect::Input { from, message } => self.apply_inputs(from, message),
            ApplyEffect::ResyncRequested { from, net_id } => {
                if self
                    .replicator
                    .resync(&self.world, from, net_id, &mut self.connection)
                {
                    self.events.push(SyncEvent::Resync {
                        tick,
                        peer: ConnectionId::SERVER,
                        net_id,
                    });
                }
            }
            ApplyEffect::Spawned { net_id, .. } => {
                self.events.push(SyncEvent::Spawned {
                    tick,
                    peer: ConnectionId::SERVER,
                    net_id,
                });
            }
            ApplyEffect::Despawned { net_id, .. } => {
                self.movement_states.remove(&net_id);
                self.events.push(SyncEvent::Despawned {
                    tick,
                    peer: ConnectionId::SERVER,
                    net_id,
                });
            }
            ApplyEffect::Rejected {
                from,
                net_id,
                reason,
            } => {
                self.events.push(SyncEvent::Rejected {
                    tick,
                    peer: ConnectionId::SERVER,
                    from,
                    net_id,
                    reason: reason.to_string(),
                });
            }
            ApplyEffect::ServerState { .. }
            | ApplyEffect::Interpolate { .. }
            | ApplyEffect::ResyncNeeded { .. }
            | ApplyEffect::IdentityAssigned { .. }
            | ApplyEffect::OwnerChanged { .. } => {}
        }
    }

    /// Run the owner's inputs through the movement model and acknowledge
    /// the highest applied sequence.
    fn apply_inputs(&mut self, from: ConnectionId, message: InputMessage) {
        let net_id = message.net_id;
        let Some(entity) = self.registry.borrow().resolve(net_id) else {
            return;
        };
        let current = match self.world.get_typed::<Transform>(entity) {
            Some(Ok(transform)) => transform,
            _ => {
                debug!(%net_id, "input for entity without transform ignored");
                return;
            }
        };

        let last = self.replicator.input_ack(net_id).unwrap_or(0);
        let mut state = self
            .movement_states
            .get(&net_id)
            .copied()
            .unwrap_or_else(|| MovementState::at(current.position));
        let mut applied = None;
        let mut yaw = None;
        for frame in message.frames.iter().filter(|f| f.seq > last) {
            let input = match PlayerInput::from_value(&frame.input) {
                Ok(input) => input,
                Err(err) => {
                    warn!(%net_id, %from, seq = frame.seq, error = %err, "malformed input frame");
                    continue;
                }
            };
            state = self.movement.step(&state, &input, frame.dt);
            applied = Some(frame.seq);
            yaw = Some(input.yaw);
        }
        let Some(seq) = applied else {
            return;
        };

        let transform = Transform {
            position: state.position,
            rotation: yaw.map(Quat::from_rotation_y).unwrap_or(current.rotation),
            scale: current.scale,
        };
        self.world.set_typed(entity, &transform);
        self.world.set_typed(entity, &Velocity(state.velocity));
        self.movement_states.insert(net_id, state);
        self.replicator.record_input_ack(net_id, seq);
    }

    fn now(&self) -> f64 {
        self.current_tick.0 as f64 / self.config.replication.tick_rate_hz.max(1.0)
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Get current tick.
    pub fn current_tick(&self) -> SimTick {
        self.current_tick
    }

    /// Get number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Get a connected client.
    pub fn client(&self, connection: ConnectionId) -> Option<&ConnectedClient> {
        self.clients.get(&connection)
    }

    /// Get the host store.
    pub fn world(&self) -> &S {
        &self.world
    }

    /// Get the host store mutably, e.g. to spawn server entities.
    pub fn world_mut(&mut self) -> &mut S {
        &mut self.world
    }

    /// Get the shared replicated entity store.
    pub fn registry(&self) -> &SharedRegistry<S::Entity> {
        &self.registry
    }

    /// Outbound counters.
    pub fn replication_stats(&self) -> ReplicationStats {
        self.replicator.stats()
    }

    /// Inbound counters.
    pub fn inbound_stats(&self) -> InboundStats {
        self.applier.stats()
    }

    /// Traffic counters.
    pub fn connection_stats(&self) -> ConnectionStats {
        self.connection.stats()
    }
}
