//! Replication client with prediction and reconciliation.

use anyhow::Result;
use glam::Quat;
use netsync_core::{
    ConnectionId, EntityStore, EntityStoreExt, NetComponent, NetId, PlayerInput, SimTick,
    Transform, Velocity,
};
use netsync_net::protocol::MAX_INPUT_FRAMES;
use netsync_net::{
    compute_schema_hash, ApplyEffect, Applier, ChannelType, ClientPredictor, Connection,
    ConnectionStats, InboundStats, InputMessage, Interpolator, Message, MessageSink,
    MovementState, NetSyncConfig, PredictionMetrics, Reconciliation, ReplicationStats,
    Replicator, SendTarget, SharedRegistry, SyncEvent,
};
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// Replication client with networking and prediction.
pub struct ReplicationClient<S: EntityStore> {
    world: S,
    connection: Connection,
    registry: SharedRegistry<S::Entity>,
    replicator: Replicator<S::Entity>,
    applier: Applier<S::Entity>,

    /// Client predictor for rollback/replay.
    predictor: ClientPredictor,

    /// Entity interpolator for smooth remote entities.
    interpolator: Interpolator<S::Entity>,

    config: NetSyncConfig,
    client_tick: SimTick,

    /// Connection id assigned by the server.
    connection_id: Option<ConnectionId>,

    /// Input held for the next prediction step.
    input: PlayerInput,

    /// When a resync was last requested, per entity.
    resync_requested: BTreeMap<NetId, f64>,

    events: Vec<SyncEvent>,
}

impl<S: EntityStore> ReplicationClient<S> {
    /// Create a client around `world`, talking to the server through
    /// `connection`. Nothing is sent until the server assigns an identity.
    pub fn new(
        world: S,
        connection: Connection,
        registry: SharedRegistry<S::Entity>,
        config: NetSyncConfig,
    ) -> Self {
        Self {
            world,
            connection,
            replicator: Replicator::client(registry.clone()),
            applier: Applier::client(
                registry.clone(),
                netsync_core::ComponentRegistry::with_builtin(),
                config.replication.clone(),
            ),
            registry,
            predictor: ClientPredictor::new(config.prediction.clone()),
            interpolator: Interpolator::new(config.interpolation.clone()),
            config,
            client_tick: SimTick::ZERO,
            connection_id: None,
            input: PlayerInput::idle(),
            resync_requested: BTreeMap::new(),
            events: Vec::new(),
        }
    }

    /// Accept component `name` from the server without validation.
    pub fn register_opaque(&mut self, name: &str) {
        self.applier.components_mut().register_opaque(name);
    }

    /// Accept typed component `T` from the server.
    pub fn register_component<T: NetComponent>(&mut self) {
        self.applier.components_mut().register::<T>();
    }

    /// Set the input applied from the next tick on.
    pub fn apply_input(&mut self, input: PlayerInput) {
        self.input = input;
    }

    /// Run a single client tick: apply server messages, reconcile and
    /// predict the own character, smooth remote entities, then send local
    /// changes.
    #[instrument(skip(self), fields(tick = self.client_tick.0, connection = ?self.connection_id))]
    pub fn tick(&mut self) -> Result<()> {
        let now = self.now();
        let dt = self.dt();
        self.connection.set_tick(self.client_tick.0);

        for received in self.connection.drain() {
            if received.from != ConnectionId::SERVER {
                warn!(from = %received.from, "message from a peer other than the server dropped");
                continue;
            }
            for effect in self.applier.apply(&mut self.world, received, now) {
                self.handle_effect(effect, now);
            }
        }
        for net_id in self.applier.expire_pending(now) {
            debug!(%net_id, "pending child spawn expired");
        }

        self.run_prediction(now, dt as f32);
        self.interpolator.advance(&mut self.world, dt as f32);

        self.replicator
            .tick(&mut self.world, now, Some(&mut self.connection));
        self.world.clear_trackers();
        self.client_tick = self.client_tick.advance(1);
        Ok(())
    }

    fn handle_effect(&mut self, effect: ApplyEffect<S::Entity>, now: f64) {
        let tick = self.client_tick.0;
        let peer = self.connection_id.unwrap_or(ConnectionId::SERVER);
        match effect {
            ApplyEffect::IdentityAssigned {
                connection,
                prefix,
                net_id,
                schema_hash,
            } => {
                if schema_hash != compute_schema_hash() {
                    warn!(
                        expected = compute_schema_hash(),
                        actual = schema_hash,
                        "server schema hash differs from this build"
                    );
                }
                self.connection_id = Some(connection);
                self.replicator.assign_identity(connection, prefix);
                info!(%connection, prefix, character = ?net_id, "identity assigned");
                if let Some(net_id) = net_id {
                    let entity = self.registry.borrow().resolve(net_id);
                    if let Some(entity) = entity {
                        self.start_prediction(net_id, entity);
                    }
                }
            }
            ApplyEffect::Spawned { net_id, entity } => {
                if self.my_net_id() == Some(net_id) {
                    self.start_prediction(net_id, entity);
                }
                self.events.push(SyncEvent::Spawned { tick, peer, net_id });
            }
            ApplyEffect::ServerState {
                net_id,
                entity,
                position,
                velocity,
                ack_seq,
            } => {
                if !self.predictor.is_tracked(net_id) {
                    self.start_prediction(net_id, entity);
                }
                self.predictor
                    .receive_server_state(net_id, position, velocity, ack_seq);
            }
            ApplyEffect::Interpolate {
                net_id,
                entity,
                target,
                sent_tick,
            } => {
                self.interpolator.set_target(net_id, entity, target, sent_tick);
            }
            ApplyEffect::ResyncNeeded { net_id } => self.request_resync(net_id, now),
            ApplyEffect::Despawned { net_id, .. } => {
                self.predictor.remove(net_id);
                self.interpolator.remove(net_id);
                self.resync_requested.remove(&net_id);
                self.events.push(SyncEvent::Despawned { tick, peer, net_id });
            }
            ApplyEffect::OwnerChanged { net_id, new_owner } => {
                self.events.push(SyncEvent::OwnerChanged {
                    tick,
                    peer,
                    net_id,
                    new_owner,
                });
            }
            ApplyEffect::Rejected {
                from,
                net_id,
                reason,
            } => {
                self.events.push(SyncEvent::Rejected {
                    tick,
                    peer,
                    from,
                    net_id,
                    reason: reason.to_string(),
                });
            }
            ApplyEffect::ResyncRequested { .. } | ApplyEffect::Input { .. } => {}
        }
    }

    fn start_prediction(&mut self, net_id: NetId, entity: S::Entity) {
        let position = match self.world.get_typed::<Transform>(entity) {
            Some(Ok(transform)) => transform.position,
            _ => return,
        };
        self.predictor.track(net_id, MovementState::at(position));
        debug!(%net_id, "predicting own character");
    }

    fn request_resync(&mut self, net_id: NetId, now: f64) {
        let cooldown = self.config.replication.resync_cooldown;
        if self
            .resync_requested
            .get(&net_id)
            .is_some_and(|at| now - at < cooldown)
        {
            return;
        }
        match self.connection.send(
            ChannelType::Reliable,
            SendTarget::Connection(ConnectionId::SERVER),
            &Message::ResyncRequest { net_id },
        ) {
            Ok(()) => {
                self.resync_requested.insert(net_id, now);
                self.events.push(SyncEvent::Resync {
                    tick: self.client_tick.0,
                    peer: self.connection_id.unwrap_or(ConnectionId::SERVER),
                    net_id,
                });
                debug!(%net_id, "requested resync");
            }
            Err(err) => warn!(%net_id, error = %err, "failed to request resync"),
        }
    }

    fn run_prediction(&mut self, now: f64, dt: f32) {
        let Some(net_id) = self.my_net_id() else {
            return;
        };
        if !self.predictor.is_tracked(net_id) {
            return;
        }

        match self.predictor.reconcile(net_id) {
            Some(Reconciliation::Snapped {
                ack_seq,
                error,
                replayed,
            }) => self.events.push(SyncEvent::Reconciled {
                tick: self.client_tick.0,
                peer: self.connection_id.unwrap_or(ConnectionId::SERVER),
                net_id,
                ack_seq,
                error,
                replayed,
            }),
            Some(Reconciliation::Blended { ack_seq, error }) => {
                self.events.push(SyncEvent::Reconciled {
                    tick: self.client_tick.0,
                    peer: self.connection_id.unwrap_or(ConnectionId::SERVER),
                    net_id,
                    ack_seq,
                    error,
                    replayed: 0,
                })
            }
            Some(Reconciliation::Match { .. }) | None => {}
        }

        let input = self.input;
        let Some(frame) = self.predictor.predict(net_id, input, dt) else {
            return;
        };
        let entity = self.registry.borrow().resolve(net_id);
        if let Some(entity) = entity {
            let scale = match self.world.get_typed::<Transform>(entity) {
                Some(Ok(transform)) => transform.scale,
                _ => glam::Vec3::ONE,
            };
            self.world.set_typed(
                entity,
                &Transform {
                    position: frame.state.position,
                    rotation: Quat::from_rotation_y(input.yaw),
                    scale,
                },
            );
            self.world.set_typed(entity, &Velocity(frame.state.velocity));
        }

        if self.predictor.should_send_input(net_id, &input, now) {
            let max = self
                .config
                .prediction
                .max_inputs_per_message
                .clamp(1, MAX_INPUT_FRAMES);
            let frames = self.predictor.unacked_inputs(net_id, max);
            if frames.is_empty() {
                return;
            }
            match self.connection.send(
                ChannelType::Unreliable,
                SendTarget::Connection(ConnectionId::SERVER),
                &Message::Input(InputMessage { net_id, frames }),
            ) {
                Ok(()) => self.predictor.mark_input_sent(net_id, input, now),
                Err(err) => warn!(%net_id, error = %err, "failed to send input"),
            }
        }
    }

    fn now(&self) -> f64 {
        self.client_tick.0 as f64 * self.dt()
    }

    fn dt(&self) -> f64 {
        1.0 / self.config.replication.tick_rate_hz.max(1.0)
    }

    /// Own character, once assigned.
    pub fn my_net_id(&self) -> Option<NetId> {
        self.registry.borrow().identities().my_net_id()
    }

    /// Connection id assigned by the server.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Take the events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Get current client tick.
    pub fn client_tick(&self) -> SimTick {
        self.client_tick
    }

    /// Get the host store.
    pub fn world(&self) -> &S {
        &self.world
    }

    /// Get the host store mutably, e.g. to spawn client-owned entities.
    pub fn world_mut(&mut self) -> &mut S {
        &mut self.world
    }

    /// Get the shared replicated entity store.
    pub fn registry(&self) -> &SharedRegistry<S::Entity> {
        &self.registry
    }

    /// Get the predictor.
    pub fn predictor(&self) -> &ClientPredictor {
        &self.predictor
    }

    /// Get the interpolator.
    pub fn interpolator(&self) -> &Interpolator<S::Entity> {
        &self.interpolator
    }

    /// Get current prediction metrics.
    pub fn prediction_metrics(&self) -> &PredictionMetrics {
        self.predictor.metrics()
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
