//! Outbound replication pass.
//!
//! Once per tick the [`Replicator`] walks the host store and turns local
//! changes into protocol messages:
//!
//! 1. discovery of entities whose identity component changed,
//! 2. a change pass over every component type some entity declares,
//! 3. spawn emission for entities without a net id yet,
//! 4. update emission with authority, rate and hash checks,
//! 5. per-connection fanout on the server (update when in scope, spawn otherwise),
//! 6. despawn emission for entities that lost their identity.

use crate::change_cache::SendDecision;
use crate::channel::{ChannelType, SendTarget};
use crate::connection::MessageSink;
use crate::protocol::{Message, SpawnMessage, UpdateMessage};
use crate::registry::{IdAllocError, NetIdAllocator};
use crate::store::{ReplicatedEntityStore, SharedRegistry};
use netsync_core::{
    resolve_authority, Authority, ComponentMap, ConnectionId, EntityStore, EntityStoreExt, NetId,
    NetComponent, NetworkIdentity, Origin, Transform, IDENTITY_COMPONENT,
};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::{debug, trace, warn};

/// Longest parent chain followed when ordering late-join spawns.
const MAX_PARENT_DEPTH: usize = 64;

/// Outbound counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Spawn messages sent.
    pub spawns_sent: u64,
    /// Update messages sent.
    pub updates_sent: u64,
    /// Despawn messages sent.
    pub despawns_sent: u64,
    /// Ownership change messages sent.
    pub owner_changes_sent: u64,
    /// Component values carried by updates.
    pub components_sent: u64,
    /// Changes skipped because the value hash did not change.
    pub suppressed: u64,
    /// Changes postponed by a rate limit.
    pub rate_limited: u64,
    /// Changes this peer was not allowed to originate.
    pub authority_skips: u64,
    /// Messages the sink refused.
    pub send_failures: u64,
}

struct Batch {
    net_id: NetId,
    owner: Option<ConnectionId>,
    components: ComponentMap,
    owner_authored: BTreeSet<String>,
    reliable: bool,
}

/// Outbound half of the replication pipeline.
pub struct Replicator<E> {
    registry: SharedRegistry<E>,
    origin: Origin,
    allocator: NetIdAllocator,
    pending_spawn: BTreeSet<E>,
    announce: BTreeSet<E>,
    deferred: BTreeSet<(E, String)>,
    input_acks: BTreeMap<NetId, u32>,
    acks_due: BTreeSet<NetId>,
    ack_sent_at: BTreeMap<NetId, f64>,
    stats: ReplicationStats,
}

impl<E: Copy + Ord + std::fmt::Debug> Replicator<E> {
    /// Server-side replicator allocating from prefix 0.
    pub fn server(registry: SharedRegistry<E>) -> Self {
        Self::new(registry, Origin::Server, NetIdAllocator::with_prefix(0))
    }

    /// Client-side replicator; it stays passive until
    /// [`Replicator::assign_identity`] is called.
    pub fn client(registry: SharedRegistry<E>) -> Self {
        Self::new(registry, Origin::Client(None), NetIdAllocator::new())
    }

    fn new(registry: SharedRegistry<E>, origin: Origin, allocator: NetIdAllocator) -> Self {
        Self {
            registry,
            origin,
            allocator,
            pending_spawn: BTreeSet::new(),
            announce: BTreeSet::new(),
            deferred: BTreeSet::new(),
            input_acks: BTreeMap::new(),
            acks_due: BTreeSet::new(),
            ack_sent_at: BTreeMap::new(),
            stats: ReplicationStats::default(),
        }
    }

    /// Adopt the connection id and net id prefix handed out by the server.
    pub fn assign_identity(&mut self, connection: ConnectionId, prefix: u32) {
        self.origin = Origin::Client(Some(connection));
        self.allocator.set_prefix(prefix);
    }

    /// Reserve a net id ahead of the spawn pass, e.g. to announce a
    /// character before its spawn is emitted.
    pub fn allocate_net_id(&mut self) -> Result<NetId, IdAllocError> {
        self.allocator.next_net_id()
    }

    /// Which side this replicator speaks for.
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Shared store handle.
    pub fn registry(&self) -> SharedRegistry<E> {
        Rc::clone(&self.registry)
    }

    /// Outbound counters so far.
    pub fn stats(&self) -> ReplicationStats {
        self.stats
    }

    /// Entities waiting for their spawn to be emitted.
    pub fn pending_spawns(&self) -> usize {
        self.pending_spawn.len()
    }

    /// Record that the owner's inputs up to `seq` were applied to `net_id`.
    pub fn record_input_ack(&mut self, net_id: NetId, seq: u32) {
        let acked = self.input_acks.entry(net_id).or_insert(0);
        if seq > *acked {
            *acked = seq;
            self.acks_due.insert(net_id);
        }
    }

    /// Highest input sequence applied for `net_id`.
    pub fn input_ack(&self, net_id: NetId) -> Option<u32> {
        self.input_acks.get(&net_id).copied()
    }

    /// Run the outbound pass. Without a sink the pass is a no-op.
    pub fn tick<S>(&mut self, world: &mut S, now: f64, sink: Option<&mut dyn MessageSink>)
    where
        S: EntityStore<Entity = E>,
    {
        let Some(sink) = sink else {
            trace!("no message sink; outbound pass skipped");
            return;
        };
        let registry = Rc::clone(&self.registry);
        let mut store = registry.borrow_mut();

        self.discover(world, &mut store);
        let considered = self.collect_changes(world, &store);
        self.emit_spawns(world, &mut store, now, sink);
        self.emit_updates(world, &mut store, considered, now, sink);
        if self.origin.is_server() {
            self.emit_acks(world, &mut store, now, sink);
        }
        self.emit_despawns(world, &mut store, sink);
    }

    fn discover<S>(&mut self, world: &S, store: &mut ReplicatedEntityStore<E>)
    where
        S: EntityStore<Entity = E>,
    {
        for entity in world.query_changed(IDENTITY_COMPONENT) {
            let identity = match world.get_typed::<NetworkIdentity>(entity) {
                Some(Ok(identity)) => identity,
                Some(Err(err)) => {
                    warn!(?entity, error = %err, "ignoring malformed network identity");
                    continue;
                }
                None => continue,
            };
            let is_new = store.track(entity, identity.sync_components.clone());
            if store.net_id_of(entity).is_none() {
                self.pending_spawn.insert(entity);
            } else if is_new && self.origin.is_server() {
                self.announce.insert(entity);
            }
            if is_new {
                debug!(
                    ?entity,
                    components = identity.sync_components.len(),
                    "tracking replicated entity"
                );
            }
        }
    }

    fn collect_changes<S>(&mut self, world: &S, store: &ReplicatedEntityStore<E>) -> BTreeSet<(E, String)>
    where
        S: EntityStore<Entity = E>,
    {
        let mut considered = std::mem::take(&mut self.deferred);
        for name in store.referenced_components() {
            for entity in world.query_changed(&name) {
                if self.pending_spawn.contains(&entity) || !store.is_tracked(entity) {
                    continue;
                }
                considered.insert((entity, name.clone()));
            }
        }
        considered
    }

    fn emit_spawns<S>(
        &mut self,
        world: &mut S,
        store: &mut ReplicatedEntityStore<E>,
        now: f64,
        sink: &mut dyn MessageSink,
    ) where
        S: EntityStore<Entity = E>,
    {
        let pending: Vec<E> = self.pending_spawn.iter().copied().collect();
        for entity in pending {
            let identity = match world.get_typed::<NetworkIdentity>(entity) {
                Some(Ok(identity)) if world.contains(entity) => identity,
                _ => {
                    self.pending_spawn.remove(&entity);
                    continue;
                }
            };
            if identity.authority == Authority::Remote {
                self.pending_spawn.remove(&entity);
                continue;
            }
            if identity.predicted {
                // Waits for the server's spawn; rediscovered if its identity changes.
                debug!(?entity, net_id = ?identity.net_id, "prediction placeholder not spawned");
                self.pending_spawn.remove(&entity);
                continue;
            }
            let Some(identity) = self.claim(entity, identity) else {
                continue;
            };
            let Some(net_id) = identity.net_id else {
                continue;
            };

            world.set_typed(entity, &identity);
            store.register(net_id, entity);
            store.track(entity, identity.sync_components.clone());
            if self.origin.is_server() {
                store.scope_mut().set_owner(net_id, identity.owner_client);
            }
            self.pending_spawn.remove(&entity);

            let spawn = build_spawn(world, store, entity, net_id, &identity);
            for (name, value) in spawn.components.iter() {
                if name != IDENTITY_COMPONENT {
                    store
                        .changes_mut()
                        .record(net_id, name, value.canonical_hash(), now);
                }
            }
            debug!(%net_id, ?entity, "spawning replicated entity");

            match self.origin {
                Origin::Server => self.fanout_spawn(store, &spawn, sink),
                Origin::Client(_) => {
                    self.send(
                        sink,
                        ChannelType::Reliable,
                        SendTarget::Connection(ConnectionId::SERVER),
                        &Message::Spawn(spawn),
                    );
                }
            }
        }

        let announce: Vec<E> = std::mem::take(&mut self.announce).into_iter().collect();
        for entity in announce {
            let Some(net_id) = store.net_id_of(entity) else {
                continue;
            };
            if let Some(spawn) = full_state(world, store, entity, net_id) {
                for (name, value) in spawn.components.iter() {
                    if name != IDENTITY_COMPONENT {
                        store
                            .changes_mut()
                            .record(net_id, name, value.canonical_hash(), now);
                    }
                }
                debug!(%net_id, ?entity, "announcing adopted entity");
                self.fanout_spawn(store, &spawn, sink);
            }
        }
    }

    /// Decide the net id and owner of an entity about to be spawned.
    fn claim(&mut self, entity: E, mut identity: NetworkIdentity) -> Option<NetworkIdentity> {
        match self.origin {
            Origin::Server => {}
            Origin::Client(None) => return None,
            Origin::Client(Some(me)) => {
                if !matches!(identity.authority, Authority::Owner | Authority::Any) {
                    debug!(?entity, "client-local entity is not replicated");
                    self.pending_spawn.remove(&entity);
                    return None;
                }
                identity.owner_client = Some(me);
            }
        }
        if identity.net_id.is_none() {
            match self.allocator.next_net_id() {
                Ok(net_id) => identity.net_id = Some(net_id),
                Err(err) => {
                    warn!(?entity, error = %err, "cannot allocate net id");
                    return None;
                }
            }
        }
        Some(identity)
    }

    fn emit_updates<S>(
        &mut self,
        world: &S,
        store: &mut ReplicatedEntityStore<E>,
        considered: BTreeSet<(E, String)>,
        now: f64,
        sink: &mut dyn MessageSink,
    ) where
        S: EntityStore<Entity = E>,
    {
        let mut identities: BTreeMap<E, Option<NetworkIdentity>> = BTreeMap::new();
        let mut batches: BTreeMap<E, Batch> = BTreeMap::new();

        for (entity, name) in considered {
            if !world.contains(entity) {
                continue;
            }
            let Some(net_id) = store.net_id_of(entity) else {
                continue;
            };
            let identity = identities
                .entry(entity)
                .or_insert_with(|| world.get_typed::<NetworkIdentity>(entity).and_then(Result::ok));
            let Some(identity) = identity.as_ref() else {
                continue;
            };
            let Some(rule) = identity.rule(&name).copied() else {
                continue;
            };
            let authority = resolve_authority(rule.authority, identity.authority);
            if !self.origin.may_originate(authority, identity.owner_client) {
                self.stats.authority_skips += 1;
                continue;
            }
            let Some(value) = world.get(entity, &name) else {
                continue;
            };

            let hash = value.canonical_hash();
            match store
                .changes()
                .check(net_id, &name, hash, now, rule.min_interval())
            {
                SendDecision::Unchanged => self.stats.suppressed += 1,
                SendDecision::RateLimited => {
                    self.stats.rate_limited += 1;
                    self.deferred.insert((entity, name));
                }
                SendDecision::Send => {
                    store.changes_mut().record(net_id, &name, hash, now);
                    let batch = batches.entry(entity).or_insert_with(|| Batch {
                        net_id,
                        owner: identity.owner_client,
                        components: ComponentMap::new(),
                        owner_authored: BTreeSet::new(),
                        reliable: false,
                    });
                    if authority == Authority::Owner {
                        batch.owner_authored.insert(name.clone());
                    }
                    batch.reliable |= rule.reliable;
                    batch.components.insert(name, value.clone());
                }
            }
        }

        for (entity, batch) in batches {
            self.stats.components_sent += batch.components.len() as u64;
            let channel = ChannelType::select(batch.reliable);
            match self.origin {
                Origin::Server => self.fanout_update(world, store, entity, batch, now, sink),
                Origin::Client(_) => {
                    let update = UpdateMessage {
                        net_id: batch.net_id,
                        owner_client: batch.owner,
                        components: batch.components,
                        seq: None,
                        ack_seq: None,
                    };
                    self.send(
                        sink,
                        channel,
                        SendTarget::Connection(ConnectionId::SERVER),
                        &Message::Update(update),
                    );
                }
            }
        }
    }

    fn fanout_update<S>(
        &mut self,
        world: &S,
        store: &mut ReplicatedEntityStore<E>,
        entity: E,
        batch: Batch,
        now: f64,
        sink: &mut dyn MessageSink,
    ) where
        S: EntityStore<Entity = E>,
    {
        let channel = ChannelType::select(batch.reliable);
        let mut spawn: Option<SpawnMessage> = None;
        let connections: Vec<ConnectionId> = store.scope().connections().collect();

        for conn in connections {
            if !store.scope().contains(conn, batch.net_id) {
                if spawn.is_none() {
                    spawn = full_state(world, store, entity, batch.net_id);
                }
                if let Some(spawn) = &spawn {
                    if self.send(
                        sink,
                        ChannelType::Reliable,
                        SendTarget::Connection(conn),
                        &Message::Spawn(spawn.clone()),
                    ) {
                        store.scope_mut().insert(conn, batch.net_id);
                    }
                }
                continue;
            }

            let is_owner = batch.owner == Some(conn);
            let mut components = batch.components.clone();
            if is_owner {
                for name in &batch.owner_authored {
                    components.remove(name);
                }
            }
            if components.is_empty() {
                continue;
            }
            let ack_seq = if is_owner {
                self.input_acks.get(&batch.net_id).copied()
            } else {
                None
            };
            if ack_seq.is_some() && components.contains(Transform::NAME) {
                self.acks_due.remove(&batch.net_id);
                self.ack_sent_at.insert(batch.net_id, now);
            }
            let update = UpdateMessage {
                net_id: batch.net_id,
                owner_client: batch.owner,
                components,
                seq: None,
                ack_seq,
            };
            self.send(
                sink,
                channel,
                SendTarget::Connection(conn),
                &Message::Update(update),
            );
        }
    }

    /// Acknowledge applied inputs to owners whose entity did not move enough
    /// to produce a regular update this tick.
    fn emit_acks<S>(
        &mut self,
        world: &S,
        store: &mut ReplicatedEntityStore<E>,
        now: f64,
        sink: &mut dyn MessageSink,
    ) where
        S: EntityStore<Entity = E>,
    {
        let due: Vec<NetId> = self.acks_due.iter().copied().collect();
        for net_id in due {
            let Some(entity) = store.resolve(net_id) else {
                self.acks_due.remove(&net_id);
                continue;
            };
            let Some(Ok(identity)) = world.get_typed::<NetworkIdentity>(entity) else {
                self.acks_due.remove(&net_id);
                continue;
            };
            let (Some(owner), Some(rule)) = (identity.owner_client, identity.rule(Transform::NAME))
            else {
                self.acks_due.remove(&net_id);
                continue;
            };
            if identity.authority_for(Transform::NAME) == Some(Authority::Owner) {
                self.acks_due.remove(&net_id);
                continue;
            }
            let last = self
                .ack_sent_at
                .get(&net_id)
                .copied()
                .unwrap_or(f64::NEG_INFINITY);
            let since_update = store
                .changes()
                .get(net_id, Transform::NAME)
                .map_or(f64::INFINITY, |record| now - record.sent_at);
            let min_interval = rule.min_interval();
            if now - last < min_interval
                || since_update < min_interval
                || !store.scope().contains(owner, net_id)
            {
                continue;
            }
            let Some(transform) = world.get(entity, Transform::NAME) else {
                continue;
            };
            let update = UpdateMessage {
                net_id,
                owner_client: Some(owner),
                components: ComponentMap::new().with(Transform::NAME, transform.clone()),
                seq: None,
                ack_seq: self.input_acks.get(&net_id).copied(),
            };
            if self.send(
                sink,
                ChannelType::Unreliable,
                SendTarget::Connection(owner),
                &Message::Update(update),
            ) {
                self.acks_due.remove(&net_id);
                self.ack_sent_at.insert(net_id, now);
                store.changes_mut().touch(net_id, Transform::NAME, now);
            }
        }
    }

    fn emit_despawns<S>(
        &mut self,
        world: &S,
        store: &mut ReplicatedEntityStore<E>,
        sink: &mut dyn MessageSink,
    ) where
        S: EntityStore<Entity = E>,
    {
        for entity in world.query_removed(IDENTITY_COMPONENT) {
            if world.get(entity, IDENTITY_COMPONENT).is_some() {
                continue;
            }
            self.pending_spawn.remove(&entity);
            self.announce.remove(&entity);
            self.deferred.retain(|(e, _)| *e != entity);

            let Some(net_id) = store.net_id_of(entity) else {
                store.untrack(entity);
                continue;
            };
            let removed = store.unregister(net_id);
            self.input_acks.remove(&net_id);
            self.acks_due.remove(&net_id);
            self.ack_sent_at.remove(&net_id);
            debug!(%net_id, ?entity, "despawning replicated entity");

            match self.origin {
                Origin::Server => {
                    for conn in removed.audience {
                        self.send(
                            sink,
                            ChannelType::Reliable,
                            SendTarget::Connection(conn),
                            &Message::Despawn { net_id },
                        );
                    }
                }
                Origin::Client(_) => {
                    if self.allocator.prefix() == Some(net_id.prefix()) {
                        self.send(
                            sink,
                            ChannelType::Reliable,
                            SendTarget::Connection(ConnectionId::SERVER),
                            &Message::Despawn { net_id },
                        );
                    }
                }
            }
        }
    }

    fn fanout_spawn(
        &mut self,
        store: &mut ReplicatedEntityStore<E>,
        spawn: &SpawnMessage,
        sink: &mut dyn MessageSink,
    ) {
        let connections: Vec<ConnectionId> = store.scope().connections().collect();
        for conn in connections {
            if store.scope().contains(conn, spawn.net_id) {
                continue;
            }
            if self.send(
                sink,
                ChannelType::Reliable,
                SendTarget::Connection(conn),
                &Message::Spawn(spawn.clone()),
            ) {
                store.scope_mut().insert(conn, spawn.net_id);
            }
        }
    }

    /// Bring a (new) connection up to date: spawn every registered entity it
    /// does not know, parents before children.
    pub fn sync_scope<S>(&mut self, world: &S, connection: ConnectionId, sink: &mut dyn MessageSink)
    where
        S: EntityStore<Entity = E>,
    {
        let registry = Rc::clone(&self.registry);
        let mut store = registry.borrow_mut();
        store.scope_mut().add_connection(connection);

        let mut ordered: Vec<(usize, NetId, E)> = store
            .identities()
            .iter()
            .filter(|(net_id, _)| !store.scope().contains(connection, *net_id))
            .map(|(net_id, entity)| (parent_depth(world, entity), net_id, entity))
            .collect();
        ordered.sort();

        let mut sent = 0usize;
        for (_, net_id, entity) in ordered {
            let Some(spawn) = full_state(world, &store, entity, net_id) else {
                continue;
            };
            if self.send(
                sink,
                ChannelType::Reliable,
                SendTarget::Connection(connection),
                &Message::Spawn(spawn),
            ) {
                store.scope_mut().insert(connection, net_id);
                sent += 1;
            }
        }
        debug!(%connection, spawns = sent, "scope synchronized");
    }

    /// Answer a resync request with a full spawn for the requester only.
    pub fn resync<S>(
        &mut self,
        world: &S,
        connection: ConnectionId,
        net_id: NetId,
        sink: &mut dyn MessageSink,
    ) -> bool
    where
        S: EntityStore<Entity = E>,
    {
        let registry = Rc::clone(&self.registry);
        let mut store = registry.borrow_mut();
        let Some(entity) = store.resolve(net_id) else {
            debug!(%connection, %net_id, "resync for unknown entity ignored");
            return false;
        };
        let Some(spawn) = full_state(world, &store, entity, net_id) else {
            return false;
        };
        if self.send(
            sink,
            ChannelType::Reliable,
            SendTarget::Connection(connection),
            &Message::Spawn(spawn),
        ) {
            store.scope_mut().insert(connection, net_id);
            true
        } else {
            false
        }
    }

    /// Change owner and entity-level authority, and tell every connection
    /// that knows the entity.
    pub fn change_owner<S>(
        &mut self,
        world: &mut S,
        net_id: NetId,
        new_owner: Option<ConnectionId>,
        authority: Authority,
        sink: &mut dyn MessageSink,
    ) -> bool
    where
        S: EntityStore<Entity = E>,
    {
        let registry = Rc::clone(&self.registry);
        let mut store = registry.borrow_mut();
        let Some(entity) = store.resolve(net_id) else {
            return false;
        };
        let Some(Ok(mut identity)) = world.get_typed::<NetworkIdentity>(entity) else {
            return false;
        };
        identity.owner_client = new_owner;
        identity.authority = authority;
        world.set_typed(entity, &identity);
        store.scope_mut().set_owner(net_id, new_owner);
        self.input_acks.remove(&net_id);
        self.acks_due.remove(&net_id);

        let message = Message::OwnerChange {
            net_id,
            new_owner,
            authority,
        };
        for conn in store.scope().audience(net_id) {
            self.send(
                sink,
                ChannelType::Reliable,
                SendTarget::Connection(conn),
                &message,
            );
        }
        true
    }

    /// Full-state spawn of a registered entity.
    pub fn full_state_for<S>(&self, world: &S, net_id: NetId) -> Option<SpawnMessage>
    where
        S: EntityStore<Entity = E>,
    {
        let store = self.registry.borrow();
        let entity = store.resolve(net_id)?;
        full_state(world, &store, entity, net_id)
    }

    fn send(
        &mut self,
        sink: &mut dyn MessageSink,
        channel: ChannelType,
        target: SendTarget,
        message: &Message,
    ) -> bool {
        match sink.send(channel, target, message) {
            Ok(()) => {
                match message {
                    Message::Spawn(_) => self.stats.spawns_sent += 1,
                    Message::Update(_) => self.stats.updates_sent += 1,
                    Message::Despawn { .. } => self.stats.despawns_sent += 1,
                    Message::OwnerChange { .. } => self.stats.owner_changes_sent += 1,
                    _ => {}
                }
                true
            }
            Err(err) => {
                self.stats.send_failures += 1;
                warn!(kind = message.kind(), ?target, error = %err, "failed to send message");
                false
            }
        }
    }
}

fn full_state<S: EntityStore>(
    world: &S,
    store: &ReplicatedEntityStore<S::Entity>,
    entity: S::Entity,
    net_id: NetId,
) -> Option<SpawnMessage> {
    if !world.contains(entity) {
        return None;
    }
    let identity = world.get_typed::<NetworkIdentity>(entity)?.ok()?;
    Some(build_spawn(world, store, entity, net_id, &identity))
}

fn build_spawn<S: EntityStore>(
    world: &S,
    store: &ReplicatedEntityStore<S::Entity>,
    entity: S::Entity,
    net_id: NetId,
    identity: &NetworkIdentity,
) -> SpawnMessage {
    let mut components = ComponentMap::new();
    for name in identity.sync_components.keys() {
        if let Some(value) = world.get(entity, name) {
            components.insert(name.clone(), value.clone());
        }
    }
    let mut identity = identity.clone();
    identity.net_id = Some(net_id);
    components.insert(IDENTITY_COMPONENT, identity.to_value());

    SpawnMessage {
        net_id,
        owner_client: identity.owner_client,
        authority: identity.authority,
        parent_net_id: world.parent(entity).and_then(|p| store.net_id_of(p)),
        components,
    }
}

fn parent_depth<S: EntityStore>(world: &S, entity: S::Entity) -> usize {
    let mut depth = 0;
    let mut current = entity;
    while let Some(parent) = world.parent(current) {
        depth += 1;
        if depth >= MAX_PARENT_DEPTH {
            break;
        }
        current = parent;
    }
    depth
}
