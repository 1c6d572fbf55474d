//! A server and any number of clients wired through the loopback transport.

use crate::report::{NetworkMetrics, PredictionSummary, ReplicationMetrics, SimulationReport};
use anyhow::{Context, Result};
use glam::Vec3;
use netsync_core::{ConnectionId, SimTick};
use netsync_ecs::HostWorld;
use netsync_net::{
    Codec, Connection, EventLogger, FrameCodec, JsonCodec, LinkStats, LoopbackHub,
    NetSyncConfig, ReplicatedEntityStore, SyncEvent, Transport,
};
use netsync_client::ReplicationClient;
use netsync_server::ReplicationServer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Wire codec used by every peer of a test bed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// `serde_json` text.
    #[default]
    Json,
    /// Length-prefixed `postcard` frames.
    Frame,
}

impl CodecKind {
    /// Build a codec instance.
    pub fn build(self) -> Box<dyn Codec> {
        match self {
            CodecKind::Json => Box::new(JsonCodec),
            CodecKind::Frame => Box::new(FrameCodec),
        }
    }

    /// Short name.
    pub fn as_str(self) -> &'static str {
        match self {
            CodecKind::Json => "json",
            CodecKind::Frame => "frame",
        }
    }
}

/// Test bed setup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestbedConfig {
    /// Pipeline settings shared by every peer.
    pub net: NetSyncConfig,
    /// Wire codec.
    pub codec: CodecKind,
    /// Probability of losing an unreliable datagram.
    pub loss: f64,
    /// Seed of the loss model.
    pub seed: u64,
}

/// Deterministic multi-peer harness.
///
/// Each [`Testbed::step`] ticks the server first and then every client in
/// connection order, so messages sent by clients reach the server on the
/// next step.
pub struct Testbed {
    hub: LoopbackHub,
    server: ReplicationServer<HostWorld>,
    clients: BTreeMap<ConnectionId, ReplicationClient<HostWorld>>,
    config: TestbedConfig,
    logger: Option<EventLogger>,
    tick: SimTick,
}

impl Testbed {
    /// Create a test bed with a server and no clients.
    pub fn new(config: TestbedConfig) -> Self {
        let hub = LoopbackHub::with_loss(config.loss, config.seed);
        let connection = Connection::new(Box::new(hub.server_endpoint()), config.codec.build());
        let server = ReplicationServer::new(
            HostWorld::new(),
            connection,
            ReplicatedEntityStore::shared(),
            config.net.clone(),
        );
        Self {
            hub,
            server,
            clients: BTreeMap::new(),
            config,
            logger: None,
            tick: SimTick::ZERO,
        }
    }

    /// Write every recorded event to a JSONL file at `path`.
    pub fn with_event_log(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.logger = Some(EventLogger::create(path)?);
        Ok(self)
    }

    /// Attach a new client, optionally with a player character spawned at
    /// `character`.
    pub fn add_client(&mut self, character: Option<Vec3>) -> Result<ConnectionId> {
        let endpoint = self.hub.connect_client();
        let id = endpoint.local_id();
        let client = ReplicationClient::new(
            HostWorld::new(),
            Connection::new(Box::new(endpoint), self.config.codec.build()),
            ReplicatedEntityStore::shared(),
            self.config.net.clone(),
        );
        self.server
            .connect(id)
            .with_context(|| format!("Failed to connect client {id}"))?;
        if let Some(position) = character {
            self.server.assign_character(id, position)?;
        }
        self.clients.insert(id, client);
        debug!(connection = %id, tick = self.tick.0, "test bed client added");
        Ok(id)
    }

    /// Detach client `id` from the server and the link.
    pub fn remove_client(&mut self, id: ConnectionId) -> Result<()> {
        self.server.disconnect(id)?;
        self.hub.disconnect(id);
        if let Some(mut client) = self.clients.remove(&id) {
            let events = client.drain_events();
            self.record(events)?;
        }
        Ok(())
    }

    /// Advance every peer by one tick.
    pub fn step(&mut self) -> Result<()> {
        self.server.tick()?;
        let events = self.server.drain_events();
        self.record(events)?;

        let mut events = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            client
                .tick()
                .with_context(|| format!("Client {id} tick failed"))?;
            events.extend(client.drain_events());
        }
        self.record(events)?;
        self.tick = self.tick.advance(1);
        Ok(())
    }

    /// Advance `ticks` steps.
    pub fn run(&mut self, ticks: u64) -> Result<()> {
        for _ in 0..ticks {
            self.step()?;
        }
        Ok(())
    }

    fn record(&mut self, events: Vec<SyncEvent>) -> Result<()> {
        if let Some(logger) = self.logger.as_mut() {
            for event in &events {
                logger.log(event)?;
            }
        }
        Ok(())
    }

    /// Flush the event log and summarize the run.
    pub fn finish(&mut self, name: &str) -> Result<SimulationReport> {
        if let Some(logger) = self.logger.as_mut() {
            logger.flush()?;
            info!(events = logger.events_written(), "event log flushed");
        }
        Ok(self.report(name))
    }

    /// Summarize the run so far.
    pub fn report(&self, name: &str) -> SimulationReport {
        let tick_rate_hz = self.config.net.replication.tick_rate_hz;
        let seconds = self.tick.0 as f64 / tick_rate_hz.max(1.0);
        let mut network = NetworkMetrics::from_link(self.hub.stats(), seconds);
        network.decode_failures = self.server.connection_stats().decode_failures;

        let mut client_totals = ReplicationMetrics::default();
        let mut prediction = PredictionSummary::default();
        for client in self.clients.values() {
            network.decode_failures += client.connection_stats().decode_failures;
            client_totals.accumulate(&ReplicationMetrics::collect(
                client.replication_stats(),
                client.inbound_stats(),
                client.connection_stats(),
            ));
            prediction.accumulate(client.prediction_metrics());
        }

        SimulationReport {
            name: name.to_string(),
            codec: self.config.codec.as_str().to_string(),
            ticks: self.tick.0,
            tick_rate_hz,
            clients: self.clients.len(),
            network,
            server: ReplicationMetrics::collect(
                self.server.replication_stats(),
                self.server.inbound_stats(),
                self.server.connection_stats(),
            ),
            client_totals,
            prediction,
        }
    }

    /// Ticks stepped so far.
    pub fn current_tick(&self) -> SimTick {
        self.tick
    }

    /// The server role.
    pub fn server(&self) -> &ReplicationServer<HostWorld> {
        &self.server
    }

    /// The server role, mutably.
    pub fn server_mut(&mut self) -> &mut ReplicationServer<HostWorld> {
        &mut self.server
    }

    /// Client `id`, if attached.
    pub fn client(&self, id: ConnectionId) -> Option<&ReplicationClient<HostWorld>> {
        self.clients.get(&id)
    }

    /// Client `id` mutably, if attached.
    pub fn client_mut(&mut self, id: ConnectionId) -> Option<&mut ReplicationClient<HostWorld>> {
        self.clients.get_mut(&id)
    }

    /// Every attached client in connection order.
    pub fn clients(&self) -> impl Iterator<Item = (ConnectionId, &ReplicationClient<HostWorld>)> {
        self.clients.iter().map(|(id, client)| (*id, client))
    }

    /// Every attached client, mutably.
    pub fn clients_mut(
        &mut self,
    ) -> impl Iterator<Item = (ConnectionId, &mut ReplicationClient<HostWorld>)> {
        self.clients.iter_mut().map(|(id, client)| (*id, client))
    }

    /// Link counters so far.
    pub fn link_stats(&self) -> LinkStats {
        self.hub.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsync_core::NetId;

    #[test]
    fn test_clients_receive_each_others_characters() {
        let mut bed = Testbed::new(TestbedConfig::default());
        let a = bed.add_client(Some(Vec3::ZERO)).expect("client a");
        let b = bed.add_client(Some(Vec3::new(3.0, 0.0, 0.0))).expect("client b");
        bed.run(3).expect("run");

        for id in [a, b] {
            let client = bed.client(id).expect("client");
            assert_eq!(client.world().len(), 2);
            let registry = client.registry().borrow();
            assert!(registry.resolve(NetId(1)).is_some());
            assert!(registry.resolve(NetId(2)).is_some());
        }
        assert_eq!(bed.client(a).and_then(|c| c.my_net_id()), Some(NetId(1)));
        assert_eq!(bed.client(b).and_then(|c| c.my_net_id()), Some(NetId(2)));
    }

    #[test]
    fn test_frame_codec_bed_runs() {
        let mut bed = Testbed::new(TestbedConfig {
            codec: CodecKind::Frame,
            ..TestbedConfig::default()
        });
        let id = bed.add_client(Some(Vec3::ZERO)).expect("client");
        bed.run(10).expect("run");

        let report = bed.report("frame");
        assert_eq!(report.codec, "frame");
        assert_eq!(report.ticks, 10);
        assert_eq!(report.network.decode_failures, 0);
        assert_eq!(bed.client(id).map(|c| c.world().len()), Some(1));
    }

    #[test]
    fn test_event_log_records_connections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let mut bed = Testbed::new(TestbedConfig::default())
            .with_event_log(&path)
            .expect("log");
        let id = bed.add_client(Some(Vec3::ZERO)).expect("client");
        bed.run(2).expect("run");
        bed.remove_client(id).expect("remove");
        bed.step().expect("step");
        bed.finish("log").expect("finish");

        let events = netsync_net::load_events(&path).expect("load");
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::Disconnected { connection, .. } if *connection == id)));
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::Spawned { net_id: NetId(1), .. })));
    }
}
