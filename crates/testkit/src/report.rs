//! Run summaries for the test bed and the CLI.
//!
//! A [`SimulationReport`] aggregates traffic, replication and prediction
//! counters of every peer in a run. Reports are exported as JSON so runs can
//! be compared across codecs, loss rates and configurations.

use anyhow::Result;
use netsync_net::{ConnectionStats, InboundStats, LinkStats, PredictionMetrics, ReplicationStats};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Top-level report of one simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    /// Run identifier.
    pub name: String,

    /// Codec in use.
    pub codec: String,

    /// Ticks simulated.
    pub ticks: u64,

    /// Simulation rate.
    pub tick_rate_hz: f64,

    /// Clients connected at the end of the run.
    pub clients: usize,

    /// Loopback link counters.
    pub network: NetworkMetrics,

    /// Server outbound counters.
    pub server: ReplicationMetrics,

    /// Client counters, summed over clients.
    pub client_totals: ReplicationMetrics,

    /// Prediction counters, summed over clients.
    pub prediction: PredictionSummary,
}

/// Link-level traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    /// Datagrams delivered.
    pub delivered: u64,

    /// Unreliable datagrams lost.
    pub dropped: u64,

    /// Bytes on the reliable channel.
    pub reliable_bytes: u64,

    /// Bytes on the unreliable channel.
    pub unreliable_bytes: u64,

    /// Bytes per simulated second, both channels.
    pub bytes_per_second: f64,

    /// Datagrams that failed to decode.
    pub decode_failures: u64,
}

impl NetworkMetrics {
    /// Build from hub counters over `seconds` of simulated time.
    pub fn from_link(link: LinkStats, seconds: f64) -> Self {
        let total = (link.reliable_bytes + link.unreliable_bytes) as f64;
        Self {
            delivered: link.delivered,
            dropped: link.dropped,
            reliable_bytes: link.reliable_bytes,
            unreliable_bytes: link.unreliable_bytes,
            bytes_per_second: if seconds > 0.0 { total / seconds } else { 0.0 },
            decode_failures: 0,
        }
    }
}

/// Replication counters of one peer or a sum of peers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    /// Spawns sent.
    pub spawns_sent: u64,
    /// Updates sent.
    pub updates_sent: u64,
    /// Despawns sent.
    pub despawns_sent: u64,
    /// Changes suppressed by an unchanged hash.
    pub suppressed: u64,
    /// Changes deferred by a rate limit.
    pub rate_limited: u64,
    /// Messages sent, all kinds.
    pub messages_sent: u64,
    /// Bytes sent.
    pub bytes_sent: u64,
    /// Inbound entities materialised.
    pub spawned: u64,
    /// Inbound component values applied.
    pub applied: u64,
    /// Inbound messages rejected.
    pub rejected: u64,
    /// Updates for unknown entities.
    pub unknown: u64,
}

impl ReplicationMetrics {
    /// Collect the counters of one peer.
    pub fn collect(
        outbound: ReplicationStats,
        inbound: InboundStats,
        connection: ConnectionStats,
    ) -> Self {
        Self {
            spawns_sent: outbound.spawns_sent,
            updates_sent: outbound.updates_sent,
            despawns_sent: outbound.despawns_sent,
            suppressed: outbound.suppressed,
            rate_limited: outbound.rate_limited,
            messages_sent: connection.messages_sent,
            bytes_sent: connection.bytes_sent,
            spawned: inbound.spawned,
            applied: inbound.applied,
            rejected: inbound.rejected,
            unknown: inbound.unknown,
        }
    }

    /// Add another peer's counters.
    pub fn accumulate(&mut self, other: &ReplicationMetrics) {
        self.spawns_sent += other.spawns_sent;
        self.updates_sent += other.updates_sent;
        self.despawns_sent += other.despawns_sent;
        self.suppressed += other.suppressed;
        self.rate_limited += other.rate_limited;
        self.messages_sent += other.messages_sent;
        self.bytes_sent += other.bytes_sent;
        self.spawned += other.spawned;
        self.applied += other.applied;
        self.rejected += other.rejected;
        self.unknown += other.unknown;
    }
}

/// Prediction counters summed over clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionSummary {
    /// Predicted steps.
    pub predictions: u64,
    /// Server states reconciled.
    pub reconciliations: u64,
    /// Hard corrections with replay.
    pub snaps: u64,
    /// Soft corrections.
    pub blends: u64,
    /// Inputs replayed after snaps.
    pub replayed_inputs: u64,
    /// Largest correction seen by any client.
    pub max_error: f32,
}

impl PredictionSummary {
    /// Add one client's metrics.
    pub fn accumulate(&mut self, metrics: &PredictionMetrics) {
        self.predictions += metrics.total_predictions;
        self.reconciliations += metrics.total_reconciliations;
        self.snaps += metrics.total_snaps;
        self.blends += metrics.total_blends;
        self.replayed_inputs += metrics.total_replayed_inputs;
        self.max_error = self.max_error.max(metrics.max_error_distance);
    }
}

/// Sink for writing reports to JSON files.
pub struct ReportSink {
    path: std::path::PathBuf,
}

impl ReportSink {
    /// Create a new sink at `path`, creating parent directories if needed.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Write `report` as pretty JSON.
    pub fn write(&self, report: &SimulationReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)?;
        let mut file = File::create(&self.path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SimulationReport {
        SimulationReport {
            name: "sample".into(),
            codec: "json".into(),
            ticks: 60,
            tick_rate_hz: 60.0,
            clients: 2,
            network: NetworkMetrics::from_link(
                LinkStats {
                    delivered: 10,
                    dropped: 1,
                    reliable_bytes: 300,
                    unreliable_bytes: 700,
                },
                1.0,
            ),
            server: ReplicationMetrics::default(),
            client_totals: ReplicationMetrics::default(),
            prediction: PredictionSummary::default(),
        }
    }

    #[test]
    fn test_network_metrics_rate() {
        let metrics = sample().network;
        assert_eq!(metrics.bytes_per_second, 1000.0);
        assert_eq!(NetworkMetrics::from_link(LinkStats::default(), 0.0).bytes_per_second, 0.0);
    }

    #[test]
    fn test_replication_metrics_accumulate() {
        let one = ReplicationMetrics {
            updates_sent: 3,
            bytes_sent: 100,
            ..ReplicationMetrics::default()
        };
        let mut total = ReplicationMetrics::default();
        total.accumulate(&one);
        total.accumulate(&one);
        assert_eq!(total.updates_sent, 6);
        assert_eq!(total.bytes_sent, 200);
    }

    #[test]
    fn test_report_sink_writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reports").join("run.json");
        let sink = ReportSink::create(&path).expect("sink");
        sink.write(&sample()).expect("write");

        let contents = fs::read_to_string(&path).expect("readable");
        let parsed: SimulationReport = serde_json::from_str(&contents).expect("parse");
        assert_eq!(parsed, sample());
        assert!(contents.contains("\"codec\": \"json\""));
    }
}
