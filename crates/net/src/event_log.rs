//! Replication event log in JSONL format.
//!
//! Roles report what happened during a tick as [`SyncEvent`]s; an
//! [`EventLogger`] appends them to a file, one JSON object per line, and
//! [`load_events`] reads such a file back for inspection in tests.

use anyhow::{Context, Result};
use netsync_core::{ConnectionId, NetId};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Something a role observed during a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SyncEvent {
    /// A client joined.
    Connected {
        /// Tick when event occurred.
        tick: u64,
        /// New connection.
        connection: ConnectionId,
    },

    /// A client left.
    Disconnected {
        /// Tick when event occurred.
        tick: u64,
        /// Departed connection.
        connection: ConnectionId,
    },

    /// An entity was materialized from the network.
    Spawned {
        /// Tick when event occurred.
        tick: u64,
        /// Peer that observed the event.
        peer: ConnectionId,
        /// Entity id.
        net_id: NetId,
    },

    /// An entity was destroyed by the network.
    Despawned {
        /// Tick when event occurred.
        tick: u64,
        /// Peer that observed the event.
        peer: ConnectionId,
        /// Entity id.
        net_id: NetId,
    },

    /// Ownership of an entity changed.
    OwnerChanged {
        /// Tick when event occurred.
        tick: u64,
        /// Peer that observed the event.
        peer: ConnectionId,
        /// Entity id.
        net_id: NetId,
        /// New owner.
        new_owner: Option<ConnectionId>,
    },

    /// A message or component was refused.
    Rejected {
        /// Tick when event occurred.
        tick: u64,
        /// Peer that refused it.
        peer: ConnectionId,
        /// Sender.
        from: ConnectionId,
        /// Entity concerned, if any.
        net_id: Option<NetId>,
        /// Reason.
        reason: String,
    },

    /// A client asked for, or the server answered, a resync.
    Resync {
        /// Tick when event occurred.
        tick: u64,
        /// Peer that observed the event.
        peer: ConnectionId,
        /// Entity id.
        net_id: NetId,
    },

    /// A client corrected its prediction.
    Reconciled {
        /// Tick when event occurred.
        tick: u64,
        /// Reconciling client.
        peer: ConnectionId,
        /// Predicted entity.
        net_id: NetId,
        /// Acknowledged input sequence.
        ack_seq: u32,
        /// Position error in meters.
        error: f32,
        /// Inputs replayed; zero for blends.
        replayed: usize,
    },
}

impl SyncEvent {
    /// Get the tick of this event.
    pub fn tick(&self) -> u64 {
        match self {
            SyncEvent::Connected { tick, .. }
            | SyncEvent::Disconnected { tick, .. }
            | SyncEvent::Spawned { tick, .. }
            | SyncEvent::Despawned { tick, .. }
            | SyncEvent::OwnerChanged { tick, .. }
            | SyncEvent::Rejected { tick, .. }
            | SyncEvent::Resync { tick, .. }
            | SyncEvent::Reconciled { tick, .. } => *tick,
        }
    }
}

/// Event logger that writes sync events to JSONL format.
pub struct EventLogger {
    writer: BufWriter<File>,
    events_written: u64,
}

impl EventLogger {
    /// Create a new event logger.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("Failed to create event log: {:?}", path.as_ref()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            events_written: 0,
        })
    }

    /// Log a sync event.
    pub fn log(&mut self, event: &SyncEvent) -> Result<()> {
        serde_json::to_writer(&mut self.writer, event)?;
        writeln!(&mut self.writer)?;
        self.events_written += 1;
        Ok(())
    }

    /// Flush buffered writes.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Get number of events written.
    pub fn events_written(&self) -> u64 {
        self.events_written
    }
}

/// Read every event from a JSONL log. Blank lines are skipped.
pub fn load_events(path: impl AsRef<Path>) -> Result<Vec<SyncEvent>> {
    let file = File::open(path.as_ref())
        .with_context(|| format!("Failed to open event log: {:?}", path.as_ref()))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", line_num + 1))?;
        if line.trim().is_empty() {
            continue;
        }
        let event: SyncEvent = serde_json::from_str(&line)
            .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_event_log_round_trip() {
        let temp = NamedTempFile::new().unwrap();
        let events = vec![
            SyncEvent::Connected {
                tick: 0,
                connection: ConnectionId(1),
            },
            SyncEvent::Reconciled {
                tick: 12,
                peer: ConnectionId(1),
                net_id: NetId(2),
                ack_seq: 9,
                error: 2.5,
                replayed: 3,
            },
        ];

        {
            let mut logger = EventLogger::create(temp.path()).unwrap();
            for event in &events {
                logger.log(event).unwrap();
            }
            logger.flush().unwrap();
            assert_eq!(logger.events_written(), 2);
        }

        let loaded = load_events(temp.path()).unwrap();
        assert_eq!(loaded, events);
        assert_eq!(loaded[1].tick(), 12);
    }

    #[test]
    fn test_lines_are_tagged_objects() {
        let temp = NamedTempFile::new().unwrap();
        {
            let mut logger = EventLogger::create(temp.path()).unwrap();
            logger
                .log(&SyncEvent::Despawned {
                    tick: 3,
                    peer: ConnectionId::SERVER,
                    net_id: NetId(7),
                })
                .unwrap();
            logger.flush().unwrap();
        }
        let text = std::fs::read_to_string(temp.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["type"], "Despawned");
        assert_eq!(value["net_id"], 7);
    }
}
