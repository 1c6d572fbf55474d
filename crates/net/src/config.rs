//! Tunables of the replication pipeline, loaded from TOML.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/netsync.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetSyncConfig {
    /// Outbound replication.
    pub replication: ReplicationConfig,
    /// Client prediction.
    pub prediction: PredictionConfig,
    /// Remote entity smoothing.
    pub interpolation: InterpolationConfig,
    /// Server role.
    pub server: ServerConfig,
}

/// Outbound and inbound replication settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Simulation ticks per second.
    pub tick_rate_hz: f64,
    /// Seconds a child spawn waits for its parent before it is dropped.
    pub pending_child_timeout: f64,
    /// Send a resync request when an update names an unknown entity.
    pub request_resync: bool,
    /// Minimum seconds between two resync requests for the same entity.
    pub resync_cooldown: f64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60.0,
            pending_child_timeout: 5.0,
            request_resync: true,
            resync_cooldown: 1.0,
        }
    }
}

/// Prediction and reconciliation settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// Error in meters above which the client snaps and replays.
    pub snap_threshold: f32,
    /// Fraction of a small error corrected per reconciliation.
    pub blend_factor: f32,
    /// Errors below this are ignored.
    pub error_epsilon: f32,
    /// Maximum stored predictions per entity.
    pub max_history: usize,
    /// Resend inputs at least this often even if unchanged (seconds).
    pub input_resend_interval: f64,
    /// Maximum input frames bundled into one input message.
    pub max_inputs_per_message: usize,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            snap_threshold: 2.0,
            blend_factor: 0.2,
            error_epsilon: 1e-3,
            max_history: 128,
            input_resend_interval: 0.1,
            max_inputs_per_message: 32,
        }
    }
}

/// Interpolation settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct InterpolationConfig {
    /// Easing rate per second.
    pub lerp_speed: f32,
    /// Distance in meters above which the entity jumps to the target.
    pub snap_threshold: f32,
}

impl Default for InterpolationConfig {
    fn default() -> Self {
        Self {
            lerp_speed: 10.0,
            snap_threshold: 5.0,
        }
    }
}

/// What happens to a departing client's entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Despawn everything the client owned.
    #[default]
    Despawn,
    /// Hand ownership to the server.
    TransferToServer,
}

/// Server role settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Fate of owned entities on disconnect.
    pub disconnect_policy: DisconnectPolicy,
}

impl NetSyncConfig {
    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match Self::load_from_str(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    NetSyncConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!(
                        "Netsync config not found at {}. Using defaults",
                        path.display()
                    );
                }
                NetSyncConfig::default()
            }
        }
    }

    /// Parse configuration from TOML text.
    pub fn load_from_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = NetSyncConfig::load_from_str(
            r#"
            [prediction]
            snap_threshold = 0.5

            [server]
            disconnect_policy = "transfer_to_server"
            "#,
        )
        .expect("parse");
        assert_eq!(cfg.prediction.snap_threshold, 0.5);
        assert_eq!(cfg.prediction.blend_factor, 0.2);
        assert_eq!(cfg.interpolation, InterpolationConfig::default());
        assert_eq!(cfg.server.disconnect_policy, DisconnectPolicy::TransferToServer);
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("netsync.toml");

        let mut cfg = NetSyncConfig::default();
        cfg.interpolation.lerp_speed = 4.0;
        cfg.replication.request_resync = false;
        cfg.save_to_path(&path).expect("save");

        assert_eq!(NetSyncConfig::load_from_path(&path), cfg);
    }

    #[test]
    fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.toml");
        fs::write(&path, "prediction = [").expect("write");
        assert_eq!(NetSyncConfig::load_from_path(&path), NetSyncConfig::default());

        let missing = dir.path().join("missing.toml");
        assert_eq!(
            NetSyncConfig::load_from_path(&missing),
            NetSyncConfig::default()
        );
    }
}
