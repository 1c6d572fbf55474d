//! netsync - entity replication and client prediction
//!
//! Command-line front end: runs scripted multi-client sessions over the
//! in-process loopback transport and reports bandwidth and correction stats.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use glam::{Quat, Vec3};
use netsync_core::{
    Authority, ComponentMap, EntityStore, EntityStoreExt, NetComponent, NetworkIdentity,
    PlayerInput, SyncRule, Transform, IDENTITY_COMPONENT,
};
use netsync_ecs::HostWorld;
use netsync_net::NetSyncConfig;
use netsync_testkit::{CodecKind, ReportSink, SimulationReport, Testbed, TestbedConfig};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

/// Default location of the TOML configuration.
const DEFAULT_CONFIG_PATH: &str = "config/netsync.toml";

/// Ticks between two scripted input changes.
const INPUT_CHANGE_TICKS: u64 = 30;

/// Replication rate of scripted props.
const PROP_RATE_HZ: f32 = 10.0;

#[derive(Parser, Debug)]
#[command(author, version, about = "Entity replication and client prediction test bed", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted server and clients over the loopback transport
    Simulate(SimulateArgs),
    /// Write the default configuration as TOML
    WriteConfig {
        /// Destination file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Number of clients, each with a player character
    #[arg(long, default_value_t = 4)]
    clients: usize,
    /// Number of simulation ticks to run
    #[arg(long, default_value_t = 600)]
    ticks: u64,
    /// Simulation rate override (ticks per second)
    #[arg(long)]
    tick_rate: Option<f64>,
    /// Probability of losing an unreliable datagram
    #[arg(long, default_value_t = 0.0)]
    loss: f64,
    /// Random seed for inputs and the loss model
    #[arg(long, default_value_t = 1337)]
    seed: u64,
    /// Wire codec
    #[arg(long, value_enum, default_value_t = CodecArg::Json)]
    codec: CodecArg,
    /// Server-owned props moving on circles
    #[arg(long, default_value_t = 8)]
    props: usize,
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write every sync event as JSONL
    #[arg(long)]
    event_log: Option<PathBuf>,
    /// Write the run summary as JSON
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum CodecArg {
    Json,
    Frame,
}

impl From<CodecArg> for CodecKind {
    fn from(codec: CodecArg) -> Self {
        match codec {
            CodecArg::Json => CodecKind::Json,
            CodecArg::Frame => CodecKind::Frame,
        }
    }
}

fn main() -> Result<()> {
    // Initialize tracing with WARN level by default (can be overridden via RUST_LOG env var)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    info!("Starting netsync v{}", env!("CARGO_PKG_VERSION"));

    match Cli::parse().command {
        Command::Simulate(args) => {
            let report = simulate(&args)?;
            print_report(&report);
            if let Some(path) = &args.report {
                ReportSink::create(path)?.write(&report)?;
                println!("\nReport written to {}", path.display());
            }
        }
        Command::WriteConfig { out } => {
            NetSyncConfig::default()
                .save_to_path(&out)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("Default configuration written to {}", out.display());
        }
    }
    Ok(())
}

fn load_config(args: &SimulateArgs) -> NetSyncConfig {
    let mut config = match &args.config {
        Some(path) => NetSyncConfig::load_from_path(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => NetSyncConfig::load(),
        None => NetSyncConfig::default(),
    };
    if let Some(rate) = args.tick_rate {
        config.replication.tick_rate_hz = rate;
    }
    config
}

struct Prop {
    entity: <HostWorld as EntityStore>::Entity,
    radius: f32,
    phase: f32,
}

fn spawn_props(bed: &mut Testbed, count: usize) -> Vec<Prop> {
    let identity = NetworkIdentity::new(Authority::Server)
        .sync(Transform::NAME, SyncRule::rate(PROP_RATE_HZ).interpolated());
    (0..count)
        .map(|i| {
            let radius = 4.0 + i as f32;
            let phase = i as f32 * std::f32::consts::TAU / count.max(1) as f32;
            let entity = bed.server_mut().world_mut().spawn(
                ComponentMap::new()
                    .with(
                        Transform::NAME,
                        Transform::from_position(orbit(radius, phase)).to_value(),
                    )
                    .with(IDENTITY_COMPONENT, identity.to_value()),
            );
            Prop {
                entity,
                radius,
                phase,
            }
        })
        .collect()
}

fn orbit(radius: f32, angle: f32) -> Vec3 {
    Vec3::new(radius * angle.cos(), 0.0, radius * angle.sin())
}

fn random_input(rng: &mut StdRng) -> PlayerInput {
    PlayerInput {
        forward: rng.gen_range(-1..=1) as f32,
        strafe: rng.gen_range(-1..=1) as f32,
        jump: rng.gen_bool(0.1),
        sprint: rng.gen_bool(0.25),
        yaw: rng.gen_range(-std::f32::consts::PI..std::f32::consts::PI),
    }
}

/// Run one scripted session and summarize it.
fn simulate(args: &SimulateArgs) -> Result<SimulationReport> {
    let net = load_config(args);
    let tick_rate = net.replication.tick_rate_hz.max(1.0);
    let config = TestbedConfig {
        net,
        codec: args.codec.into(),
        loss: args.loss,
        seed: args.seed,
    };
    let mut bed = Testbed::new(config);
    if let Some(path) = &args.event_log {
        bed = bed
            .with_event_log(path)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
    }

    for i in 0..args.clients {
        let spawn_at = Vec3::new(i as f32 * 2.0, 0.0, 0.0);
        bed.add_client(Some(spawn_at))?;
    }
    let props = spawn_props(&mut bed, args.props);
    let mut rng = StdRng::seed_from_u64(args.seed);

    info!(
        clients = args.clients,
        props = props.len(),
        ticks = args.ticks,
        codec = ?args.codec,
        "simulation started"
    );
    for tick in 0..args.ticks {
        if tick % INPUT_CHANGE_TICKS == 0 {
            for (_, client) in bed.clients_mut() {
                client.apply_input(random_input(&mut rng));
            }
        }

        let t = tick as f32 / tick_rate as f32;
        for prop in &props {
            let angle = prop.phase + t * 0.5;
            let transform = Transform {
                position: orbit(prop.radius, angle),
                rotation: Quat::from_rotation_y(-angle),
                scale: Vec3::ONE,
            };
            bed.server_mut()
                .world_mut()
                .set_typed(prop.entity, &transform);
        }

        bed.step()?;
    }

    bed.finish("simulate")
}

fn print_report(report: &SimulationReport) {
    let seconds = report.ticks as f64 / report.tick_rate_hz.max(1.0);
    println!(
        "Simulated {} ticks ({:.1}s) with {} clients, codec {}",
        report.ticks, seconds, report.clients, report.codec
    );

    println!("\nNetwork:");
    println!(
        "  datagrams : {} delivered, {} dropped",
        report.network.delivered, report.network.dropped
    );
    println!(
        "  bytes     : {} reliable, {} unreliable ({:.0} B/s)",
        report.network.reliable_bytes,
        report.network.unreliable_bytes,
        report.network.bytes_per_second
    );

    println!("\nServer:");
    println!(
        "  sent      : {} spawns, {} updates, {} despawns",
        report.server.spawns_sent, report.server.updates_sent, report.server.despawns_sent
    );
    println!(
        "  skipped   : {} unchanged, {} rate limited",
        report.server.suppressed, report.server.rate_limited
    );
    println!(
        "  received  : {} values applied, {} rejected",
        report.server.applied, report.server.rejected
    );

    println!("\nPrediction:");
    println!(
        "  {} predictions, {} reconciliations, {} snaps, {} blends, {} replayed inputs",
        report.prediction.predictions,
        report.prediction.reconciliations,
        report.prediction.snaps,
        report.prediction.blends,
        report.prediction.replayed_inputs
    );
    println!("  max error : {:.4} m", report.prediction.max_error);
}
