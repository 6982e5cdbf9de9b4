use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{info, warn};

use nedpilot_geo::{
    bearing_deg, destination_offset, distance_m, to_ned_sequence, GeoPosition, LocalPosition,
    TrajectoryConfig,
};
use nedpilot_link::{LinkConfig, MavLinkSession};
use nedpilot_offboard::{HeartbeatMonitor, OffboardConfig, OffboardController, YawPolicy};

#[derive(Debug, Parser)]
#[command(name = "nedpilot", version, about = "nedpilot - offboard NED trajectory runner")]
struct Cli {
    /// Path to the TOML configuration.
    #[arg(long, default_value = "nedpilot.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Convert a trajectory file and fly it in offboard mode.
    Run {
        /// JSON file holding an array of [x, y, z] samples.
        #[arg(long)]
        trajectory: String,
    },
    /// Print the NED displacement sequence for a trajectory file.
    Convert {
        #[arg(long)]
        trajectory: String,
    },
    /// Geodetic calculator used when preparing missions.
    Geo {
        #[command(subcommand)]
        cmd: GeoCmd,
    },
    /// Validate the configuration file.
    Doctor,
}

#[derive(Debug, Subcommand)]
enum GeoCmd {
    /// Ground distance in metres between two "lat,lon" points.
    Distance {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Bearing in degrees from one "lat,lon" point to another.
    Bearing {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
    /// Angular offsets for a metres-north/east displacement from an origin.
    Offset {
        #[arg(long)]
        origin: String,
        #[arg(long)]
        north: f64,
        #[arg(long)]
        east: f64,
    },
}

#[derive(Debug, Deserialize)]
struct Config {
    link: LinkConfig,
    offboard: OffboardConfig,
    trajectory: Option<TrajectoryConfig>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {path}"))?;
    Ok(toml::from_str(&s).context("parse config toml")?)
}

fn load_trajectory(path: &str) -> Result<Vec<LocalPosition>> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read trajectory {path}"))?;
    let raw: Vec<[f64; 3]> = serde_json::from_str(&s).context("parse trajectory json")?;
    Ok(raw.into_iter().map(LocalPosition::from).collect())
}

fn parse_point(s: &str) -> Result<GeoPosition> {
    let mut parts = s.split(',');
    let lat: f64 = parts.next().context("missing latitude")?.trim().parse()?;
    let lon: f64 = parts.next().context("missing longitude")?.trim().parse()?;
    anyhow::ensure!(parts.next().is_none(), "expected \"lat,lon\"");
    Ok(GeoPosition::new(lat, lon))
}

fn yaw_policy(cfg: &OffboardConfig) -> Result<YawPolicy> {
    match cfg.yaw_mode.as_deref().unwrap_or("fixed") {
        "fixed" => Ok(YawPolicy::Fixed(cfg.yaw_deg.unwrap_or(0.0))),
        "face-travel" => Ok(YawPolicy::FaceTravel),
        other => anyhow::bail!("unknown offboard.yaw_mode: {other}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Run { trajectory } => run(&load_config(&cli.config)?, &trajectory).await,
        Command::Convert { trajectory } => convert(&load_config(&cli.config)?, &trajectory),
        Command::Geo { cmd } => geo(cmd),
        Command::Doctor => doctor(&load_config(&cli.config)?),
    }
}

async fn run(cfg: &Config, path: &str) -> Result<()> {
    let samples = load_trajectory(path)?;
    let tcfg = cfg.trajectory.clone().unwrap_or_default();
    let vectors = to_ned_sequence(&samples, &tcfg);
    info!("trajectory: {} samples -> {} NED steps", samples.len(), vectors.len());

    let yaw = yaw_policy(&cfg.offboard)?;
    let link = MavLinkSession::connect(&cfg.link).await?;
    let monitor = HeartbeatMonitor::spawn(&link);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt: cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let mut controller = OffboardController::new(link, cfg.offboard.clone(), yaw, cancel_rx);
    let outcome = controller.run(&vectors).await;
    monitor.stop().await;

    let report = outcome?;
    info!("run complete: {} setpoints streamed", report.sent);
    Ok(())
}

fn convert(cfg: &Config, path: &str) -> Result<()> {
    let samples = load_trajectory(path)?;
    let tcfg = cfg.trajectory.clone().unwrap_or_default();
    let vectors = to_ned_sequence(&samples, &tcfg);
    println!("{} samples -> {} steps", samples.len(), vectors.len());
    for (i, v) in vectors.iter().enumerate() {
        println!(
            "{i:4}  north={:+10.3}  east={:+10.3}  down={:+10.3}",
            v.north_m, v.east_m, v.down_m
        );
    }
    Ok(())
}

fn geo(cmd: GeoCmd) -> Result<()> {
    match cmd {
        GeoCmd::Distance { from, to } => {
            let d = distance_m(parse_point(&from)?, parse_point(&to)?);
            println!("{d:.2} m");
        }
        GeoCmd::Bearing { from, to } => {
            let b = bearing_deg(parse_point(&from)?, parse_point(&to)?);
            println!("{b:.1} deg");
        }
        GeoCmd::Offset { origin, north, east } => {
            let (d_lat, d_lon) = destination_offset(parse_point(&origin)?, north, east)?;
            println!("d_lat={d_lat:+.9} rad  d_lon={d_lon:+.9} rad");
        }
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    anyhow::ensure!(!cfg.link.address.is_empty(), "link.address missing");
    anyhow::ensure!(cfg.link.target_sys != 0, "link.target_sys must be nonzero");

    // The stream must not pause longer than the vehicle's offboard setpoint
    // timeout, or it will drop out of offboard mid-trajectory.
    let interval = cfg.offboard.setpoint_interval();
    anyhow::ensure!(
        interval >= Duration::from_millis(10) && interval <= Duration::from_secs(5),
        "offboard.setpoint_interval_ms should be within 10..5000"
    );

    let tcfg = cfg.trajectory.clone().unwrap_or_default();
    anyhow::ensure!(tcfg.scale.is_finite() && tcfg.scale != 0.0, "trajectory.scale invalid");

    yaw_policy(&cfg.offboard)?;

    info!("doctor: OK");
    Ok(())
}
