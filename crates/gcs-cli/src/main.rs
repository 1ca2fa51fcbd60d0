use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use gcs_fanout::{doctor as viewer_doctor, Fanout, Registry, ViewerConfig, ViewerServer};
use gcs_fc::{doctor as fc_doctor, LinkConfig, LinkError, TelemetryStore};

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "gcs", version, about = "gcs-bridge - MAVLink telemetry to live WebSocket viewers")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check the configuration without opening anything.
    Doctor,
    /// Bridge telemetry to viewers until Ctrl-C.
    Run,
    /// Wait for one heartbeat and print what the vehicle advertises.
    Probe,
}

#[derive(Debug, serde::Deserialize)]
struct Config {
    link: LinkConfig,
    #[serde(default)]
    viewer: ViewerConfig,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    parse_config(&s)
}

fn parse_config(s: &str) -> Result<Config> {
    toml::from_str(s).context("parse config toml")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Probe => probe(&cfg).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    fc_doctor::check_link(&cfg.link)?;
    viewer_doctor::check_viewer(&cfg.viewer)?;
    info!("doctor: OK");
    Ok(())
}

async fn probe(cfg: &Config) -> Result<()> {
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(stop_on_ctrl_c(stop_tx));

    let connected = gcs_fc::connect(&cfg.link, &mut stop_rx).await.context("fc probe")?;
    let hb = &connected.heartbeat;
    println!("address={}", connected.link.address());
    println!("system={} component={}", hb.system_id, hb.component_id);
    println!("vehicle={:?} autopilot={:?}", hb.mavtype, hb.autopilot);
    println!(
        "base_mode={:#04x} armed={} custom_mode={}",
        hb.base_mode,
        hb.base_mode & gcs_fc::decoder::ARMED_FLAG != 0,
        hb.custom_mode
    );
    Ok(())
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");

    let store = Arc::new(TelemetryStore::new());
    let registry = Arc::new(Registry::new());
    let fanout = Arc::new(Fanout::new(store.clone(), registry).with_push_timeout(cfg.viewer.push_timeout()));

    let (stop_tx, stop_rx) = watch::channel(false);

    let server = ViewerServer::bind(&cfg.viewer, fanout.clone()).await?;
    let server_handle = tokio::spawn(server.serve(stop_rx.clone()));
    let telemetry_handle = tokio::spawn(telemetry(cfg.link.clone(), store, fanout, stop_rx));

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("run: shutting down");
    let _ = stop_tx.send(true);

    if let Err(e) = telemetry_handle.await {
        warn!("run: telemetry task ended abnormally: {}", e);
    }
    if let Err(e) = server_handle.await {
        warn!("run: viewer server ended abnormally: {}", e);
    }
    info!("run: stopped");
    Ok(())
}

/// Link + decoder. A link that never comes up is logged; the viewer server
/// keeps running either way.
async fn telemetry(
    link_cfg: LinkConfig,
    store: Arc<TelemetryStore>,
    fanout: Arc<Fanout>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut connected = match gcs_fc::connect(&link_cfg, &mut stop_rx).await {
        Ok(c) => c,
        Err(LinkError::Cancelled) => return,
        Err(e) => {
            error!("run: failed to start MAVLink connection: {}", e);
            if matches!(e, LinkError::Timeout { .. }) {
                warn!("run: check that the autopilot is running and sending MAVLink to {}", link_cfg.address);
            }
            warn!("run: viewers stay connected, but no telemetry will be available");
            return;
        }
    };

    let timing = link_cfg.loop_timing();
    if let Err(e) = gcs_fc::run_decoder(&mut connected.link, &store, fanout.as_ref(), timing, stop_rx).await {
        error!("run: telemetry stopped: {}", e);
    }
}

async fn stop_on_ctrl_c(stop_tx: watch::Sender<bool>) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            let _ = stop_tx.send(true);
        }
        Err(e) => {
            warn!("ctrl-c handler unavailable: {}", e);
            // dropping the sender would read as a shutdown request
            std::future::pending::<()>().await;
        }
    }
}
