#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # racetel
//!
//! On-vehicle telemetry uplink for a race car. racetel owns the cellular
//! modem: it boots it over AT commands, runs the backend session handshake
//! that binds packet sequencing to an authenticated session, and streams
//! signed telemetry batches over the modem's HTTP stack. Sensor values
//! arrive through the shared data collector; everything else on the car
//! (CAN decoding, GPS, dashboard) lives in other processes.
//!
//! ## Subcommands
//!
//! - `racetel run` (default) — drive the modem and upload telemetry
//! - `racetel check` — load and validate the configuration, then exit

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use racetel::forger::{self, SequencerHandle, PACKET_QUEUE_CAPACITY};
use racetel::gsm::modules::{spawn_ticker, ReplyLogger};
use racetel::gsm::{Coordinator, GsmModule};
use racetel::uplink::{HttpActionWatcher, Uplink, UplinkConfig};
use racetel::watchdog::{self, TaskRegistry};
use racetel::{heap, uart, Config, DataCollector};

#[global_allocator]
static HEAP: heap::CountingAllocator = heap::CountingAllocator;

/// Depth of the channel feeding the UART transmit thread.
const WIRE_DEPTH: usize = 32;

/// On-vehicle telemetry uplink for a race car.
#[derive(Parser)]
#[command(name = "racetel", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the modem and upload telemetry (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Load and validate the configuration, then exit.
    Check {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check { config }) => check_config(config.as_deref()),
        Some(Commands::Run { config }) => run(config.as_deref()).await,
        None => run(None).await,
    }
}

fn check_config(config_path: Option<&str>) {
    let config = Config::load(config_path);
    let errors = config.validate();
    if errors.is_empty() {
        println!("configuration ok");
        return;
    }
    for err in &errors {
        eprintln!("config error: {err}");
    }
    std::process::exit(1);
}

async fn run(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before proceeding
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("racetel v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Modem device: {} ({} baud)", config.modem.device, config.modem.baud);

    if config.identity.sk == "change-me" {
        warn!("No signing key configured — set RACETEL_SK or [identity].sk");
    }
    let key = match config.signing_key() {
        Ok(key) => key,
        Err(e) => {
            tracing::error!("Signing key unusable: {e}");
            std::process::exit(1);
        }
    };

    // Watchdog: report the previous halt, then supervise the pipeline tasks
    // through the heartbeats each one keeps beating.
    let registry = TaskRegistry::new();
    let postmortem_path = PathBuf::from(&config.server.data_dir).join("postmortem.bin");
    watchdog::spawn_watchdog(Arc::clone(&registry), postmortem_path);

    // Coordinator plus its UART threads.
    let (wire_tx, wire_rx) = mpsc::channel(WIRE_DEPTH);
    let (mut coordinator, gsm) = Coordinator::new(wire_tx);

    let watcher = HttpActionWatcher::new();
    coordinator.register_module(Arc::new(ReplyLogger));
    coordinator.register_module(Arc::clone(&watcher) as Arc<dyn GsmModule>);
    coordinator.set_heartbeat(registry.register("coordinator"));
    coordinator.spawn();

    if let Err(e) = uart::spawn(&config.modem, wire_rx, gsm.clone()) {
        tracing::error!("Failed to open modem UART: {e}");
        std::process::exit(1);
    }

    spawn_ticker(gsm.clone());

    // Telemetry pipeline: collector → forger → queue → uplink.
    let collector = Arc::new(DataCollector::new());
    let sequencer = SequencerHandle::new();
    let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
    forger::spawn_forger(
        Arc::clone(&collector),
        sequencer.clone(),
        packet_tx,
        registry.register("forger"),
    );

    let uplink_config = UplinkConfig {
        apn: config.bearer.apn.clone(),
        user_agent: config.identity.user_agent.clone(),
        reset_endpoint: config.endpoints.reset_request.clone(),
        packet_endpoint: config.endpoints.packet_full.clone(),
        batch_size: config.uplink.batch_size,
        http_timeout_decis: config.uplink.http_timeout_decis,
    };
    Uplink::new(
        gsm,
        sequencer,
        packet_rx,
        watcher,
        key,
        uplink_config,
        registry.register("uplink"),
    )
    .spawn();

    info!("Pipeline running");

    // Graceful shutdown
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }

    info!("Shutting down...");
    info!("Goodbye");
}
