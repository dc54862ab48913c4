//! Smart fridge gateway
//!
//! Watches the PLACE/TAKE buttons and the proximity sensor, captures a frame
//! per press, classifies it and keeps the fridge inventory up to date.
//!
//! Module structure:
//! - `domain/` - Events, inventory rules, error taxonomy
//! - `io/` - External interfaces (serial board, classifier, MQTT, HTTP, snapshot)
//! - `services/` - Event bus, correlator, recognition, inventory store, notifications
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use fridge_gateway::domain::types::Channel;
use fridge_gateway::infra::{Config, HardwareMode};
use fridge_gateway::io::{HttpClassifier, SerialBoard, SimulatedBoard, SimulatorHandle};
use fridge_gateway::services::{CorrelatorHandle, FridgeRuntime, JsonLinesTransport, SignalSource};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Smart fridge gateway
#[derive(Parser, Debug)]
#[command(name = "fridge-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,

    /// Use the simulated board and read p/t/f/c commands from stdin
    #[arg(long)]
    simulate: bool,

    /// Print every notification to stdout as a JSON line
    #[arg(long)]
    stdout_events: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("fridge-gateway starting");

    let args = Args::parse();
    let config = Config::load_from_path(&args.config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        hardware_mode = ?config.hardware_mode(),
        serial_device = %config.serial_device(),
        classifier = %config.classifier_endpoint(),
        snapshot = %config.snapshot_file(),
        mqtt_enabled = %config.mqtt_enabled(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    let (source, simulator) = select_source(&config, args.simulate);
    let classifier = Arc::new(HttpClassifier::new(&config)?);

    let mut runtime = FridgeRuntime::start(config, source, classifier)?;
    if args.stdout_events {
        runtime.spawn_subscription("stdout", JsonLinesTransport::new(tokio::io::stdout()));
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    if let Some(simulator) = simulator {
        tokio::spawn(read_sim_commands(simulator, runtime.correlator().clone(), stop_tx.clone()));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
        _ = stop_rx.changed() => info!("shutdown_requested_from_stdin"),
    }

    runtime.shutdown().await;
    info!("fridge-gateway shutdown complete");
    Ok(())
}

/// Physical board when configured and present, otherwise the simulator
fn select_source(
    config: &Config,
    force_simulated: bool,
) -> (Arc<dyn SignalSource>, Option<SimulatorHandle>) {
    if !force_simulated && config.hardware_mode() == HardwareMode::Physical {
        match SerialBoard::open(config) {
            Ok(board) => return (Arc::new(board), None),
            Err(e) => warn!(error = %e, "physical_board_unavailable_using_simulator"),
        }
    }
    let board = SimulatedBoard::new(config.capture_dir());
    let handle = board.handle();
    (Arc::new(board), Some(handle))
}

/// `p` PLACE, `t` TAKE, `f` face approach, `c` cancel both, `q` quit
async fn read_sim_commands(
    simulator: SimulatorHandle,
    correlator: CorrelatorHandle,
    stop: watch::Sender<bool>,
) {
    info!("simulator_ready keys: p=place t=take f=face c=cancel q=quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match line.trim() {
            "p" => simulator.press(Channel::Place),
            "t" => simulator.press(Channel::Take),
            "f" => simulator.face_approach(),
            "c" => {
                for channel in Channel::ALL {
                    correlator.cancel(channel);
                }
            }
            "q" => {
                let _ = stop.send(true);
                return;
            }
            "" => {}
            other => warn!(input = %other, "simulator_unknown_command"),
        }
    }
    info!("simulator_stdin_closed");
}
