//! tilesync - Distributed SDR Tile Node
//!
//! Brings up the front-end, then serves SYNC / START / CAL / PILOT / STOP /
//! STATUS / ABORT / SETUP commands from the controller until it disconnects.
//!
//! # Usage
//!
//! ```bash
//! # Commands on stdin, events on stdout, logs on stderr
//! tilesync --simulate --config-file node.toml
//!
//! # Connect to the controller over TCP
//! tilesync --simulate --config-file node.toml --controller 10.0.0.1:7000
//! ```
//!
//! # Environment Variables
//!
//! - `TILESYNC_CONFIG`: Path to the node config when `--config-file` is not given
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tilesync::config::{defaults, ConfigError, NodeConfig, WeightsError, WeightsTable};
use tilesync::radio::{bring_up, RadioDevice, RegisterSwitch, SetupError, SimOptions, SimRadio};
use tilesync::scheduler::CommandScheduler;
use tilesync::storage::NodeLock;
use tilesync::transport::{
    pump_lines, ChannelTransport, CommandTransport, ControllerHandle, LineTransport,
};
use tilesync::NodeExit;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "tilesync")]
#[command(about = "Distributed SDR tile node: PPS time alignment, synchronous tuning and loopback phase calibration")]
#[command(version)]
struct CliArgs {
    /// Node config (TOML). Falls back to $TILESYNC_CONFIG
    #[arg(long, value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// Tx weights table (TOML). Overrides node.weights_file
    #[arg(long, value_name = "PATH")]
    weights_file: Option<PathBuf>,

    /// Override the tile identity from the config file
    #[arg(long)]
    tile: Option<String>,

    /// Controller address; commands are read from stdin when unset
    #[arg(long, value_name = "HOST:PORT")]
    controller: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Drive the in-memory simulated front-end
    #[arg(long)]
    simulate: bool,
}

// ============================================================================
// Task Supervision
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum TaskName {
    Scheduler,
    TransportPump,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::Scheduler => write!(f, "Scheduler"),
            TaskName::TransportPump => write!(f, "TransportPump"),
        }
    }
}

/// Run the supervisor loop: monitor tasks, cancel on failure.
async fn run_supervisor(
    task_set: &mut JoinSet<Result<TaskName>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    info!("🔒 Supervisor: All tasks spawned, monitoring...");

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("🛑 Supervisor: Shutdown signal received");
                break;
            }
            result = task_set.join_next() => {
                match result {
                    Some(Ok(Ok(task_name))) => {
                        info!("🔒 Supervisor: Task {} completed normally", task_name);
                    }
                    Some(Ok(Err(e))) => {
                        error!("🔒 Supervisor: Task failed with error: {}", e);
                        cancel_token.cancel();
                        return Err(e);
                    }
                    Some(Err(e)) => {
                        error!("🔒 Supervisor: Task panicked: {}", e);
                        cancel_token.cancel();
                        return Err(anyhow::anyhow!("Task panicked: {}", e));
                    }
                    None => {
                        info!("🔒 Supervisor: All tasks completed");
                        break;
                    }
                }
            }
        }
    }

    // Let the scheduler finish its halt (switch reset, activity join).
    while let Some(result) = task_set.join_next().await {
        if let Ok(Ok(task_name)) = result {
            info!("🔒 Supervisor: Task {} stopped", task_name);
        }
    }
    Ok(())
}

fn spawn_transport_pump<T>(
    task_set: &mut JoinSet<Result<TaskName>>,
    transport: T,
    handle: ControllerHandle,
    cancel_token: CancellationToken,
) where
    T: CommandTransport + 'static,
{
    task_set.spawn(async move {
        info!("[TransportPump] Task starting");
        pump_lines(transport, handle, cancel_token).await?;
        Ok(TaskName::TransportPump)
    });
}

// ============================================================================
// Start-up
// ============================================================================

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the event stream in stdio mode
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &CliArgs) -> Result<NodeConfig> {
    let path = NodeConfig::resolve_path(args.config_file.as_deref())?;
    let mut config = NodeConfig::load_from_file(&path)?;
    if let Some(tile) = &args.tile {
        info!(tile = %tile, "Tile identity overridden on the command line");
        config.node.tile = tile.clone();
        config.validate()?;
    }
    Ok(config)
}

fn load_weights(args: &CliArgs, config: &NodeConfig) -> Result<WeightsTable> {
    let Some(path) = args.weights_file.as_ref().or(config.node.weights_file.as_ref()) else {
        warn!(
            tile = %config.node.tile,
            "No weights file configured, transmitting with unity weights"
        );
        return Ok(WeightsTable::default());
    };
    let table = WeightsTable::load(path)?;
    let own = table.require(&config.node.tile)?;
    info!(
        path = %path.display(),
        tile = %config.node.tile,
        channels = own.weights.len(),
        "Loaded tx weights"
    );
    Ok(table)
}

/// Simulated front-end wired the way the config describes the hardware.
fn sim_options(config: &NodeConfig) -> SimOptions {
    let roles = &config.channels;
    let cal = &config.calibration;
    SimOptions {
        channels: config.radio.channels.iter().max().map_or(1, |&c| c + 1),
        switch_bank: cal.switch_bank,
        switch_addr: cal.switch_addr,
        switch_loopback_value: cal.switch_loopback_value,
        ref_channel: roles.ref_rx,
        free_tx_channel: roles.free_tx,
        loopback_tx_channel: roles.loopback_tx,
        loopback_rx_channel: roles.loopback_rx,
        ..SimOptions::default()
    }
}

/// Map a fatal start-up error onto its process exit code.
fn exit_code_for(e: &anyhow::Error) -> NodeExit {
    if let Some(e) = e.downcast_ref::<ConfigError>() {
        e.exit_code()
    } else if let Some(e) = e.downcast_ref::<WeightsError>() {
        e.exit_code()
    } else if e.downcast_ref::<SetupError>().is_some() {
        NodeExit::HardwareBringUp
    } else {
        NodeExit::Failure
    }
}

async fn run(args: CliArgs) -> Result<()> {
    let config = load_config(&args)?;
    let weights = load_weights(&args, &config)?;
    let config = Arc::new(config);

    let mut lock = NodeLock::acquire(&config.node.data_dir)
        .context("another node owns this data directory")?;

    if !args.simulate {
        bail!("no hardware backend in this build; run with --simulate");
    }
    let sim = SimRadio::new(sim_options(&config));
    let radio: Arc<dyn RadioDevice> = Arc::new(sim);
    info!("🖥️  Front-end: {}", radio.description());

    let setup = bring_up(&radio, &config).await.context("device bring-up failed")?;
    info!(
        rate = setup.sample_rate,
        mcr = setup.master_clock_rate,
        channels = ?setup.channels,
        "✓ Front-end ready"
    );

    let cal = &config.calibration;
    let switch = Arc::new(RegisterSwitch::new(
        Arc::clone(&radio),
        cal.switch_bank,
        cal.switch_addr,
        cal.switch_loopback_value,
        cal.switch_reset_value,
    ));
    let scheduler = CommandScheduler::new(radio, switch, Arc::clone(&config), weights, Some(setup));

    // Graceful shutdown via Ctrl+C
    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Received Ctrl+C, initiating shutdown...");
        shutdown_token.cancel();
    });

    let (mut queue, handle) = ChannelTransport::pair(defaults::TRANSPORT_QUEUE_DEPTH);
    let mut task_set: JoinSet<Result<TaskName>> = JoinSet::new();

    match args.controller.or_else(|| config.transport.controller_addr.clone()) {
        Some(addr) => {
            info!("📥 Controller: tcp://{}", addr);
            let line = LineTransport::connect(&addr).await?;
            spawn_transport_pump(&mut task_set, line, handle, cancel_token.clone());
        }
        None => {
            info!("📥 Controller: stdin/stdout");
            let stdio = LineTransport::stdio();
            spawn_transport_pump(&mut task_set, stdio, handle, cancel_token.clone());
        }
    }

    let scheduler_cancel = cancel_token.clone();
    task_set.spawn(async move {
        info!("[Scheduler] Task starting");
        scheduler.run(&mut queue, scheduler_cancel).await?;
        Ok(TaskName::Scheduler)
    });

    let outcome = run_supervisor(&mut task_set, cancel_token).await;
    lock.release();
    outcome
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    init_tracing(args.log_json);

    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    info!("  tilesync {}", env!("CARGO_PKG_VERSION"));
    info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    match run(args).await {
        Ok(()) => {
            info!("✓ tilesync shutdown complete");
            NodeExit::Success.into()
        }
        Err(e) => {
            let exit = exit_code_for(&e);
            error!("❌ {:#}", e);
            exit.into()
        }
    }
}
