//! modelsync - file-relay synchronisation between a dispatch training simulator and a remote
//! traffic modeller.
//!
//! `modelsync relay` runs on the modeller's machine; `modelsync controller` is a headless
//! stand-in for the simulator side.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use config::{ModelsyncConfig, DEFAULT_CONFIG_PATH};
use modelsync_controller::{Controller, ControllerObservers};
use modelsync_core::{CameraSample, ConnectionState, NetworkStatus};
use modelsync_relay::RelayServer;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "modelsync", version, about)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the modeller's working directory to one controller at a time.
    Relay {
        #[arg(long)]
        listen: Option<SocketAddr>,
        #[arg(long)]
        working_dir: Option<PathBuf>,
        /// Append a JSON line per file read or write.
        #[arg(long)]
        activity_log: Option<PathBuf>,
    },
    /// Connect to a relay, load a network and report snapshots while it runs.
    Controller {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        /// Network to request once connected.
        #[arg(long)]
        network: Option<u32>,
    },
    /// Write the effective configuration to the config path.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting modelsync v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let mut cfg = ModelsyncConfig::load_from_path(&cli.config);
    match cli.command {
        Command::Relay {
            listen,
            working_dir,
            activity_log,
        } => {
            if let Some(listen) = listen {
                cfg.relay.listen = listen;
            }
            if let Some(dir) = working_dir {
                cfg.relay.working_dir = dir;
            }
            if activity_log.is_some() {
                cfg.relay.activity_log = activity_log;
            }
            run_relay(&cfg)
        }
        Command::Controller {
            host,
            port,
            network,
        } => {
            if let Some(host) = host {
                cfg.controller.host = host;
            }
            if let Some(port) = port {
                cfg.controller.port = port;
            }
            run_controller(&cfg, network)
        }
        Command::InitConfig { force } => {
            if cli.config.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    cli.config.display()
                );
            }
            cfg.save_to_path(&cli.config)?;
            info!(path = %cli.config.display(), "Configuration written");
            Ok(())
        }
    }
}

fn run_relay(cfg: &ModelsyncConfig) -> Result<()> {
    let handle = RelayServer::start(cfg.relay.relay_config()).context("failed to start relay")?;
    info!(
        addr = %handle.local_addr(),
        working_dir = %cfg.relay.working_dir.display(),
        "Relay ready"
    );
    loop {
        thread::park();
    }
}

fn run_controller(cfg: &ModelsyncConfig, network: Option<u32>) -> Result<()> {
    let observers = ControllerObservers {
        connection: Arc::new(|state: ConnectionState| info!(?state, "Connection")),
        status: Arc::new(|status: NetworkStatus, network_id: u32| {
            info!(%status, network_id, "Network status")
        }),
        camera: Arc::new(|sample: CameraSample| {
            info!(
                camera = sample.camera_id.as_str(),
                speed_ne = sample.speed_ne,
                speed_sw = sample.speed_sw,
                "Camera speeds"
            )
        }),
    };
    let controller = Controller::new(cfg.controller.controller_config(), observers);
    controller
        .connect()
        .with_context(|| format!("failed to reach relay at {}:{}", cfg.controller.host, cfg.controller.port))?;

    if let Some(network) = network {
        controller.load_network(network);
        info!(network, "Waiting for the modeller to load the network");
        while !controller.producer().is_network_loaded() {
            ensure_connected(&controller)?;
            thread::sleep(Duration::from_millis(200));
        }
        controller.start_simulation();
        controller
            .start_reporting()
            .context("failed to start the reporting clock")?;
    }

    loop {
        ensure_connected(&controller)?;
        thread::sleep(Duration::from_secs(1));
    }
}

fn ensure_connected(controller: &Controller) -> Result<()> {
    if !controller.session().is_connected() {
        bail!("relay connection lost ({:?})", controller.state());
    }
    Ok(())
}
