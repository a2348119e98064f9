//! sdp-lmcd: the SDP LMC daemon.
//!
//! Runs a single SDP device (the master or one subarray) against the
//! configuration database and serves its attributes and commands over the
//! REST API.
//!
//! # Usage
//!
//! ```text
//! sdp-lmcd master --config /etc/sdp-lmc/lmc.toml --port 8443
//! sdp-lmcd subarray --id 1 --memory --no-event-loop
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use sdp_lmc::{Device, LmcSettings, MasterDevice, StoreBackend, SubarrayDevice};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,sdp_lmc=debug,sdp_lmcd=debug";

#[derive(Parser)]
#[command(name = "sdp-lmcd", about = "SDP local monitoring and control daemon")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Domain part of the device name, as in `<domain>/elt/master`.
    #[arg(long, global = true, default_value = "test_sdp")]
    domain: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the SDP master device.
    Master {
        #[command(flatten)]
        opts: RunOpts,
    },
    /// Run an SDP subarray device.
    Subarray {
        /// Subarray number.
        #[arg(long)]
        id: u32,

        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Args)]
struct RunOpts {
    /// Settings file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Port to listen on; overrides the settings file.
    #[arg(long)]
    port: Option<u16>,

    /// Keep the configuration database in memory.
    #[arg(long)]
    memory: bool,

    /// Disable the reconciliation worker; attributes then only change on
    /// `update_attributes`.
    #[arg(long)]
    no_event_loop: bool,
}

impl RunOpts {
    /// Load the settings file, if any, and apply the command-line overrides.
    fn settings(&self) -> anyhow::Result<LmcSettings> {
        let mut settings = match &self.config {
            Some(path) => LmcSettings::from_file(path)?,
            None => LmcSettings::default(),
        };
        if let Some(port) = self.port {
            settings.api.port = port;
        }
        if self.memory {
            settings.store.backend = StoreBackend::Memory;
        }
        if self.no_event_loop {
            settings.event_loop.enabled = false;
        }
        Ok(settings)
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let (name, opts) = match &cli.command {
        Command::Master { opts } => (format!("{}/elt/master", cli.domain), opts),
        Command::Subarray { id, opts } => (format!("{}/elt/subarray_{id}", cli.domain), opts),
    };
    let settings = opts.settings()?;
    let is_master = matches!(cli.command, Command::Master { .. });

    run(name, is_master, settings).await
}

async fn run(name: String, is_master: bool, settings: LmcSettings) -> anyhow::Result<()> {
    info!(device = %name, "SDP LMC daemon starting");

    let store = settings.store.open()?;
    info!(backend = ?settings.store.backend, path = ?settings.store.path, "configuration database opened");

    // Device construction blocks until the first reconciliation pass.
    let device: Arc<dyn Device> = {
        let settings = settings.clone();
        let name = name.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<Arc<dyn Device>> {
            let device: Arc<dyn Device> = if is_master {
                Arc::new(MasterDevice::new(&name, &settings, store)?)
            } else {
                Arc::new(SubarrayDevice::new(&name, &settings, store)?)
            };
            Ok(device)
        })
        .await??
    };

    let router = sdp_lmc_api::build_router(device.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.api.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
        })
        .await?;

    tokio::task::spawn_blocking(move || device.shutdown()).await?;
    info!(device = %name, "SDP LMC daemon stopped");
    Ok(())
}
