//! ChituHub: printer connection and synchronization hub, entry point.
//!
//! Keeps a WebSocket session open to every registered SDCP resin printer,
//! normalizes their status reports, dispatches print commands with ack
//! tracking, and serves everything to browser and phone UIs over a second
//! WebSocket.  Optionally drives the Linux USB gadget that exposes a shared
//! FAT image to a printer's USB port.
//!
//! # Usage
//!
//! ```text
//! chitu-hub [OPTIONS]
//!
//! Options:
//!   --config <FILE>           TOML config file [default: <data dir>/config.toml]
//!   --port <PORT>             UI gateway port
//!   --data-dir <DIR>          Registry and staging directory
//!   --usb-gadget-path <DIR>   Mount point of the USB gadget image
//!   --enable-usb-gadget       Drive the USB gadget
//!   --debug                   Debug logging
//!   --init-config             Write the effective config to --config and exit
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable             | Flag                  |
//! |----------------------|-----------------------|
//! | `PORT`               | `--port`              |
//! | `USB_GADGET_PATH`    | `--usb-gadget-path`   |
//! | `ENABLE_USB_GADGET`  | `--enable-usb-gadget` |
//! | `DEBUG`              | `--debug`             |
//!
//! Flags and environment variables override values from the config file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chitu_hub::application::manage_printers::PrinterRegistry;
use chitu_hub::application::reload_substrate::GadgetCoordinator;
use chitu_hub::infrastructure::gadget::SystemGadgetKernel;
use chitu_hub::infrastructure::network::WebSocketTransport;
use chitu_hub::infrastructure::storage::config::{
    default_data_dir, load_config, save_config, HubConfig,
};
use chitu_hub::infrastructure::storage::registry_store::TomlRegistryStore;
use chitu_hub::infrastructure::ui_bridge::{ws_gateway::run_gateway, Hub, HubSettings};

const CONFIG_FILE_NAME: &str = "config.toml";

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "chitu-hub",
    about = "Connection and synchronization hub for SDCP resin printers",
    version
)]
struct Cli {
    /// TOML configuration file.  A missing file means built-in defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// TCP port of the UI WebSocket gateway.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Directory for `printers.toml` and upload staging.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Mount point of the USB gadget image.
    #[arg(long, env = "USB_GADGET_PATH")]
    usb_gadget_path: Option<PathBuf>,

    /// Drive the USB mass-storage gadget (requires root).
    #[arg(long, env = "ENABLE_USB_GADGET")]
    enable_usb_gadget: bool,

    /// Log at debug level when `RUST_LOG` is unset.
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Write the effective configuration to the config file and exit.
    #[arg(long)]
    init_config: bool,
}

impl Cli {
    /// Overlays command-line values on a loaded config.
    fn apply_to(&self, config: &mut HubConfig) {
        if let Some(port) = self.port {
            config.gateway.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.hub.data_dir = Some(dir.clone());
        }
        if let Some(path) = &self.usb_gadget_path {
            config.gadget.mount_point = path.clone();
        }
        if self.enable_usb_gadget {
            config.gadget.enabled = true;
        }
        if self.debug {
            config.hub.log_level = "debug".to_string();
        }
    }

    fn config_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(path) = &self.config {
            return Ok(path.clone());
        }
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir().context("no data directory; pass --config or --data-dir")?,
        };
        Ok(dir.join(CONFIG_FILE_NAME))
    }
}

fn gateway_addr(config: &HubConfig) -> anyhow::Result<SocketAddr> {
    let g = &config.gateway;
    format!("{}:{}", g.bind_address, g.port)
        .parse()
        .with_context(|| format!("invalid gateway address '{}:{}'", g.bind_address, g.port))
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config_path()?;
    let mut config = load_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    cli.apply_to(&mut config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.hub.log_level.as_str())),
        )
        .init();

    if cli.init_config {
        save_config(&config_path, &config)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        info!("wrote {}", config_path.display());
        return Ok(());
    }

    let data_dir = config.data_dir()?;
    let addr = gateway_addr(&config)?;
    info!("ChituHub starting: data dir {}, gateway {addr}", data_dir.display());

    let (registry, warning) = PrinterRegistry::open(Box::new(TomlRegistryStore::in_dir(&data_dir)));
    if let Some(warning) = warning {
        warn!("{warning}");
    }

    let gadget = if config.gadget.enabled {
        let coordinator = GadgetCoordinator::new(Arc::new(SystemGadgetKernel::new()), config.gadget_config());
        if let Err(e) = coordinator.ensure_mounted().await {
            warn!("USB gadget image is not mounted: {e}");
        }
        Some(coordinator)
    } else {
        None
    };

    let hub = Hub::start(
        registry,
        Arc::new(WebSocketTransport::new()),
        gadget,
        HubSettings::from_config(&config, &data_dir),
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C; shutting down");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
        }
    });

    let served = run_gateway(Arc::clone(&hub), addr, running).await;
    hub.shutdown().await;
    served?;
    info!("ChituHub stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
