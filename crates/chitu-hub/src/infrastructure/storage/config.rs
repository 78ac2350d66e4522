//! TOML-based configuration for the hub.
//!
//! The file is optional: every field has a serde default, so a missing file,
//! an empty file, or a file written by an older version all load cleanly.
//!
//! ```toml
//! [hub]
//! log_level = "info"
//! data_dir = "/var/lib/chitu-hub"
//!
//! [session]
//! backoff_floor_ms = 1000
//! backoff_ceiling_ms = 30000
//! heartbeat_interval_ms = 3000
//!
//! [gadget]
//! enabled = true
//! mount_point = "/mnt/usb_share"
//!
//! [gateway]
//! port = 8080
//! ```
//!
//! Durations are stored as plain integers with the unit in the key name,
//! and converted into the typed config structs of each component by the
//! `*_config` methods below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::backoff::BackoffPolicy;
use crate::application::dispatch_commands::DispatchConfig;
use crate::application::event_bus::DEFAULT_QUEUE_CAPACITY;
use crate::application::reload_substrate::{default_module_params, GadgetConfig};
use crate::application::track_uploads::UploadConfig;
use crate::infrastructure::network::session_manager::SessionConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine a data directory (set --data-dir or HOME)")]
    NoDataDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HubConfig {
    #[serde(default)]
    pub hub: HubSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub event_bus: EventBusSection,
    #[serde(default)]
    pub gadget: GadgetSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub gateway: GatewaySection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Holds `printers.toml` and the upload staging area.  Defaults to the
    /// XDG data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Fraction of the base delay added as random jitter.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Consecutive missed heartbeats before a session is degraded.
    #[serde(default = "default_missed_heartbeat_limit")]
    pub missed_heartbeat_limit: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_file_list_timeout_ms")]
    pub file_list_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventBusSection {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GadgetSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
    #[serde(default = "default_image_path")]
    pub image_path: PathBuf,
    #[serde(default = "default_module", skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Module parameters; empty means the stock `g_mass_storage` set for
    /// `image_path`.
    #[serde(default)]
    pub module_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configfs_gadget: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udc_controller: Option<String>,
    #[serde(default = "default_reload_ceiling_secs")]
    pub reload_ceiling_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSection {
    #[serde(default = "default_visibility_schedule_secs")]
    pub visibility_schedule_secs: Vec<u64>,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// An upload that receives no bytes for this long is timed out.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Defaults to `<data_dir>/staging`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
    #[serde(default = "default_usb_listing_dir")]
    pub usb_listing_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_backoff_floor_ms() -> u64 {
    1_000
}
fn default_backoff_ceiling_ms() -> u64 {
    30_000
}
fn default_backoff_jitter() -> f64 {
    0.2
}
fn default_heartbeat_interval_ms() -> u64 {
    3_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    2_000
}
fn default_missed_heartbeat_limit() -> u32 {
    3
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_file_list_timeout_ms() -> u64 {
    5_000
}
fn default_ack_timeout_ms() -> u64 {
    5_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}
fn default_mount_point() -> PathBuf {
    PathBuf::from("/mnt/usb_share")
}
fn default_image_path() -> PathBuf {
    PathBuf::from("/piusb.bin")
}
fn default_module() -> Option<String> {
    Some("g_mass_storage".to_string())
}
fn default_reload_ceiling_secs() -> u64 {
    15
}
fn default_visibility_schedule_secs() -> Vec<u64> {
    vec![2, 3, 5, 7, 10]
}
fn default_retention_secs() -> u64 {
    60
}
fn default_idle_timeout_secs() -> u64 {
    300
}
fn default_allowed_extensions() -> Vec<String> {
    vec!["ctb".to_string(), "goo".to_string(), "prz".to_string()]
}
fn default_usb_listing_dir() -> String {
    "/usb".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_gateway_port() -> u16 {
    8080
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_dir: None,
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            backoff_jitter: default_backoff_jitter(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            missed_heartbeat_limit: default_missed_heartbeat_limit(),
            connect_timeout_ms: default_connect_timeout_ms(),
            file_list_timeout_ms: default_file_list_timeout_ms(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: default_ack_timeout_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for EventBusSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for GadgetSection {
    fn default() -> Self {
        Self {
            enabled: false,
            mount_point: default_mount_point(),
            image_path: default_image_path(),
            module: default_module(),
            module_params: Vec::new(),
            configfs_gadget: None,
            udc_controller: None,
            reload_ceiling_secs: default_reload_ceiling_secs(),
        }
    }
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            visibility_schedule_secs: default_visibility_schedule_secs(),
            retention_secs: default_retention_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            staging_dir: None,
            allowed_extensions: default_allowed_extensions(),
            usb_listing_dir: default_usb_listing_dir(),
        }
    }
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_gateway_port(),
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────────────

impl HubConfig {
    /// The configured data directory, or the platform default.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NoDataDir`] if neither is available.
    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.hub.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir().ok_or(ConfigError::NoDataDir),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        let s = &self.session;
        SessionConfig {
            backoff: BackoffPolicy {
                floor: Duration::from_millis(s.backoff_floor_ms),
                ceiling: Duration::from_millis(s.backoff_ceiling_ms.max(s.backoff_floor_ms)),
                jitter: if s.backoff_jitter.is_finite() {
                    s.backoff_jitter.clamp(0.0, 1.0)
                } else {
                    0.0
                },
            },
            heartbeat_interval: Duration::from_millis(s.heartbeat_interval_ms.max(1)),
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            missed_heartbeat_limit: s.missed_heartbeat_limit.max(1),
            connect_timeout: Duration::from_millis(s.connect_timeout_ms),
            file_list_timeout: Duration::from_millis(s.file_list_timeout_ms),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            ack_timeout: Duration::from_millis(self.dispatch.ack_timeout_ms),
            max_attempts: self.dispatch.max_attempts.max(1),
        }
    }

    pub fn gadget_config(&self) -> GadgetConfig {
        let g = &self.gadget;
        let module_params = if g.module_params.is_empty() {
            default_module_params(&g.image_path)
        } else {
            g.module_params.clone()
        };
        GadgetConfig {
            mount_point: g.mount_point.clone(),
            image_path: g.image_path.clone(),
            module: g.module.clone(),
            module_params,
            configfs_gadget: g.configfs_gadget.clone(),
            udc_controller: g.udc_controller.clone(),
            reload_ceiling: Duration::from_secs(g.reload_ceiling_secs),
        }
    }

    pub fn upload_config(&self, data_dir: &Path) -> UploadConfig {
        let u = &self.upload;
        UploadConfig {
            visibility_schedule: u
                .visibility_schedule_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            retention: Duration::from_secs(u.retention_secs),
            idle_timeout: Duration::from_secs(u.idle_timeout_secs.max(1)),
            staging_dir: u
                .staging_dir
                .clone()
                .unwrap_or_else(|| data_dir.join("staging")),
            allowed_extensions: u
                .allowed_extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            usb_listing_dir: u.usb_listing_dir.clone(),
        }
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// `$XDG_DATA_HOME/chitu-hub`, falling back to `~/.local/share/chitu-hub`.
pub fn default_data_dir() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share")))?;
    Some(base.join("chitu-hub"))
}

/// Loads `HubConfig` from `path`, returning defaults if the file does not
/// exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found",
/// [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<HubConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HubConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Writes `config` to `path`, creating the parent directory.
///
/// # Errors
///
/// [`ConfigError::Io`] or [`ConfigError::Serialize`].
pub fn save_config(path: &Path, config: &HubConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
