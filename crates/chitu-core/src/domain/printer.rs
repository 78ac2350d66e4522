//! Printer identity and addressing.
//!
//! A [`PrinterDescriptor`] is the durable record the registry keeps for every
//! printer the hub should talk to.  Descriptors are created either from a
//! discovery reply or by a user adding a printer by IP address.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// TCP port SDCP mainboards serve their WebSocket endpoint on.
pub const DEFAULT_SDCP_PORT: u16 = 3030;

/// Protocol version assumed for manually added printers.
pub const DEFAULT_PROTOCOL_VERSION: &str = "V3.0.0";

/// Stable identifier of a printer.
///
/// For discovered printers this is the mainboard id reported by the
/// firmware; for manually added printers without one it is derived from the
/// printer's network target (see [`PrinterId::derive_from_target`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrinterId(String);

impl PrinterId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a stable id from `ip:port`.
    ///
    /// The same target always yields the same id, so re-adding a printer by
    /// hand after removing it keeps any references (default selection, UI
    /// bookmarks) valid.
    pub fn derive_from_target(ip: IpAddr, port: u16) -> Self {
        let name = format!("sdcp://{}", SocketAddr::new(ip, port));
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()).simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PrinterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrinterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PrinterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How the printer reads files produced by the hub.
///
/// `Physical` printers have the hub's USB gadget plugged into their USB
/// port, so uploads go through the mass-storage substrate.  `Virtual`
/// printers receive files over the network only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsbDeviceType {
    #[default]
    Physical,
    Virtual,
}

/// Durable registry record for one printer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrinterDescriptor {
    pub id: PrinterId,
    pub name: String,
    pub ip: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default)]
    pub is_default: bool,
    /// SDCP connection id (`Id` field of request envelopes).  Falls back to
    /// the printer id when the printer was never discovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub usb_device_type: UsbDeviceType,
    /// Disabled printers stay registered but get no session.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    DEFAULT_SDCP_PORT
}
fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}
fn default_true() -> bool {
    true
}

impl PrinterDescriptor {
    /// Creates a descriptor with the default SDCP port and protocol version.
    pub fn new(id: impl Into<PrinterId>, name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ip,
            port: DEFAULT_SDCP_PORT,
            protocol_version: default_protocol_version(),
            is_default: false,
            connection_id: None,
            model: None,
            brand: None,
            firmware_version: None,
            usb_device_type: UsbDeviceType::default(),
            enabled: true,
        }
    }

    /// The `ip:port` pair the session connects to.  Two descriptors with the
    /// same target are the same physical printer.
    pub fn target(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// WebSocket URL of the printer's SDCP endpoint.
    pub fn websocket_url(&self) -> String {
        format!("ws://{}/websocket", self.target())
    }

    pub fn connection_id(&self) -> &str {
        self.connection_id.as_deref().unwrap_or(self.id.as_str())
    }

    /// Applies every `Some` field of `patch`.
    pub fn apply(&mut self, patch: &DescriptorPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(ip) = patch.ip {
            self.ip = ip;
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(version) = &patch.protocol_version {
            self.protocol_version = version.clone();
        }
        if let Some(kind) = patch.usb_device_type {
            self.usb_device_type = kind;
        }
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(model) = &patch.model {
            self.model = Some(model.clone());
        }
    }
}

/// Partial update for a descriptor; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub usb_device_type: Option<UsbDeviceType>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub model: Option<String>,
}

impl DescriptorPatch {
    /// Returns `true` when applying the patch may change the network target.
    pub fn changes_target(&self) -> bool {
        self.ip.is_some() || self.port.is_some()
    }
}
