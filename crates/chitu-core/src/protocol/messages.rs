//! SDCP message types.
//!
//! SDCP ("Smart Device Control Protocol") is the JSON-over-WebSocket protocol
//! spoken by Chitu-based resin printer mainboards.  Every request is wrapped
//! in an envelope addressed to the mainboard:
//!
//! ```json
//! {
//!   "Id": "<connection id>",
//!   "Data": {
//!     "Cmd": 129,
//!     "Data": {},
//!     "RequestID": "8f0c...",
//!     "MainboardID": "<mainboard id>",
//!     "TimeStamp": 1718000000,
//!     "From": 0
//!   },
//!   "Topic": "sdcp/request/<mainboard id>"
//! }
//! ```
//!
//! The printer pushes frames on several topics (`sdcp/status/…`,
//! `sdcp/response/…`, `sdcp/attributes/…`, `sdcp/error/…`,
//! `sdcp/notice/…`), which the codec classifies into [`InboundFrame`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::command::CommandKind;

/// UDP port printers listen on for discovery probes.
pub const DISCOVERY_PORT: u16 = 3000;

/// Discovery probe payload broadcast to [`DISCOVERY_PORT`].
pub const DISCOVERY_PROBE: &[u8] = b"M99999";

/// Application-level keepalive sent as a text frame.
pub const HEARTBEAT_PING: &str = "ping";
pub const HEARTBEAT_PONG: &str = "pong";

/// `Ack` value signalling an accepted request.
pub const ACK_OK: i64 = 0;

pub const TOPIC_REQUEST: &str = "sdcp/request/";
pub const TOPIC_RESPONSE: &str = "sdcp/response/";
pub const TOPIC_STATUS: &str = "sdcp/status/";
pub const TOPIC_ATTRIBUTES: &str = "sdcp/attributes/";
pub const TOPIC_ERROR: &str = "sdcp/error/";
pub const TOPIC_NOTICE: &str = "sdcp/notice/";

/// SDCP command codes (`Data.Cmd`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Status,
    Attributes,
    StartPrint,
    Pause,
    Stop,
    Resume,
    FileList,
    DeleteFile,
    ClearHistory,
    WipeStorage,
}

impl CommandCode {
    pub fn code(self) -> u32 {
        match self {
            CommandCode::Status => 0,
            CommandCode::Attributes => 1,
            CommandCode::StartPrint => 128,
            CommandCode::Pause => 129,
            CommandCode::Stop => 130,
            CommandCode::Resume => 131,
            CommandCode::FileList => 258,
            CommandCode::DeleteFile => 259,
            CommandCode::ClearHistory => 320,
            CommandCode::WipeStorage => 322,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => CommandCode::Status,
            1 => CommandCode::Attributes,
            128 => CommandCode::StartPrint,
            129 => CommandCode::Pause,
            130 => CommandCode::Stop,
            131 => CommandCode::Resume,
            258 => CommandCode::FileList,
            259 => CommandCode::DeleteFile,
            320 => CommandCode::ClearHistory,
            322 => CommandCode::WipeStorage,
            _ => return None,
        })
    }

    pub fn for_kind(kind: CommandKind) -> Self {
        match kind {
            CommandKind::Start => CommandCode::StartPrint,
            CommandKind::Pause => CommandCode::Pause,
            CommandKind::Resume => CommandCode::Resume,
            CommandKind::Stop => CommandCode::Stop,
            CommandKind::DeleteFile => CommandCode::DeleteFile,
            CommandKind::ClearHistory => CommandCode::ClearHistory,
            CommandKind::WipeStorage => CommandCode::WipeStorage,
        }
    }
}

/// Outbound request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Data")]
    pub data: RequestBody,
    #[serde(rename = "Topic")]
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    #[serde(rename = "Cmd")]
    pub cmd: u32,
    #[serde(rename = "Data")]
    pub data: Value,
    #[serde(rename = "RequestID")]
    pub request_id: String,
    #[serde(rename = "MainboardID")]
    pub mainboard_id: String,
    #[serde(rename = "TimeStamp")]
    pub timestamp: u64,
    #[serde(rename = "From")]
    pub from: u8,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Status { mainboard_id: String, status: Value },
    Attributes { mainboard_id: String, attributes: Value },
    Error { mainboard_id: String, payload: Value },
    Notice { mainboard_id: String, payload: Value },
    /// Reply to the text keepalive.
    Pong,
    /// Well-formed JSON on a topic this hub does not handle.
    Unknown { topic: String },
}

/// Reply to one request, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub cmd: u32,
    pub request_id: String,
    /// `Data.Data.Ack`, absent on some informational responses.
    pub ack: Option<i64>,
    /// The inner `Data.Data` object.
    pub data: Value,
}

impl ResponseFrame {
    pub fn is_accepted(&self) -> bool {
        self.ack.unwrap_or(ACK_OK) == ACK_OK
    }

    /// Entries of a file-listing response, if this is one.
    pub fn file_list(&self) -> Option<Vec<FileEntry>> {
        let list = self.data.get("FileList")?.as_array()?;
        Some(list.iter().filter_map(FileEntry::from_value).collect())
    }
}

/// One entry of a printer file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Full printer-side path, e.g. `/usb/model.goo`.
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
}

impl FileEntry {
    /// Parses `{"name": ..., "type": 0|1, "usedSize": n}`; entries without a
    /// name are skipped.
    fn from_value(v: &Value) -> Option<Self> {
        let name = v.get("name")?.as_str()?.to_string();
        // SDCP: type 0 = folder, 1 = file.
        let is_dir = v.get("type").and_then(Value::as_i64) == Some(0);
        let size = v.get("usedSize").and_then(Value::as_u64);
        Some(Self { name, is_dir, size })
    }

    /// The last path component.
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}
