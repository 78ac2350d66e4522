//! JSON codec for SDCP frames.
//!
//! Encoding builds [`RequestEnvelope`]s; decoding classifies inbound text by
//! its `Topic`.  Decoding is strict about structure (a frame that is not a
//! JSON object, or a response without `Data`, is a [`ProtocolError`]) but
//! tolerant about content: unknown topics and extra fields pass through.

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::command::{CommandArgs, CommandKind};
use crate::domain::printer::{PrinterDescriptor, PrinterId};
use crate::protocol::messages::{
    CommandCode, InboundFrame, RequestBody, RequestEnvelope, ResponseFrame, HEARTBEAT_PONG,
    TOPIC_ATTRIBUTES, TOPIC_ERROR, TOPIC_NOTICE, TOPIC_REQUEST, TOPIC_RESPONSE, TOPIC_STATUS,
};

/// Errors produced while encoding or decoding SDCP frames.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The text is not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),

    /// Valid JSON, but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("malformed field {field}: {reason}")]
    MalformedField { field: &'static str, reason: String },

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Generates a fresh request id (32 lowercase hex digits).
pub fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Current Unix time in seconds, as SDCP expects in `TimeStamp`.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Builds the inner `Data` object for a user command.
pub fn command_payload(kind: CommandKind, args: &CommandArgs) -> Value {
    match (kind, args) {
        (CommandKind::Start, CommandArgs::File(file)) => {
            json!({ "Filename": file, "StartLayer": 0 })
        }
        (CommandKind::DeleteFile, CommandArgs::File(path)) => json!({ "FileList": [path] }),
        _ => Value::Object(Map::new()),
    }
}

/// Builds the inner `Data` object for a file listing of `dir`.
pub fn file_list_payload(dir: &str) -> Value {
    json!({ "Url": dir })
}

/// Serializes one request addressed to `target`.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
///
/// # Examples
///
/// ```rust
/// use chitu_core::protocol::{encode_request, CommandCode};
/// use chitu_core::PrinterDescriptor;
///
/// let printer = PrinterDescriptor::new("mb1", "Mars", "10.0.0.5".parse().unwrap());
/// let text = encode_request(&printer, CommandCode::Pause, serde_json::json!({}), "req1", 1).unwrap();
/// assert!(text.contains("\"Cmd\":129"));
/// assert!(text.contains("sdcp/request/mb1"));
/// ```
pub fn encode_request(
    target: &PrinterDescriptor,
    code: CommandCode,
    data: Value,
    request_id: &str,
    timestamp: u64,
) -> Result<String, ProtocolError> {
    let envelope = RequestEnvelope {
        id: target.connection_id().to_string(),
        data: RequestBody {
            cmd: code.code(),
            data,
            request_id: request_id.to_string(),
            mainboard_id: target.id.to_string(),
            timestamp,
            from: 0,
        },
        topic: format!("{TOPIC_REQUEST}{}", target.id),
    };
    serde_json::to_string(&envelope).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Classifies one inbound text frame.
///
/// # Errors
///
/// Returns a [`ProtocolError`] when the text is not a JSON object or a
/// known topic lacks its mandatory fields.
pub fn decode_frame(text: &str) -> Result<InboundFrame, ProtocolError> {
    let trimmed = text.trim();
    if trimmed == HEARTBEAT_PONG {
        return Ok(InboundFrame::Pong);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
    let obj = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    let topic = obj
        .get("Topic")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let mainboard_id = mainboard_id_of(obj, &topic);

    if topic.starts_with(TOPIC_RESPONSE) {
        return decode_response(obj).map(InboundFrame::Response);
    }
    if topic.starts_with(TOPIC_STATUS) {
        let status = obj
            .get("Status")
            .cloned()
            .ok_or(ProtocolError::MissingField("Status"))?;
        return Ok(InboundFrame::Status {
            mainboard_id,
            status,
        });
    }
    if topic.starts_with(TOPIC_ATTRIBUTES) {
        let attributes = obj
            .get("Attributes")
            .cloned()
            .ok_or(ProtocolError::MissingField("Attributes"))?;
        return Ok(InboundFrame::Attributes {
            mainboard_id,
            attributes,
        });
    }
    if topic.starts_with(TOPIC_ERROR) {
        return Ok(InboundFrame::Error {
            mainboard_id,
            payload: value.clone(),
        });
    }
    if topic.starts_with(TOPIC_NOTICE) {
        return Ok(InboundFrame::Notice {
            mainboard_id,
            payload: value.clone(),
        });
    }
    Ok(InboundFrame::Unknown { topic })
}

fn decode_response(obj: &Map<String, Value>) -> Result<ResponseFrame, ProtocolError> {
    let data = obj
        .get("Data")
        .and_then(Value::as_object)
        .ok_or(ProtocolError::MissingField("Data"))?;
    let cmd = data
        .get("Cmd")
        .ok_or(ProtocolError::MissingField("Cmd"))?
        .as_u64()
        .and_then(|c| u32::try_from(c).ok())
        .ok_or_else(|| ProtocolError::MalformedField {
            field: "Cmd",
            reason: "expected an unsigned integer".to_string(),
        })?;
    let request_id = data
        .get("RequestID")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let inner = data.get("Data").cloned().unwrap_or(Value::Null);
    let ack = inner.get("Ack").and_then(Value::as_i64);
    Ok(ResponseFrame {
        cmd,
        request_id,
        ack,
        data: inner,
    })
}

/// `MainboardID` may sit at the top level (status pushes) or inside `Data`
/// (responses); fall back to the topic suffix.
fn mainboard_id_of(obj: &Map<String, Value>, topic: &str) -> String {
    obj.get("MainboardID")
        .or_else(|| obj.get("Data").and_then(|d| d.get("MainboardID")))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| topic.rsplit('/').next().unwrap_or_default().to_string())
}

// ── Discovery ─────────────────────────────────────────────────────────────────

/// Turns a UDP discovery reply into a registry candidate.
///
/// Expected shape:
///
/// ```json
/// {"Id": "conn", "Data": {"Name": "...", "MachineName": "...", "BrandName": "...",
///  "MainboardIP": "10.0.0.5", "MainboardID": "...", "ProtocolVersion": "V3.0.0",
///  "FirmwareVersion": "V1.2.3"}}
/// ```
///
/// # Errors
///
/// Returns a [`ProtocolError`] when the reply lacks the mainboard id or a
/// parseable IP address.
pub fn parse_discovery_reply(bytes: &[u8]) -> Result<PrinterDescriptor, ProtocolError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::NotJson(e.to_string()))?;
    let data = value
        .get("Data")
        .and_then(Value::as_object)
        .ok_or(ProtocolError::MissingField("Data"))?;
    let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);

    let id = text("MainboardID").ok_or(ProtocolError::MissingField("MainboardID"))?;
    let ip_text = text("MainboardIP").ok_or(ProtocolError::MissingField("MainboardIP"))?;
    let ip: IpAddr = ip_text.parse().map_err(|_| ProtocolError::MalformedField {
        field: "MainboardIP",
        reason: format!("'{ip_text}' is not an IP address"),
    })?;

    let name = text("Name")
        .or_else(|| text("MachineName"))
        .unwrap_or_else(|| id.clone());
    let mut descriptor = PrinterDescriptor::new(PrinterId::new(id), name, ip);
    descriptor.connection_id = value.get("Id").and_then(Value::as_str).map(str::to_string);
    descriptor.model = text("MachineName");
    descriptor.brand = text("BrandName");
    descriptor.firmware_version = text("FirmwareVersion");
    if let Some(version) = text("ProtocolVersion") {
        descriptor.protocol_version = version;
    }
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer() -> PrinterDescriptor {
        let mut d = PrinterDescriptor::new("MB01", "Saturn", "192.168.1.20".parse().unwrap());
        d.connection_id = Some("conn-1".to_string());
        d
    }

    #[test]
    fn test_encode_request_builds_sdcp_envelope() {
        // Arrange
        let data = command_payload(CommandKind::Start, &CommandArgs::File("a.ctb".to_string()));

        // Act
        let text = encode_request(&printer(), CommandCode::StartPrint, data, "abc", 1700).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();

        // Assert
        assert_eq!(v["Id"], "conn-1");
        assert_eq!(v["Topic"], "sdcp/request/MB01");
        assert_eq!(v["Data"]["Cmd"], 128);
        assert_eq!(v["Data"]["RequestID"], "abc");
        assert_eq!(v["Data"]["MainboardID"], "MB01");
        assert_eq!(v["Data"]["TimeStamp"], 1700);
        assert_eq!(v["Data"]["From"], 0);
        assert_eq!(v["Data"]["Data"]["Filename"], "a.ctb");
        assert_eq!(v["Data"]["Data"]["StartLayer"], 0);
    }

    #[test]
    fn test_delete_payload_lists_path() {
        let v = command_payload(CommandKind::DeleteFile, &CommandArgs::File("/usb/a.ctb".into()));
        assert_eq!(v["FileList"][0], "/usb/a.ctb");
    }

    #[test]
    fn test_pause_payload_is_empty_object() {
        let v = command_payload(CommandKind::Pause, &CommandArgs::None);
        assert_eq!(v, json!({}));
    }

    #[test]
    fn test_new_request_id_is_32_hex() {
        let id = new_request_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_decode_pong() {
        assert_eq!(decode_frame("pong").unwrap(), InboundFrame::Pong);
    }

    #[test]
    fn test_decode_status_frame() {
        let text = r#"{"Status":{"CurrentStatus":[0]},"MainboardID":"MB01","TimeStamp":1,"Topic":"sdcp/status/MB01"}"#;
        match decode_frame(text).unwrap() {
            InboundFrame::Status { mainboard_id, status } => {
                assert_eq!(mainboard_id, "MB01");
                assert_eq!(status["CurrentStatus"][0], 0);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_with_ack() {
        let text = r#"{"Id":"c","Data":{"Cmd":129,"Data":{"Ack":0},"RequestID":"r1","MainboardID":"MB01","TimeStamp":1},"Topic":"sdcp/response/MB01"}"#;
        match decode_frame(text).unwrap() {
            InboundFrame::Response(r) => {
                assert_eq!(r.cmd, 129);
                assert_eq!(r.request_id, "r1");
                assert_eq!(r.ack, Some(0));
                assert!(r.is_accepted());
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_decode_response_without_data_is_error() {
        let text = r#"{"Topic":"sdcp/response/MB01"}"#;
        assert_eq!(decode_frame(text), Err(ProtocolError::MissingField("Data")));
    }

    #[test]
    fn test_decode_status_without_status_is_error() {
        let text = r#"{"Topic":"sdcp/status/MB01"}"#;
        assert_eq!(decode_frame(text), Err(ProtocolError::MissingField("Status")));
    }

    #[test]
    fn test_decode_garbage_is_not_json() {
        assert!(matches!(decode_frame("{{nope"), Err(ProtocolError::NotJson(_))));
        assert_eq!(decode_frame("[1,2]"), Err(ProtocolError::NotAnObject));
    }

    #[test]
    fn test_decode_unknown_topic_passes_through() {
        let text = r#"{"Topic":"sdcp/video/MB01"}"#;
        assert_eq!(
            decode_frame(text).unwrap(),
            InboundFrame::Unknown {
                topic: "sdcp/video/MB01".to_string()
            }
        );
    }

    #[test]
    fn test_mainboard_id_falls_back_to_topic_suffix() {
        let text = r#"{"Topic":"sdcp/notice/MB77","Data":{}}"#;
        match decode_frame(text).unwrap() {
            InboundFrame::Notice { mainboard_id, .. } => assert_eq!(mainboard_id, "MB77"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_parse_discovery_reply() {
        // Arrange
        let reply = br#"{"Id":"conn-9","Data":{"Name":"Lab Mars","MachineName":"Mars 4 Ultra",
            "BrandName":"ELEGOO","MainboardIP":"192.168.1.44","MainboardID":"ab12",
            "ProtocolVersion":"V3.0.0","FirmwareVersion":"V4.3.2"}}"#;

        // Act
        let d = parse_discovery_reply(reply).unwrap();

        // Assert
        assert_eq!(d.id.as_str(), "ab12");
        assert_eq!(d.name, "Lab Mars");
        assert_eq!(d.ip.to_string(), "192.168.1.44");
        assert_eq!(d.connection_id(), "conn-9");
        assert_eq!(d.model.as_deref(), Some("Mars 4 Ultra"));
        assert_eq!(d.brand.as_deref(), Some("ELEGOO"));
        assert_eq!(d.firmware_version.as_deref(), Some("V4.3.2"));
    }

    #[test]
    fn test_parse_discovery_reply_rejects_bad_ip() {
        let reply = br#"{"Data":{"MainboardIP":"printer.local","MainboardID":"ab12"}}"#;
        assert!(matches!(
            parse_discovery_reply(reply),
            Err(ProtocolError::MalformedField { field: "MainboardIP", .. })
        ));
    }
}
