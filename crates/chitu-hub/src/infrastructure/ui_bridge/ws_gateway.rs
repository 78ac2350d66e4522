//! WebSocket gateway: accept loop and per-UI-session tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Upgrading each browser or phone connection to a WebSocket session.
//! 3. Subscribing the session to the [`EventBus`](crate::application::event_bus::EventBus)
//!    and sending it a snapshot (printer list, connectivity, latest status).
//! 4. Running two concurrent halves per session:
//!    - **UI → Hub**: reads JSON requests and calls into the [`Hub`].
//!    - **Hub → UI**: forwards bus events and direct replies as JSON text.
//! 5. Stopping the accept loop when the `running` flag is cleared.
//!
//! Every frame in both directions is `{"event": <name>, "data": <payload>}`.
//! A request that fails is answered with an error toast sent to the
//! requesting session only.
//!
//! Uploads: `upload_begin` opens an upload and makes it the session's
//! active one, binary frames carry its bytes in order, and
//! `upload_complete` hands it to the background phase.  Progress arrives
//! as `upload_progress` events on the bus.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use chitu_core::{
    CommandArgs, CommandId, CommandKind, DescriptorPatch, FileEntry, HubEvent, PrinterDescriptor,
    PrinterId, ToastKind, UploadTask, UsbDeviceType,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{DeleteOutcome, Hub, HubError};
use crate::application::event_bus::SessionId;
use crate::application::track_uploads::UploadError;

const DEFAULT_FILE_DIR: &str = "/usb";

// ── Wire types ────────────────────────────────────────────────────────────────

/// Requests a UI session may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Restricts printer events to `printers`; `None` means all.
    Subscribe {
        #[serde(default)]
        printers: Option<Vec<PrinterId>>,
    },
    Printers,
    ActionPrint { id: PrinterId, file: String },
    ActionPause { id: PrinterId },
    ActionResume { id: PrinterId },
    ActionStop { id: PrinterId },
    ActionDelete { id: PrinterId, path: String },
    ActionClearHistory { id: PrinterId },
    ActionWipeStorage { id: PrinterId },
    PrinterFiles {
        id: PrinterId,
        #[serde(default = "default_file_dir")]
        url: String,
    },
    AddPrinter(AddPrinter),
    UpdatePrinter {
        id: PrinterId,
        #[serde(default)]
        patch: DescriptorPatch,
    },
    RemovePrinter { id: PrinterId },
    SetDefault { id: PrinterId },
    /// Asks the printer to push fresh status and attributes.
    RefreshStatus { id: PrinterId },
    UploadStatus { upload_id: Uuid },
    /// Opens an upload; the id is generated when omitted.
    UploadBegin {
        id: PrinterId,
        #[serde(default)]
        upload_id: Option<Uuid>,
        filename: String,
        total_bytes: u64,
    },
    UploadComplete { upload_id: Uuid },
}

fn default_file_dir() -> String {
    DEFAULT_FILE_DIR.to_string()
}

/// Manual printer registration from the UI.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AddPrinter {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub ip: IpAddr,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub usb_device_type: Option<UsbDeviceType>,
}

impl AddPrinter {
    fn into_descriptor(self) -> PrinterDescriptor {
        let mut d = PrinterDescriptor::new(
            self.id.unwrap_or_default(),
            self.name.unwrap_or_default(),
            self.ip,
        );
        if let Some(port) = self.port {
            d.port = port;
        }
        if let Some(kind) = self.usb_device_type {
            d.usb_device_type = kind;
        }
        d
    }
}

/// Replies addressed to the requesting session only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum GatewayReply {
    CommandAccepted {
        printer_id: PrinterId,
        command_id: CommandId,
    },
    PrinterFiles {
        printer_id: PrinterId,
        url: String,
        files: Vec<FileEntry>,
    },
    PrinterAdded { printer_id: PrinterId },
    UploadStatus {
        upload_id: Uuid,
        task: Option<UploadTask>,
    },
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `addr` and serves UI sessions until `running` is set to `false`.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_gateway(hub: Arc<Hub>, addr: SocketAddr, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind UI gateway on {addr}"))?;
    info!("UI gateway listening on {addr}");
    serve(listener, hub, running).await;
    Ok(())
}

/// Accept loop over an already bound listener.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping UI gateway");
            break;
        }

        // Short timeout so the flag is re-checked while idle.
        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                info!("new UI connection from {peer}");
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    handle_ui_session(stream, peer, hub).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_ui_session(stream: TcpStream, peer: SocketAddr, hub: Arc<Hub>) {
    match run_session(stream, peer, hub).await {
        Ok(()) => info!("UI session {peer} closed normally"),
        Err(e) => warn!("UI session {peer} closed with error: {e:#}"),
    }
}

async fn run_session(stream: TcpStream, peer: SocketAddr, hub: Arc<Hub>) -> anyhow::Result<()> {
    let ws = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer}"))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let session_id: SessionId = Uuid::new_v4();
    let subscription = hub.bus().subscribe(session_id, None);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let mut active_upload: Option<Uuid> = None;

    for event in hub.snapshot_events().await {
        queue(&reply_tx, &event);
    }

    // Hub → UI: direct replies first, then bus events, in arrival order.
    let writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                biased;
                reply = reply_rx.recv() => match reply {
                    Some(text) => text,
                    None => break,
                },
                event = subscription.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("session {session_id}: cannot serialize {}: {e}", event.name());
                            continue;
                        }
                    },
                    None => break,
                },
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                debug!("session {session_id}: send failed (UI disconnected)");
                break;
            }
        }
    });

    loop {
        let msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => break,
            Some(Err(e)) => {
                warn!("session {session_id}: WebSocket error: {e}");
                break;
            }
        };
        match msg {
            WsMessage::Text(text) => {
                let request = match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("session {session_id}: bad request: {e}");
                        queue(&reply_tx, &HubEvent::toast(ToastKind::Error, format!("invalid request: {e}")));
                        continue;
                    }
                };
                if let Err(e) = handle_request(&hub, session_id, request, &mut active_upload, &reply_tx).await {
                    queue(&reply_tx, &HubEvent::toast(ToastKind::Error, e.to_string()));
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Binary(bytes) => {
                let Some(upload_id) = active_upload else {
                    warn!("session {session_id}: binary frame without an active upload");
                    queue(&reply_tx, &HubEvent::toast(ToastKind::Error, "no upload in progress"));
                    continue;
                };
                if let Err(e) = hub.uploads().receive_chunk(upload_id, &bytes).await {
                    debug!("session {session_id}: chunk for {upload_id} rejected: {e}");
                    active_upload = None;
                    queue(&reply_tx, &HubEvent::toast(ToastKind::Error, e.to_string()));
                }
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }

    hub.bus().unsubscribe(session_id);
    drop(reply_tx);
    writer.abort();
    Ok(())
}

fn queue<T: Serialize>(out: &mpsc::UnboundedSender<String>, value: &T) {
    match serde_json::to_string(value) {
        Ok(text) => {
            let _ = out.send(text);
        }
        Err(e) => error!("cannot serialize reply: {e}"),
    }
}

/// Executes one request, queueing any reply for the session.
async fn handle_request(
    hub: &Hub,
    session_id: SessionId,
    request: ClientRequest,
    active_upload: &mut Option<Uuid>,
    out: &mpsc::UnboundedSender<String>,
) -> Result<(), HubError> {
    let (id, kind, args) = match request {
        ClientRequest::Subscribe { printers } => {
            let filter = printers.map(|p| p.into_iter().collect::<HashSet<_>>());
            hub.bus().set_filter(session_id, filter);
            return Ok(());
        }
        ClientRequest::Printers => {
            for event in hub.snapshot_events().await {
                queue(out, &event);
            }
            return Ok(());
        }
        ClientRequest::PrinterFiles { id, url } => {
            let files = hub.list_files(&id, &url).await?;
            queue(out, &GatewayReply::PrinterFiles { printer_id: id, url, files });
            return Ok(());
        }
        ClientRequest::AddPrinter(add) => {
            let printer_id = hub.add_printer(add.into_descriptor()).await?;
            queue(out, &GatewayReply::PrinterAdded { printer_id });
            return Ok(());
        }
        ClientRequest::UpdatePrinter { id, patch } => {
            hub.update_printer(&id, &patch).await?;
            return Ok(());
        }
        ClientRequest::RemovePrinter { id } => return hub.remove_printer(&id).await,
        ClientRequest::SetDefault { id } => return hub.set_default(&id).await,
        ClientRequest::RefreshStatus { id } => return hub.refresh(&id).await,
        ClientRequest::UploadStatus { upload_id } => {
            let task = hub.uploads().get(upload_id);
            queue(out, &GatewayReply::UploadStatus { upload_id, task });
            return Ok(());
        }
        ClientRequest::UploadBegin {
            id,
            upload_id,
            filename,
            total_bytes,
        } => {
            let upload_id = upload_id.unwrap_or_else(Uuid::new_v4);
            let task = hub.begin_upload(upload_id, &id, &filename, total_bytes).await?;
            *active_upload = Some(upload_id);
            queue(out, &GatewayReply::UploadStatus { upload_id, task: Some(task) });
            return Ok(());
        }
        ClientRequest::UploadComplete { upload_id } => {
            let task = hub.uploads().get(upload_id).ok_or(UploadError::NotFound(upload_id))?;
            if *active_upload == Some(upload_id) {
                *active_upload = None;
            }
            finish_upload(hub, task);
            return Ok(());
        }
        ClientRequest::ActionDelete { id, path } => {
            match hub.delete_file(&id, &path).await? {
                DeleteOutcome::Substrate => queue(
                    out,
                    &HubEvent::printer_toast(id, ToastKind::Success, format!("{path} deleted")),
                ),
                DeleteOutcome::Dispatched(command_id) => {
                    queue(out, &GatewayReply::CommandAccepted { printer_id: id, command_id })
                }
            }
            return Ok(());
        }
        ClientRequest::ActionPrint { id, file } => (id, CommandKind::Start, CommandArgs::File(file)),
        ClientRequest::ActionPause { id } => (id, CommandKind::Pause, CommandArgs::None),
        ClientRequest::ActionResume { id } => (id, CommandKind::Resume, CommandArgs::None),
        ClientRequest::ActionStop { id } => (id, CommandKind::Stop, CommandArgs::None),
        ClientRequest::ActionClearHistory { id } => (id, CommandKind::ClearHistory, CommandArgs::None),
        ClientRequest::ActionWipeStorage { id } => (id, CommandKind::WipeStorage, CommandArgs::None),
    };
    let command_id = hub.dispatch(&id, kind, args).await?;
    queue(out, &GatewayReply::CommandAccepted { printer_id: id, command_id });
    Ok(())
}

/// Runs the rest of `task` in the background.  Failures the pipeline does
/// not report itself become an error toast for the printer.
fn finish_upload(hub: &Hub, task: UploadTask) {
    let uploads = hub.uploads().clone();
    let bus = Arc::clone(hub.bus());
    tokio::spawn(async move {
        match uploads.complete(task.upload_id).await {
            Ok(phase) => debug!("upload {} ended {phase:?}", task.upload_id),
            Err(UploadError::Substrate(_)) => {}
            Err(e) => {
                warn!("upload {} failed: {e}", task.upload_id);
                bus.publish(HubEvent::printer_toast(
                    task.printer_id,
                    ToastKind::Error,
                    format!("Upload of {} failed: {e}", task.filename),
                ));
            }
        }
    });
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn parse(v: Value) -> ClientRequest {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_action_requests_deserialize() {
        assert_eq!(
            parse(json!({"event": "action_print", "data": {"id": "P1", "file": "a.ctb"}})),
            ClientRequest::ActionPrint {
                id: PrinterId::from("P1"),
                file: "a.ctb".into()
            }
        );
        assert_eq!(
            parse(json!({"event": "action_clear_history", "data": {"id": "P1"}})),
            ClientRequest::ActionClearHistory { id: PrinterId::from("P1") }
        );
        assert_eq!(
            parse(json!({"event": "refresh_status", "data": {"id": "P1"}})),
            ClientRequest::RefreshStatus { id: PrinterId::from("P1") }
        );
    }

    #[test]
    fn test_unit_and_defaulted_requests_deserialize() {
        assert_eq!(parse(json!({"event": "printers"})), ClientRequest::Printers);
        assert_eq!(
            parse(json!({"event": "printer_files", "data": {"id": "P1"}})),
            ClientRequest::PrinterFiles {
                id: PrinterId::from("P1"),
                url: "/usb".into()
            }
        );
        assert_eq!(
            parse(json!({"event": "subscribe", "data": {}})),
            ClientRequest::Subscribe { printers: None }
        );
    }

    #[test]
    fn test_add_printer_builds_descriptor_with_defaults() {
        // Arrange
        let req = parse(json!({"event": "add_printer", "data": {"ip": "10.0.0.9", "usb_device_type": "virtual"}}));
        let ClientRequest::AddPrinter(add) = req else {
            panic!("expected add_printer");
        };

        // Act
        let d = add.into_descriptor();

        // Assert
        assert!(d.id.is_empty());
        assert_eq!(d.port, 3030);
        assert_eq!(d.usb_device_type, UsbDeviceType::Virtual);
    }

    #[test]
    fn test_upload_requests_deserialize() {
        // Arrange
        let id = Uuid::new_v4();

        // Act
        let begin = parse(json!({
            "event": "upload_begin",
            "data": {"id": "P1", "filename": "cube.ctb", "total_bytes": 3}
        }));
        let complete = parse(json!({"event": "upload_complete", "data": {"upload_id": id}}));

        // Assert
        assert_eq!(
            begin,
            ClientRequest::UploadBegin {
                id: PrinterId::from("P1"),
                upload_id: None,
                filename: "cube.ctb".into(),
                total_bytes: 3
            }
        );
        assert_eq!(complete, ClientRequest::UploadComplete { upload_id: id });
    }

    #[test]
    fn test_unknown_event_is_rejected() {
        assert!(serde_json::from_value::<ClientRequest>(json!({"event": "reboot", "data": {}})).is_err());
    }

    #[test]
    fn test_reply_wire_format() {
        let reply = GatewayReply::PrinterAdded {
            printer_id: PrinterId::from("P9"),
        };
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v, json!({"event": "printer_added", "data": {"printer_id": "P9"}}));
    }
}
