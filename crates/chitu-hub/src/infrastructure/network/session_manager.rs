//! SessionManager: one supervised WebSocket worker per registered printer.
//!
//! # Worker lifecycle
//!
//! ```text
//!  attach ─► Disconnected ─► Connecting ──connect ok──► Connected
//!                              ▲   │                      │ missed heartbeats,
//!                 backoff done │   │ connect failed       │ decode error,
//!                              │   ▼                      ▼ socket closed
//!                              └─ (backoff) ◄──────── Degraded
//!  detach ─► Disconnected (from any state)
//! ```
//!
//! Every transition is published once as `PrinterConnectivityChanged`.
//! Connection attempts that fail while already `Connecting` publish
//! nothing; the UI already shows the printer as offline.
//!
//! While connected the worker:
//!
//! - sends the text keepalive `ping` every heartbeat interval and counts a
//!   miss when nothing arrives within the heartbeat timeout;
//! - decodes inbound frames, runs status payloads through the normalizer and
//!   publishes changed snapshots;
//! - forwards acks and status snapshots to the hub as [`SessionSignal`]s so
//!   the dispatcher can settle commands;
//! - serves command and file-listing requests from the rest of the hub.
//!
//! # Connection epochs
//!
//! Each `Connected` transition increments the printer's epoch.  A command
//! frame is written only if the caller's expected epoch is still current,
//! which is what keeps retries from crossing a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chitu_core::protocol::codec::{command_payload, file_list_payload, new_request_id, unix_timestamp};
use chitu_core::protocol::messages::ResponseFrame;
use chitu_core::{
    decode_frame, encode_request, normalize_update, CommandCode, ConnectionState, FileEntry,
    HubEvent, InboundFrame, PrinterDescriptor, PrinterId, PrinterStatus, SequenceCounter,
    ToastKind,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::backoff::BackoffPolicy;
use crate::application::dispatch_commands::{CommandSink, OutboundCommand, SendError};
use crate::application::event_bus::EventBus;
use crate::application::track_uploads::{FileLister, ListingError};

// ── Transport seam ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("transport error: {0}")]
    Io(String),
}

/// One inbound WebSocket event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// Protocol-level ping; the transport answers it.
    Ping,
    Pong,
    Binary(usize),
}

/// An open connection to one printer.
#[async_trait]
pub trait PrinterLink: Send {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Next inbound event; `None` once the peer closed the connection.
    async fn next_event(&mut self) -> Option<Result<LinkEvent, TransportError>>;

    async fn close(&mut self);
}

/// Opens [`PrinterLink`]s.
///
/// Infrastructure implementation is `WebSocketTransport`; tests script the
/// printer side over channels.
#[async_trait]
pub trait PrinterTransport: Send + Sync {
    async fn connect(&self, printer: &PrinterDescriptor) -> Result<Box<dyn PrinterLink>, TransportError>;
}

// ── Configuration / public types ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub backoff: BackoffPolicy,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub missed_heartbeat_limit: u32,
    pub connect_timeout: Duration,
    pub file_list_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Duration::from_secs(3),
            heartbeat_timeout: Duration::from_secs(2),
            missed_heartbeat_limit: 3,
            connect_timeout: Duration::from_secs(5),
            file_list_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no session for printer {0}")]
    UnknownPrinter(PrinterId),
    #[error("printer {0} is not connected")]
    NotConnected(PrinterId),
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    /// Number of `Connected` transitions so far.
    pub epoch: u64,
    pub consecutive_failures: u32,
    pub last_heartbeat_at: Option<Instant>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            epoch: 0,
            consecutive_failures: 0,
            last_heartbeat_at: None,
        }
    }
}

/// What sessions report back to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSignal {
    /// Explicit ack frame for a command request.
    Ack {
        printer_id: PrinterId,
        request_id: String,
        code: i64,
    },
    /// A new canonical status was published.
    Status {
        printer_id: PrinterId,
        status: PrinterStatus,
    },
    Connected { printer_id: PrinterId, epoch: u64 },
}

/// Latest canonical status per printer, for UI sessions joining late.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard(Arc<RwLock<HashMap<PrinterId, PrinterStatus>>>);

impl StatusBoard {
    pub fn get(&self, id: &PrinterId) -> Option<PrinterStatus> {
        self.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<(PrinterId, PrinterStatus)> {
        self.read()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect()
    }

    fn set(&self, id: PrinterId, status: PrinterStatus) {
        self.write().insert(id, status);
    }

    fn remove(&self, id: &PrinterId) {
        self.write().remove(id);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PrinterId, PrinterStatus>> {
        self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PrinterId, PrinterStatus>> {
        self.0.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

enum SessionRequest {
    Command {
        command: OutboundCommand,
        expected_epoch: u64,
        reply: oneshot::Sender<Result<u64, SendError>>,
    },
    ListFiles {
        dir: String,
        reply: oneshot::Sender<Result<Vec<FileEntry>, ListingError>>,
    },
    Refresh,
}

struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    snapshot: watch::Receiver<SessionSnapshot>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct SessionManager {
    transport: Arc<dyn PrinterTransport>,
    bus: Arc<EventBus>,
    config: SessionConfig,
    board: StatusBoard,
    signals: mpsc::UnboundedSender<SessionSignal>,
    sessions: Mutex<HashMap<PrinterId, SessionHandle>>,
}

impl SessionManager {
    /// Creates the manager together with the receiver of its signals.
    pub fn new(
        transport: Arc<dyn PrinterTransport>,
        bus: Arc<EventBus>,
        config: SessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionSignal>) {
        let (signals, rx) = mpsc::unbounded_channel();
        let mgr = Self {
            transport,
            bus,
            config,
            board: StatusBoard::default(),
            signals,
            sessions: Mutex::new(HashMap::new()),
        };
        (mgr, rx)
    }

    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// Starts a worker for `descriptor`.  Returns `false` if the printer is
    /// disabled or already has a session.
    pub fn attach(&self, descriptor: &PrinterDescriptor) -> bool {
        if !descriptor.enabled {
            debug!("printer {} is disabled; no session", descriptor.id);
            return false;
        }
        let mut sessions = crate::application::lock(&self.sessions);
        if sessions.contains_key(&descriptor.id) {
            return false;
        }

        let (req_tx, req_rx) = mpsc::channel(32);
        let (snap_tx, snap_rx) = watch::channel(SessionSnapshot::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let worker = Worker {
            descriptor: descriptor.clone(),
            transport: Arc::clone(&self.transport),
            bus: Arc::clone(&self.bus),
            board: self.board.clone(),
            signals: self.signals.clone(),
            config: self.config.clone(),
            snapshot: snap_tx,
            requests: req_rx,
            shutdown: stop_rx,
            sequence: SequenceCounter::new(),
            status: None,
            pending_lists: HashMap::new(),
        };
        let task = tokio::spawn(worker.run());
        sessions.insert(
            descriptor.id.clone(),
            SessionHandle {
                requests: req_tx,
                snapshot: snap_rx,
                shutdown: stop_tx,
                task,
            },
        );
        info!("session attached for {} ({})", descriptor.id, descriptor.target());
        true
    }

    /// Stops the worker for `id` and waits until it has released its socket.
    pub async fn detach(&self, id: &PrinterId) -> bool {
        let handle = crate::application::lock(&self.sessions).remove(id);
        let Some(handle) = handle else {
            return false;
        };
        handle.shutdown.send_replace(true);
        if let Err(e) = handle.task.await {
            warn!("session worker for {id} ended abnormally: {e}");
        }
        self.board.remove(id);
        info!("session detached for {id}");
        true
    }

    /// Replaces the session of a changed descriptor.
    pub async fn restart(&self, descriptor: &PrinterDescriptor) -> bool {
        self.detach(&descriptor.id).await;
        self.attach(descriptor)
    }

    pub async fn shutdown(&self) {
        let ids: Vec<PrinterId> = crate::application::lock(&self.sessions).keys().cloned().collect();
        for id in ids {
            self.detach(&id).await;
        }
    }

    pub fn snapshot(&self, id: &PrinterId) -> Option<SessionSnapshot> {
        crate::application::lock(&self.sessions)
            .get(id)
            .map(|h| h.snapshot.borrow().clone())
    }

    pub fn connection_state(&self, id: &PrinterId) -> ConnectionState {
        self.snapshot(id)
            .map(|s| s.state)
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub fn attached(&self) -> Vec<PrinterId> {
        crate::application::lock(&self.sessions).keys().cloned().collect()
    }

    /// Asks a connected printer to push its status and attributes.
    pub async fn request_refresh(&self, id: &PrinterId) -> Result<(), SessionError> {
        let (requests, snap) = self
            .handle_parts(id)
            .ok_or_else(|| SessionError::UnknownPrinter(id.clone()))?;
        if snap.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected(id.clone()));
        }
        requests
            .send(SessionRequest::Refresh)
            .await
            .map_err(|_| SessionError::NotConnected(id.clone()))
    }

    fn handle_parts(&self, id: &PrinterId) -> Option<(mpsc::Sender<SessionRequest>, SessionSnapshot)> {
        crate::application::lock(&self.sessions)
            .get(id)
            .map(|h| (h.requests.clone(), h.snapshot.borrow().clone()))
    }
}

#[async_trait]
impl CommandSink for SessionManager {
    fn connected_epoch(&self, printer_id: &PrinterId) -> Option<u64> {
        self.snapshot(printer_id)
            .filter(|s| s.state == ConnectionState::Connected)
            .map(|s| s.epoch)
    }

    async fn send_command(
        &self,
        printer_id: &PrinterId,
        command: &OutboundCommand,
        expected_epoch: Option<u64>,
    ) -> Result<u64, SendError> {
        let (requests, snap) = self.handle_parts(printer_id).ok_or(SendError::NotConnected)?;
        if snap.state != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        requests
            .send(SessionRequest::Command {
                command: command.clone(),
                expected_epoch: expected_epoch.unwrap_or(snap.epoch),
                reply,
            })
            .await
            .map_err(|_| SendError::Closed)?;
        rx.await.map_err(|_| SendError::Closed)?
    }
}

#[async_trait]
impl FileLister for SessionManager {
    async fn list_files(&self, printer_id: &PrinterId, dir: &str) -> Result<Vec<FileEntry>, ListingError> {
        let (requests, snap) = self.handle_parts(printer_id).ok_or(ListingError::Unreachable)?;
        if snap.state != ConnectionState::Connected {
            return Err(ListingError::Unreachable);
        }
        let (reply, rx) = oneshot::channel();
        requests
            .send(SessionRequest::ListFiles {
                dir: dir.to_string(),
                reply,
            })
            .await
            .map_err(|_| ListingError::Unreachable)?;
        match tokio::time::timeout(self.config.file_list_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ListingError::Unreachable),
            Err(_) => Err(ListingError::Timeout),
        }
    }
}

// ── Worker ────────────────────────────────────────────────────────────────────

/// Why `serve` returned.
enum ServeExit {
    Shutdown,
    Lost(String),
}

struct Worker {
    descriptor: PrinterDescriptor,
    transport: Arc<dyn PrinterTransport>,
    bus: Arc<EventBus>,
    board: StatusBoard,
    signals: mpsc::UnboundedSender<SessionSignal>,
    config: SessionConfig,
    snapshot: watch::Sender<SessionSnapshot>,
    requests: mpsc::Receiver<SessionRequest>,
    shutdown: watch::Receiver<bool>,
    sequence: SequenceCounter,
    status: Option<PrinterStatus>,
    pending_lists: HashMap<String, oneshot::Sender<Result<Vec<FileEntry>, ListingError>>>,
}

impl Worker {
    async fn run(mut self) {
        let id = self.descriptor.id.clone();
        'supervise: loop {
            if self.stopping() {
                break;
            }
            self.set_state(ConnectionState::Connecting);

            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(&self.descriptor),
            );
            let attempt = tokio::select! {
                _ = self.shutdown.changed() => break 'supervise,
                r = connect => r,
            };

            match attempt {
                Ok(Ok(mut link)) => {
                    self.on_connected(&mut link).await;
                    let exit = self.serve(&mut link).await;
                    link.close().await;
                    self.fail_pending_lists();
                    match exit {
                        ServeExit::Shutdown => break,
                        ServeExit::Lost(reason) => {
                            warn!("session {id} degraded: {reason}");
                            self.snapshot.send_modify(|s| s.consecutive_failures = 1);
                            self.set_state(ConnectionState::Degraded);
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.snapshot.send_modify(|s| s.consecutive_failures += 1);
                    debug!("session {id}: {e}");
                }
                Err(_) => {
                    self.snapshot.send_modify(|s| s.consecutive_failures += 1);
                    debug!("session {id}: connect timed out");
                }
            }

            let failures = self.snapshot.borrow().consecutive_failures;
            let delay = self.config.backoff.delay(failures);
            debug!("session {id}: reconnecting in {delay:?} (failure {failures})");
            if !self.wait_backoff(delay).await {
                break;
            }
        }
        self.set_state(ConnectionState::Disconnected);
        debug!("session worker for {id} exited");
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn set_state(&self, next: ConnectionState) {
        let current = self.snapshot.borrow().state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                "session {}: unexpected transition {current:?} -> {next:?}",
                self.descriptor.id
            );
        }
        self.snapshot.send_modify(|s| s.state = next);
        info!("printer {} is {next:?}", self.descriptor.id);
        self.bus.publish(HubEvent::PrinterConnectivityChanged {
            printer_id: self.descriptor.id.clone(),
            state: next,
            online: next.is_online(),
        });
    }

    async fn on_connected(&mut self, link: &mut Box<dyn PrinterLink>) {
        self.snapshot.send_modify(|s| {
            s.epoch += 1;
            s.consecutive_failures = 0;
            s.last_heartbeat_at = Some(Instant::now());
        });
        self.set_state(ConnectionState::Connected);
        let epoch = self.snapshot.borrow().epoch;
        let _ = self.signals.send(SessionSignal::Connected {
            printer_id: self.descriptor.id.clone(),
            epoch,
        });
        if let Err(e) = self.send_refresh(link).await {
            debug!("session {}: refresh request failed: {e}", self.descriptor.id);
        }
    }

    /// Sleeps through a backoff delay, turning away requests meanwhile.
    /// Returns `false` on shutdown.
    async fn wait_backoff(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                _ = self.shutdown.changed() => return false,
                req = self.requests.recv() => match req {
                    Some(req) => reject(req),
                    None => return false,
                },
            }
        }
    }

    async fn serve(&mut self, link: &mut Box<dyn PrinterLink>) -> ServeExit {
        let interval = self.config.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping_sent_at: Option<Instant> = None;
        let mut missed = 0u32;

        loop {
            let pong_deadline = ping_sent_at.map(|t| t + self.config.heartbeat_timeout);
            tokio::select! {
                _ = self.shutdown.changed() => return ServeExit::Shutdown,

                event = link.next_event() => {
                    let event = match event {
                        Some(Ok(event)) => event,
                        Some(Err(e)) => return ServeExit::Lost(e.to_string()),
                        None => return ServeExit::Lost("connection closed by printer".to_string()),
                    };
                    ping_sent_at = None;
                    missed = 0;
                    self.snapshot.send_modify(|s| s.last_heartbeat_at = Some(Instant::now()));
                    match event {
                        LinkEvent::Text(text) => {
                            if let Err(reason) = self.handle_text(&text) {
                                return ServeExit::Lost(reason);
                            }
                        }
                        LinkEvent::Ping | LinkEvent::Pong => {}
                        LinkEvent::Binary(len) => debug!("session {}: ignoring {len}-byte binary frame", self.descriptor.id),
                    }
                }

                req = self.requests.recv() => {
                    let Some(req) = req else {
                        return ServeExit::Shutdown;
                    };
                    if let Err(e) = self.handle_request(link, req).await {
                        return ServeExit::Lost(e.to_string());
                    }
                }

                _ = ticker.tick() => {
                    self.pending_lists.retain(|_, reply| !reply.is_closed());
                    if ping_sent_at.is_none() {
                        if let Err(e) = link.send_text(chitu_core::protocol::HEARTBEAT_PING.to_string()).await {
                            return ServeExit::Lost(e.to_string());
                        }
                        ping_sent_at = Some(Instant::now());
                    }
                }

                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    ping_sent_at = None;
                    missed += 1;
                    debug!("session {}: missed heartbeat {missed}", self.descriptor.id);
                    if missed >= self.config.missed_heartbeat_limit {
                        return ServeExit::Lost(format!("{missed} heartbeats missed"));
                    }
                }
            }
        }
    }

    async fn handle_request(
        &mut self,
        link: &mut Box<dyn PrinterLink>,
        req: SessionRequest,
    ) -> Result<(), TransportError> {
        match req {
            SessionRequest::Command {
                command,
                expected_epoch,
                reply,
            } => {
                let epoch = self.snapshot.borrow().epoch;
                if expected_epoch != epoch {
                    let _ = reply.send(Err(SendError::EpochChanged {
                        expected: expected_epoch,
                        actual: epoch,
                    }));
                    return Ok(());
                }
                let code = CommandCode::for_kind(command.kind);
                let payload = command_payload(command.kind, &command.args);
                let frame = match encode_request(
                    &self.descriptor,
                    code,
                    payload,
                    &command.request_id,
                    unix_timestamp(),
                ) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("session {}: {e}", self.descriptor.id);
                        let _ = reply.send(Err(SendError::Closed));
                        return Ok(());
                    }
                };
                debug!("session {}: -> Cmd {} ({})", self.descriptor.id, code.code(), command.request_id);
                match link.send_text(frame).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(epoch));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = reply.send(Err(SendError::Closed));
                        Err(e)
                    }
                }
            }
            SessionRequest::ListFiles { dir, reply } => {
                let request_id = new_request_id();
                match encode_request(
                    &self.descriptor,
                    CommandCode::FileList,
                    file_list_payload(&dir),
                    &request_id,
                    unix_timestamp(),
                ) {
                    Ok(frame) => {
                        link.send_text(frame).await?;
                        self.pending_lists.insert(request_id, reply);
                    }
                    Err(e) => {
                        warn!("session {}: {e}", self.descriptor.id);
                        let _ = reply.send(Err(ListingError::Unreachable));
                    }
                }
                Ok(())
            }
            SessionRequest::Refresh => self.send_refresh(link).await,
        }
    }

    async fn send_refresh(&self, link: &mut Box<dyn PrinterLink>) -> Result<(), TransportError> {
        for code in [CommandCode::Status, CommandCode::Attributes] {
            let frame = encode_request(
                &self.descriptor,
                code,
                Value::Object(Default::default()),
                &new_request_id(),
                unix_timestamp(),
            )
            .map_err(|e| TransportError::Io(e.to_string()))?;
            link.send_text(frame).await?;
        }
        Ok(())
    }

    /// Handles one text frame; `Err` means the stream can no longer be
    /// trusted.
    fn handle_text(&mut self, text: &str) -> Result<(), String> {
        let frame = decode_frame(text).map_err(|e| format!("undecodable frame: {e}"))?;
        let id = self.descriptor.id.clone();
        match frame {
            InboundFrame::Pong => {}
            InboundFrame::Response(response) => self.handle_response(response),
            InboundFrame::Status { status, .. } => {
                match normalize_update(&status, self.status.as_ref(), self.sequence.next()) {
                    Ok(Some(next)) => {
                        self.status = Some(next.clone());
                        self.board.set(id.clone(), next.clone());
                        self.bus.publish(HubEvent::PrinterStatusChanged {
                            printer_id: id.clone(),
                            status: next.clone(),
                        });
                        let _ = self.signals.send(SessionSignal::Status {
                            printer_id: id,
                            status: next,
                        });
                    }
                    Ok(None) => {}
                    Err(e) => warn!("printer {id}: status ignored: {e}"),
                }
            }
            InboundFrame::Attributes { attributes, .. } => {
                debug!("printer {id} attributes: {attributes}");
            }
            InboundFrame::Error { payload, .. } => {
                let message = format!("{}: {}", self.descriptor.name, describe_frame(&payload));
                warn!("printer {id} error: {message}");
                self.bus.publish(HubEvent::printer_toast(id, ToastKind::Error, message));
            }
            InboundFrame::Notice { payload, .. } => {
                let message = format!("{}: {}", self.descriptor.name, describe_frame(&payload));
                self.bus.publish(HubEvent::printer_toast(id, ToastKind::Info, message));
            }
            InboundFrame::Unknown { topic } => debug!("printer {id}: ignoring topic {topic:?}"),
        }
        Ok(())
    }

    fn handle_response(&mut self, response: ResponseFrame) {
        if let Some(reply) = self.pending_lists.remove(&response.request_id) {
            let result = if response.is_accepted() {
                Ok(response.file_list().unwrap_or_default())
            } else {
                Err(ListingError::Rejected(response.ack.unwrap_or(-1)))
            };
            let _ = reply.send(result);
            return;
        }
        let refresh = [CommandCode::Status.code(), CommandCode::Attributes.code()];
        if refresh.contains(&response.cmd) {
            return;
        }
        let _ = self.signals.send(SessionSignal::Ack {
            printer_id: self.descriptor.id.clone(),
            request_id: response.request_id,
            code: response.ack.unwrap_or(chitu_core::protocol::ACK_OK),
        });
    }

    fn fail_pending_lists(&mut self) {
        for (_, reply) in self.pending_lists.drain() {
            let _ = reply.send(Err(ListingError::Unreachable));
        }
    }
}

fn reject(req: SessionRequest) {
    match req {
        SessionRequest::Command { reply, .. } => {
            let _ = reply.send(Err(SendError::NotConnected));
        }
        SessionRequest::ListFiles { reply, .. } => {
            let _ = reply.send(Err(ListingError::Unreachable));
        }
        SessionRequest::Refresh => {}
    }
}

/// Human-readable text of an error or notice frame.
fn describe_frame(payload: &Value) -> String {
    let inner = payload
        .get("Data")
        .map(|d| d.get("Data").unwrap_or(d))
        .unwrap_or(payload);
    for key in ["Message", "Msg", "Notice"] {
        if let Some(text) = inner.get(key).and_then(Value::as_str) {
            return text.to_string();
        }
    }
    for key in ["ErrorCode", "Code"] {
        if let Some(code) = inner.get(key).and_then(Value::as_i64) {
            return format!("printer error {code}");
        }
    }
    inner.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use uuid::Uuid;

    type ToHub = mpsc::UnboundedSender<Option<Result<LinkEvent, TransportError>>>;

    /// The printer end of a scripted link.
    struct PrinterSide {
        to_hub: ToHub,
        from_hub: mpsc::UnboundedReceiver<String>,
    }

    impl PrinterSide {
        fn push(&self, text: impl Into<String>) {
            let _ = self.to_hub.send(Some(Ok(LinkEvent::Text(text.into()))));
        }

        /// Next JSON request from the hub, skipping keepalives.
        async fn next_request(&mut self) -> Value {
            loop {
                let text = self.from_hub.recv().await.unwrap();
                if text != "ping" {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }
    }

    struct ScriptedLink {
        inbound: mpsc::UnboundedReceiver<Option<Result<LinkEvent, TransportError>>>,
        outbound: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl PrinterLink for ScriptedLink {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.outbound
                .send(text)
                .map_err(|_| TransportError::Io("printer gone".into()))
        }
        async fn next_event(&mut self) -> Option<Result<LinkEvent, TransportError>> {
            self.inbound.recv().await.flatten()
        }
        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct ScriptedTransport {
        links: Mutex<VecDeque<ScriptedLink>>,
    }

    impl ScriptedTransport {
        fn offer(&self) -> PrinterSide {
            let (to_hub, inbound) = mpsc::unbounded_channel();
            let (outbound, from_hub) = mpsc::unbounded_channel();
            crate::application::lock(&self.links).push_back(ScriptedLink { inbound, outbound });
            PrinterSide { to_hub, from_hub }
        }
    }

    #[async_trait]
    impl PrinterTransport for ScriptedTransport {
        async fn connect(&self, _: &PrinterDescriptor) -> Result<Box<dyn PrinterLink>, TransportError> {
            match crate::application::lock(&self.links).pop_front() {
                Some(link) => Ok(Box::new(link)),
                None => Err(TransportError::Connect("connection refused".into())),
            }
        }
    }

    fn printer() -> PrinterDescriptor {
        PrinterDescriptor::new("P1", "Mars", "10.0.0.5".parse().unwrap())
    }

    fn config() -> SessionConfig {
        SessionConfig {
            backoff: BackoffPolicy {
                jitter: 0.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn status_frame(print_status: i64, layer: u32) -> String {
        json!({
            "Topic": "sdcp/status/P1",
            "MainboardID": "P1",
            "Status": {
                "CurrentStatus": [1],
                "PrintInfo": {"Status": print_status, "CurrentLayer": layer, "TotalLayer": 100, "Filename": "a.ctb"}
            }
        })
        .to_string()
    }

    struct Fixture {
        mgr: SessionManager,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        transport: Arc<ScriptedTransport>,
        bus: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(ScriptedTransport::default());
        let bus = Arc::new(EventBus::new(256));
        let (mgr, signals) = SessionManager::new(transport.clone(), Arc::clone(&bus), config());
        Fixture {
            mgr,
            signals,
            transport,
            bus,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_sends_refresh_and_signals_epoch() {
        // Arrange
        let mut f = fixture();
        let mut side = f.transport.offer();

        // Act
        assert!(f.mgr.attach(&printer()));
        settle().await;

        // Assert
        assert_eq!(f.mgr.connection_state(&PrinterId::from("P1")), ConnectionState::Connected);
        assert_eq!(side.next_request().await["Data"]["Cmd"], 0);
        assert_eq!(side.next_request().await["Data"]["Cmd"], 1);
        assert_eq!(
            f.signals.try_recv().unwrap(),
            SessionSignal::Connected {
                printer_id: PrinterId::from("P1"),
                epoch: 1
            }
        );
        assert_eq!(f.mgr.connected_epoch(&PrinterId::from("P1")), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_frames_publish_only_changes() {
        // Arrange
        let mut f = fixture();
        let side = f.transport.offer();
        let sub = f.bus.subscribe(Uuid::new_v4(), None);
        f.mgr.attach(&printer());
        settle().await;

        // Act
        side.push(status_frame(3, 10));
        side.push(status_frame(3, 10));
        side.push(status_frame(3, 11));
        settle().await;

        // Assert
        let layers: Vec<u32> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|e| match e {
                HubEvent::PrinterStatusChanged { status, .. } => Some(status.current_layer),
                _ => None,
            })
            .collect();
        assert_eq!(layers, vec![10, 11]);
        assert_eq!(f.mgr.board().get(&PrinterId::from("P1")).unwrap().current_layer, 11);
        let statuses = std::iter::from_fn(|| f.signals.try_recv().ok())
            .filter(|s| matches!(s, SessionSignal::Status { .. }))
            .count();
        assert_eq!(statuses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_is_framed_and_ack_signalled() {
        // Arrange
        let mut f = fixture();
        let mut side = f.transport.offer();
        f.mgr.attach(&printer());
        settle().await;
        side.next_request().await;
        side.next_request().await;
        let command = OutboundCommand {
            request_id: "req-7".into(),
            kind: chitu_core::CommandKind::Pause,
            args: Default::default(),
        };

        // Act
        let epoch = f.mgr.send_command(&PrinterId::from("P1"), &command, None).await.unwrap();
        let sent = side.next_request().await;
        side.push(
            json!({"Topic": "sdcp/response/P1", "Data": {"Cmd": 129, "RequestID": "req-7", "Data": {"Ack": 0}}})
                .to_string(),
        );
        settle().await;

        // Assert
        assert_eq!(epoch, 1);
        assert_eq!(sent["Data"]["Cmd"], 129);
        assert_eq!(sent["Data"]["RequestID"], "req-7");
        let ack = std::iter::from_fn(|| f.signals.try_recv().ok())
            .find(|s| matches!(s, SessionSignal::Ack { .. }))
            .unwrap();
        assert_eq!(
            ack,
            SessionSignal::Ack {
                printer_id: PrinterId::from("P1"),
                request_id: "req-7".into(),
                code: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_epoch_is_refused() {
        let f = fixture();
        let _side = f.transport.offer();
        f.mgr.attach(&printer());
        settle().await;
        let command = OutboundCommand {
            request_id: "r".into(),
            kind: chitu_core::CommandKind::Stop,
            args: Default::default(),
        };

        let err = f
            .mgr
            .send_command(&PrinterId::from("P1"), &command, Some(0))
            .await
            .unwrap_err();

        assert_eq!(err, SendError::EpochChanged { expected: 0, actual: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_files_correlates_response() {
        // Arrange
        let f = fixture();
        let mut side = f.transport.offer();
        f.mgr.attach(&printer());
        settle().await;
        side.next_request().await;
        side.next_request().await;

        // Act
        let listing = tokio::spawn({
            let mgr = Arc::new(f.mgr);
            let m = Arc::clone(&mgr);
            async move { m.list_files(&PrinterId::from("P1"), "/usb").await }
        });
        let request = side.next_request().await;
        let rid = request["Data"]["RequestID"].as_str().unwrap().to_string();
        side.push(
            json!({"Topic": "sdcp/response/P1", "Data": {"Cmd": 258, "RequestID": rid, "Data": {
                "Ack": 0,
                "FileList": [{"name": "/usb/model.goo", "type": 1, "usedSize": 42}]
            }}})
            .to_string(),
        );

        // Assert
        assert_eq!(request["Data"]["Cmd"], 258);
        assert_eq!(request["Data"]["Data"]["Url"], "/usb");
        let files = listing.await.unwrap().unwrap();
        assert_eq!(files[0].file_name(), "model.goo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_listing_times_out() {
        let f = fixture();
        let _side = f.transport.offer();
        f.mgr.attach(&printer());
        settle().await;

        let err = f.mgr.list_files(&PrinterId::from("P1"), "/usb").await.unwrap_err();

        assert_eq!(err, ListingError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_degrades_session() {
        // Arrange
        let f = fixture();
        let side = f.transport.offer();
        let sub = f.bus.subscribe(Uuid::new_v4(), None);
        f.mgr.attach(&printer());
        settle().await;

        // Act
        side.push("this is not json");
        settle().await;

        // Assert
        let states: Vec<ConnectionState> = std::iter::from_fn(|| sub.try_recv())
            .filter_map(|e| match e {
                HubEvent::PrinterConnectivityChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Connecting, ConnectionState::Connected, ConnectionState::Degraded]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_frame_becomes_toast() {
        let f = fixture();
        let side = f.transport.offer();
        let sub = f.bus.subscribe(Uuid::new_v4(), None);
        f.mgr.attach(&printer());
        settle().await;

        side.push(json!({"Topic": "sdcp/error/P1", "Data": {"Data": {"ErrorCode": 3}}}).to_string());
        settle().await;

        let toast = std::iter::from_fn(|| sub.try_recv())
            .find(|e| matches!(e, HubEvent::Toast { .. }))
            .unwrap();
        assert!(matches!(
            toast,
            HubEvent::Toast { kind: ToastKind::Error, ref message, .. } if message == "Mars: printer error 3"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_detach_stops_worker_and_publishes_disconnected() {
        // Arrange
        let f = fixture();
        let _side = f.transport.offer();
        f.mgr.attach(&printer());
        settle().await;
        let sub = f.bus.subscribe(Uuid::new_v4(), None);

        // Act
        assert!(f.mgr.detach(&PrinterId::from("P1")).await);

        // Assert
        assert!(f.mgr.attached().is_empty());
        assert_eq!(f.mgr.connected_epoch(&PrinterId::from("P1")), None);
        assert!(matches!(
            sub.try_recv(),
            Some(HubEvent::PrinterConnectivityChanged {
                state: ConnectionState::Disconnected,
                ..
            })
        ));
        assert!(!f.mgr.detach(&PrinterId::from("P1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_printer_gets_no_session() {
        let f = fixture();
        let mut p = printer();
        p.enabled = false;
        assert!(!f.mgr.attach(&p));
        assert!(f.mgr.attached().is_empty());
    }

    #[test]
    fn test_describe_frame_prefers_message_text() {
        let v = json!({"Data": {"Data": {"Message": "resin low", "Code": 9}}});
        assert_eq!(describe_frame(&v), "resin low");
        assert_eq!(describe_frame(&json!({"Data": {"Code": 9}})), "printer error 9");
    }
}
