//! UI bridge: the [`Hub`] facade and the WebSocket gateway in front of it.
//!
//! # How the pieces are wired (for beginners)
//!
//! ```text
//!  UI session ──ws──► ws_gateway ──► Hub ──► PrinterRegistry (printers.toml)
//!                         ▲           │ ├──► SessionManager ──ws──► printers
//!                         │           │ ├──► CommandDispatcher
//!                         │           │ └──► UploadPipeline ──► GadgetCoordinator
//!                         └─ EventBus ◄┘
//! ```
//!
//! The `Hub` owns two background tasks: the *signal router*, which carries
//! acks, status snapshots and reconnect epochs from the sessions to the
//! dispatcher, and the upload sweeper, which times out stalled uploads.  Everything a UI sees arrives through the [`EventBus`].

pub mod ws_gateway;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chitu_core::protocol::parse_discovery_reply;
use chitu_core::{
    CommandArgs, CommandId, CommandKind, DescriptorPatch, FailureReason, FileEntry, HubEvent,
    PrinterDescriptor, PrinterId, ProtocolError, UploadDestination, UploadTask, UsbDeviceType,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::dispatch_commands::{CommandDispatcher, DispatchConfig, DispatchError};
use crate::application::event_bus::EventBus;
use crate::application::manage_printers::{PrinterRegistry, RegistryError};
use crate::application::reload_substrate::{GadgetCoordinator, GadgetError};
use crate::application::track_uploads::{FileLister, ListingError, UploadConfig, UploadError, UploadPipeline};
use crate::infrastructure::network::session_manager::{
    PrinterTransport, SessionConfig, SessionError, SessionManager, SessionSignal,
};
use crate::infrastructure::storage::config::HubConfig;

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("file listing failed: {0:?}")]
    Listing(ListingError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid discovery reply: {0}")]
    Discovery(#[from] ProtocolError),

    #[error(transparent)]
    Gadget(#[from] GadgetError),

    #[error("printer {0} not found")]
    UnknownPrinter(PrinterId),
}

/// How often stalled uploads are looked for.
const UPLOAD_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Where a delete request went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Removed from the USB gadget image, which was then reloaded.
    Substrate,
    /// Sent to the printer as a delete command.
    Dispatched(CommandId),
}

/// Typed settings for every hub component.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
    pub upload: UploadConfig,
    pub queue_capacity: usize,
}

impl HubSettings {
    pub fn from_config(config: &HubConfig, data_dir: &Path) -> Self {
        Self {
            session: config.session_config(),
            dispatch: config.dispatch_config(),
            upload: config.upload_config(data_dir),
            queue_capacity: config.event_bus.queue_capacity.max(1),
        }
    }
}

pub struct Hub {
    registry: tokio::sync::Mutex<PrinterRegistry>,
    bus: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    dispatcher: CommandDispatcher,
    uploads: UploadPipeline,
    gadget: Option<GadgetCoordinator>,
    usb_dir: String,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    /// Wires all components and attaches a session to every enabled
    /// printer in `registry`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        registry: PrinterRegistry,
        transport: Arc<dyn PrinterTransport>,
        gadget: Option<GadgetCoordinator>,
        settings: HubSettings,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(settings.queue_capacity));
        let (sessions, signals) = SessionManager::new(transport, Arc::clone(&bus), settings.session);
        let sessions = Arc::new(sessions);
        let dispatcher = CommandDispatcher::new(sessions.clone(), Arc::clone(&bus), settings.dispatch);
        let substrate = gadget
            .clone()
            .map(|g| Arc::new(g) as Arc<dyn crate::application::track_uploads::Substrate>);
        let lister: Arc<dyn FileLister> = sessions.clone();
        let usb_dir = settings.upload.usb_listing_dir.clone();
        let uploads = UploadPipeline::new(Arc::clone(&bus), lister, substrate, settings.upload);

        for printer in registry.list() {
            sessions.attach(&printer);
        }
        let router = tokio::spawn(route_signals(signals, dispatcher.clone()));
        let sweeper = tokio::spawn(sweep_uploads(uploads.clone()));

        Arc::new(Self {
            registry: tokio::sync::Mutex::new(registry),
            bus,
            sessions,
            dispatcher,
            uploads,
            gadget,
            usb_dir,
            workers: Mutex::new(vec![router, sweeper]),
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn uploads(&self) -> &UploadPipeline {
        &self.uploads
    }

    pub fn gadget(&self) -> Option<&GadgetCoordinator> {
        self.gadget.as_ref()
    }

    // ── Registry ──────────────────────────────────────────────────────────

    pub async fn list_printers(&self) -> Vec<PrinterDescriptor> {
        self.registry.lock().await.list()
    }

    pub async fn printer(&self, id: &PrinterId) -> Option<PrinterDescriptor> {
        self.registry.lock().await.get(id).cloned()
    }

    pub async fn add_printer(&self, descriptor: PrinterDescriptor) -> Result<PrinterId, HubError> {
        let mut registry = self.registry.lock().await;
        let id = registry.add(descriptor)?;
        if let Some(added) = registry.get(&id) {
            self.sessions.attach(added);
        }
        self.publish_registry(&registry);
        Ok(id)
    }

    /// Merges a raw discovery reply into the registry.
    pub async fn add_discovered(&self, reply: &[u8]) -> Result<PrinterId, HubError> {
        let candidate = parse_discovery_reply(reply)?;
        let mut registry = self.registry.lock().await;
        let previous = registry.get(&candidate.id).map(PrinterDescriptor::target);
        let (id, added) = registry.upsert_discovered(candidate)?;
        if let Some(descriptor) = registry.get(&id).cloned() {
            if added {
                self.sessions.attach(&descriptor);
            } else if previous != Some(descriptor.target()) {
                info!("printer {id} moved to {}", descriptor.target());
                self.sessions.restart(&descriptor).await;
            }
        }
        self.publish_registry(&registry);
        Ok(id)
    }

    /// Applies `patch`; a new address or an `enabled` change restarts the
    /// printer's session.
    pub async fn update_printer(
        &self,
        id: &PrinterId,
        patch: &DescriptorPatch,
    ) -> Result<PrinterDescriptor, HubError> {
        let mut registry = self.registry.lock().await;
        let updated = registry.update(id, patch)?;
        if patch.changes_target() || patch.enabled.is_some() {
            if updated.enabled {
                self.sessions.restart(&updated).await;
            } else {
                self.sessions.detach(id).await;
                self.dispatcher.fail_printer(id, FailureReason::PrinterUnreachable);
            }
        }
        self.publish_registry(&registry);
        Ok(updated)
    }

    /// Removes a printer.  When this returns its session worker has exited,
    /// its in-flight commands are `Failed(PrinterRemoved)` and its uploads
    /// are `TimedOut`.
    pub async fn remove_printer(&self, id: &PrinterId) -> Result<(), HubError> {
        let mut registry = self.registry.lock().await;
        registry.remove(id)?;
        self.sessions.detach(id).await;
        let failed = self.dispatcher.fail_printer(id, FailureReason::PrinterRemoved);
        let abandoned = self.uploads.abandon_printer(id);
        debug!("printer {id} removed: {failed} command(s) failed, {abandoned} upload(s) abandoned");
        self.publish_registry(&registry);
        Ok(())
    }

    pub async fn set_default(&self, id: &PrinterId) -> Result<(), HubError> {
        let mut registry = self.registry.lock().await;
        registry.set_default(id)?;
        self.publish_registry(&registry);
        Ok(())
    }

    fn publish_registry(&self, registry: &PrinterRegistry) {
        self.bus.publish(HubEvent::RegistryChanged {
            printers: registry.list(),
        });
    }

    // ── Commands and files ────────────────────────────────────────────────

    pub async fn dispatch(
        &self,
        id: &PrinterId,
        kind: CommandKind,
        args: CommandArgs,
    ) -> Result<CommandId, HubError> {
        if self.registry.lock().await.get(id).is_none() {
            return Err(HubError::UnknownPrinter(id.clone()));
        }
        Ok(self.dispatcher.dispatch(id.clone(), kind, args)?)
    }

    /// Deletes `path` from a printer.
    ///
    /// Files under the USB directory of a `Physical` printer live on the
    /// gadget image and are removed there; everything else becomes a
    /// delete command.
    pub async fn delete_file(&self, id: &PrinterId, path: &str) -> Result<DeleteOutcome, HubError> {
        let printer = self
            .printer(id)
            .await
            .ok_or_else(|| HubError::UnknownPrinter(id.clone()))?;
        let on_usb = Path::new(path).parent() == Some(Path::new(&self.usb_dir));
        if let (UsbDeviceType::Physical, Some(gadget), true) = (printer.usb_device_type, &self.gadget, on_usb) {
            let name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            gadget.ensure_mounted().await?;
            gadget.delete_file(&name).await?;
            info!("deleted {name} from the USB image of {id}");
            return Ok(DeleteOutcome::Substrate);
        }
        let command_id = self
            .dispatcher
            .dispatch(id.clone(), CommandKind::DeleteFile, CommandArgs::File(path.to_string()))?;
        Ok(DeleteOutcome::Dispatched(command_id))
    }

    pub async fn list_files(&self, id: &PrinterId, dir: &str) -> Result<Vec<FileEntry>, HubError> {
        if self.registry.lock().await.get(id).is_none() {
            return Err(HubError::UnknownPrinter(id.clone()));
        }
        self.sessions.list_files(id, dir).await.map_err(HubError::Listing)
    }

    pub async fn refresh(&self, id: &PrinterId) -> Result<(), HubError> {
        Ok(self.sessions.request_refresh(id).await?)
    }

    /// Registers an upload for `id`, choosing the destination from the
    /// printer's `usb_device_type`.
    pub async fn begin_upload(
        &self,
        upload_id: Uuid,
        id: &PrinterId,
        filename: &str,
        total_bytes: u64,
    ) -> Result<UploadTask, HubError> {
        let printer = self
            .printer(id)
            .await
            .ok_or_else(|| HubError::UnknownPrinter(id.clone()))?;
        let destination = match printer.usb_device_type {
            UsbDeviceType::Physical if self.gadget.is_some() => UploadDestination::Usb,
            _ => UploadDestination::Network,
        };
        Ok(self
            .uploads
            .begin(upload_id, id.clone(), filename, destination, total_bytes)?)
    }

    /// Events a freshly connected UI session needs: the printer list and
    /// the latest status of every printer.
    pub async fn snapshot_events(&self) -> Vec<HubEvent> {
        let printers = self.list_printers().await;
        let mut events = Vec::with_capacity(printers.len() * 2 + 1);
        events.push(HubEvent::RegistryChanged {
            printers: printers.clone(),
        });
        for printer in &printers {
            let state = self.sessions.connection_state(&printer.id);
            events.push(HubEvent::PrinterConnectivityChanged {
                printer_id: printer.id.clone(),
                state,
                online: state.is_online(),
            });
            if let Some(status) = self.sessions.board().get(&printer.id) {
                events.push(HubEvent::PrinterStatusChanged {
                    printer_id: printer.id.clone(),
                    status,
                });
            }
        }
        events
    }

    /// Detaches every session and stops the background tasks.
    pub async fn shutdown(&self) {
        info!("hub shutting down");
        self.sessions.shutdown().await;
        let workers = std::mem::take(&mut *crate::application::lock(&self.workers));
        for worker in workers {
            worker.abort();
        }
    }
}

/// Periodically times out uploads whose client stopped sending.
async fn sweep_uploads(uploads: UploadPipeline) {
    let mut ticker = tokio::time::interval(UPLOAD_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let stalled = uploads.sweep();
        if stalled > 0 {
            debug!("upload sweep timed out {stalled} upload(s)");
        }
    }
}

/// Forwards session signals to the dispatcher until every sender is gone.
async fn route_signals(mut signals: mpsc::UnboundedReceiver<SessionSignal>, dispatcher: CommandDispatcher) {
    while let Some(signal) = signals.recv().await {
        match signal {
            SessionSignal::Ack {
                printer_id,
                request_id,
                code,
            } => {
                if !dispatcher.on_ack(&printer_id, &request_id, code) {
                    debug!("ack {request_id} from {printer_id} matched no command");
                }
            }
            SessionSignal::Status { printer_id, status } => {
                dispatcher.on_status(&printer_id, &status);
            }
            SessionSignal::Connected { printer_id, epoch } => {
                let superseded = dispatcher.supersede_stale(&printer_id, epoch);
                if superseded > 0 {
                    warn!("{superseded} command(s) for {printer_id} superseded by reconnect");
                }
            }
        }
    }
    debug!("signal router stopped");
}
