//! UploadPipeline: one upload followed from the browser to the printer.
//!
//! An upload crosses two hops.  Phase 1 receives the file from the client
//! into a staging file.  Phase 2 depends on the destination:
//!
//! ```text
//! Usb:     ReceivingFromClient → WritingToSubstrate → AwaitingDeviceVisibility → Confirmed
//! Network: ReceivingFromClient → Confirmed
//!                         (any non-terminal phase) → TimedOut
//! ```
//!
//! For USB uploads the file is copied into the gadget image and the gadget
//! is reloaded, but the printer re-enumerates on its own schedule.  The
//! pipeline therefore polls the printer's own file listing a fixed number
//! of times.  Running out of attempts ends in `TimedOut` with a warning
//! rather than an error: the file is on the stick, only the printer's
//! acknowledgment is missing.
//!
//! Progress events are emitted when the whole-percent value or the phase
//! changes, never on a timer, so a given byte sequence always produces the
//! same events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chitu_core::{
    FileEntry, HubEvent, PrinterId, ToastKind, UploadDestination, UploadPhase, UploadTask,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::event_bus::EventBus;
use super::lock;
use super::reload_substrate::{validate_file_name, GadgetCoordinator, GadgetError};

// ── Seams ─────────────────────────────────────────────────────────────────────

/// The file substrate a USB upload is written to.
#[async_trait]
pub trait Substrate: Send + Sync {
    async fn write_file(&self, name: &str, source: &Path) -> Result<u64, GadgetError>;
    async fn reload(&self) -> Result<(), GadgetError>;
}

#[async_trait]
impl Substrate for GadgetCoordinator {
    async fn write_file(&self, name: &str, source: &Path) -> Result<u64, GadgetError> {
        self.ensure_mounted().await?;
        GadgetCoordinator::write_file(self, name, source).await
    }

    async fn reload(&self) -> Result<(), GadgetError> {
        GadgetCoordinator::reload(self).await
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("printer is not connected")]
    Unreachable,
    #[error("printer did not answer the file listing in time")]
    Timeout,
    #[error("printer rejected the file listing (ack {0})")]
    Rejected(i64),
}

/// Reads a printer's own file listing.
///
/// Infrastructure implementation is the session manager; tests script the
/// answers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileLister: Send + Sync {
    async fn list_files(&self, printer_id: &PrinterId, dir: &str)
        -> Result<Vec<FileEntry>, ListingError>;
}

// ── Configuration / errors ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct UploadConfig {
    /// Delay before each visibility poll; its length is the attempt count.
    pub visibility_schedule: Vec<Duration>,
    /// How long terminal tasks stay queryable.
    pub retention: Duration,
    /// Phase-1 uploads without progress for this long are timed out.
    pub idle_timeout: Duration,
    pub staging_dir: PathBuf,
    /// Lowercase extensions without the dot.
    pub allowed_extensions: Vec<String>,
    /// Printer-side directory the USB stick appears under.
    pub usb_listing_dir: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            visibility_schedule: [2, 3, 5, 7, 10].map(Duration::from_secs).to_vec(),
            retention: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            staging_dir: std::env::temp_dir().join("chitu-hub-staging"),
            allowed_extensions: vec!["ctb".into(), "goo".into(), "prz".into()],
            usb_listing_dir: "/usb".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("invalid file name {0:?}")]
    InvalidFileName(String),

    #[error("upload {0} already exists")]
    DuplicateUpload(Uuid),

    #[error("upload {0} not found")]
    NotFound(Uuid),

    #[error("upload {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: Uuid,
        from: UploadPhase,
        to: UploadPhase,
    },

    #[error("byte count for {id} went backwards ({previous} -> {next})")]
    BytesRegressed { id: Uuid, previous: u64, next: u64 },

    #[error("upload {id} received {received} of {total} bytes")]
    SizeMismatch { id: Uuid, received: u64, total: u64 },

    #[error("USB destination requested but the USB gadget is disabled")]
    NoSubstrate,

    #[error("staging I/O error: {0}")]
    Staging(#[from] std::io::Error),

    #[error(transparent)]
    Substrate(#[from] GadgetError),
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

struct Tracked {
    task: UploadTask,
    staging: PathBuf,
    finished_at: Option<Instant>,
    last_progress_at: Instant,
    cancel: watch::Sender<bool>,
}

struct Inner {
    bus: Arc<EventBus>,
    lister: Arc<dyn FileLister>,
    substrate: Option<Arc<dyn Substrate>>,
    config: UploadConfig,
    tasks: Mutex<HashMap<Uuid, Tracked>>,
}

#[derive(Clone)]
pub struct UploadPipeline {
    inner: Arc<Inner>,
}

impl UploadPipeline {
    pub fn new(
        bus: Arc<EventBus>,
        lister: Arc<dyn FileLister>,
        substrate: Option<Arc<dyn Substrate>>,
        config: UploadConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                lister,
                substrate,
                config,
                tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a new upload in `ReceivingFromClient` and emits 0 %.
    pub fn begin(
        &self,
        upload_id: Uuid,
        printer_id: PrinterId,
        filename: &str,
        destination: UploadDestination,
        total_bytes: u64,
    ) -> Result<UploadTask, UploadError> {
        validate_file_name(filename).map_err(|_| UploadError::InvalidFileName(filename.to_string()))?;
        let ext = Path::new(filename)
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        if !self.inner.config.allowed_extensions.iter().any(|a| a == &ext) {
            return Err(UploadError::UnsupportedFileType(filename.to_string()));
        }
        if destination == UploadDestination::Usb && self.inner.substrate.is_none() {
            return Err(UploadError::NoSubstrate);
        }

        let task = UploadTask::new(upload_id, printer_id, filename, destination, total_bytes);
        self.sweep();
        {
            let mut tasks = lock(&self.inner.tasks);
            if tasks.contains_key(&upload_id) {
                return Err(UploadError::DuplicateUpload(upload_id));
            }
            let (cancel, _) = watch::channel(false);
            tasks.insert(
                upload_id,
                Tracked {
                    task: task.clone(),
                    staging: self.inner.config.staging_dir.join(format!("{upload_id}.part")),
                    finished_at: None,
                    last_progress_at: Instant::now(),
                    cancel,
                },
            );
        }
        info!(
            "upload {upload_id}: {filename} ({total_bytes} bytes) to {} via {destination:?}",
            task.printer_id
        );
        self.inner.bus.publish(progress_event(&task));
        Ok(task)
    }

    /// Moves an upload to `phase` with `bytes` transferred.
    ///
    /// # Errors
    ///
    /// - [`UploadError::InvalidTransition`] if the phase would regress or the
    ///   task is terminal.
    /// - [`UploadError::BytesRegressed`] / [`UploadError::SizeMismatch`] if
    ///   `bytes` goes backwards or past the total.
    pub fn advance(
        &self,
        upload_id: Uuid,
        phase: UploadPhase,
        bytes: u64,
    ) -> Result<UploadTask, UploadError> {
        self.inner.advance(upload_id, phase, bytes)
    }

    /// Appends one received chunk to the staging file and advances phase 1.
    pub async fn receive_chunk(&self, upload_id: Uuid, chunk: &[u8]) -> Result<UploadTask, UploadError> {
        let (staging, received) = {
            let tasks = lock(&self.inner.tasks);
            let t = tasks.get(&upload_id).ok_or(UploadError::NotFound(upload_id))?;
            if t.task.phase != UploadPhase::ReceivingFromClient {
                return Err(UploadError::InvalidTransition {
                    id: upload_id,
                    from: t.task.phase,
                    to: UploadPhase::ReceivingFromClient,
                });
            }
            let next = t.task.bytes_transferred + chunk.len() as u64;
            if next > t.task.total_bytes {
                return Err(UploadError::SizeMismatch {
                    id: upload_id,
                    received: next,
                    total: t.task.total_bytes,
                });
            }
            (t.staging.clone(), next)
        };

        if let Some(dir) = staging.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&staging)
            .await?;
        file.write_all(chunk).await?;
        file.flush().await?;

        match self.inner.advance(upload_id, UploadPhase::ReceivingFromClient, received) {
            // Timed out while this chunk was being written.
            Err(e @ UploadError::InvalidTransition { .. }) => {
                remove_staging(&staging).await;
                Err(e)
            }
            other => other,
        }
    }

    /// Finishes phase 1 and drives phase 2 to a terminal phase.
    ///
    /// Returns the terminal phase.  `TimedOut` after exhausted visibility
    /// polling is an `Ok` outcome.
    ///
    /// # Errors
    ///
    /// [`UploadError::SizeMismatch`] if not every byte arrived, and
    /// [`UploadError::Substrate`] if writing or reloading the USB substrate
    /// failed (the task is then `TimedOut`).
    pub async fn complete(&self, upload_id: Uuid) -> Result<UploadPhase, UploadError> {
        let (task, staging, mut cancel) = {
            let tasks = lock(&self.inner.tasks);
            let t = tasks.get(&upload_id).ok_or(UploadError::NotFound(upload_id))?;
            if t.task.phase != UploadPhase::ReceivingFromClient {
                return Err(UploadError::InvalidTransition {
                    id: upload_id,
                    from: t.task.phase,
                    to: UploadPhase::WritingToSubstrate,
                });
            }
            if !t.task.is_received() {
                return Err(UploadError::SizeMismatch {
                    id: upload_id,
                    received: t.task.bytes_transferred,
                    total: t.task.total_bytes,
                });
            }
            (t.task.clone(), t.staging.clone(), t.cancel.subscribe())
        };
        let inner = &self.inner;
        let total = task.total_bytes;

        let substrate = match (task.destination, &inner.substrate) {
            (UploadDestination::Network, _) => {
                inner.advance(upload_id, UploadPhase::Confirmed, total)?;
                inner.publish_toast(&task, ToastKind::Success, format!("{} uploaded", task.filename));
                remove_staging(&staging).await;
                return Ok(UploadPhase::Confirmed);
            }
            (UploadDestination::Usb, Some(s)) => Arc::clone(s),
            (UploadDestination::Usb, None) => {
                inner.time_out(upload_id);
                return Err(UploadError::NoSubstrate);
            }
        };

        if !inner.step(upload_id, UploadPhase::WritingToSubstrate, total)? {
            return Ok(UploadPhase::TimedOut);
        }
        let written = match substrate.write_file(&task.filename, &staging).await {
            Ok(_) => substrate.reload().await,
            Err(e) => Err(e),
        };
        remove_staging(&staging).await;
        if let Err(e) = written {
            warn!("upload {upload_id}: substrate step failed: {e}");
            inner.time_out(upload_id);
            inner.publish_toast(
                &task,
                ToastKind::Error,
                format!("Could not write {} to USB: {e}", task.filename),
            );
            return Err(e.into());
        }
        if !inner.step(upload_id, UploadPhase::AwaitingDeviceVisibility, total)? {
            return Ok(UploadPhase::TimedOut);
        }

        for (attempt, delay) in inner.config.visibility_schedule.iter().enumerate() {
            tokio::select! {
                _ = tokio::time::sleep(*delay) => {}
                _ = async { cancel.wait_for(|c| *c).await.map(|_| ()) } => {
                    debug!("upload {upload_id}: visibility polling cancelled");
                    return Ok(UploadPhase::TimedOut);
                }
            }
            match inner
                .lister
                .list_files(&task.printer_id, &inner.config.usb_listing_dir)
                .await
            {
                Ok(entries) if entries.iter().any(|e| !e.is_dir && e.file_name() == task.filename) => {
                    info!("upload {upload_id}: {} visible after {} poll(s)", task.filename, attempt + 1);
                    if inner.step(upload_id, UploadPhase::Confirmed, total)? {
                        inner.publish_toast(
                            &task,
                            ToastKind::Success,
                            format!("{} is ready on the printer", task.filename),
                        );
                        return Ok(UploadPhase::Confirmed);
                    }
                    return Ok(UploadPhase::TimedOut);
                }
                Ok(_) => debug!("upload {upload_id}: poll {} did not list the file", attempt + 1),
                Err(e) => debug!("upload {upload_id}: poll {} failed: {e}", attempt + 1),
            }
        }

        warn!("upload {upload_id}: printer never listed {}", task.filename);
        inner.time_out(upload_id);
        inner.publish_toast(
            &task,
            ToastKind::Warning,
            format!(
                "{} was written to USB but the printer has not listed it yet; refresh its file list manually",
                task.filename
            ),
        );
        Ok(UploadPhase::TimedOut)
    }

    /// Ends every in-flight upload to `printer_id` with `TimedOut`.
    pub fn abandon_printer(&self, printer_id: &PrinterId) -> usize {
        let ids: Vec<Uuid> = lock(&self.inner.tasks)
            .values()
            .filter(|t| &t.task.printer_id == printer_id && !t.task.phase.is_terminal())
            .map(|t| t.task.upload_id)
            .collect();
        for id in &ids {
            self.inner.time_out(*id);
        }
        if !ids.is_empty() {
            info!("abandoned {} upload(s) to removed printer {printer_id}", ids.len());
        }
        ids.len()
    }

    /// Current state of an upload, including terminal ones within the
    /// retention window.
    pub fn get(&self, upload_id: Uuid) -> Option<UploadTask> {
        self.sweep();
        lock(&self.inner.tasks).get(&upload_id).map(|t| t.task.clone())
    }

    /// Times out phase-1 uploads idle for longer than `idle_timeout` and
    /// forgets terminal tasks past the retention window.
    ///
    /// Returns the number of uploads timed out.
    pub fn sweep(&self) -> usize {
        let idle = self.inner.config.idle_timeout;
        let stalled: Vec<Uuid> = {
            let mut tasks = lock(&self.inner.tasks);
            self.inner.prune(&mut tasks);
            tasks
                .values()
                .filter(|t| t.task.phase == UploadPhase::ReceivingFromClient)
                .filter(|t| t.last_progress_at.elapsed() >= idle)
                .map(|t| t.task.upload_id)
                .collect()
        };
        for id in &stalled {
            warn!("upload {id}: no data for {idle:?}; timing out");
            self.inner.time_out(*id);
        }
        stalled.len()
    }

    /// Where phase-1 bytes of `upload_id` are staged.
    pub fn staging_path(&self, upload_id: Uuid) -> Option<PathBuf> {
        lock(&self.inner.tasks).get(&upload_id).map(|t| t.staging.clone())
    }
}

impl Inner {
    fn advance(&self, id: Uuid, phase: UploadPhase, bytes: u64) -> Result<UploadTask, UploadError> {
        let (task, changed) = {
            let mut tasks = lock(&self.tasks);
            let t = tasks.get_mut(&id).ok_or(UploadError::NotFound(id))?;
            let current = &t.task;
            if !current.phase.permits(phase) {
                return Err(UploadError::InvalidTransition {
                    id,
                    from: current.phase,
                    to: phase,
                });
            }
            if bytes < current.bytes_transferred {
                return Err(UploadError::BytesRegressed {
                    id,
                    previous: current.bytes_transferred,
                    next: bytes,
                });
            }
            if bytes > current.total_bytes {
                return Err(UploadError::SizeMismatch {
                    id,
                    received: bytes,
                    total: current.total_bytes,
                });
            }
            let before = (current.phase, current.percent());
            t.task.phase = phase;
            t.task.bytes_transferred = bytes;
            t.last_progress_at = Instant::now();
            if phase.is_terminal() {
                t.finished_at = Some(Instant::now());
                t.cancel.send_replace(true);
            }
            (t.task.clone(), before != (phase, t.task.percent()))
        };
        if changed {
            self.bus.publish(progress_event(&task));
        }
        Ok(task)
    }

    /// Forward step of phase 2.  Returns `false` if the task was ended
    /// elsewhere (printer removed) in the meantime.
    fn step(&self, id: Uuid, phase: UploadPhase, bytes: u64) -> Result<bool, UploadError> {
        match self.advance(id, phase, bytes) {
            Ok(_) => Ok(true),
            Err(UploadError::InvalidTransition { from, .. }) if from.is_terminal() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ends `id` with `TimedOut`.  A task still receiving loses its
    /// staging file.
    fn time_out(&self, id: Uuid) {
        let (bytes, staging) = match lock(&self.tasks).get(&id) {
            Some(t) => (
                t.task.bytes_transferred,
                (t.task.phase == UploadPhase::ReceivingFromClient).then(|| t.staging.clone()),
            ),
            None => (0, None),
        };
        if let Err(e) = self.advance(id, UploadPhase::TimedOut, bytes) {
            debug!("upload {id} not timed out: {e}");
            return;
        }
        if let Some(path) = staging {
            discard_staging(&path);
        }
    }

    fn publish_toast(&self, task: &UploadTask, kind: ToastKind, message: String) {
        self.bus
            .publish(HubEvent::printer_toast(task.printer_id.clone(), kind, message));
    }

    fn prune(&self, tasks: &mut HashMap<Uuid, Tracked>) {
        let retention = self.config.retention;
        tasks.retain(|_, t| t.finished_at.map_or(true, |at| at.elapsed() < retention));
    }
}

fn progress_event(task: &UploadTask) -> HubEvent {
    let progress = match task.phase {
        UploadPhase::ReceivingFromClient | UploadPhase::TimedOut => task.percent(),
        _ => 100,
    };
    HubEvent::UploadProgress {
        upload_id: task.upload_id,
        printer_id: task.printer_id.clone(),
        phase: task.phase,
        progress,
    }
}

/// Blocking variant of [`remove_staging`] for synchronous callers.
fn discard_staging(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove staging file {}: {e}", path.display());
        }
    }
}

async fn remove_staging(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove staging file {}: {e}", path.display());
        }
    }
}
