//! GadgetCoordinator: serialized access to the USB gadget file substrate.
//!
//! Printers that read files over USB see the hub as a mass-storage stick
//! backed by a FAT image.  Linux cannot safely change that image while the
//! printer has it mounted, so a file becomes visible to the printer only
//! after a full reload cycle:
//!
//! ```text
//! sync → unmount → unbind UDC → unload module → load module → bind UDC → mount
//! ```
//!
//! Every step is checked.  A failing unmount is retried lazily once before
//! the cycle aborts with [`GadgetError::SubstrateBusy`]; the whole cycle is
//! bounded by a hard ceiling.
//!
//! # Concurrency
//!
//! - Concurrent [`reload`](GadgetCoordinator::reload) calls coalesce: the
//!   first starts a cycle, later callers join it and receive the same
//!   outcome.
//! - File writes hold a shared permit on the I/O gate, a reload holds it
//!   exclusively.  `reload_in_progress` is raised only after the exclusive
//!   permit is held, so no write can start while it is true.
//! - Failed reloads are not retried here; the caller decides.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use super::lock;

// ── Kernel seam ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct KernelError(pub String);

/// The kernel operations a reload cycle needs.
///
/// Infrastructure implementation shells out to `mount`/`modprobe` and
/// writes configfs; test implementations record calls.
#[async_trait]
pub trait GadgetKernel: Send + Sync {
    async fn sync(&self) -> Result<(), KernelError>;
    async fn unmount(&self, path: &Path, lazy: bool) -> Result<(), KernelError>;
    async fn unbind_udc(&self, gadget: &str) -> Result<(), KernelError>;
    async fn unload_module(&self, name: &str) -> Result<(), KernelError>;
    async fn load_module(&self, name: &str, params: &[String]) -> Result<(), KernelError>;
    async fn bind_udc(&self, gadget: &str, controller: &str) -> Result<(), KernelError>;
    async fn mount(&self, path: &Path, image: &Path) -> Result<(), KernelError>;
    async fn is_mounted(&self, path: &Path) -> Result<bool, KernelError>;
}

// ── Configuration / state ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct GadgetConfig {
    pub mount_point: PathBuf,
    pub image_path: PathBuf,
    /// Legacy gadget module, e.g. `g_mass_storage`.  `None` skips the
    /// unload/load steps.
    pub module: Option<String>,
    pub module_params: Vec<String>,
    /// configfs gadget name under `/sys/kernel/config/usb_gadget`.  `None`
    /// skips the UDC unbind/bind steps.
    pub configfs_gadget: Option<String>,
    pub udc_controller: Option<String>,
    pub reload_ceiling: Duration,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        let image_path = PathBuf::from("/piusb.bin");
        Self {
            module: Some("g_mass_storage".to_string()),
            module_params: default_module_params(&image_path),
            mount_point: PathBuf::from("/mnt/usb_share"),
            image_path,
            configfs_gadget: None,
            udc_controller: None,
            reload_ceiling: Duration::from_secs(15),
        }
    }
}

/// `g_mass_storage` parameters presenting `image` as a removable stick.
pub fn default_module_params(image: &Path) -> Vec<String> {
    vec![
        format!("file={}", image.display()),
        "stall=0".to_string(),
        "ro=0".to_string(),
        "removable=1".to_string(),
        "idVendor=0x0951".to_string(),
        "idProduct=0x1666".to_string(),
        "iManufacturer=Kingston".to_string(),
        "iProduct=DataTraveler".to_string(),
        "iSerialNumber=74A53CDF".to_string(),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GadgetState {
    pub mounted: bool,
    pub udc_bound: bool,
    pub reload_in_progress: bool,
}

/// Shared view of [`GadgetState`].
#[derive(Debug, Clone, Default)]
pub struct GadgetStateHandle(Arc<Mutex<GadgetState>>);

impl GadgetStateHandle {
    pub fn get(&self) -> GadgetState {
        *lock(&self.0)
    }

    fn update(&self, f: impl FnOnce(&mut GadgetState)) {
        f(&mut lock(&self.0));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStep {
    Sync,
    Unmount,
    UnbindUdc,
    UnloadModule,
    LoadModule,
    BindUdc,
    Mount,
}

impl std::fmt::Display for ReloadStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReloadStep::Sync => "sync",
            ReloadStep::Unmount => "unmount",
            ReloadStep::UnbindUdc => "unbind UDC",
            ReloadStep::UnloadModule => "unload module",
            ReloadStep::LoadModule => "load module",
            ReloadStep::BindUdc => "bind UDC",
            ReloadStep::Mount => "mount",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GadgetError {
    /// The mount point could not be released, even lazily.
    #[error("USB substrate busy: {0}")]
    SubstrateBusy(String),

    #[error("reload step '{step}' failed: {reason}")]
    StepFailed { step: ReloadStep, reason: String },

    #[error("reload did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("USB substrate is not mounted")]
    NotMounted,

    #[error("invalid file name {0:?}")]
    InvalidFileName(String),

    #[error("substrate I/O error: {0}")]
    Io(String),
}

type ReloadOutcome = Option<Result<(), GadgetError>>;

// ── Coordinator ───────────────────────────────────────────────────────────────

struct Inner {
    kernel: Arc<dyn GadgetKernel>,
    config: GadgetConfig,
    state: GadgetStateHandle,
    io_gate: RwLock<()>,
    inflight: Mutex<Option<watch::Receiver<ReloadOutcome>>>,
    cycles: AtomicU64,
}

#[derive(Clone)]
pub struct GadgetCoordinator {
    inner: Arc<Inner>,
}

impl GadgetCoordinator {
    pub fn new(kernel: Arc<dyn GadgetKernel>, config: GadgetConfig) -> Self {
        Self::with_state(kernel, config, GadgetStateHandle::default())
    }

    /// Like [`new`](Self::new) but reporting into an existing state handle.
    pub fn with_state(
        kernel: Arc<dyn GadgetKernel>,
        config: GadgetConfig,
        state: GadgetStateHandle,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kernel,
                config,
                state,
                io_gate: RwLock::new(()),
                inflight: Mutex::new(None),
                cycles: AtomicU64::new(0),
            }),
        }
    }

    pub fn state(&self) -> GadgetState {
        self.inner.state.get()
    }

    pub fn config(&self) -> &GadgetConfig {
        &self.inner.config
    }

    /// Number of reload cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.inner.cycles.load(Ordering::SeqCst)
    }

    /// Runs one reload cycle, or joins the one already in flight.
    ///
    /// # Errors
    ///
    /// The outcome of the cycle: [`GadgetError::SubstrateBusy`],
    /// [`GadgetError::StepFailed`] or [`GadgetError::TimedOut`].
    pub async fn reload(&self) -> Result<(), GadgetError> {
        let mut rx = {
            let mut slot = lock(&self.inner.inflight);
            match slot.as_ref() {
                Some(rx) => {
                    debug!("joining in-flight gadget reload");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move {
                        let outcome = inner.run_cycle().await;
                        // Callers arriving from now on start a fresh cycle.
                        *lock(&inner.inflight) = None;
                        tx.send_replace(Some(outcome));
                    });
                    rx
                }
            }
        };

        let outcome = rx.wait_for(Option::is_some).await.map(|r| (*r).clone());
        match outcome {
            Ok(Some(result)) => result,
            _ => Err(GadgetError::SubstrateBusy("reload task ended unexpectedly".to_string())),
        }
    }

    /// Mounts the substrate if it is not mounted yet.
    pub async fn ensure_mounted(&self) -> Result<(), GadgetError> {
        let _gate = self.inner.io_gate.write().await;
        let mp = &self.inner.config.mount_point;
        let mounted = self
            .inner
            .kernel
            .is_mounted(mp)
            .await
            .map_err(|e| GadgetError::Io(e.0))?;
        if !mounted {
            info!("mounting USB substrate at {}", mp.display());
            self.inner
                .kernel
                .mount(mp, &self.inner.config.image_path)
                .await
                .map_err(|e| step_failed(ReloadStep::Mount, e))?;
        }
        self.inner.state.update(|s| s.mounted = true);
        Ok(())
    }

    /// Copies `source` into the substrate as `name`.  Returns bytes written.
    ///
    /// The file is not visible to the printer until the next reload.
    pub async fn write_file(&self, name: &str, source: &Path) -> Result<u64, GadgetError> {
        validate_file_name(name)?;
        let _permit = self.inner.io_gate.read().await;
        if !self.inner.state.get().mounted {
            return Err(GadgetError::NotMounted);
        }
        let dest = self.inner.config.mount_point.join(name);
        let bytes = tokio::fs::copy(source, &dest)
            .await
            .map_err(|e| GadgetError::Io(format!("copy to {}: {e}", dest.display())))?;
        let file = tokio::fs::File::open(&dest)
            .await
            .map_err(|e| GadgetError::Io(e.to_string()))?;
        file.sync_all().await.map_err(|e| GadgetError::Io(e.to_string()))?;
        info!("wrote {name} ({bytes} bytes) to USB substrate");
        Ok(bytes)
    }

    /// Removes `name` from the substrate and reloads so the printer forgets
    /// it.
    pub async fn delete_file(&self, name: &str) -> Result<(), GadgetError> {
        validate_file_name(name)?;
        {
            let _permit = self.inner.io_gate.read().await;
            if !self.inner.state.get().mounted {
                return Err(GadgetError::NotMounted);
            }
            let path = self.inner.config.mount_point.join(name);
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| GadgetError::Io(format!("remove {}: {e}", path.display())))?;
        }
        self.reload().await
    }

    /// Sorted names of the regular files on the substrate.
    pub async fn list_files(&self) -> Result<Vec<String>, GadgetError> {
        let _permit = self.inner.io_gate.read().await;
        let mut dir = tokio::fs::read_dir(&self.inner.config.mount_point)
            .await
            .map_err(|e| GadgetError::Io(e.to_string()))?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| GadgetError::Io(e.to_string()))? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl Inner {
    async fn run_cycle(&self) -> Result<(), GadgetError> {
        let n = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let ceiling = self.config.reload_ceiling;

        // The ceiling also bounds the wait for in-flight writes.
        let cycle = async {
            let _gate = self.io_gate.write().await;
            self.state.update(|s| s.reload_in_progress = true);
            info!("gadget reload cycle {n} started");
            self.steps().await
        };
        let result = match tokio::time::timeout(ceiling, cycle).await {
            Ok(r) => r,
            Err(_) => {
                // Unknown how far the sequence got; the next write remounts.
                self.state.update(|s| {
                    s.mounted = false;
                    s.udc_bound = false;
                });
                Err(GadgetError::TimedOut(ceiling))
            }
        };

        self.state.update(|s| s.reload_in_progress = false);
        match &result {
            Ok(()) => info!("gadget reload cycle {n} finished"),
            Err(e) => warn!("gadget reload cycle {n} failed: {e}"),
        }
        result
    }

    async fn steps(&self) -> Result<(), GadgetError> {
        let k = &self.kernel;
        let cfg = &self.config;
        let mp = cfg.mount_point.as_path();

        k.sync().await.map_err(|e| step_failed(ReloadStep::Sync, e))?;

        // A failed mount check counts as mounted; unmounting twice is harmless.
        if k.is_mounted(mp).await.unwrap_or(true) {
            if let Err(e) = k.unmount(mp, false).await {
                warn!("unmount of {} failed ({e}); retrying lazily", mp.display());
                k.unmount(mp, true)
                    .await
                    .map_err(|e| GadgetError::SubstrateBusy(e.0))?;
            }
        }
        self.state.update(|s| s.mounted = false);

        if let Some(gadget) = &cfg.configfs_gadget {
            k.unbind_udc(gadget)
                .await
                .map_err(|e| step_failed(ReloadStep::UnbindUdc, e))?;
        }
        if let Some(module) = &cfg.module {
            k.unload_module(module)
                .await
                .map_err(|e| step_failed(ReloadStep::UnloadModule, e))?;
        }
        self.state.update(|s| s.udc_bound = false);

        if let Some(module) = &cfg.module {
            k.load_module(module, &cfg.module_params)
                .await
                .map_err(|e| step_failed(ReloadStep::LoadModule, e))?;
        }
        if let (Some(gadget), Some(controller)) = (&cfg.configfs_gadget, &cfg.udc_controller) {
            k.bind_udc(gadget, controller)
                .await
                .map_err(|e| step_failed(ReloadStep::BindUdc, e))?;
        }
        self.state.update(|s| s.udc_bound = true);

        k.mount(mp, &cfg.image_path)
            .await
            .map_err(|e| step_failed(ReloadStep::Mount, e))?;
        self.state.update(|s| s.mounted = true);
        Ok(())
    }
}

fn step_failed(step: ReloadStep, e: KernelError) -> GadgetError {
    GadgetError::StepFailed { step, reason: e.0 }
}

/// Accepts plain file names only; no separators, no dot files.
pub fn validate_file_name(name: &str) -> Result<(), GadgetError> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.trim() != name;
    if bad {
        Err(GadgetError::InvalidFileName(name.to_string()))
    } else {
        Ok(())
    }
}
