//! Linux implementation of [`GadgetKernel`].
//!
//! Runs the stock userland tools (`sync`, `umount`, `modprobe`, `mount`)
//! and writes the configfs `UDC` attribute directly.  Requires root.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::application::reload_substrate::{GadgetKernel, KernelError};

/// Options for the explicit loop mount used when fstab has no entry.
const LOOP_MOUNT_OPTIONS: &str = "loop,rw,umask=000,uid=1000,gid=1000";

pub struct SystemGadgetKernel {
    configfs_root: PathBuf,
    proc_mounts: PathBuf,
}

impl Default for SystemGadgetKernel {
    fn default() -> Self {
        Self {
            configfs_root: PathBuf::from("/sys/kernel/config/usb_gadget"),
            proc_mounts: PathBuf::from("/proc/mounts"),
        }
    }
}

impl SystemGadgetKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn udc_file(&self, gadget: &str) -> PathBuf {
        self.configfs_root.join(gadget).join("UDC")
    }

    async fn write_udc(&self, gadget: &str, value: &str) -> Result<(), KernelError> {
        let path = self.udc_file(gadget);
        debug!("writing {value:?} to {}", path.display());
        tokio::fs::write(&path, format!("{value}\n"))
            .await
            .map_err(|e| KernelError(format!("{}: {e}", path.display())))
    }
}

/// Runs `program args...` and maps a non-zero exit to its stderr.
async fn run(program: &str, args: &[&str]) -> Result<(), KernelError> {
    debug!("running {program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| KernelError(format!("{program}: {e}")))?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(KernelError(format!(
            "{program} exited with {}: {}",
            output.status,
            stderr.trim()
        )))
    }
}

fn path_arg(path: &Path) -> Result<&str, KernelError> {
    path.to_str()
        .ok_or_else(|| KernelError(format!("non UTF-8 path {}", path.display())))
}

/// Whether `/proc/mounts` content lists `mount_point`.
///
/// The kernel escapes spaces in mount points as `\040`.
pub fn mounts_contain(proc_mounts: &str, mount_point: &Path) -> bool {
    let wanted = mount_point.to_string_lossy();
    let wanted = wanted.trim_end_matches('/');
    proc_mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|field| field.replace("\\040", " ") == wanted)
}

#[async_trait]
impl GadgetKernel for SystemGadgetKernel {
    async fn sync(&self) -> Result<(), KernelError> {
        run("sync", &[]).await
    }

    async fn unmount(&self, path: &Path, lazy: bool) -> Result<(), KernelError> {
        let p = path_arg(path)?;
        if lazy {
            run("umount", &["-l", p]).await
        } else {
            run("umount", &[p]).await
        }
    }

    async fn unbind_udc(&self, gadget: &str) -> Result<(), KernelError> {
        self.write_udc(gadget, "").await
    }

    async fn unload_module(&self, name: &str) -> Result<(), KernelError> {
        run("modprobe", &["-r", name]).await
    }

    async fn load_module(&self, name: &str, params: &[String]) -> Result<(), KernelError> {
        let mut args = vec![name];
        args.extend(params.iter().map(String::as_str));
        run("modprobe", &args).await
    }

    async fn bind_udc(&self, gadget: &str, controller: &str) -> Result<(), KernelError> {
        self.write_udc(gadget, controller).await
    }

    async fn mount(&self, path: &Path, image: &Path) -> Result<(), KernelError> {
        let p = path_arg(path)?;
        // Prefer the fstab entry so operators can tune options there.
        if run("mount", &[p]).await.is_ok() {
            return Ok(());
        }
        let img = path_arg(image)?;
        run("mount", &["-t", "vfat", "-o", LOOP_MOUNT_OPTIONS, img, p]).await
    }

    async fn is_mounted(&self, path: &Path) -> Result<bool, KernelError> {
        let content = tokio::fs::read_to_string(&self.proc_mounts)
            .await
            .map_err(|e| KernelError(format!("{}: {e}", self.proc_mounts.display())))?;
        Ok(mounts_contain(&content, path))
    }
}
