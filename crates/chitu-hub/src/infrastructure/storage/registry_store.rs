//! `printers.toml`: the durable printer registry.
//!
//! ```toml
//! [[printers]]
//! id = "a1b2c3"
//! name = "Mars 4"
//! ip = "192.168.1.40"
//! port = 3030
//! is_default = true
//! ```
//!
//! Writes go to `printers.toml.tmp` first and are renamed over the real
//! file, so a crash mid-write leaves the previous registry intact.

use std::io::Write;
use std::path::{Path, PathBuf};

use chitu_core::PrinterDescriptor;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::application::manage_printers::{RegistryStore, StoreError};

pub const REGISTRY_FILE_NAME: &str = "printers.toml";

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    printers: Vec<PrinterDescriptor>,
}

pub struct TomlRegistryStore {
    path: PathBuf,
}

impl TomlRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<data_dir>/printers.toml`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(REGISTRY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl RegistryStore for TomlRegistryStore {
    fn load(&self) -> Result<Vec<PrinterDescriptor>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => {
                let file: RegistryFile =
                    toml::from_str(&content).map_err(|e| StoreError::Corrupt(e.to_string()))?;
                Ok(file.printers)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Self::io_error(&self.path, e)),
        }
    }

    fn save(&self, printers: &[PrinterDescriptor]) -> Result<(), StoreError> {
        let file = RegistryFile {
            printers: printers.to_vec(),
        };
        let content =
            toml::to_string_pretty(&file).map_err(|e| StoreError::Serialize(e.to_string()))?;

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Self::io_error(dir, e))?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        {
            let mut f = std::fs::File::create(&tmp).map_err(|e| Self::io_error(&tmp, e))?;
            f.write_all(content.as_bytes())
                .map_err(|e| Self::io_error(&tmp, e))?;
            f.sync_all().map_err(|e| Self::io_error(&tmp, e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| Self::io_error(&self.path, e))?;
        debug!("saved {} printer(s) to {}", printers.len(), self.path.display());
        Ok(())
    }
}
