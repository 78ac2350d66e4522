//! Printer registry: the durable set of [`PrinterDescriptor`]s.
//!
//! Every mutation is written through the [`RegistryStore`] before it returns,
//! so a manually added printer survives a crash one second later.  If the
//! write fails, the in-memory change is rolled back and the caller gets
//! [`RegistryError::Persist`]; memory and disk never disagree.
//!
//! Exactly one printer is the default whenever the registry is non-empty:
//! the first printer added becomes default, and removing the default
//! promotes the first remaining printer.

use std::net::SocketAddr;
use std::path::PathBuf;

use chitu_core::{DescriptorPatch, PrinterDescriptor, PrinterId};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised by a [`RegistryStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error accessing registry at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The stored registry could not be parsed.
    #[error("registry store is corrupt: {0}")]
    Corrupt(String),

    #[error("failed to serialize registry: {0}")]
    Serialize(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Another printer already uses this `ip:port`.
    #[error("printer {existing} already uses {target}")]
    DuplicateTarget {
        target: SocketAddr,
        existing: PrinterId,
    },

    #[error("printer id {0} is already registered")]
    DuplicateId(PrinterId),

    #[error("printer {0} not found")]
    NotFound(PrinterId),

    #[error("invalid printer descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("failed to persist registry: {0}")]
    Persist(#[from] StoreError),
}

/// Durable backing store for the registry.
pub trait RegistryStore: Send + Sync {
    /// Loads all descriptors.  A missing store is an empty registry, not an
    /// error.
    fn load(&self) -> Result<Vec<PrinterDescriptor>, StoreError>;

    /// Replaces the stored registry with `printers`.
    fn save(&self, printers: &[PrinterDescriptor]) -> Result<(), StoreError>;
}

/// Non-durable store, used by tests.
#[derive(Default)]
pub struct MemoryRegistryStore {
    printers: std::sync::Mutex<Vec<PrinterDescriptor>>,
}

impl MemoryRegistryStore {
    pub fn with_printers(printers: Vec<PrinterDescriptor>) -> Self {
        Self {
            printers: std::sync::Mutex::new(printers),
        }
    }

    pub fn snapshot(&self) -> Vec<PrinterDescriptor> {
        super::lock(&self.printers).clone()
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn load(&self) -> Result<Vec<PrinterDescriptor>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, printers: &[PrinterDescriptor]) -> Result<(), StoreError> {
        *super::lock(&self.printers) = printers.to_vec();
        Ok(())
    }
}

/// In-memory registry with write-through persistence.
pub struct PrinterRegistry {
    printers: Vec<PrinterDescriptor>,
    store: Box<dyn RegistryStore>,
}

impl PrinterRegistry {
    /// Loads the registry from `store`.
    ///
    /// A corrupt or unreadable store does not fail startup: the registry
    /// starts empty and the returned warning should be shown to the user.
    pub fn open(store: Box<dyn RegistryStore>) -> (Self, Option<String>) {
        match store.load() {
            Ok(printers) => {
                let mut registry = Self { printers, store };
                registry.repair_default();
                info!("printer registry loaded with {} printer(s)", registry.printers.len());
                (registry, None)
            }
            Err(e) => {
                let warning = format!("printer registry could not be loaded ({e}); starting empty");
                warn!("{warning}");
                (
                    Self {
                        printers: Vec::new(),
                        store,
                    },
                    Some(warning),
                )
            }
        }
    }

    /// Adds a printer and returns its id.
    ///
    /// An empty id is derived from the printer's `ip:port`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateTarget`] if another printer has the same
    /// `ip:port`, [`RegistryError::DuplicateId`] if the id is taken.
    pub fn add(&mut self, mut descriptor: PrinterDescriptor) -> Result<PrinterId, RegistryError> {
        if descriptor.port == 0 {
            return Err(RegistryError::InvalidDescriptor("port must not be 0".to_string()));
        }
        if descriptor.id.is_empty() {
            descriptor.id = PrinterId::derive_from_target(descriptor.ip, descriptor.port);
        }
        if descriptor.name.trim().is_empty() {
            descriptor.name = descriptor.ip.to_string();
        }
        self.check_target_free(descriptor.target(), None)?;
        if self.position(&descriptor.id).is_some() {
            return Err(RegistryError::DuplicateId(descriptor.id));
        }

        let id = descriptor.id.clone();
        self.mutate(|printers| {
            let first = printers.is_empty();
            descriptor.is_default = first || descriptor.is_default;
            if descriptor.is_default {
                for p in printers.iter_mut() {
                    p.is_default = false;
                }
            }
            printers.push(descriptor);
        })?;
        info!("printer {id} added");
        Ok(id)
    }

    /// Applies `patch` and returns the updated descriptor.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`] or [`RegistryError::DuplicateTarget`].
    pub fn update(
        &mut self,
        id: &PrinterId,
        patch: &DescriptorPatch,
    ) -> Result<PrinterDescriptor, RegistryError> {
        let idx = self
            .position(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let mut updated = self.printers[idx].clone();
        updated.apply(patch);
        if updated.port == 0 {
            return Err(RegistryError::InvalidDescriptor("port must not be 0".to_string()));
        }
        self.check_target_free(updated.target(), Some(id))?;

        let result = updated.clone();
        self.mutate(|printers| printers[idx] = updated)?;
        Ok(result)
    }

    /// Removes a printer and returns its last descriptor.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn remove(&mut self, id: &PrinterId) -> Result<PrinterDescriptor, RegistryError> {
        let idx = self
            .position(id)
            .ok_or_else(|| RegistryError::NotFound(id.clone()))?;
        let removed = self.printers[idx].clone();
        self.mutate(|printers| {
            printers.remove(idx);
            if removed.is_default {
                if let Some(first) = printers.first_mut() {
                    first.is_default = true;
                }
            }
        })?;
        info!("printer {id} removed");
        Ok(removed)
    }

    /// Makes `id` the only default printer.
    ///
    /// # Errors
    ///
    /// [`RegistryError::NotFound`].
    pub fn set_default(&mut self, id: &PrinterId) -> Result<(), RegistryError> {
        if self.position(id).is_none() {
            return Err(RegistryError::NotFound(id.clone()));
        }
        self.mutate(|printers| {
            for p in printers.iter_mut() {
                p.is_default = &p.id == id;
            }
        })
    }

    /// Merges a discovery candidate: a known id gets its address and
    /// firmware details refreshed, an unknown one is added.
    ///
    /// Returns the id and whether the printer was newly added.
    ///
    /// # Errors
    ///
    /// Same as [`add`](Self::add) / [`update`](Self::update).
    pub fn upsert_discovered(
        &mut self,
        candidate: PrinterDescriptor,
    ) -> Result<(PrinterId, bool), RegistryError> {
        let Some(idx) = self.position(&candidate.id) else {
            return self.add(candidate).map(|id| (id, true));
        };
        self.check_target_free(candidate.target(), Some(&candidate.id))?;
        let id = candidate.id.clone();
        self.mutate(|printers| {
            let known = &mut printers[idx];
            known.ip = candidate.ip;
            known.port = candidate.port;
            known.protocol_version = candidate.protocol_version;
            known.connection_id = candidate.connection_id.or(known.connection_id.take());
            known.firmware_version = candidate.firmware_version.or(known.firmware_version.take());
            known.model = candidate.model.or(known.model.take());
            known.brand = candidate.brand.or(known.brand.take());
        })?;
        Ok((id, false))
    }

    pub fn list(&self) -> Vec<PrinterDescriptor> {
        self.printers.clone()
    }

    pub fn get(&self, id: &PrinterId) -> Option<&PrinterDescriptor> {
        self.printers.iter().find(|p| &p.id == id)
    }

    pub fn default_printer(&self) -> Option<&PrinterDescriptor> {
        self.printers.iter().find(|p| p.is_default)
    }

    pub fn len(&self) -> usize {
        self.printers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.printers.is_empty()
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn position(&self, id: &PrinterId) -> Option<usize> {
        self.printers.iter().position(|p| &p.id == id)
    }

    fn check_target_free(
        &self,
        target: SocketAddr,
        except: Option<&PrinterId>,
    ) -> Result<(), RegistryError> {
        match self
            .printers
            .iter()
            .find(|p| p.target() == target && Some(&p.id) != except)
        {
            Some(existing) => Err(RegistryError::DuplicateTarget {
                target,
                existing: existing.id.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Applies `change` to a copy, persists it, then swaps it in.
    fn mutate(&mut self, change: impl FnOnce(&mut Vec<PrinterDescriptor>)) -> Result<(), RegistryError> {
        let mut next = self.printers.clone();
        change(&mut next);
        self.store.save(&next)?;
        self.printers = next;
        Ok(())
    }

    /// Restores the single-default rule on data loaded from disk.
    fn repair_default(&mut self) {
        let mut seen = false;
        for p in self.printers.iter_mut() {
            if p.is_default && !seen {
                seen = true;
            } else {
                p.is_default = false;
            }
        }
        if !seen {
            if let Some(first) = self.printers.first_mut() {
                first.is_default = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn printer(id: &str, ip: &str) -> PrinterDescriptor {
        PrinterDescriptor::new(id, format!("printer {id}"), ip.parse().unwrap())
    }

    /// Store that shares its contents with the test and can be told to fail.
    #[derive(Default, Clone)]
    struct SharedStore {
        inner: Arc<MemoryRegistryStore>,
        fail: Arc<std::sync::atomic::AtomicBool>,
    }

    impl RegistryStore for SharedStore {
        fn load(&self) -> Result<Vec<PrinterDescriptor>, StoreError> {
            self.inner.load()
        }
        fn save(&self, printers: &[PrinterDescriptor]) -> Result<(), StoreError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Serialize("disk full".to_string()));
            }
            self.inner.save(printers)
        }
    }

    struct CorruptStore;

    impl RegistryStore for CorruptStore {
        fn load(&self) -> Result<Vec<PrinterDescriptor>, StoreError> {
            Err(StoreError::Corrupt("expected table".to_string()))
        }
        fn save(&self, _: &[PrinterDescriptor]) -> Result<(), StoreError> {
            Ok(())
        }
    }

    fn registry() -> (PrinterRegistry, SharedStore) {
        let store = SharedStore::default();
        let (reg, warning) = PrinterRegistry::open(Box::new(store.clone()));
        assert!(warning.is_none());
        (reg, store)
    }

    #[test]
    fn test_add_persists_and_first_printer_is_default() {
        // Arrange
        let (mut reg, store) = registry();

        // Act
        let id = reg.add(printer("p1", "10.0.0.1")).unwrap();
        reg.add(printer("p2", "10.0.0.2")).unwrap();

        // Assert
        assert_eq!(id.as_str(), "p1");
        assert_eq!(reg.default_printer().map(|p| p.id.as_str()), Some("p1"));
        assert_eq!(store.inner.snapshot().len(), 2);
    }

    #[test]
    fn test_add_rejects_duplicate_target() {
        let (mut reg, _) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();

        let err = reg.add(printer("p2", "10.0.0.1")).unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateTarget { existing, .. } if existing.as_str() == "p1"));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_same_ip_different_port_is_allowed() {
        let (mut reg, _) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();
        let mut other = printer("p2", "10.0.0.1");
        other.port = 3031;
        assert!(reg.add(other).is_ok());
    }

    #[test]
    fn test_add_derives_id_when_empty() {
        let (mut reg, _) = registry();
        let id = reg.add(printer("", "10.0.0.5")).unwrap();
        assert_eq!(id, PrinterId::derive_from_target("10.0.0.5".parse().unwrap(), 3030));
    }

    #[test]
    fn test_update_unknown_is_not_found() {
        let (mut reg, _) = registry();
        let err = reg
            .update(&PrinterId::from("nope"), &DescriptorPatch::default())
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn test_update_to_taken_target_is_rejected() {
        let (mut reg, _) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();
        reg.add(printer("p2", "10.0.0.2")).unwrap();
        let patch = DescriptorPatch {
            ip: Some("10.0.0.1".parse().unwrap()),
            ..Default::default()
        };

        let err = reg.update(&PrinterId::from("p2"), &patch).unwrap_err();

        assert!(matches!(err, RegistryError::DuplicateTarget { .. }));
        assert_eq!(reg.get(&PrinterId::from("p2")).unwrap().ip.to_string(), "10.0.0.2");
    }

    #[test]
    fn test_rename_keeps_target() {
        let (mut reg, _) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();
        let patch = DescriptorPatch {
            name: Some("Lab".to_string()),
            ..Default::default()
        };
        let updated = reg.update(&PrinterId::from("p1"), &patch).unwrap();
        assert_eq!(updated.name, "Lab");
    }

    #[test]
    fn test_remove_default_promotes_next() {
        let (mut reg, store) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();
        reg.add(printer("p2", "10.0.0.2")).unwrap();

        reg.remove(&PrinterId::from("p1")).unwrap();

        assert_eq!(reg.default_printer().map(|p| p.id.as_str()), Some("p2"));
        assert_eq!(store.inner.snapshot().len(), 1);
        assert!(matches!(
            reg.remove(&PrinterId::from("p1")),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_default_is_exclusive() {
        let (mut reg, _) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();
        reg.add(printer("p2", "10.0.0.2")).unwrap();

        reg.set_default(&PrinterId::from("p2")).unwrap();

        let defaults: Vec<_> = reg.list().into_iter().filter(|p| p.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id.as_str(), "p2");
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        // Arrange
        let (mut reg, store) = registry();
        reg.add(printer("p1", "10.0.0.1")).unwrap();
        store.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        // Act
        let err = reg.add(printer("p2", "10.0.0.2")).unwrap_err();

        // Assert
        assert!(matches!(err, RegistryError::Persist(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_corrupt_store_starts_empty_with_warning() {
        let (reg, warning) = PrinterRegistry::open(Box::new(CorruptStore));
        assert!(reg.is_empty());
        assert!(warning.unwrap().contains("corrupt"));
    }

    #[test]
    fn test_open_repairs_multiple_defaults() {
        let mut a = printer("p1", "10.0.0.1");
        let mut b = printer("p2", "10.0.0.2");
        a.is_default = true;
        b.is_default = true;
        let store = MemoryRegistryStore::with_printers(vec![a, b]);

        let (reg, _) = PrinterRegistry::open(Box::new(store));

        assert_eq!(reg.list().iter().filter(|p| p.is_default).count(), 1);
    }

    #[test]
    fn test_upsert_discovered_updates_known_address() {
        let (mut reg, _) = registry();
        reg.add(printer("mb1", "10.0.0.1")).unwrap();
        let mut candidate = printer("mb1", "10.0.0.99");
        candidate.firmware_version = Some("V1.2".to_string());

        let (id, added) = reg.upsert_discovered(candidate).unwrap();

        assert!(!added);
        let known = reg.get(&id).unwrap();
        assert_eq!(known.ip.to_string(), "10.0.0.99");
        assert_eq!(known.name, "printer mb1");
        assert_eq!(known.firmware_version.as_deref(), Some("V1.2"));
    }

    #[test]
    fn test_upsert_discovered_adds_unknown() {
        let (mut reg, _) = registry();
        let (_, added) = reg.upsert_discovered(printer("mb2", "10.0.0.3")).unwrap();
        assert!(added);
        assert_eq!(reg.len(), 1);
    }
}
