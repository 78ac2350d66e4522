//! Application layer use cases for the hub.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure types from `chitu_core`) and the infrastructure (sockets, kernel
//! calls, files).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a user goal (e.g., "pause the
//!   print on printer P1 and tell every open browser tab whether it worked").
//! - **Depend on abstractions** (traits such as [`dispatch_commands::CommandSink`]
//!   or [`reload_substrate::GadgetKernel`]) rather than concrete
//!   implementations, so tests can drive them with recording fakes.
//! - **Contain no socket I/O and no kernel calls**.  The upload pipeline and
//!   gadget coordinator touch staging files, but only through paths handed
//!   to them by configuration.
//!
//! # Sub-modules
//!
//! - **`manage_printers`**   – The durable printer registry.
//! - **`event_bus`**         – Per-subscriber bounded fan-out of hub events.
//! - **`dispatch_commands`** – Command supersession, ack tracking and retries.
//! - **`reload_substrate`**  – The serialized USB gadget reload cycle.
//! - **`track_uploads`**     – Upload phases, progress and visibility polling.
//! - **`backoff`**           – Capped exponential reconnect delays with jitter.

pub mod backoff;
pub mod dispatch_commands;
pub mod event_bus;
pub mod manage_printers;
pub mod reload_substrate;
pub mod track_uploads;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent before
/// any call that could panic, so the poisoned value is still valid.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
