//! Infrastructure layer for the hub.
//!
//! Contains the OS-facing adapters: printer WebSocket sessions, the USB
//! gadget kernel interface, file-system storage, and the UI gateway.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `chitu_core`, but MUST NOT be imported by the `application` layer.

pub mod gadget;
pub mod network;
pub mod storage;
pub mod ui_bridge;
