//! # chitu-core
//!
//! Shared library for the ChituHub printer hub containing the canonical
//! printer domain model, the SDCP wire codec, and the State Normalizer.
//!
//! This crate has zero dependencies on sockets, file systems, or async
//! runtimes.  Everything in here can be unit-tested without a printer.
//!
//! # Architecture overview (for beginners)
//!
//! ChituHub keeps a live WebSocket session open to every registered resin
//! printer (Elegoo / Anycubic style mainboards that speak *SDCP*, the
//! "Smart Device Control Protocol"), translates each printer's status
//! reports into one canonical model, and fans those updates out to every
//! connected browser or phone.
//!
//! This crate (`chitu-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Protocol-independent business types: printer
//!   descriptors, the canonical [`PrinterStatus`], commands and their
//!   lifecycle, upload tasks, and the events published to UI sessions.
//!
//! - **`protocol`** – How SDCP frames look on the wire.  Requests are built
//!   as JSON envelopes addressed to a mainboard; inbound text frames are
//!   classified by topic into typed [`InboundFrame`]s.
//!
//! - **`normalizer`** – A pure function turning a raw SDCP `Status` object
//!   into a canonical [`PrinterStatus`], rejecting malformed payloads
//!   instead of producing half-updated state.

pub mod domain;
pub mod normalizer;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `chitu_core::PrinterStatus` instead of `chitu_core::domain::status::PrinterStatus`.
pub use domain::command::{
    Command, CommandArgs, CommandClass, CommandId, CommandKind, CommandStatus, FailureReason,
};
pub use domain::event::{EventPriority, HubEvent, ToastKind};
pub use domain::printer::{DescriptorPatch, PrinterDescriptor, PrinterId, UsbDeviceType};
pub use domain::status::{ConnectionState, MachineStatus, PrintStatus, PrinterStatus};
pub use domain::upload::{UploadDestination, UploadPhase, UploadTask};
pub use normalizer::{normalize, normalize_update, NormalizationError};
pub use protocol::codec::{decode_frame, encode_request, ProtocolError};
pub use protocol::messages::{CommandCode, FileEntry, InboundFrame};
pub use protocol::sequence::SequenceCounter;
