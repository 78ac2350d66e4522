//! Events published on the hub's event bus.
//!
//! # Wire format
//!
//! Events cross the UI channel as `{"event": <name>, "data": <payload>}`
//! JSON objects.  The serde attributes on [`HubEvent`] produce exactly that
//! shape, so the gateway only needs `serde_json::to_string(&event)`:
//!
//! ```json
//! {"event":"toast","data":{"printer_id":null,"message":"Upload confirmed","type":"success"}}
//! ```
//!
//! # Priority
//!
//! Every kind is either *droppable* (a newer event of the same kind makes
//! older ones obsolete) or *must-deliver* (losing it would hide a result or
//! an error from the user).  Subscriber queues evict droppable events first
//! and never evict must-deliver ones.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::command::{CommandId, CommandKind, CommandStatus, FailureReason};
use crate::domain::printer::{PrinterDescriptor, PrinterId};
use crate::domain::status::{ConnectionState, PrinterStatus};
use crate::domain::upload::UploadPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    Droppable,
    MustDeliver,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum HubEvent {
    #[serde(rename = "printer_status")]
    PrinterStatusChanged {
        printer_id: PrinterId,
        status: PrinterStatus,
    },
    #[serde(rename = "printer_connectivity")]
    PrinterConnectivityChanged {
        printer_id: PrinterId,
        state: ConnectionState,
        online: bool,
    },
    #[serde(rename = "command_result")]
    CommandResult {
        command_id: CommandId,
        printer_id: PrinterId,
        kind: CommandKind,
        status: CommandStatus,
        reason: Option<FailureReason>,
    },
    #[serde(rename = "upload_progress")]
    UploadProgress {
        upload_id: Uuid,
        printer_id: PrinterId,
        phase: UploadPhase,
        progress: u8,
    },
    #[serde(rename = "toast")]
    Toast {
        printer_id: Option<PrinterId>,
        message: String,
        #[serde(rename = "type")]
        kind: ToastKind,
    },
    #[serde(rename = "printers")]
    RegistryChanged { printers: Vec<PrinterDescriptor> },
}

impl HubEvent {
    pub fn toast(kind: ToastKind, message: impl Into<String>) -> Self {
        HubEvent::Toast {
            printer_id: None,
            message: message.into(),
            kind,
        }
    }

    pub fn printer_toast(printer_id: PrinterId, kind: ToastKind, message: impl Into<String>) -> Self {
        HubEvent::Toast {
            printer_id: Some(printer_id),
            message: message.into(),
            kind,
        }
    }

    /// Event name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::PrinterStatusChanged { .. } => "printer_status",
            HubEvent::PrinterConnectivityChanged { .. } => "printer_connectivity",
            HubEvent::CommandResult { .. } => "command_result",
            HubEvent::UploadProgress { .. } => "upload_progress",
            HubEvent::Toast { .. } => "toast",
            HubEvent::RegistryChanged { .. } => "printers",
        }
    }

    /// The printer this event is about, if any.  Events without a printer
    /// bypass subscriber filters.
    pub fn printer_id(&self) -> Option<&PrinterId> {
        match self {
            HubEvent::PrinterStatusChanged { printer_id, .. }
            | HubEvent::PrinterConnectivityChanged { printer_id, .. }
            | HubEvent::CommandResult { printer_id, .. }
            | HubEvent::UploadProgress { printer_id, .. } => Some(printer_id),
            HubEvent::Toast { printer_id, .. } => printer_id.as_ref(),
            HubEvent::RegistryChanged { .. } => None,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            HubEvent::PrinterStatusChanged { .. } | HubEvent::UploadProgress { .. } => {
                EventPriority::Droppable
            }
            _ => EventPriority::MustDeliver,
        }
    }

    pub fn is_droppable(&self) -> bool {
        self.priority() == EventPriority::Droppable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::status::{MachineStatus, PrintStatus};

    fn status() -> PrinterStatus {
        PrinterStatus {
            machine_status: MachineStatus::Idle,
            print_status: PrintStatus::Idle,
            current_layer: 0,
            total_layer: 0,
            progress: 0,
            current_file: None,
            error_code: None,
            updated_at: 1,
        }
    }

    #[test]
    fn test_toast_wire_shape_uses_type_key() {
        let ev = HubEvent::toast(ToastKind::Warning, "check the printer");
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "toast");
        assert_eq!(v["data"]["type"], "warning");
        assert_eq!(v["data"]["message"], "check the printer");
    }

    #[test]
    fn test_status_wire_shape_carries_printer_id() {
        let ev = HubEvent::PrinterStatusChanged {
            printer_id: PrinterId::from("p1"),
            status: status(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["event"], "printer_status");
        assert_eq!(v["data"]["printer_id"], "p1");
        assert_eq!(v["data"]["status"]["machine_status"], "idle");
        assert_eq!(ev.name(), "printer_status");
    }

    #[test]
    fn test_priorities() {
        let status_ev = HubEvent::PrinterStatusChanged {
            printer_id: PrinterId::from("p1"),
            status: status(),
        };
        assert!(status_ev.is_droppable());
        assert!(!HubEvent::toast(ToastKind::Error, "x").is_droppable());
        assert!(!HubEvent::RegistryChanged { printers: vec![] }.is_droppable());
    }

    #[test]
    fn test_global_toast_has_no_printer() {
        assert!(HubEvent::toast(ToastKind::Info, "x").printer_id().is_none());
        let ev = HubEvent::printer_toast(PrinterId::from("p2"), ToastKind::Info, "x");
        assert_eq!(ev.printer_id().map(|p| p.as_str()), Some("p2"));
    }
}
