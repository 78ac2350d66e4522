//! Canonical printer status and session connectivity.

use serde::{Deserialize, Serialize};

/// What the printer as a whole is doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineStatus {
    #[default]
    Idle,
    Homing,
    Printing,
    FileTransferring,
    Testing,
    /// A code this hub does not know about; the raw value is kept for display.
    Unknown(i64),
}

/// Where the current print job is in its layer cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrintStatus {
    #[default]
    Idle,
    Homing,
    Dropping,
    Exposing,
    Lifting,
    Paused,
    Stopped,
    Complete,
    Unknown(i64),
}

impl PrintStatus {
    /// Returns `true` while a job is physically running (not paused or finished).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PrintStatus::Homing | PrintStatus::Dropping | PrintStatus::Exposing | PrintStatus::Lifting
        )
    }
}

/// Protocol-independent snapshot of one printer.
///
/// Replaced wholesale on every accepted update; `updated_at` is the hub's
/// per-printer arrival sequence and strictly increases between accepted
/// snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrinterStatus {
    pub machine_status: MachineStatus,
    pub print_status: PrintStatus,
    pub current_layer: u32,
    pub total_layer: u32,
    /// Job progress in percent, `0..=100`.
    pub progress: u8,
    pub current_file: Option<String>,
    pub error_code: Option<i64>,
    pub updated_at: u64,
}

impl PrinterStatus {
    /// Structural equality ignoring `updated_at`.
    ///
    /// Two snapshots that only differ in their sequence describe the same
    /// printer state and must not be fanned out twice.
    pub fn same_state(&self, other: &PrinterStatus) -> bool {
        let PrinterStatus {
            machine_status,
            print_status,
            current_layer,
            total_layer,
            progress,
            current_file,
            error_code,
            updated_at: _,
        } = self;
        *machine_status == other.machine_status
            && *print_status == other.print_status
            && *current_layer == other.current_layer
            && *total_layer == other.total_layer
            && *progress == other.progress
            && *current_file == other.current_file
            && *error_code == other.error_code
    }
}

/// Lifecycle of a printer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

impl ConnectionState {
    /// Legal transitions:
    ///
    /// ```text
    /// Disconnected ──► Connecting ──► Connected ──► Degraded ──► Connecting
    /// any state    ──► Disconnected   (removal / shutdown)
    /// ```
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connected, Degraded)
                | (Degraded, Connecting)
                | (_, Disconnected)
        )
    }

    pub fn is_online(self) -> bool {
        self == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(layer: u32, seq: u64) -> PrinterStatus {
        PrinterStatus {
            machine_status: MachineStatus::Printing,
            print_status: PrintStatus::Exposing,
            current_layer: layer,
            total_layer: 100,
            progress: layer as u8,
            current_file: Some("a.ctb".to_string()),
            error_code: None,
            updated_at: seq,
        }
    }

    #[test]
    fn test_same_state_ignores_sequence() {
        assert!(status(10, 1).same_state(&status(10, 2)));
    }

    #[test]
    fn test_same_state_detects_any_field_change() {
        assert!(!status(10, 1).same_state(&status(11, 2)));
        let mut paused = status(10, 2);
        paused.print_status = PrintStatus::Paused;
        assert!(!status(10, 1).same_state(&paused));
    }

    #[test]
    fn test_connection_state_allows_documented_cycle() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Connecting));
    }

    #[test]
    fn test_connection_state_rejects_shortcuts() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Degraded.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Degraded));
    }

    #[test]
    fn test_any_state_can_be_disconnected() {
        use ConnectionState::*;
        for s in [Disconnected, Connecting, Connected, Degraded] {
            assert!(s.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn test_print_status_active_set() {
        assert!(PrintStatus::Exposing.is_active());
        assert!(!PrintStatus::Paused.is_active());
        assert!(!PrintStatus::Unknown(42).is_active());
    }
}
