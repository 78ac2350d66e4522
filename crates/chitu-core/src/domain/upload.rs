//! Upload tasks correlating one file transfer across its phases.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::printer::PrinterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadDestination {
    /// Written to the USB gadget image the printer reads from.
    Usb,
    /// Sent to the printer over the network.
    Network,
}

/// Upload phases in the only order they may occur.
///
/// The derived `Ord` follows declaration order, which [`UploadPhase::permits`]
/// relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadPhase {
    ReceivingFromClient,
    WritingToSubstrate,
    AwaitingDeviceVisibility,
    Confirmed,
    TimedOut,
}

impl UploadPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadPhase::Confirmed | UploadPhase::TimedOut)
    }

    /// Returns `true` if a task in `self` may move to `next`.
    ///
    /// Staying in the same phase is allowed (progress within a phase).
    /// `TimedOut` is reachable from every non-terminal phase; nothing leaves
    /// a terminal phase.
    pub fn permits(self, next: UploadPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == UploadPhase::TimedOut || next >= self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub upload_id: Uuid,
    pub printer_id: PrinterId,
    pub filename: String,
    pub destination: UploadDestination,
    pub phase: UploadPhase,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

impl UploadTask {
    pub fn new(
        upload_id: Uuid,
        printer_id: PrinterId,
        filename: impl Into<String>,
        destination: UploadDestination,
        total_bytes: u64,
    ) -> Self {
        Self {
            upload_id,
            printer_id,
            filename: filename.into(),
            destination,
            phase: UploadPhase::ReceivingFromClient,
            bytes_transferred: 0,
            total_bytes,
        }
    }

    /// Phase-1 progress in whole percent.  An empty file counts as complete.
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return 100;
        }
        let pct = self.bytes_transferred.min(self.total_bytes) * 100 / self.total_bytes;
        pct as u8
    }

    pub fn is_received(&self) -> bool {
        self.bytes_transferred >= self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_only_move_forward() {
        use UploadPhase::*;
        assert!(ReceivingFromClient.permits(WritingToSubstrate));
        assert!(WritingToSubstrate.permits(AwaitingDeviceVisibility));
        assert!(AwaitingDeviceVisibility.permits(Confirmed));
        assert!(!AwaitingDeviceVisibility.permits(WritingToSubstrate));
        assert!(!WritingToSubstrate.permits(ReceivingFromClient));
    }

    #[test]
    fn test_network_upload_may_skip_to_confirmed() {
        assert!(UploadPhase::ReceivingFromClient.permits(UploadPhase::Confirmed));
    }

    #[test]
    fn test_timed_out_reachable_from_any_live_phase() {
        use UploadPhase::*;
        for p in [ReceivingFromClient, WritingToSubstrate, AwaitingDeviceVisibility] {
            assert!(p.permits(TimedOut));
        }
    }

    #[test]
    fn test_terminal_phases_are_final() {
        use UploadPhase::*;
        assert!(!Confirmed.permits(TimedOut));
        assert!(!TimedOut.permits(Confirmed));
        assert!(!Confirmed.permits(Confirmed));
    }

    #[test]
    fn test_percent_rounds_down_and_clamps() {
        let mut t = UploadTask::new(
            Uuid::new_v4(),
            PrinterId::from("p1"),
            "model.goo",
            UploadDestination::Usb,
            1_000_000,
        );
        t.bytes_transferred = 999_999;
        assert_eq!(t.percent(), 99);
        t.bytes_transferred = 2_000_000;
        assert_eq!(t.percent(), 100);
    }
}
