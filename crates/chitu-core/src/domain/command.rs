//! User commands and their lifecycle.
//!
//! # Command lifecycle
//!
//! ```text
//! Pending ──► Sent ──► Acked
//!    │          │ ▲
//!    │          └─┘ (retry after ack timeout)
//!    └──────────┴──► Failed | Superseded
//! ```
//!
//! `Acked`, `Failed` and `Superseded` are terminal: once a command reaches
//! one of them, [`Command::transition`] refuses every further change.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::printer::PrinterId;

/// Generated identifier of a dispatched command.
pub type CommandId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Pause,
    Resume,
    Stop,
    DeleteFile,
    ClearHistory,
    WipeStorage,
}

/// Group of mutually exclusive command kinds.
///
/// Only one non-terminal command per `(printer, class)` may exist; a newer
/// command of the class supersedes the older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    PrintControl,
}

impl CommandKind {
    /// Returns the exclusive class of this kind, or `None` for kinds that
    /// may be outstanding concurrently (file and storage maintenance).
    pub fn class(self) -> Option<CommandClass> {
        match self {
            CommandKind::Start | CommandKind::Pause | CommandKind::Resume | CommandKind::Stop => {
                Some(CommandClass::PrintControl)
            }
            CommandKind::DeleteFile | CommandKind::ClearHistory | CommandKind::WipeStorage => None,
        }
    }

    /// Checks that `args` carries what this kind needs.
    pub fn validate(self, args: &CommandArgs) -> Result<(), String> {
        match (self, args) {
            (CommandKind::Start, CommandArgs::File(f)) | (CommandKind::DeleteFile, CommandArgs::File(f))
                if !f.trim().is_empty() =>
            {
                Ok(())
            }
            (CommandKind::Start, _) => Err("start requires a file name".to_string()),
            (CommandKind::DeleteFile, _) => Err("delete requires a file path".to_string()),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::Start => "start",
            CommandKind::Pause => "pause",
            CommandKind::Resume => "resume",
            CommandKind::Stop => "stop",
            CommandKind::DeleteFile => "delete_file",
            CommandKind::ClearHistory => "clear_history",
            CommandKind::WipeStorage => "wipe_storage",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandArgs {
    #[default]
    None,
    /// File name for `Start`, file path for `DeleteFile`.
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acked,
    Failed,
    Superseded,
}

impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandStatus::Acked | CommandStatus::Failed | CommandStatus::Superseded
        )
    }
}

/// Why a command ended `Failed` or `Superseded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    PrinterUnreachable,
    CommandTimeout,
    PrinterRemoved,
    /// The printer answered with a non-zero ack code.
    PrinterRejected(i64),
    /// A newer command of the same class was dispatched.
    NewerCommand,
    /// The connection it was sent on dropped and was re-established.
    Reconnected,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::PrinterUnreachable => f.write_str("printer unreachable"),
            FailureReason::CommandTimeout => f.write_str("no acknowledgment from printer"),
            FailureReason::PrinterRemoved => f.write_str("printer removed"),
            FailureReason::PrinterRejected(code) => write!(f, "printer rejected command (ack {code})"),
            FailureReason::NewerCommand => f.write_str("superseded by a newer command"),
            FailureReason::Reconnected => f.write_str("superseded by reconnect"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    pub printer_id: PrinterId,
    pub kind: CommandKind,
    pub args: CommandArgs,
    pub status: CommandStatus,
    /// Number of times the command frame was written to the session.
    pub attempts: u32,
    /// Unix time in milliseconds.
    pub created_at: u64,
    /// Connection epoch of the first send; `None` until sent.
    pub epoch: Option<u64>,
    pub reason: Option<FailureReason>,
}

impl Command {
    pub fn new(printer_id: PrinterId, kind: CommandKind, args: CommandArgs) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id: Uuid::new_v4(),
            printer_id,
            kind,
            args,
            status: CommandStatus::Pending,
            attempts: 0,
            created_at,
            epoch: None,
            reason: None,
        }
    }

    /// Moves the command to `next`.
    ///
    /// Returns `false` (and changes nothing) if the command is already
    /// terminal or `next` would move it backwards to `Pending`.
    pub fn transition(&mut self, next: CommandStatus) -> bool {
        if self.status.is_terminal() || next == CommandStatus::Pending {
            return false;
        }
        self.status = next;
        true
    }

    /// Terminal transition carrying a reason.
    pub fn finish(&mut self, next: CommandStatus, reason: Option<FailureReason>) -> bool {
        if !next.is_terminal() || !self.transition(next) {
            return false;
        }
        self.reason = reason;
        true
    }

    /// Records one more send on connection `epoch`.
    pub fn record_send(&mut self, epoch: u64) -> bool {
        if !self.transition(CommandStatus::Sent) {
            return false;
        }
        self.attempts += 1;
        self.epoch.get_or_insert(epoch);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(kind: CommandKind) -> Command {
        Command::new(PrinterId::from("p1"), kind, CommandArgs::None)
    }

    #[test]
    fn test_print_control_kinds_share_a_class() {
        for k in [CommandKind::Start, CommandKind::Pause, CommandKind::Resume, CommandKind::Stop] {
            assert_eq!(k.class(), Some(CommandClass::PrintControl));
        }
        assert_eq!(CommandKind::DeleteFile.class(), None);
        assert_eq!(CommandKind::WipeStorage.class(), None);
    }

    #[test]
    fn test_start_requires_file() {
        assert!(CommandKind::Start.validate(&CommandArgs::None).is_err());
        assert!(CommandKind::Start
            .validate(&CommandArgs::File("  ".to_string()))
            .is_err());
        assert!(CommandKind::Start
            .validate(&CommandArgs::File("a.ctb".to_string()))
            .is_ok());
        assert!(CommandKind::Pause.validate(&CommandArgs::None).is_ok());
    }

    #[test]
    fn test_record_send_counts_attempts_and_keeps_first_epoch() {
        let mut c = cmd(CommandKind::Pause);
        assert!(c.record_send(3));
        assert!(c.record_send(4));
        assert_eq!(c.attempts, 2);
        assert_eq!(c.epoch, Some(3));
        assert_eq!(c.status, CommandStatus::Sent);
    }

    #[test]
    fn test_terminal_command_is_never_mutated() {
        // Arrange
        let mut c = cmd(CommandKind::Stop);
        c.record_send(1);
        assert!(c.finish(CommandStatus::Acked, None));

        // Act / Assert
        assert!(!c.finish(CommandStatus::Failed, Some(FailureReason::CommandTimeout)));
        assert!(!c.record_send(1));
        assert_eq!(c.status, CommandStatus::Acked);
        assert_eq!(c.attempts, 1);
        assert!(c.reason.is_none());
    }

    #[test]
    fn test_finish_rejects_non_terminal_target() {
        let mut c = cmd(CommandKind::Stop);
        assert!(!c.finish(CommandStatus::Sent, None));
        assert_eq!(c.status, CommandStatus::Pending);
    }
}
