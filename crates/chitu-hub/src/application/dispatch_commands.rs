//! CommandDispatcher: turns user intents into tracked printer commands.
//!
//! Each dispatched [`Command`] gets its own driver task that sends the
//! frame over the printer's session, waits a bounded time for an
//! acknowledgment and retries on timeout.  The dispatcher enforces the
//! supersession rule centrally: a new print-control command (start, pause,
//! resume, stop) immediately marks any older non-terminal print-control
//! command for the same printer as `Superseded`.
//!
//! # Architecture
//!
//! The dispatcher only knows the [`CommandSink`] trait.  The session manager
//! implements it in production; tests inject a recording fake and drive
//! acknowledgments by hand through [`CommandDispatcher::on_ack`] and
//! [`CommandDispatcher::on_status`].
//!
//! # Connection epochs
//!
//! Every time a session reaches `Connected` its epoch increases.  A command
//! remembers the epoch of its first send and is only ever resent on that
//! same epoch, so a command issued before a reconnect is never replayed
//! after it.  When the session reconnects the hub calls
//! [`CommandDispatcher::supersede_stale`], which ends such commands with
//! [`FailureReason::Reconnected`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chitu_core::{
    Command, CommandArgs, CommandId, CommandKind, CommandStatus, FailureReason, HubEvent,
    PrintStatus, MachineStatus, PrinterId, PrinterStatus, ToastKind,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::event_bus::EventBus;
use super::lock;

/// Terminal commands kept for [`CommandDispatcher::get`] before pruning.
const TERMINAL_HISTORY: usize = 512;

/// Acknowledgment timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// How long one send waits for an acknowledgment.
    pub ack_timeout: Duration,
    /// Total sends before the command fails with `CommandTimeout`.
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid arguments for {kind}: {reason}")]
    InvalidArguments { kind: CommandKind, reason: String },

    /// The printer has no connected session.  The command was recorded as
    /// failed under `command_id`.
    #[error("printer {printer_id} is unreachable")]
    PrinterUnreachable {
        printer_id: PrinterId,
        command_id: CommandId,
    },
}

/// Why a [`CommandSink`] could not write a command frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("printer is not connected")]
    NotConnected,

    #[error("connection epoch changed from {expected} to {actual}")]
    EpochChanged { expected: u64, actual: u64 },

    #[error("session closed")]
    Closed,
}

/// What the dispatcher hands to a session for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundCommand {
    /// Correlates the printer's ack frame with the command.  Stable across
    /// retries so a late ack for an earlier attempt still counts.
    pub request_id: String,
    pub kind: CommandKind,
    pub args: CommandArgs,
}

/// Where commands are sent.
///
/// Infrastructure implementation writes SDCP frames on the printer's
/// WebSocket; test implementations record calls.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Current epoch if the printer's session is `Connected`.
    fn connected_epoch(&self, printer_id: &PrinterId) -> Option<u64>;

    /// Writes one command frame and returns the epoch it was written on.
    ///
    /// With `expected_epoch` set the send must fail with
    /// [`SendError::EpochChanged`] instead of going out on a newer
    /// connection.
    async fn send_command(
        &self,
        printer_id: &PrinterId,
        command: &OutboundCommand,
        expected_epoch: Option<u64>,
    ) -> Result<u64, SendError>;
}

// ── Command table ─────────────────────────────────────────────────────────────

struct Entry {
    command: Command,
    request_id: String,
    status_tx: watch::Sender<CommandStatus>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<CommandId, Entry>,
    by_request: HashMap<String, CommandId>,
    terminal: VecDeque<CommandId>,
}

impl Table {
    /// Terminal transition; returns the events to publish once the lock is
    /// released.
    fn finish(
        &mut self,
        id: CommandId,
        status: CommandStatus,
        reason: Option<FailureReason>,
    ) -> Vec<HubEvent> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Vec::new();
        };
        if !entry.command.finish(status, reason) {
            return Vec::new();
        }
        entry.status_tx.send_replace(status);
        let cmd = &entry.command;
        debug!(
            "command {} ({}) on {} -> {:?}",
            cmd.id, cmd.kind, cmd.printer_id, cmd.status
        );

        let mut events = vec![HubEvent::CommandResult {
            command_id: cmd.id,
            printer_id: cmd.printer_id.clone(),
            kind: cmd.kind,
            status: cmd.status,
            reason: cmd.reason.clone(),
        }];
        if status == CommandStatus::Failed {
            let why = cmd
                .reason
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "unknown error".to_string());
            events.push(HubEvent::printer_toast(
                cmd.printer_id.clone(),
                ToastKind::Error,
                format!("{} failed: {why}", cmd.kind),
            ));
        }

        self.terminal.push_back(id);
        while self.terminal.len() > TERMINAL_HISTORY {
            if let Some(old) = self.terminal.pop_front() {
                if let Some(e) = self.entries.remove(&old) {
                    self.by_request.remove(&e.request_id);
                }
            }
        }
        events
    }

    fn open_for<'a>(&'a self, printer_id: &'a PrinterId) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries.values().filter(move |e| {
            &e.command.printer_id == printer_id && !e.command.status.is_terminal()
        })
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

struct Inner {
    sink: Arc<dyn CommandSink>,
    bus: Arc<EventBus>,
    config: DispatchConfig,
    table: Mutex<Table>,
}

/// Tracks every command from dispatch to its terminal state.
#[derive(Clone)]
pub struct CommandDispatcher {
    inner: Arc<Inner>,
}

impl CommandDispatcher {
    pub fn new(sink: Arc<dyn CommandSink>, bus: Arc<EventBus>, config: DispatchConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                bus,
                config,
                table: Mutex::new(Table::default()),
            }),
        }
    }

    /// Accepts a command for `printer_id` and starts sending it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::InvalidArguments`] if `args` does not fit `kind`;
    ///   nothing is recorded.
    /// - [`DispatchError::PrinterUnreachable`] if the printer is not
    ///   connected; the command is recorded as `Failed` and published.
    pub fn dispatch(
        &self,
        printer_id: PrinterId,
        kind: CommandKind,
        args: CommandArgs,
    ) -> Result<CommandId, DispatchError> {
        kind.validate(&args)
            .map_err(|reason| DispatchError::InvalidArguments { kind, reason })?;

        let command = Command::new(printer_id.clone(), kind, args);
        let id = command.id;
        let request_id = chitu_core::protocol::codec::new_request_id();
        let (status_tx, status_rx) = watch::channel(CommandStatus::Pending);
        let connected = self.inner.sink.connected_epoch(&printer_id).is_some();

        let mut events = Vec::new();
        {
            let mut table = lock(&self.inner.table);
            if let Some(class) = kind.class() {
                let older: Vec<CommandId> = table
                    .open_for(&printer_id)
                    .filter(|e| e.command.kind.class() == Some(class))
                    .map(|e| e.command.id)
                    .collect();
                for old in older {
                    events.extend(table.finish(
                        old,
                        CommandStatus::Superseded,
                        Some(FailureReason::NewerCommand),
                    ));
                }
            }
            table.by_request.insert(request_id.clone(), id);
            table.entries.insert(
                id,
                Entry {
                    command,
                    request_id,
                    status_tx,
                },
            );
            if !connected {
                // The caller is told directly; no broadcast toast.
                events.extend(
                    table
                        .finish(id, CommandStatus::Failed, Some(FailureReason::PrinterUnreachable))
                        .into_iter()
                        .filter(|e| !matches!(e, HubEvent::Toast { .. })),
                );
            }
        }
        self.publish_all(events);

        if !connected {
            info!("{kind} for {printer_id} rejected: printer unreachable");
            return Err(DispatchError::PrinterUnreachable {
                printer_id,
                command_id: id,
            });
        }

        info!("dispatching {kind} to {printer_id} as {id}");
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.drive(id, status_rx).await });
        Ok(id)
    }

    /// Handles an explicit ack frame.  `code == 0` acknowledges, anything
    /// else fails the command with `PrinterRejected(code)`.
    ///
    /// Returns `false` if no open command matches.
    pub fn on_ack(&self, printer_id: &PrinterId, request_id: &str, code: i64) -> bool {
        let events = {
            let mut table = lock(&self.inner.table);
            let Some(&id) = table.by_request.get(request_id) else {
                debug!("ack for unknown request {request_id} from {printer_id}");
                return false;
            };
            match table.entries.get(&id) {
                Some(e) if &e.command.printer_id == printer_id => {}
                _ => return false,
            }
            if code == chitu_core::protocol::ACK_OK {
                table.finish(id, CommandStatus::Acked, None)
            } else {
                warn!("{printer_id} rejected request {request_id} with ack {code}");
                table.finish(
                    id,
                    CommandStatus::Failed,
                    Some(FailureReason::PrinterRejected(code)),
                )
            }
        };
        let matched = !events.is_empty();
        self.publish_all(events);
        matched
    }

    /// Acknowledges sent print-control commands that `status` confirms.
    ///
    /// Returns the number of commands acknowledged.
    pub fn on_status(&self, printer_id: &PrinterId, status: &PrinterStatus) -> usize {
        let events = {
            let mut table = lock(&self.inner.table);
            let confirmed: Vec<CommandId> = table
                .open_for(printer_id)
                .filter(|e| e.command.status == CommandStatus::Sent)
                .filter(|e| status_confirms(e.command.kind, status))
                .map(|e| e.command.id)
                .collect();
            let mut events = Vec::new();
            for id in confirmed {
                events.extend(table.finish(id, CommandStatus::Acked, None));
            }
            events
        };
        let count = events
            .iter()
            .filter(|e| matches!(e, HubEvent::CommandResult { .. }))
            .count();
        self.publish_all(events);
        count
    }

    /// Ends commands for `printer_id` that were sent on an epoch older than
    /// `epoch` with `Superseded(Reconnected)`.
    pub fn supersede_stale(&self, printer_id: &PrinterId, epoch: u64) -> usize {
        self.finish_matching(printer_id, CommandStatus::Superseded, FailureReason::Reconnected, |c| {
            c.epoch.is_some_and(|e| e < epoch)
        })
    }

    /// Fails every open command for `printer_id`, e.g. with
    /// [`FailureReason::PrinterRemoved`].
    pub fn fail_printer(&self, printer_id: &PrinterId, reason: FailureReason) -> usize {
        self.finish_matching(printer_id, CommandStatus::Failed, reason, |_| true)
    }

    pub fn get(&self, id: CommandId) -> Option<Command> {
        lock(&self.inner.table)
            .entries
            .get(&id)
            .map(|e| e.command.clone())
    }

    /// Open commands for `printer_id`.
    pub fn outstanding(&self, printer_id: &PrinterId) -> Vec<Command> {
        lock(&self.inner.table)
            .open_for(printer_id)
            .map(|e| e.command.clone())
            .collect()
    }

    fn finish_matching(
        &self,
        printer_id: &PrinterId,
        status: CommandStatus,
        reason: FailureReason,
        pred: impl Fn(&Command) -> bool,
    ) -> usize {
        let events = {
            let mut table = lock(&self.inner.table);
            let ids: Vec<CommandId> = table
                .open_for(printer_id)
                .filter(|e| pred(&e.command))
                .map(|e| e.command.id)
                .collect();
            let mut events = Vec::new();
            for id in &ids {
                events.extend(table.finish(*id, status, Some(reason.clone())));
            }
            events
        };
        let count = events
            .iter()
            .filter(|e| matches!(e, HubEvent::CommandResult { .. }))
            .count();
        self.publish_all(events);
        count
    }

    fn publish_all(&self, events: Vec<HubEvent>) {
        for event in events {
            self.inner.bus.publish(event);
        }
    }
}

impl Inner {
    /// Send / wait / retry loop for one command.
    async fn drive(self: Arc<Self>, id: CommandId, mut done: watch::Receiver<CommandStatus>) {
        loop {
            let (printer_id, outbound, expected_epoch) = {
                let table = lock(&self.table);
                let Some(entry) = table.entries.get(&id) else {
                    return;
                };
                if entry.command.status.is_terminal() {
                    return;
                }
                (
                    entry.command.printer_id.clone(),
                    OutboundCommand {
                        request_id: entry.request_id.clone(),
                        kind: entry.command.kind,
                        args: entry.command.args.clone(),
                    },
                    entry.command.epoch,
                )
            };

            match self.sink.send_command(&printer_id, &outbound, expected_epoch).await {
                Ok(epoch) => {
                    let mut table = lock(&self.table);
                    match table.entries.get_mut(&id) {
                        // Acked or superseded while the frame was in flight.
                        Some(e) => {
                            if !e.command.record_send(epoch) {
                                return;
                            }
                            e.status_tx.send_replace(CommandStatus::Sent);
                        }
                        None => return,
                    }
                }
                Err(SendError::EpochChanged { .. }) => {
                    self.finish(id, CommandStatus::Superseded, FailureReason::Reconnected);
                    return;
                }
                Err(e) => {
                    debug!("send of {id} to {printer_id} failed: {e}");
                    self.finish(id, CommandStatus::Failed, FailureReason::PrinterUnreachable);
                    return;
                }
            }

            let settled = tokio::time::timeout(self.config.ack_timeout, async {
                done.wait_for(|s| s.is_terminal()).await.map(|_| ())
            })
            .await;
            if settled.is_ok() {
                return;
            }

            let attempts = lock(&self.table)
                .entries
                .get(&id)
                .map(|e| e.command.attempts)
                .unwrap_or(u32::MAX);
            if attempts >= self.config.max_attempts {
                warn!("{id} to {printer_id}: no ack after {attempts} attempt(s)");
                self.finish(id, CommandStatus::Failed, FailureReason::CommandTimeout);
                return;
            }
            debug!("{id} to {printer_id}: ack timeout, resending (attempt {})", attempts + 1);
        }
    }

    fn finish(&self, id: CommandId, status: CommandStatus, reason: FailureReason) {
        let events = lock(&self.table).finish(id, status, Some(reason));
        for event in events {
            self.bus.publish(event);
        }
    }
}

/// Whether `status` shows the effect of a print-control `kind`.
///
/// Maintenance kinds are only acknowledged by explicit ack frames.
pub fn status_confirms(kind: CommandKind, status: &PrinterStatus) -> bool {
    let print = status.print_status;
    match kind {
        CommandKind::Start => {
            matches!(
                print,
                PrintStatus::Homing | PrintStatus::Dropping | PrintStatus::Exposing | PrintStatus::Lifting
            ) || matches!(
                status.machine_status,
                MachineStatus::Printing | MachineStatus::Homing
            )
        }
        CommandKind::Pause => print == PrintStatus::Paused,
        CommandKind::Resume => print.is_active() && print != PrintStatus::Paused,
        CommandKind::Stop => matches!(
            print,
            PrintStatus::Stopped | PrintStatus::Idle | PrintStatus::Complete
        ),
        CommandKind::DeleteFile | CommandKind::ClearHistory | CommandKind::WipeStorage => false,
    }
}
