//! Domain entities for ChituHub.
//!
//! This module contains pure business types with no infrastructure
//! dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The innermost layer of the hub describes *what* a printer, a command or
//! an upload is, and which state changes are legal, without saying anything
//! about sockets, files or timers.  Outer layers (application,
//! infrastructure) depend on these types; these types never depend on them.
//!
//! Every lifecycle rule that must hold no matter which component drives it
//! lives here as a method:
//!
//! - [`status::ConnectionState::can_transition_to`] – the session state machine.
//! - [`command::Command::transition`] – terminal command states are final.
//! - [`upload::UploadPhase::permits`] – upload phases only move forward.

pub mod command;
pub mod event;
pub mod printer;
pub mod status;
pub mod upload;
