//! Schema definitions for portwarden
//!
//! This crate contains the data structures shared between the supervisor
//! core and the layers that consume it (a GUI host, the daemon binary, IPC
//! bridges). All types here implement JSON Schema generation for external
//! consumption.

pub mod events;
pub mod handshake;
pub mod ledger;
pub mod service;
pub mod terminal;

pub use events::{EventSeverity, HostEvent};
pub use handshake::HandshakeMessage;
pub use ledger::PidLedger;
pub use service::{Executable, LivenessMode, ProcessRecord, ServiceConfig, ServiceStatus};
pub use terminal::{TerminalConfig, TerminalFleetStatus, TerminalInfo, TerminalStatus};
