//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Core orchestration library for printhost."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
//! Host-side supervisor: subsystem registry, device connection, command
//! channel and the orchestrator that drives them on a single reactor.

pub mod gcode;
pub mod mcu;
pub mod printer;
pub mod pty;
pub mod registry;
pub mod subsystem;
pub mod subsystems;
pub mod transport;

pub use gcode::{ChannelError, ChannelState, CommandChannel};
pub use mcu::{ConfigContribution, ConnectionState, DeviceConnection, DeviceError};
pub use printer::{CommandInput, Orchestrator, Printer, PrinterError, RunReport, StatsSnapshot};
pub use registry::{SubsystemKind, SubsystemRegistry, SUBSYSTEM_TABLE};
pub use subsystem::{StatsError, Subsystem};
pub use transport::{CaptureTransport, DeviceTransport, ProtocolDictionary, SerialTransport};
