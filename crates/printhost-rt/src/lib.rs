//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Runtime helpers supporting the orchestrator."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
//! Single-threaded event loop for the printhost runtime.
//!
//! The [`Reactor`] owns every timer, input source and signal listener of the
//! process and dispatches their callbacks one at a time on the calling thread.

pub mod metrics;
pub mod reactor;

pub use metrics::DispatchStats;
pub use reactor::{
    Deadline, FdHandle, ReadyCallback, Reactor, ReactorError, SignalHandle, SignalKind,
    TimerCallback, TimerHandle,
};
