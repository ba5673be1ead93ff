//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Capability contract shared by configured subsystems."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::time::Instant;

use thiserror::Error;

use crate::mcu::{ConfigContribution, DeviceError};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("statistics failed: {0}")]
    Failed(String),
}

/// A configured unit of printer functionality.
///
/// Construction reads configuration only. Device-side resources are claimed
/// in [`Subsystem::build_config`], which runs exactly once after the device
/// connection is established and before commands are accepted.
pub trait Subsystem {
    fn build_config(&mut self, device: &mut ConfigContribution<'_>) -> Result<(), DeviceError>;

    /// One-line status report, e.g. `speed=0.50`.
    fn stats(&self, eventtime: Instant) -> Result<String, StatsError>;
}
