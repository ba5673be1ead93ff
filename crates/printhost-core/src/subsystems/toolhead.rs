//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Motion planner settings from the root section."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fmt;
use std::time::Instant;

use printhost_common::config::{ConfigError, ConfigSection, FloatBounds};
use printhost_common::time::seconds_since;

use crate::mcu::{ConfigContribution, DeviceError};
use crate::subsystem::{StatsError, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kinematics {
    Cartesian,
    CoreXy,
    Delta,
}

impl fmt::Display for Kinematics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kinematics::Cartesian => "cartesian",
            Kinematics::CoreXy => "corexy",
            Kinematics::Delta => "delta",
        })
    }
}

/// Always present; configured from `[printer]`.
#[derive(Debug, Clone)]
pub struct ToolHead {
    kinematics: Kinematics,
    max_velocity: f64,
    max_accel: f64,
    max_z_velocity: f64,
    max_z_accel: f64,
    created: Instant,
}

impl ToolHead {
    pub fn from_config(section: &ConfigSection) -> Result<Self, ConfigError> {
        let positive = FloatBounds::new().above(0.0);
        let max_velocity = section.get_float_bounded("max_velocity", None, positive)?;
        let max_accel = section.get_float_bounded("max_accel", None, positive)?;
        Ok(Self {
            kinematics: section.get_choice(
                "kinematics",
                &[
                    ("cartesian", Kinematics::Cartesian),
                    ("corexy", Kinematics::CoreXy),
                    ("delta", Kinematics::Delta),
                ],
                Some("cartesian"),
            )?,
            max_velocity,
            max_accel,
            max_z_velocity: section.get_float_bounded(
                "max_z_velocity",
                Some(max_velocity),
                positive.max(max_velocity),
            )?,
            max_z_accel: section.get_float_bounded(
                "max_z_accel",
                Some(max_accel),
                positive.max(max_accel),
            )?,
            created: Instant::now(),
        })
    }

    pub fn kinematics(&self) -> Kinematics {
        self.kinematics
    }

    pub fn limits(&self) -> (f64, f64, f64, f64) {
        (
            self.max_velocity,
            self.max_accel,
            self.max_z_velocity,
            self.max_z_accel,
        )
    }
}

pub fn construct(section: &ConfigSection) -> Result<Box<dyn Subsystem>, ConfigError> {
    Ok(Box::new(ToolHead::from_config(section)?))
}

impl Subsystem for ToolHead {
    // Motion is planned on the host; no device objects are needed up front.
    fn build_config(&mut self, _device: &mut ConfigContribution<'_>) -> Result<(), DeviceError> {
        Ok(())
    }

    fn stats(&self, eventtime: Instant) -> Result<String, StatsError> {
        Ok(format!(
            "print_time={:.3} kinematics={}",
            seconds_since(self.created, eventtime),
            self.kinematics
        ))
    }
}
