//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Filament extruder: a stepper plus its hotend heater."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::time::Instant;

use printhost_common::config::{ConfigError, ConfigSection, FloatBounds};

use super::heater::Heater;
use crate::mcu::{ConfigContribution, DeviceError};
use crate::subsystem::{StatsError, Subsystem};

#[derive(Debug, Clone)]
pub struct Extruder {
    step_pin: String,
    dir_pin: String,
    enable_pin: Option<String>,
    step_distance: f64,
    nozzle_diameter: f64,
    filament_diameter: f64,
    heater: Heater,
    stepper_oid: Option<u32>,
}

impl Extruder {
    pub fn from_config(section: &ConfigSection) -> Result<Self, ConfigError> {
        let nozzle_diameter =
            section.get_float_bounded("nozzle_diameter", Some(0.4), FloatBounds::new().above(0.0))?;
        Ok(Self {
            step_pin: section.get("step_pin", None)?,
            dir_pin: section.get("dir_pin", None)?,
            enable_pin: section.get_opt("enable_pin"),
            step_distance: section.get_float_bounded(
                "step_distance",
                None,
                FloatBounds::new().above(0.0),
            )?,
            nozzle_diameter,
            filament_diameter: section.get_float_bounded(
                "filament_diameter",
                Some(1.75),
                FloatBounds::new().min(nozzle_diameter),
            )?,
            heater: Heater::from_config(section)?,
            stepper_oid: None,
        })
    }

    pub fn heater(&self) -> &Heater {
        &self.heater
    }

    pub fn step_distance(&self) -> f64 {
        self.step_distance
    }

    pub fn stepper_oid(&self) -> Option<u32> {
        self.stepper_oid
    }

    /// Cross-section ratio used to convert filament length into extruded volume.
    pub fn filament_area(&self) -> f64 {
        std::f64::consts::PI * (self.filament_diameter / 2.0).powi(2)
    }
}

pub fn construct(section: &ConfigSection) -> Result<Box<dyn Subsystem>, ConfigError> {
    Ok(Box::new(Extruder::from_config(section)?))
}

impl Subsystem for Extruder {
    fn build_config(&mut self, device: &mut ConfigContribution<'_>) -> Result<(), DeviceError> {
        let oid = device.create_oid();
        device.add_config_cmd(format!(
            "config_stepper oid={} step_pin={} dir_pin={} min_stop_interval=0 invert_step=0",
            oid, self.step_pin, self.dir_pin
        ));
        if let Some(pin) = &self.enable_pin {
            let enable_oid = device.create_oid();
            device.add_config_cmd(format!(
                "config_digital_out oid={} pin={} value=0 default_value=0 max_duration=0",
                enable_oid, pin
            ));
        }
        self.stepper_oid = Some(oid);
        self.heater.build_config(device)
    }

    fn stats(&self, eventtime: Instant) -> Result<String, StatsError> {
        let heater = self.heater.stats(eventtime)?;
        Ok(format!("{} nozzle={:.2}", heater, self.nozzle_diameter))
    }
}
