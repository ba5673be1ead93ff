//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Part-cooling fan driven by a PWM output."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::time::Instant;

use printhost_common::config::{ConfigError, ConfigSection, FloatBounds};

use crate::mcu::{ConfigContribution, DeviceError};
use crate::subsystem::{StatsError, Subsystem};

#[derive(Debug, Clone)]
pub struct Fan {
    pin: String,
    max_power: f64,
    kick_start_time: f64,
    cycle_time: f64,
    speed: f64,
    oid: Option<u32>,
}

impl Fan {
    pub fn from_config(section: &ConfigSection) -> Result<Self, ConfigError> {
        Ok(Self {
            pin: section.get("pin", None)?,
            max_power: section.get_float_bounded(
                "max_power",
                Some(1.0),
                FloatBounds::new().above(0.0).max(1.0),
            )?,
            kick_start_time: section.get_float_bounded(
                "kick_start_time",
                Some(0.1),
                FloatBounds::new().min(0.0),
            )?,
            cycle_time: section.get_float_bounded(
                "cycle_time",
                Some(0.01),
                FloatBounds::new().above(0.0),
            )?,
            speed: 0.0,
            oid: None,
        })
    }

    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    pub fn kick_start_time(&self) -> f64 {
        self.kick_start_time
    }

    pub fn oid(&self) -> Option<u32> {
        self.oid
    }
}

pub fn construct(section: &ConfigSection) -> Result<Box<dyn Subsystem>, ConfigError> {
    Ok(Box::new(Fan::from_config(section)?))
}

impl Subsystem for Fan {
    fn build_config(&mut self, device: &mut ConfigContribution<'_>) -> Result<(), DeviceError> {
        let oid = device.create_oid();
        device.add_config_cmd(format!(
            "config_pwm_out oid={} pin={} cycle_time={} value=0 default_value=0",
            oid, self.pin, self.cycle_time
        ));
        self.oid = Some(oid);
        Ok(())
    }

    fn stats(&self, _eventtime: Instant) -> Result<String, StatsError> {
        Ok(format!("speed={:.3}", self.speed))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use printhost_common::ConfigStore;

    use super::*;

    fn section(text: &str) -> ConfigSection {
        Arc::new(ConfigStore::from_text(text).unwrap()).section("fan")
    }

    #[test]
    fn defaults_apply_when_only_the_pin_is_given() {
        let fan = Fan::from_config(&section("[fan]\npin = PB4\n")).unwrap();
        assert_eq!(fan.max_power(), 1.0);
        assert_eq!(fan.kick_start_time(), 0.1);
        assert_eq!(fan.stats(Instant::now()).unwrap(), "speed=0.000");
    }

    #[test]
    fn pin_is_required_and_power_is_bounded() {
        assert!(matches!(
            Fan::from_config(&section("[fan]\nmax_power = 0.5\n")),
            Err(ConfigError::MissingOption { .. })
        ));
        assert!(matches!(
            Fan::from_config(&section("[fan]\npin = PB4\nmax_power = 1.5\n")),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            Fan::from_config(&section("[fan]\npin = PB4\nmax_power = 0\n")),
            Err(ConfigError::OutOfRange { .. })
        ));
    }
}
