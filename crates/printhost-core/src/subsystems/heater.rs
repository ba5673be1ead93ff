//! ---
//! ph_section: "04-subsystems"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Temperature-controlled heater with its sensor."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::time::Instant;

use printhost_common::config::{ConfigError, ConfigSection, FloatBounds};
use tracing::debug;

use crate::mcu::{ConfigContribution, DeviceError};
use crate::subsystem::{StatsError, Subsystem};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeaterControl {
    /// Bang-bang around the target with a hysteresis of `max_delta`.
    Watermark { max_delta: f64 },
    Pid { kp: f64, ki: f64, kd: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    Watermark,
    Pid,
}

#[derive(Debug, Clone)]
pub struct Heater {
    name: String,
    heater_pin: String,
    sensor_type: String,
    sensor_pin: String,
    min_temp: f64,
    max_temp: f64,
    max_power: f64,
    control: HeaterControl,
    target_temp: f64,
    last_temp: f64,
    last_pwm: f64,
    heater_oid: Option<u32>,
    sensor_oid: Option<u32>,
}

impl Heater {
    /// Reads the heater options of `section`. Also used for the heater
    /// embedded in an extruder section.
    pub fn from_config(section: &ConfigSection) -> Result<Self, ConfigError> {
        let min_temp = section.get_float("min_temp", Some(0.0))?;
        let max_temp =
            section.get_float_bounded("max_temp", None, FloatBounds::new().above(min_temp))?;
        let control = match section.get_choice(
            "control",
            &[("watermark", ControlKind::Watermark), ("pid", ControlKind::Pid)],
            Some("watermark"),
        )? {
            ControlKind::Watermark => HeaterControl::Watermark {
                max_delta: section.get_float_bounded(
                    "max_delta",
                    Some(2.0),
                    FloatBounds::new().above(0.0),
                )?,
            },
            ControlKind::Pid => HeaterControl::Pid {
                kp: section.get_float("pid_kp", None)?,
                ki: section.get_float("pid_ki", None)?,
                kd: section.get_float("pid_kd", None)?,
            },
        };
        Ok(Self {
            name: section.name().to_owned(),
            heater_pin: section.get("heater_pin", None)?,
            sensor_type: section.get("sensor_type", None)?,
            sensor_pin: section.get("sensor_pin", None)?,
            min_temp,
            max_temp,
            max_power: section.get_float_bounded(
                "max_power",
                Some(1.0),
                FloatBounds::new().above(0.0).max(1.0),
            )?,
            control,
            target_temp: 0.0,
            last_temp: 0.0,
            last_pwm: 0.0,
            heater_oid: None,
            sensor_oid: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn control(&self) -> HeaterControl {
        self.control
    }

    pub fn temp_range(&self) -> (f64, f64) {
        (self.min_temp, self.max_temp)
    }

    pub fn max_power(&self) -> f64 {
        self.max_power
    }

    /// Heater output and sensor object ids, once claimed.
    pub fn oids(&self) -> Option<(u32, u32)> {
        self.heater_oid.zip(self.sensor_oid)
    }
}

pub fn construct(section: &ConfigSection) -> Result<Box<dyn Subsystem>, ConfigError> {
    Ok(Box::new(Heater::from_config(section)?))
}

impl Subsystem for Heater {
    fn build_config(&mut self, device: &mut ConfigContribution<'_>) -> Result<(), DeviceError> {
        let heater_oid = device.create_oid();
        device.add_config_cmd(format!(
            "config_digital_out oid={} pin={} value=0 default_value=0 max_duration=0",
            heater_oid, self.heater_pin
        ));
        let sensor_oid = device.create_oid();
        device.add_config_cmd(format!(
            "config_analog_in oid={} pin={}",
            sensor_oid, self.sensor_pin
        ));
        debug!(
            heater = %self.name,
            sensor_type = %self.sensor_type,
            heater_oid,
            sensor_oid,
            "heater resources claimed"
        );
        self.heater_oid = Some(heater_oid);
        self.sensor_oid = Some(sensor_oid);
        Ok(())
    }

    fn stats(&self, _eventtime: Instant) -> Result<String, StatsError> {
        Ok(format!(
            "target={:.1} temp={:.1} pwm={:.3}",
            self.target_temp, self.last_temp, self.last_pwm
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use printhost_common::ConfigStore;

    use super::*;

    fn bed(extra: &str) -> Result<Heater, ConfigError> {
        let text = format!(
            "[heater_bed]\nheater_pin = PA1\nsensor_type = EPCOS 100K B57560G104F\nsensor_pin = PF0\n{}",
            extra
        );
        let store = Arc::new(ConfigStore::from_text(&text).unwrap());
        Heater::from_config(&store.section("heater_bed"))
    }

    #[test]
    fn watermark_is_the_default_control() {
        let heater = bed("max_temp = 110\n").unwrap();
        assert_eq!(heater.control(), HeaterControl::Watermark { max_delta: 2.0 });
        assert_eq!(heater.temp_range(), (0.0, 110.0));
    }

    #[test]
    fn pid_control_requires_all_gains() {
        let heater = bed("max_temp = 110\ncontrol = pid\npid_kp = 22.2\npid_ki = 1.08\npid_kd = 114\n")
            .unwrap();
        assert!(matches!(heater.control(), HeaterControl::Pid { kd, .. } if kd == 114.0));
        assert!(matches!(
            bed("max_temp = 110\ncontrol = pid\npid_kp = 22.2\n"),
            Err(ConfigError::MissingOption { option, .. }) if option == "pid_ki"
        ));
    }

    #[test]
    fn max_temp_must_exceed_min_temp() {
        assert!(matches!(
            bed("min_temp = 50\nmax_temp = 40\n"),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            bed("max_temp = 110\ncontrol = bangbang\n"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
