//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "tests"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Startup, capture and shutdown integration tests for the orchestrator."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::cell::RefCell;
use std::fs::File;
use std::io::{Seek, Write};
use std::rc::Rc;
use std::sync::Arc;

use printhost_common::{ConfigError, ConfigStore};
use printhost_core::{
    ChannelError, CommandInput, ConnectionState, DeviceConnection, DeviceError, DeviceTransport, Orchestrator,
    PrinterError, ProtocolDictionary,
};
use printhost_rt::Deadline;
use tempfile::NamedTempFile;

const PRINTER_CFG: &str = "
[printer]
kinematics = cartesian
max_velocity = 300
max_accel = 3000

[mcu]
serial = /dev/ttyACM0

[fan]
pin = PH6

[extruder]
step_pin = PA4
dir_pin = PA6
step_distance = 0.0022
heater_pin = PB4
sensor_type = EPCOS 100K B57560G104F
sensor_pin = PK5
max_temp = 250
";

const DICTIONARY: &str = r#"{
    "version": "v0.4-integration",
    "build_versions": "gcc: 5.4.0",
    "commands": {
        "allocate_oids count=%c": 1,
        "finalize_config crc=%u": 2,
        "config_pwm_out oid=%c pin=%u cycle_time=%u value=%c default_value=%c": 3,
        "config_digital_out oid=%c pin=%u value=%c default_value=%c max_duration=%u": 4,
        "config_analog_in oid=%c pin=%u": 5,
        "config_stepper oid=%c step_pin=%c dir_pin=%c min_stop_interval=%u invert_step=%c": 6
    },
    "responses": {}
}"#;

fn config(text: &str) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::from_text(text).unwrap())
}

fn replay(commands: &str) -> CommandInput {
    let mut file: File = tempfile::tempfile().unwrap();
    file.write_all(commands.as_bytes()).unwrap();
    file.rewind().unwrap();
    CommandInput::Replay(file)
}

fn dictionary() -> ProtocolDictionary {
    ProtocolDictionary::from_slice(DICTIONARY.as_bytes()).unwrap()
}

type Lines = Rc<RefCell<Vec<String>>>;

struct ScriptedDevice {
    lines: Lines,
    fail_handshake: bool,
}

impl DeviceTransport for ScriptedDevice {
    fn open(&mut self) -> Result<String, DeviceError> {
        if self.fail_handshake {
            return Err(DeviceError::Handshake {
                target: "scripted".into(),
                source: std::io::Error::from(std::io::ErrorKind::TimedOut),
            });
        }
        self.lines.borrow_mut().push("<open>".into());
        Ok("scripted device".into())
    }

    fn send(&mut self, command: &str) -> Result<usize, DeviceError> {
        self.lines.borrow_mut().push(command.to_owned());
        Ok(command.len())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.lines.borrow_mut().push("<close>".into());
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".into()
    }
}

fn scripted(fail_handshake: bool) -> (DeviceConnection, Lines) {
    let lines = Lines::default();
    let device = DeviceConnection::with_transport(Box::new(ScriptedDevice {
        lines: Rc::clone(&lines),
        fail_handshake,
    }));
    (device, lines)
}

fn position(lines: &[String], prefix: &str) -> usize {
    lines
        .iter()
        .position(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("no line starting with {prefix:?} in {lines:?}"))
}

#[test]
fn capture_run_with_empty_replay_reports_every_subsystem() {
    let capture = NamedTempFile::new().unwrap();
    let mut orchestrator = Orchestrator::new(config(PRINTER_CFG), replay("")).unwrap();
    orchestrator
        .connect_file(capture.reopen().unwrap(), dictionary())
        .unwrap();

    let names: Vec<_> = orchestrator.printer().registry().names().collect();
    assert_eq!(names, vec!["extruder", "fan", "toolhead"]);

    let report = orchestrator.run().unwrap();
    assert_eq!(report.stats_deadline, Some(Deadline::Never));
    for snapshot in [&report.before_disconnect, &report.after_disconnect] {
        for name in ["gcode", "extruder", "fan", "toolhead", "mcu"] {
            assert!(snapshot.get(name).is_some(), "{name} missing from {snapshot}");
        }
    }
    assert_eq!(report.before_disconnect.get("gcode"), Some("gcodein=0 commands=0"));
    assert!(report
        .before_disconnect
        .get("mcu")
        .unwrap()
        .starts_with("state=capturing oids=4 sent=6 "));
    assert!(report
        .after_disconnect
        .get("mcu")
        .unwrap()
        .starts_with("state=disconnected "));

    let written = std::fs::read_to_string(capture.path()).unwrap();
    let lines: Vec<String> = written.lines().map(str::to_owned).collect();
    assert_eq!(lines.first().map(String::as_str), Some("allocate_oids count=4"));
    assert!(lines.last().unwrap().starts_with("finalize_config crc="));
}

#[test]
fn capture_mode_disables_periodic_stats_and_is_idempotent() {
    let mut orchestrator = Orchestrator::new(config(PRINTER_CFG), replay("")).unwrap();
    assert_eq!(orchestrator.stats_deadline(), Some(Deadline::Now));

    orchestrator.connect_file(Vec::new(), dictionary()).unwrap();
    assert_eq!(orchestrator.stats_deadline(), Some(Deadline::Never));
    assert_eq!(orchestrator.device_state(), ConnectionState::CaptureMode);

    orchestrator.connect_file(Vec::new(), dictionary()).unwrap();
    assert_eq!(orchestrator.stats_deadline(), Some(Deadline::Never));
    assert_eq!(orchestrator.device_state(), ConnectionState::CaptureMode);
}

#[test]
fn build_config_follows_handshake_in_name_order() {
    let (device, lines) = scripted(false);
    let orchestrator =
        Orchestrator::with_device(config(PRINTER_CFG), replay("G28\nM106 S255\n"), device)
            .unwrap();
    let report = orchestrator.run().unwrap();
    assert_eq!(report.before_disconnect.get("gcode"), Some("gcodein=14 commands=2"));
    assert!(matches!(report.stats_deadline, Some(Deadline::At(_))));

    let lines = lines.borrow();
    assert_eq!(lines[0], "<open>");
    assert_eq!(lines[1], "allocate_oids count=4");
    let stepper = position(&lines, "config_stepper oid=0 ");
    let heater = position(&lines, "config_digital_out oid=1 pin=PB4");
    let sensor = position(&lines, "config_analog_in oid=2 pin=PK5");
    let fan = position(&lines, "config_pwm_out oid=3 pin=PH6");
    let finalize = position(&lines, "finalize_config crc=");
    assert!(stepper < heater && heater < sensor && sensor < fan && fan < finalize);
    assert_eq!(lines.last().map(String::as_str), Some("<close>"));
}

#[test]
fn failed_handshake_is_returned_and_no_configuration_is_sent() {
    let (device, lines) = scripted(true);
    let orchestrator =
        Orchestrator::with_device(config(PRINTER_CFG), replay("G28\n"), device).unwrap();
    let err = orchestrator.run().unwrap_err();
    assert!(matches!(
        err,
        PrinterError::Device(DeviceError::Handshake { .. })
    ));
    assert!(lines.borrow().is_empty());
}

#[test]
fn absent_sections_leave_only_the_toolhead() {
    let (device, _lines) = scripted(false);
    let orchestrator = Orchestrator::with_device(
        config("[printer]\nmax_velocity = 200\nmax_accel = 1000\n"),
        replay(""),
        device,
    )
    .unwrap();
    let names: Vec<_> = orchestrator.printer().registry().names().collect();
    assert_eq!(names, vec!["toolhead"]);

    let report = orchestrator.run().unwrap();
    assert!(report.before_disconnect.get("fan").is_none());
    assert!(report.before_disconnect.get("toolhead").is_some());
}

#[test]
fn missing_root_section_fails_construction() {
    let (device, _lines) = scripted(false);
    let err = Orchestrator::with_device(config("[fan]\npin = PH6\n"), replay(""), device)
        .unwrap_err();
    assert!(matches!(
        err,
        PrinterError::Config(ConfigError::MissingSection(_))
    ));
}

#[test]
fn invalid_subsystem_option_fails_construction() {
    let text = PRINTER_CFG.replace("pin = PH6", "pin = PH6\nmax_power = 2.0");
    let err = Orchestrator::new(config(&text), replay("")).unwrap_err();
    assert!(matches!(
        err,
        PrinterError::Config(ConfigError::OutOfRange { .. })
    ));
}

#[test]
fn unreadable_replay_still_reports_and_returns_the_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = CommandInput::Replay(File::open(dir.path()).unwrap());
    let mut orchestrator = Orchestrator::new(config(PRINTER_CFG), input).unwrap();
    orchestrator.connect_file(Vec::new(), dictionary()).unwrap();
    let err = orchestrator.run().unwrap_err();
    assert!(matches!(err, PrinterError::Channel(ChannelError::Read(_))));
}
