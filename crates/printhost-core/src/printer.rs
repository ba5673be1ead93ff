//! ---
//! ph_section: "01-core-functionality"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Primary orchestration and lifecycle management."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use printhost_common::config::{ConfigError, ConfigStore, ROOT_SECTION};
use printhost_common::time::seconds_since;
use printhost_rt::{Deadline, Reactor, ReactorError, SignalKind, TimerHandle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::gcode::{ChannelError, CommandChannel};
use crate::mcu::{ConnectionState, DeviceConnection, DeviceError};
use crate::registry::SubsystemRegistry;
use crate::transport::ProtocolDictionary;

const STATS_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_PSEUDO_TTY: &str = "/tmp/printer";
const MCU_SECTION: &str = "mcu";

#[derive(Debug, Error)]
pub enum PrinterError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Where command lines come from.
#[derive(Debug)]
pub enum CommandInput {
    /// Pseudo-terminal published at `[printer] pseudo_tty`.
    Live,
    /// Recorded commands; the run ends when the file is exhausted.
    Replay(File),
}

/// Statistics lines gathered at one instant, in report order.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    elapsed: f64,
    entries: Vec<(String, String)>,
}

impl StatsSnapshot {
    /// Seconds since the reactor was created.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, text)| text.as_str())
    }

    fn log(&self, phase: &'static str) {
        for (source, text) in &self.entries {
            info!(phase, %source, stats = %text, "stats");
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "stats {:.1}", self.elapsed)?;
        for (name, text) in &self.entries {
            writeln!(f, "{}: {}", name, text)?;
        }
        Ok(())
    }
}

/// Final snapshots taken around the device disconnect.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub before_disconnect: StatsSnapshot,
    pub after_disconnect: StatsSnapshot,
    /// Statistics timer deadline when the run loop returned.
    pub stats_deadline: Option<Deadline>,
}

/// Process-wide context handed to every reactor callback.
pub struct Printer {
    registry: SubsystemRegistry,
    gcode: CommandChannel,
    mcu: DeviceConnection,
    stats_timer: Option<TimerHandle>,
    connect_timer: Option<TimerHandle>,
    startup_error: Option<PrinterError>,
}

impl fmt::Debug for Printer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Printer")
            .field("registry", &self.registry)
            .field("gcode", &self.gcode.state())
            .field("mcu", &self.mcu.state())
            .field("failed", &self.startup_error.is_some())
            .finish()
    }
}

fn select_channel(printer: &mut Printer) -> &mut CommandChannel {
    &mut printer.gcode
}

impl Printer {
    pub fn registry(&self) -> &SubsystemRegistry {
        &self.registry
    }

    pub fn device(&self) -> &DeviceConnection {
        &self.mcu
    }

    pub fn command_channel(&self) -> &CommandChannel {
        &self.gcode
    }

    fn stats_tick(&mut self, reactor: &mut Reactor<Printer>, eventtime: Instant) -> Deadline {
        self.snapshot(reactor, eventtime).log("periodic");
        Deadline::At(eventtime + STATS_INTERVAL)
    }

    fn connect_tick(&mut self, reactor: &mut Reactor<Printer>, _eventtime: Instant) -> Deadline {
        if let Err(err) = self.connect_sequence(reactor) {
            error!(error = %err, "printer startup failed");
            self.startup_error = Some(err);
            reactor.stop();
        }
        if let Some(handle) = self.connect_timer.take() {
            reactor.unregister_timer(handle);
        }
        Deadline::Never
    }

    /// Handshake, one build-config pass, then open the command channel.
    fn connect_sequence(&mut self, reactor: &mut Reactor<Printer>) -> Result<(), PrinterError> {
        self.mcu.connect()?;
        self.registry.build_config(&mut self.mcu)?;
        self.gcode.build_config()?;
        self.mcu.build_config()?;
        self.gcode.run(reactor, select_channel)?;
        info!(
            subsystems = self.registry.len(),
            identity = self.mcu.identity().unwrap_or_default(),
            "printer ready"
        );
        Ok(())
    }

    /// Cooperative shutdown: stop reading commands and end the run loop.
    pub fn shutdown(&mut self, reactor: &mut Reactor<Printer>) {
        info!("shutdown requested");
        self.gcode.shutdown(reactor);
    }

    fn snapshot(&self, reactor: &Reactor<Printer>, eventtime: Instant) -> StatsSnapshot {
        let mut entries = vec![("gcode".to_owned(), self.gcode.stats(eventtime))];
        for (name, stats) in self.registry.stats(eventtime) {
            match stats {
                Ok(text) => entries.push((name.to_owned(), text)),
                Err(err) => warn!(subsystem = name, error = %err, "statistics unavailable"),
            }
        }
        entries.push(("mcu".to_owned(), self.mcu.stats(eventtime)));
        let reactor_stats = reactor.stats();
        let reactor_stats = reactor_stats
            .strip_prefix("reactor: ")
            .unwrap_or(&reactor_stats)
            .to_owned();
        entries.push(("reactor".to_owned(), reactor_stats));
        StatsSnapshot {
            elapsed: seconds_since(reactor.epoch(), eventtime),
            entries,
        }
    }
}

/// Owns the reactor and the printer context; drives one process lifetime.
pub struct Orchestrator {
    reactor: Reactor<Printer>,
    printer: Printer,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("reactor", &self.reactor)
            .field("printer", &self.printer)
            .finish()
    }
}

impl Orchestrator {
    /// Build the printer from configuration with the device link named in `[mcu]`.
    pub fn new(config: Arc<ConfigStore>, input: CommandInput) -> Result<Self, PrinterError> {
        let registry = SubsystemRegistry::build(&config)?;
        let gcode = open_command_channel(&config, input)?;
        let mcu = DeviceConnection::from_config(&config.section(MCU_SECTION))?;
        Self::assemble(registry, gcode, mcu)
    }

    /// As [`Orchestrator::new`] but with a caller-supplied device connection.
    pub fn with_device(
        config: Arc<ConfigStore>,
        input: CommandInput,
        mcu: DeviceConnection,
    ) -> Result<Self, PrinterError> {
        let registry = SubsystemRegistry::build(&config)?;
        let gcode = open_command_channel(&config, input)?;
        Self::assemble(registry, gcode, mcu)
    }

    fn assemble(
        registry: SubsystemRegistry,
        gcode: CommandChannel,
        mcu: DeviceConnection,
    ) -> Result<Self, PrinterError> {
        let mut reactor = Reactor::new()?;
        let stats_timer = reactor.register_timer(Printer::stats_tick, Deadline::Now);
        let connect_timer = reactor.register_timer(Printer::connect_tick, Deadline::Now);
        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            reactor.register_signal(kind, |printer: &mut Printer, reactor: &mut Reactor<Printer>, _| {
                printer.shutdown(reactor)
            })?;
        }
        debug!(%stats_timer, %connect_timer, "startup timers registered");
        Ok(Self {
            reactor,
            printer: Printer {
                registry,
                gcode,
                mcu,
                stats_timer: Some(stats_timer),
                connect_timer: Some(connect_timer),
                startup_error: None,
            },
        })
    }

    /// Send the device protocol stream to `output` instead of a live device.
    /// Periodic statistics are disabled. Calling this again replaces the sink.
    pub fn connect_file(
        &mut self,
        output: impl Write + 'static,
        dictionary: ProtocolDictionary,
    ) -> Result<(), PrinterError> {
        if let Some(handle) = self.printer.stats_timer {
            self.reactor.update_timer(handle, Deadline::Never)?;
        }
        self.printer.mcu.connect_to_capture(output, dictionary)?;
        Ok(())
    }

    pub fn printer(&self) -> &Printer {
        &self.printer
    }

    pub fn stats_deadline(&self) -> Option<Deadline> {
        self.printer
            .stats_timer
            .and_then(|handle| self.reactor.timer_deadline(handle))
    }

    pub fn device_state(&self) -> ConnectionState {
        self.printer.mcu.state()
    }

    /// Run until the command channel finishes or a shutdown is requested,
    /// then report, disconnect and report again. A startup failure recorded
    /// by the connect sequence, or a read error that closed the command
    /// channel, is returned after the disconnect.
    pub fn run(mut self) -> Result<RunReport, PrinterError> {
        self.reactor.run(&mut self.printer)?;
        let stats_deadline = self.stats_deadline();

        let before_disconnect = self.printer.snapshot(&self.reactor, self.reactor.monotonic());
        before_disconnect.log("final");
        if let Err(err) = self.printer.mcu.disconnect() {
            warn!(error = %err, "device disconnect failed");
        }
        let after_disconnect = self.printer.snapshot(&self.reactor, self.reactor.monotonic());
        after_disconnect.log("disconnected");

        let failure = self
            .printer
            .startup_error
            .take()
            .or_else(|| self.printer.gcode.take_failure().map(PrinterError::from));
        match failure {
            Some(err) => Err(err),
            None => Ok(RunReport {
                before_disconnect,
                after_disconnect,
                stats_deadline,
            }),
        }
    }
}

fn open_command_channel(
    config: &Arc<ConfigStore>,
    input: CommandInput,
) -> Result<CommandChannel, PrinterError> {
    match input {
        CommandInput::Replay(file) => Ok(CommandChannel::replay(file)),
        CommandInput::Live => {
            let link = config
                .section(ROOT_SECTION)
                .get("pseudo_tty", Some(DEFAULT_PSEUDO_TTY))?;
            Ok(CommandChannel::live(&PathBuf::from(link))?)
        }
    }
}
