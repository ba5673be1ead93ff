//! ---
//! ph_section: "02-device-link"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Lifecycle supervision of the remote controller connection."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use printhost_common::config::{ConfigError, ConfigSection};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::transport::{CaptureTransport, DeviceTransport, ProtocolDictionary, SerialTransport};

const DEFAULT_SERIAL: &str = "/dev/ttyS0";
const DEFAULT_BAUD: i64 = 250000;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("handshake with {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connect() called more than once")]
    AlreadyConnected,
    #[error("capture mode must be selected before connecting")]
    CaptureAfterConnect,
    #[error("device is {0}; configuration requires a connected or capturing device")]
    NotConnected(ConnectionState),
    #[error("device configuration already finalized")]
    ConfigFinalized,
    #[error("command {0:?} is not in the protocol dictionary")]
    UnknownCommand(String),
    #[error("transport is not open")]
    TransportClosed,
    #[error("unable to read protocol dictionary {path}: {source}")]
    Dictionary {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed protocol dictionary: {0}")]
    DictionaryFormat(#[from] serde_json::Error),
    #[error("device shutdown failed: {0}")]
    Shutdown(#[source] std::io::Error),
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    CaptureMode,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::CaptureMode => "capturing",
        };
        f.write_str(label)
    }
}

/// Supervises the single link to the remote controller.
///
/// Subsystems never talk to the transport directly; during the build-config
/// phase they receive a [`ConfigContribution`] through which they allocate
/// object ids and queue configuration commands. [`DeviceConnection::build_config`]
/// then sends the whole configuration in one pass.
pub struct DeviceConnection {
    state: ConnectionState,
    transport: Box<dyn DeviceTransport>,
    connect_attempted: bool,
    identity: Option<String>,
    next_oid: u32,
    config_cmds: Vec<String>,
    config_crc: Option<u32>,
    commands_sent: u64,
    bytes_sent: u64,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("state", &self.state)
            .field("transport", &self.transport.describe())
            .field("oids", &self.next_oid)
            .field("queued", &self.config_cmds.len())
            .finish()
    }
}

impl DeviceConnection {
    /// Live serial connection described by the `[mcu]` section.
    pub fn from_config(section: &ConfigSection) -> Result<Self, ConfigError> {
        let serial = section.get("serial", Some(DEFAULT_SERIAL))?;
        let baud = section.get_int("baud", Some(DEFAULT_BAUD))?;
        let baud = u32::try_from(baud)
            .ok()
            .filter(|baud| *baud > 0)
            .ok_or_else(|| ConfigError::OutOfRange {
                section: section.name().to_owned(),
                option: "baud".to_owned(),
                reason: format!("must be a positive baud rate, got {}", baud),
            })?;
        Ok(Self::with_transport(Box::new(SerialTransport::new(serial, baud))))
    }

    pub fn with_transport(transport: Box<dyn DeviceTransport>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport,
            connect_attempted: false,
            identity: None,
            next_oid: 0,
            config_cmds: Vec::new(),
            config_crc: None,
            commands_sent: 0,
            bytes_sent: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn config_crc(&self) -> Option<u32> {
        self.config_crc
    }

    /// Redirect the protocol stream into `output`, encoding against
    /// `dictionary`. Must happen before [`DeviceConnection::connect`]; repeating
    /// it replaces the sink and leaves the connection in capture mode.
    pub fn connect_to_capture(
        &mut self,
        output: impl Write + 'static,
        dictionary: ProtocolDictionary,
    ) -> Result<(), DeviceError> {
        if self.connect_attempted {
            return Err(DeviceError::CaptureAfterConnect);
        }
        info!(dictionary_version = %dictionary.version(), "device output redirected to capture file");
        self.transport = Box::new(CaptureTransport::new(output, dictionary));
        self.state = ConnectionState::CaptureMode;
        Ok(())
    }

    /// Open the link and complete the handshake. May be called exactly once.
    pub fn connect(&mut self) -> Result<(), DeviceError> {
        if self.connect_attempted {
            return Err(DeviceError::AlreadyConnected);
        }
        self.connect_attempted = true;
        let capturing = self.state == ConnectionState::CaptureMode;
        if !capturing {
            self.state = ConnectionState::Connecting;
        }
        info!(transport = %self.transport.describe(), "connecting to device");
        match self.transport.open() {
            Ok(identity) => {
                info!(%identity, "device handshake complete");
                self.identity = Some(identity);
                if !capturing {
                    self.state = ConnectionState::Connected;
                }
                Ok(())
            }
            Err(err) => {
                self.state = ConnectionState::Disconnected;
                Err(err)
            }
        }
    }

    /// Best-effort teardown; a no-op when nothing was ever connected.
    pub fn disconnect(&mut self) -> Result<(), DeviceError> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Connecting => {
                debug!(state = %self.state, "disconnect requested without an open link");
                self.state = ConnectionState::Disconnected;
                Ok(())
            }
            ConnectionState::Connected | ConnectionState::CaptureMode => {
                self.state = ConnectionState::Disconnected;
                let result = self.transport.close();
                match &result {
                    Ok(()) => info!(transport = %self.transport.describe(), "device disconnected"),
                    Err(err) => warn!(error = %err, "device did not close cleanly"),
                }
                result
            }
        }
    }

    /// Hand a subsystem the device-side resources it may claim during the
    /// build-config phase.
    pub fn build_config_contribution<'a>(
        &'a mut self,
        owner: &'a str,
    ) -> Result<ConfigContribution<'a>, DeviceError> {
        self.ensure_configurable()?;
        Ok(ConfigContribution {
            device: self,
            owner,
        })
    }

    /// Send `allocate_oids`, every queued configuration command and
    /// `finalize_config` with a digest over the queued commands.
    pub fn build_config(&mut self) -> Result<(), DeviceError> {
        self.ensure_configurable()?;
        let queued = std::mem::take(&mut self.config_cmds);
        let crc = config_digest(&queued);
        self.send(&format!("allocate_oids count={}", self.next_oid))?;
        for cmd in &queued {
            self.send(cmd)?;
        }
        self.send(&format!("finalize_config crc={}", crc))?;
        self.config_crc = Some(crc);
        info!(oids = self.next_oid, commands = queued.len(), crc, "device configuration sent");
        Ok(())
    }

    fn ensure_configurable(&self) -> Result<(), DeviceError> {
        if self.config_crc.is_some() {
            return Err(DeviceError::ConfigFinalized);
        }
        match self.state {
            ConnectionState::Connected | ConnectionState::CaptureMode => Ok(()),
            other => Err(DeviceError::NotConnected(other)),
        }
    }

    pub fn send(&mut self, command: &str) -> Result<(), DeviceError> {
        match self.state {
            ConnectionState::Connected | ConnectionState::CaptureMode => {}
            other => return Err(DeviceError::NotConnected(other)),
        }
        let written = self.transport.send(command)?;
        self.commands_sent += 1;
        self.bytes_sent += written as u64;
        Ok(())
    }

    pub fn stats(&self, _eventtime: Instant) -> String {
        format!(
            "state={} oids={} sent={} bytes_write={}",
            self.state, self.next_oid, self.commands_sent, self.bytes_sent
        )
    }
}

fn config_digest(commands: &[String]) -> u32 {
    let mut hasher = Sha256::new();
    for cmd in commands {
        hasher.update(cmd.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Scoped access to the device granted to one subsystem during build-config.
pub struct ConfigContribution<'a> {
    device: &'a mut DeviceConnection,
    owner: &'a str,
}

impl ConfigContribution<'_> {
    pub fn owner(&self) -> &str {
        self.owner
    }

    /// Reserve the next device-side object id.
    pub fn create_oid(&mut self) -> u32 {
        let oid = self.device.next_oid;
        self.device.next_oid += 1;
        oid
    }

    /// Queue a configuration command for [`DeviceConnection::build_config`].
    pub fn add_config_cmd(&mut self, cmd: impl Into<String>) {
        let cmd = cmd.into();
        debug!(owner = self.owner, command = %cmd, "config command queued");
        self.device.config_cmds.push(cmd);
    }
}
