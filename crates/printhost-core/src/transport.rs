//! ---
//! ph_section: "02-device-link"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Byte-level transports to the remote controller."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::mcu::DeviceError;

/// Channel that carries encoded commands to the remote controller.
///
/// `open` performs the handshake and returns a human-readable identity of the
/// peer. The encoding of each command is the transport's business.
pub trait DeviceTransport {
    fn open(&mut self) -> Result<String, DeviceError>;
    fn send(&mut self, command: &str) -> Result<usize, DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
    fn describe(&self) -> String;
}

/// Serial-like device node, e.g. a USB CDC-ACM port.
#[derive(Debug)]
pub struct SerialTransport {
    path: PathBuf,
    baud: u32,
    port: Option<File>,
}

impl SerialTransport {
    pub fn new(path: impl Into<PathBuf>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            port: None,
        }
    }
}

impl DeviceTransport for SerialTransport {
    fn open(&mut self) -> Result<String, DeviceError> {
        let port = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&self.path)
            .map_err(|source| DeviceError::Handshake {
                target: self.path.display().to_string(),
                source,
            })?;
        match configure_line(&port, self.baud) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::ENOTTY) => {
                debug!(path = %self.path.display(), "device is not a terminal; skipping line setup");
            }
            Err(source) => {
                return Err(DeviceError::Handshake {
                    target: self.path.display().to_string(),
                    source,
                })
            }
        }
        self.port = Some(port);
        Ok(format!("serial {} @ {} baud", self.path.display(), self.baud))
    }

    fn send(&mut self, command: &str) -> Result<usize, DeviceError> {
        let port = self.port.as_mut().ok_or(DeviceError::TransportClosed)?;
        port.write_all(command.as_bytes())?;
        port.write_all(b"\n")?;
        Ok(command.len() + 1)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if let Some(mut port) = self.port.take() {
            port.flush().map_err(DeviceError::Shutdown)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.path.display())
    }
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        460800 => libc::B460800,
        500000 => libc::B500000,
        921600 => libc::B921600,
        1000000 => libc::B1000000,
        _ => return None,
    };
    Some(speed)
}

/// Put the line into raw mode and apply the baud rate when it is a standard one.
fn configure_line(port: &File, baud: u32) -> io::Result<()> {
    let fd = port.as_raw_fd();
    // SAFETY: termios is plain data; tcgetattr fully initialises it on success.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    // SAFETY: fd is owned by `port` and stays open for the duration of the calls.
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: tio was initialised by tcgetattr above.
    unsafe { libc::cfmakeraw(&mut tio) };
    match baud_constant(baud) {
        // SAFETY: as above.
        Some(speed) => unsafe {
            libc::cfsetspeed(&mut tio, speed);
        },
        None => debug!(baud, "non-standard baud rate; leaving line speed unchanged"),
    }
    // SAFETY: as above.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawDictionary {
    #[serde(default)]
    version: String,
    #[serde(default)]
    build_versions: String,
    commands: IndexMap<String, u32>,
    #[serde(default)]
    responses: IndexMap<String, u32>,
}

/// Static description of the commands a controller build understands.
///
/// Keys of `commands` are format strings such as `config_pwm_out oid=%c pin=%u`;
/// the first word names the message.
#[derive(Debug, Clone)]
pub struct ProtocolDictionary {
    version: String,
    build_versions: String,
    commands: IndexMap<String, u32>,
    responses: usize,
}

impl ProtocolDictionary {
    pub fn from_slice(data: &[u8]) -> Result<Self, DeviceError> {
        let raw: RawDictionary = serde_json::from_slice(data)?;
        let commands = raw
            .commands
            .into_iter()
            .filter_map(|(format, id)| {
                format
                    .split_whitespace()
                    .next()
                    .map(|name| (name.to_owned(), id))
            })
            .collect();
        Ok(Self {
            version: raw.version,
            build_versions: raw.build_versions,
            commands,
            responses: raw.responses.len(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, DeviceError> {
        let data = fs::read(path).map_err(|source| DeviceError::Dictionary {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&data)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn command_id(&self, name: &str) -> Option<u32> {
        self.commands.get(name).copied()
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

/// Writes the command stream to a file instead of a live device. Every command
/// must be known to the dictionary.
pub struct CaptureTransport {
    sink: BufWriter<Box<dyn Write>>,
    dictionary: ProtocolDictionary,
}

impl std::fmt::Debug for CaptureTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureTransport")
            .field("dictionary", &self.dictionary)
            .finish()
    }
}

impl CaptureTransport {
    pub fn new(sink: impl Write + 'static, dictionary: ProtocolDictionary) -> Self {
        let sink: Box<dyn Write> = Box::new(sink);
        Self {
            sink: BufWriter::new(sink),
            dictionary,
        }
    }
}

impl DeviceTransport for CaptureTransport {
    fn open(&mut self) -> Result<String, DeviceError> {
        Ok(format!(
            "capture dictionary version={:?} build={:?} commands={} responses={}",
            self.dictionary.version,
            self.dictionary.build_versions,
            self.dictionary.command_count(),
            self.dictionary.responses
        ))
    }

    fn send(&mut self, command: &str) -> Result<usize, DeviceError> {
        let name = command.split_whitespace().next().unwrap_or_default();
        if self.dictionary.command_id(name).is_none() {
            return Err(DeviceError::UnknownCommand(name.to_owned()));
        }
        self.sink.write_all(command.as_bytes())?;
        self.sink.write_all(b"\n")?;
        Ok(command.len() + 1)
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.sink.flush().map_err(DeviceError::Shutdown)
    }

    fn describe(&self) -> String {
        format!("capture:{}", self.dictionary.version)
    }
}
