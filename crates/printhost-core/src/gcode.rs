//! ---
//! ph_section: "03-command-channel"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Command input endpoint integrated with the reactor."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::path::Path;
use std::time::Instant;

use printhost_rt::{FdHandle, Reactor, ReactorError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pty::{create_pty, Pty};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("unable to create pseudo-terminal at {link}: {source}")]
    Pty {
        link: String,
        #[source]
        source: io::Error,
    },
    #[error("command channel cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: ChannelState,
    },
    #[error("command input read failed: {0}")]
    Read(#[source] io::Error),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Configured,
    Running,
    Finished,
}

#[derive(Debug)]
enum ChannelInput {
    Live(Pty),
    Replay(File),
}

/// Source of command lines: an interactive pseudo-terminal or a recorded file.
///
/// Line interpretation belongs to the command interpreter; this endpoint
/// frames input into lines, drops comments, counts what it saw and answers
/// interactive clients.
#[derive(Debug)]
pub struct CommandChannel {
    input: ChannelInput,
    state: ChannelState,
    reader: Option<FdHandle>,
    partial: Vec<u8>,
    bytes_in: u64,
    commands: u64,
    failure: Option<io::Error>,
}

impl CommandChannel {
    /// Interactive channel published at `link`.
    pub fn live(link: &Path) -> Result<Self, ChannelError> {
        let pty = create_pty(link).map_err(|source| ChannelError::Pty {
            link: link.display().to_string(),
            source,
        })?;
        Ok(Self::with_input(ChannelInput::Live(pty)))
    }

    /// Channel that replays a file and finishes at end of input.
    pub fn replay(file: File) -> Self {
        Self::with_input(ChannelInput::Replay(file))
    }

    fn with_input(input: ChannelInput) -> Self {
        Self {
            input,
            state: ChannelState::Idle,
            reader: None,
            partial: Vec::new(),
            bytes_in: 0,
            commands: 0,
            failure: None,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self.input, ChannelInput::Replay(_))
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn commands_seen(&self) -> u64 {
        self.commands
    }

    /// Read error that ended the channel, if any. Taken once.
    pub fn take_failure(&mut self) -> Option<ChannelError> {
        self.failure.take().map(ChannelError::Read)
    }

    pub fn build_config(&mut self) -> Result<(), ChannelError> {
        if self.state != ChannelState::Idle {
            return Err(ChannelError::InvalidState {
                action: "configure",
                state: self.state,
            });
        }
        self.state = ChannelState::Configured;
        debug!(replay = self.is_replay(), "command channel configured");
        Ok(())
    }

    /// Start consuming input on `reactor`. `select` locates this channel inside
    /// the reactor's context when input becomes readable. In replay mode the
    /// reactor is stopped once the file is exhausted.
    pub fn run<C: 'static>(
        &mut self,
        reactor: &mut Reactor<C>,
        select: fn(&mut C) -> &mut CommandChannel,
    ) -> Result<(), ChannelError> {
        if self.state != ChannelState::Configured {
            return Err(ChannelError::InvalidState {
                action: "run",
                state: self.state,
            });
        }
        let callback = move |ctx: &mut C, reactor: &mut Reactor<C>, now: Instant| {
            select(ctx).process_input(reactor, now);
        };
        let handle = match &self.input {
            ChannelInput::Live(pty) => reactor.register_fd(pty.master(), callback)?,
            ChannelInput::Replay(file) => reactor.register_fd(file, callback)?,
        };
        self.reader = Some(handle);
        self.state = ChannelState::Running;
        info!(replay = self.is_replay(), "command channel accepting input");
        Ok(())
    }

    /// Read what is available and frame it into commands.
    pub fn process_input<C>(&mut self, reactor: &mut Reactor<C>, _eventtime: Instant) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let read = match &mut self.input {
                ChannelInput::Live(pty) => pty.master_mut().read(&mut buf),
                ChannelInput::Replay(file) => file.read(&mut buf),
            };
            match read {
                Ok(0) => {
                    if self.is_replay() {
                        self.flush_partial();
                        info!(commands = self.commands, bytes = self.bytes_in, "command input exhausted");
                        self.shutdown(reactor);
                    }
                    return;
                }
                Ok(n) => {
                    self.bytes_in += n as u64;
                    self.partial.extend_from_slice(&buf[..n]);
                    self.dispatch_lines();
                    // Files are always readable; yield to timers after each chunk.
                    if self.is_replay() {
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.raw_os_error() == Some(libc::EIO) => return,
                // Any other error repeats on every dispatch; end the channel.
                Err(err) => {
                    warn!(error = %err, "command input read failed; closing channel");
                    self.failure = Some(err);
                    self.shutdown(reactor);
                    return;
                }
            }
        }
    }

    fn dispatch_lines(&mut self) {
        while let Some(end) = self.partial.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            self.handle_line(&line);
        }
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.handle_line(&line);
        }
    }

    fn handle_line(&mut self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        let command = text.split(';').next().unwrap_or_default().trim();
        if !command.is_empty() {
            self.commands += 1;
            debug!(command, "command received");
        }
        if let ChannelInput::Live(pty) = &mut self.input {
            if let Err(err) = pty.master_mut().write_all(b"ok\n") {
                warn!(error = %err, "unable to acknowledge command");
            }
        }
    }

    /// Stop consuming input and end the reactor's run loop.
    pub fn shutdown<C>(&mut self, reactor: &mut Reactor<C>) {
        if let Some(handle) = self.reader.take() {
            reactor.unregister_fd(handle);
        }
        if self.state != ChannelState::Finished {
            info!(state = ?self.state, "command channel shutting down");
        }
        self.state = ChannelState::Finished;
        reactor.stop();
    }

    pub fn stats(&self, _eventtime: Instant) -> String {
        format!("gcodein={} commands={}", self.bytes_in, self.commands)
    }
}
