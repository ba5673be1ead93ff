//! ---
//! ph_section: "03-command-channel"
//! ph_subsection: "module"
//! ph_type: "source"
//! ph_scope: "code"
//! ph_description: "Pseudo-terminal endpoint for interactive command input."
//! ph_version: "v0.0.0-prealpha"
//! ph_owner: "tbd"
//! ---
use std::ffi::CStr;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::ptr;

use tracing::info;

/// Master side of a pseudo-terminal whose slave is reachable through a symlink.
#[derive(Debug)]
pub struct Pty {
    master: File,
    // Held open so the master never reports hang-up while no client is attached.
    _slave: OwnedFd,
    link: PathBuf,
    slave_name: PathBuf,
}

impl Pty {
    pub fn master(&self) -> &File {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut File {
        &mut self.master
    }

    pub fn link(&self) -> &Path {
        &self.link
    }

    pub fn slave_name(&self) -> &Path {
        &self.slave_name
    }
}

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Open a pseudo-terminal, publish its slave at `link` (replacing whatever was
/// there), and return the non-blocking, non-echoing master.
pub fn create_pty(link: &Path) -> io::Result<Pty> {
    let mut master_fd: RawFd = -1;
    let mut slave_fd: RawFd = -1;
    // SAFETY: both out-pointers are valid; name, termios and winsize are optional.
    check(unsafe {
        libc::openpty(
            &mut master_fd,
            &mut slave_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null_mut(),
        )
    })?;
    // SAFETY: openpty succeeded, so both descriptors are open and owned by us.
    let master = unsafe { File::from_raw_fd(master_fd) };
    // SAFETY: as above.
    let slave = unsafe { OwnedFd::from_raw_fd(slave_fd) };

    let mut name = [0 as libc::c_char; 128];
    // SAFETY: the buffer is writable for its full length.
    let rc = unsafe { libc::ptsname_r(master.as_raw_fd(), name.as_mut_ptr(), name.len()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }
    // SAFETY: ptsname_r NUL-terminates on success.
    let slave_name = unsafe { CStr::from_ptr(name.as_ptr()) };
    let slave_name = PathBuf::from(slave_name.to_string_lossy().into_owned());

    match fs::remove_file(link) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    symlink(&slave_name, link)?;

    let fd = master.as_raw_fd();
    // SAFETY: fd is a valid open descriptor for every call below.
    let flags = check(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    check(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;

    // SAFETY: termios is plain data filled in by tcgetattr.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    check(unsafe { libc::tcgetattr(fd, &mut tio) })?;
    tio.c_lflag &= !libc::ECHO;
    check(unsafe { libc::tcsetattr(fd, libc::TCSADRAIN, &tio) })?;

    info!(link = %link.display(), slave = %slave_name.display(), "pseudo-terminal ready");
    Ok(Pty {
        master,
        _slave: slave,
        link: link.to_path_buf(),
        slave_name,
    })
}
