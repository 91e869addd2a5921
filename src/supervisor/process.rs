//! Worker processes: re-exec the current binary with the listener inherited.

use std::io;
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::{Error, Result};
use crate::supervisor::{ExitStatusInfo, ProcessControl, Signal};

/// Environment variable carrying the inherited listener's descriptor.
pub const LISTEN_FD_ENV: &str = "WSD_LISTEN_FD";

/// Command-line flag that puts the binary in worker mode.
pub const WORKER_SLOT_FLAG: &str = "--worker-slot";

/// Spawns workers as child processes of the master.
#[derive(Debug)]
pub struct ChildProcesses {
    program: PathBuf,
    args: Vec<String>,
    listen_fd: RawFd,
    // Keeps the descriptor open for the children spawned later.
    _listener: TcpListener,
}

impl ChildProcesses {
    /// Prepare to spawn `current_exe` with `args` plus the worker slot flag.
    ///
    /// The listener's close-on-exec flag is cleared so every worker inherits
    /// the same socket.
    ///
    /// # Errors
    /// The executable path is unknown or the descriptor flags cannot be set.
    pub fn new(listener: TcpListener, args: Vec<String>) -> Result<Self> {
        let program = std::env::current_exe()?;
        let listen_fd = listener.as_raw_fd();
        clear_cloexec(listen_fd)?;
        Ok(Self {
            program,
            args,
            listen_fd,
            _listener: listener,
        })
    }
}

impl ProcessControl for ChildProcesses {
    fn spawn(&mut self, slot: usize) -> Result<u32> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(WORKER_SLOT_FLAG)
            .arg(slot.to_string())
            .env(LISTEN_FD_ENV, self.listen_fd.to_string())
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| Error::Spawn {
                slot,
                message: err.to_string(),
            })?;
        Ok(child.id())
    }

    fn signal(&mut self, pid: u32, signal: Signal) -> Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
        if rc == -1 {
            return Err(Error::Signal(format!(
                "{} to pid {}: {}",
                signal,
                pid,
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    fn reap(&mut self) -> Vec<(u32, ExitStatusInfo)> {
        let mut exited = Vec::new();
        loop {
            let mut status: libc::c_int = 0;
            // SAFETY: `status` is a valid out-pointer for the duration of the call.
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            exited.push((pid as u32, ExitStatusInfo::from_wait_status(status)));
        }
        exited
    }
}

fn clear_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: fcntl on a descriptor we own; no pointers involved.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags == -1 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(())
}

/// In a worker, take ownership of the listener passed down by the master.
///
/// Returns `None` when the variable is missing or malformed, or the
/// descriptor is not a socket.
pub fn inherited_listener() -> Option<TcpListener> {
    let fd: RawFd = std::env::var(LISTEN_FD_ENV).ok()?.trim().parse().ok()?;
    if fd < 0 || !is_socket(fd) {
        return None;
    }
    // SAFETY: the master handed this descriptor to exactly one process, us,
    // and nothing else in this process refers to it.
    Some(unsafe { TcpListener::from_raw_fd(fd) })
}

fn is_socket(fd: RawFd) -> bool {
    // SAFETY: `stat` is a valid out-pointer; fstat only writes to it.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } == -1 {
        return false;
    }
    stat.st_mode & libc::S_IFMT == libc::S_IFSOCK
}
