//! Worker exit statuses and the restart decision.

use std::fmt;

/// Exit code of a worker that stopped because its loop returned.
pub const EXIT_NORMAL: i32 = 0;
/// Exit code of a worker that could not adopt or serve the listener.
pub const EXIT_CONNECT_ERROR: i32 = 2;
/// Exit code of a worker that failed to start a child of its own.
pub const EXIT_FORK_FAILED: i32 = 3;
/// Exit code of a worker stopped by SIGINT/SIGTERM.
pub const EXIT_MANUAL_KILL: i32 = 130;

/// Raw status collected by `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatusInfo {
    /// Called `exit` with this code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(i32),
}

impl ExitStatusInfo {
    /// Decode a `waitpid` status word.
    pub fn from_wait_status(status: libc::c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            ExitStatusInfo::Signaled(libc::WTERMSIG(status))
        } else {
            ExitStatusInfo::Exited(libc::WEXITSTATUS(status))
        }
    }
}

/// Why a worker went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Normal,
    ManualKill,
    ConnectError,
    ForkFailed,
    /// Any other exit code, or 128 + signal number for other fatal signals.
    Unknown(i32),
}

impl WorkerExit {
    /// Crashed workers are restarted; normal and requested exits are not.
    pub const fn should_restart(self) -> bool {
        !matches!(self, WorkerExit::Normal | WorkerExit::ManualKill)
    }

    /// The worker could not get as far as serving. Repeated quickly, this
    /// means no respawn will fare better.
    pub const fn is_startup_failure(self) -> bool {
        matches!(self, WorkerExit::ConnectError | WorkerExit::ForkFailed)
    }

    /// The process exit code that produces this classification.
    pub const fn code(self) -> i32 {
        match self {
            WorkerExit::Normal => EXIT_NORMAL,
            WorkerExit::ManualKill => EXIT_MANUAL_KILL,
            WorkerExit::ConnectError => EXIT_CONNECT_ERROR,
            WorkerExit::ForkFailed => EXIT_FORK_FAILED,
            WorkerExit::Unknown(code) => code,
        }
    }
}

impl From<ExitStatusInfo> for WorkerExit {
    fn from(status: ExitStatusInfo) -> Self {
        match status {
            ExitStatusInfo::Exited(EXIT_NORMAL) => WorkerExit::Normal,
            ExitStatusInfo::Exited(EXIT_CONNECT_ERROR) => WorkerExit::ConnectError,
            ExitStatusInfo::Exited(EXIT_FORK_FAILED) => WorkerExit::ForkFailed,
            ExitStatusInfo::Exited(EXIT_MANUAL_KILL) => WorkerExit::ManualKill,
            ExitStatusInfo::Exited(code) => WorkerExit::Unknown(code),
            ExitStatusInfo::Signaled(libc::SIGTERM | libc::SIGINT | libc::SIGKILL) => {
                WorkerExit::ManualKill
            }
            ExitStatusInfo::Signaled(signal) => WorkerExit::Unknown(128 + signal),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Normal => f.write_str("normal exit"),
            WorkerExit::ManualKill => f.write_str("stopped by signal"),
            WorkerExit::ConnectError => f.write_str("could not serve the listener"),
            WorkerExit::ForkFailed => f.write_str("fork failed"),
            WorkerExit::Unknown(code) => write!(f, "unknown error (status {})", code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_classification() {
        assert_eq!(WorkerExit::from(ExitStatusInfo::Exited(0)), WorkerExit::Normal);
        assert_eq!(
            WorkerExit::from(ExitStatusInfo::Exited(2)),
            WorkerExit::ConnectError
        );
        assert_eq!(WorkerExit::from(ExitStatusInfo::Exited(3)), WorkerExit::ForkFailed);
        assert_eq!(
            WorkerExit::from(ExitStatusInfo::Exited(130)),
            WorkerExit::ManualKill
        );
        assert_eq!(
            WorkerExit::from(ExitStatusInfo::Exited(101)),
            WorkerExit::Unknown(101)
        );
    }

    #[test]
    fn test_signal_classification() {
        assert_eq!(
            WorkerExit::from(ExitStatusInfo::Signaled(libc::SIGTERM)),
            WorkerExit::ManualKill
        );
        assert_eq!(
            WorkerExit::from(ExitStatusInfo::Signaled(libc::SIGSEGV)),
            WorkerExit::Unknown(128 + libc::SIGSEGV)
        );
    }

    #[test]
    fn test_restart_decision() {
        assert!(!WorkerExit::Normal.should_restart());
        assert!(!WorkerExit::ManualKill.should_restart());
        assert!(WorkerExit::ConnectError.should_restart());
        assert!(WorkerExit::Unknown(139).should_restart());

        assert!(WorkerExit::ConnectError.is_startup_failure());
        assert!(WorkerExit::ForkFailed.is_startup_failure());
        assert!(!WorkerExit::Unknown(139).is_startup_failure());
        assert!(!WorkerExit::ManualKill.is_startup_failure());
    }

    #[test]
    fn test_code_round_trips_through_classification() {
        for exit in [
            WorkerExit::Normal,
            WorkerExit::ManualKill,
            WorkerExit::ConnectError,
            WorkerExit::ForkFailed,
        ] {
            assert_eq!(WorkerExit::from(ExitStatusInfo::Exited(exit.code())), exit);
        }
    }
}
