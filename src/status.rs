use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::fmt;

/// How a child process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Normal exit with the given code
    Exited(i32),
    /// Killed by a signal
    Signaled { signal: Signal, core_dumped: bool },
}

/// Structured outcome of a reaped child process.
///
/// Produced once by [`Process::poll`](crate::Process::poll) or
/// [`Process::wait`](crate::Process::wait) and cached on the handle afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pid: Pid,
    termination: Termination,
}

impl ExitStatus {
    pub fn new(pid: Pid, termination: Termination) -> Self {
        Self { pid, termination }
    }

    /// Translate a `waitpid` result.
    ///
    /// Returns `None` for anything that is not a termination (still alive,
    /// stop/continue and ptrace notifications).
    pub(crate) fn from_wait_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(pid, code) => Some(Self::new(pid, Termination::Exited(code))),
            WaitStatus::Signaled(pid, signal, core_dumped) => Some(Self::new(
                pid,
                Termination::Signaled {
                    signal,
                    core_dumped,
                },
            )),
            _ => None,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn termination(&self) -> Termination {
        self.termination
    }

    /// Exit code, if the process exited normally
    pub fn code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited(code) => Some(code),
            Termination::Signaled { .. } => None,
        }
    }

    /// Terminating signal, if the process was killed by one
    pub fn signal(&self) -> Option<Signal> {
        match self.termination {
            Termination::Signaled { signal, .. } => Some(signal),
            Termination::Exited(_) => None,
        }
    }

    pub fn signaled(&self) -> bool {
        self.signal().is_some()
    }

    pub fn core_dumped(&self) -> bool {
        matches!(
            self.termination,
            Termination::Signaled {
                core_dumped: true,
                ..
            }
        )
    }

    /// True iff the process exited normally with code 0
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// Collapse into a single shell-style code (128 + signal number for signals)
    pub fn shell_code(&self) -> i32 {
        match self.termination {
            Termination::Exited(code) => code,
            Termination::Signaled { signal, .. } => 128 + signal as i32,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.termination {
            Termination::Exited(code) => write!(f, "exit code {}", code),
            Termination::Signaled {
                signal,
                core_dumped,
            } => {
                write!(f, "terminated by signal {}", signal.as_str())?;
                if core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid() -> Pid {
        Pid::from_raw(1234)
    }

    #[test]
    fn test_exit_zero_is_success() {
        let status = ExitStatus::from_wait_status(WaitStatus::Exited(pid(), 0)).unwrap();
        assert!(status.success());
        assert_eq!(status.code(), Some(0));
        assert!(!status.signaled());
        assert_eq!(status.pid(), pid());
    }

    #[test]
    fn test_nonzero_exit() {
        let status = ExitStatus::from_wait_status(WaitStatus::Exited(pid(), 7)).unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), Some(7));
        assert_eq!(status.shell_code(), 7);
        assert_eq!(status.to_string(), "exit code 7");
    }

    #[test]
    fn test_signaled() {
        let status =
            ExitStatus::from_wait_status(WaitStatus::Signaled(pid(), Signal::SIGTERM, false))
                .unwrap();
        assert!(!status.success());
        assert_eq!(status.code(), None);
        assert_eq!(status.signal(), Some(Signal::SIGTERM));
        assert_eq!(status.shell_code(), 143);
        assert_eq!(status.to_string(), "terminated by signal SIGTERM");
    }

    #[test]
    fn test_core_dump_display() {
        let status = ExitStatus::new(
            pid(),
            Termination::Signaled {
                signal: Signal::SIGSEGV,
                core_dumped: true,
            },
        );
        assert!(status.core_dumped());
        assert_eq!(status.to_string(), "terminated by signal SIGSEGV (core dumped)");
    }

    #[test]
    fn test_non_terminal_statuses_are_ignored() {
        assert!(ExitStatus::from_wait_status(WaitStatus::StillAlive).is_none());
        assert!(ExitStatus::from_wait_status(WaitStatus::Stopped(pid(), Signal::SIGSTOP)).is_none());
    }
}
