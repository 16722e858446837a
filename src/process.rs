use crate::error::{Result, SubprocessError};
use crate::pipe::{ChildStderr, ChildStdin, ChildStdout};
use crate::status::ExitStatus;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;

/// Handle to a launched child process.
///
/// Holds the child's pid, the parent ends of any pipes created for it, and
/// the termination status once it has been observed. Dropping the handle
/// closes the pipe ends but neither kills nor reaps the child.
#[derive(Debug)]
pub struct Process {
    pid: Pid,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status: Option<ExitStatus>,
    /// stdin reads from a handle supplied by the caller
    stdin_bound: bool,
}

impl Process {
    pub(crate) fn new(
        pid: Pid,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        stdin_bound: bool,
    ) -> Self {
        Self {
            pid,
            stdin,
            stdout,
            stderr,
            status: None,
            stdin_bound,
        }
    }

    pub(crate) fn stdin_bound(&self) -> bool {
        self.stdin_bound
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The cached termination status, if already observed
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn stdout(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    pub fn stderr(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    /// Take ownership of the stdin pipe; dropping it signals end-of-input
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Check for termination without blocking.
    ///
    /// Returns `None` while the child is still running.
    pub fn poll(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.status {
            return Ok(Some(status));
        }
        self.reap(Some(WaitPidFlag::WNOHANG))
    }

    /// Block until the child terminates
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        loop {
            if let Some(status) = self.reap(None)? {
                return Ok(status);
            }
        }
    }

    fn reap(&mut self, flags: Option<WaitPidFlag>) -> Result<Option<ExitStatus>> {
        let wait_status = loop {
            match waitpid(self.pid, flags) {
                Err(Errno::EINTR) => continue,
                other => break other?,
            }
        };

        let status = ExitStatus::from_wait_status(wait_status);
        if let Some(status) = status {
            tracing::debug!(pid = %self.pid, %status, "child process reaped");
            self.status = Some(status);
        }
        Ok(status)
    }

    /// Send a signal given by name (`"TERM"`, `"SIGTERM"`) or number
    pub fn send_signal(&self, name: &str) -> Result<()> {
        self.signal(parse_signal(name)?)
    }

    /// Send a signal to the child.
    ///
    /// Fails with [`SubprocessError::ProcessGone`] once the child has been
    /// reaped: its pid may already belong to another process.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.status.is_some() {
            return Err(SubprocessError::ProcessGone {
                pid: self.pid.as_raw(),
            });
        }

        tracing::debug!(pid = %self.pid, signal = signal.as_str(), "sending signal");
        nix::sys::signal::kill(self.pid, signal).map_err(|e| match e {
            Errno::ESRCH => SubprocessError::ProcessGone {
                pid: self.pid.as_raw(),
            },
            e => SubprocessError::SystemError(e),
        })
    }

    /// Ask the child to stop (SIGTERM)
    pub fn terminate(&self) -> Result<()> {
        self.signal(Signal::SIGTERM)
    }

    /// Force the child to stop (SIGKILL)
    pub fn kill(&self) -> Result<()> {
        self.signal(Signal::SIGKILL)
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if self.status.is_none() {
            tracing::warn!(pid = %self.pid, "process handle dropped before the child was reaped");
        }
    }
}

/// Parse `"TERM"`, `"SIGTERM"`, `"term"` or `"15"` into a signal
pub fn parse_signal(name: &str) -> Result<Signal> {
    let name = name.trim();
    if let Ok(number) = name.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|_| SubprocessError::InvalidSignal(name.to_string()));
    }

    let upper = name.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    full.parse::<Signal>()
        .map_err(|_| SubprocessError::InvalidSignal(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpawnRequest;
    use std::time::Duration;

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGKILL").unwrap(), Signal::SIGKILL);
        assert_eq!(parse_signal("int").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("9").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_parse_signal_rejects_unknown() {
        assert!(matches!(
            parse_signal("NOPE"),
            Err(SubprocessError::InvalidSignal(_))
        ));
        assert!(matches!(
            parse_signal("0"),
            Err(SubprocessError::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_poll_then_wait() {
        let mut child = SpawnRequest::new(["sleep", "5"]).run().unwrap();
        assert!(child.poll().unwrap().is_none());
        assert!(child.status().is_none());

        child.kill().unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL));
        assert_eq!(child.poll().unwrap(), Some(status));
    }

    #[test]
    fn test_wait_is_cached() {
        let mut child = SpawnRequest::new("exit 4").run().unwrap();
        let first = child.wait().unwrap();
        // A second waitpid on a reaped pid would fail with ECHILD.
        let second = child.wait().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.code(), Some(4));
        assert_eq!(first.pid(), child.pid());
    }

    #[test]
    fn test_signal_after_reap_is_reported() {
        let mut child = SpawnRequest::new(["true"]).run().unwrap();
        child.wait().unwrap();
        let err = child.terminate().unwrap_err();
        assert!(matches!(err, SubprocessError::ProcessGone { .. }));
    }

    #[test]
    fn test_send_signal_by_name() {
        let mut child = SpawnRequest::new(["sleep", "5"]).run().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        child.send_signal("USR1").unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGUSR1));
    }
}
