use crate::status::ExitStatus;
use thiserror::Error;

/// Exit codes used by the `subproc` binary for its own failures.
///
/// 126 and 127 are also what a child reports when its program image could
/// not be executed or found.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    NoError = 0,
    RuntimeError = 125,
    CannotExecute = 126,
    NotFound = 127,
}

impl ReturnCode {
    pub fn as_exit_code(self) -> i32 {
        self as i32
    }
}

/// Main error type for subprocess operations
#[derive(Error, Debug)]
pub enum SubprocessError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Not implemented: {0}")]
    Unimplemented(&'static str),

    #[error("Command returned non-zero status: {0}")]
    CalledProcess(ExitStatus),

    #[error("Process {pid} no longer exists")]
    ProcessGone { pid: i32 },

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Failed to fork process: {0}")]
    ForkError(nix::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System error: {0}")]
    SystemError(#[from] nix::Error),
}

impl SubprocessError {
    /// The status carried by a `CalledProcess` error.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        match self {
            SubprocessError::CalledProcess(status) => Some(status),
            _ => None,
        }
    }

    /// Get the exit code the binary reports for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            SubprocessError::CalledProcess(status) => status.shell_code(),
            _ => ReturnCode::RuntimeError.as_exit_code(),
        }
    }
}

/// Result type alias for subprocess operations
pub type Result<T> = std::result::Result<T, SubprocessError>;

impl From<SubprocessError> for i32 {
    fn from(error: SubprocessError) -> Self {
        error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Termination;
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    #[test]
    fn test_called_process_exit_code() {
        let status = ExitStatus::new(Pid::from_raw(42), Termination::Exited(3));
        let err = SubprocessError::CalledProcess(status);
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.exit_status(), Some(&status));
    }

    #[test]
    fn test_signaled_exit_code() {
        let status = ExitStatus::new(
            Pid::from_raw(42),
            Termination::Signaled {
                signal: Signal::SIGKILL,
                core_dumped: false,
            },
        );
        assert_eq!(SubprocessError::CalledProcess(status).exit_code(), 137);
    }

    #[test]
    fn test_config_errors_use_runtime_code() {
        let err = SubprocessError::InvalidConfig("bad".to_string());
        assert_eq!(i32::from(err), 125);
        assert!(SubprocessError::Unimplemented("shell").exit_status().is_none());
    }
}
