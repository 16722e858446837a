//! Launch a child program, redirect its standard streams through pipes or
//! files, track its termination, signal it, and exchange data with it.
//!
//! ```no_run
//! use subproc::{Redirect, SpawnRequest};
//!
//! let status = subproc::call(SpawnRequest::new(["ls", "-l"]))?;
//! assert!(status.success());
//!
//! let (out, _) = SpawnRequest::new("echo hoge >&2")
//!     .stdout(Redirect::Pipe)
//!     .stderr(Redirect::Stdout)
//!     .communicate(None)?;
//! assert_eq!(out.as_deref(), Some(&b"hoge\n"[..]));
//! # Ok::<(), subproc::SubprocessError>(())
//! ```

// Platform-specific compilation guard
#[cfg(not(unix))]
compile_error!("subproc requires a Unix-like operating system with fork/exec.");

#[cfg(unix)]
pub mod cli;
#[cfg(unix)]
pub mod communicate;
#[cfg(unix)]
pub mod error;
#[cfg(unix)]
mod launch;
#[cfg(unix)]
pub mod pipe;
#[cfg(unix)]
pub mod process;
#[cfg(unix)]
pub mod redirect;
#[cfg(unix)]
pub mod request;
#[cfg(unix)]
pub mod signal_handler;
#[cfg(unix)]
pub mod status;

#[cfg(unix)]
pub use communicate::Output;
#[cfg(unix)]
pub use error::{Result, ReturnCode, SubprocessError};
#[cfg(unix)]
pub use pipe::{ChildStderr, ChildStdin, ChildStdout};
#[cfg(unix)]
pub use process::Process;
#[cfg(unix)]
pub use redirect::{Redirect, RedirectionAction};
#[cfg(unix)]
pub use request::{Command, SpawnRequest};
#[cfg(unix)]
pub use status::{ExitStatus, Termination};

/// Launch `request` without waiting
#[cfg(unix)]
pub fn run(request: SpawnRequest) -> Result<Process> {
    request.run()
}

/// Launch `request` and wait for it
#[cfg(unix)]
pub fn call(request: SpawnRequest) -> Result<ExitStatus> {
    request.call()
}

/// Launch `request`, wait, and fail with [`SubprocessError::CalledProcess`]
/// unless it succeeded
#[cfg(unix)]
pub fn check_call(request: SpawnRequest) -> Result<ExitStatus> {
    request.check_call()
}

/// Launch `request`, run `body` with the live process, and always reap it
#[cfg(unix)]
pub fn start<R, F>(request: SpawnRequest, body: F) -> Result<(R, ExitStatus)>
where
    F: FnOnce(&mut Process) -> Result<R>,
{
    request.start(body)
}
