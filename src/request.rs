//! Spawn requests: what to launch, how to wire it, and the entry points that
//! launch it.

use crate::error::{Result, SubprocessError};
use crate::launch;
use crate::process::Process;
use crate::redirect::{self, Redirect, RedirectionAction, ResolvedStreams};
use crate::status::ExitStatus;
use std::path::PathBuf;

const DEFAULT_SHELL: &str = "/bin/sh";

/// The two accepted command forms
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A single command line, interpreted by `/bin/sh -c`
    Line(String),
    /// Program followed by its arguments, already split
    Argv(Vec<String>),
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        Command::Line(line.to_string())
    }
}

impl From<String> for Command {
    fn from(line: String) -> Self {
        Command::Line(line)
    }
}

impl From<Vec<String>> for Command {
    fn from(argv: Vec<String>) -> Self {
        Command::Argv(argv)
    }
}

impl From<&[&str]> for Command {
    fn from(argv: &[&str]) -> Self {
        Command::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for Command {
    fn from(argv: [&str; N]) -> Self {
        Command::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// Description of a process to launch.
///
/// Built with chained setters and consumed by [`run`](SpawnRequest::run) or
/// one of the convenience entry points:
///
/// ```no_run
/// use subproc::{Redirect, SpawnRequest};
///
/// let (out, err) = SpawnRequest::new(["sort"])
///     .stdin(Redirect::Pipe)
///     .stdout(Redirect::Pipe)
///     .communicate(Some(b"foo\nbar\n"))?;
/// assert_eq!(out.as_deref(), Some(&b"bar\nfoo\n"[..]));
/// assert!(err.is_none());
/// # Ok::<(), subproc::SubprocessError>(())
/// ```
#[derive(Debug)]
pub struct SpawnRequest {
    command: Command,
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
    executable: Option<PathBuf>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    env_clear: bool,
    close_fds: bool,
    shell: bool,
}

/// A request after validation: concrete program, argv and stream actions
#[derive(Debug)]
pub(crate) struct ResolvedRequest {
    pub program: PathBuf,
    pub argv: Vec<String>,
    pub streams: ResolvedStreams,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub env_clear: bool,
    pub close_fds: bool,
}

impl SpawnRequest {
    pub fn new(command: impl Into<Command>) -> Self {
        Self {
            command: command.into(),
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
            executable: None,
            cwd: None,
            env: Vec::new(),
            env_clear: false,
            close_fds: false,
            shell: false,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn stdin(mut self, redirect: impl Into<Redirect>) -> Self {
        self.stdin = redirect.into();
        self
    }

    pub fn stdout(mut self, redirect: impl Into<Redirect>) -> Self {
        self.stdout = redirect.into();
        self
    }

    pub fn stderr(mut self, redirect: impl Into<Redirect>) -> Self {
        self.stderr = redirect.into();
        self
    }

    /// Execute this program instead of the one the command names.
    ///
    /// For an argv command the original first element is still passed as
    /// `argv[0]`; for a command line it replaces `/bin/sh` as interpreter.
    pub fn executable(mut self, path: impl Into<PathBuf>) -> Self {
        self.executable = Some(path.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Override one environment variable in the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Start the child from an empty environment instead of inheriting ours
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Close every inherited descriptor above stderr in the child
    pub fn close_fds(mut self, close: bool) -> Self {
        self.close_fds = close;
        self
    }

    /// Request the shell-inheriting convenience mode. Not supported: a request
    /// with this set fails when launched.
    pub fn shell(mut self, shell: bool) -> Self {
        self.shell = shell;
        self
    }

    pub(crate) fn resolve(self) -> Result<ResolvedRequest> {
        if self.shell {
            return Err(SubprocessError::Unimplemented("shell-inheriting mode"));
        }

        let (program, argv) = match self.command {
            Command::Line(line) => {
                let shell = self
                    .executable
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
                let argv0 = shell.to_string_lossy().into_owned();
                (shell, vec![argv0, "-c".to_string(), line])
            }
            Command::Argv(argv) => {
                let first = argv.first().ok_or_else(|| {
                    SubprocessError::InvalidConfig("empty argument list".to_string())
                })?;
                let program = self
                    .executable
                    .unwrap_or_else(|| PathBuf::from(first));
                (program, argv)
            }
        };

        let streams = redirect::resolve(self.stdin, self.stdout, self.stderr)?;

        Ok(ResolvedRequest {
            program,
            argv,
            streams,
            cwd: self.cwd,
            env: self.env,
            env_clear: self.env_clear,
            close_fds: self.close_fds,
        })
    }

    /// Launch the child and return its handle without waiting
    pub fn run(self) -> Result<Process> {
        launch::spawn(self.resolve()?)
    }

    /// Launch and wait for termination
    pub fn call(self) -> Result<ExitStatus> {
        self.run()?.wait()
    }

    /// Launch and wait; an unsuccessful status becomes
    /// [`SubprocessError::CalledProcess`]
    pub fn check_call(self) -> Result<ExitStatus> {
        let status = self.call()?;
        if !status.success() {
            return Err(SubprocessError::CalledProcess(status));
        }
        Ok(status)
    }

    /// Launch, hand the live process to `body`, then reap it if `body` did not.
    ///
    /// The child is reaped even when `body` fails or panics.
    pub fn start<R, F>(self, body: F) -> Result<(R, ExitStatus)>
    where
        F: FnOnce(&mut Process) -> Result<R>,
    {
        let mut process = self.run()?;
        let guard = ReapGuard(&mut process);
        let value = body(&mut *guard.0);
        let status = guard.0.wait();
        drop(guard);
        Ok((value?, status?))
    }

    /// Launch, exchange data with the child, and wait.
    ///
    /// Input errors are detected before anything is spawned.
    pub fn communicate(self, input: Option<&[u8]>) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let resolved = self.resolve()?;
        let writable = matches!(
            resolved.streams.stdin,
            RedirectionAction::CreatePipe | RedirectionAction::BindExternalHandle(_)
        );
        if input.is_some() && !writable {
            return Err(SubprocessError::InvalidConfig(
                "input supplied but the child has no writable or bound stdin".to_string(),
            ));
        }
        let mut process = launch::spawn(resolved)?;
        process.communicate(input)
    }
}

/// Reaps the child if it is still unreaped when dropped (panic unwinding
/// included).
struct ReapGuard<'a>(&'a mut Process);

impl Drop for ReapGuard<'_> {
    fn drop(&mut self) {
        if self.0.status().is_none() {
            if let Err(e) = self.0.wait() {
                tracing::warn!(pid = %self.0.pid(), error = %e, "failed to reap child");
            }
        }
    }
}
