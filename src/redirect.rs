//! Per-stream redirection options and their resolution into concrete actions.

use crate::error::{Result, SubprocessError};
use crate::pipe::{ChildStderr, ChildStdout, Direction};
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd, RawFd};

/// What a caller asks for on one standard stream of the child
#[derive(Debug, Default)]
pub enum Redirect {
    /// Share the launcher's own stream
    #[default]
    Inherit,
    /// Create a pipe; the parent keeps the other end
    Pipe,
    /// Send stderr wherever stdout goes (stderr only)
    Stdout,
    /// Use an already-open descriptor
    Handle(OwnedFd),
}

impl Redirect {
    /// Bind to a caller-owned handle without taking it over.
    ///
    /// The descriptor is duplicated; the caller's handle stays open and
    /// remains the caller's to close.
    pub fn from_handle<F: AsFd>(handle: &F) -> Result<Self> {
        Ok(Redirect::Handle(handle.as_fd().try_clone_to_owned()?))
    }
}

impl From<OwnedFd> for Redirect {
    fn from(fd: OwnedFd) -> Self {
        Redirect::Handle(fd)
    }
}

impl From<File> for Redirect {
    fn from(file: File) -> Self {
        Redirect::Handle(file.into())
    }
}

impl From<ChildStdout> for Redirect {
    fn from(stdout: ChildStdout) -> Self {
        Redirect::Handle(stdout.into())
    }
}

impl From<ChildStderr> for Redirect {
    fn from(stderr: ChildStderr) -> Self {
        Redirect::Handle(stderr.into())
    }
}

/// One of the child's three standard stream slots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Stdin,
    Stdout,
    Stderr,
}

impl Slot {
    /// The well-known descriptor number of the slot
    pub fn fd(self) -> RawFd {
        match self {
            Slot::Stdin => libc::STDIN_FILENO,
            Slot::Stdout => libc::STDOUT_FILENO,
            Slot::Stderr => libc::STDERR_FILENO,
        }
    }

    pub(crate) fn direction(self) -> Direction {
        match self {
            Slot::Stdin => Direction::ToChild,
            Slot::Stdout | Slot::Stderr => Direction::FromChild,
        }
    }
}

/// Resolved action for a single stream, decided once before launch
#[derive(Debug)]
pub enum RedirectionAction {
    Inherit,
    CreatePipe,
    MergeWithStdout,
    BindExternalHandle(OwnedFd),
}

impl RedirectionAction {
    fn resolve(slot: Slot, redirect: Redirect) -> Result<Self> {
        match redirect {
            Redirect::Inherit => Ok(RedirectionAction::Inherit),
            Redirect::Pipe => Ok(RedirectionAction::CreatePipe),
            Redirect::Handle(fd) => Ok(RedirectionAction::BindExternalHandle(fd)),
            Redirect::Stdout if slot == Slot::Stderr => Ok(RedirectionAction::MergeWithStdout),
            Redirect::Stdout => Err(SubprocessError::InvalidConfig(format!(
                "{:?} cannot be merged into stdout",
                slot
            ))),
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, RedirectionAction::CreatePipe)
    }
}

/// The three resolved actions of a spawn request
#[derive(Debug)]
pub struct ResolvedStreams {
    pub stdin: RedirectionAction,
    pub stdout: RedirectionAction,
    pub stderr: RedirectionAction,
}

/// Turn the three option values into actions, rejecting invalid combinations
pub fn resolve(stdin: Redirect, stdout: Redirect, stderr: Redirect) -> Result<ResolvedStreams> {
    Ok(ResolvedStreams {
        stdin: RedirectionAction::resolve(Slot::Stdin, stdin)?,
        stdout: RedirectionAction::resolve(Slot::Stdout, stdout)?,
        stderr: RedirectionAction::resolve(Slot::Stderr, stderr)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_defaults_inherit() {
        let streams = resolve(Redirect::default(), Redirect::default(), Redirect::default()).unwrap();
        assert!(matches!(streams.stdin, RedirectionAction::Inherit));
        assert!(matches!(streams.stdout, RedirectionAction::Inherit));
        assert!(matches!(streams.stderr, RedirectionAction::Inherit));
    }

    #[test]
    fn test_pipe_and_merge() {
        let streams = resolve(Redirect::Pipe, Redirect::Pipe, Redirect::Stdout).unwrap();
        assert!(streams.stdin.is_pipe());
        assert!(streams.stdout.is_pipe());
        assert!(matches!(streams.stderr, RedirectionAction::MergeWithStdout));
    }

    #[test]
    fn test_merge_rejected_outside_stderr() {
        let err = resolve(Redirect::Stdout, Redirect::Inherit, Redirect::Inherit).unwrap_err();
        assert!(matches!(err, SubprocessError::InvalidConfig(_)));

        let err = resolve(Redirect::Inherit, Redirect::Stdout, Redirect::Inherit).unwrap_err();
        assert!(matches!(err, SubprocessError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_handle_keeps_caller_handle_open() {
        let file = tempfile::tempfile().unwrap();
        let redirect = Redirect::from_handle(&file).unwrap();
        match redirect {
            Redirect::Handle(fd) => assert_ne!(fd.as_raw_fd(), file.as_raw_fd()),
            other => panic!("unexpected redirect: {:?}", other),
        }
        // The original is still usable after the duplicate is dropped.
        assert!(file.metadata().is_ok());
    }

    #[test]
    fn test_slot_numbers() {
        assert_eq!(Slot::Stdin.fd(), 0);
        assert_eq!(Slot::Stdout.fd(), 1);
        assert_eq!(Slot::Stderr.fd(), 2);
        assert_eq!(Slot::Stdin.direction(), Direction::ToChild);
        assert_eq!(Slot::Stderr.direction(), Direction::FromChild);
    }
}
