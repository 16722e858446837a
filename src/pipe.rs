//! Anonymous pipes and the parent-side ends handed out by [`Process`](crate::Process).

use crate::error::Result;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Which way data flows through a pipe, seen from the parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Parent writes, child reads (stdin)
    ToChild,
    /// Child writes, parent reads (stdout, stderr)
    FromChild,
}

/// Both ends of a freshly created pipe, labelled by owner
#[derive(Debug)]
pub(crate) struct Pipe {
    pub parent: OwnedFd,
    pub child: OwnedFd,
}

impl Pipe {
    /// Create a close-on-exec pipe oriented for `direction`.
    ///
    /// Both ends carry `FD_CLOEXEC` so they never leak into unrelated children
    /// spawned concurrently; `dup2` in the child clears the flag on the copy
    /// that lands on the standard slot.
    pub(crate) fn new(direction: Direction) -> Result<Self> {
        let (read_end, write_end) = raw_pipe()?;
        let pipe = match direction {
            Direction::ToChild => Pipe {
                parent: write_end,
                child: read_end,
            },
            Direction::FromChild => Pipe {
                parent: read_end,
                child: write_end,
            },
        };
        tracing::trace!(
            ?direction,
            parent = pipe.parent.as_raw_fd(),
            child = pipe.child.as_raw_fd(),
            "created pipe"
        );
        Ok(pipe)
    }
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn raw_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::OFlag;

    let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn raw_pipe() -> Result<(OwnedFd, OwnedFd)> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let (read_fd, write_fd) = nix::unistd::pipe()?;
    // SAFETY: pipe just returned these descriptors and nothing else owns them.
    let ends = unsafe { (OwnedFd::from_raw_fd(read_fd), OwnedFd::from_raw_fd(write_fd)) };
    fcntl(read_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    fcntl(write_fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    Ok(ends)
}

macro_rules! parent_end {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name(File);

        impl $name {
            pub(crate) fn from_owned(fd: OwnedFd) -> Self {
                Self(File::from(fd))
            }
        }

        impl AsFd for $name {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.0.as_fd()
            }
        }

        impl AsRawFd for $name {
            fn as_raw_fd(&self) -> RawFd {
                self.0.as_raw_fd()
            }
        }

        impl From<$name> for OwnedFd {
            fn from(end: $name) -> OwnedFd {
                end.0.into()
            }
        }
    };
}

parent_end!(
    /// Parent's writing end of the child's stdin pipe
    ChildStdin
);
parent_end!(
    /// Parent's reading end of the child's stdout pipe
    ChildStdout
);
parent_end!(
    /// Parent's reading end of the child's stderr pipe
    ChildStderr
);

impl Write for ChildStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Read for ChildStdout {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for ChildStderr {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    fn is_cloexec(fd: RawFd) -> bool {
        let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
        FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC)
    }

    #[test]
    fn test_pipe_to_child_orientation() {
        let pipe = Pipe::new(Direction::ToChild).unwrap();
        let mut parent = ChildStdin::from_owned(pipe.parent);
        let mut child = File::from(pipe.child);

        parent.write_all(b"ping").unwrap();
        drop(parent);

        let mut received = String::new();
        child.read_to_string(&mut received).unwrap();
        assert_eq!(received, "ping");
    }

    #[test]
    fn test_pipe_from_child_orientation() {
        let pipe = Pipe::new(Direction::FromChild).unwrap();
        let mut child = File::from(pipe.child);
        let mut parent = ChildStdout::from_owned(pipe.parent);

        child.write_all(b"pong").unwrap();
        drop(child);

        let mut received = Vec::new();
        parent.read_to_end(&mut received).unwrap();
        assert_eq!(received, b"pong");
    }

    #[test]
    fn test_pipe_ends_are_cloexec() {
        let pipe = Pipe::new(Direction::FromChild).unwrap();
        assert!(is_cloexec(pipe.parent.as_raw_fd()));
        assert!(is_cloexec(pipe.child.as_raw_fd()));
    }
}
