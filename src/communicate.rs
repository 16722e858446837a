//! Feed input to a child, collect its output, and wait for it.
//!
//! Writing stdin and draining stdout/stderr happen concurrently so a child
//! that fills one pipe while we are still filling another cannot deadlock us.

use crate::error::{Result, SubprocessError};
use crate::pipe::{ChildStderr, ChildStdin, ChildStdout};
use crate::process::Process;
use crate::status::ExitStatus;
use std::io::{self, Read, Write};
use std::thread;

/// Everything collected from a finished child
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub status: ExitStatus,
    /// `None` unless stdout was a pipe
    pub stdout: Option<Vec<u8>>,
    /// `None` unless stderr was a pipe
    pub stderr: Option<Vec<u8>>,
}

impl Output {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(self.stdout.as_deref().unwrap_or_default()).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(self.stderr.as_deref().unwrap_or_default()).into_owned()
    }

    pub fn success(&self) -> bool {
        self.status.success()
    }
}

fn write_input(mut pipe: ChildStdin, input: &[u8]) -> io::Result<()> {
    match pipe.write_all(input) {
        // The child closed its end early; whatever it did not read is dropped.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}

fn read_all<R: Read>(mut pipe: R) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    pipe.read_to_end(&mut data)?;
    Ok(data)
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, T>) -> T {
    match handle.join() {
        Ok(value) => value,
        Err(panic) => std::panic::resume_unwind(panic),
    }
}

/// Write `input` into `stdin` while reading `stdout` and `stderr` to
/// end-of-stream, all concurrently. Pipes that are `None` are skipped.
pub fn exchange(
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    input: Option<&[u8]>,
) -> io::Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
    thread::scope(|scope| {
        let writer = match (stdin, input) {
            (Some(pipe), Some(input)) => Some(scope.spawn(move || write_input(pipe, input))),
            // No input: closing stdin right away tells the child there is none.
            _ => None,
        };
        let err_reader = stderr.map(|pipe| scope.spawn(move || read_all(pipe)));

        let out_data = stdout.map(read_all).transpose();
        let err_data = err_reader.map(join).transpose();
        let written = writer.map(join).transpose();

        written?;
        Ok((out_data?, err_data?))
    })
}

impl Process {
    /// Write `input` to stdin and read stdout and stderr to end-of-stream,
    /// without waiting for the child.
    ///
    /// Consumes the parent pipe ends. Streams that were not pipes (or whose
    /// ends were already taken) come back as `None`. When stdin is bound to
    /// a handle the child reads that handle and `input` is ignored.
    pub fn drain(&mut self, input: Option<&[u8]>) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let stdin_piped = self.stdin().is_some();
        let input = match input {
            Some(data) if !stdin_piped => {
                if !self.stdin_bound() {
                    return Err(SubprocessError::InvalidConfig(
                        "input supplied but the child has no writable or bound stdin".to_string(),
                    ));
                }
                tracing::debug!(pid = %self.pid(), ignored = data.len(), "stdin is bound; ignoring input");
                None
            }
            other => other,
        };

        let stdin = self.take_stdin();
        let stdout = self.take_stdout();
        let stderr = self.take_stderr();

        let (out, err) = exchange(stdin, stdout, stderr, input)?;
        tracing::debug!(
            pid = %self.pid(),
            input = input.map_or(0, <[u8]>::len),
            stdout = out.as_ref().map_or(0, Vec::len),
            stderr = err.as_ref().map_or(0, Vec::len),
            "drained child pipes"
        );
        Ok((out, err))
    }

    /// Exchange data with the child, then wait for it to terminate.
    ///
    /// Returns the captured `(stdout, stderr)`.
    pub fn communicate(
        &mut self,
        input: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let captured = self.drain(input)?;
        self.wait()?;
        Ok(captured)
    }

    /// Like [`communicate`](Process::communicate) but also returns the status
    pub fn output(&mut self, input: Option<&[u8]>) -> Result<Output> {
        let (stdout, stderr) = self.drain(input)?;
        let status = self.wait()?;
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}
