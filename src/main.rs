use anyhow::Context;
use nix::sys::select::{pselect, FdSet};
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};
use nix::sys::time::TimeSpec;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::thread;
use subproc::cli::Cli;
use subproc::communicate::exchange;
use subproc::error::{ReturnCode, SubprocessError};
use subproc::signal_handler::{setup_signal_handlers, SignalFlags};
use subproc::{ExitStatus, Process};
use tracing_subscriber::EnvFilter;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    // Parse command line arguments
    let args = Cli::parse_args();

    init_logging(&args);

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("subproc: {}", e);
        eprintln!("Use \"subproc -h\" to get help");
        return e.exit_code();
    }

    let signal_flags = match setup_signal_handlers() {
        Ok(flags) => flags,
        Err(e) => {
            eprintln!("subproc: Failed to setup signal handlers: {}", e);
            return e.exit_code();
        }
    };

    match run_program(&args, &signal_flags) {
        Ok(status) => {
            tracing::debug!(%status, "child finished");
            status.shell_code()
        }
        Err(e) => {
            eprintln!("subproc: {:#}", e);
            e.downcast_ref::<SubprocessError>()
                .map(SubprocessError::exit_code)
                .unwrap_or(ReturnCode::RuntimeError.as_exit_code())
        }
    }
}

/// Log filter comes from SUBPROC_LOG, else from the -v count
fn init_logging(args: &Cli) {
    let filter = EnvFilter::try_from_env("SUBPROC_LOG")
        .unwrap_or_else(|_| EnvFilter::new(args.log_level()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Launch the command, pump its pipes and wait for it
fn run_program(args: &Cli, signal_flags: &SignalFlags) -> anyhow::Result<ExitStatus> {
    let request = args
        .build_request()
        .context("failed to set up redirections")?;
    let mut child = request.run().context("failed to launch command")?;

    tracing::debug!(pid = %child.pid(), command = ?args.command, "command started");

    let input = args.input.as_deref().map(str::as_bytes);
    let stdin = child.take_stdin();
    let stdout = child.take_stdout();
    let stderr = child.take_stderr();

    // Blocked before the pump thread exists so it inherits the mask and the
    // watched signals are only ever taken by this thread inside pselect.
    let mut old_mask = SigSet::empty();
    pthread_sigmask(
        SigmaskHow::SIG_BLOCK,
        Some(&SignalFlags::watched()),
        Some(&mut old_mask),
    )?;

    // Pipes are pumped on a helper thread; this thread owns reaping, so
    // forwarded signals never reach a pid after it has been reaped.
    let outcome = thread::scope(|scope| {
        let pump = scope.spawn(move || exchange(stdin, stdout, stderr, input));
        let status = wait_forwarding_signals(&mut child, signal_flags)
            .map_err(|e| abandon(&mut child, e))?;
        let captured = pump
            .join()
            .map_err(|_| anyhow::anyhow!("pipe pump thread panicked"))?;
        anyhow::Ok((status, captured.context("failed to exchange data with command")?))
    });
    pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None)?;
    let (status, captured) = outcome?;

    let (out, err) = captured;
    if let Some(out) = out {
        std::io::stdout().write_all(&out)?;
        std::io::stdout().flush()?;
    }
    if let Some(err) = err {
        std::io::stderr().write_all(&err)?;
    }

    if args.check && !status.success() {
        return Err(SubprocessError::CalledProcess(status).into());
    }
    Ok(status)
}

/// Wait for the child to exit, forwarding termination signals meanwhile.
///
/// Expects `SignalFlags::watched()` to be blocked; they are let through only
/// while suspended in `pselect`, so none can slip in between the checks
/// and the wait.
fn wait_forwarding_signals(
    child: &mut Process,
    signal_flags: &SignalFlags,
) -> anyhow::Result<ExitStatus> {
    let unblocked = SigSet::empty();
    loop {
        signal_flags.forward_to(child)?;

        signal_flags.sigchld_received.store(false, Ordering::SeqCst);
        if let Some(status) = child.poll()? {
            return Ok(status);
        }

        match pselect(
            0,
            None::<&mut FdSet>,
            None::<&mut FdSet>,
            None::<&mut FdSet>,
            None::<&TimeSpec>,
            Some(&unblocked),
        ) {
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(anyhow::anyhow!("pselect error: {}", e)),
        }
    }
}

/// Kill and reap the child so the pump thread sees end-of-stream, then
/// hand back the error that stopped the wait loop.
fn abandon(child: &mut Process, error: anyhow::Error) -> anyhow::Error {
    tracing::warn!(pid = %child.pid(), error = %error, "giving up on child, killing it");
    if let Err(e) = child.kill() {
        tracing::warn!(pid = %child.pid(), error = %e, "failed to kill child");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid = %child.pid(), error = %e, "failed to reap child");
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;
    use std::io::Read;
    use subproc::{Redirect, SpawnRequest};

    #[test]
    fn test_abandon_kills_and_reaps() {
        let mut child = SpawnRequest::new(["sleep", "5"])
            .stdout(Redirect::Pipe)
            .run()
            .unwrap();
        let mut stdout = child.take_stdout().unwrap();

        let error = abandon(&mut child, anyhow::anyhow!("kill failed"));
        assert_eq!(error.to_string(), "kill failed");
        assert_eq!(child.status().unwrap().signal(), Some(Signal::SIGKILL));

        // The pump would see end-of-stream now
        let mut rest = Vec::new();
        stdout.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }
}
