//! Termination signals received by the `subproc` binary, recorded in atomic
//! flags so the wait loop can forward them to the child.

use crate::error::{Result, SubprocessError};
use crate::process::Process;
use nix::sys::signal::{SigSet, Signal, SIGCHLD, SIGHUP, SIGINT, SIGTERM};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Signal flags that can be checked by the wait loop
#[derive(Clone)]
pub struct SignalFlags {
    pub sigterm_received: Arc<AtomicBool>,
    pub sigint_received: Arc<AtomicBool>,
    pub sighup_received: Arc<AtomicBool>,
    /// Set on SIGCHLD; only there to interrupt a blocking wait
    pub sigchld_received: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Create a new set of signal flags
    pub fn new() -> Self {
        Self {
            sigterm_received: Arc::new(AtomicBool::new(false)),
            sigint_received: Arc::new(AtomicBool::new(false)),
            sighup_received: Arc::new(AtomicBool::new(false)),
            sigchld_received: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals the wait loop keeps blocked outside `pselect`
    pub fn watched() -> SigSet {
        let mut set = SigSet::empty();
        for signal in [SIGTERM, SIGINT, SIGHUP, SIGCHLD] {
            set.add(signal);
        }
        set
    }

    /// Take the next pending termination signal, clearing its flag
    pub fn take_term_signal(&self) -> Option<Signal> {
        if self.sigterm_received.swap(false, Ordering::SeqCst) {
            Some(SIGTERM)
        } else if self.sigint_received.swap(false, Ordering::SeqCst) {
            Some(SIGINT)
        } else if self.sighup_received.swap(false, Ordering::SeqCst) {
            Some(SIGHUP)
        } else {
            None
        }
    }

    /// Forward every pending termination signal to `child`.
    ///
    /// Must be called from the thread that reaps `child`, so a signal is
    /// never sent to a pid that has already been reaped.
    pub fn forward_to(&self, child: &Process) -> Result<()> {
        while let Some(signal) = self.take_term_signal() {
            tracing::debug!(pid = %child.pid(), signal = signal.as_str(), "forwarding signal to child");
            match child.signal(signal) {
                // Already exited; the status will tell.
                Err(SubprocessError::ProcessGone { .. }) => {}
                other => other?,
            }
        }
        Ok(())
    }
}

impl Default for SignalFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Set up signal handlers for the binary
///
/// The handlers only set atomic flags; the wait loop decides what to do.
pub fn setup_signal_handlers() -> Result<SignalFlags> {
    use signal_hook::consts;
    use signal_hook::flag;

    let flags = SignalFlags::new();

    for (signum, slot, name) in [
        (consts::SIGTERM, &flags.sigterm_received, "SIGTERM"),
        (consts::SIGINT, &flags.sigint_received, "SIGINT"),
        (consts::SIGHUP, &flags.sighup_received, "SIGHUP"),
        (consts::SIGCHLD, &flags.sigchld_received, "SIGCHLD"),
    ] {
        flag::register(signum, Arc::clone(slot)).map_err(|e| {
            SubprocessError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to register {} handler: {}", name, e),
            ))
        })?;
    }

    Ok(flags)
}
