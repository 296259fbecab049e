//! Signal relay
//!
//! Turns asynchronous signal delivery into two process-wide latches that
//! the event loop polls from ordinary code:
//!
//! - "cleanup pending": a child exited and must be reaped
//! - "stop requested": any other intercepted signal arrived, or
//!   [`request_stop`] was called; never cleared once set
//!
//! The handler touches nothing but these two atomics.

use mserver_common::{Error, Result};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

static CLEANUP_PENDING: AtomicBool = AtomicBool::new(false);
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Signals that stop the server unless the caller supplies another set
pub const DEFAULT_SIGNALS: [Signal; 4] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGHUP,
];

extern "C" fn relay_signal(signo: libc::c_int) {
    if signo == libc::SIGCHLD {
        CLEANUP_PENDING.store(true, Ordering::SeqCst);
    } else {
        STOP_REQUESTED.store(true, Ordering::SeqCst);
    }
}

/// Latch "stop requested" for the rest of the process lifetime
pub fn request_stop() {
    STOP_REQUESTED.store(true, Ordering::SeqCst);
}

/// Whether a stop was requested
pub fn stop_requested() -> bool {
    STOP_REQUESTED.load(Ordering::SeqCst)
}

/// Whether a child exit is waiting to be reaped
pub fn cleanup_pending() -> bool {
    CLEANUP_PENDING.load(Ordering::SeqCst)
}

/// Clear "cleanup pending" and return its previous value
pub(crate) fn take_cleanup() -> bool {
    CLEANUP_PENDING.swap(false, Ordering::SeqCst)
}

/// Set of intercepted signals plus the dispositions they replaced
#[derive(Debug, Clone)]
pub struct SignalRelay {
    signals: Vec<Signal>,
    saved: Vec<(Signal, SigAction)>,
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new(&DEFAULT_SIGNALS)
    }
}

impl SignalRelay {
    /// Create a relay for `signals`. SIGCHLD is always part of the set.
    pub fn new(signals: &[Signal]) -> Self {
        let mut relay = Self {
            signals: Vec::new(),
            saved: Vec::new(),
        };
        relay.set_signals(signals);
        relay
    }

    /// Replace the intercepted set. SIGCHLD is added back unconditionally.
    pub fn set_signals(&mut self, signals: &[Signal]) {
        self.signals = vec![Signal::SIGCHLD];
        for &sig in signals {
            if !self.signals.contains(&sig) {
                self.signals.push(sig);
            }
        }
    }

    /// Intercepted signals, SIGCHLD first
    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// Whether `install` has been called without a matching `restore`
    pub fn is_installed(&self) -> bool {
        !self.saved.is_empty()
    }

    /// Route every signal of the set to the relay handler, remembering
    /// what was there before. Installing an installed relay is a no-op.
    pub fn install(&mut self) -> Result<()> {
        if self.is_installed() {
            debug!("signal relay already installed");
            return Ok(());
        }
        let action = SigAction::new(
            SigHandler::Handler(relay_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );

        for &sig in &self.signals {
            // SAFETY: the handler only stores into atomics.
            let old = unsafe { sigaction(sig, &action) }
                .map_err(|e| Error::Signal(format!("cannot intercept {}: {}", sig, e)))?;
            self.saved.push((sig, old));
        }
        debug!("Intercepting signals {:?}", self.signals);
        Ok(())
    }

    /// Put back the dispositions captured by `install`.
    ///
    /// Takes `&self` so a freshly forked worker can drop the interception
    /// from its copy of the relay.
    pub fn restore(&self) -> Result<()> {
        for (sig, old) in &self.saved {
            // SAFETY: reinstalls a disposition previously returned by sigaction.
            unsafe { sigaction(*sig, old) }
                .map_err(|e| Error::Signal(format!("cannot restore {}: {}", sig, e)))?;
        }
        Ok(())
    }

    /// Restore and forget the saved dispositions
    pub fn uninstall(&mut self) -> Result<()> {
        self.restore()?;
        self.saved.clear();
        Ok(())
    }
}
