//! Process-wide initialization.
//!
//! Constructing the first [`Connection`](crate::Connection) restores the
//! default SIGINT disposition, so an interrupt terminates the process even
//! when an embedding runtime installed its own handler. This happens once
//! per process, never per session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

static INIT: Once = Once::new();
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Runs the one-time process setup. Later calls do nothing.
pub fn init() {
    INIT.call_once(|| {
        restore_default_interrupt();
        INITIALIZED.store(true, Ordering::SeqCst);
    });
}

/// Whether [`init`] has run in this process.
pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::SeqCst)
}

#[cfg(unix)]
fn restore_default_interrupt() {
    use nix::sys::signal::{signal, SigHandler, Signal};

    // SAFETY: SIG_DFL runs no handler code in signal context.
    match unsafe { signal(Signal::SIGINT, SigHandler::SigDfl) } {
        Ok(_) => tracing::debug!("restored default SIGINT handling"),
        Err(e) => tracing::warn!("failed to restore default SIGINT handling: {}", e),
    }
}

#[cfg(not(unix))]
fn restore_default_interrupt() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        assert!(is_initialized());
        init();
        assert!(is_initialized());
    }
}
