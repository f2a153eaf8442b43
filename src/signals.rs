//! Signal-driven shutdown
//!
//! SIGINT and SIGTERM set a process-wide flag; the handler does nothing
//! else. Handlers are installed without `SA_RESTART` so a blocking
//! `sem_wait` returns `EINTR`, giving the server loop a chance to observe
//! the flag and take the same cleanup path as a protocol-level shutdown.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::BridgeError;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGINT and SIGTERM handlers. Safe to call more than once.
pub fn install() -> Result<(), BridgeError> {
    for signum in [libc::SIGINT, libc::SIGTERM] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
        }
        // No SA_RESTART: semaphore waits must come back with EINTR.
        action.sa_flags = 0;

        if unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) } != 0 {
            return Err(BridgeError::ResourceSetup {
                resource: format!("signal handler for signal {signum}"),
                source: io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

/// Whether a termination signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Reset the flag. Intended for tests that simulate signal delivery.
pub fn reset() {
    SHUTDOWN.store(false, Ordering::SeqCst);
}
