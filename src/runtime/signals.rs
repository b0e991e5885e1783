//! Graceful-shutdown flag and SIGINT wiring. The first interrupt clears
//! the flag for a drain; the second aborts.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Relaxed-atomic stop flag polled by the run thread.
#[derive(Clone, Default)]
pub struct RunFlag {
    running: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set(&self) {
        self.running.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

static SIGINT_FLAG: OnceLock<RunFlag> = OnceLock::new();
static SIGINT_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn on_sigint(_sig: i32) {
    let count = SIGINT_COUNT.fetch_add(1, Ordering::Relaxed);
    if count == 0 {
        if let Some(flag) = SIGINT_FLAG.get() {
            flag.clear();
        }
    } else {
        unsafe { libc::abort() };
    }
}

/// Installs the SIGINT handler against the given flag. The handler only
/// touches an atomic; installation is idempotent for the process.
pub fn install_sigint(flag: &RunFlag) {
    let _ = SIGINT_FLAG.set(flag.clone());
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as *const () as libc::sighandler_t);
    }
}
