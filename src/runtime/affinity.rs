//! Best-effort CPU pinning for the hot-loop and housekeeping threads.

/// Outcome of a pinning attempt, kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinReport {
    pub core: usize,
    pub applied: bool,
}

/// Pins the calling thread to `core`. Returns whether the kernel accepted
/// the mask; callers treat failure as a performance concern, not an error.
#[cfg(target_os = "linux")]
pub fn pin_thread(core: usize) -> PinReport {
    let applied = unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core, &mut cpuset);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &cpuset) == 0
    };
    PinReport { core, applied }
}

#[cfg(not(target_os = "linux"))]
pub fn pin_thread(core: usize) -> PinReport {
    PinReport {
        core,
        applied: false,
    }
}
