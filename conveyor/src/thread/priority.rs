//! Applying [`Priority`] to OS threads.
//!
//! An unprivileged process may raise a thread's nice value but not lower it
//! again. A pool thread whose nice value could not be restored after a run is
//! flagged, and the pool replaces it instead of handing it to the next actor.

use std::cell::Cell;

use conveyor_api::Priority;

thread_local! {
    static ALTERED: Cell<bool> = const { Cell::new(false) };
}

/// Kernel identity of a pool thread, used to re-prioritise it from elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OsThread {
    #[cfg(target_os = "linux")]
    tid: libc::pid_t,
    /// Nice value the thread had when it was captured.
    #[cfg(target_os = "linux")]
    base: libc::c_int,
}

impl OsThread {
    #[cfg(target_os = "linux")]
    pub(crate) fn current() -> Self {
        let tid = unsafe { libc::gettid() };
        OsThread {
            tid,
            base: nice_of(tid).unwrap_or(0),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(crate) fn current() -> Self {
        OsThread {}
    }

    /// Sets the nice value of this thread. Failures are logged and ignored.
    pub(crate) fn apply(&self, priority: Priority) -> bool {
        self.set_nice(priority)
    }

    /// Puts the thread back to the nice value it was captured with. On
    /// failure the calling thread is flagged, see [`take_altered`].
    pub(crate) fn restore(&self) -> bool {
        let restored = self.reset();
        if !restored {
            ALTERED.with(|altered| altered.set(true));
        }
        restored
    }

    #[cfg(target_os = "linux")]
    fn set_nice(&self, priority: Priority) -> bool {
        let ok = self.renice(priority.nice());
        if !ok {
            tracing::debug!(
                tid = self.tid,
                ?priority,
                error = %std::io::Error::last_os_error(),
                "could not apply thread priority"
            );
        }
        ok
    }

    #[cfg(target_os = "linux")]
    fn reset(&self) -> bool {
        self.renice(self.base) || nice_of(self.tid) == Some(self.base)
    }

    #[cfg(target_os = "linux")]
    fn renice(&self, nice: libc::c_int) -> bool {
        unsafe { libc::setpriority(libc::PRIO_PROCESS, self.tid as libc::id_t, nice) == 0 }
    }

    #[cfg(not(target_os = "linux"))]
    fn set_nice(&self, priority: Priority) -> bool {
        tracing::trace!(?priority, "thread priorities are not supported on this platform");
        true
    }

    #[cfg(not(target_os = "linux"))]
    fn reset(&self) -> bool {
        true
    }
}

#[cfg(target_os = "linux")]
fn nice_of(tid: libc::pid_t) -> Option<libc::c_int> {
    // -1 is a valid nice value, so errno tells failures apart.
    unsafe { *libc::__errno_location() = 0 };
    let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t) };
    if nice == -1 && std::io::Error::last_os_error().raw_os_error() != Some(0) {
        None
    } else {
        Some(nice)
    }
}

/// Whether a run left the calling thread at a nice value it could not undo.
/// Clears the flag.
pub(crate) fn take_altered() -> bool {
    ALTERED.with(|altered| altered.replace(false))
}

#[cfg(test)]
pub(crate) fn mark_altered() {
    ALTERED.with(|altered| altered.set(true));
}
