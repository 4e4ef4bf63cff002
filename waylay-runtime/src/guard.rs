//! Reentrancy guard.
//!
//! A thread of control holds at most one marker while dispatch logic runs;
//! any trap fired from inside that window (an interceptor calling another
//! instrumented function, or the dispatcher's own machinery) sees the
//! marker and executes un-intercepted. Only the zero-to-one transition
//! matters, so the marker is a per-thread boolean rather than a depth
//! counter. The RAII guard releases on every exit path, panics included.

use std::cell::Cell;

thread_local! {
    static TRAPPING: Cell<bool> = Cell::new(false);
}

pub(crate) struct ReentryGuard {
    _private: (),
}

/// Acquire the marker for the current thread of control. `None` means it
/// is already held and the caller must pass through without dispatching.
pub(crate) fn acquire() -> Option<ReentryGuard> {
    TRAPPING.with(|flag| {
        if flag.get() {
            None
        } else {
            flag.set(true);
            Some(ReentryGuard { _private: () })
        }
    })
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        TRAPPING.with(|flag| flag.set(false));
    }
}
