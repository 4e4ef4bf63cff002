//! Link targets.
//!
//! A handful of well-known names in instrumented code are rewired at
//! rewrite time to these implementations, giving user-visible stubs a
//! real runtime behind them without a dependency edge at the source
//! level. The set is closed: `task_id`, `for_each_func`, and
//! `on_task_exit`.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

pub use crate::functab::for_each_func;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

struct TaskState {
    id: u64,
    exit_hooks: Vec<Box<dyn FnOnce(u64)>>,
}

impl Drop for TaskState {
    fn drop(&mut self) {
        for hook in self.exit_hooks.drain(..) {
            hook(self.id);
        }
    }
}

thread_local! {
    static TASK: RefCell<TaskState> = RefCell::new(TaskState {
        id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
        exit_hooks: Vec::new(),
    });
}

/// Stable identifier for the calling task. Ids are unique for the
/// lifetime of the process and never reused.
pub fn task_id() -> u64 {
    TASK.with(|t| t.borrow().id)
}

/// Run `hook` when the calling task exits, passing its id. Hooks run in
/// registration order during thread teardown; a hook registered while
/// another is already running is dropped silently, as the thread-local
/// state is gone by then.
pub fn on_task_exit(hook: impl FnOnce(u64) + 'static) {
    let _ = TASK.try_with(|t| t.borrow_mut().exit_hooks.push(Box::new(hook)));
}
