//! Runtime trap dispatcher.
//!
//! Every instrumented function begins with a call to [`trap_entry`] and,
//! when it returns an [`AfterHook`], finishes with a call to
//! [`trap_exit`]. The entry half resolves the call's metadata, builds the
//! argument/result views, and runs every registered interceptor's Pre in
//! reverse registration order; the exit half runs Post forward. The most
//! recently registered interceptor is logically innermost: it sees the
//! call first on entry and last on exit.
//!
//! Internal faults (guard contention, unknown metadata) never reach the
//! instrumented program — they degrade to "don't intercept". Interceptor
//! failures either land in the function's error result or, when the
//! function has no error slot, become an unrecoverable fault: there is no
//! other channel to report them to the caller.

use std::sync::Arc;

use crate::functab::{info_by_addr, info_by_name, FuncInfo};
use crate::guard;
use crate::interceptor::{snapshot, Call, Data, InterceptError, Interceptor};
use crate::object::{object_from_slots, Field, Object, Results, Slot};

/// Explicit skip marker. A function whose first statement calls this is
/// classified as never-trap; the call itself does nothing at runtime.
pub fn skip() {}

/// Token returned by [`trap_entry`] when at least one Post remains to run.
/// The rewritten function passes it back through [`trap_exit`] after the
/// original body finishes.
pub struct AfterHook {
    interceptors: Vec<Arc<dyn Interceptor>>,
    data: Vec<Option<Data>>,
    info: &'static FuncInfo,
}

/// Carries the [`AfterHook`] across the original body so the Post chain is
/// delivered exactly once, even when the body panics or an async body is
/// dropped mid-flight.
///
/// The normal path takes the hook back out and calls [`trap_exit`] with
/// live result views. If the guard is dropped still armed, it delivers the
/// exit itself with name-only views built from the registered metadata —
/// argument and result values are gone once the stack is unwinding.
pub struct AfterGuard(Option<AfterHook>);

impl AfterGuard {
    pub fn new(hook: Option<AfterHook>) -> Self {
        AfterGuard(hook)
    }

    /// Disarm the guard, handing the hook to the caller for the normal
    /// exit path.
    pub fn take(&mut self) -> Option<AfterHook> {
        self.0.take()
    }
}

impl Drop for AfterGuard {
    fn drop(&mut self) {
        let Some(hook) = self.0.take() else { return };
        let info = hook.info;
        let recv = match &info.recv_name {
            Some(name) => Slot::absent_named(name.as_str()),
            None => Slot::absent(),
        };
        let mut args: Vec<Slot<'_>> = info
            .arg_names
            .iter()
            .map(|n| Slot::absent_named(n.as_str()))
            .collect();
        let mut results: Vec<Slot<'_>> = info
            .res_names
            .iter()
            .map(|n| Slot::absent_named(n.as_str()))
            .collect();
        trap_exit(hook, recv, &mut args, &mut results);
    }
}

fn resolve(
    pkg_path: &str,
    identity_name: &str,
    generic: bool,
    addr: Option<usize>,
) -> Option<&'static FuncInfo> {
    if !generic {
        if let Some(info) = addr.and_then(info_by_addr) {
            return Some(info);
        }
    }
    info_by_name(pkg_path, identity_name)
}

/// Assemble the argument and result views for one call.
///
/// The receiver field is included only when the metadata says the function
/// has one; a context-typed first argument is elided from the view; when
/// the last result is error-typed, the trailing result slot becomes the
/// error field of the error-aware variant.
fn build_call<'c>(
    info: &'static FuncInfo,
    recv: &'c mut Slot<'_>,
    args: &'c mut [Slot<'_>],
    results: &'c mut [Slot<'_>],
) -> Call<'c> {
    let mut arg_fields: Vec<Field<'c>> = Vec::with_capacity(args.len() + 1);
    if info.has_recv {
        arg_fields.push(Field::from_slot(recv));
    }
    let skip_first = usize::from(info.first_arg_ctx);
    for slot in args.iter_mut().skip(skip_first) {
        arg_fields.push(Field::from_slot(slot));
    }

    let results = if info.last_result_err && !results.is_empty() {
        let (value_slots, err_slot) = results.split_at_mut(results.len() - 1);
        Results::new(
            object_from_slots(value_slots),
            Some(Field::from_slot(&mut err_slot[0])),
        )
    } else {
        Results::new(object_from_slots(results), None)
    };

    Call {
        info,
        args: Object::new(arg_fields),
        results,
    }
}

/// Route an interceptor failure: into the error result slot when the
/// function has one, otherwise an unrecoverable fault.
fn route_failure(call: &mut Call<'_>, err: crate::object::TrapError) {
    let text = err.to_string();
    if !call.results.set_err(err) {
        panic!(
            "interceptor failed for {}.{} which has no error result: {}",
            call.info.pkg_path, call.info.identity_name, text
        );
    }
}

/// Run Post for interceptors `[from, n)` in forward registration order,
/// consuming their collected data. Shared by the abort path and trap_exit.
fn run_posts(
    call: &mut Call<'_>,
    interceptors: &[Arc<dyn Interceptor>],
    data: &mut [Option<Data>],
    from: usize,
) {
    for idx in from..interceptors.len() {
        match interceptors[idx].post(call, data[idx].take()) {
            Ok(()) => {}
            Err(InterceptError::Abort) => return,
            Err(InterceptError::Fail(err)) => {
                route_failure(call, err);
                return;
            }
        }
    }
}

/// Dispatcher entry, invoked as the first statement of every instrumented
/// function.
///
/// Returns `(after, stop)`. `stop == true` means the original body must
/// not run; interceptors have already written the result slots. `after`
/// is `Some` when Post hooks remain to be delivered once the body has run.
pub fn trap_entry(
    pkg_path: &str,
    identity_name: &str,
    generic: bool,
    addr: Option<usize>,
    mut recv: Slot<'_>,
    args: &mut [Slot<'_>],
    results: &mut [Slot<'_>],
) -> (Option<AfterHook>, bool) {
    // Held only for the span of the Pre chain; a trap fired from inside
    // an interceptor sees the marker and passes through.
    let _guard = match guard::acquire() {
        Some(g) => g,
        None => return (None, false),
    };

    let interceptors = snapshot();
    let n = interceptors.len();
    if n == 0 {
        return (None, false);
    }

    let info = match resolve(pkg_path, identity_name, generic, addr) {
        Some(info) => info,
        // Unknown calls are never intercepted rather than failing.
        None => return (None, false),
    };

    let mut call = build_call(info, &mut recv, args, results);

    let mut data: Vec<Option<Data>> = (0..n).map(|_| None).collect();
    let mut abort_idx: Option<usize> = None;
    for idx in (0..n).rev() {
        match interceptors[idx].pre(&mut call) {
            Ok(d) => data[idx] = d,
            Err(InterceptError::Abort) => {
                abort_idx = Some(idx);
                break;
            }
            Err(InterceptError::Fail(err)) => {
                route_failure(&mut call, err);
                return (None, true);
            }
        }
    }

    if let Some(idx) = abort_idx {
        // Aborted: deliver Post immediately for the aborting interceptor
        // and everything whose Pre already ran, then suppress the body.
        run_posts(&mut call, &interceptors, &mut data, idx);
        return (None, true);
    }

    (
        Some(AfterHook {
            interceptors,
            data,
            info,
        }),
        false,
    )
}

/// Dispatcher exit, invoked after the original body has run.
///
/// Post runs in forward registration order — the inverse of Pre — with the
/// same abort/error handling as the entry chain. If the reentrancy marker
/// is already held (a trap fired from inside a Post), the chain is skipped
/// entirely, matching the entry semantics.
pub fn trap_exit(
    mut hook: AfterHook,
    mut recv: Slot<'_>,
    args: &mut [Slot<'_>],
    results: &mut [Slot<'_>],
) {
    let _guard = match guard::acquire() {
        Some(g) => g,
        None => return,
    };

    let mut call = build_call(hook.info, &mut recv, args, results);
    let interceptors = std::mem::take(&mut hook.interceptors);
    run_posts(&mut call, &interceptors, &mut hook.data, 0);
}
