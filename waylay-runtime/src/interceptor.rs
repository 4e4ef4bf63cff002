//! Interceptor registry.
//!
//! Interceptors are registered once, process-wide, and never unregistered;
//! registration order is significant (the dispatcher runs Pre in reverse
//! registration order and Post forward, giving stack discipline). After
//! startup the list is effectively immutable — dispatch takes a snapshot
//! under the lock and iterates lock-free.

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use crate::functab::FuncInfo;
use crate::object::{Object, Results, TrapError};

/// Opaque per-call state threaded from an interceptor's Pre to its
/// matching Post.
pub type Data = Box<dyn Any + Send>;

/// Outcome of a Pre/Post callback that does not continue the chain.
pub enum InterceptError {
    /// Sentinel: suppress the original body and run the Post chain from
    /// this interceptor forward. Not a real error.
    Abort,
    /// Real failure: routed into the function's error result if it has
    /// one, otherwise raised as an unrecoverable fault.
    Fail(TrapError),
}

impl InterceptError {
    pub fn fail(err: impl Into<TrapError>) -> Self {
        InterceptError::Fail(err.into())
    }
}

impl fmt::Debug for InterceptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptError::Abort => f.write_str("Abort"),
            InterceptError::Fail(e) => write!(f, "Fail({e})"),
        }
    }
}

/// One intercepted call as seen by an interceptor.
pub struct Call<'c> {
    pub info: &'static FuncInfo,
    pub args: Object<'c>,
    pub results: Results<'c>,
}

/// A Pre/Post callback pair. Both default to no-ops so an interceptor can
/// implement only the side it cares about.
pub trait Interceptor: Send + Sync {
    fn pre(&self, _call: &mut Call<'_>) -> Result<Option<Data>, InterceptError> {
        Ok(None)
    }

    fn post(&self, _call: &mut Call<'_>, _data: Option<Data>) -> Result<(), InterceptError> {
        Ok(())
    }
}

fn registry() -> &'static Mutex<Vec<Arc<dyn Interceptor>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Arc<dyn Interceptor>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register an interceptor for every instrumented call in the process.
/// Interceptors cannot be unregistered; order of registration matters.
pub fn register(interceptor: Arc<dyn Interceptor>) {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .push(interceptor);
}

pub fn interceptor_count() -> usize {
    registry().lock().unwrap_or_else(|e| e.into_inner()).len()
}

/// Snapshot in registration order.
pub(crate) fn snapshot() -> Vec<Arc<dyn Interceptor>> {
    registry().lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Test support: drop every registered interceptor so test cases can
/// isolate their own chains. Never call this from production code — the
/// registry is append-only by contract.
#[doc(hidden)]
pub fn clear_interceptors() {
    registry()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}
