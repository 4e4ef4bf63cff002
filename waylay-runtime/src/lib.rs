//! Runtime half of the waylay interception system.
//!
//! Instrumented builds link this crate and route every eligible function
//! through [`trap_entry`]/[`trap_exit`]. User code talks to the small
//! public surface: register an [`Interceptor`], inspect calls through the
//! [`Object`]/[`Results`] views, and optionally enable the built-in call
//! tree recorder.
//!
//! The crate is deliberately dependency-free: it is injected into user
//! builds and must never change their dependency resolution.

mod functab;
mod guard;
mod interceptor;
pub mod links;
mod object;
mod trace;
mod trap;

pub use functab::{for_each_func, info_by_addr, info_by_name, register_func, FuncInfo};
#[doc(hidden)]
pub use interceptor::clear_interceptors;
pub use interceptor::{
    interceptor_count, register, Call, Data, InterceptError, Interceptor,
};
pub use object::{Field, Object, Results, Slot, TrapError};
pub use trace::{
    enable_trace, set_trace_encoder, set_trace_output, TraceEncoder, TraceNode,
};
pub use trap::{skip, trap_entry, trap_exit, AfterGuard, AfterHook};
