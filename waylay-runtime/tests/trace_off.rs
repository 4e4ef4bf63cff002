//! `WAYLAY_TRACE_OUTPUT=off` must keep the recorder out of the registry.
//!
//! Lives in its own binary: the recorder registers through a process-wide
//! `Once`, so the environment has to be set before the first
//! `enable_trace` call in the process.

use waylay_runtime::{enable_trace, interceptor_count};

#[test]
fn off_registers_nothing() {
    std::env::set_var("WAYLAY_TRACE_OUTPUT", "off");
    enable_trace();
    enable_trace();
    assert_eq!(interceptor_count(), 0);
}
