//! Structured logging taps (ambient, not a protocol feature).
//!
//! The control-flow engine this crate is modeled on emits a `RuntimeEvent` at
//! each state transition for its own operators to consume; this crate has no
//! equivalent audience inside the process, so it emits through `tracing`
//! directly at the call sites in `tree.rs`, `composite.rs`, and
//! `protocol.rs` rather than threading a bespoke event enum through every
//! layer. This module just holds the few named spans/targets shared across
//! those call sites so their field names stay consistent.

/// Target string used for every span this crate opens, so an embedder's
/// `tracing-subscriber` filter can isolate this crate's output with
/// `mdm_core=debug` regardless of which module emitted it.
pub const TARGET: &str = "mdm_core";

/// Open a span for one dispatched `handle()` call, tagged with the request id
/// and operation name. Kept as a helper rather than inlined at the call site
/// so the field names (`request_id`, `op`) can't drift between call sites.
#[macro_export]
macro_rules! request_span {
    ($request_id:expr, $op:expr) => {
        tracing::debug_span!(target: $crate::trace::TARGET, "handle", request_id = %$request_id, op = %$op)
    };
}

/// Open a span for one composite method scope's advance, tagged with the
/// scope id and method path.
#[macro_export]
macro_rules! scope_span {
    ($scope_id:expr, $method_path:expr) => {
        tracing::debug_span!(target: $crate::trace::TARGET, "scope", scope_id = %$scope_id, method = %$method_path)
    };
}
