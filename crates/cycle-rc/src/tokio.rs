//! Tokio integration: run deferred collections on a runtime.
//!
//! Enabled with the `tokio` feature:
//!
//! ```toml
//! [dependencies]
//! cycle-rc = { version = "0.1", features = ["tokio"] }
//! ```
//!
//! Installs a [delay-GC hook](crate::set_delay_gc) that forwards every
//! promised collection to a tokio runtime as a spawned task, so threads
//! dropping the last reference to a large graph never pay for the
//! collection inline.

use std::sync::Arc;

use crate::delay::{set_delay_gc, DelayGc, GcOperation};

/// Install a delay-GC hook that spawns each collection onto `handle`.
///
/// Returns the previously installed hook, if any. Collections requested
/// after the runtime shuts down panic inside the hook and therefore run
/// synchronously on the requesting thread, so no collection is ever lost.
///
/// # Examples
///
/// ```
/// let runtime = tokio::runtime::Runtime::new().unwrap();
/// let previous = cycle_rc::tokio::defer_to_runtime(runtime.handle());
/// assert!(previous.is_none());
///
/// let gc = cycle_rc::Gc::new(42u32);
/// drop(gc); // collection of the dropped block runs on the runtime
///
/// cycle_rc::set_delay_gc(None);
/// ```
pub fn defer_to_runtime(handle: &tokio::runtime::Handle) -> Option<DelayGc> {
    let handle = handle.clone();
    set_delay_gc(Some(Arc::new(move |op: GcOperation| {
        handle.spawn(async move {
            op.run();
        });
    })))
}
