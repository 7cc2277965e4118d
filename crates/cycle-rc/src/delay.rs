//! Deferred collection: the delay-GC hook.
//!
//! Collections are normally run inline by whichever thread dropped the
//! last strong reference. An embedder that cannot afford that (a latency
//! sensitive thread, a signal handler adjacent context) installs a hook;
//! collection requests are then handed to the hook as a [`GcOperation`]
//! capability which the hook must execute at least once, on whatever
//! executor it likes. Running it more than once is harmless.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::counted::Counted;
use crate::generation::Generation;

/// An idempotent "collect this generation" capability.
///
/// Handed to the delay-GC hook; call [`GcOperation::run`] at least once.
/// Extra invocations re-run the collector, which finds nothing new.
pub struct GcOperation {
    gen: Counted<Generation>,
}

impl GcOperation {
    pub(crate) fn new(gen: Counted<Generation>) -> Self {
        Self { gen }
    }

    /// Run the promised collection.
    pub fn run(&self) {
        self.gen.collect();
    }
}

impl Clone for GcOperation {
    fn clone(&self) -> Self {
        Self {
            gen: self.gen.clone(),
        }
    }
}

impl std::fmt::Debug for GcOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcOperation")
            .field("generation", &self.gen.seq())
            .finish()
    }
}

/// The delay-GC hook type: receives the capability for a promised
/// collection and must execute it at least once.
pub type DelayGc = Arc<dyn Fn(GcOperation) + Send + Sync>;

static HOOK: RwLock<Option<DelayGc>> = RwLock::new(None);

/// Install (or clear) the delay-GC hook, returning the previous one.
pub fn set_delay_gc(hook: Option<DelayGc>) -> Option<DelayGc> {
    std::mem::replace(&mut *HOOK.write(), hook)
}

/// The currently installed delay-GC hook.
pub fn delay_gc() -> Option<DelayGc> {
    HOOK.read().clone()
}

/// Route a promised collection through the hook, or run it inline when no
/// hook is installed. A panicking hook forfeits the deferral: the
/// collection runs synchronously so the promise is never lost.
pub(crate) fn dispatch(gen: Counted<Generation>) {
    let hook = { HOOK.read().clone() };

    let Some(hook) = hook else {
        gen.collect();
        return;
    };

    let op = GcOperation::new(gen);
    let fallback = op.clone();
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || hook(op))).is_err() {
        tracing::error!("delay-gc hook panicked; collecting synchronously");
        fallback.run();
    }
}
