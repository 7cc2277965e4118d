//! The delay-GC hook: deferral, idempotency, and panic fallback.
//!
//! The hook is process-wide state, so every test here serializes on one
//! mutex and restores the previous hook before finishing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cycle_rc::{set_delay_gc, Gc, GcOperation, Member};
use parking_lot::Mutex;

static HOOK_LOCK: Mutex<()> = Mutex::new(());

struct Node {
    drops: Arc<AtomicUsize>,
    next: Mutex<Member<Node>>,
}

impl Node {
    fn new(drops: &Arc<AtomicUsize>) -> Gc<Node> {
        Gc::new_cyclic(|owner| Node {
            drops: Arc::clone(drops),
            next: Mutex::new(owner.member()),
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

/// Install a hook that parks every operation in a queue.
fn capture_hook() -> Arc<Mutex<Vec<GcOperation>>> {
    let queue = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&queue);
    set_delay_gc(Some(Arc::new(move |op| sink.lock().push(op))));
    queue
}

#[test]
fn deferred_collection_runs_when_the_hook_says_so() {
    let _serial = HOOK_LOCK.lock();
    let drops = Arc::new(AtomicUsize::new(0));

    let queue = capture_hook();
    let a = Node::new(&drops);
    let b = Node::new(&drops);
    a.next.lock().set(Some(&b));
    b.next.lock().set(Some(&a));

    drop(a);
    drop(b);
    assert_eq!(
        drops.load(Ordering::Relaxed),
        0,
        "the cycle stays un-reclaimed until the deferred operation runs"
    );

    let ops: Vec<_> = std::mem::take(&mut *queue.lock());
    assert!(!ops.is_empty(), "dropping the last reference queued a collection");
    for op in &ops {
        op.run();
    }
    assert_eq!(drops.load(Ordering::Relaxed), 2);

    set_delay_gc(None);
}

#[test]
fn operations_are_idempotent() {
    let _serial = HOOK_LOCK.lock();
    let drops = Arc::new(AtomicUsize::new(0));

    let queue = capture_hook();
    let a = Node::new(&drops);
    a.next.lock().set(Some(&a));
    drop(a);

    let ops: Vec<_> = std::mem::take(&mut *queue.lock());
    set_delay_gc(None);

    // Running the capability many times has the observable effect of
    // running it once.
    for _ in 0..5 {
        for op in &ops {
            op.run();
        }
    }
    assert_eq!(drops.load(Ordering::Relaxed), 1, "destroyed exactly once");
}

#[test]
fn panicking_hook_falls_back_to_synchronous_collection() {
    let _serial = HOOK_LOCK.lock();
    let drops = Arc::new(AtomicUsize::new(0));

    set_delay_gc(Some(Arc::new(|_op| panic!("misbehaving hook"))));

    let a = Node::new(&drops);
    drop(a);
    assert_eq!(
        drops.load(Ordering::Relaxed),
        1,
        "the promise is kept even when the hook panics"
    );

    set_delay_gc(None);
}

#[test]
fn installing_returns_the_previous_hook() {
    let _serial = HOOK_LOCK.lock();

    assert!(set_delay_gc(None).is_none());
    let first = set_delay_gc(Some(Arc::new(|op| op.run())));
    assert!(first.is_none());
    let second = set_delay_gc(None);
    assert!(second.is_some());
    assert!(set_delay_gc(None).is_none());
}

#[cfg(feature = "tokio")]
#[test]
fn tokio_adapter_collects_on_the_runtime() {
    let _serial = HOOK_LOCK.lock();
    let drops = Arc::new(AtomicUsize::new(0));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .build()
        .unwrap();
    let previous = cycle_rc::tokio::defer_to_runtime(runtime.handle());
    assert!(previous.is_none());

    let a = Node::new(&drops);
    let b = Node::new(&drops);
    a.next.lock().set(Some(&b));
    b.next.lock().set(Some(&a));
    drop(a);
    drop(b);

    // Wait for the spawned collection to land.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while drops.load(Ordering::Relaxed) != 2 && std::time::Instant::now() < deadline {
        std::thread::yield_now();
    }
    assert_eq!(drops.load(Ordering::Relaxed), 2);

    set_delay_gc(None);
}
