//! Multithreaded stress: clone/drop churn, loads racing collections,
//! weak promotion racing destruction, and cross-thread cycle teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use cycle_rc::{Gc, Member, Weak};
use parking_lot::Mutex;

struct Node {
    drops: Arc<AtomicUsize>,
    value: usize,
    next: Mutex<Member<Node>>,
}

impl Node {
    fn new(drops: &Arc<AtomicUsize>, value: usize) -> Gc<Node> {
        Gc::new_cyclic(|owner| Node {
            drops: Arc::clone(drops),
            value,
            next: Mutex::new(owner.member()),
        })
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn clone_drop_churn() {
    let drops = Arc::new(AtomicUsize::new(0));
    let shared = Node::new(&drops, 7);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let shared = shared.clone();
            thread::spawn(move || {
                for _ in 0..10_000 {
                    let local = shared.clone();
                    assert_eq!(local.value, 7);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    drop(shared);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn loads_race_retargets() {
    let drops = Arc::new(AtomicUsize::new(0));
    let owner = Node::new(&drops, 0);

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let owner = owner.clone();
            thread::spawn(move || {
                let mut seen = 0usize;
                for _ in 0..5_000 {
                    if let Some(target) = owner.next.lock().load() {
                        // Whatever we loaded must be alive right now.
                        seen += target.value;
                    }
                }
                seen
            })
        })
        .collect();

    let writer = {
        let owner = owner.clone();
        let drops = Arc::clone(&drops);
        thread::spawn(move || {
            for i in 1..=5_000 {
                let fresh = Node::new(&drops, i);
                owner.next.lock().set(Some(&fresh));
                // `fresh` drops here; the edge is the only thing keeping
                // the node alive until the next retarget.
            }
            owner.next.lock().set(None);
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    writer.join().unwrap();

    drop(owner);
    assert_eq!(
        drops.load(Ordering::Relaxed),
        5_001,
        "every retargeted-away node and the owner reclaimed exactly once"
    );
}

#[test]
fn weak_upgrades_race_last_drop() {
    for _ in 0..200 {
        let drops = Arc::new(AtomicUsize::new(0));
        let strong = Node::new(&drops, 1);
        let weak: Weak<Node> = Gc::downgrade(&strong);

        let upgrader = thread::spawn(move || {
            let mut hits = 0usize;
            while let Some(gc) = weak.upgrade() {
                assert_eq!(gc.value, 1);
                hits += 1;
                if hits > 64 {
                    break;
                }
                thread::yield_now();
            }
            hits
        });

        drop(strong);
        upgrader.join().unwrap();

        // Once the upgrader observed expiry and released its promotions,
        // the payload must be gone exactly once.
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }
}

#[test]
fn cross_thread_cycle_teardown() {
    let drops = Arc::new(AtomicUsize::new(0));

    let cycles: Vec<(Gc<Node>, Gc<Node>)> = (0..32)
        .map(|i| {
            let a = Node::new(&drops, i);
            let b = Node::new(&drops, i);
            a.next.lock().set(Some(&b));
            b.next.lock().set(Some(&a));
            (a, b)
        })
        .collect();

    // Tear the halves down from different threads.
    let (left, right): (Vec<_>, Vec<_>) = cycles.into_iter().unzip();
    let t1 = thread::spawn(move || drop(left));
    let t2 = thread::spawn(move || drop(right));
    t1.join().unwrap();
    t2.join().unwrap();

    assert_eq!(
        drops.load(Ordering::Relaxed),
        64,
        "every cycle reclaimed exactly once regardless of drop interleaving"
    );
}

#[test]
fn concurrent_merges_from_shared_hub() {
    let drops = Arc::new(AtomicUsize::new(0));
    let hub = Node::new(&drops, 0);

    let builders: Vec<_> = (0..4)
        .map(|_| {
            let hub = hub.clone();
            let drops = Arc::clone(&drops);
            thread::spawn(move || {
                for i in 0..500 {
                    // Young node pointing back at the old hub: exercises
                    // sequence lowering and merging under contention.
                    let young = Node::new(&drops, i);
                    young.next.lock().set(Some(&hub));
                    drop(young);
                }
            })
        })
        .collect();

    for builder in builders {
        builder.join().unwrap();
    }

    assert_eq!(drops.load(Ordering::Relaxed), 2_000);
    drop(hub);
    assert_eq!(drops.load(Ordering::Relaxed), 2_001);
}
