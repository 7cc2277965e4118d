//! Weak pointers: promotion across the payload lifecycle, including the
//! under-construction window and post-collection expiry.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cycle_rc::{Gc, Member, Weak};
use parking_lot::Mutex;

struct Node {
    drops: Arc<AtomicUsize>,
    this: Weak<Node>,
    next: Mutex<Member<Node>>,
}

impl Drop for Node {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn upgrade_fails_after_destruction() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = Gc::new_cyclic(|owner| Node {
        drops: Arc::clone(&drops),
        this: owner.weak(),
        next: Mutex::new(owner.member()),
    });

    let weak = Gc::downgrade(&a);
    assert!(!weak.expired());
    assert!(weak.upgrade().is_some());

    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
    assert!(weak.expired());
    assert!(weak.upgrade().is_none(), "promotion fails on a dead block");
}

#[test]
fn upgrade_fails_during_construction() {
    let drops = Arc::new(AtomicUsize::new(0));
    let upgraded_during_ctor = Arc::new(AtomicUsize::new(usize::MAX));

    let a = Gc::new_cyclic(|owner| {
        let weak = owner.weak();
        // A half-built payload must not hand out strong references.
        upgraded_during_ctor.store(
            usize::from(weak.upgrade().is_some()),
            Ordering::Relaxed,
        );
        Node {
            drops: Arc::clone(&drops),
            this: weak,
            next: Mutex::new(owner.member()),
        }
    });

    assert_eq!(upgraded_during_ctor.load(Ordering::Relaxed), 0);
    // After construction the stored self-weak upgrades fine.
    let this = a.this.upgrade().expect("constructed payload upgrades");
    assert!(Gc::ptr_eq(&this, &a));
}

#[test]
fn self_weak_survives_cycles_until_collection() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = Gc::new_cyclic(|owner| Node {
        drops: Arc::clone(&drops),
        this: owner.weak(),
        next: Mutex::new(owner.member()),
    });
    let b = Gc::new_cyclic(|owner| Node {
        drops: Arc::clone(&drops),
        this: owner.weak(),
        next: Mutex::new(owner.member()),
    });

    a.next.lock().set(Some(&b));
    b.next.lock().set(Some(&a));

    let weak_a = Gc::downgrade(&a);
    drop(a);
    // Still reachable through b.
    assert!(weak_a.upgrade().is_some());

    drop(b);
    assert_eq!(drops.load(Ordering::Relaxed), 2, "cycle reclaimed");
    assert!(weak_a.upgrade().is_none());
}

#[test]
fn weak_clones_are_independent() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = Gc::new_cyclic(|owner| Node {
        drops: Arc::clone(&drops),
        this: owner.weak(),
        next: Mutex::new(owner.member()),
    });

    let w1 = Gc::downgrade(&a);
    let w2 = w1.clone();
    drop(w1);

    assert!(w2.upgrade().is_some());
    drop(a);
    assert!(w2.upgrade().is_none());
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn weak_outliving_everything_is_harmless() {
    let drops = Arc::new(AtomicUsize::new(0));
    let weak = {
        let a = Gc::new_cyclic(|owner| Node {
            drops: Arc::clone(&drops),
            this: owner.weak(),
            next: Mutex::new(owner.member()),
        });
        Gc::downgrade(&a)
    };

    // The payload is long gone; the weak only pins block metadata.
    assert!(weak.expired());
    assert!(weak.upgrade().is_none());
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}
