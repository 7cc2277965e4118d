//! Owner discovery through the publisher registry, and unowned members.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cycle_rc::{publish, Gc, Member};
use parking_lot::Mutex;

struct Holder {
    drops: Arc<AtomicUsize>,
    slot: Mutex<Member<Holder>>,
}

impl Holder {
    fn new(drops: &Arc<AtomicUsize>) -> Gc<Holder> {
        Gc::new_cyclic(|owner| Holder {
            drops: Arc::clone(drops),
            slot: Mutex::new(owner.member()),
        })
    }
}

impl Drop for Holder {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn adopt_resolves_to_the_publishing_owner() {
    let drops = Arc::new(AtomicUsize::new(0));
    let owner = Holder::new(&drops);
    let other = Holder::new(&drops);

    // Simulate an owner-aware allocator: a buffer whose elements belong
    // to `owner`.
    let buffer = vec![0u8; 64];
    let _publication = publish(&owner, buffer.as_ptr(), buffer.len());

    // A member "constructed inside the buffer" binds to owner's block.
    let mut adopted: Member<Holder> =
        Member::adopt(unsafe { buffer.as_ptr().add(16) }).expect("covered address");
    adopted.set(Some(&other));

    // The adopted member is a real edge from `owner`: dropping the
    // external handle to `other` leaves it reachable through the edge.
    drop(other);
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    adopted.set(None);
    assert_eq!(drops.load(Ordering::Relaxed), 1, "edge was the last hold");

    drop(adopted);
    drop(owner);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

#[test]
fn adopt_outside_any_publication_fails() {
    let unpublished = [0u8; 8];
    let result = Member::<Holder>::adopt(unpublished.as_ptr());
    assert!(result.is_err(), "no publication covers a stack array");
}

#[test]
fn publication_is_scoped() {
    let drops = Arc::new(AtomicUsize::new(0));
    let owner = Holder::new(&drops);

    let buffer = vec![0u8; 32];
    {
        let _publication = publish(&owner, buffer.as_ptr(), buffer.len());
        assert!(Member::<Holder>::adopt(buffer.as_ptr()).is_ok());
    }
    assert!(
        Member::<Holder>::adopt(buffer.as_ptr()).is_err(),
        "publication removed on scope exit"
    );

    drop(owner);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn payload_range_is_published_during_construction() {
    let drops = Arc::new(AtomicUsize::new(0));
    let other = Holder::new(&drops);

    // The allocation entry point publishes the payload range before the
    // constructor runs, so nested lookups against the payload address
    // resolve to the block under construction.
    let owner = Gc::new_cyclic(|ctx: &cycle_rc::Owner<Holder>| {
        let mut nested =
            Member::<Holder>::adopt(ctx.payload_ptr().cast()).expect("payload range published");
        nested.set(Some(&other));
        Holder {
            drops: Arc::clone(&drops),
            slot: Mutex::new(nested),
        }
    });

    // After construction the range is unpublished again.
    assert!(Member::<Holder>::adopt((&*owner as *const Holder).cast()).is_err());

    drop(other);
    assert_eq!(drops.load(Ordering::Relaxed), 0, "held by the nested edge");

    drop(owner);
    assert_eq!(drops.load(Ordering::Relaxed), 2);
}

#[test]
fn unowned_members_never_merge_their_owner() {
    let drops = Arc::new(AtomicUsize::new(0));

    // Function-local managed pointer: owned by the unowned placeholder.
    let mut local: Member<Holder> = Member::unowned();
    let a = Holder::new(&drops);
    local.set(Some(&a));

    // The placeholder orders before every live generation, so this never
    // merged anything; the edge still counts.
    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 0, "held by the local member");

    assert_eq!(
        local.load().map(|gc| Arc::strong_count(&gc.drops)),
        Some(2),
        "load returns a usable strong pointer"
    );

    local.set(None);
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}

#[test]
fn unowned_members_in_plain_collections() {
    let drops = Arc::new(AtomicUsize::new(0));
    let a = Holder::new(&drops);

    let mut members: Vec<Member<Holder>> = (0..8).map(|_| Member::unowned()).collect();
    for member in &mut members {
        member.set(Some(&a));
    }
    drop(a);
    assert_eq!(drops.load(Ordering::Relaxed), 0);

    members.truncate(1);
    assert_eq!(drops.load(Ordering::Relaxed), 0, "one edge left");

    members.clear();
    assert_eq!(drops.load(Ordering::Relaxed), 1);
}
