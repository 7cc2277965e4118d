//! Hazard-protected atomic pointers to refcounted objects.
//!
//! Reading a raw pointer out of an atomic slot and bumping the pointee's
//! count are two separate steps; a concurrent writer may drop the last
//! other reference in between. The hazard protocol closes that window:
//! a reader first *publishes* the observed pointer in a shared intent slot
//! and re-verifies the source; a writer releasing a pointer must *offer* it
//! to every matching intent slot, donating a reference to any reader that
//! published it. A read therefore either returns a counted reference to an
//! object that was in the slot during the read, or restarts.
//!
//! The slot array is fixed-size, page-aligned and cache-line padded so the
//! whole array is covered by one TLB entry and slots never false-share.
//! Each protected type gets its own array: donation hands out a reference
//! that must be released through the matching type's release function, and
//! separating the arrays makes an address collision across types (stale
//! publish vs. recycled allocation) impossible.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::counted::{Counted, RefCounted};

/// Number of intent slots per protected type: one page of cache lines.
const SLOT_COUNT: usize = 4096 / 64;

/// The shared intent-slot array for one protected type.
#[repr(align(4096))]
pub(crate) struct HazardSlots {
    slots: [CachePadded<AtomicPtr<()>>; SLOT_COUNT],
}

impl HazardSlots {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [const { CachePadded::new(AtomicPtr::new(std::ptr::null_mut())) }; SLOT_COUNT],
        }
    }

    /// Pick a slot for a read operation, round-robin.
    fn claim(&self) -> &AtomicPtr<()> {
        static CURSOR: AtomicUsize = AtomicUsize::new(0);
        &self.slots[CURSOR.fetch_add(1, Ordering::Relaxed) % SLOT_COUNT]
    }

    fn iter(&self) -> impl Iterator<Item = &AtomicPtr<()>> {
        self.slots.iter().map(|s| &**s)
    }
}

/// A refcounted type whose pointers may sit in [`HazardCell`]s.
///
/// # Safety
///
/// `slots` must return the same process-wide array for every call, and
/// that array must be used by no other type.
pub(crate) unsafe trait HazardProtected: RefCounted {
    fn slots() -> &'static HazardSlots;
}

/// Release one reference to `ptr`, first offering it to all published
/// intents so that racing readers keep their liveness guarantee.
///
/// One spare reference is held across the scan; every successful CAS-clear
/// of a matching intent donates that spare to the reader.
///
/// # Safety
///
/// The caller must own one reference to `ptr`, which this call consumes.
pub(crate) unsafe fn offer_and_release<T: HazardProtected>(ptr: *mut T) {
    let Some(ptr) = NonNull::new(ptr) else {
        return;
    };

    let mut spare = false;
    for slot in T::slots().iter() {
        if !spare {
            // SAFETY: we still own at least one reference here.
            unsafe { ptr.as_ref() }.inc_ref();
            spare = true;
        }

        if slot
            .compare_exchange(
                ptr.as_ptr().cast(),
                std::ptr::null_mut(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            // Donated the spare to the reader that published this slot.
            spare = false;
        }
    }

    // SAFETY: both counts below are owned by us (the undonated spare and
    // the reference the caller surrendered).
    unsafe {
        if spare {
            T::dec_ref(ptr);
        }
        T::dec_ref(ptr);
    }
}

/// An atomic, hazard-protected, counted pointer slot.
///
/// The stored pointer owns one reference to its pointee. All writes offer
/// the outgoing value to published intents before releasing it.
pub(crate) struct HazardCell<T: HazardProtected> {
    ptr: AtomicPtr<T>,
}

impl<T: HazardProtected> HazardCell<T> {
    pub(crate) const fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    pub(crate) fn new(value: Option<Counted<T>>) -> Self {
        Self {
            ptr: AtomicPtr::new(into_ptr(value)),
        }
    }

    /// Raw peek for pointer-identity checks; carries no liveness guarantee.
    #[inline]
    pub(crate) fn load_raw(&self) -> *mut T {
        self.ptr.load(Ordering::Relaxed)
    }

    /// Read the current value as a counted reference.
    ///
    /// Lock-free: restarts when the slot changes underneath the published
    /// intent, and consumes a writer's donation when one arrives.
    pub(crate) fn load(&self) -> Option<Counted<T>> {
        let slot = T::slots().claim();
        let mut target = self.ptr.load(Ordering::Relaxed);

        loop {
            let tgt = NonNull::new(target)?;
            let erased = tgt.as_ptr().cast::<()>();

            // Publish intent to acquire `target`.
            while slot
                .compare_exchange(
                    std::ptr::null_mut(),
                    erased,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                std::hint::spin_loop();
            }

            // Check that the source still (or again) holds `target`.
            let current = self.ptr.load(Ordering::Acquire);
            if current != target {
                // Retract the intent.
                if slot
                    .compare_exchange(
                        erased,
                        std::ptr::null_mut(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    // A writer already cleared our intent and donated a
                    // reference.
                    if self.ptr.load(Ordering::Relaxed) == target {
                        // The slot holds `target` again: we cannot tell
                        // whether the donation was for the original object
                        // or a newly stored one at the same address, so
                        // keep the granted reference.
                        // SAFETY: the donation transferred one count to us.
                        return Some(unsafe { Counted::from_acquired(tgt) });
                    }
                    // SAFETY: releasing the unwanted donated count.
                    unsafe { T::dec_ref(tgt) };
                }
                target = current;
                continue;
            }

            // Intent is published and valid: `target` cannot be freed
            // until the intent clears, so the count bump is safe.
            // SAFETY: liveness pinned by the published intent.
            unsafe { tgt.as_ref() }.inc_ref();

            if slot
                .compare_exchange(
                    erased,
                    std::ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // A writer donated on top of our own bump; keep one.
                // SAFETY: we own both counts, release the extra.
                unsafe { T::dec_ref(tgt) };
            }
            return Some(unsafe { Counted::from_acquired(tgt) });
        }
    }

    /// Store a new value, offering the old one to published intents.
    pub(crate) fn store(&self, value: Option<Counted<T>>) {
        let old = self.ptr.swap(into_ptr(value), Ordering::Release);
        // SAFETY: the cell owned one count on `old`.
        unsafe { offer_and_release(old) };
    }

    /// Exchange the value, returning the old one with its count.
    ///
    /// The old value must still be offered to published intents, so an
    /// extra count is taken for the offer and the original count is
    /// returned to the caller.
    pub(crate) fn swap(&self, value: Option<Counted<T>>) -> Option<Counted<T>> {
        let old = self.ptr.swap(into_ptr(value), Ordering::AcqRel);
        let old = NonNull::new(old)?;
        // SAFETY: the cell owned one count on `old`; the retain backs the
        // offer and the original count transfers to the returned handle.
        unsafe {
            old.as_ref().inc_ref();
            offer_and_release(old.as_ptr());
            Some(Counted::from_acquired(old))
        }
    }

    /// Exchange with null.
    pub(crate) fn take(&self) -> Option<Counted<T>> {
        self.swap(None)
    }
}

impl<T: HazardProtected> Drop for HazardCell<T> {
    fn drop(&mut self) {
        let old = *self.ptr.get_mut();
        // A stale publish of this address may exist in another reader's
        // slot, so the offer protocol applies even on the exclusive path.
        // SAFETY: the cell owned one count on `old`.
        unsafe { offer_and_release(old) };
    }
}

#[inline]
fn into_ptr<T: HazardProtected>(value: Option<Counted<T>>) -> *mut T {
    value.map_or(std::ptr::null_mut(), |v| Counted::into_raw(v).as_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Obj {
        refs: AtomicUsize,
        drops: Arc<AtomicUsize>,
    }

    unsafe impl RefCounted for Obj {
        fn inc_ref(&self) {
            self.refs.fetch_add(1, Ordering::Relaxed);
        }

        unsafe fn dec_ref(this: NonNull<Self>) {
            let obj = unsafe { this.as_ref() };
            if obj.refs.fetch_sub(1, Ordering::Release) == 1 {
                std::sync::atomic::fence(Ordering::Acquire);
                obj.drops.fetch_add(1, Ordering::Relaxed);
                drop(unsafe { Box::from_raw(this.as_ptr()) });
            }
        }
    }

    unsafe impl HazardProtected for Obj {
        fn slots() -> &'static HazardSlots {
            static SLOTS: HazardSlots = HazardSlots::new();
            &SLOTS
        }
    }

    fn obj(drops: &Arc<AtomicUsize>) -> Counted<Obj> {
        let boxed = Box::new(Obj {
            refs: AtomicUsize::new(1),
            drops: Arc::clone(drops),
        });
        // SAFETY: the box owns the birth count we adopt.
        unsafe { Counted::from_acquired(NonNull::new_unchecked(Box::into_raw(boxed))) }
    }

    #[test]
    fn load_null_is_none() {
        let cell = HazardCell::<Obj>::null();
        assert!(cell.load().is_none());
    }

    #[test]
    fn store_load_take() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = HazardCell::new(Some(obj(&drops)));

        let loaded = cell.load().unwrap();
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        let taken = cell.take().unwrap();
        assert!(Counted::ptr_eq(&loaded, &taken));
        assert!(cell.load().is_none());

        drop(loaded);
        drop(taken);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn store_releases_old_value() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = HazardCell::new(Some(obj(&drops)));
        cell.store(Some(obj(&drops)));
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        drop(cell);
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn concurrent_load_vs_store() {
        let drops = Arc::new(AtomicUsize::new(0));
        let cell = Arc::new(HazardCell::new(Some(obj(&drops))));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cell = Arc::clone(&cell);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(r) = cell.load() {
                            // The payload must still be live while held.
                            let _ = r.refs.load(Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        for _ in 0..1000 {
            cell.store(Some(obj(&drops)));
        }

        for r in readers {
            r.join().unwrap();
        }
        drop(cell);
        assert_eq!(drops.load(Ordering::Relaxed), 1001);
    }
}
