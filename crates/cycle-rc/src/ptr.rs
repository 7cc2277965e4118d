//! The smart-pointer façade: [`Gc`], [`Weak`], [`Member`] and [`Owner`].
//!
//! These are thin shells over the runtime core. A `Gc<T>` is a raw payload
//! pointer plus a counted control-block reference and one strong count; a
//! `Weak<T>` is the same without the strong count; a `Member<T>` wraps one
//! vertex, which is what makes it participate in cycle collection.
//!
//! The cycle-safety rule of thumb: pointers *into* the object graph from
//! the outside (locals, globals, collections that are not themselves
//! managed) are `Gc<T>`; pointers *between* managed objects are
//! `Member<T>`, created against their owner during construction. Members
//! may form arbitrary cycles; once the external `Gc`s are gone, the
//! collector reclaims the whole tangle.

use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::control::{allocate_with, unowned_control, ControlBlock};
use crate::counted::Counted;
use crate::publisher::{self, PublishGuard};
use crate::vertex::Vertex;
use crate::{AllocError, LookupError};

// ============================================================================
// Gc<T>
// ============================================================================

/// A strong, cycle-collected shared pointer.
///
/// Like `Arc<T>`, cloning bumps a count and the payload is destroyed when
/// it becomes unreachable; unlike `Arc<T>`, reachability is judged by the
/// cycle collector, so graphs built from [`Member`] edges may be cyclic.
///
/// # Examples
///
/// Retargeting a member needs `&mut Member`, and a `Gc` only hands out
/// shared references, so members mutated after construction live behind a
/// lock (or any other interior-mutability cell):
///
/// ```
/// use cycle_rc::{Gc, Member};
/// use parking_lot::Mutex;
///
/// struct Node {
///     next: Mutex<Member<Node>>,
///     value: u32,
/// }
///
/// let a = Gc::new_cyclic(|owner| Node {
///     next: Mutex::new(owner.member()),
///     value: 1,
/// });
/// let b = Gc::new_cyclic(|owner| Node {
///     next: Mutex::new(owner.member()),
///     value: 2,
/// });
///
/// // A two-node cycle: a -> b -> a.
/// a.next.lock().set(Some(&b));
/// b.next.lock().set(Some(&a));
/// assert_eq!(a.next.lock().load().unwrap().value, 2);
///
/// // Dropping the external handles reclaims the cycle.
/// drop(a);
/// drop(b);
/// ```
pub struct Gc<T: ?Sized> {
    target: NonNull<T>,
    ctrl: Counted<ControlBlock>,
}

// SAFETY: shared-ownership semantics, same bounds as Arc.
unsafe impl<T: ?Sized + Send + Sync> Send for Gc<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Gc<T> {}

impl<T> Gc<T> {
    /// Allocate a new payload with no member wiring.
    ///
    /// Aborts on allocation failure, like `Box::new`.
    pub fn new(value: T) -> Self {
        Self::new_cyclic(|_| value)
    }

    /// Allocate a new payload, giving the constructor access to an
    /// [`Owner`] handle for the block under construction, so the payload
    /// can wire up members (including self-referential ones) and weak
    /// self-pointers.
    ///
    /// Aborts on allocation failure.
    pub fn new_cyclic(init: impl FnOnce(&Owner<T>) -> T) -> Self {
        Self::try_new_cyclic(init)
            .unwrap_or_else(|_| std::alloc::handle_alloc_error(crate::control::payload_layout::<T>()))
    }

    /// Fallible [`Gc::new`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when the control block cannot be allocated.
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        Self::try_new_cyclic(|_| value)
    }

    /// Fallible [`Gc::new_cyclic`].
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] when the control block cannot be allocated.
    /// A panicking constructor unwinds cleanly: the publication is rolled
    /// back and the block is deallocated.
    pub fn try_new_cyclic(init: impl FnOnce(&Owner<T>) -> T) -> Result<Self, AllocError> {
        let (ctrl, target) = allocate_with::<T>(|ctrl, payload| {
            let owner = Owner {
                ctrl: ctrl.clone(),
                payload,
            };
            init(&owner)
        })?;
        Ok(Self { target, ctrl })
    }
}

impl<T: ?Sized> Gc<T> {
    /// Whether two pointers share one control block (and therefore one
    /// lifetime), regardless of aliasing.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Counted::ptr_eq(&a.ctrl, &b.ctrl)
    }

    /// An aliased pointer to a part of this payload, sharing the control
    /// block: the alias keeps the whole allocation alive.
    #[must_use]
    pub fn project<U: ?Sized>(this: &Self, f: impl FnOnce(&T) -> &U) -> Gc<U> {
        let target = NonNull::from(f(this));
        this.ctrl.acquire_no_red();
        Gc {
            target,
            ctrl: this.ctrl.clone(),
        }
    }

    /// Demote to a weak pointer.
    #[must_use]
    pub fn downgrade(this: &Self) -> Weak<T> {
        Weak {
            target: this.target,
            ctrl: this.ctrl.clone(),
        }
    }

    pub(crate) fn control_ptr(this: &Self) -> NonNull<ControlBlock> {
        this.ctrl.as_ptr()
    }

    /// Split into raw parts, transferring the strong count and the
    /// control reference to the caller.
    pub(crate) fn into_parts(this: Self) -> (NonNull<T>, Counted<ControlBlock>) {
        let this = ManuallyDrop::new(this);
        // SAFETY: `this` is forgotten; ownership of both parts moves out.
        (this.target, unsafe { std::ptr::read(&this.ctrl) })
    }
}

impl<T: ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        // A held Gc proves the block is reachable and not RED.
        self.ctrl.acquire_no_red();
        Self {
            target: self.target,
            ctrl: self.ctrl.clone(),
        }
    }
}

impl<T: ?Sized> Drop for Gc<T> {
    fn drop(&mut self) {
        // May request a collection; the control reference in `ctrl` drops
        // afterwards, keeping the block's metadata alive throughout.
        self.ctrl.release(false);
    }
}

impl<T: ?Sized> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a strong count is held, so the payload is live.
        unsafe { self.target.as_ref() }
    }
}

impl<T: ?Sized + std::fmt::Debug> std::fmt::Debug for Gc<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&**self, f)
    }
}

// ============================================================================
// Weak<T>
// ============================================================================

/// A non-owning counterpart of [`Gc`].
///
/// Holds the control block (not the payload) alive. [`Weak::upgrade`]
/// returns `None` once the payload has been destroyed, or while it is
/// still under construction.
pub struct Weak<T: ?Sized> {
    target: NonNull<T>,
    ctrl: Counted<ControlBlock>,
}

// SAFETY: same sharing story as Gc, minus payload access.
unsafe impl<T: ?Sized + Send + Sync> Send for Weak<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for Weak<T> {}

impl<T: ?Sized> Weak<T> {
    /// Try to promote to a strong pointer.
    ///
    /// Succeeds as long as the payload is alive and fully constructed,
    /// including mid-collection when the collector has tentatively marked
    /// the block unreachable (the promotion then re-colors it).
    #[must_use]
    pub fn upgrade(&self) -> Option<Gc<T>> {
        if self.ctrl.is_under_construction() {
            // A half-built payload must not hand out strong references.
            return None;
        }
        if !self.ctrl.weak_acquire() {
            return None;
        }
        Some(Gc {
            target: self.target,
            ctrl: self.ctrl.clone(),
        })
    }

    /// Whether the payload has been destroyed. A `false` answer may be
    /// stale by the time it is observed; [`Weak::upgrade`] is the
    /// authoritative check.
    #[must_use]
    pub fn expired(&self) -> bool {
        self.ctrl.expired()
    }
}

impl<T: ?Sized> Clone for Weak<T> {
    fn clone(&self) -> Self {
        Self {
            target: self.target,
            ctrl: self.ctrl.clone(),
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for Weak<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("(Weak)")
    }
}

// ============================================================================
// Owner<T>
// ============================================================================

/// Construction handle passed to [`Gc::new_cyclic`]'s closure.
///
/// Mints [`Member`]s owned by the block under construction and weak
/// self-references. Strong self-references are not available until the
/// constructor returns (see [`Weak::upgrade`]).
pub struct Owner<T> {
    ctrl: Counted<ControlBlock>,
    payload: NonNull<T>,
}

impl<T> Owner<T> {
    /// A new, null member owned by the object under construction.
    #[must_use]
    pub fn member<U>(&self) -> Member<U> {
        Member::with_owner(self.ctrl.clone())
    }

    /// A weak reference to the object under construction. Upgrades fail
    /// until the constructor returns.
    #[must_use]
    pub fn weak(&self) -> Weak<T> {
        Weak {
            target: self.payload,
            ctrl: self.ctrl.clone(),
        }
    }

    /// Address the payload will live at. Valid for address arithmetic
    /// (for example [`Member::adopt`] lookups) during construction; not
    /// dereferenceable until construction completes.
    #[must_use]
    pub fn payload_ptr(&self) -> *const T {
        self.payload.as_ptr()
    }
}

// ============================================================================
// Member<T>
// ============================================================================

/// A managed pointer field: one edge of the object graph.
///
/// A member belongs to an owning object (or to the process-wide unowned
/// placeholder) and points at another managed object or at nothing.
/// Unlike [`Gc`], member edges are visible to the cycle collector, so
/// cycles built from members do not leak.
///
/// Loads take `&self` and are safe against concurrent collection and
/// generation merges; retargeting takes `&mut self`.
pub struct Member<T> {
    vertex: NonNull<Vertex>,
    target: AtomicPtr<T>,
}

// SAFETY: the vertex protocol is internally synchronized; the target
// pointer is only written through &mut.
unsafe impl<T: Send + Sync> Send for Member<T> {}
unsafe impl<T: Send + Sync> Sync for Member<T> {}

impl<T> Member<T> {
    fn with_owner(owner: Counted<ControlBlock>) -> Self {
        Self {
            vertex: Vertex::attach(owner),
            target: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// A null member owned by the unowned placeholder block: for
    /// function-local member pointers with no participating parent.
    #[must_use]
    pub fn unowned() -> Self {
        Self::with_owner(unowned_control())
    }

    /// A null member owned by whichever block has published an address
    /// range covering `location`: for objects constructed by owner-aware
    /// allocators inside a published payload.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError`] when no publication covers `location`;
    /// callers treat that as a programming error.
    pub fn adopt(location: *const u8) -> Result<Self, LookupError> {
        let owner = publisher::lookup(location as usize, 1)?;
        Ok(Self::with_owner(owner))
    }

    fn vertex(&self) -> &Vertex {
        // SAFETY: the boxed vertex lives until Drop.
        unsafe { self.vertex.as_ref() }
    }

    /// Point this member at `value`'s object (or at nothing).
    ///
    /// The caller's `Gc` proves the destination reachable, so the cheap
    /// no-red acquire applies.
    pub fn set(&mut self, value: Option<&Gc<T>>) {
        match value {
            Some(gc) => {
                self.vertex().set(Some(gc.ctrl.clone()), false, true);
                self.target.store(gc.target.as_ptr(), Ordering::Release);
            }
            None => {
                self.vertex().reset();
                self.target.store(std::ptr::null_mut(), Ordering::Release);
            }
        }
    }

    /// Point this member at `value`, consuming it: the transferred strong
    /// count is adopted by the edge (or dropped if the edge turns out to
    /// be generation-internal).
    pub fn store(&mut self, value: Option<Gc<T>>) {
        match value {
            Some(gc) => {
                let (target, ctrl) = Gc::into_parts(gc);
                self.vertex().set(Some(ctrl), true, true);
                self.target.store(target.as_ptr(), Ordering::Release);
            }
            None => {
                self.vertex().reset();
                self.target.store(std::ptr::null_mut(), Ordering::Release);
            }
        }
    }

    /// Load the current destination as a strong pointer.
    ///
    /// A hazard-protected read: safe against a concurrent writer dropping
    /// the last other reference mid-load. Uses the full acquire, since
    /// the destination may be RED under a collector that has not seen
    /// this edge yet.
    #[must_use]
    pub fn load(&self) -> Option<Gc<T>> {
        let ctrl = self.vertex().dst.load()?;
        ctrl.acquire();
        let target = NonNull::new(self.target.load(Ordering::Acquire))
            .expect("a member with a destination has a target");
        Some(Gc { target, ctrl })
    }

    /// Take the destination out, leaving the member null.
    pub fn take(&mut self) -> Option<Gc<T>> {
        let out = self.load();
        self.set(None);
        out
    }
}

impl<T> Drop for Member<T> {
    fn drop(&mut self) {
        // SAFETY: `vertex` came from Vertex::attach and is dropped once.
        unsafe { Vertex::detach(self.vertex) };
    }
}

impl<T> std::fmt::Debug for Member<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.vertex().dst.load_raw().is_null() {
            f.write_str("Member(null)")
        } else {
            f.write_str("Member(..)")
        }
    }
}

// ============================================================================
// Publications
// ============================================================================

/// RAII publication of an address range as owned by a control block, for
/// owner-aware allocator adaptors: while the publication is live,
/// [`Member::adopt`] resolves addresses in the range to `owner`'s block.
pub struct Publication {
    _guard: PublishGuard,
    _owner: Counted<ControlBlock>,
}

/// Publish `[addr, addr + len)` as owned by `owner`'s control block.
#[must_use]
pub fn publish<T: ?Sized>(owner: &Gc<T>, addr: *const u8, len: usize) -> Publication {
    let ctrl = owner.ctrl.clone();
    let guard = PublishGuard::publish(addr as usize, len, ctrl.as_ptr());
    Publication {
        _guard: guard,
        _owner: ctrl,
    }
}
