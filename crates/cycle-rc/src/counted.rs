//! Intrusive reference counting for runtime-internal objects.
//!
//! Control blocks and generations carry their own reference-count word and
//! free themselves when it reaches zero; [`Counted`] is the owning pointer
//! over that protocol. This is distinct from the *strong* colored count a
//! control block keeps for its payload: a `Counted<ControlBlock>` keeps the
//! block's metadata alive (like a weak reference), not the payload.

use std::ops::Deref;
use std::ptr::NonNull;

/// An object that maintains its own reference count and destroys itself
/// when the count reaches zero.
///
/// # Safety
///
/// `inc_ref` must increment the count with at least Relaxed ordering and
/// `dec_ref` must decrement with Release ordering, running destruction only
/// after an Acquire synchronization when the count hits zero. After
/// `dec_ref` drops the last reference the pointee must not be accessed.
pub(crate) unsafe trait RefCounted {
    /// Increment the reference count.
    fn inc_ref(&self);

    /// Decrement the reference count, destroying the object when it was
    /// the last reference.
    ///
    /// # Safety
    ///
    /// The caller must own one reference, which this call consumes.
    unsafe fn dec_ref(this: NonNull<Self>);
}

/// Owning pointer to a [`RefCounted`] object.
///
/// Holds exactly one count; `Clone` retains, `Drop` releases.
pub(crate) struct Counted<T: RefCounted> {
    ptr: NonNull<T>,
}

impl<T: RefCounted> Counted<T> {
    /// Adopt a reference that has already been counted (ownership
    /// transfer; no increment).
    ///
    /// # Safety
    ///
    /// `ptr` must be live and the caller must own one count on it.
    #[inline]
    pub(crate) unsafe fn from_acquired(ptr: NonNull<T>) -> Self {
        Self { ptr }
    }

    /// Take a new counted reference to `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must be live for the duration of this call (the caller must
    /// hold some other reference or an equivalent liveness guarantee, such
    /// as a published hazard).
    #[inline]
    pub(crate) unsafe fn retaining(ptr: NonNull<T>) -> Self {
        unsafe { ptr.as_ref() }.inc_ref();
        Self { ptr }
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }

    /// Surrender ownership of the count without releasing it.
    #[inline]
    pub(crate) fn into_raw(this: Self) -> NonNull<T> {
        let ptr = this.ptr;
        std::mem::forget(this);
        ptr
    }

    #[inline]
    pub(crate) fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T: RefCounted> Clone for Counted<T> {
    #[inline]
    fn clone(&self) -> Self {
        // SAFETY: self holds a count, so the pointee is live.
        unsafe { Self::retaining(self.ptr) }
    }
}

impl<T: RefCounted> Drop for Counted<T> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: this pointer owns one count.
        unsafe { T::dec_ref(self.ptr) };
    }
}

impl<T: RefCounted> Deref for Counted<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: self holds a count, so the pointee is live.
        unsafe { self.ptr.as_ref() }
    }
}

// SAFETY: a Counted is a counted handle; sending it between threads is
// sound whenever the pointee may be shared between threads.
unsafe impl<T: RefCounted + Sync + Send> Send for Counted<T> {}
unsafe impl<T: RefCounted + Sync + Send> Sync for Counted<T> {}
