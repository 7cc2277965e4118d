//! Control blocks: per-object metadata for the cycle collector.
//!
//! A control block carries the colored strong count for its payload, a
//! separate control count for the block itself, the hazard-protected
//! pointer to its current generation, and the intrusive list of outgoing
//! vertices. The payload is stored in the same allocation
//! ([`Control<T>`]); destruction is type-erased through a static vtable so
//! the collector can destroy payloads of unrelated types.
//!
//! The two counts have different jobs. The *strong* count governs payload
//! reachability and is what the collector colors. The *control* count
//! keeps the metadata itself alive: vertices, weak pointers and the
//! collector's unreachable list all hold control references, and the block
//! frees itself when the last one goes away.

use std::alloc::Layout;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::color::{color, pack, refs, Color, ONE_REF};
use crate::counted::{Counted, RefCounted};
use crate::generation::{Generation, RedPromotionShared};
use crate::hazard::{HazardCell, HazardProtected, HazardSlots};
use crate::list::{Linked, List, ListHook};
use crate::publisher::PublishGuard;
use crate::vertex::Vertex;
use crate::AllocError;

/// Type-erased payload operations, one instance per payload type.
pub(crate) struct ControlVtable {
    /// Destroy the payload in place. Called exactly once, by the collector
    /// (or the last strong release routed through it), outside all
    /// collector locks.
    pub(crate) drop_payload: unsafe fn(NonNull<ControlBlock>),
    /// Destroy the control block's own fields and free the allocation.
    /// Called when the last control reference is released. Must not touch
    /// the payload.
    pub(crate) deallocate: unsafe fn(NonNull<ControlBlock>),
}

/// Per-object metadata: colored strong count, control count, generation
/// membership, and the outgoing edge list.
pub(crate) struct ControlBlock {
    /// Bit-packed (strong count, color) word. Birth state is WHITE with
    /// one reference.
    pub(crate) strong: AtomicUsize,
    /// References to this block itself (vertices, weaks, collector).
    control_refs: AtomicUsize,
    /// The generation this block currently belongs to. Retargeted by
    /// merges, hence hazard-protected.
    pub(crate) generation: HazardCell<Generation>,
    /// Membership hook for the generation's control list.
    pub(crate) hook: ListHook<ControlBlock>,
    /// Outgoing edges. Mutated only under this mutex.
    pub(crate) edges: Mutex<List<Vertex>>,
    /// Set until the payload constructor returns. Blocks strong
    /// self-references out of half-built objects.
    under_construction: AtomicBool,
    vtable: &'static ControlVtable,
}

unsafe impl Linked for ControlBlock {
    fn hook(&self) -> &ListHook<Self> {
        &self.hook
    }
}

unsafe impl RefCounted for ControlBlock {
    fn inc_ref(&self) {
        let old = self.control_refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0);
    }

    unsafe fn dec_ref(this: NonNull<Self>) {
        let block = unsafe { this.as_ref() };
        let old = block.control_refs.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0);
        if old == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            let deallocate = block.vtable.deallocate;
            // SAFETY: last control reference; nothing can reach the block
            // any more.
            unsafe { deallocate(this) };
        }
    }
}

unsafe impl HazardProtected for ControlBlock {
    fn slots() -> &'static HazardSlots {
        static SLOTS: HazardSlots = HazardSlots::new();
        &SLOTS
    }
}

impl ControlBlock {
    fn new(vtable: &'static ControlVtable) -> Self {
        Self {
            strong: AtomicUsize::new(pack(1, Color::White)),
            control_refs: AtomicUsize::new(1),
            generation: HazardCell::null(),
            hook: ListHook::new(),
            edges: Mutex::new(List::new()),
            under_construction: AtomicBool::new(true),
            vtable,
        }
    }

    /// Whether the payload has been destroyed (or is about to be).
    #[inline]
    pub(crate) fn expired(&self) -> bool {
        color(self.strong.load(Ordering::Relaxed)) == Color::Black
    }

    #[inline]
    pub(crate) fn is_under_construction(&self) -> bool {
        self.under_construction.load(Ordering::Acquire)
    }

    fn mark_constructed(&self) {
        self.under_construction.store(false, Ordering::Release);
    }

    /// Increment the strong count when the block is known reachable and
    /// known not to be RED (for example, the caller already holds a strong
    /// reference). Cheaper than [`ControlBlock::acquire`].
    pub(crate) fn acquire_no_red(&self) {
        let old = self.strong.fetch_add(ONE_REF, Ordering::Relaxed);
        debug_assert!(!matches!(color(old), Color::Black | Color::Red));
    }

    /// Increment the strong count, promoting RED to GREY if the collector
    /// tentatively demoted the block. May only be called on blocks the
    /// caller can prove reachable.
    pub(crate) fn acquire(&self) {
        let mut expect = pack(1, Color::White);
        loop {
            debug_assert_ne!(color(expect), Color::Black);
            let target = match color(expect) {
                Color::Red => Color::Grey,
                c => c,
            };
            match self.strong.compare_exchange_weak(
                expect,
                pack(refs(expect) + 1, target),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => expect = actual,
            }
        }
    }

    /// Weak-to-strong promotion. Fails on BLACK. A RED observation first
    /// takes the owning generation's red-promotion lock in shared mode, so
    /// the collector's phase 2 can exclude late promotions.
    pub(crate) fn weak_acquire(&self) -> bool {
        let mut promotion_guard: Option<RedPromotionShared> = None;

        let mut expect = pack(1, Color::White);
        while color(expect) != Color::Black {
            if color(expect) == Color::Red && promotion_guard.is_none() {
                // Lock the generation the block currently belongs to; a
                // racing merge may move it, so re-check until stable.
                let mut gen = self
                    .generation
                    .load()
                    .expect("a non-expired block has a generation");
                promotion_guard = loop {
                    let guard = RedPromotionShared::lock(gen);
                    if std::ptr::eq(guard.generation().as_ptr().as_ptr(), self.generation.load_raw())
                    {
                        break Some(guard);
                    }
                    drop(guard);
                    gen = self
                        .generation
                        .load()
                        .expect("a non-expired block has a generation");
                };
            }

            let target = match color(expect) {
                Color::Red => Color::Grey,
                c => c,
            };
            match self.strong.compare_exchange_weak(
                expect,
                pack(refs(expect) + 1, target),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => expect = actual,
            }
        }

        false
    }

    /// Release one strong reference. When the count drops to zero a
    /// collection is requested on the block's generation, unless the
    /// caller asserted liveness with `skip_gc`.
    pub(crate) fn release(&self, skip_gc: bool) {
        let old = self.strong.fetch_sub(ONE_REF, Ordering::Release);
        debug_assert!(refs(old) > 0);
        if !skip_gc && refs(old) == 1 {
            self.request_gc();
        }
    }

    /// Request a collection on the block's current generation. A merge may
    /// move the block concurrently; retry until the generation is stable
    /// so the request cannot be lost.
    pub(crate) fn request_gc(&self) {
        loop {
            let Some(gen) = self.generation.load() else {
                return;
            };
            gen.request_collect();
            if std::ptr::eq(gen.as_ptr().as_ptr(), self.generation.load_raw()) {
                return;
            }
        }
    }

    /// Register an outgoing vertex.
    pub(crate) fn push_edge(&self, vertex: NonNull<Vertex>) {
        let mut edges = self.edges.lock();
        // SAFETY: the vertex is unlinked and heap-pinned by its Member.
        unsafe { edges.push_back(vertex) };
    }

    /// Unregister an outgoing vertex.
    pub(crate) fn remove_edge(&self, vertex: NonNull<Vertex>) {
        let mut edges = self.edges.lock();
        // SAFETY: the vertex was linked by `push_edge`.
        unsafe { edges.remove(vertex) };
    }

    /// Destroy the payload through the type-erased trampoline.
    ///
    /// # Safety
    ///
    /// Only the collector may call this, exactly once, on a BLACK block,
    /// outside all collector locks.
    pub(crate) unsafe fn drop_payload(this: NonNull<Self>) {
        let drop_payload = unsafe { this.as_ref() }.vtable.drop_payload;
        unsafe { drop_payload(this) };
    }
}

/// The typed allocation: control block and payload storage side by side.
#[repr(C)]
pub(crate) struct Control<T> {
    base: ControlBlock,
    payload: UnsafeCell<MaybeUninit<T>>,
}

/// Allocation layout for a `T` payload, for alloc-failure reporting.
pub(crate) fn payload_layout<T>() -> Layout {
    Layout::new::<Control<T>>()
}

fn vtable_of<T>() -> &'static ControlVtable {
    unsafe fn drop_payload_impl<T>(block: NonNull<ControlBlock>) {
        let control = block.cast::<Control<T>>();
        // SAFETY: Control is repr(C) with the block first; the payload was
        // fully constructed (the collector never destroys
        // under-construction blocks) and is destroyed exactly once.
        unsafe { (*control.as_ref().payload.get()).assume_init_drop() };
    }

    unsafe fn deallocate_impl<T>(block: NonNull<ControlBlock>) {
        let control = block.cast::<Control<T>>();
        // SAFETY: last control reference; drop the metadata fields (not
        // the payload slot, which holds no Drop glue) and free.
        unsafe {
            std::ptr::drop_in_place(control.as_ptr());
            std::alloc::dealloc(control.as_ptr().cast(), Layout::new::<Control<T>>());
        }
    }

    struct VtableHolder<T>(PhantomData<T>);
    impl<T> VtableHolder<T> {
        const VTABLE: ControlVtable = ControlVtable {
            drop_payload: drop_payload_impl::<T>,
            deallocate: deallocate_impl::<T>,
        };
    }

    &VtableHolder::<T>::VTABLE
}

/// Allocate a control block plus payload storage, place the block in a
/// fresh generation, publish the payload range, run the constructor, and
/// hand back the birth strong reference.
///
/// The constructor receives the block and the (not yet initialized)
/// payload address, so the façade can mint members bound to the new owner.
/// On a constructor panic the publication is rolled back, the block is
/// unlinked and deallocated, and the panic propagates.
pub(crate) fn allocate_with<T>(
    init: impl FnOnce(&Counted<ControlBlock>, NonNull<T>) -> T,
) -> Result<(Counted<ControlBlock>, NonNull<T>), AllocError> {
    let layout = Layout::new::<Control<T>>();
    // SAFETY: Control<T> is never zero-sized (it leads with the block).
    let raw = unsafe { std::alloc::alloc(layout) };
    let Some(control) = NonNull::new(raw.cast::<Control<T>>()) else {
        return Err(AllocError);
    };

    // SAFETY: fresh allocation, writing the header in place.
    unsafe {
        std::ptr::addr_of_mut!((*control.as_ptr()).base).write(ControlBlock::new(vtable_of::<T>()));
    }
    let block_ptr = control.cast::<ControlBlock>();
    // SAFETY: adopt the birth control reference.
    let block = unsafe { Counted::from_acquired(block_ptr) };

    let generation = Generation::fresh();
    generation.link(block_ptr);
    block.generation.store(Some(generation));

    // SAFETY: payload slot is within the live allocation.
    let payload = unsafe {
        NonNull::new_unchecked((*control.as_ptr()).payload.get().cast::<T>())
    };

    let _publication = PublishGuard::publish(
        payload.as_ptr() as usize,
        std::mem::size_of::<T>(),
        block_ptr,
    );

    // Roll the half-born block back out of its generation if the
    // constructor panics; the memory itself is freed when `block` drops.
    let mut unlink_on_panic = UnlinkGuard {
        block: block_ptr,
        armed: true,
    };

    let value = init(&block, payload);

    // SAFETY: slot is uninitialized and reserved for this payload.
    unsafe { payload.as_ptr().write(value) };

    unlink_on_panic.armed = false;

    block.mark_constructed();
    Ok((block, payload))
}

struct UnlinkGuard {
    block: NonNull<ControlBlock>,
    armed: bool,
}

impl Drop for UnlinkGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // SAFETY: the block is still linked (construction never finished)
        // and we are its only owner.
        let block = unsafe { self.block.as_ref() };
        if let Some(gen) = block.generation.load() {
            gen.unlink(self.block);
        }
    }
}

/// The distinguished placeholder owner for vertices without a
/// participating parent (function-local member pointers).
///
/// Permanently under construction, permanently strong-counted, linked into
/// the reserved generation with sequence 0 so edges out of it can never
/// violate the ordering invariant.
pub(crate) fn unowned_control() -> Counted<ControlBlock> {
    static UNOWNED: OnceLock<Counted<ControlBlock>> = OnceLock::new();
    UNOWNED
        .get_or_init(|| {
            let layout = Layout::new::<Control<()>>();
            // SAFETY: Control<()> is non-zero-sized.
            let raw = unsafe { std::alloc::alloc(layout) };
            let control = NonNull::new(raw.cast::<Control<()>>())
                .unwrap_or_else(|| std::alloc::handle_alloc_error(layout));

            // SAFETY: fresh allocation.
            unsafe {
                std::ptr::addr_of_mut!((*control.as_ptr()).base)
                    .write(ControlBlock::new(vtable_of::<()>()));
            }
            let block_ptr = control.cast::<ControlBlock>();
            // SAFETY: adopt the birth control reference.
            let block = unsafe { Counted::from_acquired(block_ptr) };

            let generation = Generation::reserved();
            generation.link(block_ptr);
            block.generation.store(Some(generation));
            block
        })
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::UNOWNED_SEQ;

    #[test]
    fn unowned_block_is_permanently_under_construction() {
        let unowned = unowned_control();
        assert!(unowned.is_under_construction());
        assert!(!unowned.expired());

        let gen = unowned.generation.load().unwrap();
        assert_eq!(gen.seq(), UNOWNED_SEQ);

        // The singleton hands out the same block every time.
        let again = unowned_control();
        assert!(Counted::ptr_eq(&unowned, &again));
    }

    #[test]
    fn colored_protocol_round_trip() {
        let (block, _payload) = allocate_with::<u64>(|_, _| 7).expect("alloc");
        assert_eq!(refs(block.strong.load(Ordering::Relaxed)), 1);

        block.acquire_no_red();
        block.acquire();
        assert_eq!(refs(block.strong.load(Ordering::Relaxed)), 3);

        block.release(true);
        block.release(true);
        assert_eq!(refs(block.strong.load(Ordering::Relaxed)), 1);

        assert!(block.weak_acquire());
        block.release(true);

        // Dropping the last strong reference collects the block.
        block.release(false);
        assert!(block.expired());
        assert!(!block.weak_acquire());
    }
}
