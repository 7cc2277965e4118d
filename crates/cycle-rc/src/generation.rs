//! Generations: collection units and the concurrent mark-sweep collector.
//!
//! Every control block belongs to exactly one generation. Collection runs
//! per generation, so the collector never needs global knowledge of the
//! heap; instead a total order over generations (the sequence number)
//! keeps cross-generation edges acyclic at the generation level. An edge
//! that would violate that order either lowers the source generation's
//! sequence (when provably safe) or merges the two generations.
//!
//! The collector itself is two mark-sweep passes over the generation's
//! control list followed by a finalization pass:
//! - phase 1 runs without blocking anything: weak promotions racing with
//!   it simply re-color blocks GREY and get picked up later;
//! - phase 2 re-runs the residue while holding the red-promotion lock
//!   exclusively, so its verdict is final;
//! - phase 3 turns the remainder BLACK and hands it to an unlocked
//!   destruction phase, which may freely trip collections on other
//!   generations without deadlocking.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{RawRwLock, RwLock};

use crate::color::{color, pack, refs, Color};
use crate::control::ControlBlock;
use crate::counted::{Counted, RefCounted};
use crate::hazard::{HazardProtected, HazardSlots};
use crate::list::List;

// ============================================================================
// Sequence numbers
// ============================================================================

/// Sequence of the reserved generation holding the unowned control block.
pub(crate) const UNOWNED_SEQ: u64 = 0;

/// Low sequence bit: set while the generation has never been the target of
/// a cross-generation edge, which is what makes lowering its sequence
/// sound (no in-edge constrains it from below).
const MOVEABLE_BIT: u64 = 1;

/// Sequences are never lowered below this value.
const SEQ_FLOOR: u64 = 3;

static NEXT_SEQ: AtomicU64 = AtomicU64::new(4);

fn next_seq() -> u64 {
    let base = NEXT_SEQ.fetch_add(2, Ordering::Relaxed);
    // 64 bits of headroom: allocating a generation every nanosecond would
    // take centuries to get here.
    assert!(base < u64::MAX - 2, "generation sequence space exhausted");
    base | MOVEABLE_BIT
}

// ============================================================================
// Generation
// ============================================================================

/// A set of control blocks collected together.
pub(crate) struct Generation {
    /// Position in the global total order; low bit is the moveable flag.
    seq: AtomicU64,
    /// Reference count for the generation object itself.
    refs: AtomicUsize,
    /// All control blocks in this generation. The write lock doubles as
    /// the collector's critical section and blocks merges in or out.
    pub(crate) controls: RwLock<List<ControlBlock>>,
    /// Held shared by edge creation, exclusive by merges. Must be
    /// acquired before `controls`.
    merge_mtx: RawRwLock,
    /// Held shared by weak red-promotion, exclusive by collector phase 2.
    red_promotion: RawRwLock,
    /// A collection has been promised and not yet started.
    gc_flag: AtomicBool,
}

unsafe impl RefCounted for Generation {
    fn inc_ref(&self) {
        let old = self.refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(old > 0);
    }

    unsafe fn dec_ref(this: NonNull<Self>) {
        let gen = unsafe { this.as_ref() };
        let old = gen.refs.fetch_sub(1, Ordering::Release);
        debug_assert!(old > 0);
        if old == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            debug_assert!(gen.controls.read().is_empty());
            // SAFETY: last reference to a Box-allocated generation.
            drop(unsafe { Box::from_raw(this.as_ptr()) });
        }
    }
}

unsafe impl HazardProtected for Generation {
    fn slots() -> &'static HazardSlots {
        static SLOTS: HazardSlots = HazardSlots::new();
        &SLOTS
    }
}

impl Generation {
    fn with_seq(seq: u64) -> Counted<Self> {
        let boxed = Box::new(Self {
            seq: AtomicU64::new(seq),
            refs: AtomicUsize::new(1),
            controls: RwLock::new(List::new()),
            merge_mtx: RawRwLock::INIT,
            red_promotion: RawRwLock::INIT,
            gc_flag: AtomicBool::new(false),
        });
        // SAFETY: adopt the birth reference.
        unsafe { Counted::from_acquired(NonNull::new_unchecked(Box::into_raw(boxed))) }
    }

    /// A new generation for a freshly allocated control block.
    pub(crate) fn fresh() -> Counted<Self> {
        Self::with_seq(next_seq())
    }

    /// The reserved sequence-0 generation for the unowned control block.
    /// Never moveable: nothing orders before it.
    pub(crate) fn reserved() -> Counted<Self> {
        Self::with_seq(UNOWNED_SEQ)
    }

    /// Raw sequence, moveable bit included.
    #[inline]
    pub(crate) fn seq(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    /// Sequence with the moveable bit masked out.
    #[inline]
    fn base_seq(&self) -> u64 {
        self.seq() & !MOVEABLE_BIT
    }

    #[cfg(test)]
    pub(crate) fn is_moveable(&self) -> bool {
        self.seq() & MOVEABLE_BIT != 0
    }

    /// Record an incoming cross-generation edge: from here on the
    /// sequence may not be lowered.
    pub(crate) fn clear_moveable(&self) {
        self.seq.fetch_and(!MOVEABLE_BIT, Ordering::Relaxed);
    }

    /// The ordering invariant for an edge `src -> dst`.
    #[inline]
    pub(crate) fn order_invariant(src: &Generation, dst: &Generation) -> bool {
        src.seq() < dst.base_seq()
    }

    /// Try to satisfy `order_invariant(self, dst)` by lowering this
    /// generation's sequence below `dst`'s, instead of merging.
    ///
    /// Only legal while the moveable bit is still set: the bit is cleared
    /// the first time any edge is created into a generation, so a
    /// moveable generation has no in-edges and nothing constrains its
    /// sequence from below. Racing bit-clears serialize against the CAS
    /// on the single sequence word.
    fn try_lower_below(&self, dst: &Generation) -> bool {
        let dst_base = dst.base_seq();
        if dst_base <= SEQ_FLOOR {
            return false;
        }
        let target = (dst_base - 2) | MOVEABLE_BIT;

        let mut cur = self.seq.load(Ordering::Relaxed);
        loop {
            if cur & !MOVEABLE_BIT < dst_base {
                return true;
            }
            if cur & MOVEABLE_BIT == 0 {
                return false;
            }
            match self
                .seq
                .compare_exchange_weak(cur, target, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    tracing::trace!(from = cur, to = target, "lowered generation sequence");
                    return true;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Strict total order used for merge lock ordering: masked sequence,
    /// ties broken by address.
    fn precedes(&self, other: &Generation) -> bool {
        (self.base_seq(), self as *const Generation) < (other.base_seq(), other as *const _)
    }

    /// Add a control block to this generation.
    pub(crate) fn link(&self, block: NonNull<ControlBlock>) {
        let mut controls = self.controls.write();
        // SAFETY: the block is unlinked and outlives its membership.
        unsafe { controls.push_back(block) };
    }

    /// Remove a control block that never finished construction.
    pub(crate) fn unlink(&self, block: NonNull<ControlBlock>) {
        let mut controls = self.controls.write();
        // SAFETY: the block was linked by `link`.
        unsafe { controls.remove(block) };
    }

    // ========================================================================
    // Collection entry
    // ========================================================================

    /// Request a collection. The first request wins the pending flag and
    /// either runs the collection or hands it to the delay-GC hook; later
    /// requests return immediately, their collection promised.
    pub(crate) fn request_collect(&self) {
        if self.gc_flag.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: &self proves liveness for the retain.
        let this = unsafe { Counted::retaining(NonNull::from(self)) };
        crate::delay::dispatch(this);
    }

    // ========================================================================
    // Merge protocol
    // ========================================================================

    /// Make `order_invariant` hold (or the generations equal) for an edge
    /// from `src`'s block to `dst`'s block, merging generations if
    /// lowering a sequence cannot resolve the violation.
    ///
    /// Returns the shared merge guard on `src`'s final generation, to be
    /// held while the edge is installed.
    pub(crate) fn fix_ordering(src: &ControlBlock, dst: &ControlBlock) -> MergeShared {
        let mut src_gen = src
            .generation
            .load()
            .expect("edge source has a generation");
        let mut dst_gen = dst
            .generation
            .load()
            .expect("edge destination has a generation");
        let mut dst_gc_requested = false;

        let mut src_merge_lck = Some(MergeShared::lock(src_gen.clone()));
        loop {
            // The destination generation is about to gain an in-edge, so
            // freeze its sequence before judging the invariant.
            dst_gen.clear_moveable();

            if Counted::ptr_eq(&src_gen, &dst_gen)
                || Generation::order_invariant(&src_gen, &dst_gen)
            {
                // Re-stabilize the shared lock on src's current generation.
                while !std::ptr::eq(src_gen.as_ptr().as_ptr(), src.generation.load_raw()) {
                    src_merge_lck = None;
                    src_gen = src
                        .generation
                        .load()
                        .expect("edge source has a generation");
                    src_merge_lck = Some(MergeShared::lock(src_gen.clone()));
                }

                if Counted::ptr_eq(&src_gen, &dst_gen)
                    || Generation::order_invariant(&src_gen, &dst_gen)
                {
                    break;
                }
            }
            src_merge_lck = None;

            // Cheap resolution: lower src's sequence below dst's.
            if src_gen.try_lower_below(&dst_gen) {
                src_gen = src
                    .generation
                    .load()
                    .expect("edge source has a generation");
                dst_gen = dst
                    .generation
                    .load()
                    .expect("edge destination has a generation");
                src_merge_lck = Some(MergeShared::lock(src_gen.clone()));
                continue;
            }

            // Full merge. First freeze src's sequence as well (dst's is
            // frozen above): with both bits cleared the sequences can
            // never change again, so the merge direction chosen below
            // cannot be invalidated by a concurrent lowering. Re-judge
            // once after freezing, in case a lowering slipped in.
            src_gen.clear_moveable();
            if Counted::ptr_eq(&src_gen, &dst_gen)
                || Generation::order_invariant(&src_gen, &dst_gen)
            {
                src_merge_lck = Some(MergeShared::lock(src_gen.clone()));
                continue;
            }

            // Move the order-earlier generation into the later one. On a
            // masked-sequence tie the address decides.
            let mut src_gc_requested = false;
            if dst_gen.base_seq() == src_gen.base_seq() && src_gen.precedes(&dst_gen) {
                std::mem::swap(&mut src_gen, &mut dst_gen);
                std::mem::swap(&mut src_gc_requested, &mut dst_gc_requested);
            }

            let (merged, merged_gc_requested) = Generation::merge(
                (dst_gen, std::mem::take(&mut dst_gc_requested)),
                (src_gen.clone(), std::mem::take(&mut src_gc_requested)),
            );
            dst_gen = merged;
            dst_gc_requested = merged_gc_requested;

            // Another merge may have moved dst out from under us.
            if !std::ptr::eq(dst_gen.as_ptr().as_ptr(), dst.generation.load_raw()) {
                if std::mem::take(&mut dst_gc_requested) {
                    dst_gen.collect();
                }
                dst_gen = dst
                    .generation
                    .load()
                    .expect("edge destination has a generation");
            }

            // Same for src; then retake the shared lock and re-judge.
            debug_assert!(!src_gc_requested);
            if !std::ptr::eq(src_gen.as_ptr().as_ptr(), src.generation.load_raw()) {
                src_gen = src
                    .generation
                    .load()
                    .expect("edge source has a generation");
            }
            src_merge_lck = Some(MergeShared::lock(src_gen.clone()));
        }

        debug_assert!(std::ptr::eq(
            src_gen.as_ptr().as_ptr(),
            src.generation.load_raw()
        ));

        // Merging took over responsibility for a promised collection.
        if dst_gc_requested {
            dst_gen.collect();
        }

        src_merge_lck.expect("loop exits with the lock held")
    }

    /// Merge `src`'s blocks into `dst`, first cascading so that every
    /// edge out of a moved block still lands in `dst` or later.
    ///
    /// Each tuple pairs a generation with this thread's promise to run a
    /// collection on it; the promise is propagated to the merged result.
    fn merge(
        src: (Counted<Generation>, bool),
        mut dst: (Counted<Generation>, bool),
    ) -> (Counted<Generation>, bool) {
        let (src_gen, src_gc_requested) = src;
        debug_assert!(!Counted::ptr_eq(&src_gen, &dst.0));
        debug_assert!(
            Generation::order_invariant(&src_gen, &dst.0) || src_gen.precedes(&dst.0)
        );

        tracing::debug!(
            src_seq = src_gen.seq(),
            dst_seq = dst.0.seq(),
            "merging generations"
        );

        let src_merge = MergeExclusive::lock(src_gen.clone());
        let mut src_controls = src_gen.controls.write();

        // Cascade into edges that would violate the invariant once their
        // source block moves into dst. Edges cannot be retargeted while
        // we hold src's merge lock exclusively, but a recursive merge
        // changes generations, so re-read until the edge settles.
        for block in src_controls.iter() {
            // SAFETY: linked blocks are live; we hold the controls lock.
            let block = unsafe { block.as_ref() };
            let edges = block.edges.lock();
            for vertex in edges.iter() {
                // SAFETY: vertices stay linked while the edge lock is held.
                let vertex = unsafe { vertex.as_ref() };
                loop {
                    let Some(edge_dst) = vertex.dst.load() else {
                        break;
                    };
                    let edge_dst_gen_raw = edge_dst.generation.load_raw();
                    if std::ptr::eq(edge_dst_gen_raw, src_gen.as_ptr().as_ptr())
                        || std::ptr::eq(edge_dst_gen_raw, dst.0.as_ptr().as_ptr())
                    {
                        break;
                    }
                    let Some(edge_dst_gen) = edge_dst.generation.load() else {
                        break;
                    };
                    if Generation::order_invariant(&dst.0, &edge_dst_gen) {
                        break;
                    }
                    dst = Generation::merge((edge_dst_gen, false), dst);
                }
            }
        }

        let dst_gc_requested = Generation::merge_into(
            &src_gen,
            src_gc_requested,
            &mut src_controls,
            &dst.0,
            dst.1,
        );
        drop(src_controls);
        drop(src_merge);

        (dst.0, dst_gc_requested)
    }

    /// The low-level move: drain `src_controls` into `dst`, adjusting
    /// edge reference counts first.
    ///
    /// Stage 1 must complete before stage 2: the stage-1 predicate ("is
    /// the edge destination already in dst?") would misfire on blocks
    /// whose generation pointer was already rewritten.
    fn merge_into(
        src: &Counted<Generation>,
        mut src_gc_requested: bool,
        src_controls: &mut List<ControlBlock>,
        dst: &Counted<Generation>,
        mut dst_gc_requested: bool,
    ) -> bool {
        // Promise a collection on src (trivial once drained) so no other
        // thread commits to one mid-merge, and claim dst's promise early
        // to cut contention on its flag.
        if !src_gc_requested {
            src_gc_requested = !src.gc_flag.swap(true, Ordering::AcqRel);
        }
        if !dst_gc_requested {
            dst_gc_requested = !dst.gc_flag.swap(true, Ordering::AcqRel);
        }

        let mut dst_controls = dst.controls.write();

        // Moved blocks bring their in-edges with them.
        dst.clear_moveable();

        // Stage 1: edges from src into dst become internal and must not
        // double-count.
        for block in src_controls.iter() {
            // SAFETY: linked blocks are live; we hold src's locks.
            let block = unsafe { block.as_ref() };
            let edges = block.edges.lock();
            for vertex in edges.iter() {
                // SAFETY: vertices stay linked while the edge lock is held.
                let vertex = unsafe { vertex.as_ref() };
                let Some(edge_dst) = NonNull::new(vertex.dst.load_raw()) else {
                    continue;
                };
                // SAFETY: the vertex's counted slot keeps edge_dst alive,
                // and the exclusive merge lock pins the slot itself.
                let edge_dst = unsafe { edge_dst.as_ref() };
                if std::ptr::eq(edge_dst.generation.load_raw(), dst.as_ptr().as_ptr()) {
                    // dst's collection is promised above, so skip the GC
                    // trigger even if this is the last count.
                    edge_dst.release(true);
                }
            }
        }

        // Stage 2: rewrite generation pointers, then splice the lists.
        for block in src_controls.iter() {
            // SAFETY: as above.
            let block = unsafe { block.as_ref() };
            debug_assert!(std::ptr::eq(
                block.generation.load_raw(),
                src.as_ptr().as_ptr()
            ));
            block.generation.store(Some(dst.clone()));
        }
        // SAFETY: both control lists are locked.
        unsafe { dst_controls.append(src_controls) };

        // src is empty now, so its promised collection is trivial: just
        // clear the flag (only if the promise is ours).
        if src_gc_requested {
            src.gc_flag.store(false, Ordering::Release);
        }

        // Re-claim dst's promise: the thread that held it may have
        // finished collecting before our blocks arrived.
        if !dst_gc_requested {
            dst_gc_requested = !dst.gc_flag.swap(true, Ordering::AcqRel);
        }
        dst_gc_requested
    }

    // ========================================================================
    // Collector
    // ========================================================================

    /// One collection run over this generation.
    pub(crate) fn collect(&self) {
        let mut unreachable: List<ControlBlock> = List::new();
        let mut destroyed = 0usize;

        {
            let mut controls = self.controls.write();

            // Clear the pending flag only after the critical section is
            // ours: everyone who requested before this point is served by
            // this run, everyone after registers a fresh run.
            self.gc_flag.store(false, Ordering::Release);

            tracing::debug!(seq = self.seq(), "collection started");

            // Phase 1: mark and sweep without blocking weak promotions.
            let wavefront_end = self.mark(&mut controls);
            if wavefront_end.is_null() {
                return;
            }
            let sweep_end = self.sweep(&mut controls, wavefront_end);
            if sweep_end.is_null() {
                return;
            }

            // Phase 2: same, with weak red-promotion locked out, so the
            // verdict on the remainder is final.
            let _no_promotions = RedPromotionExclusive::lock(self);

            let wavefront_end = self.phase2_mark(&mut controls, sweep_end);
            if wavefront_end.is_null() {
                return;
            }
            let reachable_end = self.phase2_sweep(&mut controls, wavefront_end);
            if reachable_end.is_null() {
                return;
            }

            // Phase 3: everything past the partition is unreachable and
            // RED with a zero count. Blacken, keep the blocks alive with
            // a control reference, and take them off the generation.
            let mut cursor = reachable_end;
            while let Some(block) = NonNull::new(cursor) {
                // SAFETY: `block` is linked; we hold the controls lock.
                cursor = unsafe { List::next(block) };
                let block_ref = unsafe { block.as_ref() };

                block_ref.inc_ref();
                let old = block_ref
                    .strong
                    .swap(pack(0, Color::Black), Ordering::Release);
                debug_assert_eq!(refs(old), 0);
                debug_assert_eq!(color(old), Color::Red);

                // SAFETY: moving the block between lists we own.
                unsafe {
                    controls.remove(block);
                    unreachable.push_back(block);
                }
                destroyed += 1;
            }
        } // All collector locks drop here.

        // Destruction phase, unlocked: clear the outgoing edges of every
        // unreachable block. Cross-generation releases may trip
        // collections elsewhere, which is exactly why no lock is held.
        for block in unreachable.iter() {
            // SAFETY: the unreachable list owns a control ref per block.
            let block = unsafe { block.as_ref() };
            let edges = block.edges.lock();
            for vertex in edges.iter() {
                // SAFETY: vertices stay linked while the edge lock is held.
                let vertex = unsafe { vertex.as_ref() };
                if let Some(edge_dst) = vertex.dst.take() {
                    if !std::ptr::eq(edge_dst.generation.load_raw(), self as *const _) {
                        edge_dst.release(false);
                    }
                }
            }
        }

        // Destroy the payloads and give up the collector's references.
        // SAFETY: list manipulation on the local unreachable list.
        while let Some(block) = unsafe { unreachable.pop_front() } {
            // SAFETY: the block is BLACK and off the generation; the
            // payload dies exactly once, outside all collector locks.
            unsafe {
                ControlBlock::drop_payload(block);
                ControlBlock::dec_ref(block);
            }
        }

        if destroyed > 0 {
            tracing::debug!(seq = self.seq(), destroyed, "collection finished");
        }
    }

    /// Phase 1 mark: color every block RED (zero count) or GREY, moving
    /// GREY blocks into the wavefront prefix. Returns the wavefront end
    /// (null when everything is reachable or the list is empty).
    fn mark(&self, controls: &mut List<ControlBlock>) -> *mut ControlBlock {
        let mut wavefront_end = controls.head();

        let mut cursor = controls.head();
        while let Some(block) = NonNull::new(cursor) {
            // SAFETY: `block` is linked; we hold the controls lock.
            let next = unsafe { List::next(block) };
            let block_ref = unsafe { block.as_ref() };

            let mut expect = pack(0, Color::White);
            loop {
                debug_assert_ne!(color(expect), Color::Black);
                if color(expect) == Color::Red {
                    // Already demoted; nothing to move.
                    cursor = next;
                    break;
                }
                let target = if refs(expect) == 0 {
                    Color::Red
                } else {
                    Color::Grey
                };
                match block_ref.strong.compare_exchange_weak(
                    expect,
                    pack(refs(expect), target),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        match target {
                            Color::Red => {}
                            _ if std::ptr::eq(wavefront_end, block.as_ptr()) => {
                                wavefront_end = next;
                            }
                            _ => {
                                // SAFETY: both nodes are linked here.
                                unsafe { controls.move_before(block, wavefront_end) };
                            }
                        }
                        cursor = next;
                        break;
                    }
                    Err(actual) => expect = actual,
                }
            }
        }

        wavefront_end
    }

    /// Phase 1 sweep: drain the wavefront, promoting each block GREY ->
    /// WHITE and pulling its same-generation RED targets (and late GREYs
    /// from red promotion) into the wavefront. Returns the partition
    /// point between reachable blocks and the residue.
    fn sweep(
        &self,
        controls: &mut List<ControlBlock>,
        mut wavefront_end: *mut ControlBlock,
    ) -> *mut ControlBlock {
        let mut wavefront_begin = controls.head();

        while !std::ptr::eq(wavefront_begin, wavefront_end) {
            let block = NonNull::new(wavefront_begin).expect("wavefront cursor inside the list");
            // SAFETY: `block` is linked; we hold the controls lock.
            let block_ref = unsafe { block.as_ref() };

            // Promote GREY to WHITE. The observed color may also be RED
            // if another thread re-demoted concurrently; overwrite that
            // too, the block is in the wavefront and being processed.
            let mut expect = block_ref.strong.load(Ordering::Relaxed);
            loop {
                debug_assert!(matches!(color(expect), Color::Grey | Color::Red));
                match block_ref.strong.compare_exchange_weak(
                    expect,
                    pack(refs(expect), Color::White),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => expect = actual,
                }
            }

            wavefront_end = self.scan_edges(controls, block_ref, wavefront_end, false);

            // SAFETY: still linked; splices only move other nodes.
            wavefront_begin = unsafe { List::next(block) };
        }

        wavefront_begin
    }

    /// Phase 2 mark: move everything that turned GREY during phase 1
    /// (red promotion) from the residue into a fresh wavefront starting
    /// at `tail`.
    fn phase2_mark(
        &self,
        controls: &mut List<ControlBlock>,
        tail: *mut ControlBlock,
    ) -> *mut ControlBlock {
        let mut wavefront_end = tail;

        let mut cursor = tail;
        while let Some(block) = NonNull::new(cursor) {
            // SAFETY: `block` is linked; we hold the controls lock.
            let next = unsafe { List::next(block) };
            let block_ref = unsafe { block.as_ref() };

            let c = color(block_ref.strong.load(Ordering::Acquire));
            debug_assert!(matches!(c, Color::Grey | Color::Red));
            if c == Color::Grey {
                if std::ptr::eq(wavefront_end, block.as_ptr()) {
                    wavefront_end = next;
                } else {
                    // SAFETY: both nodes are linked here.
                    unsafe { controls.move_before(block, wavefront_end) };
                }
            }
            cursor = next;
        }

        wavefront_end
    }

    /// Phase 2 sweep: like phase 1's, but promotions are locked out, so
    /// whatever stays RED afterwards is garbage for sure. Walks from the
    /// list head, skipping blocks phase 1 already whitened.
    fn phase2_sweep(
        &self,
        controls: &mut List<ControlBlock>,
        mut wavefront_end: *mut ControlBlock,
    ) -> *mut ControlBlock {
        let mut cursor = controls.head();

        while !std::ptr::eq(cursor, wavefront_end) {
            let block = NonNull::new(cursor).expect("phase-2 cursor inside the list");
            // SAFETY: `block` is linked; we hold the controls lock.
            let block_ref = unsafe { block.as_ref() };

            let mut expect = pack(0, Color::Grey);
            let mut already_white = false;
            loop {
                if color(expect) == Color::White {
                    already_white = true;
                    break;
                }
                debug_assert_eq!(color(expect), Color::Grey);
                match block_ref.strong.compare_exchange_weak(
                    expect,
                    pack(refs(expect), Color::White),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => expect = actual,
                }
            }

            if !already_white {
                wavefront_end = self.scan_edges(controls, block_ref, wavefront_end, true);
            }

            // SAFETY: still linked; splices only move other nodes.
            cursor = unsafe { List::next(block) };
        }

        wavefront_end
    }

    /// Examine one wavefront block's outgoing edges: same-generation RED
    /// targets are promoted GREY and spliced into the wavefront. In
    /// phase 2 (`final_pass`) only RED targets move; in phase 1 a target
    /// that is already GREY from red promotion is (re)spliced too.
    fn scan_edges(
        &self,
        controls: &mut List<ControlBlock>,
        block: &ControlBlock,
        mut wavefront_end: *mut ControlBlock,
        final_pass: bool,
    ) -> *mut ControlBlock {
        let edges = block.edges.lock();
        for vertex in edges.iter() {
            // SAFETY: vertices stay linked while the edge lock is held.
            let vertex = unsafe { vertex.as_ref() };

            // A counted load: the target may live in another generation
            // and die concurrently.
            let Some(edge_dst) = vertex.dst.load() else {
                continue;
            };
            if !std::ptr::eq(edge_dst.generation.load_raw(), self as *const _) {
                // Edges leaving the generation hold their own strong
                // reference; not this collection's business.
                continue;
            }

            let mut expect = pack(0, Color::Red);
            let mut promoted_or_grey = false;
            loop {
                match color(expect) {
                    Color::White => break,
                    Color::Grey if final_pass => break,
                    Color::Grey => {
                        // Red-promoted during phase 1; make sure it is in
                        // the wavefront (a benign re-splice if it already
                        // is).
                        promoted_or_grey = true;
                        break;
                    }
                    Color::Red => {}
                    Color::Black => unreachable!("BLACK block on a live edge"),
                }
                match edge_dst.strong.compare_exchange_weak(
                    expect,
                    pack(refs(expect), Color::Grey),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        promoted_or_grey = true;
                        break;
                    }
                    Err(actual) => expect = actual,
                }
            }
            if !promoted_or_grey {
                continue;
            }

            let dst_node = edge_dst.as_ptr();
            debug_assert!(!std::ptr::eq(dst_node.as_ptr(), block as *const _ as *mut _));
            if std::ptr::eq(wavefront_end, dst_node.as_ptr()) {
                // SAFETY: linked; we hold the controls lock.
                wavefront_end = unsafe { List::next(dst_node) };
            } else {
                // SAFETY: both nodes are linked in this generation's list.
                unsafe { controls.move_before(dst_node, wavefront_end) };
            }
        }

        wavefront_end
    }
}

// ============================================================================
// Lock guards
// ============================================================================

/// Shared hold on a generation's merge lock, keeping the generation alive.
/// Taken by edge creation; blocks merges of that generation.
pub(crate) struct MergeShared {
    gen: Counted<Generation>,
}

impl MergeShared {
    pub(crate) fn lock(gen: Counted<Generation>) -> Self {
        gen.merge_mtx.lock_shared();
        Self { gen }
    }

    pub(crate) fn generation(&self) -> &Counted<Generation> {
        &self.gen
    }
}

impl Drop for MergeShared {
    fn drop(&mut self) {
        // SAFETY: locked shared in `lock`.
        unsafe { self.gen.merge_mtx.unlock_shared() };
    }
}

/// Exclusive hold on a generation's merge lock.
struct MergeExclusive {
    gen: Counted<Generation>,
}

impl MergeExclusive {
    fn lock(gen: Counted<Generation>) -> Self {
        gen.merge_mtx.lock_exclusive();
        Self { gen }
    }
}

impl Drop for MergeExclusive {
    fn drop(&mut self) {
        // SAFETY: locked exclusive in `lock`.
        unsafe { self.gen.merge_mtx.unlock_exclusive() };
    }
}

/// Shared hold on a generation's red-promotion lock, for weak->strong
/// promotion of RED blocks.
pub(crate) struct RedPromotionShared {
    gen: Counted<Generation>,
}

impl RedPromotionShared {
    pub(crate) fn lock(gen: Counted<Generation>) -> Self {
        gen.red_promotion.lock_shared();
        Self { gen }
    }

    pub(crate) fn generation(&self) -> &Counted<Generation> {
        &self.gen
    }
}

impl Drop for RedPromotionShared {
    fn drop(&mut self) {
        // SAFETY: locked shared in `lock`.
        unsafe { self.gen.red_promotion.unlock_shared() };
    }
}

/// Collector phase 2's exclusive hold on the red-promotion lock.
struct RedPromotionExclusive<'a> {
    gen: &'a Generation,
}

impl<'a> RedPromotionExclusive<'a> {
    fn lock(gen: &'a Generation) -> Self {
        gen.red_promotion.lock_exclusive();
        Self { gen }
    }
}

impl Drop for RedPromotionExclusive<'_> {
    fn drop(&mut self) {
        // SAFETY: locked exclusive in `lock`.
        unsafe { self.gen.red_promotion.unlock_exclusive() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequences_step_by_two_with_moveable_bit() {
        let a = Generation::fresh();
        let b = Generation::fresh();
        assert!(a.seq() & MOVEABLE_BIT != 0);
        assert!(b.seq() & MOVEABLE_BIT != 0);
        assert!(a.seq() < b.seq());
        assert_eq!((b.base_seq() - a.base_seq()) % 2, 0);
    }

    #[test]
    fn order_invariant_masks_moveable_bit() {
        let a = Generation::fresh();
        let b = Generation::fresh();
        assert!(Generation::order_invariant(&a, &b));
        assert!(!Generation::order_invariant(&b, &a));
        assert!(!Generation::order_invariant(&a, &a));
    }

    #[test]
    fn lowering_requires_the_moveable_bit() {
        let a = Generation::fresh();
        let b = Generation::fresh();

        // b is newer; lowering it below a resolves a b->a edge.
        assert!(b.is_moveable());
        assert!(b.try_lower_below(&a));
        assert!(Generation::order_invariant(&b, &a));

        // A generation with an in-edge recorded cannot be lowered.
        let c = Generation::fresh();
        let d = Generation::fresh();
        d.clear_moveable();
        assert!(!d.is_moveable());
        assert!(!d.try_lower_below(&c));
    }

    #[test]
    fn lowering_stops_at_the_floor() {
        let low = Generation::with_seq(SEQ_FLOOR);
        let high = Generation::fresh();
        // No room below the floor.
        assert!(!high.try_lower_below(&low));
    }

    #[test]
    fn reserved_generation_orders_before_everything() {
        let reserved = Generation::reserved();
        let live = Generation::fresh();
        assert_eq!(reserved.seq(), UNOWNED_SEQ);
        assert!(Generation::order_invariant(&reserved, &live));
    }
}
