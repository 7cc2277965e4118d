//! Vertices: the per-edge endpoints of the object graph.
//!
//! A vertex is one outgoing pointer slot owned by a control block. It
//! pins its owner's metadata with a control reference, sits on the
//! owner's edge list so the collector and the merge protocol can walk the
//! outgoing edges, and holds its destination in a hazard-protected cell.
//!
//! Retargeting is where the cross-generation bookkeeping happens: a
//! same-generation edge holds no strong reference (the collector sees it),
//! a cross-generation edge holds exactly one, and an edge that would
//! violate the generation ordering first drives the merge protocol.

use std::ptr::NonNull;

use crate::color::{color, refs, Color};
use crate::control::ControlBlock;
use crate::counted::Counted;
use crate::generation::{Generation, MergeShared};
use crate::hazard::HazardCell;
use crate::list::{Linked, ListHook};

/// One outgoing edge slot. Heap-pinned (boxed) by its façade wrapper so
/// the edge-list hooks stay valid when the enclosing value moves.
pub(crate) struct Vertex {
    /// The owning control block; fixed for the vertex's lifetime.
    owner: Counted<ControlBlock>,
    /// The destination control block, if any. The cell's counted slot
    /// carries the edge's control reference; a cross-generation edge
    /// additionally accounts one strong reference on the destination.
    pub(crate) dst: HazardCell<ControlBlock>,
    hook: ListHook<Vertex>,
}

unsafe impl Linked for Vertex {
    fn hook(&self) -> &ListHook<Self> {
        &self.hook
    }
}

impl Vertex {
    /// Allocate a vertex bound to `owner` and link it on the owner's edge
    /// list. Destination starts null.
    pub(crate) fn attach(owner: Counted<ControlBlock>) -> NonNull<Vertex> {
        let vertex = NonNull::from(Box::leak(Box::new(Vertex {
            owner,
            dst: HazardCell::null(),
            hook: ListHook::new(),
        })));
        // SAFETY: freshly boxed, stable address, not yet linked.
        unsafe { vertex.as_ref() }.owner.push_edge(vertex);
        vertex
    }

    /// Retarget to null, unlink from the owner, and free the vertex.
    ///
    /// # Safety
    ///
    /// `this` must come from [`Vertex::attach`] and not be used again.
    pub(crate) unsafe fn detach(this: NonNull<Vertex>) {
        let vertex = unsafe { this.as_ref() };
        vertex.reset();
        vertex.owner.remove_edge(this);
        // SAFETY: allocated in `attach`, now unlinked and unreachable.
        drop(unsafe { Box::from_raw(this.as_ptr()) });
    }

    /// Take the owner generation's merge lock in shared mode, re-locking
    /// until the generation stops moving underneath us.
    fn lock_owner_generation(&self) -> MergeShared {
        let mut gen = self
            .owner
            .generation
            .load()
            .expect("live owner has a generation");
        loop {
            let guard = MergeShared::lock(gen);
            if std::ptr::eq(
                guard.generation().as_ptr().as_ptr(),
                self.owner.generation.load_raw(),
            ) {
                return guard;
            }
            gen = self
                .owner
                .generation
                .load()
                .expect("live owner has a generation");
        }
    }

    /// Retarget to null.
    ///
    /// If the old destination was in a different generation, the edge's
    /// strong reference is released (which may request a collection
    /// there). A same-generation target keeps its count but gets a
    /// collection request if it just became count-zero garbage.
    pub(crate) fn reset(&self) {
        if self.owner.expired() {
            // The collector already cleared this edge while finalizing
            // the owner; writes through an expired owner are no-ops.
            debug_assert!(self.dst.load_raw().is_null());
            return;
        }
        if self.dst.load_raw().is_null() {
            return;
        }

        let merge_lck = self.lock_owner_generation();

        let old_dst = self.dst.take();
        let mut release_old = false;
        let mut collect_old = false;
        if let Some(old) = &old_dst {
            if std::ptr::eq(
                old.generation.load_raw(),
                merge_lck.generation().as_ptr().as_ptr(),
            ) {
                // The count may legitimately be zero here, so the edge
                // cannot hand a reference out; at most it owes the block
                // a collection.
                let word = old.strong.load(std::sync::atomic::Ordering::Relaxed);
                if refs(word) == 0 && color(word) != Color::Black {
                    collect_old = true;
                }
            } else {
                release_old = true;
            }
        }
        drop(merge_lck);

        // Count updates happen outside the merge lock: a release can
        // cascade into collections on other generations.
        if let Some(old) = old_dst {
            if release_old {
                old.release(false);
            } else if collect_old {
                old.request_gc();
            }
        }
    }

    /// Retarget to `new_dst`.
    ///
    /// `has_reference` says the caller transfers an already-acquired
    /// strong reference on `new_dst`; it is adopted for a cross-generation
    /// edge and consumed for a same-generation one. Without it the
    /// appropriate acquire runs for cross-generation edges only
    /// (`no_red_promotion` picks the cheap variant). `has_reference`
    /// implies `no_red_promotion`.
    pub(crate) fn set(
        &self,
        new_dst: Option<Counted<ControlBlock>>,
        has_reference: bool,
        no_red_promotion: bool,
    ) {
        debug_assert!(!has_reference || no_red_promotion);

        let Some(new_dst) = new_dst else {
            self.reset();
            return;
        };

        if self.owner.expired() {
            // Writes through an expired owner are no-ops; an inbound
            // reference has no edge to live in, give it back.
            if has_reference {
                new_dst.release(false);
            }
            return;
        }

        // Same destination: the exchange below would drop the edge's own
        // reference, so short-circuit.
        if std::ptr::eq(self.dst.load_raw(), new_dst.as_ptr().as_ptr()) {
            if has_reference {
                new_dst.release(false);
            }
            return;
        }

        // Deferred count adjustments, applied after the merge lock drops.
        let mut drop_new_reference = false;

        let mut merge_lck = self.lock_owner_generation();

        let dst_gen_raw = new_dst.generation.load_raw();
        if std::ptr::eq(dst_gen_raw, merge_lck.generation().as_ptr().as_ptr()) {
            // Same generation: the edge is internal and must not count.
            drop_new_reference = has_reference;
        } else {
            let dst_gen = new_dst
                .generation
                .load()
                .expect("live destination has a generation");
            // The destination generation gains an in-edge: freeze its
            // sequence before judging the invariant, so a concurrent
            // lowering cannot invalidate the judgement.
            dst_gen.clear_moveable();

            if Generation::order_invariant(merge_lck.generation(), &dst_gen) {
                if !has_reference {
                    if no_red_promotion {
                        new_dst.acquire_no_red();
                    } else {
                        new_dst.acquire();
                    }
                }
            } else {
                // Reordering of generations needed.
                drop(merge_lck);
                merge_lck = Generation::fix_ordering(&self.owner, &new_dst);

                if std::ptr::eq(
                    new_dst.generation.load_raw(),
                    merge_lck.generation().as_ptr().as_ptr(),
                ) {
                    // Merged into the owner's generation: internal edge.
                    drop_new_reference = has_reference;
                } else {
                    // Ordering fixed, still cross-generation.
                    if !has_reference {
                        if no_red_promotion {
                            new_dst.acquire_no_red();
                        } else {
                            new_dst.acquire();
                        }
                    }
                }
            }
        }

        // Install the edge. The slot takes its own control reference; the
        // local handle stays for the deferred updates below.
        let old_dst = self.dst.swap(Some(new_dst.clone()));

        let mut release_old = false;
        let mut collect_old = false;
        if let Some(old) = &old_dst {
            if std::ptr::eq(
                old.generation.load_raw(),
                merge_lck.generation().as_ptr().as_ptr(),
            ) {
                let word = old.strong.load(std::sync::atomic::Ordering::Relaxed);
                if refs(word) == 0 && color(word) != Color::Black {
                    collect_old = true;
                }
            } else {
                release_old = true;
            }
        }

        drop(merge_lck);

        // Reference counters last, outside the lock.
        if drop_new_reference {
            new_dst.release(false);
        }
        if let Some(old) = old_dst {
            if release_old {
                old.release(false);
            } else if collect_old {
                old.request_gc();
            }
        }
    }
}
