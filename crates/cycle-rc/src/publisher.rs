//! Address-range publication of control blocks under construction.
//!
//! While a payload is being constructed, its storage range is published in
//! a process-wide map so that nested objects (members of the payload, or
//! elements built by an owner-aware allocator) can find the owning control
//! block from nothing but their own address. The map is global rather than
//! thread-local: a constructor may legitimately migrate threads, and the
//! publication must stay visible wherever construction resumes.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::OnceLock;

use parking_lot::RwLock;

use crate::control::ControlBlock;
use crate::counted::Counted;
use crate::LookupError;

type RangeMap = BTreeMap<usize, Publication>;

struct Publication {
    len: usize,
    control: NonNull<ControlBlock>,
}

// SAFETY: the map only lends the control pointer out as a freshly counted
// reference; control blocks are Sync.
unsafe impl Send for Publication {}
unsafe impl Sync for Publication {}

fn registry() -> &'static RwLock<RangeMap> {
    static REGISTRY: OnceLock<RwLock<RangeMap>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(BTreeMap::new()))
}

/// RAII publication of `[addr, addr + len)` as owned by `control`.
///
/// The range is unpublished on drop, on both the success and the panic
/// path of the construction it brackets.
pub(crate) struct PublishGuard {
    addr: usize,
}

impl PublishGuard {
    /// Publish the range. The caller keeps `control` alive for the guard's
    /// lifetime (the registry itself holds no count).
    pub(crate) fn publish(addr: usize, len: usize, control: NonNull<ControlBlock>) -> Self {
        let previous = registry()
            .write()
            .insert(addr, Publication { len, control });
        debug_assert!(previous.is_none(), "address range published twice");
        Self { addr }
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        let removed = registry().write().remove(&self.addr);
        debug_assert!(removed.is_some());
    }
}

/// Find the control block whose published range covers `[addr, addr + len)`.
///
/// The covering range is the predecessor by base address whose end reaches
/// past the query; anything else is a miss.
pub(crate) fn lookup(addr: usize, len: usize) -> Result<Counted<ControlBlock>, LookupError> {
    let map = registry().read();

    let (base, publication) = map.range(..=addr).next_back().ok_or(LookupError)?;
    if base + publication.len < addr + len {
        return Err(LookupError);
    }

    // SAFETY: the publisher holds the block alive for the duration of the
    // publication, and we hold the registry lock.
    Ok(unsafe { Counted::retaining(publication.control) })
}
