//! Thread-safe cycle-collecting smart pointers.
//!
//! `cycle-rc` provides reference-counted shared ownership, like
//! `Arc<T>`, that also reclaims reference *cycles*. Instead of tracing
//! the whole heap, objects are grouped into **generations** and a
//! concurrent mark-sweep collector runs on one generation at a time;
//! plain pointer reads, writes and clones stay lock-free.
//!
//! # Pointer types
//!
//! - [`Gc<T>`]: a strong owner, for references into the managed graph
//!   from the outside (locals, globals, unmanaged collections).
//! - [`Member<T>`]: a managed pointer *field*, one edge of the object
//!   graph. Member edges are what the collector can see, so cycles made
//!   of members do not leak.
//! - [`Weak<T>`]: a non-owning pointer with `upgrade()`.
//!
//! # Example
//!
//! ```
//! use cycle_rc::{Gc, Member};
//! use parking_lot::Mutex;
//!
//! struct Node {
//!     parent: Mutex<Member<Node>>,
//!     value: i32,
//! }
//!
//! let root = Gc::new_cyclic(|owner| Node {
//!     parent: Mutex::new(owner.member()),
//!     value: 0,
//! });
//! let child = Gc::new_cyclic(|owner| {
//!     let mut parent = owner.member();
//!     parent.set(Some(&root));
//!     Node {
//!         parent: Mutex::new(parent),
//!         value: 1,
//!     }
//! });
//!
//! // A parent <-> child cycle would leak under plain reference
//! // counting; here it is collected once both Gc handles drop.
//! root.parent.lock().set(Some(&child));
//! drop(root);
//! drop(child);
//! ```
//!
//! # How collection works
//!
//! Every object's control block carries a bit-packed (count, color) word.
//! Dropping a strong count to zero requests a collection on the object's
//! generation; the collector colors blocks RED (possibly dead) or GREY
//! (reachable), chases member edges, and destroys whatever stayed RED.
//! Mutation is allowed while the collector runs: taking a reference to a
//! RED block simultaneously re-colors it GREY (*red promotion*), and the
//! collector re-checks such blocks in a second pass.
//!
//! Cross-generation edges keep the generations totally ordered; an edge
//! that would break the order merges the two generations so every cycle
//! eventually lives inside a single generation, where its collector can
//! see all of it.
//!
//! Embedders that cannot run collections inline can install a
//! [delay-GC hook](set_delay_gc) (or use the `tokio` feature) to route
//! them to an executor.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod color;
mod control;
mod counted;
mod delay;
mod generation;
mod hazard;
mod list;
mod publisher;
mod ptr;
mod vertex;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use delay::{delay_gc, set_delay_gc, DelayGc, GcOperation};
pub use ptr::{publish, Gc, Member, Owner, Publication, Weak};

use thiserror::Error;

/// Allocation of a control block failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("allocation of a cycle-collected block failed")]
pub struct AllocError;

/// No published address range covers the queried location.
///
/// Returned by [`Member::adopt`]; owner lookups only make sense inside a
/// publication, so callers treat this as a programming error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no published control block covers the given address range")]
pub struct LookupError;
