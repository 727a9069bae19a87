//! # Strata managed heap
//!
//! Reference counting with a generational cycle collector.
//!
//! ## Design
//!
//! - **Reference counting**: every object carries a count of strong
//!   holders; reaching zero frees it immediately, cascading to its
//!   referents through an explicit worklist
//! - **Cycle collection**: objects that may hold references are tracked in
//!   three generations; trial deletion finds cycles kept alive only by
//!   themselves
//! - **Finalization**: finalizers run before any member of a garbage batch
//!   is freed; resurrected objects survive, failing ones are quarantined
//! - **Storage**: blocks come from the non-moving `strata-alloc` allocator
//!
//! ```
//! use strata_gc::{Heap, ObjRef};
//!
//! let mut heap = Heap::new();
//! let a = heap.alloc(Vec::<ObjRef>::new()).unwrap();
//! let b = heap.alloc(vec![a]).unwrap();
//! heap.incref(a).unwrap();
//! heap.incref(b).unwrap();
//! heap.get_mut::<Vec<ObjRef>>(a).unwrap().push(b);
//!
//! heap.decref(a).unwrap();
//! heap.decref(b).unwrap();
//! assert_eq!(heap.collect(2).unwrap(), 2);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

mod collector;
pub mod config;
pub mod error;
pub mod finalization;
mod generation;
pub mod global;
mod heap;
mod list;
pub mod object;
mod refcount;

pub use config::{DebugFlags, GcConfig, NUM_GENERATIONS};
pub use error::{GcError, InvariantViolation, Result};
pub use finalization::{FinalizerError, FinalizerFailure, FinalizerResult, WeakFinalizer};
pub use generation::GenerationStats;
pub use heap::Heap;
pub use object::{Managed, ObjRef, ObjectHeader, TypeInfo};
pub use strata_alloc::{AllocConfig, AllocStats};
