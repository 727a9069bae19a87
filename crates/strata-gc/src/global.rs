//! Per-thread heap instance
//!
//! Runtimes that want one heap per mutator thread can use this module
//! instead of threading a [`Heap`] through every call. The heap has an
//! explicit lifecycle: [`init`] (or the first [`with_heap`]) creates it and
//! [`shutdown`] tears it down. Tests should build their own `Heap` values.

use std::cell::RefCell;

use crate::config::GcConfig;
use crate::error::Result;
use crate::heap::Heap;

thread_local! {
    static THREAD_HEAP: RefCell<Option<Heap>> = const { RefCell::new(None) };
}

/// Create this thread's heap. Returns `false` if it already exists, in which
/// case `config` is ignored.
pub fn init(config: GcConfig) -> Result<bool> {
    THREAD_HEAP.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(Heap::with_config(config)?);
        Ok(true)
    })
}

/// Whether this thread's heap exists
pub fn is_initialized() -> bool {
    THREAD_HEAP.with(|slot| slot.borrow().is_some())
}

/// Run `f` against this thread's heap, creating it from
/// [`GcConfig::from_env`] on first use.
///
/// # Panics
///
/// Panics if called from inside another `with_heap` on the same thread.
/// Finalizers receive the heap as an argument and never need this.
pub fn with_heap<R>(f: impl FnOnce(&mut Heap) -> R) -> R {
    THREAD_HEAP.with(|slot| {
        let mut slot = slot.borrow_mut();
        let heap = slot.get_or_insert_with(|| {
            Heap::with_config(GcConfig::from_env()).unwrap_or_default()
        });
        f(heap)
    })
}

/// Tear down this thread's heap: final full collection, then every
/// remaining object is released. Returns the number released at teardown,
/// or `None` if there was no heap.
pub fn shutdown() -> Option<usize> {
    let heap = THREAD_HEAP.with(|slot| slot.borrow_mut().take())?;
    Some(heap.shutdown())
}
