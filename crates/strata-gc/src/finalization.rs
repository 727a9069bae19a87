//! Finalization support
//!
//! Two kinds of callbacks run before an object's storage is reclaimed:
//!
//! - **Finalizers**: the type-level [`Managed::finalize`] and at most one
//!   callback registered with [`Heap::register_finalizer`]. They receive the
//!   object and may resurrect it. They run at most once per object.
//! - **Weak finalizers** ([`Heap::finalize_weak`]): cleanup closures stored
//!   outside the object. They fire exactly once, on whichever reclamation
//!   path reaches the object first, and never see the object itself.
//!
//! [`Managed::finalize`]: crate::Managed::finalize

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::error::{GcError, Result};
use crate::heap::Heap;
use crate::object::{HeaderFlags, ObjRef};

/// A finalizer reported failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct FinalizerError {
    message: String,
}

impl FinalizerError {
    /// Failure with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Outcome of a finalizer callback
pub type FinalizerResult = std::result::Result<(), FinalizerError>;

/// Callback registered with [`Heap::register_finalizer`]
pub type Finalizer = Box<dyn FnOnce(&mut Heap, ObjRef) -> FinalizerResult>;

/// Callback registered with [`Heap::finalize_weak`]
pub type WeakCallback = Box<dyn FnOnce(&mut Heap) -> FinalizerResult>;

/// Failure recorded for the host.
///
/// The object may already be freed, so only its address and type survive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizerFailure {
    /// Address of the object whose finalizer failed
    pub object: usize,
    /// Payload type name
    pub type_name: &'static str,
    /// What the finalizer reported
    pub error: FinalizerError,
}

/// Handle to a weak finalizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakFinalizer(u64);

struct WeakEntry {
    target: ObjRef,
    callback: WeakCallback,
}

/// Callbacks keyed by object, stored outside the objects themselves.
#[derive(Default)]
pub(crate) struct FinalizerRegistry {
    callbacks: FxHashMap<ObjRef, Finalizer>,
    weak: FxHashMap<WeakFinalizer, WeakEntry>,
    /// Weak finalizers per target, in registration order
    by_target: FxHashMap<ObjRef, Vec<WeakFinalizer>>,
    next_id: u64,
}

impl FinalizerRegistry {
    fn register(&mut self, obj: ObjRef, callback: Finalizer) {
        self.callbacks.insert(obj, callback);
    }

    fn has_callback(&self, obj: ObjRef) -> bool {
        self.callbacks.contains_key(&obj)
    }

    fn take_callback(&mut self, obj: ObjRef) -> Option<Finalizer> {
        self.callbacks.remove(&obj)
    }

    fn register_weak(&mut self, target: ObjRef, callback: WeakCallback) -> WeakFinalizer {
        let handle = WeakFinalizer(self.next_id);
        self.next_id += 1;
        self.weak.insert(handle, WeakEntry { target, callback });
        self.by_target.entry(target).or_default().push(handle);
        handle
    }

    fn is_pending(&self, handle: WeakFinalizer) -> bool {
        self.weak.contains_key(&handle)
    }

    /// Remove one weak finalizer, returning its callback if still pending.
    fn take_weak(&mut self, handle: WeakFinalizer) -> Option<WeakCallback> {
        let entry = self.weak.remove(&handle)?;
        if let Some(handles) = self.by_target.get_mut(&entry.target) {
            handles.retain(|h| *h != handle);
            if handles.is_empty() {
                self.by_target.remove(&entry.target);
            }
        }
        Some(entry.callback)
    }

    /// Remove every weak finalizer attached to `target`.
    fn take_weak_for(&mut self, target: ObjRef) -> Vec<WeakCallback> {
        let Some(handles) = self.by_target.remove(&target) else {
            return Vec::new();
        };
        handles
            .into_iter()
            .filter_map(|handle| self.weak.remove(&handle))
            .map(|entry| entry.callback)
            .collect()
    }

    /// Drop whatever is still attached to a freed object.
    pub(crate) fn forget(&mut self, obj: ObjRef) {
        self.callbacks.remove(&obj);
        for handle in self.by_target.remove(&obj).unwrap_or_default() {
            self.weak.remove(&handle);
        }
    }

    pub(crate) fn weak_len(&self) -> usize {
        self.weak.len()
    }
}

impl Heap {
    /// Attach a finalizer callback to `obj`.
    ///
    /// It runs at most once, before the object's storage is reclaimed,
    /// after the type-level finalizer if the type has one. Registering again
    /// replaces a callback that has not run yet.
    pub fn register_finalizer<F>(&mut self, obj: ObjRef, callback: F) -> Result<()>
    where
        F: FnOnce(&mut Heap, ObjRef) -> FinalizerResult + 'static,
    {
        let header = self.header(obj)?;
        if header.has(HeaderFlags::FINALIZED) {
            return Err(GcError::AlreadyFinalized);
        }
        self.finalizers.register(obj, Box::new(callback));
        Ok(())
    }

    /// Register a cleanup callback that fires once when `obj` is reclaimed.
    ///
    /// `args` are moved into the callback. The callback never receives the
    /// object; it must not capture a strong reference to it either, or the
    /// object can never become garbage.
    pub fn finalize_weak<A, F>(&mut self, obj: ObjRef, callback: F, args: A) -> Result<WeakFinalizer>
    where
        A: 'static,
        F: FnOnce(&mut Heap, A) -> FinalizerResult + 'static,
    {
        self.header(obj)?;
        let callback: WeakCallback = Box::new(move |heap| callback(heap, args));
        Ok(self.finalizers.register_weak(obj, callback))
    }

    /// Whether the weak finalizer has neither fired nor been detached
    pub fn weak_finalizer_alive(&self, handle: WeakFinalizer) -> bool {
        self.finalizers.is_pending(handle)
    }

    /// Cancel a weak finalizer. Returns whether it was still pending.
    pub fn detach_weak_finalizer(&mut self, handle: WeakFinalizer) -> bool {
        self.finalizers.take_weak(handle).is_some()
    }

    /// Run a weak finalizer now. Returns `Ok(false)` if it already fired or
    /// was detached.
    pub fn invoke_weak_finalizer(&mut self, handle: WeakFinalizer) -> Result<bool> {
        match self.finalizers.take_weak(handle) {
            Some(callback) => {
                callback(self)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of weak finalizers still pending
    pub fn weak_finalizer_count(&self) -> usize {
        self.finalizers.weak_len()
    }

    /// Fire every weak finalizer attached to `obj`. Failures are recorded;
    /// returns whether any callback failed.
    pub(crate) fn fire_weak_finalizers(&mut self, obj: ObjRef) -> bool {
        let mut failed = false;
        for callback in self.finalizers.take_weak_for(obj) {
            if let Err(error) = callback(self) {
                self.record_failure(obj, error);
                failed = true;
            }
        }
        failed
    }

    /// Whether a finalizer still has to run before `obj` is freed.
    pub(crate) fn needs_finalization(&self, obj: ObjRef) -> bool {
        let header = obj.header();
        !header.has(HeaderFlags::FINALIZED)
            && (header.info().has_finalizer || self.finalizers.has_callback(obj))
    }

    /// Run the type finalizer, then the registered callback. Both run even
    /// if the first fails; the first failure is returned. The caller has
    /// already set the finalized bit.
    pub(crate) fn run_finalizers(&mut self, obj: ObjRef) -> FinalizerResult {
        let info = obj.header().info();
        let mut result = Ok(());
        if info.has_finalizer {
            result = (info.finalize)(self, obj);
        }
        if let Some(callback) = self.finalizers.take_callback(obj) {
            let registered = callback(self, obj);
            if result.is_ok() {
                result = registered;
            }
        }
        result
    }

    pub(crate) fn record_failure(&mut self, obj: ObjRef, error: FinalizerError) {
        let type_name = obj.header().info().name();

        #[cfg(feature = "gc_logging")]
        tracing::warn!(
            target: "strata::gc",
            object = obj.addr(),
            type_name,
            error = %error,
            "finalizer failed"
        );

        self.failures.push(FinalizerFailure {
            object: obj.addr(),
            type_name,
            error,
        });
    }

    /// Drain the finalizer failures recorded so far
    pub fn take_finalizer_failures(&mut self) -> Vec<FinalizerFailure> {
        std::mem::take(&mut self.failures)
    }

    /// Objects the collector refused to free.
    ///
    /// Each is kept alive by a reference owned by the quarantine and is no
    /// longer tracked.
    pub fn quarantine(&self) -> &[ObjRef] {
        &self.quarantine
    }

    /// Hand quarantined objects back to the heap.
    ///
    /// They are re-tracked into generation 2 and the quarantine's reference
    /// is dropped, so a later full collection reclaims them without running
    /// their finalizers again. Returns how many objects were released.
    pub fn clear_quarantine(&mut self) -> Result<usize> {
        let held = std::mem::take(&mut self.quarantine);
        let released = held.len();

        // Re-link everything first so the decrefs below see whole cycles.
        for &obj in &held {
            self.header(obj)?;
            let header = obj.header();
            header.set(HeaderFlags::QUARANTINED, false);
            if !header.has(HeaderFlags::TRACKED) {
                self.link(obj, 2);
            }
        }
        let mut first_error = None;
        for obj in held {
            if let Err(err) = self.decref(obj) {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(released),
        }
    }
}

impl From<GcError> for FinalizerError {
    fn from(err: GcError) -> Self {
        FinalizerError::new(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn test_registered_finalizer_runs_on_decref() {
        let mut heap = Heap::new();
        let obj = heap.alloc(3i64).unwrap();
        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        heap.register_finalizer(obj, move |heap, this| {
            assert_eq!(*heap.get::<i64>(this)?, 3);
            seen.set(seen.get() + 1);
            Ok(())
        })
        .unwrap();

        heap.decref(obj).unwrap();
        assert_eq!(calls.get(), 1);
        assert!(!heap.is_live(obj));
    }

    #[test]
    fn test_register_after_finalized_rejected() {
        let mut heap = Heap::new();
        let keeper = heap.alloc(Vec::<ObjRef>::new()).unwrap();
        let obj = heap.alloc(1i64).unwrap();
        heap.register_finalizer(obj, move |heap, this| {
            heap.incref(this)?;
            heap.get_mut::<Vec<ObjRef>>(keeper)?.push(this);
            Ok(())
        })
        .unwrap();

        heap.decref(obj).unwrap();
        assert!(heap.is_live(obj));
        assert!(heap.is_finalized(obj).unwrap());
        assert!(matches!(
            heap.register_finalizer(obj, |_, _| Ok(())),
            Err(GcError::AlreadyFinalized)
        ));
    }

    #[test]
    fn test_weak_finalizer_fires_once() {
        let mut heap = Heap::new();
        let obj = heap.alloc(String::from("target")).unwrap();
        let fired = Rc::new(Cell::new(0));
        let handle = heap
            .finalize_weak(
                obj,
                |_, (counter, amount): (Rc<Cell<i32>>, i32)| {
                    counter.set(counter.get() + amount);
                    Ok(())
                },
                (fired.clone(), 5),
            )
            .unwrap();
        assert!(heap.weak_finalizer_alive(handle));

        heap.decref(obj).unwrap();
        assert_eq!(fired.get(), 5);
        assert!(!heap.weak_finalizer_alive(handle));
        assert!(!heap.invoke_weak_finalizer(handle).unwrap());
        assert_eq!(fired.get(), 5);
    }

    #[test]
    fn test_weak_finalizer_invoke_and_detach() {
        let mut heap = Heap::new();
        let obj = heap.alloc(0i64).unwrap();
        let fired = Rc::new(Cell::new(0));

        let counter = fired.clone();
        let first = heap
            .finalize_weak(
                obj,
                move |_, ()| {
                    counter.set(counter.get() + 1);
                    Ok(())
                },
                (),
            )
            .unwrap();
        let counter = fired.clone();
        let second = heap
            .finalize_weak(
                obj,
                move |_, ()| {
                    counter.set(counter.get() + 10);
                    Ok(())
                },
                (),
            )
            .unwrap();

        assert!(heap.invoke_weak_finalizer(first).unwrap());
        assert_eq!(fired.get(), 1);
        assert!(heap.detach_weak_finalizer(second));
        assert!(!heap.detach_weak_finalizer(second));

        heap.decref(obj).unwrap();
        assert_eq!(fired.get(), 1);
        assert_eq!(heap.weak_finalizer_count(), 0);
    }

    #[test]
    fn test_eager_failure_is_reported_and_freed() {
        let mut heap = Heap::new();
        let obj = heap.alloc(9i64).unwrap();
        heap.register_finalizer(obj, |_, _| Err(FinalizerError::new("boom")))
            .unwrap();

        heap.decref(obj).unwrap();
        assert!(!heap.is_live(obj));
        let failures = heap.take_finalizer_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.message(), "boom");
        assert_eq!(failures[0].object, obj.addr());
        assert!(heap.take_finalizer_failures().is_empty());
    }

    #[test]
    fn test_invoke_propagates_failure() {
        let mut heap = Heap::new();
        let obj = heap.alloc(0i64).unwrap();
        let handle = heap
            .finalize_weak(obj, |_, ()| Err(FinalizerError::new("nope")), ())
            .unwrap();
        assert!(matches!(
            heap.invoke_weak_finalizer(handle),
            Err(GcError::Finalizer(_))
        ));
    }
}
