//! Managed object layout
//!
//! Every managed value is stored as an [`ObjectBox`]: a fixed
//! [`ObjectHeader`] followed by the payload. The header carries the
//! reference count, tracking state and collector scratch space; the payload
//! type is reached through a per-type [`TypeInfo`] vtable.

use std::alloc::Layout;
use std::any::TypeId;
use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use bitflags::bitflags;

use crate::finalization::FinalizerError;
use crate::heap::Heap;

/// Handle to a managed object.
///
/// An `ObjRef` is a plain address: copying it does not touch the reference
/// count. Hosts call [`Heap::incref`] when they store one and
/// [`Heap::decref`] when they drop it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(NonNull<ObjectHeader>);

impl ObjRef {
    /// Address of the object header
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn from_header(ptr: NonNull<ObjectHeader>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub(crate) fn as_ptr(self) -> NonNull<ObjectHeader> {
        self.0
    }

    /// Header of the object.
    ///
    /// Internal code only calls this on references checked against the
    /// heap's live set (or held by the collector during a pass).
    #[inline]
    pub(crate) fn header<'a>(self) -> &'a ObjectHeader {
        // SAFETY: see above; the header lives as long as the object's block
        unsafe { self.0.as_ref() }
    }
}

impl std::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjRef({:#x})", self.addr())
    }
}

/// Trait for values stored on the managed heap
pub trait Managed: 'static {
    /// Whether values of this type are tracked by the cycle collector on
    /// allocation. Types that can never refer (directly or indirectly) to a
    /// tracked object should say `false` and are reclaimed purely by
    /// reference counting.
    const NEEDS_TRACE: bool;

    /// Whether [`finalize`](Managed::finalize) does anything.
    const HAS_FINALIZER: bool = false;

    /// Report every strong reference this value owns
    fn referents(&self, visit: &mut dyn FnMut(ObjRef));

    /// Type-level finalizer, run at most once before the object is freed.
    ///
    /// The payload is reachable through `heap.get::<Self>(this)`. Storing
    /// `this` somewhere (with an `incref`) resurrects the object.
    fn finalize(_heap: &mut Heap, _this: ObjRef) -> Result<(), FinalizerError> {
        Ok(())
    }
}

bitflags! {
    /// Per-object state bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct HeaderFlags: u8 {
        /// Participates in cycle detection
        const TRACKED      = 1 << 0;
        /// Finalizer has run (or been consumed)
        const FINALIZED    = 1 << 1;
        /// In scope of the running collection pass
        const COLLECTING   = 1 << 2;
        /// Held by the quarantine list
        const QUARANTINED  = 1 << 3;
        /// Tracked when its count reached zero; re-track if resurrected
        const WAS_TRACKED  = 1 << 4;
        /// Refcount-zero teardown in progress
        const DEALLOCATING = 1 << 5;
        /// Waiting on the teardown worklist
        const QUEUED       = 1 << 6;
    }
}

/// Which intrusive list an object is linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListId {
    /// Not linked
    Detached,
    /// Generation 0, 1 or 2
    Generation(u8),
    /// Found unreachable by the running pass
    Unreachable,
}

/// Universal object prologue
#[repr(C)]
pub struct ObjectHeader {
    /// Type vtable
    info: &'static TypeInfo,
    /// Strong holders
    refcount: Cell<usize>,
    /// Collector scratch; meaningful only during a pass
    gc_refs: Cell<isize>,
    flags: Cell<HeaderFlags>,
    list: Cell<ListId>,
    prev: Cell<Option<ObjRef>>,
    next: Cell<Option<ObjRef>>,
}

impl ObjectHeader {
    /// Fresh header: refcount 1, untracked.
    pub(crate) const fn new(info: &'static TypeInfo) -> Self {
        Self {
            info,
            refcount: Cell::new(1),
            gc_refs: Cell::new(0),
            flags: Cell::new(HeaderFlags::empty()),
            list: Cell::new(ListId::Detached),
            prev: Cell::new(None),
            next: Cell::new(None),
        }
    }

    #[inline]
    pub(crate) fn info(&self) -> &'static TypeInfo {
        self.info
    }

    #[inline]
    pub(crate) fn refcount(&self) -> usize {
        self.refcount.get()
    }

    #[inline]
    pub(crate) fn set_refcount(&self, count: usize) {
        self.refcount.set(count);
    }

    #[inline]
    pub(crate) fn gc_refs(&self) -> isize {
        self.gc_refs.get()
    }

    #[inline]
    pub(crate) fn set_gc_refs(&self, refs: isize) {
        self.gc_refs.set(refs);
    }

    #[inline]
    pub(crate) fn has(&self, flag: HeaderFlags) -> bool {
        self.flags.get().contains(flag)
    }

    #[inline]
    pub(crate) fn set(&self, flag: HeaderFlags, on: bool) {
        let mut flags = self.flags.get();
        flags.set(flag, on);
        self.flags.set(flags);
    }

    #[inline]
    pub(crate) fn list(&self) -> ListId {
        self.list.get()
    }

    /// Generation the object is linked into, if any.
    #[inline]
    pub(crate) fn generation(&self) -> Option<usize> {
        match self.list.get() {
            ListId::Generation(g) => Some(g as usize),
            _ => None,
        }
    }

    pub(crate) fn link(&self, list: ListId, prev: Option<ObjRef>, next: Option<ObjRef>) {
        self.list.set(list);
        self.prev.set(prev);
        self.next.set(next);
    }

    /// Detach and return the old `(prev, next)` neighbours.
    pub(crate) fn unlink(&self) -> (Option<ObjRef>, Option<ObjRef>) {
        self.list.set(ListId::Detached);
        (self.prev.take(), self.next.take())
    }

    #[inline]
    pub(crate) fn next(&self) -> Option<ObjRef> {
        self.next.get()
    }

    #[inline]
    pub(crate) fn set_next(&self, next: Option<ObjRef>) {
        self.next.set(next);
    }

    #[inline]
    pub(crate) fn set_prev(&self, prev: Option<ObjRef>) {
        self.prev.set(prev);
    }
}

/// Per-type vtable shared by every object of that type
pub struct TypeInfo {
    name: fn() -> &'static str,
    type_id: fn() -> TypeId,
    /// Layout of the whole `ObjectBox<T>`
    pub(crate) layout: Layout,
    pub(crate) needs_trace: bool,
    pub(crate) has_finalizer: bool,
    pub(crate) traverse: unsafe fn(ObjRef, &mut dyn FnMut(ObjRef)),
    pub(crate) finalize: fn(&mut Heap, ObjRef) -> Result<(), FinalizerError>,
    pub(crate) drop_value: unsafe fn(ObjRef),
}

impl TypeInfo {
    /// Payload type name
    pub fn name(&self) -> &'static str {
        (self.name)()
    }

    #[inline]
    pub(crate) fn is<T: 'static>(&self) -> bool {
        (self.type_id)() == TypeId::of::<T>()
    }
}

impl std::fmt::Debug for TypeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeInfo")
            .field("name", &self.name())
            .field("size", &self.layout.size())
            .field("needs_trace", &self.needs_trace)
            .finish()
    }
}

/// Header and payload laid out together in one block
#[repr(C)]
pub(crate) struct ObjectBox<T> {
    pub(crate) header: ObjectHeader,
    pub(crate) value: T,
}

struct VTable<T>(PhantomData<T>);

impl<T: Managed> VTable<T> {
    const INFO: &'static TypeInfo = &TypeInfo {
        name: std::any::type_name::<T>,
        type_id: TypeId::of::<T>,
        layout: Layout::new::<ObjectBox<T>>(),
        needs_trace: T::NEEDS_TRACE,
        has_finalizer: T::HAS_FINALIZER,
        traverse: traverse_box::<T>,
        finalize: T::finalize,
        drop_value: drop_box::<T>,
    };
}

/// Vtable for `T`
#[inline]
pub(crate) fn type_info<T: Managed>() -> &'static TypeInfo {
    VTable::<T>::INFO
}

/// Trace function for object boxes
unsafe fn traverse_box<T: Managed>(obj: ObjRef, visit: &mut dyn FnMut(ObjRef)) {
    let boxed = obj.as_ptr().cast::<ObjectBox<T>>();
    // SAFETY: the vtable is only reachable from headers of ObjectBox<T>
    unsafe { (*boxed.as_ptr()).value.referents(visit) }
}

/// Drop function for object boxes: drops the payload in place, the block
/// itself goes back to the allocator separately.
unsafe fn drop_box<T: Managed>(obj: ObjRef) {
    let boxed = obj.as_ptr().cast::<ObjectBox<T>>();
    // SAFETY: payload is initialized and dropped exactly once
    unsafe { std::ptr::drop_in_place(&mut (*boxed.as_ptr()).value) }
}

/// Collect the direct referents of `obj`.
pub(crate) fn referents_of(obj: ObjRef) -> Vec<ObjRef> {
    let mut out = Vec::new();
    // SAFETY: obj is live (caller contract for every ObjRef reaching here)
    unsafe { (obj.header().info().traverse)(obj, &mut |r| out.push(r)) };
    out
}

// Leaf payloads: no references, never tracked.
macro_rules! impl_leaf {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Managed for $ty {
                const NEEDS_TRACE: bool = false;
                fn referents(&self, _visit: &mut dyn FnMut(ObjRef)) {}
            }
        )*
    };
}

impl_leaf!((), bool, i32, i64, u64, f64, String, Vec<u8>);

/// A plain list of strong references.
impl Managed for Vec<ObjRef> {
    const NEEDS_TRACE: bool = true;

    fn referents(&self, visit: &mut dyn FnMut(ObjRef)) {
        for &obj in self {
            visit(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_defaults() {
        let header = ObjectHeader::new(type_info::<i64>());
        assert_eq!(header.refcount(), 1);
        assert_eq!(header.list(), ListId::Detached);
        assert_eq!(header.generation(), None);
        assert!(!header.has(HeaderFlags::TRACKED));
        assert!(!header.has(HeaderFlags::FINALIZED));
    }

    #[test]
    fn test_header_flags() {
        let header = ObjectHeader::new(type_info::<i64>());
        header.set(HeaderFlags::TRACKED, true);
        header.set(HeaderFlags::FINALIZED, true);
        assert!(header.has(HeaderFlags::TRACKED));
        header.set(HeaderFlags::TRACKED, false);
        assert!(!header.has(HeaderFlags::TRACKED));
        assert!(header.has(HeaderFlags::FINALIZED));
    }

    #[test]
    fn test_type_info() {
        let info = type_info::<String>();
        assert!(info.is::<String>());
        assert!(!info.is::<i64>());
        assert!(!info.needs_trace);
        assert!(info.name().contains("String"));
        assert!(type_info::<Vec<ObjRef>>().needs_trace);
        // Same vtable for every call
        assert!(std::ptr::eq(type_info::<String>(), type_info::<String>()));
    }
}
