//! The managed heap
//!
//! Owns the block allocator, the live-object registry, the three
//! generations and all collector and finalization state. Reference-count
//! operations live in [`refcount`](crate::refcount), collection in
//! [`collector`](crate::collector) and finalizers in
//! [`finalization`](crate::finalization).

use rustc_hash::FxHashSet;
use strata_alloc::{AllocStats, BlockAllocator};

use crate::config::{DebugFlags, GcConfig, NUM_GENERATIONS};
use crate::error::{GcError, InvariantViolation, Result};
use crate::finalization::{FinalizerFailure, FinalizerRegistry};
use crate::generation::{Generation, GenerationStats};
use crate::list::ObjectList;
use crate::object::{
    HeaderFlags, ListId, Managed, ObjRef, ObjectBox, ObjectHeader, referents_of, type_info,
};

/// Single-threaded managed heap.
///
/// Objects start with a reference count of one owned by the caller of
/// [`alloc`](Heap::alloc). They are freed as soon as the count drops to
/// zero; cyclic garbage among tracked objects is found by
/// [`collect`](Heap::collect), which also runs automatically as tracking
/// activity crosses the generation thresholds.
pub struct Heap {
    pub(crate) allocator: BlockAllocator,
    /// Every allocated, not yet freed object
    pub(crate) live: FxHashSet<ObjRef>,
    pub(crate) generations: [Generation; NUM_GENERATIONS],
    /// Objects found unreachable by the running pass
    pub(crate) unreachable: ObjectList,
    pub(crate) enabled: bool,
    pub(crate) debug: DebugFlags,
    /// A pass owns the collector scratch state
    pub(crate) collecting: bool,
    /// Deepest generation requested while a pass was running
    pub(crate) deferred: Option<usize>,
    /// Objects whose count reached zero, waiting for teardown
    pub(crate) pending: Vec<ObjRef>,
    /// Teardown loop active; nested releases only enqueue
    pub(crate) draining: bool,
    pub(crate) finalizers: FinalizerRegistry,
    pub(crate) quarantine: Vec<ObjRef>,
    pub(crate) failures: Vec<FinalizerFailure>,
}

impl Heap {
    /// Heap with the default configuration
    pub fn new() -> Self {
        Self::build(GcConfig::default(), BlockAllocator::new())
    }

    /// Heap with a custom configuration
    pub fn with_config(config: GcConfig) -> Result<Self> {
        let allocator = BlockAllocator::with_config(config.alloc.clone())?;
        Ok(Self::build(config, allocator))
    }

    fn build(config: GcConfig, allocator: BlockAllocator) -> Self {
        let [t0, t1, t2] = config.thresholds;
        Self {
            allocator,
            live: FxHashSet::default(),
            generations: [
                Generation::new(0, t0),
                Generation::new(1, t1),
                Generation::new(2, t2),
            ],
            unreachable: ObjectList::new(ListId::Unreachable),
            enabled: config.enabled,
            debug: config.debug,
            collecting: false,
            deferred: None,
            pending: Vec::new(),
            draining: false,
            finalizers: FinalizerRegistry::default(),
            quarantine: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Allocate a managed object holding `value`.
    ///
    /// The new object has a reference count of one. Types with
    /// [`Managed::NEEDS_TRACE`] are tracked right away, which may run an
    /// automatic collection before this returns.
    pub fn alloc<T: Managed>(&mut self, value: T) -> Result<ObjRef> {
        let info = type_info::<T>();
        let block = self.allocator.allocate(info.layout)?;
        let boxed = block.cast::<ObjectBox<T>>();
        // SAFETY: block is fresh, sized and aligned for ObjectBox<T>
        unsafe {
            boxed.as_ptr().write(ObjectBox {
                header: ObjectHeader::new(info),
                value,
            });
        }

        let obj = ObjRef::from_header(boxed.cast());
        self.live.insert(obj);
        if info.needs_trace {
            self.link(obj, 0);
            self.note_tracked();
        }
        Ok(obj)
    }

    /// Header of a live object
    pub(crate) fn header(&self, obj: ObjRef) -> Result<&ObjectHeader> {
        if self.live.contains(&obj) {
            Ok(obj.header())
        } else {
            Err(InvariantViolation::DeadObject.into())
        }
    }

    /// Whether `obj` names an allocated, not yet freed object
    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.live.contains(&obj)
    }

    /// Shared access to the payload
    pub fn get<T: Managed>(&self, obj: ObjRef) -> Result<&T> {
        let header = self.header(obj)?;
        check_type::<T>(header)?;
        let boxed = obj.as_ptr().cast::<ObjectBox<T>>();
        // SAFETY: live object of type T; the borrow is tied to &self
        Ok(unsafe { &(*boxed.as_ptr()).value })
    }

    /// Exclusive access to the payload.
    ///
    /// Adding a strong reference to the payload must be paired with an
    /// [`incref`](Heap::incref) of the referent.
    pub fn get_mut<T: Managed>(&mut self, obj: ObjRef) -> Result<&mut T> {
        let header = self.header(obj)?;
        check_type::<T>(header)?;
        let boxed = obj.as_ptr().cast::<ObjectBox<T>>();
        // SAFETY: live object of type T; the borrow is tied to &mut self
        Ok(unsafe { &mut (*boxed.as_ptr()).value })
    }

    /// Payload type name
    pub fn type_name(&self, obj: ObjRef) -> Result<&'static str> {
        Ok(self.header(obj)?.info().name())
    }

    /// Current reference count
    pub fn refcount(&self, obj: ObjRef) -> Result<usize> {
        Ok(self.header(obj)?.refcount())
    }

    /// Bytes of storage the object occupies (header included)
    pub fn size_of(&self, obj: ObjRef) -> Result<usize> {
        let layout = self.header(obj)?.info().layout;
        Ok(BlockAllocator::usable_size(layout))
    }

    /// Whether the object participates in cycle detection
    pub fn is_tracked(&self, obj: ObjRef) -> Result<bool> {
        Ok(self.header(obj)?.has(HeaderFlags::TRACKED))
    }

    /// Whether the object's finalizer has already run
    pub fn is_finalized(&self, obj: ObjRef) -> Result<bool> {
        Ok(self.header(obj)?.has(HeaderFlags::FINALIZED))
    }

    /// Generation holding the object, `None` if untracked
    pub fn generation_of(&self, obj: ObjRef) -> Result<Option<usize>> {
        Ok(self.header(obj)?.generation())
    }

    /// Start tracking an object for cycle detection.
    ///
    /// Counts towards the generation 0 threshold and may run an automatic
    /// collection.
    pub fn track(&mut self, obj: ObjRef) -> Result<()> {
        let header = self.header(obj)?;
        if header.refcount() == 0 || header.has(HeaderFlags::QUARANTINED) {
            return Err(InvariantViolation::DeadObject.into());
        }
        if header.has(HeaderFlags::TRACKED) {
            return Err(InvariantViolation::AlreadyTracked.into());
        }
        self.link(obj, 0);
        self.note_tracked();
        Ok(())
    }

    /// Stop tracking an object.
    pub fn untrack(&mut self, obj: ObjRef) -> Result<()> {
        let header = self.header(obj)?;
        if !header.has(HeaderFlags::TRACKED) {
            return Err(InvariantViolation::NotTracked.into());
        }
        self.unlink(obj);
        Ok(())
    }

    /// Mark tracked and link into `generation`.
    pub(crate) fn link(&mut self, obj: ObjRef, generation: usize) {
        obj.header().set(HeaderFlags::TRACKED, true);
        self.generations[generation].list.push_back(obj);
    }

    /// Clear the tracked bit and unlink from whatever list holds the object.
    pub(crate) fn unlink(&mut self, obj: ObjRef) {
        let header = obj.header();
        header.set(HeaderFlags::TRACKED, false);
        match header.list() {
            ListId::Generation(g) => self.generations[g as usize].list.remove(obj),
            ListId::Unreachable => self.unreachable.remove(obj),
            ListId::Detached => {}
        }
    }

    /// Move a tracked object to another generation.
    pub(crate) fn relink(&mut self, obj: ObjRef, generation: usize) {
        let header = obj.header();
        if header.generation() == Some(generation) {
            return;
        }
        match header.list() {
            ListId::Generation(g) => self.generations[g as usize].list.remove(obj),
            ListId::Unreachable => self.unreachable.remove(obj),
            ListId::Detached => {}
        }
        self.generations[generation].list.push_back(obj);
    }

    /// Bump the generation 0 counter and collect if a threshold is crossed.
    fn note_tracked(&mut self) {
        self.generations[0].count += 1;
        self.maybe_collect();
    }

    /// Direct strong references held by `obj`
    pub fn referents(&self, obj: ObjRef) -> Result<Vec<ObjRef>> {
        self.header(obj)?;
        Ok(referents_of(obj))
    }

    /// Tracked objects holding a direct reference to any of `targets`
    pub fn referrers(&self, targets: &[ObjRef]) -> Vec<ObjRef> {
        let wanted: FxHashSet<ObjRef> = targets.iter().copied().collect();
        let mut out = Vec::new();
        for generation in &self.generations {
            for obj in generation.objects() {
                let mut hit = false;
                // SAFETY: tracked objects are live
                unsafe {
                    (obj.header().info().traverse)(obj, &mut |r| hit |= wanted.contains(&r));
                }
                if hit {
                    out.push(obj);
                }
            }
        }
        out
    }

    /// Tracked objects, either all of them or those of one generation
    pub fn objects(&self, generation: Option<usize>) -> Result<Vec<ObjRef>> {
        match generation {
            Some(g) if g >= NUM_GENERATIONS => Err(GcError::InvalidGeneration(g)),
            Some(g) => Ok(self.generations[g].objects()),
            None => Ok(self.generations.iter().flat_map(Generation::objects).collect()),
        }
    }

    /// Number of live objects, tracked or not
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Number of tracked objects per generation
    pub fn generation_sizes(&self) -> [usize; NUM_GENERATIONS] {
        [
            self.generations[0].len(),
            self.generations[1].len(),
            self.generations[2].len(),
        ]
    }

    /// Collection thresholds
    pub fn thresholds(&self) -> [usize; NUM_GENERATIONS] {
        [
            self.generations[0].threshold,
            self.generations[1].threshold,
            self.generations[2].threshold,
        ]
    }

    /// Replace the thresholds; 0 disables automatic collection at that level
    pub fn set_thresholds(&mut self, t0: usize, t1: usize, t2: usize) {
        self.generations[0].threshold = t0;
        self.generations[1].threshold = t1;
        self.generations[2].threshold = t2;
    }

    /// Current generation counters
    pub fn counts(&self) -> [usize; NUM_GENERATIONS] {
        [
            self.generations[0].count,
            self.generations[1].count,
            self.generations[2].count,
        ]
    }

    /// Allow automatic collections
    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Suppress automatic collections; explicit [`collect`](Heap::collect)
    /// still works
    pub fn disable(&mut self) {
        self.enabled = false;
    }

    /// Whether automatic collection is on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Diagnostics switches
    pub fn debug_flags(&self) -> DebugFlags {
        self.debug
    }

    /// Replace the diagnostics switches
    pub fn set_debug_flags(&mut self, flags: DebugFlags) {
        self.debug = flags;
    }

    /// Per-generation collection statistics
    pub fn stats(&self) -> [GenerationStats; NUM_GENERATIONS] {
        [
            self.generations[0].stats,
            self.generations[1].stats,
            self.generations[2].stats,
        ]
    }

    /// Storage layer statistics
    pub fn alloc_stats(&self) -> AllocStats {
        self.allocator.stats()
    }

    /// Whether a collection pass is running
    pub fn is_collecting(&self) -> bool {
        self.collecting
    }

    /// Drop the payload and return the storage. The caller has already
    /// unlinked the object and decides what to do with its referents.
    pub(crate) fn free_storage(&mut self, obj: ObjRef) -> Result<()> {
        let info = obj.header().info();
        self.finalizers.forget(obj);
        self.live.remove(&obj);
        // SAFETY: the object is live and its payload has not been dropped
        unsafe { (info.drop_value)(obj) };
        self.allocator.free(obj.as_ptr().cast(), info.layout)?;
        Ok(())
    }

    /// Collect everything collectable, then release every remaining object
    /// without running finalizers. Returns how many objects were released
    /// at teardown.
    pub fn shutdown(mut self) -> usize {
        self.run_collection(NUM_GENERATIONS - 1);
        let remaining = self.live.len();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "strata::gc",
            remaining,
            quarantined = self.quarantine.len(),
            "heap shutdown"
        );

        remaining
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        // Payload destructors only; arenas and large blocks go with the
        // allocator. Pending and quarantined objects are still in the live
        // set.
        for obj in self.live.drain() {
            let info = obj.header().info();
            // SAFETY: every object in the live set still owns its payload
            unsafe { (info.drop_value)(obj) };
        }
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("live", &self.live.len())
            .field("generations", &self.generation_sizes())
            .field("counts", &self.counts())
            .field("thresholds", &self.thresholds())
            .field("enabled", &self.enabled)
            .field("quarantined", &self.quarantine.len())
            .finish()
    }
}

fn check_type<T: Managed>(header: &ObjectHeader) -> Result<()> {
    let info = header.info();
    if info.is::<T>() {
        Ok(())
    } else {
        Err(GcError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            found: info.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_leaf_is_untracked() {
        let mut heap = Heap::new();
        let obj = heap.alloc(42i64).unwrap();
        assert_eq!(heap.refcount(obj).unwrap(), 1);
        assert!(!heap.is_tracked(obj).unwrap());
        assert_eq!(heap.generation_of(obj).unwrap(), None);
        assert_eq!(*heap.get::<i64>(obj).unwrap(), 42);
        assert_eq!(heap.counts(), [0, 0, 0]);
    }

    #[test]
    fn test_alloc_container_is_tracked() {
        let mut heap = Heap::new();
        let obj = heap.alloc(Vec::<ObjRef>::new()).unwrap();
        assert!(heap.is_tracked(obj).unwrap());
        assert_eq!(heap.generation_of(obj).unwrap(), Some(0));
        assert_eq!(heap.counts()[0], 1);
    }

    #[test]
    fn test_type_mismatch() {
        let mut heap = Heap::new();
        let obj = heap.alloc(String::from("x")).unwrap();
        assert!(matches!(heap.get::<i64>(obj), Err(GcError::TypeMismatch { .. })));
        heap.get_mut::<String>(obj).unwrap().push('y');
        assert_eq!(heap.get::<String>(obj).unwrap(), "xy");
    }

    #[test]
    fn test_track_untrack_errors() {
        let mut heap = Heap::new();
        let obj = heap.alloc(1i64).unwrap();
        assert!(matches!(
            heap.untrack(obj),
            Err(GcError::InvariantViolation(InvariantViolation::NotTracked))
        ));
        heap.track(obj).unwrap();
        assert!(matches!(
            heap.track(obj),
            Err(GcError::InvariantViolation(InvariantViolation::AlreadyTracked))
        ));
        heap.untrack(obj).unwrap();
        assert!(!heap.is_tracked(obj).unwrap());
    }

    #[test]
    fn test_objects_by_generation() {
        let mut heap = Heap::new();
        let a = heap.alloc(Vec::<ObjRef>::new()).unwrap();
        let b = heap.alloc(Vec::<ObjRef>::new()).unwrap();
        assert_eq!(heap.objects(Some(0)).unwrap(), vec![a, b]);
        assert!(heap.objects(Some(1)).unwrap().is_empty());
        assert!(matches!(heap.objects(Some(3)), Err(GcError::InvalidGeneration(3))));
        assert_eq!(heap.objects(None).unwrap().len(), 2);
    }

    #[test]
    fn test_referents_and_referrers() {
        let mut heap = Heap::new();
        let leaf = heap.alloc(7i64).unwrap();
        let holder = heap.alloc(vec![leaf]).unwrap();
        heap.incref(leaf).unwrap();

        assert_eq!(heap.referents(holder).unwrap(), vec![leaf]);
        assert_eq!(heap.referrers(&[leaf]), vec![holder]);
        assert!(heap.referrers(&[holder]).is_empty());
    }

    #[test]
    fn test_size_of_rounds_to_block() {
        let mut heap = Heap::new();
        let obj = heap.alloc(0u64).unwrap();
        let size = heap.size_of(obj).unwrap();
        assert!(size >= std::mem::size_of::<ObjectHeader>() + 8);
        assert_eq!(size % 16, 0);
    }

    #[test]
    fn test_drop_runs_payload_destructors() {
        use std::rc::Rc;

        let marker = Rc::new(());
        struct Holder(Rc<()>);
        impl Managed for Holder {
            const NEEDS_TRACE: bool = false;
            fn referents(&self, _visit: &mut dyn FnMut(ObjRef)) {}
        }

        let mut heap = Heap::new();
        heap.alloc(Holder(marker.clone())).unwrap();
        assert_eq!(Rc::strong_count(&marker), 2);
        drop(heap);
        assert_eq!(Rc::strong_count(&marker), 1);
    }
}
