//! Generational cycle collector
//!
//! Collecting generation `g` scans generations `0..=g` by trial deletion:
//!
//! 1. Copy each object's refcount into its `gc_refs` scratch field.
//! 2. Subtract every reference coming from another object in scope. What
//!    remains counts references from outside: the host, untracked objects,
//!    older generations.
//! 3. Objects left with `gc_refs > 0` are roots; everything reachable from a
//!    root through in-scope references survives and is promoted.
//! 4. The rest is cyclic garbage. It is held by the collector while weak
//!    finalizers and finalizers run, re-checked for resurrection, and then
//!    freed as a batch. Components where any callback failed are quarantined.
//!
//! The pass owns the scratch fields: a collection requested while one is
//! running is deferred until the running pass returns.

use std::time::Instant;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{DebugFlags, NUM_GENERATIONS};
use crate::error::{GcError, Result};
use crate::heap::Heap;
use crate::object::{HeaderFlags, ListId, ObjRef, referents_of};

/// What happened to the unreachable set of one pass
#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    freed: usize,
    resurrected: usize,
    quarantined: usize,
}

impl Heap {
    /// Collect generations `0..=generation` and return how many objects
    /// were freed.
    ///
    /// Called while a collection is already running (from a finalizer), the
    /// request is deferred until that pass finishes and this returns 0.
    pub fn collect(&mut self, generation: usize) -> Result<usize> {
        if generation >= NUM_GENERATIONS {
            return Err(GcError::InvalidGeneration(generation));
        }
        if self.collecting {
            self.deferred = Some(self.deferred.map_or(generation, |g| g.max(generation)));

            #[cfg(feature = "gc_logging")]
            tracing::debug!(target: "strata::gc", generation, "nested collection deferred");
            return Ok(0);
        }
        Ok(self.run_collection(generation))
    }

    /// Threshold-driven collection after a `track`.
    pub(crate) fn maybe_collect(&mut self) {
        if !self.enabled || self.collecting || !self.generations[0].over_threshold() {
            return;
        }
        self.run_collection(0);
        if self.generations[1].over_threshold() {
            self.run_collection(1);
            if self.generations[2].over_threshold() {
                self.run_collection(2);
            }
        }
    }

    /// One pass plus whatever was requested while it ran.
    pub(crate) fn run_collection(&mut self, generation: usize) -> usize {
        let freed = self.collect_generation(generation);
        while let Some(deferred) = self.deferred.take() {
            self.collect_generation(deferred);
        }
        freed
    }

    fn collect_generation(&mut self, generation: usize) -> usize {
        debug_assert!(self.unreachable.is_empty(), "unreachable list left over");
        self.collecting = true;
        let start = Instant::now();

        let scope = self.gather_scope(generation);

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "strata::gc",
            generation,
            objects = scope.len(),
            "collection starting"
        );

        for &obj in &scope {
            let header = obj.header();
            header.set_gc_refs(refcount_weight(header.refcount()));
        }
        self.subtract_internal(&scope);
        self.mark_reachable(&scope);
        let unreachable = self.partition(&scope, generation);

        for g in 0..=generation {
            self.generations[g].count = 0;
        }
        if generation + 1 < NUM_GENERATIONS {
            self.generations[generation + 1].count += 1;
        }

        let outcome = self.finalize_and_free(unreachable);
        let pause = start.elapsed();
        self.generations[generation].record(outcome.freed, outcome.quarantined, pause);
        self.collecting = false;

        #[cfg(feature = "gc_logging")]
        {
            if self.debug.contains(DebugFlags::STATS) {
                tracing::info!(
                    target: "strata::gc",
                    generation,
                    scanned = scope.len(),
                    freed = outcome.freed,
                    resurrected = outcome.resurrected,
                    quarantined = outcome.quarantined,
                    pause_us = pause.as_micros() as u64,
                    sizes = ?self.generation_sizes(),
                    "collection stats"
                );
            }
            tracing::debug!(
                target: "strata::gc",
                generation,
                freed = outcome.freed,
                resurrected = outcome.resurrected,
                quarantined = outcome.quarantined,
                pause_us = pause.as_micros() as u64,
                "collection complete"
            );
        }

        outcome.freed
    }

    /// Members of generations `0..=generation`, flagged as in scope.
    fn gather_scope(&self, generation: usize) -> Vec<ObjRef> {
        let mut scope = Vec::new();
        for g in &self.generations[..=generation] {
            scope.extend(g.objects());
        }
        for &obj in &scope {
            obj.header().set(HeaderFlags::COLLECTING, true);
        }
        scope
    }

    /// Remove references that originate inside `set` (members flagged
    /// `COLLECTING`) from each member's `gc_refs`.
    fn subtract_internal(&self, set: &[ObjRef]) {
        let live = &self.live;
        for &obj in set {
            let mut visit = |referent: ObjRef| {
                if live.contains(&referent) {
                    let header = referent.header();
                    if header.has(HeaderFlags::COLLECTING) {
                        header.set_gc_refs(header.gc_refs() - 1);
                    }
                }
            };
            // SAFETY: members of the set are live
            unsafe { (obj.header().info().traverse)(obj, &mut visit) };
        }

        for &obj in set {
            let header = obj.header();
            if header.gc_refs() < 0 {
                // More internal references than the refcount admits: the
                // host missed an incref. Keep the object.
                #[cfg(feature = "gc_logging")]
                tracing::warn!(
                    target: "strata::gc",
                    object = obj.addr(),
                    type_name = header.info().name(),
                    gc_refs = header.gc_refs(),
                    "refcount lower than internal references, treating as root"
                );
                header.set_gc_refs(1);
            }
        }
    }

    /// Propagate reachability from members with `gc_refs > 0`.
    fn mark_reachable(&self, set: &[ObjRef]) {
        let live = &self.live;
        let mut worklist: Vec<ObjRef> = set
            .iter()
            .copied()
            .filter(|obj| obj.header().gc_refs() > 0)
            .collect();

        while let Some(obj) = worklist.pop() {
            let mut visit = |referent: ObjRef| {
                if live.contains(&referent) {
                    let header = referent.header();
                    if header.has(HeaderFlags::COLLECTING) && header.gc_refs() == 0 {
                        header.set_gc_refs(1);
                        worklist.push(referent);
                    }
                }
            };
            // SAFETY: members of the set are live
            unsafe { (obj.header().info().traverse)(obj, &mut visit) };
        }
    }

    /// Promote survivors and move the rest to the unreachable list.
    fn partition(&mut self, scope: &[ObjRef], generation: usize) -> Vec<ObjRef> {
        let target = (generation + 1).min(NUM_GENERATIONS - 1);
        let mut unreachable = Vec::new();
        for &obj in scope {
            let header = obj.header();
            header.set(HeaderFlags::COLLECTING, false);
            if header.gc_refs() > 0 {
                self.relink(obj, target);
            } else {
                if let ListId::Generation(g) = header.list() {
                    self.generations[g as usize].list.remove(obj);
                }
                self.unreachable.push_back(obj);
                unreachable.push(obj);
            }
        }
        unreachable
    }

    fn finalize_and_free(&mut self, unreachable: Vec<ObjRef>) -> Outcome {
        if unreachable.is_empty() {
            return Outcome::default();
        }

        // Hold every member so callbacks dropping references cannot free a
        // member early.
        for &obj in &unreachable {
            let header = obj.header();
            header.set_refcount(header.refcount() + 1);
        }

        let mut failed = Vec::new();
        for &obj in &unreachable {
            if self.fire_weak_finalizers(obj) {
                failed.push(obj);
            }
        }

        for &obj in &unreachable {
            if self.needs_finalization(obj) {
                obj.header().set(HeaderFlags::FINALIZED, true);
                if let Err(error) = self.run_finalizers(obj) {
                    self.record_failure(obj, error);
                    failed.push(obj);
                }
            }
        }

        // Resurrection check: trial deletion restricted to the unreachable
        // set, with the hold discounted.
        for &obj in &unreachable {
            let header = obj.header();
            header.set(HeaderFlags::COLLECTING, true);
            header.set_gc_refs(refcount_weight(header.refcount()) - 1);
        }
        self.subtract_internal(&unreachable);
        self.mark_reachable(&unreachable);

        let mut resurrected = Vec::new();
        let mut remaining = Vec::new();
        for &obj in &unreachable {
            let header = obj.header();
            header.set(HeaderFlags::COLLECTING, false);
            if header.gc_refs() > 0 {
                resurrected.push(obj);
            } else {
                remaining.push(obj);
            }
        }

        let quarantined: FxHashSet<ObjRef> = if self.debug.contains(DebugFlags::SAVEALL) {
            remaining.iter().copied().collect()
        } else {
            components_containing(&remaining, &failed)
        };

        for &obj in &resurrected {
            // Untracked by a finalizer: stays untracked.
            if obj.header().list() == ListId::Unreachable {
                self.unreachable.remove(obj);
                self.generations[NUM_GENERATIONS - 1].list.push_back(obj);
            }
        }

        let mut dead = Vec::with_capacity(remaining.len());
        for obj in remaining {
            self.unlink(obj);
            if quarantined.contains(&obj) {
                obj.header().set(HeaderFlags::QUARANTINED, true);
                self.quarantine.push(obj);

                #[cfg(feature = "gc_logging")]
                if self.debug.contains(DebugFlags::UNCOLLECTABLE) {
                    tracing::debug!(
                        target: "strata::gc",
                        object = obj.addr(),
                        type_name = obj.header().info().name(),
                        "uncollectable"
                    );
                }
            } else {
                dead.push(obj);
            }
        }

        let freed = self.free_batch(&dead);

        for obj in resurrected.iter().copied() {
            self.release_hold(obj);
        }

        Outcome {
            freed,
            resurrected: resurrected.len(),
            quarantined: quarantined.len(),
        }
    }

    /// Free garbage without decref-ing references between members; only
    /// references leaving the batch are dropped, after every member is gone.
    fn free_batch(&mut self, dead: &[ObjRef]) -> usize {
        let members: FxHashSet<ObjRef> = dead.iter().copied().collect();
        let mut outside = Vec::new();
        let mut freed = 0;

        for &obj in dead {
            #[cfg(feature = "gc_logging")]
            if self.debug.contains(DebugFlags::COLLECTABLE) {
                tracing::debug!(
                    target: "strata::gc",
                    object = obj.addr(),
                    type_name = obj.header().info().name(),
                    "collectable"
                );
            }

            outside.extend(referents_of(obj).into_iter().filter(|r| !members.contains(r)));
            match self.free_storage(obj) {
                Ok(()) => freed += 1,
                Err(_err) => {
                    #[cfg(feature = "gc_logging")]
                    tracing::warn!(target: "strata::gc", object = obj.addr(), error = %_err, "free failed");
                }
            }
        }

        for referent in outside {
            self.release_hold(referent);
        }
        freed
    }

    /// Drop a reference on behalf of the collector. Errors mean the host
    /// broke the refcount contract; the pass carries on.
    fn release_hold(&mut self, obj: ObjRef) {
        if let Err(_err) = self.decref(obj) {
            #[cfg(feature = "gc_logging")]
            tracing::warn!(
                target: "strata::gc",
                object = obj.addr(),
                error = %_err,
                "reference release failed during collection"
            );
        }
    }
}

/// Refcount as a signed scratch value
#[inline]
fn refcount_weight(refcount: usize) -> isize {
    isize::try_from(refcount).unwrap_or(isize::MAX)
}

/// Members of `set` weakly connected (through references inside `set`) to
/// any of `seeds`.
fn components_containing(set: &[ObjRef], seeds: &[ObjRef]) -> FxHashSet<ObjRef> {
    if seeds.is_empty() {
        return FxHashSet::default();
    }

    let index: FxHashMap<ObjRef, usize> = set.iter().enumerate().map(|(i, &o)| (o, i)).collect();
    let mut parent: Vec<usize> = (0..set.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for (i, &obj) in set.iter().enumerate() {
        for referent in referents_of(obj) {
            if let Some(&j) = index.get(&referent) {
                let (a, b) = (find(&mut parent, i), find(&mut parent, j));
                if a != b {
                    parent[a] = b;
                }
            }
        }
    }

    let roots: FxHashSet<usize> = seeds
        .iter()
        .filter_map(|seed| index.get(seed).copied())
        .map(|i| find(&mut parent, i))
        .collect();

    set.iter()
        .enumerate()
        .filter(|&(i, _)| roots.contains(&find(&mut parent, i)))
        .map(|(_, &obj)| obj)
        .collect()
}
