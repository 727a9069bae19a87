//! Reference-count engine
//!
//! `decref` to zero unlinks the object from cycle tracking and queues it for
//! teardown. Teardown runs a loop over an explicit worklist, so releasing a
//! deep chain of objects never recurses on the native stack: referents whose
//! count drops to zero while the loop is active are only queued.

use crate::error::{InvariantViolation, Result};
use crate::heap::Heap;
use crate::object::{HeaderFlags, ObjRef, referents_of};

impl Heap {
    /// Add a strong reference.
    pub fn incref(&mut self, obj: ObjRef) -> Result<()> {
        let header = self.header(obj)?;
        let count = header
            .refcount()
            .checked_add(1)
            .ok_or(InvariantViolation::RefcountOverflow)?;
        header.set_refcount(count);
        Ok(())
    }

    /// Drop a strong reference, freeing the object (and, transitively, what
    /// only it kept alive) when the count reaches zero.
    ///
    /// Errors found while tearing down referents are reported after the
    /// whole cascade has been processed; the first one is returned.
    pub fn decref(&mut self, obj: ObjRef) -> Result<()> {
        let header = self.header(obj)?;
        let count = header.refcount();
        // A teardown in progress holds the last reference itself.
        if count == 0 || (count == 1 && header.has(HeaderFlags::DEALLOCATING)) {
            return Err(InvariantViolation::RefcountUnderflow.into());
        }
        header.set_refcount(count - 1);
        if count > 1 {
            return Ok(());
        }
        self.release(obj)
    }

    /// Count reached zero.
    fn release(&mut self, obj: ObjRef) -> Result<()> {
        let header = obj.header();
        if header.has(HeaderFlags::TRACKED) {
            header.set(HeaderFlags::WAS_TRACKED, true);
            self.unlink(obj);
        }
        // Revived while queued and dropped again: already on the worklist.
        if header.has(HeaderFlags::QUEUED) {
            return Ok(());
        }
        header.set(HeaderFlags::QUEUED, true);
        self.pending.push(obj);
        if self.draining {
            return Ok(());
        }
        self.drain_pending()
    }

    fn drain_pending(&mut self) -> Result<()> {
        self.draining = true;
        let mut first_error = None;
        while let Some(obj) = self.pending.pop() {
            if let Err(err) = self.dealloc(obj) {
                first_error.get_or_insert(err);
            }
        }
        self.draining = false;
        first_error.map_or(Ok(()), Err)
    }

    /// Tear down one zero-count object.
    fn dealloc(&mut self, obj: ObjRef) -> Result<()> {
        let header = obj.header();
        header.set(HeaderFlags::QUEUED, false);

        // Another teardown's callback took a reference while this one was
        // queued.
        if header.refcount() > 0 {
            self.revive(obj);
            return Ok(());
        }

        // Callbacks run with the object held so they cannot release it
        // a second time.
        header.set(HeaderFlags::DEALLOCATING, true);
        header.set_refcount(1);
        // Acyclic: a failing callback is recorded and the object freed anyway.
        self.fire_weak_finalizers(obj);
        if self.needs_finalization(obj) {
            header.set(HeaderFlags::FINALIZED, true);
            if let Err(error) = self.run_finalizers(obj) {
                self.record_failure(obj, error);
            }
        }
        let count = header.refcount() - 1;
        header.set_refcount(count);
        header.set(HeaderFlags::DEALLOCATING, false);

        if count > 0 {
            self.revive(obj);

            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "strata::gc",
                object = obj.addr(),
                type_name = header.info().name(),
                refcount = count,
                "object resurrected by finalizer"
            );
            return Ok(());
        }

        // A callback may have tracked it again.
        if header.has(HeaderFlags::TRACKED) {
            self.unlink(obj);
        }
        let referents = referents_of(obj);
        let freed = self.free_storage(obj);

        let mut first_error = freed.err();
        for referent in referents {
            if let Err(err) = self.decref(referent) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// A zero-count object gained a reference before it was freed.
    fn revive(&mut self, obj: ObjRef) {
        let header = obj.header();
        if header.has(HeaderFlags::WAS_TRACKED) && !header.has(HeaderFlags::TRACKED) {
            self.link(obj, 2);
        }
        header.set(HeaderFlags::WAS_TRACKED, false);
    }
}
