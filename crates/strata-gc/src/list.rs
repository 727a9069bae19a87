//! Intrusive doubly linked object lists
//!
//! Links live in the object header, so moving an object between lists and
//! unlinking it are O(1) and allocation-free.

use crate::object::{ListId, ObjRef};

pub(crate) struct ObjectList {
    id: ListId,
    head: Option<ObjRef>,
    tail: Option<ObjRef>,
    len: usize,
}

impl ObjectList {
    pub(crate) const fn new(id: ListId) -> Self {
        Self {
            id,
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Link a detached object at the tail.
    pub(crate) fn push_back(&mut self, obj: ObjRef) {
        let header = obj.header();
        debug_assert_eq!(header.list(), ListId::Detached, "object already linked");

        header.link(self.id, self.tail, None);
        match self.tail {
            Some(tail) => tail.header().set_next(Some(obj)),
            None => self.head = Some(obj),
        }
        self.tail = Some(obj);
        self.len += 1;
    }

    /// Unlink `obj`, which must be a member of this list.
    pub(crate) fn remove(&mut self, obj: ObjRef) {
        let header = obj.header();
        debug_assert_eq!(header.list(), self.id, "object linked into another list");

        let (prev, next) = header.unlink();
        match prev {
            Some(prev) => prev.header().set_next(next),
            None => self.head = next,
        }
        match next {
            Some(next) => next.header().set_prev(prev),
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Snapshot of the members, head first.
    pub(crate) fn to_vec(&self) -> Vec<ObjRef> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(obj) = cursor {
            out.push(obj);
            cursor = obj.header().next();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    #[test]
    fn test_push_and_remove() {
        let mut heap = Heap::new();
        let objs: Vec<_> = (0..4).map(|i| heap.alloc(i as i64).unwrap()).collect();

        let mut list = ObjectList::new(ListId::Unreachable);
        for &obj in &objs {
            list.push_back(obj);
        }
        assert_eq!(list.len(), 4);
        assert_eq!(list.to_vec(), objs);

        // Middle, head, tail
        list.remove(objs[2]);
        list.remove(objs[0]);
        list.remove(objs[3]);
        assert_eq!(list.to_vec(), vec![objs[1]]);
        assert_eq!(objs[0].header().list(), ListId::Detached);

        list.remove(objs[1]);
        assert!(list.is_empty());
        assert!(list.to_vec().is_empty());
    }
}
