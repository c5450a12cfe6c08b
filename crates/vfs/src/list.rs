//! TEAM_438: Intrusive vnode lists.
//!
//! Free, hold and per-mount lists thread through link fields embedded in
//! each vnode slot, so insertion and removal are O(1) and a vnode can move
//! between lists without allocating. A [`LinkField`] type picks which link a
//! list uses.

use core::marker::PhantomData;

use alloc::vec::Vec;

use crate::state::VnodeSlot;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Link {
    prev: Option<u32>,
    next: Option<u32>,
}

pub(crate) trait LinkField {
    fn get(slot: &VnodeSlot) -> &Link;
    fn get_mut(slot: &mut VnodeSlot) -> &mut Link;
}

/// Links used by the free and hold lists.
pub(crate) struct RecycleLinks;

impl LinkField for RecycleLinks {
    fn get(slot: &VnodeSlot) -> &Link {
        &slot.recycle_link
    }
    fn get_mut(slot: &mut VnodeSlot) -> &mut Link {
        &mut slot.recycle_link
    }
}

/// Links used by a mount's vnode list.
pub(crate) struct MountLinks;

impl LinkField for MountLinks {
    fn get(slot: &VnodeSlot) -> &Link {
        &slot.mount_link
    }
    fn get_mut(slot: &mut VnodeSlot) -> &mut Link {
        &mut slot.mount_link
    }
}

pub(crate) struct ListHead<F> {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
    _field: PhantomData<F>,
}

impl<F> Default for ListHead<F> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _field: PhantomData,
        }
    }
}

impl<F: LinkField> ListHead<F> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn first(&self) -> Option<u32> {
        self.head
    }

    pub fn insert_head(&mut self, slots: &mut [VnodeSlot], idx: u32) {
        let old = self.head;
        *F::get_mut(&mut slots[idx as usize]) = Link {
            prev: None,
            next: old,
        };
        match old {
            Some(o) => F::get_mut(&mut slots[o as usize]).prev = Some(idx),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    pub fn insert_tail(&mut self, slots: &mut [VnodeSlot], idx: u32) {
        let old = self.tail;
        *F::get_mut(&mut slots[idx as usize]) = Link {
            prev: old,
            next: None,
        };
        match old {
            Some(o) => F::get_mut(&mut slots[o as usize]).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Unlink `idx`. The caller guarantees it is on this list.
    pub fn remove(&mut self, slots: &mut [VnodeSlot], idx: u32) {
        let link = core::mem::take(F::get_mut(&mut slots[idx as usize]));
        match link.prev {
            Some(p) => F::get_mut(&mut slots[p as usize]).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(n) => F::get_mut(&mut slots[n as usize]).prev = link.prev,
            None => self.tail = link.prev,
        }
        self.len -= 1;
    }

    /// Slot indices in list order.
    pub fn indices(&self, slots: &[VnodeSlot]) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.len);
        let mut cur = self.head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = F::get(&slots[idx as usize]).next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VnodeSlot;
    use alloc::sync::Arc;

    fn slots(n: usize) -> Vec<VnodeSlot> {
        let ops: Arc<dyn crate::ops::VnodeOps> = Arc::new(crate::dead::DeadOps);
        (0..n).map(|_| VnodeSlot::new(ops.clone())).collect()
    }

    #[test]
    fn test_head_tail_order() {
        let mut s = slots(4);
        let mut list: ListHead<RecycleLinks> = ListHead::default();
        list.insert_tail(&mut s, 1);
        list.insert_tail(&mut s, 2);
        list.insert_head(&mut s, 3);
        assert_eq!(list.indices(&s), [3, 1, 2]);
        assert_eq!(list.first(), Some(3));
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn test_remove_middle_and_ends() {
        let mut s = slots(4);
        let mut list: ListHead<MountLinks> = ListHead::default();
        for i in 0..4 {
            list.insert_tail(&mut s, i);
        }
        list.remove(&mut s, 2);
        list.remove(&mut s, 0);
        assert_eq!(list.indices(&s), [1, 3]);
        list.remove(&mut s, 3);
        list.remove(&mut s, 1);
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
    }

    #[test]
    fn test_lists_are_independent() {
        let mut s = slots(2);
        let mut free: ListHead<RecycleLinks> = ListHead::default();
        let mut mnt: ListHead<MountLinks> = ListHead::default();
        free.insert_tail(&mut s, 0);
        free.insert_tail(&mut s, 1);
        mnt.insert_head(&mut s, 1);
        mnt.insert_head(&mut s, 0);
        free.remove(&mut s, 0);
        assert_eq!(free.indices(&s), [1]);
        assert_eq!(mnt.indices(&s), [0, 1]);
    }
}
