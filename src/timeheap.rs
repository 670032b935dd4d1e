//! The sleep heap: an indexed min-heap of fibers keyed by absolute
//! deadline, stored as a linked binary tree rather than an array.
//!
//! A node's position is its 1-based breadth-first index; navigation walks
//! from the root along the binary expansion of that index (most-significant
//! bit after the leading 1 first, left on 0, right on 1). Keys are
//! `(deadline, insertion sequence)` compared lexicographically with strict
//! less-than, so fibers with equal deadlines wake in insertion order.

use crate::arena::Arena;
use crate::fiber::{FiberEntry, FiberId};

/// A child-pointer slot: either the root pointer or one of a node's two
/// child links. Writing through a slot updates the parent side of the
/// link, which is what unlinking and substitution operate on.
#[derive(Clone, Copy)]
enum SlotRef {
    Root,
    Left(FiberId),
    Right(FiberId),
}

pub(crate) struct SleepHeap {
    pub root: Option<FiberId>,
    pub size: u32,
}

impl SleepHeap {
    pub fn new() -> Self {
        Self {
            root: None,
            size: 0,
        }
    }

    fn get(&self, arena: &Arena<FiberEntry>, slot: SlotRef) -> Option<FiberId> {
        match slot {
            SlotRef::Root => self.root,
            SlotRef::Left(p) => arena.get(p).expect("heap parent").left,
            SlotRef::Right(p) => arena.get(p).expect("heap parent").right,
        }
    }

    fn set(&mut self, arena: &mut Arena<FiberEntry>, slot: SlotRef, value: Option<FiberId>) {
        match slot {
            SlotRef::Root => self.root = value,
            SlotRef::Left(p) => arena.get_mut(p).expect("heap parent").left = value,
            SlotRef::Right(p) => arena.get_mut(p).expect("heap parent").right = value,
        }
    }

    fn key(arena: &Arena<FiberEntry>, id: FiberId) -> (u64, u64) {
        let e = arena.get(id).expect("heap member");
        (e.due, e.seq)
    }

    /// Inserts a fiber whose `due` and `seq` fields are already set.
    pub fn insert(&mut self, arena: &mut Arena<FiberEntry>, fiber: FiberId) {
        self.size += 1;
        arena.get_mut(fiber).expect("fiber").heap_index = self.size;
        self.place(arena, fiber);
    }

    /// Walks from the root to the position named by `fiber.heap_index`.
    /// Whenever the carried node is younger than the slot's occupant the
    /// two trade places: the carried node adopts the occupant's children
    /// and the occupant continues the descent. Returns the slot the final
    /// carried node was written to.
    fn place(&mut self, arena: &mut Arena<FiberEntry>, mut fiber: FiberId) -> SlotRef {
        let target = arena.get(fiber).expect("fiber").heap_index;
        let mut slot = SlotRef::Root;
        let mut index: u32 = 1;
        let bits = 32 - target.leading_zeros();

        for bit in (0..bits.saturating_sub(1)).rev() {
            let occupant = self.get(arena, slot).expect("interior heap slot");
            if Self::key(arena, fiber) < Self::key(arena, occupant) {
                let (l, r) = {
                    let o = arena.get(occupant).expect("occupant");
                    (o.left, o.right)
                };
                {
                    let f = arena.get_mut(fiber).expect("fiber");
                    f.left = l;
                    f.right = r;
                    f.heap_index = index;
                }
                self.set(arena, slot, Some(fiber));
                fiber = occupant;
            }
            let occupant = self.get(arena, slot).expect("interior heap slot");
            index <<= 1;
            if target & (1 << bit) != 0 {
                slot = SlotRef::Right(occupant);
                index |= 1;
            } else {
                slot = SlotRef::Left(occupant);
            }
        }

        {
            let f = arena.get_mut(fiber).expect("fiber");
            f.heap_index = index;
            f.left = None;
            f.right = None;
        }
        self.set(arena, slot, Some(fiber));
        slot
    }

    /// Removes an arbitrary member: unlink the last element, substitute it
    /// into the removed node's position, then sift it down against the
    /// younger child (left preferred on ties).
    pub fn delete(&mut self, arena: &mut Arena<FiberEntry>, fiber: FiberId) {
        let s = self.size;
        let mut slot = SlotRef::Root;
        let bits = 32 - s.leading_zeros();
        for bit in (0..bits.saturating_sub(1)).rev() {
            let occ = self.get(arena, slot).expect("interior heap slot");
            slot = if s & (1 << bit) != 0 {
                SlotRef::Right(occ)
            } else {
                SlotRef::Left(occ)
            };
        }
        let last = self.get(arena, slot).expect("last heap element");
        self.set(arena, slot, None);
        self.size -= 1;

        if last != fiber {
            // Note: if `last` was a child of `fiber`, the unlink above
            // already cleared that child field, so the adoption below
            // cannot create a cycle.
            let position = arena.get(fiber).expect("fiber").heap_index;
            arena.get_mut(last).expect("last").heap_index = position;
            let mut slot = self.place(arena, last);

            let t = self.get(arena, slot).expect("substituted node");
            let (dl, dr) = {
                let d = arena.get(fiber).expect("fiber");
                (d.left, d.right)
            };
            {
                let tm = arena.get_mut(t).expect("substituted node");
                tm.left = dl;
                tm.right = dr;
            }

            let mut t = t;
            loop {
                let (l, r) = {
                    let e = arena.get(t).expect("sift node");
                    (e.left, e.right)
                };
                let y = match (l, r) {
                    (None, _) => break,
                    (Some(l), None) => l,
                    (Some(l), Some(r)) => {
                        if Self::key(arena, l) <= Self::key(arena, r) {
                            l
                        } else {
                            r
                        }
                    }
                };
                if Self::key(arena, t) > Self::key(arena, y) {
                    let (yl, yr) = {
                        let e = arena.get(y).expect("younger child");
                        (e.left, e.right)
                    };
                    let (tl, tr) = {
                        let e = arena.get(t).expect("sift node");
                        (e.left, e.right)
                    };
                    self.set(arena, slot, Some(y));
                    if Some(y) == tl {
                        {
                            let ym = arena.get_mut(y).expect("younger child");
                            ym.left = Some(t);
                            ym.right = tr;
                        }
                        slot = SlotRef::Left(y);
                    } else {
                        {
                            let ym = arena.get_mut(y).expect("younger child");
                            ym.left = tl;
                            ym.right = Some(t);
                        }
                        slot = SlotRef::Right(y);
                    }
                    {
                        let tm = arena.get_mut(t).expect("sift node");
                        tm.left = yl;
                        tm.right = yr;
                    }
                    let ti = arena.get(t).expect("sift node").heap_index;
                    let yi = arena.get(y).expect("younger child").heap_index;
                    arena.get_mut(t).expect("sift node").heap_index = yi;
                    arena.get_mut(y).expect("younger child").heap_index = ti;
                } else {
                    break;
                }
            }
        }

        let d = arena.get_mut(fiber).expect("fiber");
        d.left = None;
        d.right = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberState;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Harness {
        arena: Arena<FiberEntry>,
        heap: SleepHeap,
        model: Vec<(u64, u64, FiberId)>,
        seq: u64,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                arena: Arena::new(),
                heap: SleepHeap::new(),
                model: Vec::new(),
                seq: 0,
            }
        }

        fn insert(&mut self, due: u64) -> FiberId {
            let mut entry = FiberEntry::new(FiberState::Sleeping);
            entry.due = due;
            entry.seq = self.seq;
            self.seq += 1;
            let id = self.arena.insert(entry);
            self.heap.insert(&mut self.arena, id);
            self.model.push((due, self.seq - 1, id));
            id
        }

        fn delete(&mut self, id: FiberId) {
            self.heap.delete(&mut self.arena, id);
            let pos = self.model.iter().position(|m| m.2 == id).unwrap();
            self.model.remove(pos);
        }

        fn model_min(&self) -> Option<FiberId> {
            self.model.iter().min_by_key(|m| (m.0, m.1)).map(|m| m.2)
        }

        fn check_invariants(&self) {
            assert_eq!(self.heap.size as usize, self.model.len());
            let mut indices = Vec::new();
            if let Some(root) = self.heap.root {
                self.walk(root, &mut indices);
            }
            indices.sort_unstable();
            let expected: Vec<u32> = (1..=self.heap.size).collect();
            assert_eq!(indices, expected, "heap indices must be 1..=size");
        }

        fn walk(&self, id: FiberId, indices: &mut Vec<u32>) {
            let e = self.arena.get(id).unwrap();
            indices.push(e.heap_index);
            for child in [e.left, e.right].into_iter().flatten() {
                let c = self.arena.get(child).unwrap();
                assert!(
                    (e.due, e.seq) <= (c.due, c.seq),
                    "heap property violated between {} and {}",
                    e.heap_index,
                    c.heap_index
                );
                self.walk(child, indices);
            }
        }

        fn drain_and_check(&mut self) {
            while let Some(root) = self.heap.root {
                assert_eq!(Some(root), self.model_min());
                self.delete(root);
                self.check_invariants();
            }
            assert!(self.model.is_empty());
        }
    }

    #[test]
    fn extracts_in_deadline_order() {
        let mut h = Harness::new();
        for due in [30, 10, 20, 10, 50] {
            h.insert(due);
        }
        h.check_invariants();

        let mut order = Vec::new();
        while let Some(root) = h.heap.root {
            order.push(h.arena.get(root).unwrap().due);
            h.delete(root);
        }
        assert_eq!(order, vec![10, 10, 20, 30, 50]);
    }

    #[test]
    fn equal_deadlines_extract_in_insertion_order() {
        let mut h = Harness::new();
        let ids: Vec<FiberId> = (0..64).map(|_| h.insert(7)).collect();
        let mut extracted = Vec::new();
        while let Some(root) = h.heap.root {
            extracted.push(root);
            h.delete(root);
        }
        assert_eq!(extracted, ids);
    }

    #[test]
    fn random_inserts_against_reference() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for n in [1usize, 2, 3, 7, 64, 257, 1024] {
            let mut h = Harness::new();
            for _ in 0..n {
                h.insert(rng.gen_range(0..50));
                h.check_invariants();
            }
            h.drain_and_check();
        }
    }

    #[test]
    fn random_interior_deletes_against_reference() {
        let mut rng = StdRng::seed_from_u64(0xfeed);
        for _ in 0..20 {
            let mut h = Harness::new();
            for _ in 0..200 {
                if h.model.is_empty() || rng.gen_bool(0.6) {
                    h.insert(rng.gen_range(0..30));
                } else {
                    let pick = h.model[rng.gen_range(0..h.model.len())].2;
                    h.delete(pick);
                }
                h.check_invariants();
            }
            h.drain_and_check();
        }
    }
}
