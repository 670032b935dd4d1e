//! Sentinel-based circular doubly-linked lists over an arena of link nodes.
//!
//! The scheduler queues, the zombie queue, the I/O queue and every wait
//! queue are all instances of this one structure. Each fiber owns two link
//! nodes (one for the scheduler queues, one for synchronization wait
//! queues); each queue owns a sentinel node. A node that is not on any list
//! is linked to itself, which makes removal idempotent and gives an O(1)
//! membership test without scanning.

pub(crate) type NodeIdx = u32;

/// Placeholder for a node index that has not been allocated yet.
pub(crate) const NODE_NONE: NodeIdx = u32::MAX;

struct Node<O> {
    next: NodeIdx,
    prev: NodeIdx,
    owner: O,
}

pub(crate) struct Clist<O: Copy> {
    nodes: Vec<Node<O>>,
    free: Vec<NodeIdx>,
}

impl<O: Copy> Clist<O> {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Allocates a detached (self-linked) node.
    pub fn alloc(&mut self, owner: O) -> NodeIdx {
        if let Some(n) = self.free.pop() {
            let node = &mut self.nodes[n as usize];
            node.next = n;
            node.prev = n;
            node.owner = owner;
            n
        } else {
            let n = self.nodes.len() as NodeIdx;
            self.nodes.push(Node {
                next: n,
                prev: n,
                owner,
            });
            n
        }
    }

    /// Returns a node to the free pool. The node must be detached.
    pub fn release(&mut self, n: NodeIdx) {
        debug_assert!(self.is_detached(n));
        self.free.push(n);
    }

    pub fn owner(&self, n: NodeIdx) -> O {
        self.nodes[n as usize].owner
    }

    pub fn next(&self, n: NodeIdx) -> NodeIdx {
        self.nodes[n as usize].next
    }

    pub fn is_detached(&self, n: NodeIdx) -> bool {
        self.nodes[n as usize].next == n
    }

    pub fn is_empty(&self, sentinel: NodeIdx) -> bool {
        self.is_detached(sentinel)
    }

    /// Inserts `e` before `l` (append to a queue when `l` is the sentinel).
    pub fn insert_before(&mut self, e: NodeIdx, l: NodeIdx) {
        debug_assert!(self.is_detached(e));
        let prev = self.nodes[l as usize].prev;
        self.nodes[e as usize].next = l;
        self.nodes[e as usize].prev = prev;
        self.nodes[prev as usize].next = e;
        self.nodes[l as usize].prev = e;
    }

    /// Appends `e` at the tail of the queue rooted at `sentinel`.
    pub fn append(&mut self, e: NodeIdx, sentinel: NodeIdx) {
        self.insert_before(e, sentinel);
    }

    /// Unlinks `e` and re-links it to itself. Safe to call on a node that
    /// is already detached.
    pub fn remove(&mut self, e: NodeIdx) {
        let next = self.nodes[e as usize].next;
        let prev = self.nodes[e as usize].prev;
        self.nodes[prev as usize].next = next;
        self.nodes[next as usize].prev = prev;
        self.nodes[e as usize].next = e;
        self.nodes[e as usize].prev = e;
    }

    /// Head of the queue, or `None` when empty.
    pub fn head(&self, sentinel: NodeIdx) -> Option<NodeIdx> {
        let next = self.nodes[sentinel as usize].next;
        if next == sentinel {
            None
        } else {
            Some(next)
        }
    }
}
