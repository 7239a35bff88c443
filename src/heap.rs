//! Intrusive binary min-heap.
//!
//! The tree is complete and binary: every node carries its own parent/left/
//! right links, the heap itself stores nothing but the root and an element
//! count. Links are indices into an arena supplied by the caller, so inserting
//! never allocates and a node can be unlinked in O(log n) no matter where it
//! sits. The ordering is entirely comparator-driven; the arena decides what
//! "less than" means for two of its entries.
//!
//! Mutations swap *links*, not payloads. Indices held by callers stay attached
//! to their entries across arbitrary insert/remove traffic, which is what lets
//! a callback re-arm or cancel other entries mid-iteration.

/// Link fields embedded in every arena entry that participates in a heap.
#[derive(Debug, Clone, Default)]
pub(crate) struct HeapNode {
    parent: Option<usize>,
    left: Option<usize>,
    right: Option<usize>,
}

impl HeapNode {
    pub(crate) fn new() -> HeapNode {
        HeapNode::default()
    }
}

/// Storage the heap operates on. `less_than` must be a strict weak ordering
/// over the entries of the arena.
pub(crate) trait HeapArena {
    fn node(&self, idx: usize) -> &HeapNode;
    fn node_mut(&mut self, idx: usize) -> &mut HeapNode;
    fn less_than(&self, a: usize, b: usize) -> bool;
}

/// A binary min-heap over arena indices.
#[derive(Debug, Default)]
pub(crate) struct Heap {
    root: Option<usize>,
    nelts: usize,
}

/// A link slot: either the root slot of the heap or a child slot of a node.
#[derive(Clone, Copy)]
enum SlotRef {
    Root,
    Left(usize),
    Right(usize),
}

impl Heap {
    pub(crate) fn new() -> Heap {
        Heap { root: None, nelts: 0 }
    }

    pub(crate) fn min(&self) -> Option<usize> {
        self.root
    }

    pub(crate) fn len(&self) -> usize {
        self.nelts
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nelts == 0
    }

    fn slot_get<A: HeapArena>(&self, arena: &A, slot: SlotRef) -> Option<usize> {
        match slot {
            SlotRef::Root => self.root,
            SlotRef::Left(owner) => arena.node(owner).left,
            SlotRef::Right(owner) => arena.node(owner).right,
        }
    }

    fn slot_set<A: HeapArena>(&mut self, arena: &mut A, slot: SlotRef, val: Option<usize>) {
        match slot {
            SlotRef::Root => self.root = val,
            SlotRef::Left(owner) => arena.node_mut(owner).left = val,
            SlotRef::Right(owner) => arena.node_mut(owner).right = val,
        }
    }

    /// Swap a parent with one of its children. The child moves closer to the
    /// root, the parent moves away; all other nodes keep their positions.
    fn node_swap<A: HeapArena>(&mut self, arena: &mut A, parent: usize, child: usize) {
        debug_assert_eq!(arena.node(child).parent, Some(parent));
        debug_assert!(
            arena.node(parent).left == Some(child) || arena.node(parent).right == Some(child)
        );

        let grand = arena.node(parent).parent;
        match grand {
            None => {
                debug_assert_eq!(self.root, Some(parent));
                self.root = Some(child);
            }
            Some(g) => {
                if arena.node(g).left == Some(parent) {
                    arena.node_mut(g).left = Some(child);
                } else {
                    debug_assert_eq!(arena.node(g).right, Some(parent));
                    arena.node_mut(g).right = Some(child);
                }
            }
        }

        let parent_left = arena.node(parent).left;
        let parent_right = arena.node(parent).right;
        let child_left = arena.node(child).left;
        let child_right = arena.node(child).right;

        {
            let c = arena.node_mut(child);
            c.parent = grand;
            c.left = parent_left;
            c.right = parent_right;
        }

        // One of the child's new child links is the child itself; that slot is
        // where the parent goes. The sibling subtree gets re-parented.
        if arena.node(child).left == Some(child) {
            arena.node_mut(child).left = Some(parent);
            if let Some(r) = arena.node(child).right {
                debug_assert_eq!(arena.node(r).parent, Some(parent));
                arena.node_mut(r).parent = Some(child);
            }
        } else {
            debug_assert_eq!(arena.node(child).right, Some(child));
            arena.node_mut(child).right = Some(parent);
            if let Some(l) = arena.node(child).left {
                debug_assert_eq!(arena.node(l).parent, Some(parent));
                arena.node_mut(l).parent = Some(child);
            }
        }

        {
            let p = arena.node_mut(parent);
            p.parent = Some(child);
            p.left = child_left;
            p.right = child_right;
        }

        if let Some(l) = child_left {
            debug_assert_eq!(arena.node(l).parent, Some(child));
            arena.node_mut(l).parent = Some(parent);
        }
        if let Some(r) = child_right {
            debug_assert_eq!(arena.node(r).parent, Some(child));
            arena.node_mut(r).parent = Some(parent);
        }
    }

    pub(crate) fn insert<A: HeapArena>(&mut self, arena: &mut A, newnode: usize) {
        {
            let n = arena.node_mut(newnode);
            n.parent = None;
            n.left = None;
            n.right = None;
        }

        // Path from the root to the insertion point, the left-most free slot
        // of the bottom row: the binary expansion of nelts+1 without its
        // leading bit, consumed low bit first.
        let mut path = 0usize;
        let mut k = 0u32;
        let mut n = 1 + self.nelts;
        while n >= 2 {
            path = (path << 1) | (n & 1);
            k += 1;
            n /= 2;
        }

        let mut parent = None;
        let mut slot = SlotRef::Root;
        for i in 0..k {
            let owner = self.slot_get(arena, slot).expect("heap path truncated");
            parent = Some(owner);
            slot = if (path >> i) & 1 == 1 {
                SlotRef::Right(owner)
            } else {
                SlotRef::Left(owner)
            };
        }

        arena.node_mut(newnode).parent = parent;
        self.slot_set(arena, slot, Some(newnode));
        self.nelts += 1;

        // Sift up while the new node orders before its parent.
        while let Some(p) = arena.node(newnode).parent {
            if !arena.less_than(newnode, p) {
                break;
            }
            self.node_swap(arena, p, newnode);
        }
    }

    pub(crate) fn remove<A: HeapArena>(&mut self, arena: &mut A, node: usize) {
        if self.nelts == 0 {
            return;
        }

        // Path from the root to the last node of the bottom row: the binary
        // expansion of nelts, consumed low bit first.
        let mut path = 0usize;
        let mut k = 0u32;
        let mut n = self.nelts;
        while n >= 2 {
            path = (path << 1) | (n & 1);
            k += 1;
            n /= 2;
        }

        let mut slot = SlotRef::Root;
        for i in 0..k {
            let owner = self.slot_get(arena, slot).expect("heap path truncated");
            slot = if (path >> i) & 1 == 1 {
                SlotRef::Right(owner)
            } else {
                SlotRef::Left(owner)
            };
        }

        self.nelts -= 1;

        // Unlink the last node. This must happen before the removed node's
        // links are read: when the removed node is the last node's parent, the
        // slot being cleared is one of those links.
        let last = self.slot_get(arena, slot).expect("heap count out of sync");
        debug_assert!(arena.node(last).left.is_none());
        debug_assert!(arena.node(last).right.is_none());
        self.slot_set(arena, slot, None);

        if last == node {
            // Removed the bottom-row node itself; the root slot was already
            // cleared above when it was the only node.
            return;
        }

        // Splice the last node into the removed node's position.
        let np = arena.node(node).parent;
        let nl = arena.node(node).left;
        let nr = arena.node(node).right;
        {
            let l = arena.node_mut(last);
            l.parent = np;
            l.left = nl;
            l.right = nr;
        }
        if let Some(l) = nl {
            arena.node_mut(l).parent = Some(last);
        }
        if let Some(r) = nr {
            arena.node_mut(r).parent = Some(last);
        }
        match np {
            None => {
                debug_assert_eq!(self.root, Some(node));
                self.root = Some(last);
            }
            Some(p) => {
                if arena.node(p).left == Some(node) {
                    arena.node_mut(p).left = Some(last);
                } else {
                    debug_assert_eq!(arena.node(p).right, Some(node));
                    arena.node_mut(p).right = Some(last);
                }
            }
        }

        // Sift down: swap with the smaller child while a child orders first.
        let child = last;
        loop {
            let mut smallest = child;
            if let Some(l) = arena.node(child).left {
                if arena.less_than(l, smallest) {
                    smallest = l;
                }
            }
            if let Some(r) = arena.node(child).right {
                if arena.less_than(r, smallest) {
                    smallest = r;
                }
            }
            if smallest == child {
                break;
            }
            self.node_swap(arena, child, smallest);
        }

        // Sift up as well: the spliced-in node came from the bottom row but is
        // not necessarily a maximum, so it can order before its new parent.
        while let Some(p) = arena.node(child).parent {
            if !arena.less_than(child, p) {
                break;
            }
            self.node_swap(arena, p, child);
        }
    }

    pub(crate) fn dequeue<A: HeapArena>(&mut self, arena: &mut A) -> Option<usize> {
        let min = self.root?;
        self.remove(arena, min);
        Some(min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    struct Arena {
        nodes: Vec<HeapNode>,
        keys: Vec<(u64, u64)>,
    }

    impl Arena {
        fn new() -> Arena {
            Arena { nodes: Vec::new(), keys: Vec::new() }
        }

        fn alloc(&mut self, key: (u64, u64)) -> usize {
            self.nodes.push(HeapNode::new());
            self.keys.push(key);
            self.nodes.len() - 1
        }
    }

    impl HeapArena for Arena {
        fn node(&self, idx: usize) -> &HeapNode {
            &self.nodes[idx]
        }

        fn node_mut(&mut self, idx: usize) -> &mut HeapNode {
            &mut self.nodes[idx]
        }

        fn less_than(&self, a: usize, b: usize) -> bool {
            self.keys[a] < self.keys[b]
        }
    }

    /// Walk the tree and check shape: parent/child reciprocity, the heap
    /// property, and that the reachable node count matches `len()`.
    fn check(heap: &Heap, arena: &Arena) {
        fn walk(arena: &Arena, idx: usize, parent: Option<usize>, count: &mut usize) {
            *count += 1;
            let n = arena.node(idx);
            assert_eq!(n.parent, parent);
            if let Some(p) = parent {
                assert!(!arena.less_than(idx, p), "heap property violated");
            }
            if let Some(l) = n.left {
                walk(arena, l, Some(idx), count);
            }
            if let Some(r) = n.right {
                walk(arena, r, Some(idx), count);
            }
        }

        let mut count = 0;
        if let Some(root) = heap.min() {
            walk(arena, root, None, &mut count);
        }
        assert_eq!(count, heap.len());
    }

    #[test]
    fn empty() {
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        assert!(heap.is_empty());
        assert_eq!(heap.min(), None);
        assert_eq!(heap.dequeue(&mut arena), None);
    }

    #[test]
    fn single_node() {
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        let n = arena.alloc((7, 0));
        heap.insert(&mut arena, n);
        assert_eq!(heap.min(), Some(n));
        assert_eq!(heap.len(), 1);
        heap.remove(&mut arena, n);
        assert!(heap.is_empty());
        assert_eq!(heap.min(), None);
    }

    #[test]
    fn insert_remove_is_identity() {
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        let base: Vec<usize> = (0..7).map(|i| arena.alloc((i * 10, i))).collect();
        for &n in &base {
            heap.insert(&mut arena, n);
        }
        check(&heap, &arena);

        let extra = arena.alloc((35, 100));
        heap.insert(&mut arena, extra);
        heap.remove(&mut arena, extra);
        check(&heap, &arena);
        assert_eq!(heap.len(), base.len());
        assert_eq!(heap.min(), Some(base[0]));
    }

    #[test]
    fn remove_interior_node() {
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        let nodes: Vec<usize> = (0..31).map(|i| arena.alloc((i, i))).collect();
        for &n in &nodes {
            heap.insert(&mut arena, n);
        }
        // Remove a node from the middle of the tree, then the root.
        heap.remove(&mut arena, nodes[5]);
        check(&heap, &arena);
        heap.remove(&mut arena, nodes[0]);
        check(&heap, &arena);
        assert_eq!(heap.len(), 29);
        assert_eq!(heap.min(), Some(nodes[1]));
    }

    #[test]
    fn removing_last_nodes_parent() {
        // Exercise the splice where the removed node is the parent of the
        // bottom-row node that replaces it.
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        let nodes: Vec<usize> = (0..6).map(|i| arena.alloc((i, i))).collect();
        for &n in &nodes {
            heap.insert(&mut arena, n);
        }
        // With 6 elements the last node is index 5's position, child of the
        // node holding key 2.
        heap.remove(&mut arena, nodes[2]);
        check(&heap, &arena);
        assert_eq!(heap.len(), 5);
    }

    #[test]
    fn dequeue_is_sorted() {
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        for i in [9u64, 3, 7, 1, 8, 2, 6, 0, 5, 4] {
            let n = arena.alloc((i, i));
            heap.insert(&mut arena, n);
        }
        let mut prev = None;
        while let Some(n) = heap.dequeue(&mut arena) {
            let key = arena.keys[n];
            if let Some(p) = prev {
                assert!(key >= p);
            }
            prev = Some(key);
            check(&heap, &arena);
        }
    }

    #[test]
    fn equal_keys_break_ties_by_sequence() {
        let mut arena = Arena::new();
        let mut heap = Heap::new();
        for seq in 0..16u64 {
            let n = arena.alloc((42, seq));
            heap.insert(&mut arena, n);
        }
        let mut seqs = Vec::new();
        while let Some(n) = heap.dequeue(&mut arena) {
            seqs.push(arena.keys[n].1);
        }
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        assert_eq!(seqs, sorted);
    }

    #[test]
    fn stress_random() {
        let mut rng = rand::thread_rng();
        let mut arena = Arena::new();
        let mut heap = Heap::new();

        let mut live: Vec<usize> = Vec::new();
        for seq in 0..10_000u64 {
            let n = arena.alloc((rng.gen_range(0..1_000), seq));
            heap.insert(&mut arena, n);
            live.push(n);
        }
        check(&heap, &arena);

        // Random interior removals keep the shape intact.
        for _ in 0..1_000 {
            let i = rng.gen_range(0..live.len());
            let n = live.swap_remove(i);
            heap.remove(&mut arena, n);
        }
        check(&heap, &arena);
        assert_eq!(heap.len(), 9_000);

        // Draining yields keys in non-decreasing (value, sequence) order.
        let mut prev = (0, 0);
        while let Some(n) = heap.dequeue(&mut arena) {
            let key = arena.keys[n];
            assert!(key >= prev, "dequeued {:?} after {:?}", key, prev);
            prev = key;
        }
        assert!(heap.is_empty());
    }
}
