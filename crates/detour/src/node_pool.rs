//! Search node storage for graph queries
//!
//! A [`QueryContext`] bundles the scratch memory a query needs: the main node
//! pool and open list used by path searches, and a small pool for local
//! searches such as surface moves. Contexts are plain values; whoever owns one
//! has exclusive use of it, which is what makes them safe to hand between
//! threads.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use bitflags::bitflags;

use super::PolyRef;

/// Default size of the main node pool
pub const DEFAULT_MAX_NODES: usize = 2048;

/// Size of the pool used by local searches
pub const TINY_POOL_SIZE: usize = 64;

/// Index of a node within its pool
pub type NodeIndex = u32;

/// Null node index
pub const DT_NULL_IDX: NodeIndex = NodeIndex::MAX;

bitflags! {
    /// Search state of a node
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const OPEN = 0x01;
        const CLOSED = 0x02;
    }
}

/// Node in the search graph
#[derive(Debug, Clone)]
pub struct Node {
    /// Position the node was entered at
    pub pos: [f32; 3],
    /// Cost from the start to this node
    pub cost: f32,
    /// Cost plus heuristic
    pub total: f32,
    /// Parent node, [`DT_NULL_IDX`] for the start
    pub parent: NodeIndex,
    /// Extra key so one polygon can be visited through several portals
    pub state: u8,
    pub flags: NodeFlags,
    pub id: PolyRef,
}

/// Bounded pool of nodes keyed by polygon and state
#[derive(Debug)]
pub struct NodePool {
    nodes: Vec<Node>,
    lookup: HashMap<(PolyRef, u8), NodeIndex>,
    max_nodes: usize,
}

impl NodePool {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(max_nodes),
            lookup: HashMap::with_capacity(max_nodes),
            max_nodes,
        }
    }

    /// Forgets every node while keeping the allocation
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.lookup.clear();
    }

    /// Returns the node for `(id, state)`, allocating it if needed
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn get_node(&mut self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        if let Some(&idx) = self.lookup.get(&(id, state)) {
            return Some(idx);
        }
        if self.nodes.len() >= self.max_nodes {
            return None;
        }

        let idx = self.nodes.len() as NodeIndex;
        self.nodes.push(Node {
            pos: [0.0; 3],
            cost: 0.0,
            total: 0.0,
            parent: DT_NULL_IDX,
            state,
            flags: NodeFlags::empty(),
            id,
        });
        self.lookup.insert((id, state), idx);
        Some(idx)
    }

    pub fn find_node(&self, id: PolyRef, state: u8) -> Option<NodeIndex> {
        self.lookup.get(&(id, state)).copied()
    }

    /// Finds the first node allocated for a polygon, whatever its state
    pub fn find_first(&self, id: PolyRef) -> Option<NodeIndex> {
        self.nodes.iter().position(|n| n.id == id).map(|i| i as NodeIndex)
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx as usize]
    }

    pub fn node_mut(&mut self, idx: NodeIndex) -> &mut Node {
        &mut self.nodes[idx as usize]
    }

    /// Follows parent links from `idx` back to the start and returns the polygons in travel order
    pub fn path_to(&self, idx: NodeIndex) -> Vec<PolyRef> {
        let mut path = Vec::new();
        let mut cur = idx;
        while cur != DT_NULL_IDX {
            let node = self.node(cur);
            path.push(node.id);
            cur = node.parent;
        }
        path.reverse();
        path
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }
}

/// Open list entry ordered so the lowest total pops first
#[derive(Debug, Clone, Copy)]
pub struct OpenEntry {
    pub total: f32,
    pub idx: NodeIndex,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .total
            .total_cmp(&self.total)
            .then_with(|| other.idx.cmp(&self.idx))
    }
}

/// Scratch memory for one query at a time
#[derive(Debug)]
pub struct QueryContext {
    pub(crate) node_pool: NodePool,
    pub(crate) tiny_pool: NodePool,
    pub(crate) open_list: BinaryHeap<OpenEntry>,
}

impl QueryContext {
    pub fn new(max_nodes: usize) -> Self {
        Self {
            node_pool: NodePool::new(max_nodes.max(1)),
            tiny_pool: NodePool::new(TINY_POOL_SIZE),
            open_list: BinaryHeap::new(),
        }
    }

    pub fn max_nodes(&self) -> usize {
        self.node_pool.max_nodes()
    }

    pub(crate) fn reset(&mut self) {
        self.node_pool.clear();
        self.open_list.clear();
    }
}

impl Default for QueryContext {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_NODES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_node_reuses_existing() {
        let mut pool = NodePool::new(4);
        let a = pool.get_node(PolyRef::new(7), 0).unwrap();
        let b = pool.get_node(PolyRef::new(7), 0).unwrap();
        let c = pool.get_node(PolyRef::new(7), 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.find_node(PolyRef::new(7), 1), Some(c));
        assert_eq!(pool.find_node(PolyRef::new(8), 0), None);
        assert_eq!(pool.find_first(PolyRef::new(7)), Some(a));
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut pool = NodePool::new(2);
        assert!(pool.get_node(PolyRef::new(1), 0).is_some());
        assert!(pool.get_node(PolyRef::new(2), 0).is_some());
        assert!(pool.get_node(PolyRef::new(3), 0).is_none());

        pool.clear();
        assert!(pool.is_empty());
        assert!(pool.get_node(PolyRef::new(3), 0).is_some());
    }

    #[test]
    fn test_path_to_follows_parents() {
        let mut pool = NodePool::new(8);
        let a = pool.get_node(PolyRef::new(1), 0).unwrap();
        let b = pool.get_node(PolyRef::new(2), 0).unwrap();
        let c = pool.get_node(PolyRef::new(3), 0).unwrap();
        pool.node_mut(b).parent = a;
        pool.node_mut(c).parent = b;
        assert_eq!(
            pool.path_to(c),
            vec![PolyRef::new(1), PolyRef::new(2), PolyRef::new(3)]
        );
    }

    #[test]
    fn test_open_list_pops_cheapest_first() {
        let mut heap = BinaryHeap::new();
        heap.push(OpenEntry { total: 3.0, idx: 0 });
        heap.push(OpenEntry { total: 1.0, idx: 1 });
        heap.push(OpenEntry { total: 2.0, idx: 2 });
        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|e| e.idx)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }
}
