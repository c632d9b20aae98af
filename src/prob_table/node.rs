use crate::arena::Index;

/// A value observed for a feature. The table never interprets this beyond
/// ordering and equality.
pub type Value = u32;

pub type InteriorIdx = Index<Interior>;
pub type LeafIdx = Index<Leaf>;
pub type TreeIdx = Index<TreeRoot>;

/// Tagged reference to either an interior BST node or a leaf, replacing the
/// source's top-bit-tagged 32-bit pointer (see DESIGN.md, "Cyclic/owning
/// graphs").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Interior(InteriorIdx),
    Leaf(LeafIdx),
}

/// An interior BST node. `sort_key` is the largest value in the left
/// subtree; routing a value `v <= sort_key` goes left, otherwise right.
pub struct Interior {
    pub sort_key: Value,
    pub left: NodeRef,
    pub right: NodeRef,
    pub aggregate: f64,
    /// Rebalance countdown; `rebalance` is attempted when this reaches zero.
    pub wait: u16,
}

/// A leaf: one observed value and its decayed count, plus the head of the
/// linked list of nested trees keyed by features other than any ancestor.
pub struct Leaf {
    pub value: Value,
    pub count: f64,
    pub nested: Option<TreeIdx>,
}

/// The root of one BST (either a table's top-level tree for some feature, or
/// a tree nested under a leaf). Caches entropy lazily; `entropy_wait` counts
/// down on every `record` that descends into this exact tree, per spec
/// 4.1's `entropy` operation.
pub struct TreeRoot {
    pub feature: u8,
    pub root: Option<NodeRef>,
    pub entropy: f64,
    pub entropy_wait: u32,
    /// Next tree in the nested-tree linked list hanging off the owning leaf.
    /// Unused (always `None`) for top-level trees.
    pub next: Option<TreeIdx>,
}

impl TreeRoot {
    pub fn new(feature: u8) -> Self {
        Self {
            feature,
            root: None,
            entropy: 0.0,
            entropy_wait: 0,
            next: None,
        }
    }
}
