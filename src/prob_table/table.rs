//! The adaptive probability table: nested BSTs of observed feature values
//! with decimal (decayed) counts, per spec.md §4.1.
//!
//! Grounded in the teacher's arena-of-indices style (`petgraph::graph::*Index`
//! in `examples/krukah-robopoker/src/mccfr/tree.rs`), adapted per
//! DESIGN.md/spec §9 to a hand-rolled slab [`Arena`] since the structure here
//! is a forest of per-feature BSTs with freelist reuse, not a general graph.

use crate::arena::Arena;
use super::node::{Interior, Leaf, NodeRef, TreeRoot, Value};

/// Maximum number of distinct features a table (and the engine as a whole)
/// may track, per spec.md §3 ("at most 8").
pub const MAX_FEATURES: usize = 8;

/// Relative tolerance allowed between an interior node's aggregate and the
/// sum of its children, per spec.md §3's invariant.
pub const AGGREGATE_TOLERANCE: f64 = 0.001;

/// The fraction by which a rebalance must shrink the weight imbalance to be
/// worth performing, per spec.md §4.1.
const REBALANCE_IMPROVEMENT: f64 = 0.001;

/// An adaptive, nested-tree probability table. One feature list's worth of
/// joint/conditional empirical frequencies, arena-backed so leaves and
/// interior nodes can be pruned and reused without fragmenting memory.
pub struct ProbabilityTable {
    trees: Arena<TreeRoot>,
    interior: Arena<Interior>,
    leaves: Arena<Leaf>,
    top: [Option<super::node::TreeIdx>; MAX_FEATURES],
}

impl Default for ProbabilityTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbabilityTable {
    pub fn new() -> Self {
        Self {
            trees: Arena::new(),
            interior: Arena::new(),
            leaves: Arena::new(),
            top: [None; MAX_FEATURES],
        }
    }

    pub fn interior_node_count(&self) -> usize {
        self.interior.len()
    }
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }
    pub fn tree_count(&self) -> usize {
        self.trees.len()
    }

    fn node_aggregate(&self, node: NodeRef) -> f64 {
        match node {
            NodeRef::Leaf(l) => self.leaves.get(l).count,
            NodeRef::Interior(i) => self.interior.get(i).aggregate,
        }
    }

    fn reset_wait(lw: f64, rw: f64) -> u16 {
        let raw = (2.0 * lw.min(rw) - lw.max(rw)).ceil();
        raw.max(10.0).min(65535.0) as u16
    }

    // ---- lookups -------------------------------------------------------

    fn bst_find(&self, mut node: NodeRef, value: Value) -> Option<super::node::LeafIdx> {
        loop {
            match node {
                NodeRef::Leaf(l) => {
                    return if self.leaves.get(l).value == value {
                        Some(l)
                    } else {
                        None
                    };
                }
                NodeRef::Interior(i) => {
                    let n = self.interior.get(i);
                    node = if value <= n.sort_key { n.left } else { n.right };
                }
            }
        }
    }

    fn find_nested(
        &self,
        leaf: super::node::LeafIdx,
        feature: u8,
    ) -> Option<super::node::TreeIdx> {
        let mut cur = self.leaves.get(leaf).nested;
        while let Some(t) = cur {
            let tr = self.trees.get(t);
            if tr.feature == feature {
                return Some(t);
            }
            cur = tr.next;
        }
        None
    }

    fn find_leaf_at_depth(
        &self,
        feats: &[u8],
        vals: &[Value],
        depth: usize,
    ) -> Option<super::node::LeafIdx> {
        if depth == 0 {
            return None;
        }
        let f0 = *feats.first()?;
        let tree = (*self.top.get(f0 as usize)?)?;
        let mut leaf = self.bst_find(self.trees.get(tree).root?, vals[0])?;
        for d in 1..depth {
            let feature = feats[d];
            let tree = self.find_nested(leaf, feature)?;
            leaf = self.bst_find(self.trees.get(tree).root?, vals[d])?;
        }
        Some(leaf)
    }

    fn locate_tree(
        &self,
        feats: &[u8],
        vals: &[Value],
        prefix_len: usize,
    ) -> Option<super::node::TreeIdx> {
        if prefix_len == 0 {
            let f0 = *feats.first()?;
            return *self.top.get(f0 as usize)?;
        }
        let leaf = self.find_leaf_at_depth(feats, vals, prefix_len)?;
        let next_feature = *feats.get(prefix_len)?;
        self.find_nested(leaf, next_feature)
    }

    /// The count/aggregate representing "total observations matching this
    /// prefix", at `prefix_len == 0` the whole top-level tree's aggregate,
    /// otherwise the matching leaf's count. `None` if the path is absent.
    fn node_count_after_prefix(&self, feats: &[u8], vals: &[Value], prefix_len: usize) -> Option<f64> {
        if prefix_len == 0 {
            let f0 = *feats.first()?;
            let tree = (*self.top.get(f0 as usize)?)?;
            let root = self.trees.get(tree).root?;
            Some(self.node_aggregate(root))
        } else {
            let leaf = self.find_leaf_at_depth(feats, vals, prefix_len)?;
            Some(self.leaves.get(leaf).count)
        }
    }

    // ---- public read operations (spec.md §4.1) --------------------------

    /// `probability(feature_sequence, value_sequence, cond_prefix_len)`.
    /// `None` is the `NO_RECORD` sentinel (missing denominator).
    pub fn probability(&self, feats: &[u8], vals: &[Value], cond_prefix_len: usize) -> Option<f64> {
        let d = self.node_count_after_prefix(feats, vals, cond_prefix_len)?;
        if d <= 0.0 {
            return Some(0.0);
        }
        let n = self
            .node_count_after_prefix(feats, vals, feats.len())
            .unwrap_or(0.0);
        Some(n / d)
    }

    /// `probability_plus_one`: Laplace-smoothed, strictly positive for any
    /// input, including combinations never recorded.
    pub fn probability_plus_one(&self, feats: &[u8], vals: &[Value], cond_prefix_len: usize) -> f64 {
        let d = self
            .node_count_after_prefix(feats, vals, cond_prefix_len)
            .unwrap_or(0.0);
        let n = self
            .node_count_after_prefix(feats, vals, feats.len())
            .unwrap_or(0.0);
        (n + 1.0) / (d + 1.0)
    }

    /// `count(feature_sequence, value_sequence, depth)`.
    pub fn count(&self, feats: &[u8], vals: &[Value], depth: usize) -> f64 {
        self.node_count_after_prefix(feats, vals, depth).unwrap_or(0.0)
    }

    /// `entropy(feature_sequence, value_sequence, prefix_len)`, lazily
    /// cached on the located tree root. Takes `&mut self` because a cache
    /// miss recomputes and stores the result.
    pub fn entropy(&mut self, feats: &[u8], vals: &[Value], prefix_len: usize) -> f64 {
        let tree = match self.locate_tree(feats, vals, prefix_len) {
            Some(t) => t,
            None => return 0.0,
        };
        if self.trees.get(tree).entropy_wait > 0 {
            return self.trees.get(tree).entropy;
        }
        let root = self.trees.get(tree).root;
        let total = root.map(|r| self.node_aggregate(r)).unwrap_or(0.0);
        let h = if total <= 0.0 {
            0.0
        } else {
            let mut leaves = Vec::new();
            if let Some(r) = root {
                self.collect_leaves(r, &mut leaves);
            }
            leaves
                .iter()
                .map(|&li| {
                    let c = self.leaves.get(li).count;
                    if c <= 0.0 {
                        0.0
                    } else {
                        let p = c / total;
                        -p * p.log2()
                    }
                })
                .sum()
        };
        let wait = (0.1 * total).clamp(100.0, 10000.0) as u32;
        let t = self.trees.get_mut(tree);
        t.entropy = h;
        t.entropy_wait = wait.max(1);
        h
    }

    fn collect_leaves(&self, node: NodeRef, out: &mut Vec<super::node::LeafIdx>) {
        match node {
            NodeRef::Leaf(l) => out.push(l),
            NodeRef::Interior(i) => {
                let n = self.interior.get(i);
                self.collect_leaves(n.left, out);
                self.collect_leaves(n.right, out);
            }
        }
    }

    // ---- write operations ------------------------------------------------

    fn get_or_create_top(&mut self, feature: u8) -> super::node::TreeIdx {
        if let Some(t) = self.top[feature as usize] {
            return t;
        }
        let t = self.trees.alloc(TreeRoot::new(feature));
        self.top[feature as usize] = Some(t);
        t
    }

    fn get_or_create_nested(
        &mut self,
        leaf: super::node::LeafIdx,
        feature: u8,
    ) -> super::node::TreeIdx {
        if let Some(t) = self.find_nested(leaf, feature) {
            return t;
        }
        let mut root = TreeRoot::new(feature);
        root.next = self.leaves.get(leaf).nested;
        let t = self.trees.alloc(root);
        self.leaves.get_mut(leaf).nested = Some(t);
        t
    }

    /// `record(feature_sequence, value_sequence)`: walk or create the
    /// nested trees in order, incrementing every leaf visited by one.
    pub fn record(&mut self, feats: &[u8], vals: &[Value]) {
        self.record_weighted(feats, vals, 1.0);
    }

    /// Like `record`, but increments every leaf visited by `weight` rather
    /// than a fixed `1.0`. Used by checkpoint recovery to restore exact
    /// decayed counts (spec.md §6 checkpoint round-trip) without replaying
    /// the original observation-by-observation history.
    pub fn record_weighted(&mut self, feats: &[u8], vals: &[Value], weight: f64) {
        assert_eq!(feats.len(), vals.len(), "feature/value arity mismatch");
        assert!(!feats.is_empty(), "record requires at least one feature");
        assert!(feats.len() <= MAX_FEATURES);

        let mut tree = self.get_or_create_top(feats[0]);
        let mut leaf_idx: Option<super::node::LeafIdx> = None;
        for d in 0..feats.len() {
            if d > 0 {
                tree = self.get_or_create_nested(leaf_idx.expect("leaf set by d=0"), feats[d]);
            }
            {
                let t = self.trees.get_mut(tree);
                if t.entropy_wait > 0 {
                    t.entropy_wait -= 1;
                }
            }
            let root = self.trees.get(tree).root;
            let (new_root, li) = match root {
                None => {
                    let li = self.leaves.alloc(Leaf {
                        value: vals[d],
                        count: weight,
                        nested: None,
                    });
                    (NodeRef::Leaf(li), li)
                }
                Some(r) => self.insert_value(r, vals[d], weight, true, true),
            };
            self.trees.get_mut(tree).root = Some(new_root);
            leaf_idx = Some(li);
        }
    }

    /// Visits every leaf in every tree (top-level and nested) with the full
    /// feature/value path leading to it and its decayed count. Used by
    /// checkpoint serialization to dump a table's logical contents rather
    /// than its physical arena layout (see DESIGN.md "checkpoint format").
    pub fn for_each_leaf(&self, mut visit: impl FnMut(&[u8], &[Value], f64)) {
        let mut feats_buf = Vec::new();
        let mut vals_buf = Vec::new();
        for f in 0..MAX_FEATURES {
            if let Some(tree_idx) = self.top[f] {
                feats_buf.push(f as u8);
                if let Some(root) = self.trees.get(tree_idx).root {
                    self.walk_leaves(root, &mut feats_buf, &mut vals_buf, &mut visit);
                }
                feats_buf.pop();
            }
        }
    }

    fn walk_leaves(
        &self,
        node: NodeRef,
        feats: &mut Vec<u8>,
        vals: &mut Vec<Value>,
        visit: &mut impl FnMut(&[u8], &[Value], f64),
    ) {
        match node {
            NodeRef::Leaf(l) => {
                let leaf = self.leaves.get(l);
                vals.push(leaf.value);
                if leaf.nested.is_none() {
                    // Only terminal leaves are emitted: record_weighted's
                    // 0..feats.len() loop increments every ancestor's count
                    // too, so replaying the deepest path alone rebuilds
                    // every ancestor total exactly.
                    visit(feats, vals, leaf.count);
                }
                let mut cur = leaf.nested;
                while let Some(t) = cur {
                    let tr = self.trees.get(t);
                    feats.push(tr.feature);
                    if let Some(r) = tr.root {
                        self.walk_leaves(r, feats, vals, visit);
                    }
                    feats.pop();
                    cur = tr.next;
                }
                vals.pop();
            }
            NodeRef::Interior(i) => {
                let n = self.interior.get(i);
                self.walk_leaves(n.left, feats, vals, visit);
                self.walk_leaves(n.right, feats, vals, visit);
            }
        }
    }

    /// Insert `value` into the subtree rooted at `node`, returning the
    /// (possibly new) root of that subtree and the leaf touched.
    ///
    /// `bump`: increment interior aggregates incrementally as `delta` (the
    /// normal `record` path); when `false`, aggregates along the path are
    /// recomputed as exact sums instead (used by `shift`, which moves
    /// existing weight rather than adding new observations).
    ///
    /// `rebal`: whether to tick rebalance-wait counters and possibly
    /// rebalance while descending (disabled during `shift`'s reinsertion to
    /// avoid re-entrant rebalancing of a tree already mid-rebalance).
    fn insert_value(
        &mut self,
        node: NodeRef,
        value: Value,
        delta: f64,
        bump: bool,
        rebal: bool,
    ) -> (NodeRef, super::node::LeafIdx) {
        match node {
            NodeRef::Leaf(leaf_idx) => {
                let old_value = self.leaves.get(leaf_idx).value;
                if old_value == value {
                    self.leaves.get_mut(leaf_idx).count += delta;
                    return (NodeRef::Leaf(leaf_idx), leaf_idx);
                }
                let new_leaf = self.leaves.alloc(Leaf {
                    value,
                    count: delta,
                    nested: None,
                });
                let (left, right, sort_key) = if value < old_value {
                    (NodeRef::Leaf(new_leaf), NodeRef::Leaf(leaf_idx), value)
                } else {
                    (NodeRef::Leaf(leaf_idx), NodeRef::Leaf(new_leaf), old_value)
                };
                let lw = self.node_aggregate(left);
                let rw = self.node_aggregate(right);
                let interior = self.interior.alloc(Interior {
                    sort_key,
                    left,
                    right,
                    aggregate: lw + rw,
                    wait: Self::reset_wait(lw, rw),
                });
                (NodeRef::Interior(interior), new_leaf)
            }
            NodeRef::Interior(idx) => {
                if bump {
                    self.interior.get_mut(idx).aggregate += delta;
                }
                let do_rebal_now = if rebal {
                    let n = self.interior.get_mut(idx);
                    n.wait = n.wait.saturating_sub(1);
                    n.wait == 0
                } else {
                    false
                };
                if do_rebal_now {
                    self.rebalance(idx);
                }
                let (sort_key, left, right) = {
                    let n = self.interior.get(idx);
                    (n.sort_key, n.left, n.right)
                };
                let leaf_idx;
                if value <= sort_key {
                    let (new_left, li) = self.insert_value(left, value, delta, bump, rebal);
                    self.interior.get_mut(idx).left = new_left;
                    leaf_idx = li;
                } else {
                    let (new_right, li) = self.insert_value(right, value, delta, bump, rebal);
                    self.interior.get_mut(idx).right = new_right;
                    leaf_idx = li;
                }
                if !bump {
                    let l = self.interior.get(idx).left;
                    let r = self.interior.get(idx).right;
                    let agg = self.node_aggregate(l) + self.node_aggregate(r);
                    self.interior.get_mut(idx).aggregate = agg;
                }
                if do_rebal_now {
                    let l = self.interior.get(idx).left;
                    let r = self.interior.get(idx).right;
                    let (lw, rw) = (self.node_aggregate(l), self.node_aggregate(r));
                    self.interior.get_mut(idx).wait = Self::reset_wait(lw, rw);
                }
                (NodeRef::Interior(idx), leaf_idx)
            }
        }
    }

    // ---- rebalance -------------------------------------------------------

    fn rebalance(&mut self, idx: super::node::InteriorIdx) {
        let (left, right) = {
            let n = self.interior.get(idx);
            (n.left, n.right)
        };
        let lw = self.node_aggregate(left);
        let rw = self.node_aggregate(right);
        let imbalance = (lw - rw).abs();
        if imbalance <= 0.0 {
            return;
        }
        let mut rotated = false;
        if lw > rw {
            if let NodeRef::Interior(l_idx) = left {
                let (ll, lr) = {
                    let l = self.interior.get(l_idx);
                    (l.left, l.right)
                };
                let new_left_w = self.node_aggregate(ll);
                let new_right_w = self.node_aggregate(lr) + rw;
                let new_imbalance = (new_left_w - new_right_w).abs();
                if new_imbalance <= imbalance * (1.0 - REBALANCE_IMPROVEMENT) {
                    self.rotate_right(idx);
                    rotated = true;
                }
            }
        } else if rw > lw {
            if let NodeRef::Interior(r_idx) = right {
                let (rl, rr) = {
                    let r = self.interior.get(r_idx);
                    (r.left, r.right)
                };
                let new_right_w = self.node_aggregate(rr);
                let new_left_w = lw + self.node_aggregate(rl);
                let new_imbalance = (new_left_w - new_right_w).abs();
                if new_imbalance <= imbalance * (1.0 - REBALANCE_IMPROVEMENT) {
                    self.rotate_left(idx);
                    rotated = true;
                }
            }
        }
        if !rotated {
            self.shift(idx);
        }
    }

    fn rotate_right(&mut self, idx: super::node::InteriorIdx) {
        let (l_idx, node_right, node_sort_key) = {
            let n = self.interior.get(idx);
            match n.left {
                NodeRef::Interior(l) => (l, n.right, n.sort_key),
                NodeRef::Leaf(_) => return,
            }
        };
        let (ll, lr, l_sort_key) = {
            let l = self.interior.get(l_idx);
            (l.left, l.right, l.sort_key)
        };
        let lr_agg = self.node_aggregate(lr);
        let right_agg = self.node_aggregate(node_right);
        {
            let l = self.interior.get_mut(l_idx);
            l.sort_key = node_sort_key;
            l.left = lr;
            l.right = node_right;
            l.aggregate = lr_agg + right_agg;
            l.wait = Self::reset_wait(lr_agg, right_agg);
        }
        let n = self.interior.get_mut(idx);
        n.left = ll;
        n.right = NodeRef::Interior(l_idx);
        n.sort_key = l_sort_key;
    }

    fn rotate_left(&mut self, idx: super::node::InteriorIdx) {
        let (r_idx, node_left, node_sort_key) = {
            let n = self.interior.get(idx);
            match n.right {
                NodeRef::Interior(r) => (r, n.left, n.sort_key),
                NodeRef::Leaf(_) => return,
            }
        };
        let (rl, rr, _r_sort_key) = {
            let r = self.interior.get(r_idx);
            (r.left, r.right, r.sort_key)
        };
        let rl_agg = self.node_aggregate(rl);
        let left_agg = self.node_aggregate(node_left);
        {
            let r = self.interior.get_mut(r_idx);
            r.sort_key = node_sort_key;
            r.left = node_left;
            r.right = rl;
            r.aggregate = left_agg + rl_agg;
            r.wait = Self::reset_wait(left_agg, rl_agg);
        }
        let n = self.interior.get_mut(idx);
        n.right = rr;
        n.left = NodeRef::Interior(r_idx);
        // idx's sort_key is the max of its (now larger) left subtree; the
        // left subtree only grew by absorbing r's former left child, whose
        // values are all <= the old sort_key by BST ordering, so it is
        // unchanged.
        n.sort_key = node_sort_key;
    }

    fn max_value(&self, node: NodeRef) -> Value {
        match node {
            NodeRef::Leaf(l) => self.leaves.get(l).value,
            NodeRef::Interior(i) => self.max_value(self.interior.get(i).right),
        }
    }

    /// The non-rotation rebalance fallback: move the heavier side's
    /// innermost leaf to the lighter side, if it's light enough to not
    /// simply flip which side is heavier.
    fn shift(&mut self, idx: super::node::InteriorIdx) {
        let (left, right) = {
            let n = self.interior.get(idx);
            (n.left, n.right)
        };
        let lw = self.node_aggregate(left);
        let rw = self.node_aggregate(right);
        let imbalance = (lw - rw).abs();
        if imbalance <= 0.0 {
            return;
        }
        if lw > rw {
            if let NodeRef::Interior(_) = left {
                let (value, count) = self.peek_rightmost(left);
                if count < imbalance {
                    let (new_left, value, count) = self.take_rightmost(left);
                    let (new_right, _) = self.insert_value(right, value, count, false, false);
                    let n = self.interior.get_mut(idx);
                    n.left = new_left;
                    n.right = new_right;
                    let lw = self.node_aggregate(new_left);
                    let rw = self.node_aggregate(new_right);
                    let n = self.interior.get_mut(idx);
                    n.aggregate = lw + rw;
                }
            }
        } else if let NodeRef::Interior(_) = right {
            let (value, count) = self.peek_leftmost(right);
            if count < imbalance {
                let (new_right, value, count) = self.take_leftmost(right);
                let (new_left, _) = self.insert_value(left, value, count, false, false);
                let n = self.interior.get_mut(idx);
                n.left = new_left;
                n.right = new_right;
                let lw = self.node_aggregate(new_left);
                let rw = self.node_aggregate(new_right);
                let n = self.interior.get_mut(idx);
                n.aggregate = lw + rw;
            }
        }
    }

    fn peek_rightmost(&self, node: NodeRef) -> (Value, f64) {
        match node {
            NodeRef::Leaf(l) => {
                let leaf = self.leaves.get(l);
                (leaf.value, leaf.count)
            }
            NodeRef::Interior(i) => self.peek_rightmost(self.interior.get(i).right),
        }
    }

    fn peek_leftmost(&self, node: NodeRef) -> (Value, f64) {
        match node {
            NodeRef::Leaf(l) => {
                let leaf = self.leaves.get(l);
                (leaf.value, leaf.count)
            }
            NodeRef::Interior(i) => self.peek_leftmost(self.interior.get(i).left),
        }
    }

    /// Remove and return the rightmost (max-value) leaf reachable from
    /// `node`, plus the replacement for `node`'s own slot. Only called on
    /// subtrees known to contain at least two leaves, so the replacement is
    /// always `Some` in spirit (never collapses past the caller's slot).
    fn take_rightmost(&mut self, node: NodeRef) -> (NodeRef, Value, f64) {
        match node {
            NodeRef::Leaf(_) => unreachable!("caller guarantees an Interior with >=2 leaves"),
            NodeRef::Interior(idx) => {
                let (left, right) = {
                    let n = self.interior.get(idx);
                    (n.left, n.right)
                };
                match right {
                    NodeRef::Leaf(leaf_idx) => {
                        let leaf = self.leaves.free(leaf_idx);
                        self.interior.free(idx);
                        (left, leaf.value, leaf.count)
                    }
                    NodeRef::Interior(_) => {
                        let (new_right, value, count) = self.take_rightmost(right);
                        let lw = self.node_aggregate(left);
                        let rw = self.node_aggregate(new_right);
                        let n = self.interior.get_mut(idx);
                        n.right = new_right;
                        n.aggregate = lw + rw;
                        (NodeRef::Interior(idx), value, count)
                    }
                }
            }
        }
    }

    fn take_leftmost(&mut self, node: NodeRef) -> (NodeRef, Value, f64) {
        match node {
            NodeRef::Leaf(_) => unreachable!("caller guarantees an Interior with >=2 leaves"),
            NodeRef::Interior(idx) => {
                let (left, right) = {
                    let n = self.interior.get(idx);
                    (n.left, n.right)
                };
                match left {
                    NodeRef::Leaf(leaf_idx) => {
                        let leaf = self.leaves.free(leaf_idx);
                        self.interior.free(idx);
                        (right, leaf.value, leaf.count)
                    }
                    NodeRef::Interior(_) => {
                        let (new_left, value, count) = self.take_leftmost(left);
                        let lw = self.node_aggregate(new_left);
                        let rw = self.node_aggregate(right);
                        let n = self.interior.get_mut(idx);
                        n.left = new_left;
                        n.aggregate = lw + rw;
                        (NodeRef::Interior(idx), value, count)
                    }
                }
            }
        }
    }

    // ---- scale and prune ---------------------------------------------

    /// `scale_and_prune(factor, threshold)`: multiply every count by
    /// `factor`, dropping any leaf (and collapsing any now-childless
    /// interior) whose scaled count falls below `threshold`.
    pub fn scale_and_prune(&mut self, factor: f64, threshold: f64) {
        for f in 0..MAX_FEATURES {
            if let Some(tree_idx) = self.top[f] {
                let root = self.trees.get(tree_idx).root;
                let new_root = root.and_then(|r| self.scale_prune_node(r, factor, threshold));
                let t = self.trees.get_mut(tree_idx);
                t.root = new_root;
                t.entropy_wait = 0;
            }
        }
    }

    fn scale_prune_node(&mut self, node: NodeRef, factor: f64, threshold: f64) -> Option<NodeRef> {
        match node {
            NodeRef::Leaf(idx) => {
                let new_count = self.leaves.get(idx).count * factor;
                if new_count < threshold {
                    self.free_leaf_and_nested(idx);
                    None
                } else {
                    self.leaves.get_mut(idx).count = new_count;
                    self.scale_prune_nested_list(idx, factor, threshold);
                    Some(NodeRef::Leaf(idx))
                }
            }
            NodeRef::Interior(idx) => {
                let (left, right) = {
                    let n = self.interior.get(idx);
                    (n.left, n.right)
                };
                let new_left = self.scale_prune_node(left, factor, threshold);
                let new_right = self.scale_prune_node(right, factor, threshold);
                match (new_left, new_right) {
                    (None, None) => {
                        self.interior.free(idx);
                        None
                    }
                    (Some(l), None) => {
                        self.interior.free(idx);
                        Some(l)
                    }
                    (None, Some(r)) => {
                        self.interior.free(idx);
                        Some(r)
                    }
                    (Some(l), Some(r)) => {
                        let lw = self.node_aggregate(l);
                        let rw = self.node_aggregate(r);
                        let sort_key = self.max_value(l);
                        let n = self.interior.get_mut(idx);
                        n.left = l;
                        n.right = r;
                        n.aggregate = lw + rw;
                        n.sort_key = sort_key;
                        n.wait = Self::reset_wait(lw, rw);
                        Some(NodeRef::Interior(idx))
                    }
                }
            }
        }
    }

    fn scale_prune_nested_list(&mut self, leaf_idx: super::node::LeafIdx, factor: f64, threshold: f64) {
        let mut cur = self.leaves.get(leaf_idx).nested;
        let mut head: Option<super::node::TreeIdx> = None;
        let mut tail: Option<super::node::TreeIdx> = None;
        while let Some(t) = cur {
            let next = self.trees.get(t).next;
            let root = self.trees.get(t).root;
            let new_root = root.and_then(|r| self.scale_prune_node(r, factor, threshold));
            if new_root.is_none() {
                self.trees.free(t);
            } else {
                {
                    let tr = self.trees.get_mut(t);
                    tr.root = new_root;
                    tr.next = None;
                    tr.entropy_wait = 0;
                }
                if head.is_none() {
                    head = Some(t);
                } else {
                    self.trees.get_mut(tail.unwrap()).next = Some(t);
                }
                tail = Some(t);
            }
            cur = next;
        }
        self.leaves.get_mut(leaf_idx).nested = head;
    }

    fn free_leaf_and_nested(&mut self, leaf_idx: super::node::LeafIdx) {
        let mut cur = self.leaves.get(leaf_idx).nested;
        while let Some(t) = cur {
            let next = self.trees.get(t).next;
            if let Some(root) = self.trees.get(t).root {
                self.free_subtree(root);
            }
            self.trees.free(t);
            cur = next;
        }
        self.leaves.free(leaf_idx);
    }

    fn free_subtree(&mut self, node: NodeRef) {
        match node {
            NodeRef::Leaf(l) => self.free_leaf_and_nested(l),
            NodeRef::Interior(i) => {
                let (left, right) = {
                    let n = self.interior.get(i);
                    (n.left, n.right)
                };
                self.free_subtree(left);
                self.free_subtree(right);
                self.interior.free(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_then_probability_sums_to_one() {
        let mut t = ProbabilityTable::new();
        for v in [1u32, 1, 2, 3, 3, 3] {
            t.record(&[0], &[v]);
        }
        let p1 = t.probability(&[0], &[1], 0).unwrap();
        let p2 = t.probability(&[0], &[2], 0).unwrap();
        let p3 = t.probability(&[0], &[3], 0).unwrap();
        assert!((p1 + p2 + p3 - 1.0).abs() < 0.001);
        assert!((p1 - 2.0 / 6.0).abs() < 1e-9);
        assert!((p3 - 3.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn missing_path_is_no_record_or_zero() {
        let mut t = ProbabilityTable::new();
        t.record(&[0], &[1]);
        assert_eq!(t.probability(&[0], &[99], 0), Some(0.0));
        assert_eq!(t.probability(&[1], &[1], 0), None);
    }

    #[test]
    fn probability_plus_one_never_zero() {
        let t = ProbabilityTable::new();
        let p = t.probability_plus_one(&[0], &[42], 0);
        assert!(p > 0.0);
        assert!((p - 1.0).abs() < 1e-12);
    }

    #[test]
    fn scale_and_prune_reduces_counts_and_drops_small_leaves() {
        let mut t = ProbabilityTable::new();
        for _ in 0..1000 {
            t.record(&[0], &[42]);
        }
        t.scale_and_prune(0.5, 0.1);
        let c = t.count(&[0], &[42], 1);
        assert!((c - 500.0).abs() < 0.5);

        t.record(&[0], &[43]);
        t.scale_and_prune(0.01, 1.0);
        assert!(t.count(&[0], &[42], 1) >= 1.0);
        assert_eq!(t.count(&[0], &[43], 1), 0.0);
    }

    #[test]
    fn entropy_of_single_leaf_is_zero_and_balanced_pair_is_one() {
        let mut t = ProbabilityTable::new();
        t.record(&[0], &[1]);
        assert_eq!(t.entropy(&[0], &[1], 0), 0.0);

        let mut t2 = ProbabilityTable::new();
        for _ in 0..100 {
            t2.record(&[0], &[1]);
        }
        for _ in 0..100 {
            t2.record(&[0], &[2]);
        }
        let h = t2.entropy(&[0], &[1], 0);
        assert!((h - 1.0).abs() < 1e-9);
    }

    #[test]
    fn entropy_updates_after_more_observations() {
        let mut t = ProbabilityTable::new();
        for _ in 0..100 {
            t.record(&[0], &[1]);
        }
        for _ in 0..100 {
            t.record(&[0], &[2]);
        }
        let _ = t.entropy(&[0], &[1], 0);
        t.record(&[0], &[3]);
        // force recompute regardless of cache window for the assertion
        let tree = t.top[0].unwrap();
        t.trees.get_mut(tree).entropy_wait = 0;
        let h = t.entropy(&[0], &[1], 0);
        assert!(h > 0.9 && h < 1.0);
    }

    #[test]
    fn nested_trees_key_on_distinct_features() {
        let mut t = ProbabilityTable::new();
        t.record(&[0, 1], &[10, 20]);
        t.record(&[0, 1], &[10, 20]);
        t.record(&[0, 1], &[10, 21]);
        // conditioning on feature 0 == 10, feature 1 distribution is 20:2, 21:1
        let p20 = t.probability(&[0, 1], &[10, 20], 1).unwrap();
        assert!((p20 - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn large_scale_rebalances_without_panicking() {
        let mut t = ProbabilityTable::new();
        for i in 0..5000u32 {
            t.record(&[0], &[i % 250]);
        }
        for v in 0..250u32 {
            let c = t.count(&[0], &[v], 1);
            assert!(c > 0.0);
        }
    }
}
