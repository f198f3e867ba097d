use serde::{Deserialize, Serialize};

use crate::constants::BTREE_ORDER;
use crate::errors::DatabaseError;
use crate::record::Rid;

/// Handle into the node arena.
pub type NodeId = usize;

/// Arena-allocated node. Leaves carry values plus a forward sibling link;
/// internal nodes carry child handles. Handles instead of references keep
/// the sibling chain plain data (and serializable).
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Node {
    is_leaf: bool,
    keys: Vec<i64>,
    children: Vec<NodeId>,
    values: Vec<Rid>,
    next: Option<NodeId>,
}

impl Node {
    fn leaf() -> Self {
        Node {
            is_leaf: true,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }

    fn internal() -> Self {
        Node {
            is_leaf: false,
            keys: Vec::new(),
            children: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }
}

/// Leaf-linked B+ tree mapping column values to RIDs. A single descent plus
/// a linear leaf walk serves range scans; the high default order keeps the
/// tree shallow for the row counts the engine expects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BPlusTree {
    order: usize,
    nodes: Vec<Node>,
    root: NodeId,
    len: usize,
}

impl BPlusTree {
    pub fn new() -> Self {
        BPlusTree::with_order(BTREE_ORDER)
    }

    pub fn with_order(order: usize) -> Self {
        debug_assert!(order >= 3);
        BPlusTree {
            order,
            nodes: vec![Node::leaf()],
            root: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Descend to the leaf that would contain `key`. Returns the leaf even
    /// on a miss; callers distinguish.
    pub fn search(&self, key: i64) -> NodeId {
        let mut node = self.root;

        while !self.nodes[node].is_leaf {
            let slot = bisect_right(&self.nodes[node].keys, key);
            node = self.nodes[node].children[slot];
        }

        node
    }

    /// Exact lookup.
    pub fn get(&self, key: i64) -> Result<Rid, DatabaseError> {
        let leaf = &self.nodes[self.search(key)];
        let slot = bisect_left(&leaf.keys, key);

        if slot < leaf.keys.len() && leaf.keys[slot] == key {
            Ok(leaf.values[slot])
        } else {
            Err(DatabaseError::NoSuchKey(key))
        }
    }

    /// Leaf-local membership test, no value returned.
    pub fn has_key(&self, key: i64) -> bool {
        let leaf = &self.nodes[self.search(key)];
        let slot = bisect_left(&leaf.keys, key);
        slot < leaf.keys.len() && leaf.keys[slot] == key
    }

    /// Root-splits-first insertion. Duplicate keys coexist as separate
    /// entries.
    pub fn insert(&mut self, key: i64, value: Rid) {
        if self.nodes[self.root].keys.len() == self.max_keys() {
            let old_root = self.root;
            let new_root = self.alloc(Node::internal());
            self.nodes[new_root].children.push(old_root);
            self.split_child(new_root, 0);
            self.root = new_root;
        }

        self.insert_non_full(self.root, key, value);
        self.len += 1;
    }

    fn insert_non_full(&mut self, node: NodeId, key: i64, value: Rid) {
        if self.nodes[node].is_leaf {
            let slot = bisect_left(&self.nodes[node].keys, key);
            self.nodes[node].keys.insert(slot, key);
            self.nodes[node].values.insert(slot, value);
            return;
        }

        let mut slot = bisect_right(&self.nodes[node].keys, key);
        let child = self.nodes[node].children[slot];
        if self.nodes[child].keys.len() == self.max_keys() {
            self.split_child(node, slot);
            if key >= self.nodes[node].keys[slot] {
                slot += 1;
            }
        }

        let next = self.nodes[node].children[slot];
        self.insert_non_full(next, key, value);
    }

    /// Split the full child at `index` of `parent`. Leaf splits promote the
    /// new right leaf's first key and repair the sibling chain; internal
    /// splits promote the middle key and exclude it from both halves.
    fn split_child(&mut self, parent: NodeId, index: usize) {
        let node = self.nodes[parent].children[index];
        let mid = self.nodes[node].keys.len() / 2;

        let (split_key, new_node) = if self.nodes[node].is_leaf {
            let keys = self.nodes[node].keys.split_off(mid);
            let values = self.nodes[node].values.split_off(mid);
            let split_key = keys[0];

            let mut right = Node::leaf();
            right.keys = keys;
            right.values = values;
            right.next = self.nodes[node].next;

            let right_id = self.alloc(right);
            self.nodes[node].next = Some(right_id);
            (split_key, right_id)
        } else {
            let mut keys = self.nodes[node].keys.split_off(mid);
            let split_key = keys.remove(0);
            let children = self.nodes[node].children.split_off(mid + 1);

            let mut right = Node::internal();
            right.keys = keys;
            right.children = children;
            (split_key, self.alloc(right))
        };

        self.nodes[parent].keys.insert(index, split_key);
        self.nodes[parent].children.insert(index + 1, new_node);
    }

    /// Bulk insert of key-sorted pairs. The first key must exceed the
    /// current tree maximum; otherwise the caller falls back to per-key
    /// insertion.
    pub fn batch_insert(&mut self, pairs: &[(i64, Rid)]) -> Result<(), DatabaseError> {
        if let (Some(&(first, _)), Some(max)) = (pairs.first(), self.max_key()) {
            if first <= max {
                return Err(DatabaseError::UnorderedBatch);
            }
        }

        for &(key, value) in pairs {
            self.insert(key, value);
        }

        Ok(())
    }

    /// Every `(key, value)` with `lo <= key <= hi`, in key order. One
    /// descent, then a walk along the sibling chain.
    pub fn range_scan(&self, lo: i64, hi: i64) -> Vec<(i64, Rid)> {
        let mut result = Vec::new();
        let mut node = Some(self.search(lo));

        while let Some(id) = node {
            let leaf = &self.nodes[id];
            for (slot, &key) in leaf.keys.iter().enumerate() {
                if key < lo {
                    continue;
                }
                if key > hi {
                    return result;
                }
                result.push((key, leaf.values[slot]));
            }
            node = leaf.next;
        }

        result
    }

    /// Largest key in the tree, if any.
    pub fn max_key(&self) -> Option<i64> {
        let mut node = self.root;

        while !self.nodes[node].is_leaf {
            match self.nodes[node].children.last() {
                Some(&child) => node = child,
                None => break,
            }
        }

        self.nodes[node].keys.last().copied()
    }
}

impl Default for BPlusTree {
    fn default() -> Self {
        BPlusTree::new()
    }
}

fn bisect_left(keys: &[i64], key: i64) -> usize {
    keys.partition_point(|&k| k < key)
}

fn bisect_right(keys: &[i64], key: i64) -> usize {
    keys.partition_point(|&k| k <= key)
}
