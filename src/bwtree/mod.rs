//! The ordered index: node chains addressed through the PID table,
//! reclaimed through the garbage collector, per spec.md §4.3.

pub(crate) mod consolidate;
pub(crate) mod node;
pub(crate) mod ops;
pub(crate) mod split;
pub(crate) mod traversal;

use std::collections::HashSet;
use std::time::Duration;

use node::{Node, NodeHeader};

use crate::gc::GarbageCollector;
use crate::pid_table::{Pid, PidTable, NULL_PID};
use crate::EPOCH_INTERVAL_MS;

/// Uniqueness discipline for a leaf's key-to-value mapping, per spec.md
/// §9 "Unique vs duplicate modes". Both share the same leaf shape (an
/// ordered `Vec<V>` per key) and operator surface; only the duplication
/// precondition checked on insert differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Each key maps to at most one value.
    Unique,
    /// Each key maps to an ordered list of values.
    Duplicate,
}

/// A latch-free ordered index. Keys require a strict weak ordering
/// (`Ord`) and equality; values require only equality (spec.md §3.1).
pub struct Index<K, V> {
    pub(crate) table: PidTable<Node<K, V>>,
    pub(crate) gc: GarbageCollector,
    pub(crate) root: Pid,
    pub(crate) first_leaf: Pid,
    pub(crate) mode: Mode,
}

impl<K, V> Index<K, V>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    /// Construct an empty index: a pointer-only inner root whose single
    /// child is an empty leaf, per spec.md §3.4.
    pub fn new(mode: Mode) -> Index<K, V> {
        let table: PidTable<Node<K, V>> = PidTable::new();

        let leaf = Box::into_raw(Box::new(Node::BaseLeaf {
            header: NodeHeader {
                chain_len: 0,
                is_leaf: true,
                version: 0,
            },
            keys: Vec::new(),
            values: Vec::new(),
            left: NULL_PID,
            right: NULL_PID,
        }));
        let first_leaf = table
            .allocate(leaf)
            .expect("pid space exhausted constructing empty leaf");

        let root_node = Box::into_raw(Box::new(Node::BaseInner {
            header: NodeHeader {
                chain_len: 0,
                is_leaf: false,
                version: 0,
            },
            keys: Vec::new(),
            children: vec![first_leaf],
            left: NULL_PID,
            right: NULL_PID,
        }));
        let root = table
            .allocate(root_node)
            .expect("pid space exhausted constructing root");

        let gc = GarbageCollector::new(
            table.free_stack(),
            Duration::from_millis(EPOCH_INTERVAL_MS),
        );

        log::info!(target: "bwtree", "index constructed, mode={:?}", mode);

        Index {
            table,
            gc,
            root,
            first_leaf,
            mode,
        }
    }

    /// Insert `(key, value)` under the configured uniqueness mode.
    /// Returns `true` on success, `false` on precondition violation
    /// (spec.md §6).
    pub fn insert(&self, key: K, value: V) -> bool {
        ops::insert(self, key, value)
    }

    /// Remove a specific `(key, value)` pair. Returns `false` if absent.
    pub fn delete(&self, key: K, value: V) -> bool {
        ops::delete(self, key, value)
    }

    /// All values currently bound to `key` (0 or 1 in unique mode, 0..n
    /// in duplicate mode).
    pub fn scan_key(&self, key: &K) -> Vec<V> {
        ops::scan_key(self, key)
    }

    /// Every `(key, value)` pair in leaf order, left to right, as a
    /// snapshot from this call's GC registration (spec.md §6).
    pub fn scan_all(&self) -> Vec<(K, V)> {
        ops::scan_all(self)
    }
}

impl<K, V> Drop for Index<K, V>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    /// Stop the GC daemon, then walk every chain still reachable from
    /// the root and free it directly -- spec.md §3.4: "destroyed by
    /// walking all reachable chains and freeing them, after stopping the
    /// GC daemon." No epoch registration is needed here: a dropped
    /// `Index` must have no concurrent callers left.
    fn drop(&mut self) {
        self.gc.stop_and_join();

        let mut seen = HashSet::new();
        free_reachable(&self.table, self.root, self.mode, &mut seen);
    }
}

fn free_reachable<K, V>(
    table: &PidTable<Node<K, V>>,
    pid: Pid,
    mode: Mode,
    seen: &mut HashSet<Pid>,
) where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    if pid == NULL_PID || !seen.insert(pid) {
        return;
    }
    let head = table.get(pid);
    if head.is_null() {
        return;
    }
    if let Ok(view) = node::materialize(head, mode) {
        if !view.is_leaf {
            for &child in &view.children {
                free_reachable(table, child, mode, seen);
            }
        }
        if view.right != NULL_PID {
            free_reachable(table, view.right, mode, seen);
        }
    }
    unsafe { node::free_chain(head) };
}

#[cfg(test)]
mod test {
    use super::*;

    /// Enough keys past `MAX_NODE_SIZE`/`MAX_CHAIN_LEN` to force repeated
    /// leaf splits, which must propagate into an inner-node split and a
    /// root growth rather than stall after the first level (spec.md §8
    /// scenario 4: "the tree's internal structure has at least one
    /// non-root inner node").
    #[test]
    fn test_many_inserts_grow_root_past_one_level() {
        let index: Index<i32, i32> = Index::new(Mode::Unique);
        for i in 0..2000 {
            assert!(index.insert(i, i * 10));
        }

        let root_head = index.table.get(index.root);
        let root_view = node::materialize(root_head, index.mode).unwrap();
        assert!(
            root_view.children.len() > 1,
            "root never split a child in, tree stayed single-level"
        );

        for i in 0..2000 {
            assert_eq!(index.scan_key(&i), vec![i * 10]);
        }
        let mut all = index.scan_all();
        all.sort();
        let expected: Vec<(i32, i32)> = (0..2000).map(|i| (i, i * 10)).collect();
        assert_eq!(all, expected);
    }
}
