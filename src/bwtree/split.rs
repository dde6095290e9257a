//! Split: a two-step structural modification, per spec.md §4.3.5.

use crate::bwtree::node::{self, Node, NodeHeader};
use crate::bwtree::traversal;
use crate::bwtree::Mode;
use crate::error::Result;
use crate::pid_table::{Pid, PidTable, NULL_PID};

/// Attempt to split the chain currently at `pid`. `root` is the index's
/// fixed root PID, needed to detect the root-splitting special case and
/// to re-descend for the parent lookup in step 2.
///
/// Returns the PID of the parent that received the `SplitEntry` delta,
/// so the caller can opportunistically re-run consolidation/split policy
/// on it too -- a chain of leaf splits has to be able to propagate into
/// inner-node splits and root growth, not stop at one level (spec.md
/// §4.3.5 "Root splitting" applies "any time the node occupying the
/// root PID overflows and splits", not only the first time). Returns
/// `None` when nothing further needs checking: a lost race, or a
/// root-growing split (a freshly grown root starts with one child, far
/// from overflow).
pub(crate) fn try_split<K, V>(
    table: &PidTable<Node<K, V>>,
    root: Pid,
    pid: Pid,
    mode: Mode,
) -> Result<Option<Pid>>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    let (split_key, right_pid) = match install_split_delta(table, pid, mode)? {
        Some(pair) => pair,
        None => return Ok(None),
    };

    if pid == root {
        grow_root(table, root);
        return Ok(None);
    }

    install_split_entry(table, root, mode, &split_key, right_pid)
}

/// Step 1: materialise the splitting node, carve off its upper half into
/// a freshly allocated right sibling, and CAS a `Split` delta onto the
/// observed head. Returns the split key and new sibling PID on success.
fn install_split_delta<K, V>(
    table: &PidTable<Node<K, V>>,
    pid: Pid,
    mode: Mode,
) -> Result<Option<(K, Pid)>>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    let head = table.get(pid);
    let view = node::materialize(head, mode)?;
    let head_header = unsafe { (*head).header() };

    let (split_key, upper): (K, *mut Node<K, V>) = if view.is_leaf {
        let n = view.leaf.len();
        let m = n / 2;
        let mut lower = view.leaf;
        let upper_entries = lower.split_off(m);
        let split_key = upper_entries[0].0.clone();
        let (keys, values) = upper_entries.into_iter().unzip();
        let node = Box::into_raw(Box::new(Node::BaseLeaf {
            header: NodeHeader {
                chain_len: 0,
                is_leaf: true,
                version: 0,
            },
            keys,
            values,
            left: pid,
            right: view.right,
        }));
        (split_key, node)
    } else {
        let n = view.keys.len();
        let m = n / 2;
        let mut keys = view.keys;
        let mut children = view.children;
        let upper_keys = keys.split_off(m + 1);
        let split_key = keys[m].clone();
        keys.truncate(m);
        let upper_children = children.split_off(m + 1);
        let node = Box::into_raw(Box::new(Node::BaseInner {
            header: NodeHeader {
                chain_len: 0,
                is_leaf: false,
                version: 0,
            },
            keys: upper_keys,
            children: upper_children,
            left: pid,
            right: view.right,
        }));
        (split_key, node)
    };

    let right_pid = match table.allocate(upper) {
        Ok(p) => p,
        Err(e) => {
            unsafe { node::free_chain(upper) };
            return Err(e);
        }
    };

    let delta = Box::into_raw(Box::new(Node::Split {
        header: NodeHeader {
            chain_len: head_header.chain_len + 1,
            is_leaf: view.is_leaf,
            version: head_header.version + 1,
        },
        split_key: split_key.clone(),
        right: right_pid,
        next: head,
    }));

    if table.compare_and_swap(pid, head, delta) {
        Ok(Some((split_key, right_pid)))
    } else {
        table.free(right_pid);
        unsafe { node::free_chain(upper) };
        unsafe { drop(Box::from_raw(delta)) };
        Ok(None)
    }
}

const SPLIT_ENTRY_RETRIES: usize = 3;

/// Step 2: tell the parent a child split, bounded-retrying on contention
/// (spec.md §4.3.5 step 2.4). Returns the parent PID on success (whether
/// this call installed the `SplitEntry` or found it already installed
/// by a concurrent racer).
fn install_split_entry<K, V>(
    table: &PidTable<Node<K, V>>,
    root: Pid,
    mode: Mode,
    split_key: &K,
    right_pid: Pid,
) -> Result<Option<Pid>>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    for _ in 0..SPLIT_ENTRY_RETRIES {
        let parent_pid = match traversal::find_parent(table, root, split_key, mode)? {
            Some(p) => p,
            // the splitting node's parent pointer raced a concurrent root
            // growth; a later opportunistic split will finish this entry.
            None => return Ok(None),
        };

        let head = table.get(parent_pid);
        let view = node::materialize(head, mode)?;
        if view.keys.binary_search(split_key).is_ok() {
            return Ok(Some(parent_pid));
        }
        let insert_at = match view.keys.binary_search(split_key) {
            Ok(i) | Err(i) => i,
        };
        let high = view.keys.get(insert_at).cloned();
        let head_header = unsafe { (*head).header() };
        let delta = Box::into_raw(Box::new(Node::SplitEntry {
            header: NodeHeader {
                chain_len: head_header.chain_len + 1,
                is_leaf: false,
                version: head_header.version,
            },
            low: split_key.clone(),
            high,
            child: right_pid,
            next: head,
        }));
        if table.compare_and_swap(parent_pid, head, delta) {
            return Ok(Some(parent_pid));
        }
        unsafe { drop(Box::from_raw(delta)) };
    }
    Ok(None)
}

/// Root splitting: relocate the current root chain under a fresh PID and
/// replace the root PID's content with a new single-child `BaseInner`,
/// per spec.md §4.3.5 "Root splitting".
fn grow_root<K, V>(table: &PidTable<Node<K, V>>, root: Pid) -> bool
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    let current = table.get(root);
    let relocated = match table.allocate(current) {
        Ok(p) => p,
        Err(_) => return false,
    };

    let new_root = Box::into_raw(Box::new(Node::BaseInner {
        header: NodeHeader {
            chain_len: 0,
            is_leaf: false,
            version: 0,
        },
        keys: Vec::new(),
        children: vec![relocated],
        left: NULL_PID,
        right: NULL_PID,
    }));

    if table.compare_and_swap(root, current, new_root) {
        true
    } else {
        table.free(relocated);
        unsafe { drop(Box::from_raw(new_root)) };
        false
    }
}
