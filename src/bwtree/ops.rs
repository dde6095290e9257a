//! Point operations and full-key scan, per spec.md §4.3.2/§4.3.3.

use crate::bwtree::consolidate;
use crate::bwtree::node::{self, Node, NodeHeader};
use crate::bwtree::split;
use crate::bwtree::traversal;
use crate::bwtree::{Index, Mode};
use crate::pid_table::Pid;
use crate::{MAX_CHAIN_LEN, MAX_NODE_SIZE};

/// After a successful CAS, opportunistically consolidate an over-long
/// chain and, if that leaves the node over-full, split it. Both steps
/// are best-effort: failure just means a concurrent writer got there
/// first (spec.md §4.3.2 "Chain-length policy" / "Overflow policy").
///
/// A split can itself push the parent it installs a `SplitEntry` on
/// over `MAX_NODE_SIZE`, so a successful split recurses this same
/// policy onto the parent PID -- this is how a chain of leaf splits
/// propagates into inner-node splits and, eventually, root growth,
/// rather than stopping after the tree's first level.
fn maybe_consolidate_and_split<K, V>(index: &Index<K, V>, pid: Pid, chain_len: u32)
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    if (chain_len as usize) <= MAX_CHAIN_LEN {
        return;
    }
    let consolidated = match consolidate::try_consolidate(&index.table, &index.gc, pid, index.mode)
    {
        Ok(ok) => ok,
        Err(e) => {
            log::warn!(target: "bwtree", "consolidation aborted: {}", e);
            return;
        }
    };
    if !consolidated {
        return;
    }
    let head = index.table.get(pid);
    let view = match node::materialize(head, index.mode) {
        Ok(v) => v,
        Err(_) => return,
    };
    if view.slot_usage() <= MAX_NODE_SIZE {
        return;
    }
    let parent = match split::try_split(&index.table, index.root, pid, index.mode) {
        Ok(p) => p,
        Err(e) => {
            log::warn!(target: "bwtree", "split aborted: {}", e);
            return;
        }
    };
    if let Some(parent_pid) = parent {
        let parent_head = index.table.get(parent_pid);
        let parent_header = unsafe { (*parent_head).header() };
        maybe_consolidate_and_split(index, parent_pid, parent_header.chain_len);
    }
}

pub(crate) fn insert<K, V>(index: &Index<K, V>, key: K, value: V) -> bool
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    let _guard = index.gc.register();
    loop {
        let (pid, head, view) =
            match traversal::find_leaf(&index.table, index.root, &key, index.mode) {
                Ok(t) => t,
                Err(e) => {
                    log::error!(target: "bwtree", "insert traversal failed: {}", e);
                    return false;
                }
            };

        let duplicate = match index.mode {
            Mode::Unique => !view.values_for(&key).is_empty(),
            Mode::Duplicate => view.values_for(&key).iter().any(|v| *v == value),
        };
        if duplicate {
            return false;
        }

        let head_header = unsafe { (*head).header() };
        let delta = Box::into_raw(Box::new(Node::Insert {
            header: NodeHeader {
                chain_len: head_header.chain_len + 1,
                is_leaf: true,
                version: head_header.version,
            },
            key: key.clone(),
            value: value.clone(),
            next: head,
        }));

        if index.table.compare_and_swap(pid, head, delta) {
            maybe_consolidate_and_split(index, pid, head_header.chain_len + 1);
            return true;
        }
        unsafe { drop(Box::from_raw(delta)) };
    }
}

pub(crate) fn delete<K, V>(index: &Index<K, V>, key: K, value: V) -> bool
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    let _guard = index.gc.register();
    loop {
        let (pid, head, view) =
            match traversal::find_leaf(&index.table, index.root, &key, index.mode) {
                Ok(t) => t,
                Err(e) => {
                    log::error!(target: "bwtree", "delete traversal failed: {}", e);
                    return false;
                }
            };

        if !view.values_for(&key).iter().any(|v| *v == value) {
            return false;
        }

        let head_header = unsafe { (*head).header() };
        let delta = Box::into_raw(Box::new(Node::Delete {
            header: NodeHeader {
                chain_len: head_header.chain_len + 1,
                is_leaf: true,
                version: head_header.version,
            },
            key: key.clone(),
            value: value.clone(),
            next: head,
        }));

        if index.table.compare_and_swap(pid, head, delta) {
            maybe_consolidate_and_split(index, pid, head_header.chain_len + 1);
            return true;
        }
        unsafe { drop(Box::from_raw(delta)) };
    }
}

pub(crate) fn scan_key<K, V>(index: &Index<K, V>, key: &K) -> Vec<V>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    let guard = index.gc.register();
    let result = traversal::find_leaf(&index.table, index.root, key, index.mode)
        .map(|(_, _, view)| view.values_for(key).to_vec())
        .unwrap_or_default();
    guard.deregister();
    result
}

pub(crate) fn scan_all<K, V>(index: &Index<K, V>) -> Vec<(K, V)>
where
    K: Ord + Clone + 'static,
    V: Clone + PartialEq + 'static,
{
    let guard = index.gc.register();
    let mut out = Vec::new();
    let mut pid = index.first_leaf;
    loop {
        let head = index.table.get(pid);
        let view = match node::materialize(head, index.mode) {
            Ok(v) => v,
            Err(e) => {
                log::error!(target: "bwtree", "scan_all aborted at pid {}: {}", pid, e);
                break;
            }
        };
        out.extend(view.all_entries());
        if view.right == crate::pid_table::NULL_PID {
            break;
        }
        pid = view.right;
    }
    guard.deregister();
    out
}
