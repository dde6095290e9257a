//! Node taxonomy and chain materialisation.
//!
//! Every node is one of the eleven kinds from spec.md §3.2, modeled here
//! as a single tagged enum rather than the virtual-dispatch class
//! hierarchy the original C++ (`bwtree.h`) used, per spec.md §9's
//! redesign note. A node chain is a singly-linked list of deltas rooted
//! at a `Base` (Leaf or Inner); chains are never mutated after
//! publication, only prepended to.

use crate::bwtree::Mode;
use crate::error::{Error, Result};
use crate::pid_table::Pid;

/// Fields carried by every node in a chain. `slot_usage` is *not* stored
/// here for delta nodes in a way callers should trust directly — see
/// [`LogicalView::slot_usage`] and SPEC_FULL.md §7: the authoritative
/// count always comes from materialising the chain, never from a
/// per-delta counter.
#[derive(Clone, Copy)]
pub(crate) struct NodeHeader {
    pub chain_len: u32,
    pub is_leaf: bool,
    pub version: u32,
}

pub(crate) enum Node<K, V> {
    BaseLeaf {
        header: NodeHeader,
        keys: Vec<K>,
        values: Vec<Vec<V>>,
        left: Pid,
        right: Pid,
    },
    BaseInner {
        header: NodeHeader,
        keys: Vec<K>,
        children: Vec<Pid>,
        left: Pid,
        right: Pid,
    },
    Insert {
        header: NodeHeader,
        key: K,
        value: V,
        next: *mut Node<K, V>,
    },
    Delete {
        header: NodeHeader,
        key: K,
        value: V,
        next: *mut Node<K, V>,
    },
    Split {
        header: NodeHeader,
        split_key: K,
        right: Pid,
        next: *mut Node<K, V>,
    },
    SplitEntry {
        header: NodeHeader,
        low: K,
        high: Option<K>,
        child: Pid,
        next: *mut Node<K, V>,
    },
    /// Modeled per the taxonomy in spec.md §3.2; no construction path
    /// installs this variant (merge is design-only, spec.md §4.3.6).
    Remove {
        header: NodeHeader,
        next: *mut Node<K, V>,
    },
    /// Modeled per the taxonomy in spec.md §3.2; no construction path
    /// installs this variant (merge is design-only, spec.md §4.3.6).
    Merge {
        header: NodeHeader,
        absorbed: *mut Node<K, V>,
        next: *mut Node<K, V>,
    },
    /// Modeled per the taxonomy in spec.md §3.2; no construction path
    /// installs this variant (merge is design-only, spec.md §4.3.6).
    MergeEntry {
        header: NodeHeader,
        low: K,
        child: Pid,
        next: *mut Node<K, V>,
    },
}

/// The `next`/`absorbed` raw pointers block the auto-derived `Send`
/// impl regardless of `K`/`V`, but nothing about those pointers is
/// thread-affine: a chain is only ever walked by a thread holding a
/// live GC registration, never concurrently mutated once superseded.
/// What *does* need checking is `K`/`V` themselves -- a retired chain's
/// `Box<Node<K, V>>` gets dropped by the GC daemon thread, which drops
/// every `K`/`V` it owns, so this is only sound when `K: Send, V: Send`.
unsafe impl<K: Send, V: Send> Send for Node<K, V> {}

impl<K, V> Node<K, V> {
    pub(crate) fn header(&self) -> NodeHeader {
        match self {
            Node::BaseLeaf { header, .. }
            | Node::BaseInner { header, .. }
            | Node::Insert { header, .. }
            | Node::Delete { header, .. }
            | Node::Split { header, .. }
            | Node::SplitEntry { header, .. }
            | Node::Remove { header, .. }
            | Node::Merge { header, .. }
            | Node::MergeEntry { header, .. } => *header,
        }
    }

    pub(crate) fn next_ptr(&self) -> Option<*mut Node<K, V>> {
        match self {
            Node::BaseLeaf { .. } | Node::BaseInner { .. } => None,
            Node::Insert { next, .. }
            | Node::Delete { next, .. }
            | Node::Split { next, .. }
            | Node::SplitEntry { next, .. }
            | Node::Remove { next, .. }
            | Node::Merge { next, .. }
            | Node::MergeEntry { next, .. } => Some(*next),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.header().is_leaf
    }
}

/// Walk a chain from `head` to its `Base`, collecting pointers in
/// head-to-tail order (index 0 is `head`, the last element is the
/// `Base`). Safety: every pointer in a live chain is valid for as long
/// as the caller's epoch registration holds.
unsafe fn collect_chain<K, V>(head: *mut Node<K, V>) -> Vec<*mut Node<K, V>> {
    let mut chain = Vec::new();
    let mut cur = head;
    loop {
        chain.push(cur);
        match (*cur).next_ptr() {
            Some(next) => cur = next,
            None => break,
        }
    }
    chain
}

/// The logical content of a chain, folded bottom-up from its `Base`
/// through every delta up to (and including) `head`.
pub(crate) struct LogicalView<K, V> {
    pub is_leaf: bool,
    pub version: u32,
    pub left: Pid,
    pub right: Pid,
    /// Leaf entries, sorted by key. Each key maps to an ordered list of
    /// values: length 0/1 in unique mode, 0..n in duplicate mode.
    pub leaf: Vec<(K, Vec<V>)>,
    /// Inner separator keys, sorted; `children.len() == keys.len() + 1`.
    pub keys: Vec<K>,
    pub children: Vec<Pid>,
    /// Set when a `Split` delta has been folded into this view: keys at
    /// or above this bound now live under `right` instead. `None` means
    /// this chain has not split since its `Base` was last consolidated.
    pub split_boundary: Option<K>,
}

impl<K: Ord + Clone, V: Clone + PartialEq> LogicalView<K, V> {
    pub(crate) fn slot_usage(&self) -> usize {
        if self.is_leaf {
            self.leaf.len()
        } else {
            self.keys.len()
        }
    }

    fn leaf_pos(&self, key: &K) -> std::result::Result<usize, usize> {
        self.leaf.binary_search_by(|(k, _)| k.cmp(key))
    }

    fn inner_pos(&self, key: &K) -> std::result::Result<usize, usize> {
        self.keys.binary_search_by(|k| k.cmp(key))
    }

    /// Values bound to `key`, or an empty slice if absent.
    pub(crate) fn values_for(&self, key: &K) -> &[V] {
        match self.leaf_pos(key) {
            Ok(idx) => &self.leaf[idx].1,
            Err(_) => &[],
        }
    }

    /// Child PID that should own `key` in an inner node: the separator
    /// keys partition the key space so that `children[i]` owns keys in
    /// `[keys[i-1], keys[i])` (with `keys[-1] = -inf`, `keys[n] = +inf`).
    pub(crate) fn child_for(&self, key: &K) -> Pid {
        let idx = match self.inner_pos(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        self.children[idx]
    }

    /// All (key, value) entries in key order, one per duplicate.
    pub(crate) fn all_entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::new();
        for (k, vs) in &self.leaf {
            for v in vs {
                out.push((k.clone(), v.clone()));
            }
        }
        out
    }
}

/// Build a `CorruptChain` error, additionally `debug_assert!`-failing in
/// debug builds so an invariant violation panics immediately during
/// development instead of only degrading to a logged `false` at the
/// public API boundary (release builds take the `Err` path normally).
fn corrupt_chain<T>(msg: impl Into<String>) -> Result<T> {
    let msg = msg.into();
    debug_assert!(false, "corrupt chain: {}", msg);
    Err(Error::CorruptChain(msg))
}

fn insert_sorted<K: Ord>(keys: &mut Vec<K>, key: K) -> usize {
    let idx = match keys.binary_search(&key) {
        Ok(i) | Err(i) => i,
    };
    keys.insert(idx, key);
    idx
}

/// Materialise the logical content of the chain rooted at `head`.
///
/// Walks the chain bottom-up: the `Base` seeds the working vectors, then
/// each delta from deepest (closest to `Base`) to shallowest (`head`
/// itself) is applied in turn, per spec.md §4.3.4 step 1.
pub(crate) fn materialize<K, V>(head: *mut Node<K, V>, mode: Mode) -> Result<LogicalView<K, V>>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    let chain = unsafe { collect_chain(head) };
    let head_header = unsafe { (*head).header() };

    let base_ptr = *chain.last().expect("chain always has a base");
    let mut view = match unsafe { &*base_ptr } {
        Node::BaseLeaf {
            keys, values, left, right, ..
        } => LogicalView {
            is_leaf: true,
            version: head_header.version,
            left: *left,
            right: *right,
            leaf: keys.iter().cloned().zip(values.iter().cloned()).collect(),
            keys: Vec::new(),
            children: Vec::new(),
            split_boundary: None,
        },
        Node::BaseInner {
            keys, children, left, right, ..
        } => LogicalView {
            is_leaf: false,
            version: head_header.version,
            left: *left,
            right: *right,
            leaf: Vec::new(),
            keys: keys.clone(),
            children: children.clone(),
            split_boundary: None,
        },
        _ => return corrupt_chain("chain tail is not a Base node"),
    };

    // apply deltas oldest (just above base) to newest (head)
    for &ptr in chain.iter().rev().skip(1) {
        let node = unsafe { &*ptr };
        apply_delta(&mut view, node, mode)?;
    }

    Ok(view)
}

fn apply_delta<K, V>(view: &mut LogicalView<K, V>, node: &Node<K, V>, mode: Mode) -> Result<()>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    match node {
        Node::Insert { key, value, .. } => {
            if !view.is_leaf {
                return corrupt_chain("Insert delta on inner node");
            }
            match view.leaf_pos(key) {
                Ok(idx) => {
                    if mode == Mode::Unique {
                        return corrupt_chain("Insert delta duplicates key in unique mode");
                    }
                    if view.leaf[idx].1.iter().any(|v| v == value) {
                        return corrupt_chain("Insert delta duplicates (key, value) pair");
                    }
                    view.leaf[idx].1.push(value.clone());
                }
                Err(idx) => {
                    view.leaf.insert(idx, (key.clone(), vec![value.clone()]));
                }
            }
            Ok(())
        }
        Node::Delete { key, value, .. } => {
            if !view.is_leaf {
                return corrupt_chain("Delete delta on inner node");
            }
            match view.leaf_pos(key) {
                Ok(idx) => {
                    let values = &mut view.leaf[idx].1;
                    match values.iter().position(|v| v == value) {
                        Some(vi) => {
                            values.remove(vi);
                            if values.is_empty() {
                                view.leaf.remove(idx);
                            }
                            Ok(())
                        }
                        None => Err(Error::MissingEntry),
                    }
                }
                Err(_) => Err(Error::MissingEntry),
            }
        }
        Node::Split {
            split_key, right, ..
        } => {
            if view.is_leaf {
                let cut = match view.leaf_pos(split_key) {
                    Ok(i) | Err(i) => i,
                };
                view.leaf.truncate(cut);
            } else {
                let cut = match view.inner_pos(split_key) {
                    Ok(i) | Err(i) => i,
                };
                view.keys.truncate(cut);
                view.children.truncate(cut + 1);
            }
            view.right = *right;
            view.split_boundary = Some(split_key.clone());
            Ok(())
        }
        Node::SplitEntry { low, child, .. } => {
            if view.is_leaf {
                return corrupt_chain("SplitEntry delta on leaf");
            }
            if view.inner_pos(low).is_ok() {
                // already finished by a previous fold of the same split;
                // nothing further to do (idempotent per spec.md §4.3.5).
                return Ok(());
            }
            let idx = insert_sorted(&mut view.keys, low.clone());
            view.children.insert(idx + 1, *child);
            Ok(())
        }
        Node::Remove { .. } => corrupt_chain("Remove delta encountered; merge is not implemented"),
        Node::Merge { .. } => corrupt_chain("Merge delta encountered; merge is not implemented"),
        Node::MergeEntry { .. } => {
            corrupt_chain("MergeEntry delta encountered; merge is not implemented")
        }
        Node::BaseLeaf { .. } | Node::BaseInner { .. } => {
            unreachable!("base only appears once, at the tail")
        }
    }
}

/// Free an entire chain, node by node, from `head` to its `Base`. Used
/// as the reclaim closure submitted to the GC when a chain is retired.
///
/// # Safety
/// `head` must not be reachable from the PID table anymore (it must
/// already have been superseded by a CAS), and no thread may still hold
/// a pointer into it from an epoch registration that has not yet
/// deregistered -- enforced by only calling this from a GC garbage
/// closure.
/// A raw pointer wrapper for handing a retired chain head to
/// [`crate::gc::GarbageCollector::submit_node`], whose closure bound
/// requires `Send`. `SendPtr<T>` is `Send` only when `T` is, so
/// `SendPtr<Node<K, V>>` is `Send` exactly when the manual `Send` impl
/// on `Node` above applies -- i.e. when `K: Send, V: Send` -- instead
/// of unconditionally asserting past whatever `K`/`V` the caller chose.
pub(crate) struct SendPtr<T>(pub(crate) *mut T);
unsafe impl<T: Send> Send for SendPtr<T> {}

pub(crate) unsafe fn free_chain<K, V>(head: *mut Node<K, V>) {
    let mut cur = head;
    loop {
        let next = (*cur).next_ptr();
        drop(Box::from_raw(cur));
        match next {
            Some(n) => cur = n,
            None => break,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pid_table::NULL_PID;

    fn leaf(keys: Vec<i32>, values: Vec<Vec<i32>>, version: u32) -> *mut Node<i32, i32> {
        Box::into_raw(Box::new(Node::BaseLeaf {
            header: NodeHeader {
                chain_len: 0,
                is_leaf: true,
                version,
            },
            keys,
            values,
            left: NULL_PID,
            right: NULL_PID,
        }))
    }

    #[test]
    fn test_materialize_base_only() {
        let head = leaf(vec![1, 2, 3], vec![vec![10], vec![20], vec![30]], 0);
        let view = materialize(head, Mode::Unique).unwrap();
        assert_eq!(view.all_entries(), vec![(1, 10), (2, 20), (3, 30)]);
        unsafe { free_chain(head) };
    }

    #[test]
    fn test_materialize_insert_delete_deltas() {
        let base = leaf(vec![1, 2], vec![vec![10], vec![20]], 0);
        let ins = Box::into_raw(Box::new(Node::Insert {
            header: NodeHeader {
                chain_len: 1,
                is_leaf: true,
                version: 0,
            },
            key: 3,
            value: 30,
            next: base,
        }));
        let del = Box::into_raw(Box::new(Node::Delete {
            header: NodeHeader {
                chain_len: 2,
                is_leaf: true,
                version: 0,
            },
            key: 1,
            value: 10,
            next: ins,
        }));
        let view = materialize(del, Mode::Unique).unwrap();
        assert_eq!(view.all_entries(), vec![(2, 20), (3, 30)]);
        unsafe { free_chain(del) };
    }

    #[test]
    fn test_materialize_duplicate_mode() {
        let base = leaf(vec![5], vec![vec![1]], 0);
        let ins2 = Box::into_raw(Box::new(Node::Insert {
            header: NodeHeader {
                chain_len: 1,
                is_leaf: true,
                version: 0,
            },
            key: 5,
            value: 2,
            next: base,
        }));
        let view = materialize(ins2, Mode::Duplicate).unwrap();
        assert_eq!(view.values_for(&5), &[1, 2]);
        unsafe { free_chain(ins2) };
    }
}
