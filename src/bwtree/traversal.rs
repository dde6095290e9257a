//! Descent from a PID to the leaf (or, mid-descent, inner node) chain
//! that currently owns a key, per spec.md §4.3.1.

use crate::bwtree::node::{self, LogicalView, Node};
use crate::bwtree::Mode;
use crate::error::Result;
use crate::pid_table::{Pid, PidTable};

/// Resolve `pid`'s current chain, following right-sibling pointers as
/// long as a `Split` delta has moved `key`'s range out from under it.
/// This is the traversal-time half of split installation: a split is
/// visible to descent the instant its `Split` delta CASes in, long
/// before the parent's `SplitEntry` catches up.
fn resolve<K, V>(
    table: &PidTable<Node<K, V>>,
    mut pid: Pid,
    key: &K,
    mode: Mode,
) -> Result<(Pid, *mut Node<K, V>, LogicalView<K, V>)>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    loop {
        let head = table.get(pid);
        let view = node::materialize(head, mode)?;
        match &view.split_boundary {
            Some(boundary) if key >= boundary => pid = view.right,
            _ => return Ok((pid, head, view)),
        }
    }
}

/// Descend from `root` to the leaf owning `key`, returning its PID, the
/// observed chain head, and the materialised logical view.
pub(crate) fn find_leaf<K, V>(
    table: &PidTable<Node<K, V>>,
    root: Pid,
    key: &K,
    mode: Mode,
) -> Result<(Pid, *mut Node<K, V>, LogicalView<K, V>)>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    let mut pid = root;
    loop {
        let (resolved_pid, head, view) = resolve(table, pid, key, mode)?;
        if view.is_leaf {
            return Ok((resolved_pid, head, view));
        }
        pid = view.child_for(key);
    }
}

/// Descend from `root` to the leaf's *parent*, for the second step of a
/// split (installing the `SplitEntry`). Returns the parent PID alongside
/// the child PID it should currently route `key` to.
pub(crate) fn find_parent<K, V>(
    table: &PidTable<Node<K, V>>,
    root: Pid,
    key: &K,
    mode: Mode,
) -> Result<Option<Pid>>
where
    K: Ord + Clone,
    V: Clone + PartialEq,
{
    let mut pid = root;
    let mut parent = None;
    loop {
        let (resolved_pid, _head, view) = resolve(table, pid, key, mode)?;
        if view.is_leaf {
            return Ok(parent);
        }
        parent = Some(resolved_pid);
        pid = view.child_for(key);
    }
}
