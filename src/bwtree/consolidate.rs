//! Consolidation: replace a long delta chain with a single fresh `Base`
//! carrying the same logical content, per spec.md §4.3.4.

use crate::bwtree::node::{self, Node, NodeHeader, SendPtr};
use crate::bwtree::Mode;
use crate::error::Result;
use crate::gc::GarbageCollector;
use crate::pid_table::{Pid, PidTable};

/// Attempt to consolidate the chain currently at `pid`. Returns `Ok(true)`
/// if this call performed the consolidation, `Ok(false)` if a concurrent
/// writer raced ahead of us (tolerated, never retried -- spec.md §4.3.4
/// step 4).
pub(crate) fn try_consolidate<K, V>(
    table: &PidTable<Node<K, V>>,
    gc: &GarbageCollector,
    pid: Pid,
    mode: Mode,
) -> Result<bool>
where
    K: Ord + Clone + Send + 'static,
    V: Clone + PartialEq + Send + 'static,
{
    let head = table.get(pid);
    let view = node::materialize(head, mode)?;

    let header = NodeHeader {
        chain_len: 0,
        is_leaf: view.is_leaf,
        version: view.version,
    };
    let fresh = if view.is_leaf {
        let (keys, values) = view.leaf.into_iter().unzip();
        Box::into_raw(Box::new(Node::BaseLeaf {
            header,
            keys,
            values,
            left: view.left,
            right: view.right,
        }))
    } else {
        Box::into_raw(Box::new(Node::BaseInner {
            header,
            keys: view.keys,
            children: view.children,
            left: view.left,
            right: view.right,
        }))
    };

    if table.compare_and_swap(pid, head, fresh) {
        let retired = SendPtr(head);
        gc.submit_node(move || unsafe { node::free_chain(retired.0) });
        Ok(true)
    } else {
        unsafe { drop(Box::from_raw(fresh)) };
        Ok(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pid_table::NULL_PID;
    use std::time::Duration;

    #[test]
    fn test_consolidate_folds_deltas_into_fresh_base() {
        let table: PidTable<Node<i32, i32>> = PidTable::new();
        let gc = GarbageCollector::new(table.free_stack(), Duration::from_millis(5));

        let base = Box::into_raw(Box::new(Node::BaseLeaf {
            header: NodeHeader {
                chain_len: 0,
                is_leaf: true,
                version: 0,
            },
            keys: vec![1, 2],
            values: vec![vec![10], vec![20]],
            left: NULL_PID,
            right: NULL_PID,
        }));
        let pid = table.allocate(base).unwrap();

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
        assert!(table.compare_and_swap(pid, base, ins));

        assert!(try_consolidate(&table, &gc, pid, Mode::Unique).unwrap());

        let head = table.get(pid);
        let view = node::materialize(head, Mode::Unique).unwrap();
        assert_eq!(view.all_entries(), vec![(1, 10), (2, 20), (3, 30)]);
        assert_eq!(unsafe { (*head).header() }.chain_len, 0);

        unsafe { node::free_chain(head) };
    }
}
