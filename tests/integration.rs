use rand::prelude::random;

use std::sync::Arc;
use std::thread;

use bwindex::{Index, Mode};

#[test]
fn test_single_thread_round_trip() {
    let index: Index<i32, i32> = Index::new(Mode::Unique);
    for i in 0..500 {
        assert!(index.insert(i, i * 10));
    }
    for i in 0..500 {
        assert_eq!(index.scan_key(&i), vec![i * 10]);
    }
    let all = index.scan_all();
    assert_eq!(all.len(), 500);
    for w in all.windows(2) {
        assert!(w[0].0 < w[1].0);
    }
    for i in (0..500).step_by(2) {
        assert!(index.delete(i, i * 10));
    }
    for i in (0..500).step_by(2) {
        assert!(index.scan_key(&i).is_empty());
    }
    for i in (1..500).step_by(2) {
        assert_eq!(index.scan_key(&i), vec![i * 10]);
    }
}

#[test]
fn test_unique_mode_rejects_second_insert() {
    let index: Index<i32, i32> = Index::new(Mode::Unique);
    assert!(index.insert(7, 100));
    assert!(!index.insert(7, 200));
    assert_eq!(index.scan_key(&7), vec![100]);
}

#[test]
fn test_unique_constraint_under_concurrency() {
    let index: Arc<Index<i32, i32>> = Arc::new(Index::new(Mode::Unique));
    let mut handles = Vec::new();
    for t in 0..8 {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || index.insert(42, t)));
    }
    let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(index.scan_key(&42).len(), 1);
}

#[test]
fn test_duplicate_mode_preserves_insertion_order() {
    let index: Index<i32, i32> = Index::new(Mode::Duplicate);
    assert!(index.insert(1, 10));
    assert!(index.insert(1, 20));
    assert!(index.insert(1, 10));
    assert_eq!(index.scan_key(&1), vec![10, 20, 10]);
    assert!(index.delete(1, 20));
    assert_eq!(index.scan_key(&1), vec![10, 10]);
}

// The "root has grown past one level" property from this same scenario
// is checked separately in bwtree::mod::test::test_many_inserts_grow_root_past_one_level,
// which needs `pub(crate)` access to the root PID and table that `Index`
// does not expose publicly.
#[test]
fn test_split_correctness_under_concurrent_inserts() {
    let index: Arc<Index<i32, i32>> = Arc::new(Index::new(Mode::Unique));
    let mut handles = Vec::new();
    for t in 0..4 {
        let index = Arc::clone(&index);
        handles.push(thread::spawn(move || {
            for i in 0..100 {
                let key = t * 100 + i;
                assert!(index.insert(key, key * 2));
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    let all = index.scan_all();
    assert_eq!(all.len(), 400);
    for w in all.windows(2) {
        assert!(w[0].0 < w[1].0);
    }
    for t in 0..4 {
        for i in 0..100 {
            let key = t * 100 + i;
            assert_eq!(index.scan_key(&key), vec![key * 2]);
        }
    }
}

#[test]
fn test_chain_consolidation_after_interleaved_inserts_and_deletes() {
    let index: Index<i32, i32> = Index::new(Mode::Unique);
    for i in 0..20 {
        assert!(index.insert(i, i));
    }
    for i in 0..20 {
        assert!(index.delete(i, i));
    }
    for i in 0..20 {
        assert!(index.insert(i, i * 2));
    }
    let mut all = index.scan_all();
    all.sort();
    let expected: Vec<(i32, i32)> = (0..20).map(|i| (i, i * 2)).collect();
    assert_eq!(all, expected);
}

#[test]
fn test_random_workload_matches_reference_model() {
    let index: Index<i64, i64> = Index::new(Mode::Unique);
    let mut model: std::collections::BTreeMap<i64, i64> = std::collections::BTreeMap::new();

    for _ in 0..2000 {
        let key = random::<i64>().abs() % 200;
        let value = random::<i64>().abs();
        if random::<bool>() {
            let ok = index.insert(key, value);
            if !model.contains_key(&key) {
                assert!(ok);
                model.insert(key, value);
            } else {
                assert!(!ok);
            }
        } else if let Some(&existing) = model.get(&key) {
            assert!(index.delete(key, existing));
            model.remove(&key);
        } else {
            assert!(!index.delete(key, value));
        }
    }

    let expected: Vec<(i64, i64)> = model.into_iter().collect();
    let mut got = index.scan_all();
    got.sort();
    assert_eq!(got, expected);
}
