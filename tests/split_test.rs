mod common;

use common::{new_store, shuffled_ids, value_for};

fn text_key(i: u64) -> Vec<u8> {
    format!("k{:04}", i).into_bytes()
}

/// Split determinism: ascending inserts with chunky values, validating
/// the structural invariants of every reachable node as the tree grows.
#[test]
fn test_ascending_inserts_keep_invariants() {
    let (_dir, store) = new_store(4096, 256);

    for i in 0..10_000u64 {
        store.put(&text_key(i), &value_for(i, 200)).unwrap();
        if i % 500 == 499 {
            store.verify().unwrap();
        }
    }
    store.verify().unwrap();

    for i in 0..10_000u64 {
        assert_eq!(
            store.load(&text_key(i)).unwrap().unwrap(),
            value_for(i, 200),
            "key {}",
            i
        );
    }
}

/// Descending inserts exercise the left-sibling split direction.
#[test]
fn test_descending_inserts_keep_invariants() {
    let (_dir, store) = new_store(4096, 256);

    for i in (0..5000u64).rev() {
        store.put(&text_key(i), &value_for(i, 200)).unwrap();
        if i % 500 == 0 {
            store.verify().unwrap();
        }
    }
    for i in 0..5000u64 {
        assert_eq!(store.load(&text_key(i)).unwrap().unwrap(), value_for(i, 200));
    }
}

/// Random insertion order with adversarially mixed entry sizes; the
/// balancing split must cope with whatever distribution it meets.
#[test]
fn test_random_inserts_mixed_sizes() {
    let (_dir, store) = new_store(512, 128);

    let ids = shuffled_ids(3000, 99);
    for (n, i) in ids.iter().enumerate() {
        // sizes sweep across the whole in-node range and past it
        let len = 1 + (i * 37) as usize % 400;
        store.put(&text_key(*i), &value_for(*i, len)).unwrap();
        if n % 250 == 249 {
            store.verify().unwrap();
        }
    }
    store.verify().unwrap();

    for i in 0..3000u64 {
        let len = 1 + (i * 37) as usize % 400;
        assert_eq!(
            store.load(&text_key(i)).unwrap().unwrap(),
            value_for(i, len),
            "key {}",
            i
        );
    }
}

/// Deletes leave garbage behind instead of merging; lookups and
/// invariants hold through heavy delete/reinsert churn.
#[test]
fn test_delete_and_reinsert_churn() {
    let (_dir, store) = new_store(512, 128);

    for i in 0..1000u64 {
        store.put(&text_key(i), &value_for(i, 50)).unwrap();
    }
    for i in (0..1000u64).step_by(2) {
        store.delete(&text_key(i)).unwrap();
    }
    store.verify().unwrap();

    for i in 0..1000u64 {
        let got = store.load(&text_key(i)).unwrap();
        if i % 2 == 0 {
            assert_eq!(got, None);
        } else {
            assert_eq!(got.unwrap(), value_for(i, 50));
        }
    }

    for i in (0..1000u64).step_by(2) {
        store.put(&text_key(i), &value_for(i + 7000, 60)).unwrap();
    }
    store.verify().unwrap();
    for i in (0..1000u64).step_by(2) {
        assert_eq!(store.load(&text_key(i)).unwrap().unwrap(), value_for(i + 7000, 60));
    }
}
