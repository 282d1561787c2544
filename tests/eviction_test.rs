mod common;

use std::sync::Arc;
use std::thread;

use common::{be_key, new_store, shuffled_ids, value_for};

/// Eviction under pressure: a 64-frame cache serves a tree far larger
/// than itself. The frame population never exceeds the bound and every
/// read stays correct.
#[test]
fn test_random_reads_with_tiny_cache() {
    let (_dir, store) = new_store(4096, 64);
    let count: u64 = 50_000;

    for i in 0..count {
        store.put(&be_key(i), &value_for(i, 20)).unwrap();
    }
    assert!(store.commit().unwrap());
    assert!(store.cached_node_count() <= 64);

    let reads = shuffled_ids(count, 42);
    for (n, i) in reads.iter().take(30_000).enumerate() {
        assert_eq!(
            store.load(&be_key(*i)).unwrap().unwrap(),
            value_for(*i, 20),
            "read {} key {}",
            n,
            i
        );
    }
    assert!(store.cached_node_count() <= 64);
    store.verify().unwrap();
}

/// Writes under the same pressure: dirty nodes are written back on
/// evict and the tree stays whole without an intervening commit.
#[test]
fn test_inserts_under_cache_pressure() {
    let (_dir, store) = new_store(4096, 64);
    let count: u64 = 20_000;

    for i in shuffled_ids(count, 7) {
        store.put(&be_key(i), &value_for(i, 30)).unwrap();
    }
    assert!(store.cached_node_count() <= 64);

    for i in 0..count {
        assert_eq!(store.load(&be_key(i)).unwrap().unwrap(), value_for(i, 30));
    }
    store.verify().unwrap();
}

/// Concurrent readers and writers over disjoint ranges, all fighting
/// for the same small cache.
#[test]
fn test_concurrent_store_and_load() {
    let (_dir, store) = new_store(4096, 64);
    let store = Arc::new(store);
    let per_thread: u64 = 2000;

    let mut writers = Vec::new();
    for t in 0..4u64 {
        let store = store.clone();
        writers.push(thread::spawn(move || {
            let base = t * per_thread;
            for i in base..base + per_thread {
                store.put(&be_key(i), &value_for(i, 40)).unwrap();
            }
        }));
    }
    for w in writers {
        w.join().unwrap();
    }

    let mut readers = Vec::new();
    for t in 0..4u64 {
        let store = store.clone();
        readers.push(thread::spawn(move || {
            for i in shuffled_ids(4 * per_thread, t) {
                assert_eq!(
                    store.load(&be_key(i)).unwrap().unwrap(),
                    value_for(i, 40)
                );
            }
        }));
    }
    for r in readers {
        r.join().unwrap();
    }

    assert!(store.cached_node_count() <= 64);
    store.verify().unwrap();
}

/// A commit racing with ongoing mutations: the committed snapshot is
/// consistent and later commits pick up what the flush skipped.
#[test]
fn test_commit_interleaved_with_writes() {
    let (_dir, store) = new_store(4096, 64);
    let store = Arc::new(store);

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..5000u64 {
                store.put(&be_key(i), &value_for(i, 25)).unwrap();
            }
        })
    };
    // commit repeatedly while the writer runs
    for _ in 0..10 {
        store.commit().unwrap();
    }
    writer.join().unwrap();
    store.commit().unwrap();

    for i in 0..5000u64 {
        assert_eq!(store.load(&be_key(i)).unwrap().unwrap(), value_for(i, 25));
    }
    store.verify().unwrap();
}
