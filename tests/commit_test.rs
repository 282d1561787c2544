mod common;

use common::{be_key, new_store, open_store, store_path, value_for};
use small_store::ENCODING_VERSION;

/// Commit durability: a committed tree survives reopen byte-for-byte,
/// and the header carries the version tag and the committed root.
#[test]
fn test_commit_durability_across_reopen() {
    let (dir, store) = new_store(4096, 256);
    let count: u64 = 10_000;

    // step 1: build the tree and commit
    for i in 0..count {
        store.put(&be_key(i), &value_for(i, 100)).unwrap();
    }
    assert!(store.commit().unwrap());

    // step 2: the header encodes {version, rootId}
    let header = store.committed_header().unwrap().unwrap();
    assert_eq!(header.version, ENCODING_VERSION);
    assert!(header.root_id >= 2);
    store.close();
    drop(store);

    // step 3: reopen and check every key
    let store = open_store(&store_path(&dir), 4096, 256);
    let header2 = store.committed_header().unwrap().unwrap();
    assert_eq!(header2.root_id, header.root_id);
    for i in 0..count {
        assert_eq!(
            store.load(&be_key(i)).unwrap().unwrap(),
            value_for(i, 100),
            "key {}",
            i
        );
    }
    store.verify().unwrap();
}

/// Crash before commit: nothing is visible after reopen. Crash after
/// commit: everything is.
#[test]
fn test_crash_before_and_after_commit() {
    let (dir, store) = new_store(4096, 64);
    let count: u64 = 1000;

    // phase 1: insert and "crash" without committing (dropping the
    // store without commit leaves the header untouched)
    for i in 0..count {
        store.put(&be_key(i), &value_for(i, 50)).unwrap();
    }
    drop(store);

    let store = open_store(&store_path(&dir), 4096, 64);
    for i in 0..count {
        assert_eq!(store.load(&be_key(i)).unwrap(), None, "key {}", i);
    }

    // phase 2: insert again, commit, crash after commit returned
    for i in 0..count {
        store.put(&be_key(i), &value_for(i, 50)).unwrap();
    }
    assert!(store.commit().unwrap());
    drop(store);

    let store = open_store(&store_path(&dir), 4096, 64);
    for i in 0..count {
        assert_eq!(
            store.load(&be_key(i)).unwrap().unwrap(),
            value_for(i, 50),
            "key {}",
            i
        );
    }
    store.verify().unwrap();
}

/// Changes made after one commit land in the next; an uncommitted tail
/// is dropped by reopen without touching the committed prefix.
#[test]
fn test_incremental_commits() {
    let (dir, store) = new_store(4096, 64);

    for i in 0..200u64 {
        store.put(&be_key(i), &value_for(i, 80)).unwrap();
    }
    assert!(store.commit().unwrap());

    for i in 200..400u64 {
        store.put(&be_key(i), &value_for(i, 80)).unwrap();
    }
    assert!(store.commit().unwrap());

    // uncommitted tail
    for i in 400..500u64 {
        store.put(&be_key(i), &value_for(i, 80)).unwrap();
    }
    drop(store);

    let store = open_store(&store_path(&dir), 4096, 64);
    for i in 0..400u64 {
        assert_eq!(store.load(&be_key(i)).unwrap().unwrap(), value_for(i, 80));
    }
    for i in 400..500u64 {
        assert_eq!(store.load(&be_key(i)).unwrap(), None);
    }
}

/// A commit with a clean tree is a no-op and reports so.
#[test]
fn test_commit_nothing_to_do() {
    let (_dir, store) = new_store(4096, 64);
    assert!(!store.commit().unwrap());

    store.put(b"k", b"v").unwrap();
    assert!(store.commit().unwrap());
    assert!(!store.commit().unwrap());
}

/// Repeated overwrite-commit cycles recycle pages instead of growing
/// the file without bound; the committed content stays correct.
#[test]
fn test_commit_cycles_reuse_pages() {
    let (dir, store) = new_store(512, 64);

    for round in 0..20u64 {
        for i in 0..50u64 {
            store.put(&be_key(i), &value_for(round * 50 + i, 60)).unwrap();
        }
        assert!(store.commit().unwrap());
    }
    drop(store);

    let store = open_store(&store_path(&dir), 512, 64);
    for i in 0..50u64 {
        assert_eq!(
            store.load(&be_key(i)).unwrap().unwrap(),
            value_for(19 * 50 + i, 60)
        );
    }
    store.verify().unwrap();
}
