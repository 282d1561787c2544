mod common;

use common::{new_store, value_for};

/// Basic store / load / overwrite / delete on small pages, with values
/// far larger than a page (they spill into fragment chains).
#[test]
fn test_store_load_overwrite_delete() {
    let (_dir, store) = new_store(512, 64);

    // step 1: store a 20000-byte value under "hello"
    let v1 = value_for(1, 20000);
    store.put(b"hello", &v1).unwrap();
    assert_eq!(store.load(b"hello").unwrap().unwrap(), v1);

    // step 2: overwrite with a 30000-byte value
    let v2 = value_for(2, 30000);
    store.put(b"hello", &v2).unwrap();
    assert_eq!(store.load(b"hello").unwrap().unwrap(), v2);

    // step 3: a key that was never stored
    assert_eq!(store.load(b"howdy").unwrap(), None);

    // step 4: delete and observe the absence
    store.delete(b"hello").unwrap();
    assert_eq!(store.load(b"hello").unwrap(), None);

    store.verify().unwrap();
}

#[test]
fn test_overwrite_visibility() {
    let (_dir, store) = new_store(4096, 64);

    store.put(b"k", b"first").unwrap();
    store.put(b"k", b"second").unwrap();
    assert_eq!(store.load(b"k").unwrap().unwrap(), b"second");

    // shrinking and growing through the in-place update path
    store.put(b"k", b"x").unwrap();
    assert_eq!(store.load(b"k").unwrap().unwrap(), b"x");
    let big = value_for(9, 900);
    store.put(b"k", &big).unwrap();
    assert_eq!(store.load(b"k").unwrap().unwrap(), big);
}

/// Key lengths around the one-/two-byte header boundary and value
/// lengths around the value header boundary round-trip bit-exactly.
#[test]
fn test_encoding_boundaries() {
    let (_dir, store) = new_store(4096, 64);

    for key_len in [1usize, 63, 64, 65, 100].iter() {
        let key = vec![b'k'; *key_len];
        for value_len in [0usize, 1, 127, 128, 129, 1000].iter() {
            let value = value_for((*key_len * 1000 + *value_len) as u64, *value_len);
            store.put(&key, &value).unwrap();
            assert_eq!(
                store.load(&key).unwrap().unwrap(),
                value,
                "key_len {} value_len {}",
                key_len,
                value_len
            );
        }
    }
    store.verify().unwrap();
}

/// Zero-length values are encoded with the empty-value header families
/// and come back as empty, distinct from absence.
#[test]
fn test_empty_value_round_trip() {
    let (_dir, store) = new_store(512, 64);

    store.put(b"empty", b"").unwrap();
    assert_eq!(store.load(b"empty").unwrap().unwrap(), Vec::<u8>::new());

    // long keys use the two-byte empty-value family
    let long_key = vec![b'q'; 80];
    store.put(&long_key, b"").unwrap();
    assert_eq!(store.load(&long_key).unwrap().unwrap(), Vec::<u8>::new());

    store.delete(b"empty").unwrap();
    assert_eq!(store.load(b"empty").unwrap(), None);
}

/// Churn a node until updates must go through compaction; lookups keep
/// answering exactly as if no compaction had happened.
#[test]
fn test_compaction_preserves_results() {
    let (_dir, store) = new_store(512, 64);

    let keys: Vec<Vec<u8>> = (0..8u8).map(|i| vec![b'c', i]).collect();
    for round in 0..30u64 {
        for (i, key) in keys.iter().enumerate() {
            let value = value_for(round * 100 + i as u64, 20 + (round as usize % 17));
            store.put(key, &value).unwrap();
        }
        store.verify().unwrap();
    }

    for (i, key) in keys.iter().enumerate() {
        let expect = value_for(29 * 100 + i as u64, 20 + (29 % 17));
        assert_eq!(store.load(key).unwrap().unwrap(), expect);
    }
}

/// Deleting a fragmented value and reinserting under the same key keeps
/// chains and lookups consistent.
#[test]
fn test_fragmented_value_churn() {
    let (_dir, store) = new_store(512, 64);

    for i in 0..10u64 {
        let value = value_for(i, 3000 + i as usize * 100);
        store.put(b"big", &value).unwrap();
        assert_eq!(store.load(b"big").unwrap().unwrap(), value);
    }
    store.delete(b"big").unwrap();
    assert_eq!(store.load(b"big").unwrap(), None);

    // small inline value reuses the slot afterwards
    store.put(b"big", b"tiny").unwrap();
    assert_eq!(store.load(b"big").unwrap().unwrap(), b"tiny");
    store.verify().unwrap();
}

#[test]
fn test_oversized_key_is_rejected() {
    let (_dir, store) = new_store(512, 64);
    let huge_key = vec![b'x'; 5000];
    assert!(store.put(&huge_key, b"v").is_err());
    // the store stays usable
    store.put(b"ok", b"v").unwrap();
    assert_eq!(store.load(b"ok").unwrap().unwrap(), b"v");
}
