use std::path::{Path, PathBuf};

use rand::prelude::*;
use tempfile::TempDir;

use small_store::{utils, Options, Store};

/// # Conduct the initialization
///
/// - Setting up log configurations.
/// - Each test gets its own store directory; there is no shared state
///   to clear.
pub fn setup() {
    utils::init_log();
}

pub fn store_path(dir: &TempDir) -> PathBuf {
    dir.path().join("store.db")
}

/// Open a fresh store in its own temp directory.
pub fn new_store(page_size: usize, max_cached: usize) -> (TempDir, Store) {
    setup();
    let dir = TempDir::new().unwrap();
    let store = open_store(&store_path(&dir), page_size, max_cached);
    (dir, store)
}

/// (Re)open the store file at `path`.
pub fn open_store(path: &Path, page_size: usize, max_cached: usize) -> Store {
    let mut options = Options::new(path);
    options.page_size = page_size;
    options.max_cached = max_cached;
    options.min_cached = max_cached.min(16);
    Store::open(options).unwrap()
}

/// Big-endian keys sort the same way as their integers.
pub fn be_key(i: u64) -> Vec<u8> {
    i.to_be_bytes().to_vec()
}

/// Deterministic value so reopened stores can be checked without
/// remembering the data.
pub fn value_for(i: u64, len: usize) -> Vec<u8> {
    let mut value = Vec::with_capacity(len);
    let mut x = i.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    for _ in 0..len {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        value.push((x >> 56) as u8);
    }
    value
}

/// Shuffled 0..count, for insertion orders that stress the split paths.
pub fn shuffled_ids(count: u64, seed: u64) -> Vec<u64> {
    let mut ids: Vec<u64> = (0..count).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    ids.shuffle(&mut rng);
    ids
}
