use std::{
    fs::{File, OpenOptions},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;

use log::{debug, info};

use crate::{
    error::StoreError,
    io::{SmallReader, SmallWriter},
    types::{ResultOf, SmallResult},
};

/// Magic of a commit-header slot.
const HEADER_MAGIC: u32 = 0x534d_4442;

/// Page ids 0 and 1 hold the two commit-header slots; they are never
/// handed out as data pages, which is why id 0 can mean "no page" and
/// id 1 is reserved.
pub const FIRST_DATA_PAGE_ID: u64 = 2;

struct PageAlloc {
    free: Vec<u64>,
    /// File high-water mark; the next id when the free list is empty.
    next_page_id: u64,
    /// Pages deleted since the last generation flip. Unusable until the
    /// commit after next completes.
    pending: Vec<u64>,
    /// Pages deleted before the last flip. Freed when the current commit
    /// header lands.
    prev_pending: Vec<u64>,
}

struct HeaderState {
    counter: u64,
    extra: Vec<u8>,
}

/// Fixed-size page allocator over a single file, plus the two-phase
/// commit metadata and the shared/exclusive commit latch.
pub struct PageStore {
    file: File,
    page_size: usize,
    commit_lock: RwLock<()>,
    alloc: Mutex<PageAlloc>,
    header: Mutex<HeaderState>,
    closed: AtomicBool,
}

impl PageStore {
    pub fn open<P: AsRef<Path>>(path: P, page_size: usize) -> ResultOf<Self> {
        assert!(page_size.is_power_of_two() && page_size >= 512);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| StoreError::io(0, e))?;

        let store = Self {
            file,
            page_size,
            commit_lock: RwLock::new(()),
            alloc: Mutex::new(PageAlloc {
                free: Vec::new(),
                next_page_id: FIRST_DATA_PAGE_ID,
                pending: Vec::new(),
                prev_pending: Vec::new(),
            }),
            header: Mutex::new(HeaderState {
                counter: 0,
                extra: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        };

        let len = store
            .file
            .metadata()
            .map_err(|e| StoreError::io(0, e))?
            .len();
        if len == 0 {
            // brand new store: lay down an empty header in slot 0
            store.write_header_slot(0, 0, &[])?;
            store.sync()?;
            info!("created new store, page size {}", page_size);
        } else {
            let (counter, extra) = store.read_latest_header()?;
            debug!(
                "opened store: commit counter {}, {} extra bytes",
                counter,
                extra.len()
            );
            let mut header = store.header.lock().unwrap();
            header.counter = counter;
            header.extra = extra;
            let mut alloc = store.alloc.lock().unwrap();
            alloc.next_page_id =
                std::cmp::max(FIRST_DATA_PAGE_ID, len / page_size as u64);
        }

        Ok(store)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages the file currently covers (including headers).
    pub fn page_count(&self) -> u64 {
        self.alloc.lock().unwrap().next_page_id
    }

    fn check_open(&self) -> SmallResult {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    // page io

    pub fn read_page(&self, id: u64, buf: &mut [u8]) -> SmallResult {
        self.check_open()?;
        debug_assert_eq!(buf.len(), self.page_size);
        let off = id * self.page_size as u64;
        #[cfg(unix)]
        let r = self.file.read_exact_at(buf, off);
        #[cfg(windows)]
        let r = read_exact_at_windows(&self.file, buf, off);
        r.map_err(|e| StoreError::io(id, e))
    }

    /// Write a page whose id came from `reserve_page`. Not durable until
    /// the next commit.
    pub fn write_reserved_page(&self, id: u64, buf: &[u8]) -> SmallResult {
        self.check_open()?;
        debug_assert_eq!(buf.len(), self.page_size);
        let off = id * self.page_size as u64;
        #[cfg(unix)]
        let r = self.file.write_all_at(buf, off);
        #[cfg(windows)]
        let r = write_all_at_windows(&self.file, buf, off);
        r.map_err(|e| StoreError::io(id, e))
    }

    // allocation

    pub fn reserve_page(&self) -> ResultOf<u64> {
        self.check_open()?;
        let mut alloc = self.alloc.lock().unwrap();
        if let Some(id) = alloc.free.pop() {
            return Ok(id);
        }
        let id = alloc.next_page_id;
        alloc.next_page_id += 1;
        Ok(id)
    }

    /// Return a freshly reserved id that was never written and never
    /// referenced. Used to revert a failed dirtying or undo-push.
    pub fn unreserve_page(&self, id: u64) {
        let mut alloc = self.alloc.lock().unwrap();
        alloc.free.push(id);
    }

    /// Schedule a page for reuse once its content can no longer be
    /// referenced by a durable header.
    pub fn delete_page(&self, id: u64) {
        debug_assert!(id >= FIRST_DATA_PAGE_ID);
        let mut alloc = self.alloc.lock().unwrap();
        alloc.pending.push(id);
    }

    /// Install the rebuilt free list after the reachability scan on open.
    pub fn init_free_list(&self, free: Vec<u64>, next_page_id: u64) {
        let mut alloc = self.alloc.lock().unwrap();
        debug!(
            "free list rebuilt: {} free pages, high water {}",
            free.len(),
            next_page_id
        );
        alloc.free = free;
        alloc.next_page_id = next_page_id;
    }

    /// Called at the commit generation flip: pages deleted in the closed
    /// epoch become freeable when the upcoming header lands.
    pub fn seal_delete_epoch(&self) {
        let mut alloc = self.alloc.lock().unwrap();
        let pending = std::mem::replace(&mut alloc.pending, Vec::new());
        alloc.prev_pending.extend(pending);
    }

    // commit latch

    pub fn shared_commit_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.commit_lock.read().unwrap()
    }

    pub fn exclusive_commit_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.commit_lock.write().unwrap()
    }

    /// Most recent committed extra data; empty on a new store.
    pub fn read_extra_commit_data(&self) -> Vec<u8> {
        self.header.lock().unwrap().extra.clone()
    }

    /// Two-phase commit. The caller holds the exclusive commit lock and
    /// hands its guard to `prepare`, which may release it once mutations
    /// are allowed to resume. `prepare` returns the new extra commit
    /// data; the header swap is atomic thanks to the dual slots.
    pub fn commit<F>(&self, excl: RwLockWriteGuard<'_, ()>, prepare: F) -> SmallResult
    where
        F: FnOnce(RwLockWriteGuard<'_, ()>) -> ResultOf<Vec<u8>>,
    {
        self.check_open()?;
        let extra = prepare(excl)?;

        // all reserved-page writes must hit the disk before the header
        // points at them
        self.sync()?;

        let (counter, slot) = {
            let header = self.header.lock().unwrap();
            (header.counter + 1, (header.counter + 1) % 2)
        };
        self.write_header_slot(slot, counter, &extra)?;
        self.sync()?;

        {
            let mut header = self.header.lock().unwrap();
            header.counter = counter;
            header.extra = extra;
        }

        // the previous epoch's deletions are now unreferenced by any
        // durable header
        let mut alloc = self.alloc.lock().unwrap();
        let recycled = std::mem::replace(&mut alloc.prev_pending, Vec::new());
        debug!(
            "commit {} durable, {} pages recycled",
            counter,
            recycled.len()
        );
        alloc.free.extend(recycled);
        Ok(())
    }

    fn sync(&self) -> SmallResult {
        self.file.sync_all().map_err(|e| StoreError::io(0, e))
    }

    // header slots

    fn write_header_slot(&self, slot: u64, counter: u64, extra: &[u8]) -> SmallResult {
        let mut w = SmallWriter::new();
        w.write_u32_be(HEADER_MAGIC);
        w.write_u64_be(counter);
        w.write_u16_be(extra.len() as u16);
        w.write_bytes(extra);

        let mut bytes = w.to_bytes();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        bytes.extend_from_slice(&hasher.finalize().to_be_bytes());

        let mut page = vec![0u8; self.page_size];
        page[..bytes.len()].copy_from_slice(&bytes);
        self.write_reserved_page(slot, &page)
    }

    fn read_header_slot(&self, slot: u64) -> ResultOf<Option<(u64, Vec<u8>)>> {
        let mut page = vec![0u8; self.page_size];
        if self.read_page(slot, &mut page).is_err() {
            return Ok(None);
        }

        let mut r = SmallReader::new(&page);
        let magic = r.read_u32_be()?;
        if magic != HEADER_MAGIC {
            return Ok(None);
        }
        let counter = r.read_u64_be()?;
        let extra_len = r.read_u16_be()? as usize;
        let body_len = 4 + 8 + 2 + extra_len;
        if body_len + 4 > self.page_size {
            return Ok(None);
        }
        let extra = r.read_exact(extra_len)?.to_vec();
        let crc = r.read_u32_be()?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&page[..body_len]);
        if hasher.finalize() != crc {
            return Ok(None);
        }
        Ok(Some((counter, extra)))
    }

    fn read_latest_header(&self) -> ResultOf<(u64, Vec<u8>)> {
        let a = self.read_header_slot(0)?;
        let b = self.read_header_slot(1)?;
        match (a, b) {
            (Some((ca, ea)), Some((cb, eb))) => {
                if ca >= cb {
                    Ok((ca, ea))
                } else {
                    Ok((cb, eb))
                }
            }
            (Some(h), None) | (None, Some(h)) => Ok(h),
            (None, None) => Err(StoreError::corrupt(
                "no valid commit header in either slot",
            )),
        }
    }
}

#[cfg(windows)]
fn read_exact_at_windows(file: &File, mut buf: &mut [u8], mut off: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = file.seek_read(buf, off)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        buf = &mut buf[n..];
        off += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at_windows(file: &File, mut buf: &[u8], mut off: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = file.seek_write(buf, off)?;
        buf = &buf[n..];
        off += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(page_size: usize) -> (tempfile::TempDir, PageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::open(dir.path().join("pages.db"), page_size).unwrap();
        (dir, store)
    }

    #[test]
    fn test_new_store_has_empty_header() {
        let (_dir, store) = temp_store(512);
        assert!(store.read_extra_commit_data().is_empty());
    }

    #[test]
    fn test_reserve_write_read_round_trip() {
        let (_dir, store) = temp_store(512);
        let id = store.reserve_page().unwrap();
        assert!(id >= FIRST_DATA_PAGE_ID);

        let mut page = vec![0u8; 512];
        page[0] = 0xab;
        page[511] = 0xcd;
        store.write_reserved_page(id, &page).unwrap();

        let mut back = vec![0u8; 512];
        store.read_page(id, &mut back).unwrap();
        assert_eq!(page, back);
    }

    #[test]
    fn test_commit_header_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.db");

        {
            let store = PageStore::open(&path, 512).unwrap();
            let excl = store.exclusive_commit_lock();
            store
                .commit(excl, |guard| {
                    drop(guard);
                    Ok(vec![1, 2, 3, 4])
                })
                .unwrap();
        }

        let store = PageStore::open(&path, 512).unwrap();
        assert_eq!(store.read_extra_commit_data(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_alternating_header_slots() {
        let (_dir, store) = temp_store(512);
        for round in 0u8..4 {
            let excl = store.exclusive_commit_lock();
            store
                .commit(excl, |guard| {
                    drop(guard);
                    Ok(vec![round])
                })
                .unwrap();
            assert_eq!(store.read_extra_commit_data(), vec![round]);
        }
    }

    #[test]
    fn test_deleted_pages_recycle_after_two_commits() {
        let (_dir, store) = temp_store(512);
        let id = store.reserve_page().unwrap();
        store.delete_page(id);

        // first flip + commit: the deletion moved to the previous epoch
        // and is recycled when the header lands
        store.seal_delete_epoch();
        let excl = store.exclusive_commit_lock();
        store
            .commit(excl, |guard| {
                drop(guard);
                Ok(Vec::new())
            })
            .unwrap();

        let again = store.reserve_page().unwrap();
        assert_eq!(again, id);
    }

    #[test]
    fn test_unreserve_returns_id() {
        let (_dir, store) = temp_store(512);
        let id = store.reserve_page().unwrap();
        store.unreserve_page(id);
        assert_eq!(store.reserve_page().unwrap(), id);
    }
}
