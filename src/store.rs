//! The store object: owns the page store, the node cache, the tree and
//! the transaction registry. There is no process-wide state; every test
//! and embedding instantiates its own store.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use bit_vec::BitVec;
use log::{info, warn};

use crate::{
    btree::{
        commit::{self, ParsedHeader},
        fragment,
        node_cache::NodeCache,
        page_store::{PageStore, FIRST_DATA_PAGE_ID},
        tree::{mark_page, BTree, LeafUndo},
    },
    error::StoreError,
    io::{SmallReader, SmallWriter},
    transaction::{
        master_log::{self, NoopLockHandler, RecoveredLog},
        undo_log::{
            UndoLog, OP_CUSTOM, OP_INDEX, OP_UNDELETE, OP_UNDELETE_FRAGMENTED, OP_UNINSERT,
            OP_UNUPDATE,
        },
        Transaction, TransactionRegistry, BOGUS_TXN_ID,
    },
    types::{ResultOf, SmallResult},
    utils::HandyRwLock,
};

/// The single user index of this store.
pub const USER_INDEX_ID: u64 = 1;

const TXN_STRIPES: usize = 16;

pub struct Options {
    pub path: PathBuf,
    pub page_size: usize,
    pub min_cached: usize,
    pub max_cached: usize,
}

impl Options {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            page_size: 4096,
            min_cached: 16,
            max_cached: 512,
        }
    }
}

type CustomHandler = Box<dyn Fn(&[u8]) -> SmallResult + Send + Sync>;

pub(crate) struct StoreCore {
    pub(crate) page_store: Arc<PageStore>,
    pub(crate) cache: Arc<NodeCache>,
    pub(crate) tree: BTree,
    registry: TransactionRegistry,
    custom_handler: RwLock<Option<CustomHandler>>,
    /// At most one commit coordinator runs at a time.
    commit_serial: Mutex<()>,
    /// Chain pages of the master undo log the latest header references.
    last_master_pages: Mutex<Vec<u64>>,
    next_txn_id: AtomicU64,
    closed: AtomicBool,
}

pub struct Store {
    core: Arc<StoreCore>,
}

impl Store {
    pub fn open(options: Options) -> ResultOf<Store> {
        let page_store = Arc::new(PageStore::open(&options.path, options.page_size)?);

        let header = commit::decode_commit_header(&page_store.read_extra_commit_data())?;
        let (root_id, master_id) = match &header {
            Some(h) => (h.root_id, h.master_id),
            None => (0, None),
        };

        // recover the master undo log before anything allocates pages
        let recovered = match master_id {
            Some(mid) => Some(master_log::recover_master_undo_log(&page_store, mid)?),
            None => None,
        };

        init_free_list(&page_store, root_id, &recovered)?;

        let cache = Arc::new(NodeCache::new(
            page_store.clone(),
            options.min_cached,
            options.max_cached,
        ));
        let tree = BTree::new(cache.clone());
        tree.load_root(root_id)?;

        let core = Arc::new(StoreCore {
            page_store,
            cache,
            tree,
            registry: TransactionRegistry::new(TXN_STRIPES),
            custom_handler: RwLock::new(None),
            commit_serial: Mutex::new(()),
            last_master_pages: Mutex::new(Vec::new()),
            next_txn_id: AtomicU64::new(BOGUS_TXN_ID + 1),
            closed: AtomicBool::new(false),
        });

        if let Some((logs, master_pages)) = recovered {
            core.finish_recovery(&logs, master_pages)?;
        }

        info!("store opened at {:?}", options.path);
        Ok(Store { core })
    }

    pub fn load(&self, key: &[u8]) -> ResultOf<Option<Vec<u8>>> {
        self.core.check_open()?;
        self.core.tree.load(key)
    }

    pub fn begin_transaction(&self) -> ResultOf<Transaction> {
        self.core.check_open()?;
        let id = self.core.next_txn_id.fetch_add(1, Ordering::Relaxed);
        self.core.registry.register(id);
        Ok(Transaction::new(id, self.core.clone()))
    }

    /// Store (or with `None`, delete) under a transaction; reversible
    /// until the transaction commits.
    pub fn store(&self, tx: &Transaction, key: &[u8], value: Option<&[u8]>) -> SmallResult {
        self.core.store_tracked(tx.id(), key, value)
    }

    /// Untracked write: durable at the next commit, not reversible.
    pub fn put(&self, key: &[u8], value: &[u8]) -> SmallResult {
        self.core.store_untracked(key, Some(value))
    }

    pub fn delete(&self, key: &[u8]) -> SmallResult {
        self.core.store_untracked(key, None)
    }

    /// Run the commit coordinator: flush the current generation and
    /// install the new root atomically. Returns false when the tree had
    /// nothing to commit.
    pub fn commit(&self) -> ResultOf<bool> {
        self.core.check_open()?;
        self.core.commit()
    }

    /// The most recently committed header, None for a fresh store.
    pub fn committed_header(&self) -> ResultOf<Option<ParsedHeader>> {
        commit::decode_commit_header(&self.core.page_store.read_extra_commit_data())
    }

    /// Handler dispatched for `CUSTOM` undo records during rollback.
    pub fn set_custom_undo_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) -> SmallResult + Send + Sync + 'static,
    {
        *self.core.custom_handler.wl() = Some(Box::new(handler));
    }

    /// Push a `CUSTOM` reverse operation onto a transaction's undo log.
    pub fn push_custom_undo(&self, tx: &Transaction, payload: &[u8]) -> SmallResult {
        self.core.push_custom(tx.id(), payload)
    }

    pub fn cached_node_count(&self) -> usize {
        self.core.cache.cached_count()
    }

    /// Validate the structural invariants of every reachable node.
    pub fn verify(&self) -> SmallResult {
        self.core.tree.verify()
    }

    pub fn close(&self) {
        self.core.closed.store(true, Ordering::Release);
        self.core.page_store.close();
    }
}

/// `varint(keyLen) key value` payload shared by UNUPDATE, UNDELETE and
/// UNDELETE_FRAGMENTED records.
fn encode_key_value(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut w = SmallWriter::new();
    w.write_varint(key.len() as u64);
    w.write_bytes(key);
    w.write_bytes(value);
    w.to_bytes()
}

fn decode_key_value(payload: &[u8]) -> ResultOf<(&[u8], &[u8])> {
    let mut r = SmallReader::new(payload);
    let key_len = r.read_varint()? as usize;
    let key = r.read_exact(key_len)?;
    let value = r.read_exact(r.remaining())?;
    Ok((key, value))
}

/// Rebuild the free list: every data page not reachable from the
/// committed root, the master undo log, or an uncommitted transaction's
/// undo state is free.
fn init_free_list(
    page_store: &PageStore,
    root_id: u64,
    recovered: &Option<(Vec<RecoveredLog>, Vec<u64>)>,
) -> SmallResult {
    let page_count = page_store.page_count() as usize;
    let mut mark = BitVec::from_elem(page_count.max(FIRST_DATA_PAGE_ID as usize), false);
    mark.set(0, true);
    mark.set(1, true);

    BTree::scan_reachable(page_store, root_id, &mut mark)?;

    if let Some((logs, master_pages)) = recovered {
        for id in master_pages {
            mark_page(&mut mark, *id)?;
        }
        for log in logs {
            if log.committed() {
                // its chain and trashed fragment pages are garbage now
                continue;
            }
            for id in &log.pages {
                mark_page(&mut mark, *id)?;
            }
            // fragment chains kept alive only by pending undo records
            for (op, payload) in &log.entries {
                if *op == OP_UNDELETE_FRAGMENTED {
                    let (_key, desc) = decode_key_value(payload)?;
                    for fid in fragment::chain_pages(page_store, desc)? {
                        mark_page(&mut mark, fid)?;
                    }
                }
            }
        }
    }

    let mut free = Vec::new();
    for id in FIRST_DATA_PAGE_ID as usize..page_count {
        if !mark.get(id).unwrap_or(true) {
            free.push(id as u64);
        }
    }
    page_store.init_free_list(free, page_count as u64);
    Ok(())
}

impl StoreCore {
    fn check_open(&self) -> SmallResult {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    // tree writes

    pub(crate) fn store_tracked(
        &self,
        txn_id: u64,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> SmallResult {
        self.check_open()?;
        if txn_id == BOGUS_TXN_ID {
            return self.store_untracked(key, value);
        }
        let state = self.registry.get(txn_id).ok_or_else(|| {
            StoreError::ConstraintViolation(format!("transaction {} is not live", txn_id))
        })?;

        let _commit = self.page_store.shared_commit_lock();
        let mut st = state.lock().unwrap();
        let st = &mut *st;
        let undo = &mut st.undo;
        let trash = &mut st.trash;
        let cache = &self.cache;

        let mut sink = |u: LeafUndo<'_>| -> SmallResult {
            match u {
                LeafUndo::Uninsert { key } => undo.push(cache, USER_INDEX_ID, OP_UNINSERT, key),
                LeafUndo::Unupdate { key, value } => {
                    undo.push(cache, USER_INDEX_ID, OP_UNUPDATE, &encode_key_value(key, value))
                }
                LeafUndo::Undelete { key, value } => {
                    undo.push(cache, USER_INDEX_ID, OP_UNDELETE, &encode_key_value(key, value))
                }
                LeafUndo::UndeleteFragmented { key, descriptor } => {
                    undo.push(
                        cache,
                        USER_INDEX_ID,
                        OP_UNDELETE_FRAGMENTED,
                        &encode_key_value(key, descriptor),
                    )?;
                    // the chain stays alive until the transaction ends
                    trash.insert(key.to_vec(), descriptor.to_vec());
                    Ok(())
                }
            }
        };
        self.tree.store_op(key, value, &mut sink)
    }

    pub(crate) fn store_untracked(&self, key: &[u8], value: Option<&[u8]>) -> SmallResult {
        self.check_open()?;
        let _commit = self.page_store.shared_commit_lock();
        let page_store = self.page_store.clone();
        let mut sink = bogus_sink(&page_store);
        self.tree.store_op(key, value, &mut sink)
    }

    pub(crate) fn push_custom(&self, txn_id: u64, payload: &[u8]) -> SmallResult {
        self.check_open()?;
        let state = self.registry.get(txn_id).ok_or_else(|| {
            StoreError::ConstraintViolation(format!("transaction {} is not live", txn_id))
        })?;
        let _commit = self.page_store.shared_commit_lock();
        let mut st = state.lock().unwrap();
        st.undo.push(&self.cache, USER_INDEX_ID, OP_CUSTOM, payload)
    }

    // transaction lifecycle

    pub(crate) fn commit_transaction(&self, txn_id: u64) -> SmallResult {
        self.check_open()?;
        // committing a finished transaction is a no-op
        let state = match self.registry.remove(txn_id) {
            Some(s) => s,
            None => return Ok(()),
        };

        let _commit = self.page_store.shared_commit_lock();
        let mut st = state.lock().unwrap();
        st.undo.truncate(&self.cache, &self.page_store, true)?;
        for (_key, desc) in st.trash.drain() {
            fragment::delete_chain(&self.page_store, &desc)?;
        }
        Ok(())
    }

    pub(crate) fn rollback_transaction(&self, txn_id: u64) -> SmallResult {
        self.check_open()?;
        // rolling back a finished (or already rolled back and emptied)
        // transaction is a no-op
        let state = match self.registry.get(txn_id) {
            Some(s) => s,
            None => return Ok(()),
        };

        let _commit = self.page_store.shared_commit_lock();
        let mut st = state.lock().unwrap();
        let st = &mut *st;
        self.rollback_to(&mut st.undo, &mut st.trash, 0)?;
        st.undo.truncate(&self.cache, &self.page_store, false)?;
        if !st.trash.is_empty() {
            warn!(
                "txn {}: {} trashed fragment chains survived rollback",
                txn_id,
                st.trash.len()
            );
        }
        Ok(())
    }

    pub(crate) fn txn_scope_enter(&self, txn_id: u64) -> ResultOf<u64> {
        self.with_txn(txn_id, |core, st| st.undo.scope_enter(&core.cache))
    }

    pub(crate) fn txn_scope_commit(&self, txn_id: u64) -> ResultOf<u64> {
        self.with_txn(txn_id, |core, st| st.undo.scope_commit(&core.cache))
    }

    pub(crate) fn txn_scope_rollback(&self, txn_id: u64, savepoint: u64) -> SmallResult {
        self.with_txn(txn_id, |core, st| {
            core.rollback_to(&mut st.undo, &mut st.trash, savepoint)
        })
    }

    fn with_txn<T>(
        &self,
        txn_id: u64,
        f: impl FnOnce(&Self, &mut crate::transaction::TxnState) -> ResultOf<T>,
    ) -> ResultOf<T> {
        self.check_open()?;
        let state = self.registry.get(txn_id).ok_or_else(|| {
            StoreError::ConstraintViolation(format!("transaction {} is not live", txn_id))
        })?;
        let _commit = self.page_store.shared_commit_lock();
        let mut st = state.lock().unwrap();
        f(self, &mut st)
    }

    /// Pop and apply reverse operations down to `savepoint`. Trash
    /// entries are dropped as their chains re-link into the tree.
    fn rollback_to(
        &self,
        undo: &mut UndoLog,
        trash: &mut std::collections::HashMap<Vec<u8>, Vec<u8>>,
        savepoint: u64,
    ) -> SmallResult {
        let mut active = undo.active_index_id();
        let cache = self.cache.clone();
        let mut apply = |op: u8, payload: &[u8]| -> SmallResult {
            if op == OP_INDEX {
                let mut r = SmallReader::new(payload);
                active = r.read_varint()?;
                return Ok(());
            }
            if op == OP_UNDELETE_FRAGMENTED {
                let (key, _) = decode_key_value(payload)?;
                trash.remove(key);
            }
            self.apply_undo_record(active, op, payload)
        };
        undo.scope_rollback(&cache, savepoint, &mut apply)
    }

    /// Reverse application of one undo record against the tree.
    pub(crate) fn apply_undo_record(&self, index_id: u64, op: u8, payload: &[u8]) -> SmallResult {
        match op {
            OP_UNINSERT | OP_UNUPDATE | OP_UNDELETE | OP_UNDELETE_FRAGMENTED => {
                if index_id != USER_INDEX_ID {
                    return Err(StoreError::corrupt(format!(
                        "undo record for unknown index {}",
                        index_id
                    )));
                }
            }
            _ => {}
        }

        let page_store = self.page_store.clone();
        let mut sink = bogus_sink(&page_store);
        match op {
            OP_UNINSERT => self.tree.store_op(payload, None, &mut sink),
            OP_UNUPDATE | OP_UNDELETE => {
                let (key, value) = decode_key_value(payload)?;
                self.tree.store_op(key, Some(value), &mut sink)
            }
            OP_UNDELETE_FRAGMENTED => {
                let (key, desc) = decode_key_value(payload)?;
                self.tree.store_descriptor(key, desc, &mut sink)
            }
            OP_CUSTOM => match &*self.custom_handler.rl() {
                Some(handler) => handler(payload),
                None => Err(StoreError::ConstraintViolation(
                    "no custom undo handler installed".to_string(),
                )),
            },
            // scope and commit markers have no data effect
            _ => Ok(()),
        }
    }

    // durability commit

    pub(crate) fn commit(&self) -> ResultOf<bool> {
        let _serial = self.commit_serial.lock().unwrap();

        let mut new_master_pages: Vec<u64> = Vec::new();
        let committed = commit::commit(&self.cache, &mut || {
            // called under the exclusive commit lock, after the flip
            let mut master = UndoLog::new(BOGUS_TXN_ID);
            let mut any = false;
            for state in self.registry.all() {
                let st = state.lock().unwrap();
                if st.undo.length() > 0 {
                    st.undo.write_to_master(&self.cache, &mut master)?;
                    any = true;
                }
            }

            // the previous master log is superseded by this commit
            {
                let mut last = self.last_master_pages.lock().unwrap();
                for id in last.drain(..) {
                    self.page_store.delete_page(id);
                }
            }

            if !any {
                return Ok(None);
            }
            let master_id = master.force_spill(&self.cache)?;
            new_master_pages = master.chain_page_ids();
            master.release_frames(&self.cache);
            Ok(Some(master_id))
        })?;

        if committed {
            *self.last_master_pages.lock().unwrap() = new_master_pages;
        }
        Ok(committed)
    }

    // recovery

    fn finish_recovery(&self, logs: &[RecoveredLog], master_pages: Vec<u64>) -> SmallResult {
        {
            let _commit = self.page_store.shared_commit_lock();
            let mut apply = |index_id: u64, op: u8, payload: &[u8]| {
                self.apply_undo_record(index_id, op, payload)
            };
            master_log::recover_transactions(logs, &NoopLockHandler, &mut apply)?;

            // the master log and the rolled-back chains are spent
            for id in master_pages {
                self.page_store.delete_page(id);
            }
            for log in logs {
                if !log.committed() {
                    for id in &log.pages {
                        self.page_store.delete_page(*id);
                    }
                }
            }
        }

        // make the rolled-back state durable and drop the master
        // reference from the header
        self.commit()?;
        Ok(())
    }
}

/// Sink for untracked writes: no undo records; a displaced fragment
/// chain has no transaction keeping it alive, so it is freed at once.
fn bogus_sink<'a>(
    page_store: &'a Arc<PageStore>,
) -> impl FnMut(LeafUndo<'_>) -> SmallResult + 'a {
    move |u| match u {
        LeafUndo::UndeleteFragmented { descriptor, .. } => {
            fragment::delete_chain(page_store, descriptor)
        }
        _ => Ok(()),
    }
}
