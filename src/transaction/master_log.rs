//! The master undo log and its recovery side.
//!
//! At commit time every live transaction's undo log is captured into a
//! master log (`OP_LOG_COPY` for buffered logs, `OP_LOG_REF` for spilled
//! chains) whose top page id rides in the commit header. On reopen the
//! master log is parsed back into per-transaction logs, committed ones
//! are discarded, and the rest are rolled back against the tree.

use std::collections::HashSet;

use log::{debug, info, warn};

use crate::{
    btree::page_store::PageStore,
    error::StoreError,
    io::{get_u16_le, get_u64_le, SmallReader},
    types::{ResultOf, SmallResult},
};

use super::undo_log::{
    op_has_payload, OFF_LOWER_NODE_ID, OFF_TOP_OFFSET, OP_COMMIT, OP_COMMIT_TRUNCATE,
    OP_LOG_COPY, OP_LOG_REF, UNDO_HEADER_SIZE,
};

/// Locks re-acquired while transactions are rolled back after a crash.
/// Lock management proper lives outside the storage core; the default
/// holder does nothing.
pub trait RecoveryLockHandler {
    fn lock_exclusive(&self, index_id: u64, key: &[u8]) -> SmallResult;
}

pub struct NoopLockHandler;

impl RecoveryLockHandler for NoopLockHandler {
    fn lock_exclusive(&self, _index_id: u64, _key: &[u8]) -> SmallResult {
        Ok(())
    }
}

/// One transaction's undo state as reconstructed from the master log.
pub struct RecoveredLog {
    pub txn_id: u64,
    pub active_index_id: u64,
    /// Entries newest-first, i.e. in rollback application order.
    pub entries: Vec<(u8, Vec<u8>)>,
    /// Chain pages referenced on disk (empty for buffered copies).
    pub pages: Vec<u64>,
}

impl RecoveredLog {
    /// A log whose top entry is a commit marker belongs to a committed
    /// transaction and must not be rolled back.
    pub fn committed(&self) -> bool {
        matches!(
            self.entries.first(),
            Some((op, _)) if *op == OP_COMMIT || *op == OP_COMMIT_TRUNCATE
        )
    }
}

/// Read an undo page chain from disk, newest page first.
fn read_chain(page_store: &PageStore, top_id: u64) -> ResultOf<Vec<(u64, Vec<u8>)>> {
    let page_size = page_store.page_size();
    let mut pages = Vec::new();
    let mut seen = HashSet::new();
    let mut id = top_id;
    while id != 0 {
        if !seen.insert(id) {
            return Err(StoreError::corrupt(format!(
                "undo chain cycles at page {}",
                id
            )));
        }
        let mut page = vec![0u8; page_size];
        page_store.read_page(id, &mut page)?;
        if page[0] != crate::btree::node::TYPE_UNDO_LOG {
            return Err(StoreError::corrupt(format!(
                "page {} is not an undo page (type {})",
                id, page[0]
            )));
        }
        if page[1] != 0 {
            return Err(StoreError::corrupt(format!(
                "undo page {} has nonzero reserved byte",
                id
            )));
        }
        let lower = get_u64_le(&page, OFF_LOWER_NODE_ID);
        pages.push((id, page));
        id = lower;
    }
    Ok(pages)
}

/// Sequential reader over a read-back chain: starts at the newest page's
/// top offset and continues into older pages at the header boundary.
struct RawChainReader<'a> {
    pages: &'a [(u64, Vec<u8>)],
    idx: usize,
    off: usize,
    page_size: usize,
}

impl<'a> RawChainReader<'a> {
    fn new(pages: &'a [(u64, Vec<u8>)], top_offset: usize, page_size: usize) -> Self {
        Self {
            pages,
            idx: 0,
            off: top_offset,
            page_size,
        }
    }

    fn exhausted(&self) -> bool {
        self.idx + 1 >= self.pages.len() && self.off >= self.page_size
    }

    fn read_u8(&mut self) -> ResultOf<u8> {
        if self.off >= self.page_size {
            if self.idx + 1 >= self.pages.len() {
                return Err(StoreError::corrupt("undo record runs off the chain"));
            }
            self.idx += 1;
            self.off = UNDO_HEADER_SIZE;
        }
        let b = self.pages[self.idx].1[self.off];
        self.off += 1;
        Ok(b)
    }

    fn read_varint(&mut self) -> ResultOf<u64> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.read_u8()?;
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                return Err(StoreError::corrupt("varint too long in undo record"));
            }
        }
    }

    fn read_bytes(&mut self, n: usize) -> ResultOf<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_u8()?);
        }
        Ok(out)
    }

    fn consumed(&self) -> usize {
        let full_pages = self.idx;
        let mut total = 0;
        if full_pages > 0 {
            // every page before the current one contributed its whole
            // data region from its top offset
            for (i, (_, page)) in self.pages[..full_pages].iter().enumerate() {
                let start = if i == 0 {
                    get_u16_le(page, OFF_TOP_OFFSET) as usize
                } else {
                    UNDO_HEADER_SIZE
                };
                total += self.page_size - start;
            }
            total += self.off - UNDO_HEADER_SIZE;
        } else {
            let start = get_u16_le(&self.pages[0].1, OFF_TOP_OFFSET) as usize;
            total = self.off - start;
        }
        total
    }
}

/// Parse entries newest-first from a raw stack slice (a buffered log
/// captured by `OP_LOG_COPY`).
fn parse_stack(stack: &[u8]) -> ResultOf<Vec<(u8, Vec<u8>)>> {
    let mut entries = Vec::new();
    let mut r = SmallReader::new(stack);
    while r.remaining() > 0 {
        let op = r.read_u8()?;
        let payload = if op_has_payload(op) {
            let len = r.read_varint()? as usize;
            r.read_exact(len)?.to_vec()
        } else {
            Vec::new()
        };
        entries.push((op, payload));
    }
    Ok(entries)
}

/// Reconstruct every transaction's undo log recorded in the master log.
pub fn recover_master_undo_log(
    page_store: &PageStore,
    master_id: u64,
) -> ResultOf<(Vec<RecoveredLog>, Vec<u64>)> {
    let page_size = page_store.page_size();
    let master_pages = read_chain(page_store, master_id)?;
    if master_pages.is_empty() {
        return Err(StoreError::corrupt("master undo log chain is empty"));
    }
    let top_offset = get_u16_le(&master_pages[0].1, OFF_TOP_OFFSET) as usize;

    let mut logs = Vec::new();
    let mut reader = RawChainReader::new(&master_pages, top_offset, page_size);
    while !reader.exhausted() {
        let op = reader.read_u8()?;
        let len = reader.read_varint()? as usize;
        let payload = reader.read_bytes(len)?;
        let mut r = SmallReader::new(&payload);

        match op {
            OP_LOG_COPY => {
                let txn_id = r.read_u64_le()?;
                let active_index_id = r.read_u64_le()?;
                let buf_size = r.read_u16_le()? as usize;
                let stack = r.read_exact(buf_size)?;
                logs.push(RecoveredLog {
                    txn_id,
                    active_index_id,
                    entries: parse_stack(stack)?,
                    pages: Vec::new(),
                });
            }
            OP_LOG_REF => {
                let txn_id = r.read_u64_le()?;
                let active_index_id = r.read_u64_le()?;
                let length = r.read_u64_le()?;
                let node_id = r.read_u64_le()?;
                let _recorded_top = r.read_u16_le()? as usize;

                // read from the page's current top, not the recorded
                // one: a commit-truncate rewrites the top page with a
                // single marker, and that rewrite must win
                let chain = read_chain(page_store, node_id)?;
                let top = get_u16_le(&chain[0].1, OFF_TOP_OFFSET) as usize;
                let mut entries = Vec::new();
                let mut cr = RawChainReader::new(&chain, top, page_size);
                while (cr.consumed() as u64) < length && !cr.exhausted() {
                    let op = cr.read_u8()?;
                    let payload = if op_has_payload(op) {
                        let len = cr.read_varint()? as usize;
                        cr.read_bytes(len)?
                    } else {
                        Vec::new()
                    };
                    let stop = entries.is_empty()
                        && (op == OP_COMMIT || op == OP_COMMIT_TRUNCATE);
                    entries.push((op, payload));
                    if stop {
                        break;
                    }
                }
                logs.push(RecoveredLog {
                    txn_id,
                    active_index_id,
                    entries,
                    pages: chain.iter().map(|(id, _)| *id).collect(),
                });
            }
            other => {
                return Err(StoreError::corrupt(format!(
                    "unknown master undo opcode {}",
                    other
                )));
            }
        }
    }

    let master_page_ids = master_pages.iter().map(|(id, _)| *id).collect();
    info!(
        "master undo log {}: {} transaction logs recovered",
        master_id,
        logs.len()
    );
    Ok((logs, master_page_ids))
}

/// Apply the recovered logs: committed transactions are skipped, the
/// rest roll back newest-first, re-acquiring locks through `locks`.
/// `apply` receives (index id, opcode, payload) for every data record.
pub fn recover_transactions(
    logs: &[RecoveredLog],
    locks: &dyn RecoveryLockHandler,
    apply: &mut dyn FnMut(u64, u8, &[u8]) -> SmallResult,
) -> SmallResult {
    for log in logs {
        if log.committed() {
            debug!("txn {} already committed, skipping rollback", log.txn_id);
            continue;
        }
        warn!(
            "rolling back interrupted txn {} ({} undo entries)",
            log.txn_id,
            log.entries.len()
        );

        let mut active = log.active_index_id;
        for (op, payload) in &log.entries {
            match *op {
                super::undo_log::OP_INDEX => {
                    let mut r = SmallReader::new(payload);
                    active = r.read_varint()?;
                }
                super::undo_log::OP_UNINSERT
                | super::undo_log::OP_UNUPDATE
                | super::undo_log::OP_UNDELETE
                | super::undo_log::OP_UNDELETE_FRAGMENTED => {
                    let key = undo_record_key(*op, payload)?;
                    locks.lock_exclusive(active, key)?;
                    apply(active, *op, payload)?;
                }
                super::undo_log::OP_CUSTOM => {
                    apply(active, *op, payload)?;
                }
                // scope and commit markers carry no data effect
                _ => {}
            }
        }
    }
    Ok(())
}

/// The key bytes of a payload-bearing reverse operation.
pub fn undo_record_key(op: u8, payload: &[u8]) -> ResultOf<&[u8]> {
    match op {
        super::undo_log::OP_UNINSERT => Ok(payload),
        super::undo_log::OP_UNUPDATE
        | super::undo_log::OP_UNDELETE
        | super::undo_log::OP_UNDELETE_FRAGMENTED => {
            let mut r = SmallReader::new(payload);
            let key_len = r.read_varint()? as usize;
            r.read_exact(key_len)
        }
        _ => Err(StoreError::corrupt(format!(
            "opcode {} carries no key",
            op
        ))),
    }
}
