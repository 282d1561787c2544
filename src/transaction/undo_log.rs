//! Per-transaction append-only stack of reverse operations.
//!
//! A small log lives in a heap buffer laid out exactly like the page
//! form (the stack grows downward, newest entry first). Once a push
//! would exceed half a page the buffer is promoted into a chain of
//! unevictable undo pages linked through `lowerNodeId`. Entries may
//! straddle pages; a straddling push fills the older page down to the
//! header, so reads always resume at offset 12 in lower pages.

use log::debug;

use crate::{
    btree::{
        node::{Node, TYPE_UNDO_LOG},
        node_cache::NodeCache,
        page_store::PageStore,
    },
    error::StoreError,
    io::{get_u16_le, put_u16_le, put_u64_le, varint_len, SmallReader, SmallWriter},
    types::{Pod, ResultOf, SmallResult},
    utils::HandyRwLock,
};

// opcodes below 16 carry no payload
pub const OP_COMMIT: u8 = 1;
pub const OP_COMMIT_TRUNCATE: u8 = 2;
pub const OP_SCOPE_ENTER: u8 = 3;
pub const OP_SCOPE_COMMIT: u8 = 4;

// master undo record opcodes
pub const OP_LOG_COPY: u8 = 16;
pub const OP_LOG_REF: u8 = 17;

// payload-bearing reverse operations
pub const OP_INDEX: u8 = 18;
pub const OP_UNINSERT: u8 = 19;
pub const OP_UNUPDATE: u8 = 20;
pub const OP_UNDELETE: u8 = 21;
pub const OP_UNDELETE_FRAGMENTED: u8 = 22;
pub const OP_CUSTOM: u8 = 24;

/// Undo page header (little-endian multibyte fields).
pub const OFF_TOP_OFFSET: usize = 2;
pub const OFF_LOWER_NODE_ID: usize = 4;
pub const UNDO_HEADER_SIZE: usize = 12;

pub fn op_has_payload(op: u8) -> bool {
    op >= 16
}

pub struct UndoLog {
    txn_id: u64,
    active_index_id: u64,
    /// Total logical bytes in the stack; savepoints are lengths.
    length: u64,

    /// Buffered form, page-layout: the stack occupies
    /// `buffer[buffer_pos..]`.
    buffer: Vec<u8>,
    buffer_pos: usize,

    /// Spilled form: the page chain, oldest first; the last entry is the
    /// top. Empty while buffered.
    nodes: Vec<Pod<Node>>,
    top_offset: usize,
}

impl UndoLog {
    pub fn new(txn_id: u64) -> Self {
        Self {
            txn_id,
            active_index_id: 0,
            length: 0,
            buffer: Vec::new(),
            buffer_pos: 0,
            nodes: Vec::new(),
            top_offset: 0,
        }
    }

    pub fn txn_id(&self) -> u64 {
        self.txn_id
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_spilled(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn active_index_id(&self) -> u64 {
        self.active_index_id
    }

    /// Page ids of the spilled chain, oldest first.
    pub fn chain_page_ids(&self) -> Vec<u64> {
        self.nodes.iter().map(|n| n.rl().id).collect()
    }

    /// Push one reverse operation. An `INDEX` record carrying the
    /// previously active index id is emitted first whenever the index
    /// changes, so a rollback walking newest-to-oldest can restore the
    /// older id when it passes the marker.
    pub fn push(
        &mut self,
        cache: &NodeCache,
        index_id: u64,
        op: u8,
        payload: &[u8],
    ) -> SmallResult {
        if index_id != self.active_index_id {
            if self.active_index_id != 0 {
                let mut w = SmallWriter::new();
                w.write_varint(self.active_index_id);
                let marker = w.to_bytes();
                self.push_entry(cache, OP_INDEX, &marker)?;
            }
            self.active_index_id = index_id;
        }
        self.push_entry(cache, op, payload)
    }

    pub fn push_entry(&mut self, cache: &NodeCache, op: u8, payload: &[u8]) -> SmallResult {
        debug_assert!(op_has_payload(op) || payload.is_empty());

        let mut entry = Vec::with_capacity(1 + varint_len(payload.len() as u64) + payload.len());
        entry.push(op);
        if op_has_payload(op) {
            let mut w = SmallWriter::new();
            w.write_varint(payload.len() as u64);
            entry.extend_from_slice(&w.to_bytes());
            entry.extend_from_slice(payload);
        }

        if !self.is_spilled() {
            let page_size = cache.page_store().page_size();
            let stack_len = self.buffer.len() - self.buffer_pos;
            if stack_len + entry.len() <= page_size / 2 {
                self.buffered_push(&entry);
                self.length += entry.len() as u64;
                return Ok(());
            }
            self.promote(cache)?;
        }

        self.spilled_push(cache, &entry)?;
        self.length += entry.len() as u64;
        Ok(())
    }

    fn buffered_push(&mut self, entry: &[u8]) {
        if self.buffer_pos < entry.len() {
            let stack_len = self.buffer.len() - self.buffer_pos;
            let mut cap = std::cmp::max(64, self.buffer.len());
            while cap < stack_len + entry.len() {
                cap *= 2;
            }
            let mut grown = vec![0u8; cap];
            grown[cap - stack_len..].copy_from_slice(&self.buffer[self.buffer_pos..]);
            self.buffer = grown;
            self.buffer_pos = cap - stack_len;
        }
        let start = self.buffer_pos - entry.len();
        self.buffer[start..self.buffer_pos].copy_from_slice(entry);
        self.buffer_pos = start;
    }

    /// Move the buffered stack into the first undo page.
    fn promote(&mut self, cache: &NodeCache) -> SmallResult {
        let page_size = cache.page_store().page_size();
        let node = cache.alloc_undo_page()?;
        let stack = &self.buffer[self.buffer_pos..];
        let top = page_size - stack.len();
        {
            let mut g = node.wl();
            for b in g.page.iter_mut() {
                *b = 0;
            }
            g.page[0] = TYPE_UNDO_LOG;
            put_u64_le(&mut g.page, OFF_LOWER_NODE_ID, 0);
            g.page[top..].copy_from_slice(stack);
            put_u16_le(&mut g.page, OFF_TOP_OFFSET, top as u16);
            debug!("undo log of txn {} spilled to page {}", self.txn_id, g.id);
        }
        self.nodes.push(node);
        self.top_offset = top;
        self.buffer = Vec::new();
        self.buffer_pos = 0;
        Ok(())
    }

    /// Push into the page chain. An entry larger than the free space of
    /// the top page straddles: its tail fills the older page down to the
    /// header and its front continues in freshly allocated pages. When
    /// allocation fails mid-push, the partially written chain is
    /// reverted before the error propagates.
    fn spilled_push(&mut self, cache: &NodeCache, entry: &[u8]) -> SmallResult {
        let page_size = cache.page_store().page_size();
        let orig_top = self.top_offset;
        let orig_nodes = self.nodes.len();

        let mut rem = entry.len();
        loop {
            let avail = self.top_offset - UNDO_HEADER_SIZE;
            if avail >= rem {
                let top = self.nodes.last().unwrap().clone();
                let mut g = top.wl();
                let start = self.top_offset - rem;
                g.page[start..self.top_offset].copy_from_slice(&entry[..rem]);
                put_u16_le(&mut g.page, OFF_TOP_OFFSET, start as u16);
                drop(g);
                self.top_offset = start;
                return Ok(());
            }

            if avail > 0 {
                let top = self.nodes.last().unwrap().clone();
                let mut g = top.wl();
                g.page[UNDO_HEADER_SIZE..self.top_offset]
                    .copy_from_slice(&entry[rem - avail..rem]);
                put_u16_le(&mut g.page, OFF_TOP_OFFSET, UNDO_HEADER_SIZE as u16);
                drop(g);
                rem -= avail;
            }

            let lower_id = self.nodes.last().unwrap().rl().id;
            match cache.alloc_undo_page() {
                Ok(node) => {
                    {
                        let mut g = node.wl();
                        for b in g.page.iter_mut() {
                            *b = 0;
                        }
                        g.page[0] = TYPE_UNDO_LOG;
                        put_u64_le(&mut g.page, OFF_LOWER_NODE_ID, lower_id);
                    }
                    self.nodes.push(node);
                    self.top_offset = page_size;
                }
                Err(e) => {
                    self.revert_partial_push(cache, orig_nodes, orig_top);
                    return Err(e);
                }
            }
        }
    }

    fn revert_partial_push(&mut self, cache: &NodeCache, orig_nodes: usize, orig_top: usize) {
        for node in self.nodes.drain(orig_nodes..) {
            let id = node.rl().id;
            cache.page_store().unreserve_page(id);
            cache.release_pinned(&node);
        }
        self.top_offset = orig_top;
        if let Some(top) = self.nodes.last() {
            let mut g = top.wl();
            put_u16_le(&mut g.page, OFF_TOP_OFFSET, orig_top as u16);
        }
    }

    /// Decode the topmost entry without consuming it.
    fn peek_entry(&self, page_size: usize) -> ResultOf<(u8, Vec<u8>, usize)> {
        if !self.is_spilled() {
            let stack = &self.buffer[self.buffer_pos..];
            let mut r = SmallReader::new(stack);
            let op = r.read_u8()?;
            let payload = if op_has_payload(op) {
                let len = r.read_varint()? as usize;
                r.read_exact(len)?.to_vec()
            } else {
                Vec::new()
            };
            return Ok((op, payload, r.pos()));
        }

        let mut cursor = ChainCursor {
            nodes: &self.nodes,
            idx: self.nodes.len() - 1,
            off: self.top_offset,
            page_size,
        };
        let op = cursor.read_u8()?;
        let mut consumed = 1;
        let payload = if op_has_payload(op) {
            let (len, varint_bytes) = cursor.read_varint()?;
            consumed += varint_bytes + len as usize;
            cursor.read_bytes(len as usize)?
        } else {
            Vec::new()
        };
        Ok((op, payload, consumed))
    }

    /// Pop the topmost entry, applying it first. Fully consumed chain
    /// pages are deleted and their frames released. Returns the popped
    /// (op, size), or None when the log is empty.
    pub fn pop(
        &mut self,
        cache: &NodeCache,
        apply: &mut dyn FnMut(u8, &[u8]) -> SmallResult,
    ) -> ResultOf<Option<u8>> {
        if self.length == 0 {
            return Ok(None);
        }
        let page_size = cache.page_store().page_size();
        let (op, payload, size) = self.peek_entry(page_size)?;
        apply(op, &payload)?;

        if !self.is_spilled() {
            self.buffer_pos += size;
        } else {
            self.consume_spilled(cache, size)?;
        }
        self.length -= size as u64;
        Ok(Some(op))
    }

    fn consume_spilled(&mut self, cache: &NodeCache, size: usize) -> SmallResult {
        let page_size = cache.page_store().page_size();
        let mut remaining = size;
        loop {
            let avail = page_size - self.top_offset;
            if remaining < avail {
                self.top_offset += remaining;
                let mut g = self.nodes.last().unwrap().wl();
                put_u16_le(&mut g.page, OFF_TOP_OFFSET, self.top_offset as u16);
                return Ok(());
            }
            remaining -= avail;

            let node = self.nodes.pop().unwrap();
            {
                let g = node.rl();
                cache.page_store().delete_page(g.id);
            }
            cache.release_pinned(&node);

            match self.nodes.last() {
                Some(next) => {
                    let g = next.rl();
                    self.top_offset = get_u16_le(&g.page, OFF_TOP_OFFSET) as usize;
                }
                None => {
                    debug_assert_eq!(remaining, 0);
                    self.top_offset = 0;
                    self.buffer = Vec::new();
                    self.buffer_pos = 0;
                    return Ok(());
                }
            }
        }
    }

    // scopes

    pub fn scope_enter(&mut self, cache: &NodeCache) -> ResultOf<u64> {
        self.push_entry(cache, OP_SCOPE_ENTER, &[])?;
        Ok(self.length)
    }

    pub fn scope_commit(&mut self, cache: &NodeCache) -> ResultOf<u64> {
        self.push_entry(cache, OP_SCOPE_COMMIT, &[])?;
        Ok(self.length)
    }

    /// Pop and apply reverse operations until the stack shrinks to
    /// `savepoint`. Safe to repeat; a second call is a no-op.
    pub fn scope_rollback(
        &mut self,
        cache: &NodeCache,
        savepoint: u64,
        apply: &mut dyn FnMut(u8, &[u8]) -> SmallResult,
    ) -> SmallResult {
        while self.length > savepoint {
            if self.pop(cache, apply)?.is_none() {
                return Err(StoreError::ConstraintViolation(format!(
                    "undo log ended above savepoint {}",
                    savepoint
                )));
            }
        }
        Ok(())
    }

    /// Drop every entry. With `commit`, each chain page is rewritten to
    /// hold a single `COMMIT_TRUNCATE` marker before its id is released,
    /// so a crash mid-truncate recovers the transaction as committed.
    pub fn truncate(
        &mut self,
        cache: &NodeCache,
        page_store: &PageStore,
        commit: bool,
    ) -> SmallResult {
        let page_size = page_store.page_size();
        while let Some(node) = self.nodes.pop() {
            {
                let mut g = node.wl();
                if commit {
                    g.page[page_size - 1] = OP_COMMIT_TRUNCATE;
                    put_u16_le(&mut g.page, OFF_TOP_OFFSET, (page_size - 1) as u16);
                    page_store.write_reserved_page(g.id, &g.page)?;
                }
                page_store.delete_page(g.id);
            }
            cache.release_pinned(&node);
        }
        self.buffer = Vec::new();
        self.buffer_pos = 0;
        self.top_offset = 0;
        self.length = 0;
        Ok(())
    }

    /// Emit this log into the master undo log, as a serialized copy when
    /// still buffered or as a durable chain reference once spilled.
    /// Called under the exclusive commit lock.
    pub fn write_to_master(&self, cache: &NodeCache, master: &mut UndoLog) -> SmallResult {
        if self.length == 0 {
            return Ok(());
        }

        if !self.is_spilled() {
            let stack = &self.buffer[self.buffer_pos..];
            let mut w = SmallWriter::new();
            w.write_u64_le(self.txn_id);
            w.write_u64_le(self.active_index_id);
            w.write_u16_le(stack.len() as u16);
            w.write_bytes(stack);
            return master.push_entry(cache, OP_LOG_COPY, &w.to_bytes());
        }

        // the chain must be durable before the header references it
        for node in &self.nodes {
            let g = node.rl();
            cache.write_reserved_page(g.id, &g.page)?;
        }
        let top = self.nodes.last().unwrap().rl();
        let mut w = SmallWriter::new();
        w.write_u64_le(self.txn_id);
        w.write_u64_le(self.active_index_id);
        w.write_u64_le(self.length);
        w.write_u64_le(top.id);
        w.write_u16_le(self.top_offset as u16);
        master.push_entry(cache, OP_LOG_REF, &w.to_bytes())
    }

    /// Force the log into page form and write every page out. Returns
    /// the top page id. Used for the master log itself, which recovery
    /// must find on disk.
    pub fn force_spill(&mut self, cache: &NodeCache) -> ResultOf<u64> {
        if !self.is_spilled() {
            self.promote(cache)?;
        }
        for node in &self.nodes {
            let g = node.rl();
            cache.write_reserved_page(g.id, &g.page)?;
        }
        Ok(self.nodes.last().unwrap().rl().id)
    }

    /// Hand the chain's frames back to the cache without touching the
    /// pages on disk. Used once a master log has been written out; the
    /// pages stay durable, only the memory goes.
    pub fn release_frames(&mut self, cache: &NodeCache) {
        for node in self.nodes.drain(..) {
            cache.release_pinned(&node);
        }
        self.top_offset = 0;
        self.length = 0;
    }
}

/// Forward reader over a spilled chain, crossing from the top page into
/// older pages at offset 12.
struct ChainCursor<'a> {
    nodes: &'a [Pod<Node>],
    idx: usize,
    off: usize,
    page_size: usize,
}

impl<'a> ChainCursor<'a> {
    fn read_u8(&mut self) -> ResultOf<u8> {
        if self.off == self.page_size {
            if self.idx == 0 {
                return Err(StoreError::corrupt("undo entry runs off the chain"));
            }
            self.idx -= 1;
            self.off = UNDO_HEADER_SIZE;
        }
        let g = self.nodes[self.idx].rl();
        let b = g.page[self.off];
        self.off += 1;
        Ok(b)
    }

    fn read_varint(&mut self) -> ResultOf<(u64, usize)> {
        let mut v: u64 = 0;
        let mut shift = 0;
        let mut bytes = 0;
        loop {
            let b = self.read_u8()?;
            bytes += 1;
            v |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok((v, bytes));
            }
            shift += 7;
            if shift >= 64 {
                return Err(StoreError::corrupt("varint too long in undo entry"));
            }
        }
    }

    fn read_bytes(&mut self, n: usize) -> ResultOf<Vec<u8>> {
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            if self.off == self.page_size {
                if self.idx == 0 {
                    return Err(StoreError::corrupt("undo entry runs off the chain"));
                }
                self.idx -= 1;
                self.off = UNDO_HEADER_SIZE;
            }
            let g = self.nodes[self.idx].rl();
            let take = std::cmp::min(n - out.len(), self.page_size - self.off);
            out.extend_from_slice(&g.page[self.off..self.off + take]);
            self.off += take;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::page_store::PageStore;
    use std::sync::Arc;

    fn test_cache() -> (tempfile::TempDir, NodeCache) {
        let dir = tempfile::tempdir().unwrap();
        let page_store =
            Arc::new(PageStore::open(dir.path().join("pages.db"), 512).unwrap());
        (dir, NodeCache::new(page_store, 1, 64))
    }

    fn pop_all(log: &mut UndoLog, cache: &NodeCache) -> Vec<(u8, Vec<u8>)> {
        let mut out = Vec::new();
        loop {
            let mut seen: Option<(u8, Vec<u8>)> = None;
            let popped = log
                .pop(cache, &mut |op, payload| {
                    seen = Some((op, payload.to_vec()));
                    Ok(())
                })
                .unwrap();
            match popped {
                Some(_) => out.push(seen.unwrap()),
                None => return out,
            }
        }
    }

    #[test]
    fn test_lifo_order_buffered() {
        let (_dir, cache) = test_cache();
        let mut log = UndoLog::new(7);

        log.push(&cache, 1, OP_UNINSERT, b"alpha").unwrap();
        log.push(&cache, 1, OP_UNDELETE, b"beta").unwrap();
        log.push(&cache, 1, OP_UNUPDATE, b"gamma").unwrap();
        assert!(!log.is_spilled());

        let popped = pop_all(&mut log, &cache);
        assert_eq!(
            popped,
            vec![
                (OP_UNUPDATE, b"gamma".to_vec()),
                (OP_UNDELETE, b"beta".to_vec()),
                (OP_UNINSERT, b"alpha".to_vec()),
            ]
        );
        assert_eq!(log.length(), 0);
    }

    #[test]
    fn test_lifo_order_across_page_spill() {
        let (_dir, cache) = test_cache();
        let mut log = UndoLog::new(9);

        // payloads bigger than half a 512-byte page force the spill and
        // page straddling
        let mut pushed = Vec::new();
        for i in 0..20u8 {
            let payload = vec![i; 90];
            log.push(&cache, 1, OP_UNDELETE, &payload).unwrap();
            pushed.push((OP_UNDELETE, payload));
        }
        assert!(log.is_spilled());
        assert!(log.chain_page_ids().len() > 1);

        pushed.reverse();
        let popped = pop_all(&mut log, &cache);
        assert_eq!(popped, pushed);
        assert!(!log.is_spilled());
    }

    #[test]
    fn test_entry_larger_than_a_page() {
        let (_dir, cache) = test_cache();
        let mut log = UndoLog::new(3);

        let big = (0..1300u32).map(|i| (i % 250) as u8).collect::<Vec<_>>();
        log.push(&cache, 1, OP_UNDELETE, &big).unwrap();
        assert!(log.is_spilled());
        assert!(log.chain_page_ids().len() >= 3);

        let popped = pop_all(&mut log, &cache);
        assert_eq!(popped, vec![(OP_UNDELETE, big)]);
    }

    #[test]
    fn test_index_marker_emitted_on_change() {
        let (_dir, cache) = test_cache();
        let mut log = UndoLog::new(5);

        log.push(&cache, 1, OP_UNINSERT, b"k1").unwrap();
        log.push(&cache, 2, OP_UNINSERT, b"k2").unwrap();

        let popped = pop_all(&mut log, &cache);
        // newest first: the k2 op, then the marker restoring index 1,
        // then the k1 op
        assert_eq!(popped[0], (OP_UNINSERT, b"k2".to_vec()));
        assert_eq!(popped[1].0, OP_INDEX);
        assert_eq!(popped[1].1, vec![1u8]);
        assert_eq!(popped[2], (OP_UNINSERT, b"k1".to_vec()));
    }

    #[test]
    fn test_scope_rollback_is_idempotent() {
        let (_dir, cache) = test_cache();
        let mut log = UndoLog::new(11);

        log.push(&cache, 1, OP_UNINSERT, b"a").unwrap();
        let sp = log.scope_enter(&cache).unwrap();
        log.push(&cache, 1, OP_UNINSERT, b"b").unwrap();
        log.push(&cache, 1, OP_UNINSERT, b"c").unwrap();

        let applied = std::cell::RefCell::new(Vec::new());
        let mut apply = |op: u8, payload: &[u8]| {
            applied.borrow_mut().push((op, payload.to_vec()));
            Ok(())
        };
        log.scope_rollback(&cache, sp, &mut apply).unwrap();
        assert_eq!(log.length(), sp);
        assert_eq!(applied.borrow().len(), 2);

        // a second rollback to the same savepoint pops nothing
        log.scope_rollback(&cache, sp, &mut apply).unwrap();
        assert_eq!(applied.borrow().len(), 2);
    }

    #[test]
    fn test_truncate_releases_chain() {
        let (_dir, cache) = test_cache();
        let page_store = cache.page_store();
        let mut log = UndoLog::new(13);

        for i in 0..30u8 {
            log.push(&cache, 1, OP_UNDELETE, &vec![i; 60]).unwrap();
        }
        assert!(log.is_spilled());

        log.truncate(&cache, page_store, false).unwrap();
        assert_eq!(log.length(), 0);
        assert!(!log.is_spilled());
    }
}
