//! The commit coordinator: produce a consistent snapshot of the tree
//! without stopping the world, flush it, and install the new root
//! atomically through the page store's dual header slots.
//!
//! The heart of the protocol is the generation flip. Mutations hold the
//! shared commit lock and tag what they dirty with the current
//! generation; the coordinator takes the lock exclusively, flips the
//! generation, and from that instant every node still tagged with the
//! old generation belongs to the snapshot. Mutations that race with the
//! flush re-dirty nodes under the new tag and write the old content out
//! themselves (`mark_dirty`), so the snapshot on disk stays complete.

use std::collections::VecDeque;

use log::{debug, info};

use crate::{
    io::SmallWriter,
    types::{Pod, ResultOf},
    utils::HandyRwLock,
};

use super::{
    node::{CachedState, Node},
    node_cache::NodeCache,
};

/// Version tag of the commit header layout.
pub const ENCODING_VERSION: u32 = 20110514;

/// Commit header: `[version u32 BE][rootId u64 BE]`, plus a trailing
/// `[masterUndoLogId u64 BE]` when live transactions had undo state at
/// flip time.
pub fn encode_commit_header(root_id: u64, master_id: Option<u64>) -> Vec<u8> {
    let mut w = SmallWriter::new();
    w.write_u32_be(ENCODING_VERSION);
    w.write_u64_be(root_id);
    if let Some(id) = master_id {
        w.write_u64_be(id);
    }
    w.to_bytes()
}

pub struct ParsedHeader {
    pub version: u32,
    pub root_id: u64,
    pub master_id: Option<u64>,
}

pub fn decode_commit_header(extra: &[u8]) -> ResultOf<Option<ParsedHeader>> {
    if extra.is_empty() {
        return Ok(None);
    }
    let mut r = crate::io::SmallReader::new(extra);
    let version = r.read_u32_be()?;
    if version != ENCODING_VERSION {
        return Err(crate::error::StoreError::corrupt(format!(
            "unknown commit header encoding version {}",
            version
        )));
    }
    let root_id = r.read_u64_be()?;
    let master_id = if r.remaining() >= 8 {
        Some(r.read_u64_be()?)
    } else {
        None
    };
    Ok(Some(ParsedHeader {
        version,
        root_id,
        master_id,
    }))
}

/// Run one commit. `prepare_master` runs under the exclusive commit
/// lock, right after the generation flip; it captures live undo logs
/// into a master log and returns its top page id (None when no
/// transaction has undo state). Returns false when the tree had nothing
/// to commit.
pub fn commit(
    cache: &NodeCache,
    prepare_master: &mut dyn FnMut() -> ResultOf<Option<u64>>,
) -> ResultOf<bool> {
    let page_store = cache.page_store();

    // cheap pre-check under the shared root latch
    {
        let root = cache.root();
        let g = root.rl();
        if g.cached_state == CachedState::Clean {
            return Ok(false);
        }
    }

    let excl = page_store.exclusive_commit_lock();
    let root_pod = cache.root();
    let root_guard = root_pod.wl();
    if root_guard.cached_state == CachedState::Clean {
        return Ok(false);
    }

    page_store.commit(excl, |excl_guard| {
        // (a) flip: from here on, mutations dirty under the new tag
        let state_to_flush = cache.flip_commit_state();
        page_store.seal_delete_epoch();
        let root_id = root_guard.id;
        debug!(
            "commit started: flushing {:?}, root id {}",
            state_to_flush, root_id
        );

        // capture undo state while mutations are still held off
        let master_id = prepare_master()?;

        // (b) mutations resume; they tag the new generation
        drop(root_guard);
        drop(excl_guard);

        // (c) collect the snapshot's nodes
        let dirty = collect_dirty(cache, state_to_flush)?;
        debug!("commit: {} dirty nodes collected", dirty.len());

        // (d) flush each one, transitioning to clean under its latch
        let mut flushed = 0;
        for pod in dirty {
            let mut g = pod.wl();
            if g.cached_state != state_to_flush {
                // re-dirtied during the flush; the next commit owns it
                continue;
            }
            g.cached_state = CachedState::Clean;
            page_store.write_reserved_page(g.id, &g.page)?;
            flushed += 1;
        }

        info!(
            "commit: {} nodes flushed, root {}, master undo {:?}",
            flushed, root_id, master_id
        );
        // (e) the header the page store installs atomically
        Ok(encode_commit_header(root_id, master_id))
    })?;
    Ok(true)
}

/// Breadth-first sweep over the cached tree. A child joins the dirty
/// list only while its parent still points at the same page id and its
/// state matches the flushing generation; the parent's shared latch is
/// held across the check so a concurrent reload cannot swap identities.
fn collect_dirty(cache: &NodeCache, state_to_flush: CachedState) -> ResultOf<Vec<Pod<Node>>> {
    let mut list = Vec::new();
    let mut queue: VecDeque<Pod<Node>> = VecDeque::new();
    queue.push_back(cache.root());

    while let Some(pod) = queue.pop_front() {
        let g = pod.rl();
        if g.cached_state == state_to_flush {
            list.push(pod.clone());
        }
        if g.is_leaf() {
            continue;
        }
        // walk through re-dirtied nodes too: a node tagged with the new
        // generation can still hold children that belong to the
        // flushing snapshot
        for idx in 0..g.child_count() {
            if let Some(child) = &g.child_frames[idx] {
                let cg = child.rl();
                if cg.id == g.child_id(idx) {
                    queue.push_back(child.clone());
                }
            }
        }
    }
    Ok(list)
}
