//! Tree-level operations: lookup descent, mutation descent with latch
//! crabbing, split propagation, and the page reachability scan used to
//! rebuild the free list on open.
//!
//! A mutation descends holding write latches, marking each node dirty on
//! the way down (which is what keeps the parent-dirty invariant). The
//! ancestor chain is released as soon as the node below it can absorb
//! the worst outcome of the operation; otherwise it stays latched and a
//! split propagates back up through the `ParentOp` closures.

use std::sync::{Arc, RwLockWriteGuard};

use bit_vec::BitVec;
use log::debug;

use crate::{
    error::StoreError,
    types::{Pod, ResultOf, SmallResult},
    utils::HandyRwLock,
};

use super::{
    fragment,
    node::{
        internal_entry_len, leaf_entry_len, CachedState, Node, ValuePayload, CHILD_ID_SIZE,
        HEADER_SIZE, TYPE_INTERNAL, TYPE_LEAF,
    },
    node_cache::NodeCache,
    page_store::PageStore,
    split::{
        adopt_child_split, finish_split_root, max_entry_size, max_key_size, split_internal,
        split_leaf, unpin_root_children,
    },
};

/// Reverse-operation notifications a mutation emits before touching the
/// leaf. The store wires these into the transaction's undo log; the
/// bogus transaction discards them (and frees displaced fragment
/// chains).
pub enum LeafUndo<'a> {
    Uninsert { key: &'a [u8] },
    Unupdate { key: &'a [u8], value: &'a [u8] },
    Undelete { key: &'a [u8], value: &'a [u8] },
    UndeleteFragmented { key: &'a [u8], descriptor: &'a [u8] },
}

pub type UndoSink<'s> = &'s mut dyn FnMut(LeafUndo<'_>) -> SmallResult;

/// What a child hands back up to its latched ancestor chain.
enum ParentOp<'a> {
    /// The subtree below can absorb the operation; ancestors may unlatch.
    Release,
    /// The node split; the parent must adopt the split key (splitting
    /// itself first if it has to).
    ChildSplit(&'a mut Node),
}

type ParentFn<'f> = &'f mut dyn for<'x> FnMut(ParentOp<'x>) -> SmallResult;

/// Funnel that checks a closure against the higher-ranked callback
/// signature the descent passes down.
fn parent_fn<F>(f: F) -> F
where
    F: for<'x> FnMut(ParentOp<'x>) -> SmallResult,
{
    f
}

pub struct BTree {
    cache: Arc<NodeCache>,
}

impl BTree {
    pub fn new(cache: Arc<NodeCache>) -> Self {
        Self { cache }
    }

    fn page_store(&self) -> &PageStore {
        self.cache.page_store()
    }

    // lookup

    pub fn load(&self, key: &[u8]) -> ResultOf<Option<Vec<u8>>> {
        'restart: loop {
            let mut current = self.cache.root();
            let mut expected_id: Option<u64> = None;

            loop {
                let step = {
                    let guard = current.rl();
                    if let Some(expect) = expected_id {
                        if guard.id != expect {
                            // the frame was recycled underneath us
                            continue 'restart;
                        }
                    }

                    if let Some(split) = &guard.split {
                        // a split caught mid-propagation: steer to the
                        // proper half
                        if split.key_goes_to_sibling(key) {
                            let sibling = split.sibling.clone();
                            let sib_id = sibling.rl().id;
                            Step::Descend(sibling, sib_id)
                        } else {
                            self.lookup_step(&guard, key, &current, expected_id)?
                        }
                    } else {
                        self.lookup_step(&guard, key, &current, expected_id)?
                    }
                };

                match step {
                    Step::Done(v) => return Ok(v),
                    Step::Descend(child, child_id) => {
                        self.cache.used(&child);
                        current = child;
                        expected_id = Some(child_id);
                    }
                    Step::Miss(parent, parent_expect, child_id, idx) => {
                        match self.load_child(&parent, parent_expect, child_id, idx)? {
                            Some(child) => {
                                current = child;
                                expected_id = Some(child_id);
                            }
                            None => continue 'restart,
                        }
                    }
                }
            }
        }
    }

    fn lookup_step(
        &self,
        guard: &Node,
        key: &[u8],
        current: &Pod<Node>,
        expected_id: Option<u64>,
    ) -> ResultOf<Step> {
        if guard.is_leaf() {
            let pos = guard.binary_search(key)?;
            if pos < 0 {
                return Ok(Step::Done(None));
            }
            let e = guard.leaf_entry_at(pos as usize / 2)?;
            let bytes = &guard.page[e.value_start..e.value_start + e.value_len];
            if e.fragmented {
                return Ok(Step::Done(Some(fragment::read_chain(
                    self.page_store(),
                    bytes,
                )?)));
            }
            return Ok(Step::Done(Some(bytes.to_vec())));
        }

        let idx = guard.child_index_for(key)?;
        let child_id = guard.child_id(idx);
        if child_id <= 1 {
            return Err(StoreError::corrupt(format!(
                "node {} has child id {}",
                guard.id, child_id
            )));
        }

        match &guard.child_frames[idx] {
            Some(child) => Ok(Step::Descend(child.clone(), child_id)),
            None => Ok(Step::Miss(current.clone(), expected_id, child_id, idx)),
        }
    }

    /// Resolve a cache miss on the lookup path: upgrade the parent to a
    /// write latch, re-validate, install a fresh frame, release the
    /// parent and read the page. Returns None when the parent moved and
    /// the descent must restart.
    fn load_child(
        &self,
        parent: &Pod<Node>,
        parent_expect: Option<u64>,
        child_id: u64,
        idx: usize,
    ) -> ResultOf<Option<Pod<Node>>> {
        let mut pguard = parent.wl();
        if let Some(expect) = parent_expect {
            if pguard.id != expect {
                return Ok(None);
            }
        }
        // the child pointer may have changed while the latch was dropped
        if pguard.is_leaf() || idx >= pguard.child_count() || pguard.child_id(idx) != child_id
        {
            return Ok(None);
        }
        if let Some(child) = &pguard.child_frames[idx] {
            // someone else resolved the miss first
            let child = child.clone();
            if child.rl().id == child_id {
                return Ok(Some(child));
            }
        }

        let child = self.cache.alloc_latched_node()?;
        let mut cguard = child.wl();
        cguard.id = child_id;
        pguard.child_frames[idx] = Some(child.clone());
        drop(pguard);

        if let Err(e) = self.read_into(&mut cguard, child_id) {
            cguard.recycle();
            drop(cguard);
            self.cache.insert_lru(&child);
            return Err(e);
        }
        drop(cguard);
        self.cache.insert_lru(&child);
        Ok(Some(child))
    }

    fn read_into(&self, node: &mut Node, id: u64) -> SmallResult {
        self.cache.read_page(id, &mut node.page)?;
        node.check_loaded()
    }

    // mutation

    /// Store, overwrite or delete (`value` None) one entry. Emits undo
    /// notifications through `sink` before the leaf is touched. The
    /// caller holds the shared commit lock.
    pub fn store_op(&self, key: &[u8], value: Option<&[u8]>, sink: UndoSink<'_>) -> SmallResult {
        let page_size = self.page_store().page_size();

        // values that cannot live inside a node entry spill out-of-line
        // before the descent begins
        let mut fragmented: Option<[u8; fragment::DESCRIPTOR_LEN]> = None;
        if let Some(v) = value {
            let inline_len = leaf_entry_len(key.len(), &ValuePayload::Inline(v));
            if v.len() > super::node::MAX_VALUE_INLINE || inline_len > max_entry_size(page_size)
            {
                fragmented = Some(fragment::write_chain(self.page_store(), v)?);
            }
        }

        let payload = match (&value, &fragmented) {
            (None, _) => None,
            (Some(_), Some(desc)) => Some(ValuePayload::Fragment(&desc[..])),
            (Some(v), None) => Some(ValuePayload::Inline(v)),
        };
        let result = self.store_payload(key, payload, sink);

        if result.is_err() {
            // the chain was never linked into the tree
            if let Some(desc) = fragmented {
                let _ = fragment::delete_chain(self.page_store(), &desc);
            }
        }
        result
    }

    /// Re-link a pre-existing fragment descriptor under `key` (rollback
    /// of a fragmented-value delete). The chain itself is untouched.
    pub fn store_descriptor(&self, key: &[u8], descriptor: &[u8], sink: UndoSink<'_>) -> SmallResult {
        self.store_payload(key, Some(ValuePayload::Fragment(descriptor)), sink)
    }

    fn store_payload(
        &self,
        key: &[u8],
        payload: Option<ValuePayload<'_>>,
        sink: UndoSink<'_>,
    ) -> SmallResult {
        let page_size = self.page_store().page_size();
        if key.is_empty() || key.len() > max_key_size(page_size) {
            return Err(StoreError::ConstraintViolation(format!(
                "key of {} bytes outside the accepted 1..={} range",
                key.len(),
                max_key_size(page_size)
            )));
        }

        let root_pod = self.cache.root();
        let mut guard = root_pod.wl();
        self.cache.mark_dirty(&mut guard)?;
        let cache = self.cache.clone();
        let mut root_ctx = parent_fn(|op| match op {
            ParentOp::Release => Ok(()),
            ParentOp::ChildSplit(root) => finish_split_root(&cache, root),
        });
        self.store_descend(guard, key, payload.as_ref(), sink, &mut root_ctx)
    }

    fn store_descend(
        &self,
        mut guard: RwLockWriteGuard<'_, Node>,
        key: &[u8],
        value: Option<&ValuePayload<'_>>,
        sink: UndoSink<'_>,
        on_parent: ParentFn<'_>,
    ) -> SmallResult {
        if guard.is_leaf() {
            return self.store_into_leaf(guard, key, value, sink, on_parent);
        }

        let idx = guard.child_index_for(key)?;
        let child_id = guard.child_id(idx);
        if child_id <= 1 {
            return Err(StoreError::corrupt(format!(
                "node {} has child id {}",
                guard.id, child_id
            )));
        }

        // resolve the child under our write latch
        let child_pod = self.mutation_child(&mut guard, idx, child_id)?;
        let mut cguard = child_pod.wl();
        if cguard.id != child_id {
            // the frame was recycled between lookup and latch; drop the
            // stale reference and redo this level
            drop(cguard);
            guard.child_frames[idx] = None;
            return self.store_descend(guard, key, value, sink, on_parent);
        }

        // copy-on-write: the child gets a fresh id, and we re-point at it
        if self.cache.mark_dirty(&mut cguard)? {
            guard.set_child_id(idx, cguard.id);
        }

        // this node can top the latched chain when it could absorb a
        // split of the child outright
        let worst_adoption = internal_entry_len(max_key_size(guard.page_size()));
        let safe = guard.free_left() + guard.free_right() + guard.get_garbage()
            >= worst_adoption + CHILD_ID_SIZE + 2 + 1;
        if safe {
            on_parent(ParentOp::Release)?;
        }

        let mut my_guard = Some(guard);
        let cache = self.cache.clone();
        let mut ctx = parent_fn(|op| {
            match op {
                ParentOp::Release => {
                    if !safe {
                        on_parent(ParentOp::Release)?;
                    }
                    my_guard.take();
                    Ok(())
                }
                ParentOp::ChildSplit(child) => {
                    let me = my_guard.as_mut().ok_or_else(|| {
                        StoreError::ConstraintViolation(
                            "parent released before split adoption".to_string(),
                        )
                    })?;
                    if safe {
                        // a safe node adopts without splitting, so the
                        // released ancestors are never needed
                        self.adopt_into(&cache, me, child, &mut |op| match op {
                            ParentOp::Release => Ok(()),
                            ParentOp::ChildSplit(_) => Err(StoreError::ConstraintViolation(
                                "safe node split during adoption".to_string(),
                            )),
                        })
                    } else {
                        self.adopt_into(&cache, me, child, on_parent)
                    }
                }
            }
        });
        self.store_descend(cguard, key, value, sink, &mut ctx)
    }

    /// Get or load the child frame for a mutation; the parent write
    /// latch is held throughout, so installation cannot race.
    fn mutation_child(
        &self,
        guard: &mut RwLockWriteGuard<'_, Node>,
        idx: usize,
        child_id: u64,
    ) -> ResultOf<Pod<Node>> {
        if let Some(child) = &guard.child_frames[idx] {
            let child = child.clone();
            if child.rl().id == child_id {
                self.cache.used(&child);
                return Ok(child);
            }
        }

        let child = self.cache.alloc_latched_node()?;
        {
            let mut cguard = child.wl();
            cguard.id = child_id;
            if let Err(e) = self.read_into(&mut cguard, child_id) {
                cguard.recycle();
                drop(cguard);
                self.cache.insert_lru(&child);
                return Err(e);
            }
        }
        guard.child_frames[idx] = Some(child.clone());
        self.cache.insert_lru(&child);
        Ok(child)
    }

    /// Adopt `child`'s split into `me`, compacting or splitting `me`
    /// when it lacks room. `me`'s own split (if one happens) propagates
    /// through `on_parent` before the adoption is retried against the
    /// correct half.
    fn adopt_into(
        &self,
        cache: &NodeCache,
        me: &mut Node,
        child: &mut Node,
        on_parent: &mut dyn for<'x> FnMut(ParentOp<'x>) -> SmallResult,
    ) -> SmallResult {
        let split_key_len = child
            .split
            .as_ref()
            .map(|s| s.split_key.len())
            .ok_or_else(|| {
                StoreError::ConstraintViolation("adoption without a split".to_string())
            })?;
        let needed = internal_entry_len(split_key_len);

        loop {
            if adopt_child_split(me, child)? {
                return Ok(());
            }
            if me.compact_fits(needed, CHILD_ID_SIZE + 2)? {
                let mut spare = cache.spare_pool.take()?;
                me.compact(&mut spare, needed + CHILD_ID_SIZE + 2)?;
                continue;
            }

            // split myself, push my split upward, then adopt into the
            // correct half
            split_internal(cache, me)?;
            on_parent(ParentOp::ChildSplit(me))?;

            let my_split = match me.split.take() {
                Some(s) => s,
                None => {
                    // the root coordinator consumed the split: `me` is
                    // now the promoted root and the halves hang below it
                    let child_key = child.split.as_ref().unwrap().split_key.clone();
                    let idx = me.child_index_for(&child_key)?;
                    let target = me.child_frames[idx].clone().ok_or_else(|| {
                        StoreError::ConstraintViolation(
                            "fresh root child has no frame".to_string(),
                        )
                    })?;
                    {
                        let mut tg = target.wl();
                        self.adopt_with_compaction(cache, &mut tg, child, needed)?;
                    }
                    unpin_root_children(cache, me);
                    return Ok(());
                }
            };

            let goes_sibling =
                my_split.key_goes_to_sibling(&child.split.as_ref().unwrap().split_key);
            if goes_sibling {
                let sib_pod = my_split.sibling.clone();
                let mut sg = sib_pod.wl();
                self.adopt_with_compaction(cache, &mut sg, child, needed)?;
                sg.unevictable = false;
                drop(sg);
                cache.insert_lru(&sib_pod);
                return Ok(());
            }

            // unpin the sibling; the adoption retries against me
            {
                let mut sg = my_split.sibling.wl();
                sg.unevictable = false;
            }
            cache.insert_lru(&my_split.sibling);
        }
    }

    /// Adoption that may compact but never split: the target is a fresh
    /// split half, sized so the key must fit once the space is
    /// contiguous.
    fn adopt_with_compaction(
        &self,
        cache: &NodeCache,
        target: &mut Node,
        child: &Node,
        needed: usize,
    ) -> SmallResult {
        loop {
            if adopt_child_split(target, child)? {
                return Ok(());
            }
            if !target.compact_fits(needed, CHILD_ID_SIZE + 2)? {
                return Err(StoreError::ConstraintViolation(
                    "fresh split half cannot absorb the pending adoption".to_string(),
                ));
            }
            let mut spare = cache.spare_pool.take()?;
            target.compact(&mut spare, needed + CHILD_ID_SIZE + 2)?;
        }
    }

    fn store_into_leaf(
        &self,
        mut guard: RwLockWriteGuard<'_, Node>,
        key: &[u8],
        value: Option<&ValuePayload<'_>>,
        sink: UndoSink<'_>,
        on_parent: ParentFn<'_>,
    ) -> SmallResult {
        let pos = guard.binary_search(key)?;

        match (pos >= 0, value) {
            (false, None) => {
                // deleting a missing key
                on_parent(ParentOp::Release)
            }
            (true, None) => {
                let i = pos as usize / 2;
                self.emit_replace_undo(&guard, i, key, sink, true)?;
                guard.delete_entry(i)?;
                on_parent(ParentOp::Release)
            }
            (true, Some(payload)) => {
                let i = pos as usize / 2;
                self.emit_replace_undo(&guard, i, key, sink, false)?;
                if guard.update_leaf_entry(i, key, payload)? {
                    return on_parent(ParentOp::Release);
                }
                let entry_len = leaf_entry_len(key.len(), payload);
                if guard.compact_fits(entry_len, 0)? {
                    let mut spare = self.cache.spare_pool.take()?;
                    guard.compact(&mut spare, entry_len)?;
                    if guard.update_leaf_entry(i, key, payload)? {
                        return on_parent(ParentOp::Release);
                    }
                }
                // no room even compacted: replace = delete + insert
                guard.delete_entry(i)?;
                let pos = guard.binary_search(key)?;
                debug_assert!(pos < 0);
                self.insert_with_split(guard, !pos as usize, key, payload, on_parent)
            }
            (false, Some(payload)) => {
                sink(LeafUndo::Uninsert { key })?;
                self.insert_with_split(guard, !pos as usize, key, payload, on_parent)
            }
        }
    }

    /// Undo bookkeeping for overwriting or deleting slot `i`.
    fn emit_replace_undo(
        &self,
        guard: &RwLockWriteGuard<'_, Node>,
        i: usize,
        key: &[u8],
        sink: UndoSink<'_>,
        is_delete: bool,
    ) -> SmallResult {
        let e = guard.leaf_entry_at(i)?;
        let old = guard.page[e.value_start..e.value_start + e.value_len].to_vec();
        if e.fragmented {
            sink(LeafUndo::UndeleteFragmented {
                key,
                descriptor: &old,
            })?;
            if !is_delete {
                // rollback must first remove the replacement value
                sink(LeafUndo::Uninsert { key })?;
            }
        } else if is_delete {
            sink(LeafUndo::Undelete { key, value: &old })?;
        } else {
            sink(LeafUndo::Unupdate { key, value: &old })?;
        }
        Ok(())
    }

    /// Insert at position `pos`, compacting and finally splitting when
    /// the node is out of room.
    fn insert_with_split(
        &self,
        mut guard: RwLockWriteGuard<'_, Node>,
        pos: usize,
        key: &[u8],
        payload: &ValuePayload<'_>,
        on_parent: ParentFn<'_>,
    ) -> SmallResult {
        if guard.insert_leaf_entry(pos, key, payload)? {
            return on_parent(ParentOp::Release);
        }
        let entry_len = leaf_entry_len(key.len(), payload);
        if guard.compact_fits(entry_len, 2)? {
            let mut spare = self.cache.spare_pool.take()?;
            guard.compact(&mut spare, entry_len + 2)?;
            let pos = guard.binary_search(key)?;
            debug_assert!(pos < 0);
            if guard.insert_leaf_entry(!pos as usize, key, payload)? {
                return on_parent(ParentOp::Release);
            }
            return Err(StoreError::ConstraintViolation(
                "entry does not fit after compaction".to_string(),
            ));
        }

        // split, place the entry into the proper half, then let the
        // parent chain adopt the split
        split_leaf(&self.cache, &mut guard, pos, key, entry_len)?;
        {
            let split = guard.split.as_ref().unwrap();
            if split.key_goes_to_sibling(key) {
                let sibling = split.sibling.clone();
                let mut sg = sibling.wl();
                let spos = sg.binary_search(key)?;
                if spos >= 0 || !sg.insert_leaf_entry(!spos as usize, key, payload)? {
                    return Err(StoreError::ConstraintViolation(
                        "entry does not fit in the fresh split half".to_string(),
                    ));
                }
            } else {
                let spos = guard.binary_search(key)?;
                debug_assert!(spos < 0);
                if !guard.insert_leaf_entry(!spos as usize, key, payload)? {
                    let mut spare = self.cache.spare_pool.take()?;
                    guard.compact(&mut spare, entry_len + 2)?;
                    let spos = guard.binary_search(key)?;
                    if !guard.insert_leaf_entry(!spos as usize, key, payload)? {
                        return Err(StoreError::ConstraintViolation(
                            "entry does not fit in its split half".to_string(),
                        ));
                    }
                }
            }
        }

        on_parent(ParentOp::ChildSplit(&mut *guard))?;
        match guard.split.take() {
            Some(split) => {
                let mut sg = split.sibling.wl();
                sg.unevictable = false;
                drop(sg);
                self.cache.insert_lru(&split.sibling);
            }
            None => {
                // consumed by a root promote
                unpin_root_children(&self.cache, &*guard);
            }
        }
        on_parent(ParentOp::Release)
    }

    // recovery support

    /// Mark every page reachable from the tree root: nodes plus the
    /// fragment chains referenced by leaf entries.
    pub fn scan_reachable(
        page_store: &PageStore,
        root_id: u64,
        mark: &mut BitVec,
    ) -> SmallResult {
        if root_id == 0 {
            return Ok(());
        }
        let page_size = page_store.page_size();
        let mut stack = vec![root_id];
        let mut page = vec![0u8; page_size];

        while let Some(id) = stack.pop() {
            mark_page(mark, id)?;
            page_store.read_page(id, &mut page)?;

            match page[0] {
                TYPE_LEAF => {
                    for loc in probe_slots(&page)? {
                        let e = super::node::decode_leaf_entry(&page, loc)?;
                        if e.fragmented {
                            let desc = &page[e.value_start..e.value_start + e.value_len];
                            for fid in fragment::chain_pages(page_store, desc)? {
                                mark_page(mark, fid)?;
                            }
                        }
                    }
                }
                TYPE_INTERNAL => {
                    let ve =
                        crate::io::get_u16_le(&page, super::node::OFF_SEARCH_VEC_END) as usize;
                    let vs = crate::io::get_u16_le(&page, super::node::OFF_SEARCH_VEC_START)
                        as usize;
                    let children = (ve + 2 - vs) / 2 + 1;
                    let start = ve + 2;
                    for i in 0..children {
                        stack.push(crate::io::get_u64_le(&page, start + i * CHILD_ID_SIZE));
                    }
                }
                t => {
                    return Err(StoreError::corrupt(format!(
                        "page {}: unexpected node type {} in tree scan",
                        id, t
                    )));
                }
            }
        }
        debug!("tree scan finished from root {}", root_id);
        Ok(())
    }

    /// Check the structural invariants of every reachable node in the
    /// live tree: cached nodes through their frames, evicted ones
    /// straight from disk.
    pub fn verify(&self) -> SmallResult {
        let root = self.cache.root();
        let guard = root.rl();
        self.verify_node(&guard)
    }

    fn verify_node(&self, node: &Node) -> SmallResult {
        node.verify()?;
        if node.is_leaf() {
            return Ok(());
        }
        for idx in 0..node.child_count() {
            let child_id = node.child_id(idx);
            let cached = match &node.child_frames[idx] {
                Some(child) => {
                    let cg = child.rl();
                    if cg.id == child_id {
                        self.verify_node(&cg)?;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if !cached {
                let mut scratch = Node::new_frame(usize::MAX, self.page_store().page_size());
                scratch.id = child_id;
                self.read_into(&mut scratch, child_id)?;
                self.verify_node(&scratch)?;
            }
        }
        Ok(())
    }

    /// Load the committed root page into the pinned root frame.
    pub fn load_root(&self, root_id: u64) -> SmallResult {
        let root_pod = self.cache.root();
        let mut guard = root_pod.wl();
        if root_id == 0 {
            guard.init_leaf();
            guard.id = 0;
            guard.cached_state = CachedState::Clean;
            return Ok(());
        }
        guard.id = root_id;
        self.read_into(&mut guard, root_id)
    }
}

enum Step {
    Done(Option<Vec<u8>>),
    Descend(Pod<Node>, u64),
    Miss(Pod<Node>, Option<u64>, u64, usize),
}

pub(crate) fn mark_page(mark: &mut BitVec, id: u64) -> SmallResult {
    if id as usize >= mark.len() {
        return Err(StoreError::corrupt(format!(
            "page id {} beyond the end of the file",
            id
        )));
    }
    if mark.get(id as usize).unwrap_or(false) {
        return Err(StoreError::corrupt(format!("page {} reachable twice", id)));
    }
    mark.set(id as usize, true);
    Ok(())
}

/// Slot locations of a raw page (used by scans that have no `Node`
/// frame).
fn probe_slots(page: &[u8]) -> ResultOf<Vec<usize>> {
    let vs = crate::io::get_u16_le(page, super::node::OFF_SEARCH_VEC_START) as usize;
    let ve = crate::io::get_u16_le(page, super::node::OFF_SEARCH_VEC_END) as usize;
    if vs < HEADER_SIZE || ve + 2 < vs || ve >= page.len() {
        return Err(StoreError::corrupt("bad search vector in raw page"));
    }
    let mut locs = Vec::with_capacity((ve + 2 - vs) / 2);
    let mut off = vs;
    while off <= ve {
        locs.push(crate::io::get_u16_le(page, off) as usize);
        off += 2;
    }
    Ok(locs)
}
