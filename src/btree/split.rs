//! Node splits and their propagation: partitioning an overfull node into
//! two siblings, adopting the split key into the parent, and promoting a
//! new root.
//!
//! A split is transient state on the original node (`SplitState`); it
//! exists only between the partition and the parent's adoption, while the
//! splitting thread still holds the write latches involved.

use log::debug;

use crate::{
    error::StoreError,
    io::put_u16_le,
    types::{ResultOf, SmallResult},
    utils::HandyRwLock,
};

use super::{
    node::{
        internal_entry_len, write_internal_key, Node, SplitState, CHILD_ID_SIZE,
        HEADER_SIZE, MAX_KEY_TWO_BYTE, TYPE_INTERNAL,
    },
    node_cache::NodeCache,
};

/// Largest encoded entry a node accepts. Anything bigger spills its
/// value out-of-line, which keeps every split able to place its halves.
pub fn max_entry_size(page_size: usize) -> usize {
    (page_size - HEADER_SIZE) / 2 - 24
}

/// Largest key the tree accepts; also bounds internal-node separators.
pub fn max_key_size(page_size: usize) -> usize {
    std::cmp::min(MAX_KEY_TWO_BYTE, (page_size - HEADER_SIZE) / 4)
}

impl SplitState {
    /// True when `key` belongs to the sibling half.
    pub fn key_goes_to_sibling(&self, key: &[u8]) -> bool {
        let right = key >= self.split_key.as_slice();
        right == self.split_right
    }

    /// Binary-search position as if the original node had not split.
    pub fn binary_search(&self, original: &Node, key: &[u8]) -> ResultOf<i32> {
        let (left_keys, right_pos) = if self.split_right {
            let sibling = self.sibling.rl();
            if key < self.split_key.as_slice() {
                return original.binary_search(key);
            }
            (original.key_count() as i32, sibling.binary_search(key)?)
        } else {
            let sibling = self.sibling.rl();
            if key < self.split_key.as_slice() {
                return sibling.binary_search(key);
            }
            (sibling.key_count() as i32, original.binary_search(key)?)
        };
        // shift the right half's position past the left half's keys
        if right_pos < 0 {
            Ok(!(!right_pos + left_keys * 2))
        } else {
            Ok(right_pos + left_keys * 2)
        }
    }

    /// Write the split key in internal-node encoding at `loc`, returning
    /// its byte length. Used when a parent adopts the split.
    pub fn copy_split_key_to_parent(&self, page: &mut [u8], loc: usize) -> usize {
        write_internal_key(page, loc, &self.split_key)
    }
}

/// Per-slot encoded sizes, used to balance a partition.
fn entry_sizes(node: &Node) -> ResultOf<Vec<usize>> {
    let mut sizes = Vec::with_capacity(node.key_count());
    for i in 0..node.key_count() {
        sizes.push(node.entry_size_at(i)?);
    }
    Ok(sizes)
}

/// Choose the boundary `b` (old entries staying in the left half) so the
/// byte sizes of both halves come out roughly equal, accounting for the
/// incoming entry on the side the key ordering sends it to. Returns
/// (b, incoming_goes_left).
fn choose_boundary(sizes: &[usize], slot: usize, incoming: usize) -> (usize, bool) {
    let n = sizes.len();
    let total: usize = sizes.iter().sum();

    let mut best = (usize::MAX, 1, true);
    let mut prefix = 0usize;
    for b in 0..=n {
        if b > 0 {
            prefix += sizes[b - 1];
        }
        // the new key lands left of old[b] when slot <= b; at slot == b
        // it stays left unless the right half would hold nothing old
        let goes_left = slot < b || (slot == b && b < n);
        let left = prefix + if goes_left { incoming } else { 0 };
        let right = total - prefix + if goes_left { 0 } else { incoming };
        if left == 0 || right == 0 {
            continue;
        }
        let diff = if left > right { left - right } else { right - left };
        if diff < best.0 {
            best = (diff, b, goes_left);
        }
    }
    (best.1, best.2)
}

/// Split an overfull leaf around the insertion at byte position `pos`.
/// The incoming entry itself is not placed; the caller inserts it into
/// the proper half after the parent adopts the split.
pub fn split_leaf(
    cache: &NodeCache,
    node: &mut Node,
    pos: usize,
    key: &[u8],
    incoming_len: usize,
) -> SmallResult {
    debug_assert!(node.is_leaf() && node.split.is_none());
    let n = node.key_count();
    let sizes = entry_sizes(node)?;
    let (b, _goes_left) = choose_boundary(&sizes, pos / 2, incoming_len);

    // move the smaller half into the sibling
    let left_bytes: usize = sizes[..b].iter().sum();
    let right_bytes: usize = sizes[b..].iter().sum();
    let split_right = right_bytes <= left_bytes;

    let split_key = if b < n {
        node.key_at(b)?.to_vec()
    } else {
        key.to_vec()
    };

    let sibling = cache.new_node_for_split()?;
    {
        let mut sib = sibling.wl();
        sib.init_leaf();
        let range = if split_right { b..n } else { 0..b };
        // reserve room for the pending entry plus its vector slot
        move_entries_to_sibling(node, &mut sib, range.clone(), incoming_len + 2)?;
        remove_moved_slots(node, range, &sizes);
    }

    debug!(
        "leaf {} split ({}): {} keys kept, key boundary {}",
        node.id,
        if split_right { "right" } else { "left" },
        node.key_count(),
        b
    );
    node.split = Some(SplitState {
        split_right,
        sibling,
        split_key,
    });
    Ok(())
}

/// Copy the entries of `range` (slot order) into the fresh sibling's
/// left segment and build its search vector, reserving room for the
/// pending insert.
fn move_entries_to_sibling(
    node: &Node,
    sib: &mut Node,
    range: std::ops::Range<usize>,
    reserve: usize,
) -> SmallResult {
    let mut tail = HEADER_SIZE;
    let mut locs = Vec::with_capacity(range.len());
    for i in range {
        let loc = node.slot_entry_loc(i);
        let size = node.entry_size_at(i)?;
        sib.page[tail..tail + size].copy_from_slice(&node.page[loc..loc + size]);
        locs.push(tail);
        tail += size;
    }

    let p = sib.page_size();
    let vec_len = locs.len() * 2;
    let used = tail + vec_len;
    if used + reserve + 2 > p {
        return Err(StoreError::ConstraintViolation(format!(
            "split half does not fit: {} used + {} reserved",
            used, reserve
        )));
    }
    let mut vs = tail + (p - used - reserve) / 2;
    if vs % 2 != 0 {
        vs += 1;
    }
    if vs + vec_len + reserve > p {
        vs -= 2;
    }

    for (i, loc) in locs.iter().enumerate() {
        put_u16_le(&mut sib.page, vs + i * 2, *loc as u16);
    }
    sib.set_left_seg_tail(tail);
    sib.set_right_seg_tail(p - 1);
    sib.set_search_vec_start(vs);
    sib.set_search_vec_end(vs + vec_len - 2);
    sib.set_garbage(0);
    Ok(())
}

/// Drop the moved slots from the original and account their entry bytes
/// as garbage.
fn remove_moved_slots(node: &mut Node, range: std::ops::Range<usize>, sizes: &[usize]) {
    let moved: usize = sizes[range.clone()].iter().sum();
    node.set_garbage(node.get_garbage() + moved);

    let vs = node.get_search_vec_start();
    let ve = node.get_search_vec_end();
    if range.start == 0 {
        // prefix moved out
        node.set_search_vec_start(vs + range.len() * 2);
    } else {
        // suffix moved out
        node.set_search_vec_end(ve - range.len() * 2);
    }
}

/// Split an overfull internal node, promoting its middle key. The
/// pending adoption that triggered the split is retried by the caller
/// against the proper half.
pub fn split_internal(cache: &NodeCache, node: &mut Node) -> SmallResult {
    debug_assert!(!node.is_leaf() && node.split.is_none());
    let n = node.key_count();
    if n < 2 {
        return Err(StoreError::ConstraintViolation(
            "internal node too small to split".to_string(),
        ));
    }

    let sizes = entry_sizes(node)?;
    // promote index m balancing the residual halves
    let total: usize = sizes.iter().sum();
    let mut best = (usize::MAX, 1);
    let mut prefix = 0usize;
    for m in 0..n {
        if m > 0 {
            prefix += sizes[m - 1];
        }
        if m == 0 || m == n - 1 {
            continue;
        }
        let left = prefix;
        let right = total - prefix - sizes[m];
        let diff = if left > right { left - right } else { right - left };
        if diff < best.0 {
            best = (diff, m);
        }
    }
    let m = if n == 2 { 1 } else { best.1 };

    let left_bytes: usize = sizes[..m].iter().sum();
    let right_bytes: usize = sizes[m + 1..].iter().sum();
    let split_right = right_bytes <= left_bytes;
    let promoted = node.key_at(m)?.to_vec();

    let sibling = cache.new_node_for_split()?;
    {
        let mut sib = sibling.wl();
        sib.init_leaf();
        sib.page[super::node::OFF_TYPE] = TYPE_INTERNAL;

        if split_right {
            // sibling: keys [m+1..n), children [m+1..=n]
            move_entries_to_sibling(node, &mut sib, m + 1..n, (n - m) * CHILD_ID_SIZE)?;
            let cs = sib.children_start();
            for (j, idx) in (m + 1..=n).enumerate() {
                let id = node.child_id(idx);
                crate::io::put_u64_le(&mut sib.page, cs + j * CHILD_ID_SIZE, id);
            }
            sib.child_frames = node.child_frames.drain(m + 1..).collect();

            // original keeps keys [0..m), children [0..=m]; the child id
            // array slides left with the shrinking vector
            let old_start = node.children_start();
            let keep = (m + 1) * CHILD_ID_SIZE;
            let moved_bytes: usize = sizes[m..].iter().sum();
            node.set_garbage(node.get_garbage() + moved_bytes);
            node.set_search_vec_end(node.get_search_vec_end() - (n - m) * 2);
            let new_start = node.children_start();
            node.page.copy_within(old_start..old_start + keep, new_start);
        } else {
            // sibling: keys [0..m), children [0..=m]
            move_entries_to_sibling(node, &mut sib, 0..m, (m + 1) * CHILD_ID_SIZE)?;
            let cs = sib.children_start();
            for idx in 0..=m {
                let id = node.child_id(idx);
                crate::io::put_u64_le(&mut sib.page, cs + idx * CHILD_ID_SIZE, id);
            }
            let kept: Vec<Option<crate::types::Pod<Node>>> =
                node.child_frames.drain(m + 1..).collect();
            sib.child_frames = std::mem::replace(&mut node.child_frames, kept);

            // original keeps keys [m+1..n), children [m+1..=n]
            let old_start = node.children_start();
            let keep = (n - m) * CHILD_ID_SIZE;
            let drop_bytes: usize = sizes[..=m].iter().sum();
            node.set_garbage(node.get_garbage() + drop_bytes);
            node.set_search_vec_start(node.get_search_vec_start() + (m + 1) * 2);
            // vector start moved, end did not: the array start is
            // unchanged but the kept ids slide to the front
            node.page.copy_within(
                old_start + (m + 1) * CHILD_ID_SIZE..old_start + (m + 1) * CHILD_ID_SIZE + keep,
                old_start,
            );
        }
    }

    debug!(
        "internal {} split ({}), promoted key of {} bytes",
        node.id,
        if split_right { "right" } else { "left" },
        promoted.len()
    );
    node.split = Some(SplitState {
        split_right,
        sibling,
        split_key: promoted,
    });
    Ok(())
}

/// Insert the child's split key and new sibling id into the parent.
/// Returns false when the parent has no room, leaving the child's split
/// in place for the caller to compact or split the parent first.
pub fn adopt_child_split(parent: &mut Node, child: &Node) -> ResultOf<bool> {
    let split = child
        .split
        .as_ref()
        .ok_or_else(|| StoreError::ConstraintViolation("no split to adopt".to_string()))?;
    let sib_id = split.sibling.rl().id;

    let pos = parent.binary_search(&split.split_key)?;
    if pos >= 0 {
        return Err(StoreError::ConstraintViolation(
            "split key already present in parent".to_string(),
        ));
    }
    let pos = !pos as usize;
    let key_idx = pos / 2;
    // the new id slots in left of the original child when the sibling
    // holds the low half
    let child_idx = if split.split_right { key_idx + 1 } else { key_idx };

    let entry_len = internal_entry_len(split.split_key.len());
    let free_left = parent.free_left();
    let free_right = parent.free_right();

    // (entry segment, vector growth side); the child id array always
    // grows by 8 at the right, plus 2 more when the vector grows right
    let plan = if free_left >= entry_len + 2 && free_right >= CHILD_ID_SIZE {
        Some((true, true))
    } else if free_left >= entry_len && free_right >= CHILD_ID_SIZE + 2 {
        Some((true, false))
    } else if free_left >= 2 && free_right >= entry_len + CHILD_ID_SIZE {
        Some((false, true))
    } else if free_right >= entry_len + CHILD_ID_SIZE + 2 {
        Some((false, false))
    } else {
        None
    };
    let (entry_left, vec_left) = match plan {
        Some(p) => p,
        None => return Ok(false),
    };

    // stage 1: place the key entry
    let loc = if entry_left {
        let loc = parent.get_left_seg_tail();
        parent.set_left_seg_tail(loc + entry_len);
        loc
    } else {
        let rt = parent.get_right_seg_tail();
        parent.set_right_seg_tail(rt - entry_len);
        rt - entry_len + 1
    };
    split.copy_split_key_to_parent(&mut parent.page, loc);

    // stage 2: move the child id array apart before the vector grows
    // over it
    let n_children = parent.child_count();
    let old_start = parent.children_start();
    let base_shift = if vec_left { 0 } else { 2 };
    // ids at and after the insertion point also make room for the new id
    parent.page.copy_within(
        old_start + child_idx * CHILD_ID_SIZE..old_start + n_children * CHILD_ID_SIZE,
        old_start + child_idx * CHILD_ID_SIZE + base_shift + CHILD_ID_SIZE,
    );
    if base_shift != 0 && child_idx > 0 {
        parent
            .page
            .copy_within(old_start..old_start + child_idx * CHILD_ID_SIZE, old_start + base_shift);
    }

    // stage 3: grow the vector and fill the new slot
    parent.grow_vector(pos, vec_left);
    parent.finish_slot_insert(pos, loc);

    // stage 4: the new child id, at its post-shift position
    parent.set_child_id(child_idx, sib_id);
    parent
        .child_frames
        .insert(child_idx, Some(split.sibling.clone()));

    debug!(
        "parent {} adopted split of child {} (sibling {})",
        parent.id, child.id, sib_id
    );
    Ok(true)
}

/// Root split: the root's content moves into a fresh child frame, and
/// the root becomes an internal node holding the split key and the two
/// child ids. The root frame itself never moves, so the cache's root
/// pin stays valid.
pub fn finish_split_root(cache: &NodeCache, root: &mut Node) -> SmallResult {
    let split = root.split.take().ok_or_else(|| {
        StoreError::ConstraintViolation("root has no split to finish".to_string())
    })?;

    let child_pod = cache.alloc_latched_node()?;
    // the old id will belong to the child; reserve the root's own id
    // before gutting the root so a failure leaves it intact
    let new_root_id = match cache.page_store().reserve_page() {
        Ok(id) => id,
        Err(e) => {
            cache.insert_lru(&child_pod);
            return Err(e);
        }
    };
    {
        let mut child = child_pod.wl();
        std::mem::swap(&mut child.page, &mut root.page);
        child.child_frames = std::mem::take(&mut root.child_frames);
        child.id = root.id;
        child.cached_state = root.cached_state;
    }
    root.id = new_root_id;

    let p = root.page_size();
    for b in root.page.iter_mut() {
        *b = 0;
    }
    root.page[super::node::OFF_TYPE] = TYPE_INTERNAL;
    let entry_len = write_internal_key(&mut root.page, HEADER_SIZE, &split.split_key);
    let tail = HEADER_SIZE + entry_len;
    let mut vs = tail + (p - tail - 2 - 2 * CHILD_ID_SIZE) / 2;
    if vs % 2 != 0 {
        vs += 1;
    }
    root.set_garbage(0);
    root.set_left_seg_tail(tail);
    root.set_right_seg_tail(p - 1);
    root.set_search_vec_start(vs);
    root.set_search_vec_end(vs);
    put_u16_le(&mut root.page, vs, HEADER_SIZE as u16);

    // both children stay pinned until the caller finishes its pending
    // work against them; `unpin_root_children` releases them
    child_pod.wl().unevictable = true;

    let sib_id = split.sibling.rl().id;
    let child_id = child_pod.rl().id;
    let (left, right) = if split.split_right {
        ((child_id, child_pod.clone()), (sib_id, split.sibling.clone()))
    } else {
        ((sib_id, split.sibling.clone()), (child_id, child_pod.clone()))
    };
    root.set_child_id(0, left.0);
    root.set_child_id(1, right.0);
    root.child_frames = vec![Some(left.1), Some(right.1)];

    debug!(
        "root split finished: new root id {}, children {} and {}",
        root.id, left.0, right.0
    );
    Ok(())
}

/// Release the pins `finish_split_root` left on the two fresh children.
/// The caller still holds the root write latch.
pub fn unpin_root_children(cache: &NodeCache, root: &Node) {
    for frame in root.child_frames.iter().flatten() {
        frame.wl().unevictable = false;
        cache.insert_lru(frame);
    }
}
