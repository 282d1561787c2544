//! In-place mutations of a slotted node: entry insertion, update,
//! deletion and compaction. Splits live in `split.rs`.

use log::debug;

use crate::{
    error::StoreError,
    types::SmallResult,
    utils::SpareBuffer,
};

use super::node::{
    leaf_entry_len, write_leaf_entry, Node, ValuePayload, CHILD_ID_SIZE,
    HEADER_SIZE,
};

impl Node {
    /// Insert a leaf entry at insertion position `pos` (a 2-based byte
    /// offset from `binary_search`, already complemented). Returns false
    /// when neither segment can hold the entry; the caller then compacts
    /// or splits.
    pub fn insert_leaf_entry(
        &mut self,
        pos: usize,
        key: &[u8],
        value: &ValuePayload,
    ) -> Result<bool, StoreError> {
        let entry_len = leaf_entry_len(key.len(), value);
        let loc = match self.plan_entry_alloc(pos, entry_len) {
            Some(plan) => plan,
            None => return Ok(false),
        };
        write_leaf_entry(&mut self.page, loc, key, value);
        self.finish_slot_insert(pos, loc);
        Ok(true)
    }

    /// Pick a segment for a new leaf entry and grow the search vector by
    /// one slot. Returns the entry location, or None if space ran out.
    ///
    /// Leaf nodes only: growing the vector rightward would collide with
    /// an internal node's child id array, which `adopt_child_split`
    /// moves itself.
    fn plan_entry_alloc(&mut self, pos: usize, entry_len: usize) -> Option<usize> {
        let free_left = self.free_left();
        let free_right = self.free_right();

        // entry in the left segment, vector growth charged to whichever
        // gap still covers it
        if free_left >= entry_len + 2 {
            let loc = self.get_left_seg_tail();
            self.set_left_seg_tail(loc + entry_len);
            self.grow_vector(pos, true);
            return Some(loc);
        }
        if free_right >= entry_len + 2 {
            let rt = self.get_right_seg_tail();
            let loc = rt - entry_len + 1;
            self.set_right_seg_tail(rt - entry_len);
            self.grow_vector(pos, false);
            return Some(loc);
        }
        if free_left >= entry_len && free_right >= 2 {
            let loc = self.get_left_seg_tail();
            self.set_left_seg_tail(loc + entry_len);
            self.grow_vector(pos, false);
            return Some(loc);
        }
        if free_right >= entry_len && free_left >= 2 {
            let rt = self.get_right_seg_tail();
            let loc = rt - entry_len + 1;
            self.set_right_seg_tail(rt - entry_len);
            self.grow_vector(pos, true);
            return Some(loc);
        }
        None
    }

    /// Open a slot at byte position `pos` by shifting the prefix left
    /// (`grow_left`) or the suffix right. The slot contents are written
    /// by `finish_slot_insert`.
    pub(crate) fn grow_vector(&mut self, pos: usize, grow_left: bool) {
        let vs = self.get_search_vec_start();
        let ve = self.get_search_vec_end();

        if grow_left {
            // slots [vs, vs+pos) move to [vs-2, ..)
            self.page.copy_within(vs..vs + pos, vs - 2);
            self.set_search_vec_start(vs - 2);
        } else {
            // slots [vs+pos, ve+2) move to [vs+pos+2, ..)
            self.page.copy_within(vs + pos..ve + 2, vs + pos + 2);
            self.set_search_vec_end(ve + 2);
        }
    }

    pub(crate) fn finish_slot_insert(&mut self, pos: usize, loc: usize) {
        // after grow_vector the new slot lives at start + pos regardless
        // of which side moved
        let vs = self.get_search_vec_start();
        crate::io::put_u16_le(&mut self.page, vs + pos, loc as u16);
    }

    /// Replace the value of slot `i`. Reuses the entry bytes when the new
    /// encoding fits; otherwise frees the old entry into garbage and
    /// re-allocates without growing the vector. Returns false when space
    /// ran out (caller compacts or splits; the old entry is untouched).
    pub fn update_leaf_entry(
        &mut self,
        i: usize,
        key: &[u8],
        value: &ValuePayload,
    ) -> Result<bool, StoreError> {
        let old_loc = self.slot_entry_loc(i);
        let old_len = self.entry_size_at(i)?;
        let new_len = leaf_entry_len(key.len(), value);

        if new_len <= old_len {
            write_leaf_entry(&mut self.page, old_loc, key, value);
            self.set_garbage(self.get_garbage() + old_len - new_len);
            return Ok(true);
        }

        let loc = if self.free_left() >= new_len {
            let loc = self.get_left_seg_tail();
            self.set_left_seg_tail(loc + new_len);
            loc
        } else if self.free_right() >= new_len {
            let rt = self.get_right_seg_tail();
            self.set_right_seg_tail(rt - new_len);
            rt - new_len + 1
        } else {
            return Ok(false);
        };

        write_leaf_entry(&mut self.page, loc, key, value);
        self.set_slot_entry_loc(i, loc);
        self.set_garbage(self.get_garbage() + old_len);
        Ok(true)
    }

    /// Remove slot `i`. The entry bytes stay behind as garbage until
    /// compaction reclaims them.
    pub fn delete_entry(&mut self, i: usize) -> SmallResult {
        let size = self.entry_size_at(i)?;
        self.set_garbage(self.get_garbage() + size);

        let vs = self.get_search_vec_start();
        let ve = self.get_search_vec_end();
        let n = self.key_count();

        // shift the smaller side over the vacated slot
        if i < n - i - 1 {
            self.page.copy_within(vs..vs + i * 2, vs + 2);
            self.set_search_vec_start(vs + 2);
        } else {
            self.page.copy_within(vs + i * 2 + 2..ve + 2, vs + i * 2);
            self.set_search_vec_end(ve - 2);
        }
        Ok(())
    }

    /// Whether compaction can free enough contiguous room for an entry of
    /// `entry_len` plus `extra` bytes of vector/child growth.
    pub fn compact_fits(&self, entry_len: usize, extra: usize) -> Result<bool, StoreError> {
        let total_free = self.free_left() + self.free_right() + self.get_garbage();
        // one slack byte covers vector even-alignment after the rebuild
        Ok(total_free >= entry_len + extra + 1)
    }

    /// Rebuild the node into a spare page: live entries packed into the
    /// left segment in search-vector order, the vector re-centered with
    /// `reserve` bytes kept contiguous on the right, garbage zeroed. The
    /// old page buffer is handed back to the spare pool by the caller's
    /// guard.
    pub fn compact(&mut self, spare: &mut SpareBuffer, reserve: usize) -> SmallResult {
        let p = self.page_size();
        let n = self.key_count();
        let is_leaf = self.is_leaf();
        let child_len = if is_leaf {
            0
        } else {
            CHILD_ID_SIZE * self.child_count()
        };

        let buf = spare.buf_mut();
        for b in buf.iter_mut() {
            *b = 0;
        }

        // stage 1: stream live entries into the left segment
        let mut new_locs = Vec::with_capacity(n);
        let mut tail = HEADER_SIZE;
        for i in 0..n {
            let loc = self.slot_entry_loc(i);
            let size = self.entry_size_at(i)?;
            buf[tail..tail + size].copy_from_slice(&self.page[loc..loc + size]);
            new_locs.push(tail);
            tail += size;
        }

        // stage 2: re-center the search vector, leaving the reserve on
        // the right side
        let vec_len = n * 2;
        let used = tail + vec_len + child_len;
        if used + reserve > p {
            return Err(StoreError::ConstraintViolation(format!(
                "compaction cannot fit {} used + {} reserved in page",
                used, reserve
            )));
        }
        let free = p - used;
        let mut vs = tail + (free - reserve) / 2;
        if vs % 2 != 0 {
            vs += 1;
        }
        if vs + vec_len + child_len + reserve > p {
            vs -= 2;
        }
        if vs < tail {
            return Err(StoreError::ConstraintViolation(
                "compaction reserve does not leave room for the search vector".to_string(),
            ));
        }

        // stage 3: rewrite the vector and child ids
        for (i, loc) in new_locs.iter().enumerate() {
            crate::io::put_u16_le(buf, vs + i * 2, *loc as u16);
        }
        if child_len > 0 {
            let old_start = self.children_start();
            let new_start = vs + vec_len;
            buf[new_start..new_start + child_len]
                .copy_from_slice(&self.page[old_start..old_start + child_len]);
        }

        // stage 4: header
        buf[super::node::OFF_TYPE] = self.node_type();
        crate::io::put_u16_le(buf, super::node::OFF_GARBAGE, 0);
        crate::io::put_u16_le(buf, super::node::OFF_LEFT_SEG_TAIL, tail as u16);
        crate::io::put_u16_le(buf, super::node::OFF_RIGHT_SEG_TAIL, (p - 1) as u16);
        crate::io::put_u16_le(buf, super::node::OFF_SEARCH_VEC_START, vs as u16);
        crate::io::put_u16_le(
            buf,
            super::node::OFF_SEARCH_VEC_END,
            (vs + vec_len).wrapping_sub(2) as u16,
        );

        spare.swap(&mut self.page);
        debug!(
            "compacted node {}: {} entries, vector at {}",
            self.id, n, vs
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::node::*;
    use crate::utils::SparePool;

    fn insert_sorted(node: &mut Node, key: &[u8], value: &[u8]) -> bool {
        let pos = node.binary_search(key).unwrap();
        assert!(pos < 0, "key already present");
        node.insert_leaf_entry(!pos as usize, key, &ValuePayload::Inline(value))
            .unwrap()
    }

    fn find(node: &Node, key: &[u8]) -> Option<Vec<u8>> {
        let pos = node.binary_search(key).unwrap();
        if pos < 0 {
            return None;
        }
        let e = node.leaf_entry_at(pos as usize / 2).unwrap();
        Some(node.page[e.value_start..e.value_start + e.value_len].to_vec())
    }

    #[test]
    fn test_insert_out_of_order_keeps_sorted_vector() {
        let mut node = Node::new_frame(0, 512);
        node.init_leaf();

        for k in [b"m", b"c", b"x", b"a", b"t"].iter() {
            assert!(insert_sorted(&mut node, *k, b"val"));
            node.verify().unwrap();
        }
        assert_eq!(node.key_count(), 5);
        assert_eq!(find(&node, b"c").unwrap(), b"val");
        assert_eq!(find(&node, b"q"), None);
    }

    #[test]
    fn test_update_in_place_and_relocated() {
        let mut node = Node::new_frame(0, 512);
        node.init_leaf();
        assert!(insert_sorted(&mut node, b"k", b"0123456789"));

        // shrinking reuses the slot and grows garbage
        assert!(node
            .update_leaf_entry(0, b"k", &ValuePayload::Inline(b"xy"))
            .unwrap());
        node.verify().unwrap();
        assert_eq!(find(&node, b"k").unwrap(), b"xy");
        assert!(node.get_garbage() > 0);

        // growing relocates
        let big = vec![7u8; 40];
        assert!(node
            .update_leaf_entry(0, b"k", &ValuePayload::Inline(&big))
            .unwrap());
        node.verify().unwrap();
        assert_eq!(find(&node, b"k").unwrap(), big);
    }

    #[test]
    fn test_delete_adds_garbage() {
        let mut node = Node::new_frame(0, 512);
        node.init_leaf();
        for k in [b"a", b"b", b"c"].iter() {
            insert_sorted(&mut node, *k, b"value");
        }

        let pos = node.binary_search(b"b").unwrap();
        node.delete_entry(pos as usize / 2).unwrap();
        node.verify().unwrap();
        assert_eq!(node.key_count(), 2);
        assert_eq!(find(&node, b"b"), None);
        assert_eq!(find(&node, b"a").unwrap(), b"value");
        assert_eq!(find(&node, b"c").unwrap(), b"value");
    }

    #[test]
    fn test_compaction_preserves_lookups() {
        let pool = SparePool::new(1, 512);
        let mut node = Node::new_frame(0, 512);
        node.init_leaf();

        // churn until fragmented
        for round in 0..4u8 {
            for k in 0..8u8 {
                let key = [b'k', k];
                let value = vec![round; 8 + round as usize];
                let pos = node.binary_search(&key).unwrap();
                if pos < 0 {
                    node.insert_leaf_entry(
                        !pos as usize,
                        &key,
                        &ValuePayload::Inline(&value),
                    )
                    .unwrap();
                } else {
                    node.update_leaf_entry(
                        pos as usize / 2,
                        &key,
                        &ValuePayload::Inline(&value),
                    )
                    .unwrap();
                }
            }
        }
        assert!(node.get_garbage() > 0);

        let mut spare = pool.take().unwrap();
        node.compact(&mut spare, 16).unwrap();
        drop(spare);

        node.verify().unwrap();
        assert_eq!(node.get_garbage(), 0);
        for k in 0..8u8 {
            assert_eq!(find(&node, &[b'k', k]).unwrap(), vec![3u8; 11]);
        }
    }
}
