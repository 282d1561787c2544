//! Out-of-line storage for values too large to live inside a node
//! entry. The value bytes spill into a chain of fragment pages and the
//! leaf keeps a fixed 12-byte descriptor behind a fragmented value
//! header.
//!
//! Fragment page: `[next page id: u64 LE][payload]`. Descriptor:
//! `[total length: u32 LE][first page id: u64 LE]`.

use crate::{
    error::StoreError,
    io::{get_u32_le, get_u64_le, put_u32_le, put_u64_le},
    types::{ResultOf, SmallResult},
};

use super::page_store::PageStore;

pub const DESCRIPTOR_LEN: usize = 12;
const PAGE_LINK_LEN: usize = 8;

pub fn encode_descriptor(total_len: usize, first_page: u64) -> [u8; DESCRIPTOR_LEN] {
    let mut d = [0u8; DESCRIPTOR_LEN];
    put_u32_le(&mut d, 0, total_len as u32);
    put_u64_le(&mut d, 4, first_page);
    d
}

pub fn decode_descriptor(d: &[u8]) -> ResultOf<(usize, u64)> {
    if d.len() != DESCRIPTOR_LEN {
        return Err(StoreError::corrupt(format!(
            "fragment descriptor of {} bytes",
            d.len()
        )));
    }
    Ok((get_u32_le(d, 0) as usize, get_u64_le(d, 4)))
}

/// Write `value` into a fresh chain of fragment pages. The pages are
/// written immediately; they become durable with the next commit, same
/// as any reserved page.
pub fn write_chain(page_store: &PageStore, value: &[u8]) -> ResultOf<[u8; DESCRIPTOR_LEN]> {
    let page_size = page_store.page_size();
    let payload_per_page = page_size - PAGE_LINK_LEN;
    let page_count = (value.len() + payload_per_page - 1) / payload_per_page;
    debug_assert!(page_count > 0);

    let mut ids = Vec::with_capacity(page_count);
    for _ in 0..page_count {
        match page_store.reserve_page() {
            Ok(id) => ids.push(id),
            Err(e) => {
                // revert the chain growth before propagating
                for id in ids {
                    page_store.unreserve_page(id);
                }
                return Err(e);
            }
        }
    }

    let mut page = vec![0u8; page_size];
    for (i, chunk) in value.chunks(payload_per_page).enumerate() {
        let next = if i + 1 < page_count { ids[i + 1] } else { 0 };
        put_u64_le(&mut page, 0, next);
        page[PAGE_LINK_LEN..PAGE_LINK_LEN + chunk.len()].copy_from_slice(chunk);
        for b in page[PAGE_LINK_LEN + chunk.len()..].iter_mut() {
            *b = 0;
        }
        page_store.write_reserved_page(ids[i], &page)?;
    }

    Ok(encode_descriptor(value.len(), ids[0]))
}

/// Reassemble a fragmented value from its descriptor.
pub fn read_chain(page_store: &PageStore, descriptor: &[u8]) -> ResultOf<Vec<u8>> {
    let (total_len, first) = decode_descriptor(descriptor)?;
    let page_size = page_store.page_size();
    let payload_per_page = page_size - PAGE_LINK_LEN;

    let mut value = Vec::with_capacity(total_len);
    let mut page = vec![0u8; page_size];
    let mut id = first;
    while value.len() < total_len {
        if id == 0 {
            return Err(StoreError::corrupt(format!(
                "fragment chain ends early: {} of {} bytes",
                value.len(),
                total_len
            )));
        }
        page_store.read_page(id, &mut page)?;
        let take = std::cmp::min(payload_per_page, total_len - value.len());
        value.extend_from_slice(&page[PAGE_LINK_LEN..PAGE_LINK_LEN + take]);
        id = get_u64_le(&page, 0);
    }
    Ok(value)
}

/// Schedule every page of the chain for reuse at the next commit.
pub fn delete_chain(page_store: &PageStore, descriptor: &[u8]) -> SmallResult {
    let (total_len, first) = decode_descriptor(descriptor)?;
    let page_size = page_store.page_size();
    let payload_per_page = page_size - PAGE_LINK_LEN;

    let mut remaining = total_len;
    let mut page = vec![0u8; page_size];
    let mut id = first;
    while remaining > 0 && id != 0 {
        page_store.read_page(id, &mut page)?;
        page_store.delete_page(id);
        remaining = remaining.saturating_sub(payload_per_page);
        id = get_u64_le(&page, 0);
    }
    Ok(())
}

/// Page ids of a chain, for the reachability scan on open.
pub fn chain_pages(page_store: &PageStore, descriptor: &[u8]) -> ResultOf<Vec<u64>> {
    let (total_len, first) = decode_descriptor(descriptor)?;
    let page_size = page_store.page_size();
    let payload_per_page = page_size - PAGE_LINK_LEN;

    let mut ids = Vec::new();
    let mut remaining = total_len;
    let mut page = vec![0u8; page_size];
    let mut id = first;
    while remaining > 0 && id != 0 {
        ids.push(id);
        page_store.read_page(id, &mut page)?;
        remaining = remaining.saturating_sub(payload_per_page);
        id = get_u64_le(&page, 0);
    }
    Ok(ids)
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
    fn test_chain_round_trip_multi_page() {
        let (_dir, store) = temp_store(512);
        // three pages worth on 512-byte pages
        let value: Vec<u8> = (0..1400u32).map(|i| (i % 251) as u8).collect();

        let desc = write_chain(&store, &value).unwrap();
        let back = read_chain(&store, &desc).unwrap();
        assert_eq!(back, value);

        assert_eq!(chain_pages(&store, &desc).unwrap().len(), 3);
    }

    #[test]
    fn test_chain_single_page() {
        let (_dir, store) = temp_store(512);
        let value = vec![42u8; 10];
        let desc = write_chain(&store, &value).unwrap();
        assert_eq!(read_chain(&store, &desc).unwrap(), value);
        assert_eq!(chain_pages(&store, &desc).unwrap().len(), 1);
    }

    #[test]
    fn test_descriptor_round_trip() {
        let d = encode_descriptor(30000, 77);
        let (len, first) = decode_descriptor(&d).unwrap();
        assert_eq!(len, 30000);
        assert_eq!(first, 77);
    }
}
