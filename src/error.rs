use std::io;

use thiserror::Error;

/// Errors surfaced by the storage core.
///
/// "Corrupt" is always fatal for the operation it interrupts. "CacheFull"
/// and "Closed" are retryable by the caller.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// Every candidate eviction victim was pinned, latched or dirty with a
    /// dirty child. Surfaced by node allocation after a bounded rescan.
    #[error("node cache is full, no evictable victim found")]
    CacheFull,

    #[error("io failure on page {page_id}: {source}")]
    Io {
        page_id: u64,
        #[source]
        source: io::Error,
    },

    #[error("spare buffer pool take interrupted")]
    Interrupted,

    /// An asserted invariant was broken during split/insert. Indicates a
    /// programmer error, not a bad store.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        StoreError::Corrupt(msg.into())
    }

    pub fn io(page_id: u64, source: io::Error) -> Self {
        StoreError::Io { page_id, source }
    }
}
