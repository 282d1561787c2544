use std::{
    io::Write,
    sync::{Once, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use crossbeam::channel::{Receiver, Sender};

use crate::error::StoreError;

/// copy from https://github.com/tikv/tikv/blob/b15ea3b1cd766375cb52019e35c195ed797124df/components/tikv_util/src/lib.rs#L171-L186
///
/// A handy shortcut to replace `RwLock` write/read().unwrap() pattern
/// to shortcut wl and rl.
pub trait HandyRwLock<T: ?Sized> {
    fn wl(&self) -> RwLockWriteGuard<'_, T>;
    fn rl(&self) -> RwLockReadGuard<'_, T>;
}

impl<T: ?Sized> HandyRwLock<T> for RwLock<T> {
    fn wl(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap()
    }

    fn rl(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap()
    }
}

static INIT_LOG: Once = Once::new();

pub fn init_log() {
    INIT_LOG.call_once(|| {
        use env_logger::Builder;

        let mut builder = Builder::from_default_env();
        builder
            .format_timestamp_secs()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{} - {}] [{}:{}] {}",
                    record.level(),
                    record.target(),
                    record.file().unwrap_or("?"),
                    record.line().unwrap_or(0),
                    record.args()
                )
            })
            .init();
    });
}

/// A bounded pool of page-sized scratch buffers, shared among compaction
/// operations. "take" blocks until a buffer is available; buffers return
/// to the pool on drop, on every exit path.
pub struct SparePool {
    tx: Sender<Box<[u8]>>,
    rx: Receiver<Box<[u8]>>,
}

impl SparePool {
    pub fn new(count: usize, buf_size: usize) -> Self {
        let (tx, rx) = crossbeam::channel::bounded(count);
        for _ in 0..count {
            tx.send(vec![0u8; buf_size].into_boxed_slice()).unwrap();
        }
        Self { tx, rx }
    }

    pub fn take(&self) -> Result<SpareBuffer<'_>, StoreError> {
        let buf = self.rx.recv().or(Err(StoreError::Interrupted))?;
        Ok(SpareBuffer {
            pool: self,
            buf: Some(buf),
        })
    }

    fn put(&self, buf: Box<[u8]>) {
        // the channel capacity equals the number of buffers, send cannot
        // block
        let _ = self.tx.try_send(buf);
    }
}

pub struct SpareBuffer<'a> {
    pool: &'a SparePool,
    buf: Option<Box<[u8]>>,
}

impl<'a> SpareBuffer<'a> {
    pub fn buf_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut().unwrap()
    }

    /// Exchange the held buffer with another one of the same size. Used by
    /// compaction, which rebuilds into the spare buffer and hands the old
    /// page back to the pool.
    pub fn swap(&mut self, other: &mut Box<[u8]>) {
        std::mem::swap(self.buf.as_mut().unwrap(), other);
    }
}

impl<'a> Drop for SpareBuffer<'a> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf);
        }
    }
}
