//! Block storage backends
//!
//! The cache never touches the file directly: all raw I/O goes through the
//! narrow [`BlockStore`] contract, so the same cache runs over an in-memory
//! buffer, a plain file, or any other backend a deployment plugs in.
//!
//! Address space management is deliberately primitive: `alloc` hands out
//! space at the end of allocated address space and `set_eoa` truncates it.
//! Anything smarter belongs to the file-format layer above.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use tessera_common::{Addr, Error, Result};
use tracing::debug;

/// Raw read/write/allocate contract the cache calls on its backend
pub trait BlockStore {
    /// Read exactly `len` bytes at `addr`
    fn read(&mut self, addr: Addr, len: u64) -> Result<Bytes>;

    /// Write `data` at `addr`
    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()>;

    /// Write several blocks in one call
    ///
    /// Backends with vectored or collective write support override this;
    /// the default issues one write per block.
    fn write_batch(&mut self, batch: &[(Addr, Bytes)]) -> Result<()> {
        for (addr, data) in batch {
            self.write(*addr, data)?;
        }
        Ok(())
    }

    /// Current end of file (high-water mark of written data)
    fn eof(&mut self) -> Result<u64>;

    /// Allocate `len` bytes of address space
    fn alloc(&mut self, len: u64) -> Result<Addr>;

    /// Set the end of allocated address space
    fn set_eoa(&mut self, addr: Addr) -> Result<()>;
}

/// In-memory block store
///
/// Cloning yields a handle to the same backing buffer, which is how
/// cooperating ranks in tests share one logical file. Write counters are
/// tracked for diagnostics.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

struct MemoryStoreInner {
    data: Vec<u8>,
    eoa: u64,
    write_count: u64,
}

impl MemoryStore {
    /// Create an empty in-memory store
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryStoreInner {
                data: Vec::new(),
                eoa: 0,
                write_count: 0,
            })),
        }
    }

    /// Number of write calls issued so far (batched writes count once per
    /// block)
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.inner.lock().write_count
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore for MemoryStore {
    fn read(&mut self, addr: Addr, len: u64) -> Result<Bytes> {
        let inner = self.inner.lock();
        let start = addr.offset() as usize;
        let end = start + len as usize;
        if end > inner.data.len() {
            return Err(Error::storage(format!(
                "read of {len} bytes at {addr} past end of data ({})",
                inner.data.len()
            )));
        }
        Ok(Bytes::copy_from_slice(&inner.data[start..end]))
    }

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let start = addr.offset() as usize;
        let end = start + data.len();
        if end > inner.data.len() {
            inner.data.resize(end, 0);
        }
        inner.data[start..end].copy_from_slice(data);
        inner.write_count += 1;
        if (end as u64) > inner.eoa {
            inner.eoa = end as u64;
        }
        Ok(())
    }

    fn eof(&mut self) -> Result<u64> {
        Ok(self.inner.lock().data.len() as u64)
    }

    fn alloc(&mut self, len: u64) -> Result<Addr> {
        let mut inner = self.inner.lock();
        let addr = Addr::new(inner.eoa);
        inner.eoa += len;
        Ok(addr)
    }

    fn set_eoa(&mut self, addr: Addr) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.eoa = addr.offset();
        inner.data.truncate(addr.offset() as usize);
        Ok(())
    }
}

/// File-backed block store over a plain file
pub struct FileStore {
    file: File,
    eoa: u64,
}

impl FileStore {
    /// Create a new file, truncating any existing one
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        debug!(path = %path.as_ref().display(), "created file store");
        Ok(Self { file, eoa: 0 })
    }

    /// Open an existing file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let eoa = file.metadata()?.len();
        debug!(path = %path.as_ref().display(), eoa, "opened file store");
        Ok(Self { file, eoa })
    }
}

impl BlockStore for FileStore {
    fn read(&mut self, addr: Addr, len: u64) -> Result<Bytes> {
        self.file.seek(SeekFrom::Start(addr.offset()))?;
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn write(&mut self, addr: Addr, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(addr.offset()))?;
        self.file.write_all(data)?;
        let end = addr.offset() + data.len() as u64;
        if end > self.eoa {
            self.eoa = end;
        }
        Ok(())
    }

    fn eof(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn alloc(&mut self, len: u64) -> Result<Addr> {
        let addr = Addr::new(self.eoa);
        self.eoa += len;
        Ok(addr)
    }

    fn set_eoa(&mut self, addr: Addr) -> Result<()> {
        self.eoa = addr.offset();
        self.file.set_len(addr.offset())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        let addr = store.alloc(8).unwrap();
        store.write(addr, b"metadata").unwrap();
        assert_eq!(store.read(addr, 8).unwrap().as_ref(), b"metadata");
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_memory_store_shared_handles() {
        let mut a = MemoryStore::new();
        let mut b = a.clone();
        let addr = a.alloc(4).unwrap();
        a.write(addr, b"abcd").unwrap();
        assert_eq!(b.read(addr, 4).unwrap().as_ref(), b"abcd");
    }

    #[test]
    fn test_memory_store_read_past_end() {
        let mut store = MemoryStore::new();
        assert!(store.read(Addr::new(0), 16).is_err());
    }

    #[test]
    fn test_memory_store_set_eoa_truncates() {
        let mut store = MemoryStore::new();
        let addr = store.alloc(16).unwrap();
        store.write(addr, &[0xAA; 16]).unwrap();
        store.set_eoa(Addr::new(8)).unwrap();
        assert_eq!(store.eof().unwrap(), 8);
        assert!(store.read(Addr::new(8), 8).is_err());
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.tsr");

        {
            let mut store = FileStore::create(&path).unwrap();
            let addr = store.alloc(5).unwrap();
            store.write(addr, b"hello").unwrap();
        }

        let mut store = FileStore::open(&path).unwrap();
        assert_eq!(store.read(Addr::new(0), 5).unwrap().as_ref(), b"hello");
        assert_eq!(store.eof().unwrap(), 5);
    }

    #[test]
    fn test_write_batch_default_impl() {
        let mut store = MemoryStore::new();
        store
            .write_batch(&[
                (Addr::new(0), Bytes::from_static(b"aa")),
                (Addr::new(2), Bytes::from_static(b"bb")),
            ])
            .unwrap();
        assert_eq!(store.read(Addr::new(0), 4).unwrap().as_ref(), b"aabb");
        assert_eq!(store.write_count(), 2);
    }
}
