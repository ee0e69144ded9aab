//! Block-storage collaborator seam.
//!
//! The buffer cache reads and writes whole fixed-size blocks through the
//! [`BlockDevice`] trait. Calls are synchronous from the cache's point of
//! view and may park the calling thread while the transfer is outstanding;
//! failures propagate unchanged to the `load`/`commit` caller.
//!
//! [`MemDisk`] is the in-memory reference device used by tests and
//! benchmarks, with one-shot fault injection so error propagation is
//! exercisable.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::StorageError;

/// Identity of a storage block: device number plus block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub device: u32,
    pub block: u32,
}

impl BlockId {
    #[must_use]
    pub const fn new(device: u32, block: u32) -> Self {
        Self { device, block }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.block)
    }
}

/// Synchronous whole-block storage access.
///
/// `buf` is always exactly one block long. Implementations may park the
/// calling thread; they must not assume any pool lock is held (the cache
/// never holds a short lock across these calls).
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<(), StorageError>;
    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<(), StorageError>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_block(id, buf)
    }

    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<(), StorageError> {
        (**self).write_block(id, buf)
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<(), StorageError> {
        (**self).read_block(id, buf)
    }

    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<(), StorageError> {
        (**self).write_block(id, buf)
    }
}

/// In-memory block device.
///
/// Blocks `0..block_count` are valid on every device number; unwritten
/// blocks read back as zeroes. `fail_next_read`/`fail_next_write` arm a
/// one-shot I/O failure for the next matching call.
pub struct MemDisk {
    block_count: u32,
    block_size: usize,
    blocks: Mutex<HashMap<BlockId, Box<[u8]>>>,
    fail_read: AtomicBool,
    fail_write: AtomicBool,
}

impl MemDisk {
    #[must_use]
    pub fn new(block_count: u32, block_size: usize) -> Self {
        assert!(block_size > 0, "zero-sized blocks");
        Self {
            block_count,
            block_size,
            blocks: Mutex::new(HashMap::new()),
            fail_read: AtomicBool::new(false),
            fail_write: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Arm a one-shot failure on the next `read_block`.
    pub fn fail_next_read(&self) {
        self.fail_read.store(true, Ordering::SeqCst);
    }

    /// Arm a one-shot failure on the next `write_block`.
    pub fn fail_next_write(&self) {
        self.fail_write.store(true, Ordering::SeqCst);
    }

    fn check(&self, id: BlockId, len: usize) -> Result<(), StorageError> {
        if id.block >= self.block_count {
            return Err(StorageError::OutOfRange { id });
        }
        if len != self.block_size {
            return Err(StorageError::Io {
                id,
                msg: format!("buffer is {len} bytes, device block is {}", self.block_size),
            });
        }
        Ok(())
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, id: BlockId, buf: &mut [u8]) -> Result<(), StorageError> {
        self.check(id, buf.len())?;
        if self.fail_read.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io {
                id,
                msg: "injected read failure".into(),
            });
        }
        let blocks = self.blocks.lock();
        match blocks.get(&id) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_block(&self, id: BlockId, buf: &[u8]) -> Result<(), StorageError> {
        self.check(id, buf.len())?;
        if self.fail_write.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io {
                id,
                msg: "injected write failure".into(),
            });
        }
        self.blocks.lock().insert(id, buf.into());
        Ok(())
    }
}
