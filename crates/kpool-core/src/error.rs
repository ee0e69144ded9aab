//! Error types for the pool primitives.
//!
//! Only two conditions are recoverable: a storage collaborator failure
//! (propagated unchanged to the `load`/`commit` caller, no internal retry)
//! and page-pool exhaustion. Everything else — refcount underflow, misuse
//! of the locking contract, buffer-cache exhaustion with every slot
//! pinned — is a programming or sizing error and panics.

use thiserror::Error;

use crate::storage::BlockId;

/// Failure reported by the block-storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The device failed to transfer the block.
    #[error("i/o error on block {id}: {msg}")]
    Io { id: BlockId, msg: String },
    /// The block number lies outside the device.
    #[error("block {id} out of range")]
    OutOfRange { id: BlockId },
}

/// Every shard's free stack is empty.
///
/// An ordinary, reportable failure: the caller may shed load, reclaim, and
/// retry. Contrast with buffer-cache exhaustion, which is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page pool exhausted")]
pub struct Exhausted;
