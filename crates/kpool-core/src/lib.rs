//! # kpool-core
//!
//! Resource-management core of a small multi-core kernel: two sharded,
//! lock-partitioned pools that every higher-level service draws on.
//!
//! - [`bcache`]: an identity-keyed cache of fixed-size storage blocks over a
//!   fixed slot pool, with LRU victim selection and cross-shard stealing.
//! - [`palloc`]: a reference-counted pool of fixed-size memory pages with
//!   per-shard free stacks and cross-shard stealing.
//!
//! Both pools follow one pattern: a shard-local fast path under a short
//! lock, a global ordering lock only for cross-shard migration, and a
//! bounded linear probe over the remaining shards. Short locks are never
//! held across a blocking call; the one long-lived lock (a buffer's
//! exclusive content lock) parks its waiters.
//!
//! Contract breaches (double free, unpin below zero, pinning a block the
//! cache does not hold) are fatal; only storage failures and page-pool
//! exhaustion are recoverable and surface as `Result`s.

#![deny(unsafe_code)]

pub mod bcache;
pub mod error;
pub mod palloc;
pub mod storage;

pub use bcache::{BufHandle, BufferCache, CacheStats};
pub use error::{Exhausted, StorageError};
pub use palloc::{AllocStats, PageAllocator, PageRef};
pub use storage::{BlockDevice, BlockId, MemDisk};
