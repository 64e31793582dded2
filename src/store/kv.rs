/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The interface the persistence substrate must provide.
//!
//! The consensus set stores all of its state in a key-value store of the
//! user's choosing, as long as that store can provide a type implementing
//! [`KVStore`]. The contract is small:
//!
//! - point reads and ordered prefix scans ([`KVGet`]),
//! - atomic batched writes ([`WriteBatch`] committed through
//!   [`KVStore::write`]): a batch is either fully visible after `write`
//!   returns, or — if the process dies first — not visible at all.
//!
//! One committed batch is one "backing transaction". Logical consensus
//! operations span several batches and are fenced by the consistency guard
//! in [`database`](crate::store::database), so the substrate itself never
//! needs multi-batch atomicity.
//!
//! [`RocksStore`](crate::store::rocks::RocksStore) is the production
//! implementation; [`MemStore`](crate::store::memory::MemStore) backs the
//! test suite.

use std::fmt::{self, Display, Formatter};

/// An I/O failure inside the substrate. Fatal to the operation in progress;
/// the consensus layer never retries internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageFailure(pub String);

impl Display for StorageFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "storage failure: {}", self.0)
    }
}

impl std::error::Error for StorageFailure {}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageFailure>;

    /// Every key beginning with `prefix`, in ascending byte order.
    fn prefix_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageFailure>;
}

pub trait KVStore: KVGet + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Atomically apply a batch of writes.
    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), StorageFailure>;

    /// Flush any buffered writes to durable storage.
    fn flush(&mut self) -> Result<(), StorageFailure>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}
