/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus store: a fixed bucket schema over the substrate, typed item
//! operations, and the crash-consistency guard.
//!
//! ## Transactions
//!
//! [`Database::update`] runs a closure against a [`DbTx`], an overlay
//! transaction: reads see the transaction's own earlier writes, and on
//! success the whole overlay is committed as a single substrate write batch.
//! On error the overlay is dropped and the store is untouched. This gives
//! every backing transaction the read-your-writes semantics block validation
//! needs (a transaction may spend an output created earlier in the same
//! block).
//!
//! ## Consistency guard
//!
//! The substrate is atomic per batch, but a logical consensus operation (a
//! reorganization, say) spans many batches. The guard is two counters:
//! `GuardStart` is incremented when an operation begins, `GuardEnd` when it
//! finishes. Equal counters mean every started operation finished; unequal
//! counters at open mean the process died mid-operation and the store
//! requires external recovery — [`Database::open`] refuses it with
//! [`StoreError::Inconsistent`].
//!
//! ## One generic API
//!
//! All buckets share the same five generic operations plus the child-bucket
//! pair; entities go through the canonical codec at this boundary. There is
//! deliberately no per-bucket wrapper layer.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::ops::Bound;

use crate::encoding::{from_bytes, Decodable, DecodeError, Encodable};
use crate::store::buckets::{
    self, bucket_prefix, item_key, CONSISTENCY_GUARD, GUARD_END, GUARD_START, METADATA,
    METADATA_HEADER, METADATA_HEADER_KEY, METADATA_VERSION, METADATA_VERSION_KEY,
};
use crate::store::kv::{KVStore, StorageFailure, WriteBatch};

/// Error raised by the consensus store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The consistency guard counters disagree: a previous process died in
    /// the middle of a logical operation. No automatic recovery.
    Inconsistent,
    /// The store carries a different header or version than this build
    /// writes.
    BadMetadata,
    /// A required item was absent.
    NotFound { bucket: String },
    /// An insert hit a key that is already present. Duplicate inserts are a
    /// programmer error, never a data condition.
    DuplicateInsert { bucket: String },
    /// A child bucket was deleted while it still held items.
    NonEmptyBucket,
    /// An item was addressed to a child bucket that was never created.
    MissingBucket,
    /// A stored value failed to decode.
    Decode(DecodeError),
    /// The substrate failed.
    Failure(StorageFailure),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Inconsistent => {
                write!(f, "consistency guard mismatch: store requires recovery")
            }
            StoreError::BadMetadata => write!(f, "unrecognized store header or version"),
            StoreError::NotFound { bucket } => {
                write!(f, "requested item does not exist in bucket {}", bucket)
            }
            StoreError::DuplicateInsert { bucket } => {
                write!(f, "item already exists in bucket {}", bucket)
            }
            StoreError::NonEmptyBucket => write!(f, "cannot delete a bucket with items in it"),
            StoreError::MissingBucket => write!(f, "bucket does not exist"),
            StoreError::Decode(err) => write!(f, "stored value failed to decode: {}", err),
            StoreError::Failure(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<DecodeError> for StoreError {
    fn from(err: DecodeError) -> Self {
        StoreError::Decode(err)
    }
}

impl From<StorageFailure> for StoreError {
    fn from(err: StorageFailure) -> Self {
        StoreError::Failure(err)
    }
}

fn bucket_name(bucket: &[u8]) -> String {
    String::from_utf8_lossy(bucket).into_owned()
}

/// An overlay transaction. Writes collect in memory and shadow the backing
/// store for reads issued through the same transaction; they become durable
/// only when [`Database::update`] commits the overlay as one batch.
pub struct DbTx<'a, K: KVStore> {
    store: &'a K,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a, K: KVStore> DbTx<'a, K> {
    fn new(store: &'a K) -> Self {
        Self {
            store,
            writes: BTreeMap::new(),
        }
    }

    fn raw_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(overlaid) = self.writes.get(key) {
            return Ok(overlaid.clone());
        }
        Ok(self.store.get(key)?)
    }

    /// Every live key under `prefix`, ascending, with overlay writes and
    /// deletes folded in.
    fn raw_prefix_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut keys: BTreeSet<Vec<u8>> = self.store.prefix_keys(prefix)?.into_iter().collect();
        let overlay = self
            .writes
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix));
        for (key, value) in overlay {
            match value {
                Some(_) => {
                    keys.insert(key.clone());
                }
                None => {
                    keys.remove(key);
                }
            }
        }
        Ok(keys.into_iter().collect())
    }

    /* ↓↓↓ Generic item operations ↓↓↓ */

    pub fn exists(&self, bucket: &[u8], key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.raw_get(&item_key(bucket, key))?.is_some())
    }

    /// Fetch and decode an item, or `None` if absent.
    pub fn try_get<V: Decodable>(&self, bucket: &[u8], key: &[u8]) -> Result<Option<V>, StoreError> {
        match self.raw_get(&item_key(bucket, key))? {
            Some(bytes) => Ok(Some(from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch and decode an item that must exist.
    pub fn get<V: Decodable>(&self, bucket: &[u8], key: &[u8]) -> Result<V, StoreError> {
        self.try_get(bucket, key)?.ok_or(StoreError::NotFound {
            bucket: bucket_name(bucket),
        })
    }

    /// Insert a new item. The key must not already be present.
    pub fn insert<V: Encodable>(
        &mut self,
        bucket: &[u8],
        key: &[u8],
        value: &V,
    ) -> Result<(), StoreError> {
        let full_key = item_key(bucket, key);
        if self.raw_get(&full_key)?.is_some() {
            return Err(StoreError::DuplicateInsert {
                bucket: bucket_name(bucket),
            });
        }
        self.writes.insert(full_key, Some(value.to_bytes()));
        Ok(())
    }

    /// Insert or overwrite an item.
    pub fn put<V: Encodable>(&mut self, bucket: &[u8], key: &[u8], value: &V) {
        self.writes
            .insert(item_key(bucket, key), Some(value.to_bytes()));
    }

    /// Remove an item. The key must be present.
    pub fn remove(&mut self, bucket: &[u8], key: &[u8]) -> Result<(), StoreError> {
        let full_key = item_key(bucket, key);
        if self.raw_get(&full_key)?.is_none() {
            return Err(StoreError::NotFound {
                bucket: bucket_name(bucket),
            });
        }
        self.writes.insert(full_key, None);
        Ok(())
    }

    /// Visit every `(key, value)` pair in a bucket, in ascending key order.
    /// Key order carries no protocol meaning; callers needing deterministic
    /// processing get it from the ordering being stable.
    pub fn for_each<KT, V, F>(&self, bucket: &[u8], mut f: F) -> Result<(), StoreError>
    where
        KT: Decodable,
        V: Decodable,
        F: FnMut(KT, V) -> Result<(), StoreError>,
    {
        let prefix = bucket_prefix(bucket);
        for full_key in self.raw_prefix_keys(&prefix)? {
            let key: KT = from_bytes(&full_key[prefix.len()..])?;
            let bytes = self.raw_get(&full_key)?.ok_or(StoreError::NotFound {
                bucket: bucket_name(bucket),
            })?;
            let value: V = from_bytes(&bytes)?;
            f(key, value)?;
        }
        Ok(())
    }

    /// Every `(item key, value)` pair in a bucket as raw bytes, ascending.
    /// Used by full-store scans (state hashing, consistency checks) that do
    /// not know the bucket's value type statically.
    pub(crate) fn items(&self, bucket: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let prefix = bucket_prefix(bucket);
        let mut items = Vec::new();
        for full_key in self.raw_prefix_keys(&prefix)? {
            let bytes = self.raw_get(&full_key)?.ok_or(StoreError::NotFound {
                bucket: bucket_name(bucket),
            })?;
            items.push((full_key[prefix.len()..].to_vec(), bytes));
        }
        Ok(items)
    }

    pub fn bucket_len(&self, bucket: &[u8]) -> Result<u64, StoreError> {
        Ok(self.raw_prefix_keys(&bucket_prefix(bucket))?.len() as u64)
    }

    pub fn is_bucket_empty(&self, bucket: &[u8]) -> Result<bool, StoreError> {
        Ok(self.bucket_len(bucket)? == 0)
    }

    /* ↓↓↓ Child buckets ↓↓↓ */

    /// Register a per-height child bucket in its index bucket. The bucket
    /// must not already be registered.
    pub fn create_child_bucket(
        &mut self,
        index_bucket: &[u8],
        height_key: &[u8],
        child_bucket: &[u8],
    ) -> Result<(), StoreError> {
        self.insert(index_bucket, height_key, &child_bucket.to_vec())
    }

    pub fn child_bucket_exists(
        &self,
        index_bucket: &[u8],
        height_key: &[u8],
    ) -> Result<bool, StoreError> {
        self.exists(index_bucket, height_key)
    }

    /// Deregister a child bucket. It must be registered and empty.
    pub fn delete_child_bucket(
        &mut self,
        index_bucket: &[u8],
        height_key: &[u8],
        child_bucket: &[u8],
    ) -> Result<(), StoreError> {
        if !self.child_bucket_exists(index_bucket, height_key)? {
            return Err(StoreError::MissingBucket);
        }
        if !self.is_bucket_empty(child_bucket)? {
            return Err(StoreError::NonEmptyBucket);
        }
        self.remove(index_bucket, height_key)
    }
}

/// The consensus store: the substrate plus the schema and guard.
pub struct Database<K: KVStore> {
    store: K,
}

impl<K: KVStore> Database<K> {
    /// Adopt `store` as a consensus store. Writes the metadata header into a
    /// fresh store; verifies it in an existing one. Fails with
    /// [`StoreError::Inconsistent`] if the guard counters disagree, and
    /// resets them to equal otherwise.
    pub fn open(store: K) -> Result<Self, StoreError> {
        let mut db = Database { store };
        db.update(|tx| {
            match tx.try_get::<Vec<u8>>(METADATA, METADATA_HEADER_KEY)? {
                None => {
                    tx.put(METADATA, METADATA_HEADER_KEY, &METADATA_HEADER.to_vec());
                    tx.put(METADATA, METADATA_VERSION_KEY, &METADATA_VERSION.to_vec());
                }
                Some(header) if header == METADATA_HEADER => {
                    let version: Vec<u8> = tx.get(METADATA, METADATA_VERSION_KEY)?;
                    if version != METADATA_VERSION {
                        return Err(StoreError::BadMetadata);
                    }
                }
                Some(_) => return Err(StoreError::BadMetadata),
            }

            let start = tx.try_get::<u64>(CONSISTENCY_GUARD, GUARD_START)?;
            let end = tx.try_get::<u64>(CONSISTENCY_GUARD, GUARD_END)?;
            match (start, end) {
                (None, None) => {}
                (Some(start), Some(end)) if start == end => {}
                _ => return Err(StoreError::Inconsistent),
            }
            tx.put(CONSISTENCY_GUARD, GUARD_START, &1u64);
            tx.put(CONSISTENCY_GUARD, GUARD_END, &1u64);
            Ok(())
        })?;
        Ok(db)
    }

    /// A read-only view of the store. Writes issued through a view are
    /// discarded; mutate through [`Database::update`] instead.
    pub fn view(&self) -> DbTx<'_, K> {
        DbTx::new(&self.store)
    }

    /// Run `f` against an overlay transaction and, if it succeeds, commit
    /// the overlay as one atomic batch.
    pub fn update<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut DbTx<'_, K>) -> Result<T, E>,
    {
        let mut tx = DbTx::new(&self.store);
        let out = f(&mut tx)?;
        let writes = tx.writes;
        let mut wb = K::WriteBatch::new();
        for (key, value) in &writes {
            match value {
                Some(value) => wb.set(key, value),
                None => wb.delete(key),
            }
        }
        self.store
            .write(wb)
            .map_err(|err| E::from(StoreError::Failure(err)))?;
        Ok(out)
    }

    /// Open the guard around a logical consensus operation. Must observe
    /// equal counters; the increment of `GuardStart` is its own backing
    /// transaction.
    pub fn start_consistency_guard(&mut self) -> Result<(), StoreError> {
        self.update(|tx| {
            let start: u64 = tx.get(CONSISTENCY_GUARD, GUARD_START)?;
            let end: u64 = tx.get(CONSISTENCY_GUARD, GUARD_END)?;
            if start != end {
                return Err(StoreError::Inconsistent);
            }
            tx.put(CONSISTENCY_GUARD, GUARD_START, &(start + 1));
            Ok(())
        })
    }

    /// Close the guard: increment `GuardEnd` in a final backing transaction.
    pub fn stop_consistency_guard(&mut self) -> Result<(), StoreError> {
        self.update(|tx| {
            let end: u64 = tx.get(CONSISTENCY_GUARD, GUARD_END)?;
            tx.put(CONSISTENCY_GUARD, GUARD_END, &(end + 1));
            Ok(())
        })
    }

    /// Flush buffered substrate writes to durable storage.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        Ok(self.store.flush()?)
    }
}

/// Convenience: the key bytes for a per-height item.
pub fn height_key(height: crate::types::basic::BlockHeight) -> [u8; 8] {
    height.to_le_bytes()
}

pub use buckets::{dsco_bucket_name, fcex_bucket_name};
