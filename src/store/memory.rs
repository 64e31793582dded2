/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! An in-memory substrate. Reference implementation of the [`KVStore`]
//! contract and the store the test suite runs against; it keeps no artifacts
//! on disk.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::store::kv::{KVGet, KVStore, StorageFailure, WriteBatch};

#[derive(Default)]
pub struct MemStore(BTreeMap<Vec<u8>, Vec<u8>>);

impl MemStore {
    pub fn new() -> MemStore {
        MemStore(BTreeMap::new())
    }
}

impl KVGet for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageFailure> {
        Ok(self.0.get(key).cloned())
    }

    fn prefix_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageFailure> {
        let keys = self
            .0
            .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys)
    }
}

impl KVStore for MemStore {
    type WriteBatch = MemWriteBatch;

    fn write(&mut self, wb: MemWriteBatch) -> Result<(), StorageFailure> {
        for (key, value) in wb.0 {
            match value {
                Some(value) => {
                    self.0.insert(key, value);
                }
                None => {
                    self.0.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StorageFailure> {
        Ok(())
    }
}

/// `None` marks a deletion. Later operations on a key shadow earlier ones,
/// matching the semantics of an on-disk write batch.
pub struct MemWriteBatch(BTreeMap<Vec<u8>, Option<Vec<u8>>>);

impl WriteBatch for MemWriteBatch {
    fn new() -> Self {
        MemWriteBatch(BTreeMap::new())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.insert(key.to_vec(), None);
    }
}
