/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The production substrate, backed by RocksDB.
//!
//! RocksDB gives exactly the two properties the contract asks for: atomic
//! write batches and ordered prefix iteration. It also holds an exclusive
//! lock on the database directory, so a second process opening the same
//! store fails at `open` rather than corrupting anything.

use std::path::Path;

use rocksdb::{Direction, IteratorMode, DB};

use crate::store::kv::{KVGet, KVStore, StorageFailure, WriteBatch};

pub struct RocksStore(DB);

impl RocksStore {
    /// Open (creating if absent) the database at `path`. Fails if another
    /// process holds the store open.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RocksStore, StorageFailure> {
        let db = DB::open_default(path.as_ref()).map_err(|err| StorageFailure(err.to_string()))?;
        Ok(RocksStore(db))
    }
}

impl KVGet for RocksStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageFailure> {
        self.0
            .get(key)
            .map_err(|err| StorageFailure(err.to_string()))
    }

    fn prefix_keys(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StorageFailure> {
        let mut keys = Vec::new();
        let iter = self
            .0
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for entry in iter {
            let (key, _) = entry.map_err(|err| StorageFailure(err.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

impl KVStore for RocksStore {
    type WriteBatch = RocksWriteBatch;

    fn write(&mut self, wb: RocksWriteBatch) -> Result<(), StorageFailure> {
        self.0
            .write(wb.0)
            .map_err(|err| StorageFailure(err.to_string()))
    }

    fn flush(&mut self) -> Result<(), StorageFailure> {
        self.0
            .flush()
            .map_err(|err| StorageFailure(err.to_string()))
    }
}

pub struct RocksWriteBatch(rocksdb::WriteBatch);

impl WriteBatch for RocksWriteBatch {
    fn new() -> Self {
        RocksWriteBatch(rocksdb::WriteBatch::default())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.0.put(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.0.delete(key);
    }
}
