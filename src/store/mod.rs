/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistence: the substrate contract, its two implementations, and the
//! consensus store built on top of them.

pub mod buckets;
pub mod database;
pub mod kv;
pub mod memory;
pub mod rocks;

pub use database::{Database, DbTx, StoreError};
pub use kv::{KVGet, KVStore, StorageFailure, WriteBatch};
pub use memory::MemStore;
pub use rocks::RocksStore;
