/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus set of a proof-of-work blockchain: a deterministic,
//! persistent state machine that ingests candidate blocks, validates them
//! against protocol rules, maintains the heaviest valid chain, and exposes
//! the set of currently-spendable outputs and live contracts.
//!
//! ## Architecture
//!
//! - [`store`] — the persistence substrate contract ([`KVStore`]) with a
//!   RocksDB production implementation and an in-memory test one, plus the
//!   bucketed consensus store and its crash-consistency guard.
//! - [`encoding`] — the canonical byte codec every entity round-trips
//!   through; byte-exact for protocol compatibility.
//! - [`types`] — blocks, transactions, identifiers, and the reversible
//!   diffs that tie blocks to state.
//! - [`validate`] — pure block-shape and transaction checks.
//! - [`chain`] — the block tree, orphan pool, difficulty retargeting,
//!   fork-choice driver, diff engine, and subscriber notifications, all
//!   behind [`ConsensusSet`].
//!
//! ## Concurrency
//!
//! One writer, many readers: [`ConsensusSet::accept_block`] and
//! subscription replay serialize behind an exclusive lock; every query
//! takes a shared lock and observes only committed state.

pub mod chain;
pub mod constants;
pub mod crypto;
pub mod encoding;
pub(crate) mod logging;
pub mod store;
pub mod types;
pub mod validate;

pub use chain::{
    AcceptBlockError, ConsensusChange, ConsensusSet, ConsensusSetSubscriber, SubscribeError,
    SubscriberHandle,
};
pub use constants::ProtocolConstants;
pub use store::{KVGet, KVStore, MemStore, RocksStore, StorageFailure, StoreError, WriteBatch};
pub use types::basic::{
    BlockHeight, BlockID, Currency, FileContractID, Hash, PublicKey, SiacoinOutputID,
    SiafundOutputID, Target, Timestamp, TransactionID, UnlockHash, Work,
};
pub use types::block::{Block, ProcessedBlock};
pub use types::transaction::{
    CoveredFields, FileContract, SiacoinInput, SiacoinOutput, SiafundInput, SiafundOutput,
    StorageProof, Transaction, TransactionSignature, UnlockConditions,
};
pub use validate::transaction::TransactionError;
