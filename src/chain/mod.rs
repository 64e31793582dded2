/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus set: the authoritative, persistent state machine that
//! ingests candidate blocks, maintains the heaviest valid chain, and exposes
//! the currently-spendable outputs and live contracts.
//!
//! [`ConsensusSet`] is the public face. All mutation funnels through
//! [`ConsensusSet::accept_block`] behind a single writer lock; queries share
//! a read lock and see only committed state. Consumers that need to track
//! every tip change subscribe with
//! [`ConsensusSet::consensus_change_subscribe`].

pub mod accept;
pub mod diffs;
pub mod fork;
pub mod invariants;
pub mod subscribers;

use std::sync::RwLock;

use crate::constants::ProtocolConstants;
use crate::store::buckets::{
    BLOCK_MAP, BLOCK_PATH, FILE_CONTRACTS, SIACOIN_OUTPUTS, SIAFUND_OUTPUTS,
};
use crate::store::database::{height_key, Database, StoreError};
use crate::store::kv::{KVStore, StorageFailure};
use crate::store::rocks::RocksStore;
use crate::types::basic::{
    BlockHeight, BlockID, Currency, FileContractID, Hash, SiacoinOutputID, SiafundOutputID,
    Target, Timestamp, Work,
};
use crate::types::block::{Block, ProcessedBlock};
use crate::types::transaction::{FileContract, SiacoinOutput, SiafundOutput};

pub use accept::AcceptBlockError;
pub use subscribers::{
    ConsensusChange, ConsensusSetSubscriber, SubscribeError, SubscriberHandle,
};

use accept::OrphanPool;
use subscribers::SubscriberRegistry;

/// Everything behind the writer lock: the store, the protocol parameters,
/// the cached tip, the orphan pool, and the subscriber list.
pub(crate) struct ChainInner<K: KVStore> {
    pub(crate) db: Database<K>,
    pub(crate) constants: ProtocolConstants,
    pub(crate) tip_height: BlockHeight,
    pub(crate) tip_id: BlockID,
    pub(crate) orphans: OrphanPool,
    pub(crate) subscribers: SubscriberRegistry,
    genesis_id: BlockID,
}

pub struct ConsensusSet<K: KVStore> {
    inner: RwLock<ChainInner<K>>,
}

fn lock_poisoned() -> StoreError {
    StoreError::Failure(StorageFailure("writer lock poisoned".to_string()))
}

impl ConsensusSet<RocksStore> {
    /// Open (creating if absent) the consensus set persisted at `path`.
    /// Fails with [`StoreError::Inconsistent`] if a previous process died
    /// mid-operation.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, StoreError> {
        Self::new(RocksStore::open(path)?, ProtocolConstants::default())
    }
}

impl<K: KVStore> ConsensusSet<K> {
    /// Adopt `store` as the backing substrate. A fresh store is seeded with
    /// the genesis block and its siafund allocation; an existing store must
    /// carry the same genesis.
    pub fn new(store: K, constants: ProtocolConstants) -> Result<Self, StoreError> {
        let mut db = Database::open(store)?;
        let genesis = constants.genesis_block();
        let genesis_id = genesis.id();

        let stored_genesis: Option<BlockID> = db
            .view()
            .try_get(BLOCK_PATH, &height_key(BlockHeight::new(0)))?;
        let (tip_height, tip_id) = match stored_genesis {
            None => {
                db.update::<(), StoreError, _>(|tx| {
                    let mut pb = ProcessedBlock::new(
                        genesis.clone(),
                        BlockHeight::new(0),
                        constants.root_target,
                        Work::ZERO,
                    );
                    // Genesis is never validated or reverted; it is applied
                    // here, directly, exactly once.
                    pb.diffs_generated = true;
                    tx.insert(BLOCK_MAP, &genesis_id.bytes(), &pb)?;
                    tx.insert(BLOCK_PATH, &height_key(BlockHeight::new(0)), &genesis_id)?;
                    for txn in &genesis.transactions {
                        for (index, output) in txn.siafund_outputs.iter().enumerate() {
                            tx.insert(
                                SIAFUND_OUTPUTS,
                                &txn.siafund_output_id(index as u64).bytes(),
                                output,
                            )?;
                        }
                    }
                    tx.put(
                        crate::store::buckets::SIAFUND_POOL,
                        crate::store::buckets::SIAFUND_POOL,
                        &Currency::ZERO,
                    );
                    Ok(())
                })?;
                (BlockHeight::new(0), genesis_id)
            }
            Some(stored) => {
                if stored != genesis_id {
                    // A store seeded from a different genesis is a different
                    // network entirely.
                    return Err(StoreError::BadMetadata);
                }
                let length = db.view().bucket_len(BLOCK_PATH)?;
                let tip_height = BlockHeight::new(length.saturating_sub(1));
                let tip_id: BlockID = db.view().get(BLOCK_PATH, &height_key(tip_height))?;
                (tip_height, tip_id)
            }
        };

        Ok(Self {
            inner: RwLock::new(ChainInner {
                db,
                constants,
                tip_height,
                tip_id,
                orphans: OrphanPool::new(),
                subscribers: SubscriberRegistry::new(),
                genesis_id,
            }),
        })
    }

    /// Flush the store and release it.
    pub fn close(self) -> Result<(), StoreError> {
        let mut guard = self.inner.write().map_err(|_| lock_poisoned())?;
        guard.db.flush()
    }

    /* ↓↓↓ Mutation ↓↓↓ */

    /// Submit a block. On success the block is in the block tree, the
    /// canonical chain is the heaviest known valid chain, and subscribers
    /// have been notified of any tip change. Every validation failure leaves
    /// the consensus state exactly as it was.
    pub fn accept_block(&self, block: Block) -> Result<(), AcceptBlockError> {
        let mut guard = self
            .inner
            .write()
            .map_err(|_| AcceptBlockError::Storage(lock_poisoned()))?;
        guard.accept_block(block, Timestamp::now())
    }

    /* ↓↓↓ Queries ↓↓↓ */

    pub fn height(&self) -> Result<BlockHeight, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        Ok(guard.tip_height)
    }

    pub fn current_block(&self) -> Result<Block, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        let pb: ProcessedBlock = guard.db.view().get(BLOCK_MAP, &guard.tip_id.bytes())?;
        Ok(pb.block)
    }

    /// The target the next block must satisfy.
    pub fn current_target(&self) -> Result<Target, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        let pb: ProcessedBlock = guard.db.view().get(BLOCK_MAP, &guard.tip_id.bytes())?;
        Ok(pb.child_target)
    }

    /// The earliest timestamp the next block may carry.
    pub fn earliest_timestamp(&self) -> Result<Timestamp, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        let view = guard.db.view();
        let pb: ProcessedBlock = view.get(BLOCK_MAP, &guard.tip_id.bytes())?;
        accept::earliest_child_timestamp(&view, &pb, guard.constants.median_timestamp_window)
    }

    pub fn block_at_height(&self, height: BlockHeight) -> Result<Option<Block>, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        let view = guard.db.view();
        let id: Option<BlockID> = view.try_get(BLOCK_PATH, &height_key(height))?;
        match id {
            Some(id) => {
                let pb: ProcessedBlock = view.get(BLOCK_MAP, &id.bytes())?;
                Ok(Some(pb.block))
            }
            None => Ok(None),
        }
    }

    /// Whether a block is in the block tree, canonical or not.
    pub fn block_known(&self, id: BlockID) -> Result<bool, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        guard.db.view().exists(BLOCK_MAP, &id.bytes())
    }

    pub fn genesis_id(&self) -> Result<BlockID, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        Ok(guard.genesis_id)
    }

    pub fn siacoin_output(
        &self,
        id: SiacoinOutputID,
    ) -> Result<Option<SiacoinOutput>, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        guard.db.view().try_get(SIACOIN_OUTPUTS, &id.bytes())
    }

    pub fn siafund_output(
        &self,
        id: SiafundOutputID,
    ) -> Result<Option<SiafundOutput>, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        guard.db.view().try_get(SIAFUND_OUTPUTS, &id.bytes())
    }

    pub fn file_contract(&self, id: FileContractID) -> Result<Option<FileContract>, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        guard.db.view().try_get(FILE_CONTRACTS, &id.bytes())
    }

    pub fn siafund_pool(&self) -> Result<Currency, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        diffs::siafund_pool(&guard.db.view())
    }

    /// Digest of the full consensus state. Two nodes on the same chain agree
    /// on this hash; a diagnostic, not a protocol object.
    pub fn state_hash(&self) -> Result<Hash, StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        invariants::state_hash(&guard.db.view(), guard.tip_height)
    }

    /// Run the full-scan invariant checks against the committed state.
    pub fn check_consistency(&self) -> Result<(), StoreError> {
        let guard = self.inner.read().map_err(|_| lock_poisoned())?;
        invariants::check_consistency(&guard.db.view(), &guard.constants, guard.tip_height)
    }

    /* ↓↓↓ Subscriptions ↓↓↓ */

    /// Register a subscriber. Before receiving live updates it is replayed
    /// the canonical chain — from genesis, or from just above `resume_from`,
    /// which must be a block on the current path — one change per height.
    pub fn consensus_change_subscribe(
        &self,
        mut subscriber: Box<dyn ConsensusSetSubscriber + Send>,
        resume_from: Option<BlockID>,
    ) -> Result<SubscriberHandle, SubscribeError> {
        let mut guard = self.inner.write().map_err(|_| lock_poisoned())?;
        let inner = &mut *guard;

        let start = match resume_from {
            None => 0,
            Some(id) => {
                let view = inner.db.view();
                let pb: ProcessedBlock = view
                    .try_get(BLOCK_MAP, &id.bytes())?
                    .ok_or(SubscribeError::UnknownResumePoint)?;
                let on_path: Option<BlockID> = view.try_get(BLOCK_PATH, &height_key(pb.height))?;
                if on_path != Some(id) {
                    return Err(SubscribeError::UnknownResumePoint);
                }
                pb.height.int() + 1
            }
        };

        for height in start..=inner.tip_height.int() {
            let view = inner.db.view();
            let id: BlockID = view.get(BLOCK_PATH, &height_key(BlockHeight::new(height)))?;
            let pb: ProcessedBlock = view.get(BLOCK_MAP, &id.bytes())?;
            let change = ConsensusChange {
                reverted_blocks: Vec::new(),
                applied_blocks: vec![pb.block],
            };
            subscriber.process_consensus_change(&change);
        }

        Ok(inner.subscribers.register(subscriber))
    }

    /// Drop a subscription. Unknown handles are a no-op.
    pub fn unsubscribe(&self, handle: SubscriberHandle) {
        if let Ok(mut guard) = self.inner.write() {
            guard.subscribers.unregister(handle);
        }
    }
}
