/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block acceptance pipeline.
//!
//! Every block enters through [`ChainInner::accept_block`]: early rejection
//! of known and bad blocks, orphan bookkeeping, shape validation, placement
//! in the block tree, and — when the new block makes a heavier chain — the
//! fork-choice driver. One call may connect several blocks, because a parent
//! arriving can drain a whole subtree out of the orphan pool.
//!
//! Orphans are deliberately ephemeral (an in-memory index; peers re-send
//! after a crash) while bad-block verdicts are persistent, so a block is
//! never re-validated across restarts.

use std::cmp::min;
use std::collections::VecDeque;
use std::fmt::{self, Display, Formatter};

use indexmap::IndexMap;

use crate::chain::fork;
use crate::chain::subscribers::ConsensusChange;
use crate::chain::ChainInner;
use crate::logging;
use crate::store::buckets::{BAD_BLOCKS, BLOCK_MAP};
use crate::store::database::{DbTx, StoreError};
use crate::store::kv::KVStore;
use crate::types::basic::{BlockID, Target, Timestamp};
use crate::types::block::{Block, ProcessedBlock};
use crate::validate::block::{validate_header, BlockValidationError};
use crate::validate::transaction::TransactionError;

/// The orphan pool refuses new entries past this size; peers re-send.
const MAX_ORPHANS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptBlockError {
    /// The block is already in the block tree. Idempotent, non-fatal.
    BlockKnown,
    /// The block previously failed validation and is persistently marked.
    BadBlock,
    /// The block's parent is unknown; the block has been enrolled in the
    /// orphan pool and will connect if the parent arrives.
    UnknownOrphan,
    /// The block is already enrolled in the orphan pool.
    KnownOrphan,
    /// Timestamp not after the trailing median. Recorded as bad: the median
    /// only depends on the block's own ancestors, so this can never heal.
    EarlyTimestamp,
    /// Timestamp too far past the local clock. Not recorded as bad; the
    /// block may be resubmitted once the clock catches up.
    FutureBlock,
    /// Proof of work does not satisfy the target.
    MissedTarget,
    /// Encoded block exceeds the size limit.
    LargeBlock,
    /// Miner payouts do not sum to subsidy plus fees.
    MinerPayout,
    /// A transaction failed validation against the state the block builds
    /// on.
    InvalidTransaction(TransactionError),
    /// The store failed. Fatal to this operation.
    Storage(StoreError),
}

impl AcceptBlockError {
    fn from_validation(err: BlockValidationError) -> Self {
        match err {
            BlockValidationError::LargeBlock => AcceptBlockError::LargeBlock,
            BlockValidationError::EarlyTimestamp => AcceptBlockError::EarlyTimestamp,
            BlockValidationError::FutureBlock => AcceptBlockError::FutureBlock,
            BlockValidationError::MissedTarget => AcceptBlockError::MissedTarget,
            BlockValidationError::MinerPayout => AcceptBlockError::MinerPayout,
        }
    }

    /// Whether the store may be mid-mutation: if so the consistency guard is
    /// left open so the damage is detected at the next open.
    pub(crate) fn is_storage_failure(&self) -> bool {
        matches!(self, AcceptBlockError::Storage(_))
    }
}

impl Display for AcceptBlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AcceptBlockError::BlockKnown => write!(f, "block is already known"),
            AcceptBlockError::BadBlock => write!(f, "block is known to be invalid"),
            AcceptBlockError::UnknownOrphan => {
                write!(f, "block's parent is unknown; enrolled as orphan")
            }
            AcceptBlockError::KnownOrphan => write!(f, "block is already enrolled as an orphan"),
            AcceptBlockError::EarlyTimestamp => {
                write!(f, "block timestamp is not after the trailing median")
            }
            AcceptBlockError::FutureBlock => {
                write!(f, "block timestamp is too far in the future")
            }
            AcceptBlockError::MissedTarget => {
                write!(f, "block ID does not satisfy the required target")
            }
            AcceptBlockError::LargeBlock => write!(f, "block exceeds the size limit"),
            AcceptBlockError::MinerPayout => {
                write!(f, "miner payouts do not sum to subsidy plus fees")
            }
            AcceptBlockError::InvalidTransaction(err) => {
                write!(f, "invalid transaction: {}", err)
            }
            AcceptBlockError::Storage(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for AcceptBlockError {}

impl From<StoreError> for AcceptBlockError {
    fn from(err: StoreError) -> Self {
        AcceptBlockError::Storage(err)
    }
}

/// Blocks whose parents have not been observed, indexed by the missing
/// parent. Both maps preserve insertion order, so orphans connect in arrival
/// order when their parent shows up.
pub(crate) struct OrphanPool {
    missing_parents: IndexMap<BlockID, IndexMap<BlockID, Block>>,
    len: usize,
}

impl OrphanPool {
    pub(crate) fn new() -> Self {
        Self {
            missing_parents: IndexMap::new(),
            len: 0,
        }
    }

    /// Enroll `block` under its missing parent. The returned error is the
    /// outcome `accept_block` reports: `UnknownOrphan` on first sight,
    /// `KnownOrphan` on re-submission.
    fn enroll(&mut self, block: Block) -> AcceptBlockError {
        let id = block.id();
        let siblings = self.missing_parents.entry(block.parent_id).or_default();
        if siblings.contains_key(&id) {
            return AcceptBlockError::KnownOrphan;
        }
        if self.len >= MAX_ORPHANS {
            log::warn!(
                "{}, {}, {}, pool full",
                logging::ENROLL_ORPHAN,
                logging::secs_since_unix_epoch(),
                logging::first_seven_base64_chars(&id.bytes()),
            );
            return AcceptBlockError::UnknownOrphan;
        }
        siblings.insert(id, block);
        self.len += 1;
        AcceptBlockError::UnknownOrphan
    }

    /// Remove and return every orphan waiting on `parent`, in arrival order.
    fn take_children(&mut self, parent: &BlockID) -> Vec<Block> {
        match self.missing_parents.shift_remove(parent) {
            Some(children) => {
                self.len -= children.len();
                children.into_values().collect()
            }
            None => Vec::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Earliest timestamp a child of `parent` may carry: one second past the
/// median of the trailing timestamp window ending at `parent`.
pub(crate) fn earliest_child_timestamp<K: KVStore>(
    view: &DbTx<K>,
    parent: &ProcessedBlock,
    window: usize,
) -> Result<Timestamp, StoreError> {
    let mut timestamps = Vec::with_capacity(window);
    timestamps.push(parent.block.timestamp);
    let mut cursor = parent.clone();
    while timestamps.len() < window && cursor.height.int() > 0 {
        cursor = view.get(BLOCK_MAP, &cursor.parent_id().bytes())?;
        timestamps.push(cursor.block.timestamp);
    }
    timestamps.sort_unstable();
    let median = timestamps[timestamps.len() / 2];
    Ok(median.saturating_add(1))
}

/// The target a child of `parent` sets for its own children: the parent's
/// child target scaled by elapsed-over-expected time across the trailing
/// window, clamped per step. Pure and deterministic; every node computes the
/// same target for the same block.
fn child_target<K: KVStore>(
    view: &DbTx<K>,
    parent: &ProcessedBlock,
    block_timestamp: Timestamp,
    constants: &crate::constants::ProtocolConstants,
) -> Result<Target, StoreError> {
    let steps = min(parent.height.int() + 1, constants.target_window);
    let mut base = parent.clone();
    for _ in 1..steps {
        if base.height.int() == 0 {
            break;
        }
        base = view.get(BLOCK_MAP, &base.parent_id().bytes())?;
    }
    let elapsed = block_timestamp.int() as i64 - base.block.timestamp.int() as i64;
    let expected = constants.block_frequency * steps;
    let (numerator, denominator) = clamp_adjustment(elapsed, expected, constants);
    Ok(parent.child_target.mul_ratio(numerator, denominator))
}

/// Clamp `elapsed / expected` to the per-step adjustment bounds. A
/// non-positive elapsed time (timestamps are not monotonic) clamps all the
/// way down.
fn clamp_adjustment(
    elapsed: i64,
    expected: u64,
    constants: &crate::constants::ProtocolConstants,
) -> (u64, u64) {
    let (up_num, up_den) = constants.max_adjustment_up;
    let (down_num, down_den) = constants.max_adjustment_down;
    if elapsed <= 0 {
        return (down_num, down_den);
    }
    let elapsed = elapsed as u128;
    let expected_wide = expected as u128;
    if elapsed * up_den as u128 > up_num as u128 * expected_wide {
        (up_num, up_den)
    } else if elapsed * (down_den as u128) < down_num as u128 * expected_wide {
        (down_num, down_den)
    } else {
        (elapsed as u64, expected)
    }
}

impl<K: KVStore> ChainInner<K> {
    /// The entry point for raw blocks. See the module docs for the pipeline;
    /// the returned error describes the submitted block only — orphans that
    /// fail to connect as a side effect are logged, not surfaced.
    pub(crate) fn accept_block(
        &mut self,
        block: Block,
        now: Timestamp,
    ) -> Result<(), AcceptBlockError> {
        let id = block.id();
        {
            let view = self.db.view();
            if view.exists(BAD_BLOCKS, &id.bytes())? {
                return Err(AcceptBlockError::BadBlock);
            }
            if view.exists(BLOCK_MAP, &id.bytes())? {
                return Err(AcceptBlockError::BlockKnown);
            }
            if !view.exists(BLOCK_MAP, &block.parent_id.bytes())? {
                return Err(self.orphans.enroll(block));
            }
        }

        self.connect_block(block, now)?;

        // The new block may be the missing parent of enrolled orphans, and
        // each connected orphan may in turn be one. Connect breadth-first in
        // arrival order; failures are local to the orphan.
        let mut connected = VecDeque::from([id]);
        while let Some(parent_id) = connected.pop_front() {
            for orphan in self.orphans.take_children(&parent_id) {
                let orphan_id = orphan.id();
                match self.connect_block(orphan, now) {
                    Ok(()) => connected.push_back(orphan_id),
                    Err(err) => log::warn!(
                        "{}, {}, {}, orphan failed to connect: {}",
                        logging::REJECT_BLOCK,
                        logging::secs_since_unix_epoch(),
                        logging::first_seven_base64_chars(&orphan_id.bytes()),
                        err
                    ),
                }
            }
        }
        Ok(())
    }

    /// Accept a block whose parent is in the block tree: validate its shape,
    /// place it, and reorganize if it creates a heavier chain. One guarded
    /// logical operation.
    fn connect_block(&mut self, block: Block, now: Timestamp) -> Result<(), AcceptBlockError> {
        let id = block.id();
        let parent: ProcessedBlock = self.db.view().get(BLOCK_MAP, &block.parent_id.bytes())?;
        let height = parent.height + 1;
        let target = parent.child_target;
        let minimum_timestamp = earliest_child_timestamp(
            &self.db.view(),
            &parent,
            self.constants.median_timestamp_window,
        )?;

        if let Err(err) =
            validate_header(&block, target, height, minimum_timestamp, now, &self.constants)
        {
            log::warn!(
                "{}, {}, {}, {}",
                logging::REJECT_BLOCK,
                logging::secs_since_unix_epoch(),
                logging::first_seven_base64_chars(&id.bytes()),
                err
            );
            if !matches!(err, BlockValidationError::FutureBlock) {
                self.mark_bad(id)?;
            }
            return Err(AcceptBlockError::from_validation(err));
        }

        let child_target =
            child_target(&self.db.view(), &parent, block.timestamp, &self.constants)?;
        let cumulative_work = parent
            .cumulative_work
            .checked_add(target.work())
            .ok_or(StoreError::Inconsistent)?;
        let pb = ProcessedBlock::new(block, height, child_target, cumulative_work);

        self.db.start_consistency_guard()?;
        match self.add_to_tree_and_fork(pb) {
            Ok(change) => {
                self.db.stop_consistency_guard()?;
                log::info!(
                    "{}, {}, {}, {}",
                    logging::ACCEPT_BLOCK,
                    logging::secs_since_unix_epoch(),
                    logging::first_seven_base64_chars(&id.bytes()),
                    height
                );
                if let Some(change) = change {
                    self.subscribers.notify(&change);
                }
                Ok(())
            }
            Err(err) if err.is_storage_failure() => {
                // The store may be half-mutated; leaving the guard open
                // marks it inconsistent for the next open.
                Err(err)
            }
            Err(err) => {
                // Validation failure inside the fork: the original path has
                // been restored, so the logical operation closes cleanly.
                self.db.stop_consistency_guard()?;
                Err(err)
            }
        }
    }

    /// Insert `pb` into the block tree and, if it now carries strictly the
    /// most cumulative work, drive the reorganization. Equal work never
    /// displaces the current tip.
    fn add_to_tree_and_fork(
        &mut self,
        pb: ProcessedBlock,
    ) -> Result<Option<ConsensusChange>, AcceptBlockError> {
        let id = pb.id();
        self.db
            .update(|tx| tx.insert(BLOCK_MAP, &id.bytes(), &pb))?;
        let current_tip: ProcessedBlock = self.db.view().get(BLOCK_MAP, &self.tip_id.bytes())?;
        if pb.cumulative_work > current_tip.cumulative_work {
            Ok(Some(fork::reorganize(self, pb)?))
        } else {
            Ok(None)
        }
    }

    pub(crate) fn mark_bad(&mut self, id: BlockID) -> Result<(), StoreError> {
        self.db.update(|tx| {
            tx.put(BAD_BLOCKS, &id.bytes(), &true);
            Ok(())
        })
    }
}
