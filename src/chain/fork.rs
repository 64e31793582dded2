/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The fork-choice driver: moving the canonical tip to a heavier block.
//!
//! [`reorganize`] walks from the candidate tip down its parent links until it
//! meets the current canonical path — that block is the common ancestor. It
//! then reverts the canonical chain down to the ancestor and applies the new
//! branch upwards, validating each block that has never been applied before
//! against the state it would actually extend.
//!
//! If a block on the way up proves invalid, the whole reorganization is
//! unwound: the blocks applied so far are reverted, the original chain is
//! re-applied, and the offending block is expelled from the tree and marked
//! bad. All of this happens inside the caller's consistency-guard window, so
//! a crash at any point is detected at the next open.

use crate::chain::accept::AcceptBlockError;
use crate::chain::diffs::{commit_diff_set, generate_and_apply_diff};
use crate::chain::subscribers::ConsensusChange;
use crate::chain::ChainInner;
use crate::logging;
use crate::store::buckets::{BAD_BLOCKS, BLOCK_MAP, BLOCK_PATH};
use crate::store::database::{height_key, StoreError};
use crate::store::kv::KVStore;
use crate::types::basic::BlockID;
use crate::types::block::ProcessedBlock;
use crate::types::diff::DiffDirection;

/// Make `new_tip` the canonical tip. The caller has established that it
/// carries strictly more cumulative work than the current tip and holds the
/// consistency guard open.
///
/// Returns the committed change: reverted blocks ordered old-tip-first,
/// applied blocks ordered ancestor-first.
pub(crate) fn reorganize<K: KVStore>(
    inner: &mut ChainInner<K>,
    new_tip: ProcessedBlock,
) -> Result<ConsensusChange, AcceptBlockError> {
    // Walk the new branch down to the common ancestor: the first ancestor
    // that sits on the current canonical path.
    let mut branch: Vec<ProcessedBlock> = Vec::new();
    let mut cursor = new_tip;
    loop {
        let on_path = {
            let view = inner.db.view();
            view.try_get::<BlockID>(BLOCK_PATH, &height_key(cursor.height))? == Some(cursor.id())
        };
        if on_path {
            break;
        }
        let parent_id = cursor.parent_id();
        branch.push(cursor);
        cursor = inner.db.view().get(BLOCK_MAP, &parent_id.bytes())?;
    }
    let ancestor = cursor;

    // Revert the canonical chain down to the ancestor, newest first. Each
    // revert is one backing transaction.
    let mut reverted: Vec<ProcessedBlock> = Vec::new();
    while inner.tip_id != ancestor.id() {
        let tip: ProcessedBlock = inner.db.view().get(BLOCK_MAP, &inner.tip_id.bytes())?;
        inner
            .db
            .update(|tx| commit_diff_set(tx, &tip, DiffDirection::Revert, &inner.constants))?;
        inner.tip_height = tip
            .height
            .checked_sub(1)
            .ok_or(StoreError::Inconsistent)?;
        inner.tip_id = tip.parent_id();
        reverted.push(tip);
    }

    // Apply the new branch from the ancestor up. Blocks already carrying
    // diffs replay them; new blocks are validated and have diffs generated
    // against the state as it stands.
    let mut applied: Vec<ProcessedBlock> = Vec::new();
    for pb in branch.iter().rev() {
        let outcome = if pb.diffs_generated {
            inner
                .db
                .update(|tx| commit_diff_set(tx, pb, DiffDirection::Apply, &inner.constants))
                .map(|()| pb.clone())
                .map_err(AcceptBlockError::Storage)
        } else {
            generate_and_apply_diff(&mut inner.db, &inner.constants, pb)
        };
        match outcome {
            Ok(pb) => {
                inner.tip_height = pb.height;
                inner.tip_id = pb.id();
                applied.push(pb);
            }
            Err(err) if err.is_storage_failure() => return Err(err),
            Err(err) => {
                let bad_id = pb.id();
                restore_original_path(inner, &applied, &reverted)?;
                inner.db.update::<(), StoreError, _>(|tx| {
                    tx.remove(BLOCK_MAP, &bad_id.bytes())?;
                    tx.put(BAD_BLOCKS, &bad_id.bytes(), &true);
                    Ok(())
                })?;
                log::warn!(
                    "{}, {}, {}, invalid block in fork: {}",
                    logging::REJECT_BLOCK,
                    logging::secs_since_unix_epoch(),
                    logging::first_seven_base64_chars(&bad_id.bytes()),
                    err
                );
                return Err(err);
            }
        }
    }

    if !reverted.is_empty() {
        log::info!(
            "{}, {}, {}, {}",
            logging::REORGANIZATION,
            logging::secs_since_unix_epoch(),
            reverted.len(),
            applied.len()
        );
    }

    Ok(ConsensusChange {
        reverted_blocks: reverted.iter().map(|pb| pb.block.clone()).collect(),
        applied_blocks: applied.iter().map(|pb| pb.block.clone()).collect(),
    })
}

/// Undo a partially-applied fork: revert what was applied (newest first) and
/// re-apply the originally-reverted chain (oldest first). Every block here
/// has generated diffs, so this cannot fail validation — only the store can
/// fail, in which case the open guard records the damage.
fn restore_original_path<K: KVStore>(
    inner: &mut ChainInner<K>,
    applied: &[ProcessedBlock],
    reverted: &[ProcessedBlock],
) -> Result<(), StoreError> {
    for pb in applied.iter().rev() {
        inner
            .db
            .update(|tx| commit_diff_set(tx, pb, DiffDirection::Revert, &inner.constants))?;
        inner.tip_height = pb
            .height
            .checked_sub(1)
            .ok_or(StoreError::Inconsistent)?;
        inner.tip_id = pb.parent_id();
    }
    for pb in reverted.iter().rev() {
        inner
            .db
            .update(|tx| commit_diff_set(tx, pb, DiffDirection::Apply, &inner.constants))?;
        inner.tip_height = pb.height;
        inner.tip_id = pb.id();
    }
    Ok(())
}
