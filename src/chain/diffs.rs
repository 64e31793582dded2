/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The diff engine: turning an accepted block into a reversible delta, and
//! replaying or unwinding that delta against the store.
//!
//! [`generate_and_apply_diff`] runs the first time a block joins the
//! canonical chain: it validates each transaction against the evolving
//! overlay, records every state mutation as a diff on the block, and commits
//! block, diffs, and path extension in one backing transaction.
//!
//! [`commit_diff_set`] replays a block whose diffs already exist — forwards
//! when a reorganization re-applies it, backwards (reverse order, directions
//! inverted) when it is reverted. Apply followed by revert is an exact
//! identity on the store.
//!
//! Delayed-output buckets follow the height being applied: applying height
//! `h` creates the bucket maturing at `h + maturity_delay` and deletes the
//! just-drained bucket at `h`; reverting does the opposite. Expiration-set
//! buckets instead follow contract diffs, so the "live contract ⇔ expiration
//! entry" invariant holds by construction.

use crate::chain::accept::AcceptBlockError;
use crate::constants::ProtocolConstants;
use crate::store::buckets::{
    BLOCK_MAP, BLOCK_PATH, DSCO_BUCKETS, FILE_CONTRACTS, FILE_CONTRACT_EXPIRATIONS,
    SIACOIN_OUTPUTS, SIAFUND_OUTPUTS, SIAFUND_POOL,
};
use crate::store::database::{
    dsco_bucket_name, fcex_bucket_name, height_key, Database, DbTx, StoreError,
};
use crate::store::kv::KVStore;
use crate::types::basic::{BlockHeight, BlockID, Currency, FileContractID, SiacoinOutputID};
use crate::types::block::ProcessedBlock;
use crate::types::diff::{
    DelayedSiacoinOutputDiff, DiffDirection, FileContractDiff, SiacoinOutputDiff,
    SiafundOutputDiff,
};
use crate::types::transaction::{FileContract, SiacoinOutput, SiafundOutput, Transaction};
use crate::validate::transaction::{valid_transaction, TransactionError};

pub(crate) fn siafund_pool<K: KVStore>(tx: &DbTx<K>) -> Result<Currency, StoreError> {
    Ok(tx
        .try_get(SIAFUND_POOL, SIAFUND_POOL)?
        .unwrap_or(Currency::ZERO))
}

fn set_siafund_pool<K: KVStore>(tx: &mut DbTx<K>, pool: Currency) {
    tx.put(SIAFUND_POOL, SIAFUND_POOL, &pool);
}

fn map_transaction_error(err: TransactionError) -> AcceptBlockError {
    match err {
        TransactionError::Storage(err) => AcceptBlockError::Storage(err),
        other => AcceptBlockError::InvalidTransaction(other),
    }
}

/// The direction a recorded diff is executed in when the block moves
/// `block_direction` through the chain.
fn effective(diff_direction: DiffDirection, block_direction: DiffDirection) -> DiffDirection {
    match block_direction {
        DiffDirection::Apply => diff_direction,
        DiffDirection::Revert => diff_direction.inverse(),
    }
}

fn commit_siacoin_output_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    diff: &SiacoinOutputDiff,
    block_direction: DiffDirection,
) -> Result<(), StoreError> {
    match effective(diff.direction, block_direction) {
        DiffDirection::Apply => tx.insert(SIACOIN_OUTPUTS, &diff.id.bytes(), &diff.output),
        DiffDirection::Revert => tx.remove(SIACOIN_OUTPUTS, &diff.id.bytes()),
    }
}

/// A contract carries its expiration-set entry with it: inserting the
/// contract registers it under its window end (creating the bucket lazily),
/// removing it clears the entry and deletes the bucket once empty.
fn commit_file_contract_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    diff: &FileContractDiff,
    block_direction: DiffDirection,
) -> Result<(), StoreError> {
    let expiration_key = height_key(diff.contract.window_end);
    let bucket = fcex_bucket_name(diff.contract.window_end);
    match effective(diff.direction, block_direction) {
        DiffDirection::Apply => {
            tx.insert(FILE_CONTRACTS, &diff.id.bytes(), &diff.contract)?;
            if !tx.child_bucket_exists(FILE_CONTRACT_EXPIRATIONS, &expiration_key)? {
                tx.create_child_bucket(FILE_CONTRACT_EXPIRATIONS, &expiration_key, &bucket)?;
            }
            tx.insert(&bucket, &diff.id.bytes(), &true)
        }
        DiffDirection::Revert => {
            tx.remove(FILE_CONTRACTS, &diff.id.bytes())?;
            tx.remove(&bucket, &diff.id.bytes())?;
            if tx.is_bucket_empty(&bucket)? {
                tx.delete_child_bucket(FILE_CONTRACT_EXPIRATIONS, &expiration_key, &bucket)?;
            }
            Ok(())
        }
    }
}

fn commit_siafund_output_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    diff: &SiafundOutputDiff,
    block_direction: DiffDirection,
) -> Result<(), StoreError> {
    match effective(diff.direction, block_direction) {
        DiffDirection::Apply => tx.insert(SIAFUND_OUTPUTS, &diff.id.bytes(), &diff.output),
        DiffDirection::Revert => tx.remove(SIAFUND_OUTPUTS, &diff.id.bytes()),
    }
}

fn commit_delayed_output_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    diff: &DelayedSiacoinOutputDiff,
    block_direction: DiffDirection,
) -> Result<(), StoreError> {
    let bucket = dsco_bucket_name(diff.maturity_height);
    match effective(diff.direction, block_direction) {
        DiffDirection::Apply => {
            if !tx.child_bucket_exists(DSCO_BUCKETS, &height_key(diff.maturity_height))? {
                return Err(StoreError::MissingBucket);
            }
            tx.insert(&bucket, &diff.id.bytes(), &diff.output)
        }
        DiffDirection::Revert => tx.remove(&bucket, &diff.id.bytes()),
    }
}

/// Register the delayed-output bucket for outputs created by the block at
/// `height`.
fn create_maturity_bucket<K: KVStore>(
    tx: &mut DbTx<K>,
    height: BlockHeight,
    constants: &ProtocolConstants,
) -> Result<(), StoreError> {
    let maturity = height + constants.maturity_delay;
    tx.create_child_bucket(
        DSCO_BUCKETS,
        &height_key(maturity),
        &dsco_bucket_name(maturity),
    )
}

fn delete_bucket_if_registered<K: KVStore>(
    tx: &mut DbTx<K>,
    height: BlockHeight,
) -> Result<(), StoreError> {
    let key = height_key(height);
    if tx.child_bucket_exists(DSCO_BUCKETS, &key)? {
        tx.delete_child_bucket(DSCO_BUCKETS, &key, &dsco_bucket_name(height))?;
    }
    Ok(())
}

/// Replay the generated diffs of `pb` against the store, extending or
/// truncating the block path to match. `Revert` walks the diffs backwards
/// with directions inverted.
pub(crate) fn commit_diff_set<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &ProcessedBlock,
    block_direction: DiffDirection,
    constants: &ProtocolConstants,
) -> Result<(), StoreError> {
    if !pb.diffs_generated {
        return Err(StoreError::Inconsistent);
    }
    match block_direction {
        DiffDirection::Apply => {
            // The parent must be the current tip of the path.
            let parent: Option<BlockID> = match pb.height.checked_sub(1) {
                Some(parent_height) => tx.try_get(BLOCK_PATH, &height_key(parent_height))?,
                None => None,
            };
            if pb.height.int() > 0 && parent != Some(pb.parent_id()) {
                return Err(StoreError::Inconsistent);
            }

            create_maturity_bucket(tx, pb.height, constants)?;
            for diff in &pb.siacoin_output_diffs {
                commit_siacoin_output_diff(tx, diff, block_direction)?;
            }
            for diff in &pb.file_contract_diffs {
                commit_file_contract_diff(tx, diff, block_direction)?;
            }
            for diff in &pb.siafund_output_diffs {
                commit_siafund_output_diff(tx, diff, block_direction)?;
            }
            for diff in &pb.delayed_siacoin_output_diffs {
                commit_delayed_output_diff(tx, diff, block_direction)?;
            }
            set_siafund_pool(tx, pb.siafund_pool_diff.adjusted);
            // The bucket for this height was drained by the maturation
            // diffs above.
            delete_bucket_if_registered(tx, pb.height)?;
            tx.insert(BLOCK_PATH, &height_key(pb.height), &pb.id())
        }
        DiffDirection::Revert => {
            if tx.try_get::<BlockID>(BLOCK_PATH, &height_key(pb.height))? != Some(pb.id()) {
                return Err(StoreError::Inconsistent);
            }
            // Re-register the bucket this block's maturation diffs drained.
            // It existed before the block applied whenever a block deep
            // enough to have created it is on the path.
            if pb.height.int() > constants.maturity_delay {
                tx.create_child_bucket(
                    DSCO_BUCKETS,
                    &height_key(pb.height),
                    &dsco_bucket_name(pb.height),
                )?;
            }
            set_siafund_pool(tx, pb.siafund_pool_diff.previous);
            for diff in pb.delayed_siacoin_output_diffs.iter().rev() {
                commit_delayed_output_diff(tx, diff, block_direction)?;
            }
            for diff in pb.siafund_output_diffs.iter().rev() {
                commit_siafund_output_diff(tx, diff, block_direction)?;
            }
            for diff in pb.file_contract_diffs.iter().rev() {
                commit_file_contract_diff(tx, diff, block_direction)?;
            }
            for diff in pb.siacoin_output_diffs.iter().rev() {
                commit_siacoin_output_diff(tx, diff, block_direction)?;
            }
            // The bucket this block created is empty again once its delayed
            // diffs are unwound.
            delete_bucket_if_registered(tx, pb.height + constants.maturity_delay)?;
            tx.remove(BLOCK_PATH, &height_key(pb.height))
        }
    }
}

/// Record a diff on `pb` and execute it immediately, so later transactions
/// in the block see its effect.
fn record_siacoin_output_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    diff: SiacoinOutputDiff,
) -> Result<(), StoreError> {
    commit_siacoin_output_diff(tx, &diff, DiffDirection::Apply)?;
    pb.siacoin_output_diffs.push(diff);
    Ok(())
}

fn record_file_contract_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    diff: FileContractDiff,
) -> Result<(), StoreError> {
    commit_file_contract_diff(tx, &diff, DiffDirection::Apply)?;
    pb.file_contract_diffs.push(diff);
    Ok(())
}

fn record_siafund_output_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    diff: SiafundOutputDiff,
) -> Result<(), StoreError> {
    commit_siafund_output_diff(tx, &diff, DiffDirection::Apply)?;
    pb.siafund_output_diffs.push(diff);
    Ok(())
}

fn record_delayed_output_diff<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    diff: DelayedSiacoinOutputDiff,
) -> Result<(), StoreError> {
    commit_delayed_output_diff(tx, &diff, DiffDirection::Apply)?;
    pb.delayed_siacoin_output_diffs.push(diff);
    Ok(())
}

/// Apply one validated transaction, recording its diffs on `pb`.
fn apply_transaction<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    txn: &Transaction,
    constants: &ProtocolConstants,
) -> Result<(), AcceptBlockError> {
    let maturity = pb.height + constants.maturity_delay;

    for input in &txn.siacoin_inputs {
        let output: SiacoinOutput = tx.get(SIACOIN_OUTPUTS, &input.parent_id.bytes())?;
        record_siacoin_output_diff(
            tx,
            pb,
            SiacoinOutputDiff {
                direction: DiffDirection::Revert,
                id: input.parent_id,
                output,
            },
        )?;
    }
    for (index, output) in txn.siacoin_outputs.iter().enumerate() {
        record_siacoin_output_diff(
            tx,
            pb,
            SiacoinOutputDiff {
                direction: DiffDirection::Apply,
                id: txn.siacoin_output_id(index as u64),
                output: output.clone(),
            },
        )?;
    }
    for (index, contract) in txn.file_contracts.iter().enumerate() {
        record_file_contract_diff(
            tx,
            pb,
            FileContractDiff {
                direction: DiffDirection::Apply,
                id: txn.file_contract_id(index as u64),
                contract: contract.clone(),
            },
        )?;
        let pool = siafund_pool(tx)?;
        let pool = pool
            .checked_add(constants.tax(contract.payout))
            .ok_or(AcceptBlockError::InvalidTransaction(
                TransactionError::ArithmeticOverflow,
            ))?;
        set_siafund_pool(tx, pool);
    }
    for proof in &txn.storage_proofs {
        let contract: FileContract = tx.get(FILE_CONTRACTS, &proof.parent_id.bytes())?;
        for (index, output) in contract.valid_proof_outputs.iter().enumerate() {
            record_delayed_output_diff(
                tx,
                pb,
                DelayedSiacoinOutputDiff {
                    direction: DiffDirection::Apply,
                    id: proof.parent_id.proof_output_id(true, index as u64),
                    output: output.clone(),
                    maturity_height: maturity,
                },
            )?;
        }
        record_file_contract_diff(
            tx,
            pb,
            FileContractDiff {
                direction: DiffDirection::Revert,
                id: proof.parent_id,
                contract,
            },
        )?;
    }
    for input in &txn.siafund_inputs {
        let output: SiafundOutput = tx.get(SIAFUND_OUTPUTS, &input.parent_id.bytes())?;
        let claim = siafund_claim(siafund_pool(tx)?, &output, constants)
            .ok_or(AcceptBlockError::InvalidTransaction(
                TransactionError::ArithmeticOverflow,
            ))?;
        record_siafund_output_diff(
            tx,
            pb,
            SiafundOutputDiff {
                direction: DiffDirection::Revert,
                id: input.parent_id,
                output: output.clone(),
            },
        )?;
        if !claim.is_zero() {
            record_delayed_output_diff(
                tx,
                pb,
                DelayedSiacoinOutputDiff {
                    direction: DiffDirection::Apply,
                    id: input.parent_id.claim_output_id(),
                    output: SiacoinOutput {
                        value: claim,
                        unlock_hash: output.unlock_hash,
                    },
                    maturity_height: maturity,
                },
            )?;
        }
    }
    for (index, output) in txn.siafund_outputs.iter().enumerate() {
        let confirmed = SiafundOutput {
            value: output.value,
            unlock_hash: output.unlock_hash,
            // The pool snapshot is assigned here, by consensus; whatever the
            // transaction carried is ignored.
            claim_start: siafund_pool(tx)?,
        };
        record_siafund_output_diff(
            tx,
            pb,
            SiafundOutputDiff {
                direction: DiffDirection::Apply,
                id: txn.siafund_output_id(index as u64),
                output: confirmed,
            },
        )?;
    }
    Ok(())
}

/// The siacoins a siafund output has earned since its pool snapshot. Exact:
/// the tax keeps the pool a multiple of the siafund count.
pub(crate) fn siafund_claim(
    pool: Currency,
    output: &SiafundOutput,
    constants: &ProtocolConstants,
) -> Option<Currency> {
    let accrued = pool.checked_sub(output.claim_start)?;
    accrued
        .div(constants.siafund_count)
        .checked_mul(output.value.int() as u64)
}

/// Miner payouts become delayed outputs maturing a full delay after the
/// block that earned them.
fn apply_miner_payouts<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    constants: &ProtocolConstants,
) -> Result<(), StoreError> {
    let maturity = pb.height + constants.maturity_delay;
    let payouts: Vec<(SiacoinOutputID, SiacoinOutput)> = pb
        .block
        .miner_payouts
        .iter()
        .enumerate()
        .map(|(index, payout)| (pb.block.miner_payout_id(index as u64), payout.clone()))
        .collect();
    for (id, output) in payouts {
        record_delayed_output_diff(
            tx,
            pb,
            DelayedSiacoinOutputDiff {
                direction: DiffDirection::Apply,
                id,
                output,
                maturity_height: maturity,
            },
        )?;
    }
    Ok(())
}

/// Move every output delayed until this height into the spendable set, then
/// drop the emptied bucket.
fn apply_maturation<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
) -> Result<(), StoreError> {
    if !tx.child_bucket_exists(DSCO_BUCKETS, &height_key(pb.height))? {
        return Ok(());
    }
    let bucket = dsco_bucket_name(pb.height);
    let mut matured: Vec<(SiacoinOutputID, SiacoinOutput)> = Vec::new();
    tx.for_each(&bucket, |id: SiacoinOutputID, output: SiacoinOutput| {
        matured.push((id, output));
        Ok(())
    })?;
    for (id, output) in matured {
        record_delayed_output_diff(
            tx,
            pb,
            DelayedSiacoinOutputDiff {
                direction: DiffDirection::Revert,
                id,
                output: output.clone(),
                maturity_height: pb.height,
            },
        )?;
        record_siacoin_output_diff(
            tx,
            pb,
            SiacoinOutputDiff {
                direction: DiffDirection::Apply,
                id,
                output,
            },
        )?;
    }
    delete_bucket_if_registered(tx, pb.height)
}

/// Terminate every contract whose window ends at this height: its missed
/// proof outputs become delayed outputs and the contract leaves the state.
fn apply_contract_expirations<K: KVStore>(
    tx: &mut DbTx<K>,
    pb: &mut ProcessedBlock,
    constants: &ProtocolConstants,
) -> Result<(), StoreError> {
    if !tx.child_bucket_exists(FILE_CONTRACT_EXPIRATIONS, &height_key(pb.height))? {
        return Ok(());
    }
    let bucket = fcex_bucket_name(pb.height);
    let mut expiring: Vec<FileContractID> = Vec::new();
    tx.for_each(&bucket, |id: FileContractID, _: bool| {
        expiring.push(id);
        Ok(())
    })?;
    let maturity = pb.height + constants.maturity_delay;
    for id in expiring {
        let contract: FileContract = tx.get(FILE_CONTRACTS, &id.bytes())?;
        for (index, output) in contract.missed_proof_outputs.iter().enumerate() {
            record_delayed_output_diff(
                tx,
                pb,
                DelayedSiacoinOutputDiff {
                    direction: DiffDirection::Apply,
                    id: id.proof_output_id(false, index as u64),
                    output: output.clone(),
                    maturity_height: maturity,
                },
            )?;
        }
        record_file_contract_diff(
            tx,
            pb,
            FileContractDiff {
                direction: DiffDirection::Revert,
                id,
                contract,
            },
        )?;
    }
    Ok(())
}

/// Validate `pb`'s block against the state its parent left behind, recording
/// and applying its diffs, extending the path, and persisting the updated
/// processed block — all in one backing transaction. Returns the processed
/// block with diffs attached.
///
/// # Precondition
///
/// `pb`'s parent is the current path tip and `pb.diffs_generated` is false.
pub(crate) fn generate_and_apply_diff<K: KVStore>(
    db: &mut Database<K>,
    constants: &ProtocolConstants,
    pb: &ProcessedBlock,
) -> Result<ProcessedBlock, AcceptBlockError> {
    let mut pb = pb.clone();
    db.update(|tx| {
        if pb.diffs_generated {
            return Err(AcceptBlockError::Storage(StoreError::Inconsistent));
        }
        let parent_height = pb
            .height
            .checked_sub(1)
            .ok_or(AcceptBlockError::Storage(StoreError::Inconsistent))?;
        let path_parent: Option<BlockID> = tx.try_get(BLOCK_PATH, &height_key(parent_height))?;
        let path_child: Option<BlockID> = tx.try_get(BLOCK_PATH, &height_key(pb.height))?;
        if path_parent != Some(pb.parent_id()) || path_child.is_some() {
            return Err(AcceptBlockError::Storage(StoreError::Inconsistent));
        }

        pb.siafund_pool_diff.previous = siafund_pool(tx)?;
        create_maturity_bucket(tx, pb.height, constants)
            .map_err(AcceptBlockError::Storage)?;

        for i in 0..pb.block.transactions.len() {
            let txn = pb.block.transactions[i].clone();
            valid_transaction(tx, &txn, pb.height, constants).map_err(map_transaction_error)?;
            apply_transaction(tx, &mut pb, &txn, constants)?;
        }
        apply_miner_payouts(tx, &mut pb, constants)?;
        apply_maturation(tx, &mut pb)?;
        apply_contract_expirations(tx, &mut pb, constants)?;
        pb.siafund_pool_diff.adjusted = siafund_pool(tx)?;

        pb.diffs_generated = true;
        tx.put(BLOCK_MAP, &pb.id().bytes(), &pb);
        tx.insert(BLOCK_PATH, &height_key(pb.height), &pb.id())?;
        Ok(())
    })?;
    Ok(pb)
}
