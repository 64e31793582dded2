/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Full-store consistency checks and the state hash.
//!
//! These scans encode the invariants the store must satisfy after every
//! committed logical operation. They are expensive (linear in the state), so
//! the consensus set runs them on demand and in tests rather than inline;
//! each violation surfaces as [`StoreError::Inconsistent`] rather than a
//! process abort.
//!
//! [`state_hash`] digests the complete consensus state — canonical path,
//! output sets, contracts, delayed buckets, pool — and is the basis for the
//! apply/revert identity properties: reverting and re-applying a block must
//! reproduce the hash exactly.

use sha2::{Digest, Sha256};

use crate::chain::diffs::{siafund_claim, siafund_pool};
use crate::constants::ProtocolConstants;
use crate::encoding::from_bytes;
use crate::store::buckets::{
    BLOCK_MAP, BLOCK_PATH, DSCO_BUCKETS, FILE_CONTRACTS, FILE_CONTRACT_EXPIRATIONS,
    SIACOIN_OUTPUTS, SIAFUND_OUTPUTS,
};
use crate::store::database::{height_key, DbTx, StoreError};
use crate::store::kv::KVStore;
use crate::types::basic::{
    BlockHeight, BlockID, Currency, FileContractID, Hash, SiacoinOutputID,
};
use crate::types::block::ProcessedBlock;
use crate::types::transaction::{FileContract, SiacoinOutput, SiafundOutput};

/// Digest the full consensus state. Block-tree side data (the block map and
/// bad-block set) is excluded: two stores that agree on the canonical state
/// hash identically even if they have seen different side chains.
pub(crate) fn state_hash<K: KVStore>(
    view: &DbTx<K>,
    tip_height: BlockHeight,
) -> Result<Hash, StoreError> {
    let mut hasher = Sha256::new();
    hasher.update(tip_height.to_le_bytes());

    // The canonical path, in height order.
    for height in 0..=tip_height.int() {
        let id: BlockID = view.get(BLOCK_PATH, &height_key(BlockHeight::new(height)))?;
        hasher.update(id.bytes());
    }

    let mut digest_bucket = |bucket: &[u8]| -> Result<(), StoreError> {
        hasher.update(bucket);
        for (key, value) in view.items(bucket)? {
            hasher.update(&key);
            hasher.update(&value);
        }
        Ok(())
    };

    digest_bucket(SIACOIN_OUTPUTS)?;
    digest_bucket(FILE_CONTRACTS)?;
    digest_bucket(SIAFUND_OUTPUTS)?;

    // Child buckets, in index order.
    for index_bucket in [DSCO_BUCKETS, FILE_CONTRACT_EXPIRATIONS] {
        let entries = view.items(index_bucket)?;
        hasher.update(index_bucket);
        for (key, value) in entries {
            hasher.update(&key);
            let child: Vec<u8> = from_bytes(&value)?;
            hasher.update(&child);
            for (child_key, child_value) in view.items(&child)? {
                hasher.update(&child_key);
                hasher.update(&child_value);
            }
        }
    }

    let pool = siafund_pool(view)?;
    hasher.update(pool.int().to_le_bytes());

    Ok(Hash::new(hasher.finalize().into()))
}

/// Run every full-scan invariant.
pub(crate) fn check_consistency<K: KVStore>(
    view: &DbTx<K>,
    constants: &ProtocolConstants,
    tip_height: BlockHeight,
) -> Result<(), StoreError> {
    check_block_path(view, tip_height)?;
    check_delayed_output_buckets(view)?;
    check_contract_expirations(view)?;
    check_siafund_count(view, constants)?;
    check_siacoin_count(view, constants, tip_height)?;
    Ok(())
}

/// The path covers heights `[0, tip]` contiguously; every entry's stored
/// block agrees on height and parent, and cumulative work strictly grows.
fn check_block_path<K: KVStore>(
    view: &DbTx<K>,
    tip_height: BlockHeight,
) -> Result<(), StoreError> {
    if view.bucket_len(BLOCK_PATH)? != tip_height.int() + 1 {
        return Err(StoreError::Inconsistent);
    }
    let mut previous: Option<ProcessedBlock> = None;
    for height in 0..=tip_height.int() {
        let height = BlockHeight::new(height);
        let id: BlockID = view.get(BLOCK_PATH, &height_key(height))?;
        let pb: ProcessedBlock = view.get(BLOCK_MAP, &id.bytes())?;
        if pb.height != height {
            return Err(StoreError::Inconsistent);
        }
        if let Some(previous) = &previous {
            if pb.parent_id() != previous.id()
                || pb.cumulative_work <= previous.cumulative_work
            {
                return Err(StoreError::Inconsistent);
            }
        }
        previous = Some(pb);
    }
    Ok(())
}

/// Every registered delayed-output bucket is well-formed and non-empty, and
/// no delayed output also appears in the spendable set.
fn check_delayed_output_buckets<K: KVStore>(view: &DbTx<K>) -> Result<(), StoreError> {
    let mut result = Ok(());
    view.for_each(DSCO_BUCKETS, |height: BlockHeight, bucket: Vec<u8>| {
        if bucket != crate::store::database::dsco_bucket_name(height) {
            result = Err(StoreError::Inconsistent);
            return Ok(());
        }
        if view.is_bucket_empty(&bucket)? {
            result = Err(StoreError::Inconsistent);
            return Ok(());
        }
        view.for_each(&bucket, |id: SiacoinOutputID, _: SiacoinOutput| {
            if view.exists(SIACOIN_OUTPUTS, &id.bytes())? {
                result = Err(StoreError::Inconsistent);
            }
            Ok(())
        })
    })?;
    result
}

/// Live contracts and expiration-set entries correspond one to one.
fn check_contract_expirations<K: KVStore>(view: &DbTx<K>) -> Result<(), StoreError> {
    let mut result = Ok(());
    view.for_each(
        FILE_CONTRACT_EXPIRATIONS,
        |height: BlockHeight, bucket: Vec<u8>| {
            if bucket != crate::store::database::fcex_bucket_name(height) {
                result = Err(StoreError::Inconsistent);
                return Ok(());
            }
            view.for_each(&bucket, |id: FileContractID, _: bool| {
                match view.try_get::<FileContract>(FILE_CONTRACTS, &id.bytes())? {
                    Some(contract) if contract.window_end == height => {}
                    _ => result = Err(StoreError::Inconsistent),
                }
                Ok(())
            })
        },
    )?;
    view.for_each(FILE_CONTRACTS, |id: FileContractID, contract: FileContract| {
        let bucket = crate::store::database::fcex_bucket_name(contract.window_end);
        if !view.exists(&bucket, &id.bytes())? {
            result = Err(StoreError::Inconsistent);
        }
        Ok(())
    })?;
    result
}

/// The siafund supply is fixed at genesis.
fn check_siafund_count<K: KVStore>(
    view: &DbTx<K>,
    constants: &ProtocolConstants,
) -> Result<(), StoreError> {
    let mut total: u128 = 0;
    view.for_each(SIAFUND_OUTPUTS, |_: crate::types::basic::SiafundOutputID, output: SiafundOutput| {
        total = total.saturating_add(output.value.int());
        Ok(())
    })?;
    if total != constants.siafund_count as u128 {
        return Err(StoreError::Inconsistent);
    }
    Ok(())
}

/// Conservation: spendable outputs, delayed outputs, coins locked in
/// contracts, and unclaimed siafund-pool shares together equal the sum of
/// all subsidies on the canonical chain. The tax rounding to a multiple of
/// the siafund count makes this exact.
fn check_siacoin_count<K: KVStore>(
    view: &DbTx<K>,
    constants: &ProtocolConstants,
    tip_height: BlockHeight,
) -> Result<(), StoreError> {
    let mut total = Currency::ZERO;
    let mut add = |value: Currency, total: &mut Currency| -> Result<(), StoreError> {
        *total = total.checked_add(value).ok_or(StoreError::Inconsistent)?;
        Ok(())
    };

    let mut scan = Ok(());
    view.for_each(SIACOIN_OUTPUTS, |_: SiacoinOutputID, output: SiacoinOutput| {
        if let Err(err) = add(output.value, &mut total) {
            scan = Err(err);
        }
        Ok(())
    })?;
    view.for_each(DSCO_BUCKETS, |_: BlockHeight, bucket: Vec<u8>| {
        view.for_each(&bucket, |_: SiacoinOutputID, output: SiacoinOutput| {
            if let Err(err) = add(output.value, &mut total) {
                scan = Err(err);
            }
            Ok(())
        })
    })?;
    view.for_each(FILE_CONTRACTS, |_: FileContractID, contract: FileContract| {
        for output in &contract.valid_proof_outputs {
            if let Err(err) = add(output.value, &mut total) {
                scan = Err(err);
            }
        }
        Ok(())
    })?;
    let pool = siafund_pool(view)?;
    view.for_each(SIAFUND_OUTPUTS, |_: crate::types::basic::SiafundOutputID, output: SiafundOutput| {
        match siafund_claim(pool, &output, constants) {
            Some(claim) => {
                if let Err(err) = add(claim, &mut total) {
                    scan = Err(err);
                }
            }
            None => scan = Err(StoreError::Inconsistent),
        }
        Ok(())
    })?;
    scan?;

    let mut expected = Currency::ZERO;
    for height in 1..=tip_height.int() {
        expected = expected
            .checked_add(constants.calculate_coinbase(BlockHeight::new(height)))
            .ok_or(StoreError::Inconsistent)?;
    }
    if total != expected {
        return Err(StoreError::Inconsistent);
    }
    Ok(())
}
