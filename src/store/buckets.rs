/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Bucket names and key composition for the consensus store.
//!
//! The substrate exposes a flat keyspace, so buckets are realized as key
//! prefixes: an item at `key` in bucket `B` lives at `B ‖ '/' ‖ key`. Bucket
//! names are literal ASCII byte strings; the fixed set below is the complete
//! schema, plus two families of per-height child buckets:
//!
//! - `dsco_<height LE u64>` — delayed siacoin outputs maturing at a height,
//!   indexed in [`DSCO_BUCKETS`];
//! - `fcex_<height LE u64>` — file contracts expiring at a height, indexed
//!   in [`FILE_CONTRACT_EXPIRATIONS`].
//!
//! Child buckets are created lazily and may only be deleted once empty.
//! No fixed bucket name is a prefix of another, and the child-bucket names
//! have fixed width, so composed keys never collide.

use crate::types::basic::BlockHeight;

/// Canonical chain: height (LE u64) → block ID.
pub const BLOCK_PATH: &[u8] = b"BlockPath";
/// Block tree: block ID → encoded `ProcessedBlock`.
pub const BLOCK_MAP: &[u8] = b"BlockMap";
/// Spendable outputs: siacoin output ID → encoded output.
pub const SIACOIN_OUTPUTS: &[u8] = b"SiacoinOutputs";
/// Live contracts: file contract ID → encoded contract.
pub const FILE_CONTRACTS: &[u8] = b"FileContracts";
/// Index of `fcex_*` child buckets: height → bucket name.
pub const FILE_CONTRACT_EXPIRATIONS: &[u8] = b"FileContractExpirations";
/// Siafund outputs: siafund output ID → encoded output.
pub const SIAFUND_OUTPUTS: &[u8] = b"SiafundOutputs";
/// Singleton bucket holding the pool value under its own name.
pub const SIAFUND_POOL: &[u8] = b"SiafundPool";
/// Index of `dsco_*` child buckets: height → bucket name.
pub const DSCO_BUCKETS: &[u8] = b"DSCOBuckets";
/// Crash-detection counters, `GuardStart` and `GuardEnd`.
pub const CONSISTENCY_GUARD: &[u8] = b"ConsistencyGuard";
/// IDs of blocks that failed validation; never re-validated.
pub const BAD_BLOCKS: &[u8] = b"BadBlocks";
/// Store header and version, checked at open.
pub const METADATA: &[u8] = b"Metadata";

pub const GUARD_START: &[u8] = b"GuardStart";
pub const GUARD_END: &[u8] = b"GuardEnd";

pub const METADATA_HEADER_KEY: &[u8] = b"Header";
pub const METADATA_VERSION_KEY: &[u8] = b"Version";
pub const METADATA_HEADER: &[u8] = b"Consensus Set Database";
pub const METADATA_VERSION: &[u8] = b"0.4.0";

const DSCO_PREFIX: &[u8] = b"dsco_";
const FCEX_PREFIX: &[u8] = b"fcex_";

const BUCKET_SEPARATOR: u8 = b'/';

/// The substrate key for `item_key` within `bucket`.
pub fn item_key(bucket: &[u8], item_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(bucket.len() + 1 + item_key.len());
    key.extend_from_slice(bucket);
    key.push(BUCKET_SEPARATOR);
    key.extend_from_slice(item_key);
    key
}

/// The substrate key prefix every item of `bucket` lives under.
pub fn bucket_prefix(bucket: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(bucket.len() + 1);
    prefix.extend_from_slice(bucket);
    prefix.push(BUCKET_SEPARATOR);
    prefix
}

/// Name of the delayed-output bucket for outputs maturing at `height`.
pub fn dsco_bucket_name(height: BlockHeight) -> Vec<u8> {
    child_bucket_name(DSCO_PREFIX, height)
}

/// Name of the expiration-set bucket for contracts ending at `height`.
pub fn fcex_bucket_name(height: BlockHeight) -> Vec<u8> {
    child_bucket_name(FCEX_PREFIX, height)
}

fn child_bucket_name(prefix: &[u8], height: BlockHeight) -> Vec<u8> {
    let mut name = Vec::with_capacity(prefix.len() + 8);
    name.extend_from_slice(prefix);
    name.extend_from_slice(&height.to_le_bytes());
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_bucket_names_have_fixed_width() {
        let a = dsco_bucket_name(BlockHeight::new(1));
        let b = dsco_bucket_name(BlockHeight::new(u64::MAX));
        assert_eq!(a.len(), b.len());
        assert_ne!(a, b);
        assert_ne!(a, fcex_bucket_name(BlockHeight::new(1)));
    }

    #[test]
    fn no_fixed_bucket_is_a_prefix_of_another() {
        let buckets: [&[u8]; 11] = [
            BLOCK_PATH,
            BLOCK_MAP,
            SIACOIN_OUTPUTS,
            FILE_CONTRACTS,
            FILE_CONTRACT_EXPIRATIONS,
            SIAFUND_OUTPUTS,
            SIAFUND_POOL,
            DSCO_BUCKETS,
            CONSISTENCY_GUARD,
            BAD_BLOCKS,
            METADATA,
        ];
        for (i, a) in buckets.iter().enumerate() {
            for (j, b) in buckets.iter().enumerate() {
                if i != j {
                    assert!(!bucket_prefix(b).starts_with(&bucket_prefix(a)));
                }
            }
        }
    }

    #[test]
    fn item_keys_nest_under_the_bucket_prefix() {
        let key = item_key(BLOCK_MAP, &[7; 32]);
        assert!(key.starts_with(&bucket_prefix(BLOCK_MAP)));
        assert_eq!(key.len(), BLOCK_MAP.len() + 1 + 32);
    }
}
