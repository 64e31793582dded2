/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks and the annotated form the consensus set stores them in.
//!
//! A block's ID is the hash of its header fields: parent ID, nonce,
//! timestamp, and the Merkle root over its miner payouts and transactions.
//! Grinding the nonce until the ID falls at or below the parent's child
//! target is the proof of work.

use crate::crypto::{hash_all, merkle_root};
use crate::encoding::{Decodable, DecodeError, Encodable};
use crate::types::basic::{
    BlockHeight, BlockID, SiacoinOutputID, Target, Timestamp, Work,
};
use crate::types::diff::{
    DelayedSiacoinOutputDiff, FileContractDiff, SiacoinOutputDiff, SiafundOutputDiff,
    SiafundPoolDiff,
};
use crate::types::transaction::{SiacoinOutput, Transaction};

const SPECIFIER_MINER_PAYOUT: [u8; 16] = *b"miner payout\0\0\0\0";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Block {
    pub parent_id: BlockID,
    pub nonce: u64,
    pub timestamp: Timestamp,
    pub miner_payouts: Vec<SiacoinOutput>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// The Merkle root over the block's contents: each miner payout and each
    /// transaction encoding is one leaf, payouts first.
    pub fn merkle_root(&self) -> crate::types::basic::Hash {
        let mut leaves: Vec<Vec<u8>> =
            Vec::with_capacity(self.miner_payouts.len() + self.transactions.len());
        for payout in &self.miner_payouts {
            leaves.push(payout.to_bytes());
        }
        for transaction in &self.transactions {
            leaves.push(transaction.to_bytes());
        }
        merkle_root(&leaves)
    }

    pub fn id(&self) -> BlockID {
        BlockID::new(hash_all(&[
            &self.parent_id.bytes(),
            &self.nonce.to_le_bytes(),
            &self.timestamp.int().to_le_bytes(),
            &self.merkle_root().bytes(),
        ]))
    }

    /// ID of the miner payout at `index`. Payout outputs are created by the
    /// block itself, so their IDs derive from the block ID rather than from
    /// a transaction.
    pub fn miner_payout_id(&self, index: u64) -> SiacoinOutputID {
        SiacoinOutputID::new(hash_all(&[
            &SPECIFIER_MINER_PAYOUT,
            &self.id().bytes(),
            &index.to_le_bytes(),
        ]))
    }

    /// Whether this block's ID satisfies `target`.
    pub fn check_target(&self, target: Target) -> bool {
        target.is_met_by(&self.id())
    }
}

impl Encodable for Block {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.parent_id.encode(buf);
        self.nonce.encode(buf);
        self.timestamp.encode(buf);
        self.miner_payouts.encode(buf);
        self.transactions.encode(buf);
    }
}

impl Decodable for Block {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            parent_id: BlockID::decode(buf)?,
            nonce: u64::decode(buf)?,
            timestamp: Timestamp::decode(buf)?,
            miner_payouts: Vec::<SiacoinOutput>::decode(buf)?,
            transactions: Vec::<Transaction>::decode(buf)?,
        })
    }
}

/// A block as stored in the block map: the block itself plus its position in
/// the tree and, once generated, the reversible diffs it causes.
///
/// `child_target` is the target this block's children must meet, computed by
/// retargeting when the block was accepted. `cumulative_work` strictly
/// exceeds every proper ancestor's, which is what fork choice compares.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessedBlock {
    pub block: Block,
    pub height: BlockHeight,
    pub child_target: Target,
    pub cumulative_work: Work,
    pub diffs_generated: bool,
    pub siacoin_output_diffs: Vec<SiacoinOutputDiff>,
    pub file_contract_diffs: Vec<FileContractDiff>,
    pub siafund_output_diffs: Vec<SiafundOutputDiff>,
    pub delayed_siacoin_output_diffs: Vec<DelayedSiacoinOutputDiff>,
    pub siafund_pool_diff: SiafundPoolDiff,
}

impl ProcessedBlock {
    /// A freshly accepted block: positioned in the tree, diffs not yet
    /// generated.
    pub fn new(
        block: Block,
        height: BlockHeight,
        child_target: Target,
        cumulative_work: Work,
    ) -> Self {
        Self {
            block,
            height,
            child_target,
            cumulative_work,
            diffs_generated: false,
            siacoin_output_diffs: Vec::new(),
            file_contract_diffs: Vec::new(),
            siafund_output_diffs: Vec::new(),
            delayed_siacoin_output_diffs: Vec::new(),
            siafund_pool_diff: SiafundPoolDiff::default(),
        }
    }

    pub fn id(&self) -> BlockID {
        self.block.id()
    }

    pub fn parent_id(&self) -> BlockID {
        self.block.parent_id
    }
}

impl Encodable for ProcessedBlock {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.block.encode(buf);
        self.height.encode(buf);
        self.child_target.encode(buf);
        self.cumulative_work.encode(buf);
        self.diffs_generated.encode(buf);
        self.siacoin_output_diffs.encode(buf);
        self.file_contract_diffs.encode(buf);
        self.siafund_output_diffs.encode(buf);
        self.delayed_siacoin_output_diffs.encode(buf);
        self.siafund_pool_diff.encode(buf);
    }
}

impl Decodable for ProcessedBlock {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            block: Block::decode(buf)?,
            height: BlockHeight::decode(buf)?,
            child_target: Target::decode(buf)?,
            cumulative_work: Work::decode(buf)?,
            diffs_generated: bool::decode(buf)?,
            siacoin_output_diffs: Vec::<SiacoinOutputDiff>::decode(buf)?,
            file_contract_diffs: Vec::<FileContractDiff>::decode(buf)?,
            siafund_output_diffs: Vec::<SiafundOutputDiff>::decode(buf)?,
            delayed_siacoin_output_diffs: Vec::<DelayedSiacoinOutputDiff>::decode(buf)?,
            siafund_pool_diff: SiafundPoolDiff::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::from_bytes;
    use crate::types::basic::Currency;

    fn sample_block() -> Block {
        Block {
            parent_id: BlockID::new(crate::crypto::hash_bytes(b"parent")),
            nonce: 41,
            timestamp: Timestamp::new(1_717_000_000),
            miner_payouts: vec![SiacoinOutput {
                value: Currency::new(300_000),
                unlock_hash: Default::default(),
            }],
            transactions: Vec::new(),
        }
    }

    #[test]
    fn round_trip() {
        let block = sample_block();
        assert_eq!(from_bytes::<Block>(&block.to_bytes()).unwrap(), block);
    }

    #[test]
    fn id_commits_to_every_header_field() {
        let block = sample_block();
        let id = block.id();

        let mut nonced = block.clone();
        nonced.nonce += 1;
        assert_ne!(nonced.id(), id);

        let mut timed = block.clone();
        timed.timestamp = Timestamp::new(block.timestamp.int() + 1);
        assert_ne!(timed.id(), id);

        let mut repaid = block.clone();
        repaid.miner_payouts[0].value = Currency::new(1);
        assert_ne!(repaid.id(), id);
    }

    #[test]
    fn payout_ids_differ_per_index_and_block() {
        let block = sample_block();
        assert_ne!(block.miner_payout_id(0), block.miner_payout_id(1));
        let mut other = block.clone();
        other.nonce += 1;
        assert_ne!(other.miner_payout_id(0), block.miner_payout_id(0));
    }

    #[test]
    fn check_target_is_monotone() {
        let block = sample_block();
        assert!(block.check_target(Target::new([0xff; 32])));
        assert!(!block.check_target(Target::new([0x00; 32])));
    }

    #[test]
    fn processed_block_round_trip() {
        let pb = ProcessedBlock::new(
            sample_block(),
            BlockHeight::new(3),
            Target::new([0x20; 32]),
            Target::new([0x20; 32]).work(),
        );
        assert_eq!(from_bytes::<ProcessedBlock>(&pb.to_bytes()).unwrap(), pb);
    }
}
