/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Protocol constants and the genesis block.
//!
//! Every value here is fixed by the protocol: two nodes disagreeing on any of
//! them are on different networks. The constants are gathered into
//! [`ProtocolConstants`], built once when a consensus set is opened and never
//! mutated afterwards. [`ProtocolConstants::default`] is the production
//! network; tests construct variants with an easier root target and shorter
//! delays so blocks can be ground out in microseconds.

use crate::types::basic::{BlockHeight, Currency, Hash, Target, Timestamp, UnlockHash};
use crate::types::block::Block;
use crate::types::transaction::{SiafundOutput, Transaction};

/// One coin, in base units. Payouts and subsidies are multiples of this.
pub const COIN: u128 = 1_000_000_000_000_000_000_000_000;

/// Numerator over denominator of the per-block tax on file contract payouts.
/// The tax feeds the siafund pool.
pub const TAX_NUMERATOR: u64 = 39;
pub const TAX_DENOMINATOR: u64 = 1000;

#[derive(Clone, Debug)]
pub struct ProtocolConstants {
    /// Hard upper bound on the encoded size of a block, in bytes.
    pub block_size_limit: u64,
    /// Seconds the network aims to take per block.
    pub block_frequency: u64,
    /// Blocks a miner payout (or other delayed output) is embargoed for.
    pub maturity_delay: u64,
    /// Seconds a block timestamp may run ahead of the local clock.
    pub future_threshold: u64,
    /// Number of trailing blocks whose timestamp median bounds a child's
    /// earliest timestamp.
    pub median_timestamp_window: usize,
    /// Number of trailing blocks the retarget measures elapsed time over.
    pub target_window: u64,
    /// Per-step clamp on target growth, as numerator/denominator.
    pub max_adjustment_up: (u64, u64),
    /// Per-step clamp on target shrinkage.
    pub max_adjustment_down: (u64, u64),
    /// Total number of siafunds; fixed at genesis, never minted again.
    pub siafund_count: u64,
    /// Target the genesis block sets for its children.
    pub root_target: Target,
    /// Timestamp carried by the genesis block.
    pub genesis_timestamp: Timestamp,
    /// Address the genesis siafund allocation is spendable against.
    pub genesis_siafund_unlock_hash: UnlockHash,
    /// Block subsidy at height 1, in coins. Decays by one coin per block.
    pub initial_coinbase: u64,
    /// Floor the subsidy decays to, in coins.
    pub minimum_coinbase: u64,
}

impl Default for ProtocolConstants {
    fn default() -> Self {
        let mut root_target = [0u8; 32];
        root_target[2] = 64;
        Self {
            block_size_limit: 1_000_000,
            block_frequency: 600,
            maturity_delay: 50,
            future_threshold: 3 * 60 * 60,
            median_timestamp_window: 11,
            target_window: 2_000,
            max_adjustment_up: (1001, 1000),
            max_adjustment_down: (999, 1000),
            siafund_count: 10_000,
            root_target: Target::new(root_target),
            genesis_timestamp: Timestamp::new(1_433_600_000),
            genesis_siafund_unlock_hash: UnlockHash::new(Hash::new([
                0x27, 0x6b, 0x9a, 0x5f, 0x1a, 0x4f, 0x44, 0x9f, 0xf2, 0x5a, 0x86, 0x55, 0x3d,
                0x0d, 0xbc, 0x1b, 0x12, 0x5a, 0x58, 0x2b, 0xf2, 0x22, 0x61, 0x0a, 0x94, 0x2f,
                0x46, 0x8c, 0x59, 0x40, 0x2a, 0xb7,
            ])),
            initial_coinbase: 300_000,
            minimum_coinbase: 30_000,
        }
    }
}

impl ProtocolConstants {
    /// The block subsidy for the block at `height`:
    /// `max(initial_coinbase - height, minimum_coinbase)` coins.
    pub fn calculate_coinbase(&self, height: BlockHeight) -> Currency {
        let coins = self
            .initial_coinbase
            .saturating_sub(height.int())
            .max(self.minimum_coinbase);
        Currency::new(coins as u128 * COIN)
    }

    /// The tax levied on a file contract payout, rounded down to a multiple
    /// of `siafund_count` so that siafund claims always divide exactly.
    pub fn tax(&self, payout: Currency) -> Currency {
        payout
            .checked_mul(TAX_NUMERATOR)
            .map(|product| product.div(TAX_DENOMINATOR))
            .unwrap_or(
                // A payout large enough to overflow the product is itself
                // invalid; saturate rather than wrap so validation rejects
                // the conservation equation instead.
                Currency::new(u128::MAX),
            )
            .round_down(self.siafund_count)
    }

    /// The hard-coded genesis block. Its only content is the transaction
    /// allocating all siafunds to the genesis unlock hash.
    pub fn genesis_block(&self) -> Block {
        Block {
            parent_id: Default::default(),
            nonce: 0,
            timestamp: self.genesis_timestamp,
            miner_payouts: Vec::new(),
            transactions: vec![Transaction {
                siafund_outputs: vec![SiafundOutput {
                    value: Currency::new(self.siafund_count as u128),
                    unlock_hash: self.genesis_siafund_unlock_hash,
                    claim_start: Currency::ZERO,
                }],
                ..Transaction::default()
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coinbase_decays_to_the_floor() {
        let constants = ProtocolConstants::default();
        assert_eq!(
            constants.calculate_coinbase(BlockHeight::new(0)),
            Currency::new(300_000 * COIN)
        );
        assert_eq!(
            constants.calculate_coinbase(BlockHeight::new(1)),
            Currency::new(299_999 * COIN)
        );
        assert_eq!(
            constants.calculate_coinbase(BlockHeight::new(1_000_000)),
            Currency::new(30_000 * COIN)
        );
    }

    #[test]
    fn tax_is_a_multiple_of_the_siafund_count() {
        let constants = ProtocolConstants::default();
        let tax = constants.tax(Currency::new(1_234_567_891_234));
        assert_eq!(tax.int() % constants.siafund_count as u128, 0);
        assert!(tax < Currency::new(1_234_567_891_234));
    }

    #[test]
    fn genesis_block_is_deterministic() {
        let constants = ProtocolConstants::default();
        assert_eq!(
            constants.genesis_block().id(),
            constants.genesis_block().id()
        );
        assert_eq!(
            constants.genesis_block().transactions[0].siafund_outputs[0]
                .value
                .int(),
            constants.siafund_count as u128
        );
    }
}
