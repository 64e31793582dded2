/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Block shape validation: every check that can run before diffs are
//! generated.
//!
//! These checks need the block's position in the tree (its target and the
//! timestamps of its ancestors) but nothing from the output sets, so they run
//! when a block first arrives. A block that fails here is recorded as bad —
//! except for [`BlockValidationError::FutureBlock`], which may become valid
//! once the clock catches up.

use std::fmt::{self, Display, Formatter};

use crate::constants::ProtocolConstants;
use crate::encoding::Encodable;
use crate::types::basic::{BlockHeight, Currency, Target, Timestamp};
use crate::types::block::Block;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockValidationError {
    /// The encoded block exceeds the block size limit.
    LargeBlock,
    /// The timestamp is not after the median of the trailing window.
    EarlyTimestamp,
    /// The timestamp is further in the future than the allowed threshold.
    FutureBlock,
    /// The block's ID does not satisfy its target.
    MissedTarget,
    /// Miner payouts are malformed or do not sum to subsidy plus fees.
    MinerPayout,
}

impl Display for BlockValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockValidationError::LargeBlock => write!(f, "block exceeds the size limit"),
            BlockValidationError::EarlyTimestamp => {
                write!(f, "block timestamp is not after the trailing median")
            }
            BlockValidationError::FutureBlock => {
                write!(f, "block timestamp is too far in the future")
            }
            BlockValidationError::MissedTarget => {
                write!(f, "block ID does not satisfy its target")
            }
            BlockValidationError::MinerPayout => {
                write!(f, "miner payouts do not sum to subsidy plus fees")
            }
        }
    }
}

impl std::error::Error for BlockValidationError {}

/// Validate the shape of `block` as a child at `height` whose proof-of-work
/// requirement is `target`. `minimum_timestamp` is the earliest legal
/// timestamp, one past the trailing median.
pub fn validate_header(
    block: &Block,
    target: Target,
    height: BlockHeight,
    minimum_timestamp: Timestamp,
    now: Timestamp,
    constants: &ProtocolConstants,
) -> Result<(), BlockValidationError> {
    if block.to_bytes().len() as u64 > constants.block_size_limit {
        return Err(BlockValidationError::LargeBlock);
    }
    if block.timestamp < minimum_timestamp {
        return Err(BlockValidationError::EarlyTimestamp);
    }
    if block.timestamp > now.saturating_add(constants.future_threshold) {
        return Err(BlockValidationError::FutureBlock);
    }
    if !block.check_target(target) {
        return Err(BlockValidationError::MissedTarget);
    }
    valid_miner_payouts(block, height, constants)?;
    Ok(())
}

/// Miner payouts must be individually non-zero and sum exactly to the block
/// subsidy plus the fees of every transaction in the block.
fn valid_miner_payouts(
    block: &Block,
    height: BlockHeight,
    constants: &ProtocolConstants,
) -> Result<(), BlockValidationError> {
    let mut payout_sum = Currency::ZERO;
    for payout in &block.miner_payouts {
        if payout.value.is_zero() {
            return Err(BlockValidationError::MinerPayout);
        }
        payout_sum = payout_sum
            .checked_add(payout.value)
            .ok_or(BlockValidationError::MinerPayout)?;
    }
    let mut expected = constants.calculate_coinbase(height);
    for transaction in &block.transactions {
        for fee in &transaction.miner_fees {
            expected = expected
                .checked_add(*fee)
                .ok_or(BlockValidationError::MinerPayout)?;
        }
    }
    if payout_sum != expected {
        return Err(BlockValidationError::MinerPayout);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::{SiacoinOutput, Transaction};

    fn constants() -> ProtocolConstants {
        ProtocolConstants::default()
    }

    fn subsidy_block(height: BlockHeight, constants: &ProtocolConstants) -> Block {
        Block {
            timestamp: constants.genesis_timestamp,
            miner_payouts: vec![SiacoinOutput {
                value: constants.calculate_coinbase(height),
                unlock_hash: Default::default(),
            }],
            ..Block::default()
        }
    }

    fn far_future(constants: &ProtocolConstants) -> Timestamp {
        Timestamp::new(constants.genesis_timestamp.int() + constants.future_threshold)
    }

    #[test]
    fn well_formed_block_passes() {
        let constants = constants();
        let block = subsidy_block(BlockHeight::new(1), &constants);
        assert!(validate_header(
            &block,
            Target::new([0xff; 32]),
            BlockHeight::new(1),
            constants.genesis_timestamp,
            far_future(&constants),
            &constants,
        )
        .is_ok());
    }

    #[test]
    fn early_timestamp_is_rejected() {
        let constants = constants();
        let block = subsidy_block(BlockHeight::new(1), &constants);
        let minimum = Timestamp::new(block.timestamp.int() + 1);
        assert_eq!(
            validate_header(
                &block,
                Target::new([0xff; 32]),
                BlockHeight::new(1),
                minimum,
                far_future(&constants),
                &constants,
            ),
            Err(BlockValidationError::EarlyTimestamp)
        );
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let constants = constants();
        let mut block = subsidy_block(BlockHeight::new(1), &constants);
        let now = far_future(&constants);
        block.timestamp = Timestamp::new(now.int() + constants.future_threshold + 10);
        assert_eq!(
            validate_header(
                &block,
                Target::new([0xff; 32]),
                BlockHeight::new(1),
                constants.genesis_timestamp,
                now,
                &constants,
            ),
            Err(BlockValidationError::FutureBlock)
        );
    }

    #[test]
    fn missed_target_is_rejected() {
        let constants = constants();
        let block = subsidy_block(BlockHeight::new(1), &constants);
        assert_eq!(
            validate_header(
                &block,
                Target::new([0x00; 32]),
                BlockHeight::new(1),
                constants.genesis_timestamp,
                far_future(&constants),
                &constants,
            ),
            Err(BlockValidationError::MissedTarget)
        );
    }

    #[test]
    fn payout_off_by_one_coinbase_height_is_rejected() {
        let constants = constants();
        // Subsidy computed for the parent's height instead of the child's.
        let block = subsidy_block(BlockHeight::new(0), &constants);
        assert_eq!(
            validate_header(
                &block,
                Target::new([0xff; 32]),
                BlockHeight::new(1),
                constants.genesis_timestamp,
                far_future(&constants),
                &constants,
            ),
            Err(BlockValidationError::MinerPayout)
        );
    }

    #[test]
    fn payouts_must_include_fees() {
        let constants = constants();
        let height = BlockHeight::new(1);
        let mut block = subsidy_block(height, &constants);
        block.transactions.push(Transaction {
            miner_fees: vec![Currency::new(10)],
            ..Transaction::default()
        });
        assert_eq!(
            validate_header(
                &block,
                Target::new([0xff; 32]),
                height,
                constants.genesis_timestamp,
                far_future(&constants),
                &constants,
            ),
            Err(BlockValidationError::MinerPayout)
        );
        let subsidy = constants.calculate_coinbase(height);
        block.miner_payouts[0].value = subsidy.checked_add(Currency::new(10)).unwrap();
        assert!(validate_header(
            &block,
            Target::new([0xff; 32]),
            height,
            constants.genesis_timestamp,
            far_future(&constants),
            &constants,
        )
        .is_ok());
    }

    #[test]
    fn zero_value_payout_is_rejected() {
        let constants = constants();
        let height = BlockHeight::new(1);
        let mut block = subsidy_block(height, &constants);
        block.miner_payouts.push(SiacoinOutput {
            value: Currency::ZERO,
            unlock_hash: Default::default(),
        });
        assert_eq!(
            validate_header(
                &block,
                Target::new([0xff; 32]),
                height,
                constants.genesis_timestamp,
                far_future(&constants),
                &constants,
            ),
            Err(BlockValidationError::MinerPayout)
        );
    }
}
