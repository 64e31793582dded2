/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Reversible state deltas.
//!
//! Every change a block makes to the consensus state is captured as a list of
//! diffs attached to its [`ProcessedBlock`](crate::types::block::ProcessedBlock).
//! Applying a block replays the diffs; reverting walks them backwards with
//! each direction inverted. The two operations are exact inverses, which is
//! what makes reorganizations safe.

use crate::encoding::{take, Decodable, DecodeError, Encodable};
use crate::types::basic::{
    BlockHeight, Currency, FileContractID, SiacoinOutputID, SiafundOutputID,
};
use crate::types::transaction::{FileContract, SiacoinOutput, SiafundOutput};

/// Whether a diff adds its object to the state or removes it, in the context
/// of the block being applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffDirection {
    Apply,
    Revert,
}

impl DiffDirection {
    pub fn inverse(&self) -> DiffDirection {
        match self {
            DiffDirection::Apply => DiffDirection::Revert,
            DiffDirection::Revert => DiffDirection::Apply,
        }
    }
}

impl Encodable for DiffDirection {
    fn encode(&self, buf: &mut Vec<u8>) {
        matches!(self, DiffDirection::Apply).encode(buf);
    }
}

impl Decodable for DiffDirection {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(match take(buf, 1)?[0] {
            1 => DiffDirection::Apply,
            0 => DiffDirection::Revert,
            b => return Err(DecodeError::InvalidBool(b)),
        })
    }
}

/// Creation or destruction of a spendable siacoin output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiacoinOutputDiff {
    pub direction: DiffDirection,
    pub id: SiacoinOutputID,
    pub output: SiacoinOutput,
}

impl Encodable for SiacoinOutputDiff {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.direction.encode(buf);
        self.id.encode(buf);
        self.output.encode(buf);
    }
}

impl Decodable for SiacoinOutputDiff {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            direction: DiffDirection::decode(buf)?,
            id: SiacoinOutputID::decode(buf)?,
            output: SiacoinOutput::decode(buf)?,
        })
    }
}

/// Creation or termination of a file contract. The expiration-set entry at
/// the contract's window end follows the contract itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContractDiff {
    pub direction: DiffDirection,
    pub id: FileContractID,
    pub contract: FileContract,
}

impl Encodable for FileContractDiff {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.direction.encode(buf);
        self.id.encode(buf);
        self.contract.encode(buf);
    }
}

impl Decodable for FileContractDiff {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            direction: DiffDirection::decode(buf)?,
            id: FileContractID::decode(buf)?,
            contract: FileContract::decode(buf)?,
        })
    }
}

/// Creation or destruction of a siafund output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiafundOutputDiff {
    pub direction: DiffDirection,
    pub id: SiafundOutputID,
    pub output: SiafundOutput,
}

impl Encodable for SiafundOutputDiff {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.direction.encode(buf);
        self.id.encode(buf);
        self.output.encode(buf);
    }
}

impl Decodable for SiafundOutputDiff {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            direction: DiffDirection::decode(buf)?,
            id: SiafundOutputID::decode(buf)?,
            output: SiafundOutput::decode(buf)?,
        })
    }
}

/// Insertion into or removal from the delayed-output bucket at
/// `maturity_height`. A maturation is recorded as a `Revert` delayed diff
/// paired with an `Apply` [`SiacoinOutputDiff`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DelayedSiacoinOutputDiff {
    pub direction: DiffDirection,
    pub id: SiacoinOutputID,
    pub output: SiacoinOutput,
    pub maturity_height: BlockHeight,
}

impl Encodable for DelayedSiacoinOutputDiff {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.direction.encode(buf);
        self.id.encode(buf);
        self.output.encode(buf);
        self.maturity_height.encode(buf);
    }
}

impl Decodable for DelayedSiacoinOutputDiff {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            direction: DiffDirection::decode(buf)?,
            id: SiacoinOutputID::decode(buf)?,
            output: SiacoinOutput::decode(buf)?,
            maturity_height: BlockHeight::decode(buf)?,
        })
    }
}

/// The siafund pool before and after a block. The pool never decreases
/// while applying, so `adjusted >= previous` for every generated diff.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SiafundPoolDiff {
    pub previous: Currency,
    pub adjusted: Currency,
}

impl Encodable for SiafundPoolDiff {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.previous.encode(buf);
        self.adjusted.encode(buf);
    }
}

impl Decodable for SiafundPoolDiff {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            previous: Currency::decode(buf)?,
            adjusted: Currency::decode(buf)?,
        })
    }
}
