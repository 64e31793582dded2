/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transaction validation against a state view.
//!
//! [`valid_transaction`] checks one transaction in the context of the state
//! immediately before it would be applied. The caller validates and applies
//! transactions in block order against the same overlay, so a transaction may
//! spend an output created earlier in its block, and an intra-block double
//! spend fails here as a missing input.
//!
//! Every check is pure with respect to the view: nothing is mutated, so a
//! failure leaves no trace.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};

use crate::constants::ProtocolConstants;
use crate::crypto::{hash_all, verify_signature};
use crate::store::buckets::{BLOCK_PATH, FILE_CONTRACTS, SIACOIN_OUTPUTS, SIAFUND_OUTPUTS};
use crate::store::database::{height_key, DbTx, StoreError};
use crate::store::kv::KVStore;
use crate::types::basic::{
    BlockHeight, BlockID, Currency, FileContractID, Hash, SiacoinOutputID, SiafundOutputID,
};
use crate::types::transaction::{
    CoveredFields, FileContract, SiacoinOutput, SiafundOutput, Transaction, UnlockConditions,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// An output or fee with zero value. Zero-value objects would clutter
    /// the state forever and are rejected outright.
    ZeroValueOutput,
    /// A siacoin input names an output that is not in the spendable set.
    MissingSiacoinInput(SiacoinOutputID),
    /// A siafund input names an output that is not in the siafund set.
    MissingSiafundInput(SiafundOutputID),
    /// The same output is spent twice within one transaction.
    DoubleSpend,
    /// Revealed unlock conditions do not hash to the output's unlock hash.
    WrongUnlockConditions,
    /// The unlock conditions' timelock has not matured.
    PrematureTimelock,
    /// Siacoin inputs do not equal outputs + fees + contract payouts.
    SiacoinValueMismatch { inputs: Currency, outputs: Currency },
    /// Siafund input values do not equal siafund output values.
    SiafundValueMismatch,
    /// A value sum left the 128-bit currency range.
    ArithmeticOverflow,
    /// A new contract's proof window is not strictly in the future, or is
    /// empty.
    InvalidContractWindow,
    /// A new contract's payout is zero, or its proof output sums disagree
    /// with the after-tax payout.
    InvalidContractPayouts,
    /// A storage proof references a contract that is not live.
    UnknownFileContract(FileContractID),
    /// A storage proof submitted before the contract's window opened.
    EarlyStorageProof,
    /// A storage proof submitted at or after the contract's window end.
    LateStorageProof,
    /// The proof's Merkle path or segment does not match the contract.
    InvalidStorageProof,
    /// A signature that covers nothing: its parent is not spent by this
    /// transaction, or the input is already fully signed.
    FrivolousSignature,
    /// A signature whose own timelock has not matured.
    PrematureSignature,
    /// A key or covered-field index is out of range, unsorted, or violates
    /// whole-transaction coverage.
    InvalidCoveredFields,
    /// Two signatures from the same key for the same input.
    DuplicateSignature,
    /// Signature bytes that do not verify under the declared key.
    BadSignature,
    /// An input with fewer valid signatures than its conditions require.
    MissingSignatures,
    Storage(StoreError),
}

impl Display for TransactionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::ZeroValueOutput => write!(f, "transaction creates a zero value output"),
            TransactionError::MissingSiacoinInput(id) => {
                write!(f, "siacoin input {} does not exist", id)
            }
            TransactionError::MissingSiafundInput(id) => {
                write!(f, "siafund input {} does not exist", id)
            }
            TransactionError::DoubleSpend => write!(f, "output spent twice in one transaction"),
            TransactionError::WrongUnlockConditions => {
                write!(f, "unlock conditions do not match the output's unlock hash")
            }
            TransactionError::PrematureTimelock => write!(f, "unlock timelock has not matured"),
            TransactionError::SiacoinValueMismatch { inputs, outputs } => write!(
                f,
                "siacoin inputs ({}) do not balance outputs ({})",
                inputs, outputs
            ),
            TransactionError::SiafundValueMismatch => {
                write!(f, "siafund inputs do not balance siafund outputs")
            }
            TransactionError::ArithmeticOverflow => write!(f, "currency sum overflows"),
            TransactionError::InvalidContractWindow => {
                write!(f, "file contract window is invalid")
            }
            TransactionError::InvalidContractPayouts => {
                write!(f, "file contract payouts do not match the after-tax payout")
            }
            TransactionError::UnknownFileContract(id) => {
                write!(f, "storage proof references unknown contract {}", id)
            }
            TransactionError::EarlyStorageProof => {
                write!(f, "storage proof submitted before the contract window")
            }
            TransactionError::LateStorageProof => {
                write!(f, "storage proof submitted after the contract window")
            }
            TransactionError::InvalidStorageProof => write!(f, "storage proof does not verify"),
            TransactionError::FrivolousSignature => write!(f, "signature covers nothing"),
            TransactionError::PrematureSignature => write!(f, "signature timelock has not matured"),
            TransactionError::InvalidCoveredFields => write!(f, "covered fields are malformed"),
            TransactionError::DuplicateSignature => {
                write!(f, "duplicate signature for one input and key")
            }
            TransactionError::BadSignature => write!(f, "signature does not verify"),
            TransactionError::MissingSignatures => {
                write!(f, "input is missing required signatures")
            }
            TransactionError::Storage(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<StoreError> for TransactionError {
    fn from(err: StoreError) -> Self {
        TransactionError::Storage(err)
    }
}

/// Validate `txn` against the state in `view`, as the chain would stand at
/// `height` with the transaction's predecessors already applied.
pub fn valid_transaction<K: KVStore>(
    view: &DbTx<K>,
    txn: &Transaction,
    height: BlockHeight,
    constants: &ProtocolConstants,
) -> Result<(), TransactionError> {
    no_zero_value_outputs(txn)?;
    let siacoin_input_sum = valid_siacoin_inputs(view, txn, height)?;
    siacoins_balance(txn, siacoin_input_sum)?;
    valid_file_contracts(txn, height, constants)?;
    valid_storage_proofs(view, txn, height)?;
    valid_siafunds(view, txn, height)?;
    valid_signatures(txn, height)?;
    Ok(())
}

fn no_zero_value_outputs(txn: &Transaction) -> Result<(), TransactionError> {
    let zero_siacoin = txn.siacoin_outputs.iter().any(|sco| sco.value.is_zero());
    let zero_siafund = txn.siafund_outputs.iter().any(|sfo| sfo.value.is_zero());
    let zero_fee = txn.miner_fees.iter().any(|fee| fee.is_zero());
    if zero_siacoin || zero_siafund || zero_fee {
        return Err(TransactionError::ZeroValueOutput);
    }
    Ok(())
}

/// Check that the revealed conditions match the stored unlock hash and have
/// matured.
fn valid_unlock_conditions(
    conditions: &UnlockConditions,
    unlock_hash: crate::types::basic::UnlockHash,
    height: BlockHeight,
) -> Result<(), TransactionError> {
    if conditions.unlock_hash() != unlock_hash {
        return Err(TransactionError::WrongUnlockConditions);
    }
    if conditions.timelock > height {
        return Err(TransactionError::PrematureTimelock);
    }
    Ok(())
}

fn valid_siacoin_inputs<K: KVStore>(
    view: &DbTx<K>,
    txn: &Transaction,
    height: BlockHeight,
) -> Result<Currency, TransactionError> {
    let mut spent: HashSet<SiacoinOutputID> = HashSet::new();
    let mut sum = Currency::ZERO;
    for input in &txn.siacoin_inputs {
        if !spent.insert(input.parent_id) {
            return Err(TransactionError::DoubleSpend);
        }
        let output: SiacoinOutput = view
            .try_get(SIACOIN_OUTPUTS, &input.parent_id.bytes())?
            .ok_or(TransactionError::MissingSiacoinInput(input.parent_id))?;
        valid_unlock_conditions(&input.unlock_conditions, output.unlock_hash, height)?;
        sum = sum
            .checked_add(output.value)
            .ok_or(TransactionError::ArithmeticOverflow)?;
    }
    Ok(sum)
}

/// Σ inputs must equal Σ outputs + Σ miner fees + Σ new contract payouts.
fn siacoins_balance(txn: &Transaction, input_sum: Currency) -> Result<(), TransactionError> {
    let mut output_sum = Currency::ZERO;
    let mut add = |value: Currency| -> Result<(), TransactionError> {
        output_sum = output_sum
            .checked_add(value)
            .ok_or(TransactionError::ArithmeticOverflow)?;
        Ok(())
    };
    for output in &txn.siacoin_outputs {
        add(output.value)?;
    }
    for fee in &txn.miner_fees {
        add(*fee)?;
    }
    for contract in &txn.file_contracts {
        add(contract.payout)?;
    }
    if input_sum != output_sum {
        return Err(TransactionError::SiacoinValueMismatch {
            inputs: input_sum,
            outputs: output_sum,
        });
    }
    Ok(())
}

fn valid_file_contracts(
    txn: &Transaction,
    height: BlockHeight,
    constants: &ProtocolConstants,
) -> Result<(), TransactionError> {
    for contract in &txn.file_contracts {
        if contract.window_start <= height || contract.window_end <= contract.window_start {
            return Err(TransactionError::InvalidContractWindow);
        }
        if contract.payout.is_zero() {
            return Err(TransactionError::InvalidContractPayouts);
        }
        let after_tax = contract
            .payout
            .checked_sub(constants.tax(contract.payout))
            .ok_or(TransactionError::InvalidContractPayouts)?;
        for outputs in [&contract.valid_proof_outputs, &contract.missed_proof_outputs] {
            let mut sum = Currency::ZERO;
            for output in outputs {
                sum = sum
                    .checked_add(output.value)
                    .ok_or(TransactionError::ArithmeticOverflow)?;
            }
            if sum != after_tax {
                return Err(TransactionError::InvalidContractPayouts);
            }
        }
    }
    Ok(())
}

/// The segment a host must prove for `contract`: derived from the ID of the
/// block just before the proof window opened, so it cannot be predicted when
/// the contract forms.
pub fn storage_proof_segment<K: KVStore>(
    view: &DbTx<K>,
    id: FileContractID,
    contract: &FileContract,
) -> Result<u64, TransactionError> {
    // Contract windows are validated to start strictly after the height the
    // contract confirmed at, so `window_start` is at least 1.
    let trigger_height = contract
        .window_start
        .checked_sub(1)
        .ok_or(TransactionError::InvalidStorageProof)?;
    let trigger_id: BlockID = view.get(BLOCK_PATH, &height_key(trigger_height))?;
    let digest = hash_all(&[&trigger_id.bytes(), &id.bytes()]);
    let mut le = [0u8; 8];
    le.copy_from_slice(&digest.bytes()[..8]);
    let segment_count = contract.segment_count();
    if segment_count == 0 {
        return Err(TransactionError::InvalidStorageProof);
    }
    Ok(u64::from_le_bytes(le) % segment_count)
}

fn valid_storage_proofs<K: KVStore>(
    view: &DbTx<K>,
    txn: &Transaction,
    height: BlockHeight,
) -> Result<(), TransactionError> {
    for proof in &txn.storage_proofs {
        let contract: FileContract = view
            .try_get(FILE_CONTRACTS, &proof.parent_id.bytes())?
            .ok_or(TransactionError::UnknownFileContract(proof.parent_id))?;
        if height < contract.window_start {
            return Err(TransactionError::EarlyStorageProof);
        }
        if height >= contract.window_end {
            return Err(TransactionError::LateStorageProof);
        }
        let segment = storage_proof_segment(view, proof.parent_id, &contract)?;
        let verified = crate::crypto::verify_segment(
            &contract.file_merkle_root,
            &proof.segment,
            segment,
            contract.segment_count(),
            &proof.hash_set,
        );
        if !verified {
            return Err(TransactionError::InvalidStorageProof);
        }
    }
    Ok(())
}

fn valid_siafunds<K: KVStore>(
    view: &DbTx<K>,
    txn: &Transaction,
    height: BlockHeight,
) -> Result<(), TransactionError> {
    let mut spent: HashSet<SiafundOutputID> = HashSet::new();
    let mut input_sum = Currency::ZERO;
    for input in &txn.siafund_inputs {
        if !spent.insert(input.parent_id) {
            return Err(TransactionError::DoubleSpend);
        }
        let output: SiafundOutput = view
            .try_get(SIAFUND_OUTPUTS, &input.parent_id.bytes())?
            .ok_or(TransactionError::MissingSiafundInput(input.parent_id))?;
        valid_unlock_conditions(&input.unlock_conditions, output.unlock_hash, height)?;
        input_sum = input_sum
            .checked_add(output.value)
            .ok_or(TransactionError::ArithmeticOverflow)?;
    }
    let mut output_sum = Currency::ZERO;
    for output in &txn.siafund_outputs {
        // `claim_start` is set by the consensus set when the output is
        // confirmed; whatever the transaction carries there is ignored.
        output_sum = output_sum
            .checked_add(output.value)
            .ok_or(TransactionError::ArithmeticOverflow)?;
    }
    if input_sum != output_sum {
        return Err(TransactionError::SiafundValueMismatch);
    }
    Ok(())
}

/// Indices must be strictly ascending and in range; whole-transaction
/// coverage forbids naming individual fields (signature indices excepted).
fn valid_covered_fields(
    txn: &Transaction,
    covered: &CoveredFields,
) -> Result<(), TransactionError> {
    let field_lens = [
        (&covered.siacoin_inputs, txn.siacoin_inputs.len()),
        (&covered.siacoin_outputs, txn.siacoin_outputs.len()),
        (&covered.file_contracts, txn.file_contracts.len()),
        (&covered.storage_proofs, txn.storage_proofs.len()),
        (&covered.siafund_inputs, txn.siafund_inputs.len()),
        (&covered.siafund_outputs, txn.siafund_outputs.len()),
        (&covered.miner_fees, txn.miner_fees.len()),
        (&covered.arbitrary_data, txn.arbitrary_data.len()),
        (&covered.signatures, txn.signatures.len()),
    ];
    for (indices, len) in field_lens {
        let mut previous: Option<u64> = None;
        for &index in indices {
            if index >= len as u64 || previous.is_some_and(|p| p >= index) {
                return Err(TransactionError::InvalidCoveredFields);
            }
            previous = Some(index);
        }
    }
    if covered.whole_transaction {
        let named_fields = !covered.siacoin_inputs.is_empty()
            || !covered.siacoin_outputs.is_empty()
            || !covered.file_contracts.is_empty()
            || !covered.storage_proofs.is_empty()
            || !covered.siafund_inputs.is_empty()
            || !covered.siafund_outputs.is_empty()
            || !covered.miner_fees.is_empty()
            || !covered.arbitrary_data.is_empty();
        if named_fields {
            return Err(TransactionError::InvalidCoveredFields);
        }
    }
    Ok(())
}

struct SignatureStatus {
    conditions: UnlockConditions,
    remaining: u64,
    used_keys: HashSet<u64>,
}

/// Every input must accumulate `signatures_required` valid signatures from
/// distinct keys in its unlock conditions.
fn valid_signatures(txn: &Transaction, height: BlockHeight) -> Result<(), TransactionError> {
    let mut statuses: HashMap<Hash, SignatureStatus> = HashMap::new();
    for input in &txn.siacoin_inputs {
        statuses.insert(
            input.parent_id.hash(),
            SignatureStatus {
                conditions: input.unlock_conditions.clone(),
                remaining: input.unlock_conditions.signatures_required,
                used_keys: HashSet::new(),
            },
        );
    }
    for input in &txn.siafund_inputs {
        statuses.insert(
            input.parent_id.hash(),
            SignatureStatus {
                conditions: input.unlock_conditions.clone(),
                remaining: input.unlock_conditions.signatures_required,
                used_keys: HashSet::new(),
            },
        );
    }

    for signature in &txn.signatures {
        let status = statuses
            .get_mut(&signature.parent_id)
            .ok_or(TransactionError::FrivolousSignature)?;
        if status.remaining == 0 {
            return Err(TransactionError::FrivolousSignature);
        }
        if signature.timelock > height {
            return Err(TransactionError::PrematureSignature);
        }
        if signature.public_key_index >= status.conditions.public_keys.len() as u64 {
            return Err(TransactionError::InvalidCoveredFields);
        }
        if !status.used_keys.insert(signature.public_key_index) {
            return Err(TransactionError::DuplicateSignature);
        }
        valid_covered_fields(txn, &signature.covered_fields)?;
        let digest = txn.sig_hash(signature);
        let public_key = status.conditions.public_keys[signature.public_key_index as usize];
        if !verify_signature(&public_key, &digest, &signature.signature) {
            return Err(TransactionError::BadSignature);
        }
        status.remaining -= 1;
    }

    if statuses.values().any(|status| status.remaining > 0) {
        return Err(TransactionError::MissingSignatures);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{PublicKey, SignatureBytes};
    use crate::types::transaction::{SiacoinInput, TransactionSignature};

    fn unsigned_spend() -> Transaction {
        let conditions = UnlockConditions::standard(PublicKey::new([1; 32]));
        Transaction {
            siacoin_inputs: vec![SiacoinInput {
                parent_id: SiacoinOutputID::default(),
                unlock_conditions: conditions,
            }],
            siacoin_outputs: vec![SiacoinOutput {
                value: Currency::new(5),
                unlock_hash: Default::default(),
            }],
            ..Transaction::default()
        }
    }

    #[test]
    fn zero_value_outputs_are_rejected() {
        let mut txn = Transaction::default();
        txn.siacoin_outputs.push(SiacoinOutput {
            value: Currency::ZERO,
            unlock_hash: Default::default(),
        });
        assert_eq!(
            no_zero_value_outputs(&txn),
            Err(TransactionError::ZeroValueOutput)
        );
    }

    #[test]
    fn balance_includes_fees_and_contract_payouts() {
        let mut txn = Transaction::default();
        txn.siacoin_outputs.push(SiacoinOutput {
            value: Currency::new(60),
            unlock_hash: Default::default(),
        });
        txn.miner_fees.push(Currency::new(40));
        assert!(siacoins_balance(&txn, Currency::new(100)).is_ok());
        assert!(matches!(
            siacoins_balance(&txn, Currency::new(99)),
            Err(TransactionError::SiacoinValueMismatch { .. })
        ));
    }

    #[test]
    fn contract_windows_must_be_in_the_future() {
        let constants = ProtocolConstants::default();
        let mut txn = Transaction::default();
        let payout = Currency::new(1_000_000);
        let after_tax = payout.checked_sub(constants.tax(payout)).unwrap();
        txn.file_contracts.push(FileContract {
            window_start: BlockHeight::new(5),
            window_end: BlockHeight::new(10),
            payout,
            valid_proof_outputs: vec![SiacoinOutput {
                value: after_tax,
                unlock_hash: Default::default(),
            }],
            missed_proof_outputs: vec![SiacoinOutput {
                value: after_tax,
                unlock_hash: Default::default(),
            }],
            ..FileContract::default()
        });
        assert!(valid_file_contracts(&txn, BlockHeight::new(4), &constants).is_ok());
        assert_eq!(
            valid_file_contracts(&txn, BlockHeight::new(5), &constants),
            Err(TransactionError::InvalidContractWindow)
        );
    }

    #[test]
    fn contract_payout_sums_must_match_after_tax() {
        let constants = ProtocolConstants::default();
        let mut txn = Transaction::default();
        txn.file_contracts.push(FileContract {
            window_start: BlockHeight::new(5),
            window_end: BlockHeight::new(10),
            payout: Currency::new(1_000_000),
            valid_proof_outputs: vec![SiacoinOutput {
                value: Currency::new(1_000_000),
                unlock_hash: Default::default(),
            }],
            missed_proof_outputs: vec![SiacoinOutput {
                value: Currency::new(1_000_000),
                unlock_hash: Default::default(),
            }],
            ..FileContract::default()
        });
        assert_eq!(
            valid_file_contracts(&txn, BlockHeight::new(1), &constants),
            Err(TransactionError::InvalidContractPayouts)
        );
    }

    #[test]
    fn signatures_must_cover_a_spent_input() {
        let mut txn = Transaction::default();
        txn.signatures.push(TransactionSignature {
            parent_id: Hash::default(),
            public_key_index: 0,
            timelock: BlockHeight::new(0),
            covered_fields: CoveredFields::whole_transaction(),
            signature: SignatureBytes::default(),
        });
        assert_eq!(
            valid_signatures(&txn, BlockHeight::new(1)),
            Err(TransactionError::FrivolousSignature)
        );
    }

    #[test]
    fn unsigned_inputs_are_missing_signatures() {
        let txn = unsigned_spend();
        assert_eq!(
            valid_signatures(&txn, BlockHeight::new(1)),
            Err(TransactionError::MissingSignatures)
        );
    }

    #[test]
    fn whole_transaction_coverage_forbids_named_fields() {
        let txn = unsigned_spend();
        let covered = CoveredFields {
            whole_transaction: true,
            siacoin_inputs: vec![0],
            ..CoveredFields::default()
        };
        assert_eq!(
            valid_covered_fields(&txn, &covered),
            Err(TransactionError::InvalidCoveredFields)
        );
    }

    #[test]
    fn covered_field_indices_must_be_sorted_and_in_range() {
        let txn = unsigned_spend();
        let out_of_range = CoveredFields {
            siacoin_outputs: vec![1],
            ..CoveredFields::default()
        };
        assert!(valid_covered_fields(&txn, &out_of_range).is_err());
        let unsorted = CoveredFields {
            siacoin_inputs: vec![0, 0],
            ..CoveredFields::default()
        };
        assert!(valid_covered_fields(&txn, &unsorted).is_err());
    }
}
