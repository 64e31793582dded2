/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transactions and their components.
//!
//! A transaction destroys the outputs its inputs name and creates the outputs
//! it lists, conserving value exactly (§ miner fees and contract payouts
//! included). Identifiers for the objects a transaction creates are derived
//! by hashing a 16-byte specifier, the transaction ID, and the object's index,
//! so they are unique without any coordination.
//!
//! Signatures do not contribute to the transaction ID: the ID covers every
//! field except `signatures`, which keeps it stable under signature
//! malleability.

use crate::crypto::{hash_all, hash_bytes};
use crate::encoding::{Decodable, DecodeError, Encodable};
use crate::types::basic::{
    BlockHeight, Currency, FileContractID, Hash, PublicKey, SiacoinOutputID, SiafundOutputID,
    SignatureBytes, TransactionID, UnlockHash,
};

const SPECIFIER_SIACOIN_OUTPUT: [u8; 16] = *b"siacoin output\0\0";
const SPECIFIER_FILE_CONTRACT: [u8; 16] = *b"file contract\0\0\0";
const SPECIFIER_SIAFUND_OUTPUT: [u8; 16] = *b"siafund output\0\0";
const SPECIFIER_STORAGE_PROOF: [u8; 16] = *b"storage proof\0\0\0";
const SPECIFIER_CLAIM_OUTPUT: [u8; 16] = *b"claim output\0\0\0\0";

/// A spendable volume of siacoins, locked behind an unlock hash.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiacoinOutput {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
}

impl Encodable for SiacoinOutput {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.value.encode(buf);
        self.unlock_hash.encode(buf);
    }
}

impl Decodable for SiacoinOutput {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            value: Currency::decode(buf)?,
            unlock_hash: UnlockHash::decode(buf)?,
        })
    }
}

/// Spends the siacoin output named by `parent_id`. The unlock conditions
/// must hash to the output's unlock hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiacoinInput {
    pub parent_id: SiacoinOutputID,
    pub unlock_conditions: UnlockConditions,
}

impl Encodable for SiacoinInput {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.parent_id.encode(buf);
        self.unlock_conditions.encode(buf);
    }
}

impl Decodable for SiacoinInput {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            parent_id: SiacoinOutputID::decode(buf)?,
            unlock_conditions: UnlockConditions::decode(buf)?,
        })
    }
}

/// A siafund output. `claim_start` snapshots the siafund pool at the moment
/// the output was confirmed; the difference between the pool and the snapshot
/// determines the siacoin claim awarded when the output is spent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SiafundOutput {
    pub value: Currency,
    pub unlock_hash: UnlockHash,
    pub claim_start: Currency,
}

impl Encodable for SiafundOutput {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.value.encode(buf);
        self.unlock_hash.encode(buf);
        self.claim_start.encode(buf);
    }
}

impl Decodable for SiafundOutput {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            value: Currency::decode(buf)?,
            unlock_hash: UnlockHash::decode(buf)?,
            claim_start: Currency::decode(buf)?,
        })
    }
}

/// Spends the siafund output named by `parent_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiafundInput {
    pub parent_id: SiafundOutputID,
    pub unlock_conditions: UnlockConditions,
}

impl Encodable for SiafundInput {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.parent_id.encode(buf);
        self.unlock_conditions.encode(buf);
    }
}

impl Decodable for SiafundInput {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            parent_id: SiafundOutputID::decode(buf)?,
            unlock_conditions: UnlockConditions::decode(buf)?,
        })
    }
}

/// The conditions under which an output may be spent: after `timelock`, with
/// signatures from `signatures_required` of the listed keys.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnlockConditions {
    pub timelock: BlockHeight,
    pub public_keys: Vec<PublicKey>,
    pub signatures_required: u64,
}

impl UnlockConditions {
    /// The address form of these conditions: outputs store this hash, and a
    /// spender must reveal conditions that hash back to it.
    pub fn unlock_hash(&self) -> UnlockHash {
        UnlockHash::new(hash_bytes(&self.to_bytes()))
    }

    /// Conditions spendable by a single key with no timelock.
    pub fn standard(public_key: PublicKey) -> Self {
        Self {
            timelock: BlockHeight::new(0),
            public_keys: vec![public_key],
            signatures_required: 1,
        }
    }
}

impl Encodable for UnlockConditions {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.timelock.encode(buf);
        self.public_keys.encode(buf);
        self.signatures_required.encode(buf);
    }
}

impl Decodable for UnlockConditions {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            timelock: BlockHeight::decode(buf)?,
            public_keys: Vec::<PublicKey>::decode(buf)?,
            signatures_required: u64::decode(buf)?,
        })
    }
}

/// An agreement to store a file. The host must submit a storage proof inside
/// `[window_start, window_end)`; the valid-proof outputs pay out on success,
/// the missed-proof outputs when the window closes without a proof.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileContract {
    pub file_size: u64,
    pub file_merkle_root: Hash,
    pub window_start: BlockHeight,
    pub window_end: BlockHeight,
    pub payout: Currency,
    pub valid_proof_outputs: Vec<SiacoinOutput>,
    pub missed_proof_outputs: Vec<SiacoinOutput>,
    pub unlock_hash: UnlockHash,
}

impl FileContract {
    /// Number of 64-byte segments in the contract's file.
    pub fn segment_count(&self) -> u64 {
        self.file_size.div_ceil(crate::crypto::SEGMENT_SIZE as u64)
    }
}

impl Encodable for FileContract {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.file_size.encode(buf);
        self.file_merkle_root.encode(buf);
        self.window_start.encode(buf);
        self.window_end.encode(buf);
        self.payout.encode(buf);
        self.valid_proof_outputs.encode(buf);
        self.missed_proof_outputs.encode(buf);
        self.unlock_hash.encode(buf);
    }
}

impl Decodable for FileContract {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            file_size: u64::decode(buf)?,
            file_merkle_root: Hash::decode(buf)?,
            window_start: BlockHeight::decode(buf)?,
            window_end: BlockHeight::decode(buf)?,
            payout: Currency::decode(buf)?,
            valid_proof_outputs: Vec::<SiacoinOutput>::decode(buf)?,
            missed_proof_outputs: Vec::<SiacoinOutput>::decode(buf)?,
            unlock_hash: UnlockHash::decode(buf)?,
        })
    }
}

/// Proof that a host still stores a contract's file: one 64-byte segment,
/// chosen unpredictably by the chain, plus its Merkle audit path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageProof {
    pub parent_id: FileContractID,
    pub segment: [u8; 64],
    pub hash_set: Vec<Hash>,
}

impl Encodable for StorageProof {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.parent_id.encode(buf);
        self.segment.encode(buf);
        self.hash_set.encode(buf);
    }
}

impl Decodable for StorageProof {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            parent_id: FileContractID::decode(buf)?,
            segment: <[u8; 64]>::decode(buf)?,
            hash_set: Vec::<Hash>::decode(buf)?,
        })
    }
}

/// Selects which transaction fields a signature covers: either the whole
/// transaction (minus signatures), or explicit per-field element indices.
/// Indices into `signatures` may be covered in either mode.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoveredFields {
    pub whole_transaction: bool,
    pub siacoin_inputs: Vec<u64>,
    pub siacoin_outputs: Vec<u64>,
    pub file_contracts: Vec<u64>,
    pub storage_proofs: Vec<u64>,
    pub siafund_inputs: Vec<u64>,
    pub siafund_outputs: Vec<u64>,
    pub miner_fees: Vec<u64>,
    pub arbitrary_data: Vec<u64>,
    pub signatures: Vec<u64>,
}

impl CoveredFields {
    /// Coverage of the whole transaction, the common case.
    pub fn whole_transaction() -> Self {
        Self {
            whole_transaction: true,
            ..Self::default()
        }
    }
}

impl Encodable for CoveredFields {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.whole_transaction.encode(buf);
        self.siacoin_inputs.encode(buf);
        self.siacoin_outputs.encode(buf);
        self.file_contracts.encode(buf);
        self.storage_proofs.encode(buf);
        self.siafund_inputs.encode(buf);
        self.siafund_outputs.encode(buf);
        self.miner_fees.encode(buf);
        self.arbitrary_data.encode(buf);
        self.signatures.encode(buf);
    }
}

impl Decodable for CoveredFields {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            whole_transaction: bool::decode(buf)?,
            siacoin_inputs: Vec::<u64>::decode(buf)?,
            siacoin_outputs: Vec::<u64>::decode(buf)?,
            file_contracts: Vec::<u64>::decode(buf)?,
            storage_proofs: Vec::<u64>::decode(buf)?,
            siafund_inputs: Vec::<u64>::decode(buf)?,
            siafund_outputs: Vec::<u64>::decode(buf)?,
            miner_fees: Vec::<u64>::decode(buf)?,
            arbitrary_data: Vec::<u64>::decode(buf)?,
            signatures: Vec::<u64>::decode(buf)?,
        })
    }
}

/// One signature authorizing the spend of the input whose parent is
/// `parent_id`, under the key at `public_key_index` of that input's unlock
/// conditions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionSignature {
    pub parent_id: Hash,
    pub public_key_index: u64,
    pub timelock: BlockHeight,
    pub covered_fields: CoveredFields,
    pub signature: SignatureBytes,
}

impl Encodable for TransactionSignature {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.parent_id.encode(buf);
        self.public_key_index.encode(buf);
        self.timelock.encode(buf);
        self.covered_fields.encode(buf);
        self.signature.encode(buf);
    }
}

impl Decodable for TransactionSignature {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            parent_id: Hash::decode(buf)?,
            public_key_index: u64::decode(buf)?,
            timelock: BlockHeight::decode(buf)?,
            covered_fields: CoveredFields::decode(buf)?,
            signature: SignatureBytes::decode(buf)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    pub siacoin_inputs: Vec<SiacoinInput>,
    pub siacoin_outputs: Vec<SiacoinOutput>,
    pub file_contracts: Vec<FileContract>,
    pub storage_proofs: Vec<StorageProof>,
    pub siafund_inputs: Vec<SiafundInput>,
    pub siafund_outputs: Vec<SiafundOutput>,
    pub miner_fees: Vec<Currency>,
    pub arbitrary_data: Vec<Vec<u8>>,
    pub signatures: Vec<TransactionSignature>,
}

impl Transaction {
    /// Encode every field except `signatures`, in declaration order.
    fn encode_no_signatures(&self, buf: &mut Vec<u8>) {
        self.siacoin_inputs.encode(buf);
        self.siacoin_outputs.encode(buf);
        self.file_contracts.encode(buf);
        self.storage_proofs.encode(buf);
        self.siafund_inputs.encode(buf);
        self.siafund_outputs.encode(buf);
        self.miner_fees.encode(buf);
        self.arbitrary_data.encode(buf);
    }

    pub fn id(&self) -> TransactionID {
        let mut buf = Vec::new();
        self.encode_no_signatures(&mut buf);
        TransactionID::new(hash_bytes(&buf))
    }

    pub fn siacoin_output_id(&self, index: u64) -> SiacoinOutputID {
        SiacoinOutputID::new(hash_all(&[
            &SPECIFIER_SIACOIN_OUTPUT,
            &self.id().bytes(),
            &index.to_le_bytes(),
        ]))
    }

    pub fn file_contract_id(&self, index: u64) -> FileContractID {
        FileContractID::new(hash_all(&[
            &SPECIFIER_FILE_CONTRACT,
            &self.id().bytes(),
            &index.to_le_bytes(),
        ]))
    }

    pub fn siafund_output_id(&self, index: u64) -> SiafundOutputID {
        SiafundOutputID::new(hash_all(&[
            &SPECIFIER_SIAFUND_OUTPUT,
            &self.id().bytes(),
            &index.to_le_bytes(),
        ]))
    }

    /// The digest a [`TransactionSignature`] signs: the covered fields, then
    /// the signature's own parent, key index, and timelock, so a signature
    /// cannot be transplanted onto another input.
    ///
    /// # Precondition
    ///
    /// Every index in `signature.covered_fields` is in range for this
    /// transaction (checked during signature validation).
    pub fn sig_hash(&self, signature: &TransactionSignature) -> Hash {
        let covered = &signature.covered_fields;
        let mut buf = Vec::new();
        if covered.whole_transaction {
            self.encode_no_signatures(&mut buf);
        } else {
            for &i in &covered.siacoin_inputs {
                self.siacoin_inputs[i as usize].encode(&mut buf);
            }
            for &i in &covered.siacoin_outputs {
                self.siacoin_outputs[i as usize].encode(&mut buf);
            }
            for &i in &covered.file_contracts {
                self.file_contracts[i as usize].encode(&mut buf);
            }
            for &i in &covered.storage_proofs {
                self.storage_proofs[i as usize].encode(&mut buf);
            }
            for &i in &covered.siafund_inputs {
                self.siafund_inputs[i as usize].encode(&mut buf);
            }
            for &i in &covered.siafund_outputs {
                self.siafund_outputs[i as usize].encode(&mut buf);
            }
            for &i in &covered.miner_fees {
                self.miner_fees[i as usize].encode(&mut buf);
            }
            for &i in &covered.arbitrary_data {
                self.arbitrary_data[i as usize].encode(&mut buf);
            }
        }
        for &i in &covered.signatures {
            self.signatures[i as usize].encode(&mut buf);
        }
        signature.parent_id.encode(&mut buf);
        signature.public_key_index.encode(&mut buf);
        signature.timelock.encode(&mut buf);
        hash_bytes(&buf)
    }
}

impl Encodable for Transaction {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.encode_no_signatures(buf);
        self.signatures.encode(buf);
    }
}

impl Decodable for Transaction {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self {
            siacoin_inputs: Vec::<SiacoinInput>::decode(buf)?,
            siacoin_outputs: Vec::<SiacoinOutput>::decode(buf)?,
            file_contracts: Vec::<FileContract>::decode(buf)?,
            storage_proofs: Vec::<StorageProof>::decode(buf)?,
            siafund_inputs: Vec::<SiafundInput>::decode(buf)?,
            siafund_outputs: Vec::<SiafundOutput>::decode(buf)?,
            miner_fees: Vec::<Currency>::decode(buf)?,
            arbitrary_data: Vec::<Vec<u8>>::decode(buf)?,
            signatures: Vec::<TransactionSignature>::decode(buf)?,
        })
    }
}

impl FileContractID {
    /// ID of the proof output at `index`, on the valid or missed branch.
    pub fn proof_output_id(&self, proof_valid: bool, index: u64) -> SiacoinOutputID {
        SiacoinOutputID::new(hash_all(&[
            &SPECIFIER_STORAGE_PROOF,
            &self.bytes(),
            &[proof_valid as u8],
            &index.to_le_bytes(),
        ]))
    }
}

impl SiafundOutputID {
    /// ID of the siacoin output minted when this siafund output is spent.
    pub fn claim_output_id(&self) -> SiacoinOutputID {
        SiacoinOutputID::new(hash_all(&[&SPECIFIER_CLAIM_OUTPUT, &self.bytes()]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::from_bytes;

    fn sample_transaction() -> Transaction {
        Transaction {
            siacoin_inputs: vec![SiacoinInput {
                parent_id: SiacoinOutputID::new(hash_bytes(b"parent")),
                unlock_conditions: UnlockConditions::standard(PublicKey::new([9; 32])),
            }],
            siacoin_outputs: vec![SiacoinOutput {
                value: Currency::new(1_000),
                unlock_hash: UnlockConditions::default().unlock_hash(),
            }],
            miner_fees: vec![Currency::new(25)],
            arbitrary_data: vec![b"host announcement".to_vec()],
            signatures: vec![TransactionSignature {
                parent_id: hash_bytes(b"parent"),
                public_key_index: 0,
                timelock: BlockHeight::new(0),
                covered_fields: CoveredFields::whole_transaction(),
                signature: SignatureBytes::new([3; 64]),
            }],
            ..Transaction::default()
        }
    }

    #[test]
    fn round_trip() {
        let txn = sample_transaction();
        assert_eq!(from_bytes::<Transaction>(&txn.to_bytes()).unwrap(), txn);
    }

    #[test]
    fn id_ignores_signatures() {
        let mut txn = sample_transaction();
        let id = txn.id();
        txn.signatures.clear();
        assert_eq!(txn.id(), id);
        txn.miner_fees.push(Currency::new(1));
        assert_ne!(txn.id(), id);
    }

    #[test]
    fn derived_ids_are_distinct() {
        let txn = sample_transaction();
        assert_ne!(txn.siacoin_output_id(0), txn.siacoin_output_id(1));
        assert_ne!(
            txn.siacoin_output_id(0).hash(),
            txn.siafund_output_id(0).hash()
        );
        let fc_id = txn.file_contract_id(0);
        assert_ne!(
            fc_id.proof_output_id(true, 0),
            fc_id.proof_output_id(false, 0)
        );
    }

    #[test]
    fn sig_hash_binds_the_parent() {
        let txn = sample_transaction();
        let mut signature = txn.signatures[0].clone();
        let original = txn.sig_hash(&signature);
        signature.parent_id = hash_bytes(b"other parent");
        assert_ne!(txn.sig_hash(&signature), original);
    }

    #[test]
    fn partial_coverage_hashes_only_named_fields() {
        let txn = sample_transaction();
        let covered = CoveredFields {
            siacoin_inputs: vec![0],
            ..CoveredFields::default()
        };
        let signature = TransactionSignature {
            covered_fields: covered,
            ..txn.signatures[0].clone()
        };
        let partial = txn.sig_hash(&signature);
        assert_ne!(partial, txn.sig_hash(&txn.signatures[0]));
    }
}
