/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Hashing, Merkle trees, and signature verification.
//!
//! Every digest in the consensus set is SHA-256. Merkle trees follow the
//! split-at-largest-power-of-two shape with domain-separated leaf and node
//! prefixes, so a leaf can never be confused with an interior node. Storage
//! proofs carry the audit path from a 64-byte file segment up to a contract's
//! file Merkle root; [`verify_segment`] checks such a path.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::encoding::Encodable;
use crate::types::basic::{Hash, PublicKey, SignatureBytes};

/// Leaf bytes are hashed under this prefix, interior nodes under
/// [`NODE_PREFIX`].
const LEAF_PREFIX: [u8; 1] = [0];
const NODE_PREFIX: [u8; 1] = [1];

/// Bytes of a file segment covered by one storage-proof leaf.
pub const SEGMENT_SIZE: usize = 64;

pub fn hash_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Hash::new(hasher.finalize().into())
}

/// Hash the canonical encoding of an entity.
pub fn hash_object<T: Encodable>(object: &T) -> Hash {
    hash_bytes(&object.to_bytes())
}

/// Hash the concatenation of several byte strings. Callers are responsible
/// for ensuring the parts have fixed widths so the concatenation is
/// unambiguous.
pub fn hash_all(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash::new(hasher.finalize().into())
}

pub fn leaf_hash(leaf: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(LEAF_PREFIX);
    hasher.update(leaf);
    Hash::new(hasher.finalize().into())
}

pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(NODE_PREFIX);
    hasher.update(left.as_slice());
    hasher.update(right.as_slice());
    Hash::new(hasher.finalize().into())
}

/// The largest power of two strictly less than `n`. `n` must be at least 2.
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Root of the Merkle tree over `leaves`. The empty tree hashes to the
/// digest of the empty string.
pub fn merkle_root(leaves: &[Vec<u8>]) -> Hash {
    if leaves.is_empty() {
        return hash_bytes(&[]);
    }
    subtree_root(leaves)
}

fn subtree_root(leaves: &[Vec<u8>]) -> Hash {
    if leaves.len() == 1 {
        return leaf_hash(&leaves[0]);
    }
    let k = split_point(leaves.len());
    node_hash(&subtree_root(&leaves[..k]), &subtree_root(&leaves[k..]))
}

/// The audit path for `leaves[index]`, ordered bottom-up.
pub fn merkle_proof(leaves: &[Vec<u8>], index: usize) -> Vec<Hash> {
    assert!(index < leaves.len());
    if leaves.len() == 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut proof = merkle_proof(&leaves[..k], index);
        proof.push(subtree_root(&leaves[k..]));
        proof
    } else {
        let mut proof = merkle_proof(&leaves[k..], index - k);
        proof.push(subtree_root(&leaves[..k]));
        proof
    }
}

/// Check that `segment` is the leaf at `index` of a `count`-leaf tree with
/// the given `root`, using the bottom-up audit path `proof`.
pub fn verify_segment(
    root: &Hash,
    segment: &[u8],
    index: u64,
    count: u64,
    proof: &[Hash],
) -> bool {
    if count == 0 || index >= count {
        return false;
    }
    let mut node_index = index;
    let mut last_index = count - 1;
    let mut running = leaf_hash(segment);
    for sibling in proof {
        if last_index == 0 {
            // Path is longer than the tree is tall.
            return false;
        }
        if node_index % 2 == 1 || node_index == last_index {
            running = node_hash(sibling, &running);
            if node_index % 2 == 0 {
                // A right-border node skips the levels where it has no
                // sibling.
                while node_index % 2 == 0 && node_index != 0 {
                    node_index /= 2;
                    last_index /= 2;
                }
            }
        } else {
            running = node_hash(&running, sibling);
        }
        node_index /= 2;
        last_index /= 2;
    }
    last_index == 0 && running == *root
}

/// Verify an Ed25519 signature over a 32-byte message digest. A key that
/// fails to parse verifies nothing.
pub fn verify_signature(public_key: &PublicKey, message: &Hash, signature: &SignatureBytes) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(&public_key.bytes()) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature.bytes());
    key.verify(message.as_slice(), &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Vec<u8>> {
        (0..n).map(|i| vec![i as u8; SEGMENT_SIZE]).collect()
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let ls = leaves(1);
        assert_eq!(merkle_root(&ls), leaf_hash(&ls[0]));
        assert!(merkle_proof(&ls, 0).is_empty());
    }

    #[test]
    fn every_proof_verifies() {
        for count in 1..=17usize {
            let ls = leaves(count);
            let root = merkle_root(&ls);
            for index in 0..count {
                let proof = merkle_proof(&ls, index);
                assert!(
                    verify_segment(&root, &ls[index], index as u64, count as u64, &proof),
                    "count {} index {}",
                    count,
                    index
                );
            }
        }
    }

    #[test]
    fn wrong_segment_fails() {
        let ls = leaves(9);
        let root = merkle_root(&ls);
        let proof = merkle_proof(&ls, 4);
        assert!(!verify_segment(&root, &ls[5], 4, 9, &proof));
        assert!(!verify_segment(&root, &ls[4], 5, 9, &proof));
        assert!(!verify_segment(&root, &ls[4], 4, 8, &proof));
    }

    #[test]
    fn truncated_proof_fails() {
        let ls = leaves(8);
        let root = merkle_root(&ls);
        let mut proof = merkle_proof(&ls, 3);
        proof.pop();
        assert!(!verify_segment(&root, &ls[3], 3, 8, &proof));
    }

    #[test]
    fn signature_round_trip() {
        use ed25519_dalek::{Signer, SigningKey};
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let message = hash_bytes(b"covered fields");
        let signature = SignatureBytes::new(key.sign(message.as_slice()).to_bytes());
        let public_key = PublicKey::new(key.verifying_key().to_bytes());
        assert!(verify_signature(&public_key, &message, &signature));
        let other = hash_bytes(b"different fields");
        assert!(!verify_signature(&public_key, &other, &signature));
    }
}
