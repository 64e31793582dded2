/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Inert newtypes shared across the consensus set.
//!
//! These types are sent around and inspected but have no active behavior of
//! their own. Each follows the newtype pattern: the raw representation is
//! private, and the API for reading it lives here. Arithmetic on [`Currency`]
//! and [`Work`] is checked; an overflow is a validation error, never a wrap.

use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Add;
use std::time::{SystemTime, UNIX_EPOCH};

use primitive_types::{U256, U512};

use crate::encoding::{take, take_len, Decodable, DecodeError, Encodable};

/// A 32-byte hash. The single digest type behind every identifier in the
/// consensus set.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

impl Encodable for Hash {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl Decodable for Hash {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(<[u8; 32]>::decode(buf)?))
    }
}

/// Declares a 32-byte identifier newtype wrapping [`Hash`].
macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(Hash);

        impl $name {
            pub const fn new(hash: Hash) -> Self {
                Self(hash)
            }

            pub const fn hash(&self) -> Hash {
                self.0
            }

            pub const fn bytes(&self) -> [u8; 32] {
                self.0.bytes()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
                Display::fmt(&self.0, f)
            }
        }

        impl Encodable for $name {
            fn encode(&self, buf: &mut Vec<u8>) {
                self.0.encode(buf);
            }
        }

        impl Decodable for $name {
            fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
                Ok(Self(Hash::decode(buf)?))
            }
        }
    };
}

id_type! {
    /// The hash of a block's header fields.
    BlockID
}
id_type! {
    /// Identifies a spendable or delayed siacoin output.
    SiacoinOutputID
}
id_type! {
    /// Identifies a siafund output.
    SiafundOutputID
}
id_type! {
    /// Identifies a file contract.
    FileContractID
}
id_type! {
    /// The hash of a transaction minus its signatures.
    TransactionID
}
id_type! {
    /// The hash of a set of unlock conditions; the address outputs are
    /// spendable against.
    UnlockHash
}

/// Height of a block in the chain. Genesis is height 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHeight(u64);

impl BlockHeight {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn to_le_bytes(&self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn checked_sub(&self, rhs: u64) -> Option<BlockHeight> {
        self.0.checked_sub(rhs).map(BlockHeight)
    }
}

impl Display for BlockHeight {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<u64> for BlockHeight {
    type Output = BlockHeight;

    fn add(self, rhs: u64) -> Self::Output {
        BlockHeight(self.0 + rhs)
    }
}

impl Encodable for BlockHeight {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl Decodable for BlockHeight {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(u64::decode(buf)?))
    }
}

/// A block timestamp in seconds since the Unix epoch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    /// The current wall-clock time. Only used for the future-block bound;
    /// all other timestamp rules compare block timestamps to each other.
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(secs)
    }

    pub fn saturating_add(&self, secs: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(secs))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Encodable for Timestamp {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl Decodable for Timestamp {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(u64::decode(buf)?))
    }
}

/// An unsigned 128-bit currency value.
///
/// All arithmetic is explicit and checked: `None` means the operation would
/// have left the 128-bit range and must surface as a validation error.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Currency(u128);

impl Currency {
    pub const ZERO: Currency = Currency(0);

    pub const fn new(int: u128) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, rhs: Currency) -> Option<Currency> {
        self.0.checked_add(rhs.0).map(Currency)
    }

    pub fn checked_sub(&self, rhs: Currency) -> Option<Currency> {
        self.0.checked_sub(rhs.0).map(Currency)
    }

    pub fn checked_mul(&self, rhs: u64) -> Option<Currency> {
        self.0.checked_mul(rhs as u128).map(Currency)
    }

    /// Floor division by a non-zero integer.
    pub fn div(&self, rhs: u64) -> Currency {
        Currency(self.0 / rhs as u128)
    }

    /// Round down to the closest multiple of `unit`.
    pub fn round_down(&self, unit: u64) -> Currency {
        Currency(self.0 - self.0 % unit as u128)
    }
}

impl From<u64> for Currency {
    fn from(int: u64) -> Self {
        Currency(int as u128)
    }
}

impl Display for Currency {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Encodable for Currency {
    fn encode(&self, buf: &mut Vec<u8>) {
        // Minimal big-endian magnitude, length-prefixed. Zero encodes as an
        // empty byte string.
        let be = self.0.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count();
        be[skip..].to_vec().encode(buf);
    }
}

impl Decodable for Currency {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let len = take_len(buf)?;
        if len > 16 {
            return Err(DecodeError::InvalidCurrency);
        }
        let magnitude = take(buf, len)?;
        if !magnitude.is_empty() && magnitude[0] == 0 {
            return Err(DecodeError::InvalidCurrency);
        }
        let mut be = [0u8; 16];
        be[16 - len..].copy_from_slice(magnitude);
        Ok(Currency(u128::from_be_bytes(be)))
    }
}

/// A proof-of-work target: a block's ID, read as a 256-bit big-endian
/// integer, must not exceed the target its parent set for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

impl Target {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }

    fn to_int(&self) -> U256 {
        U256::from_big_endian(&self.0)
    }

    fn from_int(int: U256) -> Self {
        let mut bytes = [0u8; 32];
        int.to_big_endian(&mut bytes);
        Self(bytes)
    }

    /// Whether `id` satisfies the proof-of-work requirement for this target.
    pub fn is_met_by(&self, id: &BlockID) -> bool {
        U256::from_big_endian(&id.bytes()) <= self.to_int()
    }

    /// The expected number of hashes needed to find a block under this
    /// target: `2^256 / (target + 1)`.
    pub fn work(&self) -> Work {
        let divisor = U512::from(self.to_int()) + U512::one();
        let numerator = U512::one() << 256;
        let quotient = numerator / divisor;
        // The quotient fits in 256 bits because the divisor is at least 1.
        let mut wide = [0u8; 64];
        quotient.to_big_endian(&mut wide);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&wide[32..]);
        Work(U256::from_big_endian(&bytes))
    }

    /// Multiply the target by the ratio `numerator / denominator`, saturating
    /// at the 256-bit range. The 512-bit intermediate keeps the computation
    /// exact for any elapsed-time numerator.
    pub fn mul_ratio(&self, numerator: u64, denominator: u64) -> Target {
        let product = U512::from(self.to_int()) * U512::from(numerator);
        let quotient = product / U512::from(denominator.max(1));
        if quotient > U512::from(U256::MAX) {
            return Target([0xff; 32]);
        }
        let mut wide = [0u8; 64];
        quotient.to_big_endian(&mut wide);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&wide[32..]);
        Target::from_int(U256::from_big_endian(&bytes))
    }
}

impl Encodable for Target {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl Decodable for Target {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(<[u8; 32]>::decode(buf)?))
    }
}

/// Cumulative proof-of-work, summed per block from genesis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Work(U256);

impl Work {
    pub const ZERO: Work = Work(U256::zero());

    pub fn checked_add(&self, rhs: Work) -> Option<Work> {
        self.0.checked_add(rhs.0).map(Work)
    }
}

impl Display for Work {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Encodable for Work {
    fn encode(&self, buf: &mut Vec<u8>) {
        let mut bytes = [0u8; 32];
        self.0.to_big_endian(&mut bytes);
        bytes.encode(buf);
    }
}

impl Decodable for Work {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(U256::from_big_endian(&<[u8; 32]>::decode(buf)?)))
    }
}

/// An Ed25519 public key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 32] {
        self.0
    }
}

impl Encodable for PublicKey {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl Decodable for PublicKey {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(<[u8; 32]>::decode(buf)?))
    }
}

/// An Ed25519 signature, as raw bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SignatureBytes([u8; 64]);

impl SignatureBytes {
    pub const fn new(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 64] {
        self.0
    }
}

impl Debug for SignatureBytes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "…")
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl Encodable for SignatureBytes {
    fn encode(&self, buf: &mut Vec<u8>) {
        self.0.encode(buf);
    }
}

impl Decodable for SignatureBytes {
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(<[u8; 64]>::decode(buf)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::from_bytes;

    #[test]
    fn currency_encoding_is_minimal() {
        assert_eq!(Currency::ZERO.to_bytes(), 0u64.to_bytes());
        let c = Currency::new(0x0102);
        let bytes = c.to_bytes();
        assert_eq!(bytes, [2, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(from_bytes::<Currency>(&bytes).unwrap(), c);
    }

    #[test]
    fn currency_rejects_padded_magnitude() {
        // 0x0002 with a leading zero byte is non-canonical.
        let mut bytes = 2u64.to_bytes();
        bytes.extend_from_slice(&[0, 2]);
        assert!(from_bytes::<Currency>(&bytes).is_err());
    }

    #[test]
    fn currency_round_trip_extremes() {
        for c in [Currency::new(1), Currency::new(u128::MAX)] {
            assert_eq!(from_bytes::<Currency>(&c.to_bytes()).unwrap(), c);
        }
    }

    #[test]
    fn work_of_max_target_is_one() {
        // 2^256 / (max target + 1) == 1: the easiest target still costs a
        // hash.
        let target = Target::new([0xff; 32]);
        assert_eq!(target.work(), Work(U256::one()));
    }

    #[test]
    fn halving_the_target_doubles_the_work() {
        let mut easy = [0u8; 32];
        easy[0] = 0x40;
        let mut hard = [0u8; 32];
        hard[0] = 0x20;
        let easy_work = Target::new(easy).work();
        let hard_work = Target::new(hard).work();
        assert!(hard_work > easy_work);
        let doubled = easy_work.checked_add(easy_work).unwrap();
        // Off by at most one hash from exact doubling.
        assert!(doubled == hard_work || Work(doubled.0 - 1) == hard_work || Work(doubled.0 + 1) == hard_work);
    }

    #[test]
    fn target_ratio_is_exact() {
        let mut bytes = [0u8; 32];
        bytes[16] = 100;
        let target = Target::new(bytes);
        let up = target.mul_ratio(1001, 1000);
        let down = target.mul_ratio(999, 1000);
        assert!(up.to_int() > target.to_int());
        assert!(down.to_int() < target.to_int());
    }

    #[test]
    fn target_comparison_uses_big_endian_order() {
        let mut id_bytes = [0u8; 32];
        id_bytes[0] = 1;
        let id = BlockID::new(Hash::new(id_bytes));
        let mut low = [0u8; 32];
        low[1] = 0xff;
        assert!(!Target::new(low).is_met_by(&id));
        let mut high = [0u8; 32];
        high[0] = 2;
        assert!(Target::new(high).is_met_by(&id));
    }
}
