/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Event-log formatting.
//!
//! The consensus set logs through the [log](https://docs.rs/log) facade; to
//! see the messages, install any logging implementation. Messages are CSVs
//! whose first two values are always the event name in PascalCase and the
//! time it was emitted (seconds since the Unix epoch). Block IDs are
//! abbreviated to the first seven characters of their Base64 encoding.
//!
//! ```text
//! AcceptBlock, 1701329264, Id5u7f6, 42
//! Reorganization, 1701329265, 2, 3
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};

pub(crate) const ACCEPT_BLOCK: &str = "AcceptBlock";
pub(crate) const REJECT_BLOCK: &str = "RejectBlock";
pub(crate) const ENROLL_ORPHAN: &str = "EnrollOrphan";
pub(crate) const REORGANIZATION: &str = "Reorganization";

pub(crate) fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn first_seven_base64_chars(bytes: &[u8; 32]) -> String {
    let mut encoded = STANDARD_NO_PAD.encode(bytes);
    encoded.truncate(7);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_ids_are_seven_characters() {
        assert_eq!(first_seven_base64_chars(&[0xab; 32]).len(), 7);
        assert_ne!(
            first_seven_base64_chars(&[0xab; 32]),
            first_seven_base64_chars(&[0xac; 32])
        );
    }
}
