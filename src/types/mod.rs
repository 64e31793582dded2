/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The entity types of the consensus set.
//!
//! `basic` holds the inert newtypes (heights, timestamps, currency, targets,
//! identifiers); `block` and `transaction` the two composite entities the
//! protocol exchanges; `diff` the reversible deltas that tie blocks to the
//! state store.

pub mod basic;
pub mod block;
pub mod diff;
pub mod transaction;
