/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Change notifications for consumers of the consensus set.
//!
//! After every committed tip change, each registered subscriber receives one
//! [`ConsensusChange`] describing the blocks that left the canonical chain
//! and the blocks that joined it. Delivery is synchronous in the thread that
//! committed the change and follows registration order; a slow subscriber
//! blocks the writer, and buffering is the subscriber's own responsibility.
//!
//! A new subscriber is first replayed the chain's history — from genesis, or
//! from a caller-supplied resume point — before it sees live updates, so its
//! view is gapless.

use std::fmt::{self, Display, Formatter};

use crate::store::database::StoreError;
use crate::types::block::Block;

/// One committed change to the canonical chain. `reverted_blocks` walk from
/// the old tip down towards the common ancestor; `applied_blocks` walk from
/// just above the ancestor up to the new tip. A simple extension has no
/// reverted blocks and one applied block.
#[derive(Clone, Debug, Default)]
pub struct ConsensusChange {
    pub reverted_blocks: Vec<Block>,
    pub applied_blocks: Vec<Block>,
}

/// Implemented by consumers that track the canonical chain.
pub trait ConsensusSetSubscriber {
    fn process_consensus_change(&mut self, change: &ConsensusChange);
}

/// Identifies a registration; pass back to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriberHandle(pub(crate) u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeError {
    /// The resume point is not a block on the current canonical chain.
    UnknownResumePoint,
    Storage(StoreError),
}

impl Display for SubscribeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SubscribeError::UnknownResumePoint => {
                write!(f, "resume point is not on the canonical chain")
            }
            SubscribeError::Storage(err) => Display::fmt(err, f),
        }
    }
}

impl std::error::Error for SubscribeError {}

impl From<StoreError> for SubscribeError {
    fn from(err: StoreError) -> Self {
        SubscribeError::Storage(err)
    }
}

/// The ordered set of live subscribers.
pub(crate) struct SubscriberRegistry {
    entries: Vec<(u64, Box<dyn ConsensusSetSubscriber + Send>)>,
    next_handle: u64,
}

impl SubscriberRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_handle: 0,
        }
    }

    pub(crate) fn register(
        &mut self,
        subscriber: Box<dyn ConsensusSetSubscriber + Send>,
    ) -> SubscriberHandle {
        let handle = SubscriberHandle(self.next_handle);
        self.next_handle += 1;
        self.entries.push((handle.0, subscriber));
        handle
    }

    /// Remove a registration. Unknown handles are a no-op.
    pub(crate) fn unregister(&mut self, handle: SubscriberHandle) {
        self.entries.retain(|(id, _)| *id != handle.0);
    }

    /// Deliver `change` to every subscriber, in registration order.
    pub(crate) fn notify(&mut self, change: &ConsensusChange) {
        for (_, subscriber) in self.entries.iter_mut() {
            subscriber.process_consensus_change(change);
        }
    }
}
