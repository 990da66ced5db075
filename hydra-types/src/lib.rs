// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

pub mod checksum;
pub mod mutation;
pub mod state_hash;
pub mod version;

pub use checksum::{checksum_of, Checksum, ChecksumStream};
pub use mutation::{MutationHeader, MutationId, MutationRecord, Reign};
pub use state_hash::{fold_state_hash, payload_commit_hash, StateHash};
pub use version::{ReachableState, SequenceNumber, Version};

/// Index of a peer within its cell; dense in `[0, peer_count)`.
pub type PeerId = u32;

/// Leader term; monotonically increasing across epochs of one cell.
pub type Term = u32;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of one epoch (one leader's reign over a cell).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpochId(pub u128);

impl EpochId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}
