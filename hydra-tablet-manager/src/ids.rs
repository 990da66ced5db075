// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Stable entity ids. Entities live in typed catalog maps and reference
//! each other by id only, which keeps the cross-reference graph acyclic
//! at the ownership level. Ids are drawn from a per-catalog generator so
//! replayed mutations allocate identically.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(
            Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

entity_id!(
    /// A tablet owner: a dynamic table or a hunk storage.
    OwnerId,
    "owner"
);
entity_id!(TabletId, "tablet");
entity_id!(CellId, "cell");
entity_id!(BundleId, "bundle");
entity_id!(ReplicaId, "replica");
entity_id!(ActionId, "action");
entity_id!(ChunkId, "chunk");
entity_id!(TransactionId, "tx");
entity_id!(DynamicStoreId, "store");

/// Monotone id source; part of the persisted catalog state so replays and
/// snapshots agree on every allocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    pub fn next_raw(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_is_dense_from_one() {
        let mut generator = IdGenerator::default();
        assert_eq!(generator.next_raw(), 1);
        assert_eq!(generator.next_raw(), 2);
        assert_eq!(format!("{}", TabletId(7)), "tablet-7");
    }
}
