// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

/// Count of committed mutations; the first committed mutation carries 1,
/// so 0 reads as "nothing applied yet".
pub type SequenceNumber = u64;

/// Position within the changelog sequence: segment, then record within it.
/// The derived ordering is lexicographic, which is exactly the total order
/// the changelog induces.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version {
    pub segment_id: u32,
    pub record_id: u32,
}

impl Version {
    pub fn new(segment_id: u32, record_id: u32) -> Self {
        Self {
            segment_id,
            record_id,
        }
    }

    /// The version of the next record within the same segment.
    pub fn advance(self) -> Self {
        Self {
            segment_id: self.segment_id,
            record_id: self.record_id + 1,
        }
    }

    /// The first version of the next segment.
    pub fn rotate(self) -> Self {
        Self {
            segment_id: self.segment_id + 1,
            record_id: 0,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.record_id)
    }
}

/// The largest prefix known durable on some peer: the segment holding the
/// last logged record and the sequence number of that record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachableState {
    pub segment_id: u32,
    pub sequence_number: SequenceNumber,
}

impl ReachableState {
    pub fn new(segment_id: u32, sequence_number: SequenceNumber) -> Self {
        Self {
            segment_id,
            sequence_number,
        }
    }
}

impl fmt::Display for ReachableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sequence_number, self.segment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_order_is_lexicographic() {
        assert!(Version::new(1, 10) < Version::new(2, 0));
        assert!(Version::new(2, 0) < Version::new(2, 1));
        assert_eq!(Version::new(3, 4), Version::new(3, 4));
    }

    #[test]
    fn advance_and_rotate() {
        let v = Version::new(7, 41);
        assert_eq!(v.advance(), Version::new(7, 42));
        assert_eq!(v.rotate(), Version::new(8, 0));
    }
}
