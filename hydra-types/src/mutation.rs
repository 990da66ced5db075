// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::version::{SequenceNumber, Version};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Schema tag of the automaton payload; bumped when the automaton's wire
/// format changes so snapshots and changelogs from older reigns can be
/// rejected or upgraded.
pub type Reign = u16;

/// Client-supplied idempotency key. Two drafts carrying the same id commit
/// at most once; the second resolves with the kept response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub u128);

impl MutationId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Everything the engine knows about a mutation besides its payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationHeader {
    pub reign: Reign,
    pub mutation_type: String,
    /// Wall clock at the leader, advisory only; replayed verbatim.
    pub timestamp: u64,
    pub random_seed: u64,
    pub prev_random_seed: u64,
    pub segment_id: u32,
    pub record_id: u32,
    pub sequence_number: SequenceNumber,
    pub term: u32,
    pub mutation_id: Option<MutationId>,
}

impl MutationHeader {
    pub fn version(&self) -> Version {
        Version::new(self.segment_id, self.record_id)
    }
}

/// A self-describing changelog record: header plus opaque payload. The bcs
/// encoding of this struct is the byte string appended to changelogs and
/// shipped to followers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub header: MutationHeader,
    pub payload: Bytes,
}

impl MutationRecord {
    pub fn encode(&self) -> Result<Bytes, bcs::Error> {
        bcs::to_bytes(self).map(Bytes::from)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, bcs::Error> {
        bcs::from_bytes(frame)
    }

    pub fn version(&self) -> Version {
        self.header.version()
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.header.sequence_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_ok;

    fn header() -> MutationHeader {
        MutationHeader {
            reign: 1,
            mutation_type: "noop".to_owned(),
            timestamp: 123,
            random_seed: 0xdead_beef,
            prev_random_seed: 0xfeed_face,
            segment_id: 2,
            record_id: 5,
            sequence_number: 17,
            term: 3,
            mutation_id: Some(MutationId(42)),
        }
    }

    #[test]
    fn record_frame_roundtrip() {
        let record = MutationRecord {
            header: header(),
            payload: Bytes::from_static(b"payload bytes"),
        };
        let frame = assert_ok!(record.encode());
        let decoded = assert_ok!(MutationRecord::decode(&frame));
        assert_eq!(decoded, record);
    }

    #[test]
    fn header_version() {
        assert_eq!(header().version(), Version::new(2, 5));
    }
}
