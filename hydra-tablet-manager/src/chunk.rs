// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{ids::ChunkId, types::PivotKey};
use serde::{Deserialize, Serialize};

/// One store chunk as the tablet manager sees it: enough metadata to
/// compute reshard pivots and to carry hunk references along. Chunk
/// contents live with the storage layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    /// First key covered by this chunk (sorted tables).
    pub min_key: PivotKey,
    pub uncompressed_data_size: u64,
    /// Eden chunks hold freshly flushed rows with unsettled key spans;
    /// they are excluded from pivot estimation.
    pub eden: bool,
    /// Hunk chunks referenced from this chunk's metadata.
    pub hunk_refs: Vec<ChunkId>,
}

impl Chunk {
    pub fn new(id: ChunkId, min_key: PivotKey, uncompressed_data_size: u64) -> Self {
        Self {
            id,
            min_key,
            uncompressed_data_size,
            eden: false,
            hunk_refs: Vec::new(),
        }
    }

    pub fn with_eden(mut self) -> Self {
        self.eden = true;
        self
    }

    pub fn with_hunk_refs(mut self, refs: Vec<ChunkId>) -> Self {
        self.hunk_refs = refs;
        self
    }
}
