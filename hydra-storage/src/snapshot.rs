// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use hydra_types::Checksum;
use serde::{Deserialize, Serialize};

/// Metadata embedded at the head of every snapshot. `snapshot_id` equals
/// the id of the changelog segment that begins immediately after the
/// snapshot; `last_segment_id` is the segment the last captured mutation
/// was logged in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub snapshot_id: u32,
    pub last_segment_id: u32,
    pub sequence_number: u64,
    pub random_seed: u64,
    pub state_hash: u64,
    pub last_mutation_term: u32,
    pub timestamp: u64,
}

/// What a completed snapshot looks like from the outside.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotParams {
    pub meta: SnapshotMeta,
    pub checksum: Checksum,
    /// Payload length in bytes, excluding the metadata header.
    pub length: u64,
}

/// Sequential reader over a snapshot's payload.
#[async_trait]
pub trait SnapshotReader: Send {
    fn meta(&self) -> &SnapshotMeta;

    fn checksum(&self) -> Checksum;

    fn length(&self) -> u64;

    /// Next chunk of at most `max_bytes`; empty at EOF.
    async fn read(&mut self, max_bytes: usize) -> StorageResult<Bytes>;
}

/// Sequential writer; the snapshot becomes visible only on `finish`, which
/// seals the checksum. An unfinished writer leaves no trace.
#[async_trait]
pub trait SnapshotWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> StorageResult<()>;

    async fn finish(self: Box<Self>) -> StorageResult<SnapshotParams>;
}

/// Storage of immutable snapshots keyed by snapshot id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Existing snapshot ids in ascending order.
    async fn list(&self) -> StorageResult<Vec<u32>>;

    /// The largest snapshot id not exceeding `bound`.
    async fn latest_at_most(&self, bound: u32) -> StorageResult<Option<u32>> {
        Ok(self.list().await?.into_iter().filter(|id| *id <= bound).next_back())
    }

    async fn params(&self, id: u32) -> StorageResult<SnapshotParams>;

    async fn open_reader(&self, id: u32) -> StorageResult<Box<dyn SnapshotReader>>;

    async fn create_writer(
        &self,
        meta: SnapshotMeta,
    ) -> StorageResult<Box<dyn SnapshotWriter>>;

    /// Random-access read of payload bytes; serves the snapshot-download
    /// wire call.
    async fn read_at(&self, id: u32, offset: u64, length: usize) -> StorageResult<Bytes>;
}
