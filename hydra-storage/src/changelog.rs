// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// One append-only log segment. Records are opaque byte frames; the engine
/// stores encoded `MutationRecord`s in them but the segment does not care.
///
/// Appends on one segment are serialized by the implementation;
/// acknowledgement implies durability.
#[async_trait]
pub trait Changelog: Send + Sync {
    fn id(&self) -> u32;

    fn record_count(&self) -> u32;

    fn data_size(&self) -> u64;

    fn is_sealed(&self) -> bool;

    /// Appends a batch atomically, preserving order within the batch.
    async fn append(&self, records: Vec<Bytes>) -> StorageResult<()>;

    /// Reads a contiguous slice starting at `start_record_id`, at most
    /// `max_records` long; shorter at the segment tail.
    async fn read(&self, start_record_id: u32, max_records: usize) -> StorageResult<Vec<Bytes>>;

    /// Truncates everything at and beyond `record_count` records and marks
    /// the segment immutable. Recovery only.
    async fn seal(&self, record_count: u32) -> StorageResult<()>;

    async fn close(&self) -> StorageResult<()>;
}

impl std::fmt::Debug for dyn Changelog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Changelog")
            .field("id", &self.id())
            .field("record_count", &self.record_count())
            .field("data_size", &self.data_size())
            .field("is_sealed", &self.is_sealed())
            .finish()
    }
}

/// Directory of changelog segments keyed by segment id.
#[async_trait]
pub trait ChangelogStore: Send + Sync {
    /// Opens an existing segment; `ChangelogNotFound` if absent.
    async fn open(&self, id: u32) -> StorageResult<Arc<dyn Changelog>>;

    /// Opens an existing segment, `None` if absent.
    async fn try_open(&self, id: u32) -> StorageResult<Option<Arc<dyn Changelog>>>;

    /// Creates an empty segment; `ChangelogExists` if present.
    async fn create(&self, id: u32) -> StorageResult<Arc<dyn Changelog>>;

    /// Existing segment ids in ascending order.
    async fn list(&self) -> StorageResult<Vec<u32>>;
}
