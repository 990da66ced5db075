// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! In-memory stores. Same contracts as the file-backed ones minus
//! durability; the consensus tests run whole cells on top of these.

use crate::{
    changelog::{Changelog, ChangelogStore},
    error::{StorageError, StorageResult},
    snapshot::{SnapshotMeta, SnapshotParams, SnapshotReader, SnapshotStore, SnapshotWriter},
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hydra_types::{Checksum, ChecksumStream};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::Arc,
};

#[derive(Default)]
struct MemoryChangelogState {
    records: Vec<Bytes>,
    data_size: u64,
    sealed: bool,
}

pub struct MemoryChangelog {
    id: u32,
    state: Mutex<MemoryChangelogState>,
}

impl MemoryChangelog {
    fn new(id: u32) -> Self {
        Self {
            id,
            state: Mutex::new(MemoryChangelogState::default()),
        }
    }
}

#[async_trait]
impl Changelog for MemoryChangelog {
    fn id(&self) -> u32 {
        self.id
    }

    fn record_count(&self) -> u32 {
        self.state.lock().records.len() as u32
    }

    fn data_size(&self) -> u64 {
        self.state.lock().data_size
    }

    fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    async fn append(&self, records: Vec<Bytes>) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.sealed {
            return Err(StorageError::ChangelogSealed(self.id));
        }
        for record in records {
            state.data_size += record.len() as u64;
            state.records.push(record);
        }
        Ok(())
    }

    async fn read(&self, start_record_id: u32, max_records: usize) -> StorageResult<Vec<Bytes>> {
        let state = self.state.lock();
        let start = (start_record_id as usize).min(state.records.len());
        let end = start.saturating_add(max_records).min(state.records.len());
        Ok(state.records[start..end].to_vec())
    }

    async fn seal(&self, record_count: u32) -> StorageResult<()> {
        let mut state = self.state.lock();
        let keep = (record_count as usize).min(state.records.len());
        state.data_size = state.records[..keep]
            .iter()
            .map(|r| r.len() as u64)
            .sum();
        state.records.truncate(keep);
        state.sealed = true;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryChangelogStore {
    changelogs: Mutex<BTreeMap<u32, Arc<MemoryChangelog>>>,
}

impl MemoryChangelogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChangelogStore for MemoryChangelogStore {
    async fn open(&self, id: u32) -> StorageResult<Arc<dyn Changelog>> {
        self.changelogs
            .lock()
            .get(&id)
            .cloned()
            .map(|c| c as Arc<dyn Changelog>)
            .ok_or(StorageError::ChangelogNotFound(id))
    }

    async fn try_open(&self, id: u32) -> StorageResult<Option<Arc<dyn Changelog>>> {
        Ok(self
            .changelogs
            .lock()
            .get(&id)
            .cloned()
            .map(|c| c as Arc<dyn Changelog>))
    }

    async fn create(&self, id: u32) -> StorageResult<Arc<dyn Changelog>> {
        let mut changelogs = self.changelogs.lock();
        if changelogs.contains_key(&id) {
            return Err(StorageError::ChangelogExists(id));
        }
        let changelog = Arc::new(MemoryChangelog::new(id));
        changelogs.insert(id, changelog.clone());
        Ok(changelog)
    }

    async fn list(&self) -> StorageResult<Vec<u32>> {
        Ok(self.changelogs.lock().keys().copied().collect())
    }
}

struct StoredSnapshot {
    meta: SnapshotMeta,
    payload: Bytes,
    checksum: Checksum,
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<BTreeMap<u32, Arc<StoredSnapshot>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemorySnapshotReader {
    snapshot: Arc<StoredSnapshot>,
    offset: usize,
}

#[async_trait]
impl SnapshotReader for MemorySnapshotReader {
    fn meta(&self) -> &SnapshotMeta {
        &self.snapshot.meta
    }

    fn checksum(&self) -> Checksum {
        self.snapshot.checksum
    }

    fn length(&self) -> u64 {
        self.snapshot.payload.len() as u64
    }

    async fn read(&mut self, max_bytes: usize) -> StorageResult<Bytes> {
        let payload = &self.snapshot.payload;
        let start = self.offset.min(payload.len());
        let end = start.saturating_add(max_bytes).min(payload.len());
        self.offset = end;
        Ok(payload.slice(start..end))
    }
}

struct MemorySnapshotWriter {
    meta: SnapshotMeta,
    buffer: BytesMut,
    checksum: ChecksumStream,
    snapshots: Arc<Mutex<BTreeMap<u32, Arc<StoredSnapshot>>>>,
}

#[async_trait]
impl SnapshotWriter for MemorySnapshotWriter {
    async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.buffer.extend_from_slice(chunk);
        self.checksum.update(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<SnapshotParams> {
        let writer = *self;
        let checksum = writer.checksum.finish();
        let payload = writer.buffer.freeze();
        let params = SnapshotParams {
            meta: writer.meta.clone(),
            checksum,
            length: payload.len() as u64,
        };
        writer.snapshots.lock().insert(
            writer.meta.snapshot_id,
            Arc::new(StoredSnapshot {
                meta: writer.meta,
                payload,
                checksum,
            }),
        );
        Ok(params)
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn list(&self) -> StorageResult<Vec<u32>> {
        Ok(self.snapshots.lock().keys().copied().collect())
    }

    async fn params(&self, id: u32) -> StorageResult<SnapshotParams> {
        let snapshots = self.snapshots.lock();
        let snapshot = snapshots
            .get(&id)
            .ok_or(StorageError::SnapshotNotFound(id))?;
        Ok(SnapshotParams {
            meta: snapshot.meta.clone(),
            checksum: snapshot.checksum,
            length: snapshot.payload.len() as u64,
        })
    }

    async fn open_reader(&self, id: u32) -> StorageResult<Box<dyn SnapshotReader>> {
        let snapshot = self
            .snapshots
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StorageError::SnapshotNotFound(id))?;
        Ok(Box::new(MemorySnapshotReader {
            snapshot,
            offset: 0,
        }))
    }

    async fn create_writer(&self, meta: SnapshotMeta) -> StorageResult<Box<dyn SnapshotWriter>> {
        if self.snapshots.lock().contains_key(&meta.snapshot_id) {
            return Err(StorageError::SnapshotExists(meta.snapshot_id));
        }
        Ok(Box::new(MemorySnapshotWriter {
            meta,
            buffer: BytesMut::new(),
            checksum: ChecksumStream::new(),
            snapshots: self.snapshots.clone(),
        }))
    }

    async fn read_at(&self, id: u32, offset: u64, length: usize) -> StorageResult<Bytes> {
        let snapshot = self
            .snapshots
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StorageError::SnapshotNotFound(id))?;
        let payload = &snapshot.payload;
        let start = (offset as usize).min(payload.len());
        let end = start.saturating_add(length).min(payload.len());
        Ok(payload.slice(start..end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok, assert_some};
    use hydra_types::checksum_of;

    fn meta(id: u32) -> SnapshotMeta {
        SnapshotMeta {
            snapshot_id: id,
            last_segment_id: id.saturating_sub(1),
            sequence_number: 10,
            random_seed: 1,
            state_hash: 2,
            last_mutation_term: 1,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn changelog_append_read_seal() {
        let store = MemoryChangelogStore::new();
        let changelog = assert_ok!(store.create(1).await);
        assert_err!(store.create(1).await);

        assert_ok!(
            changelog
                .append(vec![Bytes::from_static(b"a"), Bytes::from_static(b"bb")])
                .await
        );
        assert_eq!(changelog.record_count(), 2);
        assert_eq!(changelog.data_size(), 3);

        let records = assert_ok!(changelog.read(1, 10).await);
        assert_eq!(records, vec![Bytes::from_static(b"bb")]);

        assert_ok!(changelog.seal(1).await);
        assert_eq!(changelog.record_count(), 1);
        assert!(changelog.is_sealed());
        assert_err!(changelog.append(vec![Bytes::from_static(b"c")]).await);
    }

    #[tokio::test]
    async fn snapshot_roundtrip_and_lookup() {
        let store = MemorySnapshotStore::new();
        let mut writer = assert_ok!(store.create_writer(meta(3)).await);
        assert_ok!(writer.write(b"snapshot ").await);
        assert_ok!(writer.write(b"payload").await);
        let params = assert_ok!(writer.finish().await);
        assert_eq!(params.length, 16);
        assert_eq!(params.checksum, checksum_of(b"snapshot payload"));

        let mut writer = assert_ok!(store.create_writer(meta(7)).await);
        assert_ok!(writer.write(b"x").await);
        assert_ok!(writer.finish().await);

        assert_eq!(assert_ok!(store.list().await), vec![3, 7]);
        assert_eq!(assert_some!(assert_ok!(store.latest_at_most(5).await)), 3);
        assert_eq!(assert_ok!(store.latest_at_most(2).await), None);

        let mut reader = assert_ok!(store.open_reader(3).await);
        assert_eq!(reader.meta().sequence_number, 10);
        let mut out = Vec::new();
        loop {
            let chunk = assert_ok!(reader.read(4).await);
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"snapshot payload");

        let slice = assert_ok!(store.read_at(3, 9, 100).await);
        assert_eq!(&slice[..], b"payload");
    }
}
