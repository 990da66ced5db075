// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! File-backed snapshot store. A snapshot file is a bcs metadata header,
//! the opaque payload, and an 8-byte checksum trailer over the payload.
//! Writers stage into a temp file and rename on finish, so a crashed
//! build never leaves a visible half-snapshot.

use crate::{
    error::{StorageError, StorageResult},
    snapshot::{SnapshotMeta, SnapshotParams, SnapshotReader, SnapshotStore, SnapshotWriter},
};
use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use hydra_types::{Checksum, ChecksumStream};
use std::{
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};
use tokio::task;
use tracing::info;

const TRAILER_LEN: u64 = 8;

fn snapshot_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:09}.snapshot", id))
}

fn staging_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:09}.snapshot.partial", id))
}

struct SnapshotLayout {
    meta: SnapshotMeta,
    payload_offset: u64,
    payload_len: u64,
    checksum: Checksum,
}

fn read_layout(path: &Path, id: u32) -> StorageResult<SnapshotLayout> {
    let mut file = fs::File::open(path)?;
    let file_len = file.metadata()?.len();
    let meta_len = file.read_u32::<LittleEndian>()? as u64;
    let payload_offset = 4 + meta_len;
    if file_len < payload_offset + TRAILER_LEN {
        return Err(StorageError::SnapshotCorrupt {
            id,
            reason: "file shorter than header and trailer".to_owned(),
        });
    }
    let mut meta_buf = vec![0u8; meta_len as usize];
    file.read_exact(&mut meta_buf)?;
    let meta: SnapshotMeta = bcs::from_bytes(&meta_buf)?;
    file.seek(SeekFrom::End(-(TRAILER_LEN as i64)))?;
    let checksum = file.read_u64::<LittleEndian>()?;
    Ok(SnapshotLayout {
        meta,
        payload_offset,
        payload_len: file_len - payload_offset - TRAILER_LEN,
        checksum,
    })
}

pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }
}

struct FileSnapshotReader {
    file: fs::File,
    layout: SnapshotLayout,
    position: u64,
}

#[async_trait]
impl SnapshotReader for FileSnapshotReader {
    fn meta(&self) -> &SnapshotMeta {
        &self.layout.meta
    }

    fn checksum(&self) -> Checksum {
        self.layout.checksum
    }

    fn length(&self) -> u64 {
        self.layout.payload_len
    }

    async fn read(&mut self, max_bytes: usize) -> StorageResult<Bytes> {
        let remaining = self.layout.payload_len - self.position;
        let take = (max_bytes as u64).min(remaining) as usize;
        if take == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; take];
        self.file
            .seek(SeekFrom::Start(self.layout.payload_offset + self.position))?;
        self.file.read_exact(&mut buf)?;
        self.position += take as u64;
        Ok(Bytes::from(buf))
    }
}

struct FileSnapshotWriter {
    meta: SnapshotMeta,
    staging: PathBuf,
    target: PathBuf,
    file: fs::File,
    checksum: ChecksumStream,
    payload_len: u64,
}

#[async_trait]
impl SnapshotWriter for FileSnapshotWriter {
    async fn write(&mut self, chunk: &[u8]) -> StorageResult<()> {
        self.file.write_all(chunk)?;
        self.checksum.update(chunk);
        self.payload_len += chunk.len() as u64;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> StorageResult<SnapshotParams> {
        let mut writer = *self;
        let checksum = writer.checksum.finish();
        writer.file.write_u64::<LittleEndian>(checksum)?;
        writer.file.sync_data()?;
        drop(writer.file);
        fs::rename(&writer.staging, &writer.target)?;
        info!(
            snapshot_id = writer.meta.snapshot_id,
            length = writer.payload_len,
            checksum = format_args!("{:016x}", checksum),
            "snapshot written"
        );
        Ok(SnapshotParams {
            meta: writer.meta,
            checksum,
            length: writer.payload_len,
        })
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn list(&self) -> StorageResult<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".snapshot") {
                if let Ok(id) = stem.parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn params(&self, id: u32) -> StorageResult<SnapshotParams> {
        let path = snapshot_path(&self.dir, id);
        if !path.exists() {
            return Err(StorageError::SnapshotNotFound(id));
        }
        task::spawn_blocking(move || {
            let layout = read_layout(&path, id)?;
            Ok(SnapshotParams {
                meta: layout.meta,
                checksum: layout.checksum,
                length: layout.payload_len,
            })
        })
        .await
        .expect("snapshot params task panicked")
    }

    async fn open_reader(&self, id: u32) -> StorageResult<Box<dyn SnapshotReader>> {
        let path = snapshot_path(&self.dir, id);
        if !path.exists() {
            return Err(StorageError::SnapshotNotFound(id));
        }
        let layout = read_layout(&path, id)?;
        let mut file = fs::File::open(&path)?;
        file.seek(SeekFrom::Start(layout.payload_offset))?;
        Ok(Box::new(FileSnapshotReader {
            file,
            layout,
            position: 0,
        }))
    }

    async fn create_writer(&self, meta: SnapshotMeta) -> StorageResult<Box<dyn SnapshotWriter>> {
        let target = snapshot_path(&self.dir, meta.snapshot_id);
        if target.exists() {
            return Err(StorageError::SnapshotExists(meta.snapshot_id));
        }
        let staging = staging_path(&self.dir, meta.snapshot_id);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&staging)?;
        let meta_buf = bcs::to_bytes(&meta)?;
        file.write_u32::<LittleEndian>(meta_buf.len() as u32)?;
        file.write_all(&meta_buf)?;
        Ok(Box::new(FileSnapshotWriter {
            meta,
            staging,
            target,
            file,
            checksum: ChecksumStream::new(),
            payload_len: 0,
        }))
    }

    async fn read_at(&self, id: u32, offset: u64, length: usize) -> StorageResult<Bytes> {
        let path = snapshot_path(&self.dir, id);
        if !path.exists() {
            return Err(StorageError::SnapshotNotFound(id));
        }
        task::spawn_blocking(move || {
            let layout = read_layout(&path, id)?;
            let start = offset.min(layout.payload_len);
            let take = (length as u64).min(layout.payload_len - start) as usize;
            let mut file = fs::File::open(&path)?;
            file.seek(SeekFrom::Start(layout.payload_offset + start))?;
            let mut buf = vec![0u8; take];
            file.read_exact(&mut buf)?;
            Ok(Bytes::from(buf))
        })
        .await
        .expect("snapshot read task panicked")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};
    use hydra_types::checksum_of;
    use tempfile::TempDir;

    fn meta(id: u32) -> SnapshotMeta {
        SnapshotMeta {
            snapshot_id: id,
            last_segment_id: id.saturating_sub(1),
            sequence_number: 99,
            random_seed: 7,
            state_hash: 8,
            last_mutation_term: 2,
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let store = assert_ok!(FileSnapshotStore::new(dir.path()));

        let mut writer = assert_ok!(store.create_writer(meta(4)).await);
        assert_ok!(writer.write(b"hello ").await);
        assert_ok!(writer.write(b"snapshots").await);
        let params = assert_ok!(writer.finish().await);
        assert_eq!(params.checksum, checksum_of(b"hello snapshots"));

        let looked_up = assert_ok!(store.params(4).await);
        assert_eq!(looked_up, params);

        let mut reader = assert_ok!(store.open_reader(4).await);
        assert_eq!(reader.meta().sequence_number, 99);
        let mut out = Vec::new();
        loop {
            let chunk = assert_ok!(reader.read(5).await);
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello snapshots");

        let slice = assert_ok!(store.read_at(4, 6, 4).await);
        assert_eq!(&slice[..], b"snap");
    }

    #[tokio::test]
    async fn unfinished_writer_is_invisible() {
        let dir = TempDir::new().unwrap();
        let store = assert_ok!(FileSnapshotStore::new(dir.path()));
        let mut writer = assert_ok!(store.create_writer(meta(9)).await);
        assert_ok!(writer.write(b"half").await);
        drop(writer);
        assert_eq!(assert_ok!(store.list().await), Vec::<u32>::new());
        assert_err!(store.params(9).await);
    }
}
