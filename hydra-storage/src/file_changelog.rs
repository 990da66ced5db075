// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! File-backed changelog segments. One segment is a flat file of
//! length-prefixed frames plus an empty sidecar marking it sealed. The
//! layout is private to this module; everything above sees the
//! `Changelog` trait only.

use crate::{
    changelog::{Changelog, ChangelogStore},
    error::{StorageError, StorageResult},
};
use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    fs,
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task;
use tracing::debug;

fn log_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:09}.log", id))
}

fn seal_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("{:09}.sealed", id))
}

struct FrameIndex {
    /// Byte offset of each frame's length prefix.
    offsets: Vec<u64>,
    /// Total payload bytes, excluding prefixes.
    data_size: u64,
    /// End of the last complete frame; a torn tail past it is discarded.
    end_offset: u64,
}

fn scan_frames(path: &Path) -> StorageResult<FrameIndex> {
    let mut file = fs::File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut index = FrameIndex {
        offsets: Vec::new(),
        data_size: 0,
        end_offset: 0,
    };
    let mut offset = 0u64;
    while offset + 4 <= file_len {
        file.seek(SeekFrom::Start(offset))?;
        let len = file.read_u32::<LittleEndian>()? as u64;
        if offset + 4 + len > file_len {
            break;
        }
        index.offsets.push(offset);
        index.data_size += len;
        offset += 4 + len;
        index.end_offset = offset;
    }
    Ok(index)
}

struct FileChangelogState {
    index: FrameIndex,
    sealed: bool,
}

pub struct FileChangelog {
    id: u32,
    path: PathBuf,
    seal_marker: PathBuf,
    state: Arc<Mutex<FileChangelogState>>,
}

impl FileChangelog {
    fn open_existing(dir: &Path, id: u32) -> StorageResult<Self> {
        let path = log_path(dir, id);
        let seal_marker = seal_path(dir, id);
        let index = scan_frames(&path)?;
        let sealed = seal_marker.exists();
        Ok(Self {
            id,
            path,
            seal_marker,
            state: Arc::new(Mutex::new(FileChangelogState { index, sealed })),
        })
    }

    fn create_new(dir: &Path, id: u32) -> StorageResult<Self> {
        let path = log_path(dir, id);
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(Self {
            id,
            path,
            seal_marker: seal_path(dir, id),
            state: Arc::new(Mutex::new(FileChangelogState {
                index: FrameIndex {
                    offsets: Vec::new(),
                    data_size: 0,
                    end_offset: 0,
                },
                sealed: false,
            })),
        })
    }
}

#[async_trait]
impl Changelog for FileChangelog {
    fn id(&self) -> u32 {
        self.id
    }

    fn record_count(&self) -> u32 {
        self.state.lock().index.offsets.len() as u32
    }

    fn data_size(&self) -> u64 {
        self.state.lock().index.data_size
    }

    fn is_sealed(&self) -> bool {
        self.state.lock().sealed
    }

    async fn append(&self, records: Vec<Bytes>) -> StorageResult<()> {
        let id = self.id;
        let path = self.path.clone();
        let state = self.state.clone();
        task::spawn_blocking(move || {
            let mut guard = state.lock();
            if guard.sealed {
                return Err(StorageError::ChangelogSealed(id));
            }
            let mut file = fs::OpenOptions::new().write(true).open(&path)?;
            let mut offset = guard.index.end_offset;
            file.seek(SeekFrom::Start(offset))?;
            let mut appended = Vec::with_capacity(records.len());
            let mut data_size = 0u64;
            for record in &records {
                file.write_u32::<LittleEndian>(record.len() as u32)?;
                file.write_all(record)?;
                appended.push(offset);
                offset += 4 + record.len() as u64;
                data_size += record.len() as u64;
            }
            file.sync_data()?;
            guard.index.offsets.extend(appended);
            guard.index.data_size += data_size;
            guard.index.end_offset = offset;
            Ok(())
        })
        .await
        .expect("changelog append task panicked")
    }

    async fn read(&self, start_record_id: u32, max_records: usize) -> StorageResult<Vec<Bytes>> {
        let path = self.path.clone();
        let (start_offset, lengths) = {
            let guard = self.state.lock();
            let offsets = &guard.index.offsets;
            let start = (start_record_id as usize).min(offsets.len());
            let end = start.saturating_add(max_records).min(offsets.len());
            if start == end {
                return Ok(Vec::new());
            }
            (offsets[start], end - start)
        };
        task::spawn_blocking(move || {
            let mut file = fs::File::open(&path)?;
            file.seek(SeekFrom::Start(start_offset))?;
            let mut records = Vec::with_capacity(lengths);
            for _ in 0..lengths {
                let len = file.read_u32::<LittleEndian>()? as usize;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                records.push(Bytes::from(buf));
            }
            Ok(records)
        })
        .await
        .expect("changelog read task panicked")
    }

    async fn seal(&self, record_count: u32) -> StorageResult<()> {
        let path = self.path.clone();
        let seal_marker = self.seal_marker.clone();
        let state = self.state.clone();
        let id = self.id;
        task::spawn_blocking(move || {
            let mut guard = state.lock();
            let keep = (record_count as usize).min(guard.index.offsets.len());
            let cut = if keep == guard.index.offsets.len() {
                guard.index.end_offset
            } else {
                guard.index.offsets[keep]
            };
            let file = fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(cut)?;
            file.sync_data()?;
            fs::File::create(&seal_marker)?;
            guard.index = scan_frames(&path)?;
            guard.sealed = true;
            debug!(changelog_id = id, record_count = keep, "changelog sealed");
            Ok(())
        })
        .await
        .expect("changelog seal task panicked")
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Changelog store over one directory; segment files are named by id.
pub struct FileChangelogStore {
    dir: PathBuf,
    open_changelogs: Mutex<BTreeMap<u32, Arc<FileChangelog>>>,
}

impl FileChangelogStore {
    pub fn new(dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            open_changelogs: Mutex::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl ChangelogStore for FileChangelogStore {
    async fn open(&self, id: u32) -> StorageResult<Arc<dyn Changelog>> {
        self.try_open(id)
            .await?
            .ok_or(StorageError::ChangelogNotFound(id))
    }

    async fn try_open(&self, id: u32) -> StorageResult<Option<Arc<dyn Changelog>>> {
        if let Some(changelog) = self.open_changelogs.lock().get(&id) {
            return Ok(Some(changelog.clone()));
        }
        if !log_path(&self.dir, id).exists() {
            return Ok(None);
        }
        let changelog = Arc::new(FileChangelog::open_existing(&self.dir, id)?);
        self.open_changelogs.lock().insert(id, changelog.clone());
        Ok(Some(changelog))
    }

    async fn create(&self, id: u32) -> StorageResult<Arc<dyn Changelog>> {
        let mut open_changelogs = self.open_changelogs.lock();
        if open_changelogs.contains_key(&id) || log_path(&self.dir, id).exists() {
            return Err(StorageError::ChangelogExists(id));
        }
        let changelog = Arc::new(FileChangelog::create_new(&self.dir, id)?);
        open_changelogs.insert(id, changelog.clone());
        Ok(changelog)
    }

    async fn list(&self) -> StorageResult<Vec<u32>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".log") {
                if let Ok(id) = stem.parse::<u32>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}
