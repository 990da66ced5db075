// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("changelog {0} not found")]
    ChangelogNotFound(u32),

    #[error("changelog {0} already exists")]
    ChangelogExists(u32),

    #[error("changelog {0} is sealed")]
    ChangelogSealed(u32),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(u32),

    #[error("snapshot {0} already exists")]
    SnapshotExists(u32),

    #[error("snapshot {id} is corrupt: {reason}")]
    SnapshotCorrupt { id: u32, reason: String },

    #[error("codec error: {0}")]
    Codec(#[from] bcs::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
