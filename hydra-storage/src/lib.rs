// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

pub mod changelog;
pub mod error;
pub mod file_changelog;
pub mod file_snapshot;
pub mod memory;
pub mod snapshot;

pub use changelog::{Changelog, ChangelogStore};
pub use error::{StorageError, StorageResult};
pub use file_changelog::FileChangelogStore;
pub use file_snapshot::FileSnapshotStore;
pub use memory::{MemoryChangelogStore, MemorySnapshotStore};
pub use snapshot::{SnapshotMeta, SnapshotParams, SnapshotReader, SnapshotStore, SnapshotWriter};
