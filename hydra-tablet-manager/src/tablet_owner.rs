// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ids::{BundleId, ChunkId, OwnerId, ReplicaId, TabletId},
    types::{MountSettings, OwnerKind},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A dynamic table or hunk storage: the entity whose shards the tablets
/// are. Holds the ordered tablet list; a tablet's `index` always equals
/// its position here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletOwner {
    pub id: OwnerId,
    pub path: String,
    pub kind: OwnerKind,
    pub bundle: BundleId,
    pub tablets: Vec<TabletId>,
    pub replicas: BTreeSet<ReplicaId>,
    pub mount_settings: MountSettings,
    /// Hunk chunks referenced from any store chunk of any tablet; kept at
    /// the root so resharded tablets retain access.
    pub hunk_root: BTreeSet<ChunkId>,
}

impl TabletOwner {
    pub fn new(id: OwnerId, path: impl Into<String>, kind: OwnerKind, bundle: BundleId) -> Self {
        Self {
            id,
            path: path.into(),
            kind,
            bundle,
            tablets: Vec::new(),
            replicas: BTreeSet::new(),
            mount_settings: MountSettings::default(),
            hunk_root: BTreeSet::new(),
        }
    }

    pub fn is_sorted(&self) -> bool {
        self.kind == OwnerKind::SortedTable
    }
}
