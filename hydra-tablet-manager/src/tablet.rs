// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    chunk::Chunk,
    ids::{ActionId, CellId, OwnerId, ReplicaId, TabletId, TransactionId},
    types::{PivotKey, TabletState},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Replica bookkeeping attached to one tablet of a replicated table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletReplicaInfo {
    pub committed_replication_row_index: u64,
    /// Set while an enable/disable is in flight for this tablet.
    pub transitioning: bool,
}

/// One shard of a tablet owner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tablet {
    pub id: TabletId,
    pub owner: OwnerId,
    /// Position within the owner's ordered tablet list.
    pub index: usize,
    /// Sorted tables only; `PivotKey::MIN` on the first tablet.
    pub pivot_key: PivotKey,
    /// Ordered tables only.
    pub trimmed_row_count: u64,
    pub state: TabletState,
    /// Where the controller is driving this tablet.
    pub expected_state: TabletState,
    pub cell: Option<CellId>,
    /// Revision stamped at mount time; every message to and from the cell
    /// carries it, stale messages bounce.
    pub mount_revision: u64,
    pub action: Option<ActionId>,
    pub retained_timestamp: u64,
    pub chunks: Vec<Chunk>,
    pub replicas: BTreeMap<ReplicaId, TabletReplicaInfo>,
    /// Transactions currently holding a bulk-insert lock on this tablet.
    pub locks: BTreeSet<TransactionId>,
    /// Set when a notification arrived that the catalog state cannot
    /// justify; never silently corrected.
    pub flagged_discrepancy: Option<String>,
    /// Revision of the last forced unmount, used to tell harmless
    /// redeliveries from genuinely unexpected notifications.
    pub force_unmount_revision: Option<u64>,
}

impl Tablet {
    pub fn new(id: TabletId, owner: OwnerId, index: usize, pivot_key: PivotKey) -> Self {
        Self {
            id,
            owner,
            index,
            pivot_key,
            trimmed_row_count: 0,
            state: TabletState::Unmounted,
            expected_state: TabletState::Unmounted,
            cell: None,
            mount_revision: 0,
            action: None,
            retained_timestamp: 0,
            chunks: Vec::new(),
            replicas: BTreeMap::new(),
            locks: BTreeSet::new(),
            flagged_discrepancy: None,
            force_unmount_revision: None,
        }
    }

    pub fn data_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.uncompressed_data_size).sum()
    }
}
