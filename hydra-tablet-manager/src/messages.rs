// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The message surface between the master and cell leaders. Requests flow
//! master → cell, notifications cell → master; both sides are idempotent
//! under at-least-once delivery, keyed by `(tablet_id, mount_revision)`.

use crate::{
    ids::{ChunkId, DynamicStoreId, ReplicaId, TabletId, TransactionId},
    types::{Atomicity, MountSettings, PivotKey, ReplicaMode, UpdateMode},
};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellRequest {
    MountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        settings: MountSettings,
        pivot_key: PivotKey,
        next_pivot_key: Option<PivotKey>,
        stores: Vec<ChunkId>,
        replicas: Vec<ReplicaId>,
        freeze: bool,
        upstream_replica: Option<ReplicaId>,
        dynamic_store_ids: Vec<DynamicStoreId>,
    },
    UnmountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        force: bool,
    },
    FreezeTablet {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    UnfreezeTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        dynamic_store_ids: Vec<DynamicStoreId>,
    },
    RemountTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        settings: MountSettings,
    },
    LockTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        transaction_id: TransactionId,
        timestamp: u64,
    },
    UnlockTablet {
        tablet_id: TabletId,
        mount_revision: u64,
        transaction_id: TransactionId,
        commit_timestamp: u64,
        update_mode: UpdateMode,
        stores_to_add: Vec<ChunkId>,
    },
    AddTableReplica {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
    },
    RemoveTableReplica {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
    },
    AlterTableReplica {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
        enabled: Option<bool>,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
    },
    /// Answer to `AllocateDynamicStore`.
    GrantDynamicStore {
        tablet_id: TabletId,
        mount_revision: u64,
        store_id: DynamicStoreId,
    },
}

impl CellRequest {
    pub fn tablet_id(&self) -> TabletId {
        match self {
            Self::MountTablet { tablet_id, .. }
            | Self::UnmountTablet { tablet_id, .. }
            | Self::FreezeTablet { tablet_id, .. }
            | Self::UnfreezeTablet { tablet_id, .. }
            | Self::RemountTablet { tablet_id, .. }
            | Self::LockTablet { tablet_id, .. }
            | Self::UnlockTablet { tablet_id, .. }
            | Self::AddTableReplica { tablet_id, .. }
            | Self::RemoveTableReplica { tablet_id, .. }
            | Self::AlterTableReplica { tablet_id, .. }
            | Self::GrantDynamicStore { tablet_id, .. } => *tablet_id,
        }
    }

    pub fn mount_revision(&self) -> u64 {
        match self {
            Self::MountTablet { mount_revision, .. }
            | Self::UnmountTablet { mount_revision, .. }
            | Self::FreezeTablet { mount_revision, .. }
            | Self::UnfreezeTablet { mount_revision, .. }
            | Self::RemountTablet { mount_revision, .. }
            | Self::LockTablet { mount_revision, .. }
            | Self::UnlockTablet { mount_revision, .. }
            | Self::AddTableReplica { mount_revision, .. }
            | Self::RemoveTableReplica { mount_revision, .. }
            | Self::AlterTableReplica { mount_revision, .. }
            | Self::GrantDynamicStore { mount_revision, .. } => *mount_revision,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellNotification {
    TabletMounted {
        tablet_id: TabletId,
        mount_revision: u64,
        frozen: bool,
    },
    TabletUnmounted {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    TabletFrozen {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    TabletUnfrozen {
        tablet_id: TabletId,
        mount_revision: u64,
    },
    TableReplicaEnabled {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
    },
    TableReplicaDisabled {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
    },
    UpdateTableReplicaStatistics {
        tablet_id: TabletId,
        mount_revision: u64,
        replica_id: ReplicaId,
        committed_replication_row_index: u64,
    },
    TabletLocked {
        tablet_id: TabletId,
        mount_revision: u64,
        transaction_ids: Vec<TransactionId>,
    },
    /// Ordered tables report their trim point.
    UpdateTabletTrimmedRowCount {
        tablet_id: TabletId,
        mount_revision: u64,
        trimmed_row_count: u64,
    },
    /// Cell asks for a fresh dynamic store id.
    AllocateDynamicStore {
        tablet_id: TabletId,
        mount_revision: u64,
    },
}

impl CellNotification {
    pub fn tablet_id(&self) -> TabletId {
        match self {
            Self::TabletMounted { tablet_id, .. }
            | Self::TabletUnmounted { tablet_id, .. }
            | Self::TabletFrozen { tablet_id, .. }
            | Self::TabletUnfrozen { tablet_id, .. }
            | Self::TableReplicaEnabled { tablet_id, .. }
            | Self::TableReplicaDisabled { tablet_id, .. }
            | Self::UpdateTableReplicaStatistics { tablet_id, .. }
            | Self::TabletLocked { tablet_id, .. }
            | Self::UpdateTabletTrimmedRowCount { tablet_id, .. }
            | Self::AllocateDynamicStore { tablet_id, .. } => *tablet_id,
        }
    }

    pub fn mount_revision(&self) -> u64 {
        match self {
            Self::TabletMounted { mount_revision, .. }
            | Self::TabletUnmounted { mount_revision, .. }
            | Self::TabletFrozen { mount_revision, .. }
            | Self::TabletUnfrozen { mount_revision, .. }
            | Self::TableReplicaEnabled { mount_revision, .. }
            | Self::TableReplicaDisabled { mount_revision, .. }
            | Self::UpdateTableReplicaStatistics { mount_revision, .. }
            | Self::TabletLocked { mount_revision, .. }
            | Self::UpdateTabletTrimmedRowCount { mount_revision, .. }
            | Self::AllocateDynamicStore { mount_revision, .. } => *mount_revision,
        }
    }
}
