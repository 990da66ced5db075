// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! A well-behaved fake cell: answers every request with the notification
//! a healthy cell leader would send.

use hydra_tablet_manager::{
    BundleId, CellId, CellNotification, CellRequest, OwnerId, OwnerKind, TabletManager,
};

pub const NOW: u64 = 1_000;
pub const SEED: u64 = 42;

pub fn cell_reply(request: &CellRequest) -> Option<CellNotification> {
    match request {
        CellRequest::MountTablet {
            tablet_id,
            mount_revision,
            freeze,
            ..
        } => Some(CellNotification::TabletMounted {
            tablet_id: *tablet_id,
            mount_revision: *mount_revision,
            frozen: *freeze,
        }),
        CellRequest::UnmountTablet {
            tablet_id,
            mount_revision,
            ..
        } => Some(CellNotification::TabletUnmounted {
            tablet_id: *tablet_id,
            mount_revision: *mount_revision,
        }),
        CellRequest::FreezeTablet {
            tablet_id,
            mount_revision,
        } => Some(CellNotification::TabletFrozen {
            tablet_id: *tablet_id,
            mount_revision: *mount_revision,
        }),
        CellRequest::UnfreezeTablet {
            tablet_id,
            mount_revision,
            ..
        } => Some(CellNotification::TabletUnfrozen {
            tablet_id: *tablet_id,
            mount_revision: *mount_revision,
        }),
        CellRequest::AlterTableReplica {
            tablet_id,
            mount_revision,
            replica_id,
            enabled: Some(enabled),
            ..
        } => Some(if *enabled {
            CellNotification::TableReplicaEnabled {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
                replica_id: *replica_id,
            }
        } else {
            CellNotification::TableReplicaDisabled {
                tablet_id: *tablet_id,
                mount_revision: *mount_revision,
                replica_id: *replica_id,
            }
        }),
        _ => None,
    }
}

/// Delivers one cell's pending messages and feeds the replies back in.
/// Returns the requests that were delivered.
pub fn pump(manager: &mut TabletManager, cell: CellId) -> Vec<CellRequest> {
    let messages = manager.mailboxes.take_pending(cell);
    let requests: Vec<CellRequest> = messages.into_iter().map(|m| m.request).collect();
    for request in &requests {
        if let Some(notification) = cell_reply(request) {
            manager
                .on_cell_notification(cell, notification, NOW, SEED)
                .expect("notification applies");
        }
    }
    requests
}

/// Pumps every cell until all mailboxes drain.
pub fn pump_all(manager: &mut TabletManager, cells: &[CellId]) {
    loop {
        let mut delivered = 0;
        for cell in cells {
            delivered += pump(manager, *cell).len();
        }
        if delivered == 0 {
            return;
        }
    }
}

pub fn setup(cell_count: usize, kind: OwnerKind) -> (TabletManager, BundleId, Vec<CellId>, OwnerId) {
    let mut manager = TabletManager::new();
    let bundle = manager.catalog.create_bundle("default");
    let cells: Vec<CellId> = (0..cell_count)
        .map(|_| manager.catalog.create_cell(bundle).expect("bundle exists"))
        .collect();
    let owner = manager
        .catalog
        .create_owner("//tmp/t", kind, bundle)
        .expect("bundle exists");
    (manager, bundle, cells, owner)
}
