// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle scenarios: mount/unmount roundtrip, the reshard action FSM,
//! orphaned mounts, the mount-revision guard, and replica transitions.

mod common;

use claims::{assert_err, assert_ok, assert_some};
use common::{pump, pump_all, setup, NOW, SEED};
use hydra_tablet_manager::{
    ActionKind, ActionSpec, ActionState, CellHealth, CellNotification, CellRequest, CellTargets,
    Chunk, ChunkId, OwnerKind, PivotKey, ReplicaMode, ReplicaState, TabletState,
};

fn targets_hint(cell: hydra_tablet_manager::CellId) -> CellTargets {
    CellTargets {
        target_cells: None,
        hint_cell: Some(cell),
    }
}

#[test]
fn mount_unmount_roundtrip() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];

    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    {
        let tablet = manager.catalog.tablet(tablet_id).unwrap();
        assert_eq!(tablet.state, TabletState::Mounting);
        assert_eq!(tablet.cell, Some(cells[0]));
        assert!(tablet.action.is_none());
    }
    assert_ok!(manager.catalog.audit());

    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(
        requests[..],
        [CellRequest::MountTablet { freeze: false, .. }]
    ));
    let first_revision = manager.catalog.tablet(tablet_id).unwrap().mount_revision;
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Mounted
    );

    assert_ok!(manager.unmount_table(owner, None, None, false, NOW, SEED));
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Unmounting
    );
    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(
        requests[..],
        [CellRequest::UnmountTablet { force: false, .. }]
    ));
    {
        let tablet = manager.catalog.tablet(tablet_id).unwrap();
        assert_eq!(tablet.state, TabletState::Unmounted);
        assert_eq!(tablet.cell, None);
    }
    assert_ok!(manager.catalog.audit());

    // A fresh mount gets a fresh revision.
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);
    let second_revision = manager.catalog.tablet(tablet_id).unwrap().mount_revision;
    assert!(second_revision > first_revision);
}

#[test]
fn frozen_mount_and_unfreeze() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];

    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), true, NOW, SEED));
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::FrozenMounting
    );
    pump(&mut manager, cells[0]);
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Frozen
    );

    assert_ok!(manager.unfreeze_table(owner, None, None, NOW, SEED));
    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(
        requests[..],
        [CellRequest::UnfreezeTablet { ref dynamic_store_ids, .. }] if dynamic_store_ids.len() == 1
    ));
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Mounted
    );
}

fn seed_chunks(manager: &mut hydra_tablet_manager::TabletManager, owner: hydra_tablet_manager::OwnerId) {
    // Six equal chunks spread over the key space, so pivot estimation for
    // three tablets cuts at "c" and "e".
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];
    let tablet = manager.catalog.tablet_mut(tablet_id).unwrap();
    tablet.chunks = (0..6u64)
        .map(|i| {
            Chunk::new(
                ChunkId(100 + i),
                PivotKey::from_bytes(&[b'a' + i as u8]),
                100,
            )
        })
        .collect();
}

#[test]
fn reshard_action_splits_into_three() {
    let (mut manager, _bundle, cells, owner) = setup(2, OwnerKind::SortedTable);
    seed_chunks(&mut manager, owner);

    // Split into the starting shape: two mounted tablets.
    assert_ok!(manager.reshard_table(
        owner,
        None,
        None,
        Some(vec![PivotKey::MIN, PivotKey::from_bytes(b"d")]),
        None,
        NOW,
        SEED,
    ));
    let tablets = manager.catalog.owner(owner).unwrap().tablets.clone();
    assert_eq!(tablets.len(), 2);
    assert_ok!(manager.mount_table(owner, None, None, CellTargets::default(), false, NOW, SEED));
    pump_all(&mut manager, &cells);
    for tablet_id in &tablets {
        assert_eq!(
            manager.catalog.tablet(*tablet_id).unwrap().state,
            TabletState::Mounted
        );
    }

    let action_id = assert_ok!(manager.create_tablet_action(
        ActionSpec {
            kind: ActionKind::Reshard,
            tablets: tablets.clone(),
            target_cells: Vec::new(),
            pivot_keys: None,
            tablet_count: Some(3),
            freeze_on_mount: false,
            expiration_timeout: 600_000,
        },
        NOW,
        SEED,
    ));

    // Preparing cascades into Freezing and posts the freeze requests.
    assert_eq!(
        manager.catalog.action(action_id).unwrap().state,
        ActionState::Freezing
    );
    pump_all(&mut manager, &cells);

    // Frozen confirmations drove the action through Frozen, Unmounting,
    // Unmounted, the reshard itself, and into Mounting; the pump also
    // delivered the mounts, so by now everything is settled.
    let action = manager.catalog.action(action_id).unwrap();
    assert_eq!(action.state, ActionState::Completed);

    let new_tablets = manager.catalog.owner(owner).unwrap().tablets.clone();
    assert_eq!(new_tablets.len(), 3);
    let pivots: Vec<PivotKey> = new_tablets
        .iter()
        .map(|id| manager.catalog.tablet(*id).unwrap().pivot_key.clone())
        .collect();
    assert_eq!(pivots[0], PivotKey::MIN);
    assert!(pivots[0] < pivots[1] && pivots[1] < pivots[2]);
    for tablet_id in &new_tablets {
        let tablet = manager.catalog.tablet(*tablet_id).unwrap();
        assert_eq!(tablet.state, TabletState::Mounted);
        assert!(tablet.action.is_none());
    }
    assert_ok!(manager.catalog.audit());

    // The old tablets are gone from the catalog entirely.
    for tablet_id in tablets {
        assert_err!(manager.catalog.tablet(tablet_id));
    }
}

#[test]
fn user_unmount_fails_running_action() {
    let (mut manager, _bundle, cells, owner) = setup(2, OwnerKind::SortedTable);
    seed_chunks(&mut manager, owner);
    assert_ok!(manager.mount_table(owner, None, None, CellTargets::default(), false, NOW, SEED));
    pump_all(&mut manager, &cells);

    let tablets = manager.catalog.owner(owner).unwrap().tablets.clone();
    let action_id = assert_ok!(manager.create_tablet_action(
        ActionSpec {
            kind: ActionKind::Reshard,
            tablets: tablets.clone(),
            target_cells: Vec::new(),
            pivot_keys: None,
            tablet_count: Some(2),
            freeze_on_mount: false,
            expiration_timeout: 600_000,
        },
        NOW,
        SEED,
    ));
    assert_eq!(
        manager.catalog.action(action_id).unwrap().state,
        ActionState::Freezing
    );

    // The operator barges in mid-action.
    assert_ok!(manager.unmount_table(owner, None, None, false, NOW, SEED));
    let action = manager.catalog.action(action_id).unwrap();
    assert_eq!(action.state, ActionState::Failed);
    assert_eq!(action.error.as_deref(), Some("user request interfered"));
    for tablet_id in &tablets {
        assert!(manager.catalog.tablet(*tablet_id).unwrap().action.is_none());
    }

    // The unmount itself still completes.
    pump_all(&mut manager, &cells);
    for tablet_id in &tablets {
        assert_eq!(
            manager.catalog.tablet(*tablet_id).unwrap().state,
            TabletState::Unmounted
        );
    }
    assert_ok!(manager.catalog.audit());
}

#[test]
fn mount_without_healthy_cells_parks_and_kicks() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];
    assert_ok!(manager.set_cell_health(cells[0], CellHealth::Failed, NOW, SEED));

    assert_ok!(manager.mount_table(owner, None, None, CellTargets::default(), false, NOW, SEED));
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Unmounted
    );
    assert!(manager.orphaned_tablets().contains(&tablet_id));

    // The cell comes back; the orphaned action is kicked into mounting.
    assert_ok!(manager.set_cell_health(cells[0], CellHealth::Good, NOW, SEED));
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Mounting
    );
    pump(&mut manager, cells[0]);
    assert_eq!(
        manager.catalog.tablet(tablet_id).unwrap().state,
        TabletState::Mounted
    );
    let action = manager
        .catalog
        .tablet_actions
        .values()
        .next()
        .expect("the parked action still exists");
    assert_eq!(action.state, ActionState::Completed);
    assert_ok!(manager.catalog.audit());
}

#[test]
fn stale_mount_revision_is_ignored() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];

    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);
    assert_ok!(manager.unmount_table(owner, None, None, false, NOW, SEED));
    pump(&mut manager, cells[0]);
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    let revision = manager.catalog.tablet(tablet_id).unwrap().mount_revision;

    // A confirmation from the previous incarnation arrives late.
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::TabletUnmounted {
            tablet_id,
            mount_revision: revision - 1,
        },
        NOW,
        SEED,
    ));
    let tablet = manager.catalog.tablet(tablet_id).unwrap();
    assert_eq!(tablet.state, TabletState::Mounting);
    assert!(tablet.flagged_discrepancy.is_none());
}

#[test]
fn unexpected_notification_is_flagged_not_applied() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);

    // A frozen confirmation nobody asked for.
    let revision = manager.catalog.tablet(tablet_id).unwrap().mount_revision;
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::TabletFrozen {
            tablet_id,
            mount_revision: revision,
        },
        NOW,
        SEED,
    ));
    let tablet = manager.catalog.tablet(tablet_id).unwrap();
    assert_eq!(tablet.state, TabletState::Mounted);
    assert_some!(tablet.flagged_discrepancy.as_ref());
}

#[test]
fn replica_enable_roundtrip() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);

    let replica_id = assert_ok!(manager.create_table_replica(
        owner,
        "remote",
        "//tmp/replica",
        ReplicaMode::Async,
    ));
    // The mounted tablet learns about the new replica.
    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(requests[..], [CellRequest::AddTableReplica { .. }]));

    assert_ok!(manager.alter_table_replica(replica_id, Some(true), Some(ReplicaMode::Sync), None, None));
    assert_eq!(
        manager.catalog.replica(replica_id).unwrap().state,
        ReplicaState::Enabling
    );
    pump(&mut manager, cells[0]);
    let replica = manager.catalog.replica(replica_id).unwrap();
    assert_eq!(replica.state, ReplicaState::Enabled);
    assert_eq!(replica.mode, ReplicaMode::Sync);
}

#[test]
fn terminal_actions_expire() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablets = manager.catalog.owner(owner).unwrap().tablets.clone();
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);

    let action_id = assert_ok!(manager.create_tablet_action(
        ActionSpec {
            kind: ActionKind::Move,
            tablets,
            target_cells: vec![cells[0]],
            pivot_keys: None,
            tablet_count: None,
            freeze_on_mount: false,
            expiration_timeout: 500,
        },
        NOW,
        SEED,
    ));
    pump_all(&mut manager, &cells);
    assert_eq!(
        manager.catalog.action(action_id).unwrap().state,
        ActionState::Completed
    );

    manager.sweep_expired_actions(NOW + 100);
    assert_ok!(manager.catalog.action(action_id));
    manager.sweep_expired_actions(NOW + 10_000);
    assert_err!(manager.catalog.action(action_id));
}

#[test]
fn lock_roundtrip_and_store_allocation() {
    use hydra_tablet_manager::{TransactionId, UpdateMode};

    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);
    let revision = manager.catalog.tablet(tablet_id).unwrap().mount_revision;

    let tx = TransactionId(77);
    assert_ok!(manager.lock_tablet(tablet_id, tx, NOW));
    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(requests[..], [CellRequest::LockTablet { .. }]));

    // The cell reports its authoritative lock set.
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::TabletLocked {
            tablet_id,
            mount_revision: revision,
            transaction_ids: vec![tx],
        },
        NOW,
        SEED,
    ));
    assert!(manager.catalog.tablet(tablet_id).unwrap().locks.contains(&tx));

    assert_ok!(manager.unlock_tablet(tablet_id, tx, NOW + 1, UpdateMode::Append, Vec::new()));
    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(requests[..], [CellRequest::UnlockTablet { .. }]));
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::TabletLocked {
            tablet_id,
            mount_revision: revision,
            transaction_ids: Vec::new(),
        },
        NOW,
        SEED,
    ));
    assert!(manager.catalog.tablet(tablet_id).unwrap().locks.is_empty());

    // On-the-fly dynamic store allocation is a request/response pair.
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::AllocateDynamicStore {
            tablet_id,
            mount_revision: revision,
        },
        NOW,
        SEED,
    ));
    let requests = pump(&mut manager, cells[0]);
    assert!(matches!(
        requests[..],
        [CellRequest::GrantDynamicStore { .. }]
    ));

    // Ordered-table trim reports only ever move forward.
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::UpdateTabletTrimmedRowCount {
            tablet_id,
            mount_revision: revision,
            trimmed_row_count: 40,
        },
        NOW,
        SEED,
    ));
    assert_ok!(manager.on_cell_notification(
        cells[0],
        CellNotification::UpdateTabletTrimmedRowCount {
            tablet_id,
            mount_revision: revision,
            trimmed_row_count: 25,
        },
        NOW,
        SEED,
    ));
    assert_eq!(manager.catalog.tablet(tablet_id).unwrap().trimmed_row_count, 40);
}

#[test]
fn destroying_an_owner_unmounts_and_removes_tablets() {
    let (mut manager, _bundle, cells, owner) = setup(1, OwnerKind::SortedTable);
    let tablet_id = manager.catalog.owner(owner).unwrap().tablets[0];
    assert_ok!(manager.mount_table(owner, None, None, targets_hint(cells[0]), false, NOW, SEED));
    pump(&mut manager, cells[0]);

    assert_ok!(manager.destroy_owner(owner, NOW, SEED));
    let messages = manager.mailboxes.take_pending(cells[0]);
    assert!(messages
        .iter()
        .any(|m| matches!(m.request, CellRequest::UnmountTablet { force: true, .. })));
    assert_err!(manager.catalog.owner(owner));
    assert_err!(manager.catalog.tablet(tablet_id));
    assert!(manager.catalog.cells[&cells[0]].hosted_tablets.is_empty());
    assert_ok!(manager.catalog.audit());
}

#[test]
fn ordered_table_reshard_changes_shard_count_only() {
    let (mut manager, _bundle, _cells, owner) = setup(1, OwnerKind::OrderedTable);
    let new_tablets = assert_ok!(manager.reshard_table(owner, None, None, None, Some(3), NOW, SEED));
    assert_eq!(new_tablets.len(), 3);
    for tablet_id in new_tablets {
        let tablet = manager.catalog.tablet(tablet_id).unwrap();
        assert!(tablet.pivot_key.is_min());
    }
    assert_ok!(manager.catalog.audit());
}
