// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The tablet manager as a Hydra automaton. Every catalog change enters
//! as a replicated mutation; timestamps and randomness come exclusively
//! from the mutation context, so replicas and replays land on identical
//! state.

use crate::{
    actions::ActionSpec,
    catalog::{CatalogStreams, TabletCatalog},
    controller::{CellTargets, TabletManager},
    ids::{ActionId, BundleId, CellId, OwnerId, ReplicaId, TabletId},
    mailbox::MailboxRegistry,
    messages::CellNotification,
    tablet_cell::CellStatistics,
    types::{ActionKind, Atomicity, CellHealth, OwnerKind, PivotKey, ReplicaMode},
};
use bytes::Bytes;
use hydra_core::{Automaton, MutationContext};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The replicated operation set of the master cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterMutation {
    CreateBundle {
        name: String,
    },
    CreateCell {
        bundle: BundleId,
    },
    CreateOwner {
        path: String,
        kind: OwnerKind,
        bundle: BundleId,
    },
    MountTable {
        owner: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        target_cells: Option<Vec<CellId>>,
        hint_cell: Option<CellId>,
        freeze: bool,
    },
    UnmountTable {
        owner: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        force: bool,
    },
    FreezeTable {
        owner: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
    },
    UnfreezeTable {
        owner: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
    },
    RemountTable {
        owner: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
    },
    ReshardTable {
        owner: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        pivot_keys: Option<Vec<PivotKey>>,
        tablet_count: Option<usize>,
    },
    CreateTabletAction {
        kind: ActionKind,
        tablets: Vec<TabletId>,
        target_cells: Vec<CellId>,
        pivot_keys: Option<Vec<PivotKey>>,
        tablet_count: Option<usize>,
        freeze_on_mount: bool,
        expiration_timeout: u64,
    },
    CreateTableReplica {
        owner: OwnerId,
        cluster_name: String,
        replica_path: String,
        mode: ReplicaMode,
    },
    RemoveTableReplica {
        replica: ReplicaId,
    },
    AlterTableReplica {
        replica: ReplicaId,
        enabled: Option<bool>,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
    },
    DestroyOwner {
        owner: OwnerId,
    },
    SetCellHealth {
        cell: CellId,
        health: CellHealth,
    },
    ReportCellStatistics {
        cell: CellId,
        statistics: CellStatistics,
    },
    CellNotification {
        cell: CellId,
        notification: CellNotification,
    },
    SweepExpiredActions,
}

/// What a master mutation resolves with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum MasterResponse {
    Ok,
    Id(u64),
    Error(String),
}

#[derive(Serialize, Deserialize)]
struct SavedMaster {
    catalog: CatalogStreams,
    mailboxes: MailboxRegistry,
    mutation_revision: u64,
}

/// `hydra_core::Automaton` implementation hosting the tablet manager.
#[derive(Default)]
pub struct MasterAutomaton {
    pub manager: TabletManager,
}

impl MasterAutomaton {
    pub fn new() -> Self {
        Self::default()
    }

    fn dispatch(
        &mut self,
        mutation: MasterMutation,
        now: u64,
        random_seed: u64,
    ) -> Result<MasterResponse, String> {
        let manager = &mut self.manager;
        let response = match mutation {
            MasterMutation::CreateBundle { name } => {
                MasterResponse::Id(manager.catalog.create_bundle(name).0)
            },
            MasterMutation::CreateCell { bundle } => {
                MasterResponse::Id(manager.catalog.create_cell(bundle).map_err(stringify)?.0)
            },
            MasterMutation::CreateOwner { path, kind, bundle } => MasterResponse::Id(
                manager
                    .catalog
                    .create_owner(path, kind, bundle)
                    .map_err(stringify)?
                    .0,
            ),
            MasterMutation::MountTable {
                owner,
                first,
                last,
                target_cells,
                hint_cell,
                freeze,
            } => {
                let targets = CellTargets {
                    target_cells,
                    hint_cell,
                };
                manager
                    .mount_table(owner, first, last, targets, freeze, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::UnmountTable {
                owner,
                first,
                last,
                force,
            } => {
                manager
                    .unmount_table(owner, first, last, force, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::FreezeTable { owner, first, last } => {
                manager
                    .freeze_table(owner, first, last, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::UnfreezeTable { owner, first, last } => {
                manager
                    .unfreeze_table(owner, first, last, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::RemountTable { owner, first, last } => {
                manager
                    .remount_table(owner, first, last)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::ReshardTable {
                owner,
                first,
                last,
                pivot_keys,
                tablet_count,
            } => {
                manager
                    .reshard_table(
                        owner,
                        first,
                        last,
                        pivot_keys,
                        tablet_count,
                        now,
                        random_seed,
                    )
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::CreateTabletAction {
                kind,
                tablets,
                target_cells,
                pivot_keys,
                tablet_count,
                freeze_on_mount,
                expiration_timeout,
            } => {
                let spec = ActionSpec {
                    kind,
                    tablets,
                    target_cells,
                    pivot_keys,
                    tablet_count,
                    freeze_on_mount,
                    expiration_timeout,
                };
                let ActionId(raw) = manager
                    .create_tablet_action(spec, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Id(raw)
            },
            MasterMutation::CreateTableReplica {
                owner,
                cluster_name,
                replica_path,
                mode,
            } => MasterResponse::Id(
                manager
                    .create_table_replica(owner, cluster_name, replica_path, mode)
                    .map_err(stringify)?
                    .0,
            ),
            MasterMutation::RemoveTableReplica { replica } => {
                manager.remove_table_replica(replica).map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::AlterTableReplica {
                replica,
                enabled,
                mode,
                atomicity,
                preserve_timestamps,
            } => {
                manager
                    .alter_table_replica(replica, enabled, mode, atomicity, preserve_timestamps)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::DestroyOwner { owner } => {
                manager
                    .destroy_owner(owner, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::SetCellHealth { cell, health } => {
                manager
                    .set_cell_health(cell, health, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::ReportCellStatistics { cell, statistics } => {
                manager
                    .report_cell_statistics(cell, statistics)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::CellNotification { cell, notification } => {
                manager
                    .on_cell_notification(cell, notification, now, random_seed)
                    .map_err(stringify)?;
                MasterResponse::Ok
            },
            MasterMutation::SweepExpiredActions => {
                manager.sweep_expired_actions(now);
                MasterResponse::Ok
            },
        };
        Ok(response)
    }
}

fn stringify(error: crate::error::TabletError) -> String {
    error.to_string()
}

impl Automaton for MasterAutomaton {
    fn apply(&mut self, context: &mut MutationContext, payload: &[u8]) {
        let response = match bcs::from_bytes::<MasterMutation>(payload) {
            Ok(mutation) => {
                let now = context.timestamp();
                let random_seed: u64 = context.random();
                match self.dispatch(mutation, now, random_seed) {
                    Ok(response) => response,
                    Err(message) => MasterResponse::Error(message),
                }
            },
            Err(e) => {
                warn!(error = %e, "undecodable master mutation");
                MasterResponse::Error(format!("undecodable mutation: {}", e))
            },
        };
        if let Ok(encoded) = bcs::to_bytes(&response) {
            context.set_response(Bytes::from(encoded));
        }
    }

    fn save(&self, writer: &mut dyn std::io::Write) -> anyhow::Result<()> {
        let saved = SavedMaster {
            catalog: self.manager.catalog.save()?,
            mailboxes: self.manager.mailboxes.clone(),
            mutation_revision: self.manager.mutation_revision(),
        };
        writer.write_all(&bcs::to_bytes(&saved)?)?;
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn std::io::Read) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        let saved: SavedMaster = bcs::from_bytes(&buf)?;
        self.manager = TabletManager::restore(
            TabletCatalog::load(&saved.catalog)?,
            saved.mailboxes,
            saved.mutation_revision,
        );
        Ok(())
    }

    fn clear(&mut self) {
        self.manager = TabletManager::new();
    }
}
