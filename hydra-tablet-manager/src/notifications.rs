// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Reconciliation of cell notifications into the catalog. Stale mount
//! revisions are dropped silently; notifications the catalog state cannot
//! justify are alerted on and flagged in place, never silently applied.

use crate::{
    controller::TabletManager,
    error::TabletResult,
    ids::{CellId, DynamicStoreId, ReplicaId, TabletId},
    messages::{CellNotification, CellRequest},
    types::{ReplicaState, TabletState},
};
use std::collections::BTreeSet;
use tracing::{debug, warn};

impl TabletManager {
    /// Applies one notification from a cell. Runs as a replicated master
    /// mutation; `now` and `random_seed` come from the mutation context.
    pub fn on_cell_notification(
        &mut self,
        cell_id: CellId,
        notification: CellNotification,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        let tablet_id = notification.tablet_id();
        let revision = notification.mount_revision();

        let Ok(tablet) = self.catalog.tablet(tablet_id) else {
            debug!(%tablet_id, "notification for a destroyed tablet, ignoring");
            return Ok(());
        };
        if tablet.mount_revision != revision {
            if tablet.force_unmount_revision == Some(revision) {
                warn!(
                    %tablet_id,
                    %cell_id,
                    revision,
                    "notification for an incarnation that was forcefully unmounted"
                );
            } else {
                debug!(%tablet_id, revision, current = tablet.mount_revision, "stale mount revision, ignoring");
            }
            return Ok(());
        }

        match notification {
            CellNotification::TabletMounted { frozen, .. } => {
                self.reconcile_mounted(tablet_id, frozen)?;
            },
            CellNotification::TabletUnmounted { .. } => {
                self.reconcile_unmounted(tablet_id, cell_id)?;
            },
            CellNotification::TabletFrozen { .. } => {
                self.reconcile_state_edge(
                    tablet_id,
                    TabletState::Freezing,
                    TabletState::Frozen,
                    "TabletFrozen",
                )?;
            },
            CellNotification::TabletUnfrozen { .. } => {
                self.reconcile_state_edge(
                    tablet_id,
                    TabletState::Unfreezing,
                    TabletState::Mounted,
                    "TabletUnfrozen",
                )?;
            },
            CellNotification::TableReplicaEnabled { replica_id, .. } => {
                self.reconcile_replica_transition(tablet_id, replica_id, true)?;
            },
            CellNotification::TableReplicaDisabled { replica_id, .. } => {
                self.reconcile_replica_transition(tablet_id, replica_id, false)?;
            },
            CellNotification::UpdateTableReplicaStatistics {
                replica_id,
                committed_replication_row_index,
                ..
            } => {
                if let Some(info) = self
                    .catalog
                    .tablet_mut(tablet_id)?
                    .replicas
                    .get_mut(&replica_id)
                {
                    info.committed_replication_row_index =
                        info.committed_replication_row_index.max(committed_replication_row_index);
                }
            },
            CellNotification::TabletLocked {
                transaction_ids, ..
            } => {
                // The cell's lock set is authoritative.
                self.catalog.tablet_mut(tablet_id)?.locks =
                    transaction_ids.into_iter().collect::<BTreeSet<_>>();
            },
            CellNotification::UpdateTabletTrimmedRowCount {
                trimmed_row_count, ..
            } => {
                let tablet = self.catalog.tablet_mut(tablet_id)?;
                tablet.trimmed_row_count = tablet.trimmed_row_count.max(trimmed_row_count);
            },
            CellNotification::AllocateDynamicStore { .. } => {
                let store_id = DynamicStoreId(self.catalog.ids.next_raw());
                self.mailboxes.post(
                    cell_id,
                    CellRequest::GrantDynamicStore {
                        tablet_id,
                        mount_revision: revision,
                        store_id,
                    },
                );
            },
        }

        if let Some(action_id) = self.catalog.tablet(tablet_id)?.action {
            self.touch_action(action_id, now, random_seed);
        }
        Ok(())
    }

    fn reconcile_mounted(&mut self, tablet_id: TabletId, frozen: bool) -> TabletResult<()> {
        let state = self.catalog.tablet(tablet_id)?.state;
        let target = if frozen {
            TabletState::Frozen
        } else {
            TabletState::Mounted
        };
        match state {
            TabletState::Mounting | TabletState::FrozenMounting => {
                self.catalog.tablet_mut(tablet_id)?.state = target;
                debug!(%tablet_id, frozen, "tablet mounted");
            },
            state if state == target => {
                // Redelivery of an already-applied notification.
            },
            TabletState::Unmounting => {
                // A later unmount superseded the mount in flight.
                debug!(%tablet_id, "mount confirmation superseded by unmount");
            },
            state => {
                self.flag_discrepancy(tablet_id, format!(
                    "TabletMounted(frozen={}) arrived in state {}",
                    frozen, state
                ))?;
            },
        }
        Ok(())
    }

    fn reconcile_unmounted(&mut self, tablet_id: TabletId, cell_id: CellId) -> TabletResult<()> {
        let state = self.catalog.tablet(tablet_id)?.state;
        match state {
            TabletState::Unmounting => {
                {
                    let tablet = self.catalog.tablet_mut(tablet_id)?;
                    tablet.state = TabletState::Unmounted;
                    tablet.cell = None;
                }
                self.catalog
                    .cell_mut(cell_id)?
                    .hosted_tablets
                    .remove(&tablet_id);
                debug!(%tablet_id, %cell_id, "tablet unmounted");
            },
            TabletState::Unmounted => {},
            state => {
                self.flag_discrepancy(
                    tablet_id,
                    format!("TabletUnmounted arrived in state {}", state),
                )?;
            },
        }
        Ok(())
    }

    fn reconcile_state_edge(
        &mut self,
        tablet_id: TabletId,
        from: TabletState,
        to: TabletState,
        what: &str,
    ) -> TabletResult<()> {
        let state = self.catalog.tablet(tablet_id)?.state;
        if state == from {
            self.catalog.tablet_mut(tablet_id)?.state = to;
            debug!(%tablet_id, %to, "tablet state reconciled");
        } else if state == TabletState::Unmounting {
            // A later unmount superseded this transition.
            debug!(%tablet_id, what, "confirmation superseded by unmount");
        } else if state != to {
            self.flag_discrepancy(tablet_id, format!("{} arrived in state {}", what, state))?;
        }
        Ok(())
    }

    fn reconcile_replica_transition(
        &mut self,
        tablet_id: TabletId,
        replica_id: ReplicaId,
        enabled: bool,
    ) -> TabletResult<()> {
        let owner_id = {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            if let Some(info) = tablet.replicas.get_mut(&replica_id) {
                info.transitioning = false;
            }
            tablet.owner
        };

        // The replica settles once no tablet is still transitioning.
        let any_transitioning = self
            .catalog
            .owner(owner_id)?
            .tablets
            .iter()
            .filter_map(|id| self.catalog.tablet(*id).ok())
            .filter_map(|t| t.replicas.get(&replica_id))
            .any(|info| info.transitioning);
        if !any_transitioning {
            if let Ok(replica) = self.catalog.replica_mut(replica_id) {
                replica.state = if enabled {
                    ReplicaState::Enabled
                } else {
                    ReplicaState::Disabled
                };
            }
        }
        Ok(())
    }

    fn flag_discrepancy(&mut self, tablet_id: TabletId, message: String) -> TabletResult<()> {
        warn!(%tablet_id, message, "unexpected notification; flagging tablet");
        self.catalog.tablet_mut(tablet_id)?.flagged_discrepancy = Some(message);
        Ok(())
    }
}
