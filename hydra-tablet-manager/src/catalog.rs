// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The typed entity maps of the master: owners, tablets, cells, bundles,
//! replicas, actions. Entities reference each other by id; the audit
//! verifies the cross-reference invariants that every mutation must
//! preserve.

use crate::{
    error::{TabletError, TabletResult},
    ids::{ActionId, BundleId, CellId, IdGenerator, OwnerId, ReplicaId, TabletId},
    table_replica::TableReplica,
    tablet::Tablet,
    tablet_action::TabletAction,
    tablet_cell::TabletCell,
    tablet_cell_bundle::TabletCellBundle,
    tablet_owner::TabletOwner,
    types::{OwnerKind, PivotKey, TabletState},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TabletCatalog {
    pub owners: BTreeMap<OwnerId, TabletOwner>,
    pub tablets: BTreeMap<TabletId, Tablet>,
    pub cells: BTreeMap<CellId, TabletCell>,
    pub bundles: BTreeMap<BundleId, TabletCellBundle>,
    pub table_replicas: BTreeMap<ReplicaId, TableReplica>,
    pub tablet_actions: BTreeMap<ActionId, TabletAction>,
    pub ids: IdGenerator,
}

/// The catalog's persisted form: a key stream naming every entity and a
/// value stream carrying one serialized entity per key, in step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogStreams {
    pub keys: Vec<u8>,
    pub values: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
enum EntityKey {
    Owner(OwnerId),
    Tablet(TabletId),
    Cell(CellId),
    Bundle(BundleId),
    Replica(ReplicaId),
    Action(ActionId),
    IdGenerator,
}

impl TabletCatalog {
    pub fn owner(&self, id: OwnerId) -> TabletResult<&TabletOwner> {
        self.owners.get(&id).ok_or(TabletError::NoSuchOwner(id))
    }

    pub fn owner_mut(&mut self, id: OwnerId) -> TabletResult<&mut TabletOwner> {
        self.owners.get_mut(&id).ok_or(TabletError::NoSuchOwner(id))
    }

    pub fn tablet(&self, id: TabletId) -> TabletResult<&Tablet> {
        self.tablets.get(&id).ok_or(TabletError::NoSuchTablet(id))
    }

    pub fn tablet_mut(&mut self, id: TabletId) -> TabletResult<&mut Tablet> {
        self.tablets
            .get_mut(&id)
            .ok_or(TabletError::NoSuchTablet(id))
    }

    pub fn cell(&self, id: CellId) -> TabletResult<&TabletCell> {
        self.cells.get(&id).ok_or(TabletError::NoSuchCell(id))
    }

    pub fn cell_mut(&mut self, id: CellId) -> TabletResult<&mut TabletCell> {
        self.cells.get_mut(&id).ok_or(TabletError::NoSuchCell(id))
    }

    pub fn replica(&self, id: ReplicaId) -> TabletResult<&TableReplica> {
        self.table_replicas
            .get(&id)
            .ok_or(TabletError::NoSuchReplica(id))
    }

    pub fn replica_mut(&mut self, id: ReplicaId) -> TabletResult<&mut TableReplica> {
        self.table_replicas
            .get_mut(&id)
            .ok_or(TabletError::NoSuchReplica(id))
    }

    pub fn action(&self, id: ActionId) -> TabletResult<&TabletAction> {
        self.tablet_actions
            .get(&id)
            .ok_or(TabletError::NoSuchAction(id))
    }

    pub fn action_mut(&mut self, id: ActionId) -> TabletResult<&mut TabletAction> {
        self.tablet_actions
            .get_mut(&id)
            .ok_or(TabletError::NoSuchAction(id))
    }

    pub fn create_bundle(&mut self, name: impl Into<String>) -> BundleId {
        let id = BundleId(self.ids.next_raw());
        self.bundles.insert(id, TabletCellBundle::new(id, name));
        id
    }

    pub fn create_cell(&mut self, bundle_id: BundleId) -> TabletResult<CellId> {
        let id = CellId(self.ids.next_raw());
        let bundle = self
            .bundles
            .get_mut(&bundle_id)
            .ok_or_else(|| TabletError::invalid_argument(format!("no such bundle {}", bundle_id)))?;
        bundle.cells.insert(id);
        self.cells.insert(id, TabletCell::new(id, bundle_id));
        Ok(id)
    }

    /// Makes a new dynamic owner with a single tablet spanning the whole
    /// key space (sorted) or a single shard (ordered).
    pub fn create_owner(
        &mut self,
        path: impl Into<String>,
        kind: OwnerKind,
        bundle_id: BundleId,
    ) -> TabletResult<OwnerId> {
        if !self.bundles.contains_key(&bundle_id) {
            return Err(TabletError::invalid_argument(format!(
                "no such bundle {}",
                bundle_id
            )));
        }
        let id = OwnerId(self.ids.next_raw());
        let mut owner = TabletOwner::new(id, path, kind, bundle_id);
        let tablet_id = TabletId(self.ids.next_raw());
        owner.tablets.push(tablet_id);
        self.tablets
            .insert(tablet_id, Tablet::new(tablet_id, id, 0, PivotKey::MIN));
        self.owners.insert(id, owner);
        Ok(id)
    }

    pub fn create_tablet(
        &mut self,
        owner: OwnerId,
        index: usize,
        pivot_key: PivotKey,
    ) -> TabletId {
        let id = TabletId(self.ids.next_raw());
        self.tablets
            .insert(id, Tablet::new(id, owner, index, pivot_key));
        id
    }

    /// A tablet may only go away when no owner, cell, or pending action
    /// still references it.
    pub fn destroy_tablet(&mut self, id: TabletId) -> TabletResult<()> {
        let tablet = self.tablet(id)?;
        if let Some(action_id) = tablet.action {
            if !self.action(action_id)?.is_finished() {
                return Err(TabletError::TabletHasAction(id, action_id));
            }
        }
        if let Some(cell) = tablet.cell {
            return Err(TabletError::invalid_argument(format!(
                "tablet {} is still referenced by cell {}",
                id, cell
            )));
        }
        if let Ok(owner) = self.owner(tablet.owner) {
            if owner.tablets.contains(&id) {
                return Err(TabletError::invalid_argument(format!(
                    "tablet {} is still owned by {}",
                    id, tablet.owner
                )));
            }
        }
        self.tablets.remove(&id);
        Ok(())
    }

    /// Rewrites every tablet's `index` to its position in the owner list.
    pub fn reindex_owner_tablets(&mut self, owner_id: OwnerId) -> TabletResult<()> {
        let tablet_ids = self.owner(owner_id)?.tablets.clone();
        for (index, tablet_id) in tablet_ids.into_iter().enumerate() {
            self.tablet_mut(tablet_id)?.index = index;
        }
        Ok(())
    }

    /// Verifies the standing invariants; returns the first violation.
    pub fn audit(&self) -> Result<(), String> {
        for (owner_id, owner) in &self.owners {
            for (index, tablet_id) in owner.tablets.iter().enumerate() {
                let Some(tablet) = self.tablets.get(tablet_id) else {
                    return Err(format!("owner {} lists missing tablet {}", owner_id, tablet_id));
                };
                if tablet.owner != *owner_id {
                    return Err(format!(
                        "tablet {} sits in owner {} but points at {}",
                        tablet_id, owner_id, tablet.owner
                    ));
                }
                if tablet.index != index {
                    return Err(format!(
                        "tablet {} has index {} but sits at position {}",
                        tablet_id, tablet.index, index
                    ));
                }
            }
        }

        for (tablet_id, tablet) in &self.tablets {
            let has_cell = tablet.cell.is_some();
            let unmounted = tablet.state == TabletState::Unmounted;
            if has_cell == unmounted {
                return Err(format!(
                    "tablet {} is {} with cell {:?}",
                    tablet_id, tablet.state, tablet.cell
                ));
            }
            if let Some(cell_id) = tablet.cell {
                let Some(cell) = self.cells.get(&cell_id) else {
                    return Err(format!("tablet {} points at missing cell {}", tablet_id, cell_id));
                };
                if !cell.hosted_tablets.contains(tablet_id) {
                    return Err(format!(
                        "cell {} does not host tablet {} that points at it",
                        cell_id, tablet_id
                    ));
                }
            }
        }

        for (cell_id, cell) in &self.cells {
            for tablet_id in &cell.hosted_tablets {
                let hosted = self
                    .tablets
                    .get(tablet_id)
                    .is_some_and(|t| t.cell == Some(*cell_id));
                if !hosted {
                    return Err(format!(
                        "cell {} hosts tablet {} that does not point back",
                        cell_id, tablet_id
                    ));
                }
            }
        }

        for (action_id, action) in &self.tablet_actions {
            if action.is_finished() {
                continue;
            }
            for tablet_id in &action.tablets {
                let linked = self
                    .tablets
                    .get(tablet_id)
                    .is_some_and(|t| t.action == Some(*action_id));
                if !linked {
                    return Err(format!(
                        "action {} holds tablet {} that does not point back",
                        action_id, tablet_id
                    ));
                }
            }
        }
        Ok(())
    }

    /// Serializes into the key and value streams embedded in master
    /// snapshots.
    pub fn save(&self) -> Result<CatalogStreams, bcs::Error> {
        let mut keys: Vec<EntityKey> = Vec::new();
        let mut values: Vec<Vec<u8>> = Vec::new();

        for (id, owner) in &self.owners {
            keys.push(EntityKey::Owner(*id));
            values.push(bcs::to_bytes(owner)?);
        }
        for (id, tablet) in &self.tablets {
            keys.push(EntityKey::Tablet(*id));
            values.push(bcs::to_bytes(tablet)?);
        }
        for (id, cell) in &self.cells {
            keys.push(EntityKey::Cell(*id));
            values.push(bcs::to_bytes(cell)?);
        }
        for (id, bundle) in &self.bundles {
            keys.push(EntityKey::Bundle(*id));
            values.push(bcs::to_bytes(bundle)?);
        }
        for (id, replica) in &self.table_replicas {
            keys.push(EntityKey::Replica(*id));
            values.push(bcs::to_bytes(replica)?);
        }
        for (id, action) in &self.tablet_actions {
            keys.push(EntityKey::Action(*id));
            values.push(bcs::to_bytes(action)?);
        }
        keys.push(EntityKey::IdGenerator);
        values.push(bcs::to_bytes(&self.ids)?);

        Ok(CatalogStreams {
            keys: bcs::to_bytes(&keys)?,
            values: bcs::to_bytes(&values)?,
        })
    }

    pub fn load(streams: &CatalogStreams) -> Result<Self, bcs::Error> {
        let keys: Vec<EntityKey> = bcs::from_bytes(&streams.keys)?;
        let values: Vec<Vec<u8>> = bcs::from_bytes(&streams.values)?;
        let mut catalog = Self::default();
        for (key, value) in keys.iter().zip(values.iter()) {
            match key {
                EntityKey::Owner(id) => {
                    catalog.owners.insert(*id, bcs::from_bytes(value)?);
                },
                EntityKey::Tablet(id) => {
                    catalog.tablets.insert(*id, bcs::from_bytes(value)?);
                },
                EntityKey::Cell(id) => {
                    catalog.cells.insert(*id, bcs::from_bytes(value)?);
                },
                EntityKey::Bundle(id) => {
                    catalog.bundles.insert(*id, bcs::from_bytes(value)?);
                },
                EntityKey::Replica(id) => {
                    catalog.table_replicas.insert(*id, bcs::from_bytes(value)?);
                },
                EntityKey::Action(id) => {
                    catalog.tablet_actions.insert(*id, bcs::from_bytes(value)?);
                },
                EntityKey::IdGenerator => {
                    catalog.ids = bcs::from_bytes(value)?;
                },
            }
        }
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_ok, assert_err};

    #[test]
    fn fresh_owner_passes_audit() {
        let mut catalog = TabletCatalog::default();
        let bundle = catalog.create_bundle("default");
        let _cell = assert_ok!(catalog.create_cell(bundle));
        let owner = assert_ok!(catalog.create_owner("//t", OwnerKind::SortedTable, bundle));
        assert_ok!(catalog.audit());

        let tablet_id = catalog.owner(owner).unwrap().tablets[0];
        assert_eq!(catalog.tablet(tablet_id).unwrap().pivot_key, PivotKey::MIN);
    }

    #[test]
    fn audit_catches_index_drift() {
        let mut catalog = TabletCatalog::default();
        let bundle = catalog.create_bundle("default");
        let owner = assert_ok!(catalog.create_owner("//t", OwnerKind::SortedTable, bundle));
        let tablet_id = catalog.owner(owner).unwrap().tablets[0];
        catalog.tablet_mut(tablet_id).unwrap().index = 5;
        assert!(catalog.audit().is_err());
    }

    #[test]
    fn owned_tablet_cannot_be_destroyed() {
        let mut catalog = TabletCatalog::default();
        let bundle = catalog.create_bundle("default");
        let owner = assert_ok!(catalog.create_owner("//t", OwnerKind::SortedTable, bundle));
        let tablet_id = catalog.owner(owner).unwrap().tablets[0];
        assert_err!(catalog.destroy_tablet(tablet_id));
    }

    #[test]
    fn save_load_roundtrip() {
        let mut catalog = TabletCatalog::default();
        let bundle = catalog.create_bundle("default");
        let _cell = assert_ok!(catalog.create_cell(bundle));
        let _owner = assert_ok!(catalog.create_owner("//t", OwnerKind::OrderedTable, bundle));

        let streams = assert_ok!(catalog.save());
        let restored = assert_ok!(TabletCatalog::load(&streams));
        assert_eq!(restored.owners.len(), 1);
        assert_eq!(restored.tablets.len(), 1);
        assert_eq!(restored.cells.len(), 1);
        assert_eq!(restored.bundles.len(), 1);
        // The id generator resumes where it left off.
        let mut ids = restored.ids.clone();
        let mut original_ids = catalog.ids.clone();
        assert_eq!(ids.next_raw(), original_ids.next_raw());
    }
}
