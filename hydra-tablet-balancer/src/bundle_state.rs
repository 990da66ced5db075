// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use hydra_config::TabletBalancerConfig;
use hydra_tablet_manager::{
    CellHealth, CellId, OwnerId, TabletCatalog, TabletId, TabletState,
};

/// A read-only statistics snapshot of one cell.
#[derive(Clone, Debug)]
pub struct CellSnapshot {
    pub id: CellId,
    pub health: CellHealth,
    pub memory_size: u64,
    pub tablet_count: u64,
}

/// A read-only statistics snapshot of one tablet.
#[derive(Clone, Debug)]
pub struct TabletSnapshot {
    pub id: TabletId,
    pub owner: OwnerId,
    pub index: usize,
    pub state: TabletState,
    pub cell: Option<CellId>,
    pub data_size: u64,
    pub in_memory: bool,
    pub has_action: bool,
}

/// Everything the balancer needs to know about one bundle for one
/// iteration. Snapshots are fetched once per iteration; the balancer
/// never reads live master state.
#[derive(Clone, Debug)]
pub struct BundleSnapshot {
    pub name: String,
    pub config: TabletBalancerConfig,
    pub cells: Vec<CellSnapshot>,
    pub tablets: Vec<TabletSnapshot>,
    pub has_unfinished_actions: bool,
}

impl BundleSnapshot {
    pub fn healthy(&self) -> bool {
        self.cells
            .iter()
            .all(|cell| cell.health == CellHealth::Good)
    }

    /// Builds a snapshot straight from a master catalog. The standalone
    /// balancer gets these over the wire; in-process deployments and
    /// tests take this shortcut.
    pub fn from_catalog(catalog: &TabletCatalog, bundle_name: &str) -> Option<Self> {
        let bundle = catalog
            .bundles
            .values()
            .find(|b| b.name == bundle_name)?;
        let cells = bundle
            .cells
            .iter()
            .filter_map(|id| catalog.cells.get(id))
            .map(|cell| CellSnapshot {
                id: cell.id,
                health: cell.health,
                memory_size: cell.statistics.memory_size,
                tablet_count: cell.hosted_tablets.len() as u64,
            })
            .collect();
        let tablets = catalog
            .tablets
            .values()
            .filter(|tablet| {
                catalog
                    .owners
                    .get(&tablet.owner)
                    .is_some_and(|o| o.bundle == bundle.id)
            })
            .map(|tablet| TabletSnapshot {
                id: tablet.id,
                owner: tablet.owner,
                index: tablet.index,
                state: tablet.state,
                cell: tablet.cell,
                data_size: tablet.data_size(),
                in_memory: catalog
                    .owners
                    .get(&tablet.owner)
                    .map(|o| o.mount_settings.in_memory)
                    .unwrap_or(false),
                has_action: tablet.action.is_some(),
            })
            .collect();
        let has_unfinished_actions = catalog
            .tablet_actions
            .values()
            .any(|action| !action.is_finished());
        Some(Self {
            name: bundle.name.clone(),
            config: bundle.balancer_config.clone(),
            cells,
            tablets,
            has_unfinished_actions,
        })
    }
}
