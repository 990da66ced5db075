// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ids::{BundleId, CellId, TabletId},
    types::CellHealth,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Aggregate statistics a cell reports about itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellStatistics {
    pub memory_size: u64,
    pub uncompressed_data_size: u64,
    pub tablet_count: u64,
}

/// One consensus group hosting tablets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletCell {
    pub id: CellId,
    pub bundle: BundleId,
    pub health: CellHealth,
    /// Strong references to the tablets this cell hosts; must equal the
    /// set of tablets whose `cell` points here.
    pub hosted_tablets: BTreeSet<TabletId>,
    pub statistics: CellStatistics,
}

impl TabletCell {
    pub fn new(id: CellId, bundle: BundleId) -> Self {
        Self {
            id,
            bundle,
            health: CellHealth::Good,
            hosted_tablets: BTreeSet::new(),
            statistics: CellStatistics::default(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.health == CellHealth::Good
    }
}
