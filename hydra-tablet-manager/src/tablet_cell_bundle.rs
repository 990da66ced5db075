// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::ids::{BundleId, CellId};
use hydra_config::TabletBalancerConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Resource accounting of a bundle; the quota hook is deliberately
/// opaque, enforcement lives elsewhere.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleResources {
    pub tablet_count_limit: u64,
    pub tablet_count_usage: u64,
    pub memory_limit: u64,
    pub memory_usage: u64,
}

/// A named group of cells sharing configuration and one balancer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletCellBundle {
    pub id: BundleId,
    pub name: String,
    pub cells: BTreeSet<CellId>,
    pub balancer_config: TabletBalancerConfig,
    pub resources: BundleResources,
}

impl TabletCellBundle {
    pub fn new(id: BundleId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            cells: BTreeSet::new(),
            balancer_config: TabletBalancerConfig::default(),
            resources: BundleResources::default(),
        }
    }
}
