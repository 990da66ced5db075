// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ids::{ActionId, CellId, TabletId},
    types::{ActionKind, ActionState, PivotKey, TabletState},
};
use serde::{Deserialize, Serialize};

/// A persisted multi-step transition over a tablet group. The controller
/// advances it as cell notifications arrive; everything needed to resume
/// after a master restart is right here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletAction {
    pub id: ActionId,
    pub kind: ActionKind,
    pub state: ActionState,
    pub tablets: Vec<TabletId>,
    /// Requested target cells; empty means "let the heuristic place them".
    pub target_cells: Vec<CellId>,
    /// Reshard only: explicit pivots, or `None` to estimate from chunks.
    pub pivot_keys: Option<Vec<PivotKey>>,
    /// Reshard only: resulting tablet count when pivots are estimated.
    pub tablet_count: Option<usize>,
    /// Where each tablet was mounted before the action started, for
    /// rollback on failure.
    pub prior_cells: Vec<Option<CellId>>,
    /// The settled state each tablet was in before the action started.
    pub prior_states: Vec<TabletState>,
    /// Whether the tablets should come back frozen.
    pub freeze_on_mount: bool,
    pub created_at: u64,
    /// How long a terminal action lingers before the sweep removes it.
    pub expiration_timeout: u64,
    /// Set on entering a terminal state; the sweep compares against it.
    pub expires_at: Option<u64>,
    pub error: Option<String>,
}

impl TabletAction {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}
