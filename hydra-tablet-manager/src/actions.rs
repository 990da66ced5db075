// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The tablet action state machine. An action freezes, unmounts,
//! optionally reshards, and remounts a tablet group; notifications from
//! cells drive it forward one justified step at a time.

use crate::{
    controller::{CellTargets, TabletManager},
    error::{TabletError, TabletResult},
    ids::{ActionId, CellId, TabletId},
    messages::CellRequest,
    tablet_action::TabletAction,
    types::{ActionKind, ActionState, PivotKey, TabletState},
};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Arguments of `create_tablet_action`; mirrors the operator RPC.
#[derive(Clone, Debug)]
pub struct ActionSpec {
    pub kind: ActionKind,
    pub tablets: Vec<TabletId>,
    pub target_cells: Vec<CellId>,
    pub pivot_keys: Option<Vec<PivotKey>>,
    pub tablet_count: Option<usize>,
    pub freeze_on_mount: bool,
    pub expiration_timeout: u64,
}

impl TabletManager {
    pub fn create_tablet_action(
        &mut self,
        spec: ActionSpec,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<ActionId> {
        if spec.tablets.is_empty() {
            return Err(TabletError::invalid_argument("action needs tablets"));
        }
        let mut owner = None;
        for tablet_id in &spec.tablets {
            let tablet = self.catalog.tablet(*tablet_id)?;
            if let Some(action_id) = tablet.action {
                if !self.catalog.action(action_id)?.is_finished() {
                    return Err(TabletError::TabletHasAction(*tablet_id, action_id));
                }
            }
            match owner {
                None => owner = Some(tablet.owner),
                Some(owner) if owner == tablet.owner => {},
                Some(_) => {
                    return Err(TabletError::invalid_argument(
                        "action tablets must share one owner",
                    ));
                },
            }
        }
        if spec.kind == ActionKind::Reshard {
            if spec.pivot_keys.is_none() && spec.tablet_count.is_none() {
                return Err(TabletError::invalid_argument(
                    "reshard action needs pivot keys or a tablet count",
                ));
            }
            // Reshard ranges must be contiguous within the owner.
            let mut indexes: Vec<usize> = spec
                .tablets
                .iter()
                .map(|id| self.catalog.tablet(*id).map(|t| t.index))
                .collect::<TabletResult<_>>()?;
            indexes.sort_unstable();
            let contiguous = indexes.windows(2).all(|w| w[1] == w[0] + 1);
            if !contiguous {
                return Err(TabletError::invalid_argument(
                    "reshard action tablets must be contiguous",
                ));
            }
        }
        if !spec.target_cells.is_empty() {
            for cell_id in &spec.target_cells {
                self.catalog.cell(*cell_id)?;
            }
        }

        let action_id = ActionId(self.catalog.ids.next_raw());
        let mut prior_cells = Vec::with_capacity(spec.tablets.len());
        let mut prior_states = Vec::with_capacity(spec.tablets.len());
        for tablet_id in &spec.tablets {
            let tablet = self.catalog.tablet_mut(*tablet_id)?;
            prior_cells.push(tablet.cell);
            prior_states.push(tablet.state);
            tablet.action = Some(action_id);
        }
        self.catalog.tablet_actions.insert(
            action_id,
            TabletAction {
                id: action_id,
                kind: spec.kind,
                state: ActionState::Preparing,
                tablets: spec.tablets,
                target_cells: spec.target_cells,
                pivot_keys: spec.pivot_keys,
                tablet_count: spec.tablet_count,
                prior_cells,
                prior_states,
                freeze_on_mount: spec.freeze_on_mount,
                created_at: now,
                expiration_timeout: spec.expiration_timeout,
                expires_at: None,
                error: None,
            },
        );
        info!(%action_id, kind = %spec.kind, "tablet action created");
        self.touch_action(action_id, now, random_seed);
        Ok(action_id)
    }

    /// Advances the action as far as its tablets' states justify.
    pub fn touch_action(&mut self, action_id: ActionId, now: u64, random_seed: u64) {
        loop {
            match self.step_action(action_id, now, random_seed) {
                Ok(true) => continue,
                Ok(false) => break,
                Err(error) => {
                    self.fail_action(action_id, &error.to_string(), now, random_seed);
                    break;
                },
            }
        }
    }

    fn action_tablet_states(&self, action: &TabletAction) -> TabletResult<Vec<TabletState>> {
        action
            .tablets
            .iter()
            .map(|id| self.catalog.tablet(*id).map(|t| t.state))
            .collect()
    }

    fn step_action(
        &mut self,
        action_id: ActionId,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<bool> {
        let (state, tablets) = {
            let action = self.catalog.action(action_id)?;
            (action.state, action.tablets.clone())
        };

        match state {
            ActionState::Preparing => {
                for tablet_id in &tablets {
                    self.freeze_action_tablet(*tablet_id)?;
                }
                self.set_action_state(action_id, ActionState::Freezing)?;
                Ok(true)
            },
            ActionState::Freezing => {
                let states = self.action_tablet_states(self.catalog.action(action_id)?)?;
                let settled = states
                    .iter()
                    .all(|s| matches!(s, TabletState::Frozen | TabletState::Unmounted));
                if settled {
                    self.set_action_state(action_id, ActionState::Frozen)?;
                }
                Ok(settled)
            },
            ActionState::Frozen => {
                for tablet_id in &tablets {
                    let state = self.catalog.tablet(*tablet_id)?.state;
                    if state != TabletState::Unmounted {
                        self.post_action_unmount(*tablet_id)?;
                    }
                }
                self.set_action_state(action_id, ActionState::Unmounting)?;
                Ok(true)
            },
            ActionState::Unmounting => {
                let states = self.action_tablet_states(self.catalog.action(action_id)?)?;
                let settled = states.iter().all(|s| *s == TabletState::Unmounted);
                if settled {
                    self.set_action_state(action_id, ActionState::Unmounted)?;
                }
                Ok(settled)
            },
            ActionState::Unmounted => {
                if self.catalog.action(action_id)?.kind == ActionKind::Reshard {
                    self.reshard_action_tablets(action_id, now, random_seed)?;
                }
                self.try_mount_action_tablets(action_id, random_seed)
            },
            ActionState::Orphaned => self.try_mount_action_tablets(action_id, random_seed),
            ActionState::Mounting => {
                let action = self.catalog.action(action_id)?;
                let wanted = if action.freeze_on_mount {
                    TabletState::Frozen
                } else {
                    TabletState::Mounted
                };
                let states = self.action_tablet_states(action)?;
                let settled = states.iter().all(|s| *s == wanted);
                if settled {
                    self.set_action_state(action_id, ActionState::Mounted)?;
                }
                Ok(settled)
            },
            ActionState::Mounted => {
                for tablet_id in &tablets {
                    self.catalog.tablet_mut(*tablet_id)?.action = None;
                }
                {
                    let action = self.catalog.action_mut(action_id)?;
                    action.state = ActionState::Completed;
                    action.expires_at = Some(now + action.expiration_timeout);
                }
                info!(%action_id, "tablet action completed");
                Ok(false)
            },
            ActionState::Failing | ActionState::Failed | ActionState::Completed => Ok(false),
        }
    }

    fn set_action_state(&mut self, action_id: ActionId, state: ActionState) -> TabletResult<()> {
        let action = self.catalog.action_mut(action_id)?;
        info!(%action_id, from = %action.state, to = %state, "tablet action state changed");
        action.state = state;
        Ok(())
    }

    fn freeze_action_tablet(&mut self, tablet_id: TabletId) -> TabletResult<()> {
        let (state, cell, revision) = {
            let tablet = self.catalog.tablet(tablet_id)?;
            (tablet.state, tablet.cell, tablet.mount_revision)
        };
        if state != TabletState::Mounted {
            return Ok(());
        }
        {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = TabletState::Freezing;
            tablet.expected_state = TabletState::Frozen;
        }
        self.mailboxes.post(
            cell.expect("mounted tablet has a cell"),
            CellRequest::FreezeTablet {
                tablet_id,
                mount_revision: revision,
            },
        );
        Ok(())
    }

    fn post_action_unmount(&mut self, tablet_id: TabletId) -> TabletResult<()> {
        let (cell, revision) = {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = TabletState::Unmounting;
            tablet.expected_state = TabletState::Unmounted;
            (tablet.cell, tablet.mount_revision)
        };
        self.mailboxes.post(
            cell.expect("tablet being unmounted has a cell"),
            CellRequest::UnmountTablet {
                tablet_id,
                mount_revision: revision,
                force: false,
            },
        );
        Ok(())
    }

    /// The Unmounted → Mounting edge. Returns `Ok(true)` when mounting
    /// started; flips to Orphaned when no healthy cell exists.
    fn try_mount_action_tablets(
        &mut self,
        action_id: ActionId,
        random_seed: u64,
    ) -> TabletResult<bool> {
        let (tablets, target_cells, freeze, owner_id) = {
            let action = self.catalog.action(action_id)?;
            let owner_id = self.catalog.tablet(action.tablets[0])?.owner;
            (
                action.tablets.clone(),
                action.target_cells.clone(),
                action.freeze_on_mount,
                owner_id,
            )
        };
        let targets = CellTargets {
            target_cells: (!target_cells.is_empty()).then_some(target_cells),
            hint_cell: None,
        };
        match self.assign_cells(owner_id, &tablets, &targets, random_seed) {
            Ok(assignment) => {
                let revision = self.bump_revision();
                for (tablet_id, cell_id) in assignment {
                    self.mount_tablet_to_cell(tablet_id, cell_id, freeze, revision)?;
                }
                self.set_action_state(action_id, ActionState::Mounting)?;
                Ok(true)
            },
            Err(TabletError::NoHealthyCell) => {
                warn!(%action_id, "no healthy cell, action orphaned");
                self.set_action_state(action_id, ActionState::Orphaned)?;
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    /// Applies the reshard to an action's (unmounted) tablet group and
    /// relinks the action onto the replacement tablets.
    fn reshard_action_tablets(
        &mut self,
        action_id: ActionId,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        let (tablets, pivot_keys, tablet_count) = {
            let action = self.catalog.action(action_id)?;
            (
                action.tablets.clone(),
                action.pivot_keys.clone(),
                action.tablet_count,
            )
        };
        let owner_id = self.catalog.tablet(tablets[0])?.owner;
        let first = tablets
            .iter()
            .map(|id| self.catalog.tablet(*id).map(|t| t.index))
            .collect::<TabletResult<Vec<_>>>()?
            .into_iter()
            .min()
            .expect("action has tablets");
        let last = first + tablets.len() - 1;

        // Detach so the direct reshard does not see the action as
        // interference against itself.
        for tablet_id in &tablets {
            self.catalog.tablet_mut(*tablet_id)?.action = None;
        }
        let new_tablets = self.reshard_table(
            owner_id,
            Some(first),
            Some(last),
            pivot_keys,
            tablet_count,
            now,
            random_seed,
        )?;
        for tablet_id in &new_tablets {
            self.catalog.tablet_mut(*tablet_id)?.action = Some(action_id);
        }
        let action = self.catalog.action_mut(action_id)?;
        action.prior_cells = vec![None; new_tablets.len()];
        action.prior_states = vec![TabletState::Unmounted; new_tablets.len()];
        action.tablets = new_tablets;
        Ok(())
    }

    /// Marks the action failing, rolls its tablets back towards their
    /// pre-action state, and finishes in Failed.
    pub fn fail_action(&mut self, action_id: ActionId, reason: &str, now: u64, _random_seed: u64) {
        let Ok(action) = self.catalog.action(action_id) else {
            return;
        };
        if action.is_finished() || action.state == ActionState::Failing {
            return;
        }
        warn!(%action_id, reason, "tablet action failing");
        {
            let action = self
                .catalog
                .action_mut(action_id)
                .expect("action exists, checked above");
            action.state = ActionState::Failing;
            action.error = Some(reason.to_owned());
        }

        let (tablets, prior_cells, prior_states) = {
            let action = self.catalog.action(action_id).expect("action exists");
            (
                action.tablets.clone(),
                action.prior_cells.clone(),
                action.prior_states.clone(),
            )
        };
        for ((tablet_id, prior_cell), prior_state) in tablets
            .iter()
            .zip(prior_cells.iter())
            .zip(prior_states.iter())
        {
            if let Ok(tablet) = self.catalog.tablet_mut(*tablet_id) {
                tablet.action = None;
            } else {
                continue;
            }
            let state = self.catalog.tablet(*tablet_id).expect("checked above").state;
            match state {
                // Frozen by the action while it used to serve: thaw it.
                TabletState::Frozen if *prior_state == TabletState::Mounted => {
                    let _ = self.rollback_unfreeze(*tablet_id);
                },
                // Unmounted by the action: put it back where it was.
                TabletState::Unmounted => {
                    if let Some(cell_id) = prior_cell {
                        let healthy = self
                            .catalog
                            .cell(*cell_id)
                            .map(|c| c.is_healthy())
                            .unwrap_or(false);
                        if healthy && *prior_state != TabletState::Unmounted {
                            let revision = self.bump_revision();
                            let freeze = *prior_state == TabletState::Frozen;
                            let _ =
                                self.mount_tablet_to_cell(*tablet_id, *cell_id, freeze, revision);
                        }
                    }
                },
                // Mid-transition: the pending notification settles it.
                _ => {},
            }
        }

        let action = self.catalog.action_mut(action_id).expect("action exists");
        action.state = ActionState::Failed;
        action.expires_at = Some(now + action.expiration_timeout);
    }

    fn rollback_unfreeze(&mut self, tablet_id: TabletId) -> TabletResult<()> {
        let (cell, revision) = {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = TabletState::Unfreezing;
            tablet.expected_state = TabletState::Mounted;
            (tablet.cell, tablet.mount_revision)
        };
        let store_id = crate::ids::DynamicStoreId(self.catalog.ids.next_raw());
        self.mailboxes.post(
            cell.expect("frozen tablet has a cell"),
            CellRequest::UnfreezeTablet {
                tablet_id,
                mount_revision: revision,
                dynamic_store_ids: vec![store_id],
            },
        );
        Ok(())
    }

    /// Re-attempts the mount step of every orphaned action; called when a
    /// cell turns healthy.
    pub fn kick_orphaned_actions(&mut self, now: u64, random_seed: u64) {
        let orphaned: Vec<ActionId> = self
            .catalog
            .tablet_actions
            .values()
            .filter(|a| a.state == ActionState::Orphaned)
            .map(|a| a.id)
            .collect();
        for action_id in orphaned {
            info!(%action_id, "kicking orphaned action");
            self.touch_action(action_id, now, random_seed);
        }
    }

    /// Removes terminal actions whose linger period has passed.
    pub fn sweep_expired_actions(&mut self, now: u64) {
        let expired: Vec<ActionId> = self
            .catalog
            .tablet_actions
            .values()
            .filter(|a| a.is_finished() && a.expires_at.is_some_and(|at| at <= now))
            .map(|a| a.id)
            .collect();
        for action_id in expired {
            info!(%action_id, "expired tablet action destroyed");
            self.catalog.tablet_actions.remove(&action_id);
        }
    }

    /// Ids of tablets currently parked behind orphaned actions.
    pub fn orphaned_tablets(&self) -> BTreeSet<TabletId> {
        self.catalog
            .tablet_actions
            .values()
            .filter(|a| a.state == ActionState::Orphaned)
            .flat_map(|a| a.tablets.iter().copied())
            .collect()
    }
}
