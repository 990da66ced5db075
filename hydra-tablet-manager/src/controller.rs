// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The tablet lifecycle controller. Every public operation is two-phase:
//! `prepare_*` validates against the catalog and touches nothing,
//! `execute` mutates the catalog and posts idempotent messages to cell
//! mailboxes. Notifications from cells reconcile observed state back in
//! and advance any tablet action the tablet participates in.
//!
//! Everything here runs as replicated master mutations: inputs carry
//! their own timestamps and random seeds, and nothing reads the ambient
//! environment.

use crate::{
    catalog::TabletCatalog,
    error::{TabletError, TabletResult},
    ids::{ActionId, CellId, DynamicStoreId, OwnerId, ReplicaId, TabletId, TransactionId},
    mailbox::MailboxRegistry,
    messages::CellRequest,
    reshard,
    table_replica::TableReplica,
    tablet_action::TabletAction,
    tablet_cell::CellStatistics,
    types::{
        ActionKind, ActionState, Atomicity, CellHealth, OwnerKind, PivotKey, ReplicaMode,
        ReplicaState, TabletState, UpdateMode,
    },
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::collections::BTreeSet;
use tracing::{debug, info};

const USER_INTERFERENCE: &str = "user request interfered";

/// Placement request for a group of tablets.
#[derive(Clone, Debug, Default)]
pub struct CellTargets {
    /// Exact bijection onto these cells.
    pub target_cells: Option<Vec<CellId>>,
    /// Everything onto this one cell.
    pub hint_cell: Option<CellId>,
}

pub struct TabletManager {
    pub catalog: TabletCatalog,
    pub mailboxes: MailboxRegistry,
    mutation_revision: u64,
}

impl Default for TabletManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TabletManager {
    pub fn new() -> Self {
        Self {
            catalog: TabletCatalog::default(),
            mailboxes: MailboxRegistry::default(),
            mutation_revision: 0,
        }
    }

    /// Reassembles a manager from its persisted parts.
    pub fn restore(
        catalog: TabletCatalog,
        mailboxes: MailboxRegistry,
        mutation_revision: u64,
    ) -> Self {
        Self {
            catalog,
            mailboxes,
            mutation_revision,
        }
    }

    pub fn mutation_revision(&self) -> u64 {
        self.mutation_revision
    }

    pub(crate) fn bump_revision(&mut self) -> u64 {
        self.mutation_revision += 1;
        self.mutation_revision
    }

    fn resolve_range(
        &self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
    ) -> TabletResult<(usize, usize)> {
        let owner = self.catalog.owner(owner_id)?;
        let count = owner.tablets.len();
        let first = first.unwrap_or(0);
        let last = last.unwrap_or(count.saturating_sub(1));
        if first > last || last >= count {
            return Err(TabletError::InvalidTabletRange { first, last, count });
        }
        Ok((first, last))
    }

    fn range_tablets(
        &self,
        owner_id: OwnerId,
        first: usize,
        last: usize,
    ) -> TabletResult<Vec<TabletId>> {
        Ok(self.catalog.owner(owner_id)?.tablets[first..=last].to_vec())
    }

    /// User operations interrupt any action their tablets take part in.
    fn fail_interfering_actions(&mut self, tablets: &[TabletId], now: u64, random_seed: u64) {
        let mut actions = BTreeSet::new();
        for tablet_id in tablets {
            if let Ok(tablet) = self.catalog.tablet(*tablet_id) {
                if let Some(action_id) = tablet.action {
                    actions.insert(action_id);
                }
            }
        }
        for action_id in actions {
            self.fail_action(action_id, USER_INTERFERENCE, now, random_seed);
        }
    }

    // ------------------------------------------------------------------
    // Mount

    pub fn prepare_mount(
        &self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        targets: &CellTargets,
    ) -> TabletResult<()> {
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let owner_bundle = self.catalog.owner(owner_id)?.bundle;
        let tablets = self.range_tablets(owner_id, first, last)?;

        let unmounted = tablets
            .iter()
            .filter(|id| {
                self.catalog
                    .tablet(**id)
                    .map(|t| t.state == TabletState::Unmounted)
                    .unwrap_or(false)
            })
            .count();
        for tablet_id in &tablets {
            let tablet = self.catalog.tablet(*tablet_id)?;
            if tablet.state.is_transient() {
                return Err(TabletError::InvalidTabletState {
                    tablet: *tablet_id,
                    state: tablet.state.to_string(),
                    expected: "a settled state".to_owned(),
                });
            }
        }

        if let Some(target_cells) = &targets.target_cells {
            if target_cells.len() != unmounted {
                return Err(TabletError::invalid_argument(format!(
                    "{} target cells for {} tablets to assign",
                    target_cells.len(),
                    unmounted
                )));
            }
            for cell_id in target_cells {
                let cell = self.catalog.cell(*cell_id)?;
                if cell.bundle != owner_bundle {
                    return Err(TabletError::CellNotInBundle {
                        cell: *cell_id,
                        bundle: format!("{}", owner_bundle),
                    });
                }
            }
        }
        if let Some(hint) = targets.hint_cell {
            let cell = self.catalog.cell(hint)?;
            if cell.bundle != owner_bundle {
                return Err(TabletError::CellNotInBundle {
                    cell: hint,
                    bundle: format!("{}", owner_bundle),
                });
            }
        }
        Ok(())
    }

    pub fn execute_mount(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        targets: &CellTargets,
        freeze: bool,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let tablets = self.range_tablets(owner_id, first, last)?;
        self.fail_interfering_actions(&tablets, now, random_seed);

        let to_assign: Vec<TabletId> = tablets
            .iter()
            .copied()
            .filter(|id| {
                self.catalog
                    .tablet(*id)
                    .map(|t| t.state == TabletState::Unmounted)
                    .unwrap_or(false)
            })
            .collect();
        if to_assign.is_empty() {
            return Ok(());
        }

        match self.assign_cells(owner_id, &to_assign, targets, random_seed) {
            Ok(assignment) => {
                let revision = self.bump_revision();
                for (tablet_id, cell_id) in assignment {
                    self.mount_tablet_to_cell(tablet_id, cell_id, freeze, revision)?;
                }
                Ok(())
            },
            Err(TabletError::NoHealthyCell) => {
                // Park the mount as an orphaned action; it gets kicked as
                // soon as a healthy cell shows up.
                let action_id = ActionId(self.catalog.ids.next_raw());
                info!(%action_id, owner = %owner_id, "no healthy cell, parking mount as orphaned action");
                let prior_cells = vec![None; to_assign.len()];
                let prior_states = vec![TabletState::Unmounted; to_assign.len()];
                for tablet_id in &to_assign {
                    self.catalog.tablet_mut(*tablet_id)?.action = Some(action_id);
                }
                self.catalog.tablet_actions.insert(
                    action_id,
                    TabletAction {
                        id: action_id,
                        kind: ActionKind::Move,
                        state: ActionState::Orphaned,
                        tablets: to_assign,
                        target_cells: Vec::new(),
                        pivot_keys: None,
                        tablet_count: None,
                        prior_cells,
                        prior_states,
                        freeze_on_mount: freeze,
                        created_at: now,
                        expiration_timeout: 0,
                        expires_at: None,
                        error: None,
                    },
                );
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Convenience wrapper running both phases, the way the operator
    /// surface does.
    #[allow(clippy::too_many_arguments)]
    pub fn mount_table(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        targets: CellTargets,
        freeze: bool,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        self.prepare_mount(owner_id, first, last, &targets)?;
        self.execute_mount(owner_id, first, last, &targets, freeze, now, random_seed)
    }

    pub(crate) fn mount_tablet_to_cell(
        &mut self,
        tablet_id: TabletId,
        cell_id: CellId,
        freeze: bool,
        revision: u64,
    ) -> TabletResult<()> {
        let owner_id = self.catalog.tablet(tablet_id)?.owner;
        let owner = self.catalog.owner(owner_id)?;
        let settings = owner.mount_settings.clone();
        let replicas: Vec<ReplicaId> = owner.replicas.iter().copied().collect();
        let index = self.catalog.tablet(tablet_id)?.index;
        let next_pivot_key = if owner.is_sorted() {
            owner
                .tablets
                .get(index + 1)
                .and_then(|id| self.catalog.tablet(*id).ok())
                .map(|t| t.pivot_key.clone())
        } else {
            None
        };

        {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = if freeze {
                TabletState::FrozenMounting
            } else {
                TabletState::Mounting
            };
            tablet.expected_state = if freeze {
                TabletState::Frozen
            } else {
                TabletState::Mounted
            };
            tablet.cell = Some(cell_id);
            tablet.mount_revision = revision;
            tablet.force_unmount_revision = None;
        }
        self.catalog.cell_mut(cell_id)?.hosted_tablets.insert(tablet_id);

        let tablet = self.catalog.tablet(tablet_id)?;
        let request = CellRequest::MountTablet {
            tablet_id,
            mount_revision: revision,
            settings,
            pivot_key: tablet.pivot_key.clone(),
            next_pivot_key,
            stores: tablet.chunks.iter().map(|c| c.id).collect(),
            replicas,
            freeze,
            upstream_replica: None,
            dynamic_store_ids: Vec::new(),
        };
        self.mailboxes.post(cell_id, request);
        debug!(%tablet_id, %cell_id, revision, freeze, "tablet mount issued");
        Ok(())
    }

    /// Size-aware greedy placement: heaviest tablets first, each onto the
    /// cell with the smallest running total.
    pub(crate) fn assign_cells(
        &mut self,
        owner_id: OwnerId,
        tablets: &[TabletId],
        targets: &CellTargets,
        random_seed: u64,
    ) -> TabletResult<Vec<(TabletId, CellId)>> {
        if let Some(target_cells) = &targets.target_cells {
            if target_cells.len() != tablets.len() {
                return Err(TabletError::invalid_argument(format!(
                    "{} target cells for {} tablets",
                    target_cells.len(),
                    tablets.len()
                )));
            }
            return Ok(tablets.iter().copied().zip(target_cells.iter().copied()).collect());
        }
        if let Some(hint) = targets.hint_cell {
            self.catalog.cell(hint)?;
            return Ok(tablets.iter().map(|t| (*t, hint)).collect());
        }

        let owner = self.catalog.owner(owner_id)?;
        let in_memory = owner.mount_settings.in_memory;
        let bundle = owner.bundle;
        let healthy: Vec<CellId> = self
            .catalog
            .bundles
            .get(&bundle)
            .map(|b| b.cells.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .filter(|id| self.catalog.cell(*id).map(|c| c.is_healthy()).unwrap_or(false))
            .collect();
        if healthy.is_empty() {
            return Err(TabletError::NoHealthyCell);
        }

        let mut rng = StdRng::seed_from_u64(random_seed);
        let mut sized: Vec<(u64, TabletId)> = tablets
            .iter()
            .map(|id| {
                let size = if in_memory {
                    self.catalog.tablet(*id).map(|t| t.data_size()).unwrap_or(0)
                } else {
                    // Non-in-memory tablets are placed by count; the
                    // random key breaks ties deterministically.
                    rng.r#gen::<u32>() as u64
                };
                (size, *id)
            })
            .collect();
        sized.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        // Running totals seed from the cells' reported memory footprints.
        let mut load: BTreeSet<(u64, CellId)> = healthy
            .iter()
            .map(|id| {
                let base = self
                    .catalog
                    .cell(*id)
                    .map(|c| c.statistics.memory_size)
                    .unwrap_or(0);
                (base, *id)
            })
            .collect();

        let mut assignment = Vec::with_capacity(sized.len());
        for (size, tablet_id) in sized {
            let (total, cell_id) = load.iter().next().copied().expect("healthy cells exist");
            load.remove(&(total, cell_id));
            load.insert((total + size + 1, cell_id));
            assignment.push((tablet_id, cell_id));
        }
        Ok(assignment)
    }

    // ------------------------------------------------------------------
    // Unmount / freeze / unfreeze / remount

    /// Unmount is legal from any state: it supersedes whatever transition
    /// is in flight, so validation only checks the range.
    pub fn prepare_unmount(
        &self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        _force: bool,
    ) -> TabletResult<()> {
        self.resolve_range(owner_id, first, last)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn unmount_table(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        force: bool,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        self.prepare_unmount(owner_id, first, last, force)?;
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let tablets = self.range_tablets(owner_id, first, last)?;
        self.fail_interfering_actions(&tablets, now, random_seed);

        for tablet_id in tablets {
            self.unmount_tablet(tablet_id, force)?;
        }
        Ok(())
    }

    fn unmount_tablet(&mut self, tablet_id: TabletId, force: bool) -> TabletResult<()> {
        let (state, cell, revision) = {
            let tablet = self.catalog.tablet(tablet_id)?;
            (tablet.state, tablet.cell, tablet.mount_revision)
        };
        if state == TabletState::Unmounted {
            return Ok(());
        }
        let Some(cell_id) = cell else {
            return Ok(());
        };

        if force {
            // Forced unmount detaches immediately; the cell is told to
            // clean up, and any notification it still sends for the old
            // incarnation is alerted on, not applied.
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = TabletState::Unmounted;
            tablet.expected_state = TabletState::Unmounted;
            tablet.cell = None;
            tablet.force_unmount_revision = Some(revision);
            self.catalog.cell_mut(cell_id)?.hosted_tablets.remove(&tablet_id);
        } else {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = TabletState::Unmounting;
            tablet.expected_state = TabletState::Unmounted;
        }
        self.mailboxes.post(
            cell_id,
            CellRequest::UnmountTablet {
                tablet_id,
                mount_revision: revision,
                force,
            },
        );
        debug!(%tablet_id, %cell_id, force, "tablet unmount issued");
        Ok(())
    }

    pub fn freeze_table(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let tablets = self.range_tablets(owner_id, first, last)?;
        for tablet_id in &tablets {
            let tablet = self.catalog.tablet(*tablet_id)?;
            if !matches!(
                tablet.state,
                TabletState::Mounted | TabletState::Frozen | TabletState::Freezing
            ) {
                return Err(TabletError::InvalidTabletState {
                    tablet: *tablet_id,
                    state: tablet.state.to_string(),
                    expected: "Mounted or Frozen".to_owned(),
                });
            }
        }
        self.fail_interfering_actions(&tablets, now, random_seed);
        for tablet_id in tablets {
            self.freeze_tablet(tablet_id)?;
        }
        Ok(())
    }

    fn freeze_tablet(&mut self, tablet_id: TabletId) -> TabletResult<()> {
        let (state, cell, revision) = {
            let tablet = self.catalog.tablet(tablet_id)?;
            (tablet.state, tablet.cell, tablet.mount_revision)
        };
        if state != TabletState::Mounted {
            return Ok(());
        }
        let cell_id = cell.expect("mounted tablet has a cell");
        {
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.state = TabletState::Freezing;
            tablet.expected_state = TabletState::Frozen;
        }
        self.mailboxes.post(
            cell_id,
            CellRequest::FreezeTablet {
                tablet_id,
                mount_revision: revision,
            },
        );
        Ok(())
    }

    pub fn unfreeze_table(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let tablets = self.range_tablets(owner_id, first, last)?;
        for tablet_id in &tablets {
            let tablet = self.catalog.tablet(*tablet_id)?;
            if !matches!(
                tablet.state,
                TabletState::Frozen | TabletState::Mounted | TabletState::Unfreezing
            ) {
                return Err(TabletError::InvalidTabletState {
                    tablet: *tablet_id,
                    state: tablet.state.to_string(),
                    expected: "Frozen or Mounted".to_owned(),
                });
            }
        }
        self.fail_interfering_actions(&tablets, now, random_seed);
        for tablet_id in tablets {
            let (state, cell, revision) = {
                let tablet = self.catalog.tablet(tablet_id)?;
                (tablet.state, tablet.cell, tablet.mount_revision)
            };
            if state != TabletState::Frozen {
                continue;
            }
            let cell_id = cell.expect("frozen tablet has a cell");
            {
                let tablet = self.catalog.tablet_mut(tablet_id)?;
                tablet.state = TabletState::Unfreezing;
                tablet.expected_state = TabletState::Mounted;
            }
            let store_id = DynamicStoreId(self.catalog.ids.next_raw());
            self.mailboxes.post(
                cell_id,
                CellRequest::UnfreezeTablet {
                    tablet_id,
                    mount_revision: revision,
                    dynamic_store_ids: vec![store_id],
                },
            );
        }
        Ok(())
    }

    pub fn remount_table(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
    ) -> TabletResult<()> {
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let settings = self.catalog.owner(owner_id)?.mount_settings.clone();
        for tablet_id in self.range_tablets(owner_id, first, last)? {
            let tablet = self.catalog.tablet(tablet_id)?;
            if !tablet.state.is_mounted() {
                continue;
            }
            let cell_id = tablet.cell.expect("mounted tablet has a cell");
            let revision = tablet.mount_revision;
            self.mailboxes.post(
                cell_id,
                CellRequest::RemountTablet {
                    tablet_id,
                    mount_revision: revision,
                    settings: settings.clone(),
                },
            );
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locks

    pub fn lock_tablet(
        &mut self,
        tablet_id: TabletId,
        transaction_id: TransactionId,
        timestamp: u64,
    ) -> TabletResult<()> {
        let tablet = self.catalog.tablet(tablet_id)?;
        let Some(cell_id) = tablet.cell else {
            return Err(TabletError::InvalidTabletState {
                tablet: tablet_id,
                state: tablet.state.to_string(),
                expected: "a mounted state".to_owned(),
            });
        };
        let revision = tablet.mount_revision;
        self.mailboxes.post(
            cell_id,
            CellRequest::LockTablet {
                tablet_id,
                mount_revision: revision,
                transaction_id,
                timestamp,
            },
        );
        Ok(())
    }

    pub fn unlock_tablet(
        &mut self,
        tablet_id: TabletId,
        transaction_id: TransactionId,
        commit_timestamp: u64,
        update_mode: UpdateMode,
        stores_to_add: Vec<crate::ids::ChunkId>,
    ) -> TabletResult<()> {
        let tablet = self.catalog.tablet(tablet_id)?;
        let Some(cell_id) = tablet.cell else {
            return Err(TabletError::InvalidTabletState {
                tablet: tablet_id,
                state: tablet.state.to_string(),
                expected: "a mounted state".to_owned(),
            });
        };
        let revision = tablet.mount_revision;
        self.mailboxes.post(
            cell_id,
            CellRequest::UnlockTablet {
                tablet_id,
                mount_revision: revision,
                transaction_id,
                commit_timestamp,
                update_mode,
                stores_to_add,
            },
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reshard (direct, on unmounted tablets)

    pub fn prepare_reshard(
        &self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        pivot_keys: Option<&[PivotKey]>,
        tablet_count: Option<usize>,
    ) -> TabletResult<()> {
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let owner = self.catalog.owner(owner_id)?;
        for tablet_id in self.range_tablets(owner_id, first, last)? {
            let tablet = self.catalog.tablet(tablet_id)?;
            if tablet.state != TabletState::Unmounted {
                return Err(TabletError::InvalidTabletState {
                    tablet: tablet_id,
                    state: tablet.state.to_string(),
                    expected: "Unmounted".to_owned(),
                });
            }
        }
        match owner.kind {
            OwnerKind::SortedTable | OwnerKind::HunkStorage => {
                if pivot_keys.is_none() && tablet_count.is_none() {
                    return Err(TabletError::invalid_argument(
                        "either pivot keys or a tablet count is required",
                    ));
                }
                if let Some(pivots) = pivot_keys {
                    let first_pivot = self
                        .catalog
                        .tablet(owner.tablets[first])?
                        .pivot_key
                        .clone();
                    let upper = owner
                        .tablets
                        .get(last + 1)
                        .and_then(|id| self.catalog.tablet(*id).ok())
                        .map(|t| t.pivot_key.clone());
                    reshard::validate_pivot_keys(pivots, &first_pivot, upper.as_ref())?;
                }
            },
            OwnerKind::OrderedTable => {
                if pivot_keys.is_some() {
                    return Err(TabletError::invalid_argument(
                        "ordered tables take a tablet count, not pivot keys",
                    ));
                }
                if tablet_count.is_none() {
                    return Err(TabletError::invalid_argument("tablet count is required"));
                }
            },
        }
        Ok(())
    }

    /// Rebuilds the tablet list of the range: old tablets are destroyed,
    /// new ones take their place with redistributed chunks; hunk
    /// references bubble up to the owner's hunk root.
    #[allow(clippy::too_many_arguments)]
    pub fn reshard_table(
        &mut self,
        owner_id: OwnerId,
        first: Option<usize>,
        last: Option<usize>,
        pivot_keys: Option<Vec<PivotKey>>,
        tablet_count: Option<usize>,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<Vec<TabletId>> {
        self.prepare_reshard(owner_id, first, last, pivot_keys.as_deref(), tablet_count)?;
        let (first, last) = self.resolve_range(owner_id, first, last)?;
        let old_tablets = self.range_tablets(owner_id, first, last)?;
        self.fail_interfering_actions(&old_tablets, now, random_seed);
        self.bump_revision();

        let sorted = self.catalog.owner(owner_id)?.is_sorted();
        let mut all_chunks = Vec::new();
        for tablet_id in &old_tablets {
            all_chunks.extend(self.catalog.tablet(*tablet_id)?.chunks.clone());
        }

        let (pivots, buckets) = if sorted {
            let first_pivot = self.catalog.tablet(old_tablets[0])?.pivot_key.clone();
            let pivots = match pivot_keys {
                Some(pivots) => pivots,
                None => reshard::compute_pivot_keys(
                    &all_chunks,
                    tablet_count.expect("validated in prepare"),
                    &first_pivot,
                )?,
            };
            let buckets = reshard::distribute_chunks_sorted(all_chunks.clone(), &pivots);
            (pivots, buckets)
        } else {
            let count = tablet_count.expect("validated in prepare");
            let buckets = reshard::distribute_chunks_ordered(all_chunks.clone(), count);
            (vec![PivotKey::MIN; count], buckets)
        };

        // Hunk references discovered in store metadata attach to the root.
        let hunk_refs = reshard::collect_hunk_refs(&all_chunks);
        self.catalog.owner_mut(owner_id)?.hunk_root.extend(hunk_refs);

        // Build replacements, then swap the owner's range.
        let replica_ids: Vec<ReplicaId> =
            self.catalog.owner(owner_id)?.replicas.iter().copied().collect();
        let mut new_tablets = Vec::with_capacity(pivots.len());
        for (offset, (pivot, chunks)) in pivots.into_iter().zip(buckets).enumerate() {
            let tablet_id = self.catalog.create_tablet(owner_id, first + offset, pivot);
            let tablet = self.catalog.tablet_mut(tablet_id)?;
            tablet.chunks = chunks;
            for replica_id in &replica_ids {
                tablet.replicas.insert(*replica_id, Default::default());
            }
            new_tablets.push(tablet_id);
        }

        {
            let owner = self.catalog.owner_mut(owner_id)?;
            owner.tablets.splice(first..=last, new_tablets.iter().copied());
        }
        self.catalog.reindex_owner_tablets(owner_id)?;

        for tablet_id in old_tablets {
            self.catalog.tablet_mut(tablet_id)?.action = None;
            self.catalog.destroy_tablet(tablet_id)?;
        }

        info!(
            owner = %owner_id,
            first,
            last,
            new_count = new_tablets.len(),
            "reshard complete"
        );
        Ok(new_tablets)
    }

    // ------------------------------------------------------------------
    // Owner teardown

    /// Destroying an owner force-unmounts and removes its tablets.
    pub fn destroy_owner(&mut self, owner_id: OwnerId, now: u64, random_seed: u64) -> TabletResult<()> {
        let tablets = self.catalog.owner(owner_id)?.tablets.clone();
        self.fail_interfering_actions(&tablets, now, random_seed);
        for tablet_id in &tablets {
            self.unmount_tablet(*tablet_id, true)?;
        }
        let replicas: Vec<ReplicaId> =
            self.catalog.owner(owner_id)?.replicas.iter().copied().collect();
        for replica_id in replicas {
            self.catalog.table_replicas.remove(&replica_id);
        }
        self.catalog.owner_mut(owner_id)?.tablets.clear();
        for tablet_id in tablets {
            self.catalog.tablet_mut(tablet_id)?.action = None;
            self.catalog.destroy_tablet(tablet_id)?;
        }
        self.catalog.owners.remove(&owner_id);
        info!(owner = %owner_id, "owner destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Table replicas

    pub fn create_table_replica(
        &mut self,
        owner_id: OwnerId,
        cluster_name: impl Into<String>,
        replica_path: impl Into<String>,
        mode: ReplicaMode,
    ) -> TabletResult<ReplicaId> {
        let replica_id = ReplicaId(self.catalog.ids.next_raw());
        let replica = TableReplica::new(replica_id, owner_id, cluster_name, replica_path, mode);
        self.catalog.owner_mut(owner_id)?.replicas.insert(replica_id);
        self.catalog.table_replicas.insert(replica_id, replica);

        let tablets = self.catalog.owner(owner_id)?.tablets.clone();
        for tablet_id in tablets {
            let (mounted, cell, revision) = {
                let tablet = self.catalog.tablet_mut(tablet_id)?;
                tablet.replicas.insert(replica_id, Default::default());
                (tablet.state.is_mounted(), tablet.cell, tablet.mount_revision)
            };
            if mounted {
                self.mailboxes.post(
                    cell.expect("mounted tablet has a cell"),
                    CellRequest::AddTableReplica {
                        tablet_id,
                        mount_revision: revision,
                        replica_id,
                    },
                );
            }
        }
        Ok(replica_id)
    }

    pub fn remove_table_replica(&mut self, replica_id: ReplicaId) -> TabletResult<()> {
        let owner_id = self.catalog.replica(replica_id)?.owner;
        let tablets = self.catalog.owner(owner_id)?.tablets.clone();
        for tablet_id in tablets {
            let (mounted, cell, revision) = {
                let tablet = self.catalog.tablet_mut(tablet_id)?;
                tablet.replicas.remove(&replica_id);
                (tablet.state.is_mounted(), tablet.cell, tablet.mount_revision)
            };
            if mounted {
                self.mailboxes.post(
                    cell.expect("mounted tablet has a cell"),
                    CellRequest::RemoveTableReplica {
                        tablet_id,
                        mount_revision: revision,
                        replica_id,
                    },
                );
            }
        }
        self.catalog.owner_mut(owner_id)?.replicas.remove(&replica_id);
        self.catalog.table_replicas.remove(&replica_id);
        Ok(())
    }

    pub fn alter_table_replica(
        &mut self,
        replica_id: ReplicaId,
        enabled: Option<bool>,
        mode: Option<ReplicaMode>,
        atomicity: Option<Atomicity>,
        preserve_timestamps: Option<bool>,
    ) -> TabletResult<()> {
        let owner_id = {
            let replica = self.catalog.replica_mut(replica_id)?;
            if let Some(mode) = mode {
                replica.mode = mode;
            }
            if let Some(atomicity) = atomicity {
                replica.atomicity = atomicity;
            }
            if let Some(preserve) = preserve_timestamps {
                replica.preserve_timestamps = preserve;
            }
            replica.owner
        };

        let Some(enabled) = enabled else {
            return Ok(());
        };
        let tablets = self.catalog.owner(owner_id)?.tablets.clone();
        let mut transitioning = false;
        for tablet_id in &tablets {
            let (mounted, cell, revision) = {
                let tablet = self.catalog.tablet(*tablet_id)?;
                (tablet.state.is_mounted(), tablet.cell, tablet.mount_revision)
            };
            if !mounted {
                continue;
            }
            transitioning = true;
            if let Some(info) = self.catalog.tablet_mut(*tablet_id)?.replicas.get_mut(&replica_id)
            {
                info.transitioning = true;
            }
            self.mailboxes.post(
                cell.expect("mounted tablet has a cell"),
                CellRequest::AlterTableReplica {
                    tablet_id: *tablet_id,
                    mount_revision: revision,
                    replica_id,
                    enabled: Some(enabled),
                    mode,
                    atomicity,
                    preserve_timestamps,
                },
            );
        }

        let replica = self.catalog.replica_mut(replica_id)?;
        replica.state = match (enabled, transitioning) {
            (true, true) => ReplicaState::Enabling,
            (true, false) => ReplicaState::Enabled,
            (false, true) => ReplicaState::Disabling,
            (false, false) => ReplicaState::Disabled,
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cells

    pub fn set_cell_health(
        &mut self,
        cell_id: CellId,
        health: CellHealth,
        now: u64,
        random_seed: u64,
    ) -> TabletResult<()> {
        self.catalog.cell_mut(cell_id)?.health = health;
        if health == CellHealth::Good {
            self.kick_orphaned_actions(now, random_seed);
        }
        Ok(())
    }

    pub fn report_cell_statistics(
        &mut self,
        cell_id: CellId,
        statistics: CellStatistics,
    ) -> TabletResult<()> {
        self.catalog.cell_mut(cell_id)?.statistics = statistics;
        Ok(())
    }
}
