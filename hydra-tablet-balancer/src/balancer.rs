// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The balancer driver. Lives in its own scheduling domain: each
//! iteration fetches bundle snapshots, runs the heuristics, and submits
//! the proposals as tablet actions through the sink. It never mutates
//! the catalog directly; the sink realizes every proposal as a
//! replicated master mutation.

use crate::{
    balancing::{balance_via_move, balance_via_reshard},
    bundle_state::BundleSnapshot,
};
use async_trait::async_trait;
use hydra_config::TabletBalancerConfig;
use hydra_tablet_manager::ActionSpec;
use parking_lot::Mutex;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Instant,
};
use tracing::{debug, info, warn};

/// Where proposals go: the master realizes each spec as a replicated
/// `CreateTabletAction` mutation.
#[async_trait]
pub trait ActionSink: Send + Sync {
    async fn submit(&self, bundle: &str, action: ActionSpec);
}

/// Source of per-iteration bundle snapshots.
#[async_trait]
pub trait BundleProvider: Send + Sync {
    async fn list_bundles(&self) -> Vec<String>;

    async fn fetch(&self, bundle: &str) -> Option<BundleSnapshot>;
}

struct IterationState {
    /// Bundles resharded last time get their moves this time.
    move_on_next_iteration: BTreeSet<String>,
    last_balanced: HashMap<String, Instant>,
    iteration_index: u64,
}

pub struct TabletBalancer {
    config: TabletBalancerConfig,
    provider: Arc<dyn BundleProvider>,
    sink: Arc<dyn ActionSink>,
    state: Mutex<IterationState>,
}

impl TabletBalancer {
    pub fn new(
        config: TabletBalancerConfig,
        provider: Arc<dyn BundleProvider>,
        sink: Arc<dyn ActionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            provider,
            sink,
            state: Mutex::new(IterationState {
                move_on_next_iteration: BTreeSet::new(),
                last_balanced: HashMap::new(),
                iteration_index: 0,
            }),
        })
    }

    /// Spawns the periodic loop; stops when the returned handle is
    /// aborted or the process exits.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        info!("starting tablet balancer instance");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.period);
            loop {
                interval.tick().await;
                this.balancer_iteration().await;
            }
        })
    }

    pub async fn balancer_iteration(&self) {
        if !self.config.enable {
            debug!("tablet balancer is not enabled");
            return;
        }
        let index = {
            let mut state = self.state.lock();
            state.iteration_index += 1;
            state.iteration_index
        };
        info!(iteration_index = index, "balancer iteration");

        for bundle_name in self.provider.list_bundles().await {
            let Some(bundle) = self.provider.fetch(&bundle_name).await else {
                warn!(bundle = %bundle_name, "failed to fetch bundle, skipping");
                continue;
            };
            if let Err(reason) = self.check_balancing_allowed(&bundle) {
                debug!(bundle = %bundle_name, reason, "skipping balancing iteration");
                continue;
            }

            let do_move = {
                let mut state = self.state.lock();
                if state.move_on_next_iteration.remove(&bundle_name) {
                    true
                } else {
                    state.move_on_next_iteration.insert(bundle_name.clone());
                    state.last_balanced.insert(bundle_name.clone(), Instant::now());
                    false
                }
            };

            let actions = if do_move {
                balance_via_move(&bundle)
            } else {
                balance_via_reshard(&bundle)
            };
            info!(
                bundle = %bundle_name,
                action_count = actions.len(),
                via = if do_move { "move" } else { "reshard" },
                "balancing pass finished"
            );
            for action in actions {
                self.sink.submit(&bundle_name, action).await;
            }
        }
    }

    fn check_balancing_allowed(&self, bundle: &BundleSnapshot) -> Result<(), &'static str> {
        if !bundle.config.enable {
            return Err("disabled by bundle config");
        }
        if bundle.has_unfinished_actions {
            return Err("bundle has unfinished actions");
        }
        if !bundle.healthy() {
            return Err("bundle has unhealthy cells");
        }
        let state = self.state.lock();
        if let Some(last) = state.last_balanced.get(&bundle.name) {
            if last.elapsed() < self.config.min_balance_interval
                && !state.move_on_next_iteration.contains(&bundle.name)
            {
                return Err("balanced too recently");
            }
        }
        Ok(())
    }
}
