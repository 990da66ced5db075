// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The follower side of the commit pipeline: accept records in expected
//! order, write them to the local changelog (rotating at segment
//! boundaries), and hand committed prefixes to the automaton.

use crate::{
    cell_manager::CellManager,
    decorated_automaton::{DecoratedAutomaton, PendingMutation},
    epoch::EpochContext,
    error::{HydraError, HydraResult},
};
use bytes::Bytes;
use hydra_config::HydraConfig;
use hydra_storage::{Changelog, ChangelogStore};
use hydra_types::{MutationRecord, SequenceNumber, Version};
use parking_lot::Mutex;
use std::{collections::BTreeMap, collections::VecDeque, sync::Arc};
use tracing::{debug, info, warn};

struct FollowerState {
    logged_sequence_number: SequenceNumber,
    accepted_sequence_number: SequenceNumber,
    self_committed_sequence_number: SequenceNumber,
    accepted: VecDeque<Arc<PendingMutation>>,
    logged: VecDeque<Arc<PendingMutation>>,
    changelog: Option<Arc<dyn Changelog>>,
    /// Changelogs pre-opened by the snapshot protocol, keyed by id.
    next_changelogs: BTreeMap<u32, Arc<dyn Changelog>>,
    logging_mutations: bool,
    stopped: bool,
}

pub struct FollowerCommitter {
    config: Arc<HydraConfig>,
    cell: Arc<CellManager>,
    automaton: Arc<DecoratedAutomaton>,
    epoch: Arc<EpochContext>,
    changelog_store: Arc<dyn ChangelogStore>,
    state: Mutex<FollowerState>,
}

impl FollowerCommitter {
    pub fn new(
        config: Arc<HydraConfig>,
        cell: Arc<CellManager>,
        automaton: Arc<DecoratedAutomaton>,
        epoch: Arc<EpochContext>,
        changelog_store: Arc<dyn ChangelogStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            cell,
            automaton,
            epoch,
            changelog_store,
            state: Mutex::new(FollowerState {
                logged_sequence_number: 0,
                accepted_sequence_number: 0,
                self_committed_sequence_number: 0,
                accepted: VecDeque::new(),
                logged: VecDeque::new(),
                changelog: None,
                next_changelogs: BTreeMap::new(),
                logging_mutations: false,
                stopped: false,
            }),
        })
    }

    /// Recovery handoff: the committer resumes exactly at this sequence
    /// number. Only legal while the queues are empty.
    pub fn set_sequence_number(&self, sequence_number: SequenceNumber) {
        let mut state = self.state.lock();
        debug_assert!(state.accepted.is_empty());
        debug_assert!(state.logged.is_empty());
        state.logged_sequence_number = sequence_number;
        state.accepted_sequence_number = sequence_number;
        state.self_committed_sequence_number = sequence_number;
    }

    pub fn logged_sequence_number(&self) -> SequenceNumber {
        self.state.lock().logged_sequence_number
    }

    pub fn expected_sequence_number(&self) -> SequenceNumber {
        self.state.lock().accepted_sequence_number + 1
    }

    /// Accepts a batch starting at `start_sequence_number`. An
    /// already-accepted prefix is dropped; a batch from the future is
    /// rejected silently, the leader will resend from our reply.
    pub fn accept_mutations(
        self: &Arc<Self>,
        start_sequence_number: SequenceNumber,
        frames: &[Bytes],
    ) -> HydraResult<()> {
        let expected = {
            let state = self.state.lock();
            if state.stopped {
                return Err(HydraError::unavailable("follower committer has stopped"));
            }
            state.accepted_sequence_number + 1
        };
        debug!(
            self_id = self.cell.self_id(),
            expected,
            start_sequence_number,
            mutation_count = frames.len(),
            "trying to accept mutations"
        );
        if expected < start_sequence_number {
            return Ok(());
        }

        let skip = (expected - start_sequence_number) as usize;
        if skip >= frames.len() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            for frame in &frames[skip..] {
                let record = MutationRecord::decode(frame).map_err(|e| {
                    HydraError::invariant(format!("undecodable record from leader: {}", e))
                })?;
                let sequence_number = record.sequence_number();
                if sequence_number != state.accepted_sequence_number + 1 {
                    let error = HydraError::invariant(format!(
                        "record sequence {} does not follow accepted {}",
                        sequence_number, state.accepted_sequence_number
                    ));
                    self.epoch.restart(error.clone());
                    return Err(error);
                }
                state
                    .accepted
                    .push_back(PendingMutation::new(record, frame.clone(), None));
                state.accepted_sequence_number = sequence_number;
            }
        }
        self.schedule_logging();
        Ok(())
    }

    fn schedule_logging(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            // One logging task at a time keeps the logged watermark dense.
            if state.logging_mutations || state.accepted.is_empty() {
                return;
            }
            state.logging_mutations = true;
        }
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(error) = this.run_logging().await {
                this.epoch.restart(error);
            }
        });
    }

    async fn run_logging(self: &Arc<Self>) -> HydraResult<()> {
        loop {
            // Figure out which segment the next record belongs to and
            // rotate to it if needed, before collecting the batch.
            let target_version = {
                let state = self.state.lock();
                match state.accepted.front() {
                    Some(front) => front.version(),
                    None => {
                        break;
                    },
                }
            };
            let current_id = self.state.lock().changelog.as_ref().map(|c| c.id());
            if current_id != Some(target_version.segment_id) {
                self.prepare_next_changelog(target_version).await?;
            }

            let (changelog, frames, first, last) = {
                let mut state = self.state.lock();
                let changelog = state.changelog.clone().expect("changelog prepared above");
                let mut frames = Vec::new();
                let mut first = None;
                let mut last = 0;
                while frames.len() < self.config.max_logged_mutations_per_request {
                    let Some(front) = state.accepted.front() else {
                        break;
                    };
                    if front.version().segment_id != changelog.id() {
                        break;
                    }
                    let mutation = state.accepted.pop_front().expect("front exists");
                    let sequence_number = mutation.sequence_number();
                    if let Some(first) = first {
                        debug_assert_eq!(sequence_number, first + frames.len() as u64);
                    } else {
                        first = Some(sequence_number);
                    }
                    last = sequence_number;
                    frames.push(mutation.frame.clone());
                    state.logged.push_back(mutation);
                }
                (changelog, frames, first, last)
            };

            let Some(first) = first else {
                break;
            };

            debug!(first, last, "logging mutations at follower");
            changelog
                .append(frames)
                .await
                .map_err(|e| HydraError::logging_failed(format!("{}", e)))?;

            {
                let mut state = self.state.lock();
                if state.logged_sequence_number != first - 1 {
                    return Err(HydraError::invariant(format!(
                        "logged watermark {} is not contiguous with batch starting at {}",
                        state.logged_sequence_number, first
                    )));
                }
                state.logged_sequence_number = last;
            }
            debug!(first, last, "mutations logged at follower");
        }

        self.state.lock().logging_mutations = false;
        // Records may have been accepted while the flag was still set.
        if !self.state.lock().accepted.is_empty() {
            self.schedule_logging();
        }
        Ok(())
    }

    async fn prepare_next_changelog(&self, version: Version) -> HydraResult<()> {
        info!(version = %version, "preparing changelog");
        let changelog_id = version.segment_id;
        {
            let state = self.state.lock();
            if let Some(changelog) = &state.changelog {
                if changelog.id() >= changelog_id {
                    return Err(HydraError::invariant(format!(
                        "rotation to changelog {} cannot follow {}",
                        changelog_id,
                        changelog.id()
                    )));
                }
                // A new segment always starts at its first record; joining
                // an existing quorum mid-segment is the only exception and
                // then there is no current changelog yet.
                if version.record_id != 0 {
                    return Err(HydraError::invariant(format!(
                        "mid-stream rotation to {} must start at record 0",
                        version
                    )));
                }
            }
        }

        let registered = {
            let mut state = self.state.lock();
            let stale: Vec<u32> = state
                .next_changelogs
                .range(..changelog_id)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                state.next_changelogs.remove(&id);
            }
            state.next_changelogs.remove(&changelog_id)
        };

        let next = if let Some(changelog) = registered {
            info!(changelog_id, "changelog found in next changelogs");
            changelog
        } else if let Some(changelog) = self
            .changelog_store
            .try_open(changelog_id)
            .await
            .map_err(HydraError::from)?
        {
            let had_current = self.state.lock().changelog.is_some();
            if had_current && changelog.record_count() != 0 {
                warn!(
                    changelog_id,
                    record_count = changelog.record_count(),
                    "changelog opened for rotation but it is not empty"
                );
                return Err(HydraError::invariant(format!(
                    "rotation target changelog {} already has records",
                    changelog_id
                )));
            }
            changelog
        } else {
            info!(changelog_id, "cannot open changelog, creating");
            self.changelog_store
                .create(changelog_id)
                .await
                .map_err(HydraError::from)?
        };

        let old = {
            let mut state = self.state.lock();
            state.changelog.replace(next)
        };
        if let Some(old) = old {
            if self.config.close_changelogs {
                tokio::spawn(async move {
                    let _ = old.close().await;
                });
            }
        }
        Ok(())
    }

    /// Pre-opens the changelog the next rotation will switch to.
    pub fn register_next_changelog(
        &self,
        id: u32,
        changelog: Arc<dyn Changelog>,
    ) -> HydraResult<()> {
        let mut state = self.state.lock();
        if state.next_changelogs.insert(id, changelog).is_some() {
            return Err(HydraError::invariant(format!(
                "changelog {} registered twice",
                id
            )));
        }
        info!(changelog_id = id, "changelog registered");
        Ok(())
    }

    /// Raises the committed watermark and offloads every logged record at
    /// or below it to the automaton.
    pub fn commit_mutations(&self, committed_sequence_number: SequenceNumber) {
        let batch = {
            let mut state = self.state.lock();
            if committed_sequence_number <= state.self_committed_sequence_number {
                return;
            }
            debug!(
                received = committed_sequence_number,
                current = state.self_committed_sequence_number,
                "committing mutations at follower"
            );
            state.self_committed_sequence_number = committed_sequence_number;

            let mut batch = Vec::new();
            while let Some(front) = state.logged.front() {
                if front.sequence_number() > committed_sequence_number {
                    break;
                }
                batch.push(state.logged.pop_front().expect("front exists"));
            }
            batch
        };
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        if let Err(error) = self.automaton.apply_mutations(batch) {
            self.epoch.restart(error);
            return;
        }
        debug!(mutation_count = count, "mutations committed at follower");
    }

    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let mut to_close: Vec<Arc<dyn Changelog>> =
            state.next_changelogs.values().cloned().collect();
        if let Some(changelog) = state.changelog.take() {
            to_close.push(changelog);
        }
        for changelog in to_close {
            tokio::spawn(async move {
                let _ = changelog.close().await;
            });
        }
        info!("follower committer stopped");
    }
}
