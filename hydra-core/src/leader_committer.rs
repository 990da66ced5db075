// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The leader side of the commit pipeline. Two periodic duties share one
//! tick: serializing freshly drafted mutations into the local changelog,
//! and flushing contiguous record ranges to every follower. Quorum
//! accounting and the distributed-snapshot session both live here.

use crate::{
    cell_manager::CellManager,
    decorated_automaton::{CommitPromise, DecoratedAutomaton, PendingMutation},
    epoch::EpochContext,
    error::{HydraError, HydraResult},
    lease::LeaderLease,
    rpc::{AcceptMutationsRequest, AcceptMutationsResponse, SnapshotRequest},
};
use bytes::Bytes;
use hydra_config::HydraConfig;
use hydra_storage::{Changelog, ChangelogStore, SnapshotParams};
use hydra_types::{
    Checksum, EpochId, MutationHeader, MutationId, MutationRecord, PeerId, ReachableState, Reign,
    SequenceNumber, Version,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A client's not-yet-ordered mutation.
pub struct MutationDraft {
    pub reign: Reign,
    pub mutation_type: String,
    pub payload: Bytes,
    pub mutation_id: Option<MutationId>,
    /// When set, the draft is only valid within this epoch.
    pub epoch_id: Option<EpochId>,
    pub promise: CommitPromise,
}

/// What the leader knows about one peer's log.
#[derive(Copy, Clone, Debug, Default)]
pub struct PeerState {
    /// `None` until the follower has answered its first flush.
    pub next_expected_sequence_number: Option<SequenceNumber>,
    pub last_logged_sequence_number: Option<SequenceNumber>,
}

/// Bookkeeping of the single in-flight distributed snapshot session.
struct SnapshotInfo {
    snapshot_id: u32,
    /// Set once the changelog is acquired and the boundary is known.
    sequence_number: Option<SequenceNumber>,
    checksums: Vec<Option<Checksum>>,
    has_reply: Vec<bool>,
    reply_count: usize,
    promise: Option<oneshot::Sender<HydraResult<u32>>>,
}

/// Checksum map of the last completed distributed snapshot, retained for
/// operator inspection.
#[derive(Clone, Debug)]
pub struct SnapshotChecksums {
    pub snapshot_id: u32,
    pub checksums: Vec<Option<Checksum>>,
}

struct LeaderState {
    changelog: Arc<dyn Changelog>,
    committed_state: ReachableState,
    next_logged_version: Version,
    next_logged_sequence_number: SequenceNumber,
    last_offloaded_sequence_number: SequenceNumber,
    last_random_seed: u64,
    queue: VecDeque<Arc<PendingMutation>>,
    queue_data_size: usize,
    peer_states: Vec<PeerState>,
    last_snapshot_info: Option<SnapshotInfo>,
    last_snapshot_checksums: Option<SnapshotChecksums>,
    acquiring_changelog: bool,
    read_only: bool,
    leader_switch_started: bool,
    stopped: bool,
}

pub struct LeaderCommitter {
    config: Arc<HydraConfig>,
    cell: Arc<CellManager>,
    automaton: Arc<DecoratedAutomaton>,
    lease: Arc<dyn LeaderLease>,
    epoch: Arc<EpochContext>,
    changelog_store: Arc<dyn ChangelogStore>,
    draft_tx: mpsc::UnboundedSender<MutationDraft>,
    draft_rx: Mutex<mpsc::UnboundedReceiver<MutationDraft>>,
    state: Mutex<LeaderState>,
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

impl LeaderCommitter {
    pub fn new(
        config: Arc<HydraConfig>,
        cell: Arc<CellManager>,
        automaton: Arc<DecoratedAutomaton>,
        lease: Arc<dyn LeaderLease>,
        epoch: Arc<EpochContext>,
        changelog_store: Arc<dyn ChangelogStore>,
        changelog: Arc<dyn Changelog>,
        committed_state: ReachableState,
    ) -> Arc<Self> {
        let (draft_tx, draft_rx) = mpsc::unbounded_channel();
        let mut peer_states = vec![PeerState::default(); cell.peer_count()];
        let self_state = &mut peer_states[cell.self_id() as usize];
        self_state.next_expected_sequence_number = Some(committed_state.sequence_number + 1);
        self_state.last_logged_sequence_number = Some(committed_state.sequence_number);

        let next_logged_version = Version::new(changelog.id(), changelog.record_count());
        let state = LeaderState {
            changelog,
            committed_state,
            next_logged_version,
            next_logged_sequence_number: committed_state.sequence_number + 1,
            last_offloaded_sequence_number: committed_state.sequence_number,
            last_random_seed: automaton.random_seed(),
            queue: VecDeque::new(),
            queue_data_size: 0,
            peer_states,
            last_snapshot_info: None,
            last_snapshot_checksums: None,
            acquiring_changelog: false,
            read_only: false,
            leader_switch_started: false,
            stopped: false,
        };
        Arc::new(Self {
            config,
            cell,
            automaton,
            lease,
            epoch,
            changelog_store,
            draft_tx,
            draft_rx: Mutex::new(draft_rx),
            state: Mutex::new(state),
        })
    }

    /// Spawns the periodic serialize/flush loop, scoped to the epoch.
    pub fn start(self: &Arc<Self>) {
        {
            let state = self.state.lock();
            debug_assert_eq!(
                state.committed_state.sequence_number,
                self.automaton.sequence_number()
            );
            info!(
                last_random_seed = format_args!("{:016x}", state.last_random_seed),
                logged_version = %state.next_logged_version,
                "leader committer started"
            );
        }
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.max_commit_batch_delay);
            loop {
                tokio::select! {
                    _ = this.epoch.cancelled() => break,
                    _ = interval.tick() => {
                        this.serialize_mutations();
                        this.flush();
                    },
                }
            }
            this.stop();
        });
    }

    /// Submits one draft. The promise resolves on commit with the
    /// automaton's response, or with a terminal error.
    pub fn commit(self: &Arc<Self>, draft: MutationDraft) {
        let Some(_user_lock) = self.automaton.try_acquire_user_lock() else {
            draft.promise.send(Err(HydraError::unavailable(
                "automaton is locked for a snapshot operation",
            ))).ok();
            return;
        };
        if let Err(mpsc::error::SendError(draft)) = self.draft_tx.send(draft) {
            draft
                .promise
                .send(Err(HydraError::unavailable("leader committer has stopped")))
                .ok();
        }
    }

    /// Sticky: all subsequently serialized drafts are rejected.
    pub fn set_read_only(&self) {
        self.state.lock().read_only = true;
        info!("read-only mode is now active");
    }

    /// Sticky: no further mutation is accepted while the leadership is
    /// being handed over.
    pub fn start_leader_switch(&self) {
        self.state.lock().leader_switch_started = true;
        info!("leader switch started; mutations are no longer accepted");
    }

    pub fn committed_state(&self) -> ReachableState {
        self.state.lock().committed_state
    }

    pub fn logged_version(&self) -> Version {
        self.state.lock().next_logged_version
    }

    pub fn peer_state(&self, peer_id: PeerId) -> PeerState {
        self.state.lock().peer_states[peer_id as usize]
    }

    pub fn last_snapshot_checksums(&self) -> Option<SnapshotChecksums> {
        self.state.lock().last_snapshot_checksums.clone()
    }

    fn serialize_mutations(self: &Arc<Self>) {
        if !self.lease.is_valid() {
            self.epoch
                .restart(HydraError::unavailable("leader lease is no longer valid"));
            return;
        }
        if self.state.lock().leader_switch_started {
            debug!("skipping serialization while leader switch is in progress");
            return;
        }

        let mut drafts = Vec::new();
        {
            let mut draft_rx = self.draft_rx.lock();
            let read_only = self.state.lock().read_only;
            while drafts.len() < self.config.max_commit_batch_record_count {
                let Ok(draft) = draft_rx.try_recv() else {
                    break;
                };
                if read_only {
                    draft.promise.send(Err(HydraError::ReadOnly)).ok();
                    continue;
                }
                if let Some(epoch_id) = draft.epoch_id {
                    if epoch_id != self.epoch.epoch_id {
                        draft
                            .promise
                            .send(Err(HydraError::InvalidEpoch {
                                actual: epoch_id,
                                current: self.epoch.epoch_id,
                            }))
                            .ok();
                        continue;
                    }
                }
                if let Some(mutation_id) = draft.mutation_id {
                    if let Some(kept) = self.automaton.try_begin_kept_request(mutation_id) {
                        debug!(%mutation_id, "draft resolved from kept response");
                        draft.promise.send(Ok(kept)).ok();
                        continue;
                    }
                }
                drafts.push(draft);
            }
        }

        if !drafts.is_empty() {
            self.log_mutations(drafts);
        }
        self.maybe_send_batch();
    }

    fn log_mutations(self: &Arc<Self>, drafts: Vec<MutationDraft>) {
        let timestamp = now_micros();
        let (changelog, frames, first, last) = {
            let mut state = self.state.lock();
            let mut frames = Vec::with_capacity(drafts.len());
            let first = state.next_logged_sequence_number;
            for draft in drafts {
                let random_seed: u64 = rand::random();
                let header = MutationHeader {
                    reign: draft.reign,
                    mutation_type: draft.mutation_type,
                    timestamp,
                    random_seed,
                    prev_random_seed: state.last_random_seed,
                    segment_id: state.next_logged_version.segment_id,
                    record_id: state.next_logged_version.record_id,
                    sequence_number: state.next_logged_sequence_number,
                    term: self.epoch.term,
                    mutation_id: draft.mutation_id,
                };
                let record = MutationRecord {
                    header,
                    payload: draft.payload,
                };
                let frame = match record.encode() {
                    Ok(frame) => frame,
                    Err(e) => {
                        let error =
                            HydraError::logging_failed(format!("record encoding failed: {}", e));
                        draft.promise.send(Err(error.clone())).ok();
                        self.epoch.restart(error);
                        return;
                    },
                };
                let mutation = PendingMutation::new(record, frame.clone(), Some(draft.promise));

                debug!(
                    sequence_number = state.next_logged_sequence_number,
                    version = %state.next_logged_version,
                    random_seed = format_args!("{:016x}", random_seed),
                    "logging mutation at leader"
                );

                if let Some(back) = state.queue.back() {
                    debug_assert_eq!(back.sequence_number() + 1, mutation.sequence_number());
                }
                state.last_random_seed = random_seed;
                state.next_logged_version = state.next_logged_version.advance();
                state.next_logged_sequence_number += 1;
                state.queue_data_size += mutation.data_size();
                state.queue.push_back(mutation);
                frames.push(frame);
            }
            let last = state.next_logged_sequence_number - 1;
            self.maybe_checkpoint(&mut state);
            (state.changelog.clone(), frames, first, last)
        };

        let this = self.clone();
        tokio::spawn(async move {
            let result = changelog.append(frames).await;
            this.on_mutations_logged(first, last, result.map_err(HydraError::from));
        });
    }

    fn on_mutations_logged(
        self: &Arc<Self>,
        first: SequenceNumber,
        last: SequenceNumber,
        result: HydraResult<()>,
    ) {
        if let Err(error) = result {
            self.epoch
                .restart(HydraError::logging_failed(format!("{}", error)));
            return;
        }
        debug!(first, last, "mutations logged at leader");
        let batch = {
            let mut state = self.state.lock();
            let self_id = self.cell.self_id() as usize;
            let self_state = &mut state.peer_states[self_id];
            let logged = self_state.last_logged_sequence_number.unwrap_or(0);
            self_state.last_logged_sequence_number = Some(logged.max(last));
            self.maybe_promote_committed_sequence_number(&mut state)
        };
        self.offload(batch);
    }

    /// Sends every follower its next contiguous range plus the current
    /// committed state; doubles as the liveness ping when there is nothing
    /// to send.
    fn flush(self: &Arc<Self>) {
        struct Outgoing {
            peer_id: PeerId,
            request: AcceptMutationsRequest,
        }

        let mut outgoing = Vec::new();
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            let queue_front = state.queue.front().map(|m| m.sequence_number());
            let queue_back = state.queue.back().map(|m| m.sequence_number());
            let committed_state = state.committed_state;
            let snapshot_request = state.last_snapshot_info.as_ref().and_then(|info| {
                info.sequence_number.map(|sequence_number| SnapshotRequest {
                    snapshot_id: info.snapshot_id,
                    sequence_number,
                })
            });

            for peer_id in self.cell.peer_ids() {
                if peer_id == self.cell.self_id() {
                    continue;
                }
                let peer_state = state.peer_states[peer_id as usize];
                if let (Some(next_expected), Some(front)) =
                    (peer_state.next_expected_sequence_number, queue_front)
                {
                    if next_expected < front {
                        // The follower needs records already evicted from
                        // the queue; only recovery can help it now.
                        let error = format!(
                            "follower {} needs sequence {} that was already lost",
                            peer_id, next_expected
                        );
                        error!(peer_id, next_expected, "requesting follower restart");
                        state.peer_states[peer_id as usize] = PeerState::default();
                        if let Some(channel) = self.cell.channel_to(peer_id) {
                            tokio::spawn(async move {
                                let _ = channel.force_restart(error).await;
                            });
                        }
                        continue;
                    }
                }

                let records = match (peer_state.next_expected_sequence_number, queue_front) {
                    (Some(next_expected), Some(front)) => {
                        let last_wanted = queue_back
                            .expect("queue has a front")
                            .min(next_expected + self.config.max_commit_batch_record_count as u64 - 1);
                        if next_expected > last_wanted {
                            Vec::new()
                        } else {
                            let start = (next_expected - front) as usize;
                            let end = (last_wanted - front + 1) as usize;
                            state
                                .queue
                                .range(start..end)
                                .map(|m| m.frame.clone())
                                .collect()
                        }
                    },
                    _ => Vec::new(),
                };

                debug!(
                    peer_id,
                    next_expected = ?peer_state.next_expected_sequence_number,
                    record_count = records.len(),
                    committed = %committed_state,
                    "sending mutations to follower"
                );

                outgoing.push(Outgoing {
                    peer_id,
                    request: AcceptMutationsRequest {
                        epoch_id: self.epoch.epoch_id,
                        term: self.epoch.term,
                        start_sequence_number: peer_state.next_expected_sequence_number,
                        committed_state,
                        snapshot_request,
                        records,
                    },
                });
            }
        }

        for Outgoing { peer_id, request } in outgoing {
            let Some(channel) = self.cell.channel_to(peer_id) else {
                continue;
            };
            let this = self.clone();
            let timeout = self.config.commit_flush_rpc_timeout;
            tokio::spawn(async move {
                let result =
                    match tokio::time::timeout(timeout, channel.accept_mutations(request)).await {
                        Ok(result) => result,
                        Err(_) => Err(HydraError::unavailable("accept mutations timed out")),
                    };
                this.on_remote_flush(peer_id, result);
            });
        }
    }

    fn on_remote_flush(
        self: &Arc<Self>,
        follower_id: PeerId,
        result: HydraResult<AcceptMutationsResponse>,
    ) {
        let batch = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            let response = match result {
                Err(error) => {
                    warn!(follower_id, %error, "error logging mutations at follower");
                    if state
                        .last_snapshot_info
                        .as_ref()
                        .is_some_and(|info| info.sequence_number.is_some())
                    {
                        self.on_snapshot_reply(&mut state, follower_id);
                    }
                    return;
                },
                Ok(response) => response,
            };

            if let Some(snapshot_response) = response.snapshot_response {
                let matches = state.last_snapshot_info.as_ref().is_some_and(|info| {
                    info.snapshot_id == snapshot_response.snapshot_id
                        && info.checksums[follower_id as usize].is_none()
                });
                if matches {
                    debug!(
                        follower_id,
                        snapshot_id = snapshot_response.snapshot_id,
                        "snapshot reply received"
                    );
                    let info = state.last_snapshot_info.as_mut().expect("matched above");
                    info.checksums[follower_id as usize] = Some(snapshot_response.checksum);
                    self.on_snapshot_reply(&mut state, follower_id);
                }
            }

            let peer_state = &mut state.peer_states[follower_id as usize];
            let previously_logged = peer_state.last_logged_sequence_number.unwrap_or(0);
            if response.logged_sequence_number < previously_logged {
                warn!(
                    follower_id,
                    logged = response.logged_sequence_number,
                    previously_logged,
                    "follower reported a logged sequence number in the past"
                );
            }
            peer_state.last_logged_sequence_number =
                Some(previously_logged.max(response.logged_sequence_number));
            peer_state.next_expected_sequence_number = Some(response.expected_sequence_number);

            debug!(
                follower_id,
                logged = response.logged_sequence_number,
                next_expected = response.expected_sequence_number,
                "mutations flushed by follower"
            );

            self.maybe_promote_committed_sequence_number(&mut state)
        };
        self.offload(batch);
    }

    /// Quorum rule: sort voting peers' logged numbers descending; the
    /// value at index `quorum - 1` is safe to commit.
    fn maybe_promote_committed_sequence_number(
        self: &Arc<Self>,
        state: &mut LeaderState,
    ) -> Vec<Arc<PendingMutation>> {
        let mut logged: Vec<Option<SequenceNumber>> = Vec::new();
        for peer_id in self.cell.peer_ids() {
            if self.cell.peer(peer_id).voting {
                logged.push(state.peer_states[peer_id as usize].last_logged_sequence_number);
            }
        }
        debug_assert_eq!(logged.len(), self.cell.voting_peer_count());
        logged.sort_unstable_by(|a, b| b.cmp(a));

        let Some(committed_sequence_number) = logged[self.cell.quorum_count() - 1] else {
            return Vec::new();
        };
        if committed_sequence_number <= state.committed_state.sequence_number {
            return Vec::new();
        }

        let Some(front) = state.queue.front().map(|m| m.sequence_number()) else {
            self.epoch.restart(HydraError::invariant(
                "quorum advanced past an empty mutation queue",
            ));
            return Vec::new();
        };
        let index = (committed_sequence_number - front) as usize;
        let Some(mutation) = state.queue.get(index) else {
            self.epoch.restart(HydraError::invariant(format!(
                "committed sequence {} is outside the mutation queue",
                committed_sequence_number
            )));
            return Vec::new();
        };
        let segment_id = mutation.version().segment_id;

        let committed_state = ReachableState::new(segment_id, committed_sequence_number);
        debug!(
            previous = %state.committed_state,
            current = %committed_state,
            "committed sequence number promoted"
        );
        state.committed_state = committed_state;

        self.collect_offload(state)
    }

    fn collect_offload(&self, state: &mut LeaderState) -> Vec<Arc<PendingMutation>> {
        let automaton_sequence_number = self.automaton.sequence_number();
        debug_assert!(state.last_offloaded_sequence_number >= automaton_sequence_number);
        if state.committed_state.sequence_number == state.last_offloaded_sequence_number {
            return Vec::new();
        }
        let front = state
            .queue
            .front()
            .map(|m| m.sequence_number())
            .expect("committed watermark moved, queue cannot be empty");
        let mut batch = Vec::new();
        for sequence_number in
            state.last_offloaded_sequence_number + 1..=state.committed_state.sequence_number
        {
            let index = (sequence_number - front) as usize;
            let mutation = state.queue[index].clone();
            debug_assert_eq!(mutation.sequence_number(), sequence_number);
            batch.push(mutation);
        }
        state.last_offloaded_sequence_number = state.committed_state.sequence_number;
        batch
    }

    fn offload(&self, batch: Vec<Arc<PendingMutation>>) {
        if batch.is_empty() {
            return;
        }
        if let Err(error) = self.automaton.apply_mutations(batch) {
            self.epoch.restart(error);
        }
    }

    fn maybe_send_batch(self: &Arc<Self>) {
        let need_flush = {
            let mut state = self.state.lock();
            let need_flush = state.queue.back().is_some_and(|back| {
                back.sequence_number() - state.committed_state.sequence_number
                    >= self.config.max_commit_batch_record_count as u64
            });
            self.drain_queue(&mut state);
            need_flush
        };
        if need_flush {
            self.flush();
        }
    }

    fn drain_queue(&self, state: &mut LeaderState) {
        fn pop(state: &mut LeaderState) {
            if let Some(mutation) = state.queue.pop_front() {
                state.queue_data_size -= mutation.data_size();
            }
        }

        while state.queue.len() > self.config.max_queue_mutation_count {
            let front = state.queue.front().expect("queue is non-empty");
            if front.sequence_number() > state.committed_state.sequence_number {
                self.epoch.restart(HydraError::logging_failed(format!(
                    "mutation queue count limit exceeded with uncommitted sequence {} at the head",
                    front.sequence_number()
                )));
                return;
            }
            pop(state);
        }
        while state.queue_data_size > self.config.max_queue_mutation_data_size {
            let front = state.queue.front().expect("data size is positive");
            if front.sequence_number() > state.committed_state.sequence_number {
                self.epoch.restart(HydraError::logging_failed(format!(
                    "mutation queue size limit exceeded with uncommitted sequence {} at the head",
                    front.sequence_number()
                )));
                return;
            }
            pop(state);
        }

        let min_logged = state
            .peer_states
            .iter()
            .map(|p| p.last_logged_sequence_number.unwrap_or(0))
            .min()
            .unwrap_or(0);
        while state
            .queue
            .front()
            .is_some_and(|m| m.sequence_number() < min_logged)
        {
            pop(state);
        }
    }

    fn maybe_checkpoint(self: &Arc<Self>, state: &mut LeaderState) {
        if state.acquiring_changelog || state.last_snapshot_info.is_some() {
            return;
        }
        if state.next_logged_version.record_id >= self.config.max_changelog_record_count {
            info!(
                record_count = state.next_logged_version.record_id,
                limit = self.config.max_changelog_record_count,
                "requesting checkpoint due to record count limit"
            );
        } else if state.changelog.data_size() >= self.config.max_changelog_data_size {
            info!(
                data_size = state.changelog.data_size(),
                limit = self.config.max_changelog_data_size,
                "requesting checkpoint due to data size limit"
            );
        } else {
            return;
        }
        self.checkpoint(state);
    }

    fn checkpoint(self: &Arc<Self>, state: &mut LeaderState) {
        debug_assert!(!state.acquiring_changelog);
        state.acquiring_changelog = true;
        let next_id = state.next_logged_version.segment_id + 1;
        let this = self.clone();
        tokio::spawn(async move {
            let result = match this.changelog_store.try_open(next_id).await {
                Ok(Some(changelog)) => Ok(changelog),
                Ok(None) => this.changelog_store.create(next_id).await,
                Err(e) => Err(e),
            };
            this.on_changelog_acquired(result.map_err(HydraError::from));
        });
    }

    /// Starts a distributed snapshot right away, regardless of thresholds.
    /// Resolves with the snapshot id once the local build is durable.
    pub async fn build_snapshot(self: &Arc<Self>) -> HydraResult<u32> {
        let rx = {
            let mut state = self.state.lock();
            if state.last_snapshot_info.is_some() {
                return Err(HydraError::unavailable(
                    "a distributed snapshot is already in progress",
                ));
            }
            let (tx, rx) = oneshot::channel();
            state.last_snapshot_info = Some(SnapshotInfo {
                snapshot_id: state.next_logged_version.segment_id + 1,
                sequence_number: None,
                checksums: vec![None; self.cell.peer_count()],
                has_reply: vec![false; self.cell.peer_count()],
                reply_count: 0,
                promise: Some(tx),
            });
            if !state.acquiring_changelog {
                self.checkpoint(&mut state);
            }
            rx
        };
        rx.await
            .map_err(|_| HydraError::unavailable("leader committer has stopped"))?
    }

    fn on_changelog_acquired(self: &Arc<Self>, result: HydraResult<Arc<dyn Changelog>>) {
        let (snapshot_id, sequence_number, old_changelog) = {
            let mut state = self.state.lock();
            state.acquiring_changelog = false;

            let changelog = match result {
                Ok(changelog) => changelog,
                Err(error) => {
                    error!(%error, "changelog acquisition failed");
                    if let Some(mut info) = state.last_snapshot_info.take() {
                        if let Some(promise) = info.promise.take() {
                            promise.send(Err(error)).ok();
                        }
                    }
                    return;
                },
            };

            let changelog_id = state.next_logged_version.segment_id + 1;
            if changelog.id() != changelog_id {
                self.epoch.restart(HydraError::invariant(format!(
                    "acquired changelog {} while expecting {}",
                    changelog.id(),
                    changelog_id
                )));
                return;
            }

            info!(snapshot_id = changelog_id, "started building snapshot");

            if state.last_snapshot_info.is_none() {
                state.last_snapshot_info = Some(SnapshotInfo {
                    snapshot_id: changelog_id,
                    sequence_number: None,
                    checksums: vec![None; self.cell.peer_count()],
                    has_reply: vec![false; self.cell.peer_count()],
                    reply_count: 0,
                    promise: None,
                });
            }
            let self_id = self.cell.self_id() as usize;
            let last_logged = state.peer_states[self_id]
                .last_logged_sequence_number
                .unwrap_or(0);
            let info = state.last_snapshot_info.as_mut().expect("installed above");
            debug_assert!(info.sequence_number.is_none());
            debug_assert_eq!(info.snapshot_id, changelog_id);
            info.sequence_number = Some(last_logged);

            let old_changelog = std::mem::replace(&mut state.changelog, changelog);
            state.next_logged_version = state.next_logged_version.rotate();
            (changelog_id, last_logged, old_changelog)
        };

        if self.config.close_changelogs {
            let changelog_id = old_changelog.id();
            tokio::spawn(async move {
                match old_changelog.close().await {
                    Ok(()) => debug!(changelog_id, "changelog closed"),
                    Err(error) => warn!(changelog_id, %error, "failed to close changelog"),
                }
            });
        }

        let this = self.clone();
        tokio::spawn(async move {
            let result = this
                .automaton
                .build_snapshot(snapshot_id, sequence_number)
                .await;
            this.on_local_snapshot_built(snapshot_id, result);
        });
    }

    fn on_local_snapshot_built(
        self: &Arc<Self>,
        snapshot_id: u32,
        result: HydraResult<SnapshotParams>,
    ) {
        let mut state = self.state.lock();
        let stale = state
            .last_snapshot_info
            .as_ref()
            .map_or(true, |info| info.snapshot_id > snapshot_id);
        if stale {
            info!(snapshot_id, "stale local snapshot built, ignoring");
            return;
        }

        let self_id = self.cell.self_id();
        let info = state.last_snapshot_info.as_mut().expect("checked above");
        debug_assert_eq!(info.snapshot_id, snapshot_id);
        match result {
            Ok(params) => {
                info!(snapshot_id, "local snapshot built");
                info.checksums[self_id as usize] = Some(params.checksum);
                if let Some(promise) = info.promise.take() {
                    promise.send(Ok(snapshot_id)).ok();
                }
            },
            Err(error) => {
                warn!(snapshot_id, %error, "local snapshot build failed");
                if let Some(promise) = info.promise.take() {
                    promise.send(Err(error)).ok();
                }
            },
        }
        self.on_snapshot_reply(&mut state, self_id);
    }

    fn on_snapshot_reply(&self, state: &mut LeaderState, peer_id: PeerId) {
        let Some(info) = state.last_snapshot_info.as_mut() else {
            return;
        };
        if info.has_reply[peer_id as usize] {
            return;
        }
        info!(
            peer_id,
            snapshot_id = info.snapshot_id,
            "received a new snapshot reply"
        );
        info.has_reply[peer_id as usize] = true;
        info.reply_count += 1;
        if info.reply_count == info.has_reply.len() {
            self.on_snapshots_complete(state);
        }
    }

    fn on_snapshots_complete(&self, state: &mut LeaderState) {
        let info = state
            .last_snapshot_info
            .take()
            .expect("a snapshot session just completed");

        let mut success_count = 0;
        let mut canonical: Option<Checksum> = None;
        let mut mismatch = false;
        for checksum in info.checksums.iter().flatten() {
            success_count += 1;
            match canonical {
                Some(canonical) => mismatch |= canonical != *checksum,
                None => canonical = Some(*checksum),
            }
        }

        info!(
            snapshot_id = info.snapshot_id,
            success_count, "distributed snapshot creation finished"
        );

        if mismatch {
            for (peer_id, checksum) in info.checksums.iter().enumerate() {
                if let Some(checksum) = checksum {
                    error!(
                        snapshot_id = info.snapshot_id,
                        peer_id,
                        checksum = format_args!("{:016x}", checksum),
                        "snapshot checksum mismatch"
                    );
                }
            }
        }

        state.last_snapshot_checksums = Some(SnapshotChecksums {
            snapshot_id: info.snapshot_id,
            checksums: info.checksums,
        });
    }

    fn stop(&self) {
        let error = HydraError::unavailable("hydra peer has stopped");
        let changelog = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;

            for mutation in &state.queue {
                mutation.resolve(Err(error.clone()));
            }
            state.queue.clear();
            state.queue_data_size = 0;
            if let Some(mut info) = state.last_snapshot_info.take() {
                if let Some(promise) = info.promise.take() {
                    promise.send(Err(error.clone())).ok();
                }
            }
            state.changelog.clone()
        };

        // Closing the channel first makes later `commit` calls fail fast
        // instead of queueing drafts nobody will ever drain.
        let mut draft_rx = self.draft_rx.lock();
        draft_rx.close();
        while let Ok(draft) = draft_rx.try_recv() {
            draft.promise.send(Err(error.clone())).ok();
        }

        tokio::spawn(async move {
            let _ = changelog.close().await;
        });
        info!("leader committer stopped");
    }
}
