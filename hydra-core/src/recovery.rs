// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Epoch-start recovery: bring this peer's changelog and automaton up to
//! the leader's committed state. Downloads the latest usable snapshot
//! from any peer that has it, reconciles every segment against the
//! leader (sealing divergent tails), and replays the remainder through
//! the decorated automaton.

use crate::{
    decorated_automaton::DecoratedAutomaton,
    error::{HydraError, HydraResult},
    rpc::HydraService,
};
use hydra_config::RecoveryConfig;
use hydra_storage::{Changelog, ChangelogStore, SnapshotStore};
use hydra_types::{MutationRecord, ReachableState, SequenceNumber};
use std::sync::Arc;
use tokio_retry::{strategy::FixedInterval, Retry};
use tracing::{debug, info, warn};

pub struct Recovery {
    config: Arc<RecoveryConfig>,
    automaton: Arc<DecoratedAutomaton>,
    changelog_store: Arc<dyn ChangelogStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    /// The leader is authoritative for snapshot lookup and for every
    /// changelog read; it is also the snapshot source of last resort.
    leader: Arc<dyn HydraService>,
    /// Other reachable peers of the cell, tried first for snapshot
    /// downloads so the leader is not the only copy that matters.
    peers: Vec<Arc<dyn HydraService>>,
}

impl Recovery {
    pub fn new(
        config: Arc<RecoveryConfig>,
        automaton: Arc<DecoratedAutomaton>,
        changelog_store: Arc<dyn ChangelogStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
        leader: Arc<dyn HydraService>,
        peers: Vec<Arc<dyn HydraService>>,
    ) -> Self {
        Self {
            config,
            automaton,
            changelog_store,
            snapshot_store,
            leader,
            peers,
        }
    }

    fn retry_strategy(&self) -> impl Iterator<Item = std::time::Duration> {
        FixedInterval::from_millis(100).take(self.config.download_retries)
    }

    /// Runs recovery towards the leader's committed state at epoch start.
    /// On success the automaton's reachable state equals `target` and the
    /// local changelogs agree with the leader's on every record up to it.
    pub async fn run(&self, target: ReachableState) -> HydraResult<()> {
        info!(target = %target, "recovery started");

        // Every epoch starts from a blank automaton; the snapshot plus the
        // replayed log is the only way state gets in.
        self.automaton.clear().await?;
        self.restore_from_snapshot(target).await?;

        // A snapshot boundary may sit mid-segment, so replay starts at the
        // segment holding the last captured mutation; already-covered
        // records are skipped by sequence number. Segment ids start at 1.
        let first_segment = self.automaton.version().segment_id.max(1);
        for segment_id in first_segment..=target.segment_id {
            self.recover_segment(segment_id, target.sequence_number)
                .await?;
        }

        let reached = self.automaton.reachable_state();
        if reached.sequence_number != target.sequence_number {
            return Err(HydraError::invariant(format!(
                "recovery ended at {} instead of {}",
                reached, target
            )));
        }
        info!(state = %reached, "recovery complete");
        Ok(())
    }

    /// Steps 1 and 2: ask the leader for the best snapshot at or below
    /// the target, download it from any peer that has it when it beats
    /// the local one, and install it.
    async fn restore_from_snapshot(&self, target: ReachableState) -> HydraResult<()> {
        let bound = target.segment_id + 1;
        let leader_snapshot = Retry::spawn(self.retry_strategy(), || {
            self.leader.lookup_snapshot(bound)
        })
        .await?;
        let local_snapshot = self.snapshot_store.latest_at_most(bound).await?;

        if let Some(snapshot_id) = leader_snapshot {
            if local_snapshot.is_none_or(|local| local < snapshot_id) {
                self.download_snapshot(snapshot_id).await?;
            }
        }

        let Some(snapshot_id) = self.snapshot_store.latest_at_most(bound).await? else {
            debug!("no usable snapshot, replaying from the beginning");
            return Ok(());
        };
        let params = self.snapshot_store.params(snapshot_id).await?;
        if self.automaton.sequence_number() >= params.meta.sequence_number {
            debug!(
                snapshot_id,
                "automaton is already at or past the snapshot, skipping load"
            );
            return Ok(());
        }
        let reader = self.snapshot_store.open_reader(snapshot_id).await?;
        self.automaton.load_snapshot(reader).await?;
        Ok(())
    }

    /// Tries each peer in turn, falling back to the leader last; peers
    /// that lost the snapshot or drop mid-transfer are skipped. Nothing
    /// lands in the local store until a download verifies end to end.
    async fn download_snapshot(&self, snapshot_id: u32) -> HydraResult<()> {
        let mut last_error = HydraError::unavailable(format!(
            "no peer could serve snapshot {}",
            snapshot_id
        ));
        for source in self.peers.iter().chain(std::iter::once(&self.leader)) {
            match self.download_snapshot_from(source, snapshot_id).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    warn!(snapshot_id, %error, "snapshot download from peer failed");
                    last_error = error;
                },
            }
        }
        Err(last_error)
    }

    async fn download_snapshot_from(
        &self,
        source: &Arc<dyn HydraService>,
        snapshot_id: u32,
    ) -> HydraResult<()> {
        let snapshot_info = Retry::spawn(self.retry_strategy(), || {
            source.get_snapshot_info(snapshot_id)
        })
        .await?;
        info!(
            snapshot_id,
            length = snapshot_info.length,
            "downloading snapshot"
        );

        let mut payload = Vec::with_capacity(snapshot_info.length as usize);
        while (payload.len() as u64) < snapshot_info.length {
            let offset = payload.len() as u64;
            let chunk = Retry::spawn(self.retry_strategy(), || {
                source.read_snapshot(snapshot_id, offset, self.config.snapshot_block_size)
            })
            .await?;
            if chunk.is_empty() {
                return Err(HydraError::unavailable(format!(
                    "snapshot {} download truncated at offset {}",
                    snapshot_id, offset
                )));
            }
            payload.extend_from_slice(&chunk);
        }

        if hydra_types::checksum_of(&payload) != snapshot_info.checksum {
            return Err(HydraError::invariant(format!(
                "downloaded snapshot {} does not match the serving peer's checksum",
                snapshot_id
            )));
        }

        let mut writer = self
            .snapshot_store
            .create_writer(snapshot_info.meta)
            .await?;
        writer.write(&payload).await?;
        writer.finish().await?;
        info!(snapshot_id, "snapshot downloaded and verified");
        Ok(())
    }

    /// Step 3: make the local copy of one segment agree with the leader's,
    /// then apply everything in it up to the committed sequence number.
    async fn recover_segment(
        &self,
        segment_id: u32,
        committed_sequence_number: SequenceNumber,
    ) -> HydraResult<()> {
        let leader_info = Retry::spawn(self.retry_strategy(), || {
            self.leader.get_changelog_info(segment_id)
        })
        .await?;

        let changelog: Arc<dyn Changelog> = match self.changelog_store.try_open(segment_id).await? {
            Some(changelog) => changelog,
            None => self.changelog_store.create(segment_id).await?,
        };

        let local_count = changelog.record_count();
        if local_count > leader_info.record_count {
            // The divergent tail was never committed; cut it.
            warn!(
                segment_id,
                local_count,
                leader_count = leader_info.record_count,
                "sealing segment to match the leader"
            );
            changelog.seal(leader_info.record_count).await?;
        } else if local_count < leader_info.record_count {
            if changelog.is_sealed() {
                return Err(HydraError::invariant(format!(
                    "segment {} is sealed at {} records but the leader has {}",
                    segment_id, local_count, leader_info.record_count
                )));
            }
            self.download_segment_tail(&changelog, leader_info.record_count)
                .await?;
        }

        // Replay the whole segment; records past the committed watermark
        // stay logged but are not applied.
        let mut record_id = 0u32;
        let record_count = changelog.record_count();
        while record_id < record_count {
            let frames = changelog
                .read(record_id, self.config.records_per_request)
                .await?;
            if frames.is_empty() {
                break;
            }
            for frame in frames {
                record_id += 1;
                let record = MutationRecord::decode(&frame).map_err(|e| {
                    HydraError::invariant(format!(
                        "undecodable record {}:{}: {}",
                        segment_id,
                        record_id - 1,
                        e
                    ))
                })?;
                if record.sequence_number() <= self.automaton.sequence_number() {
                    continue;
                }
                if record.sequence_number() > committed_sequence_number {
                    return Ok(());
                }
                self.automaton.apply_mutation_during_recovery(frame).await?;
            }
        }
        debug!(segment_id, record_count, "segment recovered");
        Ok(())
    }

    async fn download_segment_tail(
        &self,
        changelog: &Arc<dyn Changelog>,
        leader_count: u32,
    ) -> HydraResult<()> {
        let segment_id = changelog.id();
        while changelog.record_count() < leader_count {
            let start = changelog.record_count();
            let want = ((leader_count - start) as usize).min(self.config.records_per_request);
            let frames = Retry::spawn(self.retry_strategy(), || {
                self.leader.read_changelog(segment_id, start, want)
            })
            .await?;
            if frames.is_empty() {
                return Err(HydraError::unavailable(format!(
                    "segment {} download stalled at record {}",
                    segment_id, start
                )));
            }
            debug!(
                segment_id,
                start,
                count = frames.len(),
                "downloaded changelog records"
            );
            changelog.append(frames).await?;
        }
        Ok(())
    }
}
