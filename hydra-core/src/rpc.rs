// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The consensus wire surface between peers of one cell. Transport framing
//! is a collaborator's concern; peers see each other as `HydraService`
//! implementations handed out by the cell manager.

use crate::error::HydraResult;
use async_trait::async_trait;
use bytes::Bytes;
use hydra_storage::SnapshotMeta;
use hydra_types::{Checksum, EpochId, ReachableState, SequenceNumber, Term};

/// Piggybacked on `AcceptMutations` while a distributed snapshot is in
/// progress: asks the follower to build `snapshot_id` once it has logged
/// `sequence_number`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub snapshot_id: u32,
    pub sequence_number: SequenceNumber,
}

/// The follower's side of the same exchange, returned once its local build
/// completed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SnapshotResponse {
    pub snapshot_id: u32,
    pub checksum: Checksum,
}

#[derive(Clone, Debug)]
pub struct AcceptMutationsRequest {
    pub epoch_id: EpochId,
    pub term: Term,
    /// Sequence number of the first attached record; `None` when the
    /// leader has nothing to send and pings state only.
    pub start_sequence_number: Option<SequenceNumber>,
    pub committed_state: ReachableState,
    pub snapshot_request: Option<SnapshotRequest>,
    /// Encoded `MutationRecord` frames, contiguous in sequence.
    pub records: Vec<Bytes>,
}

#[derive(Clone, Debug)]
pub struct AcceptMutationsResponse {
    pub logged_sequence_number: SequenceNumber,
    pub expected_sequence_number: SequenceNumber,
    pub snapshot_response: Option<SnapshotResponse>,
}

#[derive(Copy, Clone, Debug)]
pub struct PingFollowerRequest {
    pub epoch_id: EpochId,
    pub term: Term,
    pub committed_state: ReachableState,
}

#[derive(Clone, Debug)]
pub struct SnapshotInfoResponse {
    pub length: u64,
    pub checksum: Checksum,
    pub meta: SnapshotMeta,
}

#[derive(Copy, Clone, Debug)]
pub struct ChangelogInfoResponse {
    pub record_count: u32,
    pub sealed: bool,
}

/// Everything one peer can ask of another. All calls are idempotent or
/// safely repeatable; the committers are built for at-least-once delivery.
#[async_trait]
pub trait HydraService: Send + Sync {
    async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> HydraResult<AcceptMutationsResponse>;

    async fn ping_follower(&self, request: PingFollowerRequest) -> HydraResult<()>;

    /// The largest snapshot id known to this peer not exceeding the bound.
    async fn lookup_snapshot(&self, max_snapshot_id: u32) -> HydraResult<Option<u32>>;

    async fn get_snapshot_info(&self, snapshot_id: u32) -> HydraResult<SnapshotInfoResponse>;

    async fn read_snapshot(
        &self,
        snapshot_id: u32,
        offset: u64,
        length: usize,
    ) -> HydraResult<Bytes>;

    async fn get_changelog_info(&self, segment_id: u32) -> HydraResult<ChangelogInfoResponse>;

    async fn read_changelog(
        &self,
        segment_id: u32,
        start_record_id: u32,
        record_count: usize,
    ) -> HydraResult<Vec<Bytes>>;

    /// Tells a follower its log diverged beyond repair within this epoch;
    /// the follower cancels its epoch and re-enters recovery.
    async fn force_restart(&self, reason: String) -> HydraResult<()>;
}
