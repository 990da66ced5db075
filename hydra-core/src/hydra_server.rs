// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The service every peer exposes to its cell: the follower accept path,
//! the snapshot/changelog read surface recovery feeds on, and the
//! force-restart escape hatch. Transport framing stays outside; an
//! in-process channel or a real RPC server can both sit in front of this.

use crate::{
    decorated_automaton::DecoratedAutomaton,
    epoch::EpochContext,
    error::{HydraError, HydraResult},
    follower_committer::FollowerCommitter,
    rpc::{
        AcceptMutationsRequest, AcceptMutationsResponse, ChangelogInfoResponse,
        HydraService, PingFollowerRequest, SnapshotInfoResponse, SnapshotRequest,
        SnapshotResponse,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use hydra_storage::{ChangelogStore, SnapshotStore};
use hydra_types::EpochId;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Default)]
struct SnapshotSessionState {
    /// Snapshot id currently being built locally, if any.
    requested: Option<u32>,
    /// The last completed local build, echoed in replies until superseded.
    built: Option<SnapshotResponse>,
}

pub struct HydraServer {
    epoch: Arc<EpochContext>,
    automaton: Arc<DecoratedAutomaton>,
    /// Present on followers; leaders serve reads only.
    follower: Option<Arc<FollowerCommitter>>,
    changelog_store: Arc<dyn ChangelogStore>,
    snapshot_store: Arc<dyn SnapshotStore>,
    snapshot_session: Arc<Mutex<SnapshotSessionState>>,
}

impl HydraServer {
    pub fn new(
        epoch: Arc<EpochContext>,
        automaton: Arc<DecoratedAutomaton>,
        follower: Option<Arc<FollowerCommitter>>,
        changelog_store: Arc<dyn ChangelogStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            epoch,
            automaton,
            follower,
            changelog_store,
            snapshot_store,
            snapshot_session: Arc::new(Mutex::new(SnapshotSessionState::default())),
        })
    }

    fn check_epoch(&self, epoch_id: EpochId) -> HydraResult<()> {
        if epoch_id != self.epoch.epoch_id {
            return Err(HydraError::InvalidEpoch {
                actual: epoch_id,
                current: self.epoch.epoch_id,
            });
        }
        if self.epoch.is_cancelled() {
            return Err(HydraError::unavailable("epoch is cancelled"));
        }
        Ok(())
    }

    /// Kicks off the local snapshot build once per requested id. The
    /// decorated automaton waits until the boundary sequence number has
    /// been applied, so the reply arrives in some later flush.
    fn handle_snapshot_request(&self, request: SnapshotRequest) {
        {
            let mut session = self.snapshot_session.lock();
            let already_known = session.requested == Some(request.snapshot_id)
                || session
                    .built
                    .is_some_and(|b| b.snapshot_id >= request.snapshot_id);
            if already_known {
                return;
            }
            session.requested = Some(request.snapshot_id);
        }
        info!(
            snapshot_id = request.snapshot_id,
            sequence_number = request.sequence_number,
            "snapshot requested by leader"
        );

        let automaton = self.automaton.clone();
        let changelog_store = self.changelog_store.clone();
        let follower = self.follower.clone();
        let session = self.snapshot_session.clone();
        tokio::spawn(async move {
            // The new segment starts right after the snapshot boundary;
            // pre-open it so rotation does not race changelog creation.
            if let Some(follower) = &follower {
                let next_id = request.snapshot_id;
                let prepared = match changelog_store.try_open(next_id).await {
                    Ok(Some(changelog)) => Ok(changelog),
                    Ok(None) => changelog_store.create(next_id).await,
                    Err(e) => Err(e),
                };
                match prepared {
                    Ok(changelog) => {
                        let _ = follower.register_next_changelog(next_id, changelog);
                    },
                    Err(error) => {
                        warn!(changelog_id = next_id, %error, "failed to pre-open changelog");
                    },
                }
            }

            let result = automaton
                .build_snapshot(request.snapshot_id, request.sequence_number)
                .await;
            let mut session = session.lock();
            session.requested = None;
            match result {
                Ok(params) => {
                    session.built = Some(SnapshotResponse {
                        snapshot_id: request.snapshot_id,
                        checksum: params.checksum,
                    });
                },
                Err(error) => {
                    warn!(
                        snapshot_id = request.snapshot_id,
                        %error,
                        "local snapshot build failed"
                    );
                },
            }
        });
    }
}

#[async_trait]
impl HydraService for HydraServer {
    async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> HydraResult<AcceptMutationsResponse> {
        self.check_epoch(request.epoch_id)?;
        let Some(follower) = self.follower.clone() else {
            return Err(HydraError::unavailable("peer is not following"));
        };

        if let Some(snapshot_request) = request.snapshot_request {
            self.handle_snapshot_request(snapshot_request);
        }

        if let (Some(start), false) = (request.start_sequence_number, request.records.is_empty()) {
            follower.accept_mutations(start, &request.records)?;
        }
        follower.commit_mutations(request.committed_state.sequence_number);

        let snapshot_response = self.snapshot_session.lock().built;
        Ok(AcceptMutationsResponse {
            logged_sequence_number: follower.logged_sequence_number(),
            expected_sequence_number: follower.expected_sequence_number(),
            snapshot_response,
        })
    }

    async fn ping_follower(&self, request: PingFollowerRequest) -> HydraResult<()> {
        self.check_epoch(request.epoch_id)?;
        if let Some(follower) = &self.follower {
            follower.commit_mutations(request.committed_state.sequence_number);
        }
        Ok(())
    }

    async fn lookup_snapshot(&self, max_snapshot_id: u32) -> HydraResult<Option<u32>> {
        Ok(self.snapshot_store.latest_at_most(max_snapshot_id).await?)
    }

    async fn get_snapshot_info(&self, snapshot_id: u32) -> HydraResult<SnapshotInfoResponse> {
        let params = self.snapshot_store.params(snapshot_id).await?;
        Ok(SnapshotInfoResponse {
            length: params.length,
            checksum: params.checksum,
            meta: params.meta,
        })
    }

    async fn read_snapshot(
        &self,
        snapshot_id: u32,
        offset: u64,
        length: usize,
    ) -> HydraResult<Bytes> {
        Ok(self.snapshot_store.read_at(snapshot_id, offset, length).await?)
    }

    async fn get_changelog_info(&self, segment_id: u32) -> HydraResult<ChangelogInfoResponse> {
        let changelog = self.changelog_store.open(segment_id).await?;
        Ok(ChangelogInfoResponse {
            record_count: changelog.record_count(),
            sealed: changelog.is_sealed(),
        })
    }

    async fn read_changelog(
        &self,
        segment_id: u32,
        start_record_id: u32,
        record_count: usize,
    ) -> HydraResult<Vec<Bytes>> {
        let changelog = self.changelog_store.open(segment_id).await?;
        Ok(changelog.read(start_record_id, record_count).await?)
    }

    async fn force_restart(&self, reason: String) -> HydraResult<()> {
        warn!(reason, "force restart requested by leader");
        self.epoch
            .restart(HydraError::unavailable(format!("force restart: {}", reason)));
        Ok(())
    }
}
