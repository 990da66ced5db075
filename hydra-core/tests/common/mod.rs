// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! In-process cell harness: real committers, real stores, channels wired
//! peer to peer with switchable partitions.

use bytes::Bytes;
use hydra_config::HydraConfig;
use hydra_core::{
    test_utils::{CountingAutomaton, PartitionableChannel},
    CellManager, DecoratedAutomaton, EpochContext, FollowerCommitter, HydraResult, HydraServer,
    LeaderCommitter, ManualLease, MutationDraft, PeerConfig,
};
use hydra_storage::{ChangelogStore, MemoryChangelogStore, MemorySnapshotStore};
use hydra_types::{EpochId, PeerId, ReachableState, Term};
use std::{
    sync::{atomic::AtomicBool, Arc},
    time::Duration,
};
use tokio::sync::oneshot;

pub const FIRST_SEGMENT: u32 = 1;

pub fn test_config() -> Arc<HydraConfig> {
    Arc::new(HydraConfig {
        max_commit_batch_delay: Duration::from_millis(2),
        ..HydraConfig::default()
    })
}

pub fn peer_configs(count: usize) -> Vec<PeerConfig> {
    (0..count)
        .map(|i| PeerConfig {
            address: format!("peer-{}", i),
            voting: true,
        })
        .collect()
}

pub struct TestPeer {
    pub id: PeerId,
    pub changelog_store: Arc<MemoryChangelogStore>,
    pub snapshot_store: Arc<MemorySnapshotStore>,
    pub automaton: Arc<DecoratedAutomaton>,
    pub epoch: Arc<EpochContext>,
    pub follower: Option<Arc<FollowerCommitter>>,
    pub server: Arc<HydraServer>,
}

impl TestPeer {
    /// Builds a peer for a fresh cell: blank stores, blank automaton.
    pub fn new(
        id: PeerId,
        config: &Arc<HydraConfig>,
        peers: &[PeerConfig],
        epoch_id: EpochId,
        term: Term,
        leader_id: PeerId,
    ) -> Self {
        let changelog_store = Arc::new(MemoryChangelogStore::new());
        let snapshot_store = Arc::new(MemorySnapshotStore::new());
        let automaton = DecoratedAutomaton::new(
            Box::new(CountingAutomaton::default()),
            snapshot_store.clone(),
            128,
        );
        Self::with_parts(
            id,
            config,
            peers,
            epoch_id,
            term,
            leader_id,
            changelog_store,
            snapshot_store,
            automaton,
        )
    }

    /// Re-enters a peer into a new epoch, keeping its stores and automaton.
    pub fn respawn(
        &self,
        config: &Arc<HydraConfig>,
        peers: &[PeerConfig],
        epoch_id: EpochId,
        term: Term,
        leader_id: PeerId,
    ) -> Self {
        Self::with_parts(
            self.id,
            config,
            peers,
            epoch_id,
            term,
            leader_id,
            self.changelog_store.clone(),
            self.snapshot_store.clone(),
            self.automaton.clone(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn with_parts(
        id: PeerId,
        config: &Arc<HydraConfig>,
        peers: &[PeerConfig],
        epoch_id: EpochId,
        term: Term,
        leader_id: PeerId,
        changelog_store: Arc<MemoryChangelogStore>,
        snapshot_store: Arc<MemorySnapshotStore>,
        automaton: Arc<DecoratedAutomaton>,
    ) -> Self {
        let epoch = Arc::new(EpochContext::new(epoch_id, term, leader_id));
        automaton.set_epoch(epoch.clone());
        let follower = (id != leader_id).then(|| {
            FollowerCommitter::new(
                config.clone(),
                Arc::new(CellManager::new(id, peers.to_vec())),
                automaton.clone(),
                epoch.clone(),
                changelog_store.clone(),
            )
        });
        let server = HydraServer::new(
            epoch.clone(),
            automaton.clone(),
            follower.clone(),
            changelog_store.clone(),
            snapshot_store.clone(),
        );
        Self {
            id,
            changelog_store,
            snapshot_store,
            automaton,
            epoch,
            follower,
            server,
        }
    }
}

pub struct TestCell {
    pub config: Arc<HydraConfig>,
    pub peers: Vec<TestPeer>,
    pub leader: Arc<LeaderCommitter>,
    pub lease: Arc<ManualLease>,
    /// Partition switch per non-leader peer id.
    pub partitions: Vec<Option<Arc<AtomicBool>>>,
}

/// Brings up a fresh cell with peer 0 leading in term 1 and the first
/// changelog already acquired.
pub async fn start_cell(peer_count: usize) -> TestCell {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let config = test_config();
    let peers_cfg = peer_configs(peer_count);
    let epoch_id = EpochId::random();

    let peers: Vec<TestPeer> = (0..peer_count as PeerId)
        .map(|id| TestPeer::new(id, &config, &peers_cfg, epoch_id, 1, 0))
        .collect();

    let leader_cell = Arc::new(CellManager::new(0, peers_cfg));
    let mut partitions = vec![None; peer_count];
    for peer in peers.iter().skip(1) {
        let (channel, flag) = PartitionableChannel::new(peer.server.clone());
        leader_cell.register_channel(peer.id, channel);
        partitions[peer.id as usize] = Some(flag);
    }

    let changelog = peers[0]
        .changelog_store
        .create(FIRST_SEGMENT)
        .await
        .expect("fresh store");
    let lease = ManualLease::new();
    let leader = LeaderCommitter::new(
        config.clone(),
        leader_cell,
        peers[0].automaton.clone(),
        lease.clone(),
        peers[0].epoch.clone(),
        peers[0].changelog_store.clone(),
        changelog,
        ReachableState::new(FIRST_SEGMENT, 0),
    );
    leader.start();

    TestCell {
        config,
        peers,
        leader,
        lease,
        partitions,
    }
}

pub fn submit(
    leader: &Arc<LeaderCommitter>,
    payload: &str,
) -> oneshot::Receiver<HydraResult<Bytes>> {
    let (promise, rx) = oneshot::channel();
    leader.commit(MutationDraft {
        reign: 1,
        mutation_type: "test".to_owned(),
        payload: Bytes::copy_from_slice(payload.as_bytes()),
        mutation_id: None,
        epoch_id: None,
        promise,
    });
    rx
}

pub async fn commit_ok(leader: &Arc<LeaderCommitter>, payload: &str) -> String {
    let response = submit(leader, payload)
        .await
        .expect("promise resolved")
        .expect("commit succeeded");
    String::from_utf8(response.to_vec()).expect("utf8 response")
}

pub async fn record_count(store: &Arc<MemoryChangelogStore>, segment_id: u32) -> Option<u32> {
    store
        .try_open(segment_id)
        .await
        .expect("store is healthy")
        .map(|c| c.record_count())
}

/// Polls an async condition until it holds or ten seconds pass.
pub async fn wait_for<F>(what: &str, mut condition: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
