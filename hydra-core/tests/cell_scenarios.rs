// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! End-to-end cell scenarios: the commit path, follower recovery, leader
//! changeover with tail sealing, and the distributed snapshot protocol.

mod common;

use claims::{assert_ok, assert_some};
use common::{commit_ok, record_count, start_cell, submit, wait_for, FIRST_SEGMENT};
use hydra_core::Recovery;
use hydra_storage::{ChangelogStore, SnapshotStore};
use hydra_types::{EpochId, ReachableState, Version};
use std::sync::{atomic::Ordering, Arc};

#[tokio::test(flavor = "multi_thread")]
async fn single_leader_commit_path() {
    let cell = start_cell(3).await;

    // Pipeline three mutations; promises must resolve in order with
    // payload-dependent responses.
    let r1 = submit(&cell.leader, "add:1");
    let r2 = submit(&cell.leader, "add:2");
    let r3 = submit(&cell.leader, "add:3");
    assert_eq!(&assert_ok!(r1.await.expect("resolved"))[..], b"1");
    assert_eq!(&assert_ok!(r2.await.expect("resolved"))[..], b"3");
    assert_eq!(&assert_ok!(r3.await.expect("resolved"))[..], b"6");

    assert_eq!(
        cell.leader.committed_state(),
        ReachableState::new(FIRST_SEGMENT, 3)
    );

    // Every peer's changelog ends up holding exactly the three records.
    for peer in &cell.peers {
        wait_for("changelog holds three records", async || {
            record_count(&peer.changelog_store, FIRST_SEGMENT).await == Some(3)
        })
        .await;
    }

    // Followers apply up to the propagated watermark; state hashes agree.
    for peer in &cell.peers {
        wait_for("automaton applied all three", async || {
            peer.automaton.sequence_number() == 3
        })
        .await;
    }
    let leader_hash = cell.peers[0].automaton.state_hash();
    assert_ne!(leader_hash, 0);
    for peer in &cell.peers[1..] {
        assert_eq!(peer.automaton.state_hash(), leader_hash);
        assert_eq!(peer.automaton.version(), Version::new(FIRST_SEGMENT, 2));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn follower_recovers_after_restart() {
    let cell = start_cell(3).await;
    let lagging = cell.partitions[2].as_ref().expect("peer 2 has a switch");
    lagging.store(true, Ordering::Release);

    for i in 1..=10u64 {
        commit_ok(&cell.leader, &format!("add:{}", i)).await;
    }
    assert_eq!(cell.leader.committed_state().sequence_number, 10);
    assert_eq!(cell.peers[2].automaton.sequence_number(), 0);

    // Peer 2 comes back: recover against the leader, then rejoin.
    let target = cell.leader.committed_state();
    let peer = &cell.peers[2];
    let recovery = Recovery::new(
        Arc::new(hydra_config::RecoveryConfig::default()),
        peer.automaton.clone(),
        peer.changelog_store.clone(),
        peer.snapshot_store.clone(),
        cell.peers[0].server.clone(),
        vec![cell.peers[1].server.clone() as Arc<dyn hydra_core::HydraService>],
    );
    assert_ok!(recovery.run(target).await);
    assert_eq!(peer.automaton.sequence_number(), 10);
    assert_eq!(
        peer.automaton.state_hash(),
        cell.peers[0].automaton.state_hash()
    );
    peer.follower
        .as_ref()
        .expect("peer 2 follows")
        .set_sequence_number(target.sequence_number);
    lagging.store(false, Ordering::Release);

    // Normal replication resumes with the next mutation.
    commit_ok(&cell.leader, "add:11").await;
    for peer in &cell.peers {
        wait_for("all peers applied eleven mutations", async || {
            peer.automaton.sequence_number() == 11
        })
        .await;
    }
    let leader_hash = cell.peers[0].automaton.state_hash();
    for peer in &cell.peers[1..] {
        assert_eq!(peer.automaton.state_hash(), leader_hash);
    }
    assert_eq!(record_count(&cell.peers[2].changelog_store, FIRST_SEGMENT).await, Some(11));
}

#[tokio::test(flavor = "multi_thread")]
async fn leader_changeover_seals_divergent_tail() {
    let config = common::test_config();
    let peers_cfg = common::peer_configs(3);
    let cell = start_cell(3).await;

    for i in 1..=5u64 {
        commit_ok(&cell.leader, &format!("add:{}", i)).await;
    }
    for peer in &cell.peers {
        wait_for("everyone applied five mutations", async || {
            peer.automaton.sequence_number() == 5
        })
        .await;
    }

    // Peer 0 logs a sixth mutation that never reaches anyone else: the
    // classic partition-at-flush shape.
    let (_, orphan_frame) = hydra_core::test_utils::record_frame(
        6,
        Version::new(FIRST_SEGMENT, 5),
        5,
        b"add:6",
    );
    let old_leader_log = assert_ok!(cell.peers[0].changelog_store.open(FIRST_SEGMENT).await);
    assert_ok!(old_leader_log.append(vec![orphan_frame]).await);
    assert_eq!(old_leader_log.record_count(), 6);

    // Epoch 1 dies; peer 1 is elected for term 2.
    for peer in &cell.peers {
        peer.epoch.cancel();
    }
    let epoch_id = EpochId::random();
    let survivors: Vec<common::TestPeer> = cell
        .peers
        .iter()
        .map(|peer| peer.respawn(&config, &peers_cfg, epoch_id, 2, 1))
        .collect();
    let target = ReachableState::new(FIRST_SEGMENT, 5);

    // The new leader replays its own log first.
    let self_recovery = Recovery::new(
        Arc::new(hydra_config::RecoveryConfig::default()),
        survivors[1].automaton.clone(),
        survivors[1].changelog_store.clone(),
        survivors[1].snapshot_store.clone(),
        survivors[1].server.clone(),
        Vec::new(),
    );
    assert_ok!(self_recovery.run(target).await);

    // The deposed leader recovers as a follower; its orphaned tail gets
    // sealed away.
    for id in [0usize, 2] {
        let recovery = Recovery::new(
            Arc::new(hydra_config::RecoveryConfig::default()),
            survivors[id].automaton.clone(),
            survivors[id].changelog_store.clone(),
            survivors[id].snapshot_store.clone(),
            survivors[1].server.clone(),
            Vec::new(),
        );
        assert_ok!(recovery.run(target).await);
        survivors[id]
            .follower
            .as_ref()
            .expect("follows in term 2")
            .set_sequence_number(5);
    }
    let sealed = assert_ok!(survivors[0].changelog_store.open(FIRST_SEGMENT).await);
    assert_eq!(sealed.record_count(), 5);
    assert!(sealed.is_sealed());

    // Term 2 continues in a fresh segment.
    let leader_cell = Arc::new(hydra_core::CellManager::new(1, peers_cfg.clone()));
    for id in [0usize, 2] {
        leader_cell.register_channel(survivors[id].id, survivors[id].server.clone());
    }
    let changelog = assert_ok!(survivors[1].changelog_store.create(FIRST_SEGMENT + 1).await);
    let lease = hydra_core::ManualLease::new();
    let leader = hydra_core::LeaderCommitter::new(
        config.clone(),
        leader_cell,
        survivors[1].automaton.clone(),
        lease,
        survivors[1].epoch.clone(),
        survivors[1].changelog_store.clone(),
        changelog,
        target,
    );
    leader.start();

    assert_eq!(commit_ok(&leader, "add:6").await, "21");
    for peer in &survivors {
        wait_for("term 2 mutation applied everywhere", async || {
            peer.automaton.sequence_number() == 6
        })
        .await;
    }
    let canonical = survivors[1].automaton.state_hash();
    for peer in &survivors {
        assert_eq!(peer.automaton.state_hash(), canonical);
    }
    assert_eq!(
        leader.committed_state(),
        ReachableState::new(FIRST_SEGMENT + 1, 6)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn lease_loss_fails_the_epoch() {
    let cell = start_cell(3).await;
    commit_ok(&cell.leader, "add:1").await;

    cell.lease.invalidate();
    wait_for("epoch cancelled after lease loss", async || {
        cell.peers[0].epoch.is_cancelled()
    })
    .await;

    // Drafts submitted after the loss resolve with a terminal error
    // rather than hanging.
    let result = submit(&cell.leader, "add:2").await;
    match result {
        Ok(outcome) => {
            claims::assert_err!(outcome);
        }
        // The promise may also be dropped with the stopping committer.
        Err(_) => {},
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn distributed_snapshot_checksums_agree() {
    let cell = start_cell(3).await;
    for i in 1..=3u64 {
        commit_ok(&cell.leader, &format!("add:{}", i)).await;
    }
    for peer in &cell.peers {
        wait_for("all peers applied the prefix", async || {
            peer.automaton.sequence_number() == 3
        })
        .await;
    }
    let hash_at_3 = cell.peers[0].automaton.state_hash();

    let snapshot_id = assert_ok!(cell.leader.build_snapshot().await);
    assert_eq!(snapshot_id, FIRST_SEGMENT + 1);

    // Every peer builds the same snapshot; checksums agree exactly.
    for peer in &cell.peers {
        let store = peer.snapshot_store.clone();
        wait_for("snapshot appears on every peer", async || {
            store.list().await.expect("store is healthy").contains(&snapshot_id)
        })
        .await;
    }
    let canonical = assert_ok!(cell.peers[0].snapshot_store.params(snapshot_id).await);
    assert_eq!(canonical.meta.sequence_number, 3);
    for peer in &cell.peers[1..] {
        let params = assert_ok!(peer.snapshot_store.params(snapshot_id).await);
        assert_eq!(params.checksum, canonical.checksum);
    }

    wait_for("leader collected every checksum", async || {
        cell.leader
            .last_snapshot_checksums()
            .is_some_and(|c| c.checksums.iter().all(Option::is_some))
    })
    .await;
    let collected = assert_some!(cell.leader.last_snapshot_checksums());
    assert_eq!(collected.snapshot_id, snapshot_id);
    assert!(collected
        .checksums
        .iter()
        .all(|c| *c == Some(canonical.checksum)));

    // A fresh peer restored from the snapshot lands on the same state.
    let fresh = hydra_core::DecoratedAutomaton::new(
        Box::new(hydra_core::test_utils::CountingAutomaton::default()),
        Arc::new(hydra_storage::MemorySnapshotStore::new()),
        16,
    );
    let reader = assert_ok!(cell.peers[0].snapshot_store.open_reader(snapshot_id).await);
    assert_ok!(fresh.load_snapshot(reader).await);
    assert_eq!(fresh.state_hash(), hash_at_3);
    assert_eq!(fresh.sequence_number(), 3);

    // The log rotated: the next mutation lands in the new segment.
    commit_ok(&cell.leader, "add:4").await;
    wait_for("commit advances into the new segment", async || {
        cell.leader.committed_state() == ReachableState::new(FIRST_SEGMENT + 1, 4)
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_download_falls_back_across_peers() {
    let cell = start_cell(3).await;
    for i in 1..=3u64 {
        commit_ok(&cell.leader, &format!("add:{}", i)).await;
    }
    for peer in &cell.peers {
        wait_for("all peers applied the prefix", async || {
            peer.automaton.sequence_number() == 3
        })
        .await;
    }
    let hash_at_3 = cell.peers[0].automaton.state_hash();
    let snapshot_id = assert_ok!(cell.leader.build_snapshot().await);
    for peer in &cell.peers {
        let store = peer.snapshot_store.clone();
        wait_for("snapshot appears on every peer", async || {
            store.list().await.expect("store is healthy").contains(&snapshot_id)
        })
        .await;
    }

    // A blank peer recovers with one download source dead: the snapshot
    // still comes in from the next peer that has it.
    let (dead_source, dead_switch) =
        hydra_core::test_utils::PartitionableChannel::new(cell.peers[2].server.clone());
    dead_switch.store(true, Ordering::Release);
    let sources: Vec<Arc<dyn hydra_core::HydraService>> =
        vec![dead_source, cell.peers[1].server.clone()];

    let changelog_store = Arc::new(hydra_storage::MemoryChangelogStore::new());
    let snapshot_store = Arc::new(hydra_storage::MemorySnapshotStore::new());
    let automaton = hydra_core::DecoratedAutomaton::new(
        Box::new(hydra_core::test_utils::CountingAutomaton::default()),
        snapshot_store.clone(),
        16,
    );
    let recovery = Recovery::new(
        Arc::new(hydra_config::RecoveryConfig::default()),
        automaton.clone(),
        changelog_store,
        snapshot_store.clone(),
        cell.peers[0].server.clone(),
        sources,
    );
    assert_ok!(recovery.run(cell.leader.committed_state()).await);

    assert_eq!(automaton.sequence_number(), 3);
    assert_eq!(automaton.state_hash(), hash_at_3);
    assert!(assert_ok!(snapshot_store.list().await).contains(&snapshot_id));
}
