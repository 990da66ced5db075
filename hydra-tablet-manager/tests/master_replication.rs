// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The tablet manager riding on the consensus engine: identical mutation
//! sequences must produce bit-identical master state on every peer, and
//! snapshots must restore it exactly.

use bytes::Bytes;
use claims::assert_ok;
use hydra_core::{test_utils::record_frame, DecoratedAutomaton};
use hydra_storage::{MemorySnapshotStore, SnapshotStore};
use hydra_tablet_manager::{BundleId, MasterAutomaton, MasterMutation, OwnerId, OwnerKind};
use hydra_types::Version;
use std::sync::Arc;

fn master_peer() -> (Arc<DecoratedAutomaton>, Arc<MemorySnapshotStore>) {
    let store = Arc::new(MemorySnapshotStore::new());
    let automaton = DecoratedAutomaton::new(Box::new(MasterAutomaton::new()), store.clone(), 64);
    (automaton, store)
}

fn frames(mutations: &[MasterMutation]) -> Vec<Bytes> {
    mutations
        .iter()
        .enumerate()
        .map(|(i, mutation)| {
            let sequence_number = i as u64 + 1;
            let payload = bcs::to_bytes(mutation).expect("mutation encodes");
            let (_, frame) = record_frame(
                sequence_number,
                Version::new(1, i as u32),
                sequence_number - 1,
                &payload,
            );
            frame
        })
        .collect()
}

fn catalog_bootstrap() -> Vec<MasterMutation> {
    // Ids are allocated densely from 1 by the catalog generator.
    vec![
        MasterMutation::CreateBundle {
            name: "default".to_owned(),
        },
        MasterMutation::CreateCell {
            bundle: BundleId(1),
        },
        MasterMutation::CreateCell {
            bundle: BundleId(1),
        },
        MasterMutation::CreateOwner {
            path: "//tmp/t".to_owned(),
            kind: OwnerKind::SortedTable,
            bundle: BundleId(1),
        },
        // Heuristic placement: the only randomness is the mutation
        // context's, so every peer must pick the same cell.
        MasterMutation::MountTable {
            owner: OwnerId(4),
            first: None,
            last: None,
            target_cells: None,
            hint_cell: None,
            freeze: false,
        },
    ]
}

#[tokio::test]
async fn replicas_agree_on_master_state() {
    let (peer_a, _) = master_peer();
    let (peer_b, _) = master_peer();

    for frame in frames(&catalog_bootstrap()) {
        assert_ok!(peer_a.apply_mutation_during_recovery(frame.clone()).await);
        assert_ok!(peer_b.apply_mutation_during_recovery(frame).await);
    }

    assert_eq!(peer_a.sequence_number(), 5);
    assert_ne!(peer_a.state_hash(), 0);
    assert_eq!(peer_a.state_hash(), peer_b.state_hash());
    assert_eq!(peer_a.random_seed(), peer_b.random_seed());
}

#[tokio::test]
async fn snapshot_restores_master_state_exactly() {
    let (peer_a, store_a) = master_peer();
    for frame in frames(&catalog_bootstrap()) {
        assert_ok!(peer_a.apply_mutation_during_recovery(frame).await);
    }
    let hash = peer_a.state_hash();

    let params = assert_ok!(peer_a.build_snapshot(2, 5).await);
    assert_eq!(params.meta.sequence_number, 5);

    let (peer_c, _) = master_peer();
    let reader = assert_ok!(store_a.open_reader(2).await);
    assert_ok!(peer_c.load_snapshot(reader).await);
    assert_eq!(peer_c.state_hash(), hash);
    assert_eq!(peer_c.sequence_number(), 5);

    // The restored master keeps evolving identically: replay the same
    // follow-up on both and compare again.
    let unmount = MasterMutation::UnmountTable {
        owner: OwnerId(4),
        first: None,
        last: None,
        force: false,
    };
    let payload = bcs::to_bytes(&unmount).expect("mutation encodes");
    let (_, frame) = record_frame(6, Version::new(2, 0), 5, &payload);
    assert_ok!(peer_a.apply_mutation_during_recovery(frame.clone()).await);
    assert_ok!(peer_c.apply_mutation_during_recovery(frame).await);
    assert_eq!(peer_a.state_hash(), peer_c.state_hash());
}
