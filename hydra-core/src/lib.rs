// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The replicated state-machine engine: a single leader sequences client
//! mutations, replicates them to a voting quorum, persists them in
//! changelogs, applies them deterministically through the decorated
//! automaton, and periodically truncates the log with a distributed
//! snapshot.

pub mod automaton;
pub mod cell_manager;
pub mod decorated_automaton;
pub mod epoch;
pub mod error;
pub mod follower_committer;
pub mod hydra_server;
pub mod leader_committer;
pub mod lease;
pub mod recovery;
pub mod rpc;
pub mod test_utils;

pub use automaton::{Automaton, MutationContext};
pub use cell_manager::{CellManager, PeerConfig};
pub use decorated_automaton::{CommitPromise, DecoratedAutomaton, PendingMutation, UserLockGuard};
pub use epoch::EpochContext;
pub use error::{HydraError, HydraResult};
pub use follower_committer::FollowerCommitter;
pub use hydra_server::HydraServer;
pub use leader_committer::{LeaderCommitter, MutationDraft, PeerState, SnapshotChecksums};
pub use lease::{LeaderLease, ManualLease};
pub use recovery::Recovery;
pub use rpc::{
    AcceptMutationsRequest, AcceptMutationsResponse, ChangelogInfoResponse, HydraService,
    PingFollowerRequest, SnapshotInfoResponse, SnapshotRequest, SnapshotResponse,
};
