// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::{
    ids::{OwnerId, ReplicaId},
    types::{Atomicity, ReplicaMode, ReplicaState},
};
use serde::{Deserialize, Serialize};

/// One replica of a replicated table on some other cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableReplica {
    pub id: ReplicaId,
    pub owner: OwnerId,
    pub cluster_name: String,
    pub replica_path: String,
    pub mode: ReplicaMode,
    pub atomicity: Atomicity,
    pub preserve_timestamps: bool,
    pub state: ReplicaState,
}

impl TableReplica {
    pub fn new(
        id: ReplicaId,
        owner: OwnerId,
        cluster_name: impl Into<String>,
        replica_path: impl Into<String>,
        mode: ReplicaMode,
    ) -> Self {
        Self {
            id,
            owner,
            cluster_name: cluster_name.into(),
            replica_path: replica_path.into(),
            mode,
            atomicity: Atomicity::Full,
            preserve_timestamps: true,
            state: ReplicaState::Disabled,
        }
    }
}
