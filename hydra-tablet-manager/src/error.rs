// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::ids::{ActionId, CellId, OwnerId, ReplicaId, TabletId};
use thiserror::Error;

/// Prepare-time validation failures surface to the operator; the catalog
/// is untouched when any of these fires.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TabletError {
    #[error("no such owner {0}")]
    NoSuchOwner(OwnerId),

    #[error("no such tablet {0}")]
    NoSuchTablet(TabletId),

    #[error("no such cell {0}")]
    NoSuchCell(CellId),

    #[error("no such replica {0}")]
    NoSuchReplica(ReplicaId),

    #[error("no such action {0}")]
    NoSuchAction(ActionId),

    #[error("tablet range [{first}, {last}] is invalid for owner with {count} tablets")]
    InvalidTabletRange {
        first: usize,
        last: usize,
        count: usize,
    },

    #[error("tablet {tablet} is in state {state}, expected {expected}")]
    InvalidTabletState {
        tablet: TabletId,
        state: String,
        expected: String,
    },

    #[error("tablet {0} participates in action {1}")]
    TabletHasAction(TabletId, ActionId),

    #[error("cell {cell} does not belong to bundle {bundle}")]
    CellNotInBundle { cell: CellId, bundle: String },

    #[error("no healthy cell is available in the bundle")]
    NoHealthyCell,

    #[error("{0}")]
    InvalidArgument(String),
}

impl TabletError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type TabletResult<T> = std::result::Result<T, TabletError>;
