// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// Lifecycle state of one tablet as recorded in the catalog.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum TabletState {
    Unmounted,
    Mounting,
    FrozenMounting,
    Mounted,
    Frozen,
    Freezing,
    Unfreezing,
    Unmounting,
}

impl TabletState {
    pub fn is_mounted(self) -> bool {
        matches!(self, Self::Mounted | Self::Frozen)
    }

    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Mounting
                | Self::FrozenMounting
                | Self::Freezing
                | Self::Unfreezing
                | Self::Unmounting
        )
    }
}

/// Lifecycle state of a tablet action.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
pub enum ActionState {
    Preparing,
    Freezing,
    Frozen,
    Unmounting,
    Unmounted,
    Mounting,
    Mounted,
    Completed,
    Failing,
    Failed,
    Orphaned,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ActionKind {
    Move,
    Reshard,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum OwnerKind {
    SortedTable,
    OrderedTable,
    HunkStorage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum CellHealth {
    Good,
    Degraded,
    Failed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ReplicaMode {
    Sync,
    Async,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum ReplicaState {
    Enabled,
    Enabling,
    Disabled,
    Disabling,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Atomicity {
    Full,
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum UpdateMode {
    Append,
    Overwrite,
}

/// Lower bound of a sorted tablet's key range. The empty key is the
/// global minimum; the upper bound is the next tablet's pivot.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PivotKey(pub Vec<u8>);

impl PivotKey {
    pub const MIN: PivotKey = PivotKey(Vec::new());

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PivotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            write!(f, "<min>")
        } else {
            for byte in &self.0 {
                write!(f, "{:02x}", byte)?;
            }
            Ok(())
        }
    }
}

/// Per-tablet mount settings shipped with `MountTablet`/`RemountTablet`.
/// An opaque bag from the catalog's point of view; cells interpret it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSettings {
    pub in_memory: bool,
    pub extra: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pivot_key_order() {
        assert!(PivotKey::MIN < PivotKey::from_bytes(b"\x00"));
        assert!(PivotKey::from_bytes(b"a") < PivotKey::from_bytes(b"b"));
        assert!(PivotKey::MIN.is_min());
    }

    #[test]
    fn state_predicates() {
        assert!(TabletState::Mounted.is_mounted());
        assert!(TabletState::Frozen.is_mounted());
        assert!(TabletState::Mounting.is_transient());
        assert!(!TabletState::Unmounted.is_transient());
        assert!(ActionState::Completed.is_terminal());
        assert!(!ActionState::Orphaned.is_terminal());
    }
}
