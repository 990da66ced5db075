// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// The elector's view of whether this node is still the lawful leader.
/// The committer consults it before serializing every batch; an invalid
/// lease fails the epoch.
pub trait LeaderLease: Send + Sync {
    fn is_valid(&self) -> bool;
}

/// A lease toggled by hand; the elector collaborator owns the real one.
#[derive(Default)]
pub struct ManualLease {
    invalidated: AtomicBool,
}

impl ManualLease {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }
}

impl LeaderLease for ManualLease {
    fn is_valid(&self) -> bool {
        !self.invalidated.load(Ordering::Acquire)
    }
}
