// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::error::HydraError;
use hydra_types::{EpochId, PeerId, Term};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info};

/// Scope of one leader's reign as seen by one peer. Every committer,
/// recovery, and automaton task belongs to exactly one epoch context;
/// cancelling the context is how the peer abandons the epoch.
pub struct EpochContext {
    pub epoch_id: EpochId,
    pub term: Term,
    pub leader_id: PeerId,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    restart_reason: Mutex<Option<HydraError>>,
}

impl EpochContext {
    pub fn new(epoch_id: EpochId, term: Term, leader_id: PeerId) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            epoch_id,
            term,
            leader_id,
            cancel_tx,
            cancel_rx,
            restart_reason: Mutex::new(None),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves when the epoch is cancelled. Periodic tasks select on this
    /// against their tick.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Requests an epoch restart. The first reason wins; repeated calls
    /// are no-ops so every failure path may report unconditionally.
    pub fn restart(&self, reason: HydraError) {
        let mut guard = self.restart_reason.lock();
        if guard.is_some() {
            return;
        }
        match &reason {
            HydraError::InvariantViolation(message) => {
                error!(epoch_id = %self.epoch_id, term = self.term, message, "epoch failed on invariant violation");
            },
            _ => {
                info!(epoch_id = %self.epoch_id, term = self.term, reason = %reason, "epoch restarting");
            },
        }
        *guard = Some(reason);
        let _ = self.cancel_tx.send(true);
    }

    /// Plain cancellation at the end of a healthy epoch.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn restart_reason(&self) -> Option<HydraError> {
        self.restart_reason.lock().clone()
    }
}
