// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use crate::rpc::HydraService;
use hydra_types::PeerId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Static description of one peer of the cell.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub address: String,
    pub voting: bool,
}

/// Directory of the peers forming one consensus group. Immutable within an
/// epoch apart from channel registration, which the transport layer
/// performs as connections come up.
pub struct CellManager {
    self_id: PeerId,
    peers: Vec<PeerConfig>,
    channels: RwLock<Vec<Option<Arc<dyn HydraService>>>>,
}

impl CellManager {
    pub fn new(self_id: PeerId, peers: Vec<PeerConfig>) -> Self {
        assert!(
            (self_id as usize) < peers.len(),
            "self id {} out of range for {} peers",
            self_id,
            peers.len()
        );
        let channels = RwLock::new(vec![None; peers.len()]);
        Self {
            self_id,
            peers,
            channels,
        }
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn voting_peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.voting).count()
    }

    pub fn quorum_count(&self) -> usize {
        self.voting_peer_count() / 2 + 1
    }

    pub fn peer(&self, id: PeerId) -> &PeerConfig {
        &self.peers[id as usize]
    }

    pub fn peer_ids(&self) -> impl Iterator<Item = PeerId> + '_ {
        0..self.peers.len() as PeerId
    }

    pub fn register_channel(&self, id: PeerId, channel: Arc<dyn HydraService>) {
        self.channels.write()[id as usize] = Some(channel);
    }

    /// The channel to a peer, or `None` while the transport has not
    /// connected yet.
    pub fn channel_to(&self, id: PeerId) -> Option<Arc<dyn HydraService>> {
        self.channels.read()[id as usize].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(voting: &[bool]) -> Vec<PeerConfig> {
        voting
            .iter()
            .enumerate()
            .map(|(i, &voting)| PeerConfig {
                address: format!("peer-{}", i),
                voting,
            })
            .collect()
    }

    #[test]
    fn quorum_math() {
        let cell = CellManager::new(0, peers(&[true, true, true]));
        assert_eq!(cell.voting_peer_count(), 3);
        assert_eq!(cell.quorum_count(), 2);

        let cell = CellManager::new(0, peers(&[true, true, true, true, false]));
        assert_eq!(cell.peer_count(), 5);
        assert_eq!(cell.voting_peer_count(), 4);
        assert_eq!(cell.quorum_count(), 3);
    }

    #[test]
    fn channels_start_unregistered() {
        let cell = CellManager::new(1, peers(&[true, true]));
        assert!(cell.channel_to(0).is_none());
    }
}
