// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use sha3::{Digest, Sha3_256};

/// Rolling 64-bit digest of everything a peer has applied. Two peers with
/// equal state hashes applied identical record sequences.
pub type StateHash = u64;

/// Digest of one mutation payload, the unit folded into the state hash.
pub fn payload_commit_hash(payload: &[u8]) -> u64 {
    let digest = Sha3_256::digest(payload);
    u64::from_le_bytes(digest[..8].try_into().unwrap())
}

/// Folds one commit hash into the rolling state hash. The combiner is a
/// fixed mixing permutation; any change to it invalidates every persisted
/// snapshot's `state_hash`.
pub fn fold_state_hash(state_hash: StateHash, commit_hash: u64) -> StateHash {
    let mut h = state_hash ^ commit_hash.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    h ^= h >> 32;
    h = h.wrapping_mul(0xd6e8_feb8_6659_fd93);
    h ^= h >> 32;
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn commit_hash_is_stable() {
        assert_eq!(payload_commit_hash(b"abc"), payload_commit_hash(b"abc"));
        assert_ne!(payload_commit_hash(b"abc"), payload_commit_hash(b"abd"));
    }

    proptest! {
        #[test]
        fn fold_is_order_sensitive(a: u64, b: u64, seed: u64) {
            prop_assume!(a != b);
            let ab = fold_state_hash(fold_state_hash(seed, a), b);
            let ba = fold_state_hash(fold_state_hash(seed, b), a);
            prop_assert_ne!(ab, ba);
        }

        #[test]
        fn fold_is_deterministic(seed: u64, commit: u64) {
            prop_assert_eq!(
                fold_state_hash(seed, commit),
                fold_state_hash(seed, commit)
            );
        }
    }
}
