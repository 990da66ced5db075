// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use hydra_types::MutationId;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Ambient state of exactly one `apply` call. Everything a mutation may
/// legally depend on besides its payload lives here: the replayed
/// timestamp, the replayed random seed (exposed as a seeded RNG), and the
/// client's idempotency key. Anything else (wall clock, OS randomness,
/// unordered-map iteration) breaks determinism and will surface as a
/// state-hash divergence on some other peer.
pub struct MutationContext {
    timestamp: u64,
    random_seed: u64,
    mutation_id: Option<MutationId>,
    rng: StdRng,
    response: Option<Bytes>,
}

impl MutationContext {
    pub(crate) fn new(timestamp: u64, random_seed: u64, mutation_id: Option<MutationId>) -> Self {
        Self {
            timestamp,
            random_seed,
            mutation_id,
            rng: StdRng::seed_from_u64(random_seed),
            response: None,
        }
    }

    /// Leader wall clock at serialization time, advisory.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed
    }

    pub fn mutation_id(&self) -> Option<MutationId> {
        self.mutation_id
    }

    /// Deterministic randomness: seeded identically on every peer that
    /// replays this mutation.
    pub fn random<T>(&mut self) -> T
    where
        rand::distributions::Standard: rand::distributions::Distribution<T>,
    {
        self.rng.r#gen()
    }

    /// Sets the bytes the commit promise resolves with on the leader.
    pub fn set_response(&mut self, response: Bytes) {
        self.response = Some(response);
    }

    pub(crate) fn take_response(&mut self) -> Bytes {
        self.response.take().unwrap_or_default()
    }
}

/// The user-defined deterministic state machine. The engine only ever
/// drives it through these four methods, always from the single automaton
/// task, never concurrently.
pub trait Automaton: Send + 'static {
    /// Applies one mutation payload. Must be deterministic given
    /// `(payload, context)` and must not suspend or touch I/O.
    fn apply(&mut self, context: &mut MutationContext, payload: &[u8]);

    /// Serializes the full state.
    fn save(&self, writer: &mut dyn std::io::Write) -> anyhow::Result<()>;

    /// Replaces the full state with a previously saved one.
    fn load(&mut self, reader: &mut dyn std::io::Read) -> anyhow::Result<()>;

    /// Resets to the empty state.
    fn clear(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_rng_is_replayable() {
        let mut a = MutationContext::new(0, 42, None);
        let mut b = MutationContext::new(0, 42, None);
        let xs: Vec<u64> = (0..8).map(|_| a.random::<u64>()).collect();
        let ys: Vec<u64> = (0..8).map(|_| b.random::<u64>()).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn response_defaults_to_empty() {
        let mut context = MutationContext::new(0, 1, None);
        assert_eq!(context.take_response(), Bytes::new());
        context.set_response(Bytes::from_static(b"ok"));
        assert_eq!(context.take_response(), Bytes::from_static(b"ok"));
    }
}
