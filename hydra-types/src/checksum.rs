// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

use sha3::{Digest, Sha3_256};

/// 64-bit content checksum, as exchanged between peers after a distributed
/// snapshot and embedded in snapshot files.
pub type Checksum = u64;

/// Incremental checksum over a byte stream.
#[derive(Default)]
pub struct ChecksumStream {
    hasher: Sha3_256,
}

impl ChecksumStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finish(self) -> Checksum {
        let digest = self.hasher.finalize();
        u64::from_le_bytes(digest[..8].try_into().unwrap())
    }
}

/// One-shot convenience for in-memory buffers.
pub fn checksum_of(data: &[u8]) -> Checksum {
    let mut stream = ChecksumStream::new();
    stream.update(data);
    stream.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_one_shot() {
        let mut stream = ChecksumStream::new();
        stream.update(b"hello ");
        stream.update(b"world");
        assert_eq!(stream.finish(), checksum_of(b"hello world"));
    }
}
