// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Reshard arithmetic: pivot estimation from chunk boundaries and the
//! redistribution of chunks onto the new tablet list.

use crate::{
    chunk::Chunk,
    error::{TabletError, TabletResult},
    ids::ChunkId,
    types::PivotKey,
};
use itertools::Itertools;
use std::collections::BTreeSet;

/// Estimates pivot keys for `tablet_count` tablets from the combined
/// chunk set of the resharded range. Non-Eden chunks are walked in key
/// order, cutting at equal fractions of the total uncompressed size. The
/// first pivot is always the range's original lower bound.
pub fn compute_pivot_keys(
    chunks: &[Chunk],
    tablet_count: usize,
    first_pivot: &PivotKey,
) -> TabletResult<Vec<PivotKey>> {
    if tablet_count == 0 {
        return Err(TabletError::invalid_argument("tablet count must be positive"));
    }

    let sized: Vec<&Chunk> = chunks
        .iter()
        .filter(|c| !c.eden)
        .sorted_by(|a, b| a.min_key.cmp(&b.min_key))
        .collect();
    let total: u64 = sized.iter().map(|c| c.uncompressed_data_size).sum();

    let mut pivots = vec![first_pivot.clone()];
    if total == 0 {
        if tablet_count > 1 {
            return Err(TabletError::invalid_argument(
                "cannot estimate pivots without sized chunks; pass explicit pivot keys",
            ));
        }
        return Ok(pivots);
    }

    let mut accumulated = 0u64;
    let mut next_cut = 1u64;
    for chunk in &sized {
        if pivots.len() == tablet_count {
            break;
        }
        accumulated += chunk.uncompressed_data_size;
        // Cut whenever the running total crosses the next equal fraction.
        while next_cut < tablet_count as u64
            && accumulated * tablet_count as u64 > next_cut * total
        {
            if chunk.min_key > *pivots.last().expect("non-empty") {
                pivots.push(chunk.min_key.clone());
            }
            next_cut += 1;
        }
    }

    if pivots.len() < tablet_count {
        return Err(TabletError::invalid_argument(format!(
            "chunk boundaries only support {} tablets, {} requested",
            pivots.len(),
            tablet_count
        )));
    }
    Ok(pivots)
}

/// Validates explicit pivots against the range's bounds.
pub fn validate_pivot_keys(
    pivots: &[PivotKey],
    first_pivot: &PivotKey,
    upper_bound: Option<&PivotKey>,
) -> TabletResult<()> {
    if pivots.is_empty() {
        return Err(TabletError::invalid_argument("pivot key list is empty"));
    }
    if pivots[0] != *first_pivot {
        return Err(TabletError::invalid_argument(format!(
            "first pivot {} must equal the range's lower bound {}",
            pivots[0], first_pivot
        )));
    }
    for pair in pivots.windows(2) {
        if pair[0] >= pair[1] {
            return Err(TabletError::invalid_argument(format!(
                "pivot keys must be strictly increasing, got {} then {}",
                pair[0], pair[1]
            )));
        }
    }
    if let Some(upper) = upper_bound {
        if pivots.last().expect("non-empty") >= upper {
            return Err(TabletError::invalid_argument(format!(
                "last pivot {} reaches into the next tablet at {}",
                pivots.last().expect("non-empty"),
                upper
            )));
        }
    }
    Ok(())
}

/// Places every chunk with the tablet whose key range contains its
/// `min_key`: the last pivot at or below it.
pub fn distribute_chunks_sorted(chunks: Vec<Chunk>, pivots: &[PivotKey]) -> Vec<Vec<Chunk>> {
    let mut buckets: Vec<Vec<Chunk>> = (0..pivots.len()).map(|_| Vec::new()).collect();
    for chunk in chunks {
        let index = pivots
            .iter()
            .rposition(|p| *p <= chunk.min_key)
            .unwrap_or(0);
        buckets[index].push(chunk);
    }
    buckets
}

/// Ordered tables have no keys; the chunks spread evenly over the new
/// shard count, preserving order.
pub fn distribute_chunks_ordered(chunks: Vec<Chunk>, tablet_count: usize) -> Vec<Vec<Chunk>> {
    let mut buckets: Vec<Vec<Chunk>> = (0..tablet_count).map(|_| Vec::new()).collect();
    let per_bucket = chunks.len().div_ceil(tablet_count.max(1));
    for (i, chunk) in chunks.into_iter().enumerate() {
        let index = (i / per_bucket.max(1)).min(tablet_count - 1);
        buckets[index].push(chunk);
    }
    buckets
}

/// Hunk chunks referenced anywhere in the store set; these attach to the
/// owner's hunk root so every split tablet keeps access.
pub fn collect_hunk_refs(chunks: &[Chunk]) -> BTreeSet<ChunkId> {
    chunks
        .iter()
        .flat_map(|c| c.hunk_refs.iter().copied())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::{assert_err, assert_ok};

    fn chunk(id: u64, key: &[u8], size: u64) -> Chunk {
        Chunk::new(ChunkId(id), PivotKey::from_bytes(key), size)
    }

    #[test]
    fn pivots_cut_at_equal_fractions() {
        let chunks = vec![
            chunk(1, b"a", 100),
            chunk(2, b"b", 100),
            chunk(3, b"c", 100),
            chunk(4, b"d", 100),
            chunk(5, b"e", 100),
            chunk(6, b"f", 100),
        ];
        let pivots = assert_ok!(compute_pivot_keys(&chunks, 3, &PivotKey::MIN));
        assert_eq!(pivots.len(), 3);
        assert_eq!(pivots[0], PivotKey::MIN);
        assert_eq!(pivots[1], PivotKey::from_bytes(b"c"));
        assert_eq!(pivots[2], PivotKey::from_bytes(b"e"));
    }

    #[test]
    fn eden_chunks_do_not_move_pivots() {
        let chunks = vec![
            chunk(1, b"a", 10),
            chunk(2, b"b", 10),
            chunk(3, b"m", 1_000_000).with_eden(),
        ];
        let pivots = assert_ok!(compute_pivot_keys(&chunks, 2, &PivotKey::MIN));
        assert_eq!(pivots, vec![PivotKey::MIN, PivotKey::from_bytes(b"b")]);
    }

    #[test]
    fn too_many_tablets_for_boundaries() {
        let chunks = vec![chunk(1, b"a", 100)];
        assert_err!(compute_pivot_keys(&chunks, 3, &PivotKey::MIN));
    }

    #[test]
    fn explicit_pivot_validation() {
        let first = PivotKey::MIN;
        assert_ok!(validate_pivot_keys(
            &[PivotKey::MIN, PivotKey::from_bytes(b"m")],
            &first,
            Some(&PivotKey::from_bytes(b"z")),
        ));
        assert_err!(validate_pivot_keys(
            &[PivotKey::from_bytes(b"m"), PivotKey::from_bytes(b"m")],
            &first,
            None,
        ));
        assert_err!(validate_pivot_keys(
            &[PivotKey::MIN, PivotKey::from_bytes(b"z")],
            &first,
            Some(&PivotKey::from_bytes(b"y")),
        ));
    }

    #[test]
    fn sorted_distribution_follows_pivots() {
        let chunks = vec![chunk(1, b"a", 1), chunk(2, b"k", 1), chunk(3, b"x", 1)];
        let pivots = vec![PivotKey::MIN, PivotKey::from_bytes(b"j")];
        let buckets = distribute_chunks_sorted(chunks, &pivots);
        assert_eq!(buckets[0].len(), 1);
        assert_eq!(buckets[1].len(), 2);
    }

    #[test]
    fn hunk_refs_are_unioned() {
        let chunks = vec![
            chunk(1, b"a", 1).with_hunk_refs(vec![ChunkId(100), ChunkId(101)]),
            chunk(2, b"b", 1).with_hunk_refs(vec![ChunkId(101)]),
        ];
        let refs = collect_hunk_refs(&chunks);
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&ChunkId(100)));
    }

    proptest::proptest! {
        #[test]
        fn sorted_distribution_conserves_chunks(
            keys in proptest::collection::vec(1u8..=255, 1..40)
        ) {
            let chunks: Vec<Chunk> = keys
                .iter()
                .enumerate()
                .map(|(i, k)| chunk(i as u64, &[*k], 1))
                .collect();
            let pivots = vec![
                PivotKey::MIN,
                PivotKey::from_bytes(b"\x40"),
                PivotKey::from_bytes(b"\x80"),
            ];
            let buckets = distribute_chunks_sorted(chunks.clone(), &pivots);
            let total: usize = buckets.iter().map(Vec::len).sum();
            proptest::prop_assert_eq!(total, chunks.len());
            for (i, bucket) in buckets.iter().enumerate() {
                for chunk in bucket {
                    proptest::prop_assert!(chunk.min_key >= pivots[i]);
                    if let Some(next) = pivots.get(i + 1) {
                        proptest::prop_assert!(&chunk.min_key < next);
                    }
                }
            }
        }
    }
}
