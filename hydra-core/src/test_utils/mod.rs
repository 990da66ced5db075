// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! Deterministic automatons and channel fakes shared by the unit tests
//! and the cell-level scenarios in `tests/`.

use crate::{
    automaton::{Automaton, MutationContext},
    error::{HydraError, HydraResult},
    rpc::{
        AcceptMutationsRequest, AcceptMutationsResponse, ChangelogInfoResponse, HydraService,
        PingFollowerRequest, SnapshotInfoResponse,
    },
};
use async_trait::async_trait;
use bytes::Bytes;
use hydra_types::{MutationHeader, MutationRecord, SequenceNumber, Version};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// A tiny deterministic automaton. Payloads are ASCII commands:
/// `add:<n>` bumps the counter, `set:<k>=<v>` writes a key, anything else
/// is counted but otherwise ignored. Responses echo the resulting counter.
#[derive(Default, Serialize, Deserialize)]
pub struct CountingAutomaton {
    pub counter: u64,
    pub entries: BTreeMap<String, String>,
    pub applied: u64,
}

impl Automaton for CountingAutomaton {
    fn apply(&mut self, context: &mut MutationContext, payload: &[u8]) {
        self.applied += 1;
        let text = String::from_utf8_lossy(payload);
        if let Some(n) = text.strip_prefix("add:") {
            self.counter += n.parse::<u64>().unwrap_or(0);
        } else if let Some(kv) = text.strip_prefix("set:") {
            if let Some((k, v)) = kv.split_once('=') {
                self.entries.insert(k.to_owned(), v.to_owned());
            }
        }
        context.set_response(Bytes::from(self.counter.to_string()));
    }

    fn save(&self, writer: &mut dyn std::io::Write) -> anyhow::Result<()> {
        let buf = bcs::to_bytes(self)?;
        writer.write_all(&buf)?;
        Ok(())
    }

    fn load(&mut self, reader: &mut dyn std::io::Read) -> anyhow::Result<()> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        *self = bcs::from_bytes(&buf)?;
        Ok(())
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Builds a record whose random seed equals its sequence number, so the
/// seed chain of a dense sequence is `prev = seq - 1` starting from zero.
pub fn record_frame(
    sequence_number: SequenceNumber,
    version: Version,
    prev_random_seed: u64,
    payload: &[u8],
) -> (MutationRecord, Bytes) {
    let record = MutationRecord {
        header: MutationHeader {
            reign: 1,
            mutation_type: "test".to_owned(),
            timestamp: 1_000 + sequence_number,
            random_seed: sequence_number,
            prev_random_seed,
            segment_id: version.segment_id,
            record_id: version.record_id,
            sequence_number,
            term: 1,
            mutation_id: None,
        },
        payload: Bytes::copy_from_slice(payload),
    };
    let frame = record.encode().expect("test record encodes");
    (record, frame)
}

/// Wraps a channel and drops every call while "partitioned".
pub struct PartitionableChannel {
    inner: Arc<dyn HydraService>,
    partitioned: Arc<AtomicBool>,
}

impl PartitionableChannel {
    pub fn new(inner: Arc<dyn HydraService>) -> (Arc<Self>, Arc<AtomicBool>) {
        let partitioned = Arc::new(AtomicBool::new(false));
        (
            Arc::new(Self {
                inner,
                partitioned: partitioned.clone(),
            }),
            partitioned,
        )
    }

    fn check(&self) -> HydraResult<()> {
        if self.partitioned.load(Ordering::Acquire) {
            Err(HydraError::unavailable("network partition"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HydraService for PartitionableChannel {
    async fn accept_mutations(
        &self,
        request: AcceptMutationsRequest,
    ) -> HydraResult<AcceptMutationsResponse> {
        self.check()?;
        self.inner.accept_mutations(request).await
    }

    async fn ping_follower(&self, request: PingFollowerRequest) -> HydraResult<()> {
        self.check()?;
        self.inner.ping_follower(request).await
    }

    async fn lookup_snapshot(&self, max_snapshot_id: u32) -> HydraResult<Option<u32>> {
        self.check()?;
        self.inner.lookup_snapshot(max_snapshot_id).await
    }

    async fn get_snapshot_info(&self, snapshot_id: u32) -> HydraResult<SnapshotInfoResponse> {
        self.check()?;
        self.inner.get_snapshot_info(snapshot_id).await
    }

    async fn read_snapshot(
        &self,
        snapshot_id: u32,
        offset: u64,
        length: usize,
    ) -> HydraResult<Bytes> {
        self.check()?;
        self.inner.read_snapshot(snapshot_id, offset, length).await
    }

    async fn get_changelog_info(&self, segment_id: u32) -> HydraResult<ChangelogInfoResponse> {
        self.check()?;
        self.inner.get_changelog_info(segment_id).await
    }

    async fn read_changelog(
        &self,
        segment_id: u32,
        start_record_id: u32,
        record_count: usize,
    ) -> HydraResult<Vec<Bytes>> {
        self.check()?;
        self.inner
            .read_changelog(segment_id, start_record_id, record_count)
            .await
    }

    async fn force_restart(&self, reason: String) -> HydraResult<()> {
        self.check()?;
        self.inner.force_restart(reason).await
    }
}

/// Polls `condition` until it holds or the deadline passes.
pub async fn eventually<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if condition() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition never held: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
