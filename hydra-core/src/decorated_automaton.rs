// Copyright © Hydra Labs
// SPDX-License-Identifier: Apache-2.0

//! The decorated automaton: wraps the user automaton with versioning,
//! sequence tracking, the deterministic mutation context, state-hash
//! folding, and snapshot build/load. All automaton access funnels through
//! one host task; the rest of the engine sees atomically published
//! counters plus a job queue.

use crate::{
    automaton::{Automaton, MutationContext},
    epoch::EpochContext,
    error::{HydraError, HydraResult},
};
use bytes::Bytes;
use hydra_storage::{SnapshotMeta, SnapshotParams, SnapshotReader, SnapshotStore};
use hydra_types::{
    fold_state_hash, payload_commit_hash, ChecksumStream, MutationId, MutationRecord,
    ReachableState, SequenceNumber, StateHash, Version,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub type CommitPromise = oneshot::Sender<HydraResult<Bytes>>;

/// One serialized mutation travelling from a committer to the automaton.
pub struct PendingMutation {
    pub record: MutationRecord,
    /// The encoded frame, exactly as logged and shipped to followers.
    pub frame: Bytes,
    promise: Mutex<Option<CommitPromise>>,
}

impl PendingMutation {
    pub fn new(record: MutationRecord, frame: Bytes, promise: Option<CommitPromise>) -> Arc<Self> {
        Arc::new(Self {
            record,
            frame,
            promise: Mutex::new(promise),
        })
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.record.header.sequence_number
    }

    pub fn version(&self) -> Version {
        self.record.version()
    }

    pub fn data_size(&self) -> usize {
        self.frame.len()
    }

    /// Resolves the commit promise; later resolutions are no-ops.
    pub fn resolve(&self, result: HydraResult<Bytes>) {
        if let Some(promise) = self.promise.lock().take() {
            let _ = promise.send(result);
        }
    }
}

struct SnapshotPayload {
    meta: SnapshotMeta,
    data: Vec<u8>,
}

enum AutomatonJob {
    Apply {
        mutations: Vec<Arc<PendingMutation>>,
    },
    ApplyDuringRecovery {
        frame: Bytes,
        reply: oneshot::Sender<HydraResult<()>>,
    },
    ScheduleSnapshot {
        snapshot_id: u32,
        sequence_number: SequenceNumber,
        reply: oneshot::Sender<HydraResult<SnapshotPayload>>,
    },
    LoadSnapshot {
        meta: SnapshotMeta,
        payload: Bytes,
        reply: oneshot::Sender<HydraResult<()>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
}

/// Bounded map of `mutation_id -> committed response`, serving client
/// idempotency across retries.
struct KeptResponses {
    capacity: usize,
    map: HashMap<MutationId, Bytes>,
    order: VecDeque<MutationId>,
}

impl KeptResponses {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, id: MutationId, response: Bytes) {
        if self.map.insert(id, response).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
    }

    fn get(&self, id: &MutationId) -> Option<Bytes> {
        self.map.get(id).cloned()
    }
}

fn pack_version(version: Version) -> u64 {
    (u64::from(version.segment_id) << 32) | u64::from(version.record_id)
}

fn unpack_version(packed: u64) -> Version {
    Version::new((packed >> 32) as u32, packed as u32)
}

pub struct DecoratedAutomaton {
    snapshot_store: Arc<dyn SnapshotStore>,
    job_tx: mpsc::UnboundedSender<AutomatonJob>,

    // Last applied mutation, published for lock-free queries.
    version: AtomicU64,
    sequence_number: AtomicU64,
    random_seed: AtomicU64,
    state_hash: AtomicU64,
    last_mutation_term: AtomicU32,
    timestamp: AtomicU64,

    user_lock: AtomicUsize,
    system_lock: AtomicUsize,
    building_snapshot: AtomicBool,

    kept: Mutex<KeptResponses>,
    epoch: RwLock<Option<Arc<EpochContext>>>,
}

impl DecoratedAutomaton {
    pub fn new(
        automaton: Box<dyn Automaton>,
        snapshot_store: Arc<dyn SnapshotStore>,
        max_kept_responses: usize,
    ) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let decorated = Arc::new(Self {
            snapshot_store,
            job_tx,
            version: AtomicU64::new(0),
            sequence_number: AtomicU64::new(0),
            random_seed: AtomicU64::new(0),
            state_hash: AtomicU64::new(0),
            last_mutation_term: AtomicU32::new(0),
            timestamp: AtomicU64::new(0),
            user_lock: AtomicUsize::new(0),
            system_lock: AtomicUsize::new(0),
            building_snapshot: AtomicBool::new(false),
            kept: Mutex::new(KeptResponses::new(max_kept_responses)),
            epoch: RwLock::new(None),
        });
        tokio::spawn(run_host(automaton, job_rx, Arc::downgrade(&decorated)));
        decorated
    }

    pub fn version(&self) -> Version {
        unpack_version(self.version.load(Ordering::Acquire))
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.sequence_number.load(Ordering::Acquire)
    }

    pub fn random_seed(&self) -> u64 {
        self.random_seed.load(Ordering::Acquire)
    }

    pub fn state_hash(&self) -> StateHash {
        self.state_hash.load(Ordering::Acquire)
    }

    pub fn last_mutation_term(&self) -> u32 {
        self.last_mutation_term.load(Ordering::Acquire)
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn reachable_state(&self) -> ReachableState {
        ReachableState::new(self.version().segment_id, self.sequence_number())
    }

    pub fn is_building_snapshot(&self) -> bool {
        self.building_snapshot.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: Arc<EpochContext>) {
        *self.epoch.write() = Some(epoch);
    }

    pub fn clear_epoch(&self) {
        *self.epoch.write() = None;
    }

    fn current_epoch(&self) -> Option<Arc<EpochContext>> {
        self.epoch.read().clone()
    }

    /// Returns the kept response when this mutation id already committed.
    pub fn try_begin_kept_request(&self, mutation_id: MutationId) -> Option<Bytes> {
        self.kept.lock().get(&mutation_id)
    }

    /// Enqueues a committed batch for application. Order across calls is
    /// preserved by the host queue; callers must never reorder batches.
    pub fn apply_mutations(&self, mutations: Vec<Arc<PendingMutation>>) -> HydraResult<()> {
        self.job_tx
            .send(AutomatonJob::Apply { mutations })
            .map_err(|_| HydraError::unavailable("automaton host stopped"))
    }

    /// Applies one downloaded record during recovery, awaiting the result.
    pub async fn apply_mutation_during_recovery(&self, frame: Bytes) -> HydraResult<()> {
        let (reply, rx) = oneshot::channel();
        self.job_tx
            .send(AutomatonJob::ApplyDuringRecovery { frame, reply })
            .map_err(|_| HydraError::unavailable("automaton host stopped"))?;
        rx.await
            .map_err(|_| HydraError::unavailable("automaton host stopped"))?
    }

    /// Builds a snapshot capturing exactly the applied prefix ending at
    /// `sequence_number`. Resolves once every preceding mutation has been
    /// applied and the snapshot is durable in the local store.
    pub async fn build_snapshot(
        self: &Arc<Self>,
        snapshot_id: u32,
        sequence_number: SequenceNumber,
    ) -> HydraResult<SnapshotParams> {
        let _lock = self.acquire_system_lock();
        self.building_snapshot.store(true, Ordering::Release);
        let _building = scopeguard::guard((), |()| {
            self.building_snapshot.store(false, Ordering::Release);
        });
        self.do_build_snapshot(snapshot_id, sequence_number).await
    }

    async fn do_build_snapshot(
        &self,
        snapshot_id: u32,
        sequence_number: SequenceNumber,
    ) -> HydraResult<SnapshotParams> {
        let (reply, rx) = oneshot::channel();
        self.job_tx
            .send(AutomatonJob::ScheduleSnapshot {
                snapshot_id,
                sequence_number,
                reply,
            })
            .map_err(|_| HydraError::unavailable("automaton host stopped"))?;
        let payload = rx
            .await
            .map_err(|_| HydraError::unavailable("automaton host stopped"))??;

        let mut writer = self.snapshot_store.create_writer(payload.meta).await?;
        writer.write(&payload.data).await?;
        let params = writer.finish().await?;
        info!(
            snapshot_id,
            sequence_number,
            state_hash = format_args!("{:016x}", params.meta.state_hash),
            "local snapshot built"
        );
        Ok(params)
    }

    /// Clears the automaton and installs the state captured by a snapshot.
    pub async fn load_snapshot(
        self: &Arc<Self>,
        mut reader: Box<dyn SnapshotReader>,
    ) -> HydraResult<()> {
        let _guard = self.acquire_system_lock();
        let meta = reader.meta().clone();
        let expected_checksum = reader.checksum();
        let payload = read_all(reader.as_mut()).await?;

        let mut checksum = ChecksumStream::new();
        checksum.update(&payload);
        if checksum.finish() != expected_checksum {
            return Err(HydraError::invariant(format!(
                "snapshot {} payload does not match its checksum",
                meta.snapshot_id
            )));
        }

        let (reply, rx) = oneshot::channel();
        self.job_tx
            .send(AutomatonJob::LoadSnapshot {
                meta,
                payload,
                reply,
            })
            .map_err(|_| HydraError::unavailable("automaton host stopped"))?;
        rx.await
            .map_err(|_| HydraError::unavailable("automaton host stopped"))?
    }

    /// Verifies a snapshot's integrity without touching live state.
    pub async fn validate_snapshot(mut reader: Box<dyn SnapshotReader>) -> HydraResult<()> {
        let expected_checksum = reader.checksum();
        let snapshot_id = reader.meta().snapshot_id;
        let payload = read_all(reader.as_mut()).await?;
        let mut checksum = ChecksumStream::new();
        checksum.update(&payload);
        if checksum.finish() != expected_checksum {
            return Err(HydraError::invariant(format!(
                "snapshot {} payload does not match its checksum",
                snapshot_id
            )));
        }
        Ok(())
    }

    pub async fn clear(&self) -> HydraResult<()> {
        let (reply, rx) = oneshot::channel();
        self.job_tx
            .send(AutomatonJob::Clear { reply })
            .map_err(|_| HydraError::unavailable("automaton host stopped"))?;
        rx.await
            .map_err(|_| HydraError::unavailable("automaton host stopped"))
    }

    /// Acquires the user lock unless the system lock is held. User-facing
    /// entry points hold this guard for the duration of their enqueue.
    pub fn try_acquire_user_lock(self: &Arc<Self>) -> Option<UserLockGuard> {
        self.user_lock.fetch_add(1, Ordering::AcqRel);
        if self.system_lock.load(Ordering::Acquire) > 0 {
            self.user_lock.fetch_sub(1, Ordering::AcqRel);
            None
        } else {
            Some(UserLockGuard {
                automaton: self.clone(),
            })
        }
    }

    fn acquire_system_lock(self: &Arc<Self>) -> SystemLockGuard {
        self.system_lock.fetch_add(1, Ordering::AcqRel);
        SystemLockGuard {
            automaton: self.clone(),
        }
    }
}

/// Holding this permits one user-originated operation; dropping it on any
/// exit path releases the latch.
pub struct UserLockGuard {
    automaton: Arc<DecoratedAutomaton>,
}

impl Drop for UserLockGuard {
    fn drop(&mut self) {
        self.automaton.user_lock.fetch_sub(1, Ordering::AcqRel);
    }
}

struct SystemLockGuard {
    automaton: Arc<DecoratedAutomaton>,
}

impl Drop for SystemLockGuard {
    fn drop(&mut self) {
        self.automaton.system_lock.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn read_all(reader: &mut dyn SnapshotReader) -> HydraResult<Bytes> {
    let mut buffer = Vec::with_capacity(reader.length() as usize);
    loop {
        let chunk = reader.read(1 << 20).await?;
        if chunk.is_empty() {
            break;
        }
        buffer.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(buffer))
}

struct PendingSnapshot {
    snapshot_id: u32,
    sequence_number: SequenceNumber,
    reply: oneshot::Sender<HydraResult<SnapshotPayload>>,
}

struct Host {
    automaton: Box<dyn Automaton>,
    decorated: Weak<DecoratedAutomaton>,
    pending_snapshot: Option<PendingSnapshot>,
}

async fn run_host(
    automaton: Box<dyn Automaton>,
    mut job_rx: mpsc::UnboundedReceiver<AutomatonJob>,
    decorated: Weak<DecoratedAutomaton>,
) {
    let mut host = Host {
        automaton,
        decorated,
        pending_snapshot: None,
    };
    while let Some(job) = job_rx.recv().await {
        let Some(decorated) = host.decorated.upgrade() else {
            break;
        };
        match job {
            AutomatonJob::Apply { mutations } => {
                let mut failed: Option<HydraError> = None;
                for mutation in &mutations {
                    if let Some(error) = &failed {
                        mutation.resolve(Err(error.clone()));
                        continue;
                    }
                    if let Err(error) = host.apply_one(&decorated, mutation) {
                        mutation.resolve(Err(error.clone()));
                        if let Some(epoch) = decorated.current_epoch() {
                            epoch.restart(error.clone());
                        }
                        failed = Some(error);
                    }
                }
            },
            AutomatonJob::ApplyDuringRecovery { frame, reply } => {
                let result = MutationRecord::decode(&frame)
                    .map_err(|e| {
                        HydraError::invariant(format!("undecodable record during recovery: {}", e))
                    })
                    .and_then(|record| {
                        let mutation = PendingMutation::new(record, frame, None);
                        host.apply_one(&decorated, &mutation)
                    });
                let _ = reply.send(result);
            },
            AutomatonJob::ScheduleSnapshot {
                snapshot_id,
                sequence_number,
                reply,
            } => {
                let applied = decorated.sequence_number();
                if applied > sequence_number {
                    let _ = reply.send(Err(HydraError::invariant(format!(
                        "snapshot {} requested at sequence {} but {} is already applied",
                        snapshot_id, sequence_number, applied
                    ))));
                } else if let Some(stale) = host.pending_snapshot.replace(PendingSnapshot {
                    snapshot_id,
                    sequence_number,
                    reply,
                }) {
                    // A newer rotation supersedes the old session.
                    warn!(
                        snapshot_id = stale.snapshot_id,
                        "pending snapshot superseded"
                    );
                    let _ = stale.reply.send(Err(HydraError::unavailable(
                        "snapshot superseded by a newer rotation",
                    )));
                    host.maybe_build_pending_snapshot(&decorated);
                } else {
                    host.maybe_build_pending_snapshot(&decorated);
                }
            },
            AutomatonJob::LoadSnapshot {
                meta,
                payload,
                reply,
            } => {
                let _ = reply.send(host.load(&decorated, meta, payload));
            },
            AutomatonJob::Clear { reply } => {
                host.automaton.clear();
                decorated.version.store(0, Ordering::Release);
                decorated.sequence_number.store(0, Ordering::Release);
                decorated.random_seed.store(0, Ordering::Release);
                decorated.state_hash.store(0, Ordering::Release);
                decorated.last_mutation_term.store(0, Ordering::Release);
                decorated.timestamp.store(0, Ordering::Release);
                let _ = reply.send(());
            },
        }
    }
}

impl Host {
    fn apply_one(
        &mut self,
        decorated: &Arc<DecoratedAutomaton>,
        mutation: &Arc<PendingMutation>,
    ) -> HydraResult<()> {
        let header = &mutation.record.header;
        let current_seed = decorated.random_seed.load(Ordering::Acquire);
        if header.prev_random_seed != current_seed {
            return Err(HydraError::invariant(format!(
                "random seed chain broken at sequence {}: prev {:016x}, have {:016x}",
                header.sequence_number, header.prev_random_seed, current_seed
            )));
        }
        let applied = decorated.sequence_number.load(Ordering::Acquire);
        if header.sequence_number != applied + 1 {
            return Err(HydraError::invariant(format!(
                "sequence gap: applying {} after {}",
                header.sequence_number, applied
            )));
        }
        let version = mutation.version();
        if pack_version(version) <= decorated.version.load(Ordering::Acquire) && applied > 0 {
            return Err(HydraError::invariant(format!(
                "version went backwards at {}",
                version
            )));
        }

        let mut context =
            MutationContext::new(header.timestamp, header.random_seed, header.mutation_id);
        self.automaton
            .apply(&mut context, &mutation.record.payload);
        let response = context.take_response();

        decorated
            .version
            .store(pack_version(version), Ordering::Release);
        decorated
            .sequence_number
            .store(header.sequence_number, Ordering::Release);
        decorated
            .random_seed
            .store(header.random_seed, Ordering::Release);
        decorated
            .last_mutation_term
            .store(header.term, Ordering::Release);
        decorated.timestamp.store(header.timestamp, Ordering::Release);
        let folded = fold_state_hash(
            decorated.state_hash.load(Ordering::Acquire),
            payload_commit_hash(&mutation.record.payload),
        );
        decorated.state_hash.store(folded, Ordering::Release);

        if let Some(mutation_id) = header.mutation_id {
            decorated.kept.lock().insert(mutation_id, response.clone());
        }

        debug!(
            sequence_number = header.sequence_number,
            version = %version,
            "mutation applied"
        );
        mutation.resolve(Ok(response));

        self.maybe_build_pending_snapshot(decorated);
        Ok(())
    }

    fn maybe_build_pending_snapshot(&mut self, decorated: &Arc<DecoratedAutomaton>) {
        let applied = decorated.sequence_number();
        let due = self
            .pending_snapshot
            .as_ref()
            .is_some_and(|p| p.sequence_number <= applied);
        if !due {
            return;
        }
        let pending = self.pending_snapshot.take().expect("pending checked above");

        let mut data = Vec::new();
        let result = self
            .automaton
            .save(&mut data)
            .map(|()| SnapshotPayload {
                meta: SnapshotMeta {
                    snapshot_id: pending.snapshot_id,
                    last_segment_id: decorated.version().segment_id,
                    sequence_number: applied,
                    random_seed: decorated.random_seed(),
                    state_hash: decorated.state_hash(),
                    last_mutation_term: decorated.last_mutation_term(),
                    timestamp: decorated.timestamp(),
                },
                data,
            })
            .map_err(|e| HydraError::logging_failed(format!("automaton save failed: {}", e)));
        let _ = pending.reply.send(result);
    }

    fn load(
        &mut self,
        decorated: &Arc<DecoratedAutomaton>,
        meta: SnapshotMeta,
        payload: Bytes,
    ) -> HydraResult<()> {
        self.automaton.clear();
        let mut reader = std::io::Cursor::new(payload.as_ref());
        self.automaton
            .load(&mut reader)
            .map_err(|e| HydraError::invariant(format!("automaton load failed: {}", e)))?;

        decorated.version.store(
            pack_version(Version::new(meta.last_segment_id, 0)),
            Ordering::Release,
        );
        decorated
            .sequence_number
            .store(meta.sequence_number, Ordering::Release);
        decorated
            .random_seed
            .store(meta.random_seed, Ordering::Release);
        decorated
            .state_hash
            .store(meta.state_hash, Ordering::Release);
        decorated
            .last_mutation_term
            .store(meta.last_mutation_term, Ordering::Release);
        decorated.timestamp.store(meta.timestamp, Ordering::Release);

        info!(
            snapshot_id = meta.snapshot_id,
            sequence_number = meta.sequence_number,
            "snapshot loaded"
        );
        Ok(())
    }
}
