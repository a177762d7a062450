//! In-memory reference collaborators.
//!
//! A log that keeps its record batches in a `Vec`, a routing table and a
//! partition registry backed by [`DashMap`]. They implement the
//! [`traits`](super::traits) contracts faithfully enough to drive the whole
//! fetch path, including watermark notifications for long polls.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use num_traits::FromPrimitive;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI16, AtomicI32, AtomicI64, Ordering};
use tokio::sync::{RwLock, watch};
use tracing::debug;

use super::traits::{
    LogSnapshot, Partition, PartitionManager, PartitionResult, ReaderConfig, RecordBatchReader,
    ShardTable,
};
use crate::error::KafkaCode;
use crate::types::{PartitionId, ShardId};

#[derive(Debug, Clone)]
struct StoredBatch {
    base_offset: i64,
    last_offset: i64,
    data: Bytes,
}

/// Batches overlapping `start_offset` that end at or before `max_offset`.
/// A batch straddling `max_offset` is held back whole.
fn batches_in_range(batches: &[StoredBatch], config: &ReaderConfig) -> VecDeque<Bytes> {
    batches
        .iter()
        .filter(|b| b.last_offset >= config.start_offset && b.last_offset <= config.max_offset)
        .map(|b| b.data.clone())
        .collect()
}

// ============================================================================
// Reader
// ============================================================================

/// Reader over batches copied out of the log when it was created.
#[derive(Debug, Default)]
pub struct VecBatchReader {
    batches: VecDeque<Bytes>,
}

impl VecBatchReader {
    pub fn new(batches: impl IntoIterator<Item = Bytes>) -> Self {
        Self {
            batches: batches.into_iter().collect(),
        }
    }
}

#[async_trait]
impl RecordBatchReader for VecBatchReader {
    async fn next_batch(&mut self) -> PartitionResult<Option<Bytes>> {
        Ok(self.batches.pop_front())
    }
}

// ============================================================================
// Partition
// ============================================================================

/// A single partition log held in memory.
///
/// Appends do not become visible to consumers until [`commit`](Self::commit)
/// moves the high watermark, which also wakes any long-polling fetch.
pub struct InMemoryPartition {
    id: PartitionId,
    log: RwLock<Vec<StoredBatch>>,
    next_offset: AtomicI64,
    last_stable_offset: AtomicI64,
    log_start_offset: AtomicI64,
    leader_epoch: AtomicI32,
    /// Wire code every read fails with; 0 means reads succeed.
    read_error: AtomicI16,
    high_watermark: watch::Sender<i64>,
}

impl InMemoryPartition {
    pub fn new(id: PartitionId) -> Self {
        let (high_watermark, _) = watch::channel(0);
        Self {
            id,
            log: RwLock::new(Vec::new()),
            next_offset: AtomicI64::new(0),
            last_stable_offset: AtomicI64::new(0),
            log_start_offset: AtomicI64::new(0),
            leader_epoch: AtomicI32::new(0),
            read_error: AtomicI16::new(0),
            high_watermark,
        }
    }

    /// Append a batch holding `record_count` records. Returns its base
    /// offset. The data stays invisible to consumers until committed.
    pub async fn append(&self, data: Bytes, record_count: i64) -> i64 {
        let mut log = self.log.write().await;
        let base_offset = self.next_offset.load(Ordering::Acquire);
        let last_offset = base_offset + record_count.max(1) - 1;
        log.push(StoredBatch {
            base_offset,
            last_offset,
            data,
        });
        self.next_offset.store(last_offset + 1, Ordering::Release);
        base_offset
    }

    /// Append and immediately commit everything written so far.
    pub async fn append_committed(&self, data: Bytes, record_count: i64) -> i64 {
        let base_offset = self.append(data, record_count).await;
        self.commit(self.next_offset.load(Ordering::Acquire));
        base_offset
    }

    /// Move the high watermark (and with it the last stable offset) and
    /// notify subscribers.
    pub fn commit(&self, high_watermark: i64) {
        let high_watermark = high_watermark.min(self.next_offset.load(Ordering::Acquire));
        self.last_stable_offset
            .store(high_watermark, Ordering::Release);
        self.high_watermark.send_replace(high_watermark);
        debug!(partition = %self.id, high_watermark, "Committed");
    }

    /// Hold the last stable offset behind the high watermark, as an open
    /// transaction would.
    pub fn set_last_stable_offset(&self, offset: i64) {
        self.last_stable_offset.store(offset, Ordering::Release);
    }

    pub fn set_leader_epoch(&self, epoch: i32) {
        self.leader_epoch.store(epoch, Ordering::Release);
    }

    /// Drop every batch that ends before `offset`.
    pub async fn truncate_prefix(&self, offset: i64) {
        let mut log = self.log.write().await;
        log.retain(|b| b.last_offset >= offset);
        self.log_start_offset.store(offset, Ordering::Release);
    }

    /// Make every subsequent read fail with `code`, or succeed again with
    /// `None`.
    pub fn fail_reads(&self, code: Option<KafkaCode>) {
        let raw = code.map_or(0, KafkaCode::as_i16);
        self.read_error.store(raw, Ordering::Release);
    }

    fn check_readable(&self) -> PartitionResult<()> {
        match self.read_error.load(Ordering::Acquire) {
            0 => Ok(()),
            raw => Err(KafkaCode::from_i16(raw).unwrap_or(KafkaCode::Unknown)),
        }
    }
}

#[async_trait]
impl Partition for InMemoryPartition {
    fn id(&self) -> &PartitionId {
        &self.id
    }

    async fn make_reader(
        &self,
        config: ReaderConfig,
    ) -> PartitionResult<Box<dyn RecordBatchReader>> {
        self.check_readable()?;
        let log = self.log.read().await;
        Ok(Box::new(VecBatchReader {
            batches: batches_in_range(&log, &config),
        }))
    }

    fn high_watermark(&self) -> i64 {
        *self.high_watermark.borrow()
    }

    fn last_stable_offset(&self) -> i64 {
        self.last_stable_offset.load(Ordering::Acquire)
    }

    fn log_start_offset(&self) -> i64 {
        self.log_start_offset.load(Ordering::Acquire)
    }

    fn leader_epoch(&self) -> i32 {
        self.leader_epoch.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.high_watermark.subscribe()
    }

    async fn snapshot(&self) -> PartitionResult<Arc<dyn LogSnapshot>> {
        self.check_readable()?;
        let log = self.log.read().await;
        Ok(Arc::new(InMemorySnapshot {
            batches: log.clone(),
            dirty_offset: self.next_offset.load(Ordering::Acquire) - 1,
            log_start_offset: self.log_start_offset(),
        }))
    }
}

/// Frozen copy of an [`InMemoryPartition`]'s log.
pub struct InMemorySnapshot {
    batches: Vec<StoredBatch>,
    dirty_offset: i64,
    log_start_offset: i64,
}

#[async_trait]
impl LogSnapshot for InMemorySnapshot {
    async fn make_reader(
        &self,
        config: ReaderConfig,
    ) -> PartitionResult<Box<dyn RecordBatchReader>> {
        Ok(Box::new(VecBatchReader {
            batches: batches_in_range(&self.batches, &config),
        }))
    }

    fn dirty_offset(&self) -> i64 {
        self.dirty_offset
    }

    fn log_start_offset(&self) -> i64 {
        self.log_start_offset
    }
}

// ============================================================================
// Routing and registry
// ============================================================================

/// Routing table that changes only when told to.
#[derive(Default)]
pub struct StaticShardTable {
    routes: DashMap<PartitionId, ShardId>,
}

impl StaticShardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, partition: PartitionId, shard: ShardId) {
        self.routes.insert(partition, shard);
    }

    /// Forget the route, as when leadership moves to another node.
    pub fn unassign(&self, partition: &PartitionId) {
        self.routes.remove(partition);
    }
}

impl ShardTable for StaticShardTable {
    fn shard_for(&self, partition: &PartitionId) -> Option<ShardId> {
        self.routes.get(partition).map(|r| *r.value())
    }
}

/// Partition registry keyed by shard.
#[derive(Default)]
pub struct InMemoryPartitionManager {
    partitions: DashMap<(ShardId, PartitionId), Arc<dyn Partition>>,
}

impl InMemoryPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, shard: ShardId, partition: Arc<dyn Partition>) {
        let id = partition.id().clone();
        self.partitions.insert((shard, id), partition);
    }

    pub fn remove(&self, shard: ShardId, partition: &PartitionId) {
        self.partitions.remove(&(shard, partition.clone()));
    }
}

impl PartitionManager for InMemoryPartitionManager {
    fn get(&self, shard: ShardId, partition: &PartitionId) -> Option<Arc<dyn Partition>> {
        self.partitions
            .get(&(shard, partition.clone()))
            .map(|p| Arc::clone(p.value()))
    }
}
