//! Contracts for the collaborators the session layer reads from.
//!
//! The protocol layer owns none of the data it serves. Routing, the log
//! engine and admission control live elsewhere and are reached through
//! these traits.
//!
//! # Available Implementations
//!
//! - [`memory`](super::memory): in-memory log, routing and registry, used by
//!   tests and small embedders
//! - [`ClientQuotaManager`](super::quota::ClientQuotaManager): per-client
//!   byte-rate quota
//!
//! # Trait Hierarchy
//!
//! - [`ShardTable`]: which shard owns a partition
//! - [`PartitionManager`]: the partitions a shard hosts
//! - [`Partition`] / [`LogSnapshot`]: reading a log, live or frozen
//! - [`RecordBatchReader`]: a stream of record batches
//! - [`QuotaManager`]: how long to hold a client back

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::KafkaCode;
use crate::server::request::ApiKey;
use crate::server::response::AbortedTransaction;
use crate::types::{PartitionId, ShardId};

/// Result of a log engine call. Failures are reported as the wire code the
/// client should see for that partition.
pub type PartitionResult<T> = std::result::Result<T, KafkaCode>;

/// Bounds for a single log read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// First offset to return.
    pub start_offset: i64,
    /// Last offset (inclusive) the reader may return.
    pub max_offset: i64,
    /// Byte budget for the read.
    pub max_bytes: usize,
    /// When false the engine may return one batch larger than `max_bytes`
    /// so an oversized batch cannot stall a consumer.
    pub strict_max_bytes: bool,
}

/// A stream of encoded record batches, in offset order.
#[async_trait]
pub trait RecordBatchReader: Send {
    /// Next batch, or `None` once the configured range is exhausted.
    async fn next_batch(&mut self) -> PartitionResult<Option<Bytes>>;
}

/// Routing table from partition to owning shard.
pub trait ShardTable: Send + Sync {
    /// `None` when no shard on this node leads the partition.
    fn shard_for(&self, partition: &PartitionId) -> Option<ShardId>;
}

/// Registry of the partitions hosted by each shard.
pub trait PartitionManager: Send + Sync {
    fn get(&self, shard: ShardId, partition: &PartitionId) -> Option<Arc<dyn Partition>>;
}

/// A partition led by this node.
#[async_trait]
pub trait Partition: Send + Sync {
    fn id(&self) -> &PartitionId;

    /// Reader over the live log. Callers bound `max_offset` by the high
    /// watermark (or last stable offset) themselves.
    async fn make_reader(&self, config: ReaderConfig)
    -> PartitionResult<Box<dyn RecordBatchReader>>;

    /// Offset one past the last committed record.
    fn high_watermark(&self) -> i64;

    /// Offset one past the last record below every open transaction.
    fn last_stable_offset(&self) -> i64;

    fn log_start_offset(&self) -> i64;

    fn leader_epoch(&self) -> i32;

    /// Watch channel carrying the high watermark; it changes whenever new
    /// data becomes visible to consumers.
    fn subscribe(&self) -> watch::Receiver<i64>;

    /// Frozen view of the log including uncommitted data, for follower
    /// replicas.
    async fn snapshot(&self) -> PartitionResult<Arc<dyn LogSnapshot>>;

    /// Transactions aborted within `[start_offset, last_offset]`, or `None`
    /// when the engine does not track them.
    async fn aborted_transactions(
        &self,
        _start_offset: i64,
        _last_offset: i64,
    ) -> Option<Vec<AbortedTransaction>> {
        None
    }
}

/// Point-in-time view of a partition's log.
#[async_trait]
pub trait LogSnapshot: Send + Sync {
    async fn make_reader(&self, config: ReaderConfig)
    -> PartitionResult<Box<dyn RecordBatchReader>>;

    /// Offset of the last record written, committed or not. -1 for an
    /// empty log.
    fn dirty_offset(&self) -> i64;

    fn log_start_offset(&self) -> i64;
}

/// Admission control: how long a client must wait before its request is
/// read off the socket.
#[async_trait]
pub trait QuotaManager: Send + Sync {
    async fn compute_delay(&self, client_id: Option<&str>, api_key: ApiKey, bytes: usize)
    -> Duration;
}
