//! Reading one partition for a fetch.
//!
//! Consumers read the live log up to what is committed. Follower replicas
//! read a snapshot that includes uncommitted data, bounded by the dirty
//! offset. [`PartitionWrapper`] hides the difference from the fetch path.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::trace;

use crate::cluster::traits::{
    LogSnapshot, Partition, PartitionResult, ReaderConfig, RecordBatchReader,
};
use crate::error::KafkaCode;
use crate::server::response::AbortedTransaction;

/// A partition as seen by one fetch.
#[derive(Clone)]
pub enum PartitionWrapper {
    Live(Arc<dyn Partition>),
    Snapshot {
        partition: Arc<dyn Partition>,
        log: Arc<dyn LogSnapshot>,
    },
}

impl PartitionWrapper {
    /// Pick the view appropriate for `replica_id`: a snapshot for follower
    /// replicas (`>= 0`), the live partition for consumers.
    pub async fn for_replica(
        partition: Arc<dyn Partition>,
        replica_id: i32,
    ) -> PartitionResult<Self> {
        if replica_id >= 0 {
            let log = partition.snapshot().await?;
            Ok(PartitionWrapper::Snapshot { partition, log })
        } else {
            Ok(PartitionWrapper::Live(partition))
        }
    }

    fn partition(&self) -> &Arc<dyn Partition> {
        match self {
            PartitionWrapper::Live(partition) => partition,
            PartitionWrapper::Snapshot { partition, .. } => partition,
        }
    }

    /// Whether this view is frozen at the moment it was created.
    pub fn is_snapshot(&self) -> bool {
        matches!(self, PartitionWrapper::Snapshot { .. })
    }

    pub async fn make_reader(
        &self,
        config: ReaderConfig,
    ) -> PartitionResult<Box<dyn RecordBatchReader>> {
        match self {
            PartitionWrapper::Live(partition) => partition.make_reader(config).await,
            PartitionWrapper::Snapshot { log, .. } => log.make_reader(config).await,
        }
    }

    /// A snapshot reports its dirty offset so that the answer does not move
    /// with writes that land after it was taken.
    pub fn high_watermark(&self) -> i64 {
        match self {
            PartitionWrapper::Live(partition) => partition.high_watermark(),
            PartitionWrapper::Snapshot { log, .. } => log.dirty_offset(),
        }
    }

    pub fn last_stable_offset(&self) -> i64 {
        match self {
            PartitionWrapper::Live(partition) => partition.last_stable_offset(),
            PartitionWrapper::Snapshot { log, .. } => log.dirty_offset(),
        }
    }

    pub fn log_start_offset(&self) -> i64 {
        match self {
            PartitionWrapper::Live(partition) => partition.log_start_offset(),
            PartitionWrapper::Snapshot { log, .. } => log.log_start_offset(),
        }
    }

    /// One past the last offset this view may hand out.
    fn read_limit(&self, read_committed: bool) -> i64 {
        match self {
            PartitionWrapper::Live(partition) if read_committed => {
                partition.last_stable_offset()
            }
            PartitionWrapper::Live(partition) => partition.high_watermark(),
            PartitionWrapper::Snapshot { log, .. } => log.dirty_offset() + 1,
        }
    }
}

/// Parameters of a single partition read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchConfig {
    pub start_offset: i64,
    pub max_bytes: usize,
    pub read_committed: bool,
    /// Never return more than `max_bytes`, even when the first batch alone
    /// is larger.
    ///
    /// The fetch path always sets this, so a response never exceeds the
    /// request's byte limits. The cost: a batch bigger than the partition's
    /// `partition_max_bytes` is never delivered. Its partition answers with
    /// empty records on every poll (each one running to `max_wait_ms`) until
    /// the client raises its limit.
    pub strict_max_bytes: bool,
}

/// Outcome of [`read_from_partition`].
pub enum ReadResult {
    Error(KafkaCode),
    Read {
        /// `None` when there is nothing past `start_offset` to return.
        reader: Option<Box<dyn RecordBatchReader>>,
        high_watermark: i64,
        last_stable_offset: i64,
        log_start_offset: i64,
        aborted_transactions: Option<Vec<AbortedTransaction>>,
    },
}

impl std::fmt::Debug for ReadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadResult::Error(code) => f.debug_tuple("Error").field(code).finish(),
            ReadResult::Read {
                reader,
                high_watermark,
                last_stable_offset,
                log_start_offset,
                ..
            } => f
                .debug_struct("Read")
                .field("has_reader", &reader.is_some())
                .field("high_watermark", high_watermark)
                .field("last_stable_offset", last_stable_offset)
                .field("log_start_offset", log_start_offset)
                .finish(),
        }
    }
}

/// Validate the offset against the view's range and open a reader over
/// `[start_offset, read_limit)`.
pub async fn read_from_partition(wrapper: &PartitionWrapper, config: FetchConfig) -> ReadResult {
    let high_watermark = wrapper.high_watermark();
    let last_stable_offset = wrapper.last_stable_offset();
    let log_start_offset = wrapper.log_start_offset();
    let limit = wrapper.read_limit(config.read_committed);

    let upper = if wrapper.is_snapshot() {
        limit
    } else {
        high_watermark
    };
    if config.start_offset < log_start_offset || config.start_offset > upper {
        trace!(
            start_offset = config.start_offset,
            log_start_offset,
            upper,
            "Fetch offset out of range"
        );
        return ReadResult::Error(KafkaCode::OffsetOutOfRange);
    }

    let (reader, aborted_transactions) = if config.start_offset >= limit || config.max_bytes == 0
    {
        (None, None)
    } else {
        let reader_config = ReaderConfig {
            start_offset: config.start_offset,
            max_offset: limit - 1,
            max_bytes: config.max_bytes,
            strict_max_bytes: config.strict_max_bytes,
        };
        let reader = match wrapper.make_reader(reader_config).await {
            Ok(reader) => reader,
            Err(code) => return ReadResult::Error(code),
        };
        let aborted = if config.read_committed {
            wrapper
                .partition()
                .aborted_transactions(config.start_offset, limit - 1)
                .await
        } else {
            None
        };
        (Some(reader), aborted)
    };

    ReadResult::Read {
        reader,
        high_watermark,
        last_stable_offset,
        log_start_offset,
        aborted_transactions: match (config.read_committed, aborted_transactions) {
            (true, None) => Some(Vec::new()),
            (_, aborted) => aborted,
        },
    }
}

/// Pull batches until the next one would overflow `max_bytes`.
///
/// Batches are never split. Without `strict_max_bytes` the first batch is
/// returned whole even when it alone is over budget.
pub async fn drain_reader(
    reader: &mut dyn RecordBatchReader,
    max_bytes: usize,
    strict_max_bytes: bool,
) -> PartitionResult<Option<Bytes>> {
    let mut batches: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(batch) = reader.next_batch().await? {
        let fits = total + batch.len() <= max_bytes;
        if !fits && (strict_max_bytes || !batches.is_empty()) {
            break;
        }
        total += batch.len();
        batches.push(batch);
        if total >= max_bytes {
            break;
        }
    }

    Ok(match batches.len() {
        0 => None,
        1 => batches.pop(),
        _ => {
            let mut buf = BytesMut::with_capacity(total);
            for batch in &batches {
                buf.extend_from_slice(batch);
            }
            Some(buf.freeze())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{InMemoryPartition, VecBatchReader};
    use crate::types::PartitionId;

    async fn partition_with(batches: &[&'static [u8]]) -> Arc<InMemoryPartition> {
        let p = Arc::new(InMemoryPartition::new(PartitionId::new("t", 0)));
        for b in batches {
            p.append_committed(Bytes::from_static(*b), 1).await;
        }
        p
    }

    fn config(start_offset: i64) -> FetchConfig {
        FetchConfig {
            start_offset,
            max_bytes: 1024,
            read_committed: false,
            strict_max_bytes: true,
        }
    }

    async fn read_all(wrapper: &PartitionWrapper, config: FetchConfig) -> (i64, Option<Bytes>) {
        match read_from_partition(wrapper, config).await {
            ReadResult::Read {
                reader,
                high_watermark,
                ..
            } => {
                let records = match reader {
                    Some(mut reader) => drain_reader(reader.as_mut(), config.max_bytes, true)
                        .await
                        .unwrap(),
                    None => None,
                };
                (high_watermark, records)
            }
            ReadResult::Error(code) => panic!("unexpected error {code:?}"),
        }
    }

    // ========================================================================
    // Wrapper
    // ========================================================================

    #[tokio::test]
    async fn test_consumer_reads_up_to_high_watermark() {
        let p = partition_with(&[b"aa", b"bb"]).await;
        p.append(Bytes::from_static(b"uncommitted"), 1).await;
        let wrapper = PartitionWrapper::for_replica(p.clone(), -1).await.unwrap();
        assert!(matches!(wrapper, PartitionWrapper::Live(_)));

        let (hw, records) = read_all(&wrapper, config(0)).await;
        assert_eq!(hw, 2);
        assert_eq!(records.unwrap(), Bytes::from_static(b"aabb"));
    }

    #[tokio::test]
    async fn test_replica_reads_snapshot_up_to_dirty_offset() {
        let p = partition_with(&[b"aa"]).await;
        p.append(Bytes::from_static(b"cc"), 1).await;
        let wrapper = PartitionWrapper::for_replica(p.clone(), 1).await.unwrap();
        assert!(matches!(wrapper, PartitionWrapper::Snapshot { .. }));

        let (hw, records) = read_all(&wrapper, config(0)).await;
        assert_eq!(hw, 1);
        assert_eq!(records.unwrap(), Bytes::from_static(b"aacc"));

        // a follower may ask for the offset after the dirty one
        let (_, records) = read_all(&wrapper, config(2)).await;
        assert!(records.is_none());
    }

    #[tokio::test]
    async fn test_snapshot_offsets_ignore_later_writes() {
        let p = partition_with(&[b"aa"]).await;
        p.append(Bytes::from_static(b"cc"), 1).await;
        let wrapper = PartitionWrapper::for_replica(p.clone(), 1).await.unwrap();
        assert_eq!(wrapper.high_watermark(), 1);
        assert_eq!(wrapper.last_stable_offset(), 1);

        p.commit(2);
        p.append_committed(Bytes::from_static(b"dd"), 1).await;
        assert_eq!(p.high_watermark(), 3);

        assert_eq!(wrapper.high_watermark(), 1);
        assert_eq!(wrapper.last_stable_offset(), 1);
        let (hw, records) = read_all(&wrapper, config(0)).await;
        assert_eq!(hw, 1);
        assert_eq!(records.unwrap(), Bytes::from_static(b"aacc"));
    }

    #[tokio::test]
    async fn test_read_committed_stops_at_last_stable_offset() {
        let p = partition_with(&[b"a", b"b", b"c"]).await;
        p.set_last_stable_offset(1);
        let wrapper = PartitionWrapper::Live(p.clone());
        let committed = FetchConfig {
            read_committed: true,
            ..config(0)
        };
        match read_from_partition(&wrapper, committed).await {
            ReadResult::Read {
                reader: Some(mut reader),
                last_stable_offset,
                aborted_transactions,
                ..
            } => {
                assert_eq!(last_stable_offset, 1);
                assert_eq!(aborted_transactions, Some(vec![]));
                let records = drain_reader(reader.as_mut(), 1024, true).await.unwrap();
                assert_eq!(records.unwrap(), Bytes::from_static(b"a"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_offset_out_of_range() {
        let p = partition_with(&[b"a", b"b"]).await;
        let wrapper = PartitionWrapper::Live(p.clone());
        assert!(matches!(
            read_from_partition(&wrapper, config(3)).await,
            ReadResult::Error(KafkaCode::OffsetOutOfRange)
        ));

        p.truncate_prefix(1).await;
        assert!(matches!(
            read_from_partition(&wrapper, config(0)).await,
            ReadResult::Error(KafkaCode::OffsetOutOfRange)
        ));
    }

    #[tokio::test]
    async fn test_fetch_at_high_watermark_reads_nothing() {
        let p = partition_with(&[b"a"]).await;
        let wrapper = PartitionWrapper::Live(p.clone());
        match read_from_partition(&wrapper, config(1)).await {
            ReadResult::Read { reader, .. } => assert!(reader.is_none()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_engine_error_surfaces() {
        let p = partition_with(&[b"a"]).await;
        p.fail_reads(Some(KafkaCode::CorruptMessage));
        let wrapper = PartitionWrapper::Live(p.clone());
        assert!(matches!(
            read_from_partition(&wrapper, config(0)).await,
            ReadResult::Error(KafkaCode::CorruptMessage)
        ));
        assert_eq!(
            PartitionWrapper::for_replica(p.clone(), 0).await.err(),
            Some(KafkaCode::CorruptMessage)
        );
    }

    // ========================================================================
    // Draining
    // ========================================================================

    fn reader(batches: &[&'static [u8]]) -> VecBatchReader {
        VecBatchReader::new(batches.iter().map(|b| Bytes::from_static(*b)))
    }

    #[tokio::test]
    async fn test_drain_stops_before_overflow() {
        let mut r = reader(&[b"1234", b"5678", b"9"]);
        let out = drain_reader(&mut r, 6, true).await.unwrap();
        assert_eq!(out.unwrap(), Bytes::from_static(b"1234"));
    }

    #[tokio::test]
    async fn test_drain_strict_drops_oversized_first_batch() {
        let mut r = reader(&[b"123456789"]);
        assert!(drain_reader(&mut r, 4, true).await.unwrap().is_none());

        let mut r = reader(&[b"123456789"]);
        let out = drain_reader(&mut r, 4, false).await.unwrap();
        assert_eq!(out.unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_drain_exact_fit() {
        let mut r = reader(&[b"12", b"34", b"56"]);
        let out = drain_reader(&mut r, 4, true).await.unwrap();
        assert_eq!(out.unwrap(), Bytes::from_static(b"1234"));
    }
}
