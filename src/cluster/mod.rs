//! Collaborators of the session layer.
//!
//! The protocol does not own partitions, routing or admission policy. It
//! reaches them through the contracts in [`traits`]. [`memory`] provides
//! in-memory implementations that are complete enough to run the protocol
//! end to end, and [`quota`] a per-client byte-rate quota.

pub mod memory;
pub mod quota;
pub mod traits;

pub use memory::{InMemoryPartition, InMemoryPartitionManager, StaticShardTable};
pub use quota::{ClientQuotaManager, NoQuota, QuotaConfig};
pub use traits::{
    LogSnapshot, Partition, PartitionManager, PartitionResult, QuotaManager, ReaderConfig,
    RecordBatchReader, ShardTable,
};
