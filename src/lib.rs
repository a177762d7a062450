//! # Kafkaesque session
//! Pipelined Kafka protocol session layer.
//!
//! This crate accepts the byte stream of an established Kafka client
//! connection, decodes requests, processes them concurrently and writes the
//! responses back in exactly the order the requests arrived. It serves the
//! `Fetch` API itself, including multi-partition long polls, and hands every
//! other API to an embedder supplied [`Handler`](server::Handler).
//!
//! The log engine, routing table and quota policy are collaborators reached
//! through the traits in [`cluster::traits`]. In-memory versions live in
//! [`cluster::memory`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kafkaesque_session::prelude::*;
//!
//! # async fn serve(stream: tokio::net::TcpStream, addr: std::net::SocketAddr) -> Result<()> {
//! let table = Arc::new(StaticShardTable::new());
//! let partitions = Arc::new(InMemoryPartitionManager::new());
//!
//! let topic = PartitionId::new("events", 0);
//! let partition = Arc::new(InMemoryPartition::new(topic.clone()));
//! table.assign(topic, ShardId(0));
//! partitions.insert(ShardId(0), partition);
//!
//! let services = ProtocolServices {
//!     shard_table: table,
//!     partitions,
//!     quota: Arc::new(ClientQuotaManager::new()),
//!     handler: Arc::new(DefaultHandler),
//! };
//! let protocol = KafkaProtocol::new(services, ProtocolConfig::default())?;
//! protocol.apply(stream, addr).await
//! # }
//! ```
//!
//! ## Resources
//! - [Kafka protocol guide](https://kafka.apache.org/protocol.html)

#![forbid(unsafe_code)]

pub mod encode;
pub mod error;
mod parser;
pub mod server;
pub mod types;

pub mod cluster;
pub mod config;
pub mod constants;
pub mod fetch;
pub mod telemetry;

pub mod prelude {
    //! The types needed to stand up a protocol instance.
    pub use crate::cluster::memory::{
        InMemoryPartition, InMemoryPartitionManager, StaticShardTable,
    };
    pub use crate::cluster::quota::{ClientQuotaManager, NoQuota, QuotaConfig};
    pub use crate::cluster::traits::{
        LogSnapshot, Partition, PartitionManager, QuotaManager, RecordBatchReader, ShardTable,
    };
    pub use crate::config::ProtocolConfig;
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::server::{
        DefaultHandler, Handler, KafkaProtocol, ProtocolServices, RequestContext,
    };
    pub use crate::types::{CorrelationId, PartitionId, SequenceId, ShardId};

    pub use bytes;
}
