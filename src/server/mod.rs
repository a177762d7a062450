//! Kafka protocol entry point.
//!
//! [`KafkaProtocol`] turns an accepted byte stream into a pipelined Kafka
//! session. Fetch requests are served here against the partitions reachable
//! through [`ProtocolServices`]; every other API goes to the embedder's
//! [`Handler`].
//!
//! # Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use kafkaesque_session::cluster::memory::{InMemoryPartitionManager, StaticShardTable};
//! use kafkaesque_session::cluster::quota::ClientQuotaManager;
//! use kafkaesque_session::config::ProtocolConfig;
//! use kafkaesque_session::server::{DefaultHandler, KafkaProtocol, ProtocolServices};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let services = ProtocolServices {
//!         shard_table: Arc::new(StaticShardTable::new()),
//!         partitions: Arc::new(InMemoryPartitionManager::new()),
//!         quota: Arc::new(ClientQuotaManager::new()),
//!         handler: Arc::new(DefaultHandler),
//!     };
//!     let protocol = Arc::new(KafkaProtocol::new(services, ProtocolConfig::from_env())?);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9092").await?;
//!     loop {
//!         let (stream, addr) = listener.accept().await?;
//!         let protocol = Arc::clone(&protocol);
//!         tokio::spawn(async move { protocol.apply(stream, addr).await });
//!     }
//! }
//! ```

pub mod codec;
pub mod connection;
pub mod handler;
pub mod request;
pub mod response;

pub use connection::{ConnectionSession, PendingResponse, ResponseEmitter, SessionResources};
pub use handler::{DefaultHandler, Handler, RequestContext};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info};

use crate::cluster::traits::{PartitionManager, QuotaManager, ShardTable};
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};

/// Collaborators the protocol reads from. All are shared across
/// connections.
#[derive(Clone)]
pub struct ProtocolServices {
    pub shard_table: Arc<dyn ShardTable>,
    pub partitions: Arc<dyn PartitionManager>,
    pub quota: Arc<dyn QuotaManager>,
    pub handler: Arc<dyn Handler>,
}

/// State shared by every session of one [`KafkaProtocol`].
pub struct ProtocolContext {
    pub services: ProtocolServices,
    pub config: ProtocolConfig,
    /// Request memory pool, one permit per byte.
    pub memory: Arc<Semaphore>,
    /// Bound on partition reads in flight.
    pub partition_reads: Arc<Semaphore>,
}

impl ProtocolContext {
    /// Build the shared state. `config` is taken as is; use
    /// [`KafkaProtocol::new`] to have it validated.
    pub fn new(services: ProtocolServices, config: ProtocolConfig) -> Self {
        let memory = Arc::new(Semaphore::new(config.max_request_memory));
        let partition_reads = Arc::new(Semaphore::new(config.max_concurrent_partition_reads));
        Self {
            services,
            config,
            memory,
            partition_reads,
        }
    }
}

/// Serves the Kafka protocol on any number of connections.
pub struct KafkaProtocol {
    ctx: Arc<ProtocolContext>,
}

impl KafkaProtocol {
    pub fn new(services: ProtocolServices, config: ProtocolConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Config(errors.join("; ")))?;
        info!(
            max_message_size = config.max_message_size,
            max_request_memory = config.max_request_memory,
            max_concurrent_partition_reads = config.max_concurrent_partition_reads,
            "Kafka protocol ready"
        );
        Ok(Self {
            ctx: Arc::new(ProtocolContext::new(services, config)),
        })
    }

    pub fn context(&self) -> &Arc<ProtocolContext> {
        &self.ctx
    }

    /// Serve one connection until the client disconnects or sends a frame
    /// that cannot be decoded.
    pub async fn apply<S>(&self, stream: S, client_addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        debug!(client = %client_addr, "Client connected");

        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(Arc::clone(&self.ctx), reader, client_addr, tx);
        let emitter = ResponseEmitter::new(writer, client_addr, rx);

        let result = tokio::try_join!(session.run(), emitter.run()).map(|_| ());
        debug!(client = %client_addr, ok = result.is_ok(), "Client disconnected");
        result
    }
}
