//! Protocol-wide configuration.

use std::time::Duration;

use crate::constants::{
    DEFAULT_MAX_CONCURRENT_PARTITION_READS, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_REQUEST_MEMORY,
    DEFAULT_REQUEST_READ_TIMEOUT_SECS, MIN_REQUEST_HEADER_SIZE,
};

/// Limits shared by every connection of a [`KafkaProtocol`](crate::server::KafkaProtocol).
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Largest frame accepted from a client. Bigger size prefixes are a
    /// fatal framing error.
    pub max_message_size: usize,
    /// Capacity of the request memory pool, in bytes.
    pub max_request_memory: usize,
    /// Bound on partition reads in flight across all connections.
    pub max_concurrent_partition_reads: usize,
    /// Time allowed to receive the rest of a frame once its size prefix
    /// has arrived.
    pub read_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_request_memory: DEFAULT_MAX_REQUEST_MEMORY,
            max_concurrent_partition_reads: DEFAULT_MAX_CONCURRENT_PARTITION_READS,
            read_timeout: Duration::from_secs(DEFAULT_REQUEST_READ_TIMEOUT_SECS),
        }
    }
}

impl ProtocolConfig {
    /// Create configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MAX_MESSAGE_SIZE`: largest accepted frame in bytes (default: 100 MB)
    /// - `MAX_REQUEST_MEMORY`: request memory pool in bytes (default: 256 MB)
    /// - `MAX_CONCURRENT_PARTITION_READS`: concurrent partition reads (default: 16)
    /// - `REQUEST_READ_TIMEOUT_SECS`: frame read timeout (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_message_size = std::env::var("MAX_MESSAGE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_message_size);

        let max_request_memory = std::env::var("MAX_REQUEST_MEMORY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_request_memory);

        let max_concurrent_partition_reads = std::env::var("MAX_CONCURRENT_PARTITION_READS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_concurrent_partition_reads);

        let read_timeout = std::env::var("REQUEST_READ_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.read_timeout);

        Self {
            max_message_size,
            max_request_memory,
            max_concurrent_partition_reads,
            read_timeout,
        }
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_message_size < MIN_REQUEST_HEADER_SIZE {
            errors.push(format!(
                "max_message_size ({}) must be at least {} bytes",
                self.max_message_size, MIN_REQUEST_HEADER_SIZE
            ));
        }
        if self.max_message_size > i32::MAX as usize {
            errors.push(format!(
                "max_message_size ({}) cannot exceed i32::MAX",
                self.max_message_size
            ));
        }
        if self.max_request_memory == 0 {
            errors.push("max_request_memory must be positive".to_string());
        }
        // A semaphore cannot hand out more than u32::MAX permits at once.
        if self.max_request_memory > u32::MAX as usize {
            errors.push(format!(
                "max_request_memory ({}) cannot exceed {}",
                self.max_request_memory,
                u32::MAX
            ));
        }
        if self.max_concurrent_partition_reads == 0 {
            errors.push("max_concurrent_partition_reads must be positive".to_string());
        }
        if self.read_timeout.is_zero() {
            errors.push("read_timeout must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
