//! Centralized protocol and session constants.
//!
//! # Categories
//!
//! - **Protocol Constants**: Kafka wire protocol sizes and limits
//! - **Session Constants**: framing and memory accounting for a connection
//! - **Fetch Constants**: defaults for the fetch path

// =============================================================================
// Protocol Constants (Kafka Wire Protocol)
// =============================================================================

/// Maximum allowed array size in Kafka protocol parsing.
///
/// Bounds memory when a malformed message claims billions of elements.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 100_000;

/// Size of the big-endian length prefix in front of every frame.
pub const FRAME_SIZE_PREFIX: usize = 4;

/// Minimum size of a request header (v1): api_key (2) + api_version (2) +
/// correlation_id (4) + client_id length (2).
pub const MIN_REQUEST_HEADER_SIZE: usize = 10;

/// Oldest Fetch version decoded by this crate.
pub const FETCH_MIN_VERSION: i16 = 4;

/// Newest Fetch version decoded by this crate.
pub const FETCH_MAX_VERSION: i16 = 10;

/// `isolation_level` value for read_committed consumers.
pub const ISOLATION_READ_COMMITTED: i8 = 1;

// =============================================================================
// Session Constants
// =============================================================================

/// Default maximum message size (100 MB).
///
/// This should match Kafka's `message.max.bytes` default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Default size of the protocol-wide request memory pool (256 MB).
pub const DEFAULT_MAX_REQUEST_MEMORY: usize = 256 * 1024 * 1024;

/// Fixed overhead charged on top of twice the request size when reserving
/// request memory.
pub const REQUEST_MEMORY_OVERHEAD: usize = 8000;

/// Default timeout for reading the remainder of a frame once its size prefix
/// has arrived.
pub const DEFAULT_REQUEST_READ_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Fetch Constants
// =============================================================================

/// Default bound on partition reads that may run at once across the
/// protocol instance.
pub const DEFAULT_MAX_CONCURRENT_PARTITION_READS: usize = 16;

/// Default target rate for a single client before it is throttled (50 MB/s).
pub const DEFAULT_QUOTA_BYTES_PER_SEC: u64 = 50 * 1024 * 1024;

/// Default length of the quota accounting window.
pub const DEFAULT_QUOTA_WINDOW_MS: u64 = 1_000;

/// Upper bound on a single backpressure delay.
pub const DEFAULT_QUOTA_MAX_DELAY_MS: u64 = 30_000;

/// Cap on distinct clients tracked by the quota manager.
pub const DEFAULT_QUOTA_MAX_TRACKED_CLIENTS: usize = 10_000;
