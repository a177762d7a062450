//! Type-safe wrappers for session and routing identifiers.
//!
//! These newtypes keep values with the same integer representation but
//! different meanings (a correlation id chosen by the client versus a
//! sequence id assigned by the session) from being mixed up.

use bytes::BufMut;
use std::fmt;

use crate::encode::ToByte;
use crate::error::Result;

/// Position of a request within its connection.
///
/// Assigned by the session at decode time, strictly increasing from zero.
/// Responses leave the connection in sequence order, whatever order their
/// handlers complete in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SequenceId(pub u64);

impl SequenceId {
    #[inline]
    pub const fn new(value: u64) -> Self {
        SequenceId(value)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The id that follows this one.
    #[inline]
    pub const fn next(self) -> Self {
        SequenceId(self.0 + 1)
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A Kafka request correlation ID.
///
/// Chosen by the client and echoed back verbatim. It plays no part in
/// response ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CorrelationId(pub i32);

impl CorrelationId {
    #[inline]
    pub const fn new(value: i32) -> Self {
        CorrelationId(value)
    }

    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for CorrelationId {
    fn from(value: i32) -> Self {
        CorrelationId(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToByte for CorrelationId {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.0.encode(buffer)
    }
}

/// Identifier of the execution shard that owns a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

// ============================================================================
// PartitionId
// ============================================================================

/// A topic-partition identifier.
///
/// ```
/// use kafkaesque_session::types::PartitionId;
///
/// let partition = PartitionId::new("my-topic", 0);
/// assert_eq!(partition.to_string(), "my-topic-0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId {
    topic: String,
    partition: i32,
}

impl PartitionId {
    #[inline]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    #[inline]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[inline]
    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl From<(&str, i32)> for PartitionId {
    fn from((topic, partition): (&str, i32)) -> Self {
        Self::new(topic, partition)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}
