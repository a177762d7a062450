//! Crate & protocol level errors.
//!
//! Two kinds of failure flow through the session layer:
//!
//! - [`Error`]: connection and framing errors. These are fatal to the
//!   connection that produced them.
//! - [`KafkaCode`]: wire protocol error codes. These travel in-band inside an
//!   otherwise well-formed response, either for a whole request (unsupported
//!   version, malformed body) or for a single partition of a fetch.

use bytes::Bytes;
use num_derive::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Protocol and connection level errors.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Could not parse the data.
    #[error("Parsing error: invalid data ({} bytes)", .0.len())]
    ParsingError(Bytes),

    /// Missing data or connection closed.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// The length prefix or header of a frame is unusable.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The API version is outside the range this layer decodes.
    #[error("Unsupported version {version} for api key {api_key}")]
    UnsupportedVersion { api_key: i16, version: i16 },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error terminates the connection it was raised on.
    ///
    /// Version errors are answered in-band; everything else tears the
    /// session down.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::UnsupportedVersion { .. })
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::IoError(a), Error::IoError(b)) => a == b,
            (Error::ParsingError(a), Error::ParsingError(b)) => a == b,
            (Error::MissingData(a), Error::MissingData(b)) => a == b,
            (Error::InvalidFrame(a), Error::InvalidFrame(b)) => a == b,
            (
                Error::UnsupportedVersion {
                    api_key: a,
                    version: v,
                },
                Error::UnsupportedVersion {
                    api_key: b,
                    version: w,
                },
            ) => a == b && v == w,
            (Error::Config(a), Error::Config(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

/// Error codes carried on the wire.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// There is currently no leader for this partition.
    LeaderNotAvailable = 5,
    /// The partition is not led by this broker. The client's metadata
    /// is out of date.
    NotLeaderForPartition = 6,
    /// This error is thrown if the request exceeds the user-specified
    /// time limit in the request.
    RequestTimedOut = 7,
    /// The version of API is not supported.
    UnsupportedVersion = 35,
    /// The request is malformed.
    InvalidRequest = 42,
    /// The leader epoch in the request is older than the epoch on the broker.
    FencedLeaderEpoch = 74,
    /// The leader epoch in the request is newer than the epoch on the broker.
    UnknownLeaderEpoch = 75,
}

impl KafkaCode {
    /// Wire representation.
    #[inline]
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    #[inline]
    pub fn is_error(self) -> bool {
        self != KafkaCode::None
    }
}
