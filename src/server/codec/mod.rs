//! Kafka protocol codec layer.
//!
//! Each API this crate decodes implements [`KafkaCodec`], pairing request
//! parsing with response encoding and owning the version window. Today that
//! is only Fetch; every other API reaches its handler as raw bytes.

mod fetch;

pub use fetch::FetchCodec;

use bytes::Bytes;
use nombytes::NomBytes;

use crate::error::Result;

/// Trait for Kafka protocol codecs.
pub trait KafkaCodec {
    /// The request type for this API.
    type Request;

    /// The response type for this API.
    type Response;

    /// The Kafka API key for this operation.
    fn api_key() -> i16;

    /// The minimum supported version.
    fn min_version() -> i16;

    /// The maximum supported version.
    fn max_version() -> i16;

    /// Check if a version is supported.
    fn is_version_supported(version: i16) -> bool {
        version >= Self::min_version() && version <= Self::max_version()
    }

    /// Decode a request body (header already stripped).
    ///
    /// Versions outside the window fail with
    /// [`Error::UnsupportedVersion`](crate::error::Error::UnsupportedVersion)
    /// before any bytes are looked at.
    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request>;

    /// Encode a response body for `version`.
    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes>;
}
