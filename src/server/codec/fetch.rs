//! Fetch API codec.

use bytes::{Bytes, BytesMut};
use nombytes::NomBytes;

use super::KafkaCodec;
use crate::constants::{FETCH_MAX_VERSION, FETCH_MIN_VERSION};
use crate::error::{Error, Result};
use crate::server::request::{ApiKey, FetchRequestData, parse_fetch_request};
use crate::server::response::FetchResponseData;

/// Codec for Kafka Fetch API.
///
/// # Supported Versions
///
/// - Versions 4-10 are supported
/// - Version 5+ carries log start offsets
/// - Version 7+ carries incremental fetch session fields
/// - Version 9+ carries the client's view of the leader epoch
pub struct FetchCodec;

impl KafkaCodec for FetchCodec {
    type Request = FetchRequestData;
    type Response = FetchResponseData;

    fn api_key() -> i16 {
        i16::from(ApiKey::Fetch)
    }

    fn min_version() -> i16 {
        FETCH_MIN_VERSION
    }

    fn max_version() -> i16 {
        FETCH_MAX_VERSION
    }

    fn decode_request(bytes: NomBytes, version: i16) -> Result<Self::Request> {
        if !Self::is_version_supported(version) {
            return Err(Error::UnsupportedVersion {
                api_key: Self::api_key(),
                version,
            });
        }
        let raw = bytes.clone().into_bytes();
        let (_, request) =
            parse_fetch_request(bytes, version).map_err(|_| Error::ParsingError(raw))?;
        Ok(request)
    }

    fn encode_response(response: &Self::Response, version: i16) -> Result<Bytes> {
        let mut buffer = BytesMut::with_capacity(256);
        response.encode_versioned(&mut buffer, version)?;
        Ok(buffer.freeze())
    }
}
