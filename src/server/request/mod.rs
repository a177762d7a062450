//! Request parsing for incoming Kafka protocol messages.
//!
//! The session only ever parses the request header itself. Bodies are handed
//! to the handler for their API as raw bytes; Fetch is the one body this
//! crate decodes (see [`fetch`]).

mod fetch;

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::ToByte;
use crate::error::Result;
use crate::parser::{bytes_to_string_opt, parse_nullable_string};

pub use fetch::*;

macro_rules! api_keys {
    ($($name:ident = $value:literal),* $(,)?) => {
        /// API keys for Kafka protocol
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ApiKey {
            $($name,)*
            Unknown(i16),
        }

        impl From<i16> for ApiKey {
            fn from(value: i16) -> Self {
                match value {
                    $($value => ApiKey::$name,)*
                    n => ApiKey::Unknown(n),
                }
            }
        }

        impl From<ApiKey> for i16 {
            fn from(key: ApiKey) -> Self {
                match key {
                    $(ApiKey::$name => $value,)*
                    ApiKey::Unknown(n) => n,
                }
            }
        }

        impl ApiKey {
            /// Static name for logging. Unknown keys all map to "Unknown".
            #[inline]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ApiKey::$name => stringify!($name),)*
                    ApiKey::Unknown(_) => "Unknown",
                }
            }
        }
    };
}

api_keys! {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    FindCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    DescribeGroups = 15,
    ListGroups = 16,
    SaslHandshake = 17,
    ApiVersions = 18,
    CreateTopics = 19,
    DeleteTopics = 20,
    InitProducerId = 22,
    SaslAuthenticate = 36,
}

/// Parsed request header from incoming Kafka messages.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    /// Bytes this header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        2 + 2 + 4 + 2 + self.client_id.as_ref().map_or(0, String::len)
    }
}

impl ToByte for RequestHeader {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        i16::from(self.api_key).encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.encode(buffer)
    }
}

/// Parse a v1 request header: api key, version, correlation id and a
/// nullable client id.
pub fn parse_request_header(s: NomBytes) -> IResult<NomBytes, RequestHeader> {
    let (s, api_key) = be_i16(s)?;
    let (s, api_version) = be_i16(s)?;
    let (s, correlation_id) = be_i32(s)?;
    let (s, client_id) = parse_nullable_string(s)?;
    let client_id = bytes_to_string_opt(client_id)?;

    Ok((
        s,
        RequestHeader {
            api_key: ApiKey::from(api_key),
            api_version,
            correlation_id,
            client_id,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    /// Helper to build a request header in wire format
    fn build_header(
        api_key: i16,
        api_version: i16,
        correlation_id: i32,
        client_id: Option<&str>,
    ) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&api_key.to_be_bytes());
        data.extend_from_slice(&api_version.to_be_bytes());
        data.extend_from_slice(&correlation_id.to_be_bytes());
        match client_id {
            Some(s) => {
                data.extend_from_slice(&(s.len() as i16).to_be_bytes());
                data.extend_from_slice(s.as_bytes());
            }
            None => data.extend_from_slice(&(-1i16).to_be_bytes()),
        }
        data
    }

    #[test]
    fn test_api_key_conversions() {
        assert_eq!(ApiKey::from(1), ApiKey::Fetch);
        assert_eq!(ApiKey::from(18), ApiKey::ApiVersions);
        assert_eq!(ApiKey::from(999), ApiKey::Unknown(999));
        assert_eq!(i16::from(ApiKey::Fetch), 1);
        assert_eq!(i16::from(ApiKey::Unknown(77)), 77);
        assert_eq!(ApiKey::Fetch.as_str(), "Fetch");
        assert_eq!(ApiKey::Unknown(5).as_str(), "Unknown");
    }

    #[test]
    fn test_parse_request_header_with_client_id() {
        let mut data = build_header(1, 10, 42, Some("consumer-1"));
        data.extend_from_slice(b"body");
        let (rest, header) = parse_request_header(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(header.api_key, ApiKey::Fetch);
        assert_eq!(header.api_version, 10);
        assert_eq!(header.correlation_id, 42);
        assert_eq!(header.client_id.as_deref(), Some("consumer-1"));
        assert_eq!(header.encoded_len(), 20);
        assert_eq!(rest.into_bytes(), Bytes::from("body"));
    }

    #[test]
    fn test_parse_request_header_null_client_id() {
        let data = build_header(3, 1, -5, None);
        let (_, header) = parse_request_header(NomBytes::new(Bytes::from(data))).unwrap();
        assert_eq!(header.client_id, None);
        assert_eq!(header.correlation_id, -5);
    }

    #[test]
    fn test_parse_request_header_truncated() {
        let data = build_header(1, 4, 1, Some("abcdef"));
        let truncated = Bytes::from(data).slice(..12);
        assert!(parse_request_header(NomBytes::new(truncated)).is_err());
    }

    #[test]
    fn test_header_encode_matches_wire() {
        let header = RequestHeader {
            api_key: ApiKey::Fetch,
            api_version: 7,
            correlation_id: 9,
            client_id: Some("c".to_string()),
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        assert_eq!(buf, build_header(1, 7, 9, Some("c")));
        assert_eq!(buf.len(), header.encoded_len());
    }
}
