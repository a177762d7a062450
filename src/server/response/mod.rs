//! Response encoding for outgoing Kafka protocol messages.

mod fetch;

use bytes::{BufMut, Bytes, BytesMut};

use crate::encode::ToByte;
use crate::error::{KafkaCode, Result};

pub use fetch::*;

/// Response header for Kafka protocol.
#[derive(Debug, Clone)]
pub struct ResponseHeader {
    pub correlation_id: i32,
}

impl ToByte for ResponseHeader {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.correlation_id.encode(buffer)
    }
}

/// Body sent when a request cannot be served at all: unsupported version,
/// malformed body, or an API this layer does not handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponseData {
    pub error_code: KafkaCode,
}

impl ErrorResponseData {
    pub fn new(error_code: KafkaCode) -> Self {
        Self { error_code }
    }

    /// Encoded body, ready to be framed.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(2);
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl ToByte for ErrorResponseData {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.error_code.as_i16().encode(buffer)
    }
}

/// Response wrapper that includes correlation ID and response body.
#[derive(Debug, Clone)]
pub struct Response {
    pub correlation_id: i32,
    body: Bytes,
}

impl Response {
    /// Create a new response with the given correlation ID and body.
    pub fn new<T: ToByte>(correlation_id: i32, body: &T) -> Result<Self> {
        let mut buf = BytesMut::new();
        body.encode(&mut buf)?;
        Ok(Self {
            correlation_id,
            body: buf.freeze(),
        })
    }

    /// Create a new response with pre-encoded body bytes.
    /// Use this when you need version-specific encoding.
    pub fn new_raw(correlation_id: i32, body: Bytes) -> Self {
        Self {
            correlation_id,
            body,
        }
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Size of the frame on the wire, prefix included.
    pub fn frame_len(&self) -> usize {
        4 + 4 + self.body.len()
    }

    /// Encode the response to a buffer with the size prefix.
    pub fn encode_with_size(&self) -> Result<Bytes> {
        let total_size = i32::try_from(4 + self.body.len()).map_err(|_| {
            crate::error::Error::InvalidFrame(format!(
                "response body of {} bytes",
                self.body.len()
            ))
        })?;
        let mut result = BytesMut::with_capacity(self.frame_len());
        total_size.encode(&mut result)?;
        ResponseHeader {
            correlation_id: self.correlation_id,
        }
        .encode(&mut result)?;
        result.extend_from_slice(&self.body);
        Ok(result.freeze())
    }
}
