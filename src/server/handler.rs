//! Handler trait for the APIs this crate does not serve itself.
//!
//! Fetch is answered by the session layer directly. Every other request is
//! passed, header already parsed, to a [`Handler`] as raw body bytes, and
//! whatever body it returns is framed and sent in the request's turn.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{KafkaCode, Result};
use crate::types::{CorrelationId, SequenceId};

use super::request::{ApiKey, RequestHeader};
use super::response::ErrorResponseData;

/// Context for a request, containing connection information.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The client's address.
    pub client_addr: SocketAddr,
    pub api_key: ApiKey,
    /// The API version of the request.
    pub api_version: i16,
    pub correlation_id: CorrelationId,
    /// The client ID from the request header.
    pub client_id: Option<String>,
    /// Position of the request on its connection.
    pub sequence: SequenceId,
    /// Delay the quota manager imposed before the request was read. Reported
    /// back to the client as `throttle_time_ms`.
    pub backpressure_delay: Duration,
    /// Unique request ID for correlation across logs and traces.
    pub request_id: uuid::Uuid,
}

impl RequestContext {
    pub fn new(
        client_addr: SocketAddr,
        header: &RequestHeader,
        sequence: SequenceId,
        backpressure_delay: Duration,
    ) -> Self {
        Self {
            client_addr,
            api_key: header.api_key,
            api_version: header.api_version,
            correlation_id: CorrelationId::new(header.correlation_id),
            client_id: header.client_id.clone(),
            sequence,
            backpressure_delay,
            request_id: uuid::Uuid::new_v4(),
        }
    }

    pub fn request_id(&self) -> &uuid::Uuid {
        &self.request_id
    }

    /// Backpressure delay in whole milliseconds, saturating at `i32::MAX`.
    pub fn throttle_time_ms(&self) -> i32 {
        i32::try_from(self.backpressure_delay.as_millis()).unwrap_or(i32::MAX)
    }
}

/// Trait for handling Kafka protocol requests other than Fetch.
///
/// The default answers every request with an `UnsupportedVersion` error body.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle_request(&self, ctx: &RequestContext, _body: Bytes) -> Result<Bytes> {
        tracing::debug!(
            api = ctx.api_key.as_str(),
            version = ctx.api_version,
            "No handler for API"
        );
        ErrorResponseData::new(KafkaCode::UnsupportedVersion).to_bytes()
    }
}

/// Handler that relies on the trait defaults.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl Handler for DefaultHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(delay: Duration) -> RequestContext {
        let header = RequestHeader {
            api_key: ApiKey::Metadata,
            api_version: 1,
            correlation_id: 5,
            client_id: Some("c".to_string()),
        };
        RequestContext::new(
            "127.0.0.1:9092".parse().unwrap(),
            &header,
            SequenceId::new(3),
            delay,
        )
    }

    #[test]
    fn test_context_from_header() {
        let ctx = ctx(Duration::from_millis(250));
        assert_eq!(ctx.api_key, ApiKey::Metadata);
        assert_eq!(ctx.correlation_id.value(), 5);
        assert_eq!(ctx.sequence.value(), 3);
        assert_eq!(ctx.throttle_time_ms(), 250);
    }

    #[test]
    fn test_throttle_time_saturates() {
        let ctx = ctx(Duration::from_secs(u64::MAX / 2));
        assert_eq!(ctx.throttle_time_ms(), i32::MAX);
    }

    #[tokio::test]
    async fn test_default_handler_returns_unsupported_version() {
        let body = DefaultHandler
            .handle_request(&ctx(Duration::ZERO), Bytes::from_static(b"ignored"))
            .await
            .unwrap();
        assert_eq!(&body[..], &[0, 35]);
    }
}
