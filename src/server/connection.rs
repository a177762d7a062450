//! Pipelined client connection handling.
//!
//! A connection is served by two loops joined on one task:
//!
//! - [`ConnectionSession`] reads frames one after another, assigns each a
//!   [`SequenceId`], waits out quota and memory backpressure, then spawns
//!   the request's processing without waiting for it.
//! - [`ResponseEmitter`] receives finished responses in whatever order they
//!   complete and writes them in sequence order.
//!
//! Clients may therefore have many requests in flight and still see
//! responses in the order they sent the requests.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use futures::FutureExt;
use nombytes::NomBytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, trace, warn};

use crate::constants::{FRAME_SIZE_PREFIX, MIN_REQUEST_HEADER_SIZE, REQUEST_MEMORY_OVERHEAD};
use crate::error::{Error, KafkaCode, Result};
use crate::fetch::handle_fetch;
use crate::types::SequenceId;

use super::ProtocolContext;
use super::handler::RequestContext;
use super::request::{ApiKey, RequestHeader, parse_request_header};
use super::response::{ErrorResponseData, Response};

/// Resources a request holds from admission until its response is written.
///
/// The memory reservation is released when this is dropped, whichever way
/// the request ends.
#[derive(Debug)]
pub struct SessionResources {
    pub backpressure_delay: Duration,
    memlocks: OwnedSemaphorePermit,
    units: u32,
    pub started: Instant,
}

impl SessionResources {
    /// Memory units reserved for the request.
    pub fn reserved_units(&self) -> u32 {
        self.units
    }

    /// Give back the reservation early, keeping the timing data.
    pub fn release(self) -> (Duration, Instant) {
        drop(self.memlocks);
        (self.backpressure_delay, self.started)
    }
}

/// A finished response waiting for its turn on the wire.
#[derive(Debug)]
pub struct PendingResponse {
    pub response: Response,
    pub resources: SessionResources,
}

type ResponseSender = mpsc::UnboundedSender<(SequenceId, PendingResponse)>;
type ResponseReceiver = mpsc::UnboundedReceiver<(SequenceId, PendingResponse)>;

/// Units of request memory to reserve for a frame of `size` bytes.
///
/// A request is assumed to need twice its size (the body plus what it
/// decodes into) and a fixed overhead. A single request may take the whole
/// pool but never more, or it could never be admitted.
pub fn request_units(size: usize, capacity: usize) -> u32 {
    let wanted = size.saturating_mul(2).saturating_add(REQUEST_MEMORY_OVERHEAD);
    u32::try_from(wanted.min(capacity)).unwrap_or(u32::MAX)
}

/// Decode side of a client connection.
pub struct ConnectionSession<R> {
    proto: Arc<ProtocolContext>,
    reader: R,
    client_addr: SocketAddr,
    /// Next sequence id to assign.
    seq_idx: SequenceId,
    tasks: JoinSet<()>,
    responses: ResponseSender,
}

impl<R> ConnectionSession<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(
        proto: Arc<ProtocolContext>,
        reader: R,
        client_addr: SocketAddr,
        responses: ResponseSender,
    ) -> Self {
        Self {
            proto,
            reader,
            client_addr,
            seq_idx: SequenceId::new(0),
            tasks: JoinSet::new(),
            responses,
        }
    }

    /// Decode and dispatch until the client closes the connection.
    ///
    /// A clean close at a frame boundary waits for every request in flight
    /// and returns `Ok`. A framing error aborts them and is returned once
    /// they are gone, so their memory is back in the pool.
    pub async fn run(mut self) -> Result<()> {
        loop {
            match self.process_one_request().await {
                Ok(true) => self.reap_finished()?,
                Ok(false) => break,
                Err(e) => {
                    error!(client = %self.client_addr, error = %e, "Fatal frame error, closing connection");
                    self.tasks.abort_all();
                    while self.tasks.join_next().await.is_some() {}
                    return Err(e);
                }
            }
        }

        debug!(
            client = %self.client_addr,
            in_flight = self.tasks.len(),
            "Client closed connection, draining"
        );
        while let Some(joined) = self.tasks.join_next().await {
            check_task(joined)?;
        }
        Ok(())
    }

    fn reap_finished(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            check_task(joined)?;
        }
        Ok(())
    }

    /// Read one frame and spawn its processing. Returns `false` when the
    /// client closed the connection before a new frame started.
    pub async fn process_one_request(&mut self) -> Result<bool> {
        let Some(size) = self.read_frame_size().await? else {
            return Ok(false);
        };

        let read_timeout = self.proto.config.read_timeout;
        let header = timeout(read_timeout, self.read_header(size))
            .await
            .map_err(|_| self.read_timed_out())??;

        let (backpressure_delay, memlocks, units) = self
            .throttle_request(header.client_id.as_deref(), header.api_key, size)
            .await?;

        let body_len = size - header.encoded_len();
        let body = timeout(read_timeout, self.read_body(body_len))
            .await
            .map_err(|_| self.read_timed_out())??;

        let sequence = self.seq_idx;
        self.seq_idx = sequence.next();

        let rctx = RequestContext::new(self.client_addr, &header, sequence, backpressure_delay);
        debug!(
            request_id = %rctx.request_id(),
            client = %self.client_addr,
            api_key = header.api_key.as_str(),
            api_version = header.api_version,
            correlation_id = header.correlation_id,
            seq = %sequence,
            size,
            "Handling request"
        );

        let resources = SessionResources {
            backpressure_delay,
            memlocks,
            units,
            started: Instant::now(),
        };
        let proto = Arc::clone(&self.proto);
        let responses = self.responses.clone();
        self.tasks.spawn(async move {
            let correlation_id = rctx.correlation_id;
            let api_key = rctx.api_key;
            let body = match AssertUnwindSafe(dispatch(proto, rctx, body))
                .catch_unwind()
                .await
            {
                Ok(body) => body,
                Err(_) => {
                    error!(
                        api_key = api_key.as_str(),
                        correlation_id = %correlation_id,
                        seq = %sequence,
                        "Request handler panicked, answering with error code"
                    );
                    error_body(KafkaCode::Unknown)
                }
            };
            let response = Response::new_raw(correlation_id.value(), body);
            // The emitter is gone once the connection is torn down.
            let _ = responses.send((sequence, PendingResponse { response, resources }));
        });

        Ok(true)
    }

    /// Apply the client's quota delay, then reserve request memory. Both
    /// happen before the body is read, so a throttled client stops being
    /// read from.
    pub async fn throttle_request(
        &self,
        client_id: Option<&str>,
        api_key: ApiKey,
        size: usize,
    ) -> Result<(Duration, OwnedSemaphorePermit, u32)> {
        let delay = self
            .proto
            .services
            .quota
            .compute_delay(client_id, api_key, size)
            .await;
        if !delay.is_zero() {
            debug!(
                client = %self.client_addr,
                client_id = ?client_id,
                delay_ms = delay.as_millis() as u64,
                "Throttling request"
            );
            tokio::time::sleep(delay).await;
        }
        let (memlocks, units) = self.reserve_request_units(size).await?;
        Ok((delay, memlocks, units))
    }

    /// Suspend until the memory pool can hold a request of `size` bytes.
    pub async fn reserve_request_units(&self, size: usize) -> Result<(OwnedSemaphorePermit, u32)> {
        let units = request_units(size, self.proto.config.max_request_memory);
        trace!(client = %self.client_addr, units, "Reserving request memory");
        let permit = Arc::clone(&self.proto.memory)
            .acquire_many_owned(units)
            .await
            .map_err(|_| Error::MissingData("request memory pool closed".to_owned()))?;
        Ok((permit, units))
    }

    fn read_timed_out(&self) -> Error {
        warn!(
            client = %self.client_addr,
            timeout_secs = self.proto.config.read_timeout.as_secs(),
            "Request read timeout - closing connection"
        );
        Error::MissingData("Request read timeout".to_owned())
    }

    /// Read the size prefix. `None` on a clean close before the first byte.
    async fn read_frame_size(&mut self) -> Result<Option<usize>> {
        let mut size_buf = [0u8; FRAME_SIZE_PREFIX];
        let mut bytes_read = 0;

        while bytes_read < FRAME_SIZE_PREFIX {
            let n = self.reader.read(&mut size_buf[bytes_read..]).await?;
            if n == 0 {
                if bytes_read == 0 {
                    return Ok(None);
                }
                return Err(Error::MissingData(
                    "Connection closed mid-frame".to_owned(),
                ));
            }
            bytes_read += n;
        }

        let size = (&size_buf[..]).get_i32();
        if size < 0 {
            return Err(Error::InvalidFrame(format!(
                "Invalid negative message size: {}",
                size
            )));
        }
        let size = size as usize;
        if size > self.proto.config.max_message_size {
            return Err(Error::InvalidFrame(format!(
                "Message size {} exceeds maximum allowed size {}",
                size, self.proto.config.max_message_size
            )));
        }
        if size < MIN_REQUEST_HEADER_SIZE {
            return Err(Error::InvalidFrame(format!(
                "Message size {} is shorter than a request header",
                size
            )));
        }

        trace!("Reading {} bytes from {}", size, self.client_addr);
        Ok(Some(size))
    }

    /// Read and parse the request header of a frame of `size` bytes.
    async fn read_header(&mut self, size: usize) -> Result<RequestHeader> {
        let mut buf = BytesMut::zeroed(MIN_REQUEST_HEADER_SIZE);
        self.read_exact(&mut buf).await?;

        let client_id_len = (&buf[MIN_REQUEST_HEADER_SIZE - 2..]).get_i16();
        if client_id_len > 0 {
            let client_id_len = client_id_len as usize;
            if MIN_REQUEST_HEADER_SIZE + client_id_len > size {
                return Err(Error::InvalidFrame(format!(
                    "client id of {} bytes overruns a {} byte frame",
                    client_id_len, size
                )));
            }
            let start = buf.len();
            buf.resize(start + client_id_len, 0);
            self.read_exact(&mut buf[start..]).await?;
        }

        let raw = buf.freeze();
        let (_, header) = parse_request_header(NomBytes::new(raw.clone()))
            .map_err(|_| Error::InvalidFrame("unparsable request header".to_owned()))?;
        debug_assert_eq!(header.encoded_len(), raw.len());
        Ok(header)
    }

    async fn read_body(&mut self, len: usize) -> Result<Bytes> {
        let mut body = BytesMut::zeroed(len);
        self.read_exact(&mut body).await?;
        Ok(body.freeze())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::MissingData(
                "Connection closed mid-frame".to_owned(),
            )),
            Err(e) => Err(e.into()),
        }
    }
}

fn check_task(joined: std::result::Result<(), tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(()) => Ok(()),
        // Handler panics are caught inside the task. One that escapes left
        // its slot empty, and every later response would wait behind it.
        Err(e) if e.is_panic() => {
            error!(error = %e, "Request task panicked");
            Err(Error::MissingData("request task panicked".to_owned()))
        }
        Err(_) => Ok(()),
    }
}

/// Run the request and produce a body. Failures become error bodies so the
/// request still gets its turn on the wire.
async fn dispatch(proto: Arc<ProtocolContext>, rctx: RequestContext, body: Bytes) -> Bytes {
    let api_key = rctx.api_key;
    let correlation_id = rctx.correlation_id;
    let result = match api_key {
        ApiKey::Fetch => handle_fetch(Arc::clone(&proto), rctx, body).await,
        _ => proto.services.handler.handle_request(&rctx, body).await,
    };

    match result {
        Ok(body) => body,
        Err(e) => {
            warn!(
                api_key = api_key.as_str(),
                correlation_id = %correlation_id,
                error = %e,
                "Request failed, answering with error code"
            );
            let code = match e {
                Error::UnsupportedVersion { .. } => KafkaCode::UnsupportedVersion,
                Error::ParsingError(_) => KafkaCode::InvalidRequest,
                _ => KafkaCode::Unknown,
            };
            error_body(code)
        }
    }
}

fn error_body(code: KafkaCode) -> Bytes {
    ErrorResponseData::new(code)
        .to_bytes()
        .unwrap_or_else(|_| Bytes::copy_from_slice(&code.as_i16().to_be_bytes()))
}

/// Write side of a client connection.
pub struct ResponseEmitter<W> {
    writer: W,
    client_addr: SocketAddr,
    responses: ResponseReceiver,
    pending: BTreeMap<SequenceId, PendingResponse>,
    /// Next sequence id due on the wire.
    next_response: SequenceId,
}

impl<W> ResponseEmitter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, client_addr: SocketAddr, responses: ResponseReceiver) -> Self {
        Self {
            writer,
            client_addr,
            responses,
            pending: BTreeMap::new(),
            next_response: SequenceId::new(0),
        }
    }

    /// Write responses in sequence order until every sender is gone.
    pub async fn run(mut self) -> Result<()> {
        while let Some((sequence, pending)) = self.responses.recv().await {
            let previous = self.pending.insert(sequence, pending);
            debug_assert!(previous.is_none(), "duplicate response for {sequence}");
            self.flush_ready().await?;
        }

        if !self.pending.is_empty() {
            warn!(
                client = %self.client_addr,
                abandoned = self.pending.len(),
                next_response = %self.next_response,
                "Dropping responses that can no longer be sent in order"
            );
        }
        self.writer.flush().await?;
        Ok(())
    }

    /// Write every contiguous response starting at `next_response`.
    async fn flush_ready(&mut self) -> Result<()> {
        let mut written = 0usize;
        while let Some(PendingResponse {
            response,
            resources,
        }) = self.pending.remove(&self.next_response)
        {
            let frame = response.encode_with_size()?;
            self.writer.write_all(&frame).await?;
            trace!(
                client = %self.client_addr,
                seq = %self.next_response,
                correlation_id = response.correlation_id,
                bytes = frame.len(),
                elapsed_ms = resources.started.elapsed().as_millis() as u64,
                "Wrote response"
            );
            drop(resources);
            self.next_response = self.next_response.next();
            written += 1;
        }
        if written > 0 {
            self.writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{InMemoryPartitionManager, StaticShardTable};
    use crate::cluster::quota::NoQuota;
    use crate::config::ProtocolConfig;
    use crate::encode::ToByte;
    use crate::server::ProtocolServices;
    use crate::server::handler::DefaultHandler;
    use tokio::sync::Semaphore;

    fn proto(config: ProtocolConfig) -> Arc<ProtocolContext> {
        let services = ProtocolServices {
            shard_table: Arc::new(StaticShardTable::new()),
            partitions: Arc::new(InMemoryPartitionManager::new()),
            quota: Arc::new(NoQuota),
            handler: Arc::new(DefaultHandler),
        };
        Arc::new(ProtocolContext::new(services, config))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn frame(correlation_id: i32, client_id: Option<&str>, body: &[u8]) -> Vec<u8> {
        let header = RequestHeader {
            api_key: ApiKey::Metadata,
            api_version: 1,
            correlation_id,
            client_id: client_id.map(str::to_string),
        };
        let mut payload = BytesMut::new();
        header.encode(&mut payload).unwrap();
        payload.extend_from_slice(body);
        let mut out = (payload.len() as i32).to_be_bytes().to_vec();
        out.extend_from_slice(&payload);
        out
    }

    async fn resources(units: u32) -> SessionResources {
        let pool = Arc::new(Semaphore::new(1 << 20));
        SessionResources {
            backpressure_delay: Duration::ZERO,
            memlocks: pool.acquire_many_owned(units).await.unwrap(),
            units,
            started: Instant::now(),
        }
    }

    #[test]
    fn test_request_units() {
        assert_eq!(request_units(0, 1 << 20), 8000);
        assert_eq!(request_units(1000, 1 << 20), 10_000);
        // a request bigger than the pool takes the whole pool
        assert_eq!(request_units(1 << 20, 4096), 4096);
        assert_eq!(request_units(usize::MAX, usize::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_session_resources_release_on_drop() {
        let pool = Arc::new(Semaphore::new(100));
        let res = SessionResources {
            backpressure_delay: Duration::from_millis(3),
            memlocks: Arc::clone(&pool).acquire_many_owned(60).await.unwrap(),
            units: 60,
            started: Instant::now(),
        };
        assert_eq!(pool.available_permits(), 40);
        assert_eq!(res.reserved_units(), 60);
        let (delay, _) = res.release();
        assert_eq!(delay, Duration::from_millis(3));
        assert_eq!(pool.available_permits(), 100);
    }

    // ========================================================================
    // Decode loop
    // ========================================================================

    #[tokio::test]
    async fn test_decode_assigns_sequence_ids() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(proto(ProtocolConfig::default()), server, addr(), tx);

        let mut bytes = frame(11, Some("c"), b"");
        bytes.extend(frame(12, None, b"xyz"));
        client.write_all(&bytes).await.unwrap();
        drop(client);

        session.run().await.unwrap();

        let mut seen = Vec::new();
        while let Some((seq, pending)) = rx.recv().await {
            seen.push((seq.value(), pending.response.correlation_id));
        }
        seen.sort();
        assert_eq!(seen, vec![(0, 11), (1, 12)]);
    }

    #[tokio::test]
    async fn test_clean_close_before_any_frame() {
        let (client, server) = tokio::io::duplex(64);
        let (tx, _rx) = mpsc::unbounded_channel();
        drop(client);
        let session = ConnectionSession::new(proto(ProtocolConfig::default()), server, addr(), tx);
        assert!(session.run().await.is_ok());
    }

    #[tokio::test]
    async fn test_framing_errors_are_fatal() {
        let cases: Vec<(Vec<u8>, &str)> = vec![
            ((-1i32).to_be_bytes().to_vec(), "negative size"),
            (4i32.to_be_bytes().to_vec(), "shorter than header"),
            (i32::MAX.to_be_bytes().to_vec(), "oversized"),
            (vec![0, 0], "eof inside size prefix"),
            (frame(1, None, b"body")[..9].to_vec(), "eof inside header"),
        ];
        for (bytes, what) in cases {
            let (mut client, server) = tokio::io::duplex(4096);
            let (tx, _rx) = mpsc::unbounded_channel();
            let session =
                ConnectionSession::new(proto(ProtocolConfig::default()), server, addr(), tx);
            client.write_all(&bytes).await.unwrap();
            drop(client);
            assert!(session.run().await.is_err(), "{what}");
        }
    }

    #[tokio::test]
    async fn test_client_id_overrunning_frame_is_fatal() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(proto(ProtocolConfig::default()), server, addr(), tx);

        let mut bytes = 10i32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0, 3, 0, 1, 0, 0, 0, 1, 0, 50]);
        client.write_all(&bytes).await.unwrap();
        drop(client);
        assert!(matches!(session.run().await, Err(Error::InvalidFrame(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_frame_times_out() {
        let (mut client, server) = tokio::io::duplex(4096);
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = ProtocolConfig {
            read_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let session = ConnectionSession::new(proto(config), server, addr(), tx);

        // size prefix only, then silence
        client.write_all(&20i32.to_be_bytes()).await.unwrap();
        let err = session.run().await.unwrap_err();
        assert_eq!(err, Error::MissingData("Request read timeout".to_owned()));
        drop(client);
    }

    #[tokio::test]
    async fn test_memory_reserved_until_response_written() {
        let config = ProtocolConfig {
            max_request_memory: 20_000,
            ..Default::default()
        };
        let proto = proto(config);
        let (mut client, server) = tokio::io::duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = ConnectionSession::new(Arc::clone(&proto), server, addr(), tx);

        client.write_all(&frame(1, None, b"abc")).await.unwrap();
        drop(client);
        session.run().await.unwrap();

        let (_, pending) = rx.recv().await.unwrap();
        assert_eq!(proto.memory.available_permits(), 20_000 - 8000 - 2 * 13);
        drop(pending);
        assert_eq!(proto.memory.available_permits(), 20_000);
    }

    // ========================================================================
    // Emitter
    // ========================================================================

    #[tokio::test]
    async fn test_emitter_writes_in_sequence_order() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = ResponseEmitter::new(writer, addr(), rx);

        for seq in [2u64, 0, 3, 1] {
            let pending = PendingResponse {
                response: Response::new_raw(seq as i32 + 100, Bytes::from_static(b"r")),
                resources: resources(1).await,
            };
            tx.send((SequenceId::new(seq), pending)).unwrap();
        }
        drop(tx);
        emitter.run().await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        let mut buf = Bytes::from(out);
        let mut correlation_ids = Vec::new();
        while buf.has_remaining() {
            let size = buf.get_i32() as usize;
            let mut frame = buf.split_to(size);
            correlation_ids.push(frame.get_i32());
        }
        assert_eq!(correlation_ids, vec![100, 101, 102, 103]);
    }

    #[tokio::test]
    async fn test_emitter_holds_back_after_gap() {
        let (writer, mut reader) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::unbounded_channel();
        let emitter = ResponseEmitter::new(writer, addr(), rx);

        // sequence 0 never arrives
        let pending = PendingResponse {
            response: Response::new_raw(1, Bytes::from_static(b"r")),
            resources: resources(1).await,
        };
        tx.send((SequenceId::new(1), pending)).unwrap();
        drop(tx);
        emitter.run().await.unwrap();

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
