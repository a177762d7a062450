//! Shared helpers for the integration tests: an in-memory cluster and a
//! minimal wire client talking to a [`KafkaProtocol`] over a duplex pipe.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kafkaesque_session::cluster::memory::{
    InMemoryPartition, InMemoryPartitionManager, StaticShardTable,
};
use kafkaesque_session::cluster::quota::NoQuota;
use kafkaesque_session::cluster::traits::QuotaManager;
use kafkaesque_session::config::ProtocolConfig;
use kafkaesque_session::error::Result;
use kafkaesque_session::server::request::FetchRequestData;
use kafkaesque_session::server::response::{FetchResponseData, parse_fetch_response};
use kafkaesque_session::server::{
    DefaultHandler, Handler, KafkaProtocol, ProtocolContext, ProtocolServices,
};
use kafkaesque_session::types::{PartitionId, ShardId};
use nombytes::NomBytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

pub const FETCH: i16 = 1;
pub const METADATA: i16 = 3;

pub fn client_addr() -> SocketAddr {
    "10.0.0.1:51000".parse().unwrap()
}

/// In-memory routing and partitions, all on shard 0.
pub struct Cluster {
    pub table: Arc<StaticShardTable>,
    pub manager: Arc<InMemoryPartitionManager>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            table: Arc::new(StaticShardTable::new()),
            manager: Arc::new(InMemoryPartitionManager::new()),
        }
    }

    pub async fn partition(
        &self,
        topic: &str,
        index: i32,
        batches: &[&[u8]],
    ) -> Arc<InMemoryPartition> {
        let id = PartitionId::new(topic, index);
        let partition = Arc::new(InMemoryPartition::new(id.clone()));
        for batch in batches {
            partition
                .append_committed(Bytes::copy_from_slice(batch), 1)
                .await;
        }
        self.table.assign(id, ShardId(0));
        self.manager.insert(ShardId(0), partition.clone());
        partition
    }

    pub fn services(&self) -> ProtocolServices {
        self.services_with(Arc::new(NoQuota), Arc::new(DefaultHandler))
    }

    pub fn services_with(
        &self,
        quota: Arc<dyn QuotaManager>,
        handler: Arc<dyn Handler>,
    ) -> ProtocolServices {
        ProtocolServices {
            shard_table: self.table.clone(),
            partitions: self.manager.clone(),
            quota,
            handler,
        }
    }
}

/// Client end of a served connection.
pub struct TestClient {
    stream: DuplexStream,
}

/// Serve one connection in the background.
pub fn connect(
    services: ProtocolServices,
    config: ProtocolConfig,
) -> (TestClient, JoinHandle<Result<()>>) {
    let (client, handle, _) = connect_with_context(services, config);
    (client, handle)
}

/// Like [`connect`], also handing back the protocol's shared state.
pub fn connect_with_context(
    services: ProtocolServices,
    config: ProtocolConfig,
) -> (TestClient, JoinHandle<Result<()>>, Arc<ProtocolContext>) {
    let protocol = KafkaProtocol::new(services, config).unwrap();
    let context = Arc::clone(protocol.context());
    let (client, server) = tokio::io::duplex(1 << 20);
    let handle = tokio::spawn(async move { protocol.apply(server, client_addr()).await });
    (TestClient { stream: client }, handle, context)
}

pub fn frame(
    api_key: i16,
    api_version: i16,
    correlation_id: i32,
    client_id: Option<&str>,
    body: &[u8],
) -> BytesMut {
    let mut payload = BytesMut::with_capacity(64 + body.len());
    payload.put_i16(api_key);
    payload.put_i16(api_version);
    payload.put_i32(correlation_id);
    match client_id {
        Some(id) => {
            payload.put_i16(id.len() as i16);
            payload.put_slice(id.as_bytes());
        }
        None => payload.put_i16(-1),
    }
    payload.put_slice(body);

    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_i32(payload.len() as i32);
    buf.put_slice(&payload);
    buf
}

pub fn fetch_body(request: &FetchRequestData, version: i16) -> Bytes {
    let mut body = BytesMut::new();
    request.encode_versioned(version, &mut body).unwrap();
    body.freeze()
}

pub fn decode_fetch(body: Bytes, version: i16) -> FetchResponseData {
    let (_, response) = parse_fetch_response(NomBytes::new(body), version).unwrap();
    response
}

impl TestClient {
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send(&mut self, api_key: i16, version: i16, correlation_id: i32, body: &[u8]) {
        let bytes = frame(api_key, version, correlation_id, Some("test-client"), body);
        self.send_raw(&bytes).await;
    }

    pub async fn send_fetch(
        &mut self,
        correlation_id: i32,
        version: i16,
        request: &FetchRequestData,
    ) {
        let body = fetch_body(request, version);
        self.send(FETCH, version, correlation_id, &body).await;
    }

    /// Read one response frame: correlation id and body.
    pub async fn recv(&mut self) -> (i32, Bytes) {
        let size = self.stream.read_i32().await.unwrap();
        let mut buf = vec![0u8; size as usize];
        self.stream.read_exact(&mut buf).await.unwrap();
        let mut buf = Bytes::from(buf);
        let correlation_id = buf.get_i32();
        (correlation_id, buf)
    }

    pub async fn recv_fetch(&mut self, version: i16) -> (i32, FetchResponseData) {
        let (correlation_id, body) = self.recv().await;
        (correlation_id, decode_fetch(body, version))
    }

    /// Close the write side and read whatever is left.
    pub async fn finish(mut self) -> Vec<u8> {
        self.stream.shutdown().await.unwrap();
        let mut rest = Vec::new();
        self.stream.read_to_end(&mut rest).await.unwrap();
        rest
    }
}
