//! Fetch request handling.
//!
//! A fetch is served by an [`OpContext`] in at most two passes. The first
//! pass reads every requested partition under the request's byte budget. If
//! that does not satisfy the request and the client allowed a wait, the
//! context waits until its deadline or until any partition it read sees new
//! data, then reads everything once more and answers with what it has.
//!
//! The response tree is built up front, one placeholder per requested
//! partition in request order, so the answer always mirrors the request even
//! when a pass stops early.

pub mod partition;

use bytes::Bytes;
use futures::future::select_all;
use nombytes::NomBytes;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::constants::ISOLATION_READ_COMMITTED;
use crate::error::{Error, KafkaCode, Result};
use crate::server::ProtocolContext;
use crate::server::codec::{FetchCodec, KafkaCodec};
use crate::server::handler::RequestContext;
use crate::server::request::{FetchRequestData, FetchRequestEntry};
use crate::server::response::{
    ErrorResponseData, FetchPartitionResponse, FetchResponseData, FetchTopicResponse,
};
use crate::types::PartitionId;

use partition::{FetchConfig, PartitionWrapper, ReadResult, drain_reader, read_from_partition};

/// Byte accounting for one fetch.
///
/// `bytes_left + response_size` stays equal to the request's `max_bytes`
/// (clamped at zero) as slots are filled and refilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchBudget {
    bytes_left: usize,
    response_size: usize,
    response_error: bool,
}

impl FetchBudget {
    pub fn new(max_bytes: i32) -> Self {
        Self {
            bytes_left: usize::try_from(max_bytes).unwrap_or(0),
            response_size: 0,
            response_error: false,
        }
    }

    pub fn bytes_left(&self) -> usize {
        self.bytes_left
    }

    /// Payload bytes currently held by the response.
    pub fn response_size(&self) -> usize {
        self.response_size
    }

    /// Whether any slot has been filled with an error code.
    pub fn has_error(&self) -> bool {
        self.response_error
    }

    /// Replace `slot` with `update`, refunding what the slot held before and
    /// charging what it holds now.
    pub fn set(&mut self, slot: &mut FetchPartitionResponse, update: FetchPartitionResponse) {
        let held = slot.record_bytes();
        self.bytes_left += held;
        self.response_size = self.response_size.saturating_sub(held);

        let charged = update.record_bytes();
        self.bytes_left = self.bytes_left.saturating_sub(charged);
        self.response_size += charged;
        if update.error_code.is_error() {
            self.response_error = true;
        }
        *slot = update;
    }
}

/// Why a fetch answers without waiting (any further).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The client did not allow a wait.
    NoDebounce,
    MinBytes,
    EmptyRequest,
    PartitionError,
    DeadlineReached,
}

/// One response slot per requested partition, in request order.
pub fn create_response_placeholders(request: &FetchRequestData) -> FetchResponseData {
    FetchResponseData {
        responses: request
            .topics
            .iter()
            .map(|topic| FetchTopicResponse {
                name: topic.name.clone(),
                partitions: topic
                    .partitions
                    .iter()
                    .map(|p| FetchPartitionResponse::placeholder(p.partition_index))
                    .collect(),
            })
            .collect(),
        ..Default::default()
    }
}

/// State of one fetch between decode and response.
pub struct OpContext {
    proto: Arc<ProtocolContext>,
    rctx: RequestContext,
    request: FetchRequestData,
    response: FetchResponseData,
    budget: FetchBudget,
    deadline: Option<Instant>,
    initial_fetch: bool,
    watchers: Vec<watch::Receiver<i64>>,
}

impl OpContext {
    pub fn new(proto: Arc<ProtocolContext>, rctx: RequestContext, request: FetchRequestData) -> Self {
        let response = create_response_placeholders(&request);
        let budget = FetchBudget::new(request.max_bytes);
        let deadline = request.debounce_delay().map(|delay| Instant::now() + delay);
        Self {
            proto,
            rctx,
            request,
            response,
            budget,
            deadline,
            initial_fetch: true,
            watchers: Vec::new(),
        }
    }

    pub fn budget(&self) -> &FetchBudget {
        &self.budget
    }

    pub fn response(&self) -> &FetchResponseData {
        &self.response
    }

    /// Read every requested partition in order, filling the response slots
    /// in place. Ends early once the byte budget is spent.
    pub async fn collect(&mut self) {
        let Self {
            proto,
            rctx,
            request,
            response,
            budget,
            initial_fetch,
            watchers,
            ..
        } = self;
        let read_committed = request.isolation_level == ISOLATION_READ_COMMITTED;

        for (entry, slot) in request.iter().zip(response.iter_mut()) {
            debug_assert_eq!(entry.topic_index, slot.topic_index);
            debug_assert_eq!(entry.partition_index, slot.partition_index);

            let held = slot.response.record_bytes();
            let partition_max = usize::try_from(entry.partition.partition_max_bytes).unwrap_or(0);
            let max_bytes = partition_max.min(budget.bytes_left() + held);

            let update = fetch_partition(
                proto,
                request.replica_id,
                entry,
                FetchConfig {
                    start_offset: entry.partition.fetch_offset,
                    max_bytes,
                    read_committed,
                    // see FetchConfig::strict_max_bytes for the tradeoff
                    strict_max_bytes: true,
                },
                if *initial_fetch { Some(&mut *watchers) } else { None },
            )
            .await;

            trace!(
                correlation_id = %rctx.correlation_id,
                topic = slot.topic,
                partition = update.partition_index,
                error_code = ?update.error_code,
                bytes = update.record_bytes(),
                "Partition read"
            );
            budget.set(slot.response, update);

            if budget.bytes_left() == 0 {
                debug!(
                    correlation_id = %rctx.correlation_id,
                    response_size = budget.response_size(),
                    "Fetch byte budget exhausted"
                );
                break;
            }
        }
    }

    /// First satisfied stop condition, in precedence order.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.request.debounce_delay().is_none() {
            Some(StopReason::NoDebounce)
        } else if self.budget.response_size() as i64 >= i64::from(self.request.min_bytes) {
            Some(StopReason::MinBytes)
        } else if self.request.is_empty() {
            Some(StopReason::EmptyRequest)
        } else if self.budget.has_error() {
            Some(StopReason::PartitionError)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(StopReason::DeadlineReached)
        } else {
            None
        }
    }

    pub fn should_stop_fetch(&self) -> bool {
        self.stop_reason().is_some()
    }

    /// Sleep until the deadline or until any partition read on the first
    /// pass advances its high watermark, whichever comes first.
    async fn wait_for_data(&mut self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let watchers = std::mem::take(&mut self.watchers);

        let changed = async move {
            if watchers.is_empty() {
                return std::future::pending::<()>().await;
            }
            let waits = watchers.into_iter().map(|mut rx| {
                Box::pin(async move {
                    let _ = rx.changed().await;
                })
            });
            select_all(waits).await;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                trace!(correlation_id = %self.rctx.correlation_id, "Fetch deadline reached");
            }
            _ = changed => {
                trace!(correlation_id = %self.rctx.correlation_id, "New data for fetch");
            }
        }
    }

    /// Collect, and if the result does not satisfy the request, wait once
    /// and collect once more.
    pub async fn run(mut self) -> Result<Bytes> {
        self.collect().await;
        if let Some(reason) = self.stop_reason() {
            debug!(
                correlation_id = %self.rctx.correlation_id,
                ?reason,
                response_size = self.budget.response_size(),
                "Fetch answered after first pass"
            );
            return self.send_response();
        }

        self.wait_for_data().await;
        self.initial_fetch = false;
        self.collect().await;
        debug!(
            correlation_id = %self.rctx.correlation_id,
            response_size = self.budget.response_size(),
            "Fetch answered after wait"
        );
        self.send_response()
    }

    /// Finalize and encode the response for the request's version.
    pub fn send_response(mut self) -> Result<Bytes> {
        self.response.throttle_time_ms = self.rctx.throttle_time_ms();
        self.response.error_code = KafkaCode::None;
        self.response.session_id = 0;
        FetchCodec::encode_response(&self.response, self.rctx.api_version)
    }
}

fn partition_error(partition_index: i32, error_code: KafkaCode) -> FetchPartitionResponse {
    FetchPartitionResponse {
        error_code,
        ..FetchPartitionResponse::placeholder(partition_index)
    }
}

/// Route, validate and read a single partition.
async fn fetch_partition(
    proto: &ProtocolContext,
    replica_id: i32,
    entry: FetchRequestEntry<'_>,
    config: FetchConfig,
    watchers: Option<&mut Vec<watch::Receiver<i64>>>,
) -> FetchPartitionResponse {
    let index = entry.partition.partition_index;
    let id = PartitionId::new(entry.topic.name.as_str(), index);

    let Some(shard) = proto.services.shard_table.shard_for(&id) else {
        return partition_error(index, KafkaCode::NotLeaderForPartition);
    };
    let Some(partition) = proto.services.partitions.get(shard, &id) else {
        return partition_error(index, KafkaCode::UnknownTopicOrPartition);
    };

    let requested_epoch = entry.partition.current_leader_epoch;
    if requested_epoch >= 0 {
        let epoch = partition.leader_epoch();
        if requested_epoch < epoch {
            return partition_error(index, KafkaCode::FencedLeaderEpoch);
        }
        if requested_epoch > epoch {
            return partition_error(index, KafkaCode::UnknownLeaderEpoch);
        }
    }

    if let Some(watchers) = watchers {
        watchers.push(partition.subscribe());
    }

    let Ok(_permit) = proto.partition_reads.acquire().await else {
        return partition_error(index, KafkaCode::Unknown);
    };

    let wrapper = match PartitionWrapper::for_replica(partition, replica_id).await {
        Ok(wrapper) => wrapper,
        Err(code) => return partition_error(index, code),
    };

    match read_from_partition(&wrapper, config).await {
        ReadResult::Error(code) => partition_error(index, code),
        ReadResult::Read {
            reader,
            high_watermark,
            last_stable_offset,
            log_start_offset,
            aborted_transactions,
        } => {
            let records = match reader {
                Some(mut reader) => {
                    match drain_reader(reader.as_mut(), config.max_bytes, config.strict_max_bytes)
                        .await
                    {
                        Ok(records) => records,
                        Err(code) => return partition_error(index, code),
                    }
                }
                None => None,
            };
            FetchPartitionResponse {
                partition_index: index,
                error_code: KafkaCode::None,
                high_watermark,
                last_stable_offset,
                log_start_offset,
                aborted_transactions,
                records,
            }
        }
    }
}

/// Serve one fetch request body, returning the encoded response body.
///
/// Undecodable requests are answered with an error body rather than failing
/// the connection.
pub async fn handle_fetch(
    proto: Arc<ProtocolContext>,
    rctx: RequestContext,
    body: Bytes,
) -> Result<Bytes> {
    let request = match FetchCodec::decode_request(NomBytes::new(body), rctx.api_version) {
        Ok(request) => request,
        Err(Error::UnsupportedVersion { version, .. }) => {
            debug!(client = %rctx.client_addr, version, "Unsupported fetch version");
            return ErrorResponseData::new(KafkaCode::UnsupportedVersion).to_bytes();
        }
        Err(e) => {
            debug!(client = %rctx.client_addr, error = %e, "Malformed fetch request");
            // The version is one we speak, so the client expects a fetch
            // response it can decode.
            let response = FetchResponseData {
                throttle_time_ms: rctx.throttle_time_ms(),
                error_code: KafkaCode::InvalidRequest,
                ..Default::default()
            };
            return FetchCodec::encode_response(&response, rctx.api_version);
        }
    };

    debug!(
        client = %rctx.client_addr,
        correlation_id = %rctx.correlation_id,
        replica_id = request.replica_id,
        partitions = request.partition_count(),
        max_wait_ms = request.max_wait_ms,
        min_bytes = request.min_bytes,
        max_bytes = request.max_bytes,
        "FETCH request received"
    );
    if !request.forgotten_topics.is_empty() {
        debug!(
            forgotten = request.forgotten_topics.len(),
            "Ignoring forgotten topics, fetch sessions are not kept"
        );
    }

    OpContext::new(proto, rctx, request).run().await
}
