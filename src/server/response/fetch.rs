//! Fetch response encoding and in-place traversal.
//!
//! The fetch path builds its response tree up front, one placeholder per
//! requested partition, then fills the slots as reads complete. Filling is
//! done through [`FetchResponseIterMut`], which walks the tree in the same
//! flattened order as [`FetchRequestIter`](crate::server::request::FetchRequestIter).

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;
use num_traits::FromPrimitive;
use std::iter::FusedIterator;
use std::slice;

use crate::encode::{ToByte, encode_as_array, encode_nullable_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_utf8_string};

/// Fetch response data, covering every field up to v10.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponseData {
    /// v1+
    pub throttle_time_ms: i32,
    /// v7+
    pub error_code: KafkaCode,
    /// v7+
    pub session_id: i32,
    pub responses: Vec<FetchTopicResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchTopicResponse {
    pub name: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    /// v4+
    pub last_stable_offset: i64,
    /// v5+
    pub log_start_offset: i64,
    /// v4+, null when the broker does not track aborted transactions.
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,
    pub records: Option<Bytes>,
}

impl FetchPartitionResponse {
    /// The state of a slot before any read has touched it.
    pub fn placeholder(partition_index: i32) -> Self {
        Self {
            partition_index,
            error_code: KafkaCode::None,
            high_watermark: -1,
            last_stable_offset: -1,
            log_start_offset: -1,
            aborted_transactions: None,
            records: None,
        }
    }

    /// Payload bytes carried by this slot.
    pub fn record_bytes(&self) -> usize {
        self.records.as_ref().map_or(0, Bytes::len)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

impl FetchResponseData {
    /// Encode for a specific API version.
    /// - v1+: throttle_time_ms
    /// - v4+: last_stable_offset, aborted_transactions
    /// - v5+: log_start_offset
    /// - v7+: error_code, session_id
    pub fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        if version >= 7 {
            self.error_code.as_i16().encode(buffer)?;
            self.session_id.encode(buffer)?;
        }
        encode_as_array(buffer, &self.responses, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.encode_versioned(buffer, version)
            })
        })
    }

    /// Flattened mutable walk over every partition slot.
    pub fn iter_mut(&mut self) -> FetchResponseIterMut<'_> {
        FetchResponseIterMut::new(&mut self.responses)
    }

    /// Total payload bytes across all slots.
    pub fn record_bytes(&self) -> usize {
        self.responses
            .iter()
            .flat_map(|t| t.partitions.iter())
            .map(FetchPartitionResponse::record_bytes)
            .sum()
    }
}

impl FetchPartitionResponse {
    fn encode_versioned<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.partition_index.encode(buffer)?;
        self.error_code.as_i16().encode(buffer)?;
        self.high_watermark.encode(buffer)?;
        if version >= 4 {
            self.last_stable_offset.encode(buffer)?;
        }
        if version >= 5 {
            self.log_start_offset.encode(buffer)?;
        }
        if version >= 4 {
            encode_nullable_array(
                buffer,
                self.aborted_transactions.as_deref(),
                |buffer, txn| txn.encode(buffer),
            )?;
        }
        self.records.encode(buffer)
    }
}

impl ToByte for AbortedTransaction {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.producer_id.encode(buffer)?;
        self.first_offset.encode(buffer)
    }
}

// ============================================================================
// Parsing (client side)
// ============================================================================

/// Decode a response body produced by [`FetchResponseData::encode_versioned`].
pub fn parse_fetch_response(s: NomBytes, version: i16) -> IResult<NomBytes, FetchResponseData> {
    let (s, throttle_time_ms) = if version >= 1 { be_i32(s)? } else { (s, 0) };
    let (s, error_code, session_id) = if version >= 7 {
        let (s, code) = be_i16(s)?;
        let (s, id) = be_i32(s)?;
        (s, code, id)
    } else {
        (s, 0, 0)
    };
    let (s, responses) = match version {
        v if v >= 5 => parse_array(parse_topic_v5)(s)?,
        _ => parse_array(parse_topic_v4)(s)?,
    };

    Ok((
        s,
        FetchResponseData {
            throttle_time_ms,
            error_code: kafka_code(error_code),
            session_id,
            responses,
        },
    ))
}

fn kafka_code(code: i16) -> KafkaCode {
    KafkaCode::from_i16(code).unwrap_or(KafkaCode::Unknown)
}

fn parse_topic_v4(s: NomBytes) -> IResult<NomBytes, FetchTopicResponse> {
    let (s, name) = parse_utf8_string(s)?;
    let (s, partitions) = parse_array(parse_partition_v4)(s)?;
    Ok((s, FetchTopicResponse { name, partitions }))
}

fn parse_topic_v5(s: NomBytes) -> IResult<NomBytes, FetchTopicResponse> {
    let (s, name) = parse_utf8_string(s)?;
    let (s, partitions) = parse_array(parse_partition_v5)(s)?;
    Ok((s, FetchTopicResponse { name, partitions }))
}

fn parse_partition_v4(s: NomBytes) -> IResult<NomBytes, FetchPartitionResponse> {
    parse_partition(s, false)
}

fn parse_partition_v5(s: NomBytes) -> IResult<NomBytes, FetchPartitionResponse> {
    parse_partition(s, true)
}

fn parse_partition(
    s: NomBytes,
    with_log_start: bool,
) -> IResult<NomBytes, FetchPartitionResponse> {
    let (s, partition_index) = be_i32(s)?;
    let (s, error_code) = be_i16(s)?;
    let (s, high_watermark) = be_i64(s)?;
    let (s, last_stable_offset) = be_i64(s)?;
    let (s, log_start_offset) = if with_log_start { be_i64(s)? } else { (s, -1) };
    let (s, aborted_len) = be_i32(s)?;
    let (s, aborted_transactions) = if aborted_len < 0 {
        (s, None)
    } else {
        let mut s = s;
        let mut txns = Vec::new();
        for _ in 0..aborted_len {
            let (rest, producer_id) = be_i64(s)?;
            let (rest, first_offset) = be_i64(rest)?;
            txns.push(AbortedTransaction {
                producer_id,
                first_offset,
            });
            s = rest;
        }
        (s, Some(txns))
    };
    let (s, records_len) = be_i32(s)?;
    let (s, records) = if records_len < 0 {
        (s, None)
    } else {
        let (s, raw) = nom::bytes::complete::take(records_len as usize)(s)?;
        (s, Some(raw.into_bytes()))
    };

    Ok((
        s,
        FetchPartitionResponse {
            partition_index,
            error_code: kafka_code(error_code),
            high_watermark,
            last_stable_offset,
            log_start_offset,
            aborted_transactions,
            records,
        },
    ))
}

// ============================================================================
// Flattening mutable iterator
// ============================================================================

/// Mutable access to one partition slot, with its position in the tree.
#[derive(Debug)]
pub struct ResponseSlot<'a> {
    /// First partition of its topic.
    pub new_topic: bool,
    pub topic_index: usize,
    pub partition_index: usize,
    pub topic: &'a str,
    pub response: &'a mut FetchPartitionResponse,
}

/// Walks `responses -> partitions` as one flat sequence of mutable slots.
///
/// Topics without partitions yield nothing, matching the request iterator so
/// the two can be zipped.
pub struct FetchResponseIterMut<'a> {
    topics: std::iter::Enumerate<slice::IterMut<'a, FetchTopicResponse>>,
    current: Option<TopicCursor<'a>>,
}

struct TopicCursor<'a> {
    topic_index: usize,
    name: &'a str,
    partitions: std::iter::Enumerate<slice::IterMut<'a, FetchPartitionResponse>>,
}

impl<'a> FetchResponseIterMut<'a> {
    pub fn new(topics: &'a mut [FetchTopicResponse]) -> Self {
        Self {
            topics: topics.iter_mut().enumerate(),
            current: None,
        }
    }
}

impl<'a> Iterator for FetchResponseIterMut<'a> {
    type Item = ResponseSlot<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(cursor) = self.current.as_mut()
                && let Some((partition_index, response)) = cursor.partitions.next()
            {
                return Some(ResponseSlot {
                    new_topic: partition_index == 0,
                    topic_index: cursor.topic_index,
                    partition_index,
                    topic: cursor.name,
                    response,
                });
            }

            let (topic_index, topic) = self.topics.next()?;
            let FetchTopicResponse { name, partitions } = topic;
            self.current = Some(TopicCursor {
                topic_index,
                name: name.as_str(),
                partitions: partitions.iter_mut().enumerate(),
            });
        }
    }
}

impl FusedIterator for FetchResponseIterMut<'_> {}
