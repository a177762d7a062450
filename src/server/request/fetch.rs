//! Fetch request parsing and traversal.
//!
//! A fetch names a two-level tree of `topic -> [partition]`. Most of the fetch
//! path wants to walk it as a flat sequence of partitions, which is what
//! [`FetchRequestIter`] provides.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i8, be_i32, be_i64},
};
use nombytes::NomBytes;
use std::iter::FusedIterator;
use std::time::Duration;

use crate::encode::{ToByte, encode_as_array};
use crate::error::Result;
use crate::parser::{parse_array, parse_utf8_string};

/// Fetch request data, covering every field up to v10.
///
/// Fields that a version does not carry hold the value an older client
/// implies.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequestData {
    /// Broker id of a follower replica, or -1 for consumers.
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    /// v3+
    pub max_bytes: i32,
    /// v4+: 0 = read_uncommitted, 1 = read_committed
    pub isolation_level: i8,
    /// v7+
    pub session_id: i32,
    /// v7+
    pub session_epoch: i32,
    pub topics: Vec<FetchTopicData>,
    /// v7+
    pub forgotten_topics: Vec<ForgottenTopic>,
}

impl Default for FetchRequestData {
    fn default() -> Self {
        Self {
            replica_id: -1,
            max_wait_ms: 0,
            min_bytes: 0,
            max_bytes: i32::MAX,
            isolation_level: 0,
            session_id: 0,
            session_epoch: -1,
            topics: Vec::new(),
            forgotten_topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchTopicData {
    pub name: String,
    pub partitions: Vec<FetchPartitionData>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPartitionData {
    pub partition_index: i32,
    /// v9+, -1 when the client does not know the epoch.
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    /// v5+, only meaningful for follower fetches.
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

impl FetchPartitionData {
    pub fn new(partition_index: i32, fetch_offset: i64, partition_max_bytes: i32) -> Self {
        Self {
            partition_index,
            current_leader_epoch: -1,
            fetch_offset,
            log_start_offset: -1,
            partition_max_bytes,
        }
    }
}

/// A topic the client removes from its incremental fetch session.
#[derive(Debug, Clone, PartialEq)]
pub struct ForgottenTopic {
    pub name: String,
    pub partitions: Vec<i32>,
}

impl FetchRequestData {
    /// True when there is nothing to fetch: no topics, or only topics
    /// without partitions.
    pub fn is_empty(&self) -> bool {
        self.topics.iter().all(|t| t.partitions.is_empty())
    }

    /// How long the client allows the broker to wait for `min_bytes`.
    ///
    /// `None` means the fetch must be answered with whatever the first pass
    /// collects.
    pub fn debounce_delay(&self) -> Option<Duration> {
        if self.max_wait_ms <= 0 {
            None
        } else {
            Some(Duration::from_millis(self.max_wait_ms as u64))
        }
    }

    pub fn partition_count(&self) -> usize {
        self.topics.iter().map(|t| t.partitions.len()).sum()
    }

    /// Flattened walk over every requested partition, in request order.
    pub fn iter(&self) -> FetchRequestIter<'_> {
        FetchRequestIter::new(&self.topics)
    }

    /// Serialize the body for `version`, the inverse of
    /// [`parse_fetch_request`]. Used by clients and tests.
    pub fn encode_versioned<W: BufMut>(&self, version: i16, buffer: &mut W) -> Result<()> {
        self.replica_id.encode(buffer)?;
        self.max_wait_ms.encode(buffer)?;
        self.min_bytes.encode(buffer)?;
        if version >= 3 {
            self.max_bytes.encode(buffer)?;
        }
        if version >= 4 {
            self.isolation_level.encode(buffer)?;
        }
        if version >= 7 {
            self.session_id.encode(buffer)?;
            self.session_epoch.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                if version >= 9 {
                    p.current_leader_epoch.encode(buffer)?;
                }
                p.fetch_offset.encode(buffer)?;
                if version >= 5 {
                    p.log_start_offset.encode(buffer)?;
                }
                p.partition_max_bytes.encode(buffer)
            })
        })?;
        if version >= 7 {
            encode_as_array(buffer, &self.forgotten_topics, |buffer, t| {
                t.name.encode(buffer)?;
                t.partitions.encode(buffer)
            })?;
        }
        Ok(())
    }
}

pub fn parse_fetch_request(s: NomBytes, version: i16) -> IResult<NomBytes, FetchRequestData> {
    let (s, replica_id) = be_i32(s)?;
    let (s, max_wait_ms) = be_i32(s)?;
    let (s, min_bytes) = be_i32(s)?;
    let (s, max_bytes) = if version >= 3 {
        be_i32(s)?
    } else {
        (s, i32::MAX)
    };
    let (s, isolation_level) = if version >= 4 { be_i8(s)? } else { (s, 0) };
    let (s, session_id, session_epoch) = if version >= 7 {
        let (s, id) = be_i32(s)?;
        let (s, epoch) = be_i32(s)?;
        (s, id, epoch)
    } else {
        (s, 0, -1)
    };

    let (s, topics) = match version {
        v if v >= 9 => parse_array(parse_fetch_topic_v9)(s)?,
        v if v >= 5 => parse_array(parse_fetch_topic_v5)(s)?,
        _ => parse_array(parse_fetch_topic_v0)(s)?,
    };

    let (s, forgotten_topics) = if version >= 7 {
        parse_array(parse_forgotten_topic)(s)?
    } else {
        (s, Vec::new())
    };

    Ok((
        s,
        FetchRequestData {
            replica_id,
            max_wait_ms,
            min_bytes,
            max_bytes,
            isolation_level,
            session_id,
            session_epoch,
            topics,
            forgotten_topics,
        },
    ))
}

// `parse_array` wants `Copy` parsers, so each layout gets its own fn item.

fn parse_fetch_topic_v0(s: NomBytes) -> IResult<NomBytes, FetchTopicData> {
    parse_fetch_topic(s, 0)
}

fn parse_fetch_topic_v5(s: NomBytes) -> IResult<NomBytes, FetchTopicData> {
    parse_fetch_topic(s, 5)
}

fn parse_fetch_topic_v9(s: NomBytes) -> IResult<NomBytes, FetchTopicData> {
    parse_fetch_topic(s, 9)
}

fn parse_fetch_topic(s: NomBytes, version: i16) -> IResult<NomBytes, FetchTopicData> {
    let (s, name) = parse_utf8_string(s)?;
    let (s, partitions) = match version {
        9 => parse_array(parse_fetch_partition_v9)(s)?,
        5 => parse_array(parse_fetch_partition_v5)(s)?,
        _ => parse_array(parse_fetch_partition_v0)(s)?,
    };

    Ok((s, FetchTopicData { name, partitions }))
}

fn parse_fetch_partition_v0(s: NomBytes) -> IResult<NomBytes, FetchPartitionData> {
    parse_fetch_partition(s, 0)
}

fn parse_fetch_partition_v5(s: NomBytes) -> IResult<NomBytes, FetchPartitionData> {
    parse_fetch_partition(s, 5)
}

fn parse_fetch_partition_v9(s: NomBytes) -> IResult<NomBytes, FetchPartitionData> {
    parse_fetch_partition(s, 9)
}

fn parse_fetch_partition(s: NomBytes, version: i16) -> IResult<NomBytes, FetchPartitionData> {
    let (s, partition_index) = be_i32(s)?;
    let (s, current_leader_epoch) = if version >= 9 { be_i32(s)? } else { (s, -1) };
    let (s, fetch_offset) = be_i64(s)?;
    let (s, log_start_offset) = if version >= 5 { be_i64(s)? } else { (s, -1) };
    let (s, partition_max_bytes) = be_i32(s)?;

    Ok((
        s,
        FetchPartitionData {
            partition_index,
            current_leader_epoch,
            fetch_offset,
            log_start_offset,
            partition_max_bytes,
        },
    ))
}

fn parse_forgotten_topic(s: NomBytes) -> IResult<NomBytes, ForgottenTopic> {
    let (s, name) = parse_utf8_string(s)?;
    let (s, partitions) = parse_array(be_i32::<NomBytes, nom::error::Error<NomBytes>>)(s)?;
    Ok((s, ForgottenTopic { name, partitions }))
}

// ============================================================================
// Flattening iterator
// ============================================================================

/// One requested partition together with its position in the tree.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequestEntry<'a> {
    /// First partition of its topic.
    pub new_topic: bool,
    pub topic_index: usize,
    pub partition_index: usize,
    pub topic: &'a FetchTopicData,
    pub partition: &'a FetchPartitionData,
}

/// Walks `topics -> partitions` as one flat sequence.
///
/// The cursor is kept normalized: it never rests on a topic whose partitions
/// are exhausted, so topics without partitions are skipped and the end
/// position is unique.
#[derive(Debug, Clone)]
pub struct FetchRequestIter<'a> {
    topics: &'a [FetchTopicData],
    topic: usize,
    partition: usize,
}

impl<'a> FetchRequestIter<'a> {
    pub fn new(topics: &'a [FetchTopicData]) -> Self {
        let mut iter = Self {
            topics,
            topic: 0,
            partition: 0,
        };
        iter.normalize();
        iter
    }

    fn normalize(&mut self) {
        while self.topic < self.topics.len()
            && self.partition >= self.topics[self.topic].partitions.len()
        {
            self.topic += 1;
            self.partition = 0;
        }
    }

    /// True once every partition has been yielded.
    pub fn is_end(&self) -> bool {
        self.topic >= self.topics.len()
    }
}

impl<'a> Iterator for FetchRequestIter<'a> {
    type Item = FetchRequestEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let topics = self.topics;
        let topic = topics.get(self.topic)?;
        let partition = topic.partitions.get(self.partition)?;
        let entry = FetchRequestEntry {
            new_topic: self.partition == 0,
            topic_index: self.topic,
            partition_index: self.partition,
            topic,
            partition,
        };
        self.partition += 1;
        self.normalize();
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.topics[self.topic.min(self.topics.len())..]
            .iter()
            .map(|t| t.partitions.len())
            .sum::<usize>()
            .saturating_sub(self.partition);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for FetchRequestIter<'_> {}

impl FusedIterator for FetchRequestIter<'_> {}

/// Two cursors are equal when they rest on the same topic and, unless both
/// are at the end, on the same partition of it.
impl PartialEq for FetchRequestIter<'_> {
    fn eq(&self, other: &Self) -> bool {
        if self.is_end() && other.is_end() {
            return true;
        }
        self.topic == other.topic && self.partition == other.partition
    }
}
