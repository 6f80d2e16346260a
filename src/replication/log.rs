//! Narrow interface to the log engine.
//!
//! The segmented on-disk log is owned by an external log manager; the replica
//! manager borrows it per operation through the [`Log`] and [`LogManager`]
//! traits. Keeping the surface to `append` / `read` / `truncate_to` / `delete`
//! plus offset accessors keeps the storage engine swappable and lets tests run
//! against the in-memory implementation in
//! [`memory_log`](super::memory_log).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::topic_partition::TopicPartition;

/// Result type for log engine operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors surfaced by the log engine.
///
/// Every variant except [`LogError::Io`] is a per-partition request failure;
/// `Io` is an unrecoverable local storage failure and halts the broker (see
/// [`super::error`]).
#[derive(Debug, Error)]
pub enum LogError {
    /// A single record exceeded the configured maximum size.
    #[error("record of {size} bytes exceeds maximum of {limit} bytes")]
    RecordTooLarge { size: usize, limit: usize },

    /// A record batch exceeded the configured maximum size.
    #[error("record batch of {size} bytes exceeds maximum of {limit} bytes")]
    BatchTooLarge { size: usize, limit: usize },

    /// A record failed its integrity check.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A record carried a timestamp outside the accepted range.
    #[error("invalid record timestamp {timestamp_ms}")]
    InvalidTimestamp { timestamp_ms: i64 },

    /// The requested offset is outside `[log_start, log_end]`.
    #[error("offset {offset} out of range [{start}, {end}]")]
    OffsetOutOfRange { offset: i64, start: i64, end: i64 },

    /// Unrecoverable local storage failure.
    #[error("log storage I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// One batch of records as handed to (or read from) the log engine.
///
/// The replica manager treats the payload as opaque bytes; only the record
/// count and timestamp participate in offset bookkeeping.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    /// Opaque serialized records.
    pub records: Bytes,
    /// Number of records in the batch; drives offset assignment.
    pub record_count: i32,
    /// Maximum record timestamp in the batch.
    pub max_timestamp_ms: i64,
}

impl RecordBatch {
    pub fn new(records: Bytes, record_count: i32, max_timestamp_ms: i64) -> Self {
        Self {
            records,
            record_count,
            max_timestamp_ms,
        }
    }

    #[inline]
    pub fn size_bytes(&self) -> usize {
        self.records.len()
    }
}

/// A batch plus the base offset the log assigned to it.
#[derive(Debug, Clone)]
pub struct SequencedBatch {
    pub base_offset: i64,
    pub batch: RecordBatch,
}

impl SequencedBatch {
    /// Offset one past the last record in this batch.
    #[inline]
    pub fn next_offset(&self) -> i64 {
        self.base_offset + i64::from(self.batch.record_count)
    }
}

/// Result of appending a batch to a log.
#[derive(Debug, Clone, Copy)]
pub struct LogAppendInfo {
    /// Offset assigned to the first record of the batch.
    pub first_offset: i64,
    /// Offset assigned to the last record of the batch.
    pub last_offset: i64,
    /// Append timestamp recorded by the log.
    pub timestamp_ms: i64,
}

/// Result of reading from a log.
#[derive(Debug, Clone, Default)]
pub struct LogReadInfo {
    /// Batches at and after the requested offset, in log order.
    pub batches: Vec<SequencedBatch>,
    /// Total payload bytes across `batches`.
    pub size_bytes: usize,
    /// Log end offset observed when the read began.
    pub log_end_offset: i64,
}

/// One partition's local log.
#[async_trait]
pub trait Log: Send + Sync + fmt::Debug {
    /// First offset still present in the log.
    fn log_start_offset(&self) -> i64;

    /// Offset one past the last appended record.
    fn log_end_offset(&self) -> i64;

    /// Base offset of the active (currently written) segment.
    fn active_segment_base_offset(&self) -> i64;

    /// Append a batch, assigning consecutive offsets starting at the current
    /// log end offset.
    async fn append(&self, batch: RecordBatch) -> LogResult<LogAppendInfo>;

    /// Read up to `max_bytes` starting at `start_offset`. When `max_offset`
    /// is set, no record at or beyond it is returned (used to cap consumer
    /// reads at the high watermark). Always returns at least one batch if one
    /// exists below the cap, so a single large batch can still make progress.
    async fn read(
        &self,
        start_offset: i64,
        max_bytes: usize,
        max_offset: Option<i64>,
    ) -> LogResult<LogReadInfo>;

    /// Discard every record at or beyond `offset`.
    async fn truncate_to(&self, offset: i64) -> LogResult<()>;
}

/// Owner of the local logs, keyed by topic-partition.
#[async_trait]
pub trait LogManager: Send + Sync + fmt::Debug {
    /// Fetch the log for a partition, creating an empty one if absent.
    async fn get_or_create(&self, tp: &TopicPartition) -> LogResult<Arc<dyn Log>>;

    /// Fetch the log for a partition if it exists.
    fn get(&self, tp: &TopicPartition) -> Option<Arc<dyn Log>>;

    /// Delete a partition's log and its backing directory.
    async fn delete(&self, tp: &TopicPartition) -> LogResult<()>;

    /// Data directory that hosts (or would host) the partition's log.
    fn data_dir(&self, tp: &TopicPartition) -> PathBuf;

    /// All configured data directories.
    fn data_dirs(&self) -> Vec<PathBuf>;
}
