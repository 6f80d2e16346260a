//! In-memory log engine for testing.
//!
//! This provides a full-featured in-memory implementation of the [`Log`] and
//! [`LogManager`] traits for comprehensive testing without touching disk.
//! Segment rolls are simulated by byte accounting so delayed-fetch futility
//! checks can be exercised.
//!
//! # Usage
//!
//! This module is available when the `test-utilities` feature is enabled,
//! or during unit tests:
//!
//! ```toml
//! [dev-dependencies]
//! replicant = { path = ".", features = ["test-utilities"] }
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;

use super::log::{
    Log, LogAppendInfo, LogError, LogManager, LogReadInfo, LogResult, RecordBatch, SequencedBatch,
};
use super::topic_partition::TopicPartition;

/// Limits applied by the in-memory log engine.
#[derive(Debug, Clone)]
pub struct MemoryLogConfig {
    /// Maximum size of a single record batch.
    pub max_batch_bytes: usize,
    /// Simulated segment size; the active segment rolls once it holds at
    /// least this many bytes.
    pub segment_bytes: usize,
}

impl Default for MemoryLogConfig {
    fn default() -> Self {
        Self {
            max_batch_bytes: 1024 * 1024,
            segment_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryLogInner {
    batches: Vec<SequencedBatch>,
    log_start: i64,
    next_offset: i64,
    active_segment_base: i64,
    active_segment_bytes: usize,
}

/// One in-memory partition log.
#[derive(Debug)]
pub struct MemoryLog {
    tp: TopicPartition,
    config: MemoryLogConfig,
    inner: RwLock<MemoryLogInner>,
}

impl MemoryLog {
    pub fn new(tp: TopicPartition, config: MemoryLogConfig) -> Self {
        Self {
            tp,
            config,
            inner: RwLock::new(MemoryLogInner::default()),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, MemoryLogInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryLogInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Log for MemoryLog {
    fn log_start_offset(&self) -> i64 {
        self.lock_read().log_start
    }

    fn log_end_offset(&self) -> i64 {
        self.lock_read().next_offset
    }

    fn active_segment_base_offset(&self) -> i64 {
        self.lock_read().active_segment_base
    }

    async fn append(&self, batch: RecordBatch) -> LogResult<LogAppendInfo> {
        if batch.size_bytes() > self.config.max_batch_bytes {
            return Err(LogError::BatchTooLarge {
                size: batch.size_bytes(),
                limit: self.config.max_batch_bytes,
            });
        }
        if batch.record_count <= 0 {
            return Err(LogError::Corrupt(format!(
                "batch for {} carries record count {}",
                self.tp, batch.record_count
            )));
        }
        if batch.max_timestamp_ms < 0 {
            return Err(LogError::InvalidTimestamp {
                timestamp_ms: batch.max_timestamp_ms,
            });
        }

        let mut inner = self.lock_write();
        let base_offset = inner.next_offset;
        let size = batch.size_bytes();
        let timestamp_ms = batch.max_timestamp_ms;
        let record_count = batch.record_count;
        inner.batches.push(SequencedBatch { base_offset, batch });
        inner.next_offset = base_offset + i64::from(record_count);
        inner.active_segment_bytes += size;
        if inner.active_segment_bytes >= self.config.segment_bytes {
            inner.active_segment_base = inner.next_offset;
            inner.active_segment_bytes = 0;
        }
        Ok(LogAppendInfo {
            first_offset: base_offset,
            last_offset: inner.next_offset - 1,
            timestamp_ms,
        })
    }

    async fn read(
        &self,
        start_offset: i64,
        max_bytes: usize,
        max_offset: Option<i64>,
    ) -> LogResult<LogReadInfo> {
        let inner = self.lock_read();
        if start_offset < inner.log_start || start_offset > inner.next_offset {
            return Err(LogError::OffsetOutOfRange {
                offset: start_offset,
                start: inner.log_start,
                end: inner.next_offset,
            });
        }

        let mut info = LogReadInfo {
            log_end_offset: inner.next_offset,
            ..Default::default()
        };
        for sb in &inner.batches {
            // Skip batches entirely before the requested offset.
            if sb.next_offset() <= start_offset {
                continue;
            }
            if let Some(cap) = max_offset {
                if sb.base_offset >= cap {
                    break;
                }
            }
            // Always make progress on the first batch, even if it alone
            // exceeds max_bytes.
            if !info.batches.is_empty() && info.size_bytes + sb.batch.size_bytes() > max_bytes {
                break;
            }
            info.size_bytes += sb.batch.size_bytes();
            info.batches.push(sb.clone());
            if info.size_bytes >= max_bytes {
                break;
            }
        }
        Ok(info)
    }

    async fn truncate_to(&self, offset: i64) -> LogResult<()> {
        let mut inner = self.lock_write();
        let target = offset.clamp(inner.log_start, inner.next_offset);
        // Batch granularity: a batch straddling the target is dropped whole.
        inner.batches.retain(|sb| sb.next_offset() <= target);
        inner.next_offset = inner
            .batches
            .last()
            .map(SequencedBatch::next_offset)
            .unwrap_or(inner.log_start);
        if inner.active_segment_base > inner.next_offset {
            inner.active_segment_base = inner.next_offset;
            inner.active_segment_bytes = 0;
        }
        Ok(())
    }
}

/// In-memory [`LogManager`].
///
/// Partitions are spread across the configured data directories by topic
/// hash, matching how the checkpoint store groups high watermarks.
#[derive(Debug)]
pub struct MemoryLogManager {
    dirs: Vec<PathBuf>,
    config: MemoryLogConfig,
    logs: DashMap<TopicPartition, Arc<MemoryLog>>,
}

impl MemoryLogManager {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self::with_config(dirs, MemoryLogConfig::default())
    }

    pub fn with_config(dirs: Vec<PathBuf>, config: MemoryLogConfig) -> Self {
        assert!(!dirs.is_empty(), "at least one data directory is required");
        Self {
            dirs,
            config,
            logs: DashMap::new(),
        }
    }

    /// True if a log currently exists for the partition.
    pub fn contains(&self, tp: &TopicPartition) -> bool {
        self.logs.contains_key(tp)
    }

    pub fn log_count(&self) -> usize {
        self.logs.len()
    }
}

#[async_trait]
impl LogManager for MemoryLogManager {
    async fn get_or_create(&self, tp: &TopicPartition) -> LogResult<Arc<dyn Log>> {
        let log = self
            .logs
            .entry(tp.clone())
            .or_insert_with(|| Arc::new(MemoryLog::new(tp.clone(), self.config.clone())))
            .clone();
        Ok(log)
    }

    fn get(&self, tp: &TopicPartition) -> Option<Arc<dyn Log>> {
        self.logs.get(tp).map(|l| l.clone() as Arc<dyn Log>)
    }

    async fn delete(&self, tp: &TopicPartition) -> LogResult<()> {
        self.logs.remove(tp);
        Ok(())
    }

    fn data_dir(&self, tp: &TopicPartition) -> PathBuf {
        let mut hasher = DefaultHasher::new();
        tp.topic().hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.dirs.len();
        self.dirs[idx].clone()
    }

    fn data_dirs(&self) -> Vec<PathBuf> {
        self.dirs.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn batch(payload: &str, records: i32) -> RecordBatch {
        RecordBatch::new(Bytes::copy_from_slice(payload.as_bytes()), records, 1_000)
    }

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", 0)
    }

    #[tokio::test]
    async fn test_append_assigns_consecutive_offsets() {
        let log = MemoryLog::new(tp(), MemoryLogConfig::default());
        let a = log.append(batch("aa", 2)).await.unwrap();
        assert_eq!((a.first_offset, a.last_offset), (0, 1));
        let b = log.append(batch("b", 1)).await.unwrap();
        assert_eq!((b.first_offset, b.last_offset), (2, 2));
        assert_eq!(log.log_end_offset(), 3);
    }

    #[tokio::test]
    async fn test_read_respects_max_offset_cap() {
        let log = MemoryLog::new(tp(), MemoryLogConfig::default());
        log.append(batch("aa", 2)).await.unwrap();
        log.append(batch("bb", 2)).await.unwrap();

        let capped = log.read(0, usize::MAX, Some(2)).await.unwrap();
        assert_eq!(capped.batches.len(), 1);
        assert_eq!(capped.batches[0].base_offset, 0);

        let full = log.read(0, usize::MAX, None).await.unwrap();
        assert_eq!(full.batches.len(), 2);
        assert_eq!(full.log_end_offset, 4);
    }

    #[tokio::test]
    async fn test_read_out_of_range() {
        let log = MemoryLog::new(tp(), MemoryLogConfig::default());
        log.append(batch("aa", 2)).await.unwrap();
        let err = log.read(7, usize::MAX, None).await.unwrap_err();
        assert!(matches!(err, LogError::OffsetOutOfRange { offset: 7, .. }));
    }

    #[tokio::test]
    async fn test_first_batch_always_returned() {
        let log = MemoryLog::new(tp(), MemoryLogConfig::default());
        log.append(batch("0123456789", 1)).await.unwrap();
        let info = log.read(0, 3, None).await.unwrap();
        assert_eq!(info.batches.len(), 1);
    }

    #[tokio::test]
    async fn test_truncate_drops_suffix() {
        let log = MemoryLog::new(tp(), MemoryLogConfig::default());
        log.append(batch("aa", 2)).await.unwrap();
        log.append(batch("bb", 2)).await.unwrap();
        log.truncate_to(2).await.unwrap();
        assert_eq!(log.log_end_offset(), 2);
        // Truncating into the middle of a batch drops the whole batch.
        log.truncate_to(1).await.unwrap();
        assert_eq!(log.log_end_offset(), 0);
    }

    #[tokio::test]
    async fn test_segment_roll_moves_active_base() {
        let config = MemoryLogConfig {
            segment_bytes: 4,
            ..Default::default()
        };
        let log = MemoryLog::new(tp(), config);
        assert_eq!(log.active_segment_base_offset(), 0);
        log.append(batch("abcd", 2)).await.unwrap();
        assert_eq!(log.active_segment_base_offset(), 2);
    }

    #[tokio::test]
    async fn test_batch_too_large() {
        let config = MemoryLogConfig {
            max_batch_bytes: 2,
            ..Default::default()
        };
        let log = MemoryLog::new(tp(), config);
        let err = log.append(batch("abc", 1)).await.unwrap_err();
        assert!(matches!(err, LogError::BatchTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_manager_create_and_delete() {
        let manager = MemoryLogManager::new(vec![PathBuf::from("/data/a")]);
        let key = tp();
        manager.get_or_create(&key).await.unwrap();
        assert!(manager.contains(&key));
        manager.delete(&key).await.unwrap();
        assert!(!manager.contains(&key));
        assert!(manager.get(&key).is_none());
    }

    #[test]
    fn test_manager_data_dir_is_stable() {
        let manager =
            MemoryLogManager::new(vec![PathBuf::from("/data/a"), PathBuf::from("/data/b")]);
        let key = tp();
        assert_eq!(manager.data_dir(&key), manager.data_dir(&key));
    }
}
