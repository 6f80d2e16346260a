//! Delayed fetch: a fetch parked until enough bytes accumulate.
//!
//! Registered when an immediate read came back under the request's
//! `min_bytes`. Progress events re-evaluate the wait; it ends as soon as
//!
//! - accumulated readable bytes across all partitions reach `min_bytes`, or
//! - waiting further is futile for any partition: leadership moved, the
//!   partition disappeared, the fetch offset fell out of range (truncation),
//!   or the segment holding the fetch offset rolled.
//!
//! Completion re-reads the log so the response carries the freshest data; an
//! expired wait responds the same way, which for an idle partition means an
//! empty record set with no error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use super::PartitionMap;
use super::commands::{FetchPartitionResponse, FetchResponse};
use super::error::{ReplicaError, halt_on_storage_error};
use super::purgatory::DelayedOperation;
use super::topic_partition::TopicPartition;

/// Per-partition snapshot taken when the fetch was parked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FetchPartitionStatus {
    pub fetch_offset: i64,
    pub max_bytes: usize,
    /// Active segment base when the wait began; a later value means the
    /// segment rolled and the wait is futile.
    pub segment_base_at_request: i64,
}

/// A fetch request parked until data accumulates or the wait turns futile.
#[derive(Debug)]
pub(crate) struct DelayedFetch {
    replica_id: i32,
    min_bytes: usize,
    require_leader: bool,
    cap_at_hw: bool,
    statuses: Vec<(TopicPartition, FetchPartitionStatus)>,
    partition_map: PartitionMap,
    completed: AtomicBool,
    sender: std::sync::Mutex<Option<oneshot::Sender<FetchResponse>>>,
}

impl DelayedFetch {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        partition_map: PartitionMap,
        replica_id: i32,
        min_bytes: usize,
        require_leader: bool,
        cap_at_hw: bool,
        statuses: Vec<(TopicPartition, FetchPartitionStatus)>,
        sender: oneshot::Sender<FetchResponse>,
    ) -> Arc<Self> {
        Arc::new(Self {
            replica_id,
            min_bytes,
            require_leader,
            cap_at_hw,
            statuses,
            partition_map,
            completed: AtomicBool::new(false),
            sender: std::sync::Mutex::new(Some(sender)),
        })
    }

    fn claim(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim completion, re-read every partition and deliver the response.
    async fn complete_now(&self) -> bool {
        if !self.claim() {
            return false;
        }
        let mut partitions = Vec::with_capacity(self.statuses.len());
        for (tp, status) in &self.statuses {
            let response = read_one(
                &self.partition_map,
                tp,
                status.fetch_offset,
                status.max_bytes,
                self.require_leader,
                self.cap_at_hw,
            )
            .await;
            partitions.push((tp.clone(), response));
        }

        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            let _ = sender.send(FetchResponse { partitions });
        }
        true
    }
}

#[async_trait]
impl DelayedOperation for DelayedFetch {
    async fn try_complete(&self) -> bool {
        if self.is_completed() {
            return false;
        }

        let mut accumulated = 0usize;
        for (tp, status) in &self.statuses {
            let partition = self.partition_map.get(tp).map(|p| Arc::clone(&p));
            let Some(partition) = partition else {
                debug!(%tp, "partition gone, finishing delayed fetch");
                return self.complete_now().await;
            };
            if self.require_leader && !partition.is_leader().await {
                debug!(%tp, "leadership moved, finishing delayed fetch");
                return self.complete_now().await;
            }
            let Some(log) = partition.local_log().await else {
                return self.complete_now().await;
            };

            let log_start = log.log_start_offset();
            let log_end = log.log_end_offset();
            if status.fetch_offset < log_start || status.fetch_offset > log_end {
                debug!(%tp, offset = status.fetch_offset, "fetch offset out of range, finishing delayed fetch");
                return self.complete_now().await;
            }
            if log.active_segment_base_offset() > status.segment_base_at_request {
                debug!(%tp, "fetch-offset segment rolled, finishing delayed fetch");
                return self.complete_now().await;
            }

            match partition
                .read_from_local(
                    status.fetch_offset,
                    status.max_bytes,
                    self.require_leader,
                    self.cap_at_hw,
                )
                .await
            {
                Ok(info) => accumulated += info.read.size_bytes,
                Err(e) if e.is_fatal() => halt_on_storage_error("delayed fetch read", &e),
                Err(_) => return self.complete_now().await,
            }
        }

        if accumulated >= self.min_bytes {
            debug!(
                accumulated,
                min_bytes = self.min_bytes,
                replica_id = self.replica_id,
                "delayed fetch satisfied"
            );
            self.complete_now().await
        } else {
            false
        }
    }

    async fn on_expiration(&self) {
        self.complete_now().await;
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

/// Read one partition for a fetch response, classifying errors into the
/// partition slot. Shared by the immediate fetch path and delayed-fetch
/// completion.
pub(crate) async fn read_one(
    partition_map: &PartitionMap,
    tp: &TopicPartition,
    offset: i64,
    max_bytes: usize,
    require_leader: bool,
    cap_at_hw: bool,
) -> FetchPartitionResponse {
    let partition = partition_map.get(tp).map(|p| Arc::clone(&p));
    let Some(partition) = partition else {
        return FetchPartitionResponse::error(
            ReplicaError::UnknownTopicOrPartition(tp.clone()).error_code(),
        );
    };
    match partition
        .read_from_local(offset, max_bytes, require_leader, cap_at_hw)
        .await
    {
        Ok(info) => FetchPartitionResponse {
            error: crate::error::ErrorCode::None,
            high_watermark: info.high_watermark,
            records: info.read.batches,
        },
        Err(e) if e.is_fatal() => halt_on_storage_error("fetch read", &e),
        Err(e) => FetchPartitionResponse::error(e.error_code()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CONSUMER_REPLICA_ID;
    use crate::error::ErrorCode;
    use crate::replication::clock::{Clock, ManualClock};
    use crate::replication::commands::PartitionStateData;
    use crate::replication::config::ReplicaConfig;
    use crate::replication::coordination::{CoordinationStore, IsrChangeLog};
    use crate::replication::log::RecordBatch;
    use crate::replication::memory_log::MemoryLogManager;
    use crate::replication::metrics::ReplicaMetrics;
    use crate::replication::mock_coordination::MockCoordinationStore;
    use crate::replication::partition::{Partition, PartitionContext};
    use crate::replication::purgatory::Purgatory;
    use bytes::Bytes;
    use dashmap::DashMap;
    use std::path::PathBuf;

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", 0)
    }

    async fn sole_leader() -> (PartitionMap, Arc<Partition>) {
        let metrics = Arc::new(ReplicaMetrics::unregistered());
        let ctx = PartitionContext {
            config: Arc::new(ReplicaConfig::new(1)),
            log_manager: Arc::new(MemoryLogManager::new(vec![PathBuf::from("/data")])),
            coordination: Arc::new(MockCoordinationStore::new()) as Arc<dyn CoordinationStore>,
            isr_changes: Arc::new(IsrChangeLog::new()),
            produce_purgatory: Arc::new(Purgatory::new(
                "produce",
                metrics.delayed_produce_pending.clone(),
                metrics.delayed_operation_timeouts.clone(),
            )),
            clock: Arc::new(ManualClock::new(1_000)) as Arc<dyn Clock>,
            metrics,
        };
        let partition = Arc::new(Partition::new(tp(), ctx, 0));
        partition
            .make_leader(&PartitionStateData {
                tp: tp(),
                controller_epoch: 1,
                leader: 1,
                leader_epoch: 0,
                isr: vec![1],
                replicas: vec![1],
                version: 0,
            })
            .await
            .unwrap();
        let map: PartitionMap = Arc::new(DashMap::new());
        map.insert(tp(), Arc::clone(&partition));
        (map, partition)
    }

    fn status(fetch_offset: i64) -> (TopicPartition, FetchPartitionStatus) {
        (
            tp(),
            FetchPartitionStatus {
                fetch_offset,
                max_bytes: 1024,
                segment_base_at_request: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_completes_once_bytes_accumulate() {
        let (map, partition) = sole_leader().await;
        let (sender, receiver) = oneshot::channel();
        let op = DelayedFetch::new(
            Arc::clone(&map),
            CONSUMER_REPLICA_ID,
            4,
            true,
            true,
            vec![status(0)],
            sender,
        );

        assert!(!op.try_complete().await);

        partition
            .append_to_leader(RecordBatch::new(Bytes::from_static(b"abcd"), 1, 1_000), 1)
            .await
            .unwrap();
        assert!(op.try_complete().await);

        let response = receiver.await.unwrap();
        let (_, part) = &response.partitions[0];
        assert_eq!(part.error, ErrorCode::None);
        assert_eq!(part.records.len(), 1);
        assert_eq!(part.high_watermark, 1);
    }

    #[tokio::test]
    async fn test_consumer_wait_ignores_uncommitted_bytes() {
        let (map, partition) = sole_leader().await;
        // Demote the single-broker ISR trick: add an unknown follower so the
        // high watermark stays behind the log end.
        partition
            .make_leader(&PartitionStateData {
                tp: tp(),
                controller_epoch: 1,
                leader: 1,
                leader_epoch: 1,
                isr: vec![1, 2],
                replicas: vec![1, 2],
                version: 1,
            })
            .await
            .unwrap();
        partition
            .append_to_leader(RecordBatch::new(Bytes::from_static(b"abcd"), 1, 1_000), 1)
            .await
            .unwrap();

        let (sender, _receiver) = oneshot::channel();
        let op = DelayedFetch::new(
            map,
            CONSUMER_REPLICA_ID,
            1,
            true,
            true,
            vec![status(0)],
            sender,
        );
        // Bytes exist beyond the high watermark but none are committed.
        assert!(!op.try_complete().await);
    }

    #[tokio::test]
    async fn test_expiration_returns_empty_records_without_error() {
        let (map, _partition) = sole_leader().await;
        let (sender, receiver) = oneshot::channel();
        let op = DelayedFetch::new(
            map,
            CONSUMER_REPLICA_ID,
            1024,
            true,
            true,
            vec![status(0)],
            sender,
        );

        op.on_expiration().await;
        let response = receiver.await.unwrap();
        let (_, part) = &response.partitions[0];
        assert_eq!(part.error, ErrorCode::None);
        assert!(part.records.is_empty());
        assert_eq!(part.high_watermark, 0);
    }

    #[tokio::test]
    async fn test_truncation_past_fetch_offset_finishes_wait() {
        let (map, partition) = sole_leader().await;
        partition
            .append_to_leader(RecordBatch::new(Bytes::from_static(b"ab"), 2, 1_000), 1)
            .await
            .unwrap();

        let (sender, receiver) = oneshot::channel();
        let op = DelayedFetch::new(
            Arc::clone(&map),
            CONSUMER_REPLICA_ID,
            1024,
            true,
            true,
            vec![status(2)],
            sender,
        );
        assert!(!op.try_complete().await);

        let log = partition.local_log().await.unwrap();
        log.truncate_to(0).await.unwrap();
        assert!(op.try_complete().await);

        let response = receiver.await.unwrap();
        assert_eq!(response.partitions[0].1.error, ErrorCode::OffsetOutOfRange);
    }

    #[tokio::test]
    async fn test_partition_removal_finishes_wait() {
        let (map, _partition) = sole_leader().await;
        let (sender, receiver) = oneshot::channel();
        let op = DelayedFetch::new(
            Arc::clone(&map),
            CONSUMER_REPLICA_ID,
            1024,
            true,
            true,
            vec![status(0)],
            sender,
        );
        assert!(!op.try_complete().await);

        map.remove(&tp());
        assert!(op.try_complete().await);
        let response = receiver.await.unwrap();
        assert_eq!(
            response.partitions[0].1.error,
            ErrorCode::UnknownTopicOrPartition
        );
    }
}
