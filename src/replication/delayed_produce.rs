//! Delayed produce: an acks=all produce awaiting replication.
//!
//! Created after the leader log append succeeded for at least one partition.
//! The operation completes when, for every partition it covers, one of:
//!
//! - the partition errored at append time (status settled at creation),
//! - the partition is no longer led locally (leadership moved), or
//! - the high watermark reached the required offset (records committed).
//!
//! On expiration, partitions still pending are stamped `RequestTimedOut` and
//! whatever completed keeps its result. The response travels over a oneshot
//! channel to the producer task suspended in
//! [`append_records`](super::manager::ReplicaManager::append_records).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, oneshot};
use tracing::debug;

use crate::error::ErrorCode;

use super::PartitionMap;
use super::commands::{ProducePartitionResponse, ProduceResponse};
use super::purgatory::DelayedOperation;
use super::topic_partition::TopicPartition;

/// Per-partition progress of a delayed produce.
#[derive(Debug)]
pub(crate) struct ProducePartitionStatus {
    /// Offset the high watermark must reach: last written offset + 1.
    required_offset: i64,
    /// Still waiting for replication.
    acks_pending: bool,
    /// Provisional response, settled once `acks_pending` drops.
    response: ProducePartitionResponse,
}

impl ProducePartitionStatus {
    /// Status for a partition whose append succeeded and now awaits quorum.
    pub(crate) fn pending(required_offset: i64, response: ProducePartitionResponse) -> Self {
        Self {
            required_offset,
            acks_pending: true,
            response,
        }
    }

    /// Status settled at creation (append failed or had no records).
    pub(crate) fn settled(response: ProducePartitionResponse) -> Self {
        Self {
            required_offset: -1,
            acks_pending: false,
            response,
        }
    }

    /// Consume the status for an immediate (non-delayed) response.
    pub(crate) fn into_response(self) -> ProducePartitionResponse {
        self.response
    }
}

/// A produce request parked until its records are committed.
#[derive(Debug)]
pub(crate) struct DelayedProduce {
    partitions: Mutex<Vec<(TopicPartition, ProducePartitionStatus)>>,
    partition_map: PartitionMap,
    completed: AtomicBool,
    sender: std::sync::Mutex<Option<oneshot::Sender<ProduceResponse>>>,
}

impl DelayedProduce {
    pub(crate) fn new(
        partition_map: PartitionMap,
        statuses: Vec<(TopicPartition, ProducePartitionStatus)>,
        sender: oneshot::Sender<ProduceResponse>,
    ) -> Arc<Self> {
        Arc::new(Self {
            partitions: Mutex::new(statuses),
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

    /// Claim completion and deliver the response. `timed_out` stamps
    /// partitions that never settled.
    async fn complete_now(&self, timed_out: bool) -> bool {
        if !self.claim() {
            return false;
        }
        let mut parts = self.partitions.lock().await;
        let response = ProduceResponse {
            partitions: parts
                .iter_mut()
                .map(|(tp, status)| {
                    if status.acks_pending && timed_out {
                        status.acks_pending = false;
                        status.response.error = ErrorCode::RequestTimedOut;
                    }
                    (tp.clone(), status.response)
                })
                .collect(),
        };
        drop(parts);

        if let Some(sender) = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            // The producer may have given up on the response; that is its
            // business, completion already happened.
            let _ = sender.send(response);
        }
        true
    }
}

#[async_trait]
impl DelayedOperation for DelayedProduce {
    async fn try_complete(&self) -> bool {
        if self.is_completed() {
            return false;
        }

        let all_settled = {
            let mut parts = self.partitions.lock().await;
            for (tp, status) in parts.iter_mut().filter(|(_, s)| s.acks_pending) {
                let partition = self.partition_map.get(tp).map(|p| Arc::clone(&p));
                match partition {
                    None => {
                        // Partition stopped while we waited.
                        status.acks_pending = false;
                        status.response.error = ErrorCode::NotLeaderForPartition;
                    }
                    Some(partition) => {
                        let (satisfied, error) = partition
                            .check_enough_replicas_reach_offset(status.required_offset)
                            .await;
                        if satisfied {
                            status.acks_pending = false;
                            status.response.error = error;
                        }
                    }
                }
            }
            parts.iter().all(|(_, status)| !status.acks_pending)
        };

        if all_settled {
            debug!("delayed produce satisfied");
            self.complete_now(false).await
        } else {
            false
        }
    }

    async fn on_expiration(&self) {
        self.complete_now(true).await;
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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

    async fn leader_partition(min_in_sync: usize) -> (PartitionMap, Arc<Partition>) {
        let metrics = Arc::new(ReplicaMetrics::unregistered());
        let ctx = PartitionContext {
            config: Arc::new(ReplicaConfig {
                broker_id: 1,
                min_in_sync_replicas: min_in_sync,
                ..Default::default()
            }),
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
                isr: vec![1, 2],
                replicas: vec![1, 2],
                version: 0,
            })
            .await
            .unwrap();
        let map: PartitionMap = Arc::new(DashMap::new());
        map.insert(tp(), Arc::clone(&partition));
        (map, partition)
    }

    fn pending_status(required_offset: i64) -> ProducePartitionStatus {
        ProducePartitionStatus::pending(
            required_offset,
            ProducePartitionResponse {
                error: ErrorCode::None,
                base_offset: required_offset - 1,
                log_append_time_ms: 1_000,
            },
        )
    }

    #[tokio::test]
    async fn test_completes_when_hw_reaches_required_offset() {
        let (map, partition) = leader_partition(1).await;
        partition
            .append_to_leader(RecordBatch::new(Bytes::from_static(b"x"), 1, 1_000), -1)
            .await
            .unwrap();

        let (sender, receiver) = oneshot::channel();
        let op = DelayedProduce::new(map, vec![(tp(), pending_status(1))], sender);

        assert!(!op.try_complete().await); // follower not caught up yet

        partition.update_follower_fetch_state(2, 1, 1).await.unwrap();
        assert!(op.try_complete().await);
        assert!(op.is_completed());

        let response = receiver.await.unwrap();
        assert_eq!(response.partitions.len(), 1);
        assert_eq!(response.partitions[0].1.error, ErrorCode::None);
        assert_eq!(response.partitions[0].1.base_offset, 0);
    }

    #[tokio::test]
    async fn test_expiration_stamps_pending_partitions() {
        let (map, _partition) = leader_partition(1).await;
        let (sender, receiver) = oneshot::channel();
        let op = DelayedProduce::new(map, vec![(tp(), pending_status(5))], sender);

        op.on_expiration().await;
        assert!(op.is_completed());
        // Completion happened; a later poke does nothing.
        assert!(!op.try_complete().await);

        let response = receiver.await.unwrap();
        assert_eq!(response.partitions[0].1.error, ErrorCode::RequestTimedOut);
    }

    #[tokio::test]
    async fn test_partition_removal_completes_with_not_leader() {
        let (map, _partition) = leader_partition(1).await;
        map.remove(&tp());

        let (sender, receiver) = oneshot::channel();
        let op = DelayedProduce::new(map, vec![(tp(), pending_status(1))], sender);

        assert!(op.try_complete().await);
        let response = receiver.await.unwrap();
        assert_eq!(
            response.partitions[0].1.error,
            ErrorCode::NotLeaderForPartition
        );
    }

    #[tokio::test]
    async fn test_isr_drop_after_append_reports_not_enough_replicas() {
        let (map, partition) = leader_partition(2).await;
        partition
            .append_to_leader(RecordBatch::new(Bytes::from_static(b"x"), 1, 1_000), -1)
            .await
            .unwrap();
        partition.update_follower_fetch_state(2, 1, 1).await.unwrap();

        // ISR shrinks below min in-sync after the append: HW still reached
        // the offset, so the wait settles, but with an error.
        let demoted = PartitionStateData {
            tp: tp(),
            controller_epoch: 1,
            leader: 1,
            leader_epoch: 1,
            isr: vec![1],
            replicas: vec![1, 2],
            version: 1,
        };
        partition.make_leader(&demoted).await.unwrap();

        let (sender, receiver) = oneshot::channel();
        let op = DelayedProduce::new(map, vec![(tp(), pending_status(1))], sender);
        assert!(op.try_complete().await);

        let response = receiver.await.unwrap();
        assert_eq!(
            response.partitions[0].1.error,
            ErrorCode::NotEnoughReplicasAfterAppend
        );
    }
}
