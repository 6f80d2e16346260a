//! Follower fetch loops, one per upstream leader.
//!
//! When this broker follows partitions led elsewhere, the fetcher manager
//! keeps one long-running task per leader broker. Each round the task
//! snapshots its assigned partitions with their next fetch offsets, issues a
//! replica fetch through the [`LeaderEndpoint`], appends the returned batches
//! to the local logs and mirrors the leader's high watermark. A round that
//! moved no data backs off before the next one.
//!
//! Partitions are added with their post-truncation log end offset, so the
//! first fetch can never resurrect an uncommitted suffix.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PartitionMap;
use super::commands::{FetchPartitionResponse, PartitionFetchInfo};
use super::config::ReplicaConfig;
use super::error::ReplicaResult;
use super::topic_partition::TopicPartition;

/// Replica-fetch channel to one leader broker.
///
/// The socket layer implements this against the wire protocol; tests wire it
/// straight into another in-process replica manager.
#[async_trait]
pub trait LeaderEndpoint: Send + Sync + fmt::Debug {
    /// Issue a follower fetch on behalf of `follower_id`.
    async fn fetch(
        &self,
        follower_id: i32,
        requests: Vec<(TopicPartition, PartitionFetchInfo)>,
    ) -> ReplicaResult<Vec<(TopicPartition, FetchPartitionResponse)>>;
}

/// Resolves broker ids to fetch channels.
#[async_trait]
pub trait EndpointProvider: Send + Sync + fmt::Debug {
    async fn leader_endpoint(&self, broker_id: i32) -> ReplicaResult<Arc<dyn LeaderEndpoint>>;
}

/// Fixed broker-to-endpoint table for tests and single-process clusters.
#[cfg(any(test, feature = "test-utilities"))]
#[derive(Debug, Default)]
pub struct StaticEndpointProvider {
    endpoints: std::sync::Mutex<HashMap<i32, Arc<dyn LeaderEndpoint>>>,
}

#[cfg(any(test, feature = "test-utilities"))]
impl StaticEndpointProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, broker_id: i32, endpoint: Arc<dyn LeaderEndpoint>) {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(broker_id, endpoint);
    }
}

#[cfg(any(test, feature = "test-utilities"))]
#[async_trait]
impl EndpointProvider for StaticEndpointProvider {
    async fn leader_endpoint(&self, broker_id: i32) -> ReplicaResult<Arc<dyn LeaderEndpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&broker_id)
            .cloned()
            .ok_or_else(|| super::error::ReplicaError::PeerUnavailable {
                broker: broker_id,
                reason: "no endpoint registered".to_string(),
            })
    }
}

type Assignments = Arc<Mutex<HashMap<TopicPartition, i64>>>;

struct FetcherState {
    assignments: Assignments,
    handle: JoinHandle<()>,
    shutdown_tx: broadcast::Sender<()>,
}

/// Manages the per-leader fetch loops of one broker.
pub struct FetcherManager {
    config: Arc<ReplicaConfig>,
    provider: Arc<dyn EndpointProvider>,
    partitions: PartitionMap,
    fetchers: Mutex<HashMap<i32, FetcherState>>,
}

impl fmt::Debug for FetcherManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetcherManager")
            .field("follower_id", &self.config.broker_id)
            .finish()
    }
}

impl FetcherManager {
    pub(crate) fn new(
        config: Arc<ReplicaConfig>,
        provider: Arc<dyn EndpointProvider>,
        partitions: PartitionMap,
    ) -> Self {
        Self {
            config,
            provider,
            partitions,
            fetchers: Mutex::new(HashMap::new()),
        }
    }

    /// Assign partitions to the fetch loop for `leader`, starting each at
    /// the given fetch offset. Spawns the loop if it does not exist yet.
    pub async fn add_partitions(&self, leader: i32, partitions: Vec<(TopicPartition, i64)>) {
        if partitions.is_empty() {
            return;
        }
        let mut fetchers = self.fetchers.lock().await;
        let state = fetchers
            .entry(leader)
            .or_insert_with(|| self.spawn_fetcher(leader));
        let mut assignments = state.assignments.lock().await;
        for (tp, fetch_offset) in partitions {
            debug!(%tp, leader, fetch_offset, "assigned partition to fetcher");
            assignments.insert(tp, fetch_offset);
        }
    }

    /// Drop partitions from whichever fetch loops carry them.
    pub async fn remove_partitions(&self, partitions: &[TopicPartition]) {
        let fetchers = self.fetchers.lock().await;
        for state in fetchers.values() {
            let mut assignments = state.assignments.lock().await;
            for tp in partitions {
                assignments.remove(tp);
            }
        }
    }

    /// Stop fetch loops that have no partitions left. Returns how many were
    /// stopped.
    pub async fn shutdown_idle(&self) -> usize {
        let mut fetchers = self.fetchers.lock().await;
        let mut idle = Vec::new();
        for (&leader, state) in fetchers.iter() {
            if state.assignments.lock().await.is_empty() {
                idle.push(leader);
            }
        }
        for leader in &idle {
            if let Some(state) = fetchers.remove(leader) {
                let _ = state.shutdown_tx.send(());
                state.handle.abort();
                info!(leader, "stopped idle fetcher");
            }
        }
        idle.len()
    }

    /// Stop every fetch loop.
    pub async fn shutdown(&self) {
        let mut fetchers = self.fetchers.lock().await;
        for (leader, state) in fetchers.drain() {
            let _ = state.shutdown_tx.send(());
            state.handle.abort();
            debug!(leader, "stopped fetcher");
        }
    }

    /// Number of live fetch loops.
    pub async fn fetcher_count(&self) -> usize {
        self.fetchers.lock().await.len()
    }

    /// Current fetch offset for a partition, if any loop carries it.
    pub async fn fetch_offset(&self, tp: &TopicPartition) -> Option<i64> {
        let fetchers = self.fetchers.lock().await;
        for state in fetchers.values() {
            if let Some(offset) = state.assignments.lock().await.get(tp) {
                return Some(*offset);
            }
        }
        None
    }

    fn spawn_fetcher(&self, leader: i32) -> FetcherState {
        let assignments: Assignments = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        info!(leader, follower = self.config.broker_id, "starting fetcher");
        let handle = tokio::spawn(fetch_loop(
            leader,
            Arc::clone(&self.config),
            Arc::clone(&self.provider),
            Arc::clone(&self.partitions),
            Arc::clone(&assignments),
            shutdown_rx,
        ));
        FetcherState {
            assignments,
            handle,
            shutdown_tx,
        }
    }
}

async fn fetch_loop(
    leader: i32,
    config: Arc<ReplicaConfig>,
    provider: Arc<dyn EndpointProvider>,
    partitions: PartitionMap,
    assignments: Assignments,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let follower_id = config.broker_id;
    let backoff = Duration::from_millis(config.fetch_backoff_ms);
    let mut endpoint: Option<Arc<dyn LeaderEndpoint>> = None;

    loop {
        let requests: Vec<(TopicPartition, PartitionFetchInfo)> = {
            let assignments = assignments.lock().await;
            assignments
                .iter()
                .map(|(tp, &offset)| {
                    (
                        tp.clone(),
                        PartitionFetchInfo {
                            offset,
                            max_bytes: config.follower_fetch_max_bytes,
                        },
                    )
                })
                .collect()
        };

        if requests.is_empty() {
            if pause(&mut shutdown_rx, backoff).await {
                return;
            }
            continue;
        }

        let active = match &endpoint {
            Some(active) => Arc::clone(active),
            None => match provider.leader_endpoint(leader).await {
                Ok(resolved) => {
                    endpoint = Some(Arc::clone(&resolved));
                    resolved
                }
                Err(e) => {
                    warn!(leader, error = %e, "cannot reach leader, backing off");
                    if pause(&mut shutdown_rx, backoff).await {
                        return;
                    }
                    continue;
                }
            },
        };

        let responses = match active.fetch(follower_id, requests).await {
            Ok(responses) => responses,
            Err(e) => {
                warn!(leader, error = %e, "replica fetch failed, reconnecting");
                endpoint = None;
                if pause(&mut shutdown_rx, backoff).await {
                    return;
                }
                continue;
            }
        };

        let mut made_progress = false;
        for (tp, response) in responses {
            if response.error.is_error() {
                debug!(%tp, error = ?response.error, "leader rejected replica fetch");
                continue;
            }
            let partition = partitions.get(&tp).map(|p| Arc::clone(&p));
            let Some(partition) = partition else {
                assignments.lock().await.remove(&tp);
                continue;
            };
            // The controller may have moved this partition since the request
            // went out; never apply a stale leader's data.
            if partition.mode().await.followed_leader() != Some(leader) {
                assignments.lock().await.remove(&tp);
                continue;
            }

            let had_records = !response.records.is_empty();
            match partition
                .append_as_follower(response.records, response.high_watermark)
                .await
            {
                Ok(new_leo) => {
                    assignments.lock().await.insert(tp, new_leo);
                    if had_records {
                        made_progress = true;
                    }
                }
                Err(e) => {
                    warn!(%tp, error = %e, "failed to apply replicated batches");
                }
            }
        }

        if !made_progress && pause(&mut shutdown_rx, backoff).await {
            return;
        }
    }
}

/// Sleep for `duration` unless shutdown arrives first. Returns true on
/// shutdown.
async fn pause(shutdown_rx: &mut broadcast::Receiver<()>, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown_rx.recv() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::replication::clock::{Clock, ManualClock};
    use crate::replication::commands::PartitionStateData;
    use crate::replication::coordination::{CoordinationStore, IsrChangeLog};
    use crate::replication::error::ReplicaError;
    use crate::replication::log::{RecordBatch, SequencedBatch};
    use crate::replication::memory_log::MemoryLogManager;
    use crate::replication::metrics::ReplicaMetrics;
    use crate::replication::mock_coordination::MockCoordinationStore;
    use crate::replication::partition::{Partition, PartitionContext};
    use crate::replication::purgatory::Purgatory;
    use bytes::Bytes;
    use dashmap::DashMap;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", 0)
    }

    /// Endpoint backed by a scripted leader log.
    #[derive(Debug, Default)]
    struct ScriptedLeader {
        batches: StdMutex<Vec<SequencedBatch>>,
        high_watermark: StdMutex<i64>,
    }

    impl ScriptedLeader {
        fn push(&self, payload: &str, records: i32) {
            let mut batches = self.batches.lock().unwrap();
            let base_offset = batches.last().map(|b| b.next_offset()).unwrap_or(0);
            batches.push(SequencedBatch {
                base_offset,
                batch: RecordBatch::new(Bytes::copy_from_slice(payload.as_bytes()), records, 1_000),
            });
        }

        fn set_hw(&self, hw: i64) {
            *self.high_watermark.lock().unwrap() = hw;
        }
    }

    #[async_trait]
    impl LeaderEndpoint for ScriptedLeader {
        async fn fetch(
            &self,
            _follower_id: i32,
            requests: Vec<(TopicPartition, PartitionFetchInfo)>,
        ) -> ReplicaResult<Vec<(TopicPartition, FetchPartitionResponse)>> {
            let batches = self.batches.lock().unwrap().clone();
            let hw = *self.high_watermark.lock().unwrap();
            Ok(requests
                .into_iter()
                .map(|(tp, info)| {
                    let records: Vec<SequencedBatch> = batches
                        .iter()
                        .filter(|b| b.base_offset >= info.offset)
                        .cloned()
                        .collect();
                    (
                        tp,
                        FetchPartitionResponse {
                            error: ErrorCode::None,
                            high_watermark: hw,
                            records,
                        },
                    )
                })
                .collect())
        }
    }

    #[derive(Debug)]
    struct SingleLeaderProvider {
        endpoint: Arc<ScriptedLeader>,
    }

    #[async_trait]
    impl EndpointProvider for SingleLeaderProvider {
        async fn leader_endpoint(&self, broker_id: i32) -> ReplicaResult<Arc<dyn LeaderEndpoint>> {
            if broker_id == 2 {
                Ok(Arc::clone(&self.endpoint) as Arc<dyn LeaderEndpoint>)
            } else {
                Err(ReplicaError::PeerUnavailable {
                    broker: broker_id,
                    reason: "unknown broker".to_string(),
                })
            }
        }
    }

    async fn follower_fixture() -> (FetcherManager, PartitionMap, Arc<ScriptedLeader>) {
        let metrics = Arc::new(ReplicaMetrics::unregistered());
        let config = Arc::new(ReplicaConfig {
            broker_id: 1,
            fetch_backoff_ms: 5,
            ..Default::default()
        });
        let ctx = PartitionContext {
            config: Arc::clone(&config),
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
            .make_follower(&PartitionStateData {
                tp: tp(),
                controller_epoch: 1,
                leader: 2,
                leader_epoch: 0,
                isr: vec![2],
                replicas: vec![1, 2],
                version: 0,
            })
            .await
            .unwrap();

        let partitions: PartitionMap = Arc::new(DashMap::new());
        partitions.insert(tp(), partition);

        let leader = Arc::new(ScriptedLeader::default());
        let manager = FetcherManager::new(
            config,
            Arc::new(SingleLeaderProvider {
                endpoint: Arc::clone(&leader),
            }),
            Arc::clone(&partitions),
        );
        (manager, partitions, leader)
    }

    #[tokio::test]
    async fn test_fetch_loop_replicates_and_mirrors_hw() {
        let (manager, partitions, leader) = follower_fixture().await;
        leader.push("aa", 2);
        leader.push("b", 1);
        leader.set_hw(2);

        manager.add_partitions(2, vec![(tp(), 0)]).await;
        assert_eq!(manager.fetcher_count().await, 1);

        let partition = partitions.get(&tp()).unwrap().clone();
        let mut replicated = false;
        for _ in 0..200 {
            if partition.log_end_offset().await == Some(3) {
                replicated = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(replicated, "follower never caught up to the leader log");

        assert_eq!(partition.high_watermark().await, 2);
        assert_eq!(manager.fetch_offset(&tp()).await, Some(3));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_then_shutdown_idle() {
        let (manager, _partitions, _leader) = follower_fixture().await;
        manager.add_partitions(2, vec![(tp(), 0)]).await;
        assert_eq!(manager.fetcher_count().await, 1);
        assert_eq!(manager.shutdown_idle().await, 0);

        manager.remove_partitions(&[tp()]).await;
        assert_eq!(manager.shutdown_idle().await, 1);
        assert_eq!(manager.fetcher_count().await, 0);
    }

    #[tokio::test]
    async fn test_unreachable_leader_keeps_backing_off() {
        let (manager, partitions, _leader) = follower_fixture().await;
        // Broker 3 is not resolvable by the provider.
        manager.add_partitions(3, vec![(tp(), 0)]).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let partition = partitions.get(&tp()).unwrap().clone();
        assert_eq!(partition.log_end_offset().await, Some(0));
        assert_eq!(manager.fetcher_count().await, 1);
        manager.shutdown().await;
    }
}
