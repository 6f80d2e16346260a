//! Top-level replica manager.
//!
//! Owns the partition table of one broker, routes produce and fetch requests
//! to leader replicas, applies controller commands, and drives the
//! maintenance jobs (`isr-expiration`, `isr-change-propagation`,
//! `highwatermark-checkpoint`, `purgatory-purge`).
//!
//! # Locking
//!
//! Controller-originated topology changes (`become_leader_or_follower`,
//! `stop_replicas`, `update_metadata`) serialise on a single state-change
//! lock, which is never held across log I/O. The hot paths (append, fetch,
//! follower updates) take only the per-partition locks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::sync::{Mutex, RwLock, oneshot};
use tracing::{debug, error, info, instrument, warn};

use crate::constants::DEBUG_REPLICA_ID;
use crate::constants::INTERNAL_TOPIC_PREFIX;
use crate::error::ErrorCode;

use super::PartitionMap;
use super::checkpoint::CheckpointFile;
use super::clock::{Clock, SystemClock};
use super::commands::{
    BrokerEndpoint, FetchPartitionResponse, FetchResponse, LeaderAndIsrRequest,
    LeaderAndIsrResponse, PartitionFetchInfo, PartitionRecords, PartitionStateData,
    ProducePartitionResponse, ProduceResponse, StopReplicaRequest, StopReplicaResponse,
    UpdateMetadataRequest,
};
use super::config::ReplicaConfig;
use super::coordination::{CoordinationStore, IsrChangeLog};
use super::delayed_fetch::{DelayedFetch, FetchPartitionStatus, read_one};
use super::delayed_produce::{DelayedProduce, ProducePartitionStatus};
use super::error::{ReplicaError, ReplicaResult, halt_on_storage_error};
use super::fetcher::{EndpointProvider, FetcherManager, LeaderEndpoint};
use super::log::LogManager;
use super::metrics::ReplicaMetrics;
use super::partition::{Partition, PartitionContext};
use super::purgatory::Purgatory;
use super::tasks::TaskRegistry;
use super::topic_partition::TopicPartition;

/// Observer of leadership transitions, e.g. a group coordinator migrating
/// its state with partition leadership.
pub trait LeadershipListener: Send + Sync {
    fn on_leadership_change(&self, newly_led: &[TopicPartition], newly_following: &[TopicPartition]);
}

/// Builder for [`ReplicaManager`].
pub struct ReplicaManagerBuilder {
    config: ReplicaConfig,
    log_manager: Option<Arc<dyn LogManager>>,
    coordination: Option<Arc<dyn CoordinationStore>>,
    endpoints: Option<Arc<dyn EndpointProvider>>,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<ReplicaMetrics>>,
    leadership_listener: Option<Arc<dyn LeadershipListener>>,
}

impl ReplicaManagerBuilder {
    pub fn new(config: ReplicaConfig) -> Self {
        Self {
            config,
            log_manager: None,
            coordination: None,
            endpoints: None,
            clock: Arc::new(SystemClock),
            metrics: None,
            leadership_listener: None,
        }
    }

    pub fn log_manager(mut self, log_manager: Arc<dyn LogManager>) -> Self {
        self.log_manager = Some(log_manager);
        self
    }

    pub fn coordination(mut self, coordination: Arc<dyn CoordinationStore>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    pub fn endpoints(mut self, endpoints: Arc<dyn EndpointProvider>) -> Self {
        self.endpoints = Some(endpoints);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<ReplicaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn leadership_listener(mut self, listener: Arc<dyn LeadershipListener>) -> Self {
        self.leadership_listener = Some(listener);
        self
    }

    /// Validate the configuration, recover checkpointed high watermarks and
    /// start the maintenance jobs.
    pub async fn build(self) -> ReplicaResult<Arc<ReplicaManager>> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ReplicaError::Config(e.to_string()))?;
        let log_manager = self.log_manager.expect("log manager is required");
        let coordination = self.coordination.expect("coordination store is required");
        let endpoints = self.endpoints.expect("endpoint provider is required");
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(ReplicaMetrics::shared()));

        // Recover checkpointed high watermarks from every data directory.
        let mut checkpointed = HashMap::new();
        for dir in log_manager.data_dirs() {
            let entries = CheckpointFile::new(&dir)
                .read()
                .await
                .map_err(super::log::LogError::Io)?;
            checkpointed.extend(entries);
        }
        info!(
            broker_id = config.broker_id,
            recovered = checkpointed.len(),
            "recovered high watermark checkpoints"
        );

        let config = Arc::new(config);
        let partitions: PartitionMap = Arc::new(DashMap::new());
        let produce_purgatory = Arc::new(Purgatory::new(
            "produce",
            metrics.delayed_produce_pending.clone(),
            metrics.delayed_operation_timeouts.clone(),
        ));
        let fetch_purgatory = Arc::new(Purgatory::new(
            "fetch",
            metrics.delayed_fetch_pending.clone(),
            metrics.delayed_operation_timeouts.clone(),
        ));
        let fetcher_manager = Arc::new(FetcherManager::new(
            Arc::clone(&config),
            endpoints,
            Arc::clone(&partitions),
        ));

        let manager = Arc::new(ReplicaManager {
            config,
            clock: self.clock,
            log_manager,
            coordination,
            metrics,
            partitions,
            controller_epoch: AtomicI32::new(0),
            isr_changes: Arc::new(IsrChangeLog::new()),
            last_isr_propagation_ms: AtomicI64::new(0),
            produce_purgatory,
            fetch_purgatory,
            fetcher_manager,
            checkpointed_hws: RwLock::new(checkpointed),
            live_brokers: RwLock::new(HashMap::new()),
            leadership_listener: self.leadership_listener,
            state_change_lock: Mutex::new(()),
            tasks: Mutex::new(TaskRegistry::new()),
            hw_checkpoint_started: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });

        manager.start_maintenance_jobs().await;
        Ok(manager)
    }
}

/// Replica manager of one broker.
pub struct ReplicaManager {
    config: Arc<ReplicaConfig>,
    clock: Arc<dyn Clock>,
    log_manager: Arc<dyn LogManager>,
    coordination: Arc<dyn CoordinationStore>,
    metrics: Arc<ReplicaMetrics>,
    partitions: PartitionMap,
    controller_epoch: AtomicI32,
    isr_changes: Arc<IsrChangeLog>,
    last_isr_propagation_ms: AtomicI64,
    produce_purgatory: Arc<Purgatory>,
    fetch_purgatory: Arc<Purgatory>,
    fetcher_manager: Arc<FetcherManager>,
    /// High watermarks recovered from checkpoint files, consumed as
    /// partitions are materialised.
    checkpointed_hws: RwLock<HashMap<TopicPartition, i64>>,
    /// Brokers the controller last reported alive.
    live_brokers: RwLock<HashMap<i32, BrokerEndpoint>>,
    leadership_listener: Option<Arc<dyn LeadershipListener>>,
    state_change_lock: Mutex<()>,
    tasks: Mutex<TaskRegistry>,
    hw_checkpoint_started: AtomicBool,
    shutting_down: AtomicBool,
}

impl fmt::Debug for ReplicaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaManager")
            .field("broker_id", &self.config.broker_id)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl ReplicaManager {
    pub fn builder(config: ReplicaConfig) -> ReplicaManagerBuilder {
        ReplicaManagerBuilder::new(config)
    }

    pub fn broker_id(&self) -> i32 {
        self.config.broker_id
    }

    pub fn controller_epoch(&self) -> i32 {
        self.controller_epoch.load(Ordering::SeqCst)
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Look up a hosted partition.
    pub fn partition(&self, tp: &TopicPartition) -> Option<Arc<Partition>> {
        self.partitions.get(tp).map(|p| Arc::clone(&p))
    }

    // =========================================================================
    // Produce path
    // =========================================================================

    /// Append records to the leader replicas of the given partitions.
    ///
    /// With acks=all the returned future resolves once every written offset
    /// is committed (or the wait turned futile / timed out); with acks of 0
    /// or 1 it resolves as soon as the leader appends finish. Per-partition
    /// failures never affect sibling partitions.
    #[instrument(skip_all, fields(broker = self.config.broker_id, acks = required_acks))]
    pub async fn append_records(
        &self,
        timeout_ms: i64,
        required_acks: i16,
        internal_topics_allowed: bool,
        entries: Vec<PartitionRecords>,
    ) -> ProduceResponse {
        if !matches!(required_acks, -1 | 0 | 1) {
            warn!(required_acks, "rejecting produce with invalid acks");
            self.metrics.failed_produce_requests.inc();
            return ProduceResponse {
                partitions: entries
                    .into_iter()
                    .map(|entry| {
                        (
                            entry.tp,
                            ProducePartitionResponse::error(ErrorCode::InvalidRequiredAcks),
                        )
                    })
                    .collect(),
            };
        }

        let mut statuses: Vec<(TopicPartition, ProducePartitionStatus)> = Vec::new();
        let mut appended: Vec<TopicPartition> = Vec::new();
        let mut any_error = false;

        for entry in entries {
            let tp = entry.tp.clone();
            let result = self
                .append_to_local_leader(&tp, entry.batch, internal_topics_allowed, required_acks)
                .await;
            match result {
                Ok(info) => {
                    appended.push(tp.clone());
                    statuses.push((
                        tp,
                        ProducePartitionStatus::pending(
                            info.last_offset + 1,
                            ProducePartitionResponse {
                                error: ErrorCode::None,
                                base_offset: info.first_offset,
                                log_append_time_ms: info.timestamp_ms,
                            },
                        ),
                    ));
                }
                Err(e) if e.is_fatal() => halt_on_storage_error("leader append", &e),
                Err(e) => {
                    any_error = true;
                    debug!(%tp, error = %e, "produce failed for partition");
                    statuses.push((
                        tp,
                        ProducePartitionStatus::settled(ProducePartitionResponse::error(
                            e.error_code(),
                        )),
                    ));
                }
            }
        }

        if any_error {
            self.metrics.failed_produce_requests.inc();
        }

        // Fresh data may satisfy parked fetches.
        for tp in &appended {
            self.fetch_purgatory.check_and_complete(tp).await;
        }

        let delayed = required_acks == -1 && !statuses.is_empty() && !appended.is_empty();
        if !delayed {
            return ProduceResponse {
                partitions: statuses
                    .into_iter()
                    .map(|(tp, status)| (tp, status.into_response()))
                    .collect(),
            };
        }

        let keys: Vec<TopicPartition> = {
            let mut seen = HashSet::new();
            statuses
                .iter()
                .map(|(tp, _)| tp.clone())
                .filter(|tp| seen.insert(tp.clone()))
                .collect()
        };
        let (sender, receiver) = oneshot::channel();
        let op = DelayedProduce::new(Arc::clone(&self.partitions), statuses, sender);
        self.produce_purgatory
            .try_complete_else_watch(op, keys, Duration::from_millis(timeout_ms.max(0) as u64))
            .await;

        receiver.await.unwrap_or_else(|_| {
            error!("delayed produce dropped without completing");
            ProduceResponse::default()
        })
    }

    async fn append_to_local_leader(
        &self,
        tp: &TopicPartition,
        batch: super::log::RecordBatch,
        internal_topics_allowed: bool,
        required_acks: i16,
    ) -> ReplicaResult<super::log::LogAppendInfo> {
        if tp.topic().starts_with(INTERNAL_TOPIC_PREFIX) && !internal_topics_allowed {
            return Err(ReplicaError::InvalidTopic(tp.topic().to_string()));
        }
        let partition = self
            .partition(tp)
            .ok_or_else(|| ReplicaError::UnknownTopicOrPartition(tp.clone()))?;
        partition.append_to_leader(batch, required_acks).await
    }

    // =========================================================================
    // Fetch path
    // =========================================================================

    /// Fetch records for a consumer (`replica_id = -1`), a follower
    /// (`replica_id >= 0`) or the debug sentinel.
    ///
    /// Consumer reads are capped at the high watermark. Follower fetches
    /// additionally advance the follower's replica view, which can expand the
    /// ISR and move the high watermark. The response is immediate unless
    /// `timeout_ms > 0` and fewer than `min_bytes` are ready.
    #[instrument(skip_all, fields(broker = self.config.broker_id, replica_id))]
    pub async fn fetch_records(
        &self,
        timeout_ms: i64,
        replica_id: i32,
        min_bytes: usize,
        fetch_infos: Vec<(TopicPartition, PartitionFetchInfo)>,
    ) -> FetchResponse {
        let is_follower = replica_id >= 0;
        let require_leader = replica_id != DEBUG_REPLICA_ID;
        if replica_id == DEBUG_REPLICA_ID {
            warn!("debug replica id in use, leader-only check disabled");
        }
        let cap_at_hw = !is_follower;

        let reads: Vec<(TopicPartition, PartitionFetchInfo, i64, FetchPartitionResponse)> =
            stream::iter(fetch_infos)
                .map(|(tp, info)| {
                    let partitions = Arc::clone(&self.partitions);
                    async move {
                        let leo_before = match partitions.get(&tp).map(|p| Arc::clone(&p)) {
                            Some(partition) => {
                                partition.log_end_offset().await.unwrap_or_default()
                            }
                            None => 0,
                        };
                        let response = read_one(
                            &partitions,
                            &tp,
                            info.offset,
                            info.max_bytes,
                            require_leader,
                            cap_at_hw,
                        )
                        .await;
                        (tp, info, leo_before, response)
                    }
                })
                .buffered(self.config.max_concurrent_partition_reads)
                .collect()
                .await;

        if is_follower {
            self.update_follower_fetch_states(replica_id, &reads).await;
        }

        let any_error = reads.iter().any(|(_, _, _, r)| r.error.is_error());
        if any_error {
            self.metrics.failed_fetch_requests.inc();
        }
        let accumulated: usize = reads.iter().map(|(_, _, _, r)| r.size_bytes()).sum();

        let respond_now =
            timeout_ms <= 0 || reads.is_empty() || accumulated >= min_bytes || any_error;
        if respond_now {
            return FetchResponse {
                partitions: reads.into_iter().map(|(tp, _, _, r)| (tp, r)).collect(),
            };
        }

        // Not enough data yet: park the fetch.
        let mut statuses = Vec::with_capacity(reads.len());
        for (tp, info, _, _) in &reads {
            let segment_base = match self.partition(tp) {
                Some(partition) => match partition.local_log().await {
                    Some(log) => log.active_segment_base_offset(),
                    None => 0,
                },
                None => 0,
            };
            statuses.push((
                tp.clone(),
                FetchPartitionStatus {
                    fetch_offset: info.offset,
                    max_bytes: info.max_bytes,
                    segment_base_at_request: segment_base,
                },
            ));
        }
        let keys: Vec<TopicPartition> = statuses.iter().map(|(tp, _)| tp.clone()).collect();

        let (sender, receiver) = oneshot::channel();
        let op = DelayedFetch::new(
            Arc::clone(&self.partitions),
            replica_id,
            min_bytes,
            require_leader,
            cap_at_hw,
            statuses,
            sender,
        );
        self.fetch_purgatory
            .try_complete_else_watch(op, keys, Duration::from_millis(timeout_ms.max(0) as u64))
            .await;

        receiver.await.unwrap_or_else(|_| {
            error!("delayed fetch dropped without completing");
            FetchResponse::default()
        })
    }

    async fn update_follower_fetch_states(
        &self,
        follower_id: i32,
        reads: &[(TopicPartition, PartitionFetchInfo, i64, FetchPartitionResponse)],
    ) {
        for (tp, info, leo_before, response) in reads {
            if response.error.is_error() {
                continue;
            }
            let Some(partition) = self.partition(tp) else {
                continue;
            };
            match partition
                .update_follower_fetch_state(follower_id, info.offset, *leo_before)
                .await
            {
                Ok(_) => {}
                Err(e) => debug!(%tp, follower_id, error = %e, "follower state not updated"),
            }
            // The follower's progress may release produces waiting on this
            // partition even when the high watermark did not move here.
            self.produce_purgatory.check_and_complete(tp).await;
        }
    }

    // =========================================================================
    // Controller commands
    // =========================================================================

    /// Apply a controller leadership decision.
    #[instrument(skip_all, fields(broker = self.config.broker_id, controller_epoch = request.controller_epoch))]
    pub async fn become_leader_or_follower(
        &self,
        request: LeaderAndIsrRequest,
    ) -> LeaderAndIsrResponse {
        let _guard = self.state_change_lock.lock().await;

        let current_epoch = self.controller_epoch.load(Ordering::SeqCst);
        if request.controller_epoch < current_epoch {
            warn!(
                received = request.controller_epoch,
                current = current_epoch,
                controller = request.controller_id,
                "rejecting leader-and-isr from stale controller"
            );
            return LeaderAndIsrResponse {
                error: ErrorCode::StaleControllerEpoch,
                partitions: HashMap::new(),
            };
        }
        self.controller_epoch
            .store(request.controller_epoch, Ordering::SeqCst);

        let mut partitions_response: HashMap<TopicPartition, ErrorCode> = HashMap::new();
        let mut leader_bucket: Vec<(Arc<Partition>, PartitionStateData)> = Vec::new();
        let mut follower_bucket: Vec<(Arc<Partition>, PartitionStateData)> = Vec::new();

        for state in request.partition_states {
            let tp = state.tp.clone();
            let partition = self.get_or_create_partition(&tp).await;
            let existing_epoch = partition.leader_epoch().await;
            if existing_epoch >= state.leader_epoch {
                warn!(
                    %tp,
                    existing_epoch,
                    received = state.leader_epoch,
                    "ignoring leader-and-isr with stale leader epoch"
                );
                partitions_response.insert(tp, ErrorCode::StaleLeaderEpoch);
                continue;
            }
            if !state.replicas.contains(&self.config.broker_id) {
                warn!(%tp, "broker is not in the assigned replica set");
                partitions_response.insert(tp, ErrorCode::UnknownTopicOrPartition);
                continue;
            }
            if state.leader == self.config.broker_id {
                leader_bucket.push((partition, state));
            } else {
                follower_bucket.push((partition, state));
            }
        }

        let transitions = !leader_bucket.is_empty() || !follower_bucket.is_empty();
        let newly_led = self
            .make_leaders(&mut partitions_response, leader_bucket)
            .await;
        let newly_following = self
            .make_followers(&mut partitions_response, follower_bucket)
            .await;

        if transitions
            && self
                .hw_checkpoint_started
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.start_hw_checkpoint_job().await;
        }

        self.fetcher_manager.shutdown_idle().await;
        self.update_partition_gauges().await;

        if let Some(listener) = &self.leadership_listener {
            listener.on_leadership_change(&newly_led, &newly_following);
        }

        LeaderAndIsrResponse {
            error: ErrorCode::None,
            partitions: partitions_response,
        }
    }

    async fn make_leaders(
        &self,
        response: &mut HashMap<TopicPartition, ErrorCode>,
        bucket: Vec<(Arc<Partition>, PartitionStateData)>,
    ) -> Vec<TopicPartition> {
        let keys: Vec<TopicPartition> = bucket
            .iter()
            .map(|(partition, _)| partition.topic_partition().clone())
            .collect();
        // Any follower fetch loop for these partitions must stop before the
        // local replica starts acting as leader.
        self.fetcher_manager.remove_partitions(&keys).await;

        let mut newly_led = Vec::new();
        for (partition, state) in bucket {
            let tp = partition.topic_partition().clone();
            match partition.make_leader(&state).await {
                Ok(is_new_leader) => {
                    if is_new_leader {
                        newly_led.push(tp.clone());
                    }
                    response.insert(tp, ErrorCode::None);
                }
                Err(e) if e.is_fatal() => halt_on_storage_error("make leader", &e),
                Err(e) => {
                    error!(%tp, error = %e, "failed to make partition leader");
                    response.insert(tp, e.error_code());
                }
            }
        }
        newly_led
    }

    async fn make_followers(
        &self,
        response: &mut HashMap<TopicPartition, ErrorCode>,
        bucket: Vec<(Arc<Partition>, PartitionStateData)>,
    ) -> Vec<TopicPartition> {
        let mut newly_following = Vec::new();
        for (partition, state) in bucket {
            let tp = partition.topic_partition().clone();
            let leader_alive = self
                .live_brokers
                .read()
                .await
                .contains_key(&state.leader);

            let leader_changed = match partition.make_follower(&state).await {
                Ok(changed) => changed,
                Err(e) if e.is_fatal() => halt_on_storage_error("make follower", &e),
                Err(e) => {
                    error!(%tp, error = %e, "failed to make partition follower");
                    response.insert(tp, e.error_code());
                    continue;
                }
            };

            self.fetcher_manager.remove_partitions(&[tp.clone()]).await;

            // The durability contract of a demotion: drop the uncommitted
            // suffix before fetching from the new leader.
            if let Err(e) = partition.truncate_to_high_watermark().await {
                if e.is_fatal() {
                    halt_on_storage_error("truncate to high watermark", &e);
                }
                error!(%tp, error = %e, "failed to truncate follower log");
                response.insert(tp, e.error_code());
                continue;
            }

            // Waiters keyed on this partition can no longer progress locally.
            self.produce_purgatory.check_and_complete(&tp).await;
            self.fetch_purgatory.check_and_complete(&tp).await;

            if leader_changed {
                newly_following.push(tp.clone());
            }

            if self.shutting_down.load(Ordering::SeqCst) {
                response.insert(tp, ErrorCode::None);
                continue;
            }
            if leader_alive {
                let fetch_offset = partition.log_end_offset().await.unwrap_or(0);
                self.fetcher_manager
                    .add_partitions(state.leader, vec![(tp.clone(), fetch_offset)])
                    .await;
            } else {
                info!(%tp, leader = state.leader, "deferring fetcher, leader not known alive");
            }
            response.insert(tp, ErrorCode::None);
        }
        newly_following
    }

    /// Stop local replicas, deleting their logs when the controller asks.
    #[instrument(skip_all, fields(broker = self.config.broker_id, delete = request.delete_partitions))]
    pub async fn stop_replicas(&self, request: StopReplicaRequest) -> StopReplicaResponse {
        let _guard = self.state_change_lock.lock().await;

        let current_epoch = self.controller_epoch.load(Ordering::SeqCst);
        if request.controller_epoch < current_epoch {
            warn!(
                received = request.controller_epoch,
                current = current_epoch,
                "rejecting stop-replica from stale controller"
            );
            return StopReplicaResponse {
                error: ErrorCode::StaleControllerEpoch,
                partitions: HashMap::new(),
            };
        }
        self.controller_epoch
            .store(request.controller_epoch, Ordering::SeqCst);

        self.fetcher_manager
            .remove_partitions(&request.partitions)
            .await;

        let mut partitions_response = HashMap::new();
        for tp in request.partitions {
            let code = self
                .stop_one_replica(&tp, request.delete_partitions)
                .await;
            partitions_response.insert(tp, code);
        }

        self.update_partition_gauges().await;
        StopReplicaResponse {
            error: ErrorCode::None,
            partitions: partitions_response,
        }
    }

    async fn stop_one_replica(&self, tp: &TopicPartition, delete: bool) -> ErrorCode {
        if delete {
            if let Some((_, partition)) = self.partitions.remove(tp) {
                partition.make_offline().await;
            }
            // Waiters observe the removal and finish.
            self.produce_purgatory.check_and_complete(tp).await;
            self.fetch_purgatory.check_and_complete(tp).await;
            self.checkpointed_hws.write().await.remove(tp);
            match self.log_manager.delete(tp).await {
                Ok(()) => {
                    info!(%tp, "stopped and deleted replica");
                    ErrorCode::None
                }
                Err(super::log::LogError::Io(e)) => {
                    halt_on_storage_error("delete partition log", &e)
                }
                Err(e) => {
                    error!(%tp, error = %e, "failed to delete partition log");
                    ReplicaError::from(e).error_code()
                }
            }
        } else {
            if let Some(partition) = self.partition(tp) {
                partition.make_offline().await;
            }
            self.produce_purgatory.check_and_complete(tp).await;
            self.fetch_purgatory.check_and_complete(tp).await;
            info!(%tp, "stopped replica");
            ErrorCode::None
        }
    }

    /// Refresh the local metadata cache from the controller.
    pub async fn update_metadata(&self, request: UpdateMetadataRequest) -> ErrorCode {
        let _guard = self.state_change_lock.lock().await;

        let current_epoch = self.controller_epoch.load(Ordering::SeqCst);
        if request.controller_epoch < current_epoch {
            warn!(
                received = request.controller_epoch,
                current = current_epoch,
                "rejecting metadata update from stale controller"
            );
            return ErrorCode::StaleControllerEpoch;
        }
        self.controller_epoch
            .store(request.controller_epoch, Ordering::SeqCst);

        let mut live = self.live_brokers.write().await;
        live.clear();
        for broker in request.live_brokers {
            live.insert(broker.broker_id, broker);
        }
        debug!(live_brokers = live.len(), "updated metadata cache");
        ErrorCode::None
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// One `isr-expiration` pass over every led partition.
    pub async fn maybe_shrink_isr(&self) {
        let partitions: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for partition in partitions {
            match partition.maybe_shrink_isr().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => halt_on_storage_error("isr expiration", &e),
                Err(e) => {
                    warn!(tp = %partition.topic_partition(), error = %e, "isr shrink pass failed")
                }
            }
        }
        self.update_partition_gauges().await;
    }

    /// One `isr-change-propagation` pass.
    ///
    /// Propagates iff changes are recorded and either none arrived within the
    /// blackout window (the burst settled) or the oldest recorded change has
    /// waited out the forced interval.
    pub async fn maybe_propagate_isr_changes(&self) {
        self.metrics
            .isr_changes_pending
            .set(self.isr_changes.len() as i64);
        if self.isr_changes.is_empty() {
            return;
        }
        let now_ms = self.clock.now_ms();
        let last_change = self.isr_changes.last_change_ms();
        let last_propagation = self.last_isr_propagation_ms.load(Ordering::SeqCst);

        let burst_settled = now_ms - last_change >= self.config.isr_change_blackout_ms;
        let overdue = now_ms - last_propagation >= self.config.isr_propagation_max_delay_ms;
        if !burst_settled && !overdue {
            return;
        }

        let batch = self.isr_changes.drain();
        if batch.is_empty() {
            return;
        }
        match self.coordination.notify_isr_change(&batch).await {
            Ok(()) => {
                self.last_isr_propagation_ms.store(now_ms, Ordering::SeqCst);
                info!(changes = batch.len(), "propagated ISR changes");
                self.metrics
                    .isr_changes_pending
                    .set(self.isr_changes.len() as i64);
            }
            Err(e) => {
                warn!(error = %e, "failed to propagate ISR changes, will retry");
                self.isr_changes.restore(batch);
            }
        }
    }

    /// Write the high watermark of every local replica to its data
    /// directory's checkpoint file. A write failure halts the broker.
    pub async fn checkpoint_high_watermarks(&self) {
        checkpoint_all(&self.partitions, self.log_manager.as_ref()).await;
        debug!("checkpointed high watermarks");
    }

    /// Stop serving: halt the maintenance jobs and fetchers, drain both
    /// purgatories, then checkpoint high watermarks one final time.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(broker_id = self.config.broker_id, "shutting down replica manager");
        self.tasks
            .lock()
            .await
            .shutdown_all(Duration::from_secs(5))
            .await;
        self.fetcher_manager.shutdown().await;
        self.produce_purgatory.expire_all().await;
        self.fetch_purgatory.expire_all().await;
        self.checkpoint_high_watermarks().await;
    }

    // =========================================================================
    // Internal
    // =========================================================================

    async fn get_or_create_partition(&self, tp: &TopicPartition) -> Arc<Partition> {
        if let Some(existing) = self.partition(tp) {
            return existing;
        }
        let checkpointed_hw = self
            .checkpointed_hws
            .read()
            .await
            .get(tp)
            .copied()
            .unwrap_or(0);
        let ctx = PartitionContext {
            config: Arc::clone(&self.config),
            log_manager: Arc::clone(&self.log_manager),
            coordination: Arc::clone(&self.coordination),
            isr_changes: Arc::clone(&self.isr_changes),
            produce_purgatory: Arc::clone(&self.produce_purgatory),
            clock: Arc::clone(&self.clock),
            metrics: Arc::clone(&self.metrics),
        };
        let partition = self
            .partitions
            .entry(tp.clone())
            .or_insert_with(|| Arc::new(Partition::new(tp.clone(), ctx, checkpointed_hw)))
            .clone();
        self.metrics.partition_count.set(self.partitions.len() as i64);
        partition
    }

    async fn update_partition_gauges(&self) {
        let partitions: Vec<Arc<Partition>> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut leaders = 0;
        let mut under_replicated = 0;
        for partition in &partitions {
            if partition.is_leader().await {
                leaders += 1;
            }
            if partition.is_under_replicated().await {
                under_replicated += 1;
            }
        }
        self.metrics.partition_count.set(partitions.len() as i64);
        self.metrics.leader_count.set(leaders);
        self.metrics
            .under_replicated_partitions
            .set(under_replicated);
    }

    async fn start_maintenance_jobs(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let weak = Arc::downgrade(self);
        tasks.spawn_periodic(
            "isr-expiration",
            Duration::from_millis(self.config.replica_lag_time_max_ms.max(1) as u64),
            false,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.maybe_shrink_isr().await;
                    }
                }
            },
        );

        let weak = Arc::downgrade(self);
        tasks.spawn_periodic(
            "isr-change-propagation",
            Duration::from_millis(self.config.isr_propagation_check_ms),
            false,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.maybe_propagate_isr_changes().await;
                    }
                }
            },
        );

        let weak = Arc::downgrade(self);
        tasks.spawn_periodic(
            "purgatory-purge",
            Duration::from_millis(self.config.purgatory_purge_interval_ms),
            false,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.produce_purgatory.purge_completed();
                        manager.fetch_purgatory.purge_completed();
                    }
                }
            },
        );
    }

    async fn start_hw_checkpoint_job(&self) {
        // Weak self-reference is unavailable here; the checkpoint loop works
        // off clones of the fields it touches instead.
        let partitions = Arc::clone(&self.partitions);
        let log_manager = Arc::clone(&self.log_manager);
        let interval = Duration::from_millis(self.config.high_watermark_checkpoint_interval_ms);

        let mut tasks = self.tasks.lock().await;
        tasks.spawn_periodic("highwatermark-checkpoint", interval, true, move || {
            let partitions = Arc::clone(&partitions);
            let log_manager = Arc::clone(&log_manager);
            async move {
                checkpoint_all(&partitions, log_manager.as_ref()).await;
            }
        });
        info!("started high watermark checkpoint job");
    }
}

/// Checkpoint pass shared by the background job and tests.
async fn checkpoint_all(partitions: &PartitionMap, log_manager: &dyn LogManager) {
    let mut by_dir: HashMap<PathBuf, HashMap<TopicPartition, i64>> = log_manager
        .data_dirs()
        .into_iter()
        .map(|dir| (dir, HashMap::new()))
        .collect();

    let snapshot: Vec<Arc<Partition>> = partitions
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    for partition in snapshot {
        if partition.local_log().await.is_none() {
            continue;
        }
        let tp = partition.topic_partition().clone();
        let hw = partition.high_watermark().await;
        by_dir
            .entry(log_manager.data_dir(&tp))
            .or_default()
            .insert(tp, hw);
    }

    for (dir, entries) in by_dir {
        if let Err(e) = CheckpointFile::new(&dir).write(&entries).await {
            halt_on_storage_error("high watermark checkpoint", &e);
        }
    }
}

/// In-process replica fetches: a manager can serve as the leader endpoint
/// for another manager in the same process, which is how the integration
/// tests wire multi-broker clusters.
#[async_trait]
impl LeaderEndpoint for ReplicaManager {
    async fn fetch(
        &self,
        follower_id: i32,
        requests: Vec<(TopicPartition, PartitionFetchInfo)>,
    ) -> ReplicaResult<Vec<(TopicPartition, FetchPartitionResponse)>> {
        Ok(self
            .fetch_records(0, follower_id, 0, requests)
            .await
            .partitions)
    }
}
