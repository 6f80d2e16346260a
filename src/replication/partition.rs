//! One topic-partition hosted on this broker.
//!
//! A [`Partition`] owns the local replica's role (leader, follower, offline),
//! the leader-side view of every follower, ISR membership and the high
//! watermark. Its lock discipline is the hot-path contract of the whole
//! subsystem: state is snapshotted under the partition lock, log I/O runs
//! outside it, and results are published under the lock again. The lock IS
//! held across coordination-store writes, because an ISR change must be
//! durable before any thread can observe it.
//!
//! Purgatory pokes always happen after the lock is released; a delayed
//! produce re-reads partition state from its completion path and would
//! deadlock otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use crate::constants::UNKNOWN_OFFSET;
use crate::error::ErrorCode;

use super::clock::Clock;
use super::commands::PartitionStateData;
use super::config::ReplicaConfig;
use super::coordination::{
    CoordinationError, CoordinationStore, IsrChangeLog, LeaderAndIsr,
};
use super::error::{ReplicaError, ReplicaResult};
use super::log::{Log, LogAppendInfo, LogManager, LogReadInfo, RecordBatch, SequencedBatch};
use super::metrics::ReplicaMetrics;
use super::partition_state::PartitionMode;
use super::purgatory::Purgatory;
use super::replica::ReplicaView;
use super::topic_partition::TopicPartition;

/// Narrow handles a partition needs from its surroundings.
///
/// Partitions hold no reference to the replica manager; everything they call
/// out to is injected here at construction.
#[derive(Debug, Clone)]
pub struct PartitionContext {
    pub config: Arc<ReplicaConfig>,
    pub log_manager: Arc<dyn LogManager>,
    pub coordination: Arc<dyn CoordinationStore>,
    pub isr_changes: Arc<IsrChangeLog>,
    pub produce_purgatory: Arc<Purgatory>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<ReplicaMetrics>,
}

/// Result of a leader-side read.
#[derive(Debug)]
pub struct PartitionReadInfo {
    pub read: LogReadInfo,
    /// High watermark at read time.
    pub high_watermark: i64,
}

/// What a follower fetch changed on the leader.
#[derive(Debug, Clone, Copy, Default)]
pub struct FollowerUpdateOutcome {
    pub hw_advanced: bool,
    pub isr_expanded: bool,
}

#[derive(Debug)]
struct PartitionInner {
    mode: PartitionMode,
    leader_epoch: i32,
    controller_epoch: i32,
    assigned: Vec<i32>,
    isr: HashSet<i32>,
    /// Coordination-store version of the last leadership/ISR record we wrote
    /// or adopted; every ISR update compare-and-swaps on it.
    coordination_version: i32,
    remote_replicas: HashMap<i32, ReplicaView>,
    high_watermark: i64,
    log: Option<Arc<dyn Log>>,
}

/// One topic-partition and its replication state.
#[derive(Debug)]
pub struct Partition {
    tp: TopicPartition,
    broker_id: i32,
    ctx: PartitionContext,
    inner: RwLock<PartitionInner>,
}

impl Partition {
    /// Materialise a partition with no role yet.
    ///
    /// `checkpointed_hw` is the high watermark recovered from the checkpoint
    /// file, or 0 when the partition has no entry there. Until a controller
    /// command arrives the partition is offline and serves nothing.
    pub fn new(tp: TopicPartition, ctx: PartitionContext, checkpointed_hw: i64) -> Self {
        let broker_id = ctx.config.broker_id;
        Self {
            tp,
            broker_id,
            ctx,
            inner: RwLock::new(PartitionInner {
                mode: PartitionMode::Offline,
                leader_epoch: -1,
                controller_epoch: -1,
                assigned: Vec::new(),
                isr: HashSet::new(),
                coordination_version: 0,
                remote_replicas: HashMap::new(),
                high_watermark: checkpointed_hw.max(0),
                log: None,
            }),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    // =========================================================================
    // Role transitions
    // =========================================================================

    /// Take leadership per the controller's decision.
    ///
    /// Returns true if the partition was not already leader. Remote replica
    /// views are reset to unknown for the new epoch; ISR members start
    /// caught-up so the lag clock only runs from this transition. The high
    /// watermark is rebuilt from the local log end capped at its prior value.
    #[instrument(skip(self, state), fields(tp = %self.tp, leader_epoch = state.leader_epoch))]
    pub async fn make_leader(&self, state: &PartitionStateData) -> ReplicaResult<bool> {
        let log = self.ctx.log_manager.get_or_create(&self.tp).await?;
        let now_ms = self.ctx.clock.now_ms();

        let (was_leader, hw_advanced) = {
            let mut inner = self.inner.write().await;
            let was_leader = inner.mode.is_leader();

            inner.controller_epoch = state.controller_epoch;
            inner.leader_epoch = state.leader_epoch;
            inner.assigned = state.replicas.clone();
            inner.isr = state.isr.iter().copied().collect();
            inner.coordination_version = state.version;

            inner.remote_replicas.clear();
            for &replica_id in &state.replicas {
                if replica_id == self.broker_id {
                    continue;
                }
                let mut view = ReplicaView::new(replica_id);
                if inner.isr.contains(&replica_id) {
                    view.last_caught_up_ms = now_ms;
                }
                inner.remote_replicas.insert(replica_id, view);
            }

            let log_end = log.log_end_offset();
            inner.high_watermark = inner.high_watermark.min(log_end);
            inner.log = Some(Arc::clone(&log));
            inner.mode = PartitionMode::Leader;

            let hw_advanced = maybe_advance_hw_locked(self.broker_id, &mut inner);
            (was_leader, hw_advanced)
        };

        if hw_advanced {
            self.ctx.produce_purgatory.check_and_complete(&self.tp).await;
        }
        info!(tp = %self.tp, epoch = state.leader_epoch, "became leader");
        Ok(!was_leader)
    }

    /// Drop into follower mode behind the designated leader.
    ///
    /// Returns true if the followed leader changed. The caller truncates the
    /// local log to the high watermark before registering a fetcher; that
    /// ordering is what keeps uncommitted suffixes from surviving a
    /// leadership change.
    #[instrument(skip(self, state), fields(tp = %self.tp, leader = state.leader))]
    pub async fn make_follower(&self, state: &PartitionStateData) -> ReplicaResult<bool> {
        let log = self.ctx.log_manager.get_or_create(&self.tp).await?;

        let mut inner = self.inner.write().await;
        let leader_changed = inner.mode.followed_leader() != Some(state.leader);

        inner.controller_epoch = state.controller_epoch;
        inner.leader_epoch = state.leader_epoch;
        inner.assigned = state.replicas.clone();
        inner.coordination_version = state.version;
        inner.isr.clear();
        inner.remote_replicas.clear();
        inner.log = Some(log);
        inner.mode = PartitionMode::Follower {
            leader: state.leader,
        };
        drop(inner);

        info!(tp = %self.tp, leader = state.leader, epoch = state.leader_epoch, "became follower");
        Ok(leader_changed)
    }

    /// Drop all role state; the partition stays hosted but serves nothing.
    pub async fn make_offline(&self) {
        let mut inner = self.inner.write().await;
        inner.mode = PartitionMode::Offline;
        inner.isr.clear();
        inner.remote_replicas.clear();
    }

    /// Truncate the local log to the current high watermark.
    ///
    /// Returns the offset truncated to.
    pub async fn truncate_to_high_watermark(&self) -> ReplicaResult<i64> {
        let (log, hw) = {
            let inner = self.inner.read().await;
            (inner.log.clone(), inner.high_watermark)
        };
        if let Some(log) = log {
            log.truncate_to(hw).await?;
            debug!(tp = %self.tp, hw, "truncated log to high watermark");
        }
        Ok(hw)
    }

    // =========================================================================
    // Leader-side operations
    // =========================================================================

    /// Append a batch as leader.
    ///
    /// acks=all requests are rejected up front when the ISR is already below
    /// the configured minimum, so producers learn about unavailability before
    /// writing rather than after.
    pub async fn append_to_leader(
        &self,
        batch: RecordBatch,
        required_acks: i16,
    ) -> ReplicaResult<LogAppendInfo> {
        let log = {
            let inner = self.inner.read().await;
            if !inner.mode.is_leader() {
                return Err(ReplicaError::NotLeader {
                    tp: self.tp.clone(),
                    broker: self.broker_id,
                });
            }
            if required_acks == -1 && inner.isr.len() < self.ctx.config.min_in_sync_replicas {
                return Err(ReplicaError::NotEnoughReplicas {
                    tp: self.tp.clone(),
                    isr_size: inner.isr.len(),
                    min_in_sync: self.ctx.config.min_in_sync_replicas,
                });
            }
            inner.log.clone().ok_or(ReplicaError::ReplicaNotAvailable {
                tp: self.tp.clone(),
                broker: self.broker_id,
            })?
        };

        let info = log.append(batch).await?;

        let hw_advanced = {
            let mut inner = self.inner.write().await;
            maybe_advance_hw_locked(self.broker_id, &mut inner)
        };
        if hw_advanced {
            self.ctx.produce_purgatory.check_and_complete(&self.tp).await;
        }
        Ok(info)
    }

    /// Read from the local log.
    ///
    /// `require_leader` enforces the leader-only rule (disabled for the debug
    /// replica id); `cap_at_hw` restricts consumers to committed records.
    pub async fn read_from_local(
        &self,
        offset: i64,
        max_bytes: usize,
        require_leader: bool,
        cap_at_hw: bool,
    ) -> ReplicaResult<PartitionReadInfo> {
        let (log, hw) = {
            let inner = self.inner.read().await;
            if require_leader && !inner.mode.is_leader() {
                return Err(ReplicaError::NotLeader {
                    tp: self.tp.clone(),
                    broker: self.broker_id,
                });
            }
            let log = inner.log.clone().ok_or(ReplicaError::ReplicaNotAvailable {
                tp: self.tp.clone(),
                broker: self.broker_id,
            })?;
            (log, inner.high_watermark)
        };

        let max_offset = cap_at_hw.then_some(hw);
        let read = log.read(offset, max_bytes, max_offset).await?;
        Ok(PartitionReadInfo {
            read,
            high_watermark: hw,
        })
    }

    /// Record a follower fetch at `follower_leo`.
    ///
    /// The follower is caught up iff its log end reached the leader's log
    /// end observed when the fetch arrived. May expand the ISR (durably,
    /// before the expansion is visible) and advance the high watermark.
    #[instrument(skip(self), fields(tp = %self.tp))]
    pub async fn update_follower_fetch_state(
        &self,
        follower_id: i32,
        follower_leo: i64,
        leader_leo_at_fetch: i64,
    ) -> ReplicaResult<FollowerUpdateOutcome> {
        let now_ms = self.ctx.clock.now_ms();
        let mut outcome = FollowerUpdateOutcome::default();

        {
            let mut inner = self.inner.write().await;
            if !inner.mode.is_leader() {
                return Err(ReplicaError::NotLeader {
                    tp: self.tp.clone(),
                    broker: self.broker_id,
                });
            }
            let view = inner.remote_replicas.get_mut(&follower_id).ok_or(
                ReplicaError::ReplicaNotAvailable {
                    tp: self.tp.clone(),
                    broker: follower_id,
                },
            )?;
            view.update_fetch_state(follower_leo, leader_leo_at_fetch, now_ms);

            // Expansion requires reaching the current high watermark, not the
            // log end: an oscillating follower must fully catch up to the
            // committed point before it counts toward commit again.
            if !inner.isr.contains(&follower_id) && follower_leo >= inner.high_watermark {
                outcome.isr_expanded = self
                    .update_isr_locked(&mut inner, IsrUpdate::Add(follower_id), now_ms)
                    .await;
            }

            outcome.hw_advanced = maybe_advance_hw_locked(self.broker_id, &mut inner);
        }

        if outcome.hw_advanced {
            self.ctx.produce_purgatory.check_and_complete(&self.tp).await;
        }
        Ok(outcome)
    }

    /// Drop followers that have not caught up within `replica_lag_time_max_ms`.
    ///
    /// Returns true if the ISR shrank. The leader itself is never removed.
    #[instrument(skip(self), fields(tp = %self.tp))]
    pub async fn maybe_shrink_isr(&self) -> ReplicaResult<bool> {
        let max_lag_ms = self.ctx.config.replica_lag_time_max_ms;
        let now_ms = self.ctx.clock.now_ms();

        let (shrunk, hw_advanced) = {
            let mut inner = self.inner.write().await;
            if !inner.mode.is_leader() {
                return Ok(false);
            }

            let laggards: Vec<i32> = inner
                .isr
                .iter()
                .copied()
                .filter(|&id| id != self.broker_id)
                .filter(|id| match inner.remote_replicas.get(id) {
                    Some(view) => view.lag_ms(now_ms) > max_lag_ms,
                    None => true,
                })
                .collect();
            if laggards.is_empty() {
                return Ok(false);
            }

            debug!(tp = %self.tp, ?laggards, max_lag_ms, "followers lagging beyond max lag");
            let shrunk = self
                .update_isr_locked(&mut inner, IsrUpdate::Remove(laggards), now_ms)
                .await;
            let hw_advanced = if shrunk {
                maybe_advance_hw_locked(self.broker_id, &mut inner)
            } else {
                false
            };
            (shrunk, hw_advanced)
        };

        if hw_advanced {
            self.ctx.produce_purgatory.check_and_complete(&self.tp).await;
        }
        Ok(shrunk)
    }

    /// Completion check for delayed produces.
    ///
    /// Returns `(satisfied, error)`: satisfied with no error once the high
    /// watermark reached `required_offset`; satisfied with an error when
    /// waiting further is futile.
    pub async fn check_enough_replicas_reach_offset(
        &self,
        required_offset: i64,
    ) -> (bool, ErrorCode) {
        let inner = self.inner.read().await;
        if !inner.mode.is_leader() {
            return (true, ErrorCode::NotLeaderForPartition);
        }
        if inner.high_watermark >= required_offset {
            if inner.isr.len() >= self.ctx.config.min_in_sync_replicas {
                (true, ErrorCode::None)
            } else {
                (true, ErrorCode::NotEnoughReplicasAfterAppend)
            }
        } else {
            (false, ErrorCode::None)
        }
    }

    // =========================================================================
    // Follower-side operations
    // =========================================================================

    /// Append batches replicated from the leader and mirror its high
    /// watermark. Returns the new local log end offset.
    pub async fn append_as_follower(
        &self,
        batches: Vec<SequencedBatch>,
        leader_hw: i64,
    ) -> ReplicaResult<i64> {
        let log = {
            let inner = self.inner.read().await;
            if !inner.mode.is_follower() {
                return Err(ReplicaError::NotLeader {
                    tp: self.tp.clone(),
                    broker: self.broker_id,
                });
            }
            inner.log.clone().ok_or(ReplicaError::ReplicaNotAvailable {
                tp: self.tp.clone(),
                broker: self.broker_id,
            })?
        };

        for sb in batches {
            let local_end = log.log_end_offset();
            if sb.base_offset != local_end {
                warn!(
                    tp = %self.tp,
                    expected = local_end,
                    got = sb.base_offset,
                    "leader batch does not align with local log end, refetching"
                );
                break;
            }
            log.append(sb.batch).await?;
        }

        let log_end = log.log_end_offset();
        let mut inner = self.inner.write().await;
        let mirrored = leader_hw.min(log_end);
        if mirrored > inner.high_watermark {
            inner.high_watermark = mirrored;
        }
        Ok(log_end)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub async fn mode(&self) -> PartitionMode {
        self.inner.read().await.mode
    }

    pub async fn is_leader(&self) -> bool {
        self.inner.read().await.mode.is_leader()
    }

    pub async fn high_watermark(&self) -> i64 {
        self.inner.read().await.high_watermark
    }

    pub async fn leader_epoch(&self) -> i32 {
        self.inner.read().await.leader_epoch
    }

    pub async fn controller_epoch(&self) -> i32 {
        self.inner.read().await.controller_epoch
    }

    pub async fn assigned_replicas(&self) -> Vec<i32> {
        self.inner.read().await.assigned.clone()
    }

    /// Current ISR, sorted for stable assertions and logging.
    pub async fn in_sync_replicas(&self) -> Vec<i32> {
        let mut isr: Vec<i32> = self.inner.read().await.isr.iter().copied().collect();
        isr.sort_unstable();
        isr
    }

    pub async fn local_log(&self) -> Option<Arc<dyn Log>> {
        self.inner.read().await.log.clone()
    }

    /// Log end offset of the local log, if one exists.
    pub async fn log_end_offset(&self) -> Option<i64> {
        self.inner
            .read()
            .await
            .log
            .as_ref()
            .map(|log| log.log_end_offset())
    }

    /// A leader partition is under-replicated while its ISR is smaller than
    /// its assigned set.
    pub async fn is_under_replicated(&self) -> bool {
        let inner = self.inner.read().await;
        inner.mode.is_leader() && inner.isr.len() < inner.assigned.len()
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Write the updated ISR to the coordination store, then publish it.
    ///
    /// Runs under the partition write lock on purpose: the new membership
    /// must be durable before any reader can observe it. A version conflict
    /// means a competing controller moved first; the update is skipped and
    /// the controller's next command reconciles us.
    async fn update_isr_locked(
        &self,
        inner: &mut PartitionInner,
        update: IsrUpdate,
        now_ms: i64,
    ) -> bool {
        let mut new_isr: HashSet<i32> = inner.isr.clone();
        match &update {
            IsrUpdate::Add(follower) => {
                new_isr.insert(*follower);
            }
            IsrUpdate::Remove(laggards) => {
                for id in laggards {
                    new_isr.remove(id);
                }
            }
        }

        let mut isr_vec: Vec<i32> = new_isr.iter().copied().collect();
        isr_vec.sort_unstable();
        let record = LeaderAndIsr {
            leader: self.broker_id,
            leader_epoch: inner.leader_epoch,
            isr: isr_vec.clone(),
            controller_epoch: inner.controller_epoch,
        };

        match self
            .ctx
            .coordination
            .update_leader_and_isr(&self.tp, &record, inner.coordination_version)
            .await
        {
            Ok(version) => {
                inner.coordination_version = version;
                inner.isr = new_isr;
                match update {
                    IsrUpdate::Add(follower) => {
                        self.ctx.metrics.isr_expands.inc();
                        info!(tp = %self.tp, follower, isr = ?isr_vec, "expanded ISR");
                    }
                    IsrUpdate::Remove(_) => {
                        self.ctx.metrics.isr_shrinks.inc();
                        info!(tp = %self.tp, isr = ?isr_vec, "shrank ISR");
                    }
                }
                self.ctx.isr_changes.record(self.tp.clone(), now_ms);
                true
            }
            Err(CoordinationError::VersionConflict { .. }) => {
                warn!(
                    tp = %self.tp,
                    version = inner.coordination_version,
                    "conflicting coordination update, skipping ISR change"
                );
                false
            }
            Err(e) => {
                warn!(tp = %self.tp, error = %e, "coordination store rejected ISR change");
                false
            }
        }
    }
}

#[derive(Debug)]
enum IsrUpdate {
    Add(i32),
    Remove(Vec<i32>),
}

/// Recompute the high watermark as the minimum log end offset across the ISR.
///
/// A follower the leader has not heard from under this epoch blocks
/// advancement. Returns true iff the high watermark strictly advanced; it
/// never moves backwards.
fn maybe_advance_hw_locked(broker_id: i32, inner: &mut PartitionInner) -> bool {
    if !inner.mode.is_leader() {
        return false;
    }
    let Some(log) = inner.log.as_ref() else {
        return false;
    };
    let leader_leo = log.log_end_offset();

    let mut min_leo = leader_leo;
    for &replica_id in &inner.isr {
        if replica_id == broker_id {
            continue;
        }
        let leo = inner
            .remote_replicas
            .get(&replica_id)
            .map(|view| view.log_end_offset)
            .unwrap_or(UNKNOWN_OFFSET);
        if leo == UNKNOWN_OFFSET {
            return false;
        }
        min_leo = min_leo.min(leo);
    }

    if min_leo > inner.high_watermark {
        debug!(
            from = inner.high_watermark,
            to = min_leo,
            "advancing high watermark"
        );
        inner.high_watermark = min_leo;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::clock::ManualClock;
    use crate::replication::memory_log::MemoryLogManager;
    use crate::replication::mock_coordination::MockCoordinationStore;
    use bytes::Bytes;
    use std::path::PathBuf;

    fn batch(payload: &str, records: i32) -> RecordBatch {
        RecordBatch::new(Bytes::copy_from_slice(payload.as_bytes()), records, 1_000)
    }

    fn state(leader: i32, leader_epoch: i32, isr: Vec<i32>, replicas: Vec<i32>) -> PartitionStateData {
        PartitionStateData {
            tp: TopicPartition::new("orders", 0),
            controller_epoch: 1,
            leader,
            leader_epoch,
            isr,
            replicas,
            version: 0,
        }
    }

    struct Fixture {
        partition: Partition,
        clock: Arc<ManualClock>,
        coordination: Arc<MockCoordinationStore>,
        ctx: PartitionContext,
    }

    fn fixture(min_in_sync: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let coordination = Arc::new(MockCoordinationStore::new());
        let metrics = Arc::new(ReplicaMetrics::unregistered());
        let config = Arc::new(ReplicaConfig {
            broker_id: 1,
            min_in_sync_replicas: min_in_sync,
            ..Default::default()
        });
        let ctx = PartitionContext {
            config,
            log_manager: Arc::new(MemoryLogManager::new(vec![PathBuf::from("/data")])),
            coordination: Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
            isr_changes: Arc::new(IsrChangeLog::new()),
            produce_purgatory: Arc::new(Purgatory::new(
                "produce",
                metrics.delayed_produce_pending.clone(),
                metrics.delayed_operation_timeouts.clone(),
            )),
            clock: Arc::clone(&clock) as Arc<dyn Clock>,
            metrics,
        };
        let partition = Partition::new(TopicPartition::new("orders", 0), ctx.clone(), 0);
        Fixture {
            partition,
            clock,
            coordination,
            ctx,
        }
    }

    #[tokio::test]
    async fn test_append_fails_when_offline() {
        let f = fixture(1);
        let err = f
            .partition
            .append_to_leader(batch("x", 1), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NotLeader { .. }));
    }

    #[tokio::test]
    async fn test_sole_leader_advances_hw_on_append() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1], vec![1]))
            .await
            .unwrap();

        let info = f.partition.append_to_leader(batch("x", 1), 1).await.unwrap();
        assert_eq!(info.first_offset, 0);
        // ISR is just the leader, so the high watermark tracks the log end.
        assert_eq!(f.partition.high_watermark().await, 1);
    }

    #[tokio::test]
    async fn test_acks_all_rejected_below_min_isr() {
        let f = fixture(2);
        f.partition
            .make_leader(&state(1, 0, vec![1], vec![1, 2, 3]))
            .await
            .unwrap();

        let err = f
            .partition
            .append_to_leader(batch("x", 1), -1)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicaError::NotEnoughReplicas { .. }));
        // acks=1 still goes through.
        f.partition.append_to_leader(batch("x", 1), 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_hw_waits_for_full_isr() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1, 2, 3], vec![1, 2, 3]))
            .await
            .unwrap();
        f.partition.append_to_leader(batch("x", 1), 1).await.unwrap();
        assert_eq!(f.partition.high_watermark().await, 0);

        let outcome = f
            .partition
            .update_follower_fetch_state(2, 1, 1)
            .await
            .unwrap();
        assert!(!outcome.hw_advanced); // follower 3 still unknown

        let outcome = f
            .partition
            .update_follower_fetch_state(3, 1, 1)
            .await
            .unwrap();
        assert!(outcome.hw_advanced);
        assert_eq!(f.partition.high_watermark().await, 1);
    }

    #[tokio::test]
    async fn test_isr_expansion_requires_reaching_hw() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1, 2], vec![1, 2, 3]))
            .await
            .unwrap();
        f.partition.append_to_leader(batch("xx", 2), 1).await.unwrap();
        f.partition
            .update_follower_fetch_state(2, 2, 2)
            .await
            .unwrap();
        assert_eq!(f.partition.high_watermark().await, 2);

        // Follower 3 fetches at 1: behind HW, stays out of the ISR.
        let outcome = f
            .partition
            .update_follower_fetch_state(3, 1, 2)
            .await
            .unwrap();
        assert!(!outcome.isr_expanded);
        assert_eq!(f.partition.in_sync_replicas().await, vec![1, 2]);

        // Follower 3 reaches the high watermark: expansion, durably recorded.
        let outcome = f
            .partition
            .update_follower_fetch_state(3, 2, 2)
            .await
            .unwrap();
        assert!(outcome.isr_expanded);
        assert_eq!(f.partition.in_sync_replicas().await, vec![1, 2, 3]);

        let stored = f
            .coordination
            .leader_and_isr(f.partition.topic_partition())
            .unwrap();
        assert_eq!(stored.isr, vec![1, 2, 3]);
        assert!(!f.ctx.isr_changes.is_empty());
        assert_eq!(f.ctx.metrics.isr_expands.get(), 1);
    }

    #[tokio::test]
    async fn test_shrink_removes_laggard_and_advances_hw() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1, 2, 3], vec![1, 2, 3]))
            .await
            .unwrap();
        f.partition.append_to_leader(batch("x", 1), 1).await.unwrap();
        // Follower 3 goes silent past the lag bound; follower 2 keeps
        // fetching and stays fresh.
        f.clock.advance(f.ctx.config.replica_lag_time_max_ms + 1);
        f.partition
            .update_follower_fetch_state(2, 1, 1)
            .await
            .unwrap();

        let shrunk = f.partition.maybe_shrink_isr().await.unwrap();
        assert!(shrunk);
        assert_eq!(f.partition.in_sync_replicas().await, vec![1, 2]);
        // With the laggard gone the high watermark advances.
        assert_eq!(f.partition.high_watermark().await, 1);
        assert_eq!(f.ctx.metrics.isr_shrinks.get(), 1);

        // A second pass with a healthy ISR is a no-op.
        assert!(!f.partition.maybe_shrink_isr().await.unwrap());
    }

    #[tokio::test]
    async fn test_shrink_never_removes_leader() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1], vec![1, 2]))
            .await
            .unwrap();
        f.clock.advance(f.ctx.config.replica_lag_time_max_ms * 2);
        assert!(!f.partition.maybe_shrink_isr().await.unwrap());
        assert_eq!(f.partition.in_sync_replicas().await, vec![1]);
    }

    #[tokio::test]
    async fn test_version_conflict_skips_expansion() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1], vec![1, 2]))
            .await
            .unwrap();
        // Another writer bumped the coordination version behind our back.
        f.coordination.seed(
            f.partition.topic_partition().clone(),
            LeaderAndIsr {
                leader: 1,
                leader_epoch: 0,
                isr: vec![1],
                controller_epoch: 1,
            },
            7,
        );

        let outcome = f
            .partition
            .update_follower_fetch_state(2, 0, 0)
            .await
            .unwrap();
        assert!(!outcome.isr_expanded);
        assert_eq!(f.partition.in_sync_replicas().await, vec![1]);
    }

    #[tokio::test]
    async fn test_consumer_read_capped_at_hw() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1, 2], vec![1, 2]))
            .await
            .unwrap();
        f.partition.append_to_leader(batch("a", 1), 1).await.unwrap();
        f.partition.append_to_leader(batch("b", 1), 1).await.unwrap();
        f.partition
            .update_follower_fetch_state(2, 1, 2)
            .await
            .unwrap();
        assert_eq!(f.partition.high_watermark().await, 1);

        let consumer = f
            .partition
            .read_from_local(0, usize::MAX, true, true)
            .await
            .unwrap();
        assert_eq!(consumer.read.batches.len(), 1);

        let follower = f
            .partition
            .read_from_local(0, usize::MAX, true, false)
            .await
            .unwrap();
        assert_eq!(follower.read.batches.len(), 2);
        assert_eq!(follower.read.log_end_offset, 2);
    }

    #[tokio::test]
    async fn test_make_follower_keeps_hw_and_truncates() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1, 2], vec![1, 2]))
            .await
            .unwrap();
        f.partition.append_to_leader(batch("ab", 2), 1).await.unwrap();
        f.partition
            .update_follower_fetch_state(2, 1, 2)
            .await
            .unwrap();
        assert_eq!(f.partition.high_watermark().await, 1);

        let changed = f
            .partition
            .make_follower(&state(2, 1, vec![2], vec![1, 2]))
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(f.partition.mode().await.followed_leader(), Some(2));

        // Records above the high watermark do not survive the demotion. The
        // whole batch straddling it is dropped at batch granularity.
        f.partition.truncate_to_high_watermark().await.unwrap();
        assert_eq!(f.partition.log_end_offset().await, Some(0));
    }

    #[tokio::test]
    async fn test_append_as_follower_mirrors_leader_hw() {
        let f = fixture(1);
        f.partition
            .make_follower(&state(2, 0, vec![2], vec![1, 2]))
            .await
            .unwrap();

        let batches = vec![
            SequencedBatch {
                base_offset: 0,
                batch: batch("a", 1),
            },
            SequencedBatch {
                base_offset: 1,
                batch: batch("b", 1),
            },
        ];
        let leo = f.partition.append_as_follower(batches, 1).await.unwrap();
        assert_eq!(leo, 2);
        // Leader HW of 1 is mirrored; the local suffix beyond it stays
        // uncommitted.
        assert_eq!(f.partition.high_watermark().await, 1);
    }

    #[tokio::test]
    async fn test_misaligned_follower_batch_is_dropped() {
        let f = fixture(1);
        f.partition
            .make_follower(&state(2, 0, vec![2], vec![1, 2]))
            .await
            .unwrap();

        let batches = vec![SequencedBatch {
            base_offset: 5,
            batch: batch("x", 1),
        }];
        let leo = f.partition.append_as_follower(batches, 0).await.unwrap();
        assert_eq!(leo, 0);
    }

    #[tokio::test]
    async fn test_check_enough_replicas_reach_offset() {
        let f = fixture(2);
        f.partition
            .make_leader(&state(1, 0, vec![1, 2], vec![1, 2]))
            .await
            .unwrap();
        f.partition.append_to_leader(batch("x", 1), -1).await.unwrap();

        let (satisfied, _) = f.partition.check_enough_replicas_reach_offset(1).await;
        assert!(!satisfied);

        f.partition
            .update_follower_fetch_state(2, 1, 1)
            .await
            .unwrap();
        let (satisfied, error) = f.partition.check_enough_replicas_reach_offset(1).await;
        assert!(satisfied);
        assert_eq!(error, ErrorCode::None);
    }

    #[tokio::test]
    async fn test_under_replicated_gauge_source() {
        let f = fixture(1);
        f.partition
            .make_leader(&state(1, 0, vec![1], vec![1, 2]))
            .await
            .unwrap();
        assert!(f.partition.is_under_replicated().await);
        f.partition
            .update_follower_fetch_state(2, 0, 0)
            .await
            .unwrap();
        assert!(!f.partition.is_under_replicated().await);
    }
}
