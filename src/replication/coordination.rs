//! Coordination-store interface for leadership and ISR state.
//!
//! The coordination store is the cluster-wide source of truth for which
//! replicas are in sync. The replica manager writes through this trait and
//! never caches an ISR change as visible until the write succeeded, so a
//! competing controller can always be detected by the version compare-and-swap.
//!
//! # Available Implementations
//!
//! - A production backend lives with the cluster controller deployment and is
//!   out of scope for this crate.
//! - [`MockCoordinationStore`](super::mock_coordination::MockCoordinationStore):
//!   in-memory mock for testing.

use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use thiserror::Error;

use super::topic_partition::TopicPartition;

/// Result type for coordination-store operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors surfaced by the coordination store.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The compare-and-swap failed: another writer changed the entry since
    /// it was read at `expected_version`.
    #[error("version conflict on {tp}: expected version {expected_version}")]
    VersionConflict {
        tp: TopicPartition,
        expected_version: i32,
    },

    /// The store could not be reached or rejected the request.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
}

/// Durable per-partition leadership record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderAndIsr {
    /// Broker id of the current leader.
    pub leader: i32,
    /// Leader epoch stamped by the controller.
    pub leader_epoch: i32,
    /// In-sync replica set.
    pub isr: Vec<i32>,
    /// Controller epoch of the decision being recorded.
    pub controller_epoch: i32,
}

/// Cluster-wide store recording leadership and ISR per partition.
#[async_trait]
pub trait CoordinationStore: Send + Sync + fmt::Debug {
    /// Persist a new leadership/ISR record for `tp`.
    ///
    /// The write succeeds only if the stored entry is still at
    /// `expected_version`; on success the new version is returned. A
    /// [`CoordinationError::VersionConflict`] means another controller or
    /// leader raced this update and the caller must re-read before retrying.
    async fn update_leader_and_isr(
        &self,
        tp: &TopicPartition,
        state: &LeaderAndIsr,
        expected_version: i32,
    ) -> CoordinationResult<i32>;

    /// Append an ISR-change notification covering `changes`.
    ///
    /// Notifications are advisory: they tell the controller which partitions
    /// to re-read, they do not carry the new ISR themselves.
    async fn notify_isr_change(&self, changes: &[TopicPartition]) -> CoordinationResult<()>;
}

/// Accumulator for ISR changes awaiting propagation.
///
/// Partitions record into this from under their own locks; the
/// `isr-change-propagation` job drains it on the cadence described in
/// [`crate::constants`]. The set is guarded by its own mutex so recording
/// never contends with partition state.
#[derive(Debug, Default)]
pub struct IsrChangeLog {
    changes: Mutex<HashSet<TopicPartition>>,
    last_change_ms: AtomicI64,
}

impl IsrChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `tp`'s ISR changed at `now_ms`.
    pub fn record(&self, tp: TopicPartition, now_ms: i64) {
        let mut changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        changes.insert(tp);
        self.last_change_ms.store(now_ms, Ordering::SeqCst);
    }

    /// Timestamp of the most recent recorded change.
    pub fn last_change_ms(&self) -> i64 {
        self.last_change_ms.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Take the accumulated changes, leaving the set empty.
    ///
    /// Atomic with respect to concurrent [`record`](Self::record) calls: a
    /// change is either in the drained batch or in the next one, never lost.
    pub fn drain(&self) -> Vec<TopicPartition> {
        let mut changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        changes.drain().collect()
    }

    /// Put back changes whose propagation failed so a later cycle retries them.
    pub fn restore(&self, batch: Vec<TopicPartition>) {
        let mut changes = self.changes.lock().unwrap_or_else(|e| e.into_inner());
        changes.extend(batch);
    }
}
