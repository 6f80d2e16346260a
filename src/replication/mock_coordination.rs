//! In-memory mock coordination store for testing.
//!
//! Implements [`CoordinationStore`] with the same compare-and-swap semantics
//! a production store provides, plus accessors for asserting on recorded
//! state and notifications.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::coordination::{
    CoordinationError, CoordinationResult, CoordinationStore, LeaderAndIsr,
};
use super::topic_partition::TopicPartition;

#[derive(Debug, Default)]
struct MockState {
    /// Per-partition record plus its version.
    entries: HashMap<TopicPartition, (LeaderAndIsr, i32)>,
    /// Every notification batch, in arrival order.
    notifications: Vec<Vec<TopicPartition>>,
}

/// In-memory [`CoordinationStore`].
#[derive(Debug, Default)]
pub struct MockCoordinationStore {
    state: Mutex<MockState>,
    fail_notifications: AtomicBool,
}

impl MockCoordinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current record for a partition, if any.
    pub fn leader_and_isr(&self, tp: &TopicPartition) -> Option<LeaderAndIsr> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.get(tp).map(|(entry, _)| entry.clone())
    }

    /// Current version for a partition, if any.
    pub fn version(&self, tp: &TopicPartition) -> Option<i32> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.get(tp).map(|(_, version)| *version)
    }

    /// Seed an entry at a given version, as the controller would have.
    pub fn seed(&self, tp: TopicPartition, entry: LeaderAndIsr, version: i32) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.insert(tp, (entry, version));
    }

    /// All ISR-change notification batches received so far.
    pub fn notifications(&self) -> Vec<Vec<TopicPartition>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.notifications.clone()
    }

    /// Make `notify_isr_change` fail until switched back, to exercise the
    /// propagation retry path.
    pub fn set_fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationStore for MockCoordinationStore {
    async fn update_leader_and_isr(
        &self,
        tp: &TopicPartition,
        state: &LeaderAndIsr,
        expected_version: i32,
    ) -> CoordinationResult<i32> {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current_version = guard
            .entries
            .get(tp)
            .map(|(_, version)| *version)
            .unwrap_or(0);
        if current_version != expected_version {
            return Err(CoordinationError::VersionConflict {
                tp: tp.clone(),
                expected_version,
            });
        }
        let new_version = current_version + 1;
        guard
            .entries
            .insert(tp.clone(), (state.clone(), new_version));
        Ok(new_version)
    }

    async fn notify_isr_change(&self, changes: &[TopicPartition]) -> CoordinationResult<()> {
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable(
                "notification channel down".to_string(),
            ));
        }
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        guard.notifications.push(changes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(leader: i32, epoch: i32) -> LeaderAndIsr {
        LeaderAndIsr {
            leader,
            leader_epoch: epoch,
            isr: vec![leader],
            controller_epoch: 1,
        }
    }

    #[tokio::test]
    async fn test_cas_succeeds_at_expected_version() {
        let store = MockCoordinationStore::new();
        let tp = TopicPartition::new("orders", 0);

        let v1 = store
            .update_leader_and_isr(&tp, &entry(1, 0), 0)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = store
            .update_leader_and_isr(&tp, &entry(1, 0), v1)
            .await
            .unwrap();
        assert_eq!(v2, 2);
        assert_eq!(store.version(&tp), Some(2));
    }

    #[tokio::test]
    async fn test_cas_conflict_on_stale_version() {
        let store = MockCoordinationStore::new();
        let tp = TopicPartition::new("orders", 0);
        store.seed(tp.clone(), entry(1, 0), 5);

        let err = store
            .update_leader_and_isr(&tp, &entry(1, 1), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::VersionConflict { .. }));
        // The stored entry is untouched.
        assert_eq!(store.leader_and_isr(&tp), Some(entry(1, 0)));
    }

    #[tokio::test]
    async fn test_notifications_recorded_and_failable() {
        let store = MockCoordinationStore::new();
        let tp = TopicPartition::new("orders", 0);

        store.notify_isr_change(&[tp.clone()]).await.unwrap();
        assert_eq!(store.notifications().len(), 1);

        store.set_fail_notifications(true);
        assert!(store.notify_isr_change(&[tp]).await.is_err());
        assert_eq!(store.notifications().len(), 1);
    }
}
