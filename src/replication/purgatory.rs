//! Key-indexed, time-bounded store for delayed operations.
//!
//! Produce requests with acks=all and fetch requests with a min-bytes floor
//! cannot always be answered immediately. Instead of parking a thread, the
//! request registers a passive [`DelayedOperation`] here, keyed by every
//! partition that could unblock it. Progress events poke the purgatory with
//! [`Purgatory::check_and_complete`]; a timer fires
//! [`DelayedOperation::on_expiration`] if the deadline passes first.
//!
//! # Guarantees
//!
//! - An operation completes at most once (operations gate their completion on
//!   an atomic compare-and-swap).
//! - A successful `check_and_complete(key)` observes every state change the
//!   caller made before the call: callers publish state under their own locks
//!   before poking, and `try_complete` re-reads that state.
//! - No operation remains past its deadline by more than timer slack.
//! - Completion callbacks fire on the completing task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use prometheus::{IntCounter, IntGauge};
use tracing::debug;

use super::topic_partition::TopicPartition;

/// A passive operation awaiting an external event or timeout.
///
/// Implementations gate completion on an internal `AtomicBool` so concurrent
/// `try_complete` / `on_expiration` calls race safely: exactly one caller
/// claims the completion and delivers the response.
#[async_trait]
pub trait DelayedOperation: Send + Sync + fmt::Debug {
    /// Attempt to complete now. Returns true iff this call completed the
    /// operation. Must return false (and do nothing) once completed.
    async fn try_complete(&self) -> bool;

    /// Forced completion at the deadline. Must be a no-op once completed.
    async fn on_expiration(&self);

    /// Whether the operation has completed (successfully or by expiration).
    fn is_completed(&self) -> bool;
}

/// Key-indexed waiter store with per-operation timers.
pub struct Purgatory {
    name: &'static str,
    watchers: DashMap<TopicPartition, Vec<Arc<dyn DelayedOperation>>>,
    /// Watcher registrations currently held (one operation registered under
    /// three keys counts three times until purged).
    pending: IntGauge,
    timeouts: IntCounter,
}

impl fmt::Debug for Purgatory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Purgatory")
            .field("name", &self.name)
            .field("watched", &self.watched())
            .finish()
    }
}

impl Purgatory {
    pub fn new(name: &'static str, pending: IntGauge, timeouts: IntCounter) -> Self {
        Self {
            name,
            watchers: DashMap::new(),
            pending,
            timeouts,
        }
    }

    /// Attempt immediate completion; otherwise watch `op` under every key
    /// and arm its expiration timer.
    ///
    /// Returns true if the operation completed immediately. The second
    /// completion attempt after registration closes the race with a progress
    /// event that fired between the first attempt and the watch.
    pub async fn try_complete_else_watch(
        &self,
        op: Arc<dyn DelayedOperation>,
        keys: Vec<TopicPartition>,
        timeout: Duration,
    ) -> bool {
        if op.try_complete().await {
            return true;
        }

        for key in keys {
            self.watchers.entry(key).or_default().push(Arc::clone(&op));
            self.pending.inc();
        }

        if op.try_complete().await {
            return true;
        }

        let timer_op = Arc::clone(&op);
        let timeouts = self.timeouts.clone();
        let name = self.name;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !timer_op.is_completed() {
                debug!(purgatory = name, "delayed operation expired");
                timer_op.on_expiration().await;
                timeouts.inc();
            }
        });
        false
    }

    /// Attempt to complete every operation watched under `key`.
    ///
    /// Returns the number of operations completed by this call. Completed
    /// watchers are pruned from the key.
    pub async fn check_and_complete(&self, key: &TopicPartition) -> usize {
        // Snapshot outside the shard guard: try_complete awaits partition
        // locks and must not run under the map entry.
        let ops: Vec<Arc<dyn DelayedOperation>> = match self.watchers.get(key) {
            Some(watchers) => watchers.iter().map(Arc::clone).collect(),
            None => return 0,
        };

        let mut completed = 0;
        for op in ops {
            if !op.is_completed() && op.try_complete().await {
                completed += 1;
            }
        }

        if let Some(mut watchers) = self.watchers.get_mut(key) {
            let before = watchers.len();
            watchers.retain(|op| !op.is_completed());
            let pruned = before - watchers.len();
            if pruned > 0 {
                self.pending.sub(pruned as i64);
            }
        }
        self.watchers.remove_if(key, |_, watchers| watchers.is_empty());
        completed
    }

    /// Total watcher registrations currently held.
    pub fn watched(&self) -> usize {
        self.watchers.iter().map(|entry| entry.value().len()).sum()
    }

    /// Prune completed watchers from every key.
    ///
    /// Run periodically: operations completed through one key stay registered
    /// under their other keys until this sweeps them out.
    pub fn purge_completed(&self) {
        let mut pruned = 0;
        for mut entry in self.watchers.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|op| !op.is_completed());
            pruned += before - entry.value().len();
        }
        self.watchers.retain(|_, watchers| !watchers.is_empty());
        if pruned > 0 {
            self.pending.sub(pruned as i64);
            debug!(purgatory = self.name, pruned, "purged completed watchers");
        }
    }

    /// Force-expire every pending operation. Used on shutdown so no caller
    /// waits on a purgatory that will never be poked again.
    pub async fn expire_all(&self) {
        let mut seen: Vec<usize> = Vec::new();
        let mut to_expire: Vec<Arc<dyn DelayedOperation>> = Vec::new();
        for entry in self.watchers.iter() {
            for op in entry.value() {
                let ptr = Arc::as_ptr(op) as *const () as usize;
                if !seen.contains(&ptr) {
                    seen.push(ptr);
                    to_expire.push(Arc::clone(op));
                }
            }
        }
        self.watchers.clear();
        self.pending.set(0);

        for op in to_expire {
            if !op.is_completed() {
                op.on_expiration().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Test operation that completes once `ready` is set.
    #[derive(Debug)]
    struct FlagOperation {
        ready: AtomicBool,
        completed: AtomicBool,
        completions: AtomicUsize,
        expirations: AtomicUsize,
    }

    impl FlagOperation {
        fn new(ready: bool) -> Arc<Self> {
            Arc::new(Self {
                ready: AtomicBool::new(ready),
                completed: AtomicBool::new(false),
                completions: AtomicUsize::new(0),
                expirations: AtomicUsize::new(0),
            })
        }

        fn set_ready(&self) {
            self.ready.store(true, Ordering::SeqCst);
        }

        fn claim(&self) -> bool {
            self.completed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        }
    }

    #[async_trait]
    impl DelayedOperation for FlagOperation {
        async fn try_complete(&self) -> bool {
            if self.ready.load(Ordering::SeqCst) && self.claim() {
                self.completions.fetch_add(1, Ordering::SeqCst);
                return true;
            }
            false
        }

        async fn on_expiration(&self) {
            if self.claim() {
                self.expirations.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_completed(&self) -> bool {
            self.completed.load(Ordering::SeqCst)
        }
    }

    fn purgatory() -> Purgatory {
        let metrics = crate::replication::metrics::ReplicaMetrics::unregistered();
        Purgatory::new(
            "test",
            metrics.delayed_produce_pending,
            metrics.delayed_operation_timeouts,
        )
    }

    fn key(partition: i32) -> TopicPartition {
        TopicPartition::new("orders", partition)
    }

    #[tokio::test]
    async fn test_immediate_completion_skips_watch() {
        let purgatory = purgatory();
        let op = FlagOperation::new(true);
        let done = purgatory
            .try_complete_else_watch(op.clone(), vec![key(0)], Duration::from_secs(5))
            .await;
        assert!(done);
        assert_eq!(purgatory.watched(), 0);
    }

    #[tokio::test]
    async fn test_poke_completes_watched_operation() {
        let purgatory = purgatory();
        let op = FlagOperation::new(false);
        let done = purgatory
            .try_complete_else_watch(op.clone(), vec![key(0), key(1)], Duration::from_secs(5))
            .await;
        assert!(!done);
        assert_eq!(purgatory.watched(), 2);

        op.set_ready();
        assert_eq!(purgatory.check_and_complete(&key(0)).await, 1);
        assert!(op.is_completed());
        assert_eq!(op.completions.load(Ordering::SeqCst), 1);

        // The second key still holds a stale watcher until purged.
        assert_eq!(purgatory.watched(), 1);
        purgatory.purge_completed();
        assert_eq!(purgatory.watched(), 0);
    }

    #[tokio::test]
    async fn test_completion_is_idempotent_across_keys() {
        let purgatory = purgatory();
        let op = FlagOperation::new(false);
        purgatory
            .try_complete_else_watch(op.clone(), vec![key(0), key(1)], Duration::from_secs(5))
            .await;

        op.set_ready();
        purgatory.check_and_complete(&key(0)).await;
        assert_eq!(purgatory.check_and_complete(&key(1)).await, 0);
        assert_eq!(op.completions.load(Ordering::SeqCst), 1);
        assert_eq!(op.expirations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expiration_fires_once() {
        let purgatory = purgatory();
        let op = FlagOperation::new(false);
        purgatory
            .try_complete_else_watch(op.clone(), vec![key(0)], Duration::from_millis(10))
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(op.is_completed());
        assert_eq!(op.expirations.load(Ordering::SeqCst), 1);
        // A poke after expiration completes nothing.
        assert_eq!(purgatory.check_and_complete(&key(0)).await, 0);
    }

    #[tokio::test]
    async fn test_expire_all_drains_pending() {
        let purgatory = purgatory();
        let a = FlagOperation::new(false);
        let b = FlagOperation::new(false);
        purgatory
            .try_complete_else_watch(a.clone(), vec![key(0), key(1)], Duration::from_secs(30))
            .await;
        purgatory
            .try_complete_else_watch(b.clone(), vec![key(1)], Duration::from_secs(30))
            .await;

        purgatory.expire_all().await;
        assert!(a.is_completed());
        assert!(b.is_completed());
        // Each expired exactly once even though `a` watched two keys.
        assert_eq!(a.expirations.load(Ordering::SeqCst), 1);
        assert_eq!(b.expirations.load(Ordering::SeqCst), 1);
        assert_eq!(purgatory.watched(), 0);
    }
}
