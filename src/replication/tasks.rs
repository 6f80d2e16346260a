//! Background task registry for the replica manager's periodic jobs.
//!
//! The replica manager runs a small set of named maintenance loops
//! (`isr-expiration`, `isr-change-propagation`, `highwatermark-checkpoint`,
//! `purgatory-purge`). Registering them centrally gives:
//!
//! - Consistent shutdown semantics (one broadcast, bounded wait, then abort)
//! - Health monitoring of all loops by name
//! - A single place where jitter policy lives

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Task is currently running.
    Running,
    /// Task returned on its own.
    Completed,
}

/// Add +/- 15% pseudo-random jitter to a base interval.
///
/// Prevents every broker in a cluster from checkpointing or propagating at
/// exactly the same instant after a synchronized restart.
pub fn with_jitter(base: Duration) -> Duration {
    let jitter_factor = 0.85 + fastrand::f64() * 0.30;
    Duration::from_secs_f64(base.as_secs_f64() * jitter_factor)
}

struct TaskInfo {
    handle: JoinHandle<()>,
    spawned_at: std::time::Instant,
}

/// Registry of named background tasks.
pub struct TaskRegistry {
    tasks: HashMap<&'static str, TaskInfo>,
    shutdown_tx: broadcast::Sender<()>,
    shutting_down: bool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: HashMap::new(),
            shutdown_tx,
            shutting_down: false,
        }
    }

    /// Spawn a named background task.
    ///
    /// The future is raced against the registry's shutdown signal; it does
    /// not need its own shutdown handling. Spawning a name twice aborts the
    /// previous instance.
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutting_down {
            warn!(task = name, "ignoring spawn during shutdown");
            return;
        }
        if let Some(old_info) = self.tasks.remove(name) {
            old_info.handle.abort();
            debug!(task = name, "aborted previous task instance");
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = task => {
                    debug!(task = name, "task completed");
                }
                _ = shutdown_rx.recv() => {
                    debug!(task = name, "task received shutdown signal");
                }
            }
        });

        info!(task = name, "spawned background task");
        self.tasks.insert(
            name,
            TaskInfo {
                handle,
                spawned_at: std::time::Instant::now(),
            },
        );
    }

    /// Spawn a periodic task.
    ///
    /// With `jitter` set, each wait is re-drawn around `interval` so brokers
    /// spread out; without it the cadence is fixed.
    pub fn spawn_periodic<F, Fut>(
        &mut self,
        name: &'static str,
        interval: Duration,
        jitter: bool,
        mut task: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn(name, async move {
            loop {
                let wait = if jitter { with_jitter(interval) } else { interval };
                tokio::time::sleep(wait).await;
                task().await;
            }
        });
    }

    /// Get the status of all tasks as (name, status) pairs.
    pub fn health_check(&self) -> Vec<(&'static str, TaskStatus)> {
        self.tasks
            .iter()
            .map(|(name, info)| {
                let status = if info.handle.is_finished() {
                    TaskStatus::Completed
                } else {
                    TaskStatus::Running
                };
                (*name, status)
            })
            .collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn running_count(&self) -> usize {
        self.tasks
            .values()
            .filter(|info| !info.handle.is_finished())
            .count()
    }

    /// Uptime of a specific task.
    pub fn task_uptime(&self, name: &str) -> Option<Duration> {
        self.tasks.get(name).map(|info| info.spawned_at.elapsed())
    }

    /// Shutdown all tasks: signal, wait up to `timeout`, abort stragglers.
    pub async fn shutdown_all(&mut self, timeout: Duration) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        info!(task_count = self.tasks.len(), "shutting down background tasks");
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, info) in self.tasks.drain() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(task = name, "aborting task, shutdown timeout exceeded");
                info.handle.abort();
                continue;
            }
            match tokio::time::timeout(remaining, info.handle).await {
                Ok(Ok(())) => debug!(task = name, "task shutdown complete"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task panicked during shutdown"),
                Err(_) => warn!(task = name, "task did not stop in time"),
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_jitter_stays_within_band() {
        let base = Duration::from_secs(10);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_secs_f64(8.5));
            assert!(jittered <= Duration::from_secs_f64(11.5));
        }
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        let mut registry = TaskRegistry::new();
        registry.spawn("forever", async {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        assert_eq!(registry.task_count(), 1);
        assert_eq!(registry.running_count(), 1);
        assert!(registry.task_uptime("forever").is_some());

        registry.shutdown_all(Duration::from_secs(1)).await;
        assert_eq!(registry.task_count(), 0);
    }

    #[tokio::test]
    async fn test_periodic_task_ticks() {
        let ticks = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&ticks);

        let mut registry = TaskRegistry::new();
        registry.spawn_periodic("ticker", Duration::from_millis(5), false, move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.shutdown_all(Duration::from_secs(1)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_respawn_replaces_previous_instance() {
        let mut registry = TaskRegistry::new();
        registry.spawn("job", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        registry.spawn("job", async {});
        assert_eq!(registry.task_count(), 1);
        registry.shutdown_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_ignored() {
        let mut registry = TaskRegistry::new();
        registry.shutdown_all(Duration::from_secs(1)).await;
        registry.spawn("late", async {});
        assert_eq!(registry.task_count(), 0);
    }
}
