//! Replica manager configuration.
//!
//! All timing knobs default to the values in [`crate::constants`] and can be
//! overridden programmatically or from the environment:
//!
//! ```rust,no_run
//! use replicant::replication::ReplicaConfig;
//!
//! let config = ReplicaConfig::from_env().expect("invalid configuration");
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `REPLICANT_BROKER_ID` | `broker_id` |
//! | `REPLICANT_MIN_IN_SYNC_REPLICAS` | `min_in_sync_replicas` |
//! | `REPLICANT_REPLICA_LAG_TIME_MAX_MS` | `replica_lag_time_max_ms` |
//! | `REPLICANT_HW_CHECKPOINT_INTERVAL_MS` | `high_watermark_checkpoint_interval_ms` |
//! | `REPLICANT_FETCH_BACKOFF_MS` | `fetch_backoff_ms` |

use thiserror::Error;

use crate::constants::{
    DEFAULT_FETCH_BACKOFF_MS, DEFAULT_FOLLOWER_FETCH_MAX_BYTES,
    DEFAULT_HIGH_WATERMARK_CHECKPOINT_INTERVAL_MS, DEFAULT_MAX_CONCURRENT_PARTITION_READS,
    DEFAULT_PURGATORY_PURGE_INTERVAL_MS, DEFAULT_REPLICA_LAG_TIME_MAX_MS,
    ISR_CHANGE_BLACKOUT_MS, ISR_CHANGE_PROPAGATION_CHECK_MS, ISR_CHANGE_PROPAGATION_MAX_DELAY_MS,
};

/// Error raised for invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

/// Configuration of one broker's replica manager.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This broker's id.
    pub broker_id: i32,

    /// Minimum ISR size required to accept acks=all produce requests.
    pub min_in_sync_replicas: usize,

    /// Maximum time a follower may lag before ISR removal; also the period
    /// of the `isr-expiration` job.
    pub replica_lag_time_max_ms: i64,

    /// Period of the `isr-change-propagation` job.
    pub isr_propagation_check_ms: u64,

    /// Propagation is suppressed while a change happened within this window.
    pub isr_change_blackout_ms: i64,

    /// Changes are propagated at the latest this long after being recorded.
    pub isr_propagation_max_delay_ms: i64,

    /// Period of the `highwatermark-checkpoint` job.
    pub high_watermark_checkpoint_interval_ms: u64,

    /// Backoff between follower fetch rounds that returned no data.
    pub fetch_backoff_ms: u64,

    /// Maximum bytes a follower requests per partition per fetch round.
    pub follower_fetch_max_bytes: usize,

    /// Period of the `purgatory-purge` job.
    pub purgatory_purge_interval_ms: u64,

    /// Bound on concurrent per-partition log reads in one fetch request.
    pub max_concurrent_partition_reads: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            broker_id: 0,
            min_in_sync_replicas: 1,
            replica_lag_time_max_ms: DEFAULT_REPLICA_LAG_TIME_MAX_MS,
            isr_propagation_check_ms: ISR_CHANGE_PROPAGATION_CHECK_MS,
            isr_change_blackout_ms: ISR_CHANGE_BLACKOUT_MS,
            isr_propagation_max_delay_ms: ISR_CHANGE_PROPAGATION_MAX_DELAY_MS,
            high_watermark_checkpoint_interval_ms: DEFAULT_HIGH_WATERMARK_CHECKPOINT_INTERVAL_MS,
            fetch_backoff_ms: DEFAULT_FETCH_BACKOFF_MS,
            follower_fetch_max_bytes: DEFAULT_FOLLOWER_FETCH_MAX_BYTES,
            purgatory_purge_interval_ms: DEFAULT_PURGATORY_PURGE_INTERVAL_MS,
            max_concurrent_partition_reads: DEFAULT_MAX_CONCURRENT_PARTITION_READS,
        }
    }
}

impl ReplicaConfig {
    /// Default configuration for the given broker id.
    pub fn new(broker_id: i32) -> Self {
        Self {
            broker_id,
            ..Default::default()
        }
    }

    /// Build from `REPLICANT_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse("REPLICANT_BROKER_ID")? {
            config.broker_id = v;
        }
        if let Some(v) = env_parse("REPLICANT_MIN_IN_SYNC_REPLICAS")? {
            config.min_in_sync_replicas = v;
        }
        if let Some(v) = env_parse("REPLICANT_REPLICA_LAG_TIME_MAX_MS")? {
            config.replica_lag_time_max_ms = v;
        }
        if let Some(v) = env_parse("REPLICANT_HW_CHECKPOINT_INTERVAL_MS")? {
            config.high_watermark_checkpoint_interval_ms = v;
        }
        if let Some(v) = env_parse("REPLICANT_FETCH_BACKOFF_MS")? {
            config.fetch_backoff_ms = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_in_sync_replicas == 0 {
            return Err(ConfigError::Invalid {
                field: "min_in_sync_replicas",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.replica_lag_time_max_ms <= 0 {
            return Err(ConfigError::Invalid {
                field: "replica_lag_time_max_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.isr_change_blackout_ms >= self.isr_propagation_max_delay_ms {
            return Err(ConfigError::Invalid {
                field: "isr_change_blackout_ms",
                reason: format!(
                    "blackout {}ms must be below the forced propagation delay {}ms",
                    self.isr_change_blackout_ms, self.isr_propagation_max_delay_ms
                ),
            });
        }
        if self.max_concurrent_partition_reads == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent_partition_reads",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map(Some).map_err(|_| ConfigError::Invalid {
            field: name,
            reason: format!("unparseable value {raw:?}"),
        }),
        Err(_) => Ok(None),
    }
}
