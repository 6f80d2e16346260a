//! Replica manager error taxonomy.
//!
//! # Error Handling Patterns
//!
//! Two patterns, chosen by operation criticality:
//!
//! ## Per-partition (classify and continue)
//!
//! Request-path failures are values: each partition slot of a response gets
//! the [`ErrorCode`] its [`ReplicaError`] maps to, and sibling partitions are
//! unaffected. Unclassified errors become [`ErrorCode::Unknown`], get logged
//! with context and counted, and never take the broker down.
//!
//! ## Fatal (halt the process)
//!
//! An unrecoverable I/O failure on a local log or the high watermark
//! checkpoint means the broker can no longer durably record what is
//! committed. Serving on would expose uncommitted offsets as committed after
//! a restart, so the process halts instead (see [`halt_on_storage_error`]).

use thiserror::Error;
use tracing::error;

use crate::error::ErrorCode;

use super::coordination::CoordinationError;
use super::log::LogError;
use super::topic_partition::TopicPartition;

/// Result type for replica manager operations.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors raised by the replica manager.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// The partition is not hosted on this broker.
    #[error("unknown topic or partition {0}")]
    UnknownTopicOrPartition(TopicPartition),

    /// The operation required the leader but this broker is a follower or
    /// offline for the partition.
    #[error("broker {broker} is not the leader for {tp}")]
    NotLeader { tp: TopicPartition, broker: i32 },

    /// The replica is assigned but carries no local state yet.
    #[error("replica {broker} not available for {tp}")]
    ReplicaNotAvailable { tp: TopicPartition, broker: i32 },

    /// The request originated from a superseded controller.
    #[error("stale controller epoch {received}, current epoch {current}")]
    StaleControllerEpoch { received: i32, current: i32 },

    /// The request targeted a superseded leader epoch.
    #[error("stale leader epoch {received} for {tp}, current epoch {current}")]
    StaleLeaderEpoch {
        tp: TopicPartition,
        received: i32,
        current: i32,
    },

    /// The produce request carried an acks value outside {-1, 0, 1}.
    #[error("invalid required acks {0}")]
    InvalidRequiredAcks(i16),

    /// Produce to an internal topic without the internal-allowed flag.
    #[error("topic {0} is internal")]
    InvalidTopic(String),

    /// Produce with acks=all while the ISR is below the configured minimum.
    #[error("{tp} has in-sync size {isr_size}, below the required minimum {min_in_sync}")]
    NotEnoughReplicas {
        tp: TopicPartition,
        isr_size: usize,
        min_in_sync: usize,
    },

    /// A peer broker could not be reached for replication.
    #[error("peer broker {broker} unreachable: {reason}")]
    PeerUnavailable { broker: i32, reason: String },

    /// The replica manager was built with an invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Classified failure from the log engine.
    #[error(transparent)]
    Log(#[from] LogError),

    /// Failure talking to the coordination store.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl ReplicaError {
    /// Map onto the wire code stamped into response slots.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ReplicaError::UnknownTopicOrPartition(_) => ErrorCode::UnknownTopicOrPartition,
            ReplicaError::NotLeader { .. } => ErrorCode::NotLeaderForPartition,
            ReplicaError::ReplicaNotAvailable { .. } => ErrorCode::ReplicaNotAvailable,
            ReplicaError::StaleControllerEpoch { .. } => ErrorCode::StaleControllerEpoch,
            ReplicaError::StaleLeaderEpoch { .. } => ErrorCode::StaleLeaderEpoch,
            ReplicaError::InvalidRequiredAcks(_) => ErrorCode::InvalidRequiredAcks,
            ReplicaError::InvalidTopic(_) => ErrorCode::InvalidTopic,
            ReplicaError::NotEnoughReplicas { .. } => ErrorCode::NotEnoughReplicas,
            ReplicaError::PeerUnavailable { .. } => ErrorCode::Unknown,
            ReplicaError::Config(_) => ErrorCode::Unknown,
            ReplicaError::Log(log_error) => match log_error {
                LogError::RecordTooLarge { .. } => ErrorCode::RecordTooLarge,
                LogError::BatchTooLarge { .. } => ErrorCode::RecordBatchTooLarge,
                LogError::Corrupt(_) => ErrorCode::CorruptRecord,
                LogError::InvalidTimestamp { .. } => ErrorCode::InvalidTimestamp,
                LogError::OffsetOutOfRange { .. } => ErrorCode::OffsetOutOfRange,
                LogError::Io(_) => ErrorCode::Unknown,
            },
            ReplicaError::Coordination(_) => ErrorCode::Unknown,
        }
    }

    /// True for failures the broker must not survive.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicaError::Log(LogError::Io(_)))
    }
}

/// Halt the process on an unrecoverable storage failure.
///
/// A broker that cannot durably record replication state must not keep
/// serving: after a restart it would expose uncommitted offsets as committed.
pub fn halt_on_storage_error(context: &str, error: &dyn std::error::Error) -> ! {
    error!(%context, %error, "unrecoverable storage failure, halting broker");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let tp = TopicPartition::new("orders", 0);
        assert_eq!(
            ReplicaError::UnknownTopicOrPartition(tp.clone()).error_code(),
            ErrorCode::UnknownTopicOrPartition
        );
        assert_eq!(
            ReplicaError::NotLeader {
                tp: tp.clone(),
                broker: 1
            }
            .error_code(),
            ErrorCode::NotLeaderForPartition
        );
        assert_eq!(
            ReplicaError::InvalidRequiredAcks(3).error_code(),
            ErrorCode::InvalidRequiredAcks
        );
        assert_eq!(
            ReplicaError::NotEnoughReplicas {
                tp,
                isr_size: 1,
                min_in_sync: 2
            }
            .error_code(),
            ErrorCode::NotEnoughReplicas
        );
    }

    #[test]
    fn test_log_error_classification() {
        assert_eq!(
            ReplicaError::from(LogError::RecordTooLarge { size: 9, limit: 1 }).error_code(),
            ErrorCode::RecordTooLarge
        );
        assert_eq!(
            ReplicaError::from(LogError::BatchTooLarge { size: 9, limit: 1 }).error_code(),
            ErrorCode::RecordBatchTooLarge
        );
        assert_eq!(
            ReplicaError::from(LogError::Corrupt("bad crc".into())).error_code(),
            ErrorCode::CorruptRecord
        );
        assert_eq!(
            ReplicaError::from(LogError::OffsetOutOfRange {
                offset: 9,
                start: 0,
                end: 4
            })
            .error_code(),
            ErrorCode::OffsetOutOfRange
        );
    }

    #[test]
    fn test_only_io_is_fatal() {
        let io = ReplicaError::from(LogError::Io(std::io::Error::other("disk gone")));
        assert!(io.is_fatal());
        assert!(!ReplicaError::InvalidRequiredAcks(2).is_fatal());
        assert!(!ReplicaError::from(LogError::Corrupt("x".into())).is_fatal());
    }
}
