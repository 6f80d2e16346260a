//! Wire-level error codes.
//!
//! This module provides the numeric error codes the replica manager stamps on
//! per-partition response slots. The richer, context-carrying error type lives
//! in [`crate::replication::error`] and maps onto these codes at the response
//! boundary via `ReplicaError::error_code()`.
//!
//! # Propagation Policy
//!
//! - **Per-partition errors** fill the individual partition slot of a
//!   response; sibling partitions are unaffected.
//! - **Global errors** (`InvalidRequiredAcks`, `StaleControllerEpoch`)
//!   short-circuit the whole request.
//! - Unclassified errors surface as [`ErrorCode::Unknown`], are logged with
//!   context, and never crash the broker. The single exception is an
//!   unrecoverable storage failure, which halts the process (see
//!   [`crate::replication::error`]).

use num_derive::FromPrimitive;

/// Per-partition and request-level error codes.
///
/// The numeric values follow the classic broker error mapping so that
/// dashboards and log-scraping tooling agree on what each code means.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
pub enum ErrorCode {
    /// An unexpected, unclassified server error.
    Unknown = -1,
    /// No error.
    #[default]
    None = 0,
    /// The requested offset is outside the range maintained by the local log.
    OffsetOutOfRange = 1,
    /// A record failed its integrity check on append.
    CorruptRecord = 2,
    /// The partition is not hosted on this broker.
    UnknownTopicOrPartition = 3,
    /// The operation required the leader replica but this broker is a
    /// follower or offline for the partition.
    NotLeaderForPartition = 6,
    /// A delayed operation expired before its completion criteria were met.
    RequestTimedOut = 7,
    /// The replica is in the assigned set but has no local state yet.
    ReplicaNotAvailable = 9,
    /// A single record exceeded the configured maximum size.
    RecordTooLarge = 10,
    /// The request originated from a superseded controller.
    StaleControllerEpoch = 11,
    /// The request targeted a superseded leader epoch.
    StaleLeaderEpoch = 13,
    /// Produce to an internal topic without the internal-allowed flag.
    InvalidTopic = 17,
    /// A record batch exceeded the configured maximum size.
    RecordBatchTooLarge = 18,
    /// Produce with acks=all while the ISR is below the configured minimum.
    NotEnoughReplicas = 19,
    /// The ISR dropped below the configured minimum after the records were
    /// already written to the leader log.
    NotEnoughReplicasAfterAppend = 20,
    /// The produce request carried an acks value outside {-1, 0, 1}.
    InvalidRequiredAcks = 21,
    /// A record carried a timestamp outside the accepted range.
    InvalidTimestamp = 32,
}

impl ErrorCode {
    /// Returns true if this code signals a failure.
    #[inline]
    pub fn is_error(self) -> bool {
        self != ErrorCode::None
    }

    /// Numeric wire value of the code.
    #[inline]
    pub fn code(self) -> i16 {
        self as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn test_default_is_none() {
        assert_eq!(ErrorCode::default(), ErrorCode::None);
        assert!(!ErrorCode::None.is_error());
    }

    #[test]
    fn test_is_error() {
        assert!(ErrorCode::Unknown.is_error());
        assert!(ErrorCode::NotLeaderForPartition.is_error());
        assert!(ErrorCode::RequestTimedOut.is_error());
    }

    #[test]
    fn test_round_trip_from_primitive() {
        for code in [
            ErrorCode::Unknown,
            ErrorCode::None,
            ErrorCode::OffsetOutOfRange,
            ErrorCode::CorruptRecord,
            ErrorCode::UnknownTopicOrPartition,
            ErrorCode::NotLeaderForPartition,
            ErrorCode::RequestTimedOut,
            ErrorCode::ReplicaNotAvailable,
            ErrorCode::RecordTooLarge,
            ErrorCode::StaleControllerEpoch,
            ErrorCode::StaleLeaderEpoch,
            ErrorCode::InvalidTopic,
            ErrorCode::RecordBatchTooLarge,
            ErrorCode::NotEnoughReplicas,
            ErrorCode::NotEnoughReplicasAfterAppend,
            ErrorCode::InvalidRequiredAcks,
            ErrorCode::InvalidTimestamp,
        ] {
            assert_eq!(ErrorCode::from_i16(code.code()), Some(code));
        }
    }
}
