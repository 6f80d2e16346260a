//! Leader-side view of a follower replica.

use crate::constants::UNKNOWN_OFFSET;

/// What the leader knows about one follower of a partition.
///
/// The follower's log end offset is learned from its fetch requests: a fetch
/// at offset `f` proves the follower holds everything before `f`.
#[derive(Debug, Clone, Copy)]
pub struct ReplicaView {
    /// Broker id of the follower.
    pub broker_id: i32,
    /// Follower's log end offset, or [`UNKNOWN_OFFSET`] before its first
    /// fetch under the current leader epoch.
    pub log_end_offset: i64,
    /// Wall-clock time at which this follower last had its log end offset at
    /// or beyond the leader's log end offset at fetch-arrival time.
    pub last_caught_up_ms: i64,
}

impl ReplicaView {
    /// Fresh view of a follower the leader has not heard from.
    pub fn new(broker_id: i32) -> Self {
        Self {
            broker_id,
            log_end_offset: UNKNOWN_OFFSET,
            last_caught_up_ms: 0,
        }
    }

    /// Record a follower fetch at `log_end_offset`, marking it caught up iff
    /// it reached the leader's log end offset observed when the fetch
    /// arrived.
    pub fn update_fetch_state(
        &mut self,
        log_end_offset: i64,
        leader_log_end_at_fetch: i64,
        now_ms: i64,
    ) {
        self.log_end_offset = log_end_offset;
        if log_end_offset >= leader_log_end_at_fetch {
            self.last_caught_up_ms = now_ms;
        }
    }

    /// Milliseconds since this follower was last caught up.
    pub fn lag_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_caught_up_ms
    }
}
