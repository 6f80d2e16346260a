//! Partition role state machine.
//!
//! A partition hosted on this broker is in exactly one mode at any time:
//! - Offline: no local replica, or the leader is unknown
//! - Leader: the local replica is the leader; produce lands here
//! - Follower: some remote broker leads; a fetch loop replicates from it
//!
//! # State Transitions
//!
//! ```text
//! Offline -> Leader     (controller names this broker leader)
//! Offline -> Follower   (controller names a remote leader)
//! Leader  -> Follower   (demotion: fetchers stopped, log truncated)
//! Follower -> Leader    (promotion: fetcher removed, ISR/HW reinitialised)
//! any     -> Offline    (stop-replica without delete)
//! ```
//!
//! Stop-replica with delete removes the partition entirely rather than
//! transitioning it.

/// Role of the local replica for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartitionMode {
    /// No local role; requests answered with `NotLeaderForPartition`.
    #[default]
    Offline,

    /// The local replica leads; it owns the ISR and the high watermark.
    Leader,

    /// A remote broker leads; the local log tails it.
    Follower {
        /// Broker id of the current leader.
        leader: i32,
    },
}

impl PartitionMode {
    /// Check if the local replica is the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, PartitionMode::Leader)
    }

    /// Check if the local replica follows a remote leader.
    pub fn is_follower(&self) -> bool {
        matches!(self, PartitionMode::Follower { .. })
    }

    /// The leader broker this partition follows, if in follower mode.
    pub fn followed_leader(&self) -> Option<i32> {
        match self {
            PartitionMode::Follower { leader } => Some(*leader),
            _ => None,
        }
    }

    /// Get a human-readable mode name.
    pub fn mode_name(&self) -> &'static str {
        match self {
            PartitionMode::Offline => "offline",
            PartitionMode::Leader => "leader",
            PartitionMode::Follower { .. } => "follower",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_offline() {
        let mode = PartitionMode::default();
        assert!(!mode.is_leader());
        assert!(!mode.is_follower());
        assert_eq!(mode.followed_leader(), None);
        assert_eq!(mode.mode_name(), "offline");
    }

    #[test]
    fn test_leader_mode() {
        let mode = PartitionMode::Leader;
        assert!(mode.is_leader());
        assert!(!mode.is_follower());
        assert_eq!(mode.followed_leader(), None);
        assert_eq!(mode.mode_name(), "leader");
    }

    #[test]
    fn test_follower_mode() {
        let mode = PartitionMode::Follower { leader: 2 };
        assert!(!mode.is_leader());
        assert!(mode.is_follower());
        assert_eq!(mode.followed_leader(), Some(2));
        assert_eq!(mode.mode_name(), "follower");
    }
}
