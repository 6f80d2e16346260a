//! Centralized replication constants.
//!
//! This module consolidates the magic numbers used throughout the replica
//! manager. Having them in one place makes it easier to:
//!
//! - Understand the replication timing contract
//! - Update values consistently
//! - Document the rationale for each constant
//!
//! # Categories
//!
//! - **Replica identity**: sentinel replica ids carried in fetch requests
//! - **Offsets**: sentinel offset values
//! - **Cadences**: default intervals for the background jobs
//! - **Checkpoint**: on-disk high watermark checkpoint format

// =============================================================================
// Replica Identity
// =============================================================================

/// Replica id carried by ordinary consumer fetch requests.
///
/// Consumers are not replicas; their reads are capped at the high watermark
/// so they never observe uncommitted records.
pub const CONSUMER_REPLICA_ID: i32 = -1;

/// Replica id that disables the "leader only" check on the fetch path.
///
/// Intended for operational debugging (reading a follower's local log
/// directly). Reads are still capped at the high watermark.
pub const DEBUG_REPLICA_ID: i32 = -2;

// =============================================================================
// Offsets
// =============================================================================

/// Log end offset of a follower the leader has not yet heard from.
pub const UNKNOWN_OFFSET: i64 = -1;

// =============================================================================
// Background Task Cadences
// =============================================================================

/// Default maximum time a follower may lag before it is removed from the ISR.
///
/// Also the period of the `isr-expiration` background job.
pub const DEFAULT_REPLICA_LAG_TIME_MAX_MS: i64 = 10_000;

/// Period of the `isr-change-propagation` background job.
pub const ISR_CHANGE_PROPAGATION_CHECK_MS: u64 = 2_500;

/// ISR changes are not propagated while a change happened within this window.
///
/// Batches bursts of expansion/shrink into a single notification.
pub const ISR_CHANGE_BLACKOUT_MS: i64 = 5_000;

/// Upper bound on how long a recorded ISR change may wait before propagation,
/// regardless of ongoing churn.
pub const ISR_CHANGE_PROPAGATION_MAX_DELAY_MS: i64 = 60_000;

/// Default period of the `highwatermark-checkpoint` background job.
pub const DEFAULT_HIGH_WATERMARK_CHECKPOINT_INTERVAL_MS: u64 = 5_000;

/// Default backoff between follower fetch rounds that returned no data.
pub const DEFAULT_FETCH_BACKOFF_MS: u64 = 500;

/// Default maximum bytes a follower requests per partition per fetch round.
pub const DEFAULT_FOLLOWER_FETCH_MAX_BYTES: usize = 1024 * 1024;

/// Default period of the `purgatory-purge` background job that prunes
/// completed watchers from both purgatories.
pub const DEFAULT_PURGATORY_PURGE_INTERVAL_MS: u64 = 1_000;

/// Default bound on concurrent per-partition log reads in one fetch request.
pub const DEFAULT_MAX_CONCURRENT_PARTITION_READS: usize = 16;

// =============================================================================
// Checkpoint Format
// =============================================================================

/// File name of the per-data-directory high watermark checkpoint.
pub const HIGH_WATERMARK_CHECKPOINT_FILENAME: &str = "replication-offset-checkpoint";

/// Schema version written on the first line of the checkpoint file.
pub const HIGH_WATERMARK_CHECKPOINT_VERSION: i32 = 0;

// =============================================================================
// Topics
// =============================================================================

/// Prefix reserved for internal topics.
///
/// Produce requests targeting internal topics are rejected unless the request
/// explicitly allows them.
pub const INTERNAL_TOPIC_PREFIX: &str = "__";
