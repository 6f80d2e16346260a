//! Request and response payloads consumed by the replica manager.
//!
//! The socket layer decodes wire requests into these structs; the replica
//! manager never touches raw frames. Controller-originated commands
//! (`LeaderAndIsr`, `StopReplica`, `UpdateMetadata`) carry the controller
//! epoch that guards them; client-facing entry points (produce, fetch) carry
//! per-partition payloads.

use std::collections::HashMap;

use crate::error::ErrorCode;

use super::log::{RecordBatch, SequencedBatch};
use super::topic_partition::TopicPartition;

// =============================================================================
// Controller commands
// =============================================================================

/// Desired state of one partition, as decided by the controller.
#[derive(Debug, Clone)]
pub struct PartitionStateData {
    pub tp: TopicPartition,
    /// Controller epoch of the decision.
    pub controller_epoch: i32,
    /// Broker id of the designated leader.
    pub leader: i32,
    /// Leader epoch stamped on this leadership decision.
    pub leader_epoch: i32,
    /// In-sync replica set.
    pub isr: Vec<i32>,
    /// Full assigned replica set.
    pub replicas: Vec<i32>,
    /// Coordination-store version the controller last observed.
    pub version: i32,
}

/// Controller command flipping partitions between leader and follower roles.
#[derive(Debug, Clone)]
pub struct LeaderAndIsrRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    pub partition_states: Vec<PartitionStateData>,
}

/// Per-partition outcome of a [`LeaderAndIsrRequest`].
#[derive(Debug, Clone, Default)]
pub struct LeaderAndIsrResponse {
    /// Global error; when set, `partitions` is empty and no state changed.
    pub error: ErrorCode,
    pub partitions: HashMap<TopicPartition, ErrorCode>,
}

/// Controller command stopping local replicas, optionally deleting their logs.
#[derive(Debug, Clone)]
pub struct StopReplicaRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    /// When true, partitions are removed and their logs deleted; when false,
    /// they transition to offline but remain hosted.
    pub delete_partitions: bool,
    pub partitions: Vec<TopicPartition>,
}

/// Per-partition outcome of a [`StopReplicaRequest`].
#[derive(Debug, Clone, Default)]
pub struct StopReplicaResponse {
    pub error: ErrorCode,
    pub partitions: HashMap<TopicPartition, ErrorCode>,
}

/// A broker endpoint advertised through metadata updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub broker_id: i32,
    pub host: String,
    pub port: u16,
}

/// Controller command refreshing the local view of cluster metadata.
#[derive(Debug, Clone)]
pub struct UpdateMetadataRequest {
    pub controller_id: i32,
    pub controller_epoch: i32,
    /// Brokers currently considered alive by the controller.
    pub live_brokers: Vec<BrokerEndpoint>,
}

// =============================================================================
// Produce
// =============================================================================

/// Records destined for one partition of a produce request.
#[derive(Debug, Clone)]
pub struct PartitionRecords {
    pub tp: TopicPartition,
    pub batch: RecordBatch,
}

/// Outcome of a produce request for one partition.
#[derive(Debug, Clone, Copy)]
pub struct ProducePartitionResponse {
    pub error: ErrorCode,
    /// Offset assigned to the first record, or -1 on error.
    pub base_offset: i64,
    /// Append timestamp recorded by the log, or -1 on error.
    pub log_append_time_ms: i64,
}

impl ProducePartitionResponse {
    pub fn error(code: ErrorCode) -> Self {
        Self {
            error: code,
            base_offset: -1,
            log_append_time_ms: -1,
        }
    }
}

/// Full produce response, one entry per requested partition.
#[derive(Debug, Clone, Default)]
pub struct ProduceResponse {
    pub partitions: Vec<(TopicPartition, ProducePartitionResponse)>,
}

// =============================================================================
// Fetch
// =============================================================================

/// Per-partition parameters of a fetch request.
#[derive(Debug, Clone, Copy)]
pub struct PartitionFetchInfo {
    /// First offset to fetch.
    pub offset: i64,
    /// Maximum bytes to return for this partition.
    pub max_bytes: usize,
}

/// Outcome of a fetch request for one partition.
#[derive(Debug, Clone)]
pub struct FetchPartitionResponse {
    pub error: ErrorCode,
    /// Leader high watermark at read time; mirrors commit progress to
    /// followers and consumers.
    pub high_watermark: i64,
    /// Batches read, in log order.
    pub records: Vec<SequencedBatch>,
}

impl FetchPartitionResponse {
    pub fn error(code: ErrorCode) -> Self {
        Self {
            error: code,
            high_watermark: -1,
            records: Vec::new(),
        }
    }

    /// Total payload bytes across `records`.
    pub fn size_bytes(&self) -> usize {
        self.records.iter().map(|sb| sb.batch.size_bytes()).sum()
    }
}

/// Full fetch response, one entry per requested partition.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub partitions: Vec<(TopicPartition, FetchPartitionResponse)>,
}

impl FetchResponse {
    /// Total payload bytes across all partitions.
    pub fn size_bytes(&self) -> usize {
        self.partitions.iter().map(|(_, p)| p.size_bytes()).sum()
    }
}
