//! Replica manager core for a partitioned, append-only log broker.
//!
//! This module owns the set of topic-partitions hosted on one broker, routes
//! produce and fetch requests to leader replicas, applies leader/follower
//! commands from the cluster controller, maintains the in-sync replica set
//! of every led partition, and advances and checkpoints the high watermark.
//!
//! # Architecture
//!
//! ```text
//!            ┌────────────┐   ┌────────────┐   ┌────────────┐
//!            │  Producers │   │ Consumers  │   │ Controller │
//!            └─────┬──────┘   └─────┬──────┘   └─────┬──────┘
//!                  │ produce        │ fetch          │ LeaderAndIsr /
//!                  ▼                ▼                ▼ StopReplica
//!            ┌─────────────────────────────────────────────┐
//!            │                ReplicaManager               │
//!            │  partitions: TopicPartition -> Partition    │
//!            │  produce purgatory │ fetch purgatory        │
//!            └───┬───────────────────────┬────────────┬────┘
//!                ▼                       ▼            ▼
//!          ┌───────────┐          ┌────────────┐ ┌───────────┐
//!          │ Partition │─────────▶│ Log engine │ │  Fetcher  │──▶ peer
//!          │ ISR / HW  │          │  (traits)  │ │  manager  │   brokers
//!          └─────┬─────┘          └────────────┘ └───────────┘
//!                ▼
//!          ┌──────────────┐        ┌─────────────────┐
//!          │ Coordination │        │ HW checkpoints  │
//!          │    store     │        │ (per data dir)  │
//!          └──────────────┘        └─────────────────┘
//! ```
//!
//! Delayed produce (acks=all) and delayed fetch (min-bytes) operations park
//! in the purgatories and complete on replication progress or timeout.
//! Background jobs shrink lagging ISRs, batch ISR-change propagation to the
//! coordination store, and checkpoint high watermarks per data directory.

mod checkpoint;
mod clock;
mod commands;
mod config;
mod coordination;
mod delayed_fetch;
mod delayed_produce;
mod error;
mod fetcher;
mod log;
mod manager;
mod metrics;
mod partition;
mod partition_state;
mod purgatory;
mod replica;
mod tasks;
mod topic_partition;

#[cfg(any(test, feature = "test-utilities"))]
mod memory_log;
#[cfg(any(test, feature = "test-utilities"))]
mod mock_coordination;

use std::sync::Arc;

use dashmap::DashMap;

pub use checkpoint::CheckpointFile;
pub use clock::{Clock, SystemClock};
pub use commands::{
    BrokerEndpoint, FetchPartitionResponse, FetchResponse, LeaderAndIsrRequest,
    LeaderAndIsrResponse, PartitionFetchInfo, PartitionRecords, PartitionStateData,
    ProducePartitionResponse, ProduceResponse, StopReplicaRequest, StopReplicaResponse,
    UpdateMetadataRequest,
};
pub use config::{ConfigError, ReplicaConfig};
pub use coordination::{
    CoordinationError, CoordinationResult, CoordinationStore, IsrChangeLog, LeaderAndIsr,
};
pub use error::{ReplicaError, ReplicaResult, halt_on_storage_error};
pub use fetcher::{EndpointProvider, FetcherManager, LeaderEndpoint};
pub use log::{
    Log, LogAppendInfo, LogError, LogManager, LogReadInfo, LogResult, RecordBatch, SequencedBatch,
};
pub use manager::{LeadershipListener, ReplicaManager, ReplicaManagerBuilder};
pub use metrics::{REGISTRY, ReplicaMetrics};
pub use partition::{FollowerUpdateOutcome, Partition, PartitionContext, PartitionReadInfo};
pub use partition_state::PartitionMode;
pub use purgatory::{DelayedOperation, Purgatory};
pub use replica::ReplicaView;
pub use tasks::{TaskRegistry, TaskStatus, with_jitter};
pub use topic_partition::TopicPartition;

#[cfg(any(test, feature = "test-utilities"))]
pub use clock::ManualClock;
#[cfg(any(test, feature = "test-utilities"))]
pub use fetcher::StaticEndpointProvider;
#[cfg(any(test, feature = "test-utilities"))]
pub use memory_log::{MemoryLog, MemoryLogConfig, MemoryLogManager};
#[cfg(any(test, feature = "test-utilities"))]
pub use mock_coordination::MockCoordinationStore;

/// Shared partition table: the one map every component indexes into.
pub(crate) type PartitionMap = Arc<DashMap<TopicPartition, Arc<Partition>>>;
