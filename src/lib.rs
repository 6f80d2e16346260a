//! # Replicant
//! Replica manager core for a distributed, partitioned, append-only log
//! broker.
//!
//! This crate implements the leader/follower replication heart of a log
//! broker: partition ownership, produce and fetch routing to leader replicas,
//! controller-driven role transitions, in-sync replica (ISR) maintenance,
//! high watermark advancement and checkpointing, and delayed
//! (awaiting-quorum) produce and fetch semantics. This is pure Rust all the
//! way down; meaning memory safety, safe concurrency, low resource usage,
//! and speed.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/)
//! - Keep the surrounding systems swappable: the segmented log engine, the
//!   coordination store, and the socket layer all sit behind narrow traits
//! - Be a building block for log-broker services
//!
//! ## Getting started
//!
//! The [`ReplicaManager`](replication::ReplicaManager) is built against your
//! log engine, coordination store and peer-broker transport:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use replicant::replication::{ReplicaConfig, ReplicaManager};
//! # use replicant::replication::{LogManager, CoordinationStore, EndpointProvider};
//! # async fn example(
//! #     log_manager: Arc<dyn LogManager>,
//! #     coordination: Arc<dyn CoordinationStore>,
//! #     endpoints: Arc<dyn EndpointProvider>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ReplicaManager::builder(ReplicaConfig::from_env()?)
//!     .log_manager(log_manager)
//!     .coordination(coordination)
//!     .endpoints(endpoints)
//!     .build()
//!     .await?;
//!
//! // Wire produce/fetch handlers and controller commands to `manager`.
//! # Ok(())
//! # }
//! ```
//!
//! The `test-utilities` feature ships an in-memory log engine, a mock
//! coordination store and a manual clock for driving the whole subsystem in
//! tests.

#![forbid(unsafe_code)]

pub mod constants;
pub mod error;
pub mod replication;
pub mod telemetry;

pub mod prelude {
    //! Main exports for building a broker on top of the replica manager.

    pub use crate::error::ErrorCode;
    pub use crate::replication::{
        Clock, CoordinationStore, EndpointProvider, LeaderEndpoint, Log, LogManager,
        PartitionFetchInfo, PartitionRecords, RecordBatch, ReplicaConfig, ReplicaManager,
        TopicPartition,
    };
    pub use crate::telemetry::{LogFormat, init_logging};
}
