//! # topology-coordinator
//!
//! Cluster coordination for a distributed topology runtime.
//!
//! Workers cooperate only through a shared [`CoordinationStorage`]: there is
//! no worker-to-worker RPC. Every worker process runs one
//! [`TopologyCoordinator`], which in turn runs one [`TopologyLeader`]:
//!
//! - the leader loop elects a single leader through the storage, frees the
//!   topologies of dead workers, assigns unassigned topologies with the
//!   [`LoadBalancer`] and periodically rebalances;
//! - the coordinator loop keeps the worker registered and pinging, executes
//!   the commands found in the worker's mailbox through the host's
//!   [`TopologyCoordinatorClient`] and self-heals the worker record.
//!
//! Convergence is best effort: every step is a read followed by separate
//! writes, and the periodic loops repair whatever a race left behind.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use topology_coordinator::{
//!   ClientError, CoordinationConfig, CoordinationStorage, InMemoryStorage, TopologyCoordinator,
//!   TopologyCoordinatorClient,
//! };
//!
//! struct Runtime;
//!
//! #[async_trait::async_trait]
//! impl TopologyCoordinatorClient for Runtime {
//!   async fn start_topology(&self, _uuid: &str, _config: &serde_json::Value) -> Result<(), ClientError> { Ok(()) }
//!   async fn stop_topology(&self, _uuid: &str) -> Result<(), ClientError> { Ok(()) }
//!   async fn kill_topology(&self, _uuid: &str) -> Result<(), ClientError> { Ok(()) }
//!   async fn resolve_topology_mismatches(&self, _running: &[String]) -> Result<(), ClientError> { Ok(()) }
//!   async fn shutdown(&self) -> Result<(), ClientError> { Ok(()) }
//!   fn exit(&self, code: i32) { std::process::exit(code) }
//! }
//!
//! # async fn demo() -> topology_coordinator::Result<()> {
//! let storage: Arc<dyn CoordinationStorage> = Arc::new(InMemoryStorage::new());
//! let coordinator = Arc::new(TopologyCoordinator::new(
//!   "worker-1",
//!   storage,
//!   Arc::new(Runtime),
//!   CoordinationConfig::default(),
//! )?);
//! let handle = coordinator.run();
//! // ...
//! coordinator.shutdown().await;
//! handle.await.ok();
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Tunable intervals and thresholds.
pub mod config;
/// Per-worker coordination loop and the host runtime contract.
pub mod coordinator;
/// Error types.
pub mod error;
/// Leader election and global reconciliation.
pub mod leader;
/// Loop start/stop bookkeeping.
pub mod lifecycle;
/// Topology placement and rebalance planning.
pub mod load_balancer;
/// Mailbox messages and typed commands.
pub mod message;
/// Worker and topology records.
pub mod model;
/// Coordination storage contract and the in-memory backend.
pub mod storage;

pub use config::CoordinationConfig;
pub use coordinator::{TopologyCoordinator, TopologyCoordinatorClient};
pub use error::{ClientError, CoordinationError, Result, StorageError};
pub use leader::TopologyLeader;
pub use lifecycle::LoopState;
pub use load_balancer::{LoadBalancer, RebalanceChange, RebalancePlan, RebalanceTopology, WorkerLoad};
pub use message::{Command, StopRequest, StoredMessage};
pub use model::{
  LeadershipStatus, TopologyRecord, TopologyStatus, WorkerLStatus, WorkerRecord, WorkerStatus,
};
pub use storage::{CoordinationStorage, InMemoryStorage};

#[cfg(test)]
mod load_balancer_test;
