//! Coordination storage contract.
//!
//! The storage backend is the single source of truth for worker and topology
//! records and carries a mailbox per worker. Workers never talk to each other
//! directly; everything goes through an implementation of
//! [`CoordinationStorage`].
//!
//! Calls are point-in-time reads and separate writes. Only leader candidacy
//! needs an atomic primitive: [`announce_leader_candidacy`] followed by
//! [`check_leader_candidacy`] must behave as a claim-if-vacant, so that exactly
//! one announcer wins per cycle. A backend that cannot provide this (e.g. one
//! built on eventually-consistent writes only) weakens leader uniqueness to
//! best effort; the leader loop tolerates overlapping leaders but does not
//! prevent them.
//!
//! [`announce_leader_candidacy`]: CoordinationStorage::announce_leader_candidacy
//! [`check_leader_candidacy`]: CoordinationStorage::check_leader_candidacy

pub mod memory;

use crate::error::StorageError;
use crate::message::{Command, StoredMessage};
use crate::model::{TopologyRecord, TopologyStatus, WorkerLStatus, WorkerRecord, WorkerStatus};
use std::time::Duration;

pub use memory::InMemoryStorage;

/// Storage backend shared by all workers of a cluster.
#[async_trait::async_trait]
pub trait CoordinationStorage: Send + Sync {
  /// Creates the worker record, or revives an existing one (alive, fresh ping).
  async fn register_worker(&self, name: &str) -> Result<(), StorageError>;

  /// Refreshes the worker's ping timestamp.
  async fn ping_worker(&self, name: &str) -> Result<(), StorageError>;

  /// Returns all worker records.
  async fn get_worker_status(&self) -> Result<Vec<WorkerRecord>, StorageError>;

  /// Sets a worker's liveness status.
  async fn set_worker_status(&self, name: &str, status: WorkerStatus)
  -> Result<(), StorageError>;

  /// Sets a worker's leadership flag.
  async fn set_worker_lstatus(
    &self,
    name: &str,
    lstatus: WorkerLStatus,
  ) -> Result<(), StorageError>;

  /// Announces that `name` wants to become leader.
  async fn announce_leader_candidacy(&self, name: &str) -> Result<(), StorageError>;

  /// Resolves the current candidacy round; returns true if `name` is leader.
  async fn check_leader_candidacy(&self, name: &str) -> Result<bool, StorageError>;

  /// Returns all topology records.
  async fn get_topology_status(&self) -> Result<Vec<TopologyRecord>, StorageError>;

  /// Returns the topologies assigned to `worker`.
  async fn get_topologies_for_worker(
    &self,
    worker: &str,
  ) -> Result<Vec<TopologyRecord>, StorageError>;

  /// Sets a topology's status and error, refreshing its ping.
  ///
  /// `worker` is left unchanged when `None`.
  async fn set_topology_status(
    &self,
    uuid: &str,
    worker: Option<&str>,
    status: TopologyStatus,
    error: Option<&str>,
  ) -> Result<(), StorageError>;

  /// Records the process id of a running topology.
  async fn set_topology_pid(&self, uuid: &str, pid: u32) -> Result<(), StorageError>;

  /// Assigns a topology to a worker and marks it `waiting`.
  async fn assign_topology(&self, uuid: &str, worker: &str) -> Result<(), StorageError>;

  /// Queues a message for `worker`, valid for `valid_for`.
  async fn send_message_to_worker(
    &self,
    worker: &str,
    cmd: &str,
    content: serde_json::Value,
    valid_for: Duration,
  ) -> Result<(), StorageError>;

  /// Pops the oldest pending message for `worker`.
  async fn get_message(&self, worker: &str) -> Result<Option<StoredMessage>, StorageError>;

  /// Returns a single topology record.
  async fn get_topology_info(&self, uuid: &str) -> Result<TopologyRecord, StorageError>;

  /// Queues a typed command for `worker`.
  async fn send_command(
    &self,
    worker: &str,
    command: &Command,
    valid_for: Duration,
  ) -> Result<(), StorageError> {
    self
      .send_message_to_worker(worker, command.name(), command.content(), valid_for)
      .await
  }
}
