//! In-process coordination storage.
//!
//! Keeps every record behind a single async mutex, which makes each call atomic
//! and gives leader candidacy a real claim-if-vacant. Suitable for tests and
//! single-process clusters where all workers share one storage instance.

use super::CoordinationStorage;
use crate::error::StorageError;
use crate::message::StoredMessage;
use crate::model::{TopologyRecord, TopologyStatus, WorkerLStatus, WorkerRecord, WorkerStatus};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

struct Envelope {
  message: StoredMessage,
  expires: DateTime<Utc>,
}

#[derive(Default)]
struct State {
  workers: Vec<WorkerRecord>,
  topologies: Vec<TopologyRecord>,
  mailboxes: HashMap<String, VecDeque<Envelope>>,
  candidates: Vec<String>,
}

impl State {
  fn worker_mut(&mut self, name: &str) -> Result<&mut WorkerRecord, StorageError> {
    self
      .workers
      .iter_mut()
      .find(|w| w.name == name)
      .ok_or_else(|| StorageError::WorkerNotFound(name.to_string()))
  }

  fn topology_mut(&mut self, uuid: &str) -> Result<&mut TopologyRecord, StorageError> {
    self
      .topologies
      .iter_mut()
      .find(|t| t.uuid == uuid)
      .ok_or_else(|| StorageError::TopologyNotFound(uuid.to_string()))
  }

  fn current_leader(&self) -> Option<&WorkerRecord> {
    self.workers.iter().find(|w| w.is_leader())
  }
}

fn expiry(now: DateTime<Utc>, valid_for: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(valid_for)
    .ok()
    .and_then(|d| now.checked_add_signed(d))
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Coordination storage kept in process memory.
pub struct InMemoryStorage {
  state: Mutex<State>,
}

impl Default for InMemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryStorage {
  /// Creates an empty storage.
  #[must_use]
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State::default()),
    }
  }

  /// Adds or replaces a topology record.
  pub async fn register_topology(&self, record: TopologyRecord) {
    let mut state = self.state.lock().await;
    match state.topologies.iter_mut().find(|t| t.uuid == record.uuid) {
      Some(existing) => *existing = record,
      None => state.topologies.push(record),
    }
  }

  /// Enables or disables a topology.
  pub async fn set_topology_enabled(&self, uuid: &str, enabled: bool) -> Result<(), StorageError> {
    self.state.lock().await.topology_mut(uuid)?.enabled = enabled;
    Ok(())
  }

  /// Overrides a worker's last ping.
  pub async fn set_worker_last_ping(
    &self,
    name: &str,
    last_ping: DateTime<Utc>,
  ) -> Result<(), StorageError> {
    self.state.lock().await.worker_mut(name)?.last_ping = last_ping;
    Ok(())
  }

  /// Overrides a topology's last ping.
  pub async fn set_topology_last_ping(
    &self,
    uuid: &str,
    last_ping: DateTime<Utc>,
  ) -> Result<(), StorageError> {
    self.state.lock().await.topology_mut(uuid)?.last_ping = last_ping;
    Ok(())
  }

  /// Queues an already built message, keeping its `created` timestamp.
  pub async fn push_message(&self, worker: &str, message: StoredMessage, valid_for: Duration) {
    let expires = expiry(Utc::now(), valid_for);
    self
      .state
      .lock()
      .await
      .mailboxes
      .entry(worker.to_string())
      .or_default()
      .push_back(Envelope { message, expires });
  }

  /// Returns the unexpired messages waiting for `worker` without consuming them.
  pub async fn pending_messages(&self, worker: &str) -> Vec<StoredMessage> {
    let now = Utc::now();
    let state = self.state.lock().await;
    state
      .mailboxes
      .get(worker)
      .map(|queue| {
        queue
          .iter()
          .filter(|e| e.expires > now)
          .map(|e| e.message.clone())
          .collect()
      })
      .unwrap_or_default()
  }
}

#[async_trait::async_trait]
impl CoordinationStorage for InMemoryStorage {
  async fn register_worker(&self, name: &str) -> Result<(), StorageError> {
    let mut state = self.state.lock().await;
    match state.workers.iter_mut().find(|w| w.name == name) {
      Some(worker) => {
        worker.status = WorkerStatus::Alive;
        worker.last_ping = Utc::now();
      }
      None => state.workers.push(WorkerRecord::new(name)),
    }
    Ok(())
  }

  async fn ping_worker(&self, name: &str) -> Result<(), StorageError> {
    self.state.lock().await.worker_mut(name)?.last_ping = Utc::now();
    Ok(())
  }

  async fn get_worker_status(&self) -> Result<Vec<WorkerRecord>, StorageError> {
    Ok(self.state.lock().await.workers.clone())
  }

  async fn set_worker_status(
    &self,
    name: &str,
    status: WorkerStatus,
  ) -> Result<(), StorageError> {
    self.state.lock().await.worker_mut(name)?.status = status;
    Ok(())
  }

  async fn set_worker_lstatus(
    &self,
    name: &str,
    lstatus: WorkerLStatus,
  ) -> Result<(), StorageError> {
    self.state.lock().await.worker_mut(name)?.lstatus = lstatus;
    Ok(())
  }

  async fn announce_leader_candidacy(&self, name: &str) -> Result<(), StorageError> {
    let mut state = self.state.lock().await;
    if state.current_leader().is_none() && !state.candidates.iter().any(|c| c == name) {
      state.candidates.push(name.to_string());
    }
    Ok(())
  }

  async fn check_leader_candidacy(&self, name: &str) -> Result<bool, StorageError> {
    let mut state = self.state.lock().await;
    if let Some(leader) = state.current_leader() {
      return Ok(leader.name == name);
    }

    // Candidates that died before resolving their round must not block it.
    let State {
      workers,
      candidates,
      ..
    } = &mut *state;
    candidates.retain(|c| {
      workers
        .iter()
        .any(|w| &w.name == c && w.status == WorkerStatus::Alive)
    });

    if candidates.first().map(String::as_str) != Some(name) {
      return Ok(false);
    }
    state.worker_mut(name)?.lstatus = WorkerLStatus::Leader;
    state.candidates.clear();
    Ok(true)
  }

  async fn get_topology_status(&self) -> Result<Vec<TopologyRecord>, StorageError> {
    Ok(self.state.lock().await.topologies.clone())
  }

  async fn get_topologies_for_worker(
    &self,
    worker: &str,
  ) -> Result<Vec<TopologyRecord>, StorageError> {
    let state = self.state.lock().await;
    Ok(
      state
        .topologies
        .iter()
        .filter(|t| t.is_on(worker))
        .cloned()
        .collect(),
    )
  }

  async fn set_topology_status(
    &self,
    uuid: &str,
    worker: Option<&str>,
    status: TopologyStatus,
    error: Option<&str>,
  ) -> Result<(), StorageError> {
    let mut state = self.state.lock().await;
    let topology = state.topology_mut(uuid)?;
    topology.status = status;
    if let Some(worker) = worker {
      topology.worker = Some(worker.to_string());
    }
    topology.error = error.map(str::to_string);
    topology.last_ping = Utc::now();
    Ok(())
  }

  async fn set_topology_pid(&self, uuid: &str, pid: u32) -> Result<(), StorageError> {
    let mut state = self.state.lock().await;
    let topology = state.topology_mut(uuid)?;
    topology.pid = Some(pid);
    topology.last_ping = Utc::now();
    Ok(())
  }

  async fn assign_topology(&self, uuid: &str, worker: &str) -> Result<(), StorageError> {
    let mut state = self.state.lock().await;
    let topology = state.topology_mut(uuid)?;
    topology.worker = Some(worker.to_string());
    topology.status = TopologyStatus::Waiting;
    topology.error = None;
    topology.pid = None;
    topology.last_ping = Utc::now();
    Ok(())
  }

  async fn send_message_to_worker(
    &self,
    worker: &str,
    cmd: &str,
    content: serde_json::Value,
    valid_for: Duration,
  ) -> Result<(), StorageError> {
    self
      .push_message(worker, StoredMessage::new(cmd, content), valid_for)
      .await;
    Ok(())
  }

  async fn get_message(&self, worker: &str) -> Result<Option<StoredMessage>, StorageError> {
    let now = Utc::now();
    let mut state = self.state.lock().await;
    let Some(queue) = state.mailboxes.get_mut(worker) else {
      return Ok(None);
    };
    while let Some(envelope) = queue.pop_front() {
      if envelope.expires > now {
        return Ok(Some(envelope.message));
      }
    }
    Ok(None)
  }

  async fn get_topology_info(&self, uuid: &str) -> Result<TopologyRecord, StorageError> {
    let state = self.state.lock().await;
    state
      .topologies
      .iter()
      .find(|t| t.uuid == uuid)
      .cloned()
      .ok_or_else(|| StorageError::TopologyNotFound(uuid.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Command;
  use serde_json::json;

  #[tokio::test]
  async fn test_register_worker_once() {
    let storage = InMemoryStorage::new();
    storage.register_worker("w1").await.unwrap();
    storage.set_worker_status("w1", WorkerStatus::Dead).await.unwrap();
    storage.register_worker("w1").await.unwrap();

    let workers = storage.get_worker_status().await.unwrap();
    let records: Vec<_> = workers.iter().filter(|w| w.name == "w1").collect();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, WorkerStatus::Alive);
  }

  #[tokio::test]
  async fn test_unknown_worker() {
    let storage = InMemoryStorage::new();
    let err = storage.ping_worker("ghost").await.unwrap_err();
    assert!(err.is_not_found());
  }

  #[tokio::test]
  async fn test_candidacy_single_winner() {
    let storage = InMemoryStorage::new();
    storage.register_worker("w1").await.unwrap();
    storage.register_worker("w2").await.unwrap();

    storage.announce_leader_candidacy("w1").await.unwrap();
    storage.announce_leader_candidacy("w2").await.unwrap();

    // Resolution order does not matter: the first announcer wins.
    assert!(!storage.check_leader_candidacy("w2").await.unwrap());
    assert!(storage.check_leader_candidacy("w1").await.unwrap());
    assert!(!storage.check_leader_candidacy("w2").await.unwrap());

    let leaders: Vec<_> = storage
      .get_worker_status()
      .await
      .unwrap()
      .into_iter()
      .filter(|w| w.is_leader())
      .collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].name, "w1");
  }

  #[tokio::test]
  async fn test_candidacy_skips_dead_candidate() {
    let storage = InMemoryStorage::new();
    storage.register_worker("w1").await.unwrap();
    storage.register_worker("w2").await.unwrap();
    storage.announce_leader_candidacy("w1").await.unwrap();
    storage.announce_leader_candidacy("w2").await.unwrap();
    storage.set_worker_status("w1", WorkerStatus::Dead).await.unwrap();

    assert!(storage.check_leader_candidacy("w2").await.unwrap());
  }

  #[tokio::test]
  async fn test_announce_ignored_while_leader_present() {
    let storage = InMemoryStorage::new();
    storage.register_worker("w1").await.unwrap();
    storage.register_worker("w2").await.unwrap();
    storage
      .set_worker_lstatus("w1", WorkerLStatus::Leader)
      .await
      .unwrap();

    storage.announce_leader_candidacy("w2").await.unwrap();
    assert!(!storage.check_leader_candidacy("w2").await.unwrap());
    assert!(storage.check_leader_candidacy("w1").await.unwrap());
  }

  #[tokio::test]
  async fn test_assign_and_status() {
    let storage = InMemoryStorage::new();
    storage
      .register_topology(TopologyRecord::new("t1", json!({ "name": "t1" })))
      .await;
    storage.assign_topology("t1", "w1").await.unwrap();

    let t = storage.get_topology_info("t1").await.unwrap();
    assert_eq!(t.status, TopologyStatus::Waiting);
    assert_eq!(t.worker.as_deref(), Some("w1"));

    storage
      .set_topology_status("t1", None, TopologyStatus::Error, Some("boom"))
      .await
      .unwrap();
    let t = storage.get_topology_info("t1").await.unwrap();
    assert_eq!(t.status, TopologyStatus::Error);
    assert_eq!(t.worker.as_deref(), Some("w1"));
    assert_eq!(t.error.as_deref(), Some("boom"));

    let for_worker = storage.get_topologies_for_worker("w1").await.unwrap();
    assert_eq!(for_worker.len(), 1);
    assert!(storage.get_topologies_for_worker("w2").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_mailbox_fifo_and_expiry() {
    let storage = InMemoryStorage::new();
    storage
      .send_command("w1", &Command::Rebalance, Duration::from_secs(20))
      .await
      .unwrap();
    storage
      .send_message_to_worker("w1", "shutdown", json!({}), Duration::from_secs(20))
      .await
      .unwrap();
    storage
      .send_message_to_worker("w2", "shutdown", json!({}), Duration::ZERO)
      .await
      .unwrap();

    assert_eq!(storage.pending_messages("w1").await.len(), 2);
    assert_eq!(
      storage.get_message("w1").await.unwrap().unwrap().cmd,
      "rebalance"
    );
    assert_eq!(
      storage.get_message("w1").await.unwrap().unwrap().cmd,
      "shutdown"
    );
    assert!(storage.get_message("w1").await.unwrap().is_none());
    assert!(storage.get_message("w2").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_missing_topology_info() {
    let storage = InMemoryStorage::new();
    let err = storage.get_topology_info("nope").await.unwrap_err();
    assert!(matches!(err, StorageError::TopologyNotFound(_)));
  }
}
