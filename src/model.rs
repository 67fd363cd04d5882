//! Worker and topology records as kept by the coordination storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
  /// Worker is pinging and can receive topologies.
  Alive,
  /// Worker stopped pinging; its topologies are about to be freed.
  Dead,
  /// Dead worker whose topologies were already freed.
  Unloaded,
  /// Worker is draining before shutdown.
  Closing,
}

/// Leadership flag of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLStatus {
  /// Regular worker.
  #[default]
  Normal,
  /// Worker currently acting as leader.
  Leader,
}

/// Lifecycle status of a topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TopologyStatus {
  /// Not assigned to any worker.
  #[default]
  Unassigned,
  /// Assigned; the target worker has not started it yet.
  Waiting,
  /// Running on its worker.
  Running,
  /// Stopped on its worker.
  Stopped,
  /// Failed; never reassigned automatically.
  Error,
}

/// Whether some worker currently holds the leader flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadershipStatus {
  /// At least one worker claims leadership.
  Ok,
  /// Nobody claims leadership.
  Vacant,
}

impl WorkerStatus {
  /// Returns the stored name of the status.
  #[must_use]
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerStatus::Alive => "alive",
      WorkerStatus::Dead => "dead",
      WorkerStatus::Unloaded => "unloaded",
      WorkerStatus::Closing => "closing",
    }
  }
}

impl WorkerLStatus {
  /// Returns the stored name of the flag.
  #[must_use]
  pub fn as_str(&self) -> &'static str {
    match self {
      WorkerLStatus::Normal => "normal",
      WorkerLStatus::Leader => "leader",
    }
  }
}

impl TopologyStatus {
  /// Returns the stored name of the status.
  #[must_use]
  pub fn as_str(&self) -> &'static str {
    match self {
      TopologyStatus::Unassigned => "unassigned",
      TopologyStatus::Waiting => "waiting",
      TopologyStatus::Running => "running",
      TopologyStatus::Stopped => "stopped",
      TopologyStatus::Error => "error",
    }
  }
}

impl fmt::Display for WorkerStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl fmt::Display for WorkerLStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl fmt::Display for TopologyStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Worker record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
  /// Unique worker name.
  pub name: String,
  /// Liveness status.
  pub status: WorkerStatus,
  /// Leadership flag.
  pub lstatus: WorkerLStatus,
  /// Time of the last ping.
  pub last_ping: DateTime<Utc>,
}

impl WorkerRecord {
  /// Creates a freshly registered, alive worker record.
  #[must_use]
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      status: WorkerStatus::Alive,
      lstatus: WorkerLStatus::Normal,
      last_ping: Utc::now(),
    }
  }

  /// Returns true if the worker claims leadership.
  #[must_use]
  pub fn is_leader(&self) -> bool {
    self.lstatus == WorkerLStatus::Leader
  }
}

fn default_weight() -> f64 {
  1.0
}

fn default_enabled() -> bool {
  true
}

/// Topology record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyRecord {
  /// Topology identity.
  pub uuid: String,
  /// Opaque job definition handed to the local runtime.
  #[serde(default)]
  pub config: serde_json::Value,
  /// Lifecycle status.
  #[serde(default)]
  pub status: TopologyStatus,
  /// Assigned worker. Always set when status is not `unassigned`.
  #[serde(default)]
  pub worker: Option<String>,
  /// Disabled topologies are never assigned.
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  /// Relative load of the topology.
  #[serde(default = "default_weight")]
  pub weight: f64,
  /// Preferred workers, most preferred first.
  #[serde(default)]
  pub worker_affinity: Vec<String>,
  /// Time of the last status report.
  pub last_ping: DateTime<Utc>,
  /// Process id reported by the owning worker.
  #[serde(default)]
  pub pid: Option<u32>,
  /// Last reported error.
  #[serde(default)]
  pub error: Option<String>,
}

impl TopologyRecord {
  /// Creates an enabled, unassigned topology with weight 1.
  #[must_use]
  pub fn new(uuid: impl Into<String>, config: serde_json::Value) -> Self {
    Self {
      uuid: uuid.into(),
      config,
      status: TopologyStatus::Unassigned,
      worker: None,
      enabled: true,
      weight: default_weight(),
      worker_affinity: Vec::new(),
      last_ping: Utc::now(),
      pid: None,
      error: None,
    }
  }

  /// Sets the weight.
  #[must_use]
  pub fn with_weight(mut self, weight: f64) -> Self {
    self.weight = weight;
    self
  }

  /// Sets the preferred workers.
  #[must_use]
  pub fn with_affinity<I, S>(mut self, workers: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.worker_affinity = workers.into_iter().map(Into::into).collect();
    self
  }

  /// Weight used for balancing; non-positive or invalid weights count as 1.
  #[must_use]
  pub fn effective_weight(&self) -> f64 {
    if self.weight.is_finite() && self.weight > 0.0 {
      self.weight
    } else {
      default_weight()
    }
  }

  /// Returns true if the topology is assigned to `worker`.
  #[must_use]
  pub fn is_on(&self, worker: &str) -> bool {
    self.worker.as_deref() == Some(worker)
  }
}
