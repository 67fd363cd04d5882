//! Tunable timings for the leader and coordinator loops.
//!
//! All values have production defaults and can be overridden at construction,
//! either through the `with_*` builders or by deserializing from JSON (durations
//! are encoded as integer milliseconds).

use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by [`TopologyLeader`](crate::leader::TopologyLeader) and
/// [`TopologyCoordinator`](crate::coordinator::TopologyCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
  /// Pause between two leader loop steps.
  #[serde(with = "duration_ms")]
  pub leader_loop_interval: Duration,
  /// Pause between two coordinator loop iterations.
  #[serde(with = "duration_ms")]
  pub coordinator_loop_interval: Duration,
  /// Interval of the worker self-ping.
  #[serde(with = "duration_ms")]
  pub ping_interval: Duration,
  /// How much stronger affinity workers attract a topology.
  pub affinity_factor: f64,
  /// Minimum time between two regular rebalances.
  #[serde(with = "duration_ms")]
  pub rebalance_interval: Duration,
  /// Validity of leader-to-worker messages.
  #[serde(with = "duration_ms")]
  pub message_timeout: Duration,
  /// A worker (or waiting topology) without a ping for this long is considered dead.
  #[serde(with = "duration_ms")]
  pub worker_idle_threshold: Duration,
  /// A leader without a ping for this long loses its leader flag.
  /// `None` means three leader loop intervals.
  #[serde(with = "option_duration_ms")]
  pub leader_idle_threshold: Option<Duration>,
  /// Coordinator iterations between two local consistency checks.
  pub status_check_period: u64,
}

impl Default for CoordinationConfig {
  fn default() -> Self {
    Self {
      leader_loop_interval: Duration::from_secs(5),
      coordinator_loop_interval: Duration::from_secs(2),
      ping_interval: Duration::from_secs(1),
      affinity_factor: 5.0,
      rebalance_interval: Duration::from_secs(60 * 60),
      message_timeout: Duration::from_secs(20),
      worker_idle_threshold: Duration::from_secs(30),
      leader_idle_threshold: None,
      status_check_period: 5,
    }
  }
}

impl CoordinationConfig {
  /// Parses a configuration from JSON. Missing fields keep their defaults.
  pub fn from_json(json: &str) -> Result<Self> {
    let config: Self =
      serde_json::from_str(json).map_err(|e| CoordinationError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  /// Idle threshold after which a leader flag is reclaimed.
  #[must_use]
  pub fn leader_idle_threshold(&self) -> Duration {
    self
      .leader_idle_threshold
      .unwrap_or(self.leader_loop_interval * 3)
  }

  /// Sets the leader loop interval.
  #[must_use]
  pub fn with_leader_loop_interval(mut self, interval: Duration) -> Self {
    self.leader_loop_interval = interval;
    self
  }

  /// Sets the coordinator loop interval.
  #[must_use]
  pub fn with_coordinator_loop_interval(mut self, interval: Duration) -> Self {
    self.coordinator_loop_interval = interval;
    self
  }

  /// Sets the self-ping interval.
  #[must_use]
  pub fn with_ping_interval(mut self, interval: Duration) -> Self {
    self.ping_interval = interval;
    self
  }

  /// Sets the affinity factor.
  #[must_use]
  pub fn with_affinity_factor(mut self, factor: f64) -> Self {
    self.affinity_factor = factor;
    self
  }

  /// Sets the regular rebalance interval.
  #[must_use]
  pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
    self.rebalance_interval = interval;
    self
  }

  /// Sets the message delivery timeout.
  #[must_use]
  pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
    self.message_timeout = timeout;
    self
  }

  /// Sets the worker idle threshold.
  #[must_use]
  pub fn with_worker_idle_threshold(mut self, threshold: Duration) -> Self {
    self.worker_idle_threshold = threshold;
    self
  }

  /// Overrides the leader idle threshold.
  #[must_use]
  pub fn with_leader_idle_threshold(mut self, threshold: Duration) -> Self {
    self.leader_idle_threshold = Some(threshold);
    self
  }

  /// Sets how many coordinator iterations pass between local checks.
  #[must_use]
  pub fn with_status_check_period(mut self, period: u64) -> Self {
    self.status_check_period = period;
    self
  }

  /// Validates the config: every interval non-zero, affinity factor >= 1.
  pub fn validate(&self) -> Result<()> {
    let intervals = [
      ("leader_loop_interval", self.leader_loop_interval),
      ("coordinator_loop_interval", self.coordinator_loop_interval),
      ("ping_interval", self.ping_interval),
      ("rebalance_interval", self.rebalance_interval),
      ("message_timeout", self.message_timeout),
      ("worker_idle_threshold", self.worker_idle_threshold),
      ("leader_idle_threshold", self.leader_idle_threshold()),
    ];
    for (name, value) in intervals {
      if value.is_zero() {
        return Err(CoordinationError::Config(format!("{} must be > 0", name)));
      }
    }
    if self.affinity_factor.is_nan() || self.affinity_factor < 1.0 {
      return Err(CoordinationError::Config(format!(
        "affinity_factor ({}) must be >= 1",
        self.affinity_factor
      )));
    }
    if self.status_check_period == 0 {
      return Err(CoordinationError::Config(
        "status_check_period must be > 0".to_string(),
      ));
    }
    Ok(())
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    Ok(Duration::from_millis(u64::deserialize(deserializer)?))
  }
}

mod option_duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(
    value: &Option<Duration>,
    serializer: S,
  ) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
      None => serializer.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(
    deserializer: D,
  ) -> Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
  }
}
