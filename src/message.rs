//! Mailbox messages between the leader (or an admin tool) and workers.
//!
//! The storage keeps messages as a command name plus a JSON payload so that
//! producers and consumers of different versions can share a mailbox.
//! [`Command`] is the typed view the coordinator dispatches on; command names
//! it does not know map to [`Command::Unknown`] and are ignored.

use crate::error::{CoordinationError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Command names as stored in the mailbox.
pub mod cmd {
  /// Start one topology.
  pub const START_TOPOLOGY: &str = "start_topology";
  /// Start several topologies.
  pub const START_TOPOLOGIES: &str = "start_topologies";
  /// Stop one topology.
  pub const STOP_TOPOLOGY: &str = "stop_topology";
  /// Stop several topologies.
  pub const STOP_TOPOLOGIES: &str = "stop_topologies";
  /// Kill one topology.
  pub const KILL_TOPOLOGY: &str = "kill_topology";
  /// Shut the worker down.
  pub const SHUTDOWN: &str = "shutdown";
  /// Force a rebalance on the next leader step.
  pub const REBALANCE: &str = "rebalance";
}

/// Message as stored in a worker mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
  /// Command name.
  pub cmd: String,
  /// Command-specific payload.
  #[serde(default)]
  pub content: serde_json::Value,
  /// Creation time; messages older than the receiving coordinator are dropped.
  pub created: DateTime<Utc>,
}

impl StoredMessage {
  /// Creates a message stamped with the current time.
  #[must_use]
  pub fn new(cmd: impl Into<String>, content: serde_json::Value) -> Self {
    Self {
      cmd: cmd.into(),
      content,
      created: Utc::now(),
    }
  }

  /// Decodes the message into a typed command.
  pub fn command(&self) -> Result<Command> {
    Command::parse(&self.cmd, self.content.clone())
  }
}

/// Stop request for one topology, optionally naming the worker it moves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopRequest {
  /// Topology to stop.
  pub uuid: String,
  /// Worker the rebalance plan moves the topology to.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub new_worker: Option<String>,
}

/// Typed mailbox command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Start a topology assigned to this worker.
  StartTopology {
    /// Topology to start.
    uuid: String,
  },
  /// Start several topologies assigned to this worker.
  StartTopologies {
    /// Topologies to start.
    uuids: Vec<String>,
  },
  /// Stop a topology.
  StopTopology(StopRequest),
  /// Stop several topologies.
  StopTopologies {
    /// Topologies to stop.
    stop_topologies: Vec<StopRequest>,
  },
  /// Kill a topology.
  KillTopology {
    /// Topology to kill.
    uuid: String,
  },
  /// Shut the worker process down.
  Shutdown,
  /// Force a rebalance on the next leader step.
  Rebalance,
  /// Command this version does not understand.
  Unknown {
    /// Command name as found in the mailbox.
    cmd: String,
  },
}

#[derive(Serialize, Deserialize)]
struct UuidContent {
  uuid: String,
}

#[derive(Serialize, Deserialize)]
struct UuidsContent {
  uuids: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct StopTopologiesContent {
  stop_topologies: Vec<StopRequest>,
}

fn decode<T: DeserializeOwned>(cmd: &str, content: serde_json::Value) -> Result<T> {
  serde_json::from_value(content).map_err(|e| CoordinationError::InvalidMessage {
    cmd: cmd.to_string(),
    reason: e.to_string(),
  })
}

impl Command {
  /// Decodes a stored command name and payload.
  pub fn parse(name: &str, content: serde_json::Value) -> Result<Self> {
    let command = match name {
      cmd::START_TOPOLOGY => {
        let c: UuidContent = decode(name, content)?;
        Command::StartTopology { uuid: c.uuid }
      }
      cmd::START_TOPOLOGIES => {
        let c: UuidsContent = decode(name, content)?;
        Command::StartTopologies { uuids: c.uuids }
      }
      cmd::STOP_TOPOLOGY => Command::StopTopology(decode(name, content)?),
      cmd::STOP_TOPOLOGIES => {
        let c: StopTopologiesContent = decode(name, content)?;
        Command::StopTopologies {
          stop_topologies: c.stop_topologies,
        }
      }
      cmd::KILL_TOPOLOGY => {
        let c: UuidContent = decode(name, content)?;
        Command::KillTopology { uuid: c.uuid }
      }
      cmd::SHUTDOWN => Command::Shutdown,
      cmd::REBALANCE => Command::Rebalance,
      other => Command::Unknown {
        cmd: other.to_string(),
      },
    };
    Ok(command)
  }

  /// Command name as stored in the mailbox.
  #[must_use]
  pub fn name(&self) -> &str {
    match self {
      Command::StartTopology { .. } => cmd::START_TOPOLOGY,
      Command::StartTopologies { .. } => cmd::START_TOPOLOGIES,
      Command::StopTopology(_) => cmd::STOP_TOPOLOGY,
      Command::StopTopologies { .. } => cmd::STOP_TOPOLOGIES,
      Command::KillTopology { .. } => cmd::KILL_TOPOLOGY,
      Command::Shutdown => cmd::SHUTDOWN,
      Command::Rebalance => cmd::REBALANCE,
      Command::Unknown { cmd } => cmd,
    }
  }

  /// Payload as stored in the mailbox.
  #[must_use]
  pub fn content(&self) -> serde_json::Value {
    match self {
      Command::StartTopology { uuid } | Command::KillTopology { uuid } => {
        serde_json::json!({ "uuid": uuid })
      }
      Command::StartTopologies { uuids } => serde_json::json!({ "uuids": uuids }),
      Command::StopTopology(request) => serde_json::json!(request),
      Command::StopTopologies { stop_topologies } => {
        serde_json::json!({ "stop_topologies": stop_topologies })
      }
      Command::Shutdown | Command::Rebalance | Command::Unknown { .. } => {
        serde_json::json!({})
      }
    }
  }
}
