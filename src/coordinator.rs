//! Per-worker coordination loop.
//!
//! A [`TopologyCoordinator`] registers its worker, keeps it pinging, runs the
//! embedded [`TopologyLeader`] and turns mailbox messages into calls on the
//! host's [`TopologyCoordinatorClient`]. It also checks every few iterations
//! that the local runtime agrees with storage on which topologies run here
//! and that the worker's own record still says `alive`.

use crate::config::CoordinationConfig;
use crate::error::{ClientError, Result};
use crate::leader::TopologyLeader;
use crate::lifecycle::{LoopControl, LoopState};
use crate::message::Command;
use crate::model::{TopologyStatus, WorkerStatus};
use crate::storage::CoordinationStorage;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Local topology runtime, implemented by the hosting process.
#[async_trait::async_trait]
pub trait TopologyCoordinatorClient: Send + Sync {
  /// Starts a topology with its stored configuration.
  async fn start_topology(
    &self,
    uuid: &str,
    config: &serde_json::Value,
  ) -> std::result::Result<(), ClientError>;

  /// Stops a topology gracefully.
  async fn stop_topology(&self, uuid: &str) -> std::result::Result<(), ClientError>;

  /// Kills a topology.
  async fn kill_topology(&self, uuid: &str) -> std::result::Result<(), ClientError>;

  /// Reconciles the local runtime with the topologies storage believes run here.
  async fn resolve_topology_mismatches(
    &self,
    running: &[String],
  ) -> std::result::Result<(), ClientError>;

  /// Stops every local topology before the process exits.
  async fn shutdown(&self) -> std::result::Result<(), ClientError>;

  /// Terminates the process.
  fn exit(&self, code: i32);
}

/// Coordinator of one worker.
pub struct TopologyCoordinator {
  name: String,
  storage: Arc<dyn CoordinationStorage>,
  client: Arc<dyn TopologyCoordinatorClient>,
  leadership: Arc<TopologyLeader>,
  config: CoordinationConfig,
  start_time: DateTime<Utc>,
  is_shutting_down: AtomicBool,
  shutdown_requested: AtomicBool,
  control: LoopControl,
  ping: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for TopologyCoordinator {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TopologyCoordinator")
      .field("name", &self.name)
      .field("start_time", &self.start_time)
      .field("state", &self.control.state())
      .field("leadership", &self.leadership)
      .finish()
  }
}

impl TopologyCoordinator {
  /// Creates the coordinator and its embedded leader for worker `name`.
  ///
  /// Messages created before this call are ignored. Fails if `config` does
  /// not validate.
  pub fn new(
    name: impl Into<String>,
    storage: Arc<dyn CoordinationStorage>,
    client: Arc<dyn TopologyCoordinatorClient>,
    config: CoordinationConfig,
  ) -> Result<Self> {
    config.validate()?;
    let name = name.into();
    let leadership = Arc::new(TopologyLeader::new(
      name.clone(),
      Arc::clone(&storage),
      config.clone(),
    )?);
    Ok(Self {
      name,
      storage,
      client,
      leadership,
      config,
      start_time: Utc::now(),
      is_shutting_down: AtomicBool::new(false),
      shutdown_requested: AtomicBool::new(false),
      control: LoopControl::new(),
      ping: Mutex::new(None),
    })
  }

  /// Worker name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Creation time; older mailbox messages are dropped.
  pub fn start_time(&self) -> DateTime<Utc> {
    self.start_time
  }

  /// Embedded leader.
  pub fn leadership(&self) -> &Arc<TopologyLeader> {
    &self.leadership
  }

  /// Current state of the coordinator loop.
  pub fn state(&self) -> LoopState {
    self.control.state()
  }

  /// Whether the coordinator loop is alive.
  pub fn is_running(&self) -> bool {
    self.control.is_running()
  }

  /// Registers the worker and spawns the coordinator loop.
  ///
  /// The loop also starts the ping task and the leader loop. If the leader
  /// loop stops while no shutdown was requested, the coordinator stops too
  /// and asks the client to shut down and exit with code 0.
  pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
    let Some(token) = self.control.start() else {
      warn!(worker = %self.name, "coordinator loop already running");
      return tokio::spawn(async {});
    };
    let coordinator = Arc::clone(self);
    tokio::spawn(async move {
      let fatal = {
        let _stopped = scopeguard::guard((), |_| coordinator.control.mark_stopped());
        coordinator.run_loop(&token).await
      };
      info!(worker = %coordinator.name, "coordinator stopped");
      if fatal && !coordinator.shutdown_requested.load(Ordering::SeqCst) {
        coordinator.stop_ping();
        error!(worker = %coordinator.name, "leader loop stopped unexpectedly, shutting down worker");
        if let Err(e) = coordinator.client.shutdown().await {
          error!(worker = %coordinator.name, error = %e, "client shutdown failed");
        }
        info!(worker = %coordinator.name, "exiting with code 0");
        coordinator.client.exit(0);
      }
    })
  }

  /// Returns true if the loop ended because the leader stopped.
  async fn run_loop(&self, token: &CancellationToken) -> bool {
    if let Err(e) = self.storage.register_worker(&self.name).await {
      error!(worker = %self.name, error = %e, "registering worker failed");
    }
    self.start_ping(token);
    self.leadership.run();
    info!(worker = %self.name, "coordinator started");

    let period = self.config.status_check_period;
    let mut counter: u64 = 0;
    while !token.is_cancelled() {
      counter = counter.wrapping_add(1);
      let (leader_alive, mailbox, topologies, worker) = tokio::join!(
        async { self.leadership.is_running() || self.is_shutting_down.load(Ordering::SeqCst) },
        self.poll_mailbox(token),
        async {
          if counter % period == 1 % period {
            self.check_assigned_topologies().await
          } else {
            Ok(())
          }
        },
        async {
          if counter % period == 0 {
            self.check_worker_status().await
          } else {
            Ok(())
          }
        },
      );
      if let Err(e) = mailbox {
        warn!(worker = %self.name, error = %e, "handling incoming message failed");
      }
      if let Err(e) = topologies {
        warn!(worker = %self.name, error = %e, "checking assigned topologies failed");
      }
      if let Err(e) = worker {
        warn!(worker = %self.name, error = %e, "checking worker status failed");
      }
      if !leader_alive {
        return true;
      }
    }
    false
  }

  async fn poll_mailbox(&self, token: &CancellationToken) -> Result<()> {
    tokio::select! {
      _ = token.cancelled() => Ok(()),
      _ = tokio::time::sleep(self.config.coordinator_loop_interval) => {
        self.handle_incoming_requests().await
      }
    }
  }

  fn start_ping(&self, parent: &CancellationToken) {
    let token = parent.child_token();
    let storage = Arc::clone(&self.storage);
    let name = self.name.clone();
    let period = self.config.ping_interval;
    let stop = token.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = stop.cancelled() => break,
          _ = ticker.tick() => {
            if let Err(e) = storage.ping_worker(&name).await {
              warn!(worker = %name, error = %e, "ping failed");
            }
          }
        }
      }
      debug!(worker = %name, "ping stopped");
    });
    let previous = self
      .ping
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .replace(token);
    if let Some(previous) = previous {
      previous.cancel();
    }
  }

  fn stop_ping(&self) {
    let token = self.ping.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(token) = token {
      token.cancel();
    }
  }

  /// Marks the worker `closing` and stops the leader, leaving the loop running.
  ///
  /// Afterwards the coordinator no longer takes messages from its mailbox.
  pub async fn pre_shutdown(&self) {
    info!(worker = %self.name, "pre-shutdown");
    self.is_shutting_down.store(true, Ordering::SeqCst);
    let _ = self.report_worker(&self.name, WorkerStatus::Closing).await;
    self.leadership.shutdown().await;
  }

  /// Stops the ping task, the coordinator loop and the leader, then marks the
  /// worker `dead`.
  ///
  /// Concurrent and repeated calls only wait for the loop to stop.
  pub async fn shutdown(&self) {
    if self.shutdown_requested.swap(true, Ordering::SeqCst) {
      self.control.stop().await;
      return;
    }
    info!(worker = %self.name, "shutting down coordinator");
    self.stop_ping();
    self.control.stop().await;
    self.leadership.shutdown().await;
    let _ = self.report_worker(&self.name, WorkerStatus::Dead).await;
  }

  /// Persists the status of a topology running on this worker.
  ///
  /// Failures are logged and returned; the next report overwrites them.
  pub async fn report_topology(
    &self,
    uuid: &str,
    status: TopologyStatus,
    error: Option<&str>,
  ) -> Result<()> {
    self
      .storage
      .set_topology_status(uuid, Some(&self.name), status, error)
      .await
      .map_err(|e| {
        error!(topology = %uuid, status = %status, error = %e, "couldn't report topology status");
        e.into()
      })
  }

  /// Persists the process id of a topology.
  pub async fn report_topology_pid(&self, uuid: &str, pid: u32) -> Result<()> {
    self.storage.set_topology_pid(uuid, pid).await.map_err(|e| {
      error!(topology = %uuid, pid, error = %e, "couldn't report topology pid");
      e.into()
    })
  }

  /// Persists the status of a worker.
  pub async fn report_worker(&self, name: &str, status: WorkerStatus) -> Result<()> {
    self
      .storage
      .set_worker_status(name, status)
      .await
      .map_err(|e| {
        error!(worker = %name, status = %status, error = %e, "couldn't report worker status");
        e.into()
      })
  }

  /// Takes at most one message from the mailbox and acts on it.
  pub(crate) async fn handle_incoming_requests(&self) -> Result<()> {
    if self.is_shutting_down.load(Ordering::SeqCst) {
      return Ok(());
    }
    let Some(message) = self.storage.get_message(&self.name).await? else {
      return Ok(());
    };
    if message.created < self.start_time {
      debug!(worker = %self.name, cmd = %message.cmd, "ignoring message sent before start");
      return Ok(());
    }
    let command = message.command()?;
    debug!(worker = %self.name, cmd = %command.name(), "handling message");

    match command {
      Command::StartTopology { uuid } => self.start_assigned_topology(&uuid).await,
      Command::StartTopologies { uuids } => {
        let results = join_all(uuids.iter().map(|uuid| self.start_assigned_topology(uuid))).await;
        results.into_iter().collect()
      }
      Command::StopTopology(request) => {
        info!(topology = %request.uuid, "stopping topology");
        self.client.stop_topology(&request.uuid).await?;
        Ok(())
      }
      Command::StopTopologies { stop_topologies } => {
        let results = join_all(stop_topologies.iter().map(|request| async move {
          info!(topology = %request.uuid, "stopping topology");
          self.client.stop_topology(&request.uuid).await
        }))
        .await;
        results.into_iter().collect::<std::result::Result<(), _>>()?;
        Ok(())
      }
      Command::KillTopology { uuid } => {
        info!(topology = %uuid, "killing topology");
        self.client.kill_topology(&uuid).await?;
        Ok(())
      }
      Command::Shutdown => {
        info!(worker = %self.name, "shutdown requested by message");
        if let Err(e) = self.client.shutdown().await {
          error!(worker = %self.name, error = %e, "client shutdown failed");
        }
        info!(worker = %self.name, "exiting with code 0");
        self.client.exit(0);
        Ok(())
      }
      Command::Rebalance => {
        self.leadership.force_rebalance();
        Ok(())
      }
      Command::Unknown { cmd } => {
        debug!(worker = %self.name, cmd = %cmd, "ignoring unknown command");
        Ok(())
      }
    }
  }

  /// Starts `uuid` only if it is still waiting on this worker.
  async fn start_assigned_topology(&self, uuid: &str) -> Result<()> {
    let topology = self.storage.get_topology_info(uuid).await?;
    if !topology.is_on(&self.name) || topology.status != TopologyStatus::Waiting {
      debug!(
        topology = %uuid,
        status = %topology.status,
        "topology no longer waiting on this worker, not starting"
      );
      return Ok(());
    }
    info!(topology = %uuid, "starting topology");
    self.client.start_topology(uuid, &topology.config).await?;
    Ok(())
  }

  /// Hands the topologies storage lists as running here to the client for
  /// reconciliation.
  pub(crate) async fn check_assigned_topologies(&self) -> Result<()> {
    let running: Vec<String> = self
      .storage
      .get_topologies_for_worker(&self.name)
      .await?
      .into_iter()
      .filter(|t| t.status == TopologyStatus::Running)
      .map(|t| t.uuid)
      .collect();
    self.client.resolve_topology_mismatches(&running).await?;
    Ok(())
  }

  /// Re-registers the worker or marks it alive again if its record drifted.
  pub(crate) async fn check_worker_status(&self) -> Result<()> {
    if self.is_shutting_down.load(Ordering::SeqCst)
      || self.shutdown_requested.load(Ordering::SeqCst)
    {
      return Ok(());
    }
    let workers = self.storage.get_worker_status().await?;
    match workers.iter().find(|w| w.name == self.name) {
      None => {
        warn!(worker = %self.name, "worker record missing, registering again");
        self.storage.register_worker(&self.name).await?;
      }
      Some(record) if record.status != WorkerStatus::Alive => {
        warn!(worker = %self.name, status = %record.status, "worker not marked alive, correcting");
        self
          .storage
          .set_worker_status(&self.name, WorkerStatus::Alive)
          .await?;
      }
      Some(_) => {}
    }
    Ok(())
  }
}
