//! Leader election and global reconciliation.
//!
//! Every worker runs a [`TopologyLeader`]. While not leader it refreshes the
//! cluster health records and, if nobody holds the leader flag, competes for
//! it. The winner assigns unassigned topologies, frees the topologies of dead
//! workers and periodically rebalances.

use crate::config::CoordinationConfig;
use crate::error::Result;
use crate::lifecycle::{LoopControl, LoopState};
use crate::load_balancer::{LoadBalancer, RebalanceTopology, WorkerLoad};
use crate::message::{Command, StopRequest};
use crate::model::{
  LeadershipStatus, TopologyRecord, TopologyStatus, WorkerLStatus, WorkerRecord, WorkerStatus,
};
use crate::storage::CoordinationStorage;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Leader loop of one worker.
pub struct TopologyLeader {
  name: String,
  storage: Arc<dyn CoordinationStorage>,
  config: CoordinationConfig,
  is_leader: AtomicBool,
  /// Unix millis of the next scheduled rebalance.
  next_rebalance: AtomicI64,
  control: LoopControl,
}

impl std::fmt::Debug for TopologyLeader {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TopologyLeader")
      .field("name", &self.name)
      .field("is_leader", &self.is_leader())
      .field("state", &self.control.state())
      .finish()
  }
}

/// Oldest timestamp still considered fresh for `age`.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
  chrono::Duration::from_std(age)
    .ok()
    .and_then(|age| now.checked_sub_signed(age))
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn millis(duration: Duration) -> i64 {
  i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

impl TopologyLeader {
  /// Creates the leader for worker `name`. The first rebalance is due one
  /// rebalance interval from now.
  ///
  /// Fails with [`CoordinationError::Config`](crate::error::CoordinationError::Config)
  /// if `config` does not validate.
  pub fn new(
    name: impl Into<String>,
    storage: Arc<dyn CoordinationStorage>,
    config: CoordinationConfig,
  ) -> Result<Self> {
    config.validate()?;
    let first_rebalance =
      Utc::now().timestamp_millis().saturating_add(millis(config.rebalance_interval));
    Ok(Self {
      name: name.into(),
      storage,
      config,
      is_leader: AtomicBool::new(false),
      next_rebalance: AtomicI64::new(first_rebalance),
      control: LoopControl::new(),
    })
  }

  /// Worker name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Whether this worker currently acts as leader.
  pub fn is_leader(&self) -> bool {
    self.is_leader.load(Ordering::SeqCst)
  }

  /// Current state of the leader loop.
  pub fn state(&self) -> LoopState {
    self.control.state()
  }

  /// Whether the loop task is alive.
  pub fn is_running(&self) -> bool {
    self.control.is_running()
  }

  /// Spawns the leader loop.
  ///
  /// Each iteration sleeps one leader interval, then runs
  /// [`single_loop_step`](Self::single_loop_step). Step failures are logged
  /// and retried on the next iteration. The loop ends on
  /// [`shutdown`](Self::shutdown).
  pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
    let Some(token) = self.control.start() else {
      warn!(worker = %self.name, "leader loop already running");
      return tokio::spawn(async {});
    };
    let leader = Arc::clone(self);
    tokio::spawn(async move {
      let _stopped = scopeguard::guard((), |_| leader.control.mark_stopped());
      info!(worker = %leader.name, "leader loop started");
      loop {
        tokio::select! {
          _ = token.cancelled() => break,
          _ = tokio::time::sleep(leader.config.leader_loop_interval) => {}
        }
        if let Err(e) = leader.single_loop_step().await {
          error!(worker = %leader.name, error = %e, "leader step failed");
        }
      }
      info!(worker = %leader.name, "leader loop stopped");
    })
  }

  /// Requests the loop to stop after the current iteration and waits for it.
  pub async fn shutdown(&self) {
    if !self.control.is_running() {
      return;
    }
    debug!(worker = %self.name, "stopping leader loop");
    self.control.stop().await;
  }

  /// Runs the reconciliation step when leader, the candidacy check otherwise.
  pub async fn single_loop_step(&self) -> Result<()> {
    if self.is_leader() {
      self.perform_leader_loop().await
    } else {
      self.check_if_leader_determined().await
    }
  }

  /// Makes the next leader step rebalance regardless of the schedule.
  pub fn force_rebalance(&self) {
    info!(worker = %self.name, "rebalance forced");
    self.next_rebalance.store(0, Ordering::SeqCst);
  }

  /// Assigns `uuid` to `target` and tells `target` to start it.
  pub async fn assign_topology_to_worker(&self, target: &str, uuid: &str) -> Result<()> {
    info!(topology = %uuid, worker = %target, "assigning topology");
    self.storage.assign_topology(uuid, target).await?;
    let command = Command::StartTopology {
      uuid: uuid.to_string(),
    };
    self
      .storage
      .send_command(target, &command, self.config.message_timeout)
      .await?;
    Ok(())
  }

  /// Candidacy check: refresh health, claim the vacant leader flag and, on
  /// winning, run one reconciliation step right away.
  pub(crate) async fn check_if_leader_determined(&self) -> Result<()> {
    if self.refresh_statuses().await? == LeadershipStatus::Ok {
      return Ok(());
    }
    debug!(worker = %self.name, "no leader, announcing candidacy");
    self.storage.announce_leader_candidacy(&self.name).await?;
    let won = self.storage.check_leader_candidacy(&self.name).await?;
    self.is_leader.store(won, Ordering::SeqCst);
    if !won {
      debug!(worker = %self.name, "candidacy lost");
      return Ok(());
    }
    info!(worker = %self.name, "this worker became leader");
    self.perform_leader_loop().await
  }

  /// Leader reconciliation step.
  ///
  /// Starts with the same health refresh as the candidacy check, so silent
  /// workers are detected while this worker leads too.
  pub(crate) async fn perform_leader_loop(&self) -> Result<()> {
    let workers = self.refresh_workers().await?;
    let still_leader = workers.iter().any(|w| w.name == self.name && w.is_leader());
    if !still_leader {
      info!(worker = %self.name, "leader flag lost, abdicating");
      self.is_leader.store(false, Ordering::SeqCst);
      return Ok(());
    }

    for dead in workers.iter().filter(|w| w.status == WorkerStatus::Dead) {
      if let Err(e) = self.handle_dead_worker(&dead.name).await {
        error!(worker = %dead.name, error = %e, "handling dead worker failed");
      }
    }

    let alive: Vec<&str> = workers
      .iter()
      .filter(|w| w.status == WorkerStatus::Alive)
      .map(|w| w.name.as_str())
      .collect();
    if alive.is_empty() {
      debug!("no alive workers, nothing to assign");
      return Ok(());
    }

    let topologies: Vec<TopologyRecord> = self
      .storage
      .get_topology_status()
      .await?
      .into_iter()
      .filter(|t| t.enabled)
      .collect();
    let placed = self.assign_unassigned(&alive, &topologies).await;

    if self.is_leader() {
      self.perform_rebalance_if_needed(&alive, &placed).await?;
    }
    Ok(())
  }

  /// Places every unassigned topology and returns the full set of topologies
  /// now sitting on alive workers, as input for a rebalance.
  pub(crate) async fn assign_unassigned(
    &self,
    alive: &[&str],
    topologies: &[TopologyRecord],
  ) -> Vec<RebalanceTopology> {
    let alive_set: HashSet<&str> = alive.iter().copied().collect();
    let on_alive = |t: &TopologyRecord| {
      t.worker
        .as_deref()
        .filter(|w| alive_set.contains(w))
        .map(str::to_string)
    };

    let mut loads: HashMap<&str, f64> = HashMap::new();
    for topology in topologies {
      if topology.status == TopologyStatus::Unassigned {
        continue;
      }
      if let Some(worker) = topology.worker.as_deref().filter(|w| alive_set.contains(w)) {
        *loads.entry(worker).or_default() += topology.effective_weight();
      }
    }
    let mut balancer = LoadBalancer::new(
      alive
        .iter()
        .map(|w| WorkerLoad::new(*w, loads.get(w).copied().unwrap_or(0.0)))
        .collect(),
      self.config.affinity_factor,
    );

    let unassigned = topologies
      .iter()
      .filter(|t| t.status == TopologyStatus::Unassigned)
      .count();
    if unassigned > 0 {
      info!(count = unassigned, "found unassigned topologies");
    }

    let mut placed = Vec::new();
    for topology in topologies {
      let weight = topology.effective_weight();
      let worker = match topology.status {
        TopologyStatus::Unassigned => {
          let Some(target) = balancer.next(&topology.worker_affinity, weight) else {
            break;
          };
          if let Err(e) = self.assign_topology_to_worker(&target, &topology.uuid).await {
            error!(topology = %topology.uuid, worker = %target, error = %e, "assignment failed");
            balancer.release(&target, weight);
            continue;
          }
          Some(target)
        }
        TopologyStatus::Waiting | TopologyStatus::Running => on_alive(topology),
        TopologyStatus::Stopped | TopologyStatus::Error => None,
      };
      if let Some(worker) = worker {
        placed.push(RebalanceTopology {
          uuid: topology.uuid.clone(),
          weight,
          worker,
          affinity: topology.worker_affinity.clone(),
        });
      }
    }
    placed
  }

  /// Rebalances when the schedule says so, sending a stop to the old worker
  /// of every moved topology.
  pub(crate) async fn perform_rebalance_if_needed(
    &self,
    workers: &[&str],
    topologies: &[RebalanceTopology],
  ) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    if self.next_rebalance.load(Ordering::SeqCst) > now {
      return Ok(());
    }
    self.next_rebalance.store(
      now.saturating_add(millis(self.config.rebalance_interval)),
      Ordering::SeqCst,
    );
    if workers.is_empty() || topologies.is_empty() {
      return Ok(());
    }

    let balancer = LoadBalancer::new(
      workers.iter().map(|w| WorkerLoad::new(*w, 0.0)).collect(),
      self.config.affinity_factor,
    );
    let plan = balancer.rebalance(topologies);
    if plan.is_empty() {
      debug!("rebalance found nothing to move");
      return Ok(());
    }

    info!(moves = plan.changes.len(), "rebalancing topologies");
    for change in plan.changes {
      info!(
        topology = %change.uuid,
        from = %change.worker_old,
        to = %change.worker_new,
        "moving topology"
      );
      let command = Command::StopTopology(StopRequest {
        uuid: change.uuid.clone(),
        new_worker: Some(change.worker_new),
      });
      if let Err(e) = self
        .storage
        .send_command(&change.worker_old, &command, self.config.message_timeout)
        .await
      {
        error!(topology = %change.uuid, error = %e, "sending rebalance stop failed");
      }
    }
    Ok(())
  }

  /// Frees the topologies of a dead worker, then marks it unloaded.
  ///
  /// Errored topologies stay where they are. Safe to run more than once.
  pub(crate) async fn handle_dead_worker(&self, name: &str) -> Result<()> {
    info!(worker = %name, "handling dead worker");
    for topology in self.storage.get_topologies_for_worker(name).await? {
      match topology.status {
        TopologyStatus::Error => {
          debug!(topology = %topology.uuid, "keeping errored topology of dead worker");
        }
        TopologyStatus::Unassigned => {}
        _ => {
          info!(topology = %topology.uuid, worker = %name, "unassigning topology of dead worker");
          self
            .storage
            .set_topology_status(&topology.uuid, None, TopologyStatus::Unassigned, None)
            .await?;
        }
      }
    }
    info!(worker = %name, "marking dead worker unloaded");
    self
      .storage
      .set_worker_status(name, WorkerStatus::Unloaded)
      .await?;
    Ok(())
  }

  /// Marks a silent worker dead and reclaims a stale leader flag.
  ///
  /// `worker` is updated in place to mirror what was written.
  pub(crate) async fn disable_defunct_worker(
    &self,
    worker: &mut WorkerRecord,
    now: DateTime<Utc>,
  ) -> Result<()> {
    if worker.status == WorkerStatus::Alive
      && worker.last_ping < cutoff(now, self.config.worker_idle_threshold)
    {
      info!(worker = %worker.name, "worker stopped pinging, marking dead");
      self
        .storage
        .set_worker_status(&worker.name, WorkerStatus::Dead)
        .await?;
      worker.status = WorkerStatus::Dead;
    }

    if worker.lstatus != WorkerLStatus::Normal
      && (worker.status != WorkerStatus::Alive
        || worker.last_ping < cutoff(now, self.config.leader_idle_threshold()))
    {
      info!(worker = %worker.name, "reclaiming leader flag");
      self
        .storage
        .set_worker_lstatus(&worker.name, WorkerLStatus::Normal)
        .await?;
      worker.lstatus = WorkerLStatus::Normal;
    }
    Ok(())
  }

  /// Unassigns waiting topologies nobody picked up and running topologies of
  /// gone workers.
  pub(crate) async fn unassign_waiting_topologies(
    &self,
    workers: &[WorkerRecord],
    now: DateTime<Utc>,
  ) -> Result<()> {
    let gone: HashSet<&str> = workers
      .iter()
      .filter(|w| matches!(w.status, WorkerStatus::Dead | WorkerStatus::Unloaded))
      .map(|w| w.name.as_str())
      .collect();
    let limit = cutoff(now, self.config.worker_idle_threshold);

    for topology in self.storage.get_topology_status().await? {
      let stale_waiting = topology.status == TopologyStatus::Waiting && topology.last_ping < limit;
      let orphaned = topology.status == TopologyStatus::Running
        && topology.worker.as_deref().is_some_and(|w| gone.contains(w));
      if !(stale_waiting || orphaned) {
        continue;
      }
      info!(
        topology = %topology.uuid,
        worker = topology.worker.as_deref().unwrap_or_default(),
        status = %topology.status,
        "unassigning stale topology"
      );
      self
        .storage
        .set_topology_status(&topology.uuid, None, TopologyStatus::Unassigned, None)
        .await?;
    }
    Ok(())
  }

  /// Health refresh run before every candidacy check.
  ///
  /// Returns [`LeadershipStatus::Ok`] if some worker still holds the leader
  /// flag afterwards.
  pub async fn refresh_statuses(&self) -> Result<LeadershipStatus> {
    let workers = self.refresh_workers().await?;
    if workers.iter().any(WorkerRecord::is_leader) {
      Ok(LeadershipStatus::Ok)
    } else {
      Ok(LeadershipStatus::Vacant)
    }
  }

  /// Reads all workers, applies the health rules and returns the records as
  /// they are after the refresh.
  async fn refresh_workers(&self) -> Result<Vec<WorkerRecord>> {
    let mut workers = self.storage.get_worker_status().await?;
    let now = Utc::now();
    for worker in workers.iter_mut() {
      if let Err(e) = self.disable_defunct_worker(worker, now).await {
        warn!(worker = %worker.name, error = %e, "refreshing worker status failed");
      }
    }
    if let Err(e) = self.unassign_waiting_topologies(&workers, now).await {
      warn!(error = %e, "refreshing topology statuses failed");
    }
    Ok(workers)
  }
}
