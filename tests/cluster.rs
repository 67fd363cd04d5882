//! End-to-end tests: several coordinators sharing one in-memory storage.

use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use topology_coordinator::{
  ClientError, Command, CoordinationConfig, CoordinationStorage, InMemoryStorage,
  TopologyCoordinator, TopologyCoordinatorClient, TopologyRecord, TopologyStatus,
};

/// Runtime stand-in that reports its topologies straight back to storage.
struct LocalRuntime {
  name: String,
  storage: Arc<InMemoryStorage>,
  running: Mutex<HashSet<String>>,
  exits: Mutex<Vec<i32>>,
}

impl LocalRuntime {
  fn new(name: &str, storage: &Arc<InMemoryStorage>) -> Arc<Self> {
    Arc::new(Self {
      name: name.to_string(),
      storage: Arc::clone(storage),
      running: Mutex::new(HashSet::new()),
      exits: Mutex::new(Vec::new()),
    })
  }
}

#[async_trait::async_trait]
impl TopologyCoordinatorClient for LocalRuntime {
  async fn start_topology(&self, uuid: &str, _config: &serde_json::Value) -> Result<(), ClientError> {
    self.running.lock().unwrap().insert(uuid.to_string());
    self
      .storage
      .set_topology_status(uuid, Some(&self.name), TopologyStatus::Running, None)
      .await
      .map_err(|e| ClientError::Topology {
        uuid: uuid.to_string(),
        reason: e.to_string(),
      })
  }

  async fn stop_topology(&self, uuid: &str) -> Result<(), ClientError> {
    self.running.lock().unwrap().remove(uuid);
    self
      .storage
      .set_topology_status(uuid, Some(&self.name), TopologyStatus::Unassigned, None)
      .await
      .map_err(|e| ClientError::Other(e.to_string()))
  }

  async fn kill_topology(&self, uuid: &str) -> Result<(), ClientError> {
    self.stop_topology(uuid).await
  }

  async fn resolve_topology_mismatches(&self, _running: &[String]) -> Result<(), ClientError> {
    Ok(())
  }

  async fn shutdown(&self) -> Result<(), ClientError> {
    self.running.lock().unwrap().clear();
    Ok(())
  }

  fn exit(&self, code: i32) {
    self.exits.lock().unwrap().push(code);
  }
}

fn fast_config() -> CoordinationConfig {
  CoordinationConfig::default()
    .with_leader_loop_interval(Duration::from_millis(10))
    .with_coordinator_loop_interval(Duration::from_millis(10))
    .with_ping_interval(Duration::from_millis(5))
}

struct Cluster {
  storage: Arc<InMemoryStorage>,
  workers: Vec<(Arc<TopologyCoordinator>, Arc<LocalRuntime>)>,
}

impl Cluster {
  async fn start(names: &[&str], topologies: usize) -> Self {
    let storage = Arc::new(InMemoryStorage::new());
    for i in 0..topologies {
      storage
        .register_topology(TopologyRecord::new(format!("t{}", i), json!({ "index": i })))
        .await;
    }
    let workers = names
      .iter()
      .map(|name| {
        let runtime = LocalRuntime::new(name, &storage);
        let dyn_storage: Arc<dyn CoordinationStorage> = storage.clone();
        let client: Arc<dyn TopologyCoordinatorClient> = runtime.clone();
        let coordinator =
          Arc::new(TopologyCoordinator::new(*name, dyn_storage, client, fast_config()).unwrap());
        coordinator.run();
        (coordinator, runtime)
      })
      .collect();
    Self { storage, workers }
  }

  async fn topologies(&self) -> Vec<TopologyRecord> {
    self.storage.get_topology_status().await.unwrap()
  }

  async fn wait_until<F>(&self, condition: F) -> bool
  where
    F: Fn(&[TopologyRecord]) -> bool,
  {
    for _ in 0..500 {
      if condition(&self.topologies().await) {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }

  async fn leaders(&self) -> Vec<String> {
    self
      .storage
      .get_worker_status()
      .await
      .unwrap()
      .into_iter()
      .filter(|w| w.is_leader())
      .map(|w| w.name)
      .collect()
  }

  async fn shutdown(&self) {
    for (coordinator, _) in &self.workers {
      coordinator.shutdown().await;
    }
  }
}

fn all_running(topologies: &[TopologyRecord]) -> bool {
  topologies.iter().all(|t| t.status == TopologyStatus::Running)
}

#[tokio::test]
async fn test_cluster_runs_every_topology_once() {
  let cluster = Cluster::start(&["w1", "w2", "w3"], 6).await;

  assert!(cluster.wait_until(all_running).await);
  assert_eq!(cluster.leaders().await.len(), 1);

  // Every topology runs on exactly the worker storage names
  for topology in cluster.topologies().await {
    let owner = topology.worker.clone().unwrap();
    for (coordinator, runtime) in &cluster.workers {
      let runs_here = runtime.running.lock().unwrap().contains(&topology.uuid);
      assert_eq!(runs_here, coordinator.name() == owner, "{}", topology.uuid);
    }
  }

  cluster.shutdown().await;
}

#[tokio::test]
async fn test_topologies_move_off_a_stopped_worker() {
  let cluster = Cluster::start(&["w1", "w2", "w3"], 6).await;
  assert!(cluster.wait_until(all_running).await);

  let (gone, _) = &cluster.workers[0];
  gone.shutdown().await;

  let moved = cluster
    .wait_until(|topologies| {
      all_running(topologies) && topologies.iter().all(|t| t.worker.as_deref() != Some("w1"))
    })
    .await;
  assert!(moved);
  assert!(!cluster.leaders().await.contains(&"w1".to_string()));

  cluster.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_command_exits_worker() {
  let cluster = Cluster::start(&["w1", "w2"], 0).await;
  tokio::time::sleep(Duration::from_millis(20)).await;

  cluster
    .storage
    .send_command("w2", &Command::Shutdown, Duration::from_secs(20))
    .await
    .unwrap();

  let (_, runtime) = &cluster.workers[1];
  let mut exited = false;
  for _ in 0..500 {
    if runtime.exits.lock().unwrap().contains(&0) {
      exited = true;
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert!(exited);

  cluster.shutdown().await;
}
