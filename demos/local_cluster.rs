//! # Local Cluster Example
//!
//! Three workers share one in-memory coordination storage. One of them is
//! elected leader and spreads the topologies over the cluster; after a worker
//! shuts down, its topologies move to the remaining two.
//!
//! Run with `cargo run --example local_cluster`.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use topology_coordinator::{
  ClientError, CoordinationConfig, CoordinationStorage, InMemoryStorage, TopologyCoordinator,
  TopologyCoordinatorClient, TopologyRecord, TopologyStatus,
};

/// Pretends to run topologies and reports them as running right away.
struct PrintingRuntime {
  worker: String,
  storage: Arc<InMemoryStorage>,
}

#[async_trait::async_trait]
impl TopologyCoordinatorClient for PrintingRuntime {
  async fn start_topology(&self, uuid: &str, config: &serde_json::Value) -> Result<(), ClientError> {
    println!("[{}] start {} with {}", self.worker, uuid, config);
    self
      .storage
      .set_topology_status(uuid, Some(&self.worker), TopologyStatus::Running, None)
      .await
      .map_err(|e| ClientError::Topology {
        uuid: uuid.to_string(),
        reason: e.to_string(),
      })
  }

  async fn stop_topology(&self, uuid: &str) -> Result<(), ClientError> {
    println!("[{}] stop {}", self.worker, uuid);
    self
      .storage
      .set_topology_status(uuid, Some(&self.worker), TopologyStatus::Unassigned, None)
      .await
      .map_err(|e| ClientError::Other(e.to_string()))
  }

  async fn kill_topology(&self, uuid: &str) -> Result<(), ClientError> {
    println!("[{}] kill {}", self.worker, uuid);
    self.stop_topology(uuid).await
  }

  async fn resolve_topology_mismatches(&self, _running: &[String]) -> Result<(), ClientError> {
    Ok(())
  }

  async fn shutdown(&self) -> Result<(), ClientError> {
    println!("[{}] shutting down local topologies", self.worker);
    Ok(())
  }

  fn exit(&self, code: i32) {
    println!("[{}] exit({})", self.worker, code);
  }
}

async fn print_topologies(storage: &InMemoryStorage) {
  for topology in storage.get_topology_status().await.unwrap_or_default() {
    println!(
      "  {:<4} {:<10} {}",
      topology.uuid,
      topology.status.as_str(),
      topology.worker.as_deref().unwrap_or("-")
    );
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  // Initialize logging
  tracing_subscriber::fmt::init();

  let config = CoordinationConfig::default()
    .with_leader_loop_interval(Duration::from_millis(500))
    .with_coordinator_loop_interval(Duration::from_millis(200))
    .with_ping_interval(Duration::from_millis(100));

  let storage = Arc::new(InMemoryStorage::new());
  for i in 0..6 {
    let mut record = TopologyRecord::new(format!("t{}", i), json!({ "spouts": 1, "bolts": i }));
    if i == 0 {
      record = record.with_weight(3.0).with_affinity(["worker-2"]);
    }
    storage.register_topology(record).await;
  }

  let mut workers = Vec::new();
  for name in ["worker-1", "worker-2", "worker-3"] {
    let runtime = Arc::new(PrintingRuntime {
      worker: name.to_string(),
      storage: Arc::clone(&storage),
    });
    let dyn_storage: Arc<dyn CoordinationStorage> = storage.clone();
    let coordinator = Arc::new(TopologyCoordinator::new(
      name,
      dyn_storage,
      runtime,
      config.clone(),
    )?);
    let handle = coordinator.run();
    workers.push((coordinator, handle));
  }

  tokio::time::sleep(Duration::from_secs(2)).await;
  println!("\nAfter start:");
  print_topologies(&storage).await;

  let (first, _) = &workers[0];
  println!("\nStopping {}", first.name());
  first.shutdown().await;

  tokio::time::sleep(Duration::from_secs(3)).await;
  println!("\nAfter failover:");
  print_topologies(&storage).await;

  for (coordinator, handle) in workers {
    coordinator.shutdown().await;
    let _ = handle.await;
  }
  println!("\nDone.");
  Ok(())
}
