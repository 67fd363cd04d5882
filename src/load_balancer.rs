//! Weighted, affinity-aware placement of topologies onto workers.
//!
//! Pure computation: the balancer only knows the workers it was built with and
//! the load it accumulated itself. It is rebuilt for every leader step.
//!
//! A worker's score for a topology is the load it would carry after accepting
//! it, divided by the affinity factor when the topology prefers that worker.
//! The lowest score wins; ties go to the less loaded worker, then to the
//! earlier worker in input order.

use std::cmp::Ordering;
use std::collections::HashMap;

/// Default attraction of affinity workers.
pub const AFFINITY_FACTOR: f64 = 5.0;

/// Worker known to the balancer together with its accumulated weight.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerLoad {
  /// Worker name.
  pub name: String,
  /// Sum of the weights of topologies placed on the worker.
  pub weight: f64,
}

impl WorkerLoad {
  /// Creates a worker entry with the given starting weight.
  #[must_use]
  pub fn new(name: impl Into<String>, weight: f64) -> Self {
    Self {
      name: name.into(),
      weight,
    }
  }
}

/// Currently assigned topology as seen by [`LoadBalancer::rebalance`].
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceTopology {
  /// Topology identity.
  pub uuid: String,
  /// Topology weight.
  pub weight: f64,
  /// Worker currently running the topology.
  pub worker: String,
  /// Preferred workers.
  pub affinity: Vec<String>,
}

/// Single move proposed by a rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceChange {
  /// Topology to move.
  pub uuid: String,
  /// Worker currently holding it.
  pub worker_old: String,
  /// Worker it should move to.
  pub worker_new: String,
}

/// Outcome of a rebalance computation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RebalancePlan {
  /// Moves needed to reach the recomputed distribution.
  pub changes: Vec<RebalanceChange>,
}

impl RebalancePlan {
  /// Returns true if no topology needs to move.
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.changes.is_empty()
  }
}

/// Greedy least-loaded balancer with affinity.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
  workers: Vec<WorkerLoad>,
  affinity_factor: f64,
}

impl LoadBalancer {
  /// Creates a balancer over `workers`, seeded with their current weights.
  #[must_use]
  pub fn new(workers: Vec<WorkerLoad>, affinity_factor: f64) -> Self {
    Self {
      workers,
      affinity_factor,
    }
  }

  /// Current per-worker accumulated weights, in input order.
  #[must_use]
  pub fn loads(&self) -> &[WorkerLoad] {
    &self.workers
  }

  /// Picks the worker for a topology of `weight` and books the weight on it.
  ///
  /// Returns `None` only when the balancer has no workers.
  pub fn next(&mut self, affinity: &[String], weight: f64) -> Option<String> {
    let index = self.pick(affinity, weight, None)?;
    let worker = &mut self.workers[index];
    worker.weight += weight;
    Some(worker.name.clone())
  }

  /// Takes `weight` back from `worker`, undoing a [`next`](Self::next) whose
  /// placement did not happen. Unknown workers are ignored.
  pub fn release(&mut self, worker: &str, weight: f64) {
    if let Some(entry) = self.workers.iter_mut().find(|w| w.name == worker) {
      entry.weight -= weight;
    }
  }

  /// Recomputes the placement of `topologies` from scratch and returns the moves.
  ///
  /// Heavier topologies are placed first. Among equal weights the workers'
  /// current topologies are taken in turns, then in input order, so the same
  /// input always yields the same plan. When several workers score equally,
  /// the topology stays where it is.
  #[must_use]
  pub fn rebalance(&self, topologies: &[RebalanceTopology]) -> RebalancePlan {
    let mut scratch = LoadBalancer::new(
      self
        .workers
        .iter()
        .map(|w| WorkerLoad::new(w.name.clone(), 0.0))
        .collect(),
      self.affinity_factor,
    );

    // Interleave the workers' current topologies so that a balanced layout
    // is recomputed onto itself.
    let mut seen: HashMap<&str, usize> = HashMap::new();
    let mut order: Vec<(usize, &RebalanceTopology)> = topologies
      .iter()
      .map(|t| {
        let rank = seen.entry(t.worker.as_str()).or_default();
        *rank += 1;
        (*rank, t)
      })
      .collect();
    order.sort_by(|(rank_a, a), (rank_b, b)| {
      b.weight
        .total_cmp(&a.weight)
        .then_with(|| rank_a.cmp(rank_b))
    });

    let mut plan = RebalancePlan::default();
    for (_, topology) in order {
      let Some(index) = scratch.pick(&topology.affinity, topology.weight, Some(&topology.worker))
      else {
        return RebalancePlan::default();
      };
      let target = &mut scratch.workers[index];
      target.weight += topology.weight;
      if target.name != topology.worker {
        plan.changes.push(RebalanceChange {
          uuid: topology.uuid.clone(),
          worker_old: topology.worker.clone(),
          worker_new: target.name.clone(),
        });
      }
    }
    plan
  }

  fn score(&self, worker: &WorkerLoad, affinity: &[String], weight: f64) -> f64 {
    let load = worker.weight + weight;
    if affinity.iter().any(|a| *a == worker.name) {
      load / self.affinity_factor
    } else {
      load
    }
  }

  fn pick(&self, affinity: &[String], weight: f64, current: Option<&str>) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, worker) in self.workers.iter().enumerate() {
      let score = self.score(worker, affinity, weight);
      let better = match best {
        None => true,
        Some((best_index, best_score)) => {
          let best_worker = &self.workers[best_index];
          match score.total_cmp(&best_score) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
              let is_current = current == Some(worker.name.as_str());
              let best_is_current = current == Some(best_worker.name.as_str());
              match (is_current, best_is_current) {
                (true, false) => true,
                (false, true) => false,
                _ => worker.weight < best_worker.weight,
              }
            }
          }
        }
      };
      if better {
        best = Some((index, score));
      }
    }
    best.map(|(index, _)| index)
  }
}
