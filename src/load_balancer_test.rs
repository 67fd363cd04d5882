//! Tests for worker selection and rebalance planning.

use crate::load_balancer::{
  LoadBalancer, RebalanceChange, RebalanceTopology, WorkerLoad, AFFINITY_FACTOR,
};
use proptest::prelude::*;
use std::collections::HashSet;

fn balancer(loads: &[(&str, f64)]) -> LoadBalancer {
  LoadBalancer::new(
    loads.iter().map(|(name, w)| WorkerLoad::new(*name, *w)).collect(),
    AFFINITY_FACTOR,
  )
}

fn topology(uuid: &str, worker: &str, weight: f64, affinity: &[&str]) -> RebalanceTopology {
  RebalanceTopology {
    uuid: uuid.to_string(),
    weight,
    worker: worker.to_string(),
    affinity: affinity.iter().map(|a| a.to_string()).collect(),
  }
}

#[test]
fn test_next_least_loaded() {
  let mut lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  // Tie goes to input order
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w1"));
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w2"));
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w1"));
  assert_eq!(lb.loads()[0].weight, 2.0);
  assert_eq!(lb.loads()[1].weight, 1.0);
}

#[test]
fn test_next_respects_existing_load() {
  let mut lb = balancer(&[("w1", 4.0), ("w2", 1.0), ("w3", 2.0)]);
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w2"));
  // w2 and w3 tie at 3, input order decides
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w2"));
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w3"));
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w2"));
}

#[test]
fn test_next_prefers_affinity_worker() {
  // A carries more than B, but the affinity factor makes A the better choice
  let mut lb = balancer(&[("A", 2.0), ("B", 1.0)]);
  assert_eq!(lb.next(&["A".to_string()], 1.0).as_deref(), Some("A"));
}

#[test]
fn test_next_affinity_does_not_override_heavy_skew() {
  let mut lb = balancer(&[("A", 20.0), ("B", 1.0)]);
  assert_eq!(lb.next(&["A".to_string()], 1.0).as_deref(), Some("B"));
}

#[test]
fn test_release_undoes_booking() {
  let mut lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  let target = lb.next(&[], 10.0).unwrap();
  assert_eq!(target, "w1");
  lb.release(&target, 10.0);
  assert_eq!(lb.loads()[0].weight, 0.0);
  assert_eq!(lb.next(&[], 1.0).as_deref(), Some("w1"));

  // Unknown worker
  lb.release("w9", 1.0);
  assert_eq!(lb.loads()[0].weight, 1.0);
  assert_eq!(lb.loads()[1].weight, 0.0);
}

#[test]
fn test_next_without_workers() {
  let mut lb = balancer(&[]);
  assert_eq!(lb.next(&[], 1.0), None);
}

#[test]
fn test_rebalance_skewed() {
  let lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  let topologies = vec![
    topology("t1", "w1", 1.0, &[]),
    topology("t2", "w1", 1.0, &[]),
    topology("t3", "w1", 1.0, &[]),
    topology("t4", "w1", 1.0, &[]),
  ];
  let plan = lb.rebalance(&topologies);
  assert_eq!(
    plan.changes,
    vec![
      RebalanceChange {
        uuid: "t2".to_string(),
        worker_old: "w1".to_string(),
        worker_new: "w2".to_string(),
      },
      RebalanceChange {
        uuid: "t4".to_string(),
        worker_old: "w1".to_string(),
        worker_new: "w2".to_string(),
      },
    ]
  );
}

#[test]
fn test_rebalance_balanced_is_stable() {
  let lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  let topologies = vec![
    topology("t1", "w1", 1.0, &[]),
    topology("t2", "w1", 1.0, &[]),
    topology("t3", "w2", 1.0, &[]),
    topology("t4", "w2", 1.0, &[]),
  ];
  assert!(lb.rebalance(&topologies).is_empty());
}

#[test]
fn test_rebalance_keeps_affinity_placement() {
  let lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  let topologies = vec![
    topology("t1", "w2", 1.0, &["w2"]),
    topology("t2", "w1", 1.0, &[]),
  ];
  assert!(lb.rebalance(&topologies).is_empty());
}

#[test]
fn test_rebalance_places_heavy_first() {
  let lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  let topologies = vec![
    topology("small", "w1", 1.0, &[]),
    topology("big", "w2", 3.0, &[]),
  ];
  assert!(lb.rebalance(&topologies).is_empty());
}

#[test]
fn test_rebalance_ignores_accumulated_load() {
  // Loads booked through next() do not leak into a rebalance
  let mut lb = balancer(&[("w1", 0.0), ("w2", 0.0)]);
  lb.next(&[], 10.0);
  let topologies = vec![topology("t1", "w1", 1.0, &[])];
  assert!(lb.rebalance(&topologies).is_empty());
}

#[test]
fn test_rebalance_empty_inputs() {
  assert!(balancer(&[]).rebalance(&[topology("t1", "w1", 1.0, &[])]).is_empty());
  assert!(balancer(&[("w1", 0.0)]).rebalance(&[]).is_empty());
}

fn arb_cluster() -> impl Strategy<Value = (usize, Vec<(u8, usize, Option<usize>)>)> {
  (1usize..5).prop_flat_map(|workers| {
    (
      Just(workers),
      prop::collection::vec(
        (1u8..10, 0..workers, prop::option::of(0..workers)),
        0..20,
      ),
    )
  })
}

fn build(workers: usize, layout: &[(u8, usize, Option<usize>)]) -> (LoadBalancer, Vec<RebalanceTopology>) {
  let names: Vec<String> = (0..workers).map(|i| format!("w{}", i)).collect();
  let lb = LoadBalancer::new(
    names.iter().map(|n| WorkerLoad::new(n.clone(), 0.0)).collect(),
    AFFINITY_FACTOR,
  );
  let topologies = layout
    .iter()
    .enumerate()
    .map(|(i, (weight, worker, affinity))| RebalanceTopology {
      uuid: format!("t{}", i),
      weight: f64::from(*weight),
      worker: names[*worker].clone(),
      affinity: affinity.iter().map(|a| names[*a].clone()).collect(),
    })
    .collect();
  (lb, topologies)
}

proptest! {
  #[test]
  fn test_rebalance_deterministic((workers, layout) in arb_cluster()) {
    let (lb, topologies) = build(workers, &layout);
    let first = lb.rebalance(&topologies);
    let second = lb.rebalance(&topologies);
    let (fresh, _) = build(workers, &layout);
    prop_assert_eq!(&first, &second);
    prop_assert_eq!(&first, &fresh.rebalance(&topologies));
  }

  #[test]
  fn test_rebalance_changes_are_valid((workers, layout) in arb_cluster()) {
    let (lb, topologies) = build(workers, &layout);
    let names: HashSet<&str> = lb.loads().iter().map(|w| w.name.as_str()).collect();
    let plan = lb.rebalance(&topologies);
    let mut moved = HashSet::new();
    for change in &plan.changes {
      prop_assert!(names.contains(change.worker_new.as_str()));
      prop_assert_ne!(&change.worker_old, &change.worker_new);
      let before = topologies.iter().find(|t| t.uuid == change.uuid);
      prop_assert_eq!(before.map(|t| t.worker.as_str()), Some(change.worker_old.as_str()));
      prop_assert!(moved.insert(change.uuid.clone()));
    }
  }

  #[test]
  fn test_next_books_every_weight(weights in prop::collection::vec(1u8..10, 0..30), workers in 1usize..5) {
    let mut lb = LoadBalancer::new(
      (0..workers).map(|i| WorkerLoad::new(format!("w{}", i), 0.0)).collect(),
      AFFINITY_FACTOR,
    );
    let mut total = 0.0;
    for weight in &weights {
      let picked = lb.next(&[], f64::from(*weight));
      prop_assert!(picked.is_some());
      total += f64::from(*weight);
    }
    let booked: f64 = lb.loads().iter().map(|w| w.weight).sum();
    prop_assert_eq!(booked, total);
    // Greedy placement keeps the spread within the heaviest single weight
    let max = lb.loads().iter().map(|w| w.weight).fold(0.0, f64::max);
    let min = lb.loads().iter().map(|w| w.weight).fold(f64::INFINITY, f64::min);
    prop_assert!(max - min <= 9.0);
  }
}
