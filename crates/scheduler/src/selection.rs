//! Resource scoring and dispatch ordering.
//!
//! Everything here is a pure function over snapshots so the instance loop
//! can call it while holding its state lock.

use std::cmp::Ordering;

use kiln_core::{Priority, SchedulingStrategy, Task};

use crate::registry::ResourceInfo;
use crate::types::ResourceScorer;

/// Score one eligible resource for `task` under `strategy`. Higher is better.
pub fn score(
    strategy: SchedulingStrategy,
    task: &Task,
    resource: &ResourceInfo,
    scorer: Option<&dyn ResourceScorer>,
) -> f64 {
    match strategy {
        SchedulingStrategy::Fifo | SchedulingStrategy::RoundRobin => 1.0,
        SchedulingStrategy::Priority => f64::from(task.priority.value()),
        SchedulingStrategy::Weighted => task.weight,
        SchedulingStrategy::LeastLoaded => 1.0 - resource.utilization(),
        SchedulingStrategy::Custom => match scorer {
            Some(s) => s.score(task, resource),
            None => 1.0,
        },
    }
}

/// Pick a resource for `task` out of `candidates` (already filtered to
/// online resources with spare capacity, in registration order).
///
/// Returns the index of the chosen candidate. ROUND_ROBIN rotates `cursor`
/// over the candidates; every other strategy takes the highest score, with
/// ties going to the earliest registration.
pub fn select_resource(
    strategy: SchedulingStrategy,
    task: &Task,
    candidates: &[ResourceInfo],
    scorer: Option<&dyn ResourceScorer>,
    cursor: &mut usize,
) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    if strategy == SchedulingStrategy::RoundRobin {
        let idx = *cursor % candidates.len();
        *cursor = cursor.wrapping_add(1);
        return Some(idx);
    }

    let mut best: Option<(usize, f64)> = None;
    for (idx, resource) in candidates.iter().enumerate() {
        let mut s = score(strategy, task, resource, scorer);
        if s.is_nan() {
            s = f64::NEG_INFINITY;
        }
        match best {
            Some((_, top)) if s <= top => {}
            _ => best = Some((idx, s)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Ordering key of one queued task.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub id: String,
    pub priority: Priority,
    pub weight: f64,
    /// Arrival sequence number within the instance.
    pub seq: u64,
}

/// Sort queued tasks into dispatch order.
///
/// PRIORITY puts higher priorities first, WEIGHTED heavier weights first,
/// everything else keeps arrival order. Ties always fall back to arrival.
pub fn order_pending(strategy: SchedulingStrategy, pending: &mut [PendingTask]) {
    pending.sort_by(|a, b| {
        let primary = match strategy {
            SchedulingStrategy::Priority => b.priority.cmp(&a.priority),
            SchedulingStrategy::Weighted => b
                .weight
                .partial_cmp(&a.weight)
                .unwrap_or(Ordering::Equal),
            _ => Ordering::Equal,
        };
        primary.then(a.seq.cmp(&b.seq))
    });
}
