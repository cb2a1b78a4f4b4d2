use std::time::Duration;

use tokio::time::Instant;

use crate::scheduler::job::Id;
use crate::scheduler::registry::{is_alive, Registry};

/// Point-in-time load of one usable executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Capacity<I> {
    pub executor_id: I,
    pub capacity: f64,
    /// Sum of the cost of started runs bound to the executor.
    pub load: f64,
    /// Runs started but not yet confirmed running.
    pub starting_count: usize,
    /// Latest `started_at` among the starting runs.
    pub most_recent_start: Option<Instant>,
}

impl<I> Capacity<I> {
    pub fn spare(&self) -> f64 {
        self.capacity - self.load
    }

    /// Fraction of capacity in use; executors without capacity count as full.
    pub fn used_ratio(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 1.0;
        }
        self.load / self.capacity
    }

    pub fn spare_ratio(&self) -> f64 {
        1.0 - self.used_ratio()
    }
}

/// Capacities of every alive, non-paused executor, in executor insertion
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct CapacitySnapshot<I> {
    entries: Vec<Capacity<I>>,
}

impl<I: Id> CapacitySnapshot<I> {
    pub fn build(registry: &Registry<I>, now: Instant, alive_window: Option<Duration>) -> Self {
        let mut entries: Vec<Capacity<I>> = registry
            .executors()
            .iter()
            .filter(|e| !e.paused && is_alive(e, now, alive_window))
            .map(|e| Capacity {
                executor_id: e.id.clone(),
                capacity: e.cost_capacity,
                load: 0.0,
                starting_count: 0,
                most_recent_start: None,
            })
            .collect();

        for run in registry.runs() {
            if run.stopping {
                continue;
            }
            let (Some(executor_id), Some(started_at)) = (&run.executor_id, run.started_at) else {
                continue;
            };
            let Some(cap) = entries.iter_mut().find(|c| &c.executor_id == executor_id) else {
                continue;
            };
            cap.load += run.job.cost;
            if run.is_running() {
                continue;
            }
            cap.starting_count += 1;
            if cap.most_recent_start.map_or(true, |t| started_at > t) {
                cap.most_recent_start = Some(started_at);
            }
        }

        Self { entries }
    }

    pub fn get(&self, executor_id: &I) -> Option<&Capacity<I>> {
        self.entries.iter().find(|c| &c.executor_id == executor_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capacity<I>> {
        self.entries.iter()
    }

    /// Total spare capacity of every usable executor except `excluded`.
    pub fn spare_excluding(&self, excluded: &I) -> f64 {
        self.entries
            .iter()
            .filter(|c| &c.executor_id != excluded)
            .map(|c| c.spare().max(0.0))
            .sum()
    }
}
