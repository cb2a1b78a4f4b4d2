use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{Executor, Id, Job, Run};

const EPSILON: f64 = 1e-9;

/// In-memory tables of jobs, executors and runs.
///
/// Only the control loop holds a `Registry`; everything here is plain
/// synchronous bookkeeping and never calls out.
#[derive(Debug)]
pub struct Registry<I> {
    jobs: HashMap<I, Job<I>>,
    runs: HashMap<I, Run<I>>,
    executors: Vec<Executor<I>>,
    run_count: u64,
}

impl<I: Id> Default for Registry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Id> Registry<I> {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            runs: HashMap::new(),
            executors: Vec::new(),
            run_count: 0,
        }
    }

    /// Add a job and its pending run.
    pub fn add_job(&mut self, job: Job<I>) -> Result<&Run<I>> {
        check_cost(&job)?;
        if self.jobs.contains_key(&job.id) {
            return Err(SchedulerError::JobExists(job.id.to_string()));
        }
        let id = job.id.clone();
        let run = Run::new(job.clone(), self.run_count);
        self.run_count += 1;
        self.jobs.insert(id.clone(), job);
        Ok(self.runs.entry(id).or_insert(run))
    }

    /// Replace a job's definition, bumping its revision. A pending run picks
    /// up the new definition at once; a bound run keeps its snapshot until
    /// the planner restarts it.
    pub fn change_job(&mut self, mut job: Job<I>) -> Result<()> {
        check_cost(&job)?;
        let existing = self
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| SchedulerError::JobNotFound(job.id.to_string()))?;
        job.changed_count = existing.changed_count + 1;
        *existing = job.clone();
        if let Some(run) = self.runs.get_mut(&job.id) {
            if run.executor_id.is_none() && !run.stopping {
                run.job = job;
            }
        }
        Ok(())
    }

    pub fn job(&self, id: &I) -> Option<&Job<I>> {
        self.jobs.get(id)
    }

    pub fn run(&self, id: &I) -> Option<&Run<I>> {
        self.runs.get(id)
    }

    pub fn run_mut(&mut self, id: &I) -> Option<&mut Run<I>> {
        self.runs.get_mut(id)
    }

    /// Delete a job together with its run.
    pub fn remove_run(&mut self, id: &I) -> Option<Run<I>> {
        self.jobs.remove(id);
        self.runs.remove(id)
    }

    /// All runs in insertion order.
    pub fn runs(&self) -> Vec<&Run<I>> {
        let mut runs: Vec<&Run<I>> = self.runs.values().collect();
        runs.sort_by_key(|r| r.count);
        runs
    }

    pub fn runs_on_executor(&self, executor_id: &I) -> Vec<&Run<I>> {
        let mut runs: Vec<&Run<I>> = self
            .runs
            .values()
            .filter(|r| r.is_bound_to(executor_id))
            .collect();
        runs.sort_by_key(|r| r.count);
        runs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Runs currently counted against `total_max_job_count`.
    pub fn started_count(&self) -> usize {
        self.runs.values().filter(|r| r.started_at.is_some()).count()
    }

    pub fn add_executor(&mut self, mut executor: Executor<I>, now: Instant) -> Result<()> {
        check_capacity(&executor)?;
        if self.executor(&executor.id).is_some() {
            return Err(SchedulerError::ExecutorExists(executor.id.to_string()));
        }
        if executor.kept_alive_at.is_none() {
            executor.kept_alive_at = Some(now);
        }
        self.executors.push(executor);
        Ok(())
    }

    /// Apply a changed executor definition. Returns true when capacity or
    /// settings changed, which bumps the revision and so invalidates every
    /// run started under the old one.
    pub fn change_executor(&mut self, executor: Executor<I>) -> Result<bool> {
        check_capacity(&executor)?;
        let existing = self
            .executor_mut(&executor.id)
            .ok_or_else(|| SchedulerError::ExecutorNotFound(executor.id.to_string()))?;
        let revised = existing.cost_capacity != executor.cost_capacity
            || existing.settings_hash != executor.settings_hash;
        existing.name = executor.name;
        existing.paused = executor.paused;
        existing.cost_capacity = executor.cost_capacity;
        existing.settings_hash = executor.settings_hash;
        if executor.kept_alive_at.is_some() {
            existing.kept_alive_at = executor.kept_alive_at;
        }
        if revised {
            existing.changed_count += 1;
        }
        Ok(revised)
    }

    pub fn remove_executor(&mut self, id: &I) -> Result<Executor<I>> {
        let index = self
            .executors
            .iter()
            .position(|e| &e.id == id)
            .ok_or_else(|| SchedulerError::ExecutorNotFound(id.to_string()))?;
        Ok(self.executors.remove(index))
    }

    pub fn set_executor_alive(&mut self, id: &I, now: Instant) -> Result<()> {
        let executor = self
            .executor_mut(id)
            .ok_or_else(|| SchedulerError::ExecutorNotFound(id.to_string()))?;
        executor.kept_alive_at = Some(now);
        Ok(())
    }

    pub fn executor(&self, id: &I) -> Option<&Executor<I>> {
        self.executors.iter().find(|e| &e.id == id)
    }

    pub fn executor_mut(&mut self, id: &I) -> Option<&mut Executor<I>> {
        self.executors.iter_mut().find(|e| &e.id == id)
    }

    /// Executors in insertion order.
    pub fn executors(&self) -> &[Executor<I>] {
        &self.executors
    }

    /// Verify the registry invariants. Returns a description of the first
    /// violation found.
    ///
    /// The per-executor and global limits only hold once the planner has
    /// caught up, so call this between reconcile passes, not during one.
    pub fn check_invariants(&self, config: &SchedulerConfig) -> std::result::Result<(), String> {
        if self.jobs.len() != self.runs.len() {
            return Err(format!(
                "{} jobs but {} runs",
                self.jobs.len(),
                self.runs.len()
            ));
        }
        for (id, run) in &self.runs {
            if &run.job.id != id {
                return Err(format!("run keyed {} holds job {}", id, run.job.id));
            }
            if !self.jobs.contains_key(id) {
                return Err(format!("run {} has no job", id));
            }
            if run.ran_at.is_some() && run.started_at.is_none() {
                return Err(format!("run {} ran without being started", id));
            }
            if run.started_at.is_some() && run.executor_id.is_none() {
                return Err(format!("run {} started without an executor", id));
            }
            if run.removing && !run.stopping {
                return Err(format!("run {} is removing but not stopping", id));
            }
            if let Some(executor_id) = &run.executor_id {
                if !run.stopping && self.executor(executor_id).is_none() {
                    return Err(format!("run {} is bound to missing executor {}", id, executor_id));
                }
            }
        }

        for executor in &self.executors {
            let (mut load, mut starting) = (0.0, 0);
            for run in self.runs.values() {
                if run.stopping || !run.is_bound_to(&executor.id) || run.started_at.is_none() {
                    continue;
                }
                load += run.job.cost;
                if run.is_starting() {
                    starting += 1;
                }
            }
            if load > executor.cost_capacity + EPSILON {
                return Err(format!(
                    "executor {} carries {} over capacity {}",
                    executor.id, load, executor.cost_capacity
                ));
            }
            if starting > config.simultaneous_starts {
                return Err(format!(
                    "executor {} has {} starting runs, limit {}",
                    executor.id, starting, config.simultaneous_starts
                ));
            }
        }

        let started = self.started_count();
        if config.total_max_job_count > 0 && started > config.total_max_job_count {
            return Err(format!(
                "{} runs started, limit {}",
                started, config.total_max_job_count
            ));
        }
        Ok(())
    }
}

fn check_cost<I: Id>(job: &Job<I>) -> Result<()> {
    if !job.cost.is_finite() || job.cost < 0.0 {
        return Err(SchedulerError::InvalidJob(format!(
            "cost of {} must be a non-negative number, got {}",
            job.id, job.cost
        )));
    }
    Ok(())
}

fn check_capacity<I: Id>(executor: &Executor<I>) -> Result<()> {
    if !executor.cost_capacity.is_finite() || executor.cost_capacity < 0.0 {
        return Err(SchedulerError::InvalidExecutor(format!(
            "capacity of {} must be a non-negative number, got {}",
            executor.id, executor.cost_capacity
        )));
    }
    Ok(())
}

/// Whether an executor's last keepalive falls inside `alive_window`.
pub fn is_alive<I>(executor: &Executor<I>, now: Instant, alive_window: Option<Duration>) -> bool {
    let Some(window) = alive_window else {
        return true;
    };
    match executor.kept_alive_at {
        Some(at) => now.saturating_duration_since(at) < window,
        None => false,
    }
}
