//! Introspection projection.
//!
//! The control loop mirrors per-job timings and per-executor counts into
//! shared maps after every change. Readers take the lock only long enough to
//! copy. Nothing here is authoritative; the registry is.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::scheduler::job::{Id, RunState};
use crate::scheduler::registry::{is_alive, Registry};

/// Phase a job is in, as far as timing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugPhase {
    /// Known but not on an executor.
    Existing,
    Starting,
    Running,
    Ending,
    /// Removed from the scheduler.
    Gone,
}

/// Cumulative time a job has spent in each phase.
///
/// `known` (time since the job was first added) and `gone` (the part of it
/// spent removed) are only filled in on copies returned by [`JobDebug::settled`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobDebug {
    #[serde(skip)]
    phase_since: Option<(DebugPhase, Instant)>,
    #[serde(skip)]
    known_since: Option<Instant>,

    #[serde(serialize_with = "serialize_secs")]
    pub known: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub gone: Duration,

    #[serde(serialize_with = "serialize_secs")]
    pub existed: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub started: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub ended: Duration,
    #[serde(serialize_with = "serialize_secs")]
    pub runned: Duration,
    pub start_count: u64,
    pub job_name: String,
    pub executor_name: String,
}

fn serialize_secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl JobDebug {
    /// Close the current phase at `now` and open `phase`.
    pub fn enter(&mut self, phase: DebugPhase, now: Instant) {
        self.known_since.get_or_insert(now);
        self.close_phase(now);
        match phase {
            DebugPhase::Starting => self.start_count += 1,
            DebugPhase::Existing | DebugPhase::Gone => self.executor_name.clear(),
            DebugPhase::Running | DebugPhase::Ending => {}
        }
        self.phase_since = match phase {
            DebugPhase::Gone => None,
            other => Some((other, now)),
        };
    }

    pub fn phase(&self) -> Option<DebugPhase> {
        self.phase_since.map(|(p, _)| p)
    }

    /// A copy whose totals include the still-open phase up to `now`.
    pub fn settled(&self, now: Instant) -> JobDebug {
        let mut copy = self.clone();
        copy.close_phase(now);
        copy.phase_since = self.phase_since;
        copy.known = self
            .known_since
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();
        let tracked = copy.existed + copy.started + copy.runned + copy.ended;
        copy.gone = copy.known.saturating_sub(tracked);
        copy
    }

    fn close_phase(&mut self, now: Instant) {
        let Some((phase, since)) = self.phase_since.take() else {
            return;
        };
        let spent = now.saturating_duration_since(since);
        match phase {
            DebugPhase::Existing => self.existed += spent,
            DebugPhase::Starting => self.started += spent,
            DebugPhase::Running => self.runned += spent,
            DebugPhase::Ending => self.ended += spent,
            DebugPhase::Gone => {}
        }
    }
}

/// Per-executor counts for the debug table and dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorDebug {
    pub id: String,
    pub name: String,
    pub capacity: f64,
    pub load: f64,
    pub paused: bool,
    pub alive: bool,
    pub starting: usize,
    pub running: usize,
    pub stopping: usize,
}

/// Shared, read-mostly mirror of the scheduler state.
#[derive(Clone)]
pub struct Introspection<I> {
    jobs: Arc<RwLock<HashMap<I, JobDebug>>>,
    executors: Arc<RwLock<Vec<ExecutorDebug>>>,
    clock: Arc<dyn Clock>,
}

impl<I: Id> Introspection<I> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            executors: Arc::new(RwLock::new(Vec::new())),
            clock,
        }
    }

    pub async fn enter(&self, job_id: &I, phase: DebugPhase, now: Instant) {
        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.clone()).or_default().enter(phase, now);
    }

    pub async fn set_names(&self, job_id: &I, job_name: Option<&str>, executor_name: Option<&str>) {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.entry(job_id.clone()).or_default();
        if let Some(name) = job_name {
            entry.job_name = name.to_string();
        }
        if let Some(name) = executor_name {
            entry.executor_name = name.to_string();
        }
    }

    /// Rebuild the executor summaries from the registry.
    pub async fn project_executors(&self, registry: &Registry<I>, config: &SchedulerConfig, now: Instant) {
        let summaries = executor_summaries(registry, config, now);
        *self.executors.write().await = summaries;
    }

    /// Copy of every job's timings, with open phases counted up to now.
    pub async fn jobs(&self) -> HashMap<I, JobDebug> {
        let now = self.clock.now();
        let jobs = self.jobs.read().await;
        jobs.iter()
            .map(|(id, d)| (id.clone(), d.settled(now)))
            .collect()
    }

    pub async fn executors(&self) -> Vec<ExecutorDebug> {
        self.executors.read().await.clone()
    }
}

pub fn executor_summaries<I: Id>(
    registry: &Registry<I>,
    config: &SchedulerConfig,
    now: Instant,
) -> Vec<ExecutorDebug> {
    registry
        .executors()
        .iter()
        .map(|e| {
            let mut summary = ExecutorDebug {
                id: e.id.to_string(),
                name: e.name.clone(),
                capacity: e.cost_capacity,
                load: 0.0,
                paused: e.paused,
                alive: is_alive(e, now, config.alive_window()),
                starting: 0,
                running: 0,
                stopping: 0,
            };
            for run in registry.runs_on_executor(&e.id) {
                match run.state() {
                    RunState::Starting => summary.starting += 1,
                    RunState::Running => summary.running += 1,
                    RunState::Stopping => summary.stopping += 1,
                    RunState::Pending => {}
                }
                if run.started_at.is_some() {
                    summary.load += run.job.cost;
                }
            }
            summary
        })
        .collect()
}

fn fmt_secs(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

/// Render job timings as a fixed-width text table, ordered by job name.
pub fn render_job_table<I: Id>(jobs: &HashMap<I, JobDebug>) -> String {
    let mut rows: Vec<(&I, &JobDebug)> = jobs.iter().collect();
    rows.sort_by(|a, b| a.1.job_name.cmp(&b.1.job_name).then_with(|| a.0.to_string().cmp(&b.0.to_string())));

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<12} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>6}",
        "JOB", "EXECUTOR", "KNOWN", "EXISTED", "STARTING", "RUNNING", "ENDING", "GONE", "STARTS"
    );
    for (id, d) in rows {
        let name = if d.job_name.is_empty() {
            id.to_string()
        } else {
            d.job_name.clone()
        };
        let _ = writeln!(
            out,
            "{:<16} {:<12} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>6}",
            name,
            d.executor_name,
            fmt_secs(d.known),
            fmt_secs(d.existed),
            fmt_secs(d.started),
            fmt_secs(d.runned),
            fmt_secs(d.ended),
            fmt_secs(d.gone),
            d.start_count
        );
    }
    out
}

/// Render executor summaries as a fixed-width text table.
pub fn render_executor_table(executors: &[ExecutorDebug]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<12} {:>8} {:>8} {:>6} {:>6} {:>9} {:>8} {:>8}",
        "EXECUTOR", "LOAD", "CAPACITY", "ALIVE", "PAUSED", "STARTING", "RUNNING", "STOPPING"
    );
    for e in executors {
        let _ = writeln!(
            out,
            "{:<12} {:>8.1} {:>8.1} {:>6} {:>6} {:>9} {:>8} {:>8}",
            e.name, e.load, e.capacity, e.alive, e.paused, e.starting, e.running, e.stopping
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_accumulate() {
        let t0 = Instant::now();
        let mut d = JobDebug::default();
        d.enter(DebugPhase::Existing, t0);
        d.enter(DebugPhase::Starting, t0 + Duration::from_secs(2));
        d.enter(DebugPhase::Running, t0 + Duration::from_secs(3));
        d.enter(DebugPhase::Ending, t0 + Duration::from_secs(13));
        d.enter(DebugPhase::Existing, t0 + Duration::from_secs(14));

        assert_eq!(d.existed, Duration::from_secs(2));
        assert_eq!(d.started, Duration::from_secs(1));
        assert_eq!(d.runned, Duration::from_secs(10));
        assert_eq!(d.ended, Duration::from_secs(1));
        assert_eq!(d.start_count, 1);
        assert_eq!(d.phase(), Some(DebugPhase::Existing));
    }

    #[test]
    fn settled_counts_open_phase_without_closing_it() {
        let t0 = Instant::now();
        let mut d = JobDebug::default();
        d.enter(DebugPhase::Running, t0);
        let s = d.settled(t0 + Duration::from_secs(4));
        assert_eq!(s.runned, Duration::from_secs(4));
        assert_eq!(d.runned, Duration::ZERO);
        assert_eq!(s.phase(), Some(DebugPhase::Running));
    }

    #[test]
    fn gone_clears_executor_and_phase() {
        let t0 = Instant::now();
        let mut d = JobDebug {
            executor_name: "Wrk1".to_string(),
            ..Default::default()
        };
        d.enter(DebugPhase::Running, t0);
        d.enter(DebugPhase::Gone, t0 + Duration::from_secs(1));
        assert!(d.executor_name.is_empty());
        assert_eq!(d.phase(), None);
        assert_eq!(d.runned, Duration::from_secs(1));
    }

    #[test]
    fn known_outlives_removal() {
        let t0 = Instant::now();
        let mut d = JobDebug::default();
        d.enter(DebugPhase::Existing, t0);
        d.enter(DebugPhase::Running, t0 + Duration::from_secs(1));
        d.enter(DebugPhase::Gone, t0 + Duration::from_secs(4));
        d.enter(DebugPhase::Existing, t0 + Duration::from_secs(6));

        let s = d.settled(t0 + Duration::from_secs(7));
        assert_eq!(s.known, Duration::from_secs(7));
        assert_eq!(s.existed, Duration::from_secs(2));
        assert_eq!(s.runned, Duration::from_secs(3));
        assert_eq!(s.gone, Duration::from_secs(2));
        assert_eq!(d.known, Duration::ZERO);
    }

    #[test]
    fn job_table_lists_every_job() {
        let mut jobs: HashMap<u64, JobDebug> = HashMap::new();
        jobs.insert(
            2,
            JobDebug {
                job_name: "J2".to_string(),
                executor_name: "Wrk1".to_string(),
                runned: Duration::from_secs(3),
                start_count: 1,
                ..Default::default()
            },
        );
        jobs.insert(
            1,
            JobDebug {
                job_name: "J1".to_string(),
                ..Default::default()
            },
        );
        let table = render_job_table(&jobs);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("J1"));
        assert!(lines[2].contains("Wrk1"));
        assert!(lines[2].contains("3.0s"));
    }

    #[test]
    fn json_reports_seconds() {
        let d = JobDebug {
            runned: Duration::from_millis(1500),
            ..Default::default()
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["runned"], 1.5);
        assert!(v.get("phase_since").is_none());
    }
}
