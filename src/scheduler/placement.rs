//! The decision function of the scheduler.
//!
//! [`plan`] looks at the registry at one instant and returns at most one
//! structural action: a stop (executor gone, changed, dead or paused, job
//! overdue or redefined, job cap lowered, load rebalance) or a start. When there is nothing to
//! do it reports when the next deadline falls, so the control loop can sleep
//! until then. It never mutates anything; the control loop applies the plan.

use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::scheduler::capacity::{Capacity, CapacitySnapshot};
use crate::scheduler::job::{Id, Run};
use crate::scheduler::registry::{is_alive, Registry};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub enum StopReason<I> {
    ExecutorMissing,
    ExecutorChanged,
    ExecutorDead,
    ExecutorPaused,
    DeadlineReached,
    JobChanged,
    /// More runs are started than `total_max_job_count` allows.
    OverJobLimit,
    /// Move to a less loaded executor.
    LoadBalance { target: I },
}

impl<I: Id> std::fmt::Display for StopReason<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::ExecutorMissing => write!(f, "executor missing"),
            StopReason::ExecutorChanged => write!(f, "executor changed"),
            StopReason::ExecutorDead => write!(f, "executor dead"),
            StopReason::ExecutorPaused => write!(f, "executor paused"),
            StopReason::DeadlineReached => write!(f, "deadline reached"),
            StopReason::JobChanged => write!(f, "job changed"),
            StopReason::OverJobLimit => write!(f, "over job limit"),
            StopReason::LoadBalance { target } => write!(f, "load balance to {}", target),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action<I> {
    Stop { job_id: I, reason: StopReason<I> },
    Start { job_id: I, executor_id: I },
}

/// Outcome of one reconcile pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan<I> {
    pub action: Option<Action<I>>,
    /// Pending jobs that no usable executor can fit.
    pub unplaceable: Vec<I>,
    /// Earliest future instant at which a decision may change. Only set
    /// when `action` is `None`.
    pub wake_at: Option<Instant>,
}

impl<I> Plan<I> {
    fn idle() -> Self {
        Self {
            action: None,
            unplaceable: Vec::new(),
            wake_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Placement<I> {
    Placed(I),
    /// Some executor fits the job but may not take it right now.
    Throttled,
    NoFit,
}

pub fn plan<I: Id>(registry: &Registry<I>, config: &SchedulerConfig, now: Instant) -> Plan<I> {
    let snapshot = CapacitySnapshot::build(registry, now, config.alive_window());
    let runs = registry.runs();
    let unrun_cost: f64 = runs
        .iter()
        .filter(|r| !r.removing && r.ran_at.is_none())
        .map(|r| r.job.cost)
        .sum();

    for run in &runs {
        if let Some(reason) = should_stop(run, registry, &snapshot, config, unrun_cost, now) {
            return Plan {
                action: Some(Action::Stop {
                    job_id: run.job.id.clone(),
                    reason,
                }),
                ..Plan::idle()
            };
        }
    }

    if let Some(job_id) = over_job_limit(&runs, registry.started_count(), config) {
        return Plan {
            action: Some(Action::Stop {
                job_id,
                reason: StopReason::OverJobLimit,
            }),
            ..Plan::idle()
        };
    }

    let has_unrun = runs.iter().any(|r| r.ran_at.is_none());
    if !has_unrun {
        if let Some((job_id, target)) = load_balance_candidate(&runs, &snapshot, config) {
            return Plan {
                action: Some(Action::Stop {
                    job_id,
                    reason: StopReason::LoadBalance { target },
                }),
                ..Plan::idle()
            };
        }
    }

    let mut pending: Vec<&&Run<I>> = runs.iter().filter(|r| r.is_pending()).collect();
    pending.sort_by(|a, b| a.stopped_at.cmp(&b.stopped_at).then(a.count.cmp(&b.count)));

    let mut result = Plan::idle();
    let started = registry.started_count();
    for run in &pending {
        match place(run, &snapshot, config, started, now) {
            Placement::Placed(executor_id) => {
                result.action = Some(Action::Start {
                    job_id: run.job.id.clone(),
                    executor_id,
                });
                return result;
            }
            Placement::NoFit => result.unplaceable.push(run.job.id.clone()),
            Placement::Throttled => {}
        }
    }

    result.wake_at = next_wake(registry, &snapshot, config, now, !pending.is_empty());
    result
}

/// Whether a bound run has to be stopped now. `unrun_cost` is the summed
/// cost of every run not yet running, this one included.
pub fn should_stop<I: Id>(
    run: &Run<I>,
    registry: &Registry<I>,
    snapshot: &CapacitySnapshot<I>,
    config: &SchedulerConfig,
    unrun_cost: f64,
    now: Instant,
) -> Option<StopReason<I>> {
    let executor_id = run.executor_id.as_ref()?;
    if run.stopping {
        return None;
    }
    let Some(executor) = registry.executor(executor_id) else {
        return Some(StopReason::ExecutorMissing);
    };
    if run.executor_changed_count != Some(executor.changed_count) {
        return Some(StopReason::ExecutorChanged);
    }
    if !is_alive(executor, now, config.alive_window()) {
        return Some(StopReason::ExecutorDead);
    }
    if registry.job(&run.job.id).map(|j| j.changed_count) != Some(run.job.changed_count) {
        return Some(StopReason::JobChanged);
    }

    let slack = config.keep_jobs_beyond_end_until_enough_slack;
    if executor.paused {
        let own = if !run.removing && run.ran_at.is_none() {
            run.job.cost
        } else {
            0.0
        };
        let unrun_cost = unrun_cost - own;
        let external_spare = snapshot.spare_excluding(executor_id);
        if slack.is_zero() || external_spare - unrun_cost + EPSILON < run.job.cost {
            return Some(StopReason::ExecutorPaused);
        }
        return match run.ran_at {
            Some(ran_at) if now.saturating_duration_since(ran_at) < slack => None,
            _ => Some(StopReason::ExecutorPaused),
        };
    }

    let ran_at = run.ran_at?;
    if run.job.duration.is_zero() {
        return None;
    }
    if now.saturating_duration_since(ran_at) >= run.job.duration.saturating_add(slack) {
        return Some(StopReason::DeadlineReached);
    }
    None
}

/// The most recently started run, when more runs are started than the job
/// cap allows.
fn over_job_limit<I: Id>(runs: &[&Run<I>], started: usize, config: &SchedulerConfig) -> Option<I> {
    if config.total_max_job_count == 0 || started <= config.total_max_job_count {
        return None;
    }
    runs.iter()
        .filter(|r| !r.stopping && r.started_at.is_some())
        .max_by_key(|r| (r.started_at, r.count))
        .map(|r| r.job.id.clone())
}

/// Pick the running job whose move to another executor narrows the gap in
/// spare-capacity ratio the most. The gap must reach
/// `load_balance_if_cost_difference / capacity` of both executors.
fn load_balance_candidate<I: Id>(
    runs: &[&Run<I>],
    snapshot: &CapacitySnapshot<I>,
    config: &SchedulerConfig,
) -> Option<(I, I)> {
    let diff = config.load_balance_if_cost_difference;
    if diff <= 0.0 {
        return None;
    }

    struct Candidate<'a, I> {
        gain: f64,
        run: &'a Run<I>,
        target: I,
    }
    let mut best: Option<Candidate<'_, I>> = None;

    for &run in runs {
        if run.stopping || run.ran_at.is_none() {
            continue;
        }
        let Some(current) = run.executor_id.as_ref().and_then(|id| snapshot.get(id)) else {
            continue;
        };
        if current.capacity <= 0.0 {
            continue;
        }
        for other in snapshot.iter() {
            if other.executor_id == current.executor_id || other.capacity <= 0.0 {
                continue;
            }
            if other.spare() + EPSILON < run.job.cost {
                continue;
            }
            let gain = other.spare_ratio() - current.spare_ratio();
            let bound = (diff / current.capacity).max(diff / other.capacity);
            if gain + EPSILON < bound {
                continue;
            }
            let better = match &best {
                None => true,
                Some(b) if gain > b.gain + EPSILON => true,
                Some(b) if (gain - b.gain).abs() <= EPSILON => {
                    (run.ran_at, run.count) < (b.run.ran_at, b.run.count)
                }
                Some(_) => false,
            };
            if better {
                best = Some(Candidate {
                    gain,
                    run,
                    target: other.executor_id.clone(),
                });
            }
        }
    }

    best.map(|b| (b.run.job.id.clone(), b.target))
}

/// Whether `executor_id` may take on a run of `cost` right now: it is alive
/// and not paused, has room for it, and the job cap is not reached.
pub fn admits<I: Id>(
    registry: &Registry<I>,
    config: &SchedulerConfig,
    executor_id: &I,
    cost: f64,
    now: Instant,
) -> bool {
    if config.total_max_job_count > 0 && registry.started_count() >= config.total_max_job_count {
        return false;
    }
    CapacitySnapshot::build(registry, now, config.alive_window())
        .get(executor_id)
        .is_some_and(|cap| cap.spare() + EPSILON >= cost)
}

fn place<I: Id>(
    run: &Run<I>,
    snapshot: &CapacitySnapshot<I>,
    config: &SchedulerConfig,
    started: usize,
    now: Instant,
) -> Placement<I> {
    let mut fits = false;
    let mut best: Option<&Capacity<I>> = None;

    for cap in snapshot.iter() {
        if cap.spare() + EPSILON < run.job.cost {
            continue;
        }
        fits = true;
        if cap.starting_count >= config.simultaneous_starts {
            continue;
        }
        if config.simultaneous_starts > 1 {
            if let Some(last) = cap.most_recent_start {
                if now.saturating_duration_since(last)
                    < config.min_duration_between_simultaneous_starts
                {
                    continue;
                }
            }
        }
        best = match best {
            Some(b)
                if (b.starting_count, b.used_ratio())
                    <= (cap.starting_count, cap.used_ratio()) =>
            {
                Some(b)
            }
            _ => Some(cap),
        };
    }

    if !fits {
        return Placement::NoFit;
    }
    if config.total_max_job_count > 0 && started >= config.total_max_job_count {
        return Placement::Throttled;
    }
    match best {
        Some(cap) => Placement::Placed(cap.executor_id.clone()),
        None => Placement::Throttled,
    }
}

fn next_wake<I: Id>(
    registry: &Registry<I>,
    snapshot: &CapacitySnapshot<I>,
    config: &SchedulerConfig,
    now: Instant,
    has_pending: bool,
) -> Option<Instant> {
    let slack = config.keep_jobs_beyond_end_until_enough_slack;
    let mut candidates: Vec<Instant> = Vec::new();

    for run in registry.runs() {
        let (Some(ran_at), Some(executor_id)) = (run.ran_at, &run.executor_id) else {
            continue;
        };
        if run.stopping {
            continue;
        }
        if !run.job.duration.is_zero() {
            candidates.extend(ran_at.checked_add(run.job.duration.saturating_add(slack)));
        }
        if registry.executor(executor_id).is_some_and(|e| e.paused) {
            candidates.extend(ran_at.checked_add(slack));
        }
    }

    if let Some(window) = config.alive_window() {
        candidates.extend(
            registry
                .executors()
                .iter()
                .filter_map(|e| e.kept_alive_at)
                .filter_map(|at| at.checked_add(window)),
        );
    }

    if has_pending && config.simultaneous_starts > 1 {
        let gap = config.min_duration_between_simultaneous_starts;
        candidates.extend(
            snapshot
                .iter()
                .filter_map(|c| c.most_recent_start)
                .filter_map(|at| at.checked_add(gap)),
        );
    }

    candidates.into_iter().filter(|t| *t > now).min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{Executor, Job};
    use std::time::Duration;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn registry(jobs: u64, cost: f64, executors: &[(u64, f64)], now: Instant) -> Registry<u64> {
        let mut reg = Registry::new();
        for id in 1..=jobs {
            reg.add_job(Job::new(id, cost).with_duration(secs(30)))
                .unwrap();
        }
        for (id, cap) in executors {
            reg.add_executor(Executor::new(*id, *cap), now).unwrap();
        }
        reg
    }

    fn bind(reg: &mut Registry<u64>, job: u64, executor: u64, at: Instant, ran: bool) {
        let changed = reg.executor(&executor).unwrap().changed_count;
        let run = reg.run_mut(&job).unwrap();
        run.executor_id = Some(executor);
        run.executor_changed_count = Some(changed);
        run.started_at = Some(at);
        run.ran_at = ran.then_some(at);
    }

    #[test]
    fn places_first_pending_on_least_used_executor() {
        let now = Instant::now();
        let mut reg = registry(3, 1.0, &[(1, 10.0), (2, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(
            plan.action,
            Some(Action::Start {
                job_id: 2,
                executor_id: 2
            })
        );
    }

    #[test]
    fn prefers_oldest_stopped_pending_run() {
        let now = Instant::now();
        let mut reg = registry(3, 1.0, &[(1, 10.0)], now);
        reg.run_mut(&1).unwrap().stopped_at = Some(now);
        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(
            plan.action,
            Some(Action::Start {
                job_id: 2,
                executor_id: 1
            })
        );
    }

    #[test]
    fn oversized_job_is_unplaceable_but_others_still_start() {
        let now = Instant::now();
        let mut reg = registry(0, 1.0, &[(1, 10.0)], now);
        reg.add_job(Job::new(1, 50.0)).unwrap();
        reg.add_job(Job::new(2, 1.0)).unwrap();

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(plan.unplaceable, vec![1]);
        assert_eq!(
            plan.action,
            Some(Action::Start {
                job_id: 2,
                executor_id: 1
            })
        );
    }

    #[test]
    fn simultaneous_starts_limit_throttles_without_unplaceable() {
        let now = Instant::now();
        let mut reg = registry(2, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, false);

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(plan.action, None);
        assert!(plan.unplaceable.is_empty());
    }

    #[test]
    fn pacing_between_simultaneous_starts() {
        let now = Instant::now();
        let mut reg = registry(2, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, false);
        let cfg = SchedulerConfig::new()
            .with_simultaneous_starts(2)
            .with_min_duration_between_simultaneous_starts(Duration::from_millis(300));

        let early = plan(&reg, &cfg, now + Duration::from_millis(100));
        assert_eq!(early.action, None);
        assert_eq!(early.wake_at, Some(now + Duration::from_millis(300)));

        let later = plan(&reg, &cfg, now + Duration::from_millis(300));
        assert_eq!(
            later.action,
            Some(Action::Start {
                job_id: 2,
                executor_id: 1
            })
        );
    }

    #[test]
    fn total_max_job_count_caps_starts() {
        let now = Instant::now();
        let mut reg = registry(3, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        bind(&mut reg, 2, 1, now, true);
        let cfg = SchedulerConfig::new().with_total_max_job_count(2);

        let plan = plan(&reg, &cfg, now);
        assert_eq!(plan.action, None);
        assert!(plan.unplaceable.is_empty());
    }

    #[test]
    fn lowered_job_cap_stops_latest_started_run() {
        let now = Instant::now();
        let mut reg = registry(3, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        bind(&mut reg, 2, 1, now + secs(2), true);
        bind(&mut reg, 3, 1, now + secs(1), true);
        let cfg = SchedulerConfig::new().with_total_max_job_count(2);

        let plan = plan(&reg, &cfg, now + secs(3));
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 2,
                reason: StopReason::OverJobLimit
            })
        );
    }

    #[test]
    fn huge_durations_do_not_overflow() {
        let now = Instant::now();
        let mut reg = registry(0, 1.0, &[(1, 10.0)], now);
        reg.add_job(Job::new(1, 1.0).with_duration(Duration::MAX)).unwrap();
        bind(&mut reg, 1, 1, now, true);
        reg.change_executor(Executor::new(1, 10.0).with_paused(true))
            .unwrap();
        let cfg = SchedulerConfig::new()
            .with_slack(Duration::MAX)
            .with_executor_alive_duration(Duration::MAX)
            .with_simultaneous_starts(2)
            .with_min_duration_between_simultaneous_starts(Duration::MAX);

        let plan = plan(&reg, &cfg, now + secs(1));
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorPaused
            })
        );

        let mut reg = registry(0, 1.0, &[(1, 10.0)], now);
        reg.add_job(Job::new(1, 1.0).with_duration(Duration::MAX)).unwrap();
        reg.add_job(Job::new(2, 1.0)).unwrap();
        bind(&mut reg, 1, 1, now, false);
        let paced = super::plan(&reg, &cfg, now + secs(1));
        assert_eq!(paced.action, None);
        assert_eq!(paced.wake_at, None);

        reg.run_mut(&1).unwrap().ran_at = Some(now);
        reg.remove_run(&2);
        let idle = super::plan(&reg, &cfg, now + secs(1));
        assert_eq!(idle.action, None);
        assert_eq!(idle.wake_at, None);
    }

    #[test]
    fn admits_checks_room_cap_and_usability() {
        let now = Instant::now();
        let mut reg = registry(2, 1.0, &[(1, 2.0), (2, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        let cfg = SchedulerConfig::default();

        assert!(admits(&reg, &cfg, &1, 1.0, now));
        assert!(!admits(&reg, &cfg, &1, 1.5, now));
        assert!(!admits(&reg, &cfg.clone().with_total_max_job_count(1), &2, 1.0, now));
        assert!(!admits(&reg, &cfg, &9, 1.0, now));

        reg.change_executor(Executor::new(2, 10.0).with_paused(true))
            .unwrap();
        assert!(!admits(&reg, &cfg, &2, 1.0, now));
    }

    #[test]
    fn stops_run_on_missing_executor() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        reg.remove_executor(&1).unwrap();

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorMissing
            })
        );
    }

    #[test]
    fn stops_run_when_executor_settings_change() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        reg.change_executor(Executor::new(1, 10.0).with_settings_hash(7))
            .unwrap();

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorChanged
            })
        );
    }

    #[test]
    fn stops_run_when_job_definition_changes() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        reg.change_job(Job::new(1, 2.0)).unwrap();

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::JobChanged
            })
        );
    }

    #[test]
    fn stops_runs_on_dead_executor() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        let cfg = SchedulerConfig::new().with_executor_alive_duration(secs(1));

        let alive = plan(&reg, &cfg, now + Duration::from_millis(1399));
        assert_eq!(alive.action, None);
        assert_eq!(alive.wake_at, Some(now + Duration::from_millis(1400)));

        let dead = plan(&reg, &cfg, now + Duration::from_millis(1400));
        assert_eq!(
            dead.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorDead
            })
        );
    }

    #[test]
    fn paused_executor_without_slack_stops_immediately() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0), (2, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        reg.change_executor(Executor::new(1, 10.0).with_paused(true))
            .unwrap();

        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorPaused
            })
        );
    }

    #[test]
    fn paused_executor_drains_within_slack() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0), (2, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        reg.change_executor(Executor::new(1, 10.0).with_paused(true))
            .unwrap();
        let cfg = SchedulerConfig::new().with_slack(secs(5));

        let within = plan(&reg, &cfg, now + secs(2));
        assert_eq!(within.action, None);
        assert_eq!(within.wake_at, Some(now + secs(5)));

        let after = plan(&reg, &cfg, now + secs(5));
        assert_eq!(
            after.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorPaused
            })
        );
    }

    #[test]
    fn paused_executor_without_room_elsewhere_stops_despite_slack() {
        let now = Instant::now();
        let mut reg = registry(2, 1.0, &[(1, 10.0), (2, 1.0)], now);
        bind(&mut reg, 1, 1, now, true);
        bind(&mut reg, 2, 2, now, true);
        reg.change_executor(Executor::new(1, 10.0).with_paused(true))
            .unwrap();
        let cfg = SchedulerConfig::new().with_slack(secs(5));

        let plan = plan(&reg, &cfg, now + secs(1));
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorPaused
            })
        );
    }

    #[test]
    fn paused_executor_counts_pending_work_against_spare() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0), (2, 2.0)], now);
        bind(&mut reg, 1, 1, now, true);
        reg.change_executor(Executor::new(1, 10.0).with_paused(true))
            .unwrap();
        let cfg = SchedulerConfig::new().with_slack(secs(5));
        assert_eq!(plan(&reg, &cfg, now + secs(1)).action, None);

        reg.add_job(Job::new(2, 2.0)).unwrap();
        let plan = plan(&reg, &cfg, now + secs(1));
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::ExecutorPaused
            })
        );
    }

    #[test]
    fn deadline_includes_slack() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        let cfg = SchedulerConfig::new().with_slack(secs(2));

        let before = plan(&reg, &cfg, now + secs(31));
        assert_eq!(before.action, None);
        assert_eq!(before.wake_at, Some(now + secs(32)));

        let after = plan(&reg, &cfg, now + secs(32));
        assert_eq!(
            after.action,
            Some(Action::Stop {
                job_id: 1,
                reason: StopReason::DeadlineReached
            })
        );
    }

    #[test]
    fn zero_duration_never_expires() {
        let now = Instant::now();
        let mut reg = registry(0, 1.0, &[(1, 10.0)], now);
        reg.add_job(Job::new(1, 1.0)).unwrap();
        bind(&mut reg, 1, 1, now, true);

        let plan = plan(&reg, &SchedulerConfig::default(), now + secs(86_400));
        assert_eq!(plan.action, None);
        assert_eq!(plan.wake_at, None);
    }

    #[test]
    fn load_balance_moves_oldest_run_to_empty_executor() {
        let now = Instant::now();
        let mut reg = registry(20, 1.0, &[(1, 10.0), (2, 10.0), (3, 10.0)], now);
        for job in 1..=10 {
            bind(&mut reg, job, 1, now + Duration::from_millis(job), true);
        }
        for job in 11..=20 {
            bind(&mut reg, job, 2, now, true);
        }
        let cfg = SchedulerConfig::new().with_load_balance_if_cost_difference(2.0);

        let plan = plan(&reg, &cfg, now + secs(1));
        assert_eq!(
            plan.action,
            Some(Action::Stop {
                job_id: 11,
                reason: StopReason::LoadBalance { target: 3 }
            })
        );
    }

    #[test]
    fn load_balance_settles_within_one_job() {
        let now = Instant::now();
        let mut reg = registry(20, 1.0, &[(1, 10.0), (2, 10.0), (3, 10.0)], now);
        let layout = [(1, 7), (2, 7), (3, 6)];
        let mut job = 1;
        for (executor, n) in layout {
            for _ in 0..n {
                bind(&mut reg, job, executor, now, true);
                job += 1;
            }
        }
        let cfg = SchedulerConfig::new().with_load_balance_if_cost_difference(2.0);
        assert_eq!(plan(&reg, &cfg, now + secs(1)).action, None);
    }

    #[test]
    fn load_balance_waits_for_pending_runs() {
        let now = Instant::now();
        let mut reg = registry(11, 1.0, &[(1, 10.0), (2, 10.0)], now);
        for job in 1..=10 {
            bind(&mut reg, job, 1, now, true);
        }
        bind(&mut reg, 11, 2, now, false);
        let cfg = SchedulerConfig::new().with_load_balance_if_cost_difference(2.0);
        assert_eq!(plan(&reg, &cfg, now + secs(1)).action, None);
    }

    #[test]
    fn stopping_runs_are_left_alone() {
        let now = Instant::now();
        let mut reg = registry(1, 1.0, &[(1, 10.0)], now);
        bind(&mut reg, 1, 1, now, true);
        {
            let run = reg.run_mut(&1).unwrap();
            run.stopping = true;
            run.started_at = None;
            run.ran_at = None;
        }
        reg.remove_executor(&1).unwrap();
        let plan = plan(&reg, &SchedulerConfig::default(), now);
        assert_eq!(plan.action, None);
    }
}
