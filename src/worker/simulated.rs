use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::driver::{CallContext, ExecutorDriver};
use crate::error::DriverError;
use crate::scheduler::job::{Id, Run, Situation};

/// Behaviour of the simulated executors.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub start_latency: Duration,
    pub stop_latency: Duration,
    /// Latencies vary by up to this fraction either way.
    pub jitter: f64,
    /// Probability in `[0, 1]` that a start call fails.
    pub start_failure_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            start_latency: Duration::from_millis(50),
            stop_latency: Duration::from_millis(20),
            jitter: 0.2,
            start_failure_rate: 0.0,
        }
    }
}

/// In-process executors. Starting a job records it as hosted by the run's
/// executor; stopping it forgets it again.
#[derive(Debug)]
pub struct SimulatedExecutors<I> {
    config: SimulationConfig,
    hosted: Mutex<HashMap<I, HashSet<I>>>,
    situations: Mutex<HashMap<Situation, u64>>,
}

impl<I: Id> SimulatedExecutors<I> {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            hosted: Mutex::new(HashMap::new()),
            situations: Mutex::new(HashMap::new()),
        }
    }

    /// Jobs the executor currently hosts.
    pub fn hosted_on(&self, executor_id: &I) -> Vec<I> {
        lock(&self.hosted)
            .get(executor_id)
            .map(|jobs| jobs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hosted_count(&self) -> usize {
        lock(&self.hosted).values().map(HashSet::len).sum()
    }

    /// How many times each situation was reported.
    pub fn situation_counts(&self) -> HashMap<Situation, u64> {
        lock(&self.situations).clone()
    }

    fn latency(&self, base: Duration) -> Duration {
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(factor)
    }

    fn start_fails(&self) -> bool {
        let rate = self.config.start_failure_rate;
        rate > 0.0 && rand::thread_rng().gen_bool(rate.min(1.0))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn wait(latency: Duration, ctx: &CallContext) -> Result<(), DriverError> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(DriverError::Cancelled),
        _ = tokio::time::sleep(latency) => Ok(()),
    }
}

#[async_trait]
impl<I: Id> ExecutorDriver<I> for SimulatedExecutors<I> {
    async fn start_job(&self, run: Run<I>, ctx: CallContext) -> Result<(), DriverError> {
        let executor_id = run
            .executor_id
            .clone()
            .ok_or_else(|| DriverError::failed("run has no executor"))?;
        let latency = self.latency(self.config.start_latency);
        let fails = self.start_fails();

        wait(latency, &ctx).await?;
        if fails {
            return Err(DriverError::failed(format!(
                "simulated start failure of {} on {}",
                run.job.id, executor_id
            )));
        }

        lock(&self.hosted)
            .entry(executor_id)
            .or_default()
            .insert(run.job.id);
        Ok(())
    }

    async fn stop_job(&self, run: Run<I>, ctx: CallContext) -> Result<(), DriverError> {
        let latency = self.latency(self.config.stop_latency);
        wait(latency, &ctx).await?;

        if let Some(executor_id) = &run.executor_id {
            if let Some(jobs) = lock(&self.hosted).get_mut(executor_id) {
                jobs.remove(&run.job.id);
            }
        }
        Ok(())
    }

    fn handle_situation(&self, run: &Run<I>, situation: Situation, details: Option<&DriverError>) {
        match details {
            Some(err) => {
                tracing::debug!(job_id = %run.job.id, %situation, error = %err, "Situation")
            }
            None => tracing::trace!(job_id = %run.job.id, %situation, "Situation"),
        }
        *lock(&self.situations).entry(situation).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Job;
    use tokio_util::sync::CancellationToken;

    fn bound_run(job: u64, executor: u64) -> Run<u64> {
        let mut run = Run::new(Job::new(job, 1.0), 0);
        run.executor_id = Some(executor);
        run
    }

    fn ctx() -> CallContext {
        CallContext::new(None, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_track_hosted_jobs() {
        let sim: SimulatedExecutors<u64> = SimulatedExecutors::new(SimulationConfig::default());
        sim.start_job(bound_run(1, 7), ctx()).await.unwrap();
        sim.start_job(bound_run(2, 7), ctx()).await.unwrap();
        let mut hosted = sim.hosted_on(&7);
        hosted.sort();
        assert_eq!(hosted, vec![1, 2]);

        sim.stop_job(bound_run(1, 7), ctx()).await.unwrap();
        assert_eq!(sim.hosted_on(&7), vec![2]);
        assert_eq!(sim.hosted_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn certain_failure_hosts_nothing() {
        let sim: SimulatedExecutors<u64> = SimulatedExecutors::new(SimulationConfig {
            start_failure_rate: 1.0,
            ..Default::default()
        });
        let err = sim.start_job(bound_run(1, 7), ctx()).await.unwrap_err();
        assert!(matches!(err, DriverError::Failed(_)));
        assert!(sim.hosted_on(&7).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_call_returns_cancelled() {
        let sim: SimulatedExecutors<u64> = SimulatedExecutors::new(SimulationConfig {
            start_latency: Duration::from_secs(60),
            ..Default::default()
        });
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = sim.start_job(bound_run(1, 7), ctx).await.unwrap_err();
        assert_eq!(err, DriverError::Cancelled);
    }

    #[test]
    fn situations_are_counted() {
        let sim: SimulatedExecutors<u64> = SimulatedExecutors::new(SimulationConfig::default());
        let run = bound_run(1, 7);
        sim.handle_situation(&run, Situation::JobStarted, None);
        sim.handle_situation(&run, Situation::JobStarted, None);
        sim.handle_situation(&run, Situation::ErrorStartingJob, Some(&DriverError::Timeout));
        let counts = sim.situation_counts();
        assert_eq!(counts[&Situation::JobStarted], 2);
        assert_eq!(counts[&Situation::ErrorStartingJob], 1);
    }
}
