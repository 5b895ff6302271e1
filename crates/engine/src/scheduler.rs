use crate::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

/// A unit of periodic work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn period(&self) -> Duration;

    /// One execution. `now` comes from the scheduler's clock at tick time.
    async fn run(&self, now: DateTime<Utc>);
}

/// Drives registered jobs on fixed periods.
///
/// Each job gets its own timer. A tick that fires while the previous run of the
/// same job is still going is skipped, so runs of one job never overlap.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    jobs: Vec<Arc<dyn Job>>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: Vec::new(),
        }
    }

    pub fn register(&mut self, job: Arc<dyn Job>) {
        info!(job = job.name(), period = ?job.period(), "Job registered.");
        self.jobs.push(job);
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|j| j.name().to_string()).collect()
    }

    /// Runs every job once, in registration order.
    pub async fn fire_all(&self) {
        for job in &self.jobs {
            job.run(self.clock.now()).await;
        }
    }

    /// Runs until `shutdown` turns `true` (or its sender is dropped). A job
    /// that is mid-run finishes that run first.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut tasks = JoinSet::new();
        for job in &self.jobs {
            tasks.spawn(run_job(Arc::clone(job), Arc::clone(&self.clock), shutdown.clone()));
        }
        info!(jobs = self.jobs.len(), "Scheduler started.");

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Scheduled job task failed.");
            }
        }
        info!("Scheduler stopped.");
    }
}

async fn run_job(job: Arc<dyn Job>, clock: Arc<dyn Clock>, mut shutdown: watch::Receiver<bool>) {
    // Create a timer for this job. The first tick is immediate.
    let mut timer = interval(job.period());
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = timer.tick() => job.run(clock.now()).await,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    info!(job = job.name(), "Job stopped.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counter {
        runs: AtomicU32,
        running: AtomicU32,
        max_running: AtomicU32,
        busy_for: Duration,
    }

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn period(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn run(&self, _now: DateTime<Utc>) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.busy_for).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn scheduler_with(busy_for: Duration) -> (Scheduler, Arc<Counter>) {
        let job = Arc::new(Counter {
            runs: AtomicU32::new(0),
            running: AtomicU32::new(0),
            max_running: AtomicU32::new(0),
            busy_for,
        });
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        scheduler.register(job.clone());
        (scheduler, job)
    }

    #[tokio::test]
    async fn test_fire_all_runs_each_job_once() {
        let (scheduler, job) = scheduler_with(Duration::ZERO);
        scheduler.fire_all().await;
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.job_names(), vec!["counter".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_shutdown() {
        let (scheduler, job) = scheduler_with(Duration::ZERO);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Ticks at 0s, 1s, 2s and 3s.
        assert_eq!(job.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_run_skips_missed_ticks() {
        let (scheduler, job) = scheduler_with(Duration::from_millis(2_500));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        // Runs start at 0s, 2.5s and 5s: an overdue tick fires once when the
        // previous run ends, and the other missed ticks are dropped. The run
        // under way at shutdown finishes first.
        assert_eq!(job.runs.load(Ordering::SeqCst), 3);
        assert_eq!(job.max_running.load(Ordering::SeqCst), 1);
    }
}
