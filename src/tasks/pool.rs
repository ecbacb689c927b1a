//! Worker threads that drive the executor until told to stop.

use anyhow::Result;
use chrono::Utc;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::Executor;
use crate::config::{ReaperConfig, WorkerConfig};

/// Sleep granularity while idle, so shutdown is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);
/// Pause after a finished task before claiming the next.
const YIELD_AFTER_TASK: Duration = Duration::from_millis(1);
const REAPER_MAX_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorkerPool;

impl WorkerPool {
    /// Start `workers.count` workers (at least one), plus a reaper thread when
    /// `reaper.stale_after_secs` is set.
    pub fn start(executor: Executor, workers: &WorkerConfig, reaper: &ReaperConfig) -> Result<PoolHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        for n in 0..workers.count.max(1) {
            let executor = executor.clone();
            let shutdown = shutdown.clone();
            let config = workers.clone();
            let handle = thread::Builder::new()
                .name(format!("darkroom-worker-{}", n))
                .spawn(move || worker_loop(n, executor, config, shutdown))?;
            threads.push(handle);
        }

        if let Some(stale_after) = reaper.stale_after() {
            let executor = executor.clone();
            let shutdown = shutdown.clone();
            let handle = thread::Builder::new()
                .name("darkroom-reaper".to_string())
                .spawn(move || reaper_loop(executor, stale_after, shutdown))?;
            threads.push(handle);
        }

        info!(workers = workers.count.max(1), "Worker pool started");
        Ok(PoolHandle { shutdown, threads })
    }
}

/// Running pool. Dropping it without `shutdown` leaves the threads running.
pub struct PoolHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Ask every thread to stop after its current task.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop and wait for every thread to exit.
    pub fn shutdown(self) {
        self.stop();
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

fn worker_loop(n: usize, executor: Executor, config: WorkerConfig, shutdown: Arc<AtomicBool>) {
    debug!(worker = n, "Worker started");
    let mut rng = rand::thread_rng();

    while !shutdown.load(Ordering::SeqCst) {
        match executor.run_once() {
            Ok(Some(_)) => thread::sleep(YIELD_AFTER_TASK),
            Ok(None) => sleep_unless_stopped(idle_delay(&config, &mut rng), &shutdown),
            Err(e) => {
                error!(worker = n, error = %format!("{:#}", e), "Executor error");
                sleep_unless_stopped(Duration::from_millis(config.idle_max_ms), &shutdown);
            }
        }
    }

    debug!(worker = n, "Worker stopped");
}

fn reaper_loop(executor: Executor, stale_after: Duration, shutdown: Arc<AtomicBool>) {
    let interval = (stale_after / 2).clamp(Duration::from_secs(1), REAPER_MAX_INTERVAL);
    let stale = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1));

    while !shutdown.load(Ordering::SeqCst) {
        match executor.context().db.reap_stale_running(Utc::now() - stale) {
            Ok(0) => {}
            Ok(reaped) => warn!(reaped, "Returned stale running tasks to pending"),
            Err(e) => error!(error = %format!("{:#}", e), "Reaper sweep failed"),
        }
        sleep_unless_stopped(interval, &shutdown);
    }
}

/// `idle_base_ms` scaled by a random factor in 0.5..1.5, capped at `idle_max_ms`.
fn idle_delay<R: Rng>(config: &WorkerConfig, rng: &mut R) -> Duration {
    let factor: f64 = rng.gen_range(0.5..1.5);
    let millis = (config.idle_base_ms as f64 * factor).min(config.idle_max_ms as f64);
    Duration::from_millis(millis as u64)
}

fn sleep_unless_stopped(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
