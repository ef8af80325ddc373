//! Admission control and resource sampling.
//!
//! The guard decides three things: whether a new connection may be accepted,
//! whether the Kafka consumer should pause for CPU backpressure, and what the
//! current resource picture looks like for `/health`. CPU comes from the
//! container-aware monitor, memory from `/proc/self/status`, and the task
//! count from an explicit registry of tracked async tasks.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::Config;
use crate::cpu::{CpuMonitor, CpuSample};
use crate::metrics::GatewayMetrics;
use crate::stats::GatewayStats;

/// Spawn a long-lived task whose panic is caught at entry and logged with
/// its payload instead of unwinding silently into the runtime.
pub fn spawn_supervised<F>(name: &'static str, future: F) -> tokio::task::JoinHandle<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let wrapped = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(future));
        if let Err(panic) = wrapped.await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(task = name, panic = %message, "task panicked, exiting");
        }
    })
}

/// Counts live tracked tasks. Every long-lived task the gateway spawns holds
/// a [`TaskGuard`]; the count stands in for a goroutine count when deciding
/// admission.
#[derive(Default)]
pub struct TaskTracker {
    live: AtomicUsize,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(self: &Arc<Self>) -> TaskGuard {
        self.live.fetch_add(1, Ordering::Relaxed);
        TaskGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// RAII registration of one tracked task.
pub struct TaskGuard {
    tracker: Arc<TaskTracker>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.tracker.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time resource reading published by the sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSnapshot {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub tasks: usize,
}

/// Admission controller.
pub struct ResourceGuard {
    monitor: &'static CpuMonitor,
    tasks: Arc<TaskTracker>,
    max_connections: usize,
    max_memory_bytes: u64,
    max_tasks: usize,
    cpu_reject_threshold: f64,
    cpu_pause_threshold: f64,
    proc_status_path: PathBuf,
    latest: RwLock<ResourceSnapshot>,
    throttled_usec_total: AtomicU64,
}

impl ResourceGuard {
    pub fn new(config: &Config, monitor: &'static CpuMonitor, tasks: Arc<TaskTracker>) -> Self {
        Self {
            monitor,
            tasks,
            max_connections: config.max_connections,
            max_memory_bytes: config.memory_limit_bytes,
            max_tasks: config.max_tasks,
            cpu_reject_threshold: config.cpu_reject_threshold,
            cpu_pause_threshold: config.cpu_pause_threshold.max(config.cpu_reject_threshold),
            proc_status_path: PathBuf::from("/proc/self/status"),
            latest: RwLock::new(ResourceSnapshot::default()),
            throttled_usec_total: AtomicU64::new(0),
        }
    }

    pub fn task_tracker(&self) -> Arc<TaskTracker> {
        Arc::clone(&self.tasks)
    }

    /// Whether a new upgrade may be admitted, with a reason when not.
    ///
    /// Existing connections are never touched by these limits; they only gate
    /// admission.
    pub fn should_accept(&self, current_connections: usize) -> Result<(), String> {
        if current_connections >= self.max_connections {
            return Err(format!(
                "connection limit reached ({current_connections}/{})",
                self.max_connections
            ));
        }
        let snapshot = *self.latest.read();
        if snapshot.cpu_percent > self.cpu_reject_threshold {
            return Err(format!(
                "cpu {:.1}% above reject threshold {:.1}%",
                snapshot.cpu_percent, self.cpu_reject_threshold
            ));
        }
        if snapshot.tasks >= self.max_tasks {
            return Err(format!(
                "task limit reached ({}/{})",
                snapshot.tasks, self.max_tasks
            ));
        }
        if snapshot.memory_bytes > self.max_memory_bytes {
            return Err(format!(
                "memory {} bytes above limit {}",
                snapshot.memory_bytes, self.max_memory_bytes
            ));
        }
        Ok(())
    }

    /// Backpressure signal for the consumer pool: above the pause threshold
    /// the consumer stops fetching and Kafka redelivers later.
    pub fn should_pause_kafka(&self) -> bool {
        self.latest.read().cpu_percent > self.cpu_pause_threshold
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        *self.latest.read()
    }

    pub fn limits(&self) -> GuardLimits {
        GuardLimits {
            max_connections: self.max_connections,
            max_memory_bytes: self.max_memory_bytes,
            max_tasks: self.max_tasks,
            cpu_reject_threshold: self.cpu_reject_threshold,
            cpu_pause_threshold: self.cpu_pause_threshold,
        }
    }

    /// Take one sample and publish it. Called by the periodic sampler and by
    /// tests that need deterministic refreshes.
    pub fn refresh(&self, metrics: &GatewayMetrics, stats: &GatewayStats) -> ResourceSnapshot {
        let cpu: CpuSample = self.monitor.sample();
        let memory = read_rss_bytes(&self.proc_status_path).unwrap_or(0);
        let tasks = self.tasks.live();

        let snapshot = ResourceSnapshot {
            cpu_percent: cpu.percent,
            memory_bytes: memory,
            tasks,
        };
        *self.latest.write() = snapshot;

        metrics.cpu_percent.set(cpu.percent);
        metrics.memory_bytes.set(memory as i64);
        metrics.tracked_tasks.set(tasks as i64);
        let throttled_total = self
            .throttled_usec_total
            .fetch_add((cpu.throttled_seconds_delta * 1e6) as u64, Ordering::Relaxed)
            + (cpu.throttled_seconds_delta * 1e6) as u64;
        metrics
            .cpu_throttled_seconds
            .set(throttled_total as f64 / 1e6);

        if cpu.percent > self.cpu_reject_threshold {
            stats.note_warning();
            warn!(
                cpu_percent = cpu.percent,
                threshold = self.cpu_reject_threshold,
                "cpu above reject threshold, new connections will be refused"
            );
        } else if cpu.percent > self.cpu_pause_threshold {
            stats.note_warning();
            warn!(
                cpu_percent = cpu.percent,
                threshold = self.cpu_pause_threshold,
                "cpu above pause threshold, kafka consumption will pause"
            );
        }
        if memory > self.max_memory_bytes {
            stats.note_warning();
            warn!(memory, limit = self.max_memory_bytes, "memory above limit");
        }

        debug!(
            cpu = cpu.percent,
            memory,
            tasks,
            throttled_periods = cpu.throttled_periods_delta,
            "resource sample"
        );
        snapshot
    }

    /// Run the periodic sampler until shutdown.
    pub async fn run_sampler(
        self: Arc<Self>,
        interval: std::time::Duration,
        metrics: Arc<GatewayMetrics>,
        stats: Arc<GatewayStats>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    self.refresh(&metrics, &stats);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_snapshot(&self, snapshot: ResourceSnapshot) {
        *self.latest.write() = snapshot;
    }
}

/// The configured ceilings, for `/health`.
#[derive(Debug, Clone, Copy)]
pub struct GuardLimits {
    pub max_connections: usize,
    pub max_memory_bytes: u64,
    pub max_tasks: usize,
    pub cpu_reject_threshold: f64,
    pub cpu_pause_threshold: f64,
}

/// Resident set size from `/proc/self/status` (`VmRSS: <n> kB`).
fn read_rss_bytes(status_path: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(status_path).ok()?;
    let line = content.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn test_guard(config: &Config) -> ResourceGuard {
        // Each test gets its own monitor over a nonexistent cgroup root so it
        // deterministically lands on the host backend; the sampled values are
        // then overridden through force_snapshot.
        let monitor: &'static CpuMonitor = Box::leak(Box::new(CpuMonitor::discover(
            Path::new("/nonexistent-cgroup-root"),
            0.0,
        )));
        ResourceGuard::new(config, monitor, Arc::new(TaskTracker::new()))
    }

    #[test]
    fn task_tracker_counts_guards() {
        let tracker = Arc::new(TaskTracker::new());
        assert_eq!(tracker.live(), 0);
        let a = tracker.track();
        let b = tracker.track();
        assert_eq!(tracker.live(), 2);
        drop(a);
        assert_eq!(tracker.live(), 1);
        drop(b);
        assert_eq!(tracker.live(), 0);
    }

    #[test]
    fn accepts_when_under_every_limit() {
        let config = Config::default();
        let guard = test_guard(&config);
        guard.force_snapshot(ResourceSnapshot {
            cpu_percent: 10.0,
            memory_bytes: 1024,
            tasks: 5,
        });
        assert!(guard.should_accept(0).is_ok());
        assert!(!guard.should_pause_kafka());
    }

    #[test]
    fn rejects_at_connection_limit() {
        let mut config = Config::default();
        config.max_connections = 2;
        let guard = test_guard(&config);
        guard.force_snapshot(ResourceSnapshot::default());

        assert!(guard.should_accept(1).is_ok());
        let reason = guard.should_accept(2).unwrap_err();
        assert!(reason.contains("connection limit"), "{reason}");
    }

    #[test]
    fn rejects_above_cpu_threshold_and_pauses_kafka() {
        let config = Config::default();
        let guard = test_guard(&config);
        guard.force_snapshot(ResourceSnapshot {
            cpu_percent: 76.0,
            memory_bytes: 0,
            tasks: 0,
        });
        assert!(guard.should_accept(0).unwrap_err().contains("cpu"));
        // 76% is above reject (75) but below pause (80).
        assert!(!guard.should_pause_kafka());

        guard.force_snapshot(ResourceSnapshot {
            cpu_percent: 81.0,
            memory_bytes: 0,
            tasks: 0,
        });
        assert!(guard.should_pause_kafka());
    }

    #[test]
    fn zero_pause_threshold_pauses_on_any_cpu() {
        let mut config = Config::default();
        config.cpu_reject_threshold = 0.0;
        config.cpu_pause_threshold = 0.0;
        let guard = test_guard(&config);
        guard.force_snapshot(ResourceSnapshot {
            cpu_percent: 0.5,
            memory_bytes: 0,
            tasks: 0,
        });
        assert!(guard.should_pause_kafka());
    }

    #[test]
    fn rejects_on_memory_and_tasks() {
        let mut config = Config::default();
        config.memory_limit_bytes = 1000;
        config.max_tasks = 10;
        let guard = test_guard(&config);

        guard.force_snapshot(ResourceSnapshot {
            cpu_percent: 0.0,
            memory_bytes: 2000,
            tasks: 0,
        });
        assert!(guard.should_accept(0).unwrap_err().contains("memory"));

        guard.force_snapshot(ResourceSnapshot {
            cpu_percent: 0.0,
            memory_bytes: 0,
            tasks: 10,
        });
        assert!(guard.should_accept(0).unwrap_err().contains("task limit"));
    }

    #[test]
    fn rss_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let status = dir.path().join("status");
        std::fs::write(&status, "Name:\todin\nVmRSS:\t  2048 kB\nThreads: 4\n").unwrap();
        assert_eq!(read_rss_bytes(&status), Some(2048 * 1024));
        assert_eq!(read_rss_bytes(&dir.path().join("missing")), None);
    }
}
