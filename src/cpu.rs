//! Container-aware CPU measurement.
//!
//! Reads cgroup v2 (`cpu.stat`, `cpu.max`) or cgroup v1 (`cpuacct.usage`,
//! `cpu.cfs_quota_us`, `cpu.cfs_period_us`, `cpu.stat`) and reports CPU usage
//! relative to the container's own quota, so 0-100 is the meaningful range
//! even when the host has many more cores than the container is allowed to
//! use. Host-wide measurement from `/proc/stat` is the fallback when cgroup
//! discovery fails; once the monitor falls back it stays on the host backend
//! for the remainder of the process lifetime.

use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Throttle counters accumulated by the kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThrottleTotals {
    pub periods: u64,
    pub throttled_periods: u64,
    pub throttled_usec: u64,
}

/// One CPU sample: usage relative to the container quota plus throttle deltas
/// since the previous sample.
#[derive(Debug, Clone, Copy)]
pub struct CpuSample {
    /// 0-100 relative to allocated CPUs (may exceed 100 briefly under bursts).
    pub percent: f64,
    /// Quota-derived core count, or host core count when unlimited.
    pub allocated_cpus: f64,
    pub periods_delta: u64,
    pub throttled_periods_delta: u64,
    pub throttled_seconds_delta: f64,
}

#[derive(Debug)]
enum Backend {
    /// cgroup v2 unified hierarchy.
    V2 { root: PathBuf },
    /// cgroup v1 split controllers.
    V1 { cpuacct: PathBuf, cpu: PathBuf },
    /// Host-wide /proc/stat.
    Host { stat_path: PathBuf },
}

struct MonitorState {
    backend: Backend,
    allocated_cpus: f64,
    last_usage_usec: Option<u64>,
    /// Host backend tracks jiffies instead of usec.
    last_host: Option<(u64, u64)>,
    last_wall: Instant,
    last_throttle: ThrottleTotals,
    last_percent: f64,
}

/// Process-wide CPU monitor. Sampling is mutex-guarded so concurrent callers
/// (resource guard tick, health endpoint) see monotonic, consistent readings.
pub struct CpuMonitor {
    state: Mutex<MonitorState>,
}

static GLOBAL: OnceLock<CpuMonitor> = OnceLock::new();

impl CpuMonitor {
    /// The process-wide singleton, discovering cgroups on first use.
    pub fn global() -> &'static CpuMonitor {
        GLOBAL.get_or_init(|| CpuMonitor::discover(Path::new("/sys/fs/cgroup"), 0.0))
    }

    /// Discover the best available backend under `cgroup_root`.
    ///
    /// `cpu_limit_cores` > 0 overrides quota discovery (WS_CPU_LIMIT).
    pub fn discover(cgroup_root: &Path, cpu_limit_cores: f64) -> Self {
        let host_cores = num_cpus::get() as f64;

        let v2_stat = cgroup_root.join("cpu.stat");
        let v1_usage = cgroup_root.join("cpuacct").join("cpuacct.usage");

        let backend = if v2_stat.is_file() && read_v2_usage_usec(&v2_stat).is_some() {
            Backend::V2 {
                root: cgroup_root.to_path_buf(),
            }
        } else if v1_usage.is_file() {
            Backend::V1 {
                cpuacct: cgroup_root.join("cpuacct"),
                cpu: cgroup_root.join("cpu"),
            }
        } else {
            warn!(
                root = %cgroup_root.display(),
                "cgroup discovery failed, falling back to host-wide CPU measurement"
            );
            Backend::Host {
                stat_path: PathBuf::from("/proc/stat"),
            }
        };

        let allocated = if cpu_limit_cores > 0.0 {
            cpu_limit_cores
        } else {
            match &backend {
                Backend::V2 { root } => {
                    read_v2_quota_cpus(&root.join("cpu.max")).unwrap_or(host_cores)
                }
                Backend::V1 { cpu, .. } => read_v1_quota_cpus(
                    &cpu.join("cpu.cfs_quota_us"),
                    &cpu.join("cpu.cfs_period_us"),
                )
                .unwrap_or(host_cores),
                Backend::Host { .. } => host_cores,
            }
        };

        debug!(backend = ?backend, allocated_cpus = allocated, "cpu monitor initialized");

        Self {
            state: Mutex::new(MonitorState {
                backend,
                allocated_cpus: allocated.max(0.01),
                last_usage_usec: None,
                last_host: None,
                last_wall: Instant::now(),
                last_throttle: ThrottleTotals::default(),
                last_percent: 0.0,
            }),
        }
    }

    /// Take a sample. Re-entrant; callers racing on the mutex each get a
    /// coherent reading (a zero-elapsed call repeats the previous percent).
    pub fn sample(&self) -> CpuSample {
        let mut state = self.state.lock();
        let now = Instant::now();
        let wall_usec = now.duration_since(state.last_wall).as_micros() as u64;

        enum Source {
            V2 { stat: PathBuf },
            V1 { usage: PathBuf, stat: PathBuf },
            Host { stat: PathBuf },
        }
        let source = match &state.backend {
            Backend::V2 { root } => Source::V2 {
                stat: root.join("cpu.stat"),
            },
            Backend::V1 { cpuacct, cpu } => Source::V1 {
                usage: cpuacct.join("cpuacct.usage"),
                stat: cpu.join("cpu.stat"),
            },
            Backend::Host { stat_path } => Source::Host {
                stat: stat_path.clone(),
            },
        };

        let (percent, throttle) = match source {
            Source::V2 { stat } => {
                match (read_v2_usage_usec(&stat), read_v2_throttle(&stat)) {
                    (Some(usage), throttle) => {
                        let pct = compute_percent(
                            state.last_usage_usec,
                            usage,
                            wall_usec,
                            state.allocated_cpus,
                            state.last_percent,
                        );
                        state.last_usage_usec = Some(usage);
                        (pct, throttle)
                    }
                    _ => {
                        self.degrade_to_host(&mut state);
                        (state.last_percent, state.last_throttle)
                    }
                }
            }
            Source::V1 { usage, stat } => {
                let usage = read_v1_usage_usec(&usage);
                let throttle = read_v1_throttle(&stat);
                match usage {
                    Some(usage) => {
                        let pct = compute_percent(
                            state.last_usage_usec,
                            usage,
                            wall_usec,
                            state.allocated_cpus,
                            state.last_percent,
                        );
                        state.last_usage_usec = Some(usage);
                        (pct, throttle)
                    }
                    None => {
                        self.degrade_to_host(&mut state);
                        (state.last_percent, state.last_throttle)
                    }
                }
            }
            Source::Host { stat } => match read_proc_stat(&stat) {
                Some((busy, total)) => {
                    let pct = match state.last_host {
                        Some((last_busy, last_total)) => {
                            let busy_delta = busy.saturating_sub(last_busy) as f64;
                            let total_delta = total.saturating_sub(last_total) as f64;
                            if total_delta > 0.0 {
                                (busy_delta / total_delta * 100.0).clamp(0.0, 100.0)
                            } else {
                                state.last_percent
                            }
                        }
                        None => 0.0,
                    };
                    state.last_host = Some((busy, total));
                    (pct, ThrottleTotals::default())
                }
                None => (state.last_percent, state.last_throttle),
            },
        };

        let periods_delta = throttle.periods.saturating_sub(state.last_throttle.periods);
        let throttled_periods_delta = throttle
            .throttled_periods
            .saturating_sub(state.last_throttle.throttled_periods);
        let throttled_usec_delta = throttle
            .throttled_usec
            .saturating_sub(state.last_throttle.throttled_usec);

        state.last_throttle = throttle;
        state.last_wall = now;
        state.last_percent = percent;

        CpuSample {
            percent,
            allocated_cpus: state.allocated_cpus,
            periods_delta,
            throttled_periods_delta,
            throttled_seconds_delta: throttled_usec_delta as f64 / 1_000_000.0,
        }
    }

    /// A transient cgroup read failure permanently demotes to the host
    /// backend; cgroup files disappearing mid-flight usually means the
    /// container runtime is rearranging the hierarchy under us.
    fn degrade_to_host(&self, state: &mut MonitorState) {
        if !matches!(state.backend, Backend::Host { .. }) {
            warn!("cgroup files became unreadable, switching to host-wide CPU measurement");
            state.backend = Backend::Host {
                stat_path: PathBuf::from("/proc/stat"),
            };
            state.allocated_cpus = num_cpus::get() as f64;
            state.last_usage_usec = None;
            state.last_host = None;
        }
    }
}

fn compute_percent(
    last_usage: Option<u64>,
    usage_usec: u64,
    wall_usec: u64,
    allocated_cpus: f64,
    last_percent: f64,
) -> f64 {
    match last_usage {
        Some(last) if wall_usec > 0 => {
            let cpu_delta = usage_usec.saturating_sub(last) as f64;
            ((cpu_delta / wall_usec as f64) * 100.0 / allocated_cpus).max(0.0)
        }
        Some(_) => last_percent,
        // First sample has no baseline.
        None => 0.0,
    }
}

// ---------------------------------------------------------------------------
// cgroup v2
// ---------------------------------------------------------------------------

/// `cpu.stat`: `usage_usec <n>` among other lines.
fn read_v2_usage_usec(path: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    stat_field(&content, "usage_usec")
}

fn read_v2_throttle(path: &Path) -> ThrottleTotals {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    ThrottleTotals {
        periods: stat_field(&content, "nr_periods").unwrap_or(0),
        throttled_periods: stat_field(&content, "nr_throttled").unwrap_or(0),
        throttled_usec: stat_field(&content, "throttled_usec").unwrap_or(0),
    }
}

/// `cpu.max`: `"max 100000"` (unlimited) or `"<quota> <period>"` in usec.
fn read_v2_quota_cpus(path: &Path) -> Option<f64> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: f64 = quota.parse().ok()?;
    let period: f64 = parts.next()?.parse().ok()?;
    if period > 0.0 && quota > 0.0 {
        Some(quota / period)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// cgroup v1
// ---------------------------------------------------------------------------

/// `cpuacct.usage` is total nanoseconds across all cores.
fn read_v1_usage_usec(path: &Path) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    let ns: u64 = content.trim().parse().ok()?;
    Some(ns / 1_000)
}

/// v1 `cpu.stat` reports `throttled_time` in nanoseconds.
fn read_v1_throttle(path: &Path) -> ThrottleTotals {
    let content = std::fs::read_to_string(path).unwrap_or_default();
    ThrottleTotals {
        periods: stat_field(&content, "nr_periods").unwrap_or(0),
        throttled_periods: stat_field(&content, "nr_throttled").unwrap_or(0),
        throttled_usec: stat_field(&content, "throttled_time").unwrap_or(0) / 1_000,
    }
}

fn read_v1_quota_cpus(quota_path: &Path, period_path: &Path) -> Option<f64> {
    let quota: i64 = std::fs::read_to_string(quota_path)
        .ok()?
        .trim()
        .parse()
        .ok()?;
    // -1 means unlimited.
    if quota <= 0 {
        return None;
    }
    let period: f64 = std::fs::read_to_string(period_path)
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if period > 0.0 {
        Some(quota as f64 / period)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// /proc/stat fallback
// ---------------------------------------------------------------------------

/// Aggregate (busy, total) jiffies from the first `cpu ` line.
fn read_proc_stat(path: &Path) -> Option<(u64, u64)> {
    let content = std::fs::read_to_string(path).ok()?;
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total: u64 = fields.iter().sum();
    Some((total.saturating_sub(idle), total))
}

fn stat_field(content: &str, field: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == field {
            parts.next()?.parse().ok()
        } else {
            None
        }
    })
}
