//! Server-side observability state surfaced by `/health`.
//!
//! Counters use atomics; the maps (disconnects by reason, drops by channel)
//! and the saturation sample window each sit behind their own dedicated
//! mutex, taken briefly by writers and by `/health` readers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

/// Who initiated a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    Client,
    Server,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Send-buffer saturation samples: last `SATURATION_WINDOW` observations of
/// queue fill fraction (0.0 - 1.0), recorded on every broadcast enqueue.
const SATURATION_WINDOW: usize = 100;

#[derive(Default)]
struct SaturationWindowState {
    samples: Vec<f64>,
    next: usize,
}

/// Aggregated gateway statistics.
pub struct GatewayStats {
    started: Instant,
    pub messages_sent: AtomicU64,
    pub rate_limited: AtomicU64,
    pub serialization_errors: AtomicU64,
    pub bus_publish_drops: AtomicU64,
    pub warnings: AtomicU64,
    pub errors: AtomicU64,
    disconnects: Mutex<HashMap<(String, Initiator), u64>>,
    dropped_broadcasts: Mutex<HashMap<String, u64>>,
    saturation: Mutex<SaturationWindowState>,
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            messages_sent: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            serialization_errors: AtomicU64::new(0),
            bus_publish_drops: AtomicU64::new(0),
            warnings: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            disconnects: Mutex::new(HashMap::new()),
            dropped_broadcasts: Mutex::new(HashMap::new()),
            saturation: Mutex::new(SaturationWindowState::default()),
        }
    }
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn record_disconnect(&self, reason: &str, initiator: Initiator) {
        let mut disconnects = self.disconnects.lock();
        *disconnects
            .entry((reason.to_string(), initiator))
            .or_insert(0) += 1;
    }

    /// A broadcast dropped for one client, tagged with its channel.
    pub fn record_dropped_broadcast(&self, channel: &str) {
        let mut dropped = self.dropped_broadcasts.lock();
        *dropped.entry(channel.to_string()).or_insert(0) += 1;
    }

    /// Record how full a client's outbound queue was at enqueue time.
    pub fn record_saturation(&self, fill_fraction: f64) {
        let mut window = self.saturation.lock();
        let sample = fill_fraction.clamp(0.0, 1.0);
        if window.samples.len() < SATURATION_WINDOW {
            window.samples.push(sample);
        } else {
            let slot = window.next;
            window.samples[slot] = sample;
        }
        window.next = (window.next + 1) % SATURATION_WINDOW;
    }

    pub fn note_warning(&self) {
        self.warnings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let disconnects = {
            let map = self.disconnects.lock();
            map.iter()
                .map(|((reason, initiator), count)| DisconnectCount {
                    reason: reason.clone(),
                    initiated_by: initiator.as_str(),
                    count: *count,
                })
                .collect()
        };
        let dropped_broadcasts = {
            let map = self.dropped_broadcasts.lock();
            map.iter()
                .map(|(channel, count)| (channel.clone(), *count))
                .collect()
        };
        let saturation = {
            let window = self.saturation.lock();
            let mut sorted = window.samples.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            SaturationPercentiles {
                p50: percentile(&sorted, 0.50),
                p95: percentile(&sorted, 0.95),
                p99: percentile(&sorted, 0.99),
                samples: sorted.len(),
            }
        };

        StatsSnapshot {
            uptime_seconds: self.uptime_seconds(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            serialization_errors: self.serialization_errors.load(Ordering::Relaxed),
            bus_publish_drops: self.bus_publish_drops.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            disconnects,
            dropped_broadcasts,
            send_buffer_saturation: saturation,
        }
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectCount {
    pub reason: String,
    pub initiated_by: &'static str,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SaturationPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
}

/// Serializable view for the `/health` observability block.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_seconds: u64,
    pub messages_sent: u64,
    pub rate_limited: u64,
    pub serialization_errors: u64,
    pub bus_publish_drops: u64,
    pub warnings: u64,
    pub errors: u64,
    pub disconnects: Vec<DisconnectCount>,
    pub dropped_broadcasts: HashMap<String, u64>,
    pub send_buffer_saturation: SaturationPercentiles,
}
