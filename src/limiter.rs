//! Token-bucket rate limiting.
//!
//! Three limiters share one bucket implementation:
//! - per-client message buckets (capacity 100, 10 tokens/sec), created on
//!   first check and destroyed on disconnect;
//! - optional connection-admission buckets (per-IP and global), enforced at
//!   upgrade time before shard selection;
//! - single global buckets gating the Kafka routing path and the shard
//!   broadcast path.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{ConnRateConfig, CLIENT_RATE_BURST, CLIENT_RATE_PER_SEC};

/// Token bucket. O(1) time and memory; refill is computed lazily from the
/// elapsed wall time on each consume attempt.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: f64,
    last_refill: Instant,
    refill_rate: f64,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        let refill_rate = if refill_rate.is_finite() && refill_rate >= 0.0 {
            refill_rate
        } else {
            0.0
        };
        Self {
            capacity,
            tokens: capacity as f64,
            last_refill: Instant::now(),
            refill_rate,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        let updated = self.tokens + elapsed * self.refill_rate;
        self.tokens = updated.clamp(0.0, self.capacity as f64);
        self.last_refill = now;
    }

    pub fn try_consume(&mut self, count: u64) -> bool {
        self.refill();
        if self.tokens >= count as f64 {
            self.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&mut self) -> u64 {
        self.refill();
        self.tokens as u64
    }
}

/// A `TokenBucket` behind a mutex, for the global Kafka/broadcast limits that
/// are shared across tasks.
#[derive(Debug)]
pub struct SharedBucket {
    inner: Mutex<TokenBucket>,
}

impl SharedBucket {
    pub fn new(capacity: u64, refill_rate: f64) -> Self {
        Self {
            inner: Mutex::new(TokenBucket::new(capacity, refill_rate)),
        }
    }

    /// A bucket sized for a sustained per-second rate with one second of burst.
    pub fn per_second(rate: f64) -> Self {
        let capacity = rate.max(1.0) as u64;
        Self::new(capacity, rate.max(0.0))
    }

    pub fn try_consume(&self, count: u64) -> bool {
        self.inner.lock().try_consume(count)
    }
}

/// Per-client message rate limiter registry, keyed by client id.
///
/// Buckets are created atomically on first check and must be removed on
/// disconnect; the map never grows past the live connection count.
#[derive(Default)]
pub struct ClientRateLimiter {
    buckets: Mutex<HashMap<u64, TokenBucket>>,
}

impl ClientRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume `count` tokens for `client_id`, creating the bucket on first
    /// use. Returns false when the client is over its limit.
    pub fn try_consume(&self, client_id: u64, count: u64) -> bool {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(client_id)
            .or_insert_with(|| TokenBucket::new(CLIENT_RATE_BURST, CLIENT_RATE_PER_SEC))
            .try_consume(count)
    }

    /// Drop the client's bucket state on disconnect.
    pub fn remove(&self, client_id: u64) {
        self.buckets.lock().remove(&client_id);
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().len()
    }
}

/// Connection-admission limiter: a global bucket plus per-IP buckets and
/// per-IP active-connection counts. Disabled entirely unless the operator
/// turns it on.
pub struct ConnectionLimiter {
    config: ConnRateConfig,
    global: Mutex<TokenBucket>,
    per_ip: Mutex<HashMap<IpAddr, TokenBucket>>,
}

/// Why an upgrade was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnReject {
    PerIpRate,
    GlobalRate,
}

const MAX_TRACKED_IPS: usize = 100_000;
const PRUNE_BATCH: usize = 1_000;

impl ConnectionLimiter {
    pub fn new(config: ConnRateConfig) -> Self {
        let global = TokenBucket::new(config.global_burst, config.global_rate);
        Self {
            config,
            global: Mutex::new(global),
            per_ip: Mutex::new(HashMap::new()),
        }
    }

    /// Admission check for one upgrade attempt from `ip`.
    pub fn check(&self, ip: IpAddr) -> Result<(), ConnReject> {
        if !self.config.enabled {
            return Ok(());
        }

        {
            let mut per_ip = self.per_ip.lock();
            if !per_ip.contains_key(&ip) && per_ip.len() >= MAX_TRACKED_IPS {
                // Bounded map: prune full buckets first, arbitrary order. An
                // evicted IP just gets a fresh (full) bucket on its next try.
                let mut prunable = Vec::new();
                for (key, bucket) in per_ip.iter_mut() {
                    if prunable.len() >= PRUNE_BATCH {
                        break;
                    }
                    if bucket.available_tokens() >= bucket.capacity {
                        prunable.push(*key);
                    }
                }
                for key in prunable {
                    per_ip.remove(&key);
                }
            }
            let bucket = per_ip.entry(ip).or_insert_with(|| {
                TokenBucket::new(self.config.per_ip_burst, self.config.per_ip_rate)
            });
            if !bucket.try_consume(1) {
                return Err(ConnReject::PerIpRate);
            }
        }

        if !self.global.lock().try_consume(1) {
            return Err(ConnReject::GlobalRate);
        }
        Ok(())
    }
}
