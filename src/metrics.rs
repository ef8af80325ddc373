//! Prometheus metrics for the gateway.
//!
//! Instruments are registered on a per-gateway registry so tests can run
//! several gateways in one process. Registration failures log and fall back
//! to an unregistered instrument rather than aborting startup; a metric that
//! doesn't scrape is better than a server that doesn't start.
//!
//! `/metrics` gathers everything from the one registry. Values that live in
//! `GatewayStats` atomics (uptime, saturation percentiles) are bridged in at
//! scrape time by `StatsCollector`.

use std::sync::Arc;

use prometheus::core::{Collector, Desc};
use prometheus::proto::{Gauge as ProtoGauge, Metric as ProtoMetric, MetricFamily, MetricType};
use prometheus::{
    Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use tracing::warn;

use crate::stats::GatewayStats;

fn register<C: Collector + Clone + 'static>(registry: &Registry, collector: C) -> C {
    if let Err(e) = registry.register(Box::new(collector.clone())) {
        warn!(error = %e, "metric registration failed, continuing unregistered");
    }
    collector
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    match IntCounter::new(name, help) {
        Ok(c) => register(registry, c),
        Err(e) => {
            warn!(metric = name, error = %e, "falling back to placeholder counter");
            IntCounter::new(format!("{name}_invalid"), help).unwrap_or_else(|_| {
                // A static, known-valid name; reached only if prometheus
                // rejects even the fallback, which would be a library bug.
                IntCounter::new("ws_invalid_counter", "placeholder").unwrap()
            })
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    match IntCounterVec::new(Opts::new(name, help), labels) {
        Ok(c) => register(registry, c),
        Err(e) => {
            warn!(metric = name, error = %e, "falling back to placeholder counter vec");
            IntCounterVec::new(Opts::new(format!("{name}_invalid"), help), labels)
                .unwrap_or_else(|_| {
                    IntCounterVec::new(Opts::new("ws_invalid_counter_vec", "placeholder"), labels)
                        .unwrap()
                })
        }
    }
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    match IntGauge::new(name, help) {
        Ok(g) => register(registry, g),
        Err(e) => {
            warn!(metric = name, error = %e, "falling back to placeholder gauge");
            IntGauge::new(format!("{name}_invalid"), help)
                .unwrap_or_else(|_| IntGauge::new("ws_invalid_gauge", "placeholder").unwrap())
        }
    }
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    match Gauge::new(name, help) {
        Ok(g) => register(registry, g),
        Err(e) => {
            warn!(metric = name, error = %e, "falling back to placeholder gauge");
            Gauge::new(format!("{name}_invalid"), help)
                .unwrap_or_else(|_| Gauge::new("ws_invalid_fgauge", "placeholder").unwrap())
        }
    }
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    match Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets.clone())) {
        Ok(h) => register(registry, h),
        Err(e) => {
            warn!(metric = name, error = %e, "falling back to placeholder histogram");
            Histogram::with_opts(HistogramOpts::new(format!("{name}_invalid"), help))
                .unwrap_or_else(|_| {
                    Histogram::with_opts(HistogramOpts::new("ws_invalid_histogram", "placeholder"))
                        .unwrap()
                })
        }
    }
}

/// Every instrument the gateway emits.
pub struct GatewayMetrics {
    pub registry: Registry,

    // Delivery path
    pub messages_sent: IntCounter,
    pub dropped_broadcasts: IntCounterVec,
    pub slow_client_attempts: Histogram,
    pub disconnects: IntCounterVec,
    pub rate_limited: IntCounter,
    pub serialization_errors: IntCounter,
    pub broadcast_rate_limited: IntCounter,
    pub replay_requests: IntCounter,
    pub replayed_messages: IntCounter,

    // Admission
    pub connections_accepted: IntCounter,
    pub connections_rejected: IntCounterVec,
    pub active_connections: IntGauge,

    // Bus
    pub bus_published: IntCounter,
    pub bus_publish_dropped: IntCounter,
    pub bus_fanout_dropped: IntCounterVec,

    // Kafka
    pub kafka_messages: IntCounterVec,
    pub kafka_infra_errors: IntCounterVec,
    pub kafka_pause_ticks: IntCounter,
    pub kafka_rate_limited: IntCounter,

    // Resources
    pub cpu_percent: Gauge,
    pub cpu_throttled_seconds: Gauge,
    pub memory_bytes: IntGauge,
    pub tracked_tasks: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        #[cfg(target_os = "linux")]
        if let Err(e) = registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        )) {
            warn!(error = %e, "process collector registration failed");
        }
        Self {
            messages_sent: counter(
                &registry,
                "ws_messages_sent_total",
                "Envelopes enqueued to client send buffers",
            ),
            dropped_broadcasts: counter_vec(
                &registry,
                "ws_dropped_broadcasts_total",
                "Broadcasts dropped per client send buffer, by channel and reason",
                &["channel", "reason"],
            ),
            slow_client_attempts: histogram(
                &registry,
                "ws_slow_client_attempts_before_disconnect",
                "Failed enqueue attempts accumulated before a slow client was disconnected",
                vec![1.0, 2.0, 3.0, 5.0, 10.0],
            ),
            disconnects: counter_vec(
                &registry,
                "ws_disconnects_total",
                "Client disconnects by reason and initiator",
                &["reason", "initiated_by"],
            ),
            rate_limited: counter(
                &registry,
                "ws_rate_limited_total",
                "Inbound client messages dropped by the per-client rate limiter",
            ),
            serialization_errors: counter(
                &registry,
                "ws_serialization_errors_total",
                "Envelopes skipped because the payload failed serialization",
            ),
            broadcast_rate_limited: counter(
                &registry,
                "ws_broadcast_rate_limited_total",
                "Bus messages dropped by the global broadcast rate limit",
            ),
            replay_requests: counter(
                &registry,
                "ws_replay_requests_total",
                "Replay requests received",
            ),
            replayed_messages: counter(
                &registry,
                "ws_replayed_messages_total",
                "Envelopes re-sent from replay buffers",
            ),
            connections_accepted: counter(
                &registry,
                "ws_connections_accepted_total",
                "Successful WebSocket upgrades",
            ),
            connections_rejected: counter_vec(
                &registry,
                "ws_connections_rejected_total",
                "Upgrades refused, by reason",
                &["reason"],
            ),
            active_connections: int_gauge(
                &registry,
                "ws_active_connections",
                "Currently connected clients across all shards",
            ),
            bus_published: counter(
                &registry,
                "ws_bus_published_total",
                "Messages accepted onto the broadcast bus",
            ),
            bus_publish_dropped: counter(
                &registry,
                "ws_bus_publish_dropped_total",
                "Messages dropped because the bus publish channel was full (overload signal)",
            ),
            bus_fanout_dropped: counter_vec(
                &registry,
                "ws_bus_fanout_dropped_total",
                "Messages dropped because one shard's subscriber channel was full",
                &["shard"],
            ),
            kafka_messages: counter_vec(
                &registry,
                "ws_kafka_messages_total",
                "Kafka records by outcome (routed, skipped, error)",
                &["status"],
            ),
            kafka_infra_errors: counter_vec(
                &registry,
                "ws_kafka_infra_errors_total",
                "Kafka infrastructure errors by type",
                &["error_type"],
            ),
            kafka_pause_ticks: counter(
                &registry,
                "ws_kafka_pause_ticks_total",
                "Intervals the consumer spent paused for CPU backpressure",
            ),
            kafka_rate_limited: counter(
                &registry,
                "ws_kafka_rate_limited_total",
                "Kafka records deferred by the routing rate limit",
            ),
            cpu_percent: gauge(
                &registry,
                "ws_cpu_percent",
                "CPU usage relative to the container quota",
            ),
            cpu_throttled_seconds: gauge(
                &registry,
                "ws_cpu_throttled_seconds_total",
                "Cumulative CPU throttle time reported by the cgroup",
            ),
            memory_bytes: int_gauge(&registry, "ws_memory_bytes", "Resident set size"),
            tracked_tasks: int_gauge(
                &registry,
                "ws_tracked_tasks",
                "Live async tasks registered with the resource guard",
            ),
            registry,
        }
    }

    /// Attach the stats bridge; call once after both sides exist.
    pub fn attach_stats(&self, stats: Arc<GatewayStats>) {
        if let Err(e) = self
            .registry
            .register(Box::new(StatsCollector::new(stats)))
        {
            warn!(error = %e, "stats collector registration failed");
        }
    }

    /// Render the registry in Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = prometheus::TextEncoder::new();
        encoder.encode_to_string(&self.registry.gather())
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Bridges `GatewayStats` values into the registry at scrape time, so
/// `/metrics` and `/health` always agree.
pub struct StatsCollector {
    stats: Arc<GatewayStats>,
    descs: Vec<Desc>,
}

impl StatsCollector {
    pub fn new(stats: Arc<GatewayStats>) -> Self {
        let descs = vec![
            Desc::new(
                "ws_uptime_seconds".to_string(),
                "Server uptime in seconds".to_string(),
                Vec::new(),
                std::collections::HashMap::new(),
            ),
            Desc::new(
                "ws_send_buffer_saturation".to_string(),
                "Send buffer fill fraction percentiles over the last 100 samples".to_string(),
                vec!["quantile".to_string()],
                std::collections::HashMap::new(),
            ),
        ]
        .into_iter()
        .flatten()
        .collect();
        Self { stats, descs }
    }

    fn gauge_family(name: &str, help: &str, series: Vec<(Vec<(&str, String)>, f64)>) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(name.to_string());
        family.set_help(help.to_string());
        family.set_field_type(MetricType::GAUGE);
        for (labels, value) in series {
            let mut metric = ProtoMetric::default();
            let pairs: Vec<prometheus::proto::LabelPair> = labels
                .into_iter()
                .map(|(k, v)| {
                    let mut pair = prometheus::proto::LabelPair::default();
                    pair.set_name(k.to_string());
                    pair.set_value(v);
                    pair
                })
                .collect();
            metric.set_label(pairs.into());
            let mut gauge = ProtoGauge::default();
            gauge.set_value(value);
            metric.set_gauge(gauge);
            family.mut_metric().push(metric);
        }
        family
    }
}

impl Collector for StatsCollector {
    fn desc(&self) -> Vec<&Desc> {
        self.descs.iter().collect()
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let snapshot = self.stats.snapshot();
        vec![
            Self::gauge_family(
                "ws_uptime_seconds",
                "Server uptime in seconds",
                vec![(Vec::new(), snapshot.uptime_seconds as f64)],
            ),
            Self::gauge_family(
                "ws_send_buffer_saturation",
                "Send buffer fill fraction percentiles over the last 100 samples",
                vec![
                    (
                        vec![("quantile", "0.5".to_string())],
                        snapshot.send_buffer_saturation.p50,
                    ),
                    (
                        vec![("quantile", "0.95".to_string())],
                        snapshot.send_buffer_saturation.p95,
                    ),
                    (
                        vec![("quantile", "0.99".to_string())],
                        snapshot.send_buffer_saturation.p99,
                    ),
                ],
            ),
        ]
    }
}
