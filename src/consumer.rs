//! Shared Kafka consumer pool.
//!
//! One `StreamConsumer` in one consumer group pulls every topic once for the
//! whole process and publishes into the broadcast bus. Offsets are stored
//! only after a record has been routed (at-least-once into the bus); when the
//! resource guard signals CPU pressure the consumer stops fetching entirely,
//! so unrouted records are redelivered by Kafka later.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::Bytes;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::ClientConfig;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::bus::{BroadcastMessage, BusPublisher};
use crate::config::{Config, KAFKA_TOPICS};
use crate::envelope::event_type_for_topic;
use crate::guard::ResourceGuard;
use crate::limiter::SharedBucket;
use crate::metrics::GatewayMetrics;

const CREATE_MAX_RETRIES: u32 = 5;
/// How long the consumer sleeps per tick while paused for CPU pressure.
const PAUSE_TICK: Duration = Duration::from_millis(250);
/// Backoff after an infrastructure error so a dead broker can't busy-loop us.
const ERROR_BACKOFF: Duration = Duration::from_millis(250);
/// A message this recently counts as "connected" for health purposes.
const CONNECTED_RECENCY: Duration = Duration::from_secs(60);

/// Liveness surfaced to `/health`.
pub struct ConsumerStatus {
    started: Instant,
    connected: AtomicBool,
    last_message_ms: AtomicU64,
    pub messages: AtomicU64,
    pub errors: AtomicU64,
}

impl ConsumerStatus {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            connected: AtomicBool::new(false),
            last_message_ms: AtomicU64::new(0),
            messages: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn note_message(&self) {
        self.connected.store(true, Ordering::Relaxed);
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms.store(
            self.started.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
    }

    fn note_broker_down(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn note_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Connected means the link was up at last observation; a quiet topic
    /// set does not flip this false, only broker-level errors do.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn last_message_age(&self) -> Option<Duration> {
        let ms = self.last_message_ms.load(Ordering::Relaxed);
        if ms == 0 {
            None
        } else {
            Some(self.started.elapsed().saturating_sub(Duration::from_millis(ms)))
        }
    }

    /// Recently active regardless of the connected flag.
    pub fn recently_active(&self) -> bool {
        self.last_message_age()
            .is_some_and(|age| age < CONNECTED_RECENCY)
    }
}

/// The shared consumer and its routing loop.
pub struct ConsumerPool {
    consumer: StreamConsumer,
    publisher: BusPublisher,
    guard: Arc<ResourceGuard>,
    kafka_bucket: SharedBucket,
    status: Arc<ConsumerStatus>,
    metrics: Arc<GatewayMetrics>,
}

impl ConsumerPool {
    /// Create and subscribe the consumer, retrying with exponential backoff;
    /// a broker that is still starting up should not kill the gateway.
    pub async fn connect(
        config: &Config,
        publisher: BusPublisher,
        guard: Arc<ResourceGuard>,
        metrics: Arc<GatewayMetrics>,
    ) -> anyhow::Result<Self> {
        let consumer = Self::create_with_retry(config).await?;

        let topics: Vec<&str> = KAFKA_TOPICS.to_vec();
        consumer
            .subscribe(&topics)
            .context("failed to subscribe to topic set")?;
        info!(
            brokers = %config.kafka_brokers,
            group = %config.kafka_consumer_group,
            topics = ?topics,
            "kafka consumer subscribed"
        );

        let status = Arc::new(ConsumerStatus::new());
        // Subscribed successfully: report connected until proven otherwise.
        status.connected.store(true, Ordering::Relaxed);

        Ok(Self {
            consumer,
            publisher,
            guard,
            kafka_bucket: SharedBucket::per_second(config.max_kafka_rate),
            status,
            metrics,
        })
    }

    async fn create_with_retry(config: &Config) -> anyhow::Result<StreamConsumer> {
        let mut retry_count: u32 = 0;
        loop {
            let result: Result<StreamConsumer, _> = ClientConfig::new()
                .set("bootstrap.servers", &config.kafka_brokers)
                .set("group.id", &config.kafka_consumer_group)
                .set("enable.auto.commit", "true")
                // Store offsets only after a record has been routed.
                .set("enable.auto.offset.store", "false")
                // A realtime fan-out gateway has no use for history on a
                // fresh group; clients recover short gaps via replay.
                .set("auto.offset.reset", "latest")
                .create();
            match result {
                Ok(consumer) => return Ok(consumer),
                Err(e) => {
                    retry_count += 1;
                    if retry_count >= CREATE_MAX_RETRIES {
                        return Err(e).context(format!(
                            "failed to create kafka consumer after {CREATE_MAX_RETRIES} attempts"
                        ));
                    }
                    let backoff_ms = 1000u64 * (1 << retry_count);
                    warn!(
                        attempt = retry_count,
                        max = CREATE_MAX_RETRIES,
                        error = %e,
                        backoff_ms,
                        "kafka consumer creation failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
    }

    pub fn status(&self) -> Arc<ConsumerStatus> {
        Arc::clone(&self.status)
    }

    /// Consume until shutdown. Pause gates run BEFORE the fetch so deferred
    /// records stay in Kafka rather than being received and re-queued.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("kafka consumer loop starting");
        loop {
            // CPU backpressure: stop fetching entirely while over threshold.
            if self.guard.should_pause_kafka() {
                self.metrics.kafka_pause_ticks.inc();
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(PAUSE_TICK) => continue,
                }
            }

            // Routing rate limit, same pre-fetch discipline.
            if !self.kafka_bucket.try_consume(1) {
                self.metrics.kafka_rate_limited.inc();
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(Duration::from_millis(5)) => continue,
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.consumer.recv() => match result {
                    Ok(record) => {
                        self.status.note_message();
                        self.route_record(&record);
                        if let Err(e) = self.consumer.store_offset_from_message(&record) {
                            warn!(
                                topic = record.topic(),
                                partition = record.partition(),
                                offset = record.offset(),
                                error = %e,
                                "failed to store kafka offset"
                            );
                        }
                    }
                    Err(e) => {
                        let error_type = classify_kafka_error(&e.to_string());
                        self.metrics
                            .kafka_infra_errors
                            .with_label_values(&[error_type])
                            .inc();
                        if error_type == "broker_down" {
                            self.status.note_broker_down();
                        } else {
                            self.status.note_error();
                        }
                        warn!(error = %e, error_type, "kafka receive error");
                        tokio::select! {
                            _ = shutdown.recv() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }

        if let Err(e) = self.consumer.commit_consumer_state(CommitMode::Sync) {
            warn!(error = %e, "final kafka commit failed during shutdown");
        }
        info!("kafka consumer loop terminated");
    }

    fn route_record(&self, record: &rdkafka::message::BorrowedMessage<'_>) {
        let Some(payload) = record.payload() else {
            self.metrics
                .kafka_messages
                .with_label_values(&["skipped"])
                .inc();
            debug!(
                topic = record.topic(),
                offset = record.offset(),
                "record without payload, skipping"
            );
            return;
        };

        match derive_subject(record.topic(), record.key(), payload) {
            Some(subject) => {
                self.publisher.publish(BroadcastMessage::new(
                    subject,
                    Bytes::copy_from_slice(payload),
                ));
                self.metrics
                    .kafka_messages
                    .with_label_values(&["routed"])
                    .inc();
            }
            None => {
                self.metrics
                    .kafka_messages
                    .with_label_values(&["skipped"])
                    .inc();
                debug!(
                    topic = record.topic(),
                    offset = record.offset(),
                    "record without symbol, skipping"
                );
            }
        }
    }
}

/// Normalize a record to its subject: `odin.token.{symbol}.{event_type}`.
///
/// The event type maps one-to-one with the topic; the symbol comes from the
/// record key, falling back to a `symbol` field in a JSON payload.
pub fn derive_subject(topic: &str, key: Option<&[u8]>, payload: &[u8]) -> Option<String> {
    let event_type = match event_type_for_topic(topic) {
        Some(known) => known,
        // Unknown topic: the short name after the prefix is the event type.
        None => topic.strip_prefix("odin.").filter(|s| !s.is_empty())?,
    };

    let symbol_from_key = key
        .and_then(|k| std::str::from_utf8(k).ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.contains('.'))
        .map(str::to_string);

    let symbol = match symbol_from_key {
        Some(symbol) => symbol,
        None => {
            let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
            value.get("symbol")?.as_str().map(str::to_string)?
        }
    };

    Some(format!("odin.token.{symbol}.{event_type}"))
}

/// Bucket Kafka transport errors for the infra error counter.
pub fn classify_kafka_error(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("dns") || lower.contains("resolve") || lower.contains("name") {
        "dns_failure"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "connection_timeout"
    } else if lower.contains("broker")
        || lower.contains("connection refused")
        || lower.contains("reset by peer")
        || lower.contains("transport")
    {
        "broker_down"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_from_key() {
        assert_eq!(
            derive_subject("odin.trades", Some(b"BTC"), b"{}").as_deref(),
            Some("odin.token.BTC.trade")
        );
        assert_eq!(
            derive_subject("odin.balances", Some(b" SOL "), b"{}").as_deref(),
            Some("odin.token.SOL.balance")
        );
    }

    #[test]
    fn subject_falls_back_to_payload_symbol() {
        assert_eq!(
            derive_subject("odin.trades", None, br#"{"symbol":"ETH","price":2}"#).as_deref(),
            Some("odin.token.ETH.trade")
        );
        assert_eq!(
            derive_subject("odin.trades", Some(b""), br#"{"symbol":"ETH"}"#).as_deref(),
            Some("odin.token.ETH.trade")
        );
        // No key, no symbol field: unroutable.
        assert_eq!(derive_subject("odin.trades", None, b"{}"), None);
        assert_eq!(derive_subject("odin.trades", None, b"garbage"), None);
    }

    #[test]
    fn unknown_topic_uses_short_name() {
        assert_eq!(
            derive_subject("odin.governance", Some(b"BTC"), b"{}").as_deref(),
            Some("odin.token.BTC.governance")
        );
        assert_eq!(derive_subject("other.topic", Some(b"BTC"), b"{}"), None);
        assert_eq!(derive_subject("odin.", Some(b"BTC"), b"{}"), None);
    }

    #[test]
    fn dotted_keys_are_rejected_as_symbols() {
        // A key with a dot would corrupt the channel grammar.
        assert_eq!(derive_subject("odin.trades", Some(b"BTC.X"), b"{}"), None);
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            classify_kafka_error("Failed to resolve 'kafka:9092'"),
            "dns_failure"
        );
        assert_eq!(
            classify_kafka_error("Connection timed out"),
            "connection_timeout"
        );
        assert_eq!(
            classify_kafka_error("broker transport failure"),
            "broker_down"
        );
        assert_eq!(classify_kafka_error("something else"), "unknown");
    }

    #[test]
    fn status_recency() {
        let status = ConsumerStatus::new();
        assert!(!status.is_connected());
        assert!(status.last_message_age().is_none());
        assert!(!status.recently_active());

        status.note_message();
        assert!(status.is_connected());
        assert!(status.recently_active());

        status.note_broker_down();
        assert!(!status.is_connected());
    }
}
