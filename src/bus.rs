//! In-process broadcast bus.
//!
//! Single-producer-many-consumer fan-out from the Kafka consumer to every
//! shard. The publisher side never blocks: a full publish channel drops the
//! message (a system-wide overload signal), and a full shard subscriber
//! channel drops that one message for that shard only. Slow shards can never
//! backpressure the consumer.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::{BUS_BATCH_SIZE, BUS_PUBLISH_CAPACITY};
use crate::metrics::GatewayMetrics;
use crate::stats::GatewayStats;

/// One message on the bus: a derived subject plus the raw payload.
/// Immutable after publish; `Bytes` makes the per-shard clone O(1).
#[derive(Debug, Clone)]
pub struct BroadcastMessage {
    pub subject: Arc<str>,
    pub payload: Bytes,
}

impl BroadcastMessage {
    pub fn new(subject: impl Into<Arc<str>>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
        }
    }
}

/// Publisher handle, cheap to clone.
#[derive(Clone)]
pub struct BusPublisher {
    tx: mpsc::Sender<BroadcastMessage>,
    metrics: Arc<GatewayMetrics>,
    stats: Arc<GatewayStats>,
}

impl BusPublisher {
    /// Best-effort non-blocking publish. Returns whether the bus took it.
    pub fn publish(&self, message: BroadcastMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.metrics.bus_published.inc();
                true
            }
            Err(mpsc::error::TrySendError::Full(msg)) => {
                self.metrics.bus_publish_dropped.inc();
                self.stats
                    .bus_publish_drops
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.stats.note_warning();
                warn!(subject = %msg.subject, "bus publish channel full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// The bus under construction: subscribers attach before the driver starts.
pub struct Bus {
    tx: mpsc::Sender<BroadcastMessage>,
    rx: mpsc::Receiver<BroadcastMessage>,
    subscribers: Vec<mpsc::Sender<BroadcastMessage>>,
    metrics: Arc<GatewayMetrics>,
    stats: Arc<GatewayStats>,
}

impl Bus {
    pub fn new(metrics: Arc<GatewayMetrics>, stats: Arc<GatewayStats>) -> Self {
        let (tx, rx) = mpsc::channel(BUS_PUBLISH_CAPACITY);
        Self {
            tx,
            rx,
            subscribers: Vec::new(),
            metrics,
            stats,
        }
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            tx: self.tx.clone(),
            metrics: Arc::clone(&self.metrics),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Attach one subscriber (a shard) with its own bounded queue.
    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<BroadcastMessage> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    /// Drive fan-out until shutdown. Drains up to [`BUS_BATCH_SIZE`] queued
    /// messages per iteration before yielding back to the scheduler.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let Bus {
            mut rx,
            subscribers,
            metrics,
            ..
        } = self;
        let mut batch = Vec::with_capacity(BUS_BATCH_SIZE);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                first = rx.recv() => {
                    let Some(first) = first else { break };
                    batch.push(first);
                    while batch.len() < BUS_BATCH_SIZE {
                        match rx.try_recv() {
                            Ok(msg) => batch.push(msg),
                            Err(_) => break,
                        }
                    }

                    for message in batch.drain(..) {
                        for (shard_id, subscriber) in subscribers.iter().enumerate() {
                            match subscriber.try_send(message.clone()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    metrics
                                        .bus_fanout_dropped
                                        .with_label_values(&[&shard_id.to_string()])
                                        .inc();
                                    debug!(
                                        shard = shard_id,
                                        subject = %message.subject,
                                        "shard subscriber channel full, dropping for this shard"
                                    );
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {}
                            }
                        }
                    }
                }
            }
        }
        debug!("bus fan-out loop terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_bus() -> Bus {
        Bus::new(
            Arc::new(GatewayMetrics::new()),
            Arc::new(GatewayStats::new()),
        )
    }

    fn msg(subject: &str) -> BroadcastMessage {
        BroadcastMessage::new(subject, Bytes::from_static(b"{}"))
    }

    #[tokio::test]
    async fn every_subscriber_gets_every_message() {
        let mut bus = new_bus();
        let mut sub_a = bus.subscribe(16);
        let mut sub_b = bus.subscribe(16);
        let publisher = bus.publisher();
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let driver = tokio::spawn(bus.run(shutdown_tx.subscribe()));

        assert!(publisher.publish(msg("odin.token.BTC.trade")));
        assert!(publisher.publish(msg("odin.token.ETH.trade")));

        for sub in [&mut sub_a, &mut sub_b] {
            let first = sub.recv().await.unwrap();
            assert_eq!(&*first.subject, "odin.token.BTC.trade");
            let second = sub.recv().await.unwrap();
            assert_eq!(&*second.subject, "odin.token.ETH.trade");
        }

        let _ = shutdown_tx.send(());
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn full_subscriber_drops_only_for_that_shard() {
        let mut bus = new_bus();
        let mut tiny = bus.subscribe(1);
        let mut roomy = bus.subscribe(16);
        let publisher = bus.publisher();
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let driver = tokio::spawn(bus.run(shutdown_tx.subscribe()));

        for i in 0..5 {
            assert!(publisher.publish(msg(&format!("odin.token.S{i}.trade"))));
        }

        // The roomy subscriber sees all five.
        for i in 0..5 {
            let got = roomy.recv().await.unwrap();
            assert_eq!(&*got.subject, format!("odin.token.S{i}.trade"));
        }

        // The tiny subscriber got the first and lost some of the rest; the
        // publisher itself never blocked (all publishes returned true above).
        let first = tiny.recv().await.unwrap();
        assert_eq!(&*first.subject, "odin.token.S0.trade");

        let _ = shutdown_tx.send(());
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn publish_never_blocks_when_bus_is_full() {
        let metrics = Arc::new(GatewayMetrics::new());
        let stats = Arc::new(GatewayStats::new());
        let bus = Bus::new(Arc::clone(&metrics), Arc::clone(&stats));
        let publisher = bus.publisher();
        // Driver not running: the publish channel fills up and overflows.
        let mut dropped = 0;
        for i in 0..(BUS_PUBLISH_CAPACITY + 10) {
            if !publisher.publish(msg(&format!("odin.token.X{i}.trade"))) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 10);
        assert_eq!(
            stats
                .bus_publish_drops
                .load(std::sync::atomic::Ordering::Relaxed),
            10
        );
        drop(bus);
    }
}
