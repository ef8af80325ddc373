//! Gateway assembly and lifecycle.
//!
//! Wires the bus, shards, consumer pool, resource guard, and public listener
//! together, and owns the graceful shutdown sequence: flag new upgrades away,
//! stop the listener and consumer, drain connections inside the grace window,
//! force-close whatever remains with 1001.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::balancer::{self, AppState, AppStateInner};
use crate::bus::{Bus, BusPublisher};
use crate::client_ip::trusted_proxies_from_env;
use crate::config::{Config, SHUTDOWN_GRACE};
use crate::consumer::ConsumerPool;
use crate::cpu::CpuMonitor;
use crate::guard::{ResourceGuard, TaskTracker};
use crate::limiter::{ConnectionLimiter, SharedBucket};
use crate::metrics::GatewayMetrics;
use crate::pool::RingPool;
use crate::shard::Shard;
use crate::stats::GatewayStats;

/// A running gateway.
pub struct Gateway {
    pub local_addr: SocketAddr,
    state: AppState,
    publisher: BusPublisher,
    shutdown_tx: broadcast::Sender<()>,
    server_handle: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl Gateway {
    /// Build every component and start serving.
    pub async fn spawn(config: Config) -> anyhow::Result<Self> {
        let metrics = Arc::new(GatewayMetrics::new());
        let stats = Arc::new(GatewayStats::new());
        metrics.attach_stats(Arc::clone(&stats));

        let tasks = Arc::new(TaskTracker::new());
        let monitor = CpuMonitor::global();
        let guard = Arc::new(ResourceGuard::new(&config, monitor, Arc::clone(&tasks)));
        // Seed the resource snapshot so admission decisions are never made on
        // all-zero readings from before the first sampler tick.
        guard.refresh(&metrics, &stats);

        let (shutdown_tx, _) = broadcast::channel(8);

        let mut bus = Bus::new(Arc::clone(&metrics), Arc::clone(&stats));
        let publisher = bus.publisher();
        let broadcast_bucket = Arc::new(SharedBucket::per_second(config.max_broadcast_rate));
        let ring_pool = Arc::new(RingPool::new());

        let mut shards = Vec::with_capacity(config.shard_count);
        for id in 0..config.shard_count {
            let bus_rx = bus.subscribe(config.shard_queue_size);
            let shard = Shard::start(
                id,
                &config,
                bus_rx,
                Arc::clone(&broadcast_bucket),
                Arc::clone(&ring_pool),
                Arc::clone(&stats),
                Arc::clone(&metrics),
                Arc::clone(&tasks),
                shutdown_tx.clone(),
            )
            .await
            .with_context(|| format!("failed to start shard {id}"))?;
            shards.push(shard);
        }

        {
            let bus_task = tasks.track();
            let bus_shutdown = shutdown_tx.subscribe();
            crate::guard::spawn_supervised("bus-fanout", async move {
                let _task = bus_task;
                bus.run(bus_shutdown).await;
            });
        }

        let consumer_status = if config.kafka_enabled {
            let pool = ConsumerPool::connect(
                &config,
                publisher.clone(),
                Arc::clone(&guard),
                Arc::clone(&metrics),
            )
            .await
            .context("failed to start kafka consumer pool")?;
            let status = pool.status();
            let consumer_task = tasks.track();
            let consumer_shutdown = shutdown_tx.subscribe();
            crate::guard::spawn_supervised("kafka-consumer", async move {
                let _task = consumer_task;
                pool.run(consumer_shutdown).await;
            });
            Some(status)
        } else {
            info!("kafka disabled (empty broker list), consumer pool not started");
            None
        };

        {
            let sampler_guard = Arc::clone(&guard);
            let sampler_metrics = Arc::clone(&metrics);
            let sampler_stats = Arc::clone(&stats);
            let sampler_shutdown = shutdown_tx.subscribe();
            let interval = config.metrics_interval;
            let sampler_task = tasks.track();
            crate::guard::spawn_supervised("resource-sampler", async move {
                let _task = sampler_task;
                sampler_guard
                    .run_sampler(interval, sampler_metrics, sampler_stats, sampler_shutdown)
                    .await;
            });
        }

        let state = AppState(Arc::new(AppStateInner {
            shards,
            guard,
            conn_limiter: ConnectionLimiter::new(config.conn_rate.clone()),
            trusted_proxies: trusted_proxies_from_env(),
            shutting_down: AtomicBool::new(false),
            metrics: Arc::clone(&metrics),
            stats: Arc::clone(&stats),
            consumer_status,
            tasks,
        }));

        let listener = tokio::net::TcpListener::bind(config.ws_addr)
            .await
            .with_context(|| format!("failed to bind {}", config.ws_addr))?;
        let local_addr = listener.local_addr()?;

        let app = balancer::router(state.clone());
        let mut serve_shutdown = shutdown_tx.subscribe();
        let server_handle = crate::guard::spawn_supervised("public-listener", async move {
            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.recv().await;
            })
            .await;
            if let Err(e) = result {
                warn!(error = %e, "public listener terminated with error");
            }
        });

        // Instance id distinguishes replicas in aggregated logs.
        let instance = uuid::Uuid::new_v4();
        info!(
            %instance,
            addr = %local_addr,
            shards = config.shard_count,
            max_connections = config.max_connections,
            kafka = config.kafka_enabled,
            "gateway listening"
        );

        Ok(Self {
            local_addr,
            state,
            publisher,
            shutdown_tx,
            server_handle,
            shutdown_grace: SHUTDOWN_GRACE,
        })
    }

    /// Publisher handle onto the broadcast bus; what the consumer pool feeds,
    /// and what tests feed directly.
    pub fn publisher(&self) -> BusPublisher {
        self.publisher.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shrink the drain window (tests).
    pub fn set_shutdown_grace(&mut self, grace: Duration) {
        self.shutdown_grace = grace;
    }

    /// Graceful shutdown: new upgrades 503, listeners and consumer stopped,
    /// connections drained up to the grace window, stragglers closed 1001.
    pub async fn shutdown(self) {
        info!("shutdown initiated");
        self.state.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        // Poll the active count once a second inside the grace window,
        // exiting early the moment the last connection drains.
        let tick = Duration::from_secs(1).min(self.shutdown_grace);
        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while self.state.total_active() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(tick).await;
        }

        let remaining = self.state.total_active();
        if remaining > 0 {
            warn!(remaining, "grace window expired, force-closing remaining connections");
            for shard in &self.state.shards {
                shard.force_close_all();
            }
        }

        if tokio::time::timeout(Duration::from_secs(5), self.server_handle)
            .await
            .is_err()
        {
            warn!("public listener did not stop within 5s of shutdown");
        }
        info!("shutdown complete");
    }
}
