//! Public WebSocket entry point.
//!
//! Admits or refuses upgrades (shutdown flag, resource guard, connection
//! rate limits), picks the least-loaded shard, and hands the upgraded socket
//! to the slot-aware proxy. Also serves `/health` and `/metrics`.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::debug;

use crate::client_ip::extract_client_ip;
use crate::consumer::ConsumerStatus;
use crate::guard::{ResourceGuard, TaskTracker};
use crate::health;
use crate::limiter::{ConnReject, ConnectionLimiter};
use crate::metrics::GatewayMetrics;
use crate::proxy;
use crate::shard::Shard;
use crate::stats::GatewayStats;

/// Everything the public handlers need.
pub struct AppStateInner {
    pub shards: Vec<Arc<Shard>>,
    pub guard: Arc<ResourceGuard>,
    pub conn_limiter: ConnectionLimiter,
    pub trusted_proxies: HashSet<IpAddr>,
    pub shutting_down: AtomicBool,
    pub metrics: Arc<GatewayMetrics>,
    pub stats: Arc<GatewayStats>,
    pub consumer_status: Option<Arc<ConsumerStatus>>,
    pub tasks: Arc<TaskTracker>,
}

#[derive(Clone)]
pub struct AppState(pub Arc<AppStateInner>);

impl std::ops::Deref for AppState {
    type Target = AppStateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AppStateInner {
    /// Total active connections across all shards, read from the slot
    /// semaphores (the authoritative ledger).
    pub fn total_active(&self) -> usize {
        self.shards.iter().map(|s| s.active()).sum()
    }
}

/// Least-connections shard selection: skip full shards, ties go to the
/// lowest shard id (the scan is in id order and only strictly-fewer wins).
pub fn pick_shard(shards: &[Arc<Shard>]) -> Option<Arc<Shard>> {
    let mut best: Option<&Arc<Shard>> = None;
    for shard in shards {
        if !shard.has_capacity() {
            continue;
        }
        match best {
            Some(current) if shard.active() >= current.active() => {}
            _ => best = Some(shard),
        }
    }
    best.cloned()
}

/// Build the public router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health_handler))
        .route("/metrics", get(health::metrics_handler))
        .with_state(state)
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.shutting_down.load(Ordering::Relaxed) {
        state
            .metrics
            .connections_rejected
            .with_label_values(&["shutting_down"])
            .inc();
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }

    if let Err(reason) = state.guard.should_accept(state.total_active()) {
        state
            .metrics
            .connections_rejected
            .with_label_values(&["resource_guard"])
            .inc();
        debug!(%reason, "upgrade refused by resource guard");
        return (StatusCode::SERVICE_UNAVAILABLE, reason).into_response();
    }

    let client_ip = extract_client_ip(&headers, addr, &state.trusted_proxies);
    if let Err(reject) = state.conn_limiter.check(client_ip) {
        let label = match reject {
            ConnReject::PerIpRate => "per_ip_rate",
            ConnReject::GlobalRate => "global_rate",
        };
        state
            .metrics
            .connections_rejected
            .with_label_values(&[label])
            .inc();
        debug!(ip = %client_ip, reason = label, "upgrade refused by connection rate limit");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "connection rate limit exceeded",
        )
            .into_response();
    }

    let Some(shard) = pick_shard(&state.shards) else {
        state
            .metrics
            .connections_rejected
            .with_label_values(&["no_capacity"])
            .inc();
        return (StatusCode::SERVICE_UNAVAILABLE, "no shard capacity").into_response();
    };

    let metrics = Arc::clone(&state.metrics);
    let tasks = Arc::clone(&state.tasks);
    ws.on_upgrade(move |socket| proxy::run_proxy(socket, shard, metrics, tasks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::Config;
    use crate::limiter::SharedBucket;
    use crate::pool::RingPool;

    async fn test_shards(counts: &[(usize, usize)]) -> Vec<Arc<Shard>> {
        // (max, acquired) per shard; slots acquired to simulate load.
        let mut config = Config::default();
        config.shard_count = counts.len();
        let metrics = Arc::new(GatewayMetrics::new());
        let stats = Arc::new(GatewayStats::new());
        let mut bus = Bus::new(Arc::clone(&metrics), Arc::clone(&stats));
        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let bucket = Arc::new(SharedBucket::per_second(1_000_000.0));
        let ring_pool = Arc::new(RingPool::new());
        let tasks = Arc::new(TaskTracker::new());

        let mut shards = Vec::new();
        for (id, (max, acquired)) in counts.iter().enumerate() {
            config.max_connections = max * counts.len();
            let shard = Shard::start(
                id,
                &config,
                bus.subscribe(4),
                Arc::clone(&bucket),
                Arc::clone(&ring_pool),
                Arc::clone(&stats),
                Arc::clone(&metrics),
                Arc::clone(&tasks),
                shutdown_tx.clone(),
            )
            .await
            .unwrap();
            for _ in 0..*acquired {
                shard.slots.clone().try_acquire_owned().unwrap().forget();
            }
            shards.push(shard);
        }
        shards
    }

    #[tokio::test]
    async fn picks_least_loaded_shard() {
        let shards = test_shards(&[(10, 3), (10, 1), (10, 2)]).await;
        let picked = pick_shard(&shards).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[tokio::test]
    async fn ties_break_to_lowest_id() {
        let shards = test_shards(&[(10, 2), (10, 2), (10, 2)]).await;
        let picked = pick_shard(&shards).unwrap();
        assert_eq!(picked.id, 0);
    }

    #[tokio::test]
    async fn full_shards_are_skipped() {
        let shards = test_shards(&[(2, 2), (2, 1), (2, 2)]).await;
        let picked = pick_shard(&shards).unwrap();
        assert_eq!(picked.id, 1);
    }

    #[tokio::test]
    async fn no_eligible_shard_yields_none() {
        let shards = test_shards(&[(1, 1), (1, 1)]).await;
        assert!(pick_shard(&shards).is_none());
    }
}
