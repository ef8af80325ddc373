//! Shard: one in-process WebSocket server owning a partition of the clients.
//!
//! Each shard runs an internal listener (dialed only by the balancer's
//! slot-aware proxy), drains its own subscriber channel from the broadcast
//! bus, and fans messages out to local subscribers through the subscription
//! index. The slot semaphore held on the balancer side is the single source
//! of truth for capacity; `active()` is derived from it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

use crate::bus::BroadcastMessage;
use crate::client::{self, Client, EnqueueOutcome};
use crate::config::{Config, REPLAY_BUFFER_SIZE, SLOW_CLIENT_MAX_FAILURES};
use crate::envelope::{channel_from_subject, event_type_from_subject, serialize_envelope};
use crate::guard::TaskTracker;
use crate::index::SubscriptionIndex;
use crate::limiter::{ClientRateLimiter, SharedBucket};
use crate::metrics::GatewayMetrics;
use crate::pool::{BufferPool, RingPool};
use crate::protocol::close_code;
use crate::stats::{GatewayStats, Initiator};

/// Client ids are process-wide monotonic, never reused.
static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(0);

fn next_client_id() -> u64 {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// State shared by a shard's handlers, pumps, and broadcast path.
pub struct ShardContext {
    pub shard_id: usize,
    pub index: SubscriptionIndex<Client>,
    pub clients: DashMap<u64, Arc<Client>>,
    pub limiter: ClientRateLimiter,
    pub buffer_pool: BufferPool,
    pub ring_pool: Arc<RingPool>,
    pub stats: Arc<GatewayStats>,
    pub metrics: Arc<GatewayMetrics>,
    pub tasks: Arc<TaskTracker>,
    broadcast_bucket: Arc<SharedBucket>,
    queue_capacity: usize,
}

#[cfg(test)]
impl ShardContext {
    /// Detached context for unit tests that drive the broadcast and dispatch
    /// paths without sockets.
    pub(crate) fn new_for_tests(queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            shard_id: 0,
            index: SubscriptionIndex::new(),
            clients: DashMap::new(),
            limiter: ClientRateLimiter::new(),
            buffer_pool: BufferPool::new(),
            ring_pool: Arc::new(RingPool::new()),
            stats: Arc::new(GatewayStats::new()),
            metrics: Arc::new(GatewayMetrics::new()),
            tasks: Arc::new(TaskTracker::new()),
            broadcast_bucket: Arc::new(SharedBucket::per_second(1_000_000.0)),
            queue_capacity,
        })
    }
}

/// Handle to a running shard.
pub struct Shard {
    pub id: usize,
    pub max_connections: usize,
    pub slots: Arc<Semaphore>,
    pub advertised_addr: SocketAddr,
    pub ctx: Arc<ShardContext>,
}

impl Shard {
    /// Bind the internal listener, start the serve and bus-drain tasks, and
    /// hand back the shard handle.
    pub async fn start(
        id: usize,
        config: &Config,
        bus_rx: mpsc::Receiver<BroadcastMessage>,
        broadcast_bucket: Arc<SharedBucket>,
        ring_pool: Arc<RingPool>,
        stats: Arc<GatewayStats>,
        metrics: Arc<GatewayMetrics>,
        tasks: Arc<TaskTracker>,
        shutdown: broadcast::Sender<()>,
    ) -> anyhow::Result<Arc<Self>> {
        let max_connections = config.per_shard_capacity();
        let ctx = Arc::new(ShardContext {
            shard_id: id,
            index: SubscriptionIndex::new(),
            clients: DashMap::new(),
            limiter: ClientRateLimiter::new(),
            buffer_pool: BufferPool::new(),
            ring_pool,
            stats,
            metrics,
            tasks: Arc::clone(&tasks),
            broadcast_bucket,
            queue_capacity: config.client_queue_size,
        });

        let listener =
            tokio::net::TcpListener::bind((config.shard_host.as_str(), 0u16)).await?;
        let advertised_addr = listener.local_addr()?;

        let app = Router::new()
            .route("/ws", get(shard_ws_handler))
            .with_state(Arc::clone(&ctx));

        let mut serve_shutdown = shutdown.subscribe();
        let serve_tasks = tasks.track();
        crate::guard::spawn_supervised("shard-listener", async move {
            let _task = serve_tasks;
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown.recv().await;
                })
                .await;
            if let Err(e) = result {
                warn!(shard = id, error = %e, "shard listener terminated with error");
            }
        });

        let shard = Arc::new(Self {
            id,
            max_connections,
            slots: Arc::new(Semaphore::new(max_connections)),
            advertised_addr,
            ctx: Arc::clone(&ctx),
        });

        let drain_ctx = Arc::clone(&ctx);
        let drain_shutdown = shutdown.subscribe();
        let drain_task = tasks.track();
        crate::guard::spawn_supervised("shard-bus-drain", async move {
            let _task = drain_task;
            run_bus_drain(drain_ctx, bus_rx, drain_shutdown).await;
        });

        info!(shard = id, addr = %advertised_addr, max_connections, "shard started");
        Ok(shard)
    }

    /// Active clients, derived from the slot semaphore (the authoritative
    /// capacity ledger).
    pub fn active(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    pub fn has_capacity(&self) -> bool {
        self.slots.available_permits() > 0
    }

    /// Force-close every remaining client with 1001, recorded as
    /// `server_shutdown`.
    pub fn force_close_all(&self) {
        for entry in self.ctx.clients.iter() {
            entry
                .value()
                .begin_close(close_code::GOING_AWAY, "server_shutdown", Initiator::Server);
        }
    }
}

async fn shard_ws_handler(
    State(ctx): State<Arc<ShardContext>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_shard_socket(ctx, socket))
}

async fn handle_shard_socket(ctx: Arc<ShardContext>, socket: WebSocket) {
    let id = next_client_id();
    let storage = ctx.ring_pool.get(REPLAY_BUFFER_SIZE);
    let (client, outbound_rx, close_rx) = Client::new(id, ctx.queue_capacity, storage);

    ctx.clients.insert(id, Arc::clone(&client));
    ctx.metrics.connections_accepted.inc();
    ctx.metrics.active_connections.inc();
    debug!(shard = ctx.shard_id, client = id, "client connected");

    let (sender, receiver) = socket.split();
    tokio::spawn(client::write_pump(
        Arc::clone(&ctx),
        Arc::clone(&client),
        sender,
        outbound_rx,
        close_rx,
    ));
    client::read_pump(ctx, client, receiver).await;
}

/// Drain the shard's bus subscriber channel into local broadcasts.
async fn run_bus_drain(
    ctx: Arc<ShardContext>,
    mut bus_rx: mpsc::Receiver<BroadcastMessage>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            message = bus_rx.recv() => match message {
                Some(message) => broadcast_local(&ctx, &message),
                None => break,
            }
        }
    }
    debug!(shard = ctx.shard_id, "bus drain terminated");
}

/// Deliver one bus message to every local subscriber of its channel.
///
/// Per client: wrap in an envelope (the client's own sequence), insert into
/// the replay buffer BEFORE the enqueue attempt so dropped frames stay
/// replayable, then `try_send`. Three consecutive full-queue failures
/// disconnect the client with 1008.
pub fn broadcast_local(ctx: &ShardContext, message: &BroadcastMessage) {
    let Some(channel) = channel_from_subject(&message.subject) else {
        return;
    };
    let event_type = event_type_from_subject(&message.subject).unwrap_or("event");

    if !ctx.broadcast_bucket.try_consume(1) {
        ctx.metrics.broadcast_rate_limited.inc();
        return;
    }

    // Validate the payload once per broadcast, not once per subscriber.
    if serde_json::from_slice::<&serde_json::value::RawValue>(&message.payload).is_err() {
        ctx.metrics.serialization_errors.inc();
        ctx.stats
            .serialization_errors
            .fetch_add(1, Ordering::Relaxed);
        warn!(subject = %message.subject, "non-JSON payload, skipping broadcast");
        return;
    }

    let subscribers = ctx.index.get(&channel);
    for client in subscribers {
        if client.is_closing() {
            continue;
        }

        let frame = {
            let mut ring = client.replay.lock();
            let seq = client.next_seq();
            let frame = match serialize_envelope(
                &ctx.buffer_pool,
                seq,
                event_type,
                &message.payload,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    ctx.metrics.serialization_errors.inc();
                    ctx.stats
                        .serialization_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(client = client.id, error = %e, "envelope serialization failed");
                    continue;
                }
            };
            ring.add(crate::replay::ReplayEntry {
                seq,
                frame: frame.clone(),
            });
            frame
        };

        match client.try_enqueue(frame) {
            EnqueueOutcome::Sent => {
                client.reset_failures();
                ctx.metrics.messages_sent.inc();
                ctx.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                ctx.stats.record_saturation(client.queue_fill());
            }
            EnqueueOutcome::Closed => {}
            EnqueueOutcome::Full => {
                let failures = client.note_failure();
                ctx.metrics
                    .dropped_broadcasts
                    .with_label_values(&[&channel, "buffer_full"])
                    .inc();
                ctx.stats.record_dropped_broadcast(&channel);
                ctx.stats.record_saturation(1.0);

                if failures == 1 {
                    ctx.stats.note_warning();
                    warn!(
                        shard = ctx.shard_id,
                        client = client.id,
                        channel = %channel,
                        "slow client, send buffer full"
                    );
                }

                if failures >= SLOW_CLIENT_MAX_FAILURES
                    && client.begin_close(
                        close_code::POLICY_SLOW_CLIENT,
                        "write_timeout",
                        Initiator::Server,
                    )
                {
                    ctx.metrics.slow_client_attempts.observe(failures as f64);
                    warn!(
                        shard = ctx.shard_id,
                        client = client.id,
                        failures,
                        "slow client disconnected (policy 1008)"
                    );
                }
            }
        }
    }
}
