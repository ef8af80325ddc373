//! Per-connection client state and its two pumps.
//!
//! Every client owns exactly two long-lived tasks: a read pump (frames in,
//! control dispatch) and a write pump (outbound queue to the wire, pings).
//! The write pump must never be blocked by a slow client - the broadcast
//! path only ever `try_send`s onto the bounded outbound queue - and the read
//! pump enforces a hard deadline per pong wait.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{PING_PERIOD, PONG_WAIT, REPLAY_BUFFER_SIZE, WRITE_WAIT};
use crate::envelope;
use crate::index::Keyed;
use crate::protocol::{
    self, parse_client_message, ClientMessage, ParseError, ReplayRequest, ServerMessage,
};
use crate::replay::ReplayRing;
use crate::shard::ShardContext;
use crate::stats::Initiator;

/// Instruction for the write pump to close the connection.
#[derive(Debug, Clone, Copy)]
pub struct CloseCommand {
    pub code: u16,
    pub reason: &'static str,
    pub initiator: Initiator,
}

/// Outcome of a non-blocking enqueue onto the outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Sent,
    Full,
    Closed,
}

/// One connected client, owned by exactly one shard for its lifetime.
pub struct Client {
    pub id: u64,
    outbound: mpsc::Sender<Bytes>,
    close_tx: mpsc::Sender<CloseCommand>,
    /// Set once by whoever initiates the close; later attempts are no-ops.
    closing: AtomicBool,
    /// Set once by the teardown path; guards resource release.
    torn_down: AtomicBool,
    /// Wakes the read pump when the connection is being torn down.
    pub(crate) closed: Notify,
    subscriptions: parking_lot::Mutex<HashSet<String>>,
    sequence: AtomicU64,
    pub(crate) replay: parking_lot::Mutex<ReplayRing>,
    pub connected_at: Instant,
    last_sent_ms: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl Keyed for Client {
    fn key(&self) -> u64 {
        self.id
    }
}

impl Client {
    /// Build a client plus the receiver halves its pumps consume.
    pub fn new(
        id: u64,
        queue_capacity: usize,
        replay_storage: std::collections::VecDeque<crate::replay::ReplayEntry>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>, mpsc::Receiver<CloseCommand>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_capacity.max(1));
        let (close_tx, close_rx) = mpsc::channel(1);
        let client = Arc::new(Self {
            id,
            outbound,
            close_tx,
            closing: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            closed: Notify::new(),
            subscriptions: parking_lot::Mutex::new(HashSet::new()),
            sequence: AtomicU64::new(0),
            replay: parking_lot::Mutex::new(ReplayRing::from_storage(
                replay_storage,
                REPLAY_BUFFER_SIZE,
            )),
            connected_at: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
        });
        (client, outbound_rx, close_rx)
    }

    /// Next envelope sequence; the counter starts at 0 so the first envelope
    /// carries seq 1.
    pub fn next_seq(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Relaxed)
    }

    /// Idempotent close initiation. The first caller wins; the write pump
    /// sends the close frame and both pumps unwind.
    pub fn begin_close(&self, code: u16, reason: &'static str, initiator: Initiator) -> bool {
        if self.closing.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.close_tx.try_send(CloseCommand {
            code,
            reason,
            initiator,
        });
        true
    }

    /// Non-blocking enqueue of one serialized frame.
    pub fn try_enqueue(&self, frame: Bytes) -> EnqueueOutcome {
        match self.outbound.try_send(frame) {
            Ok(()) => {
                self.last_sent_ms.store(
                    self.connected_at.elapsed().as_millis() as u64,
                    Ordering::Relaxed,
                );
                EnqueueOutcome::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Free slots left on the outbound queue.
    pub fn queue_remaining(&self) -> usize {
        self.outbound.capacity()
    }

    /// Fraction of the outbound queue currently occupied, 0.0 - 1.0.
    pub fn queue_fill(&self) -> f64 {
        let max = self.outbound.max_capacity();
        if max == 0 {
            return 0.0;
        }
        (max - self.outbound.capacity()) as f64 / max as f64
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    /// Bump the consecutive-failure counter, returning the new value.
    pub fn note_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Add channels to the client's set, returning those actually added.
    fn subscribe(&self, channels: &[String]) -> Vec<String> {
        let mut subs = self.subscriptions.lock();
        channels
            .iter()
            .filter(|c| subs.insert((*c).clone()))
            .cloned()
            .collect()
    }

    /// Remove channels from the client's set, returning those actually removed.
    fn unsubscribe(&self, channels: &[String]) -> Vec<String> {
        let mut subs = self.subscriptions.lock();
        channels
            .iter()
            .filter(|c| subs.remove(c.as_str()))
            .cloned()
            .collect()
    }

    pub(crate) fn mark_torn_down(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }
}

/// Channels per subscribe/unsubscribe request; anything larger is truncated.
const MAX_CHANNELS_PER_REQUEST: usize = 100;

fn sanitize_channels(mut channels: Vec<String>) -> Vec<String> {
    channels.truncate(MAX_CHANNELS_PER_REQUEST);
    channels.retain(|c| {
        !c.is_empty() && c.len() <= 128 && envelope::channel_from_subject(c).is_some()
    });
    channels
}

/// Serialize a control frame and enqueue it best-effort.
fn enqueue_control(ctx: &ShardContext, client: &Client, message: &ServerMessage) {
    match ctx.buffer_pool.serialize_json(message) {
        Ok(frame) => {
            if client.try_enqueue(frame) != EnqueueOutcome::Sent {
                debug!(client = client.id, "control frame dropped, queue unavailable");
            }
        }
        Err(e) => warn!(client = client.id, error = %e, "control frame serialization failed"),
    }
}

/// Read pump: one iteration per inbound frame, hard deadline per pong wait.
pub async fn read_pump(
    ctx: Arc<ShardContext>,
    client: Arc<Client>,
    mut receiver: SplitStream<WebSocket>,
) {
    let _task = ctx.tasks.track();
    let (reason, initiator) = loop {
        if client.torn_down.load(Ordering::Relaxed) {
            break ("server_closed", Initiator::Server);
        }
        tokio::select! {
            _ = client.closed.notified() => {
                break ("server_closed", Initiator::Server);
            }
            frame = timeout(PONG_WAIT, receiver.next()) => match frame {
                // No frame of any kind within the pong wait.
                Err(_) => break ("ping_timeout", Initiator::Server),
                Ok(None) => break ("client_initiated", Initiator::Client),
                Ok(Some(Err(e))) => {
                    debug!(client = client.id, error = %e, "read error");
                    break ("read_error", Initiator::Client);
                }
                Ok(Some(Ok(message))) => match message {
                    Message::Text(text) => {
                        if !ctx.limiter.try_consume(client.id, 1) {
                            ctx.metrics.rate_limited.inc();
                            ctx.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                            enqueue_control(
                                &ctx,
                                &client,
                                &ServerMessage::Error {
                                    code: protocol::CODE_RATE_LIMIT_EXCEEDED,
                                    message: "message rate limit exceeded, message dropped"
                                        .to_string(),
                                },
                            );
                            continue;
                        }
                        dispatch(&ctx, &client, &text);
                    }
                    Message::Close(_) => break ("client_initiated", Initiator::Client),
                    // Pings are answered by the protocol layer; pongs and
                    // binary frames just count as liveness.
                    Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                },
            }
        }
    };

    // First pump out records the reason; begin_close wakes the write pump.
    teardown(&ctx, &client, reason, initiator);
    client.begin_close(protocol::close_code::NORMAL, reason, initiator);
}

/// Handle one parsed control frame.
fn dispatch(ctx: &ShardContext, client: &Arc<Client>, text: &str) {
    match parse_client_message(text) {
        Ok(ClientMessage::Subscribe { data }) => {
            let channels = sanitize_channels(data.channels);
            let added = client.subscribe(&channels);
            ctx.index.add_multiple(&added, client);
            enqueue_control(
                ctx,
                client,
                &ServerMessage::SubscriptionAck {
                    subscribed: channels,
                    count: client.subscription_count(),
                },
            );
        }
        Ok(ClientMessage::Unsubscribe { data }) => {
            let channels = sanitize_channels(data.channels);
            let removed = client.unsubscribe(&channels);
            ctx.index.remove_multiple(&removed, client);
            enqueue_control(
                ctx,
                client,
                &ServerMessage::UnsubscriptionAck {
                    unsubscribed: channels,
                    count: client.subscription_count(),
                },
            );
        }
        Ok(ClientMessage::Replay { data }) => handle_replay(ctx, client, &data),
        Ok(ClientMessage::Heartbeat) => {
            enqueue_control(
                ctx,
                client,
                &ServerMessage::Pong {
                    ts: chrono::Utc::now().timestamp_millis(),
                },
            );
        }
        Err(ParseError::UnknownType(kind)) => {
            debug!(client = client.id, kind = %kind, "unknown control frame type, ignoring");
        }
        Err(ParseError::Malformed) => {
            ctx.stats.note_warning();
            debug!(client = client.id, "malformed control frame, ignoring");
        }
    }
}

/// Replay from the client's own ring. Enqueues as much as fits; a full queue
/// mid-replay gets a `replay_incomplete` marker and stops.
fn handle_replay(ctx: &ShardContext, client: &Arc<Client>, request: &ReplayRequest) {
    ctx.metrics.replay_requests.inc();

    let entries = {
        let ring = client.replay.lock();
        match (request.since, request.from, request.to) {
            (Some(since), _, _) => ring.get_since(since),
            (None, Some(from), to) => ring.get_range(from, to.unwrap_or(u64::MAX)),
            (None, None, _) => Vec::new(),
        }
    };

    let total = entries.len();
    let mut sent = 0usize;
    for entry in entries {
        // The last queue slot is reserved so the incomplete marker can still
        // get through when replay outpaces the write pump.
        let outcome = if client.queue_remaining() <= 1 {
            EnqueueOutcome::Full
        } else {
            client.try_enqueue(entry.frame)
        };
        match outcome {
            EnqueueOutcome::Sent => sent += 1,
            EnqueueOutcome::Full | EnqueueOutcome::Closed => {
                enqueue_control(
                    ctx,
                    client,
                    &ServerMessage::ReplayIncomplete {
                        sent,
                        total,
                        message: "send buffer filled during replay".to_string(),
                    },
                );
                break;
            }
        }
    }
    ctx.metrics.replayed_messages.inc_by(sent as u64);
}

/// Write pump: drains the outbound queue to the wire and keeps the
/// connection alive with pings.
pub async fn write_pump(
    ctx: Arc<ShardContext>,
    client: Arc<Client>,
    mut sender: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Bytes>,
    mut close_rx: mpsc::Receiver<CloseCommand>,
) {
    let _task = ctx.tasks.track();
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + PING_PERIOD,
        PING_PERIOD,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit: Option<(&'static str, Initiator)> = loop {
        tokio::select! {
            biased;
            cmd = close_rx.recv() => {
                let cmd = cmd.unwrap_or(CloseCommand {
                    code: protocol::close_code::NORMAL,
                    reason: "server_closed",
                    initiator: Initiator::Server,
                });
                let frame = CloseFrame {
                    code: cmd.code,
                    reason: std::borrow::Cow::Borrowed(cmd.reason),
                };
                let _ = timeout(WRITE_WAIT, sender.send(Message::Close(Some(frame)))).await;
                break Some((cmd.reason, cmd.initiator));
            }
            maybe = outbound_rx.recv() => match maybe {
                Some(frame) => {
                    let text = String::from_utf8_lossy(&frame).into_owned();
                    match timeout(WRITE_WAIT, sender.send(Message::Text(text))).await {
                        Ok(Ok(())) => {}
                        _ => break Some(("write_error", Initiator::Server)),
                    }
                }
                None => break None,
            },
            _ = ping.tick() => {
                match timeout(WRITE_WAIT, sender.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break Some(("write_error", Initiator::Server)),
                }
            }
        }
    };

    if let Some((reason, initiator)) = exit {
        teardown(&ctx, &client, reason, initiator);
    }
    // Wake the read pump if it is still parked on the socket.
    client.closing.store(true, Ordering::SeqCst);
    client.closed.notify_waiters();
}

/// Release everything the client holds. Idempotent; the first pump (or the
/// shard's force-close path) to get here wins.
pub fn teardown(ctx: &ShardContext, client: &Arc<Client>, reason: &str, initiator: Initiator) {
    if !client.mark_torn_down() {
        return;
    }
    ctx.index.remove_client(client);
    ctx.clients.remove(&client.id);
    ctx.limiter.remove(client.id);
    ctx.stats.record_disconnect(reason, initiator);
    ctx.metrics
        .disconnects
        .with_label_values(&[reason, initiator.as_str()])
        .inc();
    ctx.metrics.active_connections.dec();

    // Recycle the replay ring's backing storage.
    let ring = {
        let mut guard = client.replay.lock();
        std::mem::replace(&mut *guard, ReplayRing::new(1))
    };
    ctx.ring_pool.put(ring.into_storage());

    debug!(
        client = client.id,
        reason,
        initiated_by = initiator.as_str(),
        uptime_ms = client.connected_at.elapsed().as_millis() as u64,
        "client torn down"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_client(queue: usize) -> (Arc<Client>, mpsc::Receiver<Bytes>, mpsc::Receiver<CloseCommand>) {
        Client::new(1, queue, std::collections::VecDeque::new())
    }

    #[test]
    fn sequence_starts_at_one_and_increases() {
        let (client, _rx, _crx) = new_client(4);
        assert_eq!(client.next_seq(), 1);
        assert_eq!(client.next_seq(), 2);
        assert_eq!(client.next_seq(), 3);
    }

    #[test]
    fn enqueue_reports_full_and_fill_fraction() {
        let (client, _rx, _crx) = new_client(2);
        assert_eq!(client.queue_fill(), 0.0);
        assert_eq!(client.try_enqueue(Bytes::from_static(b"a")), EnqueueOutcome::Sent);
        assert_eq!(client.try_enqueue(Bytes::from_static(b"b")), EnqueueOutcome::Sent);
        assert_eq!(client.queue_fill(), 1.0);
        assert_eq!(client.try_enqueue(Bytes::from_static(b"c")), EnqueueOutcome::Full);
    }

    #[test]
    fn begin_close_is_idempotent() {
        let (client, _rx, mut close_rx) = new_client(2);
        assert!(client.begin_close(
            protocol::close_code::POLICY_SLOW_CLIENT,
            "write_timeout",
            Initiator::Server
        ));
        assert!(!client.begin_close(
            protocol::close_code::NORMAL,
            "client_initiated",
            Initiator::Client
        ));
        let cmd = close_rx.try_recv().unwrap();
        assert_eq!(cmd.code, protocol::close_code::POLICY_SLOW_CLIENT);
        assert_eq!(cmd.reason, "write_timeout");
        // Only one command was ever sent.
        assert!(close_rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_is_idempotent_and_tracks_count() {
        let (client, _rx, _crx) = new_client(2);
        let added = client.subscribe(&["BTC.trade".to_string(), "ETH.trade".to_string()]);
        assert_eq!(added.len(), 2);
        let added = client.subscribe(&["BTC.trade".to_string()]);
        assert!(added.is_empty());
        assert_eq!(client.subscription_count(), 2);

        let removed = client.unsubscribe(&["BTC.trade".to_string(), "SOL.trade".to_string()]);
        assert_eq!(removed, vec!["BTC.trade".to_string()]);
        assert_eq!(client.subscription_count(), 1);
    }

    #[test]
    fn sanitize_rejects_channels_without_symbol_or_event() {
        let channels = sanitize_channels(vec![
            "BTC.trade".to_string(),
            "".to_string(),
            "notachannel".to_string(),
            ".trade".to_string(),
            "ETH.analytics".to_string(),
        ]);
        assert_eq!(channels, vec!["BTC.trade", "ETH.analytics"]);
    }

    #[test]
    fn consecutive_failures_count_and_reset() {
        let (client, _rx, _crx) = new_client(2);
        assert_eq!(client.note_failure(), 1);
        assert_eq!(client.note_failure(), 2);
        client.reset_failures();
        assert_eq!(client.note_failure(), 1);
    }

    fn recv_json(rx: &mut mpsc::Receiver<Bytes>) -> serde_json::Value {
        let frame = rx.try_recv().expect("expected a queued frame");
        serde_json::from_slice(&frame).expect("queued frame should be JSON")
    }

    #[tokio::test]
    async fn dispatch_subscribe_updates_index_and_acks() {
        let ctx = ShardContext::new_for_tests(8);
        let (client, mut rx, _crx) = new_client(8);
        ctx.clients.insert(client.id, Arc::clone(&client));

        dispatch(
            &ctx,
            &client,
            r#"{"type":"subscribe","data":{"channels":["BTC.trade","ETH.analytics","junk"]}}"#,
        );

        // The malformed channel was filtered before it reached the index.
        assert_eq!(ctx.index.count("BTC.trade"), 1);
        assert_eq!(ctx.index.count("ETH.analytics"), 1);
        assert_eq!(ctx.index.count("junk"), 0);

        let ack = recv_json(&mut rx);
        assert_eq!(ack["type"], "subscription_ack");
        assert_eq!(ack["count"], 2);
    }

    #[tokio::test]
    async fn dispatch_unsubscribe_of_unknown_channel_is_noop() {
        let ctx = ShardContext::new_for_tests(8);
        let (client, mut rx, _crx) = new_client(8);

        dispatch(
            &ctx,
            &client,
            r#"{"type":"unsubscribe","data":{"channels":["BTC.trade"]}}"#,
        );
        let ack = recv_json(&mut rx);
        assert_eq!(ack["type"], "unsubscription_ack");
        assert_eq!(ack["count"], 0);
        // The non-subscribed channel never touched the index.
        assert_eq!(ctx.index.channel_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_heartbeat_enqueues_pong() {
        let ctx = ShardContext::new_for_tests(8);
        let (client, mut rx, _crx) = new_client(8);

        dispatch(&ctx, &client, r#"{"type":"heartbeat"}"#);
        let pong = recv_json(&mut rx);
        assert_eq!(pong["type"], "pong");
        assert!(pong["ts"].as_i64().is_some());
    }

    #[tokio::test]
    async fn replay_that_overfills_queue_sends_incomplete_marker() {
        let ctx = ShardContext::new_for_tests(3);
        let (client, mut rx, _crx) = new_client(3);

        // Seed five replayable envelopes.
        {
            let mut ring = client.replay.lock();
            for seq in 1..=5 {
                ring.add(crate::replay::ReplayEntry {
                    seq,
                    frame: Bytes::from(format!(r#"{{"seq":{seq}}}"#)),
                });
            }
        }

        handle_replay(
            &ctx,
            &client,
            &ReplayRequest {
                from: None,
                to: None,
                since: Some(0),
            },
        );

        // Queue of 3: two replayed frames, then the reserved slot carries
        // the incomplete marker.
        assert_eq!(recv_json(&mut rx)["seq"], 1);
        assert_eq!(recv_json(&mut rx)["seq"], 2);
        let marker = recv_json(&mut rx);
        assert_eq!(marker["type"], "replay_incomplete");
        assert_eq!(marker["sent"], 2);
        assert_eq!(marker["total"], 5);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn replay_without_cursor_fields_is_empty() {
        let ctx = ShardContext::new_for_tests(8);
        let (client, mut rx, _crx) = new_client(8);
        {
            let mut ring = client.replay.lock();
            ring.add(crate::replay::ReplayEntry {
                seq: 1,
                frame: Bytes::from_static(b"{}"),
            });
        }

        handle_replay(&ctx, &client, &ReplayRequest::default());
        assert!(rx.try_recv().is_err());
    }
}
