//! Slot-aware proxy between the public listener and a shard.
//!
//! Slot accounting must survive failed upgrades, so the order is rigid:
//! upgrade the client side first (no slot at risk if it fails), then try to
//! take a slot, then dial the shard's internal listener. The owned semaphore
//! permit is the once-guard: whichever path exits, dropping it releases the
//! slot exactly once.

use std::borrow::Cow;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing::{debug, warn};

use crate::config::{PROXY_DIAL_TIMEOUT, WRITE_WAIT};
use crate::guard::TaskTracker;
use crate::metrics::GatewayMetrics;
use crate::protocol::close_code;
use crate::shard::Shard;

/// Close the client socket best-effort with a code and reason.
async fn close_client(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = AxumCloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = timeout(WRITE_WAIT, socket.send(AxumMessage::Close(Some(frame)))).await;
}

fn axum_to_tungstenite(message: AxumMessage) -> TungsteniteMessage {
    match message {
        AxumMessage::Text(text) => TungsteniteMessage::Text(text),
        AxumMessage::Binary(data) => TungsteniteMessage::Binary(data),
        AxumMessage::Ping(data) => TungsteniteMessage::Ping(data),
        AxumMessage::Pong(data) => TungsteniteMessage::Pong(data),
        AxumMessage::Close(frame) => {
            TungsteniteMessage::Close(frame.map(|f| TungsteniteCloseFrame {
                code: f.code.into(),
                reason: f.reason,
            }))
        }
    }
}

/// Raw frames never surface from a message-level read; they map to `None`.
fn tungstenite_to_axum(message: TungsteniteMessage) -> Option<AxumMessage> {
    match message {
        TungsteniteMessage::Text(text) => Some(AxumMessage::Text(text)),
        TungsteniteMessage::Binary(data) => Some(AxumMessage::Binary(data)),
        TungsteniteMessage::Ping(data) => Some(AxumMessage::Ping(data)),
        TungsteniteMessage::Pong(data) => Some(AxumMessage::Pong(data)),
        TungsteniteMessage::Close(frame) => {
            Some(AxumMessage::Close(frame.map(|f| AxumCloseFrame {
                code: f.code.into(),
                reason: f.reason,
            })))
        }
        TungsteniteMessage::Frame(_) => None,
    }
}

/// Run the proxy for one upgraded client. Consumes the socket; every exit
/// path either closed it or handed it to the forwarding tasks.
pub async fn run_proxy(
    client_socket: WebSocket,
    shard: Arc<Shard>,
    metrics: Arc<GatewayMetrics>,
    tasks: Arc<TaskTracker>,
) {
    // Slot AFTER upgrade: a failed upgrade never leaks a slot, and a missing
    // slot is reported on the live socket instead of a dead HTTP response.
    let permit = match Arc::clone(&shard.slots).try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            metrics
                .connections_rejected
                .with_label_values(&["no_slot"])
                .inc();
            debug!(shard = shard.id, "no slot available after upgrade, closing 1012");
            close_client(client_socket, close_code::OVERLOADED, "overloaded").await;
            return;
        }
    };

    let url = format!("ws://{}/ws", shard.advertised_addr);
    let backend = match timeout(PROXY_DIAL_TIMEOUT, connect_async(&url)).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            metrics
                .connections_rejected
                .with_label_values(&["backend_dial"])
                .inc();
            warn!(shard = shard.id, error = %e, "shard dial failed, closing 1011");
            close_client(client_socket, close_code::INTERNAL, "internal error").await;
            drop(permit);
            return;
        }
        Err(_) => {
            metrics
                .connections_rejected
                .with_label_values(&["backend_dial_timeout"])
                .inc();
            warn!(shard = shard.id, "shard dial timed out, closing 1011");
            close_client(client_socket, close_code::INTERNAL, "internal error").await;
            drop(permit);
            return;
        }
    };

    let (mut client_tx, mut client_rx) = client_socket.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    // Two forwarding tasks, every frame type verbatim. Either side ending
    // tears down both.
    let c2b_task = tasks.track();
    let mut c2b = tokio::spawn(async move {
        let _task = c2b_task;
        while let Some(Ok(message)) = client_rx.next().await {
            let message = axum_to_tungstenite(message);
            let is_close = matches!(message, TungsteniteMessage::Close(_));
            if backend_tx.send(message).await.is_err() || is_close {
                break;
            }
        }
        let _ = backend_tx.close().await;
    });

    let b2c_task = tasks.track();
    let mut b2c = tokio::spawn(async move {
        let _task = b2c_task;
        while let Some(Ok(message)) = backend_rx.next().await {
            let Some(message) = tungstenite_to_axum(message) else {
                continue;
            };
            let is_close = matches!(message, AxumMessage::Close(_));
            if client_tx.send(message).await.is_err() || is_close {
                break;
            }
        }
        let _ = client_tx.close().await;
    });

    tokio::select! {
        _ = &mut c2b => b2c.abort(),
        _ = &mut b2c => c2b.abort(),
    }

    // The permit drops here: the single release point for every proxied
    // connection's slot.
    drop(permit);
    debug!(shard = shard.id, "proxy session ended, slot released");
}
