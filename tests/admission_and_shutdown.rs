//! Admission control, capacity accounting, health/metrics endpoints, and
//! graceful shutdown, exercised over real sockets.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::connect_async;

use odin_gateway::bus::BroadcastMessage;
use odin_gateway::{Config, Gateway};

fn test_config() -> Config {
    let mut config = Config::default();
    config.ws_addr = "127.0.0.1:0".parse().unwrap();
    config.kafka_brokers = String::new();
    config.kafka_enabled = false;
    config
}

async fn wait_for_active(gateway: &Gateway, expected: usize) {
    for _ in 0..50 {
        if gateway.state().total_active() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!(
        "active connections never reached {expected}, still {}",
        gateway.state().total_active()
    );
}

#[tokio::test]
async fn capacity_limit_rejects_then_recovers() {
    let mut config = test_config();
    // Three shards sharing a two-connection budget, each shard gets one slot.
    config.max_connections = 2;
    config.shard_count = 3;
    let mut gateway = Gateway::spawn(config).await.unwrap();
    gateway.set_shutdown_grace(Duration::from_millis(200));
    let url = format!("ws://{}/ws", gateway.local_addr);

    let (first, _) = connect_async(&url).await.unwrap();
    let (second, _) = connect_async(&url).await.unwrap();
    wait_for_active(&gateway, 2).await;

    // Third upgrade is refused at the door with 503.
    match connect_async(&url).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 503),
        other => panic!("expected HTTP 503, got {other:?}"),
    }

    // Health reports full-but-healthy capacity.
    let health: serde_json::Value =
        reqwest::get(format!("http://{}/health", gateway.local_addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(health["checks"]["capacity"]["current"], 2);
    assert_eq!(health["checks"]["capacity"]["max"], 2);
    assert_eq!(health["checks"]["capacity"]["percentage"], 100.0);
    assert_eq!(health["checks"]["capacity"]["healthy"], true);
    assert_eq!(health["checks"]["kafka"]["enabled"], false);

    // Releasing one slot lets the next attempt in.
    drop(first);
    wait_for_active(&gateway, 1).await;
    let (third, _) = connect_async(&url).await.unwrap();

    drop(second);
    drop(third);
    gateway.shutdown().await;
}

#[tokio::test]
async fn slots_are_conserved_across_connect_disconnect_cycles() {
    let mut config = test_config();
    config.max_connections = 8;
    config.shard_count = 2;
    let mut gateway = Gateway::spawn(config).await.unwrap();
    gateway.set_shutdown_grace(Duration::from_millis(200));
    let url = format!("ws://{}/ws", gateway.local_addr);

    for _ in 0..3 {
        let mut clients = Vec::new();
        for _ in 0..4 {
            let (ws, _) = connect_async(&url).await.unwrap();
            clients.push(ws);
        }
        wait_for_active(&gateway, 4).await;
        drop(clients);
        wait_for_active(&gateway, 0).await;
    }

    gateway.shutdown().await;
}

#[tokio::test]
async fn health_is_ok_and_metrics_expose_counters() {
    let mut gateway = Gateway::spawn(test_config()).await.unwrap();
    gateway.set_shutdown_grace(Duration::from_millis(200));
    let url = format!("ws://{}/ws", gateway.local_addr);

    let (mut ws, _) = connect_async(&url).await.unwrap();
    ws.send(Message::Text(
        serde_json::json!({"type": "subscribe", "data": {"channels": ["BTC.trade"]}})
            .to_string(),
    ))
    .await
    .unwrap();
    // Wait for the ack so the subscription is live before publishing.
    let ack = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(ack, Message::Text(_)));

    assert!(gateway.publisher().publish(BroadcastMessage::new(
        "odin.token.BTC.trade",
        Bytes::from_static(br#"{"p":1}"#),
    )));
    let envelope = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(envelope, Message::Text(_)));

    let response = reqwest::get(format!("http://{}/health", gateway.local_addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let health: serde_json::Value = response.json().await.unwrap();
    assert!(health["status"] == "healthy" || health["status"] == "degraded");
    assert!(health["observability"]["uptime_seconds"].is_u64());
    assert!(health["observability"]["send_buffer_saturation"]["p99"].is_f64());

    let metrics_text = reqwest::get(format!("http://{}/metrics", gateway.local_addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics_text.contains("ws_messages_sent_total 1"));
    assert!(metrics_text.contains("ws_active_connections 1"));
    assert!(metrics_text.contains("ws_uptime_seconds"));
    assert!(metrics_text.contains("ws_connections_accepted_total 1"));

    drop(ws);
    gateway.shutdown().await;
}

#[tokio::test]
async fn shutdown_refuses_new_upgrades_and_closes_stragglers_with_1001() {
    let mut gateway = Gateway::spawn(test_config()).await.unwrap();
    gateway.set_shutdown_grace(Duration::from_secs(1));
    let url = format!("ws://{}/ws", gateway.local_addr);

    let (mut ws, _) = connect_async(&url).await.unwrap();
    wait_for_active(&gateway, 1).await;

    let reader = tokio::spawn(async move {
        // Drain until the close frame arrives.
        while let Some(Ok(frame)) = ws.next().await {
            if let Message::Close(Some(close)) = frame {
                return Some(u16::from(close.code));
            }
        }
        None
    });

    gateway.shutdown().await;

    let close_code = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("client never observed the close")
        .unwrap();
    assert_eq!(close_code, Some(1001));

    // The public listener is gone: new upgrade attempts fail outright.
    assert!(connect_async(&url).await.is_err());
}

#[tokio::test]
async fn shutdown_exits_early_once_connections_drain() {
    let mut gateway = Gateway::spawn(test_config()).await.unwrap();
    gateway.set_shutdown_grace(Duration::from_secs(30));
    let url = format!("ws://{}/ws", gateway.local_addr);

    let (ws, _) = connect_async(&url).await.unwrap();
    wait_for_active(&gateway, 1).await;
    drop(ws);
    wait_for_active(&gateway, 0).await;

    // With zero active connections the full grace window is skipped.
    let started = std::time::Instant::now();
    gateway.shutdown().await;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "shutdown should not sit out the grace window with nothing to drain"
    );
}
