//! End-to-end tests over real sockets: a full in-process gateway with the
//! Kafka consumer disabled, fed by publishing straight onto the broadcast
//! bus, driven by tokio-tungstenite clients.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use odin_gateway::bus::BroadcastMessage;
use odin_gateway::{Config, Gateway};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> Config {
    let mut config = Config::default();
    config.ws_addr = "127.0.0.1:0".parse().unwrap();
    config.kafka_brokers = String::new();
    config.kafka_enabled = false;
    config.shard_count = 2;
    config.max_connections = 64;
    config
}

async fn start_gateway(config: Config) -> Gateway {
    let mut gateway = Gateway::spawn(config).await.expect("gateway should start");
    // Tests shut down with clients still connected; don't sit out the full
    // production drain window.
    gateway.set_shutdown_grace(Duration::from_millis(200));
    gateway
}

async fn connect(gateway: &Gateway) -> WsClient {
    let url = format!("ws://{}/ws", gateway.local_addr);
    let (ws, _) = connect_async(&url).await.expect("connect should succeed");
    ws
}

/// Next JSON text frame, skipping pings/pongs.
async fn next_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended unexpectedly")
            .expect("read error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("invalid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no text frame arrives within the window.
async fn expect_silence(ws: &mut WsClient, window: Duration) {
    let result = tokio::time::timeout(window, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                other => break other,
            }
        }
    })
    .await;
    if let Ok(frame) = result {
        panic!("expected silence, got {frame:?}");
    }
}

async fn subscribe(ws: &mut WsClient, channels: &[&str]) -> serde_json::Value {
    let request = serde_json::json!({"type": "subscribe", "data": {"channels": channels}});
    ws.send(Message::Text(request.to_string())).await.unwrap();
    let ack = next_json(ws).await;
    assert_eq!(ack["type"], "subscription_ack");
    ack
}

fn publish(gateway: &Gateway, symbol: &str, event_type: &str, payload: &str) {
    let published = gateway.publisher().publish(BroadcastMessage::new(
        format!("odin.token.{symbol}.{event_type}"),
        Bytes::from(payload.to_string()),
    ));
    assert!(published, "bus publish should succeed");
}

#[tokio::test]
async fn subscribed_channels_receive_sequenced_envelopes() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;

    let ack = subscribe(&mut ws, &["BTC.trade"]).await;
    assert_eq!(ack["count"], 1);

    publish(&gateway, "BTC", "trade", r#"{"price":100.5}"#);
    let first = next_json(&mut ws).await;
    assert_eq!(first["seq"], 1);
    assert_eq!(first["type"], "price:update");
    assert_eq!(first["priority"], "HIGH");
    assert_eq!(first["data"]["price"], 100.5);

    publish(&gateway, "BTC", "trade", r#"{"price":101.0}"#);
    let second = next_json(&mut ws).await;
    assert_eq!(second["seq"], 2);

    // Adding a channel mid-stream picks up from the next broadcast.
    let ack = subscribe(&mut ws, &["ETH.trade"]).await;
    assert_eq!(ack["count"], 2);

    publish(&gateway, "ETH", "trade", r#"{"price":7.0}"#);
    let third = next_json(&mut ws).await;
    assert_eq!(third["seq"], 3);
    assert_eq!(third["data"]["price"], 7.0);

    // A symbol nobody subscribed to produces no frame.
    publish(&gateway, "SOL", "trade", r#"{"price":1.0}"#);
    expect_silence(&mut ws, Duration::from_millis(500)).await;

    gateway.shutdown().await;
}

#[tokio::test]
async fn replay_since_redelivers_and_live_continues() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;
    subscribe(&mut ws, &["BTC.trade"]).await;

    for i in 0..5 {
        publish(&gateway, "BTC", "trade", &format!(r#"{{"price":{i}}}"#));
    }
    for expected in 1..=5u64 {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["seq"], expected);
    }

    // Replay everything after seq 2: exactly 3, 4, 5 in order.
    ws.send(Message::Text(
        serde_json::json!({"type": "replay", "data": {"since": 2}}).to_string(),
    ))
    .await
    .unwrap();
    for expected in 3..=5u64 {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["seq"], expected);
    }

    // Live delivery resumes with the next sequence.
    publish(&gateway, "BTC", "trade", r#"{"price":9}"#);
    let live = next_json(&mut ws).await;
    assert_eq!(live["seq"], 6);

    gateway.shutdown().await;
}

#[tokio::test]
async fn replay_range_is_inclusive_and_reversed_range_is_empty() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;
    subscribe(&mut ws, &["BTC.trade"]).await;

    for _ in 0..4 {
        publish(&gateway, "BTC", "trade", r#"{"p":1}"#);
    }
    for expected in 1..=4u64 {
        assert_eq!(next_json(&mut ws).await["seq"], expected);
    }

    ws.send(Message::Text(
        serde_json::json!({"type": "replay", "data": {"from": 2, "to": 3}}).to_string(),
    ))
    .await
    .unwrap();
    assert_eq!(next_json(&mut ws).await["seq"], 2);
    assert_eq!(next_json(&mut ws).await["seq"], 3);

    // from > to replays nothing and the connection stays healthy.
    ws.send(Message::Text(
        serde_json::json!({"type": "replay", "data": {"from": 3, "to": 2}}).to_string(),
    ))
    .await
    .unwrap();
    expect_silence(&mut ws, Duration::from_millis(300)).await;

    gateway.shutdown().await;
}

#[tokio::test]
async fn heartbeat_gets_pong_and_unsubscribe_stops_delivery() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;
    subscribe(&mut ws, &["BTC.trade"]).await;

    ws.send(Message::Text(r#"{"type":"heartbeat"}"#.to_string()))
        .await
        .unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["ts"].as_i64().is_some());

    ws.send(Message::Text(
        serde_json::json!({"type": "unsubscribe", "data": {"channels": ["BTC.trade"]}})
            .to_string(),
    ))
    .await
    .unwrap();
    let ack = next_json(&mut ws).await;
    assert_eq!(ack["type"], "unsubscription_ack");
    assert_eq!(ack["count"], 0);

    publish(&gateway, "BTC", "trade", r#"{"p":1}"#);
    expect_silence(&mut ws, Duration::from_millis(500)).await;

    gateway.shutdown().await;
}

#[tokio::test]
async fn unknown_and_malformed_frames_are_ignored() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;
    subscribe(&mut ws, &["BTC.trade"]).await;

    ws.send(Message::Text(r#"{"type":"dance"}"#.to_string()))
        .await
        .unwrap();
    ws.send(Message::Text("not json at all".to_string()))
        .await
        .unwrap();

    // Connection survives both and still delivers.
    publish(&gateway, "BTC", "trade", r#"{"p":1}"#);
    assert_eq!(next_json(&mut ws).await["seq"], 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn rate_limited_client_gets_error_frame_but_stays_connected() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;

    // Burst past the 100-token bucket. Heartbeats are cheap to flood.
    for _ in 0..120 {
        ws.send(Message::Text(r#"{"type":"heartbeat"}"#.to_string()))
            .await
            .unwrap();
    }

    let mut saw_rate_limit_error = false;
    for _ in 0..120 {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "error" {
            assert_eq!(frame["code"], "RATE_LIMIT_EXCEEDED");
            saw_rate_limit_error = true;
            break;
        }
        assert_eq!(frame["type"], "pong");
    }
    assert!(saw_rate_limit_error, "expected a rate limit error frame");

    // Never disconnected for rate reasons: after the bucket refills a bit the
    // client is served again.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    ws.send(Message::Text(r#"{"type":"heartbeat"}"#.to_string()))
        .await
        .unwrap();
    let mut saw_pong = false;
    for _ in 0..40 {
        let frame = next_json(&mut ws).await;
        if frame["type"] == "pong" {
            saw_pong = true;
            break;
        }
    }
    assert!(saw_pong, "client should still be served after refill");

    gateway.shutdown().await;
}

#[tokio::test]
async fn duplicate_subscribe_is_idempotent() {
    let gateway = start_gateway(test_config()).await;
    let mut ws = connect(&gateway).await;

    let ack = subscribe(&mut ws, &["BTC.trade", "BTC.trade"]).await;
    assert_eq!(ack["count"], 1);
    let ack = subscribe(&mut ws, &["BTC.trade"]).await;
    assert_eq!(ack["count"], 1);

    // Exactly one envelope per broadcast despite the double subscribe.
    publish(&gateway, "BTC", "trade", r#"{"p":1}"#);
    assert_eq!(next_json(&mut ws).await["seq"], 1);
    expect_silence(&mut ws, Duration::from_millis(300)).await;

    gateway.shutdown().await;
}

#[tokio::test]
async fn fanout_is_per_channel_not_per_client() {
    let gateway = start_gateway(test_config()).await;

    let mut clients = Vec::new();
    for i in 0..8 {
        let mut ws = connect(&gateway).await;
        let channel = format!("SYM{i}.trade");
        subscribe(&mut ws, &[channel.as_str()]).await;
        clients.push(ws);
    }

    for i in 0..8 {
        publish(&gateway, &format!("SYM{i}"), "trade", r#"{"p":1}"#);
    }

    // Each client receives exactly one envelope: its own channel's.
    for ws in clients.iter_mut() {
        let frame = next_json(ws).await;
        assert_eq!(frame["seq"], 1);
        expect_silence(ws, Duration::from_millis(200)).await;
    }

    gateway.shutdown().await;
}
