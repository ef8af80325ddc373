//! Connection load generator for the gateway.
//!
//! Opens N WebSocket clients against a running gateway, subscribes each to a
//! slice of the channel space, and reports aggregate receive throughput once
//! a second. Env-driven like the server itself:
//!
//! - `LOADGEN_URL`      ws endpoint (default: ws://127.0.0.1:8080/ws)
//! - `LOADGEN_CLIENTS`  concurrent connections (default: 100)
//! - `LOADGEN_SYMBOLS`  comma-separated symbols (default: BTC,ETH,SOL)
//! - `LOADGEN_SECONDS`  run duration, 0 = forever (default: 30)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use odin_gateway::config::parse_env_var_with_warning;

struct Totals {
    connected: AtomicU64,
    envelopes: AtomicU64,
    errors: AtomicU64,
}

async fn run_client(url: String, channels: Vec<String>, totals: Arc<Totals>) {
    let (mut ws, _) = match connect_async(&url).await {
        Ok(ok) => ok,
        Err(e) => {
            totals.errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "connect failed");
            return;
        }
    };
    totals.connected.fetch_add(1, Ordering::Relaxed);

    let subscribe = serde_json::json!({"type": "subscribe", "data": {"channels": channels}});
    if ws.send(Message::Text(subscribe.to_string())).await.is_err() {
        totals.errors.fetch_add(1, Ordering::Relaxed);
        totals.connected.fetch_sub(1, Ordering::Relaxed);
        return;
    }

    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if text.contains("\"seq\"") {
                    totals.envelopes.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    totals.connected.fetch_sub(1, Ordering::Relaxed);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let url = std::env::var("LOADGEN_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:8080/ws".to_string());
    let clients: usize = parse_env_var_with_warning("LOADGEN_CLIENTS", 100usize);
    let seconds: u64 = parse_env_var_with_warning("LOADGEN_SECONDS", 30u64);
    let symbols: Vec<String> = std::env::var("LOADGEN_SYMBOLS")
        .unwrap_or_else(|_| "BTC,ETH,SOL".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    info!(url = %url, clients, ?symbols, seconds, "starting load generator");

    let totals = Arc::new(Totals {
        connected: AtomicU64::new(0),
        envelopes: AtomicU64::new(0),
        errors: AtomicU64::new(0),
    });

    for i in 0..clients {
        // Spread clients across the symbol space, all on the trade channel.
        let symbol = &symbols[i % symbols.len()];
        let channels = vec![format!("{symbol}.trade")];
        tokio::spawn(run_client(url.clone(), channels, Arc::clone(&totals)));
        // Gentle ramp so admission rate limits aren't the thing under test.
        if i % 50 == 49 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let mut last_envelopes = 0u64;
    let mut elapsed = 0u64;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        elapsed += 1;
        let envelopes = totals.envelopes.load(Ordering::Relaxed);
        info!(
            connected = totals.connected.load(Ordering::Relaxed),
            envelopes_per_sec = envelopes - last_envelopes,
            total = envelopes,
            errors = totals.errors.load(Ordering::Relaxed),
            "tick"
        );
        last_envelopes = envelopes;
        if seconds > 0 && elapsed >= seconds {
            break;
        }
    }

    info!(
        total_envelopes = totals.envelopes.load(Ordering::Relaxed),
        errors = totals.errors.load(Ordering::Relaxed),
        "load generator finished"
    );
}
