//! Message envelopes and subject/channel grammar.
//!
//! A broadcast payload reaching a client is wrapped with that client's next
//! monotonic sequence number, a message type tag, a priority, and a creation
//! timestamp. The raw Kafka payload is embedded without re-encoding.
//!
//! Subject grammar: `odin.token.{SYMBOL}.{EVENT_TYPE}`. The channel clients
//! subscribe to is the last two segments, `SYMBOL.EVENT_TYPE`.

use bytes::Bytes;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::pool::BufferPool;

/// Delivery priority carried on every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

/// Envelope classification for an event type: the wire `type` tag and the
/// priority. Only `trade -> price:update` is load-bearing for clients today;
/// the rest follow the event's immediacy.
pub fn classify(event_type: &str) -> (&'static str, Priority) {
    match event_type {
        "trade" => ("price:update", Priority::High),
        "liquidity" => ("liquidity:update", Priority::High),
        "metadata" => ("metadata:update", Priority::Medium),
        "social" => ("social:update", Priority::Low),
        "community" => ("community:update", Priority::Low),
        "creation" => ("token:new", Priority::Medium),
        "analytics" => ("analytics:update", Priority::Low),
        "balance" => ("balance:update", Priority::Medium),
        _ => ("event", Priority::Low),
    }
}

/// Kafka topic -> event type. One-to-one with the topic set; unknown topics
/// fall back to the short name after the `odin.` prefix.
pub fn event_type_for_topic(topic: &str) -> Option<&'static str> {
    match topic {
        "odin.trades" => Some("trade"),
        "odin.liquidity" => Some("liquidity"),
        "odin.metadata" => Some("metadata"),
        "odin.social" => Some("social"),
        "odin.community" => Some("community"),
        "odin.creation" => Some("creation"),
        "odin.analytics" => Some("analytics"),
        "odin.balances" => Some("balance"),
        _ => None,
    }
}

/// `odin.token.BTC.trade` -> `BTC.trade`. Subjects with fewer than two
/// segments have no channel and are dropped by the caller.
pub fn channel_from_subject(subject: &str) -> Option<String> {
    let mut tail = subject.rsplit('.');
    let event_type = tail.next()?;
    let symbol = tail.next()?;
    if event_type.is_empty() || symbol.is_empty() {
        return None;
    }
    Some(format!("{symbol}.{event_type}"))
}

/// The event type is the last segment of a subject (or channel).
pub fn event_type_from_subject(subject: &str) -> Option<&str> {
    let event_type = subject.rsplit('.').next()?;
    if event_type.is_empty() {
        None
    } else {
        Some(event_type)
    }
}

#[derive(Serialize)]
struct EnvelopeFrame<'a> {
    seq: u64,
    #[serde(rename = "type")]
    kind: &'a str,
    priority: Priority,
    ts: i64,
    data: &'a RawValue,
}

/// Wrap `payload` in an envelope frame for one client.
///
/// The payload must be valid JSON; anything else is a serialization failure
/// the caller skips (recording a metric) rather than forwarding garbage to
/// every subscriber.
pub fn serialize_envelope(
    pool: &BufferPool,
    seq: u64,
    event_type: &str,
    payload: &[u8],
) -> Result<Bytes, serde_json::Error> {
    let data: &RawValue = serde_json::from_slice(payload)?;
    let (kind, priority) = classify(event_type);
    pool.serialize_json(&EnvelopeFrame {
        seq,
        kind,
        priority,
        ts: chrono::Utc::now().timestamp_millis(),
        data,
    })
}
