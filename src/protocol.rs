//! The JSON text protocol spoken with clients.
//!
//! Inbound control frames are `{"type": ..., "data": {...}}`; outbound
//! frames are tagged the same way. Envelopes (the live data path) are built
//! separately in `envelope`.

use serde::{Deserialize, Serialize};

/// A control frame from the client.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { data: ChannelList },
    Unsubscribe { data: ChannelList },
    Replay { data: ReplayRequest },
    Heartbeat,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct ChannelList {
    pub channels: Vec<String>,
}

/// `{from, to}` replays the inclusive range; `{since}` replays everything
/// with a greater sequence. `since` wins if both are supplied.
#[derive(Debug, Default, Deserialize, PartialEq)]
pub struct ReplayRequest {
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub to: Option<u64>,
    #[serde(default)]
    pub since: Option<u64>,
}

/// How an inbound text frame failed to parse.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// Not JSON at all, or JSON without a usable `type` tag.
    Malformed,
    /// Valid JSON with an unrecognized `type`; logged and ignored.
    UnknownType(String),
}

/// Parse one inbound text frame.
///
/// Unknown types are distinguished from malformed input so the caller can
/// ignore the former quietly and count the latter.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, ParseError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| ParseError::Malformed)?;
    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(ParseError::Malformed)?
        .to_string();
    serde_json::from_value(value).map_err(|_| match kind.as_str() {
        "subscribe" | "unsubscribe" | "replay" | "heartbeat" => ParseError::Malformed,
        _ => ParseError::UnknownType(kind),
    })
}

/// A control frame to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    SubscriptionAck {
        subscribed: Vec<String>,
        count: usize,
    },
    UnsubscriptionAck {
        unsubscribed: Vec<String>,
        count: usize,
    },
    Pong {
        ts: i64,
    },
    ReplayIncomplete {
        sent: usize,
        total: usize,
        message: String,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

/// Error code sent when a client exceeds its message rate limit.
pub const CODE_RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// WebSocket close codes used by the gateway.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Going away: server shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation: client too slow to drain its send buffer.
    pub const POLICY_SLOW_CLIENT: u16 = 1008;
    /// Internal error (e.g. backend dial failure).
    pub const INTERNAL: u16 = 1011;
    /// Service restart / overloaded: no slot available after upgrade.
    pub const OVERLOADED: u16 = 1012;
}
