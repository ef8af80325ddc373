//! odin-gateway: sharded real-time WebSocket fan-out for Odin token events.
//!
//! A single process consumes the `odin.*` Kafka topics once through a shared
//! consumer, publishes onto an in-process broadcast bus, and fans out to a
//! fixed set of shards, each owning a partition of the connected clients.
//! Clients subscribe to `SYMBOL.EVENT_TYPE` channels and receive envelopes
//! with per-client monotonic sequence numbers; short gaps are recoverable
//! through a bounded per-client replay buffer.
//!
//! Dataflow: Kafka -> consumer pool -> bus -> shard drain -> subscription
//! index -> per-client send buffer -> write pump -> WebSocket frame.

pub mod balancer;
pub mod bus;
pub mod client;
pub mod client_ip;
pub mod config;
pub mod consumer;
pub mod cpu;
pub mod envelope;
pub mod gateway;
pub mod guard;
pub mod health;
pub mod index;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod proxy;
pub mod replay;
pub mod shard;
pub mod stats;

pub use config::Config;
pub use gateway::Gateway;
