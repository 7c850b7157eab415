//! # relay-backend
//!
//! Typed adapter over the Redis bus for the relay gateway.
//!
//! ## Features
//!
//! - **Connection pool**: managed Redis connection pool with deadpool
//! - **Session storage**: session records, per-token channel sets, backlogs
//!   and the connected counter, all TTL-bounded
//! - **Pub/sub**: a dedicated receive loop with automatic reconnect and
//!   resubscribe, plus the inter-instance control channel

pub mod backend;
pub mod pool;
pub mod pubsub;
pub mod retry;

pub use backend::{Backend, BackendError, BackendResult};
pub use pool::{RedisPool, RedisPoolConfig, RedisPoolError};
pub use pubsub::{
    BusControl, BusMessage, ControlMessage, Subscriber, SubscriberConfig, SubscriberError,
};
pub use retry::Backoff;
