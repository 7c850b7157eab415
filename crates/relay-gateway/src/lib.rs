//! # relay-gateway
//!
//! Horizontally-scalable fan-out gateway: delivers messages published on the
//! backing pub/sub bus to remote clients over websocket or long-poll.

pub mod hub;
pub mod server;
pub mod session;

pub use server::{Server, Stats};
