//! # relay-common
//!
//! Shared utilities for the relay gateway: configuration, error handling,
//! telemetry, and the client wire protocol.

pub mod config;
pub mod error;
pub mod protocol;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use config::GatewayConfig;
pub use error::{RelayError, RelayResult};
pub use protocol::{Envelope, MessageType};
pub use telemetry::{init_tracing, init_tracing_with_config, try_init_tracing, TracingConfig};
