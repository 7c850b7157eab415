//! Pub/sub plumbing
//!
//! The dedicated receive loop over the bus and the inter-instance control
//! channel wire format.

mod control;
mod subscriber;

pub use control::ControlMessage;
pub use subscriber::{BusControl, BusMessage, Subscriber, SubscriberConfig, SubscriberError};
