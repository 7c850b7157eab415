//! Client wire protocol
//!
//! Defines the message envelope exchanged with clients over both transports
//! and the message type vocabulary.

mod envelope;
mod types;

pub use envelope::{Envelope, BODY_FIELD, CHANNEL_FIELD, REASON_FIELD, SEQ_FIELD, TOKEN_FIELD, TYPE_FIELD};
pub use types::MessageType;
