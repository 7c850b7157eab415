//! Message envelope
//!
//! All client-facing messages are flat string maps. Two field names are
//! reserved for routing; everything else is opaque application data (auth
//! payloads in particular travel as extra keys on the `auth` envelope).

use super::MessageType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Reserved: the message type.
pub const TYPE_FIELD: &str = "__type";
/// Reserved: the long-poll session token.
pub const TOKEN_FIELD: &str = "__token";

/// The channel a message relates to.
pub const CHANNEL_FIELD: &str = "channel";
/// The payload of a broadcast message.
pub const BODY_FIELD: &str = "body";
/// Human-readable failure reason on error responses.
pub const REASON_FIELD: &str = "reason";
/// Client-chosen poll sequence identifier.
pub const SEQ_FIELD: &str = "seq";

/// A single wire message: an untyped key/value mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Envelope(HashMap<String, String>);

impl Envelope {
    /// Create an empty envelope of the given type.
    #[must_use]
    pub fn of(kind: MessageType) -> Self {
        let mut fields = HashMap::new();
        fields.insert(TYPE_FIELD.to_string(), kind.as_str().to_string());
        Self(fields)
    }

    /// Create a broadcast `message` envelope.
    #[must_use]
    pub fn broadcast(channel: &str, body: &str) -> Self {
        Self::of(MessageType::Message)
            .with_field(CHANNEL_FIELD, channel)
            .with_field(BODY_FIELD, body)
    }

    /// Set the channel field.
    #[must_use]
    pub fn with_channel(self, channel: &str) -> Self {
        self.with_field(CHANNEL_FIELD, channel)
    }

    /// Set the failure reason field.
    #[must_use]
    pub fn with_reason(self, reason: &str) -> Self {
        self.with_field(REASON_FIELD, reason)
    }

    /// Set the session token field.
    #[must_use]
    pub fn with_token(self, token: &str) -> Self {
        self.with_field(TOKEN_FIELD, token)
    }

    /// Set an arbitrary field.
    #[must_use]
    pub fn with_field(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    /// Get a field, or `""` if absent.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }

    /// Set a field in place.
    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), value.to_string());
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    /// The raw `__type` field.
    #[must_use]
    pub fn type_str(&self) -> &str {
        self.get(TYPE_FIELD)
    }

    /// The parsed message type, if recognised.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_str(self.type_str())
    }

    /// Check the envelope's type.
    #[must_use]
    pub fn is(&self, kind: MessageType) -> bool {
        self.type_str() == kind.as_str()
    }

    pub fn token(&self) -> &str {
        self.get(TOKEN_FIELD)
    }

    pub fn channel(&self) -> &str {
        self.get(CHANNEL_FIELD)
    }

    pub fn body(&self) -> &str {
        self.get(BODY_FIELD)
    }

    pub fn reason(&self) -> &str {
        self.get(REASON_FIELD)
    }

    pub fn seq(&self) -> &str {
        self.get(SEQ_FIELD)
    }

    /// Strip the reserved routing fields, leaving only application data.
    pub fn sanitize(&mut self) {
        self.0.remove(TYPE_FIELD);
        self.0.remove(TOKEN_FIELD);
    }

    /// Correlation id linking a response to the request it answers:
    /// `<request-type>_<channel>`.
    #[must_use]
    pub fn result_id(&self) -> String {
        let t = match self.message_type() {
            Some(kind) => kind.request_type().as_str(),
            None => self.type_str(),
        };
        format!("{}_{}", t, self.channel())
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
