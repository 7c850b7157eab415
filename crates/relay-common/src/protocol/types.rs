//! Message types used between server and client.

/// Message type vocabulary.
///
/// The wire representation is the `__type` field of the envelope; the
/// strings are case-sensitive and exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client: start authentication
    Auth,
    /// Server: authentication succeeded
    AuthOk,
    /// Server: authentication failed
    AuthError,
    /// Client: subscribe to a channel
    Subscribe,
    /// Server: subscribe succeeded
    SubscribeOk,
    /// Server: subscribe failed
    SubscribeError,
    /// Client: unsubscribe from a channel
    Unsubscribe,
    /// Server: unsubscribe succeeded
    UnsubscribeOk,
    /// Server: unsubscribe failed
    UnsubscribeError,
    /// Server: broadcast message
    Message,
    /// Client: long-poll for messages
    Poll,
    /// Client: keep-alive
    Ping,
    /// Server: unrecognised request
    Unknown,
    /// Server: internal failure
    ServerError,
}

impl MessageType {
    /// Parse a wire string into a message type.
    #[must_use]
    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "auth" => Some(Self::Auth),
            "authOk" => Some(Self::AuthOk),
            "authError" => Some(Self::AuthError),
            "subscribe" => Some(Self::Subscribe),
            "subscribeOk" => Some(Self::SubscribeOk),
            "subscribeError" => Some(Self::SubscribeError),
            "unsubscribe" => Some(Self::Unsubscribe),
            "unsubscribeOk" => Some(Self::UnsubscribeOk),
            "unsubscribeError" => Some(Self::UnsubscribeError),
            "message" => Some(Self::Message),
            "poll" => Some(Self::Poll),
            "ping" => Some(Self::Ping),
            "unknown" => Some(Self::Unknown),
            "serverError" => Some(Self::ServerError),
            _ => None,
        }
    }

    /// Get the wire string for this message type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthOk => "authOk",
            Self::AuthError => "authError",
            Self::Subscribe => "subscribe",
            Self::SubscribeOk => "subscribeOk",
            Self::SubscribeError => "subscribeError",
            Self::Unsubscribe => "unsubscribe",
            Self::UnsubscribeOk => "unsubscribeOk",
            Self::UnsubscribeError => "unsubscribeError",
            Self::Message => "message",
            Self::Poll => "poll",
            Self::Ping => "ping",
            Self::Unknown => "unknown",
            Self::ServerError => "serverError",
        }
    }

    /// The request type this response answers, for result correlation.
    ///
    /// `subscribeOk`/`subscribeError` collapse to `subscribe` and
    /// `unsubscribeOk` collapses to `unsubscribe`; every other type maps to
    /// itself.
    #[must_use]
    pub const fn request_type(self) -> Self {
        match self {
            Self::SubscribeOk | Self::SubscribeError => Self::Subscribe,
            Self::UnsubscribeOk => Self::Unsubscribe,
            other => other,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
