//! Control-channel wire format.
//!
//! Gateway instances coordinate long-poll sessions by publishing
//! space-delimited text commands on a well-known channel. There is no
//! escaping; a channel name containing a space cannot be represented.

/// A command broadcast between gateway instances, keyed by session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// A new `poll` for this token has started; holders of an earlier poll
    /// with a different `seq` must yield.
    Transfer { token: String, seq: String },
    /// The token's channel set gained a channel.
    Subscribe { token: String, channel: String },
    /// The token's channel set lost a channel.
    Unsubscribe { token: String, channel: String },
}

impl ControlMessage {
    /// The session token this command targets.
    #[must_use]
    pub fn token(&self) -> &str {
        match self {
            Self::Transfer { token, .. }
            | Self::Subscribe { token, .. }
            | Self::Unsubscribe { token, .. } => token,
        }
    }

    /// Parse a control-channel payload. Unknown verbs and short lines
    /// yield `None`.
    #[must_use]
    pub fn parse(payload: &str) -> Option<Self> {
        let mut parts = payload.splitn(3, ' ');
        let verb = parts.next()?;
        let token = parts.next()?.to_string();
        let arg = parts.next()?.to_string();

        match verb {
            "transfer" => Some(Self::Transfer { token, seq: arg }),
            "subscribe" => Some(Self::Subscribe {
                token,
                channel: arg,
            }),
            "unsubscribe" => Some(Self::Unsubscribe {
                token,
                channel: arg,
            }),
            _ => None,
        }
    }

    /// Render the wire form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Transfer { token, seq } => format!("transfer {token} {seq}"),
            Self::Subscribe { token, channel } => format!("subscribe {token} {channel}"),
            Self::Unsubscribe { token, channel } => format!("unsubscribe {token} {channel}"),
        }
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.encode())
    }
}
