//! Typed adapter over the bus.
//!
//! All key/value state lives in Redis under a configurable prefix:
//!
//! - `sess:<token>`: JSON of the sanitised auth payload
//! - `channels:<token>`: hash of subscribed channel names
//! - `backlog:<token>`: list of buffered messages for a parked session
//! - `connected`: gauge of accepted clients
//!
//! Every operation is a single atomic pipeline. Transport-level failures
//! are retried with backoff; logical errors surface to the caller
//! unchanged.

use crate::pool::{RedisPool, RedisPoolConfig, RedisPoolError};
use crate::pubsub::{BusControl, BusMessage, ControlMessage, Subscriber, SubscriberConfig, SubscriberError};
use crate::retry::Backoff;
use async_trait::async_trait;
use redis::{Cmd, FromRedisValue, Pipeline};
use relay_common::protocol::{Envelope, MessageType, TYPE_FIELD};
use relay_common::GatewayConfig;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Pool(#[from] RedisPoolError),

    #[error("Redis command error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether retrying the operation on a fresh connection can help.
    fn is_transient(&self) -> bool {
        match self {
            Self::Pool(RedisPoolError::GetConnection(_)) => true,
            Self::Pool(_) => false,
            Self::Redis(e) => {
                e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
            }
            Self::Serialization(_) => false,
        }
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// The typed adapter: key/value session state plus the pub/sub socket.
pub struct Backend {
    pool: RedisPool,
    subscriber: Arc<Subscriber>,
    prefix: String,
    control_channel: String,
    /// Session expiry in seconds (poll timeout + 1 s slack)
    ttl: u64,
}

impl Backend {
    /// Connect the pool and start the pub/sub listener. Returns the adapter
    /// and the receiving end of the decoded message stream.
    pub fn connect(
        config: &GatewayConfig,
    ) -> BackendResult<(Arc<Self>, mpsc::Receiver<BusMessage>)> {
        let pool = RedisPool::new(RedisPoolConfig {
            url: config.redis_url(),
            max_connections: config.redis_max_connections,
        })?;

        let (subscriber, messages) = Subscriber::spawn(SubscriberConfig {
            url: config.pubsub_url(),
            control_channel: config.control_channel.clone(),
        });

        let backend = Arc::new(Self {
            pool,
            subscriber: Arc::new(subscriber),
            prefix: config.namespace.clone(),
            control_channel: config.control_channel.clone(),
            ttl: config.session_ttl(),
        });

        Ok((backend, messages))
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn session_key(&self, token: &str) -> String {
        self.key(&format!("sess:{token}"))
    }

    fn channels_key(&self, token: &str) -> String {
        self.key(&format!("channels:{token}"))
    }

    fn backlog_key(&self, token: &str) -> String {
        self.key(&format!("backlog:{token}"))
    }

    /// Run a pipeline through the transient-error retrier.
    async fn exec_pipe<T: FromRedisValue>(&self, pipe: &Pipeline) -> BackendResult<T> {
        let mut backoff = Backoff::kv();
        loop {
            let result: BackendResult<T> = async {
                let mut conn = self.pool.get().await?;
                Ok(pipe.query_async(&mut conn).await?)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(error = %e, "Transient bus error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a single command through the transient-error retrier.
    async fn exec_cmd<T: FromRedisValue>(&self, cmd: &Cmd) -> BackendResult<T> {
        let mut backoff = Backoff::kv();
        loop {
            let result: BackendResult<T> = async {
                let mut conn = self.pool.get().await?;
                Ok(cmd.query_async(&mut conn).await?)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::warn!(error = %e, "Transient bus error, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Store a session record and bump the connected counter.
    ///
    /// The routing fields are stripped; only application data is persisted.
    pub async fn store_session(&self, token: &str, auth: &Envelope) -> BackendResult<()> {
        let data = sanitized_payload(auth)?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SETEX")
            .arg(self.session_key(token))
            .arg(self.ttl)
            .arg(data)
            .ignore()
            .cmd("INCR")
            .arg(self.key("connected"))
            .ignore();
        self.exec_pipe::<()>(&pipe).await?;

        tracing::debug!(token = %token, "Stored session");
        Ok(())
    }

    /// Delete a session record, its channel set, and decrement the counter.
    pub async fn delete_session(&self, token: &str) -> BackendResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("DEL")
            .arg(self.session_key(token))
            .ignore()
            .cmd("DEL")
            .arg(self.channels_key(token))
            .ignore()
            .cmd("DECR")
            .arg(self.key("connected"))
            .ignore();
        self.exec_pipe::<()>(&pipe).await?;

        tracing::debug!(token = %token, "Deleted session");
        Ok(())
    }

    /// Load the sanitised auth payload for a token, if the session exists.
    pub async fn get_session(&self, token: &str) -> BackendResult<Option<Envelope>> {
        let data: Option<String> = self
            .exec_cmd(redis::cmd("GET").arg(self.session_key(token)))
            .await?;
        match data {
            Some(json) => Ok(Some(Envelope::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Whether a live session record exists for this token.
    pub async fn is_connected(&self, token: &str) -> BackendResult<bool> {
        let exists: bool = self
            .exec_cmd(redis::cmd("EXISTS").arg(self.session_key(token)))
            .await?;
        Ok(exists)
    }

    /// Current value of the connected counter.
    pub async fn get_connected(&self) -> BackendResult<i64> {
        let count: Option<i64> = self
            .exec_cmd(redis::cmd("GET").arg(self.key("connected")))
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Record a channel subscription for a long-poll token and broadcast it
    /// so the current holder of the token's poll wakes up.
    pub async fn longpoll_subscribe(&self, token: &str, channel: &str) -> BackendResult<()> {
        let notice = ControlMessage::Subscribe {
            token: token.to_string(),
            channel: channel.to_string(),
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.channels_key(token))
            .arg(channel)
            .arg("1")
            .ignore()
            .cmd("EXPIRE")
            .arg(self.channels_key(token))
            .arg(self.ttl)
            .ignore()
            .cmd("PUBLISH")
            .arg(&self.control_channel)
            .arg(notice.encode())
            .ignore();
        self.exec_pipe::<()>(&pipe).await?;

        tracing::debug!(token = %token, channel = %channel, "Recorded long-poll subscription");
        Ok(())
    }

    /// Remove a channel subscription for a long-poll token and broadcast it.
    pub async fn longpoll_unsubscribe(&self, token: &str, channel: &str) -> BackendResult<()> {
        let notice = ControlMessage::Unsubscribe {
            token: token.to_string(),
            channel: channel.to_string(),
        };

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HDEL")
            .arg(self.channels_key(token))
            .arg(channel)
            .ignore()
            .cmd("PUBLISH")
            .arg(&self.control_channel)
            .arg(notice.encode())
            .ignore();
        self.exec_pipe::<()>(&pipe).await?;

        tracing::debug!(token = %token, channel = %channel, "Recorded long-poll unsubscription");
        Ok(())
    }

    /// The set of channels a long-poll token is subscribed to.
    pub async fn longpoll_get_channels(&self, token: &str) -> BackendResult<Vec<String>> {
        let channels: Vec<String> = self
            .exec_cmd(redis::cmd("HKEYS").arg(self.channels_key(token)))
            .await?;
        Ok(channels)
    }

    /// Extend the session and channel-set TTLs to twice the base expiry:
    /// the parked waiting time of the request plus the lingering window.
    pub async fn longpoll_ping(&self, token: &str) -> BackendResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("EXPIRE")
            .arg(self.channels_key(token))
            .arg(self.ttl * 2)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.session_key(token))
            .arg(self.ttl * 2)
            .ignore();
        self.exec_pipe::<()>(&pipe).await
    }

    /// Append a message to the token's backlog.
    pub async fn longpoll_backlog(&self, token: &str, mut message: Envelope) -> BackendResult<()> {
        // The type tag is re-applied when the backlog drains
        message.remove(TYPE_FIELD);
        let data = message.to_json()?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(self.backlog_key(token))
            .arg(data)
            .ignore()
            .cmd("EXPIRE")
            .arg(self.backlog_key(token))
            .arg(self.ttl)
            .ignore();
        self.exec_pipe::<()>(&pipe).await?;

        tracing::trace!(token = %token, "Backlogged message");
        Ok(())
    }

    /// Pop the token's backlog in order, re-tagging each entry as a
    /// broadcast message and emitting it on `out`.
    ///
    /// Sends block while `out` is full, so the receiving side must be
    /// consuming while the drain runs.
    pub async fn longpoll_drain_backlog(
        &self,
        token: &str,
        out: &mpsc::Sender<Envelope>,
    ) -> BackendResult<()> {
        let key = self.backlog_key(token);
        loop {
            let data: Option<String> = self
                .exec_cmd(redis::cmd("LPOP").arg(&key))
                .await?;
            let Some(json) = data else {
                return Ok(());
            };

            let message = match retag_backlog_entry(&json) {
                Some(m) => m,
                None => {
                    tracing::warn!(token = %token, "Dropping unreadable backlog entry");
                    continue;
                }
            };

            if out.send(message).await.is_err() {
                // Receiver gone, nothing left to deliver to
                return Ok(());
            }
        }
    }

    /// Signal that any previous `poll` for this token with a different
    /// sequence must yield.
    pub async fn longpoll_transfer(&self, token: &str, seq: &str) -> BackendResult<()> {
        let notice = ControlMessage::Transfer {
            token: token.to_string(),
            seq: seq.to_string(),
        };
        self.exec_cmd::<()>(
            redis::cmd("PUBLISH")
                .arg(&self.control_channel)
                .arg(notice.encode()),
        )
        .await
    }

    /// Check that the key/value side of the bus is reachable.
    pub async fn health_check(&self) -> BackendResult<()> {
        self.pool.health_check().await?;
        Ok(())
    }
}

/// Channel subscription mutations are forwarded to the pub/sub socket.
#[async_trait]
impl BusControl for Backend {
    async fn subscribe(&self, channel: &str) -> Result<(), SubscriberError> {
        self.subscriber.subscribe(channel).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscriberError> {
        self.subscriber.unsubscribe(channel).await
    }
}

/// Serialize an auth payload without its routing fields.
fn sanitized_payload(auth: &Envelope) -> Result<String, serde_json::Error> {
    let mut payload = auth.clone();
    payload.sanitize();
    payload.to_json()
}

/// Parse a stored backlog entry back into a deliverable broadcast message.
fn retag_backlog_entry(json: &str) -> Option<Envelope> {
    let mut message = Envelope::from_json(json).ok()?;
    message.set(TYPE_FIELD, MessageType::Message.as_str());
    Some(message)
}
