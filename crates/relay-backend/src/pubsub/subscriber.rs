//! Pub/sub subscriber.
//!
//! Owns the dedicated pub/sub connection. A single background task reads
//! from the bus and forwards decoded messages on a bounded out-channel; on
//! connection loss it reconnects with exponential backoff and re-establishes
//! the control channel plus every tracked subscription before reporting
//! ready. `subscribe`/`unsubscribe` block on that readiness barrier.

use crate::retry::Backoff;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::Client;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

/// Buffer size of the decoded message out-channel.
const MESSAGE_BUFFER: usize = 250;

/// Error type for subscriber operations
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Subscriber task gone")]
    ChannelClosed,
}

/// A decoded message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published on
    pub channel: String,
    /// Raw payload
    pub payload: String,
}

/// Subscribe/unsubscribe capability of the bus, as seen by the hub.
#[async_trait]
pub trait BusControl: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), SubscriberError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscriberError>;
}

/// Subscriber configuration
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Redis connection URL for the pub/sub host
    pub url: String,
    /// Channel used for inter-instance coordination; always subscribed
    pub control_channel: String,
}

/// Commands for subscription management
#[derive(Debug)]
enum SubscriberCommand {
    Subscribe(String),
    Unsubscribe(String),
}

/// Handle to the background pub/sub listener.
pub struct Subscriber {
    /// Control channel for subscription management
    control_tx: mpsc::Sender<SubscriberCommand>,
    /// Flips false while the connection is being (re-)established
    ready: watch::Receiver<bool>,
}

impl Subscriber {
    /// Start the background listener. Returns the handle and the receiving
    /// end of the decoded message stream.
    pub fn spawn(config: SubscriberConfig) -> (Self, mpsc::Receiver<BusMessage>) {
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (control_tx, control_rx) = mpsc::channel(32);
        let (ready_tx, ready_rx) = watch::channel(false);
        // Tracked channels, owned by the listener task; survives reconnects
        let subscribed = Arc::new(RwLock::new(HashSet::new()));

        let subscriber = Self {
            control_tx,
            ready: ready_rx,
        };

        tokio::spawn(Self::listener_loop(
            config,
            subscribed,
            messages_tx,
            control_rx,
            ready_tx,
        ));

        (subscriber, messages_rx)
    }

    /// Background listener loop with reconnection
    async fn listener_loop(
        config: SubscriberConfig,
        subscribed: Arc<RwLock<HashSet<String>>>,
        messages_tx: mpsc::Sender<BusMessage>,
        mut control_rx: mpsc::Receiver<SubscriberCommand>,
        ready_tx: watch::Sender<bool>,
    ) {
        let mut backoff = Backoff::reconnect();
        loop {
            let _ = ready_tx.send(false);
            match Self::run_listener(
                &config,
                &subscribed,
                &messages_tx,
                &mut control_rx,
                &ready_tx,
                &mut backoff,
            )
            .await
            {
                Ok(()) => {
                    tracing::info!("Subscriber shutting down");
                    break;
                }
                Err(e) => {
                    let delay = backoff.next_delay().unwrap_or_default();
                    tracing::error!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Subscriber error, reconnecting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run the listener until shutdown (`Ok`) or connection failure (`Err`).
    async fn run_listener(
        config: &SubscriberConfig,
        subscribed: &Arc<RwLock<HashSet<String>>>,
        messages_tx: &mpsc::Sender<BusMessage>,
        control_rx: &mut mpsc::Receiver<SubscriberCommand>,
        ready_tx: &watch::Sender<bool>,
        backoff: &mut Backoff,
    ) -> Result<(), SubscriberError> {
        let client = Client::open(config.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;

        // Re-establish the control channel and every tracked subscription
        // before accepting new mutations.
        pubsub.subscribe(&config.control_channel).await?;
        {
            let channels = subscribed.read().await;
            for channel in channels.iter() {
                pubsub.subscribe(channel).await?;
            }
        }
        let _ = ready_tx.send(true);
        backoff.reset();

        tracing::info!(url = %config.url, "Subscriber connected to bus");

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(msg) => {
                            let channel = msg.get_channel_name().to_string();
                            let payload: String = msg.get_payload().unwrap_or_default();

                            tracing::trace!(channel = %channel, "Received bus message");

                            if messages_tx.send(BusMessage { channel, payload }).await.is_err() {
                                // Receiver gone: the hub stopped, so do we.
                                return Ok(());
                            }
                        }
                        None => {
                            tracing::warn!("Pub/sub stream ended");
                            return Err(SubscriberError::ChannelClosed);
                        }
                    }
                }

                cmd = control_rx.recv() => {
                    match cmd {
                        Some(SubscriberCommand::Subscribe(channel)) => {
                            // Need to drop the stream to access the socket
                            drop(stream);
                            pubsub.subscribe(&channel).await?;
                            subscribed.write().await.insert(channel.clone());
                            tracing::debug!(channel = %channel, "Subscribed to channel");
                            stream = pubsub.on_message();
                        }
                        Some(SubscriberCommand::Unsubscribe(channel)) => {
                            drop(stream);
                            pubsub.unsubscribe(&channel).await?;
                            subscribed.write().await.remove(&channel);
                            tracing::debug!(channel = %channel, "Unsubscribed from channel");
                            stream = pubsub.on_message();
                        }
                        // Every handle dropped: tear the listener down
                        None => {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Block until the listener has a live, fully resubscribed connection.
    async fn wait_ready(&self) -> Result<(), SubscriberError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|up| *up)
            .await
            .map_err(|_| SubscriberError::ChannelClosed)?;
        Ok(())
    }

}

#[async_trait]
impl BusControl for Subscriber {
    async fn subscribe(&self, channel: &str) -> Result<(), SubscriberError> {
        self.wait_ready().await?;
        self.control_tx
            .send(SubscriberCommand::Subscribe(channel.to_string()))
            .await
            .map_err(|_| SubscriberError::ChannelClosed)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), SubscriberError> {
        self.wait_ready().await?;
        self.control_tx
            .send(SubscriberCommand::Unsubscribe(channel.to_string()))
            .await
            .map_err(|_| SubscriberError::ChannelClosed)
    }
}
