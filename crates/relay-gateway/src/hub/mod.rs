//! Connection multiplexer
//!
//! The hub owns the mapping between connections and channels. It keeps the
//! pub/sub socket subscribed to exactly the channels that have at least one
//! local subscriber, and fans inbound bus messages out to the sessions
//! holding them.
//!
//! All four handlers run under one coarse mutex so that the mirror maps
//! never disagree between hub-visible events. Delivery to a connection is a
//! non-blocking enqueue; a slow or dead connection can never stall the
//! dispatch loop.

use relay_backend::{BusControl, BusMessage, ControlMessage, SubscriberError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique connection id.
///
/// Identity is per connection *object*, not per token: during a long-poll
/// handoff two live connections briefly share one token.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Capability set the hub holds on a session, regardless of transport.
pub trait Connection: Send + Sync {
    /// Process-unique identity of this connection object.
    fn id(&self) -> u64;

    /// The session token.
    fn token(&self) -> &str;

    /// Enqueue a broadcast message for delivery. Must not block.
    fn send(&self, channel: &str, payload: &str);

    /// Handle a control-channel command addressed to this token.
    /// Must not block. Only meaningful for long-poll sessions.
    fn process(&self, command: &ControlMessage);
}

/// Error type for hub operations
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Unknown connection")]
    UnknownConnection,

    #[error("Bus subscription error: {0}")]
    Bus(#[from] SubscriberError),
}

#[derive(Default)]
struct HubState {
    /// Registered connections by id
    connections: HashMap<u64, Arc<dyn Connection>>,
    /// Mirror maps; `channel ∈ subscriptions[c] ⇔ c ∈ channels[channel]`,
    /// and a `channels` entry exists only while it is non-empty
    subscriptions: HashMap<u64, HashSet<String>>,
    channels: HashMap<String, HashSet<u64>>,
    /// Latest connection owning each token, for control-command routing
    tokens: HashMap<String, u64>,
}

/// The connection multiplexer.
pub struct Hub {
    bus: Arc<dyn BusControl>,
    control_channel: String,
    state: Mutex<HubState>,
}

impl Hub {
    /// Create a hub over the given bus.
    pub fn new(bus: Arc<dyn BusControl>, control_channel: impl Into<String>) -> Self {
        Self {
            bus,
            control_channel: control_channel.into(),
            state: Mutex::new(HubState::default()),
        }
    }

    /// Start the dispatch loop over the bus message stream.
    ///
    /// The loop ends when the backend drops its sending side.
    pub fn start(self: &Arc<Self>, mut messages: mpsc::Receiver<BusMessage>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                hub.handle_message(message).await;
            }
            tracing::debug!("Hub dispatch loop ended");
        })
    }

    /// Register a connection.
    pub async fn connect(&self, conn: Arc<dyn Connection>) {
        let mut state = self.state.lock().await;
        state.subscriptions.insert(conn.id(), HashSet::new());
        state.tokens.insert(conn.token().to_string(), conn.id());
        tracing::debug!(token = %conn.token(), id = conn.id(), "Connection registered");
        state.connections.insert(conn.id(), conn);
    }

    /// Unregister a connection, releasing every channel it held.
    ///
    /// Safe to call for an already-removed connection.
    pub async fn disconnect(&self, conn: &dyn Connection) -> Result<(), HubError> {
        let mut state = self.state.lock().await;

        let held: Vec<String> = state
            .subscriptions
            .get(&conn.id())
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default();

        let mut failure = None;
        for channel in held {
            if let Err(e) = self.drop_subscription(&mut state, conn.id(), &channel).await {
                failure = Some(e);
            }
        }

        state.subscriptions.remove(&conn.id());
        state.connections.remove(&conn.id());
        // A newer connection may already own the token
        if state.tokens.get(conn.token()) == Some(&conn.id()) {
            state.tokens.remove(conn.token());
        }

        tracing::debug!(token = %conn.token(), id = conn.id(), "Connection removed");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Subscribe a connection to a channel.
    ///
    /// The first local subscriber triggers a bus subscription; on bus
    /// failure nothing is recorded.
    pub async fn subscribe(&self, conn: &dyn Connection, channel: &str) -> Result<(), HubError> {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&conn.id()) {
            return Err(HubError::UnknownConnection);
        }

        if !state.channels.contains_key(channel) {
            self.bus.subscribe(channel).await?;
        }

        state
            .subscriptions
            .entry(conn.id())
            .or_default()
            .insert(channel.to_string());
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn.id());

        tracing::trace!(token = %conn.token(), channel = %channel, "Subscribed");
        Ok(())
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Unsubscribing from a channel the connection does not hold is a
    /// tolerated no-op; clients may double-unsubscribe.
    pub async fn unsubscribe(&self, conn: &dyn Connection, channel: &str) -> Result<(), HubError> {
        let mut state = self.state.lock().await;
        if !state.connections.contains_key(&conn.id()) {
            return Err(HubError::UnknownConnection);
        }

        self.drop_subscription(&mut state, conn.id(), channel).await
    }

    /// Remove one subscription edge; the last local subscriber triggers a
    /// bus unsubscription. Caller holds the state lock.
    async fn drop_subscription(
        &self,
        state: &mut HubState,
        id: u64,
        channel: &str,
    ) -> Result<(), HubError> {
        let was_member = state
            .subscriptions
            .get_mut(&id)
            .is_some_and(|channels| channels.remove(channel));
        if !was_member {
            return Ok(());
        }

        let now_empty = state.channels.get_mut(channel).is_some_and(|members| {
            members.remove(&id);
            members.is_empty()
        });
        if now_empty {
            state.channels.remove(channel);
            self.bus.unsubscribe(channel).await?;
        }

        Ok(())
    }

    /// Dispatch one inbound bus message.
    pub(crate) async fn handle_message(&self, message: BusMessage) {
        if message.channel == self.control_channel {
            let Some(command) = ControlMessage::parse(&message.payload) else {
                tracing::debug!(payload = %message.payload, "Discarding unparsable control message");
                return;
            };

            let state = self.state.lock().await;
            let conn = state
                .tokens
                .get(command.token())
                .and_then(|id| state.connections.get(id));
            match conn {
                Some(conn) => conn.process(&command),
                // Another instance owns this token
                None => tracing::trace!(token = %command.token(), "Control message for unknown token"),
            }
            return;
        }

        let state = self.state.lock().await;
        let Some(subscribers) = state.channels.get(&message.channel) else {
            // The bus may lag our unsubscribe by one round-trip
            return;
        };
        for id in subscribers {
            if let Some(conn) = state.connections.get(id) {
                conn.send(&message.channel, &message.payload);
            }
        }
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Number of channels with at least one local subscriber.
    pub async fn channel_count(&self) -> usize {
        self.state.lock().await.channels.len()
    }

    /// Whether a connection currently holds a channel.
    pub async fn is_subscribed(&self, conn: &dyn Connection, channel: &str) -> bool {
        let state = self.state.lock().await;
        let forward = state
            .subscriptions
            .get(&conn.id())
            .is_some_and(|channels| channels.contains(channel));
        let reverse = state
            .channels
            .get(channel)
            .is_some_and(|members| members.contains(&conn.id()));
        debug_assert_eq!(forward, reverse);
        forward
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("control_channel", &self.control_channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeBus {
        calls: StdMutex<Vec<String>>,
        fail_subscribe: bool,
    }

    impl FakeBus {
        fn failing() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                fail_subscribe: true,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BusControl for FakeBus {
        async fn subscribe(&self, channel: &str) -> Result<(), SubscriberError> {
            if self.fail_subscribe {
                return Err(SubscriberError::ChannelClosed);
            }
            self.calls.lock().unwrap().push(format!("subscribe {channel}"));
            Ok(())
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), SubscriberError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("unsubscribe {channel}"));
            Ok(())
        }
    }

    struct FakeConnection {
        id: u64,
        token: String,
        sent: StdMutex<Vec<(String, String)>>,
        commands: StdMutex<Vec<ControlMessage>>,
    }

    impl FakeConnection {
        fn new(token: &str) -> Arc<Self> {
            Arc::new(Self {
                id: next_connection_id(),
                token: token.to_string(),
                sent: StdMutex::new(Vec::new()),
                commands: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        fn commands(&self) -> Vec<ControlMessage> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl Connection for FakeConnection {
        fn id(&self) -> u64 {
            self.id
        }

        fn token(&self) -> &str {
            &self.token
        }

        fn send(&self, channel: &str, payload: &str) {
            self.sent
                .lock()
                .unwrap()
                .push((channel.to_string(), payload.to_string()));
        }

        fn process(&self, command: &ControlMessage) {
            self.commands.lock().unwrap().push(command.clone());
        }
    }

    fn test_hub() -> (Arc<Hub>, Arc<FakeBus>) {
        let bus = Arc::new(FakeBus::default());
        let hub = Arc::new(Hub::new(bus.clone(), "broadcaster"));
        (hub, bus)
    }

    fn bus_message(channel: &str, payload: &str) -> BusMessage {
        BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        }
    }

    #[tokio::test]
    async fn test_connect_disconnect() {
        let (hub, _bus) = test_hub();
        let conn = FakeConnection::new("t1");

        hub.connect(conn.clone()).await;
        assert_eq!(hub.connection_count().await, 1);

        hub.disconnect(&*conn).await.unwrap();
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_subscriber_hits_the_bus_once() {
        let (hub, bus) = test_hub();
        let a = FakeConnection::new("ta");
        let b = FakeConnection::new("tb");
        hub.connect(a.clone()).await;
        hub.connect(b.clone()).await;

        hub.subscribe(&*a, "news").await.unwrap();
        hub.subscribe(&*b, "news").await.unwrap();

        assert_eq!(bus.calls(), vec!["subscribe news"]);
        assert!(hub.is_subscribed(&*a, "news").await);
        assert!(hub.is_subscribed(&*b, "news").await);
        assert_eq!(hub.channel_count().await, 1);
    }

    #[tokio::test]
    async fn test_last_unsubscriber_releases_the_bus() {
        let (hub, bus) = test_hub();
        let a = FakeConnection::new("ta");
        let b = FakeConnection::new("tb");
        hub.connect(a.clone()).await;
        hub.connect(b.clone()).await;
        hub.subscribe(&*a, "news").await.unwrap();
        hub.subscribe(&*b, "news").await.unwrap();

        hub.unsubscribe(&*a, "news").await.unwrap();
        assert_eq!(bus.calls(), vec!["subscribe news"]);
        assert_eq!(hub.channel_count().await, 1);

        hub.unsubscribe(&*b, "news").await.unwrap();
        assert_eq!(bus.calls(), vec!["subscribe news", "unsubscribe news"]);
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_double_unsubscribe_is_a_noop() {
        let (hub, bus) = test_hub();
        let conn = FakeConnection::new("t1");
        hub.connect(conn.clone()).await;
        hub.subscribe(&*conn, "news").await.unwrap();

        hub.unsubscribe(&*conn, "news").await.unwrap();
        hub.unsubscribe(&*conn, "news").await.unwrap();
        // Never held at all is equally fine
        hub.unsubscribe(&*conn, "other").await.unwrap();

        assert_eq!(bus.calls(), vec!["subscribe news", "unsubscribe news"]);
    }

    #[tokio::test]
    async fn test_subscribe_requires_registration() {
        let (hub, bus) = test_hub();
        let conn = FakeConnection::new("t1");

        let err = hub.subscribe(&*conn, "news").await.unwrap_err();
        assert!(matches!(err, HubError::UnknownConnection));
        assert!(bus.calls().is_empty());
    }

    #[tokio::test]
    async fn test_bus_failure_records_nothing() {
        let bus = Arc::new(FakeBus::failing());
        let hub = Hub::new(bus.clone(), "broadcaster");
        let conn = FakeConnection::new("t1");
        hub.connect(conn.clone()).await;

        assert!(hub.subscribe(&*conn, "news").await.is_err());
        assert!(!hub.is_subscribed(&*conn, "news").await);
        assert_eq!(hub.channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_fanout_respects_channel_membership() {
        let (hub, _bus) = test_hub();
        let a = FakeConnection::new("ta");
        let b = FakeConnection::new("tb");
        hub.connect(a.clone()).await;
        hub.connect(b.clone()).await;
        hub.subscribe(&*a, "test").await.unwrap();
        hub.subscribe(&*b, "other").await.unwrap();

        hub.handle_message(bus_message("other", "X")).await;
        hub.handle_message(bus_message("test", "Y")).await;

        assert_eq!(a.sent(), vec![("test".to_string(), "Y".to_string())]);
        assert_eq!(b.sent(), vec![("other".to_string(), "X".to_string())]);
    }

    #[tokio::test]
    async fn test_fanout_preserves_publication_order() {
        let (hub, _bus) = test_hub();
        let conn = FakeConnection::new("t1");
        hub.connect(conn.clone()).await;
        hub.subscribe(&*conn, "test").await.unwrap();

        for payload in ["one", "two", "three"] {
            hub.handle_message(bus_message("test", payload)).await;
        }

        let bodies: Vec<String> = conn.sent().into_iter().map(|(_, body)| body).collect();
        assert_eq!(bodies, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_message_without_subscribers_is_discarded() {
        let (hub, _bus) = test_hub();
        let conn = FakeConnection::new("t1");
        hub.connect(conn.clone()).await;

        hub.handle_message(bus_message("test", "lost")).await;
        assert!(conn.sent().is_empty());
    }

    #[tokio::test]
    async fn test_control_command_routed_by_token() {
        let (hub, _bus) = test_hub();
        let a = FakeConnection::new("ta");
        let b = FakeConnection::new("tb");
        hub.connect(a.clone()).await;
        hub.connect(b.clone()).await;

        hub.handle_message(bus_message("broadcaster", "transfer ta 7"))
            .await;

        assert_eq!(
            a.commands(),
            vec![ControlMessage::Transfer {
                token: "ta".to_string(),
                seq: "7".to_string(),
            }]
        );
        assert!(b.commands().is_empty());
    }

    #[tokio::test]
    async fn test_control_command_for_unknown_token_is_discarded() {
        let (hub, _bus) = test_hub();
        let conn = FakeConnection::new("t1");
        hub.connect(conn.clone()).await;

        hub.handle_message(bus_message("broadcaster", "transfer nobody 1"))
            .await;
        hub.handle_message(bus_message("broadcaster", "not a command"))
            .await;

        assert!(conn.commands().is_empty());
    }

    #[tokio::test]
    async fn test_token_routes_to_latest_connection() {
        let (hub, _bus) = test_hub();
        let old = FakeConnection::new("t1");
        let new = FakeConnection::new("t1");
        hub.connect(old.clone()).await;
        hub.connect(new.clone()).await;

        hub.handle_message(bus_message("broadcaster", "transfer t1 2"))
            .await;
        assert!(old.commands().is_empty());
        assert_eq!(new.commands().len(), 1);

        // Tearing down the old connection must not sever the new owner
        hub.disconnect(&*old).await.unwrap();
        hub.handle_message(bus_message("broadcaster", "transfer t1 3"))
            .await;
        assert_eq!(new.commands().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_releases_held_channels() {
        let (hub, bus) = test_hub();
        let conn = FakeConnection::new("t1");
        hub.connect(conn.clone()).await;
        hub.subscribe(&*conn, "a").await.unwrap();
        hub.subscribe(&*conn, "b").await.unwrap();

        hub.disconnect(&*conn).await.unwrap();

        assert_eq!(hub.channel_count().await, 0);
        let calls = bus.calls();
        assert!(calls.contains(&"unsubscribe a".to_string()));
        assert!(calls.contains(&"unsubscribe b".to_string()));
    }
}
