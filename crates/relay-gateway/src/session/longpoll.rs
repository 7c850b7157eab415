//! Long-poll session
//!
//! A logical session is identified by its token and persists across HTTP
//! requests, possibly served by different gateway instances. Each POST
//! carries one JSON envelope; the reply is a JSON array of envelopes.
//!
//! The `poll` request parks in a listen loop until the deadline, a
//! message batch, or a transfer (a newer poll for the same token announced
//! itself on the control channel). After answering without a transfer, the
//! session lingers for one more timeout window, diverting stray messages to
//! the backend backlog so nothing published between two polls is lost.

use crate::hub::{next_connection_id, Connection, Hub};
use crate::server::{Inner, Server};
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use relay_backend::{BackendError, ControlMessage};
use relay_common::protocol::{Envelope, MessageType};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffer sizes of the per-poll channels
const MESSAGE_BUFFER: usize = 64;
const MIRROR_BUFFER: usize = 16;

/// The hub-facing side of a long-poll session: one instance per `poll`
/// request, alive through the listen loop and the lingering window.
pub struct PollSession {
    id: u64,
    token: String,
    messages: mpsc::Sender<Envelope>,
    subscribes: mpsc::Sender<String>,
    unsubscribes: mpsc::Sender<String>,
    transfers: mpsc::Sender<String>,
}

/// Receiving ends of the per-poll channels, held by the request task.
pub struct PollChannels {
    messages: mpsc::Receiver<Envelope>,
    subscribes: mpsc::Receiver<String>,
    unsubscribes: mpsc::Receiver<String>,
    transfers: mpsc::Receiver<String>,
}

impl PollSession {
    fn new(token: String) -> (Arc<Self>, PollChannels) {
        let (messages_tx, messages_rx) = mpsc::channel(MESSAGE_BUFFER);
        let (subscribes_tx, subscribes_rx) = mpsc::channel(MIRROR_BUFFER);
        let (unsubscribes_tx, unsubscribes_rx) = mpsc::channel(MIRROR_BUFFER);
        // A poll carries at most one relevant transfer; extras are dropped
        let (transfers_tx, transfers_rx) = mpsc::channel(1);

        let session = Arc::new(Self {
            id: next_connection_id(),
            token,
            messages: messages_tx,
            subscribes: subscribes_tx,
            unsubscribes: unsubscribes_tx,
            transfers: transfers_tx,
        });
        let channels = PollChannels {
            messages: messages_rx,
            subscribes: subscribes_rx,
            unsubscribes: unsubscribes_rx,
            transfers: transfers_rx,
        };
        (session, channels)
    }

    fn message_sender(&self) -> &mpsc::Sender<Envelope> {
        &self.messages
    }
}

impl Connection for PollSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn token(&self) -> &str {
        &self.token
    }

    fn send(&self, channel: &str, payload: &str) {
        match self.messages.try_send(Envelope::broadcast(channel, payload)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(token = %self.token, channel = %channel, "Poll buffer full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn process(&self, command: &ControlMessage) {
        let dropped = match command {
            ControlMessage::Transfer { seq, .. } => self.transfers.try_send(seq.clone()).is_err(),
            ControlMessage::Subscribe { channel, .. } => {
                self.subscribes.try_send(channel.clone()).is_err()
            }
            ControlMessage::Unsubscribe { channel, .. } => {
                self.unsubscribes.try_send(channel.clone()).is_err()
            }
        };
        if dropped {
            // The listen loop already left, or an equivalent command is queued
            tracing::trace!(token = %self.token, command = %command, "Dropped control command");
        }
    }
}

/// Long-poll handler: one request, one envelope, one array reply.
pub async fn longpoll_handler(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    let Some(inner) = server.inner() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "prepare() not called on relay server")
            .into_response();
    };

    // Unreadable bodies decode to the empty envelope and fail the
    // handshake below with "Auth expected"
    let request: Envelope = serde_json::from_slice(&body).unwrap_or_default();

    let token = request.token().to_string();
    let connected = if token.is_empty() {
        false
    } else {
        match inner.backend.is_connected(&token).await {
            Ok(connected) => connected,
            Err(e) => return server_fault(&e),
        }
    };

    if !connected {
        return handshake(&server, &inner, &request).await;
    }

    match request.message_type() {
        Some(MessageType::Subscribe) => handle_subscribe(&server, &inner, &token, &request).await,
        Some(MessageType::Unsubscribe) => handle_unsubscribe(&inner, &token, &request).await,
        Some(MessageType::Poll) => handle_poll(&server, &inner, &token, request.seq()).await,
        _ => reply(StatusCode::OK, vec![Envelope::of(MessageType::Unknown)]),
    }
}

/// First request of a logical session: authenticate and mint the token.
///
/// No hub connection is created yet; the first `poll` establishes one.
async fn handshake(server: &Server, inner: &Inner, auth: &Envelope) -> Response {
    if !auth.is(MessageType::Auth) {
        return reply(
            StatusCode::UNAUTHORIZED,
            vec![Envelope::of(MessageType::AuthError).with_reason("Auth expected")],
        );
    }

    if !server.allows_connect(auth) {
        return reply(
            StatusCode::UNAUTHORIZED,
            vec![Envelope::of(MessageType::AuthError).with_reason("Unauthorized")],
        );
    }

    let token = Uuid::new_v4().to_string();
    if let Err(e) = inner.backend.store_session(&token, auth).await {
        return server_fault(&e);
    }

    tracing::info!(token = %token, "Long-poll session established");

    reply(
        StatusCode::OK,
        vec![Envelope::of(MessageType::AuthOk).with_token(&token)],
    )
}

async fn handle_subscribe(
    server: &Server,
    inner: &Inner,
    token: &str,
    request: &Envelope,
) -> Response {
    let channel = request.channel();

    let auth = match inner.backend.get_session(token).await {
        Ok(Some(auth)) => auth,
        // Session expired between the routing check and now
        Ok(None) => {
            return reply(
                StatusCode::UNAUTHORIZED,
                vec![Envelope::of(MessageType::AuthError).with_reason("Unauthorized")],
            )
        }
        Err(e) => return server_fault(&e),
    };

    if !server.allows_subscribe(&auth, channel) {
        return reply(
            StatusCode::OK,
            vec![Envelope::of(MessageType::SubscribeError)
                .with_channel(channel)
                .with_reason("Channel refused")],
        );
    }

    match inner.backend.longpoll_subscribe(token, channel).await {
        Ok(()) => reply(
            StatusCode::OK,
            vec![Envelope::of(MessageType::SubscribeOk).with_channel(channel)],
        ),
        Err(e) => reply(
            StatusCode::OK,
            vec![Envelope::of(MessageType::SubscribeError)
                .with_channel(channel)
                .with_reason(&e.to_string())],
        ),
    }
}

async fn handle_unsubscribe(inner: &Inner, token: &str, request: &Envelope) -> Response {
    let channel = request.channel();
    match inner.backend.longpoll_unsubscribe(token, channel).await {
        Ok(()) => reply(
            StatusCode::OK,
            vec![Envelope::of(MessageType::UnsubscribeOk).with_channel(channel)],
        ),
        Err(e) => reply(
            StatusCode::OK,
            vec![Envelope::of(MessageType::UnsubscribeError)
                .with_channel(channel)
                .with_reason(&e.to_string())],
        ),
    }
}

/// The poll path: park until the deadline, a message batch, or a transfer.
async fn handle_poll(server: &Server, inner: &Arc<Inner>, token: &str, seq: &str) -> Response {
    if let Err(e) = inner.backend.longpoll_ping(token).await {
        return server_fault(&e);
    }

    let (session, mut channels) = PollSession::new(token.to_string());
    inner.hub.connect(session.clone()).await;

    // Re-establish this token's subscriptions on this instance
    let subscribed = match inner.backend.longpoll_get_channels(token).await {
        Ok(subscribed) => subscribed,
        Err(e) => {
            inner.hub.disconnect(&*session).await.ok();
            return server_fault(&e);
        }
    };
    for channel in &subscribed {
        if let Err(e) = inner.hub.subscribe(&*session, channel).await {
            tracing::warn!(token = %token, channel = %channel, error = %e, "Failed to resubscribe");
        }
    }

    // Tell any earlier poll still parked on this token to yield
    {
        let backend = inner.backend.clone();
        let token = token.to_string();
        let seq = seq.to_string();
        tokio::spawn(async move {
            if let Err(e) = backend.longpoll_transfer(&token, &seq).await {
                tracing::warn!(token = %token, error = %e, "Failed to broadcast poll transfer");
            }
        });
    }

    // Messages buffered while no poll was parked come first. The drain
    // blocks whenever the poll buffer fills, so it must run alongside the
    // listen loop, not before it; a long-absent token can hold far more
    // backlog than one buffer.
    {
        let backend = inner.backend.clone();
        let token = token.to_string();
        let messages = session.message_sender().clone();
        tokio::spawn(async move {
            if let Err(e) = backend.longpoll_drain_backlog(&token, &messages).await {
                tracing::warn!(token = %token, error = %e, "Failed to drain backlog");
            }
        });
    }

    let wait = server.config().timeout.saturating_sub(server.config().poll_time);
    let (collected, transferred) = listen(
        &inner.hub,
        &session,
        &mut channels,
        seq,
        wait,
        server.config().poll_time,
    )
    .await;

    if transferred {
        inner.hub.disconnect(&*session).await.ok();
    } else {
        // Stay hub-connected for one more window, absorbing messages into
        // the backlog until the next poll lands
        tokio::spawn(linger(
            inner.clone(),
            session,
            channels,
            seq.to_string(),
            server.config().timeout,
        ));
    }

    reply(StatusCode::OK, collected)
}

/// Park until the deadline, a transfer with an unrelated sequence, or the
/// end of a message batch. The first queued message shrinks the deadline to
/// the coalesce window so closely-spaced messages share one response.
async fn listen(
    hub: &Hub,
    session: &Arc<PollSession>,
    channels: &mut PollChannels,
    seq: &str,
    wait: Duration,
    poll_time: Duration,
) -> (Vec<Envelope>, bool) {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    let mut collected = Vec::new();
    loop {
        tokio::select! {
            () = &mut deadline => return (collected, false),

            Some(other) = channels.transfers.recv() => {
                if other != seq {
                    return (collected, true);
                }
            }

            // A concurrent request on this token mutated the channel set;
            // mirror it so delivery starts (or stops) immediately
            Some(channel) = channels.subscribes.recv() => {
                if let Err(e) = hub.subscribe(&**session, &channel).await {
                    tracing::warn!(token = %session.token(), channel = %channel, error = %e, "Mirror subscribe failed");
                }
            }

            Some(channel) = channels.unsubscribes.recv() => {
                if let Err(e) = hub.unsubscribe(&**session, &channel).await {
                    tracing::warn!(token = %session.token(), channel = %channel, error = %e, "Mirror unsubscribe failed");
                }
            }

            Some(message) = channels.messages.recv() => {
                if collected.is_empty() {
                    deadline.as_mut().reset(tokio::time::Instant::now() + poll_time);
                }
                collected.push(message);
            }
        }
    }
}

/// The lingering window: divert further messages to the backlog, keep
/// mirroring channel-set changes, and yield as soon as a newer poll
/// announces itself.
async fn linger(
    inner: Arc<Inner>,
    session: Arc<PollSession>,
    mut channels: PollChannels,
    seq: String,
    window: Duration,
) {
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,

            Some(other) = channels.transfers.recv() => {
                if other != seq {
                    break;
                }
            }

            Some(channel) = channels.subscribes.recv() => {
                inner.hub.subscribe(&*session, &channel).await.ok();
            }

            Some(channel) = channels.unsubscribes.recv() => {
                inner.hub.unsubscribe(&*session, &channel).await.ok();
            }

            Some(message) = channels.messages.recv() => {
                if let Err(e) = inner.backend.longpoll_backlog(session.token(), message).await {
                    tracing::warn!(token = %session.token(), error = %e, "Failed to backlog message");
                }
            }
        }
    }

    if let Err(e) = inner.hub.disconnect(&*session).await {
        tracing::warn!(token = %session.token(), error = %e, "Hub disconnect failed");
    }
}

fn reply(status: StatusCode, messages: Vec<Envelope>) -> Response {
    (status, Json(messages)).into_response()
}

fn server_fault(error: &BackendError) -> Response {
    tracing::error!(error = %error, "Backend fault");
    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        vec![Envelope::of(MessageType::ServerError)],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_backend::{BusControl, SubscriberError};

    struct AllowBus;

    #[async_trait]
    impl BusControl for AllowBus {
        async fn subscribe(&self, _channel: &str) -> Result<(), SubscriberError> {
            Ok(())
        }

        async fn unsubscribe(&self, _channel: &str) -> Result<(), SubscriberError> {
            Ok(())
        }
    }

    fn test_hub() -> Arc<Hub> {
        Arc::new(Hub::new(Arc::new(AllowBus), "broadcaster"))
    }

    const WAIT: Duration = Duration::from_secs(28);
    const POLL_TIME: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_listen_returns_empty_at_deadline() {
        let hub = test_hub();
        let (session, mut channels) = PollSession::new("t1".to_string());
        hub.connect(session.clone()).await;

        let (collected, transferred) =
            listen(&hub, &session, &mut channels, "1", WAIT, POLL_TIME).await;

        assert!(collected.is_empty());
        assert!(!transferred);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_yields_to_newer_poll() {
        let hub = test_hub();
        let (session, mut channels) = PollSession::new("t1".to_string());
        hub.connect(session.clone()).await;

        session.process(&ControlMessage::Transfer {
            token: "t1".to_string(),
            seq: "2".to_string(),
        });

        let (collected, transferred) =
            listen(&hub, &session, &mut channels, "1", WAIT, POLL_TIME).await;

        assert!(collected.is_empty());
        assert!(transferred);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_ignores_its_own_transfer() {
        let hub = test_hub();
        let (session, mut channels) = PollSession::new("t1".to_string());
        hub.connect(session.clone()).await;

        // The broadcast of this poll's own seq loops back; it must not
        // terminate the listen
        session.process(&ControlMessage::Transfer {
            token: "t1".to_string(),
            seq: "1".to_string(),
        });

        let (collected, transferred) =
            listen(&hub, &session, &mut channels, "1", WAIT, POLL_TIME).await;

        assert!(collected.is_empty());
        assert!(!transferred);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_collects_queued_messages() {
        let hub = test_hub();
        let (session, mut channels) = PollSession::new("t1".to_string());
        hub.connect(session.clone()).await;

        session.send("test", "one");
        session.send("test", "two");

        let start = tokio::time::Instant::now();
        let (collected, transferred) =
            listen(&hub, &session, &mut channels, "1", WAIT, POLL_TIME).await;

        assert!(!transferred);
        let bodies: Vec<&str> = collected.iter().map(Envelope::body).collect();
        assert_eq!(bodies, vec!["one", "two"]);
        // The first message shrank the deadline to the coalesce window
        assert_eq!(start.elapsed(), POLL_TIME);
    }

    #[tokio::test(start_paused = true)]
    async fn test_listen_mirrors_subscription_changes() {
        let hub = test_hub();
        let (session, mut channels) = PollSession::new("t1".to_string());
        hub.connect(session.clone()).await;

        session.process(&ControlMessage::Subscribe {
            token: "t1".to_string(),
            channel: "news".to_string(),
        });

        let (_, transferred) = listen(&hub, &session, &mut channels, "1", WAIT, POLL_TIME).await;

        assert!(!transferred);
        assert!(hub.is_subscribed(&*session, "news").await);

        session.process(&ControlMessage::Unsubscribe {
            token: "t1".to_string(),
            channel: "news".to_string(),
        });
        let _ = listen(&hub, &session, &mut channels, "1", WAIT, POLL_TIME).await;
        assert!(!hub.is_subscribed(&*session, "news").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_between_polls() {
        let hub = test_hub();

        // Poll seq=1 is parked and subscribed
        let (first, mut first_channels) = PollSession::new("t1".to_string());
        hub.connect(first.clone()).await;
        hub.subscribe(&*first, "test").await.unwrap();

        // Poll seq=2 arrives: connects, resubscribes, broadcasts transfer.
        // Deliver the transfer to the parked poll directly, as the dispatch
        // loop does when the replacement lands on another gateway instance
        // and this instance's token map still points at the parked poll.
        // (With both polls on one instance the replacement registers first,
        // so the broadcast routes to it and the old poll runs out its own
        // deadline instead; no message is lost either way.)
        let (second, mut second_channels) = PollSession::new("t1".to_string());
        first.process(&ControlMessage::Transfer {
            token: "t1".to_string(),
            seq: "2".to_string(),
        });
        hub.connect(second.clone()).await;
        hub.subscribe(&*second, "test").await.unwrap();

        let (collected, transferred) =
            listen(&hub, &first, &mut first_channels, "1", WAIT, POLL_TIME).await;
        assert!(transferred);
        assert!(collected.is_empty());
        hub.disconnect(&*first).await.unwrap();

        // A message published after the handoff reaches only the new poll
        hub.handle_message(relay_backend::BusMessage {
            channel: "test".to_string(),
            payload: "Hello".to_string(),
        })
        .await;

        let (collected, transferred) =
            listen(&hub, &second, &mut second_channels, "2", WAIT, POLL_TIME).await;
        assert!(!transferred);
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].body(), "Hello");
        assert_eq!(collected[0].channel(), "test");
    }

    #[tokio::test]
    async fn test_extra_transfers_are_dropped_not_blocking() {
        let (session, _channels) = PollSession::new("t1".to_string());

        // Buffer holds one; the rest must drop without blocking
        for seq in ["2", "3", "4"] {
            session.process(&ControlMessage::Transfer {
                token: "t1".to_string(),
                seq: seq.to_string(),
            });
        }
    }
}
