//! WebSocket session
//!
//! Long-lived full-duplex connection state machine. The read loop drives
//! the state transitions; all writes funnel through a bounded outbound
//! queue drained by a single writer task, so each direction has exactly one
//! owner.

use crate::hub::{next_connection_id, Connection, Hub};
use crate::server::{Inner, Server};
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_backend::ControlMessage;
use relay_common::protocol::{Envelope, MessageType};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Buffer size of the outbound message queue
const MESSAGE_BUFFER_SIZE: usize = 100;

/// Close code: protocol or parse error
const CLOSE_PROTOCOL_ERROR: u16 = 4400;
/// Close code: authentication refused
const CLOSE_UNAUTHORIZED: u16 = 4401;

/// A frame or close instruction queued for the writer task.
enum Outbound {
    Frame(Envelope),
    Close { code: u16, reason: String },
}

/// The hub-facing side of a websocket session.
pub struct WebsocketSession {
    id: u64,
    token: String,
    outbound: mpsc::Sender<Outbound>,
}

impl WebsocketSession {
    fn new(token: String, outbound: mpsc::Sender<Outbound>) -> Arc<Self> {
        Arc::new(Self {
            id: next_connection_id(),
            token,
            outbound,
        })
    }

    /// Queue a reply frame. Dropped if the writer is gone.
    fn reply(&self, frame: Envelope) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.outbound.try_send(Outbound::Frame(frame))
        {
            tracing::warn!(token = %self.token, "Outbound queue full, dropping reply");
        }
    }

    /// Queue a close frame and let the writer shut the socket.
    fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }
}

impl Connection for WebsocketSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn token(&self) -> &str {
        &self.token
    }

    fn send(&self, channel: &str, payload: &str) {
        match self
            .outbound
            .try_send(Outbound::Frame(Envelope::broadcast(channel, payload)))
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Never block the hub on a slow consumer
                tracing::warn!(token = %self.token, channel = %channel, "Outbound queue full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn process(&self, _command: &ControlMessage) {
        unreachable!("websocket sessions do not consume control messages");
    }
}

/// WebSocket upgrade handler.
///
/// The prepared check runs before the upgrade so an unconfigured server
/// answers with a plain 500 instead of completing the handshake.
pub async fn websocket_handler(
    State(server): State<Arc<Server>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(inner) = server.inner() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "prepare() not called on relay server")
            .into_response();
    };

    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(server, inner, socket))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Drive one websocket connection from handshake to cleanup.
async fn handle_socket(server: Arc<Server>, inner: Arc<Inner>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // Expect an auth frame first
    let auth = match read_first_frame(&mut stream).await {
        Ok(Some(frame)) => frame,
        // Peer went away before authenticating
        Ok(None) => return,
        Err(reason) => {
            close_socket(&mut sink, CLOSE_PROTOCOL_ERROR, &reason).await;
            return;
        }
    };

    if !auth.is(MessageType::Auth) {
        let frame = Envelope::of(MessageType::AuthError).with_reason("Auth expected");
        write_frame(&mut sink, &frame).await.ok();
        close_socket(&mut sink, CLOSE_UNAUTHORIZED, "Auth expected").await;
        return;
    }

    if !server.allows_connect(&auth) {
        let frame = Envelope::of(MessageType::AuthError).with_reason("Unauthorized");
        write_frame(&mut sink, &frame).await.ok();
        close_socket(&mut sink, CLOSE_UNAUTHORIZED, "Unauthorized").await;
        return;
    }

    let token = Uuid::new_v4().to_string();
    if let Err(e) = inner.backend.store_session(&token, &auth).await {
        tracing::error!(error = %e, "Failed to store session");
        write_frame(&mut sink, &Envelope::of(MessageType::ServerError))
            .await
            .ok();
        let _ = sink.close().await;
        return;
    }

    if write_frame(&mut sink, &Envelope::of(MessageType::AuthOk))
        .await
        .is_err()
    {
        inner.backend.delete_session(&token).await.ok();
        return;
    }

    tracing::info!(token = %token, "WebSocket session established");

    let (outbound_tx, mut outbound_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
    let session = WebsocketSession::new(token.clone(), outbound_tx);
    inner.hub.connect(session.clone()).await;

    // Single writer for this socket
    let writer = tokio::spawn(async move {
        while let Some(item) = outbound_rx.recv().await {
            match item {
                Outbound::Frame(frame) => {
                    if write_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    close_socket(&mut sink, code, &reason).await;
                    return;
                }
            }
        }
        let _ = sink.close().await;
    });

    serve(&server, &inner.hub, &session, &auth, &mut stream).await;

    // Cleanup runs exactly once, whichever side closed first
    if let Err(e) = inner.backend.delete_session(&token).await {
        tracing::warn!(token = %token, error = %e, "Failed to delete session");
    }
    if let Err(e) = inner.hub.disconnect(&*session).await {
        tracing::warn!(token = %token, error = %e, "Hub disconnect failed");
    }

    // Dropping the last sender ends the writer task
    drop(session);
    let _ = writer.await;

    tracing::info!(token = %token, "WebSocket session closed");
}

/// The serve loop: classify each inbound frame by its type.
async fn serve(
    server: &Server,
    hub: &Hub,
    session: &Arc<WebsocketSession>,
    auth: &Envelope,
    stream: &mut SplitStream<WebSocket>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match Envelope::from_json(text.as_str()) {
                Ok(request) => handle_frame(server, hub, session, auth, request).await,
                Err(e) => {
                    session.close(CLOSE_PROTOCOL_ERROR, &e.to_string());
                    return;
                }
            },
            Ok(Message::Binary(_)) => {
                session.close(CLOSE_PROTOCOL_ERROR, "Binary frames not supported");
                return;
            }
            // axum answers pings; the read itself is the keep-alive
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => return,
            Err(e) => {
                session.close(CLOSE_PROTOCOL_ERROR, &e.to_string());
                return;
            }
        }
    }
}

/// Handle one classified client frame.
async fn handle_frame(
    server: &Server,
    hub: &Hub,
    session: &Arc<WebsocketSession>,
    auth: &Envelope,
    request: Envelope,
) {
    match request.message_type() {
        Some(MessageType::Subscribe) => {
            let channel = request.channel();
            if !server.allows_subscribe(auth, channel) {
                session.reply(
                    Envelope::of(MessageType::SubscribeError)
                        .with_channel(channel)
                        .with_reason("Channel refused"),
                );
                return;
            }

            match hub.subscribe(&**session, channel).await {
                Ok(()) => {
                    session.reply(Envelope::of(MessageType::SubscribeOk).with_channel(channel));
                }
                Err(e) => session.reply(
                    Envelope::of(MessageType::SubscribeError)
                        .with_channel(channel)
                        .with_reason(&e.to_string()),
                ),
            }
        }

        Some(MessageType::Unsubscribe) => {
            let channel = request.channel();
            match hub.unsubscribe(&**session, channel).await {
                Ok(()) => {
                    session.reply(Envelope::of(MessageType::UnsubscribeOk).with_channel(channel));
                }
                Err(e) => session.reply(
                    Envelope::of(MessageType::UnsubscribeError)
                        .with_channel(channel)
                        .with_reason(&e.to_string()),
                ),
            }
        }

        // The read itself refreshed the connection
        Some(MessageType::Ping) => {}

        _ => session.reply(Envelope::of(MessageType::Unknown)),
    }
}

/// Read frames until the first text frame, a close, or an error.
async fn read_first_frame(stream: &mut SplitStream<WebSocket>) -> Result<Option<Envelope>, String> {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                return Envelope::from_json(text.as_str())
                    .map(Some)
                    .map_err(|e| e.to_string());
            }
            Ok(Message::Binary(_)) => return Err("Binary frames not supported".to_string()),
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => return Ok(None),
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(None)
}

async fn write_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Envelope,
) -> Result<(), axum::Error> {
    let json = frame.to_json().map_err(axum::Error::new)?;
    sink.send(Message::Text(json.into())).await
}

async fn close_socket(sink: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relay_backend::{BusControl, SubscriberError};
    use relay_common::GatewayConfig;

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

    fn harness() -> (Server, Arc<Hub>, Arc<WebsocketSession>, mpsc::Receiver<Outbound>) {
        let server = Server::new(GatewayConfig::default());
        let hub = Arc::new(Hub::new(Arc::new(AllowBus), "broadcaster"));
        let (tx, rx) = mpsc::channel(16);
        let session = WebsocketSession::new("tok-1".to_string(), tx);
        (server, hub, session, rx)
    }

    fn frame(rx: &mut mpsc::Receiver<Outbound>) -> Envelope {
        match rx.try_recv().expect("expected a queued reply") {
            Outbound::Frame(frame) => frame,
            Outbound::Close { code, .. } => panic!("unexpected close {code}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_replies_ok() {
        let (server, hub, session, mut rx) = harness();
        hub.connect(session.clone()).await;

        let request = Envelope::of(MessageType::Subscribe).with_channel("test");
        handle_frame(&server, &hub, &session, &Envelope::default(), request).await;

        let reply = frame(&mut rx);
        assert!(reply.is(MessageType::SubscribeOk));
        assert_eq!(reply.channel(), "test");
        assert_eq!(reply.result_id(), "subscribe_test");
        assert!(hub.is_subscribed(&*session, "test").await);
    }

    #[tokio::test]
    async fn test_subscribe_refused_by_predicate() {
        let (server, hub, session, mut rx) = harness();
        let server = server.with_can_subscribe(|_auth, channel| channel != "secret");
        hub.connect(session.clone()).await;

        let request = Envelope::of(MessageType::Subscribe).with_channel("secret");
        handle_frame(&server, &hub, &session, &Envelope::default(), request).await;

        let reply = frame(&mut rx);
        assert!(reply.is(MessageType::SubscribeError));
        assert_eq!(reply.reason(), "Channel refused");
        assert!(!hub.is_subscribed(&*session, "secret").await);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (server, hub, session, mut rx) = harness();
        hub.connect(session.clone()).await;

        // Never subscribed: still an ok
        let request = Envelope::of(MessageType::Unsubscribe).with_channel("test");
        handle_frame(&server, &hub, &session, &Envelope::default(), request).await;

        let reply = frame(&mut rx);
        assert!(reply.is(MessageType::UnsubscribeOk));
        assert_eq!(reply.result_id(), "unsubscribe_test");
    }

    #[tokio::test]
    async fn test_ping_has_no_reply() {
        let (server, hub, session, mut rx) = harness();
        hub.connect(session.clone()).await;

        handle_frame(
            &server,
            &hub,
            &session,
            &Envelope::default(),
            Envelope::of(MessageType::Ping),
        )
        .await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrecognised_type_replies_unknown() {
        let (server, hub, session, mut rx) = harness();
        hub.connect(session.clone()).await;

        let request = Envelope::default().with_field("__type", "frobnicate");
        handle_frame(&server, &hub, &session, &Envelope::default(), request).await;

        assert!(frame(&mut rx).is(MessageType::Unknown));
    }

    #[tokio::test]
    async fn test_hub_delivery_becomes_a_message_frame() {
        let (_server, hub, session, mut rx) = harness();
        hub.connect(session.clone()).await;
        hub.subscribe(&*session, "test").await.unwrap();

        session.send("test", "Hello");

        let reply = frame(&mut rx);
        assert!(reply.is(MessageType::Message));
        assert_eq!(reply.channel(), "test");
        assert_eq!(reply.body(), "Hello");
    }

    #[tokio::test]
    #[should_panic(expected = "control messages")]
    async fn test_process_is_unreachable() {
        let (_server, _hub, session, _rx) = harness();
        session.process(&ControlMessage::Transfer {
            token: "tok-1".to_string(),
            seq: "1".to_string(),
        });
    }
}
