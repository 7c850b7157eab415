//! Server facade
//!
//! Owns the lifecycle of the backend and the hub, routes HTTP methods to
//! the two session transports, and exposes the connection statistics.

use crate::hub::Hub;
use crate::session::{longpoll_handler, websocket_handler};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use relay_backend::Backend;
use relay_common::protocol::Envelope;
use relay_common::{GatewayConfig, RelayError, RelayResult};
use std::sync::{Arc, OnceLock};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

type ConnectPredicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;
type SubscribePredicate = Box<dyn Fn(&Envelope, &str) -> bool + Send + Sync>;

/// Server statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Number of active connections, across all gateway instances
    pub connections: i64,
}

/// Runtime state created by `prepare()`.
pub struct Inner {
    pub(crate) backend: Arc<Backend>,
    pub(crate) hub: Arc<Hub>,
}

/// The gateway server.
///
/// Construct with a configuration and optional access predicates, call
/// `prepare()`, then serve the router. Requests arriving before
/// `prepare()` are answered with a 500.
pub struct Server {
    config: GatewayConfig,
    can_connect: Option<ConnectPredicate>,
    can_subscribe: Option<SubscribePredicate>,
    inner: OnceLock<Arc<Inner>>,
}

impl Server {
    /// Create an unprepared server. Without predicates every client may
    /// connect and subscribe.
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            can_connect: None,
            can_subscribe: None,
            inner: OnceLock::new(),
        }
    }

    /// Install a connection access predicate, invoked once per auth attempt.
    #[must_use]
    pub fn with_can_connect<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        self.can_connect = Some(Box::new(predicate));
        self
    }

    /// Install a channel access predicate, invoked once per subscribe.
    #[must_use]
    pub fn with_can_subscribe<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Envelope, &str) -> bool + Send + Sync + 'static,
    {
        self.can_subscribe = Some(Box::new(predicate));
        self
    }

    /// Instantiate the backend and the hub and start their loops.
    ///
    /// Idempotent; later calls are no-ops.
    pub async fn prepare(&self) -> RelayResult<()> {
        if self.inner.get().is_some() {
            return Ok(());
        }

        let (backend, messages) =
            Backend::connect(&self.config).map_err(|e| RelayError::Backend(e.to_string()))?;

        let hub = Arc::new(Hub::new(
            backend.clone(),
            self.config.control_channel.clone(),
        ));
        hub.start(messages);

        let _ = self.inner.set(Arc::new(Inner { backend, hub }));

        tracing::info!(
            redis = %self.config.redis_host,
            pubsub = %self.config.pubsub_host,
            control_channel = %self.config.control_channel,
            "Gateway prepared"
        );
        Ok(())
    }

    pub(crate) fn inner(&self) -> Option<Arc<Inner>> {
        self.inner.get().cloned()
    }

    pub(crate) fn allows_connect(&self, auth: &Envelope) -> bool {
        self.can_connect.as_ref().map_or(true, |allow| allow(auth))
    }

    pub(crate) fn allows_subscribe(&self, auth: &Envelope, channel: &str) -> bool {
        self.can_subscribe
            .as_ref()
            .map_or(true, |allow| allow(auth, channel))
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Current server statistics.
    pub async fn stats(&self) -> RelayResult<Stats> {
        let inner = self.inner().ok_or(RelayError::NotPrepared)?;
        let connections = inner
            .backend
            .get_connected()
            .await
            .map_err(|e| RelayError::Backend(e.to_string()))?;
        Ok(Stats { connections })
    }

    /// Build the router: `GET /` upgrades to websocket, `POST /` is a
    /// long-poll request. Mount it under an operator-chosen prefix.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/", get(websocket_handler).post(longpoll_handler))
            .route("/health", get(health_check))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    /// Prepare, bind the configured address, and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> RelayResult<()> {
        self.prepare().await?;

        let addr = self.config.address();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "Gateway listening");

        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("prepared", &self.inner.get().is_some())
            .finish()
    }
}

/// Health check endpoint: pings the backing bus through the pool.
async fn health_check(State(server): State<Arc<Server>>) -> Response {
    let Some(inner) = server.inner() else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "prepare() not called on relay server")
            .into_response();
    };

    match inner.backend.health_check().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "Bus unreachable").into_response()
        }
    }
}
