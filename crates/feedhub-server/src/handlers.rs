//! HTTP and WebSocket handlers for the feedhub server.
//!
//! The feed-counter endpoint authenticates the session, upgrades, registers
//! the connection with the hub and then drives its two pumps until either side
//! goes away.

use crate::config::{Config, RendererKind};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::session::{Session, SessionProvider};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use feedhub_core::{Feed, Hub, HubStats, MemoryFeedStore};
use feedhub_protocol::{CounterRenderer, HtmlCounterRenderer, JsonCounterRenderer};
use feedhub_transport::WebSocketTransport;
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// The feed-notification hub.
    pub hub: Hub,
    /// Feed storage.
    pub store: Arc<MemoryFeedStore>,
    /// API key sessions.
    pub sessions: SessionProvider,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state. The store notifies the hub on every insert.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let renderer: Arc<dyn CounterRenderer> = match config.websocket.renderer {
            RendererKind::Html => {
                let html = HtmlCounterRenderer::new(config.websocket.element_id.clone());
                info!(element_id = html.element_id(), "Rendering htmx feed badge");
                Arc::new(html)
            }
            RendererKind::Json => {
                info!("Rendering JSON feed counter");
                Arc::new(JsonCounterRenderer)
            }
        };

        let store = Arc::new(MemoryFeedStore::new());
        let hub = Hub::new(config.hub.to_hub_config(), store.clone(), renderer);
        store.attach_broadcaster(hub.broadcaster());

        let sessions = SessionProvider::from_users(&config.users);
        if sessions.user_count() == 0 {
            warn!("No users configured, every request will be rejected");
        }

        Self {
            hub,
            store,
            sessions,
            config,
        }
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<Session, ApiError> {
        self.sessions
            .authenticate(headers)
            .ok_or(ApiError::Unauthorized)
    }
}

/// Request errors.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or unknown API key.
    #[error("Missing or unknown API key")]
    Unauthorized,

    /// The feed kind is empty.
    #[error("Feed kind must not be empty")]
    EmptyKind,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EmptyKind => StatusCode::UNPROCESSABLE_ENTITY,
        };
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

/// Body of `POST /api/feeds`.
#[derive(Debug, Deserialize)]
pub struct NewFeed {
    /// Activity kind.
    pub kind: String,
    /// Kind-specific payload.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Build the HTTP router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.websocket.path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/feeds", post(create_feed_handler))
        .route("/api/feeds/seen", post(mark_seen_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("feedhub listening on {}", addr);
    info!(
        "Feed-counter endpoint: ws://{}{}",
        addr, config.websocket.path
    );

    serve(listener, state, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves.
///
/// Runs the hub alongside the HTTP server; on shutdown the hub closes every
/// feed-counter connection before this returns.
///
/// # Errors
///
/// Returns an error if serving fails or the hub cannot run.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let hub = state.hub.clone();
    let hub_task = tokio::spawn(async move { hub.run(shutdown_rx).await });

    let reporter = state.config.metrics.enabled.then(|| {
        let period = Duration::from_millis(state.config.metrics.stats_interval_ms.max(1));
        metrics::spawn_stats_reporter(state.hub.clone(), period)
    });

    let app = router(state);
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        info!("Shutdown requested");
        shutdown_tx.send_replace(true);
    })
    .await;

    if let Some(reporter) = reporter {
        reporter.abort();
    }

    hub_task.await.context("Hub task panicked")??;
    served.context("Server error")?;

    info!("feedhub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.hub.connection_count(),
    }))
}

/// Hub statistics handler.
async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<HubStats> {
    Json(state.hub.stats())
}

/// Insert a feed item for the session user.
async fn create_feed_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NewFeed>,
) -> Result<(StatusCode, Json<Feed>), ApiError> {
    let session = state.authenticate(&headers)?;
    if body.kind.trim().is_empty() {
        return Err(ApiError::EmptyKind);
    }

    let feed = state.store.insert(body.kind, body.data, session.user_id).await;
    metrics::record_feed(&feed.kind);
    info!(user_id = session.user_id, feed = feed.id, kind = %feed.kind, "Feed created");

    Ok((StatusCode::CREATED, Json(feed)))
}

/// Mark every stored feed as seen by the session user.
///
/// Open connections keep the watermark they were registered with.
async fn mark_seen_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiError> {
    let session = state.authenticate(&headers)?;
    let latest = state.store.latest_id().await.unwrap_or(0);
    let last_feed = state
        .sessions
        .mark_seen(session.user_id, latest)
        .ok_or(ApiError::Unauthorized)?;

    debug!(user_id = session.user_id, last_feed, "Feeds marked as seen");
    Ok(Json(Session {
        last_feed,
        ..session
    }))
}

/// Feed-counter WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let session = match state.authenticate(&headers) {
        Ok(session) => session,
        Err(e) => {
            debug!(remote = %addr, "Rejected feed-counter upgrade");
            metrics::record_error("unauthorized");
            return Err(e);
        }
    };

    let max_message_size = state.config.websocket.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, addr, session, state))
        .into_response())
}

/// Drive one feed-counter connection until it ends.
async fn handle_websocket(
    socket: WebSocket,
    addr: SocketAddr,
    session: Session,
    state: Arc<AppState>,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let transport = WebSocketTransport::new(socket)
        .with_remote_addr(addr)
        .with_max_message_size(state.config.websocket.max_message_size);

    let connection = match state
        .hub
        .register(session.user_id, session.last_feed, Box::new(transport))
        .await
    {
        Ok(connection) => connection,
        Err(e) => {
            error!(user_id = session.user_id, error = %e, "Failed to register connection");
            metrics::record_error("register");
            return;
        }
    };

    debug!(
        user_id = session.user_id,
        connection = %connection.id(),
        remote = %addr,
        "WebSocket connected"
    );

    tokio::spawn(connection.clone().write_pump());
    connection.clone().read_pump(state.hub.clone()).await;

    debug!(
        user_id = session.user_id,
        connection = %connection.id(),
        "WebSocket disconnected"
    );
}
