use std::{
    sync::Arc,
    time::Instant,
};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderValue, Method, StatusCode},
    middleware,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use service::{Engine, stats::Stats};
use tokio::net::TcpListener;

use crate::{config::Config, hub::Hub};

pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Arc<Hub>,
    pub stats: Arc<Stats>,
    pub engine: Option<Engine>,
    pub uptime: Instant,
}

/// Builds the shared http/websocket surface: health and status pages
/// for operators, the signaling channel for browser peers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/health",
            get(|State(state): State<Arc<AppState>>| async move {
                Json(json!({
                    "status": "ok",
                    "software": concat!(env!("CARGO_PKG_NAME"), ":", env!("CARGO_PKG_VERSION")),
                    "uptime": state.uptime.elapsed().as_secs(),
                    "sslEnabled": state.config.server.enable_ssl,
                    "sipGateway": state.config.sip.enabled,
                    "peerCount": state.hub.peer_count(),
                    "callCount": state.engine.as_ref().map(|e| e.active_calls()).unwrap_or(0),
                    "relayMetrics": state.stats.snapshot(),
                }))
            }),
        )
        .route(
            "/",
            get(|State(state): State<Arc<AppState>>| async move {
                Html(format!(
                    concat!(
                        "<html><body><h1>{}</h1>",
                        "<p>peers: {}, active calls: {}, uptime: {}s</p>",
                        "<p>signaling endpoint: <code>/ws</code></p>",
                        "</body></html>",
                    ),
                    env!("CARGO_PKG_NAME"),
                    state.hub.peer_count(),
                    state.engine.as_ref().map(|e| e.active_calls()).unwrap_or(0),
                    state.uptime.elapsed().as_secs(),
                ))
            }),
        )
        .route(
            "/ws",
            get(
                |State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade| async move {
                    let hub = state.hub.clone();
                    upgrade
                        .max_message_size(1 << 20)
                        .on_upgrade(move |socket| hub.serve(socket))
                },
            ),
        )
        .fallback(preflight)
        .layer(middleware::map_response(cors))
        .with_state(state)
}

/// Answers CORS preflights anywhere; anything else unknown is 404.
async fn preflight(method: Method) -> Response {
    if method == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn cors(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert("Access-Control-Allow-Origin", HeaderValue::from_static("*"));
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    response
}

pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    log::info!("http server listening={:?}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
