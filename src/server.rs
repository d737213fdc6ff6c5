use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::Engine;

#[derive(Clone)]
pub struct AppState {
    engine: Arc<Engine>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PoolQuery {
    #[serde(default)]
    pub desc: bool,
}

/// Read-only view of a running engine, plus a stop button.
pub fn router(engine: Arc<Engine>) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/pool", get(get_pool))
        .route("/stop", post(post_stop))
        .with_state(AppState { engine });

    Router::new()
        .nest("/api", api)
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(TraceLayer::new_for_http())
}

/// Serve the API until the engine stops.
pub async fn serve(bind: &str, engine: Arc<Engine>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding status API to {bind}"))?;
    info!("status API on http://{}", listener.local_addr()?);

    let shutdown = Arc::clone(&engine);
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.stopped().await })
        .await
        .context("status API")?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.engine.status())
}

async fn get_pool(State(app): State<AppState>, Query(q): Query<PoolQuery>) -> impl IntoResponse {
    Json(app.engine.available_ips(q.desc))
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    app.engine.stop();
    (StatusCode::ACCEPTED, Json(app.engine.status()))
}
