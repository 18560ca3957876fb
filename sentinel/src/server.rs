//! Thin informational HTTP surface: JSON handlers over core services plus a
//! server-sent-events stream for backtest progress and results. Not part of the
//! decision kernel; handlers only compose existing components.

use crate::{
    AppContext,
    backtest::{
        Backtester, active_backtest, set_active_backtest,
        summary::{BacktestConfig, BacktestEvent},
    },
    error::SentinelError,
    scoring::SellScorer,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::Stream;
use sentinel_broker::Broker;
use sentinel_store::{Store, sqlite::SqliteStore};
use serde_json::{Value, json};
use std::{convert::Infallible, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::{StreamExt, wrappers::BroadcastStream};
use tracing::info;

/// Shared handler state.
#[derive(Clone)]
pub struct ServerState {
    pub ctx: AppContext,
    pub live_store: Arc<SqliteStore>,
    pub events: broadcast::Sender<BacktestEvent>,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

struct ApiError(SentinelError);

impl From<SentinelError> for ApiError {
    fn from(value: SentinelError) -> Self {
        Self(value)
    }
}

impl From<sentinel_store::error::StoreError> for ApiError {
    fn from(value: sentinel_store::error::StoreError) -> Self {
        Self(SentinelError::Store(value))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": self.0.to_string() })),
        )
            .into_response()
    }
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/markets/status", get(markets_status))
        .route("/jobs/schedules", get(job_schedules))
        .route("/jobs/categories", get(job_categories))
        .route("/recommendations", get(recommendations))
        .route("/rebalance/summary", get(rebalance_summary))
        .route("/sell-scores", get(sell_scores))
        .route("/backtest", post(start_backtest))
        .route("/backtest/cancel", post(cancel_backtest))
        .route("/backtest/events", get(backtest_events))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

async fn cache_stats(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let stats = state.ctx.store.cache_stats().await?;
    Ok(Json(json!({ "entries": stats.entries, "expired": stats.expired })))
}

async fn cache_clear(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let cleared = state.ctx.store.cache_clear().await?;
    Ok(Json(json!({ "cleared": cleared })))
}

async fn markets_status(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let cached = state.ctx.store.cache_get("markets:status").await?;
    let status = cached
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_else(|| json!({}));
    Ok(Json(status))
}

async fn job_schedules(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let schedules = state.ctx.store.job_schedules().await?;
    Ok(Json(serde_json::to_value(schedules).map_err(SentinelError::Serde)?))
}

async fn job_categories(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let schedules = state.ctx.store.job_schedules().await?;
    let mut categories: Vec<String> = schedules
        .into_iter()
        .map(|schedule| schedule.category)
        .collect();
    categories.sort();
    categories.dedup();
    Ok(Json(json!({ "categories": categories })))
}

async fn recommendations(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let recommendations = state.ctx.planner.get_recommendations(None, None).await?;
    Ok(Json(serde_json::to_value(recommendations).map_err(SentinelError::Serde)?))
}

async fn rebalance_summary(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let summary = state.ctx.planner.rebalance_summary().await?;
    Ok(Json(serde_json::to_value(summary).map_err(SentinelError::Serde)?))
}

async fn sell_scores(State(state): State<ServerState>) -> Result<Json<Value>, ApiError> {
    let scorer = SellScorer::new(
        Arc::clone(&state.ctx.store),
        state.ctx.portfolio.clone(),
        state.ctx.currency.clone(),
        state.ctx.settings.clone(),
    );
    let scores = scorer.score_all(None).await?;
    Ok(Json(serde_json::to_value(scores).map_err(SentinelError::Serde)?))
}

/// Start a backtest. One at a time: a second request while one is active is
/// rejected with 409.
async fn start_backtest(
    State(state): State<ServerState>,
    Json(config): Json<BacktestConfig>,
) -> Response {
    if active_backtest().is_some() {
        return (
            StatusCode::CONFLICT,
            Json(json!({ "error": "backtest already running" })),
        )
            .into_response();
    }

    let backtester = Backtester::new(
        config,
        Arc::clone(&state.live_store),
        Arc::clone(&state.ctx.broker) as Arc<dyn Broker>,
    );
    set_active_backtest(Some(backtester.handle()));

    let (tx, mut rx) = mpsc::channel::<BacktestEvent>(64);
    let broadcast_tx = state.events.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let _ = broadcast_tx.send(event);
        }
    });
    tokio::spawn(async move {
        backtester.run(tx).await;
    });

    info!("backtest started");
    (StatusCode::ACCEPTED, Json(json!({ "status": "started" }))).into_response()
}

async fn cancel_backtest() -> Response {
    match active_backtest() {
        Some(handle) => {
            handle.cancel();
            (StatusCode::OK, Json(json!({ "status": "cancelling" }))).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no active backtest" })),
        )
            .into_response(),
    }
}

/// SSE stream of `progress`, `result` and `error` events with JSON payloads.
async fn backtest_events(
    State(state): State<ServerState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(|event| {
        let event = event.ok()?;
        let (name, payload) = match &event {
            BacktestEvent::Progress(progress) => {
                ("progress", serde_json::to_string(progress).ok()?)
            }
            BacktestEvent::Result(result) => ("result", serde_json::to_string(result).ok()?),
            BacktestEvent::Error { message } => {
                ("error", json!({ "message": message }).to_string())
            }
        };
        Some(Ok(Event::default().event(name).data(payload)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
