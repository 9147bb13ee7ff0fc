//! Public HTTP API: event intake, stats reporting and the dashboard page.

mod stats;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::health::{bind_address, HealthMetrics};
use crate::ingress::{Ingress, SubmitError};
use crate::queue::LogProducer;
use crate::store::EventStore;

const DASHBOARD: &str = include_str!("ui/index.html");

/// Shared state for the API handlers.
pub struct ApiState<P, S> {
    pub ingress: Ingress<P>,
    pub store: Arc<S>,
    pub health: Option<Arc<HealthMetrics>>,
}

/// Builds the API router.
pub fn router<P, S>(state: Arc<ApiState<P, S>>) -> Router
where
    P: LogProducer + 'static,
    S: EventStore + 'static,
{
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/events", post(submit_handler::<P, S>))
        .route("/stats", get(stats::stats_handler::<P, S>))
        .with_state(state)
}

/// Binds `addr` and serves `app` until `cancel` fires.
pub async fn serve(
    addr: &str,
    app: Router,
    cancel: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let bind_addr = bind_address(addr, ":8080");

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("listening on {bind_addr}"))?;

    let local_addr = listener.local_addr().context("getting local address")?;

    let handle = tokio::spawn(async move {
        tracing::info!(addr = %local_addr, "API server started");

        let result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

        if let Err(e) = result {
            tracing::error!(error = %e, "API server error");
        }
    });

    Ok((local_addr, handle))
}

/// GET / - dashboard page.
async fn dashboard_handler() -> Html<&'static str> {
    Html(DASHBOARD)
}

/// POST /events - validate and queue one event.
async fn submit_handler<P, S>(State(state): State<Arc<ApiState<P, S>>>, body: Bytes) -> Response
where
    P: LogProducer + 'static,
    S: EventStore + 'static,
{
    match state.ingress.submit(&body).await {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(json!({ "message": "Event accepted" })),
        )
            .into_response(),
        Err(SubmitError::Validation(e)) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(SubmitError::Queue(_)) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to queue event")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
