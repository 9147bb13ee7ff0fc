use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::queue::LogProducer;
use crate::store::{DayWindow, EventStore, PathViews};

use super::{error_response, ApiState};

#[derive(Debug, Default, Deserialize)]
pub(super) struct StatsParams {
    #[serde(default)]
    site_id: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    site_id: String,
    date: String,
    total_views: u64,
    unique_users: u64,
    top_paths: Vec<PathViews>,
}

/// GET /stats?site_id=..&date=YYYY-MM-DD - daily aggregates for one site.
pub(super) async fn stats_handler<P, S>(
    State(state): State<Arc<ApiState<P, S>>>,
    Query(params): Query<StatsParams>,
) -> Response
where
    P: LogProducer + 'static,
    S: EventStore + 'static,
{
    let response = stats(&state, params).await;

    if let Some(h) = &state.health {
        h.stats_requests
            .with_label_values(&[response.status().as_str()])
            .inc();
    }

    response
}

async fn stats<P, S>(state: &ApiState<P, S>, params: StatsParams) -> Response
where
    P: LogProducer,
    S: EventStore,
{
    let (site_id, date) = match (params.site_id, params.date) {
        (Some(site_id), Some(date)) if !site_id.is_empty() && !date.is_empty() => (site_id, date),
        _ => return error_response(StatusCode::BAD_REQUEST, "site_id and date are required"),
    };

    let Some(window) = parse_day(&date).and_then(DayWindow::for_date) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid date format. Use YYYY-MM-DD");
    };

    let totals = match state.store.site_stats(&site_id, window).await {
        Ok(totals) => totals,
        Err(e) => {
            tracing::error!(site_id = %site_id, date = %date, error = %format!("{e:#}"), "Querying site stats");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to retrieve stats");
        }
    };

    let top_paths = match state.store.top_paths(&site_id, window).await {
        Ok(top) => top,
        Err(e) => {
            tracing::error!(site_id = %site_id, date = %date, error = %format!("{e:#}"), "Querying top paths");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to retrieve top paths",
            );
        }
    };

    (
        StatusCode::OK,
        Json(StatsResponse {
            site_id,
            date,
            total_views: totals.total_views,
            unique_users: totals.unique_users,
            top_paths,
        }),
    )
        .into_response()
}

/// Parses a strict `YYYY-MM-DD` date: four-digit year, zero-padded month and day.
fn parse_day(date: &str) -> Option<NaiveDate> {
    let bytes = date.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        });
    if !shape_ok {
        return None;
    }

    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}
