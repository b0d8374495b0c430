use axum::{
    extract::{Path, Query, State as AxumState},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use punchcard_types::api::{
    DetailsResponse, ErrorResponse, FinishRequest, LeaderboardQuery, LeaderboardResponse,
    SubmitProgressRequest, WalletUpdateResponse,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::metrics::render_prometheus;
use crate::{Tracker, TrackerError, Upserted};

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn config(AxumState(tracker): AxumState<Arc<Tracker>>) -> Response {
    Json(tracker.config.clone()).into_response()
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Map a tracker failure onto a status code, counting it on the way.
fn tracker_error(tracker: &Tracker, err: TrackerError) -> Response {
    match err {
        TrackerError::Verification(err) => {
            tracker.http_metrics().inc_reject_verification();
            tracing::debug!("rejected token: {err}");
            error_body(StatusCode::UNAUTHORIZED, "Invalid token")
        }
        TrackerError::Invalid(err) => {
            tracker.http_metrics().inc_reject_invalid();
            error_body(StatusCode::BAD_REQUEST, err.to_string())
        }
        err @ (TrackerError::Storage(_) | TrackerError::Task(_)) => {
            tracker.http_metrics().inc_storage_error();
            tracing::error!("wallet store failure: {err}");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

fn update_response(upserted: Upserted, inserted: &str, updated: &str) -> Response {
    let message = if upserted.created { inserted } else { updated };
    Json(WalletUpdateResponse {
        message: message.to_string(),
        created: upserted.created,
        wallet: upserted.record,
    })
    .into_response()
}

pub(super) async fn submit_progress(
    AxumState(tracker): AxumState<Arc<Tracker>>,
    Json(request): Json<SubmitProgressRequest>,
) -> Response {
    let start = Instant::now();
    let response = match tracker.submit_progress(&request.token).await {
        Ok(upserted) => update_response(
            upserted,
            "Wallet data inserted successfully",
            "Wallet data updated successfully",
        ),
        Err(err) => tracker_error(&tracker, err),
    };
    tracker.http_metrics().record_submit(start.elapsed());
    response
}

pub(super) async fn submit_finish(
    AxumState(tracker): AxumState<Arc<Tracker>>,
    Json(request): Json<FinishRequest>,
) -> Response {
    let start = Instant::now();
    let response = match tracker
        .submit_finish(&request.wallet_address, request.win_delta)
        .await
    {
        Ok(upserted) => update_response(upserted, "Win recorded", "Win recorded"),
        Err(err) => tracker_error(&tracker, err),
    };
    tracker.http_metrics().record_finish(start.elapsed());
    response
}

pub(super) async fn wallet_details(
    AxumState(tracker): AxumState<Arc<Tracker>>,
    Path(address): Path<String>,
) -> Response {
    let start = Instant::now();
    let response = match tracker.details(&address).await {
        Ok(wallet) => Json(DetailsResponse { wallet }).into_response(),
        Err(err) => tracker_error(&tracker, err),
    };
    tracker.http_metrics().record_details(start.elapsed());
    response
}

pub(super) async fn leaderboard(
    AxumState(tracker): AxumState<Arc<Tracker>>,
    Query(query): Query<LeaderboardQuery>,
) -> Response {
    let start = Instant::now();
    let response = match tracker.leaderboard(query.limit).await {
        Ok(wallets) => Json(LeaderboardResponse { wallets }).into_response(),
        Err(err) => tracker_error(&tracker, err),
    };
    tracker.http_metrics().record_leaderboard(start.elapsed());
    response
}

pub(super) async fn http_metrics(
    headers: HeaderMap,
    AxumState(tracker): AxumState<Arc<Tracker>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(tracker.http_metrics_snapshot()).into_response()
}

pub(super) async fn referral_metrics(
    headers: HeaderMap,
    AxumState(tracker): AxumState<Arc<Tracker>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    Json(tracker.referral_metrics_snapshot()).into_response()
}

pub(super) async fn prometheus_metrics(
    headers: HeaderMap,
    AxumState(tracker): AxumState<Arc<Tracker>>,
) -> Response {
    if let Some(status) = metrics_auth_error(&headers) {
        return status.into_response();
    }
    let body = render_prometheus(
        &tracker.http_metrics_snapshot(),
        &tracker.referral_metrics_snapshot(),
    );
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4"),
        )],
        body,
    )
        .into_response()
}

fn metrics_auth_error(headers: &HeaderMap) -> Option<StatusCode> {
    let token = std::env::var("METRICS_AUTH_TOKEN").unwrap_or_default();
    if token.is_empty() {
        return None;
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_token = headers
        .get("x-metrics-token")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if bearer.as_deref() == Some(token.as_str()) || header_token.as_deref() == Some(token.as_str()) {
        None
    } else {
        Some(StatusCode::UNAUTHORIZED)
    }
}
