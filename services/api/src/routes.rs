use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use collectflow::workflows::collections::{
    collections_router, ChannelSender, CollectionsApi, CollectionsRepository,
};
use collectflow::workflows::liens::{liens_router, LiensApi, NoticeRepository};
use serde_json::json;
use std::sync::Arc;

/// Collections and lien endpoints plus the health and metrics endpoints.
pub(crate) fn app_router<R, C>(
    collections: Arc<CollectionsApi<R, C>>,
    liens: Arc<LiensApi<R>>,
) -> Router
where
    R: CollectionsRepository + NoticeRepository + 'static,
    C: ChannelSender + 'static,
{
    collections_router(collections)
        .merge(liens_router(liens))
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
