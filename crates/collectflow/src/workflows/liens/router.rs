use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use super::deadlines::{calculate_lien_deadlines, LienError};
use super::notice::NoticeId;
use super::service::{
    CarrierAck, CarrierOutcome, IssueNotice, NoticeError, NoticeRepository, NoticeService,
};
use super::webhook::{verify_signature, CarrierEvent, SIGNATURE_HEADER};
use crate::workflows::clock::Clock;
use crate::workflows::collections::domain::OrganizationId;
use crate::workflows::store::RepositoryError;

pub struct LiensApi<R> {
    pub notices: NoticeService<R>,
    pub clock: Arc<dyn Clock>,
    pub carrier_secret: Option<String>,
}

impl<R> LiensApi<R>
where
    R: NoticeRepository + 'static,
{
    pub fn new(repository: Arc<R>, clock: Arc<dyn Clock>, carrier_secret: Option<String>) -> Self {
        Self {
            notices: NoticeService::new(repository),
            clock,
            carrier_secret,
        }
    }
}

/// Router builder for the deadline calculator, notices, and carrier callbacks.
pub fn liens_router<R>(api: Arc<LiensApi<R>>) -> Router
where
    R: NoticeRepository + 'static,
{
    Router::new()
        .route("/api/v1/liens/deadlines", post(deadlines_handler::<R>))
        .route("/api/v1/liens/notices", post(issue_handler::<R>))
        .route("/api/v1/liens/notices/:notice_id", get(notice_handler::<R>))
        .route("/api/v1/webhooks/carrier", post(carrier_webhook_handler::<R>))
        .with_state(api)
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeadlineQuery {
    pub state: String,
    pub first_work_date: NaiveDate,
    pub last_work_date: NaiveDate,
    #[serde(default)]
    pub today: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NoticeScope {
    pub organization_id: OrganizationId,
}

pub(crate) async fn deadlines_handler<R>(
    State(api): State<Arc<LiensApi<R>>>,
    query: Result<Json<DeadlineQuery>, JsonRejection>,
) -> Response
where
    R: NoticeRepository + 'static,
{
    let query = match query {
        Ok(Json(query)) => query,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    let today = query.today.unwrap_or_else(|| api.clock.now().date_naive());
    match calculate_lien_deadlines(&query.state, query.first_work_date, query.last_work_date, today)
    {
        Ok(deadlines) => (StatusCode::OK, Json(deadlines)).into_response(),
        Err(err) => lien_error_response(&err),
    }
}

pub(crate) async fn issue_handler<R>(
    State(api): State<Arc<LiensApi<R>>>,
    request: Result<Json<IssueNotice>, JsonRejection>,
) -> Response
where
    R: NoticeRepository + 'static,
{
    let request = match request {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match api.notices.issue(request, api.clock.now()) {
        Ok(notice) => (StatusCode::CREATED, Json(notice)).into_response(),
        Err(err) => notice_error_response(err),
    }
}

pub(crate) async fn notice_handler<R>(
    State(api): State<Arc<LiensApi<R>>>,
    Path(notice_id): Path<String>,
    scope: Result<Query<NoticeScope>, QueryRejection>,
) -> Response
where
    R: NoticeRepository + 'static,
{
    let scope = match scope {
        Ok(Query(scope)) => scope,
        Err(rejection) => return bad_request(rejection.body_text()),
    };
    match api.notices.get(&scope.organization_id, &NoticeId(notice_id)) {
        Ok(notice) => (StatusCode::OK, Json(notice)).into_response(),
        Err(err) => notice_error_response(err),
    }
}

/// Verifies the signature over the raw body before anything is parsed or changed.
pub(crate) async fn carrier_webhook_handler<R>(
    State(api): State<Arc<LiensApi<R>>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response
where
    R: NoticeRepository + 'static,
{
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = verify_signature(api.carrier_secret.as_deref(), &body, signature) {
        warn!(error = %err, "carrier webhook rejected");
        let payload = json!({ "error": err.to_string() });
        return (StatusCode::UNAUTHORIZED, Json(payload)).into_response();
    }

    let ack = match serde_json::from_slice::<CarrierEvent>(&body) {
        Ok(event) => match api.notices.handle_carrier_event(event, api.clock.now()) {
            Ok(ack) => ack,
            Err(err) => {
                error!(error = %err, "carrier webhook processing failed");
                CarrierAck::unmatched(CarrierOutcome::Unmatched)
            }
        },
        Err(err) => {
            warn!(error = %err, "carrier webhook payload could not be parsed");
            CarrierAck::unmatched(CarrierOutcome::InvalidPayload)
        }
    };
    (StatusCode::OK, Json(ack)).into_response()
}

fn lien_error_response(err: &LienError) -> Response {
    bad_request(err.to_string())
}

fn bad_request(message: String) -> Response {
    let payload = json!({ "error": message });
    (StatusCode::BAD_REQUEST, Json(payload)).into_response()
}

fn notice_error_response(err: NoticeError) -> Response {
    let status = match &err {
        NoticeError::Lien(_) => StatusCode::BAD_REQUEST,
        NoticeError::NotFound(_) | NoticeError::Repository(RepositoryError::NotFound) => {
            StatusCode::NOT_FOUND
        }
        NoticeError::DuplicateTracking(_) | NoticeError::Repository(RepositoryError::Conflict) => {
            StatusCode::CONFLICT
        }
        NoticeError::Repository(RepositoryError::Unavailable(_)) => {
            error!(error = %err, "notice repository unavailable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let payload = json!({ "error": err.to_string() });
    (status, Json(payload)).into_response()
}
