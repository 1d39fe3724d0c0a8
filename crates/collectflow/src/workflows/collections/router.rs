use std::sync::Arc;

use axum::{
    extract::{
        rejection::{FormRejection, JsonRejection},
        Path, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Form, Json, Router,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use tracing::{error, warn};

use super::dispatcher::Dispatcher;
use super::domain::{EnrollmentId, OrganizationId, SequenceId, TerminationReason};
use super::enrollment::{EnrollRequest, EnrollmentMode, EnrollmentService, EnrollmentServiceError};
use super::inbound::{InboundEmail, InboundService, InboundSms};
use super::repository::{ChannelSender, CollectionsRepository};
use crate::config::DispatcherConfig;
use crate::workflows::clock::Clock;
use crate::workflows::store::RepositoryError;

const EMPTY_TWIML: &str = "<Response></Response>";
const CRON_DIGEST_KEY: &[u8] = b"collectflow-dispatch-trigger";

type HmacSha256 = Hmac<Sha256>;

/// Shared state behind the collections endpoints.
pub struct CollectionsApi<R, C> {
    pub enrollments: EnrollmentService<R>,
    pub dispatcher: Dispatcher<R, C>,
    pub inbound: InboundService<R, C>,
    pub clock: Arc<dyn Clock>,
    /// When set, the dispatch trigger requires `Authorization: Bearer <secret>`.
    pub cron_secret: Option<String>,
}

impl<R, C> CollectionsApi<R, C>
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    pub fn new(
        repository: Arc<R>,
        sender: Arc<C>,
        clock: Arc<dyn Clock>,
        dispatcher: DispatcherConfig,
        cron_secret: Option<String>,
    ) -> Self {
        Self {
            enrollments: EnrollmentService::new(repository.clone()),
            dispatcher: Dispatcher::new(repository.clone(), sender.clone(), dispatcher),
            inbound: InboundService::new(repository, sender),
            clock,
            cron_secret,
        }
    }
}

/// Router builder for enrollment, dispatch, and reply webhooks.
pub fn collections_router<R, C>(api: Arc<CollectionsApi<R, C>>) -> Router
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    Router::new()
        .route("/api/v1/collections/enroll", post(enroll_handler::<R, C>))
        .route(
            "/api/v1/collections/enrollments/:enrollment_id/terminate",
            post(terminate_handler::<R, C>),
        )
        .route(
            "/api/v1/collections/enrollments/:enrollment_id/pause",
            post(pause_handler::<R, C>),
        )
        .route(
            "/api/v1/collections/enrollments/:enrollment_id/resume",
            post(resume_handler::<R, C>),
        )
        .route("/api/v1/collections/dispatch", post(dispatch_handler::<R, C>))
        .route("/api/v1/webhooks/sms", post(sms_webhook_handler::<R, C>))
        .route("/api/v1/webhooks/email", post(email_webhook_handler::<R, C>))
        .with_state(api)
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnrollBody {
    pub organization_id: OrganizationId,
    pub sequence_id: SequenceId,
    pub mode: EnrollmentMode,
    #[serde(default)]
    pub invoice_ids: Option<Vec<String>>,
    #[serde(default)]
    pub customer_ids: Option<Vec<String>>,
    #[serde(default)]
    pub campaign_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminateBody {
    pub organization_id: OrganizationId,
    pub reason: TerminationReason,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScopeBody {
    pub organization_id: OrganizationId,
}

pub(crate) async fn enroll_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    body: Result<Json<EnrollBody>, JsonRejection>,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return json_rejection_response(&rejection),
    };
    let target_ids = match body.mode {
        EnrollmentMode::Invoice => body.invoice_ids,
        EnrollmentMode::Customer => body.customer_ids,
    };
    let Some(target_ids) = target_ids else {
        let field = match body.mode {
            EnrollmentMode::Invoice => "invoice_ids",
            EnrollmentMode::Customer => "customer_ids",
        };
        let payload = json!({ "error": format!("{field} is required for this mode") });
        return (StatusCode::BAD_REQUEST, Json(payload)).into_response();
    };

    let request = EnrollRequest {
        sequence_id: body.sequence_id,
        mode: body.mode,
        target_ids,
        campaign_name: body.campaign_name,
    };
    match api
        .enrollments
        .enroll(&body.organization_id, request, api.clock.now())
    {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(err) => enrollment_error_response(err),
    }
}

pub(crate) async fn terminate_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    Path(enrollment_id): Path<String>,
    body: Result<Json<TerminateBody>, JsonRejection>,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return json_rejection_response(&rejection),
    };
    let id = EnrollmentId(enrollment_id);
    match api
        .enrollments
        .terminate(&body.organization_id, &id, body.reason, api.clock.now())
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(err) => enrollment_error_response(err),
    }
}

pub(crate) async fn pause_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    Path(enrollment_id): Path<String>,
    body: Result<Json<ScopeBody>, JsonRejection>,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return json_rejection_response(&rejection),
    };
    let id = EnrollmentId(enrollment_id);
    match api.enrollments.pause(&body.organization_id, &id, api.clock.now()) {
        Ok(enrollment) => (StatusCode::OK, Json(enrollment)).into_response(),
        Err(err) => enrollment_error_response(err),
    }
}

pub(crate) async fn resume_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    Path(enrollment_id): Path<String>,
    body: Result<Json<ScopeBody>, JsonRejection>,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => return json_rejection_response(&rejection),
    };
    let id = EnrollmentId(enrollment_id);
    match api.enrollments.resume(&body.organization_id, &id, api.clock.now()) {
        Ok(enrollment) => (StatusCode::OK, Json(enrollment)).into_response(),
        Err(err) => enrollment_error_response(err),
    }
}

pub(crate) async fn dispatch_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    headers: HeaderMap,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    if let Some(secret) = api.cron_secret.as_deref() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if !cron_secret_matches(presented, secret) {
            warn!("dispatch trigger rejected: bad cron secret");
            let payload = json!({ "error": "unauthorized" });
            return (StatusCode::UNAUTHORIZED, Json(payload)).into_response();
        }
    }

    let report = api.dispatcher.run_once(api.clock.now()).await;
    (StatusCode::OK, Json(report)).into_response()
}

/// Always answers 200 with empty TwiML so the carrier never retries.
pub(crate) async fn sms_webhook_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    form: Result<Form<InboundSms>, FormRejection>,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    match form {
        Ok(Form(sms)) => {
            if let Err(err) = api.inbound.handle_sms(sms, api.clock.now()).await {
                error!(error = %err, "inbound sms processing failed");
            }
        }
        Err(rejection) => warn!(error = %rejection, "malformed inbound sms payload"),
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        EMPTY_TWIML,
    )
        .into_response()
}

/// Always answers 200 so the mail provider never retries.
pub(crate) async fn email_webhook_handler<R, C>(
    State(api): State<Arc<CollectionsApi<R, C>>>,
    payload: Result<Json<InboundEmail>, JsonRejection>,
) -> Response
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    match payload {
        Ok(Json(email)) => {
            if let Err(err) = api.inbound.handle_email(email, api.clock.now()) {
                error!(error = %err, "inbound email processing failed");
            }
        }
        Err(rejection) => warn!(error = %rejection, "malformed inbound email payload"),
    }
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

/// Compares fixed-length digests so the check takes the same time for every wrong token.
pub(crate) fn cron_secret_matches(presented: Option<&str>, secret: &str) -> bool {
    let Some(presented) = presented else {
        return false;
    };
    let digest = |value: &str| {
        HmacSha256::new_from_slice(CRON_DIGEST_KEY).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (digest(secret), digest(presented)) {
        (Ok(expected), Ok(candidate)) => candidate
            .verify_slice(&expected.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}

fn json_rejection_response(rejection: &JsonRejection) -> Response {
    warn!(error = %rejection, "rejected request body");
    let payload = json!({ "error": rejection.body_text() });
    (StatusCode::BAD_REQUEST, Json(payload)).into_response()
}

fn enrollment_error_response(err: EnrollmentServiceError) -> Response {
    let status = match &err {
        EnrollmentServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        EnrollmentServiceError::SequenceNotFound(_)
        | EnrollmentServiceError::EnrollmentNotFound(_)
        | EnrollmentServiceError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        EnrollmentServiceError::InvalidTransition { .. }
        | EnrollmentServiceError::Repository(RepositoryError::Conflict) => StatusCode::CONFLICT,
        EnrollmentServiceError::Repository(RepositoryError::Unavailable(_)) => {
            error!(error = %err, "collections repository unavailable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    let payload = json!({ "error": err.to_string() });
    (status, Json(payload)).into_response()
}
