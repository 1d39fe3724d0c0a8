use crate::config::ConfigError;
use crate::telemetry::TelemetryError;
use crate::workflows::collections::EnrollmentServiceError;
use crate::workflows::liens::{LienError, NoticeError};
use crate::workflows::store::RepositoryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Repository(RepositoryError),
    Enrollment(EnrollmentServiceError),
    Lien(LienError),
    Notice(NoticeError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {err}"),
            AppError::Telemetry(err) => write!(f, "telemetry error: {err}"),
            AppError::Io(err) => write!(f, "io error: {err}"),
            AppError::Server(err) => write!(f, "server error: {err}"),
            AppError::Repository(err) => write!(f, "storage error: {err}"),
            AppError::Enrollment(err) => write!(f, "enrollment error: {err}"),
            AppError::Lien(err) => write!(f, "lien deadline error: {err}"),
            AppError::Notice(err) => write!(f, "notice error: {err}"),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Repository(err) => Some(err),
            AppError::Enrollment(err) => Some(err),
            AppError::Lien(err) => Some(err),
            AppError::Notice(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Lien(_)
            | AppError::Notice(NoticeError::Lien(_))
            | AppError::Enrollment(EnrollmentServiceError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Enrollment(EnrollmentServiceError::SequenceNotFound(_))
            | AppError::Enrollment(EnrollmentServiceError::EnrollmentNotFound(_))
            | AppError::Notice(NoticeError::NotFound(_))
            | AppError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
            AppError::Enrollment(EnrollmentServiceError::InvalidTransition { .. })
            | AppError::Notice(NoticeError::DuplicateTracking(_))
            | AppError::Repository(RepositoryError::Conflict) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<RepositoryError> for AppError {
    fn from(value: RepositoryError) -> Self {
        Self::Repository(value)
    }
}

impl From<EnrollmentServiceError> for AppError {
    fn from(value: EnrollmentServiceError) -> Self {
        Self::Enrollment(value)
    }
}

impl From<LienError> for AppError {
    fn from(value: LienError) -> Self {
        Self::Lien(value)
    }
}

impl From<NoticeError> for AppError {
    fn from(value: NoticeError) -> Self {
        Self::Notice(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_errors_map_to_client_statuses() {
        let unknown = AppError::from(LienError::UnknownState("ZZ".to_string()));
        assert_eq!(unknown.into_response().status(), StatusCode::BAD_REQUEST);

        let missing = AppError::from(EnrollmentServiceError::SequenceNotFound("seq_x".into()));
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);

        let down = AppError::from(RepositoryError::Unavailable("db".to_string()));
        assert_eq!(down.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
