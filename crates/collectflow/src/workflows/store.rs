use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::collections::domain::OrganizationId;

/// Error enumeration for repository failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record not found")]
    NotFound,
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// State-changing actions recorded for compliance defense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    EnrollmentCreated,
    EnrollmentEnded,
    EnrollmentPaused,
    EnrollmentResumed,
    MessageSent,
    MessageFailed,
    MessageCancelled,
    MessageDeferred,
    SmsOptOut,
    SmsOptIn,
    EmailOptOut,
    NoticeIssued,
    NoticeStatusChanged,
}

/// One immutable line in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub organization_id: Option<OrganizationId>,
    pub action: AuditAction,
    /// Identifier of the record the action applied to.
    pub subject: String,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        organization_id: Option<OrganizationId>,
        action: AuditAction,
        subject: impl Into<String>,
        detail: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: format!("aud_{}", uuid::Uuid::new_v4().simple()),
            organization_id,
            action,
            subject: subject.into(),
            detail: detail.into(),
            recorded_at,
        }
    }
}

/// Append-only trail: no update or delete.
pub trait AuditLog: Send + Sync {
    fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError>;
    fn entries_for(&self, subject: &str) -> Result<Vec<AuditEntry>, RepositoryError>;
}
