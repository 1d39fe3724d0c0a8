use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::deadlines::{calculate_lien_deadlines, calculate_response_deadline, LienError};
use super::notice::{DeliveryStatus, NoticeId, NoticeOfIntent, TransitionOutcome};
use super::webhook::{map_carrier_status, CarrierEvent};
use crate::workflows::collections::domain::{InvoiceId, OrganizationId};
use crate::workflows::store::{AuditAction, AuditEntry, AuditLog, RepositoryError};

/// Storage for notices of intent.
pub trait NoticeRepository: AuditLog {
    /// Fails with `Conflict` when the tracking number is already assigned.
    fn insert_notice(&self, notice: NoticeOfIntent) -> Result<(), RepositoryError>;
    fn notice(&self, id: &NoticeId) -> Result<Option<NoticeOfIntent>, RepositoryError>;
    fn notice_by_tracking(
        &self,
        tracking_number: &str,
    ) -> Result<Option<NoticeOfIntent>, RepositoryError>;
    /// Applies the monotonic transition rules and the write as one step.
    fn update_delivery_status(
        &self,
        id: &NoticeId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RepositoryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssueNotice {
    pub organization_id: OrganizationId,
    pub invoice_id: InvoiceId,
    pub state: String,
    pub sent_date: NaiveDate,
    pub first_work_date: NaiveDate,
    pub last_work_date: NaiveDate,
    #[serde(default)]
    pub tracking_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NoticeError {
    #[error(transparent)]
    Lien(#[from] LienError),
    #[error("notice {0} not found")]
    NotFound(NoticeId),
    #[error("tracking number {0} is already assigned to another notice")]
    DuplicateTracking(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// How a carrier event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CarrierOutcome {
    Applied,
    Duplicate,
    IgnoredTerminal,
    Stale,
    UnknownStatus,
    Unmatched,
    InvalidPayload,
}

impl From<TransitionOutcome> for CarrierOutcome {
    fn from(value: TransitionOutcome) -> Self {
        match value {
            TransitionOutcome::Applied { .. } => CarrierOutcome::Applied,
            TransitionOutcome::Duplicate => CarrierOutcome::Duplicate,
            TransitionOutcome::IgnoredTerminal { .. } => CarrierOutcome::IgnoredTerminal,
            TransitionOutcome::Stale { .. } => CarrierOutcome::Stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CarrierAck {
    pub received: bool,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice_id: Option<NoticeId>,
    pub outcome: CarrierOutcome,
}

impl CarrierAck {
    pub fn unmatched(outcome: CarrierOutcome) -> Self {
        Self {
            received: true,
            matched: false,
            notice_id: None,
            outcome,
        }
    }
}

pub struct NoticeService<R> {
    repository: Arc<R>,
}

impl<R> NoticeService<R>
where
    R: NoticeRepository + 'static,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Compute deadlines and record the notice as `pending`.
    pub fn issue(
        &self,
        request: IssueNotice,
        now: DateTime<Utc>,
    ) -> Result<NoticeOfIntent, NoticeError> {
        let deadlines = calculate_lien_deadlines(
            &request.state,
            request.first_work_date,
            request.last_work_date,
            now.date_naive(),
        )?;
        let response_deadline = calculate_response_deadline(request.sent_date, &request.state)?;
        let tracking_number = request
            .tracking_number
            .map(|number| number.trim().to_string())
            .filter(|number| !number.is_empty());

        let notice = NoticeOfIntent {
            id: NoticeId::generate(),
            organization_id: request.organization_id,
            invoice_id: request.invoice_id,
            state: deadlines.state.to_string(),
            sent_date: request.sent_date,
            response_deadline,
            lien_filing_deadline: deadlines.lien_filing_deadline,
            delivery_status: DeliveryStatus::Pending,
            tracking_number: tracking_number.clone(),
            created_at: now,
            status_updated_at: None,
        };

        match self.repository.insert_notice(notice.clone()) {
            Ok(()) => {}
            Err(RepositoryError::Conflict) => {
                return Err(NoticeError::DuplicateTracking(tracking_number.unwrap_or_default()))
            }
            Err(err) => return Err(err.into()),
        }
        self.repository.append(AuditEntry::new(
            Some(notice.organization_id.clone()),
            AuditAction::NoticeIssued,
            notice.id.as_str(),
            format!(
                "notice of intent for invoice {} ({}): response by {}, lien filing by {}",
                notice.invoice_id, notice.state, notice.response_deadline, notice.lien_filing_deadline
            ),
            now,
        ))?;
        info!(
            notice_id = %notice.id,
            invoice_id = %notice.invoice_id,
            state = %notice.state,
            lien_filing_deadline = %notice.lien_filing_deadline,
            warning_level = deadlines.warning_level.label(),
            "notice of intent issued"
        );
        Ok(notice)
    }

    /// Notices owned by another organization read as missing.
    pub fn get(
        &self,
        organization_id: &OrganizationId,
        id: &NoticeId,
    ) -> Result<NoticeOfIntent, NoticeError> {
        self.repository
            .notice(id)?
            .filter(|notice| &notice.organization_id == organization_id)
            .ok_or_else(|| NoticeError::NotFound(id.clone()))
    }

    /// Apply a verified carrier event. Unmatched or unrecognised events are acknowledged, not errors.
    pub fn handle_carrier_event(
        &self,
        event: CarrierEvent,
        now: DateTime<Utc>,
    ) -> Result<CarrierAck, NoticeError> {
        let notice = match event
            .tracking_number
            .as_deref()
            .map(str::trim)
            .filter(|number| !number.is_empty())
        {
            Some(number) => self.repository.notice_by_tracking(number)?,
            None => None,
        };
        let notice = match (notice, event.reference.as_deref()) {
            (Some(notice), _) => Some(notice),
            (None, Some(reference)) => self.repository.notice(&NoticeId(reference.to_string()))?,
            (None, None) => None,
        };
        let Some(notice) = notice else {
            warn!(
                tracking_number = event.tracking_number.as_deref().unwrap_or(""),
                status = %event.status,
                "carrier event for unknown notice"
            );
            return Ok(CarrierAck::unmatched(CarrierOutcome::Unmatched));
        };

        let Some(status) = map_carrier_status(&event.status) else {
            warn!(notice_id = %notice.id, status = %event.status, "unrecognised carrier status ignored");
            return Ok(CarrierAck {
                received: true,
                matched: true,
                notice_id: Some(notice.id),
                outcome: CarrierOutcome::UnknownStatus,
            });
        };

        let at = event.occurred_at.unwrap_or(now);
        let transition = self.repository.update_delivery_status(&notice.id, status, at)?;
        if let TransitionOutcome::Applied { from, to } = transition {
            self.repository.append(AuditEntry::new(
                Some(notice.organization_id.clone()),
                AuditAction::NoticeStatusChanged,
                notice.id.as_str(),
                format!("{} -> {} (carrier status '{}')", from.label(), to.label(), event.status),
                now,
            ))?;
            info!(notice_id = %notice.id, from = from.label(), to = to.label(), "notice delivery status updated");
        } else {
            info!(notice_id = %notice.id, status = status.label(), ?transition, "carrier event not applied");
        }

        Ok(CarrierAck {
            received: true,
            matched: true,
            notice_id: Some(notice.id),
            outcome: transition.into(),
        })
    }
}
