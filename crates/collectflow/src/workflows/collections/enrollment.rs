use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::domain::{
    Campaign, CampaignId, Channel, Customer, CustomerId, EndReason, Enrollment, EnrollmentId,
    EnrollmentKey, EnrollmentStatus, EnrollmentTarget, InvoiceId, InvoiceStatus, MessageId,
    OrganizationId, SequenceId, TerminationReason,
};
use super::materialize::{materialize_step, render_step, template_context, MaterializeError};
use super::repository::CollectionsRepository;
use super::sequence::SequenceTemplate;
use crate::workflows::store::{AuditAction, AuditEntry, RepositoryError};

/// Whether target ids name invoices or customers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentMode {
    Invoice,
    Customer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollRequest {
    pub sequence_id: SequenceId,
    pub mode: EnrollmentMode,
    pub target_ids: Vec<String>,
    pub campaign_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InvoicePaid,
    InvoiceNotCollectible,
    AlreadyEnrolled,
    NoUsableContact,
}

impl SkipReason {
    pub const fn describe(self) -> &'static str {
        match self {
            SkipReason::InvoicePaid => "invoice is already paid",
            SkipReason::InvoiceNotCollectible => "invoice is void",
            SkipReason::AlreadyEnrolled => "an active or paused enrollment already exists for this sequence",
            SkipReason::NoUsableContact => "customer has no consented phone number or reachable email",
        }
    }
}

/// Per-target result of a batch enrollment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TargetResult {
    Enrolled {
        enrollment_id: EnrollmentId,
        first_message_id: MessageId,
        first_send_at: DateTime<Utc>,
    },
    Skipped {
        reason: SkipReason,
        detail: &'static str,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetOutcome {
    pub target_id: String,
    #[serde(flatten)]
    pub result: TargetResult,
}

/// Structured summary returned for every enroll call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnrollmentSummary {
    pub campaign_id: CampaignId,
    pub enrolled: usize,
    pub skipped: usize,
    pub errors: usize,
    pub details: Vec<TargetOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminationOutcome {
    pub enrollment_id: EnrollmentId,
    pub status: EnrollmentStatus,
    pub cancelled_messages: usize,
    pub already_terminated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentServiceError {
    #[error("invalid enrollment request: {0}")]
    Validation(String),
    #[error("sequence {0} not found")]
    SequenceNotFound(SequenceId),
    #[error("enrollment {0} not found")]
    EnrollmentNotFound(EnrollmentId),
    #[error("enrollment {id} is {status:?} and cannot change that way")]
    InvalidTransition {
        id: EnrollmentId,
        status: EnrollmentStatus,
    },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Per-target failures that are reported but never abort the batch.
#[derive(Debug, thiserror::Error)]
enum TargetError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("cannot render sequence for this target: {0}")]
    Materialize(#[from] MaterializeError),
}

/// Creates, pauses, and ends enrollments.
pub struct EnrollmentService<R> {
    repository: Arc<R>,
}

impl<R> EnrollmentService<R>
where
    R: CollectionsRepository + 'static,
{
    pub fn new(repository: Arc<R>) -> Self {
        Self { repository }
    }

    /// Enroll each target independently; one failure never aborts the others.
    pub fn enroll(
        &self,
        organization_id: &OrganizationId,
        request: EnrollRequest,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentSummary, EnrollmentServiceError> {
        let target_ids: Vec<String> = request
            .target_ids
            .iter()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .collect();
        if target_ids.is_empty() {
            return Err(EnrollmentServiceError::Validation(
                "at least one target id is required".to_string(),
            ));
        }

        let sequence = self
            .repository
            .sequence(organization_id, &request.sequence_id)?
            .ok_or_else(|| EnrollmentServiceError::SequenceNotFound(request.sequence_id.clone()))?;
        if !sequence.is_active {
            return Err(EnrollmentServiceError::Validation(format!(
                "sequence {} is inactive",
                sequence.id
            )));
        }
        if self.repository.organization(organization_id)?.is_none() {
            return Err(EnrollmentServiceError::Validation(format!(
                "organization {organization_id} is not configured"
            )));
        }

        let campaign = Campaign {
            id: CampaignId::generate(),
            organization_id: organization_id.clone(),
            sequence_id: sequence.id.clone(),
            name: request
                .campaign_name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("{} {}", sequence.name, now.format("%Y-%m-%d"))),
            created_at: now,
        };
        self.repository.insert_campaign(campaign.clone())?;

        let mut summary = EnrollmentSummary {
            campaign_id: campaign.id.clone(),
            enrolled: 0,
            skipped: 0,
            errors: 0,
            details: Vec::with_capacity(target_ids.len()),
        };

        for target_id in target_ids {
            let result = match self.enroll_target(&sequence, &campaign, request.mode, &target_id, now)
            {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        organization_id = %organization_id,
                        sequence_id = %sequence.id,
                        target_id = %target_id,
                        error = %err,
                        "enrollment target failed"
                    );
                    TargetResult::Error {
                        error: err.to_string(),
                    }
                }
            };
            match &result {
                TargetResult::Enrolled { .. } => summary.enrolled += 1,
                TargetResult::Skipped { .. } => summary.skipped += 1,
                TargetResult::Error { .. } => summary.errors += 1,
            }
            summary.details.push(TargetOutcome { target_id, result });
        }

        info!(
            organization_id = %organization_id,
            campaign_id = %summary.campaign_id,
            enrolled = summary.enrolled,
            skipped = summary.skipped,
            errors = summary.errors,
            "enrollment batch processed"
        );
        Ok(summary)
    }

    fn enroll_target(
        &self,
        sequence: &SequenceTemplate,
        campaign: &Campaign,
        mode: EnrollmentMode,
        target_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TargetResult, TargetError> {
        let organization_id = &sequence.organization_id;
        let (customer, target) = match mode {
            EnrollmentMode::Invoice => {
                let invoice_id = InvoiceId::from(target_id);
                let invoice = self
                    .repository
                    .invoice(organization_id, &invoice_id)?
                    .ok_or_else(|| TargetError::NotFound {
                        kind: "invoice",
                        id: target_id.to_string(),
                    })?;
                match invoice.status {
                    InvoiceStatus::Paid => return Ok(skipped(SkipReason::InvoicePaid)),
                    InvoiceStatus::Void => return Ok(skipped(SkipReason::InvoiceNotCollectible)),
                    InvoiceStatus::Open | InvoiceStatus::Overdue => {}
                }
                let customer = self.require_customer(organization_id, &invoice.customer_id)?;
                let target = EnrollmentTarget::Invoice {
                    customer_id: invoice.customer_id,
                    invoice_id,
                };
                (customer, target)
            }
            EnrollmentMode::Customer => {
                let customer_id = CustomerId::from(target_id);
                let customer = self.require_customer(organization_id, &customer_id)?;
                (customer, EnrollmentTarget::CustomerOnly { customer_id })
            }
        };

        let key = EnrollmentKey {
            organization_id: organization_id.clone(),
            sequence_id: sequence.id.clone(),
            target: target.clone(),
        };
        if self.repository.live_enrollment(&key)?.is_some() {
            return Ok(skipped(SkipReason::AlreadyEnrolled));
        }
        if !customer.has_usable_contact() {
            return Ok(skipped(SkipReason::NoUsableContact));
        }

        let organization = self
            .repository
            .organization(organization_id)?
            .ok_or_else(|| TargetError::NotFound {
                kind: "organization",
                id: organization_id.to_string(),
            })?;
        // Every step must render now; later steps are re-rendered with fresh data when due.
        let context = template_context(&*self.repository, &organization, &customer, &target, now)?;
        for step in sequence.steps() {
            render_step(step, &context).map_err(MaterializeError::from)?;
        }

        let enrollment = Enrollment {
            id: EnrollmentId::generate(),
            organization_id: organization_id.clone(),
            sequence_id: sequence.id.clone(),
            campaign_id: campaign.id.clone(),
            target,
            status: EnrollmentStatus::Active,
            enrolled_at: now,
            steps: sequence.snapshot_steps(),
            ended_at: None,
            end_reason: None,
        };
        let first_step = enrollment
            .first_step()
            .cloned()
            .ok_or_else(|| TargetError::NotFound {
                kind: "step",
                id: sequence.id.to_string(),
            })?;
        let first_send_at = enrollment.earliest_send_for(first_step.step_number).max(now);
        let message = materialize_step(&*self.repository, &enrollment, &first_step, first_send_at)?;

        let enrollment = match self.repository.insert_enrollment(enrollment) {
            Ok(enrollment) => enrollment,
            Err(RepositoryError::Conflict) => return Ok(skipped(SkipReason::AlreadyEnrolled)),
            Err(err) => return Err(err.into()),
        };
        let first_message_id = message.id.clone();
        if let Err(err) = self.repository.insert_message(message) {
            self.repository
                .end_enrollment(&enrollment.id, EndReason::Manual, now)?;
            return Err(err.into());
        }

        self.repository.append(AuditEntry::new(
            Some(organization_id.clone()),
            AuditAction::EnrollmentCreated,
            enrollment.id.as_str(),
            format!(
                "customer {} enrolled in sequence {} (campaign {}), first send at {}",
                enrollment.customer_id(),
                sequence.id,
                campaign.id,
                first_send_at.to_rfc3339()
            ),
            now,
        ))?;
        info!(
            organization_id = %organization_id,
            enrollment_id = %enrollment.id,
            customer_id = %enrollment.customer_id(),
            "customer enrolled"
        );

        Ok(TargetResult::Enrolled {
            enrollment_id: enrollment.id,
            first_message_id,
            first_send_at,
        })
    }

    fn require_customer(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Customer, TargetError> {
        self.repository
            .customer(organization_id, customer_id)?
            .ok_or_else(|| TargetError::NotFound {
                kind: "customer",
                id: customer_id.to_string(),
            })
    }

    fn scoped_enrollment(
        &self,
        organization_id: &OrganizationId,
        enrollment_id: &EnrollmentId,
    ) -> Result<Enrollment, EnrollmentServiceError> {
        self.repository
            .enrollment(enrollment_id)?
            .filter(|enrollment| &enrollment.organization_id == organization_id)
            .ok_or_else(|| EnrollmentServiceError::EnrollmentNotFound(enrollment_id.clone()))
    }

    /// End an enrollment and cancel its pending messages. Repeat calls are no-ops.
    pub fn terminate(
        &self,
        organization_id: &OrganizationId,
        enrollment_id: &EnrollmentId,
        reason: TerminationReason,
        now: DateTime<Utc>,
    ) -> Result<TerminationOutcome, EnrollmentServiceError> {
        self.scoped_enrollment(organization_id, enrollment_id)?;
        self.end(enrollment_id, EndReason::from(reason), now)
    }

    pub(crate) fn end(
        &self,
        enrollment_id: &EnrollmentId,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> Result<TerminationOutcome, EnrollmentServiceError> {
        let ended = self.repository.end_enrollment(enrollment_id, reason, now)?;
        let cancelled = self.repository.cancel_pending_messages(
            enrollment_id,
            &format!("enrollment ended: {}", reason.label()),
            now,
        )?;
        let enrollment = self
            .repository
            .enrollment(enrollment_id)?
            .ok_or_else(|| EnrollmentServiceError::EnrollmentNotFound(enrollment_id.clone()))?;

        if ended {
            self.repository.append(AuditEntry::new(
                Some(enrollment.organization_id.clone()),
                AuditAction::EnrollmentEnded,
                enrollment_id.as_str(),
                format!(
                    "enrollment {} ({}); {cancelled} pending message(s) cancelled",
                    enrollment.status.label(),
                    reason.label()
                ),
                now,
            ))?;
            info!(
                enrollment_id = %enrollment_id,
                reason = reason.label(),
                cancelled,
                "enrollment ended"
            );
        }

        Ok(TerminationOutcome {
            enrollment_id: enrollment_id.clone(),
            status: enrollment.status,
            cancelled_messages: cancelled,
            already_terminated: !ended,
        })
    }

    pub fn pause(
        &self,
        organization_id: &OrganizationId,
        enrollment_id: &EnrollmentId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentServiceError> {
        self.transition(
            organization_id,
            enrollment_id,
            EnrollmentStatus::Active,
            EnrollmentStatus::Paused,
            AuditAction::EnrollmentPaused,
            now,
        )
    }

    pub fn resume(
        &self,
        organization_id: &OrganizationId,
        enrollment_id: &EnrollmentId,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentServiceError> {
        self.transition(
            organization_id,
            enrollment_id,
            EnrollmentStatus::Paused,
            EnrollmentStatus::Active,
            AuditAction::EnrollmentResumed,
            now,
        )
    }

    fn transition(
        &self,
        organization_id: &OrganizationId,
        enrollment_id: &EnrollmentId,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
        action: AuditAction,
        now: DateTime<Utc>,
    ) -> Result<Enrollment, EnrollmentServiceError> {
        let current = self.scoped_enrollment(organization_id, enrollment_id)?;
        if !self.repository.transition_enrollment(enrollment_id, from, to)? {
            return Err(EnrollmentServiceError::InvalidTransition {
                id: enrollment_id.clone(),
                status: current.status,
            });
        }
        self.repository.append(AuditEntry::new(
            Some(organization_id.clone()),
            action,
            enrollment_id.as_str(),
            format!("{} -> {}", from.label(), to.label()),
            now,
        ))?;
        self.scoped_enrollment(organization_id, enrollment_id)
    }

    /// Completes every live enrollment collecting on the invoice.
    pub fn on_invoice_paid(
        &self,
        organization_id: &OrganizationId,
        invoice_id: &InvoiceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<TerminationOutcome>, EnrollmentServiceError> {
        self.repository
            .live_enrollments_for_invoice(organization_id, invoice_id)?
            .iter()
            .map(|enrollment| self.end(&enrollment.id, EndReason::InvoicePaid, now))
            .collect()
    }

    /// Stops every live enrollment of the customer that would message them on `channel`.
    pub fn on_customer_opt_out(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<Vec<TerminationOutcome>, EnrollmentServiceError> {
        self.repository
            .live_enrollments_for_customer(organization_id, customer_id)?
            .iter()
            .filter(|enrollment| enrollment.uses_channel(channel))
            .map(|enrollment| self.end(&enrollment.id, EndReason::OptedOut, now))
            .collect()
    }
}

fn skipped(reason: SkipReason) -> TargetResult {
    TargetResult::Skipped {
        reason,
        detail: reason.describe(),
    }
}
