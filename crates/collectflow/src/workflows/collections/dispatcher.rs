//! Polling worker that fires due reminder steps.
//!
//! Each pass claims due messages one at a time with a conditional
//! `pending -> processing` update, re-runs the compliance gate against the
//! customer's current record, and then sends, defers, or cancels. The
//! enrollment is re-read right before the send so a termination that lands
//! after the claim still wins.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::compliance::{self, FREQUENCY_WINDOW_DAYS};
use super::domain::{
    EndReason, Enrollment, EnrollmentStatus, InvoiceStatus, MessageId, MessageResolution,
    ScheduledMessage,
};
use super::enrollment::{EnrollmentService, EnrollmentServiceError};
use super::materialize::{materialize_step, render_for_send};
use super::repository::{ChannelError, ChannelSender, CollectionsRepository, OutboundMessage};
use crate::config::DispatcherConfig;
use crate::workflows::clock::Clock;
use crate::workflows::store::{AuditAction, AuditEntry, RepositoryError};

/// Counts for one dispatcher pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    pub retried: usize,
    pub rescheduled: usize,
    pub cancelled: usize,
    /// Claimed elsewhere or held back by a paused enrollment.
    pub skipped: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DispatchOutcome {
    Sent,
    Retried,
    Failed,
    Rescheduled,
    Cancelled,
    Skipped,
}

#[derive(Debug, thiserror::Error)]
enum DispatchError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentServiceError),
}

pub struct Dispatcher<R, C> {
    repository: Arc<R>,
    sender: Arc<C>,
    enrollments: EnrollmentService<R>,
    config: DispatcherConfig,
}

impl<R, C> Dispatcher<R, C>
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    pub fn new(repository: Arc<R>, sender: Arc<C>, config: DispatcherConfig) -> Self {
        Self {
            enrollments: EnrollmentService::new(repository.clone()),
            repository,
            sender,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Process every message due at `now`. Each message is handled independently.
    pub async fn run_once(&self, now: DateTime<Utc>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let due = match self.repository.due_messages(now, self.config.batch_size) {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "failed to load due messages");
                report.errors += 1;
                return report;
            }
        };

        for message in due {
            let message_id = message.id.clone();
            let failure_count = message.failure_count;
            match self.process(message, now).await {
                Ok(outcome) => {
                    report.processed += 1;
                    match outcome {
                        DispatchOutcome::Sent => report.sent += 1,
                        DispatchOutcome::Retried => report.retried += 1,
                        DispatchOutcome::Failed => report.failed += 1,
                        DispatchOutcome::Rescheduled => report.rescheduled += 1,
                        DispatchOutcome::Cancelled => report.cancelled += 1,
                        DispatchOutcome::Skipped => {
                            report.processed -= 1;
                            report.skipped += 1;
                        }
                    }
                }
                Err(err) => {
                    error!(message_id = %message_id, error = %err, "failed to process scheduled message");
                    report.errors += 1;
                    self.release(&message_id, failure_count, &err, now);
                }
            }
        }

        if report.processed > 0 || report.errors > 0 {
            info!(
                processed = report.processed,
                sent = report.sent,
                failed = report.failed,
                retried = report.retried,
                rescheduled = report.rescheduled,
                cancelled = report.cancelled,
                errors = report.errors,
                "dispatcher pass complete"
            );
        }
        report
    }

    /// Hand a message this pass still holds back to `pending` so a later pass retries it.
    fn release(&self, id: &MessageId, failure_count: u32, err: &DispatchError, now: DateTime<Utc>) {
        let retry_at = now + Duration::minutes(self.config.retry_backoff_minutes.max(1));
        let released = self.repository.resolve_message(
            id,
            MessageResolution::Deferred {
                scheduled_for: retry_at,
                failure_count,
                note: Some(format!("released after error: {err}")),
            },
            now,
        );
        match released {
            Ok(true) => warn!(message_id = %id, retry_at = %retry_at, "claimed message released"),
            Ok(false) => {}
            Err(release_err) => {
                error!(message_id = %id, error = %release_err, "failed to release claimed message");
            }
        }
    }

    /// Poll on a fixed cadence until `shutdown` is notified.
    pub async fn run(&self, clock: Arc<dyn Clock>, interval: std::time::Duration, shutdown: Arc<Notify>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = interval.as_secs(), "dispatcher loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once(clock.now()).await;
                }
                _ = shutdown.notified() => {
                    info!("dispatcher loop stopped");
                    return;
                }
            }
        }
    }

    async fn process(
        &self,
        message: ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !self.repository.claim_message(&message.id)? {
            debug!(message_id = %message.id, "message already claimed");
            return Ok(DispatchOutcome::Skipped);
        }

        let Some(enrollment) = self.repository.enrollment(&message.enrollment_id)? else {
            return self.cancel(&message, "enrollment no longer exists", now);
        };
        if let Some(outcome) = self.hold_for_enrollment(&message, &enrollment, now)? {
            return Ok(outcome);
        }

        if let Some(invoice_id) = message.target.invoice_id() {
            let invoice = self.repository.invoice(&message.organization_id, invoice_id)?;
            let status = invoice.map(|invoice| invoice.status);
            if !status.is_some_and(InvoiceStatus::is_collectible) {
                let reason = if status == Some(InvoiceStatus::Paid) {
                    EndReason::InvoicePaid
                } else {
                    EndReason::Manual
                };
                let outcome = self.cancel(&message, "invoice is no longer collectible", now)?;
                self.enrollments.end(&enrollment.id, reason, now)?;
                return Ok(outcome);
            }
        }

        let Some(customer) = self
            .repository
            .customer(&message.organization_id, message.customer_id())?
        else {
            let outcome = self.cancel(&message, "customer record not found", now)?;
            self.enrollments
                .end(&enrollment.id, EndReason::ComplianceBlocked, now)?;
            return Ok(outcome);
        };

        let since = now - Duration::days(FREQUENCY_WINDOW_DAYS);
        let recent = self
            .repository
            .sent_message_count(&customer.id, message.channel, since)?;
        let decision = compliance::evaluate(message.channel, &customer, recent, now);
        for warning in &decision.warnings {
            warn!(message_id = %message.id, customer_id = %customer.id, code = warning.code(), "{warning}");
        }

        if !decision.allowed {
            let summary = decision.blocker_summary();
            if decision.is_deferral() {
                let next_allowed = decision.next_allowed().unwrap_or(now + Duration::hours(1));
                self.defer(&message, next_allowed, message.failure_count, Some(summary.clone()), now)?;
                self.audit(&message, AuditAction::MessageDeferred, summary, now)?;
                return Ok(DispatchOutcome::Rescheduled);
            }

            let outcome = self.cancel(&message, &summary, now)?;
            self.enrollments
                .end(&enrollment.id, EndReason::ComplianceBlocked, now)?;
            return Ok(outcome);
        }

        // Termination may have landed after the claim.
        let Some(current) = self.repository.enrollment(&enrollment.id)? else {
            return self.cancel(&message, "enrollment no longer exists", now);
        };
        if let Some(outcome) = self.hold_for_enrollment(&message, &current, now)? {
            return Ok(outcome);
        }

        let Some(to) = customer.address_for(message.channel).map(str::to_string) else {
            return self.cancel(&message, "no address for channel", now);
        };
        let (subject, body) = match current.step(message.step_number) {
            Some(step) => match render_for_send(&*self.repository, &current, &customer, step, now) {
                Ok(rendered) => rendered,
                Err(err) => {
                    let outcome = self.cancel(&message, &format!("cannot render step: {err}"), now)?;
                    self.enrollments
                        .end(&current.id, EndReason::TemplateFailure, now)?;
                    return Ok(outcome);
                }
            },
            None => (message.subject.clone(), message.body.clone()),
        };
        let outbound = OutboundMessage {
            channel: message.channel,
            to,
            subject,
            body,
            reference: Some(message.id.to_string()),
        };

        let timeout = self.config.send_timeout();
        let result = match tokio::time::timeout(timeout, self.sender.send(&outbound)).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(timeout.as_secs())),
        };

        match result {
            Ok(receipt) => {
                let resolved = self.repository.resolve_message(
                    &message.id,
                    MessageResolution::Sent {
                        provider_message_id: receipt.provider_message_id.clone(),
                        subject: outbound.subject.clone(),
                        body: outbound.body.clone(),
                    },
                    now,
                )?;
                self.audit(
                    &message,
                    AuditAction::MessageSent,
                    format!(
                        "step {} sent via {} ({})",
                        message.step_number, message.channel, receipt.provider_message_id
                    ),
                    now,
                )?;
                info!(message_id = %message.id, enrollment_id = %message.enrollment_id, channel = %message.channel, "reminder sent");
                if resolved {
                    self.advance(&current, &message, now)?;
                }
                Ok(DispatchOutcome::Sent)
            }
            Err(err) => self.handle_send_failure(&current, &message, err, now),
        }
    }

    /// Paused enrollments keep their message pending; ended ones cancel it.
    fn hold_for_enrollment(
        &self,
        message: &ScheduledMessage,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> Result<Option<DispatchOutcome>, DispatchError> {
        match enrollment.status {
            EnrollmentStatus::Active => Ok(None),
            EnrollmentStatus::Paused => {
                self.defer(
                    message,
                    message.scheduled_for,
                    message.failure_count,
                    Some("enrollment paused".to_string()),
                    now,
                )?;
                Ok(Some(DispatchOutcome::Skipped))
            }
            EnrollmentStatus::Completed | EnrollmentStatus::Stopped => {
                let reason = format!("enrollment {}", enrollment.status.label());
                self.cancel(message, &reason, now).map(Some)
            }
        }
    }

    fn handle_send_failure(
        &self,
        enrollment: &Enrollment,
        message: &ScheduledMessage,
        err: ChannelError,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let attempts = message.failure_count + 1;
        let retryable = !matches!(err, ChannelError::Rejected(_));

        if retryable && attempts < self.config.max_attempts {
            let backoff = Duration::minutes(self.config.retry_backoff_minutes * i64::from(attempts));
            warn!(message_id = %message.id, attempts, error = %err, "send failed; will retry");
            self.defer(message, now + backoff, attempts, Some(err.to_string()), now)?;
            return Ok(DispatchOutcome::Retried);
        }

        let resolved = self.repository.resolve_message(
            &message.id,
            MessageResolution::Failed {
                failure_count: attempts,
                error: err.to_string(),
            },
            now,
        )?;
        self.audit(
            message,
            AuditAction::MessageFailed,
            format!("step {} failed after {attempts} attempt(s): {err}", message.step_number),
            now,
        )?;
        error!(message_id = %message.id, attempts, error = %err, "send failed permanently");
        if resolved {
            self.advance(enrollment, message, now)?;
        }
        Ok(DispatchOutcome::Failed)
    }

    /// Schedule the step after `message`, or complete the enrollment when none remain.
    fn advance(
        &self,
        enrollment: &Enrollment,
        message: &ScheduledMessage,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        let Some(next) = enrollment.step_after(message.step_number) else {
            self.enrollments
                .end(&enrollment.id, EndReason::SequenceFinished, now)?;
            return Ok(());
        };

        let live = self
            .repository
            .enrollment(&enrollment.id)?
            .is_some_and(|current| current.status.is_live());
        if !live {
            return Ok(());
        }

        let scheduled_for = enrollment.earliest_send_for(next.step_number).max(now);
        match materialize_step(&*self.repository, enrollment, next, scheduled_for) {
            Ok(next_message) => {
                debug!(
                    enrollment_id = %enrollment.id,
                    step = next.step_number,
                    scheduled_for = %scheduled_for,
                    "next step scheduled"
                );
                self.repository.insert_message(next_message)?;
            }
            Err(err) => {
                error!(enrollment_id = %enrollment.id, step = next.step_number, error = %err, "cannot materialize next step");
                self.enrollments
                    .end(&enrollment.id, EndReason::TemplateFailure, now)?;
            }
        }
        Ok(())
    }

    fn defer(
        &self,
        message: &ScheduledMessage,
        scheduled_for: DateTime<Utc>,
        failure_count: u32,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        self.repository.resolve_message(
            &message.id,
            MessageResolution::Deferred {
                scheduled_for,
                failure_count,
                note,
            },
            now,
        )?;
        Ok(())
    }

    fn cancel(
        &self,
        message: &ScheduledMessage,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.repository.resolve_message(
            &message.id,
            MessageResolution::Cancelled {
                reason: reason.to_string(),
            },
            now,
        )?;
        self.audit(message, AuditAction::MessageCancelled, reason.to_string(), now)?;
        info!(message_id = %message.id, enrollment_id = %message.enrollment_id, reason, "scheduled message cancelled");
        Ok(DispatchOutcome::Cancelled)
    }

    fn audit(
        &self,
        message: &ScheduledMessage,
        action: AuditAction,
        detail: String,
        now: DateTime<Utc>,
    ) -> Result<(), DispatchError> {
        self.repository.append(AuditEntry::new(
            Some(message.organization_id.clone()),
            action,
            message.id.as_str(),
            detail,
            now,
        ))?;
        Ok(())
    }
}
