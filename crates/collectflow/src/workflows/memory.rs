//! Mutex-guarded store implementing every repository trait.
//!
//! Each conditional update runs under the single lock, which gives the same
//! guarantees as `UPDATE ... WHERE status = ?` against a real database.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::collections::domain::{
    Campaign, CampaignId, Channel, Customer, CustomerId, EndReason, Enrollment, EnrollmentId,
    EnrollmentKey, EnrollmentStatus, InboundMessage, Invoice, InvoiceId, InvoiceStatus, MessageId,
    MessageResolution, MessageStatus, Organization, OrganizationId, ScheduledMessage, SequenceId,
};
use super::collections::repository::CollectionsRepository;
use super::collections::sequence::SequenceTemplate;
use super::liens::notice::{apply_delivery_update, DeliveryStatus, NoticeId, NoticeOfIntent, TransitionOutcome};
use super::liens::service::NoticeRepository;
use super::store::{AuditEntry, AuditLog, RepositoryError};

#[derive(Debug, Default)]
struct StoreState {
    organizations: HashMap<OrganizationId, Organization>,
    sequences: HashMap<SequenceId, SequenceTemplate>,
    customers: HashMap<CustomerId, Customer>,
    invoices: HashMap<InvoiceId, Invoice>,
    campaigns: HashMap<CampaignId, Campaign>,
    enrollments: HashMap<EnrollmentId, Enrollment>,
    messages: HashMap<MessageId, ScheduledMessage>,
    inbound: Vec<InboundMessage>,
    notices: HashMap<NoticeId, NoticeOfIntent>,
    audit: Vec<AuditEntry>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

fn phone_key(phone: &str) -> String {
    let digits: String = phone.chars().filter(char::is_ascii_digit).collect();
    let skip = digits.len().saturating_sub(10);
    digits[skip..].to_string()
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store mutex poisoned".to_string()))
    }

    pub fn insert_organization(&self, organization: Organization) -> Result<(), RepositoryError> {
        self.lock()?
            .organizations
            .insert(organization.id.clone(), organization);
        Ok(())
    }

    /// Later edits never reach existing enrollments, which keep their own step copy.
    pub fn upsert_sequence(&self, sequence: SequenceTemplate) -> Result<(), RepositoryError> {
        self.lock()?.sequences.insert(sequence.id.clone(), sequence);
        Ok(())
    }

    pub fn insert_customer(&self, customer: Customer) -> Result<(), RepositoryError> {
        self.lock()?.customers.insert(customer.id.clone(), customer);
        Ok(())
    }

    pub fn insert_invoice(&self, invoice: Invoice) -> Result<(), RepositoryError> {
        self.lock()?.invoices.insert(invoice.id.clone(), invoice);
        Ok(())
    }

    pub fn set_invoice_status(
        &self,
        id: &InvoiceId,
        status: InvoiceStatus,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let invoice = state.invoices.get_mut(id).ok_or(RepositoryError::NotFound)?;
        invoice.status = status;
        Ok(())
    }

    pub fn campaign(&self, id: &CampaignId) -> Result<Option<Campaign>, RepositoryError> {
        Ok(self.lock()?.campaigns.get(id).cloned())
    }

    pub fn inbound_messages(&self) -> Result<Vec<InboundMessage>, RepositoryError> {
        Ok(self.lock()?.inbound.clone())
    }

    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self.lock()?.audit.clone())
    }

    pub fn enrollments(&self) -> Result<Vec<Enrollment>, RepositoryError> {
        let mut enrollments: Vec<_> = self.lock()?.enrollments.values().cloned().collect();
        enrollments.sort_by_key(|enrollment| enrollment.enrolled_at);
        Ok(enrollments)
    }
}

impl AuditLog for InMemoryStore {
    fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        self.lock()?.audit.push(entry);
        Ok(())
    }

    fn entries_for(&self, subject: &str) -> Result<Vec<AuditEntry>, RepositoryError> {
        Ok(self
            .lock()?
            .audit
            .iter()
            .filter(|entry| entry.subject == subject)
            .cloned()
            .collect())
    }
}

impl CollectionsRepository for InMemoryStore {
    fn organization(&self, id: &OrganizationId) -> Result<Option<Organization>, RepositoryError> {
        Ok(self.lock()?.organizations.get(id).cloned())
    }

    fn sequence(
        &self,
        organization_id: &OrganizationId,
        id: &SequenceId,
    ) -> Result<Option<SequenceTemplate>, RepositoryError> {
        Ok(self
            .lock()?
            .sequences
            .get(id)
            .filter(|sequence| &sequence.organization_id == organization_id)
            .cloned())
    }

    fn customer(
        &self,
        organization_id: &OrganizationId,
        id: &CustomerId,
    ) -> Result<Option<Customer>, RepositoryError> {
        Ok(self
            .lock()?
            .customers
            .get(id)
            .filter(|customer| &customer.organization_id == organization_id)
            .cloned())
    }

    fn update_customer(&self, customer: Customer) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        match state.customers.get_mut(&customer.id) {
            Some(existing) => {
                *existing = customer;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    fn customers_by_phone(&self, phone: &str) -> Result<Vec<Customer>, RepositoryError> {
        let wanted = phone_key(phone);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()?
            .customers
            .values()
            .filter(|customer| {
                customer
                    .phone
                    .as_deref()
                    .is_some_and(|candidate| phone_key(candidate) == wanted)
            })
            .cloned()
            .collect())
    }

    fn customers_by_email(&self, email: &str) -> Result<Vec<Customer>, RepositoryError> {
        let wanted = email.trim();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .lock()?
            .customers
            .values()
            .filter(|customer| {
                customer
                    .email
                    .as_deref()
                    .is_some_and(|candidate| candidate.trim().eq_ignore_ascii_case(wanted))
            })
            .cloned()
            .collect())
    }

    fn invoice(
        &self,
        organization_id: &OrganizationId,
        id: &InvoiceId,
    ) -> Result<Option<Invoice>, RepositoryError> {
        Ok(self
            .lock()?
            .invoices
            .get(id)
            .filter(|invoice| &invoice.organization_id == organization_id)
            .cloned())
    }

    fn open_invoices(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Invoice>, RepositoryError> {
        let mut invoices: Vec<_> = self
            .lock()?
            .invoices
            .values()
            .filter(|invoice| {
                &invoice.organization_id == organization_id
                    && &invoice.customer_id == customer_id
                    && invoice.status.is_collectible()
            })
            .cloned()
            .collect();
        invoices.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        Ok(invoices)
    }

    fn insert_campaign(&self, campaign: Campaign) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.campaigns.contains_key(&campaign.id) {
            return Err(RepositoryError::Conflict);
        }
        state.campaigns.insert(campaign.id.clone(), campaign);
        Ok(())
    }

    fn live_enrollment(&self, key: &EnrollmentKey) -> Result<Option<Enrollment>, RepositoryError> {
        Ok(self
            .lock()?
            .enrollments
            .values()
            .find(|enrollment| enrollment.status.is_live() && &enrollment.key() == key)
            .cloned())
    }

    fn insert_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment, RepositoryError> {
        let mut state = self.lock()?;
        let key = enrollment.key();
        let duplicate = state
            .enrollments
            .values()
            .any(|existing| existing.status.is_live() && existing.key() == key);
        if duplicate || state.enrollments.contains_key(&enrollment.id) {
            return Err(RepositoryError::Conflict);
        }
        state
            .enrollments
            .insert(enrollment.id.clone(), enrollment.clone());
        Ok(enrollment)
    }

    fn enrollment(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
        Ok(self.lock()?.enrollments.get(id).cloned())
    }

    fn live_enrollments_for_customer(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        Ok(self
            .lock()?
            .enrollments
            .values()
            .filter(|enrollment| {
                enrollment.status.is_live()
                    && &enrollment.organization_id == organization_id
                    && enrollment.customer_id() == customer_id
            })
            .cloned()
            .collect())
    }

    fn live_enrollments_for_invoice(
        &self,
        organization_id: &OrganizationId,
        invoice_id: &InvoiceId,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        Ok(self
            .lock()?
            .enrollments
            .values()
            .filter(|enrollment| {
                enrollment.status.is_live()
                    && &enrollment.organization_id == organization_id
                    && enrollment.target.invoice_id() == Some(invoice_id)
            })
            .cloned()
            .collect())
    }

    fn end_enrollment(
        &self,
        id: &EnrollmentId,
        reason: EndReason,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let enrollment = state.enrollments.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !enrollment.status.is_live() {
            return Ok(false);
        }
        enrollment.status = reason.terminal_status();
        enrollment.ended_at = Some(at);
        enrollment.end_reason = Some(reason);
        Ok(true)
    }

    fn transition_enrollment(
        &self,
        id: &EnrollmentId,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let enrollment = state.enrollments.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if enrollment.status != from {
            return Ok(false);
        }
        enrollment.status = to;
        Ok(true)
    }

    fn insert_message(&self, message: ScheduledMessage) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.messages.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        state.messages.insert(message.id.clone(), message);
        Ok(())
    }

    fn message(&self, id: &MessageId) -> Result<Option<ScheduledMessage>, RepositoryError> {
        Ok(self.lock()?.messages.get(id).cloned())
    }

    fn messages_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let mut messages: Vec<_> = self
            .lock()?
            .messages
            .values()
            .filter(|message| &message.enrollment_id == enrollment_id)
            .cloned()
            .collect();
        messages.sort_by_key(|message| message.step_number);
        Ok(messages)
    }

    fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        let mut due: Vec<_> = self
            .lock()?
            .messages
            .values()
            .filter(|message| message.status == MessageStatus::Pending && message.scheduled_for <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.scheduled_for.cmp(&b.scheduled_for).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    fn claim_message(&self, id: &MessageId) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let message = state.messages.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if message.status != MessageStatus::Pending {
            return Ok(false);
        }
        message.status = MessageStatus::Processing;
        Ok(true)
    }

    fn resolve_message(
        &self,
        id: &MessageId,
        resolution: MessageResolution,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        let message = state.messages.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if message.status != MessageStatus::Processing {
            return Ok(false);
        }
        match resolution {
            MessageResolution::Sent {
                provider_message_id,
                subject,
                body,
            } => {
                message.status = MessageStatus::Sent;
                message.subject = subject;
                message.body = body;
                message.provider_message_id = Some(provider_message_id);
                message.processed_at = Some(at);
            }
            MessageResolution::Failed {
                failure_count,
                error,
            } => {
                message.status = MessageStatus::Failed;
                message.failure_count = failure_count;
                message.last_error = Some(error);
                message.processed_at = Some(at);
            }
            MessageResolution::Cancelled { reason } => {
                message.status = MessageStatus::Cancelled;
                message.last_error = Some(reason);
                message.processed_at = Some(at);
            }
            MessageResolution::Deferred {
                scheduled_for,
                failure_count,
                note,
            } => {
                message.status = MessageStatus::Pending;
                message.scheduled_for = scheduled_for;
                message.failure_count = failure_count;
                if note.is_some() {
                    message.last_error = note;
                }
            }
        }
        Ok(true)
    }

    fn cancel_pending_messages(
        &self,
        enrollment_id: &EnrollmentId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        let mut state = self.lock()?;
        let mut cancelled = 0;
        for message in state.messages.values_mut().filter(|message| {
            &message.enrollment_id == enrollment_id && message.status == MessageStatus::Pending
        }) {
            message.status = MessageStatus::Cancelled;
            message.last_error = Some(reason.to_string());
            message.processed_at = Some(at);
            cancelled += 1;
        }
        Ok(cancelled)
    }

    fn sent_message_count(
        &self,
        customer_id: &CustomerId,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<u32, RepositoryError> {
        let count = self
            .lock()?
            .messages
            .values()
            .filter(|message| {
                message.status == MessageStatus::Sent
                    && message.channel == channel
                    && message.customer_id() == customer_id
                    && message.processed_at.is_some_and(|at| at >= since)
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn insert_inbound(&self, message: InboundMessage) -> Result<(), RepositoryError> {
        self.lock()?.inbound.push(message);
        Ok(())
    }
}

impl NoticeRepository for InMemoryStore {
    fn insert_notice(&self, notice: NoticeOfIntent) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        let tracking_taken = notice.tracking_number.as_deref().is_some_and(|number| {
            state
                .notices
                .values()
                .any(|existing| existing.tracking_number.as_deref() == Some(number))
        });
        if tracking_taken || state.notices.contains_key(&notice.id) {
            return Err(RepositoryError::Conflict);
        }
        state.notices.insert(notice.id.clone(), notice);
        Ok(())
    }

    fn notice(&self, id: &NoticeId) -> Result<Option<NoticeOfIntent>, RepositoryError> {
        Ok(self.lock()?.notices.get(id).cloned())
    }

    fn notice_by_tracking(
        &self,
        tracking_number: &str,
    ) -> Result<Option<NoticeOfIntent>, RepositoryError> {
        Ok(self
            .lock()?
            .notices
            .values()
            .find(|notice| notice.tracking_number.as_deref() == Some(tracking_number))
            .cloned())
    }

    fn update_delivery_status(
        &self,
        id: &NoticeId,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, RepositoryError> {
        let mut state = self.lock()?;
        let notice = state.notices.get_mut(id).ok_or(RepositoryError::NotFound)?;
        let outcome = apply_delivery_update(notice.delivery_status, status);
        if outcome.is_applied() {
            notice.delivery_status = status;
            notice.status_updated_at = Some(at);
        }
        Ok(outcome)
    }
}
