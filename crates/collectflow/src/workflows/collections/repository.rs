use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{
    Campaign, Channel, Customer, CustomerId, EndReason, Enrollment, EnrollmentId, EnrollmentKey,
    EnrollmentStatus, InboundMessage, Invoice, InvoiceId, MessageId, MessageResolution,
    Organization, OrganizationId, ScheduledMessage, SequenceId,
};
use super::sequence::SequenceTemplate;
use crate::workflows::store::{AuditLog, RepositoryError};

/// Storage abstraction for the collections workflow.
///
/// Every method that changes a status is a conditional update: it only applies
/// when the row is still in the expected state and reports whether it did, so
/// concurrent dispatcher instances never act on the same message twice.
pub trait CollectionsRepository: AuditLog {
    fn organization(&self, id: &OrganizationId) -> Result<Option<Organization>, RepositoryError>;
    fn sequence(
        &self,
        organization_id: &OrganizationId,
        id: &SequenceId,
    ) -> Result<Option<SequenceTemplate>, RepositoryError>;

    fn customer(
        &self,
        organization_id: &OrganizationId,
        id: &CustomerId,
    ) -> Result<Option<Customer>, RepositoryError>;
    fn update_customer(&self, customer: Customer) -> Result<(), RepositoryError>;
    /// Customers across every organization whose phone matches (digits only, last ten).
    fn customers_by_phone(&self, phone: &str) -> Result<Vec<Customer>, RepositoryError>;
    /// Case-insensitive match across every organization.
    fn customers_by_email(&self, email: &str) -> Result<Vec<Customer>, RepositoryError>;

    fn invoice(
        &self,
        organization_id: &OrganizationId,
        id: &InvoiceId,
    ) -> Result<Option<Invoice>, RepositoryError>;
    fn open_invoices(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Invoice>, RepositoryError>;

    fn insert_campaign(&self, campaign: Campaign) -> Result<(), RepositoryError>;

    fn live_enrollment(&self, key: &EnrollmentKey) -> Result<Option<Enrollment>, RepositoryError>;
    /// Fails with `Conflict` when a live enrollment already holds the same key.
    fn insert_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment, RepositoryError>;
    fn enrollment(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError>;
    fn live_enrollments_for_customer(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Enrollment>, RepositoryError>;
    fn live_enrollments_for_invoice(
        &self,
        organization_id: &OrganizationId,
        invoice_id: &InvoiceId,
    ) -> Result<Vec<Enrollment>, RepositoryError>;
    /// Moves a live enrollment to the reason's terminal status; `false` when it was not live.
    fn end_enrollment(
        &self,
        id: &EnrollmentId,
        reason: EndReason,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// `from -> to`, only when the enrollment is currently `from`.
    fn transition_enrollment(
        &self,
        id: &EnrollmentId,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> Result<bool, RepositoryError>;

    fn insert_message(&self, message: ScheduledMessage) -> Result<(), RepositoryError>;
    fn message(&self, id: &MessageId) -> Result<Option<ScheduledMessage>, RepositoryError>;
    fn messages_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;
    /// Pending messages with `scheduled_for <= now`, oldest first.
    fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError>;
    /// `pending -> processing`; `false` when another worker got there first.
    fn claim_message(&self, id: &MessageId) -> Result<bool, RepositoryError>;
    /// Applies a resolution to a message this worker holds in `processing`.
    fn resolve_message(
        &self,
        id: &MessageId,
        resolution: MessageResolution,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
    /// Cancels every `pending` message of the enrollment and returns how many changed.
    fn cancel_pending_messages(
        &self,
        enrollment_id: &EnrollmentId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, RepositoryError>;
    fn sent_message_count(
        &self,
        customer_id: &CustomerId,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<u32, RepositoryError>;

    fn insert_inbound(&self, message: InboundMessage) -> Result<(), RepositoryError>;
}

/// Provider-agnostic outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub channel: Channel,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    /// Correlates provider callbacks to the scheduled message, when there is one.
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub provider_message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("provider rejected message: {0}")]
    Rejected(String),
    #[error("channel transport unavailable: {0}")]
    Transport(String),
    #[error("send timed out after {0} seconds")]
    Timeout(u64),
}

/// Side-effecting SMS/email adapter (e.g. Twilio or an SMTP relay).
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError>;
}
