//! Compliance-gated collection campaigns.
//!
//! Sequences of SMS/email reminders are enrolled per invoice or per customer,
//! materialized one step at a time, and fired by the dispatcher only after the
//! compliance gate clears the customer's current consent and local time.

pub mod compliance;
pub mod dispatcher;
pub mod domain;
pub mod enrollment;
pub mod inbound;
pub(crate) mod materialize;
pub mod repository;
pub mod router;
pub mod sequence;
pub mod template;

#[cfg(test)]
mod tests;

pub use compliance::{ComplianceBlocker, ComplianceDecision, ComplianceWarning};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use domain::{
    Campaign, CampaignId, Channel, Customer, CustomerId, EndReason, Enrollment, EnrollmentId,
    EnrollmentStatus, EnrollmentTarget, InboundMessage, Invoice, InvoiceId, InvoiceStatus,
    MessageId, MessageStatus, Organization, OrganizationId, ScheduledMessage, SequenceId, StepId,
    TerminationReason,
};
pub use enrollment::{
    EnrollRequest, EnrollmentMode, EnrollmentService, EnrollmentServiceError, EnrollmentSummary,
    SkipReason, TargetResult, TerminationOutcome,
};
pub use inbound::{InboundEmail, InboundError, InboundOutcome, InboundService, InboundSms};
pub use materialize::MaterializeError;
pub use repository::{
    ChannelError, ChannelSender, CollectionsRepository, DeliveryReceipt, OutboundMessage,
};
pub use router::{collections_router, CollectionsApi};
pub use sequence::{SequenceError, SequenceStep, SequenceTemplate};
pub use template::{TemplateContext, TemplateError, TemplateVariable};
