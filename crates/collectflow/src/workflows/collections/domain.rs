use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::sequence::SequenceStep;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Tenant boundary; every core operation is scoped by one.
    OrganizationId,
    "org"
);
string_id!(CustomerId, "cus");
string_id!(InvoiceId, "inv");
string_id!(SequenceId, "seq");
string_id!(StepId, "step");
string_id!(EnrollmentId, "enr");
string_id!(CampaignId, "cmp");
string_id!(MessageId, "msg");
string_id!(InboundMessageId, "inb");

/// Delivery channel for a reminder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    Email,
}

impl Channel {
    pub const fn label(self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The business sending the reminders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
    pub phone: Option<String>,
}

/// Customer contact and consent record, owned by the CRM layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub organization_id: OrganizationId,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    /// Two-letter US state code, used to infer the customer's timezone.
    pub state: Option<String>,
    pub sms_consent_given: bool,
    pub sms_consent_date: Option<DateTime<Utc>>,
    pub sms_consent_method: Option<String>,
    pub sms_opted_out: bool,
    pub sms_opted_out_at: Option<DateTime<Utc>>,
    pub email_consent_given: bool,
    pub email_opted_out: bool,
    pub email_opted_out_at: Option<DateTime<Utc>>,
}

impl Customer {
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or(&self.name)
    }

    pub fn has_phone(&self) -> bool {
        self.phone
            .as_deref()
            .is_some_and(|phone| !phone.trim().is_empty())
    }

    pub fn has_email(&self) -> bool {
        self.email
            .as_deref()
            .is_some_and(|email| !email.trim().is_empty())
    }

    /// A consented, non-opted-out phone or a non-opted-out email.
    pub fn has_usable_contact(&self) -> bool {
        let sms = self.has_phone() && self.sms_consent_given && !self.sms_opted_out;
        let email = self.has_email() && !self.email_opted_out;
        sms || email
    }

    pub fn address_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Sms => self.phone.as_deref(),
            Channel::Email => self.email.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Open,
    Overdue,
    Paid,
    Void,
}

impl InvoiceStatus {
    pub const fn is_collectible(self) -> bool {
        matches!(self, InvoiceStatus::Open | InvoiceStatus::Overdue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub organization_id: OrganizationId,
    pub customer_id: CustomerId,
    pub invoice_number: String,
    pub amount_due_cents: i64,
    pub due_date: NaiveDate,
    pub status: InvoiceStatus,
    pub payment_link: Option<String>,
}

/// What an enrollment is collecting on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EnrollmentTarget {
    Invoice {
        customer_id: CustomerId,
        invoice_id: InvoiceId,
    },
    CustomerOnly {
        customer_id: CustomerId,
    },
}

impl EnrollmentTarget {
    pub fn customer_id(&self) -> &CustomerId {
        match self {
            EnrollmentTarget::Invoice { customer_id, .. }
            | EnrollmentTarget::CustomerOnly { customer_id } => customer_id,
        }
    }

    pub fn invoice_id(&self) -> Option<&InvoiceId> {
        match self {
            EnrollmentTarget::Invoice { invoice_id, .. } => Some(invoice_id),
            EnrollmentTarget::CustomerOnly { .. } => None,
        }
    }
}

/// At most one live enrollment may exist per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnrollmentKey {
    pub organization_id: OrganizationId,
    pub sequence_id: SequenceId,
    pub target: EnrollmentTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Stopped,
}

impl EnrollmentStatus {
    pub const fn is_live(self) -> bool {
        matches!(self, EnrollmentStatus::Active | EnrollmentStatus::Paused)
    }

    pub const fn label(self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::Stopped => "stopped",
        }
    }
}

/// Caller-supplied reason for ending an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Paid,
    OptedOut,
    Manual,
}

/// Why a non-active enrollment ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    SequenceFinished,
    InvoicePaid,
    OptedOut,
    Manual,
    ComplianceBlocked,
    TemplateFailure,
}

impl From<TerminationReason> for EndReason {
    fn from(value: TerminationReason) -> Self {
        match value {
            TerminationReason::Paid => EndReason::InvoicePaid,
            TerminationReason::OptedOut => EndReason::OptedOut,
            TerminationReason::Manual => EndReason::Manual,
        }
    }
}

impl EndReason {
    /// Paid invoices and finished sequences complete; everything else stops.
    pub const fn terminal_status(self) -> EnrollmentStatus {
        match self {
            EndReason::SequenceFinished | EndReason::InvoicePaid => EnrollmentStatus::Completed,
            _ => EnrollmentStatus::Stopped,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            EndReason::SequenceFinished => "sequence_finished",
            EndReason::InvoicePaid => "invoice_paid",
            EndReason::OptedOut => "opted_out",
            EndReason::Manual => "manual",
            EndReason::ComplianceBlocked => "compliance_blocked",
            EndReason::TemplateFailure => "template_failure",
        }
    }
}

/// A customer's (or invoice's) participation in a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: EnrollmentId,
    pub organization_id: OrganizationId,
    pub sequence_id: SequenceId,
    pub campaign_id: CampaignId,
    pub target: EnrollmentTarget,
    pub status: EnrollmentStatus,
    pub enrolled_at: DateTime<Utc>,
    /// Step definitions copied from the template when the enrollment was created.
    pub steps: Vec<SequenceStep>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl Enrollment {
    pub fn key(&self) -> EnrollmentKey {
        EnrollmentKey {
            organization_id: self.organization_id.clone(),
            sequence_id: self.sequence_id.clone(),
            target: self.target.clone(),
        }
    }

    pub fn customer_id(&self) -> &CustomerId {
        self.target.customer_id()
    }

    pub fn step(&self, step_number: u32) -> Option<&SequenceStep> {
        self.steps.iter().find(|step| step.step_number == step_number)
    }

    pub fn step_after(&self, step_number: u32) -> Option<&SequenceStep> {
        self.steps
            .iter()
            .filter(|step| step.step_number > step_number)
            .min_by_key(|step| step.step_number)
    }

    pub fn first_step(&self) -> Option<&SequenceStep> {
        self.steps.iter().min_by_key(|step| step.step_number)
    }

    pub fn uses_channel(&self, channel: Channel) -> bool {
        self.steps.iter().any(|step| step.channel == channel)
    }

    /// Earliest moment a step may fire: enrollment time plus every delay up to and including it.
    pub fn earliest_send_for(&self, step_number: u32) -> DateTime<Utc> {
        let offset: i64 = self
            .steps
            .iter()
            .filter(|step| step.step_number <= step_number)
            .map(|step| i64::from(step.delay_days))
            .sum();
        chrono::Duration::try_days(offset)
            .and_then(|offset| self.enrolled_at.checked_add_signed(offset))
            .unwrap_or(if offset < 0 {
                DateTime::<Utc>::MIN_UTC
            } else {
                DateTime::<Utc>::MAX_UTC
            })
    }
}

/// A batch of enrollments created by a single enroll call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub organization_id: OrganizationId,
    pub sequence_id: SequenceId,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    /// Claimed by a dispatcher pass.
    Processing,
    Sent,
    Failed,
    Cancelled,
}

impl MessageStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Failed | MessageStatus::Cancelled
        )
    }

    pub const fn label(self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Cancelled => "cancelled",
        }
    }
}

/// A concrete, time-stamped instance of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: MessageId,
    pub organization_id: OrganizationId,
    pub enrollment_id: EnrollmentId,
    pub step_id: StepId,
    pub step_number: u32,
    pub target: EnrollmentTarget,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: MessageStatus,
    pub failure_count: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub last_error: Option<String>,
}

impl ScheduledMessage {
    pub fn customer_id(&self) -> &CustomerId {
        self.target.customer_id()
    }
}

/// Terminal or deferring result applied to a claimed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageResolution {
    /// Carries the subject and body exactly as they went out.
    Sent {
        provider_message_id: String,
        subject: Option<String>,
        body: String,
    },
    Failed {
        failure_count: u32,
        error: String,
    },
    Cancelled {
        reason: String,
    },
    /// Back to pending for a later pass.
    Deferred {
        scheduled_for: DateTime<Utc>,
        failure_count: u32,
        note: Option<String>,
    },
}

/// A reply received from a customer that was not a consent keyword.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: InboundMessageId,
    pub organization_id: Option<OrganizationId>,
    pub customer_id: Option<CustomerId>,
    pub channel: Channel,
    pub from: String,
    pub subject: Option<String>,
    pub body: String,
    pub provider_message_id: Option<String>,
    pub received_at: DateTime<Utc>,
}
