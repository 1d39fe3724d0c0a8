//! Reply webhook adapter: turns inbound SMS/email into consent changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::domain::{Channel, Customer, CustomerId, InboundMessage, InboundMessageId};
use super::enrollment::{EnrollmentService, EnrollmentServiceError};
use super::repository::{ChannelSender, CollectionsRepository, OutboundMessage};
use crate::workflows::store::{AuditAction, AuditEntry, RepositoryError};

const SMS_OPT_OUT_KEYWORDS: &[&str] = &[
    "STOP",
    "STOPALL",
    "UNSUBSCRIBE",
    "CANCEL",
    "END",
    "QUIT",
    "OPT OUT",
    "OPTOUT",
    "REMOVE",
];
const SMS_OPT_IN_KEYWORDS: &[&str] = &["START", "UNSTOP", "YES"];
const EMAIL_OPT_OUT_KEYWORDS: &[&str] = &[
    "UNSUBSCRIBE",
    "STOP",
    "REMOVE",
    "OPT OUT",
    "OPTOUT",
    "CANCEL",
    "DELETE",
];

pub const SMS_OPT_OUT_CONFIRMATION: &str =
    "You have been unsubscribed and will receive no further messages. Reply START to resubscribe.";
pub const SMS_OPT_IN_CONFIRMATION: &str =
    "You have been resubscribed to payment reminders. Reply STOP to opt out.";
const SMS_CONSENT_METHOD: &str = "sms_keyword";

/// Carrier form post (`From`, `Body`, `MessageSid`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From", default)]
    pub from: String,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "MessageSid", default)]
    pub message_sid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundEmail {
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmsKeyword {
    OptOut,
    OptIn,
}

/// Exact keyword match on the trimmed, case-folded body.
pub fn classify_sms(body: &str) -> Option<SmsKeyword> {
    let normalized = body.split_whitespace().collect::<Vec<_>>().join(" ").to_ascii_uppercase();
    if SMS_OPT_OUT_KEYWORDS.contains(&normalized.as_str()) {
        Some(SmsKeyword::OptOut)
    } else if SMS_OPT_IN_KEYWORDS.contains(&normalized.as_str()) {
        Some(SmsKeyword::OptIn)
    } else {
        None
    }
}

/// Whole-word, case-insensitive keyword search over subject and body.
///
/// "Stop by Friday" still counts; "nonstop" and "deleted" do not.
pub fn email_requests_opt_out(email: &InboundEmail) -> bool {
    let words = words(&email_text(email));
    EMAIL_OPT_OUT_KEYWORDS.iter().any(|keyword| {
        let needle: Vec<&str> = keyword.split(' ').collect();
        words
            .windows(needle.len())
            .any(|window| window.iter().zip(&needle).all(|(word, want)| word == want))
    })
}

/// `"Jane Doe <jane@example.com>"` -> `jane@example.com`.
pub fn extract_address(from: &str) -> String {
    let trimmed = from.trim();
    match (trimmed.rfind('<'), trimmed.rfind('>')) {
        (Some(start), Some(end)) if start < end => trimmed[start + 1..end].trim().to_string(),
        _ => trimmed.to_string(),
    }
}

fn email_text(email: &InboundEmail) -> String {
    let body = match (&email.text, &email.html) {
        (Some(text), _) if !text.trim().is_empty() => text.clone(),
        (_, Some(html)) => strip_tags(html),
        _ => String::new(),
    };
    match &email.subject {
        Some(subject) => format!("{subject}\n{body}"),
        None => body,
    }
}

fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text
}

fn words(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_ascii_uppercase)
        .collect()
}

/// What an inbound message changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum InboundOutcome {
    OptedOut {
        channel: Channel,
        customers: usize,
        enrollments_stopped: usize,
        confirmation_sent: bool,
    },
    OptedIn {
        customers: usize,
        confirmation_sent: bool,
    },
    Recorded {
        inbound_id: InboundMessageId,
        customer_id: Option<CustomerId>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum InboundError {
    #[error("inbound message has no sender")]
    MissingSender,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentServiceError),
}

pub struct InboundService<R, C> {
    repository: Arc<R>,
    sender: Arc<C>,
    enrollments: EnrollmentService<R>,
}

impl<R, C> InboundService<R, C>
where
    R: CollectionsRepository + 'static,
    C: ChannelSender + 'static,
{
    pub fn new(repository: Arc<R>, sender: Arc<C>) -> Self {
        Self {
            enrollments: EnrollmentService::new(repository.clone()),
            repository,
            sender,
        }
    }

    pub async fn handle_sms(
        &self,
        sms: InboundSms,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, InboundError> {
        let from = sms.from.trim().to_string();
        if from.is_empty() {
            return Err(InboundError::MissingSender);
        }
        let keyword = classify_sms(&sms.body);
        let lookup = self.repository.customers_by_phone(&from);

        match keyword {
            Some(SmsKeyword::OptOut) => {
                let applied = lookup.map_err(InboundError::from).and_then(|customers| {
                    let stopped = self.opt_out_sms(&customers, sms.body.trim(), now)?;
                    Ok((customers.len(), stopped))
                });

                // The confirmation is owed even when the number matches nobody or the store failed.
                let confirmation_sent = self.reply(&from, SMS_OPT_OUT_CONFIRMATION).await;
                let (customers, enrollments_stopped) = applied?;
                if customers == 0 {
                    warn!(from = %from, "sms opt-out from unknown number");
                }
                info!(from = %from, customers, enrollments_stopped, "sms opt-out processed");
                Ok(InboundOutcome::OptedOut {
                    channel: Channel::Sms,
                    customers,
                    enrollments_stopped,
                    confirmation_sent,
                })
            }
            Some(SmsKeyword::OptIn) => {
                let customers = lookup?;
                for mut customer in customers.iter().cloned() {
                    customer.sms_opted_out = false;
                    customer.sms_opted_out_at = None;
                    customer.sms_consent_given = true;
                    customer.sms_consent_date = Some(now);
                    customer.sms_consent_method = Some(SMS_CONSENT_METHOD.to_string());
                    self.repository.update_customer(customer.clone())?;
                    self.audit(&customer, AuditAction::SmsOptIn, format!("keyword '{}'", sms.body.trim()), now)?;
                }
                info!(from = %from, customers = customers.len(), "sms opt-in processed");
                let confirmation_sent = if customers.is_empty() {
                    false
                } else {
                    self.reply(&from, SMS_OPT_IN_CONFIRMATION).await
                };
                Ok(InboundOutcome::OptedIn {
                    customers: customers.len(),
                    confirmation_sent,
                })
            }
            None => {
                let customers = lookup?;
                self.record(
                    Channel::Sms,
                    from,
                    None,
                    sms.body,
                    sms.message_sid,
                    customers.first(),
                    now,
                )
            }
        }
    }

    pub fn handle_email(
        &self,
        email: InboundEmail,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, InboundError> {
        let address = extract_address(&email.from);
        if address.is_empty() {
            return Err(InboundError::MissingSender);
        }
        let customers = self.repository.customers_by_email(&address)?;

        if email_requests_opt_out(&email) {
            let mut enrollments_stopped = 0;
            for mut customer in customers.iter().cloned() {
                if !customer.email_opted_out {
                    customer.email_opted_out = true;
                    customer.email_opted_out_at = Some(now);
                    self.repository.update_customer(customer.clone())?;
                    self.audit(&customer, AuditAction::EmailOptOut, format!("reply from {address}"), now)?;
                }
                enrollments_stopped += self
                    .enrollments
                    .on_customer_opt_out(&customer.organization_id, &customer.id, Channel::Email, now)?
                    .iter()
                    .filter(|outcome| !outcome.already_terminated)
                    .count();
            }
            info!(from = %address, customers = customers.len(), enrollments_stopped, "email opt-out processed");
            return Ok(InboundOutcome::OptedOut {
                channel: Channel::Email,
                customers: customers.len(),
                enrollments_stopped,
                confirmation_sent: false,
            });
        }

        let body = match (&email.text, &email.html) {
            (Some(text), _) if !text.trim().is_empty() => text.clone(),
            (_, Some(html)) => strip_tags(html).trim().to_string(),
            _ => String::new(),
        };
        self.record(Channel::Email, address, email.subject, body, None, customers.first(), now)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        channel: Channel,
        from: String,
        subject: Option<String>,
        body: String,
        provider_message_id: Option<String>,
        customer: Option<&Customer>,
        now: DateTime<Utc>,
    ) -> Result<InboundOutcome, InboundError> {
        let message = InboundMessage {
            id: InboundMessageId::generate(),
            organization_id: customer.map(|customer| customer.organization_id.clone()),
            customer_id: customer.map(|customer| customer.id.clone()),
            channel,
            from,
            subject,
            body,
            provider_message_id,
            received_at: now,
        };
        let outcome = InboundOutcome::Recorded {
            inbound_id: message.id.clone(),
            customer_id: message.customer_id.clone(),
        };
        info!(inbound_id = %message.id, channel = %channel, matched = message.customer_id.is_some(), "inbound message recorded");
        self.repository.insert_inbound(message)?;
        Ok(outcome)
    }

    /// Opt every matching customer out, carrying on past individual failures.
    /// Returns how many live enrollments were stopped, or the first error seen.
    fn opt_out_sms(
        &self,
        customers: &[Customer],
        keyword: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, InboundError> {
        let mut stopped = 0;
        let mut first_error = None;
        for customer in customers {
            match self.opt_out_sms_customer(customer.clone(), keyword, now) {
                Ok(count) => stopped += count,
                Err(err) => {
                    error!(customer_id = %customer.id, error = %err, "sms opt-out failed for customer");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(stopped),
        }
    }

    /// Stops the customer's enrollments even when saving the opt-out flag fails.
    fn opt_out_sms_customer(
        &self,
        mut customer: Customer,
        keyword: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, InboundError> {
        let flagged = if customer.sms_opted_out {
            Ok(())
        } else {
            customer.sms_opted_out = true;
            customer.sms_opted_out_at = Some(now);
            self.repository
                .update_customer(customer.clone())
                .map_err(InboundError::from)
                .and_then(|()| {
                    self.audit(&customer, AuditAction::SmsOptOut, format!("keyword '{keyword}'"), now)
                })
        };
        let stopped = self
            .enrollments
            .on_customer_opt_out(&customer.organization_id, &customer.id, Channel::Sms, now)?
            .iter()
            .filter(|outcome| !outcome.already_terminated)
            .count();
        flagged.map(|()| stopped)
    }

    async fn reply(&self, to: &str, body: &str) -> bool {
        let message = OutboundMessage {
            channel: Channel::Sms,
            to: to.to_string(),
            subject: None,
            body: body.to_string(),
            reference: None,
        };
        match self.sender.send(&message).await {
            Ok(_) => true,
            Err(err) => {
                error!(to, error = %err, "failed to send consent confirmation");
                false
            }
        }
    }

    fn audit(
        &self,
        customer: &Customer,
        action: AuditAction,
        detail: String,
        now: DateTime<Utc>,
    ) -> Result<(), InboundError> {
        self.repository.append(AuditEntry::new(
            Some(customer.organization_id.clone()),
            action,
            customer.id.as_str(),
            detail,
            now,
        ))?;
        Ok(())
    }
}
