use chrono::{DateTime, Utc};

use super::domain::{
    Channel, Customer, Enrollment, EnrollmentTarget, MessageId, MessageStatus, Organization,
    ScheduledMessage,
};
use super::repository::CollectionsRepository;
use super::sequence::SequenceStep;
use super::template::{self, TemplateContext, TemplateError};
use crate::workflows::store::RepositoryError;

const SMS_OPT_OUT_FOOTER: &str = "Reply STOP to opt out.";

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("{kind} {id} not found")]
    MissingRecord { kind: &'static str, id: String },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Look up everything a step body can reference for this enrollment target,
/// with day counts measured at `as_of`.
pub(crate) fn template_context<R>(
    repository: &R,
    organization: &Organization,
    customer: &Customer,
    target: &EnrollmentTarget,
    as_of: DateTime<Utc>,
) -> Result<TemplateContext, MaterializeError>
where
    R: CollectionsRepository + ?Sized,
{
    let today = as_of.date_naive();
    let mut context = TemplateContext {
        customer_name: customer.name.clone(),
        first_name: customer.first_name().to_string(),
        business_name: organization.name.clone(),
        business_phone: organization.phone.clone(),
        ..TemplateContext::default()
    };

    match target {
        EnrollmentTarget::Invoice { invoice_id, .. } => {
            let invoice = repository
                .invoice(&organization.id, invoice_id)?
                .ok_or_else(|| MaterializeError::MissingRecord {
                    kind: "invoice",
                    id: invoice_id.to_string(),
                })?;
            context.invoice_number = Some(invoice.invoice_number);
            context.amount_due_cents = invoice.amount_due_cents;
            context.due_date = Some(invoice.due_date);
            context.days_past_due = (today - invoice.due_date).num_days();
            context.invoice_count = 1;
            context.payment_link = invoice.payment_link;
        }
        EnrollmentTarget::CustomerOnly { customer_id } => {
            let mut invoices = repository.open_invoices(&organization.id, customer_id)?;
            invoices.sort_by_key(|invoice| invoice.due_date);
            if let Some(oldest) = invoices.first() {
                context.due_date = Some(oldest.due_date);
                context.days_past_due = (today - oldest.due_date).num_days();
                context.invoice_number = Some(
                    invoices
                        .iter()
                        .map(|invoice| invoice.invoice_number.as_str())
                        .collect::<Vec<_>>()
                        .join(", "),
                );
            }
            if let [only] = invoices.as_slice() {
                context.payment_link = only.payment_link.clone();
            }
            context.amount_due_cents = invoices.iter().map(|invoice| invoice.amount_due_cents).sum();
            context.invoice_count = invoices.len();
        }
    }

    Ok(context)
}

pub(crate) fn render_step(
    step: &SequenceStep,
    context: &TemplateContext,
) -> Result<(Option<String>, String), TemplateError> {
    let subject = step
        .subject
        .as_deref()
        .map(|subject| template::render(subject, context))
        .transpose()?;
    let mut body = template::render(&step.body_template, context)?;
    if step.channel == Channel::Sms && !body.to_ascii_uppercase().contains("STOP") {
        body.push(' ');
        body.push_str(SMS_OPT_OUT_FOOTER);
    }
    Ok((subject, body))
}

fn organization_for<R>(repository: &R, enrollment: &Enrollment) -> Result<Organization, MaterializeError>
where
    R: CollectionsRepository + ?Sized,
{
    repository
        .organization(&enrollment.organization_id)?
        .ok_or_else(|| MaterializeError::MissingRecord {
            kind: "organization",
            id: enrollment.organization_id.to_string(),
        })
}

/// Re-render a step from the enrollment snapshot against the records as they are at `as_of`.
pub(crate) fn render_for_send<R>(
    repository: &R,
    enrollment: &Enrollment,
    customer: &Customer,
    step: &SequenceStep,
    as_of: DateTime<Utc>,
) -> Result<(Option<String>, String), MaterializeError>
where
    R: CollectionsRepository + ?Sized,
{
    let organization = organization_for(repository, enrollment)?;
    let context = template_context(repository, &organization, customer, &enrollment.target, as_of)?;
    Ok(render_step(step, &context)?)
}

/// Build the pending message for a step. The body is a preview rendered as of
/// `scheduled_for`; the dispatcher renders it again right before sending.
pub(crate) fn materialize_step<R>(
    repository: &R,
    enrollment: &Enrollment,
    step: &SequenceStep,
    scheduled_for: DateTime<Utc>,
) -> Result<ScheduledMessage, MaterializeError>
where
    R: CollectionsRepository + ?Sized,
{
    let customer = repository
        .customer(&enrollment.organization_id, enrollment.customer_id())?
        .ok_or_else(|| MaterializeError::MissingRecord {
            kind: "customer",
            id: enrollment.customer_id().to_string(),
        })?;
    let (subject, body) = render_for_send(repository, enrollment, &customer, step, scheduled_for)?;

    Ok(ScheduledMessage {
        id: MessageId::generate(),
        organization_id: enrollment.organization_id.clone(),
        enrollment_id: enrollment.id.clone(),
        step_id: step.id.clone(),
        step_number: step.step_number,
        target: enrollment.target.clone(),
        channel: step.channel,
        subject,
        body,
        scheduled_for,
        status: MessageStatus::Pending,
        failure_count: 0,
        processed_at: None,
        provider_message_id: None,
        last_error: None,
    })
}
