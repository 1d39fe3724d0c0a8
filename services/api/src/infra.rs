use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use collectflow::workflows::collections::{
    Channel, ChannelError, ChannelSender, Customer, CustomerId, DeliveryReceipt, Invoice,
    InvoiceId, InvoiceStatus, Organization, OrganizationId, OutboundMessage, SequenceId,
    SequenceStep, SequenceTemplate, StepId,
};
use collectflow::workflows::memory::InMemoryStore;
use collectflow::workflows::store::RepositoryError;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Stand-in for the SMS/email providers: every message is logged and accepted.
#[derive(Debug, Default)]
pub(crate) struct LoggingChannelSender {
    delivered: AtomicU64,
}

impl LoggingChannelSender {
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelSender for LoggingChannelSender {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        let sequence = self.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            channel = %message.channel,
            to = %message.to,
            subject = message.subject.as_deref().unwrap_or(""),
            reference = message.reference.as_deref().unwrap_or(""),
            body = %message.body,
            "outbound message"
        );
        Ok(DeliveryReceipt {
            provider_message_id: format!("log_{sequence:06}"),
        })
    }
}

pub(crate) const DEMO_ORGANIZATION: &str = "org_demo";
pub(crate) const DEMO_SEQUENCE: &str = "seq_demo_standard";

fn demo_step(
    number: u32,
    delay_days: i32,
    channel: Channel,
    subject: Option<&str>,
    body: &str,
) -> SequenceStep {
    SequenceStep {
        id: StepId::from(format!("{DEMO_SEQUENCE}_{number}").as_str()),
        step_number: number,
        delay_days,
        channel,
        subject: subject.map(str::to_string),
        body_template: body.to_string(),
    }
}

/// One organization, a three-step reminder sequence, two customers and their invoices.
pub(crate) fn seed_demo_data(store: &InMemoryStore, now: DateTime<Utc>) -> Result<(), RepositoryError> {
    let organization_id = OrganizationId::from(DEMO_ORGANIZATION);
    store.insert_organization(Organization {
        id: organization_id.clone(),
        name: "Summit Roofing".to_string(),
        phone: Some("(303) 555-0148".to_string()),
    })?;

    let sequence = SequenceTemplate::new(
        SequenceId::from(DEMO_SEQUENCE),
        organization_id.clone(),
        "Standard overdue reminders",
        vec![
            demo_step(
                1,
                0,
                Channel::Sms,
                None,
                "Hi {{first_name}}, invoice {{invoice_number}} for {{amount_due}} from {{business_name}} is {{days_past_due}} days past due.",
            ),
            demo_step(
                2,
                3,
                Channel::Email,
                Some("Invoice {{invoice_number}} is past due"),
                "Hello {{customer_name}},\n\nWe still show {{amount_due}} open on invoice {{invoice_number}}, due {{due_date}}.\n\n{{business_name}}",
            ),
            demo_step(
                3,
                7,
                Channel::Sms,
                None,
                "{{business_name}}: final reminder for {{amount_due}}. Call {{business_phone}} with questions.",
            ),
        ],
        14,
    )
    .map_err(|err| RepositoryError::Unavailable(format!("demo sequence invalid: {err}")))?;
    store.upsert_sequence(sequence)?;

    let customers = [
        ("cus_demo_avery", "Avery Brooks", "+1 303 555 0101", "avery@example.com", "CO"),
        ("cus_demo_jordan", "Jordan Pike", "+1 512 555 0102", "jordan@example.com", "TX"),
    ];
    for (id, name, phone, email, state) in customers {
        store.insert_customer(Customer {
            id: CustomerId::from(id),
            organization_id: organization_id.clone(),
            name: name.to_string(),
            phone: Some(phone.to_string()),
            email: Some(email.to_string()),
            state: Some(state.to_string()),
            sms_consent_given: true,
            sms_consent_date: Some(now - Duration::days(120)),
            sms_consent_method: Some("signed_estimate".to_string()),
            sms_opted_out: false,
            sms_opted_out_at: None,
            email_consent_given: true,
            email_opted_out: false,
            email_opted_out_at: None,
        })?;
    }

    let invoices = [
        ("inv_demo_3101", "cus_demo_avery", "SR-3101", 486_000, 32),
        ("inv_demo_3102", "cus_demo_jordan", "SR-3102", 129_550, 18),
    ];
    for (id, customer, number, cents, days_overdue) in invoices {
        store.insert_invoice(Invoice {
            id: InvoiceId::from(id),
            organization_id: organization_id.clone(),
            customer_id: CustomerId::from(customer),
            invoice_number: number.to_string(),
            amount_due_cents: cents,
            due_date: now.date_naive() - Duration::days(days_overdue),
            status: InvoiceStatus::Overdue,
            payment_link: Some(format!("https://pay.example.com/{number}")),
        })?;
    }

    info!(organization_id = DEMO_ORGANIZATION, "demo data seeded");
    Ok(())
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}
