use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::response::Response;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::config::DispatcherConfig;
use crate::workflows::clock::ManualClock;
use crate::workflows::collections::domain::{
    Campaign, Channel, Customer, CustomerId, EndReason, Enrollment, EnrollmentId, EnrollmentKey,
    EnrollmentStatus, InboundMessage, Invoice, InvoiceId, InvoiceStatus, MessageId,
    MessageResolution, Organization, OrganizationId, ScheduledMessage, SequenceId, StepId,
};
use crate::workflows::collections::enrollment::{
    EnrollRequest, EnrollmentMode, EnrollmentService, TargetResult,
};
use crate::workflows::collections::repository::{
    ChannelError, ChannelSender, CollectionsRepository, DeliveryReceipt, OutboundMessage,
};
use crate::workflows::collections::router::CollectionsApi;
use crate::workflows::collections::sequence::{SequenceStep, SequenceTemplate};
use crate::workflows::collections::Dispatcher;
use crate::workflows::memory::InMemoryStore;
use crate::workflows::store::{AuditEntry, AuditLog, RepositoryError};

pub(super) const CRON_SECRET: &str = "cron-test-secret";

pub(super) fn org_id() -> OrganizationId {
    OrganizationId::from("org_ridgeline")
}

pub(super) fn standard_sequence_id() -> SequenceId {
    SequenceId::from("seq_standard")
}

pub(super) fn sms_only_sequence_id() -> SequenceId {
    SequenceId::from("seq_sms_only")
}

pub(super) fn statement_sequence_id() -> SequenceId {
    SequenceId::from("seq_statement")
}

/// `hh:mm` Central time on Tuesday 2025-06-10 (CDT, UTC-5).
pub(super) fn central(hour: u32, minute: u32) -> DateTime<Utc> {
    chrono_tz::America::Chicago
        .with_ymd_and_hms(2025, 6, 10, hour, minute, 0)
        .single()
        .expect("unambiguous local time")
        .with_timezone(&Utc)
}

pub(super) fn business_hours() -> DateTime<Utc> {
    central(10, 0)
}

pub(super) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

pub(super) fn organization() -> Organization {
    Organization {
        id: org_id(),
        name: "Ridgeline Plumbing".to_string(),
        phone: Some("(512) 555-0199".to_string()),
    }
}

pub(super) fn customer(id: &str, phone: &str, email: &str) -> Customer {
    Customer {
        id: CustomerId::from(id),
        organization_id: org_id(),
        name: "Dana Whitfield".to_string(),
        phone: Some(phone.to_string()),
        email: Some(email.to_string()),
        state: Some("TX".to_string()),
        sms_consent_given: true,
        sms_consent_date: Some(central(9, 0) - chrono::Duration::days(90)),
        sms_consent_method: Some("signed_work_order".to_string()),
        sms_opted_out: false,
        sms_opted_out_at: None,
        email_consent_given: true,
        email_opted_out: false,
        email_opted_out_at: None,
    }
}

pub(super) fn invoice(id: &str, customer_id: &str, number: &str, cents: i64) -> Invoice {
    Invoice {
        id: InvoiceId::from(id),
        organization_id: org_id(),
        customer_id: CustomerId::from(customer_id),
        invoice_number: number.to_string(),
        amount_due_cents: cents,
        due_date: date(2025, 5, 1),
        status: InvoiceStatus::Overdue,
        payment_link: Some(format!("https://pay.example.com/{number}")),
    }
}

pub(super) fn step(
    number: u32,
    delay_days: i32,
    channel: Channel,
    subject: Option<&str>,
    body: &str,
) -> SequenceStep {
    SequenceStep {
        id: StepId::from(format!("step_{number}").as_str()),
        step_number: number,
        delay_days,
        channel,
        subject: subject.map(str::to_string),
        body_template: body.to_string(),
    }
}

/// SMS today, email three days later, SMS four days after that.
pub(super) fn standard_sequence() -> SequenceTemplate {
    SequenceTemplate::new(
        standard_sequence_id(),
        org_id(),
        "Standard reminders",
        vec![
            step(
                1,
                0,
                Channel::Sms,
                None,
                "Hi {{first_name}}, invoice {{invoice_number}} for {{amount_due}} is {{days_past_due}} days past due. Pay at {{payment_link}}",
            ),
            step(
                2,
                3,
                Channel::Email,
                Some("Reminder: invoice {{invoice_number}}"),
                "Hello {{customer_name}}, {{business_name}} is still waiting on {{amount_due}}.",
            ),
            step(
                3,
                4,
                Channel::Sms,
                None,
                "Final notice from {{business_name}}: {{amount_due}} is overdue. Call {{business_phone}}.",
            ),
        ],
        15,
    )
    .expect("valid sequence")
}

pub(super) fn sms_only_sequence() -> SequenceTemplate {
    SequenceTemplate::new(
        sms_only_sequence_id(),
        org_id(),
        "Text nudges",
        vec![
            step(1, 1, Channel::Sms, None, "{{business_name}}: invoice {{invoice_number}} is open."),
            step(2, 2, Channel::Sms, None, "{{business_name}}: {{amount_due}} still due."),
        ],
        30,
    )
    .expect("valid sequence")
}

pub(super) fn statement_sequence() -> SequenceTemplate {
    SequenceTemplate::new(
        statement_sequence_id(),
        org_id(),
        "Monthly statement",
        vec![step(
            1,
            0,
            Channel::Email,
            Some("Your statement from {{business_name}}"),
            "You have {{invoice_count}} open invoices ({{invoice_number}}) totaling {{amount_due}}.",
        )],
        0,
    )
    .expect("valid sequence")
}

/// Store with one organization, three sequences, and:
/// - `cus_dana` owing `inv_1001` and `inv_1004`
/// - `cus_lee` owing `inv_1003`
/// - `cus_nocontact` with no consent and no email, owing `inv_1005`
/// - `inv_1002` already paid
pub(super) fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_organization(organization()).expect("org");
    for sequence in [standard_sequence(), sms_only_sequence(), statement_sequence()] {
        store.upsert_sequence(sequence).expect("sequence");
    }

    store
        .insert_customer(customer("cus_dana", "+1 (512) 555-0100", "dana@example.com"))
        .expect("customer");
    let mut lee = customer("cus_lee", "512-555-0142", "lee@example.com");
    lee.name = "Lee Ortega".to_string();
    store.insert_customer(lee).expect("customer");
    let mut unreachable = customer("cus_nocontact", "512-555-0177", "");
    unreachable.email = None;
    unreachable.sms_consent_given = false;
    store.insert_customer(unreachable).expect("customer");

    store
        .insert_invoice(invoice("inv_1001", "cus_dana", "INV-1001", 125_000))
        .expect("invoice");
    let mut paid = invoice("inv_1002", "cus_dana", "INV-1002", 40_000);
    paid.status = InvoiceStatus::Paid;
    store.insert_invoice(paid).expect("invoice");
    store
        .insert_invoice(invoice("inv_1003", "cus_lee", "INV-1003", 8_950))
        .expect("invoice");
    let mut second = invoice("inv_1004", "cus_dana", "INV-1004", 30_000);
    second.due_date = date(2025, 5, 20);
    store.insert_invoice(second).expect("invoice");
    store
        .insert_invoice(invoice("inv_1005", "cus_nocontact", "INV-1005", 5_000))
        .expect("invoice");
    store
}

pub(super) fn dispatcher_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval_secs: 0,
        batch_size: 50,
        max_attempts: 3,
        retry_backoff_minutes: 15,
        send_timeout_secs: 5,
    }
}

pub(super) fn invoice_request(sequence_id: SequenceId, ids: &[&str]) -> EnrollRequest {
    EnrollRequest {
        sequence_id,
        mode: EnrollmentMode::Invoice,
        target_ids: ids.iter().map(|id| id.to_string()).collect(),
        campaign_name: None,
    }
}

/// Enroll one invoice and return the new enrollment id.
pub(super) fn enroll_invoice(
    service: &EnrollmentService<InMemoryStore>,
    sequence_id: SequenceId,
    invoice_id: &str,
    now: DateTime<Utc>,
) -> EnrollmentId {
    let summary = service
        .enroll(&org_id(), invoice_request(sequence_id, &[invoice_id]), now)
        .expect("enroll succeeds");
    match &summary.details[0].result {
        TargetResult::Enrolled { enrollment_id, .. } => enrollment_id.clone(),
        other => panic!("expected enrollment, got {other:?}"),
    }
}

/// Accepts every message and remembers it.
#[derive(Default)]
pub(super) struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSender {
    pub(super) fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("sender mutex poisoned").clone()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        let mut sent = self.sent.lock().expect("sender mutex poisoned");
        sent.push(message.clone());
        Ok(DeliveryReceipt {
            provider_message_id: format!("prov_{}", sent.len()),
        })
    }
}

/// Fails every send with a fixed error.
pub(super) struct FailingSender {
    error: ChannelError,
    attempts: AtomicUsize,
}

impl FailingSender {
    pub(super) fn new(error: ChannelError) -> Self {
        Self {
            error,
            attempts: AtomicUsize::new(0),
        }
    }

    pub(super) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for FailingSender {
    async fn send(&self, _message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

pub(super) fn build_dispatcher<C>(
    store: Arc<InMemoryStore>,
    sender: Arc<C>,
) -> Dispatcher<InMemoryStore, C>
where
    C: ChannelSender + 'static,
{
    Dispatcher::new(store, sender, dispatcher_config())
}

pub(super) fn build_api(
    store: Arc<InMemoryStore>,
    sender: Arc<RecordingSender>,
    now: DateTime<Utc>,
) -> Arc<CollectionsApi<InMemoryStore, RecordingSender>> {
    Arc::new(CollectionsApi::new(
        store,
        sender,
        Arc::new(ManualClock::new(now)),
        dispatcher_config(),
        Some(CRON_SECRET.to_string()),
    ))
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

/// Wraps the in-memory store and fails selected calls on demand.
pub(super) struct FlakyStore {
    inner: Arc<InMemoryStore>,
    customer_read_failures: AtomicUsize,
    fail_customer_writes: AtomicBool,
    fail_phone_lookups: AtomicBool,
}

impl FlakyStore {
    pub(super) fn new(inner: Arc<InMemoryStore>) -> Self {
        Self {
            inner,
            customer_read_failures: AtomicUsize::new(0),
            fail_customer_writes: AtomicBool::new(false),
            fail_phone_lookups: AtomicBool::new(false),
        }
    }

    /// The next `count` customer reads fail.
    pub(super) fn fail_customer_reads(&self, count: usize) {
        self.customer_read_failures.store(count, Ordering::SeqCst);
    }

    pub(super) fn fail_customer_writes(&self) {
        self.fail_customer_writes.store(true, Ordering::SeqCst);
    }

    pub(super) fn fail_phone_lookups(&self) {
        self.fail_phone_lookups.store(true, Ordering::SeqCst);
    }

    fn unavailable() -> RepositoryError {
        RepositoryError::Unavailable("injected outage".to_string())
    }
}

impl AuditLog for FlakyStore {
    fn append(&self, entry: AuditEntry) -> Result<(), RepositoryError> {
        self.inner.append(entry)
    }

    fn entries_for(&self, subject: &str) -> Result<Vec<AuditEntry>, RepositoryError> {
        self.inner.entries_for(subject)
    }
}

impl CollectionsRepository for FlakyStore {
    fn organization(&self, id: &OrganizationId) -> Result<Option<Organization>, RepositoryError> {
        self.inner.organization(id)
    }

    fn sequence(
        &self,
        organization_id: &OrganizationId,
        id: &SequenceId,
    ) -> Result<Option<SequenceTemplate>, RepositoryError> {
        self.inner.sequence(organization_id, id)
    }

    fn customer(
        &self,
        organization_id: &OrganizationId,
        id: &CustomerId,
    ) -> Result<Option<Customer>, RepositoryError> {
        let failing = self
            .customer_read_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Self::unavailable());
        }
        self.inner.customer(organization_id, id)
    }

    fn update_customer(&self, customer: Customer) -> Result<(), RepositoryError> {
        if self.fail_customer_writes.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.update_customer(customer)
    }

    fn customers_by_phone(&self, phone: &str) -> Result<Vec<Customer>, RepositoryError> {
        if self.fail_phone_lookups.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.customers_by_phone(phone)
    }

    fn customers_by_email(&self, email: &str) -> Result<Vec<Customer>, RepositoryError> {
        self.inner.customers_by_email(email)
    }

    fn invoice(
        &self,
        organization_id: &OrganizationId,
        id: &InvoiceId,
    ) -> Result<Option<Invoice>, RepositoryError> {
        self.inner.invoice(organization_id, id)
    }

    fn open_invoices(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Invoice>, RepositoryError> {
        self.inner.open_invoices(organization_id, customer_id)
    }

    fn insert_campaign(&self, campaign: Campaign) -> Result<(), RepositoryError> {
        self.inner.insert_campaign(campaign)
    }

    fn live_enrollment(&self, key: &EnrollmentKey) -> Result<Option<Enrollment>, RepositoryError> {
        self.inner.live_enrollment(key)
    }

    fn insert_enrollment(&self, enrollment: Enrollment) -> Result<Enrollment, RepositoryError> {
        self.inner.insert_enrollment(enrollment)
    }

    fn enrollment(&self, id: &EnrollmentId) -> Result<Option<Enrollment>, RepositoryError> {
        self.inner.enrollment(id)
    }

    fn live_enrollments_for_customer(
        &self,
        organization_id: &OrganizationId,
        customer_id: &CustomerId,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        self.inner
            .live_enrollments_for_customer(organization_id, customer_id)
    }

    fn live_enrollments_for_invoice(
        &self,
        organization_id: &OrganizationId,
        invoice_id: &InvoiceId,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        self.inner
            .live_enrollments_for_invoice(organization_id, invoice_id)
    }

    fn end_enrollment(
        &self,
        id: &EnrollmentId,
        reason: EndReason,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.end_enrollment(id, reason, at)
    }

    fn transition_enrollment(
        &self,
        id: &EnrollmentId,
        from: EnrollmentStatus,
        to: EnrollmentStatus,
    ) -> Result<bool, RepositoryError> {
        self.inner.transition_enrollment(id, from, to)
    }

    fn insert_message(&self, message: ScheduledMessage) -> Result<(), RepositoryError> {
        self.inner.insert_message(message)
    }

    fn message(&self, id: &MessageId) -> Result<Option<ScheduledMessage>, RepositoryError> {
        self.inner.message(id)
    }

    fn messages_for_enrollment(
        &self,
        enrollment_id: &EnrollmentId,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        self.inner.messages_for_enrollment(enrollment_id)
    }

    fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledMessage>, RepositoryError> {
        self.inner.due_messages(now, limit)
    }

    fn claim_message(&self, id: &MessageId) -> Result<bool, RepositoryError> {
        self.inner.claim_message(id)
    }

    fn resolve_message(
        &self,
        id: &MessageId,
        resolution: MessageResolution,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.inner.resolve_message(id, resolution, at)
    }

    fn cancel_pending_messages(
        &self,
        enrollment_id: &EnrollmentId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<usize, RepositoryError> {
        self.inner.cancel_pending_messages(enrollment_id, reason, at)
    }

    fn sent_message_count(
        &self,
        customer_id: &CustomerId,
        channel: Channel,
        since: DateTime<Utc>,
    ) -> Result<u32, RepositoryError> {
        self.inner.sent_message_count(customer_id, channel, since)
    }

    fn insert_inbound(&self, message: InboundMessage) -> Result<(), RepositoryError> {
        self.inner.insert_inbound(message)
    }
}
