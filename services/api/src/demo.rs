use crate::infra::{seed_demo_data, DEMO_ORGANIZATION, DEMO_SEQUENCE};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use clap::Args;
use collectflow::config::DispatcherConfig;
use collectflow::error::AppError;
use collectflow::workflows::clock::{Clock, ManualClock};
use collectflow::workflows::collections::{
    ChannelError, ChannelSender, DeliveryReceipt, Dispatcher, EnrollRequest, EnrollmentMode,
    EnrollmentService, EnrollmentSummary, InboundService, InboundSms, InvoiceId, OrganizationId,
    OutboundMessage, SequenceId, TargetResult,
};
use collectflow::workflows::liens::{
    calculate_lien_deadlines, calculate_response_deadline, statute_for, IssueNotice,
    LienDeadlines, NoticeService,
};
use collectflow::workflows::memory::InMemoryStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// First simulated day (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) start: Option<NaiveDate>,
    /// Number of simulated days to run the dispatcher for.
    #[arg(long, default_value_t = 12)]
    pub(crate) days: u32,
    /// Skip the simulated STOP reply from the second customer.
    #[arg(long)]
    pub(crate) no_opt_out: bool,
}

#[derive(Args, Debug, Default)]
pub(crate) struct DispatchArgs {
    /// Day to run the pass on (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) on: Option<NaiveDate>,
}

#[derive(Args, Debug)]
pub(crate) struct LienDeadlineArgs {
    /// Two-letter state code, e.g. TX
    #[arg(long)]
    pub(crate) state: String,
    /// First day labor or materials were furnished (YYYY-MM-DD)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) first_work: NaiveDate,
    /// Last day labor or materials were furnished (YYYY-MM-DD)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) last_work: NaiveDate,
    /// Date a notice of intent was mailed, to compute the response deadline
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) notice_sent: Option<NaiveDate>,
    /// Evaluation date (defaults to today)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) today: Option<NaiveDate>,
}

pub(crate) fn run_lien_deadlines(args: LienDeadlineArgs) -> Result<(), AppError> {
    let today = args.today.unwrap_or_else(|| Utc::now().date_naive());
    let deadlines = calculate_lien_deadlines(&args.state, args.first_work, args.last_work, today)?;
    render_deadlines(&deadlines, today);

    if let Some(sent) = args.notice_sent {
        let response = calculate_response_deadline(sent, &args.state)?;
        println!("  Notice of intent sent {sent}; response due by {response}");
    }
    Ok(())
}

fn render_deadlines(deadlines: &LienDeadlines, today: NaiveDate) {
    let name = statute_for(deadlines.state)
        .map(|statute| statute.name)
        .unwrap_or(deadlines.state);
    println!("Mechanic's lien deadlines for {name} (as of {today})");
    println!(
        "  Lien filing deadline: {} ({} days, {})",
        deadlines.lien_filing_deadline,
        deadlines.days_until_filing_deadline,
        deadlines.warning_level.label()
    );
    if deadlines.filing_deadline_passed {
        println!("  The filing deadline has passed.");
    }
    match deadlines.preliminary_notice_deadline {
        Some(deadline) => println!("  Preliminary notice due: {deadline}"),
        None => println!("  No preliminary notice required."),
    }
}

/// Prints every outbound message instead of delivering it.
#[derive(Default)]
struct ConsoleSender {
    sent: AtomicUsize,
}

#[async_trait]
impl ChannelSender for ConsoleSender {
    async fn send(&self, message: &OutboundMessage) -> Result<DeliveryReceipt, ChannelError> {
        let count = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        let subject = message
            .subject
            .as_deref()
            .map(|subject| format!(" [{subject}]"))
            .unwrap_or_default();
        println!("    -> {} to {}{subject}: {}", message.channel, message.to, message.body);
        Ok(DeliveryReceipt {
            provider_message_id: format!("demo_{count}"),
        })
    }
}

fn demo_instant(day: NaiveDate) -> DateTime<Utc> {
    // 16:00 UTC lands inside business hours across the continental US.
    Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN)) + Duration::hours(16)
}

fn enroll_demo_invoices(
    enrollments: &EnrollmentService<InMemoryStore>,
    organization_id: &OrganizationId,
    now: DateTime<Utc>,
) -> Result<EnrollmentSummary, AppError> {
    let summary = enrollments.enroll(
        organization_id,
        EnrollRequest {
            sequence_id: SequenceId::from(DEMO_SEQUENCE),
            mode: EnrollmentMode::Invoice,
            target_ids: vec!["inv_demo_3101".to_string(), "inv_demo_3102".to_string()],
            campaign_name: Some("Demo overdue campaign".to_string()),
        },
        now,
    )?;
    Ok(summary)
}

fn print_summary(summary: &EnrollmentSummary) {
    println!(
        "Enrolled {} invoice(s), skipped {}, errors {}",
        summary.enrolled, summary.skipped, summary.errors
    );
    for detail in &summary.details {
        if let TargetResult::Enrolled { first_send_at, .. } = &detail.result {
            println!("  {} first reminder at {first_send_at}", detail.target_id);
        }
    }
}

/// One dispatcher pass over freshly seeded demo data.
pub(crate) async fn run_dispatch(args: DispatchArgs) -> Result<(), AppError> {
    let day = args.on.unwrap_or_else(|| Utc::now().date_naive());
    let now = demo_instant(day);
    let store = Arc::new(InMemoryStore::new());
    seed_demo_data(&store, now)?;

    let sender = Arc::new(ConsoleSender::default());
    let enrollments = EnrollmentService::new(store.clone());
    let summary =
        enroll_demo_invoices(&enrollments, &OrganizationId::from(DEMO_ORGANIZATION), now)?;
    print_summary(&summary);

    let dispatcher = Dispatcher::new(store, sender, DispatcherConfig::default());
    let report = dispatcher.run_once(now).await;
    match serde_json::to_string_pretty(&report) {
        Ok(rendered) => println!("{rendered}"),
        Err(_) => println!("{report:?}"),
    }
    Ok(())
}

pub(crate) async fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let start = args.start.unwrap_or_else(|| Utc::now().date_naive());
    let clock = Arc::new(ManualClock::new(demo_instant(start)));
    let store = Arc::new(InMemoryStore::new());
    seed_demo_data(&store, clock.now())?;

    let sender = Arc::new(ConsoleSender::default());
    let enrollments = EnrollmentService::new(store.clone());
    let inbound = InboundService::new(store.clone(), sender.clone());
    let dispatcher = Dispatcher::new(store.clone(), sender.clone(), DispatcherConfig::default());
    let organization_id = OrganizationId::from(DEMO_ORGANIZATION);

    println!("Collections campaign demo starting {start}");
    let summary = enroll_demo_invoices(&enrollments, &organization_id, clock.now())?;
    print_summary(&summary);

    for day in 0..args.days {
        let now = demo_instant(start + Duration::days(i64::from(day)));
        clock.set(now);
        println!("\nDay {} ({})", day + 1, now.date_naive());

        if day == 2 && !args.no_opt_out {
            println!("  <- SMS from +1 512 555 0102: \"STOP\"");
            let outcome = inbound
                .handle_sms(
                    InboundSms {
                        from: "+15125550102".to_string(),
                        body: "STOP".to_string(),
                        message_sid: None,
                    },
                    now,
                )
                .await;
            match outcome {
                Ok(outcome) => println!("  {outcome:?}"),
                Err(err) => println!("  reply handling failed: {err}"),
            }
        }

        let report = dispatcher.run_once(now).await;
        println!(
            "  dispatcher: {} sent, {} rescheduled, {} cancelled, {} failed",
            report.sent, report.rescheduled, report.cancelled, report.failed
        );
    }

    let last_work = start - Duration::days(45);
    let first_work = last_work - Duration::days(20);
    println!();
    let deadlines = calculate_lien_deadlines("CO", first_work, last_work, start)?;
    render_deadlines(&deadlines, start);

    let notice = NoticeService::new(store).issue(
        IssueNotice {
            organization_id,
            invoice_id: InvoiceId::from("inv_demo_3101"),
            state: "CO".to_string(),
            sent_date: start,
            first_work_date: first_work,
            last_work_date: last_work,
            tracking_number: Some("9400 1000 0000 0000 3101".to_string()),
        },
        clock.now(),
    )?;
    println!(
        "  Notice of intent {} mailed {}; owner response due {}, tracking {}",
        notice.id.0,
        notice.sent_date,
        notice.response_deadline,
        notice.delivery_status.label()
    );
    Ok(())
}
