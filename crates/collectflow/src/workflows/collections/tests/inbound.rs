use super::common::*;
use std::sync::Arc;

use crate::workflows::collections::domain::{
    Channel, CustomerId, EndReason, EnrollmentStatus, MessageStatus,
};
use crate::workflows::collections::enrollment::EnrollmentService;
use crate::workflows::collections::inbound::{
    InboundEmail, InboundError, InboundOutcome, InboundService, InboundSms,
    SMS_OPT_IN_CONFIRMATION, SMS_OPT_OUT_CONFIRMATION,
};
use crate::workflows::collections::repository::{ChannelError, CollectionsRepository};
use crate::workflows::store::RepositoryError;
use crate::workflows::store::{AuditAction, AuditLog};

fn sms(from: &str, body: &str) -> InboundSms {
    InboundSms {
        from: from.to_string(),
        body: body.to_string(),
        message_sid: Some("SM0001".to_string()),
    }
}

fn email(from: &str, subject: &str, text: &str) -> InboundEmail {
    InboundEmail {
        from: from.to_string(),
        subject: Some(subject.to_string()),
        text: Some(text.to_string()),
        html: None,
    }
}

#[tokio::test]
async fn stop_reply_opts_out_and_stops_every_live_enrollment() {
    let store = seeded_store();
    let sender = Arc::new(RecordingSender::default());
    let enrollments = EnrollmentService::new(store.clone());
    let inbound = InboundService::new(store.clone(), sender.clone());
    let now = business_hours();
    let first = enroll_invoice(&enrollments, standard_sequence_id(), "inv_1001", now);
    let second = enroll_invoice(&enrollments, sms_only_sequence_id(), "inv_1004", now);

    // Carrier formats differ from what the business typed in.
    let outcome = inbound
        .handle_sms(sms("+15125550100", " Stop "), now)
        .await
        .expect("opt-out handled");

    assert_eq!(
        outcome,
        InboundOutcome::OptedOut {
            channel: Channel::Sms,
            customers: 1,
            enrollments_stopped: 2,
            confirmation_sent: true,
        }
    );

    let customer = store
        .customer(&org_id(), &CustomerId::from("cus_dana"))
        .expect("lookup")
        .expect("stored");
    assert!(customer.sms_opted_out);
    assert_eq!(customer.sms_opted_out_at, Some(now));

    for id in [&first, &second] {
        let enrollment = store.enrollment(id).expect("lookup").expect("stored");
        assert_eq!(enrollment.status, EnrollmentStatus::Stopped);
        assert_eq!(enrollment.end_reason, Some(EndReason::OptedOut));
        let messages = store.messages_for_enrollment(id).expect("messages");
        assert!(messages
            .iter()
            .all(|message| message.status == MessageStatus::Cancelled));
    }

    let replies = sender.sent();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].to, "+15125550100");
    assert_eq!(replies[0].body, SMS_OPT_OUT_CONFIRMATION);

    let audit = store.entries_for("cus_dana").expect("audit");
    assert!(audit.iter().any(|entry| entry.action == AuditAction::SmsOptOut));
}

#[tokio::test]
async fn stop_from_unknown_number_is_still_confirmed() {
    let store = seeded_store();
    let sender = Arc::new(RecordingSender::default());
    let inbound = InboundService::new(store.clone(), sender.clone());

    let outcome = inbound
        .handle_sms(sms("+19995550000", "STOP"), business_hours())
        .await
        .expect("handled");

    assert_eq!(
        outcome,
        InboundOutcome::OptedOut {
            channel: Channel::Sms,
            customers: 0,
            enrollments_stopped: 0,
            confirmation_sent: true,
        }
    );
    assert_eq!(sender.sent().len(), 1);
}

#[tokio::test]
async fn repeated_stop_is_idempotent() {
    let store = seeded_store();
    let sender = Arc::new(RecordingSender::default());
    let enrollments = EnrollmentService::new(store.clone());
    let inbound = InboundService::new(store.clone(), sender.clone());
    let now = business_hours();
    enroll_invoice(&enrollments, standard_sequence_id(), "inv_1001", now);

    inbound
        .handle_sms(sms("5125550100", "STOP"), now)
        .await
        .expect("first");
    let again = inbound
        .handle_sms(sms("5125550100", "unsubscribe"), now)
        .await
        .expect("second");

    assert!(matches!(
        again,
        InboundOutcome::OptedOut {
            enrollments_stopped: 0,
            ..
        }
    ));
    let opt_outs = store
        .entries_for("cus_dana")
        .expect("audit")
        .into_iter()
        .filter(|entry| entry.action == AuditAction::SmsOptOut)
        .count();
    assert_eq!(opt_outs, 1);
}

#[tokio::test]
async fn start_reply_restores_consent_with_keyword_method() {
    let store = seeded_store();
    let sender = Arc::new(RecordingSender::default());
    let inbound = InboundService::new(store.clone(), sender.clone());
    let now = business_hours();

    inbound
        .handle_sms(sms("512-555-0142", "STOP"), now)
        .await
        .expect("opt-out");
    let later = now + chrono::Duration::days(2);
    let outcome = inbound
        .handle_sms(sms("512-555-0142", "start"), later)
        .await
        .expect("opt-in");

    assert_eq!(
        outcome,
        InboundOutcome::OptedIn {
            customers: 1,
            confirmation_sent: true,
        }
    );
    let customer = store
        .customer(&org_id(), &CustomerId::from("cus_lee"))
        .expect("lookup")
        .expect("stored");
    assert!(!customer.sms_opted_out);
    assert!(customer.sms_consent_given);
    assert_eq!(customer.sms_consent_date, Some(later));
    assert_eq!(customer.sms_consent_method.as_deref(), Some("sms_keyword"));
    let replies = sender.sent();
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[1].body, SMS_OPT_IN_CONFIRMATION);
}

#[tokio::test]
async fn start_from_unknown_number_sends_nothing() {
    let store = seeded_store();
    let sender = Arc::new(RecordingSender::default());
    let inbound = InboundService::new(store.clone(), sender.clone());

    let outcome = inbound
        .handle_sms(sms("+19995550000", "YES"), business_hours())
        .await
        .expect("handled");

    assert_eq!(
        outcome,
        InboundOutcome::OptedIn {
            customers: 0,
            confirmation_sent: false,
        }
    );
    assert!(sender.sent().is_empty());
}

#[tokio::test]
async fn other_replies_are_recorded_for_follow_up() {
    let store = seeded_store();
    let sender = Arc::new(RecordingSender::default());
    let enrollments = EnrollmentService::new(store.clone());
    let inbound = InboundService::new(store.clone(), sender.clone());
    let now = business_hours();
    let id = enroll_invoice(&enrollments, standard_sequence_id(), "inv_1001", now);

    let outcome = inbound
        .handle_sms(sms("+15125550100", "Please stop texting, I'll pay Friday"), now)
        .await
        .expect("recorded");

    let InboundOutcome::Recorded { customer_id, .. } = outcome else {
        panic!("expected a recorded reply, got {outcome:?}");
    };
    assert_eq!(customer_id, Some(CustomerId::from("cus_dana")));

    let inbound_messages = store.inbound_messages().expect("inbound");
    assert_eq!(inbound_messages.len(), 1);
    assert_eq!(inbound_messages[0].provider_message_id.as_deref(), Some("SM0001"));
    assert_eq!(inbound_messages[0].organization_id, Some(org_id()));

    let enrollment = store.enrollment(&id).expect("lookup").expect("stored");
    assert_eq!(enrollment.status, EnrollmentStatus::Active);
    assert!(sender.sent().is_empty());
}

#[tokio::test]
async fn blank_sender_is_rejected() {
    let store = seeded_store();
    let inbound = InboundService::new(store, Arc::new(RecordingSender::default()));

    let result = inbound.handle_sms(sms("  ", "STOP"), business_hours()).await;

    assert!(matches!(result, Err(InboundError::MissingSender)));
}

#[tokio::test]
async fn store_failure_during_opt_out_still_confirms_and_stops_sending() {
    let store = seeded_store();
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    let sender = Arc::new(RecordingSender::default());
    let enrollments = EnrollmentService::new(store.clone());
    let now = business_hours();
    let id = enroll_invoice(&enrollments, standard_sequence_id(), "inv_1001", now);
    flaky.fail_customer_writes();
    let inbound = InboundService::new(flaky, sender.clone());

    let result = inbound.handle_sms(sms("+15125550100", "STOP"), now).await;

    assert!(matches!(
        result,
        Err(InboundError::Repository(RepositoryError::Unavailable(_)))
    ));
    let replies = sender.sent();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].to, "+15125550100");
    assert_eq!(replies[0].body, SMS_OPT_OUT_CONFIRMATION);
    let enrollment = store.enrollment(&id).expect("lookup").expect("stored");
    assert_eq!(enrollment.status, EnrollmentStatus::Stopped);
}

#[tokio::test]
async fn failed_number_lookup_still_sends_the_opt_out_confirmation() {
    let store = seeded_store();
    let flaky = Arc::new(FlakyStore::new(store));
    flaky.fail_phone_lookups();
    let sender = Arc::new(RecordingSender::default());
    let inbound = InboundService::new(flaky, sender.clone());

    let result = inbound
        .handle_sms(sms("+15125550100", "UNSUBSCRIBE"), business_hours())
        .await;

    assert!(result.is_err());
    let replies = sender.sent();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body, SMS_OPT_OUT_CONFIRMATION);
}

#[tokio::test]
async fn confirmation_failure_does_not_undo_the_opt_out() {
    let store = seeded_store();
    let sender = Arc::new(FailingSender::new(ChannelError::Transport(
        "carrier down".to_string(),
    )));
    let inbound = InboundService::new(store.clone(), sender.clone());

    let outcome = inbound
        .handle_sms(sms("+15125550100", "STOP"), business_hours())
        .await
        .expect("handled");

    assert!(matches!(
        outcome,
        InboundOutcome::OptedOut {
            confirmation_sent: false,
            customers: 1,
            ..
        }
    ));
    let customer = store
        .customer(&org_id(), &CustomerId::from("cus_dana"))
        .expect("lookup")
        .expect("stored");
    assert!(customer.sms_opted_out);
}

#[test]
fn email_opt_out_only_stops_enrollments_that_send_email() {
    let store = seeded_store();
    let enrollments = EnrollmentService::new(store.clone());
    let inbound = InboundService::new(store.clone(), Arc::new(RecordingSender::default()));
    let now = business_hours();
    let mixed = enroll_invoice(&enrollments, standard_sequence_id(), "inv_1001", now);
    let texts = enroll_invoice(&enrollments, sms_only_sequence_id(), "inv_1004", now);

    let outcome = inbound
        .handle_email(
            email(
                "Dana Whitfield <DANA@example.com>",
                "Re: Reminder: invoice INV-1001",
                "Please unsubscribe me from these emails.",
            ),
            now,
        )
        .expect("handled");

    assert_eq!(
        outcome,
        InboundOutcome::OptedOut {
            channel: Channel::Email,
            customers: 1,
            enrollments_stopped: 1,
            confirmation_sent: false,
        }
    );
    let customer = store
        .customer(&org_id(), &CustomerId::from("cus_dana"))
        .expect("lookup")
        .expect("stored");
    assert!(customer.email_opted_out);
    assert!(!customer.sms_opted_out);

    let mixed = store.enrollment(&mixed).expect("lookup").expect("stored");
    assert_eq!(mixed.status, EnrollmentStatus::Stopped);
    let texts = store.enrollment(&texts).expect("lookup").expect("stored");
    assert_eq!(texts.status, EnrollmentStatus::Active);
}

#[test]
fn ordinary_email_reply_is_recorded() {
    let store = seeded_store();
    let inbound = InboundService::new(store.clone(), Arc::new(RecordingSender::default()));

    let outcome = inbound
        .handle_email(
            email(
                "lee@example.com",
                "Re: invoice INV-1003",
                "Check is in the mail, nonstop week here.",
            ),
            business_hours(),
        )
        .expect("handled");

    assert!(matches!(outcome, InboundOutcome::Recorded { .. }));
    let recorded = store.inbound_messages().expect("inbound");
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].channel, Channel::Email);
    assert_eq!(recorded[0].customer_id, Some(CustomerId::from("cus_lee")));
    assert_eq!(recorded[0].subject.as_deref(), Some("Re: invoice INV-1003"));
}
