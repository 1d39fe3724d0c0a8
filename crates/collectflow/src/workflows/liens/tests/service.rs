use super::common::*;
use chrono::Duration;

use crate::workflows::collections::domain::OrganizationId;
use crate::workflows::liens::deadlines::LienError;
use crate::workflows::liens::notice::{DeliveryStatus, NoticeId};
use crate::workflows::liens::service::{CarrierOutcome, NoticeError};
use crate::workflows::liens::webhook::CarrierEvent;
use crate::workflows::store::{AuditAction, AuditLog};

fn event(tracking_number: &str, status: &str) -> CarrierEvent {
    CarrierEvent {
        tracking_number: Some(tracking_number.to_string()),
        status: status.to_string(),
        reference: None,
        occurred_at: None,
    }
}

#[test]
fn issuing_computes_both_deadlines_and_starts_pending() {
    let (service, store) = build_service();

    let notice = issued(&service, "9407 1000 0000 0000 0001");

    assert_eq!(notice.state, "CA");
    assert_eq!(notice.response_deadline, date(2025, 6, 20));
    assert_eq!(notice.lien_filing_deadline, date(2025, 8, 13));
    assert_eq!(notice.delivery_status, DeliveryStatus::Pending);
    assert_eq!(service.get(&notice.organization_id, &notice.id).expect("stored"), notice);

    let audit = store.entries_for(notice.id.as_str()).expect("audit");
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action, AuditAction::NoticeIssued);
}

#[test]
fn pennsylvania_allows_thirty_days_to_respond() {
    let (service, _) = build_service();
    let mut request = california_notice(None);
    request.state = "PA".to_string();

    let notice = service.issue(request, now()).expect("issued");

    assert_eq!(notice.response_deadline, date(2025, 7, 10));
    assert!(notice.tracking_number.is_none());
}

#[test]
fn issuing_rejects_bad_input() {
    let (service, _) = build_service();

    let mut unknown = california_notice(None);
    unknown.state = "ZZ".to_string();
    assert!(matches!(
        service.issue(unknown, now()),
        Err(NoticeError::Lien(LienError::UnknownState(_)))
    ));

    let mut backwards = california_notice(None);
    backwards.last_work_date = date(2025, 4, 1);
    assert!(matches!(
        service.issue(backwards, now()),
        Err(NoticeError::Lien(LienError::InvalidWorkDates { .. }))
    ));
}

#[test]
fn tracking_numbers_are_unique() {
    let (service, _) = build_service();
    issued(&service, "9400111");

    let result = service.issue(california_notice(Some("9400111")), now());

    assert!(matches!(result, Err(NoticeError::DuplicateTracking(number)) if number == "9400111"));
}

#[test]
fn unknown_notice_is_not_found() {
    let (service, _) = build_service();

    let result = service.get(
        &OrganizationId::from("org_ridgeline"),
        &NoticeId("noi_missing".to_string()),
    );

    assert!(matches!(result, Err(NoticeError::NotFound(_))));
}

#[test]
fn notices_are_invisible_to_other_organizations() {
    let (service, _) = build_service();
    let notice = issued(&service, "9400333");

    let result = service.get(&OrganizationId::from("org_other"), &notice.id);

    assert!(matches!(result, Err(NoticeError::NotFound(id)) if id == notice.id));
    assert_eq!(
        service
            .get(&notice.organization_id, &notice.id)
            .expect("owner sees it")
            .id,
        notice.id
    );
}

#[test]
fn carrier_events_move_status_forward_once() {
    let (service, store) = build_service();
    let notice = issued(&service, "9400222");

    let in_transit = service
        .handle_carrier_event(event("9400222", "In Transit"), now())
        .expect("handled");
    assert_eq!(in_transit.outcome, CarrierOutcome::Applied);
    assert_eq!(in_transit.notice_id.as_ref(), Some(&notice.id));

    let delivered_at = now() + Duration::days(2);
    let delivered = service
        .handle_carrier_event(event("9400222", "delivered"), delivered_at)
        .expect("handled");
    assert_eq!(delivered.outcome, CarrierOutcome::Applied);

    let replay = service
        .handle_carrier_event(event("9400222", "delivered"), delivered_at + Duration::hours(1))
        .expect("handled");
    assert_eq!(replay.outcome, CarrierOutcome::Duplicate);

    let stored = service.get(&notice.organization_id, &notice.id).expect("stored");
    assert_eq!(stored.delivery_status, DeliveryStatus::Delivered);
    assert_eq!(stored.status_updated_at, Some(delivered_at));

    let changes = store
        .entries_for(notice.id.as_str())
        .expect("audit")
        .into_iter()
        .filter(|entry| entry.action == AuditAction::NoticeStatusChanged)
        .count();
    assert_eq!(changes, 2);
}

#[test]
fn terminal_status_is_sticky_and_late_events_are_stale() {
    let (service, _) = build_service();
    let notice = issued(&service, "9400333");

    service
        .handle_carrier_event(event("9400333", "return_to_sender"), now())
        .expect("handled");
    let late = service
        .handle_carrier_event(event("9400333", "delivered"), now())
        .expect("handled");
    assert_eq!(late.outcome, CarrierOutcome::IgnoredTerminal);

    let other = issued(&service, "9400444");
    service
        .handle_carrier_event(event("9400444", "out_for_delivery"), now())
        .expect("handled");
    let stale = service
        .handle_carrier_event(event("9400444", "label_created"), now())
        .expect("handled");
    assert_eq!(stale.outcome, CarrierOutcome::Stale);

    assert_eq!(
        service.get(&notice.organization_id, &notice.id).expect("stored").delivery_status,
        DeliveryStatus::Returned
    );
    assert_eq!(
        service.get(&other.organization_id, &other.id).expect("stored").delivery_status,
        DeliveryStatus::InTransit
    );
}

#[test]
fn carrier_timestamp_wins_over_receipt_time() {
    let (service, _) = build_service();
    let notice = issued(&service, "9400555");
    let occurred = now() - Duration::hours(6);

    let mut delivered = event("9400555", "delivered");
    delivered.occurred_at = Some(occurred);
    service
        .handle_carrier_event(delivered, now())
        .expect("handled");

    assert_eq!(
        service.get(&notice.organization_id, &notice.id).expect("stored").status_updated_at,
        Some(occurred)
    );
}

#[test]
fn reference_is_used_when_tracking_number_is_unknown() {
    let (service, _) = build_service();
    let notice = service
        .issue(california_notice(None), now())
        .expect("issued");

    let ack = service
        .handle_carrier_event(
            CarrierEvent {
                tracking_number: Some("not-ours".to_string()),
                status: "accepted".to_string(),
                reference: Some(notice.id.to_string()),
                occurred_at: None,
            },
            now(),
        )
        .expect("handled");

    assert!(ack.matched);
    assert_eq!(ack.outcome, CarrierOutcome::Applied);
}

#[test]
fn unmatched_and_unrecognised_events_are_acknowledged() {
    let (service, _) = build_service();
    let notice = issued(&service, "9400666");

    let unmatched = service
        .handle_carrier_event(event("9999999", "delivered"), now())
        .expect("handled");
    assert!(unmatched.received);
    assert!(!unmatched.matched);
    assert_eq!(unmatched.outcome, CarrierOutcome::Unmatched);

    let unknown = service
        .handle_carrier_event(event("9400666", "weather delay"), now())
        .expect("handled");
    assert!(unknown.matched);
    assert_eq!(unknown.outcome, CarrierOutcome::UnknownStatus);
    assert_eq!(
        service.get(&notice.organization_id, &notice.id).expect("stored").delivery_status,
        DeliveryStatus::Pending
    );
}
