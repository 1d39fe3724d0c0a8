use std::sync::Arc;

use axum::response::Response;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::clock::ManualClock;
use crate::workflows::collections::domain::{InvoiceId, OrganizationId};
use crate::workflows::liens::router::LiensApi;
use crate::workflows::liens::service::{IssueNotice, NoticeService};
use crate::workflows::liens::notice::NoticeOfIntent;
use crate::workflows::memory::InMemoryStore;

pub(super) const CARRIER_SECRET: &str = "carrier-test-secret";

pub(super) fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 10, 15, 0, 0)
        .single()
        .expect("valid instant")
}

pub(super) fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// California job finished mid-May, notice mailed today.
pub(super) fn california_notice(tracking_number: Option<&str>) -> IssueNotice {
    IssueNotice {
        organization_id: OrganizationId::from("org_ridgeline"),
        invoice_id: InvoiceId::from("inv_1001"),
        state: "ca".to_string(),
        sent_date: date(2025, 6, 10),
        first_work_date: date(2025, 4, 28),
        last_work_date: date(2025, 5, 15),
        tracking_number: tracking_number.map(str::to_string),
    }
}

pub(super) fn build_service() -> (NoticeService<InMemoryStore>, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    (NoticeService::new(store.clone()), store)
}

pub(super) fn issued(
    service: &NoticeService<InMemoryStore>,
    tracking_number: &str,
) -> NoticeOfIntent {
    service
        .issue(california_notice(Some(tracking_number)), now())
        .expect("notice issued")
}

pub(super) fn build_api(store: Arc<InMemoryStore>) -> Arc<LiensApi<InMemoryStore>> {
    Arc::new(LiensApi::new(
        store,
        Arc::new(ManualClock::new(now())),
        Some(CARRIER_SECRET.to_string()),
    ))
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}
