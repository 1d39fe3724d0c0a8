use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::workflows::collections::domain::{InvoiceId, OrganizationId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoticeId(pub String);

impl NoticeId {
    pub fn generate() -> Self {
        Self(format!("noi_{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoticeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Certified-mail delivery state. `pending -> in_transit -> {delivered | returned | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InTransit,
    Delivered,
    Returned,
    Failed,
}

impl DeliveryStatus {
    const fn rank(self) -> u8 {
        match self {
            DeliveryStatus::Pending => 0,
            DeliveryStatus::InTransit => 1,
            DeliveryStatus::Delivered | DeliveryStatus::Returned | DeliveryStatus::Failed => 2,
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub const fn label(self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InTransit => "in_transit",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Returned => "returned",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Result of offering a new delivery status to a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    /// Same status redelivered.
    Duplicate,
    /// The notice already reached a terminal status.
    IgnoredTerminal { current: DeliveryStatus },
    /// An older event arriving after a newer one.
    Stale { current: DeliveryStatus },
}

impl TransitionOutcome {
    pub const fn is_applied(self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Transitions only move forward and never leave a terminal status.
pub fn apply_delivery_update(current: DeliveryStatus, next: DeliveryStatus) -> TransitionOutcome {
    if current == next {
        TransitionOutcome::Duplicate
    } else if current.is_terminal() {
        TransitionOutcome::IgnoredTerminal { current }
    } else if next.rank() <= current.rank() {
        TransitionOutcome::Stale { current }
    } else {
        TransitionOutcome::Applied {
            from: current,
            to: next,
        }
    }
}

/// A formal pre-lien notice and its certified-mail tracking state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoticeOfIntent {
    pub id: NoticeId,
    pub organization_id: OrganizationId,
    pub invoice_id: InvoiceId,
    pub state: String,
    pub sent_date: NaiveDate,
    pub response_deadline: NaiveDate,
    pub lien_filing_deadline: NaiveDate,
    pub delivery_status: DeliveryStatus,
    pub tracking_number: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use DeliveryStatus::*;

    #[test]
    fn forward_transitions_apply() {
        assert!(apply_delivery_update(Pending, InTransit).is_applied());
        assert!(apply_delivery_update(InTransit, Delivered).is_applied());
        assert!(apply_delivery_update(Pending, Returned).is_applied());
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        for terminal in [Delivered, Returned, Failed] {
            for next in [Pending, InTransit, Delivered, Returned, Failed] {
                let outcome = apply_delivery_update(terminal, next);
                assert!(!outcome.is_applied(), "{terminal:?} -> {next:?}");
            }
        }
        assert_eq!(
            apply_delivery_update(Delivered, Returned),
            TransitionOutcome::IgnoredTerminal { current: Delivered }
        );
    }

    #[test]
    fn replays_and_regressions_are_not_applied() {
        assert_eq!(apply_delivery_update(InTransit, InTransit), TransitionOutcome::Duplicate);
        assert_eq!(
            apply_delivery_update(InTransit, Pending),
            TransitionOutcome::Stale { current: InTransit }
        );
    }
}
