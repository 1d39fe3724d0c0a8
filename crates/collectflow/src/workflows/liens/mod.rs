//! Mechanic's lien deadlines and Notice of Intent tracking.

pub mod deadlines;
pub mod notice;
pub mod router;
pub mod service;
pub mod statutes;
pub mod webhook;

#[cfg(test)]
mod tests;

pub use deadlines::{
    calculate_lien_deadlines, calculate_response_deadline, LienDeadlines, LienError, WarningLevel,
};
pub use notice::{apply_delivery_update, DeliveryStatus, NoticeId, NoticeOfIntent, TransitionOutcome};
pub use router::{liens_router, LiensApi};
pub use service::{
    CarrierAck, CarrierOutcome, IssueNotice, NoticeError, NoticeRepository, NoticeService,
};
pub use statutes::{statute_for, DeadlineRule, StateStatute};
pub use webhook::{map_carrier_status, sign, verify_signature, CarrierEvent, SignatureError};
