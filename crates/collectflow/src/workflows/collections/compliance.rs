//! Pure consent, opt-out, quiet-hours, and frequency rules.
//!
//! Nothing in here performs I/O or reads the clock; `now` is always injected so a
//! decision is reproducible for a fixed customer snapshot.

use std::fmt;

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Serialize, Serializer};

use super::domain::{Channel, Customer};

/// First local hour at which automated SMS may be sent.
pub const QUIET_HOURS_END: u32 = 8;
/// Local hour from which automated SMS is held until the next morning.
pub const QUIET_HOURS_START: u32 = 21;
/// Rolling window for the frequency rule.
pub const FREQUENCY_WINDOW_DAYS: i64 = 7;
pub const FREQUENCY_WARNING_THRESHOLD: u32 = 7;
pub const FREQUENCY_SOFT_LIMIT: u32 = 10;

/// Zones used when a customer's state cannot be mapped to one timezone.
const FALLBACK_ZONES: [Tz; 2] = [chrono_tz::America::New_York, chrono_tz::America::Los_Angeles];

/// Legally required reason a message may not be sent right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceBlocker {
    SmsOptedOut { at: Option<DateTime<Utc>> },
    EmailOptedOut { at: Option<DateTime<Utc>> },
    MissingSmsConsent,
    MissingPhone,
    MissingEmail,
    QuietHours {
        timezone: String,
        local_time: NaiveTime,
        next_allowed: DateTime<Utc>,
    },
}

impl ComplianceBlocker {
    /// Quiet hours only defer a send; every other blocker disqualifies it.
    pub const fn is_deferrable(&self) -> bool {
        matches!(self, ComplianceBlocker::QuietHours { .. })
    }

    pub const fn code(&self) -> &'static str {
        match self {
            ComplianceBlocker::SmsOptedOut { .. } => "sms_opted_out",
            ComplianceBlocker::EmailOptedOut { .. } => "email_opted_out",
            ComplianceBlocker::MissingSmsConsent => "missing_sms_consent",
            ComplianceBlocker::MissingPhone => "missing_phone",
            ComplianceBlocker::MissingEmail => "missing_email",
            ComplianceBlocker::QuietHours { .. } => "quiet_hours",
        }
    }
}

impl fmt::Display for ComplianceBlocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceBlocker::SmsOptedOut { at: Some(at) } => {
                write!(f, "customer opted out of SMS on {}", at.format("%Y-%m-%d"))
            }
            ComplianceBlocker::SmsOptedOut { at: None } => {
                f.write_str("customer opted out of SMS")
            }
            ComplianceBlocker::EmailOptedOut { at: Some(at) } => {
                write!(f, "customer unsubscribed from email on {}", at.format("%Y-%m-%d"))
            }
            ComplianceBlocker::EmailOptedOut { at: None } => {
                f.write_str("customer unsubscribed from email")
            }
            ComplianceBlocker::MissingSmsConsent => f.write_str(
                "no SMS consent on file; automated texts without prior express consent violate the TCPA",
            ),
            ComplianceBlocker::MissingPhone => f.write_str("no phone number on file"),
            ComplianceBlocker::MissingEmail => f.write_str("no email address on file"),
            ComplianceBlocker::QuietHours {
                timezone,
                local_time,
                next_allowed,
            } => write!(
                f,
                "local time {} ({timezone}) is outside 08:00-21:00; next allowed {}",
                local_time.format("%H:%M"),
                next_allowed.format("%Y-%m-%dT%H:%MZ")
            ),
        }
    }
}

/// Advisory raised alongside a decision; never blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplianceWarning {
    MissingEmailConsent,
    ApproachingFrequencyLimit { count: u32 },
    FrequencyLimitReached { count: u32 },
    TimezoneUnknown { state: Option<String> },
}

impl ComplianceWarning {
    pub const fn code(&self) -> &'static str {
        match self {
            ComplianceWarning::MissingEmailConsent => "missing_email_consent",
            ComplianceWarning::ApproachingFrequencyLimit { .. } => "approaching_frequency_limit",
            ComplianceWarning::FrequencyLimitReached { .. } => "frequency_limit_reached",
            ComplianceWarning::TimezoneUnknown { .. } => "timezone_unknown",
        }
    }
}

impl fmt::Display for ComplianceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComplianceWarning::MissingEmailConsent => {
                f.write_str("no explicit email consent recorded")
            }
            ComplianceWarning::ApproachingFrequencyLimit { count } => write!(
                f,
                "{count} messages sent in the last {FREQUENCY_WINDOW_DAYS} days; approaching the soft limit of {FREQUENCY_SOFT_LIMIT}"
            ),
            ComplianceWarning::FrequencyLimitReached { count } => write!(
                f,
                "{count} messages sent in the last {FREQUENCY_WINDOW_DAYS} days; at or above the soft limit of {FREQUENCY_SOFT_LIMIT}"
            ),
            ComplianceWarning::TimezoneUnknown { state: Some(state) } => write!(
                f,
                "cannot infer timezone from state '{state}'; using the Eastern/Pacific overlap"
            ),
            ComplianceWarning::TimezoneUnknown { state: None } => {
                f.write_str("no state on file; using the Eastern/Pacific overlap")
            }
        }
    }
}

macro_rules! serialize_as_reason {
    ($ty:ty) => {
        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                use serde::ser::SerializeStruct;
                let mut state = serializer.serialize_struct(stringify!($ty), 2)?;
                state.serialize_field("code", self.code())?;
                state.serialize_field("reason", &self.to_string())?;
                state.end()
            }
        }
    };
}

serialize_as_reason!(ComplianceBlocker);
serialize_as_reason!(ComplianceWarning);

/// Aggregated outcome of every rule for one prospective send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceDecision {
    pub allowed: bool,
    pub blockers: Vec<ComplianceBlocker>,
    pub warnings: Vec<ComplianceWarning>,
}

impl ComplianceDecision {
    /// True when quiet hours are the only thing in the way.
    pub fn is_deferral(&self) -> bool {
        !self.blockers.is_empty() && self.blockers.iter().all(ComplianceBlocker::is_deferrable)
    }

    pub fn next_allowed(&self) -> Option<DateTime<Utc>> {
        self.blockers.iter().find_map(|blocker| match blocker {
            ComplianceBlocker::QuietHours { next_allowed, .. } => Some(*next_allowed),
            _ => None,
        })
    }

    pub fn blocker_summary(&self) -> String {
        self.blockers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Evaluate every rule for `channel` against the customer's current record.
pub fn evaluate(
    channel: Channel,
    customer: &Customer,
    recent_message_count: u32,
    now: DateTime<Utc>,
) -> ComplianceDecision {
    let mut blockers = Vec::new();
    let mut warnings = Vec::new();

    match channel {
        Channel::Sms => {
            if customer.sms_opted_out {
                blockers.push(ComplianceBlocker::SmsOptedOut {
                    at: customer.sms_opted_out_at,
                });
            }
            if !customer.sms_consent_given {
                blockers.push(ComplianceBlocker::MissingSmsConsent);
            }
            if !customer.has_phone() {
                blockers.push(ComplianceBlocker::MissingPhone);
            }

            let zone = CustomerZone::for_state(customer.state.as_deref());
            if zone.is_fallback() {
                warnings.push(ComplianceWarning::TimezoneUnknown {
                    state: customer.state.clone(),
                });
            }
            if let Some(blocker) = quiet_hours_blocker(&zone, now) {
                blockers.push(blocker);
            }
        }
        Channel::Email => {
            if customer.email_opted_out {
                blockers.push(ComplianceBlocker::EmailOptedOut {
                    at: customer.email_opted_out_at,
                });
            }
            if !customer.email_consent_given {
                warnings.push(ComplianceWarning::MissingEmailConsent);
            }
            if !customer.has_email() {
                blockers.push(ComplianceBlocker::MissingEmail);
            }
        }
    }

    if recent_message_count >= FREQUENCY_SOFT_LIMIT {
        warnings.push(ComplianceWarning::FrequencyLimitReached {
            count: recent_message_count,
        });
    } else if recent_message_count >= FREQUENCY_WARNING_THRESHOLD {
        warnings.push(ComplianceWarning::ApproachingFrequencyLimit {
            count: recent_message_count,
        });
    }

    ComplianceDecision {
        allowed: blockers.is_empty(),
        blockers,
        warnings,
    }
}

/// Timezone(s) a customer's quiet hours are measured in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomerZone {
    Known(Tz),
    /// Both windows must be open.
    Fallback,
}

impl CustomerZone {
    pub fn for_state(state: Option<&str>) -> Self {
        state
            .and_then(timezone_for_state)
            .map(CustomerZone::Known)
            .unwrap_or(CustomerZone::Fallback)
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CustomerZone::Fallback)
    }

    fn zones(&self) -> Vec<Tz> {
        match self {
            CustomerZone::Known(zone) => vec![*zone],
            CustomerZone::Fallback => FALLBACK_ZONES.to_vec(),
        }
    }

    fn label(&self) -> String {
        match self {
            CustomerZone::Known(zone) => zone.name().to_string(),
            CustomerZone::Fallback => "America/New_York+America/Los_Angeles".to_string(),
        }
    }
}

fn within_window(zone: Tz, instant: DateTime<Utc>) -> bool {
    let hour = instant.with_timezone(&zone).hour();
    (QUIET_HOURS_END..QUIET_HOURS_START).contains(&hour)
}

/// Next instant at or after `instant` that is inside the local window for `zone`.
fn next_open_in(zone: Tz, instant: DateTime<Utc>) -> DateTime<Utc> {
    if within_window(zone, instant) {
        return instant;
    }
    let local = instant.with_timezone(&zone);
    let day = if local.hour() < QUIET_HOURS_END {
        local.date_naive()
    } else {
        local.date_naive() + Duration::days(1)
    };
    day.and_hms_opt(QUIET_HOURS_END, 0, 0)
        .and_then(|opening| zone.from_local_datetime(&opening).earliest())
        .map(|moment| moment.with_timezone(&Utc))
        .unwrap_or(instant + Duration::hours(1))
}

/// Earliest instant at or after `now` when every zone's window is open.
pub fn next_allowed_send(zone: &CustomerZone, now: DateTime<Utc>) -> DateTime<Utc> {
    let zones = zone.zones();
    let mut candidate = now;
    // Converges within a couple of rounds for any pair of overlapping windows.
    for _ in 0..8 {
        let next = zones
            .iter()
            .map(|tz| next_open_in(*tz, candidate))
            .max()
            .unwrap_or(candidate);
        if next == candidate {
            return candidate;
        }
        candidate = next;
    }
    candidate
}

fn quiet_hours_blocker(zone: &CustomerZone, now: DateTime<Utc>) -> Option<ComplianceBlocker> {
    let next_allowed = next_allowed_send(zone, now);
    if next_allowed == now {
        return None;
    }
    let reference = zone.zones().first().copied().unwrap_or(chrono_tz::America::New_York);
    Some(ComplianceBlocker::QuietHours {
        timezone: zone.label(),
        local_time: now.with_timezone(&reference).time(),
        next_allowed,
    })
}

/// Map a US state or territory code to the timezone covering most of its population.
pub fn timezone_for_state(state: &str) -> Option<Tz> {
    use chrono_tz::America;
    use chrono_tz::Pacific;

    let zone = match state.trim().to_ascii_uppercase().as_str() {
        "CT" | "DE" | "DC" | "FL" | "GA" | "IN" | "KY" | "ME" | "MD" | "MA" | "MI" | "NH"
        | "NJ" | "NY" | "NC" | "OH" | "PA" | "RI" | "SC" | "VT" | "VA" | "WV" => {
            America::New_York
        }
        "AL" | "AR" | "IL" | "IA" | "KS" | "LA" | "MN" | "MS" | "MO" | "NE" | "ND" | "OK"
        | "SD" | "TN" | "TX" | "WI" => America::Chicago,
        "CO" | "ID" | "MT" | "NM" | "UT" | "WY" => America::Denver,
        "AZ" => America::Phoenix,
        "CA" | "NV" | "OR" | "WA" => America::Los_Angeles,
        "AK" => America::Anchorage,
        "HI" => Pacific::Honolulu,
        "PR" | "VI" => America::Puerto_Rico,
        "GU" | "MP" => Pacific::Guam,
        _ => return None,
    };
    Some(zone)
}
