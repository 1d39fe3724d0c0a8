//! Mechanic's lien timing rules keyed by two-letter state code.
//!
//! Figures are the general-contractor, commercial-project defaults. Owner-occupied
//! residential work and lower-tier claimants often run shorter clocks, so these
//! dates are a prioritization aid and not legal advice.

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::Serialize;

/// Days a recipient has to respond to a Notice of Intent unless the state says otherwise.
pub const DEFAULT_NOTICE_RESPONSE_DAYS: u32 = 10;

/// How a statutory deadline is counted from its trigger date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineRule {
    /// A fixed number of calendar days after the trigger.
    DaysAfter(u32),
    /// A given day of the Nth month following the trigger's month.
    DayOfMonthAfter { months: u32, day: u32 },
}

impl DeadlineRule {
    /// `None` when the result falls outside chrono's calendar.
    pub fn apply(self, trigger: NaiveDate) -> Option<NaiveDate> {
        match self {
            DeadlineRule::DaysAfter(days) => trigger.checked_add_days(Days::new(u64::from(days))),
            DeadlineRule::DayOfMonthAfter { months, day } => trigger
                .with_day(1)?
                .checked_add_months(Months::new(months))?
                .with_day(day),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateStatute {
    pub code: &'static str,
    pub name: &'static str,
    /// Counted from the last day work or materials were furnished.
    pub lien_filing: DeadlineRule,
    /// Counted from the first day work or materials were furnished.
    pub preliminary_notice: Option<DeadlineRule>,
    pub notice_response_days: u32,
}

const fn days(days: u32) -> DeadlineRule {
    DeadlineRule::DaysAfter(days)
}

const STATUTES: &[StateStatute] = &[
    StateStatute {
        code: "AZ",
        name: "Arizona",
        lien_filing: days(120),
        preliminary_notice: Some(days(20)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "CA",
        name: "California",
        lien_filing: days(90),
        preliminary_notice: Some(days(20)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "CO",
        name: "Colorado",
        lien_filing: days(120),
        preliminary_notice: None,
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "FL",
        name: "Florida",
        lien_filing: days(90),
        preliminary_notice: Some(days(45)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "GA",
        name: "Georgia",
        lien_filing: days(90),
        preliminary_notice: Some(days(30)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "IL",
        name: "Illinois",
        lien_filing: days(120),
        preliminary_notice: None,
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "MI",
        name: "Michigan",
        lien_filing: days(90),
        preliminary_notice: Some(days(20)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "NY",
        name: "New York",
        lien_filing: days(240),
        preliminary_notice: None,
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "NC",
        name: "North Carolina",
        lien_filing: days(120),
        preliminary_notice: None,
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "OH",
        name: "Ohio",
        lien_filing: days(75),
        preliminary_notice: Some(days(21)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "PA",
        name: "Pennsylvania",
        lien_filing: days(180),
        preliminary_notice: None,
        notice_response_days: 30,
    },
    StateStatute {
        code: "TX",
        name: "Texas",
        lien_filing: DeadlineRule::DayOfMonthAfter { months: 4, day: 15 },
        preliminary_notice: Some(DeadlineRule::DayOfMonthAfter { months: 3, day: 15 }),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
    StateStatute {
        code: "WA",
        name: "Washington",
        lien_filing: days(90),
        preliminary_notice: Some(days(60)),
        notice_response_days: DEFAULT_NOTICE_RESPONSE_DAYS,
    },
];

/// Case-insensitive lookup; `None` for states without a rule on file.
pub fn statute_for(state: &str) -> Option<&'static StateStatute> {
    let code = state.trim();
    STATUTES
        .iter()
        .find(|statute| statute.code.eq_ignore_ascii_case(code))
}

pub fn supported_states() -> impl Iterator<Item = &'static str> {
    STATUTES.iter().map(|statute| statute.code)
}
