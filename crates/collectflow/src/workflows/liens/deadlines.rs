use chrono::{Days, NaiveDate};
use serde::Serialize;

use super::statutes::{statute_for, StateStatute};

/// Prioritization tier for an upcoming filing deadline. Never gates a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Urgent,
    Upcoming,
    Safe,
}

impl WarningLevel {
    pub const URGENT_WITHIN_DAYS: i64 = 14;
    pub const UPCOMING_WITHIN_DAYS: i64 = 30;

    /// Past-due deadlines stay urgent.
    pub const fn for_days_remaining(days: i64) -> Self {
        if days <= Self::URGENT_WITHIN_DAYS {
            WarningLevel::Urgent
        } else if days <= Self::UPCOMING_WITHIN_DAYS {
            WarningLevel::Upcoming
        } else {
            WarningLevel::Safe
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            WarningLevel::Urgent => "urgent",
            WarningLevel::Upcoming => "upcoming",
            WarningLevel::Safe => "safe",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LienDeadlines {
    pub state: &'static str,
    pub lien_filing_deadline: NaiveDate,
    pub days_until_filing_deadline: i64,
    pub warning_level: WarningLevel,
    pub filing_deadline_passed: bool,
    pub preliminary_notice_required: bool,
    pub preliminary_notice_deadline: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LienError {
    #[error("last work date {last} is before first work date {first}")]
    InvalidWorkDates { first: NaiveDate, last: NaiveDate },
    #[error("no lien statute on file for state '{0}'")]
    UnknownState(String),
    #[error("deadline falls outside the supported calendar range")]
    DateOutOfRange,
}

fn statute(state: &str) -> Result<&'static StateStatute, LienError> {
    statute_for(state).ok_or_else(|| LienError::UnknownState(state.trim().to_string()))
}

/// Filing and preliminary-notice deadlines for work performed in `state`, as seen on `today`.
pub fn calculate_lien_deadlines(
    state: &str,
    first_work_date: NaiveDate,
    last_work_date: NaiveDate,
    today: NaiveDate,
) -> Result<LienDeadlines, LienError> {
    if last_work_date < first_work_date {
        return Err(LienError::InvalidWorkDates {
            first: first_work_date,
            last: last_work_date,
        });
    }
    let statute = statute(state)?;

    let lien_filing_deadline = statute
        .lien_filing
        .apply(last_work_date)
        .ok_or(LienError::DateOutOfRange)?;
    let preliminary_notice_deadline = statute
        .preliminary_notice
        .map(|rule| rule.apply(first_work_date).ok_or(LienError::DateOutOfRange))
        .transpose()?;

    let days_until_filing_deadline = (lien_filing_deadline - today).num_days();
    Ok(LienDeadlines {
        state: statute.code,
        lien_filing_deadline,
        days_until_filing_deadline,
        warning_level: WarningLevel::for_days_remaining(days_until_filing_deadline),
        filing_deadline_passed: days_until_filing_deadline < 0,
        preliminary_notice_required: statute.preliminary_notice.is_some(),
        preliminary_notice_deadline,
    })
}

/// Last day the recipient of a Notice of Intent sent on `sent_date` may respond.
pub fn calculate_response_deadline(sent_date: NaiveDate, state: &str) -> Result<NaiveDate, LienError> {
    let statute = statute(state)?;
    sent_date
        .checked_add_days(Days::new(u64::from(statute.notice_response_days)))
        .ok_or(LienError::DateOutOfRange)
}
