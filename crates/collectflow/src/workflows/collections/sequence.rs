use serde::{Deserialize, Serialize};

use super::domain::{Channel, OrganizationId, SequenceId, StepId};
use super::template::{self, TemplateError};

/// Longest span, in days, a single step or the whole sequence may cover.
pub const MAX_SEQUENCE_SPAN_DAYS: i64 = 3650;

/// One ordered message definition within a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub id: StepId,
    /// 1-based, unique within the sequence.
    pub step_number: u32,
    /// Days after the previous step (or after enrollment for the first step).
    pub delay_days: i32,
    pub channel: Channel,
    pub subject: Option<String>,
    pub body_template: String,
}

/// Ordered reminder steps owned by an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceTemplate {
    pub id: SequenceId,
    pub organization_id: OrganizationId,
    pub name: String,
    steps: Vec<SequenceStep>,
    pub trigger_days_past_due: i32,
    pub is_active: bool,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("sequence must contain at least one step")]
    Empty,
    #[error("step numbers must start at 1 and strictly increase (found {found} after {previous})")]
    StepOrder { previous: u32, found: u32 },
    #[error("the first step cannot have a negative delay ({0} days)")]
    NegativeFirstDelay(i32),
    #[error("step {step} puts the sequence {days} days from enrollment; the limit is {MAX_SEQUENCE_SPAN_DAYS}")]
    DelayOutOfRange { step: u32, days: i64 },
    #[error("step {0} has an empty body")]
    EmptyBody(u32),
    #[error("email step {0} requires a subject")]
    MissingSubject(u32),
    #[error("step {step}: {source}")]
    Template {
        step: u32,
        #[source]
        source: TemplateError,
    },
}

impl SequenceTemplate {
    pub fn new(
        id: SequenceId,
        organization_id: OrganizationId,
        name: impl Into<String>,
        mut steps: Vec<SequenceStep>,
        trigger_days_past_due: i32,
    ) -> Result<Self, SequenceError> {
        steps.sort_by_key(|step| step.step_number);
        validate_steps(&steps)?;

        Ok(Self {
            id,
            organization_id,
            name: name.into(),
            steps,
            trigger_days_past_due,
            is_active: true,
            is_default: false,
        })
    }

    pub fn steps(&self) -> &[SequenceStep] {
        &self.steps
    }

    /// Replace the step list. Live enrollments keep the snapshot taken when they were created.
    pub fn replace_steps(&mut self, mut steps: Vec<SequenceStep>) -> Result<(), SequenceError> {
        steps.sort_by_key(|step| step.step_number);
        validate_steps(&steps)?;
        self.steps = steps;
        Ok(())
    }

    pub fn snapshot_steps(&self) -> Vec<SequenceStep> {
        self.steps.clone()
    }
}

fn validate_steps(steps: &[SequenceStep]) -> Result<(), SequenceError> {
    let first = steps.first().ok_or(SequenceError::Empty)?;
    if first.step_number != 1 {
        return Err(SequenceError::StepOrder {
            previous: 0,
            found: first.step_number,
        });
    }
    if first.delay_days < 0 {
        return Err(SequenceError::NegativeFirstDelay(first.delay_days));
    }

    for pair in steps.windows(2) {
        if pair[1].step_number <= pair[0].step_number {
            return Err(SequenceError::StepOrder {
                previous: pair[0].step_number,
                found: pair[1].step_number,
            });
        }
    }

    let mut offset: i64 = 0;
    for step in steps {
        offset += i64::from(step.delay_days);
        if i64::from(step.delay_days).abs() > MAX_SEQUENCE_SPAN_DAYS
            || offset.abs() > MAX_SEQUENCE_SPAN_DAYS
        {
            return Err(SequenceError::DelayOutOfRange {
                step: step.step_number,
                days: offset,
            });
        }
        if step.body_template.trim().is_empty() {
            return Err(SequenceError::EmptyBody(step.step_number));
        }
        let subject = step.subject.as_deref().map(str::trim).unwrap_or_default();
        if step.channel == Channel::Email && subject.is_empty() {
            return Err(SequenceError::MissingSubject(step.step_number));
        }

        let as_template_error = |source| SequenceError::Template {
            step: step.step_number,
            source,
        };
        template::validate(&step.body_template).map_err(as_template_error)?;
        if let Some(subject) = &step.subject {
            template::validate(subject).map_err(as_template_error)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(step_number: u32, delay_days: i32, channel: Channel) -> SequenceStep {
        SequenceStep {
            id: StepId(format!("step-{step_number}")),
            step_number,
            delay_days,
            channel,
            subject: (channel == Channel::Email).then(|| "Invoice reminder".to_string()),
            body_template: "Hi {{first_name}}, {{amount_due}} is outstanding.".to_string(),
        }
    }

    fn build(steps: Vec<SequenceStep>) -> Result<SequenceTemplate, SequenceError> {
        SequenceTemplate::new(
            SequenceId::from("seq-1"),
            OrganizationId::from("org-1"),
            "Standard",
            steps,
            1,
        )
    }

    #[test]
    fn accepts_well_formed_sequences_and_sorts_steps() {
        let template = build(vec![step(2, 3, Channel::Email), step(1, 0, Channel::Sms)])
            .expect("valid sequence");
        let numbers: Vec<u32> = template.steps().iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert!(template.is_active);
    }

    #[test]
    fn rejects_duplicate_step_numbers() {
        let err = build(vec![step(1, 0, Channel::Sms), step(1, 2, Channel::Sms)])
            .expect_err("duplicate");
        assert_eq!(
            err,
            SequenceError::StepOrder {
                previous: 1,
                found: 1
            }
        );
    }

    #[test]
    fn rejects_negative_first_delay_but_allows_later_negative_offsets() {
        assert_eq!(
            build(vec![step(1, -2, Channel::Sms)]).expect_err("negative"),
            SequenceError::NegativeFirstDelay(-2)
        );
        assert!(build(vec![step(1, 5, Channel::Sms), step(2, -1, Channel::Sms)]).is_ok());
    }

    #[test]
    fn delays_beyond_ten_years_are_rejected() {
        assert_eq!(
            build(vec![step(1, i32::MAX, Channel::Sms)]).expect_err("huge delay"),
            SequenceError::DelayOutOfRange {
                step: 1,
                days: i64::from(i32::MAX)
            }
        );

        let creeping: Vec<SequenceStep> =
            (1..=3).map(|number| step(number, 1500, Channel::Sms)).collect();
        assert_eq!(
            build(creeping).expect_err("cumulative span"),
            SequenceError::DelayOutOfRange { step: 3, days: 4500 }
        );

        assert!(build(vec![step(1, 3650, Channel::Sms)]).is_ok());
    }

    #[test]
    fn email_steps_need_subjects() {
        let mut email = step(1, 0, Channel::Email);
        email.subject = None;
        assert_eq!(
            build(vec![email]).expect_err("subject"),
            SequenceError::MissingSubject(1)
        );
    }

    #[test]
    fn unknown_template_variables_are_rejected_up_front() {
        let mut bad = step(1, 0, Channel::Sms);
        bad.body_template = "Hello {{favorite_color}}".to_string();
        match build(vec![bad]) {
            Err(SequenceError::Template {
                step: 1,
                source: TemplateError::UnknownVariable(name),
            }) => assert_eq!(name, "favorite_color"),
            other => panic!("expected template error, got {other:?}"),
        }
    }

    #[test]
    fn replacing_steps_does_not_touch_earlier_snapshots() {
        let mut template = build(vec![step(1, 0, Channel::Sms)]).expect("valid");
        let snapshot = template.snapshot_steps();
        template
            .replace_steps(vec![step(1, 4, Channel::Email)])
            .expect("replace");
        assert_eq!(snapshot[0].channel, Channel::Sms);
        assert_eq!(template.steps()[0].channel, Channel::Email);
    }
}
