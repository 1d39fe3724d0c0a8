use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Closed set of placeholders a step body may reference as `{{name}}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateVariable {
    CustomerName,
    FirstName,
    BusinessName,
    BusinessPhone,
    InvoiceNumber,
    AmountDue,
    DueDate,
    DaysPastDue,
    InvoiceCount,
    PaymentLink,
}

impl TemplateVariable {
    pub const ALL: [TemplateVariable; 10] = [
        TemplateVariable::CustomerName,
        TemplateVariable::FirstName,
        TemplateVariable::BusinessName,
        TemplateVariable::BusinessPhone,
        TemplateVariable::InvoiceNumber,
        TemplateVariable::AmountDue,
        TemplateVariable::DueDate,
        TemplateVariable::DaysPastDue,
        TemplateVariable::InvoiceCount,
        TemplateVariable::PaymentLink,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            TemplateVariable::CustomerName => "customer_name",
            TemplateVariable::FirstName => "first_name",
            TemplateVariable::BusinessName => "business_name",
            TemplateVariable::BusinessPhone => "business_phone",
            TemplateVariable::InvoiceNumber => "invoice_number",
            TemplateVariable::AmountDue => "amount_due",
            TemplateVariable::DueDate => "due_date",
            TemplateVariable::DaysPastDue => "days_past_due",
            TemplateVariable::InvoiceCount => "invoice_count",
            TemplateVariable::PaymentLink => "payment_link",
        }
    }
}

impl FromStr for TemplateVariable {
    type Err = TemplateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let name = raw.trim();
        TemplateVariable::ALL
            .into_iter()
            .find(|variable| variable.name() == name)
            .ok_or_else(|| TemplateError::UnknownVariable(name.to_string()))
    }
}

impl fmt::Display for TemplateVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template variable '{{{{{0}}}}}'")]
    UnknownVariable(String),
    #[error("unterminated template tag starting at byte {0}")]
    Unterminated(usize),
    #[error("no value available for template variable '{0}'")]
    MissingValue(TemplateVariable),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Variable(TemplateVariable),
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Literal(&rest[..start]));
        }
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;
        segments.push(Segment::Variable(after_open[..end].parse()?));
        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        segments.push(Segment::Literal(rest));
    }
    Ok(segments)
}

/// Check a template against the variable set without rendering it.
pub fn validate(template: &str) -> Result<Vec<TemplateVariable>, TemplateError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Variable(variable) => Some(variable),
            Segment::Literal(_) => None,
        })
        .collect())
}

/// Values available to a message at the moment it is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TemplateContext {
    pub customer_name: String,
    pub first_name: String,
    pub business_name: String,
    pub business_phone: Option<String>,
    pub invoice_number: Option<String>,
    pub amount_due_cents: i64,
    pub due_date: Option<NaiveDate>,
    pub days_past_due: i64,
    pub invoice_count: usize,
    pub payment_link: Option<String>,
}

impl TemplateContext {
    fn value(&self, variable: TemplateVariable) -> Result<String, TemplateError> {
        let missing = || TemplateError::MissingValue(variable);
        let value = match variable {
            TemplateVariable::CustomerName => self.customer_name.clone(),
            TemplateVariable::FirstName => self.first_name.clone(),
            TemplateVariable::BusinessName => self.business_name.clone(),
            TemplateVariable::BusinessPhone => self.business_phone.clone().ok_or_else(missing)?,
            TemplateVariable::InvoiceNumber => self.invoice_number.clone().ok_or_else(missing)?,
            TemplateVariable::AmountDue => format_cents(self.amount_due_cents),
            TemplateVariable::DueDate => self
                .due_date
                .map(|date| date.format("%B %-d, %Y").to_string())
                .ok_or_else(missing)?,
            TemplateVariable::DaysPastDue => self.days_past_due.max(0).to_string(),
            TemplateVariable::InvoiceCount => self.invoice_count.to_string(),
            TemplateVariable::PaymentLink => self.payment_link.clone().ok_or_else(missing)?,
        };
        Ok(value)
    }
}

/// Substitute every placeholder, failing on unknown names or absent values.
pub fn render(template: &str, context: &TemplateContext) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    for segment in parse(template)? {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Variable(variable) => rendered.push_str(&context.value(variable)?),
        }
    }
    Ok(rendered)
}

/// `123456` -> `$1,234.56`.
pub fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let dollars = (cents / 100).to_string();
    let mut grouped = String::with_capacity(dollars.len() + dollars.len() / 3);
    for (index, digit) in dollars.chars().enumerate() {
        if index > 0 && (dollars.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    format!("{sign}${grouped}.{:02}", cents % 100)
}
