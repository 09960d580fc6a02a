//! Request schema and validation at the serving boundary.
//!
//! A request carries the raw quantities a borrower reports. Validation runs
//! over the whole object and reports every offending field at once; only a
//! fully valid request is converted into a feature row, through the same
//! ratio derivation the dataset loader uses.

use crate::derive::{MonetaryInputs, derive_ratios};
use crate::schema::{FEATURES, Feature};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// One borrower, as submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BorrowerRequest {
    pub age: u32,
    pub total_unsecured_balance: f64,
    pub total_unsecured_credit_limit: f64,
    pub total_monthly_debt_payment: f64,
    pub monthly_income: f64,
    pub open_credit_lines_and_loans: u32,
    pub days_late_30_59: u32,
    pub days_late_90_plus: u32,
    pub real_estate_loans: u32,
    pub days_late_60_89: u32,
    pub dependents: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
    Integer,
    Amount,
}

struct FieldRule {
    name: &'static str,
    kind: Kind,
    min: f64,
    max: Option<f64>,
}

const fn integer(name: &'static str, min: f64, max: f64) -> FieldRule {
    FieldRule {
        name,
        kind: Kind::Integer,
        min,
        max: Some(max),
    }
}

const fn amount(name: &'static str) -> FieldRule {
    FieldRule {
        name,
        kind: Kind::Amount,
        min: 0.0,
        max: None,
    }
}

const FIELD_RULES: [FieldRule; 11] = [
    integer("age", 10.0, 110.0),
    amount("total_unsecured_balance"),
    amount("total_unsecured_credit_limit"),
    amount("total_monthly_debt_payment"),
    amount("monthly_income"),
    integer("open_credit_lines_and_loans", 0.0, 60.0),
    integer("days_late_30_59", 0.0, 15.0),
    integer("days_late_90_plus", 0.0, 20.0),
    integer("real_estate_loans", 0.0, 60.0),
    integer("days_late_60_89", 0.0, 12.0),
    integer("dependents", 0.0, 10.0),
];

/// Names of every accepted request field, in documented order.
pub fn request_fields() -> Vec<&'static str> {
    FIELD_RULES.iter().map(|r| r.name).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub message: String,
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Request body is not a JSON object: {0}")]
    Malformed(String),
    #[error(
        "{} invalid field(s): {}",
        fields.len(),
        fields.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
    )]
    Fields { fields: Vec<FieldViolation> },
}

impl ValidationError {
    pub fn fields(&self) -> &[FieldViolation] {
        match self {
            Self::Malformed(_) => &[],
            Self::Fields { fields } => fields,
        }
    }
}

/// Parses and validates a JSON request body.
pub fn parse_request(body: &str) -> Result<BorrowerRequest, ValidationError> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    match value {
        Value::Object(map) => validate_object(&map),
        other => Err(ValidationError::Malformed(format!(
            "expected an object, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Checks presence, type and range of every field plus the cross-field
/// balance rule, collecting all violations before failing.
pub fn validate_object(map: &Map<String, Value>) -> Result<BorrowerRequest, ValidationError> {
    let mut violations = Vec::new();
    let mut violate = |field: &str, message: String| {
        violations.push(FieldViolation {
            field: field.to_string(),
            message,
        })
    };

    for key in map.keys() {
        if !FIELD_RULES.iter().any(|r| r.name == key) {
            violate(key, "unknown field".to_string());
        }
    }

    let mut values = [0.0f64; FIELD_RULES.len()];
    let mut usable = [false; FIELD_RULES.len()];
    for (i, rule) in FIELD_RULES.iter().enumerate() {
        let Some(raw) = map.get(rule.name) else {
            violate(rule.name, "field required".to_string());
            continue;
        };
        let Some(number) = raw.as_f64().filter(|v| v.is_finite()) else {
            violate(rule.name, format!("expected a number, found {}", json_kind(raw)));
            continue;
        };
        if rule.kind == Kind::Integer && number.fract() != 0.0 {
            violate(rule.name, format!("expected an integer, found {number}"));
            continue;
        }
        let in_range = number >= rule.min && rule.max.is_none_or(|max| number <= max);
        if !in_range {
            let message = match rule.max {
                Some(max) => format!("must be between {} and {max}, found {number}", rule.min),
                None => format!("must be at least {}, found {number}", rule.min),
            };
            violate(rule.name, message);
            continue;
        }
        values[i] = number;
        usable[i] = true;
    }

    // balance <= limit applies only when a positive limit is declared.
    let (balance, limit) = (1, 2);
    if usable[balance] && usable[limit] && values[limit] > 0.0 && values[balance] > values[limit] {
        violate(
            "total_unsecured_balance",
            format!(
                "must not exceed total_unsecured_credit_limit ({}), found {}",
                values[limit], values[balance]
            ),
        );
    }

    if !violations.is_empty() {
        return Err(ValidationError::Fields { fields: violations });
    }

    Ok(BorrowerRequest {
        age: values[0] as u32,
        total_unsecured_balance: values[1],
        total_unsecured_credit_limit: values[2],
        total_monthly_debt_payment: values[3],
        monthly_income: values[4],
        open_credit_lines_and_loans: values[5] as u32,
        days_late_30_59: values[6] as u32,
        days_late_90_plus: values[7] as u32,
        real_estate_loans: values[8] as u32,
        days_late_60_89: values[9] as u32,
        dependents: values[10] as u32,
    })
}

impl BorrowerRequest {
    /// Re-validates an already typed request (ranges and the balance rule).
    pub fn validate(&self) -> Result<(), ValidationError> {
        let value = serde_json::to_value(self).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        match value {
            Value::Object(map) => validate_object(&map).map(|_| ()),
            other => Err(ValidationError::Malformed(format!(
                "expected an object, found {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn monetary_inputs(&self) -> MonetaryInputs {
        MonetaryInputs {
            total_unsecured_balance: self.total_unsecured_balance,
            total_unsecured_credit_limit: self.total_unsecured_credit_limit,
            total_monthly_debt_payment: self.total_monthly_debt_payment,
            monthly_income: self.monthly_income,
        }
    }

    /// The request as one feature row in canonical order.
    pub fn to_feature_row(&self) -> [f64; 10] {
        let ratios = derive_ratios(&self.monetary_inputs());
        let mut row = [0.0; 10];
        for feature in FEATURES {
            row[feature.index()] = match feature {
                Feature::RevolvingUtilization => ratios.revolving_utilization,
                Feature::Age => f64::from(self.age),
                Feature::PastDue30To59 => f64::from(self.days_late_30_59),
                Feature::DebtRatio => ratios.debt_ratio,
                Feature::MonthlyIncome => self.monthly_income,
                Feature::OpenCreditLines => f64::from(self.open_credit_lines_and_loans),
                Feature::PastDue90Plus => f64::from(self.days_late_90_plus),
                Feature::RealEstateLoans => f64::from(self.real_estate_loans),
                Feature::PastDue60To89 => f64::from(self.days_late_60_89),
                Feature::Dependents => f64::from(self.dependents),
            };
        }
        row
    }
}
