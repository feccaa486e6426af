//! # Field Pipeline
//!
//! Turns one raw field string into a displayable [`Observation`].
//!
//! This module handles:
//! - Coercing the raw string to the configured type
//! - Running the transformation chain in declared order
//! - Rendering the raw value and every intermediate result
//! - Containing failures to the field that caused them

pub mod format;
pub mod value;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::{Color, FieldConfig, FieldType};
use crate::protocol::Record;
use format::FormatPattern;
use value::{Number, Value};

/// Why a field could not be evaluated for one record
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldError {
    /// Raw text is not a valid value of the configured type
    #[error("cannot read {raw:?} as {expected}")]
    CoercionFailed { raw: String, expected: FieldType },

    /// A divide step with operand zero, or zero to a negative power
    #[error("division by zero in transformation step {step}")]
    DivisionByZero { step: usize },

    /// Pattern does not apply to the value; the plain value was shown instead
    #[error("format {pattern:?} failed: {reason}")]
    FormatFailed { pattern: String, reason: String },
}

/// Output of one transformation step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub label: String,
    pub value: Number,
    /// Rendered through the step's pattern, unit appended
    pub formatted: String,
    pub unit: String,
}

/// Everything the display needs to show one field of one record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Observation {
    pub position: usize,
    pub label: String,
    pub color: Color,
    /// `None` for placeholders
    pub raw_value: Option<Value>,
    /// Raw value through the field pattern, unit appended
    pub formatted_raw: String,
    pub steps: Vec<StepResult>,
    /// Last step's text, or `formatted_raw` when there are no steps
    pub final_value: String,
    /// Non-fatal problems, such as a pattern that fell back to plain text
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<FieldError>,
}

impl Observation {
    /// Observation shown when a field has no usable value.
    #[must_use]
    pub fn placeholder(field: &FieldConfig, text: &str) -> Self {
        Self {
            position: field.position,
            label: field.label.clone(),
            color: field.color,
            raw_value: None,
            formatted_raw: text.to_string(),
            steps: Vec::new(),
            final_value: text.to_string(),
            issues: Vec::new(),
        }
    }

    /// True if this observation carries no value
    #[must_use]
    pub fn is_placeholder(&self) -> bool {
        self.raw_value.is_none()
    }
}

/// Coerce raw field text to the configured type.
///
/// # Errors
///
/// Returns [`FieldError::CoercionFailed`] if the text is not a valid
/// integer or float. Surrounding whitespace is ignored.
pub fn coerce(field_type: FieldType, raw: &str) -> Result<Value, FieldError> {
    let failed = || FieldError::CoercionFailed {
        raw: raw.to_string(),
        expected: field_type,
    };

    match field_type {
        FieldType::String => Ok(Value::Text(raw.to_string())),
        FieldType::Int => raw.trim().parse().map(Value::Int).map_err(|_| failed()),
        FieldType::Float => raw.trim().parse().map(Value::Float).map_err(|_| failed()),
    }
}

/// Evaluate one field value.
///
/// Transformations run in declared order, each consuming the previous
/// step's output. String fields skip the chain. A format pattern that does
/// not suit the value falls back to the plain value and is noted in
/// [`Observation::issues`] rather than failing the field.
///
/// # Errors
///
/// Returns a [`FieldError`] if coercion fails or a step divides by zero.
/// The error concerns this field only.
///
/// # Examples
///
/// ```
/// use telemon::config::FieldConfig;
/// use telemon::pipeline::evaluate;
///
/// let field = FieldConfig::labelled(0, "Count");
/// let observation = evaluate(&field, "42").unwrap();
/// assert_eq!(observation.final_value, "42");
/// ```
pub fn evaluate(field: &FieldConfig, raw: &str) -> Result<Observation, FieldError> {
    let raw_value = coerce(field.field_type, raw)?;
    let mut issues = Vec::new();
    let formatted_raw = render(&field.format, &raw_value, &field.unit, &mut issues);

    let mut steps = Vec::new();
    if let Some(mut current) = raw_value.as_number() {
        steps.reserve(field.transformations.len());
        for (index, step) in field.transformations.iter().enumerate() {
            current = value::apply(step.operation, current, step.operand)
                .ok_or(FieldError::DivisionByZero { step: index })?;
            let formatted = render(&step.format, &Value::from(current), &step.unit, &mut issues);
            steps.push(StepResult {
                label: step.label.clone(),
                value: current,
                formatted,
                unit: step.unit.clone(),
            });
        }
    }

    let final_value = steps
        .last()
        .map_or_else(|| formatted_raw.clone(), |step| step.formatted.clone());

    Ok(Observation {
        position: field.position,
        label: field.label.clone(),
        color: field.color,
        raw_value: Some(raw_value),
        formatted_raw,
        steps,
        final_value,
        issues,
    })
}

/// Evaluate the field's position in `record`.
///
/// Returns `Ok(None)` when the record is too short to contain the field.
///
/// # Errors
///
/// Same as [`evaluate`].
pub fn evaluate_record(
    field: &FieldConfig,
    record: &Record,
) -> Result<Option<Observation>, FieldError> {
    match record.get(field.position) {
        Some(raw) => evaluate(field, raw).map(Some),
        None => Ok(None),
    }
}

fn render(
    pattern: &FormatPattern,
    value: &Value,
    unit: &str,
    issues: &mut Vec<FieldError>,
) -> String {
    let text = pattern.render(value).unwrap_or_else(|err| {
        debug!(pattern = pattern.as_str(), %value, error = %err, "Format fell back to plain value");
        issues.push(FieldError::FormatFailed {
            pattern: pattern.as_str().to_string(),
            reason: err.to_string(),
        });
        value.to_string()
    });

    if unit.is_empty() {
        text
    } else {
        format!("{} {}", text, unit)
    }
}
