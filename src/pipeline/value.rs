//! # Field Values
//!
//! Typed values produced by coercion and the arithmetic applied by
//! transformation steps.
//!
//! Integer arithmetic stays integral where the result is exact
//! (multiply, add, subtract, non-negative integer powers) and falls back to
//! floating point on overflow. Division always yields a float, so
//! `3200 / 1600` is `2.0`, not `2`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::Operation;

/// Numeric value flowing through a transformation chain
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Value as `f64`
    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    /// True for integer zero and for `0.0` / `-0.0`
    #[must_use]
    pub fn is_zero(self) -> bool {
        match self {
            Number::Int(i) => i == 0,
            Number::Float(f) => f == 0.0,
        }
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(v) => f.write_str(&float_repr(*v)),
        }
    }
}

/// A field value after type coercion
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value; `None` for text
    #[must_use]
    pub fn as_number(&self) -> Option<Number> {
        match self {
            Value::Int(i) => Some(Number::Int(*i)),
            Value::Float(f) => Some(Number::Float(*f)),
            Value::Text(_) => None,
        }
    }
}

impl From<Number> for Value {
    fn from(number: Number) -> Self {
        match number {
            Number::Int(i) => Value::Int(i),
            Number::Float(f) => Value::Float(f),
        }
    }
}

/// Plain string form, used when a format pattern cannot be applied.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => f.write_str(&float_repr(*v)),
            Value::Text(s) => f.write_str(s),
        }
    }
}

/// Apply one transformation operation.
///
/// Returns `None` when the operation divides by zero: an operand of zero
/// for `divide`, or a zero base raised to a negative power.
///
/// # Examples
///
/// ```
/// use telemon::config::Operation;
/// use telemon::pipeline::value::{apply, Number};
///
/// let revs = apply(Operation::Divide, Number::Int(3200), Number::Int(1600));
/// assert_eq!(revs, Some(Number::Float(2.0)));
/// assert_eq!(apply(Operation::Divide, Number::Int(1), Number::Int(0)), None);
/// ```
#[must_use]
pub fn apply(operation: Operation, value: Number, operand: Number) -> Option<Number> {
    use Number::{Float, Int};

    match operation {
        Operation::Multiply => Some(match (value, operand) {
            (Int(a), Int(b)) => a
                .checked_mul(b)
                .map_or_else(|| Float(a as f64 * b as f64), Int),
            (a, b) => Float(a.as_f64() * b.as_f64()),
        }),
        Operation::Add => Some(match (value, operand) {
            (Int(a), Int(b)) => a
                .checked_add(b)
                .map_or_else(|| Float(a as f64 + b as f64), Int),
            (a, b) => Float(a.as_f64() + b.as_f64()),
        }),
        Operation::Subtract => Some(match (value, operand) {
            (Int(a), Int(b)) => a
                .checked_sub(b)
                .map_or_else(|| Float(a as f64 - b as f64), Int),
            (a, b) => Float(a.as_f64() - b.as_f64()),
        }),
        Operation::Divide => {
            if operand.is_zero() {
                None
            } else {
                Some(Float(value.as_f64() / operand.as_f64()))
            }
        }
        Operation::Power => power(value, operand),
    }
}

fn power(base: Number, exponent: Number) -> Option<Number> {
    use Number::{Float, Int};

    match (base, exponent) {
        (Int(b), Int(e)) if e >= 0 => Some(
            u32::try_from(e)
                .ok()
                .and_then(|small| b.checked_pow(small))
                .map_or_else(|| Float((b as f64).powf(e as f64)), Int),
        ),
        (b, e) if b.is_zero() && e.as_f64() < 0.0 => None,
        (b, e) => Some(Float(b.as_f64().powf(e.as_f64()))),
    }
}

/// Shortest round-trip float text with a mandatory fractional part,
/// switching to exponent notation outside `1e-4 <= |v| < 1e16`.
///
/// `2.0` renders as `"2.0"`, `1e20` as `"1e+20"`, `0.00001` as `"1e-05"`.
#[must_use]
pub fn float_repr(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-4..1e16).contains(&magnitude) {
        let text = value.to_string();
        if text.contains('.') {
            text
        } else {
            format!("{}.0", text)
        }
    } else {
        exponent_notation(&format!("{:e}", value))
    }
}

/// Rewrite Rust exponent output (`1.5e3`, `2e-7`) with an explicit sign and
/// at least two exponent digits (`1.5e+03`, `2e-07`).
pub(crate) fn exponent_notation(text: &str) -> String {
    let Some((mantissa, exponent)) = text.split_once('e') else {
        return text.to_string();
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return text.to_string();
    };
    let sign = if exponent < 0 { '-' } else { '+' };
    format!("{}e{}{:02}", mantissa, sign, exponent.unsigned_abs())
}
