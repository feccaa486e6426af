//! # Format Patterns
//!
//! Display patterns such as `"{}"`, `"{:,}"`, `"{:.3f}"` or
//! `"{:>8.2f} V"`, using the familiar `[[fill]align][sign][#][0][width]
//! [grouping][.precision][type]` mini-language.
//!
//! A pattern is parsed once, when the configuration is loaded, so syntax
//! errors are reported at startup. Whether a spec suits a value
//! (`{:d}` on a float, `{:,}` on text) can only be known per value and is
//! reported by [`FormatPattern::render`].

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use super::value::{exponent_notation, float_repr, Value};

/// Pattern syntax or value/spec mismatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("unmatched '{{' in format pattern")]
    UnmatchedOpen,

    #[error("single '}}' encountered in format pattern")]
    UnmatchedClose,

    #[error("unsupported replacement field '{{{0}}}', use '{{}}' or '{{0}}'")]
    UnsupportedField(String),

    #[error("invalid format specifier '{0}'")]
    InvalidSpec(String),

    #[error("{0}")]
    Incompatible(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Align {
    Left,
    Right,
    Center,
    AfterSign,
}

impl Align {
    fn from_char(c: char) -> Option<Self> {
        match c {
            '<' => Some(Align::Left),
            '>' => Some(Align::Right),
            '^' => Some(Align::Center),
            '=' => Some(Align::AfterSign),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sign {
    Minus,
    Plus,
    Space,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FormatSpec {
    fill: char,
    align: Option<Align>,
    sign: Option<Sign>,
    alternate: bool,
    zero_pad: bool,
    width: usize,
    grouping: Option<char>,
    precision: Option<usize>,
    kind: Option<char>,
}

impl Default for FormatSpec {
    fn default() -> Self {
        Self {
            fill: ' ',
            align: None,
            sign: None,
            alternate: false,
            zero_pad: false,
            width: 0,
            grouping: None,
            precision: None,
            kind: None,
        }
    }
}

const SPEC_TYPES: &str = "bcdeEfFgGnosxX%";

impl FormatSpec {
    fn parse(spec: &str) -> Result<Self, FormatError> {
        let invalid = || FormatError::InvalidSpec(spec.to_string());
        let chars: Vec<char> = spec.chars().collect();
        let mut out = FormatSpec::default();
        let mut i = 0;

        if let Some(align) = chars.get(1).and_then(|&c| Align::from_char(c)) {
            out.fill = chars[0];
            out.align = Some(align);
            i = 2;
        } else if let Some(align) = chars.first().and_then(|&c| Align::from_char(c)) {
            out.align = Some(align);
            i = 1;
        }

        out.sign = match chars.get(i) {
            Some('+') => Some(Sign::Plus),
            Some('-') => Some(Sign::Minus),
            Some(' ') => Some(Sign::Space),
            _ => None,
        };
        if out.sign.is_some() {
            i += 1;
        }

        if chars.get(i) == Some(&'#') {
            out.alternate = true;
            i += 1;
        }
        if chars.get(i) == Some(&'0') {
            out.zero_pad = true;
            i += 1;
        }

        let start = i;
        while chars.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }
        if i > start {
            out.width = digits(&chars[start..i]).ok_or_else(invalid)?;
        }

        if let Some(&c @ (',' | '_')) = chars.get(i) {
            out.grouping = Some(c);
            i += 1;
        }

        if chars.get(i) == Some(&'.') {
            i += 1;
            let start = i;
            while chars.get(i).is_some_and(char::is_ascii_digit) {
                i += 1;
            }
            if i == start {
                return Err(invalid());
            }
            out.precision = Some(digits(&chars[start..i]).ok_or_else(invalid)?);
        }

        if let Some(&c) = chars.get(i) {
            if SPEC_TYPES.contains(c) {
                out.kind = Some(c);
                i += 1;
            }
        }

        if i != chars.len() {
            return Err(invalid());
        }
        Ok(out)
    }

    fn sign_prefix(&self, negative: bool) -> &'static str {
        match (negative, self.sign) {
            (true, _) => "-",
            (false, Some(Sign::Plus)) => "+",
            (false, Some(Sign::Space)) => " ",
            (false, _) => "",
        }
    }

    fn pad(&self, prefix: &str, body: &str, numeric: bool) -> String {
        let (fill, align) = match (self.zero_pad, self.align) {
            (true, None) if numeric => ('0', Align::AfterSign),
            (true, None) => ('0', Align::Left),
            (_, Some(align)) => (self.fill, align),
            (false, None) if numeric => (self.fill, Align::Right),
            (false, None) => (self.fill, Align::Left),
        };

        let len = prefix.chars().count() + body.chars().count();
        if len >= self.width {
            return format!("{}{}", prefix, body);
        }

        let padding = self.width - len;
        let fill_n = |n: usize| fill.to_string().repeat(n);
        match align {
            Align::Left => format!("{}{}{}", prefix, body, fill_n(padding)),
            Align::Right => format!("{}{}{}", fill_n(padding), prefix, body),
            Align::Center => {
                let left = padding / 2;
                format!("{}{}{}{}", fill_n(left), prefix, body, fill_n(padding - left))
            }
            Align::AfterSign => format!("{}{}{}", prefix, fill_n(padding), body),
        }
    }

    fn render_text(&self, text: &str) -> Result<String, FormatError> {
        if let Some(kind) = self.kind.filter(|&k| k != 's') {
            return Err(unknown_code(kind, "str"));
        }
        if self.sign.is_some() {
            return Err(incompatible("Sign not allowed in string format specifier"));
        }
        if self.alternate {
            return Err(incompatible("Alternate form (#) not allowed in string format specifier"));
        }
        if let Some(sep) = self.grouping {
            return Err(incompatible(&format!("Cannot specify '{}' with 's'.", sep)));
        }
        if self.align == Some(Align::AfterSign) {
            return Err(incompatible("'=' alignment not allowed in string format specifier"));
        }

        let body: String = match self.precision {
            Some(p) => text.chars().take(p).collect(),
            None => text.to_string(),
        };
        Ok(self.pad("", &body, false))
    }

    fn render_int(&self, value: i64) -> Result<String, FormatError> {
        let kind = self.kind.unwrap_or('d');
        let magnitude = value.unsigned_abs();

        let (digits, group_size, prefix) = match kind {
            'd' | 'n' => (magnitude.to_string(), 3, ""),
            'b' => (format!("{:b}", magnitude), 4, "0b"),
            'o' => (format!("{:o}", magnitude), 4, "0o"),
            'x' => (format!("{:x}", magnitude), 4, "0x"),
            'X' => (format!("{:X}", magnitude), 4, "0X"),
            'c' => return self.render_char(value),
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' | '%' => return self.render_float(value as f64),
            other => return Err(unknown_code(other, "int")),
        };

        if self.precision.is_some() {
            return Err(incompatible("Precision not allowed in integer format specifier"));
        }

        let digits = match self.grouping {
            Some(',') if kind != 'd' => {
                return Err(incompatible(&format!("Cannot specify ',' with '{}'.", kind)))
            }
            Some(sep) if kind != 'n' => group_digits(&digits, sep, group_size),
            Some(sep) => return Err(incompatible(&format!("Cannot specify '{}' with 'n'.", sep))),
            None => digits,
        };

        let mut sign = self.sign_prefix(value < 0).to_string();
        if self.alternate {
            sign.push_str(prefix);
        }
        Ok(self.pad(&sign, &digits, true))
    }

    fn render_char(&self, value: i64) -> Result<String, FormatError> {
        if self.sign.is_some() {
            return Err(incompatible("Sign not allowed with integer format specifier 'c'"));
        }
        let ch = u32::try_from(value)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| incompatible("%c arg not in range(0x110000)"))?;
        Ok(self.pad("", &ch.to_string(), false))
    }

    fn render_float(&self, value: f64) -> Result<String, FormatError> {
        if let Some(kind) = self.kind.filter(|k| "bcdosxX".contains(*k)) {
            return Err(unknown_code(kind, "float"));
        }

        let negative = value.is_sign_negative() && !value.is_nan();
        let magnitude = value.abs();
        let upper = matches!(self.kind, Some('E' | 'F' | 'G'));

        let mut body = if !magnitude.is_finite() {
            let text = if magnitude.is_nan() { "nan" } else { "inf" };
            match self.kind {
                Some('%') => format!("{}%", text),
                _ => text.to_string(),
            }
        } else {
            match (self.kind, self.precision) {
                (None, None) => float_repr(magnitude),
                (None, Some(p)) => general(magnitude, p, self.alternate, true),
                (Some('f' | 'F'), p) => fixed(magnitude, p.unwrap_or(6), self.alternate),
                (Some('e' | 'E'), p) => scientific(magnitude, p.unwrap_or(6), self.alternate),
                (Some('%'), p) => {
                    format!("{}%", fixed(magnitude * 100.0, p.unwrap_or(6), self.alternate))
                }
                (_, p) => general(magnitude, p.unwrap_or(6), self.alternate, false),
            }
        };

        if upper {
            body = body.to_uppercase();
        }

        if let Some(sep) = self.grouping {
            if self.kind == Some('n') {
                return Err(incompatible(&format!("Cannot specify '{}' with 'n'.", sep)));
            }
            let end = body.find(|c: char| !c.is_ascii_digit()).unwrap_or(body.len());
            body = format!("{}{}", group_digits(&body[..end], sep, 3), &body[end..]);
        }

        Ok(self.pad(self.sign_prefix(negative), &body, true))
    }
}

fn digits(chars: &[char]) -> Option<usize> {
    chars.iter().collect::<String>().parse().ok()
}

fn incompatible(message: &str) -> FormatError {
    FormatError::Incompatible(message.to_string())
}

fn unknown_code(kind: char, type_name: &str) -> FormatError {
    FormatError::Incompatible(format!(
        "Unknown format code '{}' for object of type '{}'",
        kind, type_name
    ))
}

fn group_digits(digits: &str, separator: char, size: usize) -> String {
    let len = digits.chars().count();
    let mut out = String::with_capacity(len + len / size);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (len - i) % size == 0 {
            out.push(separator);
        }
        out.push(ch);
    }
    out
}

fn fixed(magnitude: f64, precision: usize, alternate: bool) -> String {
    let text = format!("{:.*}", precision, magnitude);
    if alternate && precision == 0 {
        format!("{}.", text)
    } else {
        text
    }
}

fn scientific(magnitude: f64, precision: usize, alternate: bool) -> String {
    let text = format!("{:.*e}", precision, magnitude);
    let text = if alternate && precision == 0 {
        text.replacen('e', ".e", 1)
    } else {
        text
    };
    exponent_notation(&text)
}

/// `g`-style formatting. With `repr_style` (no type letter but a precision)
/// the switch to exponent form happens one digit earlier and at least one
/// fractional digit is kept.
fn general(magnitude: f64, precision: usize, alternate: bool, repr_style: bool) -> String {
    let precision = precision.max(1);
    let exponent = if magnitude == 0.0 {
        0
    } else {
        let rounded = format!("{:.*e}", precision - 1, magnitude);
        rounded
            .split_once('e')
            .and_then(|(_, e)| e.parse::<i32>().ok())
            .unwrap_or(0)
    };

    let limit = if repr_style { precision as i32 - 1 } else { precision as i32 };
    if (-4..limit).contains(&exponent) {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        let mut text = format!("{:.*}", decimals, magnitude);
        if !alternate {
            text = strip_fraction_zeros(&text);
        }
        if repr_style && !text.contains('.') {
            text.push_str(".0");
        }
        text
    } else {
        let text = format!("{:.*e}", precision - 1, magnitude);
        let text = match text.split_once('e') {
            Some((mantissa, exp)) if !alternate => {
                format!("{}e{}", strip_fraction_zeros(mantissa), exp)
            }
            _ => text,
        };
        exponent_notation(&text)
    }
}

fn strip_fraction_zeros(text: &str) -> String {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Value(FormatSpec),
}

/// A parsed display pattern.
///
/// Every replacement field (`{}` or `{0}`) refers to the single value
/// being displayed; `{{` and `}}` are literal braces.
///
/// # Examples
///
/// ```
/// use telemon::pipeline::format::FormatPattern;
/// use telemon::pipeline::value::Value;
///
/// let pattern: FormatPattern = "{:,} counts".parse().unwrap();
/// assert_eq!(pattern.render(&Value::Int(1500)).unwrap(), "1,500 counts");
///
/// let pattern: FormatPattern = "{:.3f}".parse().unwrap();
/// assert_eq!(pattern.render(&Value::Float(1.5)).unwrap(), "1.500");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatPattern {
    source: String,
    segments: Vec<Segment>,
}

impl FormatPattern {
    /// Parse a pattern.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] for unbalanced braces, named or indexed
    /// fields other than `{0}`, and malformed specifiers.
    pub fn parse(source: &str) -> Result<Self, FormatError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(FormatError::UnsupportedField(field)),
                            Some(ch) => field.push(ch),
                            None => return Err(FormatError::UnmatchedOpen),
                        }
                    }

                    let (name, spec) = field.split_once(':').unwrap_or((field.as_str(), ""));
                    if !(name.is_empty() || name == "0") {
                        return Err(FormatError::UnsupportedField(field.clone()));
                    }
                    let spec = FormatSpec::parse(spec)?;

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Value(spec));
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(FormatError::UnmatchedClose),
                _ => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Pattern text as written in the configuration
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render `value` through the pattern.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Incompatible`] when a specifier does not apply
    /// to the value's type, e.g. `{:d}` with a float or `{:.2f}` with text.
    pub fn render(&self, value: &Value) -> Result<String, FormatError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Value(spec) => out.push_str(&match value {
                    Value::Text(text) => spec.render_text(text)?,
                    Value::Int(i) => spec.render_int(*i)?,
                    Value::Float(f) => spec.render_float(*f)?,
                }),
            }
        }
        Ok(out)
    }
}

impl Default for FormatPattern {
    fn default() -> Self {
        Self {
            source: "{}".to_string(),
            segments: vec![Segment::Value(FormatSpec::default())],
        }
    }
}

impl FromStr for FormatPattern {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FormatPattern {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl<'de> serde::Deserialize<'de> for FormatPattern {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let source = String::deserialize(deserializer)?;
        Self::parse(&source)
            .map_err(|e| serde::de::Error::custom(format!("format {:?}: {}", source, e)))
    }
}

impl fmt::Display for FormatPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
