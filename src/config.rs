//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Fields are keyed by their zero-based position in the CSV line. A field
//! may be given as a full table or, as a shorthand, just its label:
//!
//! ```toml
//! [ports."/dev/ttyUSB0".fields]
//! 2 = "Status"
//! ```

use serde::de::Error;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::monitor::DisplayOptions;
use crate::pipeline::format::FormatPattern;
use crate::pipeline::value::Number;
use crate::serial::session::SessionOptions;

/// Annotated configuration written by `telemon --create-config`
pub const EXAMPLE_CONFIG: &str = r#"# telemon configuration
title = "Phase Tracker"

[session]
queue_capacity = 1024
poll_interval_ms = 100
max_line_bytes = 4096

[display]
placeholder = "---"
stale_after_ms = 5000

# One table per serial device. Fields are keyed by CSV position.
[ports."/dev/ttyUSB0"]
name = "encoders"
baudrate = 115200

[ports."/dev/ttyUSB0".fields]
3 = "Status"

[ports."/dev/ttyUSB0".fields.0]
label = "Time"
type = "int"
format = "{:,}"
unit = "ms"
color = "black"

[[ports."/dev/ttyUSB0".fields.0.transformations]]
operation = "divide"
value = 1000
label = "Seconds"
format = "{:.3f}"
unit = "s"

[ports."/dev/ttyUSB0".fields.1]
label = "Encoder 1"
type = "int"
format = "{:,}"
unit = "counts"
color = "blue"

[[ports."/dev/ttyUSB0".fields.1.transformations]]
operation = "divide"
value = 1600
label = "Revolutions"
format = "{:.3f}"
unit = "rev"

[[ports."/dev/ttyUSB0".fields.1.transformations]]
operation = "multiply"
value = 360
label = "Degrees"
format = "{:.1f}"
unit = "deg"

[ports."/dev/ttyUSB0".fields.2]
label = "Encoder 2"
type = "int"
format = "{:,}"
unit = "counts"
color = "red"

[[ports."/dev/ttyUSB0".fields.2.transformations]]
operation = "divide"
value = 1600
label = "Revolutions"
format = "{:.3f}"
unit = "rev"
"#;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    /// Keyed by device path
    #[serde(default)]
    pub ports: BTreeMap<String, PortConfig>,
}

/// Reader and queue tuning shared by all ports
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    #[serde(default = "default_read_buffer_bytes")]
    pub read_buffer_bytes: usize,
}

/// Presentation of missing or failed fields
#[derive(Debug, Deserialize, Clone)]
pub struct DisplayConfig {
    #[serde(default = "default_placeholder")]
    pub placeholder: String,

    /// Last-known-good values older than this are replaced by the
    /// placeholder; unset means they never expire
    #[serde(default)]
    pub stale_after_ms: Option<u64>,
}

/// One serial device
#[derive(Debug, Deserialize, Clone)]
pub struct PortConfig {
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,

    /// Display name; the device path is used when absent
    #[serde(default)]
    pub name: Option<String>,

    /// Keyed by CSV position ("0", "1", ...)
    #[serde(default)]
    pub fields: BTreeMap<String, FieldEntry>,
}

/// A field written either as a bare label or as a full table
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum FieldEntry {
    Label(String),
    Detailed(FieldConfig),
}

/// How one CSV position is interpreted and displayed
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct FieldConfig {
    /// Taken from the table key during normalization
    #[serde(skip)]
    pub position: usize,

    #[serde(default)]
    pub label: String,

    #[serde(rename = "type", default)]
    pub field_type: FieldType,

    #[serde(default)]
    pub format: FormatPattern,

    #[serde(default)]
    pub unit: String,

    #[serde(default)]
    pub color: Color,

    #[serde(default)]
    pub transformations: Vec<TransformStep>,
}

/// Type a raw field is coerced to
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Int,
    Float,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float => "float",
        })
    }
}

/// Display color hint
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    #[default]
    Black,
    Red,
    Green,
    Blue,
    Orange,
    Purple,
}

/// Arithmetic applied by a transformation step
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Multiply,
    Divide,
    Add,
    Subtract,
    Power,
}

/// One step of a field's transformation chain
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct TransformStep {
    pub operation: Operation,

    #[serde(rename = "value", alias = "operand")]
    pub operand: Number,

    #[serde(default = "default_step_label")]
    pub label: String,

    #[serde(default = "default_step_format")]
    pub format: FormatPattern,

    #[serde(default)]
    pub unit: String,
}

// Default value functions
fn default_title() -> String { "Serial Monitor".to_string() }

fn default_queue_capacity() -> usize { 1024 }
fn default_poll_interval_ms() -> u64 { 100 }
fn default_max_line_bytes() -> usize { 4096 }
fn default_read_buffer_bytes() -> usize { 512 }

fn default_placeholder() -> String { "---".to_string() }

fn default_baudrate() -> u32 { crate::serial::DEFAULT_BAUD_RATE }

fn default_step_label() -> String { "Transformed".to_string() }
fn default_step_format() -> FormatPattern {
    FormatPattern::parse("{:.3f}").unwrap_or_default()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            max_line_bytes: default_max_line_bytes(),
            read_buffer_bytes: default_read_buffer_bytes(),
        }
    }
}

impl SessionConfig {
    /// Session options for every port
    #[must_use]
    pub fn options(&self) -> SessionOptions {
        SessionOptions {
            queue_capacity: self.queue_capacity,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_line_bytes: self.max_line_bytes,
            read_buffer_bytes: self.read_buffer_bytes,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            placeholder: default_placeholder(),
            stale_after_ms: None,
        }
    }
}

impl DisplayConfig {
    /// Dispatcher options derived from this section
    #[must_use]
    pub fn options(&self) -> DisplayOptions {
        DisplayOptions {
            placeholder: self.placeholder.clone(),
            stale_after: self.stale_after_ms.map(Duration::from_millis),
        }
    }
}

impl FieldConfig {
    /// A string field with default formatting, as produced by the label
    /// shorthand.
    #[must_use]
    pub fn labelled(position: usize, label: &str) -> Self {
        Self {
            position,
            label: label.to_string(),
            field_type: FieldType::default(),
            format: FormatPattern::default(),
            unit: String::new(),
            color: Color::default(),
            transformations: Vec::new(),
        }
    }
}

impl PortConfig {
    /// Name shown for this port
    pub fn display_name<'a>(&'a self, device: &'a str) -> &'a str {
        self.name.as_deref().unwrap_or(device)
    }

    /// Normalized field configurations, sorted by position.
    ///
    /// Shorthand labels are expanded and empty labels become
    /// `"Field <position>"`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a key is not a non-negative integer
    /// or two keys name the same position (`"1"` and `"01"`).
    pub fn field_configs(&self, device: &str) -> Result<Vec<FieldConfig>> {
        let mut fields: Vec<FieldConfig> = Vec::with_capacity(self.fields.len());

        for (key, entry) in &self.fields {
            let position: usize = key.trim().parse().map_err(|_| {
                crate::error::MonitorError::Config(toml::de::Error::custom(format!(
                    "field key '{}' on {} must be a non-negative integer position",
                    key, device
                )))
            })?;

            if fields.iter().any(|f| f.position == position) {
                return Err(crate::error::MonitorError::Config(toml::de::Error::custom(
                    format!("field position {} on {} is configured twice", position, device),
                )));
            }

            let mut field = match entry {
                FieldEntry::Label(label) => FieldConfig::labelled(position, label),
                FieldEntry::Detailed(field) => field.clone(),
            };
            field.position = position;
            if field.label.is_empty() {
                field.label = format!("Field {}", position);
            }
            fields.push(field);
        }

        fields.sort_by_key(|f| f.position);
        Ok(fields)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails (including malformed format patterns and
    ///   unknown operations)
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemon::config::Config;
    ///
    /// let config = Config::load("telemon.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`], minus file access.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// The configuration in [`EXAMPLE_CONFIG`]
    ///
    /// # Errors
    ///
    /// Never fails in practice; the example is covered by tests.
    pub fn example() -> Result<Self> {
        Self::from_toml_str(EXAMPLE_CONFIG)
    }

    /// Validate configuration values
    ///
    /// # Returns
    ///
    /// * `Result<()>` - Ok if valid, Err if invalid
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        // Validate session limits
        if self.session.queue_capacity == 0 {
            return Err(crate::error::MonitorError::Config(
                toml::de::Error::custom("queue_capacity must be greater than 0")
            ));
        }

        if self.session.poll_interval_ms == 0 || self.session.poll_interval_ms > 10000 {
            return Err(crate::error::MonitorError::Config(
                toml::de::Error::custom("poll_interval_ms must be between 1 and 10000")
            ));
        }

        if self.session.max_line_bytes == 0 {
            return Err(crate::error::MonitorError::Config(
                toml::de::Error::custom("max_line_bytes must be greater than 0")
            ));
        }

        if self.session.read_buffer_bytes == 0 || self.session.read_buffer_bytes > 65536 {
            return Err(crate::error::MonitorError::Config(
                toml::de::Error::custom("read_buffer_bytes must be between 1 and 65536")
            ));
        }

        if self.display.stale_after_ms == Some(0) {
            return Err(crate::error::MonitorError::Config(
                toml::de::Error::custom("stale_after_ms must be greater than 0 when set")
            ));
        }

        // Validate ports
        let mut names = HashSet::new();
        for (device, port) in &self.ports {
            if device.trim().is_empty() {
                return Err(crate::error::MonitorError::Config(
                    toml::de::Error::custom("port device path cannot be empty")
                ));
            }

            if port.baudrate == 0 {
                return Err(crate::error::MonitorError::Config(
                    toml::de::Error::custom(format!(
                        "baudrate for {} must be greater than 0",
                        device
                    ))
                ));
            }

            let name = port.display_name(device);
            if !names.insert(name) {
                return Err(crate::error::MonitorError::Config(
                    toml::de::Error::custom(format!("port name '{}' is used more than once", name))
                ));
            }

            for field in port.field_configs(device)? {
                if field.field_type == FieldType::String && !field.transformations.is_empty() {
                    warn!(
                        device = %device,
                        position = field.position,
                        "Transformations on string field '{}' will be ignored",
                        field.label
                    );
                }

                for (index, step) in field.transformations.iter().enumerate() {
                    if step.operation == Operation::Divide && step.operand.is_zero() {
                        warn!(
                            device = %device,
                            position = field.position,
                            step = index,
                            "Field '{}' divides by zero; it will always show a placeholder",
                            field.label
                        );
                    }
                }
            }
        }

        Ok(())
    }
}
