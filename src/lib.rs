//! # Telemon Library
//!
//! Live monitoring of comma-separated telemetry streamed over serial ports.
//!
//! Bytes from each device are framed into lines, split into positional
//! fields, run through a per-field pipeline of type coercion, unit
//! conversion and formatting, and published to a display sink.

pub mod config;
pub mod display;
pub mod error;
pub mod monitor;
pub mod pipeline;
pub mod protocol;
pub mod serial;
