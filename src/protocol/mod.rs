//! # Line Protocol Module
//!
//! Newline-delimited CSV as emitted by the microcontroller.
//!
//! This module handles:
//! - Reassembling lines from arbitrarily fragmented serial reads
//! - Bounding the amount of unterminated data kept in memory
//! - Splitting a line into positionally addressed fields

pub mod framer;
pub mod record;

pub use framer::LineFramer;
pub use record::{parse, ParseError, Record};
