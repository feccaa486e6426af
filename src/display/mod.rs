//! # Display Module
//!
//! Consumers of observations.
//!
//! This module handles:
//! - The [`DisplaySink`] trait with an explicit start/stop lifecycle
//! - A plain-text dashboard ([`text::TextSink`])
//! - A JSON-lines stream ([`jsonl::JsonlSink`])
//! - Closure adapters ([`FnSink`]) and a no-op sink

pub mod jsonl;
pub mod text;

pub use jsonl::JsonlSink;
pub use text::TextSink;

use serde::Serialize;

use crate::pipeline::Observation;

/// Connection status of a port, as shown to the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PortStatus {
    Connected { device: String },
    Failed { message: String },
    Closed,
}

/// Receives observations from the dispatcher.
///
/// All calls come from one task, in order. `update` is called once per
/// configured position present in a record, then `record_complete` once
/// for the record.
#[cfg_attr(test, mockall::automock)]
pub trait DisplaySink: Send {
    /// Called once before the first update
    fn start(&mut self) {}

    fn update(&mut self, port: &str, position: usize, observation: &Observation);

    /// All fields of record `sequence` from `port` have been delivered
    fn record_complete(&mut self, _port: &str, _sequence: u64) {}

    fn port_status(&mut self, _port: &str, _status: &PortStatus) {}

    /// Called once after the last update
    fn stop(&mut self) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn update(&mut self, _port: &str, _position: usize, _observation: &Observation) {}
}

/// Adapts a closure `(port, position, observation)` into a sink
pub struct FnSink<F> {
    callback: F,
}

impl<F> FnSink<F>
where
    F: FnMut(&str, usize, &Observation) + Send,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> DisplaySink for FnSink<F>
where
    F: FnMut(&str, usize, &Observation) + Send,
{
    fn update(&mut self, port: &str, position: usize, observation: &Observation) {
        (self.callback)(port, position, observation)
    }
}
