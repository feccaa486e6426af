//! JSON-lines output: one object per observation or status change.
//!
//! Suitable for piping into other tools:
//!
//! ```text
//! {"timestamp":"2024-05-01T12:00:00.123Z","port":"encoders","position":1,"observation":{...}}
//! {"timestamp":"2024-05-01T12:00:02.000Z","port":"encoders","status":"failed","message":"..."}
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::{self, Write};
use tracing::warn;

use super::{DisplaySink, PortStatus};
use crate::pipeline::Observation;

#[derive(Serialize)]
struct ObservationLine<'a> {
    timestamp: DateTime<Utc>,
    port: &'a str,
    position: usize,
    observation: &'a Observation,
}

#[derive(Serialize)]
struct StatusLine<'a> {
    timestamp: DateTime<Utc>,
    port: &'a str,
    #[serde(flatten)]
    status: &'a PortStatus,
}

/// Writes JSON lines to any writer (stdout by default)
pub struct JsonlSink<W> {
    out: W,
    lines_written: u64,
}

impl JsonlSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            lines_written: 0,
        }
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_record<T: Serialize>(&mut self, line: &T) {
        let result = serde_json::to_writer(&mut self.out, line)
            .map_err(io::Error::from)
            .and_then(|()| self.out.write_all(b"\n"));

        match result {
            Ok(()) => self.lines_written += 1,
            Err(e) => warn!(error = %e, "Failed to write JSON line"),
        }
    }
}

impl<W: Write + Send> DisplaySink for JsonlSink<W> {
    fn update(&mut self, port: &str, position: usize, observation: &Observation) {
        self.write_record(&ObservationLine {
            timestamp: Utc::now(),
            port,
            position,
            observation,
        });
    }

    fn port_status(&mut self, port: &str, status: &PortStatus) {
        self.write_record(&StatusLine {
            timestamp: Utc::now(),
            port,
            status,
        });
    }

    fn stop(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "Failed to flush JSON output");
        }
    }
}
