//! Plain-text dashboard: one line per completed record.
//!
//! ```text
//! encoders #42 | Time: 1.500 s | Encoder 1: 3,200 counts -> 2.000 rev -> 720.0 deg
//! ```

use std::collections::BTreeMap;
use std::io::{self, Write};
use tracing::warn;

use super::{DisplaySink, PortStatus};
use crate::pipeline::Observation;

/// Writes a text dashboard to any writer (stdout by default)
pub struct TextSink<W> {
    out: W,
    rows: BTreeMap<String, BTreeMap<usize, Observation>>,
    write_failed: bool,
}

impl TextSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            rows: BTreeMap::new(),
            write_failed: false,
        }
    }

    /// Latest observation shown for `port` at `position`
    pub fn current(&self, port: &str, position: usize) -> Option<&Observation> {
        self.rows.get(port).and_then(|row| row.get(&position))
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render_row(&self, port: &str, sequence: u64) -> String {
        let mut line = format!("{} #{}", port, sequence);
        if let Some(row) = self.rows.get(port) {
            for observation in row.values() {
                line.push_str(" | ");
                line.push_str(&render_observation(observation));
            }
        }
        line
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line).and_then(|()| self.out.flush()) {
            // Only the first failure is logged
            if !self.write_failed {
                warn!(error = %e, "Failed to write to display");
                self.write_failed = true;
            }
        }
    }
}

fn render_observation(observation: &Observation) -> String {
    let mut text = format!("{}: {}", observation.label, observation.formatted_raw);
    for step in &observation.steps {
        text.push_str(" -> ");
        text.push_str(&step.formatted);
    }
    text
}

impl<W: Write + Send> DisplaySink for TextSink<W> {
    fn update(&mut self, port: &str, position: usize, observation: &Observation) {
        self.rows
            .entry(port.to_string())
            .or_default()
            .insert(position, observation.clone());
    }

    fn record_complete(&mut self, port: &str, sequence: u64) {
        let line = self.render_row(port, sequence);
        self.write_line(&line);
    }

    fn port_status(&mut self, port: &str, status: &PortStatus) {
        let line = match status {
            PortStatus::Connected { device } => format!("[{}] connected to {}", port, device),
            PortStatus::Failed { message } => format!("[{}] unavailable: {}", port, message),
            PortStatus::Closed => format!("[{}] closed", port),
        };
        self.write_line(&line);
    }

    fn stop(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!(error = %e, "Failed to flush display");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldConfig, FieldType, Operation, TransformStep};
    use crate::pipeline::evaluate;
    use crate::pipeline::value::Number;

    fn output(sink: TextSink<Vec<u8>>) -> String {
        String::from_utf8(sink.into_inner()).unwrap()
    }

    #[test]
    fn test_row_shows_fields_in_position_order() {
        let mut sink = TextSink::new(Vec::new());
        let b = evaluate(&FieldConfig::labelled(1, "B"), "beta").unwrap();
        let a = evaluate(&FieldConfig::labelled(0, "A"), "alpha").unwrap();

        sink.update("axis", 1, &b);
        sink.update("axis", 0, &a);
        sink.record_complete("axis", 3);

        assert_eq!(output(sink), "axis #3 | A: alpha | B: beta\n");
    }

    #[test]
    fn test_row_shows_transformation_steps() {
        let field = FieldConfig {
            field_type: FieldType::Int,
            format: "{:,}".parse().unwrap(),
            unit: "counts".into(),
            transformations: vec![TransformStep {
                operation: Operation::Divide,
                operand: Number::Int(1600),
                label: "Revolutions".into(),
                format: "{:.3f}".parse().unwrap(),
                unit: "rev".into(),
            }],
            ..FieldConfig::labelled(0, "Encoder")
        };

        let mut sink = TextSink::new(Vec::new());
        sink.update("enc", 0, &evaluate(&field, "3200").unwrap());
        sink.record_complete("enc", 0);

        assert_eq!(output(sink), "enc #0 | Encoder: 3,200 counts -> 2.000 rev\n");
    }

    #[test]
    fn test_previous_values_are_retained() {
        let mut sink = TextSink::new(Vec::new());
        let field = FieldConfig::labelled(0, "A");
        sink.update("axis", 0, &evaluate(&field, "1").unwrap());
        sink.update("axis", 0, &evaluate(&field, "2").unwrap());

        assert_eq!(sink.current("axis", 0).unwrap().final_value, "2");
        assert!(sink.current("axis", 1).is_none());
        assert!(sink.current("other", 0).is_none());
    }

    #[test]
    fn test_status_lines() {
        let mut sink = TextSink::new(Vec::new());
        sink.port_status(
            "axis",
            &PortStatus::Connected {
                device: "/dev/ttyUSB0".into(),
            },
        );
        sink.port_status(
            "axis",
            &PortStatus::Failed {
                message: "unplugged".into(),
            },
        );
        sink.port_status("axis", &PortStatus::Closed);

        assert_eq!(
            output(sink),
            "[axis] connected to /dev/ttyUSB0\n[axis] unavailable: unplugged\n[axis] closed\n"
        );
    }
}
