//! Routes port events through the field pipeline to the display sink.
//!
//! Records travel in one bounded drop-oldest queue per port, so a busy port
//! can only evict its own records. Status changes travel on an unbounded
//! control channel and are never dropped; there are only a handful per port.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::config::FieldConfig;
use crate::display::{DisplaySink, PortStatus};
use crate::pipeline::{self, Observation};
use crate::protocol::Record;
use crate::serial::queue::BoundedQueue;

/// Something that happened on a port
#[derive(Debug, Clone)]
pub enum PortEvent {
    Connected { port: String, device: String },
    Record { port: String, record: Arc<Record> },
    Failed { port: String, message: String },
    Closed { port: String },
}

/// How missing or failed fields are presented
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayOptions {
    pub placeholder: String,
    /// Last-known-good observations older than this are not reused
    pub stale_after: Option<Duration>,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            placeholder: "---".to_string(),
            stale_after: None,
        }
    }
}

/// Per-port record queues shared by the session handlers and the dispatcher
#[derive(Debug)]
pub struct RecordQueues {
    queues: Vec<(String, BoundedQueue<Arc<Record>>)>,
    ready: Notify,
}

impl RecordQueues {
    /// One queue of `capacity` records for each port in `ports`
    pub fn new<I, S>(ports: I, capacity: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: ports
                .into_iter()
                .map(|port| (port.into(), BoundedQueue::new(capacity)))
                .collect(),
            ready: Notify::new(),
        }
    }

    /// Queue a record for `port` and wake the dispatcher.
    ///
    /// Returns `true` if an older record of the same port was evicted.
    /// Records for unknown ports are dropped.
    pub fn push(&self, port: &str, record: Arc<Record>) -> bool {
        let Some(queue) = self.queue(port) else {
            trace!(port, "Record for unregistered port dropped");
            return false;
        };
        let evicted = queue.push(record);
        self.ready.notify_one();
        evicted
    }

    /// Records waiting for `port`
    pub fn pending(&self, port: &str) -> usize {
        self.queue(port).map_or(0, BoundedQueue::len)
    }

    /// Records dropped for `port` because its queue was full
    pub fn evicted_count(&self, port: &str) -> u64 {
        self.queue(port).map_or(0, BoundedQueue::evicted_count)
    }

    fn queue(&self, port: &str) -> Option<&BoundedQueue<Arc<Record>>> {
        self.queues
            .iter()
            .find(|(name, _)| name == port)
            .map(|(_, queue)| queue)
    }
}

/// Evaluates records and feeds the sink.
///
/// Runs on a single task so per-port event order is kept.
pub struct Dispatcher {
    fields: HashMap<String, Vec<FieldConfig>>,
    sink: Box<dyn DisplaySink>,
    options: DisplayOptions,
    last_good: HashMap<(String, usize), (Observation, Instant)>,
    failed: HashSet<String>,
}

impl Dispatcher {
    pub fn new(
        fields: HashMap<String, Vec<FieldConfig>>,
        sink: Box<dyn DisplaySink>,
        options: DisplayOptions,
    ) -> Self {
        Self {
            fields,
            sink,
            options,
            last_good: HashMap::new(),
            failed: HashSet::new(),
        }
    }

    /// Run until every control sender is dropped, then drain the remaining
    /// records and stop the sink.
    ///
    /// Status events are applied before records that arrived later, and a
    /// port's queued records are shown before its `Failed` or `Closed`
    /// status.
    pub async fn run(
        mut self,
        mut control: UnboundedReceiver<PortEvent>,
        records: Arc<RecordQueues>,
    ) {
        self.sink.start();

        'run: loop {
            loop {
                match control.try_recv() {
                    Ok(event) => self.handle_control(event, &records),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'run,
                }
            }

            if self.drain_pass(&records) > 0 {
                continue;
            }

            tokio::select! {
                event = control.recv() => match event {
                    Some(event) => self.handle_control(event, &records),
                    None => break 'run,
                },
                () = records.ready.notified() => {}
            }
        }

        while self.drain_pass(&records) > 0 {}
        self.sink.stop();
        debug!("Dispatcher stopped");
    }

    fn handle_control(&mut self, event: PortEvent, records: &RecordQueues) {
        if let PortEvent::Failed { port, .. } | PortEvent::Closed { port } = &event {
            if let Some(queue) = records.queue(port) {
                while let Some(record) = queue.try_pop() {
                    self.dispatch_record(port, &record);
                }
            }
        }
        self.handle(event);
    }

    /// One round-robin pass over the port queues, taking at most the
    /// records queued when the pass reached each port.
    fn drain_pass(&mut self, records: &RecordQueues) -> usize {
        let mut dispatched = 0;
        for (port, queue) in &records.queues {
            for _ in 0..queue.len() {
                let Some(record) = queue.try_pop() else {
                    break;
                };
                self.dispatch_record(port, &record);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Apply one event
    pub fn handle(&mut self, event: PortEvent) {
        match event {
            PortEvent::Connected { port, device } => {
                self.failed.remove(&port);
                self.sink.port_status(&port, &PortStatus::Connected { device });
            }
            PortEvent::Record { port, record } => self.dispatch_record(&port, &record),
            PortEvent::Failed { port, message } => {
                if self.failed.insert(port.clone()) {
                    self.sink.port_status(&port, &PortStatus::Failed { message });
                } else {
                    trace!(port = %port, "Repeated failure suppressed");
                }
            }
            PortEvent::Closed { port } => self.sink.port_status(&port, &PortStatus::Closed),
        }
    }

    fn dispatch_record(&mut self, port: &str, record: &Record) {
        let Some(fields) = self.fields.get(port) else {
            trace!(port, "Record for unconfigured port ignored");
            return;
        };

        for field in fields {
            let observation = match pipeline::evaluate_record(field, record) {
                Ok(Some(observation)) => {
                    self.last_good.insert(
                        (port.to_string(), field.position),
                        (observation.clone(), record.timestamp()),
                    );
                    observation
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(
                        port,
                        position = field.position,
                        sequence = record.sequence(),
                        error = %e,
                        "Field evaluation failed"
                    );
                    fallback(&self.last_good, &self.options, port, field, record.timestamp())
                }
            };
            self.sink.update(port, field.position, &observation);
        }

        self.sink.record_complete(port, record.sequence());
    }
}

fn fallback(
    last_good: &HashMap<(String, usize), (Observation, Instant)>,
    options: &DisplayOptions,
    port: &str,
    field: &FieldConfig,
    now: Instant,
) -> Observation {
    match last_good.get(&(port.to_string(), field.position)) {
        Some((observation, at)) if !is_stale(options.stale_after, *at, now) => observation.clone(),
        _ => Observation::placeholder(field, &options.placeholder),
    }
}

fn is_stale(stale_after: Option<Duration>, at: Instant, now: Instant) -> bool {
    stale_after.is_some_and(|limit| now.saturating_duration_since(at) > limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldType, Operation, TransformStep};
    use crate::display::MockDisplaySink;
    use crate::pipeline::value::Number;
    use chrono::Local;
    use mockall::predicate::{always, eq};
    use mockall::Sequence;

    fn int_field(position: usize, label: &str) -> FieldConfig {
        FieldConfig {
            field_type: FieldType::Int,
            ..FieldConfig::labelled(position, label)
        }
    }

    fn record_at(text: &str, sequence: u64, timestamp: Instant) -> PortEvent {
        PortEvent::Record {
            port: "axis".to_string(),
            record: Arc::new(
                crate::protocol::parse(text, timestamp, Local::now(), sequence).unwrap(),
            ),
        }
    }

    fn parsed(text: &str, sequence: u64) -> Arc<Record> {
        Arc::new(crate::protocol::parse(text, Instant::now(), Local::now(), sequence).unwrap())
    }

    fn record(text: &str, sequence: u64) -> PortEvent {
        record_at(text, sequence, Instant::now())
    }

    fn dispatcher(
        sink: MockDisplaySink,
        fields: Vec<FieldConfig>,
        options: DisplayOptions,
    ) -> Dispatcher {
        let mut map = HashMap::new();
        map.insert("axis".to_string(), fields);
        Dispatcher::new(map, Box::new(sink), options)
    }

    #[test]
    fn test_fields_update_in_position_order() {
        let mut sink = MockDisplaySink::new();
        let mut seq = Sequence::new();
        sink.expect_update()
            .withf(|port, position, obs| {
                port == "axis" && *position == 0 && obs.final_value == "10"
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_update()
            .withf(|_, position, obs| *position == 2 && obs.final_value == "30")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete()
            .with(eq("axis"), eq(0))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut dispatcher = dispatcher(
            sink,
            vec![int_field(0, "A"), int_field(2, "C")],
            DisplayOptions::default(),
        );
        dispatcher.handle(record("10,20,30", 0));
    }

    #[test]
    fn test_short_record_skips_missing_positions() {
        let mut sink = MockDisplaySink::new();
        sink.expect_update()
            .withf(|_, position, _| *position == 0)
            .times(1)
            .return_const(());
        sink.expect_record_complete().times(1).return_const(());

        let mut dispatcher = dispatcher(
            sink,
            vec![int_field(0, "A"), int_field(5, "F")],
            DisplayOptions::default(),
        );
        dispatcher.handle(record("1,2", 0));
    }

    #[test]
    fn test_bad_field_shows_placeholder_and_others_continue() {
        let mut sink = MockDisplaySink::new();
        sink.expect_update()
            .withf(|_, position, obs| {
                *position == 0 && obs.is_placeholder() && obs.final_value == "---"
            })
            .times(1)
            .return_const(());
        sink.expect_update()
            .withf(|_, position, obs| *position == 1 && obs.final_value == "7")
            .times(1)
            .return_const(());
        sink.expect_record_complete().times(1).return_const(());

        let mut dispatcher = dispatcher(
            sink,
            vec![int_field(0, "A"), int_field(1, "B")],
            DisplayOptions::default(),
        );
        dispatcher.handle(record("oops,7", 0));
    }

    #[test]
    fn test_division_by_zero_is_contained_to_its_field() {
        let broken = FieldConfig {
            transformations: vec![TransformStep {
                operation: Operation::Divide,
                operand: Number::Int(0),
                label: "Broken".into(),
                format: "{}".parse().unwrap(),
                unit: String::new(),
            }],
            ..int_field(0, "Broken")
        };

        let mut sink = MockDisplaySink::new();
        let mut seq = Sequence::new();
        sink.expect_update()
            .withf(|_, position, obs| {
                *position == 0 && obs.is_placeholder() && obs.final_value == "---"
            })
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_update()
            .withf(|_, position, obs| *position == 1 && obs.final_value == "20")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete()
            .with(eq("axis"), eq(0))
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());

        let mut dispatcher = dispatcher(
            sink,
            vec![broken, int_field(1, "Healthy")],
            DisplayOptions::default(),
        );
        dispatcher.handle(record("10,20", 0));
    }

    #[test]
    fn test_division_by_zero_reuses_last_known_good() {
        let divide = TransformStep {
            operation: Operation::Divide,
            operand: Number::Int(0),
            label: "Broken".into(),
            format: "{}".parse().unwrap(),
            unit: String::new(),
        };
        let mut field = int_field(0, "A");

        let mut sink = MockDisplaySink::new();
        let mut seq = Sequence::new();
        sink.expect_update()
            .withf(|_, _, obs| obs.final_value == "5")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete().times(1).in_sequence(&mut seq).return_const(());
        sink.expect_update()
            .withf(|_, _, obs| obs.final_value == "5")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete().times(1).in_sequence(&mut seq).return_const(());

        let mut dispatcher = dispatcher(sink, vec![field.clone()], DisplayOptions::default());
        dispatcher.handle(record("5", 0));

        // Same position now always fails
        field.transformations.push(divide);
        dispatcher.fields.insert("axis".to_string(), vec![field]);
        dispatcher.handle(record("6", 1));
    }

    #[test]
    fn test_stale_last_known_good_becomes_placeholder() {
        let mut sink = MockDisplaySink::new();
        let mut seq = Sequence::new();
        sink.expect_update()
            .withf(|_, _, obs| obs.final_value == "5")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete().times(1).in_sequence(&mut seq).return_const(());
        sink.expect_update()
            .withf(|_, _, obs| obs.final_value == "n/a")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete().times(1).in_sequence(&mut seq).return_const(());

        let options = DisplayOptions {
            placeholder: "n/a".to_string(),
            stale_after: Some(Duration::from_millis(100)),
        };
        let mut dispatcher = dispatcher(sink, vec![int_field(0, "A")], options);

        let start = Instant::now();
        dispatcher.handle(record_at("5", 0, start));
        dispatcher.handle(record_at("bad", 1, start + Duration::from_secs(1)));
    }

    #[test]
    fn test_failure_reported_once_per_port() {
        let mut sink = MockDisplaySink::new();
        sink.expect_port_status()
            .with(eq("axis"), always())
            .times(1)
            .return_const(());

        let mut dispatcher = dispatcher(sink, Vec::new(), DisplayOptions::default());
        for _ in 0..3 {
            dispatcher.handle(PortEvent::Failed {
                port: "axis".to_string(),
                message: "unplugged".to_string(),
            });
        }
    }

    #[test]
    fn test_unknown_port_is_ignored() {
        let sink = MockDisplaySink::new();
        let mut dispatcher = dispatcher(sink, vec![int_field(0, "A")], DisplayOptions::default());
        dispatcher.handle(PortEvent::Record {
            port: "other".to_string(),
            record: Arc::new(crate::protocol::parse("1", Instant::now(), Local::now(), 0).unwrap()),
        });
    }

    #[tokio::test]
    async fn test_run_drains_queue_then_stops_sink() {
        let mut sink = MockDisplaySink::new();
        let mut seq = Sequence::new();
        sink.expect_start().times(1).in_sequence(&mut seq).return_const(());
        sink.expect_update().times(2).in_sequence(&mut seq).return_const(());
        sink.expect_record_complete().times(1).in_sequence(&mut seq).return_const(());
        sink.expect_stop().times(1).in_sequence(&mut seq).return_const(());

        let dispatcher = dispatcher(
            sink,
            vec![int_field(0, "A"), int_field(1, "B")],
            DisplayOptions::default(),
        );
        let records = Arc::new(RecordQueues::new(["axis"], 16));
        records.push("axis", parsed("1,2", 0));
        let (control, control_rx) = tokio::sync::mpsc::unbounded_channel();
        drop(control);

        dispatcher.run(control_rx, records).await;
    }

    #[tokio::test]
    async fn test_queued_records_precede_failure_status() {
        let mut sink = MockDisplaySink::new();
        let mut seq = Sequence::new();
        sink.expect_start().times(1).in_sequence(&mut seq).return_const(());
        sink.expect_update()
            .withf(|_, _, obs| obs.final_value == "4")
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_record_complete().times(1).in_sequence(&mut seq).return_const(());
        sink.expect_port_status()
            .with(eq("axis"), always())
            .times(1)
            .in_sequence(&mut seq)
            .return_const(());
        sink.expect_stop().times(1).in_sequence(&mut seq).return_const(());

        let dispatcher = dispatcher(sink, vec![int_field(0, "A")], DisplayOptions::default());
        let records = Arc::new(RecordQueues::new(["axis"], 16));
        records.push("axis", parsed("4", 0));
        let (control, control_rx) = tokio::sync::mpsc::unbounded_channel();
        control
            .send(PortEvent::Failed {
                port: "axis".to_string(),
                message: "unplugged".to_string(),
            })
            .unwrap();
        drop(control);

        dispatcher.run(control_rx, records).await;
    }

    #[test]
    fn test_record_queues_evict_per_port() {
        let records = RecordQueues::new(["busy", "quiet"], 2);
        records.push("quiet", parsed("q", 0));
        for sequence in 0..10 {
            records.push("busy", parsed("b", sequence));
        }

        assert_eq!(records.pending("busy"), 2);
        assert_eq!(records.evicted_count("busy"), 8);
        assert_eq!(records.pending("quiet"), 1);
        assert_eq!(records.evicted_count("quiet"), 0);
        assert!(!records.push("unknown", parsed("x", 0)));
        assert_eq!(records.pending("unknown"), 0);
    }
}
