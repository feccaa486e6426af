//! # Port Session
//!
//! Owns one open serial device and the task that reads it.
//!
//! This module handles:
//! - Reading chunks with a bounded poll interval so close is prompt
//! - Framing and parsing lines into sequenced [`Record`]s
//! - Delivering records to a bounded queue (pull) or a handler (push)
//! - Surfacing device failures without touching other ports
//!
//! There is no automatic reopen: after a device error the session stays in
//! [`SessionState::Error`] until it is closed.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::port_trait::SerialPortIO;
use super::queue::{BoundedQueue, Pop};
use crate::error::{MonitorError, Result};
use crate::protocol::{self, LineFramer, Record};

/// Default depth of the pull-mode record queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default upper bound on a single blocking read
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default size of the read buffer
pub const DEFAULT_READ_BUFFER_BYTES: usize = 512;

/// Tuning for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub queue_capacity: usize,
    pub poll_interval: Duration,
    pub max_line_bytes: usize,
    pub read_buffer_bytes: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_line_bytes: protocol::framer::DEFAULT_MAX_LINE_BYTES,
            read_buffer_bytes: DEFAULT_READ_BUFFER_BYTES,
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Error,
}

/// Receives records in push mode.
///
/// Called from the session's reader task, so implementations should return
/// quickly. Any `FnMut(Record)` closure is a handler.
///
/// A panic in `on_record` stops the reader. The session moves to
/// [`SessionState::Error`] and `on_error` is called with a device error.
pub trait RecordHandler: Send + 'static {
    fn on_record(&mut self, record: Record);

    /// The device failed; no further records will arrive
    fn on_error(&mut self, _error: &MonitorError) {}
}

impl<F> RecordHandler for F
where
    F: FnMut(Record) + Send + 'static,
{
    fn on_record(&mut self, record: Record) {
        self(record)
    }
}

/// How a session hands out records
pub enum Delivery {
    /// Buffer records for [`PortSession::next_record`]
    Pull,
    /// Call the handler for every record
    Push(Box<dyn RecordHandler>),
}

/// Counters snapshot for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    /// Terminated lines, including blank ones
    pub lines_received: u64,
    pub records_parsed: u64,
    /// Blank lines dropped by the parser
    pub lines_discarded: u64,
    /// Oversized lines dropped by the framer
    pub framing_errors: u64,
    /// Records dropped because the pull queue was full
    pub records_evicted: u64,
    pub last_line_at: Option<DateTime<Local>>,
}

#[derive(Debug, Default)]
struct Counters {
    lines_received: AtomicU64,
    records_parsed: AtomicU64,
    lines_discarded: AtomicU64,
    framing_errors: AtomicU64,
    records_evicted: AtomicU64,
    last_line_at: Mutex<Option<DateTime<Local>>>,
}

#[derive(Debug)]
struct Shared {
    device_path: String,
    state: Mutex<SessionState>,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the previous state
    fn set_state(&self, next: SessionState) -> SessionState {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, next)
    }
}

enum RecordSink {
    Queue(Arc<BoundedQueue<Record>>),
    Handler(Box<dyn RecordHandler>),
}

/// One open serial device and its reader task.
///
/// Dropping a session signals its reader to stop; call
/// [`close`](Self::close) to also wait for the device to be released.
pub struct PortSession {
    shared: Arc<Shared>,
    queue: Option<Arc<BoundedQueue<Record>>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PortSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSession")
            .field("device_path", &self.shared.device_path)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl PortSession {
    /// Open a device in pull mode
    ///
    /// # Arguments
    ///
    /// * `device_path` - Device path (e.g., "/dev/ttyUSB0")
    /// * `baudrate` - Line speed
    /// * `options` - Queue and reader tuning
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Serial`] if the device cannot be opened.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use telemon::serial::session::{PortSession, SessionOptions};
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let mut session = PortSession::open("/dev/ttyUSB0", 115200, SessionOptions::default())?;
    ///     if let Some(record) = session.next_record(Duration::from_secs(1)).await? {
    ///         println!("{:?}", record.fields());
    ///     }
    ///     session.close().await?;
    ///     Ok(())
    /// }
    /// ```
    pub fn open(device_path: &str, baudrate: u32, options: SessionOptions) -> Result<Self> {
        Self::open_with_delivery(device_path, baudrate, options, Delivery::Pull)
    }

    /// Open a device in push mode; `handler` receives every record
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Serial`] if the device cannot be opened.
    pub fn open_with_handler<H: RecordHandler>(
        device_path: &str,
        baudrate: u32,
        options: SessionOptions,
        handler: H,
    ) -> Result<Self> {
        Self::open_with_delivery(device_path, baudrate, options, Delivery::Push(Box::new(handler)))
    }

    fn open_with_delivery(
        device_path: &str,
        baudrate: u32,
        options: SessionOptions,
        delivery: Delivery,
    ) -> Result<Self> {
        debug!(device = device_path, baudrate, "Opening serial session");
        let port = super::open_port(device_path, baudrate)?;
        Ok(Self::attach(device_path, Box::new(port), options, delivery))
    }

    /// Run a session over an already open reader.
    ///
    /// Must be called within a tokio runtime.
    pub fn attach(
        device_path: impl Into<String>,
        port: Box<dyn SerialPortIO>,
        options: SessionOptions,
        delivery: Delivery,
    ) -> Self {
        let shared = Arc::new(Shared {
            device_path: device_path.into(),
            state: Mutex::new(SessionState::Opening),
            counters: Counters::default(),
        });

        let (queue, sink) = match delivery {
            Delivery::Pull => {
                let queue = Arc::new(BoundedQueue::new(options.queue_capacity));
                (Some(Arc::clone(&queue)), RecordSink::Queue(queue))
            }
            Delivery::Push(handler) => (None, RecordSink::Handler(handler)),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reader = Reader {
            shared: Arc::clone(&shared),
            port,
            framer: LineFramer::new(options.max_line_bytes),
            sink,
            poll_interval: options.poll_interval,
            buffer: vec![0u8; options.read_buffer_bytes.max(1)],
            next_sequence: 0,
        };

        shared.set_state(SessionState::Open);
        let task = tokio::spawn(reader.run(shutdown_rx));
        info!(device = %shared.device_path, "Serial session open");

        Self {
            shared,
            queue,
            shutdown,
            task: Some(task),
        }
    }

    /// Wait up to `timeout` for the next record (pull mode).
    ///
    /// Returns `Ok(None)` when the timeout expires first.
    ///
    /// # Errors
    ///
    /// - [`MonitorError::Session`] if the session was opened with a handler
    /// - [`MonitorError::Device`] after a device failure, once records read
    ///   before the failure have been returned
    /// - [`MonitorError::SessionClosed`] after [`close`](Self::close)
    pub async fn next_record(&self, timeout: Duration) -> Result<Option<Record>> {
        let queue = self.queue.as_ref().ok_or_else(|| {
            MonitorError::Session(format!(
                "{} delivers records to a handler; next_record is unavailable",
                self.shared.device_path
            ))
        })?;

        if self.state() == SessionState::Closed {
            return Err(MonitorError::SessionClosed(self.shared.device_path.clone()));
        }

        match queue.pop(timeout).await {
            Pop::Item(record) => Ok(Some(record)),
            Pop::TimedOut => Ok(None),
            Pop::Failed(message) => Err(MonitorError::Device {
                port: self.shared.device_path.clone(),
                message,
            }),
            Pop::Closed => Err(MonitorError::SessionClosed(self.shared.device_path.clone())),
        }
    }

    /// Stop the reader and release the device.
    ///
    /// Safe to call from any state and more than once. A handler call in
    /// progress finishes before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Session`] if the reader task panicked.
    pub async fn close(&mut self) -> Result<()> {
        self.shutdown.send_replace(true);
        if let Some(queue) = &self.queue {
            queue.close();
        }

        let joined = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };

        if self.shared.set_state(SessionState::Closed) != SessionState::Closed {
            info!(device = %self.shared.device_path, "Serial session closed");
        }

        joined.map_err(|e| {
            MonitorError::Session(format!(
                "reader task for {} failed: {}",
                self.shared.device_path, e
            ))
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn device_path(&self) -> &str {
        &self.shared.device_path
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        let counters = &self.shared.counters;
        SessionStats {
            lines_received: counters.lines_received.load(Ordering::Relaxed),
            records_parsed: counters.records_parsed.load(Ordering::Relaxed),
            lines_discarded: counters.lines_discarded.load(Ordering::Relaxed),
            framing_errors: counters.framing_errors.load(Ordering::Relaxed),
            records_evicted: counters.records_evicted.load(Ordering::Relaxed),
            last_line_at: *counters
                .last_line_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl Drop for PortSession {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(queue) = &self.queue {
            queue.close();
        }
    }
}

struct Reader {
    shared: Arc<Shared>,
    port: Box<dyn SerialPortIO>,
    framer: LineFramer,
    sink: RecordSink,
    poll_interval: Duration,
    buffer: Vec<u8>,
    next_sequence: u64,
}

impl Reader {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        debug!(device = %self.shared.device_path, "Reader task started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let poll = tokio::time::timeout(self.poll_interval, self.port.read(&mut self.buffer));
            let read = tokio::select! {
                _ = shutdown.changed() => break,
                read = poll => read,
            };

            match read {
                // Poll interval elapsed with no data
                Err(_) => continue,
                Ok(Ok(0)) => {
                    self.fail("device reported end of stream".to_string());
                    break;
                }
                Ok(Ok(len)) => {
                    if let Err(message) = self.handle_chunk(len) {
                        self.fail(message);
                        break;
                    }
                }
                Ok(Err(e)) => {
                    self.fail(e.to_string());
                    break;
                }
            }
        }

        debug!(device = %self.shared.device_path, "Reader task stopped");
    }

    fn handle_chunk(&mut self, len: usize) -> std::result::Result<(), String> {
        trace!(device = %self.shared.device_path, len, "Read chunk");
        let overflows_before = self.framer.overflow_count();
        let lines = self.framer.feed(&self.buffer[..len]);

        let overflows = self.framer.overflow_count() - overflows_before;
        if overflows > 0 {
            self.shared
                .counters
                .framing_errors
                .fetch_add(overflows, Ordering::Relaxed);
        }

        for line in lines {
            self.handle_line(&line)?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> std::result::Result<(), String> {
        let counters = &self.shared.counters;
        let received_at = Local::now();
        counters.lines_received.fetch_add(1, Ordering::Relaxed);
        *counters
            .last_line_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(received_at);

        match protocol::parse(line, Instant::now(), received_at, self.next_sequence) {
            Ok(record) => {
                self.next_sequence += 1;
                counters.records_parsed.fetch_add(1, Ordering::Relaxed);
                self.deliver(record)
            }
            Err(e) => {
                counters.lines_discarded.fetch_add(1, Ordering::Relaxed);
                debug!(device = %self.shared.device_path, error = %e, "Discarding line");
                Ok(())
            }
        }
    }

    fn deliver(&mut self, record: Record) -> std::result::Result<(), String> {
        match &mut self.sink {
            RecordSink::Queue(queue) => {
                if queue.push(record) {
                    self.shared
                        .counters
                        .records_evicted
                        .fetch_add(1, Ordering::Relaxed);
                    trace!(device = %self.shared.device_path, "Queue full, dropped oldest record");
                }
                Ok(())
            }
            RecordSink::Handler(handler) => {
                panic::catch_unwind(AssertUnwindSafe(|| handler.on_record(record)))
                    .map_err(|_| "record handler panicked".to_string())
            }
        }
    }

    fn fail(&mut self, message: String) {
        error!(device = %self.shared.device_path, error = %message, "Serial device failed");
        self.shared.set_state(SessionState::Error);

        match &mut self.sink {
            RecordSink::Queue(queue) => queue.fail(message),
            RecordSink::Handler(handler) => handler.on_error(&MonitorError::Device {
                port: self.shared.device_path.clone(),
                message,
            }),
        }
    }
}
