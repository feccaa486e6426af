//! # Multi-Port Monitor
//!
//! Runs one session per configured port and publishes observations to a
//! single display sink.
//!
//! This module handles:
//! - Opening every port, tolerating partial failures
//! - Tracking the latest record per port
//! - Forwarding records over per-port bounded queues, and status changes
//!   over a lossless control channel, to the dispatcher
//! - Orderly shutdown of sessions, dispatcher and sink

pub mod dispatch;

pub use dispatch::{DisplayOptions, Dispatcher, PortEvent, RecordQueues};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{Config, FieldConfig};
use crate::display::{DisplaySink, NullSink};
use crate::error::{MonitorError, Result};
use crate::protocol::Record;
use crate::serial::session::{
    Delivery, PortSession, RecordHandler, SessionOptions, SessionState, SessionStats,
};
use crate::serial::SerialPortIO;

/// Opens a device as a readable port
pub type PortOpener =
    Arc<dyn Fn(&str, u32) -> Result<Box<dyn SerialPortIO>> + Send + Sync>;

/// Result of [`Coordinator::start`]
#[derive(Debug, Default)]
pub struct StartReport {
    /// Names of ports now running
    pub opened: Vec<String>,
    /// Ports that could not be opened, with the reason
    pub failed: Vec<(String, MonitorError)>,
}

#[derive(Debug, Default)]
struct LatestRecords {
    records: RwLock<HashMap<String, Arc<Record>>>,
}

impl LatestRecords {
    fn insert(&self, port: &str, record: Arc<Record>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(port.to_string(), record);
    }

    fn get(&self, port: &str) -> Option<Arc<Record>> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(port)
            .cloned()
    }
}

/// Session handler that feeds the coordinator
struct PortForwarder {
    port: String,
    latest: Arc<LatestRecords>,
    records: Arc<RecordQueues>,
    control: UnboundedSender<PortEvent>,
}

impl RecordHandler for PortForwarder {
    fn on_record(&mut self, record: Record) {
        let record = Arc::new(record);
        self.latest.insert(&self.port, Arc::clone(&record));
        if self.records.push(&self.port, record) {
            trace!(port = %self.port, "Record queue full, dropped oldest record");
        }
    }

    fn on_error(&mut self, error: &MonitorError) {
        let failed = PortEvent::Failed {
            port: self.port.clone(),
            message: error.to_string(),
        };
        if self.control.send(failed).is_err() {
            debug!(port = %self.port, "Dispatcher gone, failure not reported");
        }
    }
}

#[derive(Debug, Clone)]
struct PortEntry {
    name: String,
    device_path: String,
    baudrate: u32,
    fields: Vec<FieldConfig>,
}

/// Coordinates all configured ports.
///
/// # Examples
///
/// ```no_run
/// use telemon::config::{Config, FieldConfig};
/// use telemon::display::FnSink;
/// use telemon::monitor::Coordinator;
/// use telemon::pipeline::Observation;
/// use telemon::serial::SessionOptions;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let mut coordinator = Coordinator::new(SessionOptions::default());
///     let fields = vec![FieldConfig::labelled(0, "Time")];
///     coordinator.add_port("axis", "/dev/ttyUSB0", 115200, fields)?;
///     coordinator.on_update(FnSink::new(|port: &str, position: usize, observation: &Observation| {
///         println!("{} #{}: {}", port, position, observation.final_value);
///     }));
///
///     let report = coordinator.start();
///     println!("opened {:?}", report.opened);
///     tokio::signal::ctrl_c().await?;
///     coordinator.stop().await;
///     Ok(())
/// }
/// ```
pub struct Coordinator {
    ports: Vec<PortEntry>,
    options: SessionOptions,
    display: DisplayOptions,
    opener: PortOpener,
    sink: Option<Box<dyn DisplaySink>>,
    sessions: Vec<(String, PortSession)>,
    latest: Arc<LatestRecords>,
    records: Option<Arc<RecordQueues>>,
    control: Option<UnboundedSender<PortEvent>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("ports", &self.ports.iter().map(|p| &p.name).collect::<Vec<_>>())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Create a coordinator that opens real serial ports
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        Self {
            ports: Vec::new(),
            options,
            display: DisplayOptions::default(),
            opener: Arc::new(|path: &str, baudrate: u32| {
                crate::serial::open_port(path, baudrate)
                    .map(|port| Box::new(port) as Box<dyn SerialPortIO>)
            }),
            sink: None,
            sessions: Vec::new(),
            latest: Arc::new(LatestRecords::default()),
            records: None,
            control: None,
            dispatcher: None,
        }
    }

    /// Build a coordinator with every port from `config`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a port's fields are invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut coordinator =
            Self::new(config.session.options()).with_display_options(config.display.options());

        for (device, port) in &config.ports {
            coordinator.add_port(
                port.display_name(device),
                device.as_str(),
                port.baudrate,
                port.field_configs(device)?,
            )?;
        }

        Ok(coordinator)
    }

    /// Replace how devices are opened (alternative transports, tests)
    #[must_use]
    pub fn with_opener<F>(mut self, opener: F) -> Self
    where
        F: Fn(&str, u32) -> Result<Box<dyn SerialPortIO>> + Send + Sync + 'static,
    {
        self.opener = Arc::new(opener);
        self
    }

    #[must_use]
    pub fn with_display_options(mut self, display: DisplayOptions) -> Self {
        self.display = display;
        self
    }

    /// Register a port.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Session`] if the name is already taken or the
    /// coordinator is running.
    pub fn add_port(
        &mut self,
        name: impl Into<String>,
        device_path: impl Into<String>,
        baudrate: u32,
        fields: Vec<FieldConfig>,
    ) -> Result<()> {
        let name = name.into();
        if self.is_running() {
            return Err(MonitorError::Session(format!(
                "cannot add port '{}' while monitoring",
                name
            )));
        }
        if self.ports.iter().any(|p| p.name == name) {
            return Err(MonitorError::Session(format!("port '{}' is already registered", name)));
        }

        self.ports.push(PortEntry {
            name,
            device_path: device_path.into(),
            baudrate,
            fields,
        });
        Ok(())
    }

    /// Set the display sink; replaces any earlier one
    pub fn on_update<S: DisplaySink + 'static>(&mut self, sink: S) {
        self.sink = Some(Box::new(sink));
    }

    /// Open every port and start dispatching.
    ///
    /// Ports that fail to open are logged, reported to the sink and listed
    /// in the returned report; the rest keep running. Must be called within
    /// a tokio runtime.
    pub fn start(&mut self) -> StartReport {
        let mut report = StartReport::default();
        if self.is_running() {
            warn!("Coordinator already running");
            return report;
        }

        let records = Arc::new(RecordQueues::new(
            self.ports.iter().map(|p| p.name.clone()),
            self.options.queue_capacity,
        ));
        let (control, control_rx) = mpsc::unbounded_channel();
        let fields: HashMap<String, Vec<FieldConfig>> = self
            .ports
            .iter()
            .map(|p| (p.name.clone(), p.fields.clone()))
            .collect();
        let sink = self.sink.take().unwrap_or_else(|| Box::new(NullSink));
        let dispatcher = Dispatcher::new(fields, sink, self.display.clone());

        self.sessions.clear();
        for entry in &self.ports {
            match (self.opener)(&entry.device_path, entry.baudrate) {
                Ok(port) => {
                    // Sent before attach so it precedes the port's first record
                    let _ = control.send(PortEvent::Connected {
                        port: entry.name.clone(),
                        device: entry.device_path.clone(),
                    });
                    let forwarder = PortForwarder {
                        port: entry.name.clone(),
                        latest: Arc::clone(&self.latest),
                        records: Arc::clone(&records),
                        control: control.clone(),
                    };
                    let session = PortSession::attach(
                        entry.device_path.clone(),
                        port,
                        self.options,
                        Delivery::Push(Box::new(forwarder)),
                    );
                    info!(port = %entry.name, device = %entry.device_path, "Monitoring port");
                    self.sessions.push((entry.name.clone(), session));
                    report.opened.push(entry.name.clone());
                }
                Err(e) => {
                    error!(
                        port = %entry.name,
                        device = %entry.device_path,
                        error = %e,
                        "Failed to open port"
                    );
                    let _ = control.send(PortEvent::Failed {
                        port: entry.name.clone(),
                        message: e.to_string(),
                    });
                    report.failed.push((entry.name.clone(), e));
                }
            }
        }

        self.dispatcher = Some(tokio::spawn(dispatcher.run(control_rx, Arc::clone(&records))));
        self.records = Some(records);
        self.control = Some(control);
        report
    }

    /// Close every session, drain pending events and stop the sink.
    ///
    /// Failures while closing are logged; this never returns an error.
    pub async fn stop(&mut self) {
        for (name, session) in &mut self.sessions {
            if let Err(e) = session.close().await {
                warn!(port = %name, error = %e, "Error while closing port");
            }
            if let Some(control) = &self.control {
                let _ = control.send(PortEvent::Closed { port: name.clone() });
            }
        }

        // Handlers hold the other senders and went away with their sessions
        self.control = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            if let Err(e) = dispatcher.await {
                warn!(error = %e, "Dispatcher task failed");
            }
        }
        info!("Monitoring stopped");
    }

    /// Most recent record from `port`, if any arrived
    pub fn latest(&self, port: &str) -> Option<Arc<Record>> {
        self.latest.get(port)
    }

    /// Counters for every port that was opened.
    ///
    /// `records_evicted` counts records dropped from the port's display
    /// queue while the dispatcher fell behind.
    pub fn stats(&self) -> BTreeMap<String, SessionStats> {
        self.sessions
            .iter()
            .map(|(name, session)| {
                let mut stats = session.stats();
                if let Some(records) = &self.records {
                    stats.records_evicted += records.evicted_count(name);
                }
                (name.clone(), stats)
            })
            .collect()
    }

    /// Session state of `port`; `None` if it was never opened
    pub fn session_state(&self, port: &str) -> Option<SessionState> {
        self.sessions
            .iter()
            .find(|(name, _)| name == port)
            .map(|(_, session)| session.state())
    }

    /// Registered port names, in registration order
    pub fn port_names(&self) -> impl Iterator<Item = &str> {
        self.ports.iter().map(|p| p.name.as_str())
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_some()
    }
}
