//! # Serial Communication Module
//!
//! Handles reading telemetry from serial devices.
//!
//! This module handles:
//! - Opening serial ports (8N1, no flow control)
//! - Per-port reader sessions with bounded buffering
//! - Enumerating available ports for `--list`

pub mod port_trait;
pub mod queue;
pub mod session;

pub use port_trait::{SerialPortIO, TokioSerialPort};
pub use session::{PortSession, SessionOptions, SessionState, SessionStats};

use crate::error::{MonitorError, Result};
use serde::Serialize;
use tokio_serial::{SerialPortBuilderExt, SerialPortType};
use tracing::debug;

/// Default line speed
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Descriptions that carry no information
const MEANINGLESS_DESCRIPTIONS: &[&str] = &["", "n/a", "unknown"];

/// Open a serial port for reading
///
/// # Arguments
///
/// * `path` - Device path (e.g., "/dev/ttyUSB0" or "COM3")
/// * `baudrate` - Line speed
///
/// # Returns
///
/// * `Result<TokioSerialPort>` - Opened serial port
///
/// # Errors
///
/// Returns [`MonitorError::Serial`] if the device is missing, busy or
/// cannot be configured.
pub fn open_port(path: &str, baudrate: u32) -> Result<TokioSerialPort> {
    let port = tokio_serial::new(path, baudrate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| MonitorError::Serial(format!("Failed to open {}: {}", path, e)))?;

    debug!("Opened serial port {} at {} baud", path, baudrate);
    Ok(TokioSerialPort::new(port))
}

/// A serial port found on the system
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub hardware_id: String,
}

impl PortInfo {
    fn from_system(info: &tokio_serial::SerialPortInfo) -> Self {
        let (description, hardware_id) = match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = usb
                    .product
                    .clone()
                    .or_else(|| usb.manufacturer.clone())
                    .unwrap_or_else(|| "n/a".to_string());
                let serial = usb
                    .serial_number
                    .as_ref()
                    .map(|s| format!(" SER={}", s))
                    .unwrap_or_default();
                (
                    description,
                    format!("USB VID:PID={:04X}:{:04X}{}", usb.vid, usb.pid, serial),
                )
            }
            SerialPortType::PciPort => ("PCI device".to_string(), "PCI".to_string()),
            SerialPortType::BluetoothPort => {
                ("Bluetooth device".to_string(), "BLUETOOTH".to_string())
            }
            SerialPortType::Unknown => ("n/a".to_string(), "n/a".to_string()),
        };

        Self {
            name: info.port_name.clone(),
            description,
            hardware_id,
        }
    }
}

/// List serial ports worth showing to a user
///
/// # Errors
///
/// Returns [`MonitorError::Serial`] if the system port list cannot be read.
pub fn list_ports() -> Result<Vec<PortInfo>> {
    let ports = tokio_serial::available_ports()
        .map_err(|e| MonitorError::Serial(format!("Failed to list ports: {}", e)))?;
    debug!("Found {} serial ports", ports.len());

    Ok(filter_ports(ports.iter().map(PortInfo::from_system).collect()))
}

/// Drop ports without a meaningful description, keeping USB devices.
///
/// If nothing survives, every port is returned with "Unknown" standing in
/// for a missing description, so the list is never empty while ports exist.
pub fn filter_ports(ports: Vec<PortInfo>) -> Vec<PortInfo> {
    let is_meaningless = |description: &str| {
        MEANINGLESS_DESCRIPTIONS.contains(&description.trim().to_lowercase().as_str())
    };

    let mut kept: Vec<PortInfo> = ports
        .iter()
        .filter_map(|port| {
            if !is_meaningless(&port.description) {
                Some(port.clone())
            } else if port.hardware_id.contains("USB") {
                Some(PortInfo {
                    description: format!("USB Device ({})", port.name),
                    ..port.clone()
                })
            } else {
                None
            }
        })
        .collect();

    if kept.is_empty() {
        kept = ports
            .into_iter()
            .map(|port| PortInfo {
                description: if is_meaningless(&port.description) {
                    "Unknown".to_string()
                } else {
                    port.description.clone()
                },
                ..port
            })
            .collect();
    }

    kept.sort_by(|a, b| a.name.cmp(&b.name));
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, description: &str, hardware_id: &str) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            description: description.to_string(),
            hardware_id: hardware_id.to_string(),
        }
    }

    #[test]
    fn test_constants() {
        assert_eq!(DEFAULT_BAUD_RATE, 115_200);
    }

    #[test]
    fn test_open_port_with_invalid_path_returns_error() {
        // open_native_async registers with the reactor, so build a runtime
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let _guard = runtime.enter();

        let result = open_port("/dev/nonexistent_serial_device_12345", DEFAULT_BAUD_RATE);
        match result {
            Err(MonitorError::Serial(msg)) => {
                assert!(msg.contains("/dev/nonexistent_serial_device_12345"));
                assert!(msg.contains("Failed to open"));
            }
            other => panic!("Expected Serial error, got: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_filter_drops_meaningless_descriptions() {
        let ports = vec![
            port("/dev/ttyS0", "n/a", "n/a"),
            port("/dev/ttyUSB0", "CP2102 USB to UART", "USB VID:PID=10C4:EA60"),
            port("/dev/ttyS1", "Unknown", "PNP0501"),
        ];

        let kept = filter_ports(ports);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_filter_keeps_usb_without_description() {
        let kept = filter_ports(vec![
            port("/dev/ttyS0", "n/a", "n/a"),
            port("/dev/ttyACM0", "n/a", "USB VID:PID=2341:0043"),
        ]);

        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].description, "USB Device (/dev/ttyACM0)");
    }

    #[test]
    fn test_filter_falls_back_to_all_ports() {
        let kept = filter_ports(vec![
            port("/dev/ttyS1", "", "n/a"),
            port("/dev/ttyS0", "n/a", "n/a"),
        ]);

        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].name, "/dev/ttyS0");
        assert!(kept.iter().all(|p| p.description == "Unknown"));
    }

    #[test]
    fn test_filter_empty() {
        assert!(filter_ports(Vec::new()).is_empty());
    }

    #[test]
    #[ignore] // Run with: cargo test -- --ignored
    fn test_list_ports_with_real_hardware() {
        match list_ports() {
            Ok(ports) => {
                for port in ports {
                    println!("{} - {} [{}]", port.name, port.description, port.hardware_id);
                }
            }
            Err(e) => println!("Port enumeration unavailable: {}", e),
        }
    }
}
