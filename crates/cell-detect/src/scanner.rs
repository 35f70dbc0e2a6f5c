//! Serial port scanner
//!
//! This module provides serial port enumeration and flags ports that
//! belong to known cellular modules.

use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};
use tracing::info;

use crate::error::DetectError;
use crate::usb_ids::{classify_port, PortClassification};

/// Information about a serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., /dev/ttyUSB2, COM7)
    pub port: String,
    /// USB Vendor ID (if USB)
    pub vid: Option<u16>,
    /// USB Product ID (if USB)
    pub pid: Option<u16>,
    /// USB serial number (if available)
    pub serial_number: Option<String>,
    /// USB manufacturer string
    pub manufacturer: Option<String>,
    /// USB product string
    pub product: Option<String>,
    /// How likely the port is to be a modem
    pub classification: PortClassification,
    /// Display hint from the USB ID tables (e.g. "Quectel EC25/EG25")
    pub hint: Option<&'static str>,
}

impl SerialPortInfo {
    /// Create from serialport crate's port info
    fn from_serialport(name: String, port_type: &SerialPortType) -> Self {
        let (vid, pid, serial_number, manufacturer, product) = match port_type {
            SerialPortType::UsbPort(usb) => (
                Some(usb.vid),
                Some(usb.pid),
                usb.serial_number.clone(),
                usb.manufacturer.clone(),
                usb.product.clone(),
            ),
            _ => (None, None, None, None, None),
        };
        let (classification, hint) = classify_port(vid, pid);
        Self {
            port: name,
            vid,
            pid,
            serial_number,
            manufacturer,
            product,
            classification,
            hint,
        }
    }

    /// Whether the port belongs to a known cellular module
    pub fn is_modem(&self) -> bool {
        self.classification == PortClassification::KnownModem
    }

    /// Short description for listings
    pub fn description(&self) -> String {
        match (self.hint, self.product.as_deref()) {
            (Some(hint), Some(product)) if hint != product => format!("{} ({})", product, hint),
            (Some(hint), _) => hint.to_string(),
            (None, Some(product)) => product.to_string(),
            (None, None) => "Unknown".to_string(),
        }
    }
}

/// Serial port scanner configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Skip ports matching these patterns
    pub skip_patterns: Vec<String>,
    /// List only ports of known cellular modules
    pub modems_only: bool,
}

/// Serial port scanner
pub struct PortScanner {
    config: ScannerConfig,
}

impl PortScanner {
    /// Create a new scanner with default configuration
    pub fn new() -> Self {
        Self {
            config: ScannerConfig {
                skip_patterns: vec![
                    // Bluetooth ports on macOS
                    "Bluetooth".to_string(),
                    // Debug/logging ports
                    "debug".to_string(),
                ],
                modems_only: false,
            },
        }
    }

    /// Create a scanner with custom configuration
    pub fn with_config(config: ScannerConfig) -> Self {
        Self { config }
    }

    /// Enumerate all available serial ports, modem ports first
    pub fn enumerate_ports(&self) -> Result<Vec<SerialPortInfo>, DetectError> {
        info!("Enumerating serial ports...");
        let ports = available_ports().map_err(|e| DetectError::EnumerationFailed(e.to_string()))?;

        let mut result: Vec<_> = ports
            .into_iter()
            .map(|p| SerialPortInfo::from_serialport(p.port_name, &p.port_type))
            .filter(|p| !self.should_skip_port(p))
            .collect();
        result.sort_by(|a, b| a.classification.cmp(&b.classification).then(a.port.cmp(&b.port)));

        if result.is_empty() {
            info!("No serial ports found");
        } else {
            info!("Found {} serial port(s)", result.len());
            for port in &result {
                info!("  {} - {}", port.port, port.description());
            }
        }

        Ok(result)
    }

    /// Check if a port should be skipped
    fn should_skip_port(&self, port: &SerialPortInfo) -> bool {
        if self.config.modems_only && !port.is_modem() {
            return true;
        }
        self.config
            .skip_patterns
            .iter()
            .any(|pattern| port.port.contains(pattern.as_str()))
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}
