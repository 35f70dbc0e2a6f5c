//! Cellular Modem Detection Library
//!
//! This crate enumerates serial ports, classifies them by USB identity and
//! probes them for a modem that answers `AT`.
//!
//! # Example
//!
//! ```rust,no_run
//! use cell_detect::PortScanner;
//!
//! let scanner = PortScanner::new();
//! let ports = scanner.enumerate_ports().unwrap();
//!
//! for port in ports {
//!     println!("{} ({})", port.port, port.description());
//! }
//! ```

pub mod error;
pub mod probe;
pub mod scanner;
pub mod usb_ids;

pub use error::DetectError;
pub use probe::{probe_port, ModemProber, ProbeConfig, ProbeResult, DEFAULT_BAUDS};
pub use scanner::{PortScanner, ScannerConfig, SerialPortInfo};
pub use usb_ids::{classify_port, PortClassification};
