//! Cellular Modem Simulation Library
//!
//! This crate provides a simulation layer for testing the multiplexer and
//! AT command engine without modem hardware. It includes:
//!
//! - **VirtualModem**: answers AT commands, switches to GSM 07.10 on
//!   `AT+CMUX=`, answers SABM/DISC/MSC and emits URCs
//! - **run_virtual_modem_task**: drives a VirtualModem over any async stream
//!
//! # Example
//!
//! ```rust
//! use cell_sim::VirtualModem;
//!
//! let mut modem = VirtualModem::new("EC25");
//! modem.process_bytes(b"AT+CSQ\r");
//!
//! while let Some(bytes) = modem.take_output() {
//!     println!("Modem output: {:?}", String::from_utf8_lossy(&bytes));
//! }
//! ```

pub mod modem;
pub mod modem_task;

pub use modem::{ModemMode, VirtualModem, VirtualModemConfig, VirtualModemEvent};
pub use modem_task::{run_virtual_modem_task, VirtualModemCommand};

use thiserror::Error;

/// Errors raised while configuring a simulation
#[derive(Debug, Error)]
pub enum SimError {
    /// Scripted reply table is malformed
    #[error("invalid reply script: {0}")]
    InvalidScript(String),
}

/// Parse a reply script of `COMMAND => LINE | LINE` entries, one per line
///
/// Blank lines and lines starting with `#` are ignored.
pub fn parse_reply_script(script: &str) -> Result<Vec<(String, Vec<String>)>, SimError> {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let (command, replies) = line
                .split_once("=>")
                .ok_or_else(|| SimError::InvalidScript(format!("missing '=>' in {:?}", line)))?;
            let command = command.trim();
            if command.is_empty() {
                return Err(SimError::InvalidScript(format!("empty command in {:?}", line)));
            }
            let replies = replies
                .split('|')
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect();
            Ok((command.to_string(), replies))
        })
        .collect()
}
