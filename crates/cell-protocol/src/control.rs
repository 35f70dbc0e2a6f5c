//! Multiplexer Control Channel Messages
//!
//! UIH frames on DLCI 0 carry one or more control messages used to manage
//! the multiplexer session itself.
//!
//! # Message Format
//! ```text
//! [type] [length...] [values...]
//! ```
//!
//! - `type`: message code | C/R << 1 | EA
//! - `length`: EA-extended length of the value field
//!
//! # Common Messages
//! - `MSC` - Modem status (per-DLC flow control and V.24 signals)
//! - `CLD` - Multiplexer close down
//! - `Test` - Echo test
//! - `PN` - DLC parameter negotiation
//! - `NSC` - Non-supported command response

use crate::error::ParseError;
use crate::frame::{CR, EA};

/// Control message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ControlType {
    /// DLC parameter negotiation
    ParameterNegotiation,
    /// Power saving control
    PowerSaving,
    /// Multiplexer close down
    CloseDown,
    /// Echo test
    Test,
    /// Flow control on (aggregate)
    FlowControlOn,
    /// Flow control off (aggregate)
    FlowControlOff,
    /// Modem status command
    ModemStatus,
    /// Non-supported command response
    NotSupported,
    /// Remote port negotiation
    RemotePortNegotiation,
    /// Remote line status
    RemoteLineStatus,
    /// Service negotiation
    ServiceNegotiation,
    /// Any other type code (kept for the NSC reply)
    Unknown(u8),
}

impl ControlType {
    /// Type code without C/R and EA bits
    pub fn code(&self) -> u8 {
        match self {
            ControlType::ParameterNegotiation => 0x80,
            ControlType::PowerSaving => 0x40,
            ControlType::CloseDown => 0xC0,
            ControlType::Test => 0x20,
            ControlType::FlowControlOn => 0xA0,
            ControlType::FlowControlOff => 0x60,
            ControlType::ModemStatus => 0xE0,
            ControlType::NotSupported => 0x10,
            ControlType::RemotePortNegotiation => 0x90,
            ControlType::RemoteLineStatus => 0x50,
            ControlType::ServiceNegotiation => 0xD0,
            ControlType::Unknown(code) => *code & !(CR | EA),
        }
    }

    /// Decode a type code (C/R and EA bits ignored)
    pub fn from_code(byte: u8) -> Self {
        match byte & !(CR | EA) {
            0x80 => ControlType::ParameterNegotiation,
            0x40 => ControlType::PowerSaving,
            0xC0 => ControlType::CloseDown,
            0x20 => ControlType::Test,
            0xA0 => ControlType::FlowControlOn,
            0x60 => ControlType::FlowControlOff,
            0xE0 => ControlType::ModemStatus,
            0x10 => ControlType::NotSupported,
            0x90 => ControlType::RemotePortNegotiation,
            0x50 => ControlType::RemoteLineStatus,
            0xD0 => ControlType::ServiceNegotiation,
            other => ControlType::Unknown(other),
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ControlType::ParameterNegotiation => "PN",
            ControlType::PowerSaving => "PSC",
            ControlType::CloseDown => "CLD",
            ControlType::Test => "Test",
            ControlType::FlowControlOn => "FCon",
            ControlType::FlowControlOff => "FCoff",
            ControlType::ModemStatus => "MSC",
            ControlType::NotSupported => "NSC",
            ControlType::RemotePortNegotiation => "RPN",
            ControlType::RemoteLineStatus => "RLS",
            ControlType::ServiceNegotiation => "SNC",
            ControlType::Unknown(_) => "unknown",
        }
    }
}

/// One control channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Message type
    pub kind: ControlType,
    /// Command (true) or response (false)
    pub command: bool,
    /// Value octets
    pub values: Vec<u8>,
}

impl ControlMessage {
    /// Create a command message
    pub fn command(kind: ControlType, values: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            command: true,
            values: values.into(),
        }
    }

    /// Multiplexer close-down command
    pub fn close_down() -> Self {
        Self::command(ControlType::CloseDown, Vec::new())
    }

    /// Modem status command for a DLC
    pub fn modem_status(status: ModemStatus) -> Self {
        Self::command(ControlType::ModemStatus, status.to_values())
    }

    /// The response acknowledging this command (same type and values)
    pub fn response(&self) -> Self {
        Self {
            kind: self.kind,
            command: false,
            values: self.values.clone(),
        }
    }

    /// NSC response naming an unsupported command type
    pub fn not_supported(kind: ControlType, command: bool) -> Self {
        let echoed = kind.code() | if command { CR } else { 0 } | EA;
        Self {
            kind: ControlType::NotSupported,
            command: false,
            values: vec![echoed],
        }
    }

    /// Encode to the UIH information field
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.values.len());
        out.push(self.kind.code() | if self.command { CR } else { 0 } | EA);
        let len = self.values.len();
        if len <= 0x7F {
            out.push(((len as u8) << 1) | EA);
        } else {
            // Lengths above 16383 cannot occur in basic-mode frames
            out.push(((len & 0x7F) as u8) << 1);
            out.push((((len >> 7) & 0x7F) as u8) << 1 | EA);
        }
        out.extend_from_slice(&self.values);
        out
    }

    /// Decode every message packed in a DLCI 0 information field
    pub fn decode_all(mut data: &[u8]) -> Result<Vec<ControlMessage>, ParseError> {
        let mut messages = Vec::new();
        while !data.is_empty() {
            let (message, used) = Self::decode_one(data)?;
            messages.push(message);
            data = &data[used..];
        }
        Ok(messages)
    }

    fn decode_one(data: &[u8]) -> Result<(ControlMessage, usize), ParseError> {
        let type_byte = *data
            .first()
            .ok_or_else(|| ParseError::InvalidControl("empty message".into()))?;
        if type_byte & EA == 0 {
            return Err(ParseError::InvalidControl(format!(
                "multi-octet type 0x{:02X}",
                type_byte
            )));
        }

        let mut pos = 1;
        let mut length = 0usize;
        let mut shift = 0;
        loop {
            let byte = *data.get(pos).ok_or(ParseError::Incomplete { needed: 1 })?;
            pos += 1;
            length |= ((byte >> 1) as usize) << shift;
            if byte & EA != 0 {
                break;
            }
            shift += 7;
            if shift > 14 {
                return Err(ParseError::InvalidControl("length field too long".into()));
            }
        }

        let end = pos + length;
        if data.len() < end {
            return Err(ParseError::Incomplete {
                needed: end - data.len(),
            });
        }

        Ok((
            ControlMessage {
                kind: ControlType::from_code(type_byte),
                command: type_byte & CR != 0,
                values: data[pos..end].to_vec(),
            },
            end,
        ))
    }
}

/// V.24 signal bits carried by the modem status command
pub mod signals {
    /// Flow control: the sender must stop
    pub const FC: u8 = 0x02;
    /// Ready to communicate
    pub const RTC: u8 = 0x04;
    /// Ready to receive
    pub const RTR: u8 = 0x08;
    /// Incoming call indicator
    pub const IC: u8 = 0x40;
    /// Data valid
    pub const DV: u8 = 0x80;
}

/// Decoded MSC value field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemStatus {
    /// DLC the status refers to
    pub dlci: u8,
    /// Signal octet (see [`signals`])
    pub signals: u8,
}

impl ModemStatus {
    /// Status announcing a DLC ready in both directions
    pub fn ready(dlci: u8) -> Self {
        Self {
            dlci,
            signals: signals::RTC | signals::RTR,
        }
    }

    /// Parse the MSC value field
    pub fn from_values(values: &[u8]) -> Result<Self, ParseError> {
        match values {
            [address, signals, ..] => Ok(Self {
                dlci: address >> 2,
                signals: *signals,
            }),
            _ => Err(ParseError::InvalidControl(format!(
                "MSC needs 2 value octets, got {}",
                values.len()
            ))),
        }
    }

    /// Encode the MSC value field
    pub fn to_values(&self) -> Vec<u8> {
        vec![(self.dlci << 2) | CR | EA, self.signals | EA]
    }

    /// Whether the peer allows this side to transmit on the DLC
    pub fn sending_allowed(&self) -> bool {
        self.signals & signals::RTC != 0 && self.signals & signals::FC == 0
    }

    /// Human-readable list of asserted signals
    pub fn describe(&self) -> String {
        [
            (signals::DV, "DV"),
            (signals::IC, "IC"),
            (signals::RTR, "RTR"),
            (signals::RTC, "RTC"),
            (signals::FC, "FC"),
        ]
        .iter()
        .filter(|(bit, _)| self.signals & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
    }
}

/// Decoded PN value field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlcParameters {
    /// DLC being negotiated
    pub dlci: u8,
    /// Priority (0-63)
    pub priority: u8,
    /// Acknowledgement timer in units of 10 ms
    pub ack_timer: u8,
    /// Maximum frame size
    pub max_frame_size: u16,
    /// Maximum number of retransmissions
    pub max_retransmissions: u8,
    /// Error recovery window size
    pub window: u8,
}

impl DlcParameters {
    /// Parse the 8-octet PN value field
    pub fn from_values(values: &[u8]) -> Result<Self, ParseError> {
        match values {
            [dlci, _convergence, priority, ack_timer, n1_lo, n1_hi, n2, window, ..] => Ok(Self {
                dlci: dlci & 0x3F,
                priority: priority & 0x3F,
                ack_timer: *ack_timer,
                max_frame_size: u16::from_le_bytes([*n1_lo, *n1_hi]),
                max_retransmissions: *n2,
                window: window & 0x07,
            }),
            _ => Err(ParseError::InvalidControl(format!(
                "PN needs 8 value octets, got {}",
                values.len()
            ))),
        }
    }

    /// Encode the PN value field (UIH frames, convergence layer 1)
    pub fn to_values(&self) -> Vec<u8> {
        let [n1_lo, n1_hi] = self.max_frame_size.to_le_bytes();
        vec![
            self.dlci & 0x3F,
            0x00,
            self.priority & 0x3F,
            self.ack_timer,
            n1_lo,
            n1_hi,
            self.max_retransmissions,
            self.window & 0x07,
        ]
    }
}
