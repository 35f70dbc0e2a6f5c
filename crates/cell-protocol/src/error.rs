//! Error types for frame parsing and AT protocol encoding

use thiserror::Error;

/// Errors that can occur while parsing multiplexer data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Invalid frame structure
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Unknown control byte
    #[error("unknown frame type: 0x{0:02X}")]
    UnknownFrameType(u8),

    /// Declared length does not match the frame boundaries
    #[error("length mismatch: declared {declared} bytes")]
    LengthMismatch { declared: usize },

    /// Payload larger than the negotiated maximum
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Frame check sequence mismatch
    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// Malformed control channel message
    #[error("invalid control message: {0}")]
    InvalidControl(String),
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// DLCI outside the addressable range
    #[error("invalid DLCI: {0}")]
    InvalidDlci(u8),

    /// Payload cannot be framed
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}
