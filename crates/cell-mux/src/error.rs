//! Error types for the multiplexer

use cell_protocol::ResultCode;
use thiserror::Error;

/// Errors that can occur in the multiplexer
///
/// Command outcomes (OK, ERROR, TIMEOUT, ...) are not errors; they are
/// reported through [`cell_protocol::AtResult`]. These variants cover API
/// misuse and link failures.
#[derive(Debug, Error)]
pub enum MuxError {
    /// Another task already waits on this channel
    #[error("channel {0} busy: a command is already outstanding")]
    ChannelBusy(u8),

    /// A command is already outstanding on the un-multiplexed port
    #[error("serial port busy: a command is already outstanding")]
    PortBusy,

    /// No channel registered for the DLCI
    #[error("channel not found: DLCI {0}")]
    ChannelNotFound(u8),

    /// Channel exists but is not established
    #[error("channel {0} is not open")]
    ChannelNotOpen(u8),

    /// SABM retries exhausted without UA
    #[error("channel {0} establishment failed")]
    EstablishmentFailed(u8),

    /// Peer withheld permission to send for too long
    #[error("channel {0} flow-controlled")]
    FlowControlled(u8),

    /// A required command was answered with a failure
    #[error("command {command} failed: {code}")]
    CommandFailed {
        /// Command text without terminators
        command: String,
        /// Result code returned
        code: ResultCode,
    },

    /// Reader or writer task has stopped
    #[error("link closed")]
    LinkClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] cell_protocol::ProtocolError),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}
