//! Cellular Modem Protocol Library
//!
//! This crate provides parsing and encoding for the two protocols spoken
//! with a cellular baseband modem over one serial link:
//!
//! - **GSM 07.10 multiplexing**: flag-delimited frames with an 8-bit
//!   frame check sequence, carrying several logical channels (DLCIs)
//! - **AT commands**: ASCII command lines, terminal result codes and
//!   unsolicited result codes (URCs)
//!
//! # Architecture
//!
//! - [`frame`]: streaming frame codec with resynchronization
//! - [`control`]: control channel (DLCI 0) messages such as MSC and CLD
//! - [`at`]: result codes, terminal line classification, response accumulation
//! - [`urc`]: URC tokenization and classification
//! - [`registry`]: symbolic command table with default timeouts
//!
//! # Example
//!
//! ```rust
//! use cell_protocol::{FrameCodec, FrameType, ProtocolCodec};
//!
//! let mut codec = FrameCodec::new();
//! let bytes = codec.serialize(2, FrameType::Uih, b"AT+CSQ\r").unwrap();
//! codec.push_bytes(&bytes);
//!
//! let frame = codec.next_item().unwrap();
//! assert_eq!(frame.dlci, 2);
//! assert_eq!(frame.payload, b"AT+CSQ\r");
//! ```

pub mod at;
pub mod control;
pub mod error;
pub mod frame;
pub mod registry;
pub mod urc;

pub use at::{AtResult, LineCodec, ResultCode};
pub use control::{ControlMessage, ControlType, ModemStatus};
pub use error::{ParseError, ProtocolError};
pub use frame::{Decoded, FcsCoverage, Frame, FrameCodec, FrameConfig, FrameType};
pub use registry::{AtCommand, Cmd, CommandRegistry};
pub use urc::{Urc, UrcKind};

/// Trait for codecs that parse incoming data streams
pub trait ProtocolCodec {
    /// The item type produced by this codec
    type Item;

    /// Push raw bytes into the codec's buffer
    fn push_bytes(&mut self, data: &[u8]);

    /// Try to extract the next complete item from the buffer
    fn next_item(&mut self) -> Option<Self::Item>;

    /// Try to extract the next complete item along with its raw bytes
    ///
    /// This is useful for traffic monitoring where we want to show the exact
    /// bytes that were parsed for each item.
    fn next_item_with_bytes(&mut self) -> Option<(Self::Item, Vec<u8>)>;

    /// Clear the internal buffer
    fn clear(&mut self);
}
