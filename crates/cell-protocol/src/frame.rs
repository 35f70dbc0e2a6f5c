//! GSM 07.10 Basic Option Framing
//!
//! The multiplexer carries every logical channel over one serial link using
//! flag-delimited frames with an 8-bit frame check sequence.
//!
//! # Frame Format
//! ```text
//! F9 [address] [control] [length...] [data...] [fcs] F9
//! ```
//!
//! - `F9`: Opening and closing flag
//! - `address`: `DLCI << 2 | C/R << 1 | EA`
//! - `control`: Frame type, with the poll/final bit (0x10)
//! - `length`: `len << 1 | EA` for payloads up to 127 bytes, otherwise two
//!   bytes with EA clear in the first
//! - `fcs`: Reversed CRC-8 (polynomial 0x07, initial 0xFF), ones' complement
//!
//! Basic option frames are not byte-stuffed: payload bytes may equal the
//! flag, so the length field is authoritative and the closing flag is only
//! verified, never searched for.

use crate::error::{ParseError, ProtocolError};
use crate::ProtocolCodec;

/// Opening/closing flag byte
pub const FLAG: u8 = 0xF9;
/// Extension bit (address and length fields)
pub const EA: u8 = 0x01;
/// Command/response bit in the address field
pub const CR: u8 = 0x02;
/// Poll/final bit in the control field
pub const PF: u8 = 0x10;

/// Highest DLCI accepted when building frames
///
/// DLCI 62 with C/R clear encodes to an address byte equal to [`FLAG`],
/// so new frames stay below it.
pub const MAX_DLCI: u8 = 61;

/// Largest payload the two-byte length field can express
pub const MAX_PAYLOAD_LEN: usize = 0x7FFF;

/// Flag + address + control + one length byte + fcs + flag
pub const MIN_FRAME_LEN: usize = 6;

/// Precomputed table for the 07.10 reversed CRC-8
static CRC_TABLE: [u8; 256] = build_crc_table();

const fn build_crc_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0xE0
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Compute the frame check sequence over `data`
pub fn fcs(data: &[u8]) -> u8 {
    let crc = data
        .iter()
        .fold(0xFFu8, |crc, &b| CRC_TABLE[(crc ^ b) as usize]);
    0xFF - crc
}

/// Frame types (control field values without the P/F bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameType {
    /// Set Asynchronous Balanced Mode (establish a DLC)
    Sabm = 0x2F,
    /// Unnumbered Acknowledgement
    Ua = 0x63,
    /// Disconnected Mode (refusal)
    Dm = 0x0F,
    /// Disconnect (release a DLC)
    Disc = 0x43,
    /// Unnumbered Information with Header check (ordinary payload)
    Uih = 0xEF,
    /// Unnumbered Information
    Ui = 0x03,
}

impl FrameType {
    /// Decode a control byte, ignoring the P/F bit
    pub fn from_control(control: u8) -> Option<Self> {
        match control & !PF {
            0x2F => Some(Self::Sabm),
            0x63 => Some(Self::Ua),
            0x0F => Some(Self::Dm),
            0x43 => Some(Self::Disc),
            0xEF => Some(Self::Uih),
            0x03 => Some(Self::Ui),
            _ => None,
        }
    }

    /// Returns a short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Sabm => "SABM",
            FrameType::Ua => "UA",
            FrameType::Dm => "DM",
            FrameType::Disc => "DISC",
            FrameType::Uih => "UIH",
            FrameType::Ui => "UI",
        }
    }

    /// Whether the P/F bit is set when this host builds the frame
    fn default_poll_final(&self) -> bool {
        !matches!(self, FrameType::Uih | FrameType::Ui)
    }
}

/// Which bytes the frame check sequence covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FcsCoverage {
    /// Address, control, length and data for every frame type
    #[default]
    Full,
    /// 07.10 rule: header only, data included for UI frames
    Standard,
}

/// Codec configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameConfig {
    /// Largest accepted payload; longer declared lengths are treated as corruption
    pub max_payload: usize,
    /// Checksum coverage
    pub fcs_coverage: FcsCoverage,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD_LEN,
            fcs_coverage: FcsCoverage::Full,
        }
    }
}

/// One multiplexer frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Destination channel
    pub dlci: u8,
    /// Frame type
    pub frame_type: FrameType,
    /// C/R bit of the address field
    pub command: bool,
    /// P/F bit of the control field
    pub poll_final: bool,
    /// Information field
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a host-originated frame
    pub fn new(dlci: u8, frame_type: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            dlci,
            frame_type,
            command: true,
            poll_final: frame_type.default_poll_final(),
            payload: payload.into(),
        }
    }

    /// Create a response frame (C/R clear)
    pub fn response(dlci: u8, frame_type: FrameType, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            command: false,
            ..Self::new(dlci, frame_type, payload)
        }
    }

    /// Payload decoded as text (lossy)
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this frame belongs to the given channel
    pub fn is_for(&self, dlci: u8) -> bool {
        self.dlci == dlci
    }

    fn address(&self) -> u8 {
        (self.dlci << 2) | if self.command { CR } else { 0 } | EA
    }

    fn control(&self) -> u8 {
        self.frame_type as u8 | if self.poll_final { PF } else { 0 }
    }
}

/// Result of attempting to extract one frame from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete, checksum-valid frame
    Frame {
        /// The decoded frame
        frame: Frame,
        /// Bytes taken from the buffer, both flags included
        consumed: usize,
    },
    /// More data is needed; nothing was consumed
    Incomplete,
    /// Bytes that can never form a valid frame; drop them and retry
    Discard {
        /// Bytes to drop (up to, not including, the next flag)
        consumed: usize,
        /// Why the bytes were rejected
        reason: ParseError,
    },
}

impl Decoded {
    /// Whether a frame was produced
    pub fn is_complete(&self) -> bool {
        matches!(self, Decoded::Frame { .. })
    }

    /// Number of bytes the caller should drop from the buffer
    pub fn consumed(&self) -> usize {
        match self {
            Decoded::Frame { consumed, .. } | Decoded::Discard { consumed, .. } => *consumed,
            Decoded::Incomplete => 0,
        }
    }
}

/// Streaming GSM 07.10 frame codec
#[derive(Debug)]
pub struct FrameCodec {
    config: FrameConfig,
    buffer: Vec<u8>,
    discarded_bytes: usize,
    rejected_frames: usize,
}

impl FrameCodec {
    /// Create a codec with default configuration
    pub fn new() -> Self {
        Self::with_config(FrameConfig::default())
    }

    /// Create a codec with custom configuration
    pub fn with_config(config: FrameConfig) -> Self {
        Self {
            config,
            buffer: Vec::with_capacity(256),
            discarded_bytes: 0,
            rejected_frames: 0,
        }
    }

    /// Codec configuration
    pub fn config(&self) -> FrameConfig {
        self.config
    }

    /// Total bytes dropped while resynchronizing
    pub fn discarded_bytes(&self) -> usize {
        self.discarded_bytes
    }

    /// Well-delimited frames rejected for a bad checksum or control byte
    pub fn rejected_frames(&self) -> usize {
        self.rejected_frames
    }

    /// Bytes received but not yet decoded
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Build the wire bytes for a host-originated frame
    pub fn serialize(
        &self,
        dlci: u8,
        frame_type: FrameType,
        payload: &[u8],
    ) -> Result<Vec<u8>, ProtocolError> {
        self.encode(&Frame::new(dlci, frame_type, payload))
    }

    /// Build the wire bytes for a frame
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
        if frame.dlci > MAX_DLCI {
            return Err(ProtocolError::InvalidDlci(frame.dlci));
        }
        let len = frame.payload.len();
        let max = self.config.max_payload.min(MAX_PAYLOAD_LEN);
        if len > max {
            return Err(ProtocolError::PayloadTooLarge { size: len, max });
        }

        let mut out = Vec::with_capacity(MIN_FRAME_LEN + 1 + len);
        out.push(FLAG);
        out.push(frame.address());
        out.push(frame.control());
        if len <= 0x7F {
            out.push(((len as u8) << 1) | EA);
        } else {
            out.push(((len & 0x7F) as u8) << 1);
            out.push((len >> 7) as u8);
        }
        let header_end = out.len();
        out.extend_from_slice(&frame.payload);

        let covered = if self.covers_payload(frame.frame_type) {
            &out[1..]
        } else {
            &out[1..header_end]
        };
        let check = fcs(covered);
        out.push(check);
        out.push(FLAG);
        Ok(out)
    }

    /// Attempt to extract exactly one frame from the front of `buf`
    ///
    /// Never reads out of bounds and never consumes bytes of a frame that
    /// could still complete once more data arrives.
    pub fn parse(&self, buf: &[u8]) -> Decoded {
        let Some(&first) = buf.first() else {
            return Decoded::Incomplete;
        };
        if first != FLAG {
            let consumed = next_flag(buf, 0).unwrap_or(buf.len());
            return Decoded::Discard {
                consumed,
                reason: ParseError::InvalidFrame("data before opening flag".into()),
            };
        }

        let Some(&address) = buf.get(1) else {
            return Decoded::Incomplete;
        };
        if address == FLAG {
            // Back-to-back flags: the first closes nothing
            return Decoded::Discard {
                consumed: 1,
                reason: ParseError::InvalidFrame("empty frame".into()),
            };
        }
        if address & EA == 0 {
            return resync(
                buf,
                ParseError::InvalidFrame("address field without EA bit".into()),
            );
        }

        let (Some(&control), Some(&len0)) = (buf.get(2), buf.get(3)) else {
            return Decoded::Incomplete;
        };
        let (length, header_len) = if len0 & EA != 0 {
            ((len0 >> 1) as usize, 3)
        } else {
            let Some(&len1) = buf.get(4) else {
                return Decoded::Incomplete;
            };
            (((len0 >> 1) as usize) | ((len1 as usize) << 7), 4)
        };

        if length > self.config.max_payload {
            return resync(
                buf,
                ParseError::PayloadTooLarge {
                    size: length,
                    max: self.config.max_payload,
                },
            );
        }

        let data_start = 1 + header_len;
        let fcs_pos = data_start + length;
        let total = fcs_pos + 2;
        if buf.len() < total {
            return Decoded::Incomplete;
        }
        if buf[total - 1] != FLAG {
            return resync(buf, ParseError::LengthMismatch { declared: length });
        }

        let Some(frame_type) = FrameType::from_control(control) else {
            return Decoded::Discard {
                consumed: total - 1,
                reason: ParseError::UnknownFrameType(control),
            };
        };

        let covered = if self.covers_payload(frame_type) {
            &buf[1..fcs_pos]
        } else {
            &buf[1..data_start]
        };
        let expected = fcs(covered);
        let actual = buf[fcs_pos];
        if expected != actual {
            // Keep the closing flag: it may open the next frame
            return Decoded::Discard {
                consumed: total - 1,
                reason: ParseError::ChecksumMismatch { expected, actual },
            };
        }

        Decoded::Frame {
            frame: Frame {
                dlci: address >> 2,
                frame_type,
                command: address & CR != 0,
                poll_final: control & PF != 0,
                payload: buf[data_start..fcs_pos].to_vec(),
            },
            consumed: total,
        }
    }

    fn covers_payload(&self, frame_type: FrameType) -> bool {
        match self.config.fcs_coverage {
            FcsCoverage::Full => true,
            FcsCoverage::Standard => frame_type == FrameType::Ui,
        }
    }

    /// Upper bound for buffered bytes before old data is dropped
    fn buffer_limit(&self) -> usize {
        (self.config.max_payload + MIN_FRAME_LEN + 1) * 4
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCodec for FrameCodec {
    type Item = Frame;

    fn push_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);

        // Prevent unbounded growth on a link that never produces a valid frame
        let limit = self.buffer_limit();
        if self.buffer.len() > limit {
            let excess = self.buffer.len() - limit;
            self.buffer.drain(..excess);
            self.discarded_bytes += excess;
            tracing::warn!("Frame buffer overflow, dropped {} bytes", excess);
        }
    }

    fn next_item(&mut self) -> Option<Self::Item> {
        self.next_item_with_bytes().map(|(frame, _)| frame)
    }

    fn next_item_with_bytes(&mut self) -> Option<(Self::Item, Vec<u8>)> {
        loop {
            match self.parse(&self.buffer) {
                Decoded::Frame { frame, consumed } => {
                    let bytes: Vec<u8> = self.buffer.drain(..consumed).collect();
                    tracing::trace!(
                        "Frame {} on DLCI {}: {:02X?}",
                        frame.frame_type.name(),
                        frame.dlci,
                        bytes
                    );
                    return Some((frame, bytes));
                }
                Decoded::Incomplete => return None,
                Decoded::Discard { consumed, reason } => {
                    match reason {
                        ParseError::ChecksumMismatch { .. } | ParseError::UnknownFrameType(_) => {
                            self.rejected_frames += 1;
                            tracing::warn!("Rejected frame: {}", reason);
                        }
                        _ => tracing::debug!("Resynchronizing, dropped {} bytes: {}", consumed, reason),
                    }
                    self.buffer.drain(..consumed);
                    self.discarded_bytes += consumed;
                }
            }
        }
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Discard up to the next flag after the opening one
fn resync(buf: &[u8], reason: ParseError) -> Decoded {
    Decoded::Discard {
        consumed: next_flag(buf, 1).unwrap_or(buf.len()),
        reason,
    }
}

fn next_flag(buf: &[u8], from: usize) -> Option<usize> {
    buf.iter()
        .skip(from)
        .position(|&b| b == FLAG)
        .map(|pos| pos + from)
}
