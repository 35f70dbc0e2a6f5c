//! Notification bus for the modem stack
//!
//! Everything the rest of the system may react to (modem ready, firmware
//! update progress, classified URCs, channel lifecycle, traffic) is
//! published as a [`ModemEvent`] on one broadcast channel.

use cell_protocol::Urc;

use crate::channel::ChannelRole;
use crate::multiplexer::MuxMode;

/// Unified event enum for all modem stack activity
#[derive(Debug, Clone)]
pub enum ModemEvent {
    // -------------------------------------------------------------------------
    // Modem lifecycle events
    // -------------------------------------------------------------------------
    /// The modem printed its readiness and full-functionality markers
    PowerUpComplete,

    /// Firmware-over-the-air progress line, forwarded verbatim
    FirmwareUpdateProgress {
        /// The raw accumulated text
        raw: String,
    },

    /// A classified unsolicited result code
    Urc {
        /// DLCI it arrived on (`None` before multiplexing)
        dlci: Option<u8>,
        /// Tokenized URC
        urc: Urc,
    },

    // -------------------------------------------------------------------------
    // Multiplexer lifecycle events
    // -------------------------------------------------------------------------
    /// The link switched between AT and CMUX operation
    ModeChanged {
        /// New mode
        mode: MuxMode,
    },

    /// A DLC finished its SABM/UA handshake
    ChannelOpened {
        /// Channel id
        dlci: u8,
        /// Channel role
        role: ChannelRole,
    },

    /// A DLC was released by either side
    ChannelClosed {
        /// Channel id
        dlci: u8,
    },

    /// The peer changed whether this side may send on a DLC
    FlowControl {
        /// Channel id (0 for the aggregate FCon/FCoff)
        dlci: u8,
        /// Whether sending is allowed
        sending_allowed: bool,
    },

    /// The transport reached EOF or failed
    LinkClosed {
        /// Why the link closed
        reason: String,
    },

    // -------------------------------------------------------------------------
    // Traffic events (for the monitor)
    // -------------------------------------------------------------------------
    /// Raw bytes read from the transport
    DataIn {
        /// Raw data bytes
        data: Vec<u8>,
    },

    /// Raw bytes written to the transport
    DataOut {
        /// Raw data bytes
        data: Vec<u8>,
    },

    /// An error occurred in the stack
    Error {
        /// Source of the error
        source: String,
        /// Error message
        message: String,
    },
}

impl ModemEvent {
    /// Check if this is a traffic event (for monitor filtering)
    pub fn is_traffic(&self) -> bool {
        matches!(self, ModemEvent::DataIn { .. } | ModemEvent::DataOut { .. })
    }

    /// Check if this is a channel or link lifecycle event
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ModemEvent::ModeChanged { .. }
                | ModemEvent::ChannelOpened { .. }
                | ModemEvent::ChannelClosed { .. }
                | ModemEvent::LinkClosed { .. }
        )
    }

    /// Get the DLCI if this event is associated with a specific channel
    pub fn dlci(&self) -> Option<u8> {
        match self {
            ModemEvent::ChannelOpened { dlci, .. }
            | ModemEvent::ChannelClosed { dlci }
            | ModemEvent::FlowControl { dlci, .. } => Some(*dlci),
            ModemEvent::Urc { dlci, .. } => *dlci,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_event_classification() {
        let data_in = ModemEvent::DataIn { data: vec![0xF9] };
        assert!(data_in.is_traffic());
        assert!(!data_in.is_lifecycle());

        let opened = ModemEvent::ChannelOpened {
            dlci: 1,
            role: ChannelRole::Commands,
        };
        assert!(!opened.is_traffic());
        assert!(opened.is_lifecycle());
    }

    #[test]
    fn test_dlci_extraction() {
        let urc = ModemEvent::Urc {
            dlci: Some(2),
            urc: Urc::parse("RING"),
        };
        assert_eq!(urc.dlci(), Some(2));
        assert_eq!(ModemEvent::PowerUpComplete.dlci(), None);
    }
}
