//! Unsolicited Result Codes
//!
//! The modem reports asynchronous events as lines of the form
//! `+HEAD: token,token,...` (or a bare word such as `RING`). This module
//! splits them into head and tokens and tags them with a [`UrcKind`]; it
//! never interprets their business meaning.
//!
//! It also recognizes the boot markers the modem prints after power-up
//! (`RDY`, then `+CFUN: 1`) and the firmware-update progress line
//! (`+QIND: "FOTA"...`).

/// Classification tag for a URC line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UrcKind {
    /// `RDY`: modem initialization finished
    Ready,
    /// `+CFUN:` functionality level report
    Functionality,
    /// `RING`: incoming call
    Ring,
    /// `+CLIP:` calling line identification
    CallerId,
    /// `+CMTI:` new SMS stored
    NewMessage,
    /// `+CMT:` SMS delivered directly
    MessageDelivered,
    /// `+CREG:` network registration
    Registration,
    /// `+CSQ:` signal quality
    SignalQuality,
    /// `+QIND:` vendor indication (FOTA progress, signal, ...)
    Indication,
    /// `+CUSD:` USSD response
    Ussd,
    /// `+CTZE:` time zone report
    TimeZone,
    /// `+CPIN:` SIM state
    SimState,
    /// `+QSIMSTAT:` SIM insertion state
    SimInserted,
    /// `NO CARRIER`: call ended
    NoCarrier,
    /// `BUSY`: remote busy
    Busy,
    /// `POWERED DOWN`: modem switched off
    PoweredDown,
    /// Anything else
    Unknown,
}

impl UrcKind {
    /// Line prefixes, matched in order
    const TABLE: &'static [(&'static str, UrcKind)] = &[
        ("RDY", UrcKind::Ready),
        ("+CFUN:", UrcKind::Functionality),
        ("RING", UrcKind::Ring),
        ("+CLIP:", UrcKind::CallerId),
        ("+CMTI:", UrcKind::NewMessage),
        ("+CMT:", UrcKind::MessageDelivered),
        ("+CREG:", UrcKind::Registration),
        ("+CSQ:", UrcKind::SignalQuality),
        ("+QIND:", UrcKind::Indication),
        ("+CUSD:", UrcKind::Ussd),
        ("+CTZE:", UrcKind::TimeZone),
        ("+CPIN:", UrcKind::SimState),
        ("+QSIMSTAT:", UrcKind::SimInserted),
        ("NO CARRIER", UrcKind::NoCarrier),
        ("BUSY", UrcKind::Busy),
        ("POWERED DOWN", UrcKind::PoweredDown),
    ];

    /// Classify a line by its prefix
    pub fn classify(line: &str) -> UrcKind {
        let line = line.trim();
        Self::TABLE
            .iter()
            .find(|(head, _)| line.starts_with(head))
            .map(|(_, kind)| *kind)
            .unwrap_or(UrcKind::Unknown)
    }
}

/// A tokenized URC line
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Urc {
    /// Classification tag
    pub kind: UrcKind,
    /// Text before the first `:` (the whole line for bare words)
    pub head: String,
    /// Text after the first `:`
    pub body: String,
    /// Body split on `,`, quotes removed, each token trimmed
    pub tokens: Vec<String>,
}

impl Urc {
    /// Tokenize a URC line
    pub fn parse(line: &str) -> Self {
        Self::parse_with_delimiter(line, ',')
    }

    /// Tokenize a URC line with a custom token delimiter
    pub fn parse_with_delimiter(line: &str, delimiter: char) -> Self {
        let line = line.trim();
        let (head, body) = match line.split_once(':') {
            Some((head, body)) => (head.trim(), body.trim()),
            None => (line, ""),
        };
        let tokens = if body.is_empty() {
            Vec::new()
        } else {
            body.split(delimiter)
                .map(|t| t.replace('"', "").trim().to_string())
                .collect()
        };
        Self {
            kind: UrcKind::classify(line),
            head: head.to_string(),
            body: body.to_string(),
            tokens,
        }
    }

    /// Token at `index`
    pub fn token(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }
}

/// Boot markers recognized while no command is outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootMarker {
    /// `RDY`
    MeInitializationSuccessful,
    /// `+CFUN: 1`
    FullFunctionalityAvailable,
}

impl BootMarker {
    /// Marker tokens in boot order
    pub const TOKENS: [(&'static str, BootMarker); 2] = [
        ("RDY", BootMarker::MeInitializationSuccessful),
        ("+CFUN: 1", BootMarker::FullFunctionalityAvailable),
    ];

    /// The token text of this marker
    pub fn token(&self) -> &'static str {
        match self {
            BootMarker::MeInitializationSuccessful => "RDY",
            BootMarker::FullFunctionalityAvailable => "+CFUN: 1",
        }
    }
}

/// Firmware-update progress marker
pub const FOTA_MARKER: &str = "+QIND: \"FOTA\"";

/// What a scan of the accumulated URC text found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerScan {
    /// Boot markers present, in boot order
    pub markers: Vec<(BootMarker, usize)>,
    /// Whether the firmware-update marker is present
    pub fota: bool,
    /// Bytes of the text up to and including the last marker found
    pub consumed: usize,
}

impl MarkerScan {
    /// Whether nothing was recognized
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty() && !self.fota
    }
}

/// Scan accumulated text for boot and firmware-update markers
///
/// Each marker records the byte offset it was found at so callers can
/// check ordering.
pub fn scan_markers(text: &str) -> MarkerScan {
    let mut scan = MarkerScan::default();
    for (token, marker) in BootMarker::TOKENS {
        if let Some(pos) = text.find(token) {
            scan.markers.push((marker, pos));
            scan.consumed = scan.consumed.max(pos + token.len());
        }
    }
    scan.fota = text.contains(FOTA_MARKER);
    scan
}
