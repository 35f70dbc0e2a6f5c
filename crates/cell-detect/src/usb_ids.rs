//! USB Vendor/Product ID database for cellular modules and serial adapters
//!
//! Modules with native USB expose several ACM/serial interfaces; boards
//! wired over a UART usually sit behind one of the common USB-to-serial
//! adapters.

/// USB Vendor ID / Product ID pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

/// Cellular module vendors with native USB
pub mod modem {
    use super::UsbId;

    /// Quectel
    pub mod quectel {
        use super::UsbId;

        pub const VID: u16 = 0x2C7C;

        pub const EC21: UsbId = UsbId::new(VID, 0x0121);
        pub const EC25: UsbId = UsbId::new(VID, 0x0125);
        pub const EG91: UsbId = UsbId::new(VID, 0x0191);
        pub const BG96: UsbId = UsbId::new(VID, 0x0296);
    }

    /// SIMCom
    pub mod simcom {
        use super::UsbId;

        pub const VID: u16 = 0x1E0E;

        pub const SIM7600: UsbId = UsbId::new(VID, 0x9001);
        pub const SIM7000: UsbId = UsbId::new(VID, 0x9205);
    }

    /// u-blox
    pub mod ublox {
        use super::UsbId;

        pub const VID: u16 = 0x1546;

        pub const LARA_R2: UsbId = UsbId::new(VID, 0x110A);
        pub const SARA_R4: UsbId = UsbId::new(VID, 0x1102);
    }

    /// Telit
    pub mod telit {
        use super::UsbId;

        pub const VID: u16 = 0x1BC7;

        pub const LE910: UsbId = UsbId::new(VID, 0x1201);
        pub const LN940: UsbId = UsbId::new(VID, 0x1900);
    }
}

/// FTDI (Future Technology Devices International)
pub mod ftdi {
    pub const VID: u16 = 0x0403;

    pub const ALL_PIDS: &[u16] = &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015];
}

/// Silicon Labs CP210x
pub mod cp210x {
    pub const VID: u16 = 0x10C4;

    pub const ALL_PIDS: &[u16] = &[0xEA60, 0xEA70, 0xEA71];
}

/// WCH CH340/CH341
pub mod ch340 {
    pub const VID: u16 = 0x1A86;

    pub const ALL_PIDS: &[u16] = &[0x7523, 0x5523];
}

/// Prolific PL2303
pub mod prolific {
    pub const VID: u16 = 0x067B;

    pub const ALL_PIDS: &[u16] = &[0x2303];
}

/// Known module products: (id, name)
static KNOWN_MODEMS: &[(UsbId, &str)] = &[
    (modem::quectel::EC21, "Quectel EC21"),
    (modem::quectel::EC25, "Quectel EC25/EG25"),
    (modem::quectel::EG91, "Quectel EG91"),
    (modem::quectel::BG96, "Quectel BG96"),
    (modem::simcom::SIM7600, "SIMCom SIM7600"),
    (modem::simcom::SIM7000, "SIMCom SIM7000"),
    (modem::ublox::LARA_R2, "u-blox LARA-R2"),
    (modem::ublox::SARA_R4, "u-blox SARA-R4"),
    (modem::telit::LE910, "Telit LE910"),
    (modem::telit::LN940, "Telit LN940"),
];

/// Name of a known module product
pub fn known_modem(vid: u16, pid: u16) -> Option<&'static str> {
    KNOWN_MODEMS
        .iter()
        .find(|(id, _)| id.vid == vid && id.pid == pid)
        .map(|(_, name)| *name)
}

/// Vendor name for a module vendor ID
pub fn modem_vendor(vid: u16) -> Option<&'static str> {
    match vid {
        modem::quectel::VID => Some("Quectel"),
        modem::simcom::VID => Some("SIMCom"),
        modem::ublox::VID => Some("u-blox"),
        modem::telit::VID => Some("Telit"),
        _ => None,
    }
}

/// Check if a VID/PID is a known serial adapter
pub fn is_known_serial_adapter(vid: u16, pid: u16) -> bool {
    match vid {
        ftdi::VID => ftdi::ALL_PIDS.contains(&pid),
        cp210x::VID => cp210x::ALL_PIDS.contains(&pid),
        ch340::VID => ch340::ALL_PIDS.contains(&pid),
        prolific::VID => prolific::ALL_PIDS.contains(&pid),
        _ => false,
    }
}

/// Get adapter type name from VID
pub fn adapter_name(vid: u16) -> Option<&'static str> {
    match vid {
        ftdi::VID => Some("FTDI"),
        cp210x::VID => Some("CP210x"),
        ch340::VID => Some("CH340"),
        prolific::VID => Some("PL2303"),
        _ => None,
    }
}

/// Port classification for probing decisions
///
/// Module vendor ports are safe to probe automatically; generic adapters
/// may be wired to anything and are probed on request only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PortClassification {
    /// Cellular module vendor USB (Quectel, SIMCom, u-blox, Telit)
    KnownModem,
    /// Known serial adapter (FTDI, CP210x, CH340, PL2303)
    KnownAdapter,
    /// Unknown device
    Unknown,
}

impl PortClassification {
    /// Returns true if this port classification is safe for automatic probing
    pub fn is_safe_to_probe(&self) -> bool {
        matches!(self, Self::KnownModem)
    }
}

/// Classify a port based on USB IDs
///
/// Returns the classification tier and a hint string for display
/// (e.g. "Quectel EC25/EG25", "Quectel", "FTDI").
pub fn classify_port(vid: Option<u16>, pid: Option<u16>) -> (PortClassification, Option<&'static str>) {
    let Some(vid) = vid else {
        return (PortClassification::Unknown, None);
    };

    if let Some(vendor) = modem_vendor(vid) {
        let hint = pid.and_then(|pid| known_modem(vid, pid)).unwrap_or(vendor);
        return (PortClassification::KnownModem, Some(hint));
    }

    if pid.is_some_and(|pid| is_known_serial_adapter(vid, pid)) {
        return (PortClassification::KnownAdapter, adapter_name(vid));
    }

    (PortClassification::Unknown, None)
}
