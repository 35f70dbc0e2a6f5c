//! AT command registry
//!
//! Maps symbolic command identifiers to their text and default timeout.
//! The built-in table is built once on first use and never mutated.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

/// Timeout for commands the modem answers immediately
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300);

/// Timeout for commands that touch the SIM or the radio
pub const DEFAULT_LONG_TIMEOUT: Duration = Duration::from_secs(15);

/// Symbolic AT command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AtCommand {
    /// `AT`, attention
    At,
    /// `ATE0`, disable command echo
    EchoOff,
    /// `AT&F`, restore factory settings
    FactoryReset,
    /// `ATI`, product identification
    SwInfo,
    /// `AT+IFC=2,2`, RTS/CTS flow control
    FlowCtrlOn,
    /// `AT+IFC=0,0`, no flow control
    FlowCtrlOff,
    /// Route URCs to the first multiplexed channel
    UrcNotifChannel,
    /// Ring indicator follows incoming calls
    RiPinAutoCall,
    /// No ring indicator for incoming calls
    RiPinOffCall,
    /// Pulse the ring indicator on incoming SMS
    RiPinPulseSms,
    /// No ring indicator for incoming SMS
    RiPinOffSms,
    /// Pulse the ring indicator on other URCs
    RiPinPulseOther,
    /// Delay URCs until the host is ready
    UrcDelayOn,
    /// Send URCs on the main UART
    UrcUart1,
    /// Configure the AP_READY pin
    ApReadyLogic,
    /// Enable signal quality URCs
    CsqUrcOn,
    /// Disable signal quality URCs
    CsqUrcOff,
    /// `AT+CRC=1`, extended ring format
    CrcOn,
    /// `AT+CLIP=1`, caller id
    CallerNumberPresentation,
    /// `AT+CMGF=1`, SMS text mode
    SmsTextFormat,
    /// UCS2 character set
    SmsUcs2,
    /// GSM character set
    SmsGsm,
    /// `AT+QSCLK=1`, allow sleep mode
    QsclkOn,
    /// Route URCs to the notification channel
    SetUrcChannel,
    /// `AT+CSQ`, signal quality
    Csq,
    /// `AT+CLCC`, list current calls
    Clcc,
    /// `AT+CMGD=`, delete a message
    Cmgd,
    /// `AT+CNUM`, subscriber number
    Cnum,
    /// `AT+CIMI`, IMSI
    Cimi,
    /// `AT+QCMGR=`, read a message
    Qcmgr,
    /// `ATH`, hang up
    Ath,
    /// `ATA`, answer
    Ata,
    /// `ATD`, dial
    Atd,
    /// `AT+IPR=`, fixed baud rate
    Ipr,
    /// `AT+CMUX=`, start multiplexing
    Cmux,
    /// `AT+CFUN=`, set functionality
    Cfun,
    /// `AT+CFUN=1,1`, reset the modem
    CfunReset,
    /// `AT+CFUN=0`, minimum functionality
    CfunMinFunctionality,
    /// `AT+CFUN=1`, full functionality
    CfunFullFunctionality,
    /// `AT+CFUN=4`, radio off
    CfunDisableTransmitting,
    /// `AT+CMGS=`, send a message
    Cmgs,
    /// `AT+CREG?`, registration status
    Creg,
    /// `AT+QNWINFO`, network information
    Qnwinfo,
    /// `AT+COPS`, operator selection
    Cops,
    /// `AT+QSIMSTAT?`, SIM inserted status
    Qsimstat,
    /// Enable SIM hot-swap detection
    SimDetOn,
    /// Enable SIM status URCs
    SimstatOn,
    /// `AT+QGMR`, firmware revision
    Qgmr,
    /// `AT&W`, store the current settings
    StoreSettings,
    /// `AT+CEER`, extended error report
    Ceer,
    /// `AT+CUSD=1`, open a USSD session
    CusdOpenSession,
    /// `AT+CUSD=2`, close the USSD session
    CusdCloseSession,
    /// `AT+CUSD=1,`, send a USSD string
    CusdSend,
    /// Keep messages on the SIM
    SetSmsStorage,
    /// `AT+CPIN=`, enter the PIN
    Cpin,
    /// `AT+CPIN?`, PIN status
    GetCpin,
    /// Update the clock from the network
    EnableTimeZoneUpdate,
    /// Report time zone changes
    SetTimeZoneReporting,
    /// `AT+CREG=2`, registration URCs with location
    EnableNetworkRegistrationUrc,
    /// List all stored messages
    ListMessages,
    /// `AT+GSN`, IMEI
    GetImei,
    /// `AT+QIACT`, activate a PDP context
    Qiact,
    /// `AT+QIDEACT`, deactivate a PDP context
    Qideact,
    /// Enable ring URCs
    RingUrcOn,
    /// Enable incoming SMS URCs
    SmsUrcOn,
    /// Disable access technology URCs
    ActUrcOff,
}

/// One command: text plus the default time the modem may take to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    text: String,
    timeout: Duration,
}

impl Cmd {
    /// Command with the default timeout
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_timeout(text, DEFAULT_TIMEOUT)
    }

    /// Command with an explicit timeout
    pub fn with_timeout(text: impl Into<String>, timeout: Duration) -> Self {
        Self {
            text: text.into(),
            timeout,
        }
    }

    /// Command text
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Default timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// The same command with parameters appended (`AT+CFUN=` + `1`)
    pub fn with_suffix(&self, suffix: &str) -> Self {
        Self {
            text: format!("{}{}", self.text, suffix),
            timeout: self.timeout,
        }
    }
}

/// Built-in command table
static BUILTIN: &[(AtCommand, &str, Option<Duration>)] = &[
    (AtCommand::At, "AT", None),
    (AtCommand::EchoOff, "ATE0", None),
    (AtCommand::FactoryReset, "AT&F", None),
    (AtCommand::SwInfo, "ATI\r", None),
    (AtCommand::FlowCtrlOn, "AT+IFC=2,2\r\n", None),
    (AtCommand::FlowCtrlOff, "AT+IFC=0,0", None),
    (AtCommand::UrcNotifChannel, "AT+QCFG=\"cmux/urcport\",1", None),
    (AtCommand::RiPinAutoCall, "AT+QCFG=\"urc/ri/ring\",\"auto\"", None),
    (AtCommand::RiPinOffCall, "AT+QCFG=\"urc/ri/ring\",\"off\"", None),
    (AtCommand::RiPinPulseSms, "AT+QCFG=\"urc/ri/smsincoming\",\"pulse\",450", None),
    (AtCommand::RiPinOffSms, "AT+QCFG=\"urc/ri/smsincoming\",\"off\"", None),
    (AtCommand::RiPinPulseOther, "AT+QCFG=\"urc/ri/other\",\"pulse\"", None),
    (AtCommand::UrcDelayOn, "AT+QCFG=\"urc/delay\",1", None),
    (AtCommand::UrcUart1, "AT+QURCCFG=\"urcport\",\"uart1\"", None),
    (AtCommand::ApReadyLogic, "AT+QCFG=\"apready\",1,1,200", None),
    (AtCommand::CsqUrcOn, "AT+QINDCFG=\"csq\",1", None),
    (AtCommand::CsqUrcOff, "AT+QINDCFG=\"csq\",0", None),
    (AtCommand::CrcOn, "AT+CRC=1", None),
    (AtCommand::CallerNumberPresentation, "AT+CLIP=1", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::SmsTextFormat, "AT+CMGF=1", None),
    (AtCommand::SmsUcs2, "AT+CSCS=\"UCS2\"", None),
    (AtCommand::SmsGsm, "AT+CSCS=\"GSM\"", None),
    (AtCommand::QsclkOn, "AT+QSCLK=1", None),
    (AtCommand::SetUrcChannel, "AT+QCFG=\"cmux/urcport\",2", None),
    (AtCommand::Csq, "AT+CSQ", None),
    (AtCommand::Clcc, "AT+CLCC", None),
    (AtCommand::Cmgd, "AT+CMGD=", None),
    (AtCommand::Cnum, "AT+CNUM", None),
    (AtCommand::Cimi, "AT+CIMI", None),
    (AtCommand::Qcmgr, "AT+QCMGR=", Some(Duration::from_secs(180))),
    (AtCommand::Ath, "ATH", Some(Duration::from_secs(100))),
    (AtCommand::Ata, "ATA", Some(Duration::from_secs(100))),
    (AtCommand::Atd, "ATD", Some(Duration::from_secs(6))),
    (AtCommand::Ipr, "AT+IPR=", None),
    (AtCommand::Cmux, "AT+CMUX=", None),
    (AtCommand::Cfun, "AT+CFUN=", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::CfunReset, "AT+CFUN=1,1", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::CfunMinFunctionality, "AT+CFUN=0", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::CfunFullFunctionality, "AT+CFUN=1", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::CfunDisableTransmitting, "AT+CFUN=4", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::Cmgs, "AT+CMGS=\"", Some(Duration::from_secs(180))),
    (AtCommand::Creg, "AT+CREG?", None),
    (AtCommand::Qnwinfo, "AT+QNWINFO", None),
    (AtCommand::Cops, "AT+COPS", Some(Duration::from_secs(200))),
    (AtCommand::Qsimstat, "AT+QSIMSTAT?", None),
    (AtCommand::SimDetOn, "AT+QSIMDET=1,0", None),
    (AtCommand::SimstatOn, "AT+QSIMSTAT=1", None),
    (AtCommand::Qgmr, "AT+QGMR", None),
    (AtCommand::StoreSettings, "AT&W", None),
    (AtCommand::Ceer, "AT+CEER", None),
    (AtCommand::CusdOpenSession, "AT+CUSD=1", Some(Duration::from_secs(150))),
    (AtCommand::CusdCloseSession, "AT+CUSD=2", Some(Duration::from_secs(150))),
    (AtCommand::CusdSend, "AT+CUSD=1,", Some(Duration::from_secs(150))),
    (AtCommand::SetSmsStorage, "AT+CPMS=\"SM\",\"SM\",\"SM\"", None),
    (AtCommand::Cpin, "AT+CPIN=", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::GetCpin, "AT+CPIN?", Some(DEFAULT_LONG_TIMEOUT)),
    (AtCommand::EnableTimeZoneUpdate, "AT+CTZU=3", None),
    (AtCommand::SetTimeZoneReporting, "AT+CTZR=2", None),
    (AtCommand::EnableNetworkRegistrationUrc, "AT+CREG=2", None),
    (AtCommand::ListMessages, "AT+CMGL=\"ALL\"", None),
    (AtCommand::GetImei, "AT+GSN", None),
    (AtCommand::Qiact, "AT+QIACT", Some(Duration::from_secs(150))),
    (AtCommand::Qideact, "AT+QIDEACT", Some(Duration::from_secs(40))),
    (AtCommand::RingUrcOn, "AT+QINDCFG=\"ring\",1", None),
    (AtCommand::SmsUrcOn, "AT+QINDCFG=\"smsincoming\",1", None),
    (AtCommand::ActUrcOff, "AT+QINDCFG=\"act\",0", None),
];

/// Commands run once after power-up to put the modem in a known state
pub const MODEM_INIT: &[AtCommand] = &[
    AtCommand::CallerNumberPresentation,
    AtCommand::SmsTextFormat,
    AtCommand::SmsGsm,
    AtCommand::CrcOn,
    AtCommand::RiPinAutoCall,
    AtCommand::RiPinPulseSms,
    AtCommand::RiPinPulseOther,
    AtCommand::UrcDelayOn,
    AtCommand::UrcUart1,
    AtCommand::ApReadyLogic,
    AtCommand::EnableTimeZoneUpdate,
    AtCommand::SetTimeZoneReporting,
    AtCommand::EnableNetworkRegistrationUrc,
    AtCommand::SetSmsStorage,
    AtCommand::SimDetOn,
    AtCommand::SimstatOn,
];

/// Read-only map from [`AtCommand`] to [`Cmd`]
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    commands: HashMap<AtCommand, Cmd>,
    fallback: Cmd,
}

impl CommandRegistry {
    /// The process-wide built-in registry
    pub fn builtin() -> &'static CommandRegistry {
        static REGISTRY: OnceLock<CommandRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            Self::from_entries(BUILTIN.iter().map(|(id, text, timeout)| {
                let cmd = match timeout {
                    Some(timeout) => Cmd::with_timeout(*text, *timeout),
                    None => Cmd::new(*text),
                };
                (*id, cmd)
            }))
        })
    }

    /// Build a registry from custom entries
    pub fn from_entries(entries: impl IntoIterator<Item = (AtCommand, Cmd)>) -> Self {
        Self {
            commands: entries.into_iter().collect(),
            fallback: Cmd::new("AT"),
        }
    }

    /// Look up a command
    ///
    /// A missing identifier is logged and resolves to the `AT` no-op.
    pub fn lookup(&self, id: AtCommand) -> &Cmd {
        match self.commands.get(&id) {
            Some(cmd) => cmd,
            None => {
                tracing::error!("No such AT command defined: {:?}", id);
                self.commands.get(&AtCommand::At).unwrap_or(&self.fallback)
            }
        }
    }

    /// Whether an identifier is present
    pub fn contains(&self, id: AtCommand) -> bool {
        self.commands.contains_key(&id)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
