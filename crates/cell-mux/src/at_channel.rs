//! AT command engine
//!
//! [`AtChannel`] sends a command on either the raw serial link (before
//! multiplexing) or a logical channel, collects the response and logs the
//! outcome. Text that arrives while no command is outstanding goes to the
//! [`UrcDispatcher`], which watches for boot and firmware-update markers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cell_protocol::at::{format_command, printable, AtStream};
use cell_protocol::registry::DEFAULT_TIMEOUT;
use cell_protocol::urc::{scan_markers, BootMarker};
use cell_protocol::{AtCommand, AtResult, CommandRegistry, LineCodec, ProtocolCodec, ResultCode, Urc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::{ResponseBuffer, Waiter};
use crate::channel::{collect_response, LogicalChannel};
use crate::error::MuxError;
use crate::events::ModemEvent;
use crate::link::Link;

/// Largest amount of idle text kept while looking for markers
const MAX_IDLE_TEXT: usize = 1024;

/// AT engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AtConfig {
    /// Timeout for free-form commands sent with [`AtChannel::send`], in milliseconds
    pub default_timeout_ms: u64,
    /// Number of response chunks held for a waiting command
    pub response_buffer: usize,
}

impl Default for AtConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
            response_buffer: crate::buffer::DEFAULT_CAPACITY,
        }
    }
}

impl AtConfig {
    /// Default command timeout
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[derive(Debug, Default)]
struct IdleText {
    text: String,
    seen_ready: bool,
    seen_full_functionality: bool,
    power_up_reported: bool,
}

/// Watches idle text for boot completion and firmware-update progress
///
/// Power-up is reported once: after both `RDY` and `+CFUN: 1` have been
/// seen, further boot markers are ignored until
/// [`reset_boot_detection`](UrcDispatcher::reset_boot_detection).
#[derive(Debug)]
pub struct UrcDispatcher {
    state: Mutex<IdleText>,
    link: Arc<Link>,
}

impl UrcDispatcher {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self {
            state: Mutex::new(IdleText::default()),
            link,
        }
    }

    /// Feed text received while no command was outstanding
    ///
    /// Returns `Ok` when a marker was recognized, `DataNotUsed` otherwise.
    /// Text up to the last recognized marker is consumed, so a marker is
    /// never matched twice.
    pub fn process_idle_data(&self, text: &str) -> ResultCode {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.text.push_str(text);
        if state.text.len() > MAX_IDLE_TEXT {
            let mut cut = state.text.len() - MAX_IDLE_TEXT;
            while !state.text.is_char_boundary(cut) {
                cut += 1;
            }
            state.text.drain(..cut);
        }

        let scan = scan_markers(&state.text);
        if scan.is_empty() {
            return ResultCode::DataNotUsed;
        }

        let ready_at = scan
            .markers
            .iter()
            .find(|(marker, _)| *marker == BootMarker::MeInitializationSuccessful)
            .map(|(_, pos)| *pos);
        for (marker, pos) in &scan.markers {
            match marker {
                BootMarker::MeInitializationSuccessful => state.seen_ready = true,
                // +CFUN: 1 only counts once RDY has been seen
                BootMarker::FullFunctionalityAvailable => {
                    if ready_at.map_or(state.seen_ready, |ready| ready < *pos) {
                        state.seen_full_functionality = true;
                    }
                }
            }
        }

        if scan.fota {
            let raw = std::mem::take(&mut state.text);
            info!("[URC] firmware update: {}", raw.trim());
            self.link.publish(ModemEvent::FirmwareUpdateProgress { raw });
        } else {
            let consumed = scan.consumed.min(state.text.len());
            state.text.drain(..consumed);
        }

        if state.seen_ready && state.seen_full_functionality {
            if !state.power_up_reported {
                state.power_up_reported = true;
                info!("[URC] modem power-up complete");
                self.link.publish(ModemEvent::PowerUpComplete);
            } else if !scan.markers.is_empty() {
                debug!("[URC] boot markers repeated, already reported");
            }
        }
        ResultCode::Ok
    }

    /// Allow the next boot sequence to be reported again
    pub fn reset_boot_detection(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = IdleText::default();
    }

    /// Whether power-up has been reported since the last reset
    pub fn power_up_reported(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .power_up_reported
    }

    /// Drop accumulated idle text
    pub fn clear(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .text
            .clear();
    }
}

/// Splits idle bytes into lines and publishes them as classified URCs
#[derive(Debug)]
pub(crate) struct UrcSplitter {
    dlci: Option<u8>,
    lines: Mutex<LineCodec>,
    link: Arc<Link>,
}

impl UrcSplitter {
    pub(crate) fn new(dlci: Option<u8>, link: Arc<Link>) -> Self {
        Self {
            dlci,
            lines: Mutex::new(LineCodec::new()),
            link,
        }
    }

    pub(crate) fn feed(&self, data: &[u8]) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.push_bytes(data);
        while let Some(line) = lines.next_item() {
            let urc = Urc::parse(&line);
            debug!("[URC] {:?}: {}", urc.kind, line);
            self.link.publish(ModemEvent::Urc { dlci: self.dlci, urc });
        }
    }

    pub(crate) fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// The serial link used directly, before multiplexing
#[derive(Debug)]
pub struct DirectPort {
    buffer: ResponseBuffer<Vec<u8>>,
    link: Arc<Link>,
    dispatcher: Arc<UrcDispatcher>,
    urcs: UrcSplitter,
}

impl DirectPort {
    pub(crate) fn new(link: Arc<Link>, dispatcher: Arc<UrcDispatcher>, config: &AtConfig) -> Self {
        Self {
            buffer: ResponseBuffer::new(config.response_buffer),
            urcs: UrcSplitter::new(None, link.clone()),
            link,
            dispatcher,
        }
    }

    /// Route bytes read in AT mode
    pub(crate) fn process_new_data(&self, data: &[u8]) -> ResultCode {
        if self.buffer.is_awaiting() {
            return match self.buffer.try_push(data.to_vec()) {
                Ok(()) => ResultCode::Ok,
                Err(_) => {
                    warn!("[AT] response buffer full, {} bytes dropped", data.len());
                    ResultCode::FullMsgBuffer
                }
            };
        }
        self.urcs.feed(data);
        self.dispatcher.process_idle_data(&String::from_utf8_lossy(data))
    }

    pub(crate) fn reset(&self) {
        self.urcs.clear();
    }

    async fn exchange(&self, cmd: &str, timeout: Duration, stream: AtStream) -> Result<AtResult, MuxError> {
        let mut waiter: Waiter<'_, Vec<u8>> = self.buffer.acquire().ok_or(MuxError::PortBusy)?;
        let deadline = Instant::now() + timeout;

        if self.link.is_closed() {
            return Ok(AtResult::new(ResultCode::ReceivingNotStarted));
        }
        match tokio::time::timeout_at(deadline, self.link.send_raw(format_command(cmd).into_bytes())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[AT] {} not sent: {}", printable(cmd), e);
                return Ok(AtResult::new(ResultCode::TransmissionNotStarted));
            }
            Err(_) => {
                warn!("[AT] {} not sent: write queue full", printable(cmd));
                return Ok(AtResult::new(ResultCode::TransmissionNotStarted));
            }
        }

        Ok(collect_response(&mut waiter, stream, deadline).await)
    }
}

#[derive(Debug, Clone)]
enum AtPort {
    Direct(Arc<DirectPort>),
    Muxed(Arc<LogicalChannel>),
}

/// Sends AT commands over the raw link or a logical channel
#[derive(Debug, Clone)]
pub struct AtChannel {
    port: AtPort,
    dispatcher: Arc<UrcDispatcher>,
    registry: Option<Arc<CommandRegistry>>,
    config: AtConfig,
}

impl AtChannel {
    pub(crate) fn direct(port: Arc<DirectPort>, dispatcher: Arc<UrcDispatcher>, config: AtConfig) -> Self {
        Self {
            port: AtPort::Direct(port),
            dispatcher,
            registry: None,
            config,
        }
    }

    pub(crate) fn muxed(channel: Arc<LogicalChannel>, dispatcher: Arc<UrcDispatcher>, config: AtConfig) -> Self {
        Self {
            port: AtPort::Muxed(channel),
            dispatcher,
            registry: None,
            config,
        }
    }

    /// Use a custom command table instead of the built-in one
    pub fn with_registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Command table used by [`cmd_id`](AtChannel::cmd_id)
    pub fn registry(&self) -> &CommandRegistry {
        self.registry
            .as_deref()
            .unwrap_or_else(|| CommandRegistry::builtin())
    }

    /// DLCI of the underlying channel, `None` for the raw link
    pub fn dlci(&self) -> Option<u8> {
        match &self.port {
            AtPort::Direct(_) => None,
            AtPort::Muxed(channel) => Some(channel.dlci()),
        }
    }

    /// Send a command and wait for its result
    ///
    /// The result resolves on a terminal line, after `expected_tokens`
    /// lines (when non-zero), or with `Timeout` when `timeout` elapses.
    pub async fn cmd(&self, cmd: &str, timeout: Duration, expected_tokens: usize) -> Result<AtResult, MuxError> {
        self.run(cmd, timeout, AtStream::new(expected_tokens)).await
    }

    /// Send a command with the configured default timeout
    pub async fn send(&self, cmd: &str) -> Result<AtResult, MuxError> {
        self.cmd(cmd, self.config.default_timeout(), 0).await
    }

    /// Send a command from the registry
    pub async fn cmd_id(&self, id: AtCommand) -> Result<AtResult, MuxError> {
        let entry = self.registry().lookup(id).clone();
        self.cmd(entry.text(), entry.timeout(), 0).await
    }

    /// Send a registry command with a parameter suffix appended
    pub async fn cmd_with(&self, id: AtCommand, suffix: &str) -> Result<AtResult, MuxError> {
        let entry = self.registry().lookup(id).with_suffix(suffix);
        self.cmd(entry.text(), entry.timeout(), 0).await
    }

    /// Send a command that may be answered with the `>` data prompt
    pub async fn send_command_prompt(
        &self,
        cmd: &str,
        expected_tokens: usize,
        timeout: Duration,
    ) -> Result<AtResult, MuxError> {
        self.run(cmd, timeout, AtStream::with_prompt(expected_tokens)).await
    }

    /// Send a message body after a `>` prompt, terminated with Ctrl-Z
    pub async fn send_message_body(&self, body: &str, timeout: Duration) -> Result<AtResult, MuxError> {
        self.cmd(&format!("{}\x1a", body), timeout, 0).await
    }

    /// Allow the next boot sequence to be reported again
    pub fn reset_boot_detection(&self) {
        self.dispatcher.reset_boot_detection();
    }

    async fn run(&self, cmd: &str, timeout: Duration, stream: AtStream) -> Result<AtResult, MuxError> {
        self.dispatcher.clear();
        let result = match &self.port {
            AtPort::Direct(port) => port.exchange(cmd, timeout, stream).await,
            AtPort::Muxed(channel) => channel.exchange(cmd, timeout, stream).await,
        };
        self.dispatcher.clear();

        if let Ok(result) = &result {
            log_result(cmd, timeout, result);
        }
        result
    }
}

fn log_result(cmd: &str, timeout: Duration, result: &AtResult) {
    let cmd = printable(cmd);
    match result.code {
        ResultCode::Timeout => error!("[AT]: >{}<, timeout {}ms", cmd, timeout.as_millis()),
        ResultCode::Ok => info!("[AT]: >{}<, {}", cmd, result.code),
        code => error!("[AT]: >{}<, {}", cmd, code),
    }
    for line in &result.response {
        debug!("[AT]:    {}", line);
    }
}
