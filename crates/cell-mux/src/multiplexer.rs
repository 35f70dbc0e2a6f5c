//! The multiplexer: one transport, a direct AT port and a set of DLCs
//!
//! The transport is split into a receiver task and a writer task. In AT
//! mode the receiver hands bytes to the direct port; in CMUX mode it
//! decodes frames, answers control messages on DLCI 0 and routes
//! everything else to the logical channel it is addressed to.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use cell_protocol::frame::MAX_DLCI;
use cell_protocol::{
    ControlMessage, ControlType, Frame, FrameCodec, FrameConfig, FrameType, ModemStatus,
    ProtocolCodec, ProtocolError,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::at_channel::{AtChannel, AtConfig, DirectPort, UrcDispatcher};
use crate::channel::{ChannelParams, ChannelRole, ChannelState, LogicalChannel};
use crate::error::MuxError;
use crate::events::ModemEvent;
use crate::link::{run_writer, Link};

/// Line protocol currently spoken on the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MuxMode {
    /// Plain AT commands
    At,
    /// GSM 07.10 framing
    Cmux,
}

/// Multiplexer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Frame codec settings
    pub frame: FrameConfig,
    /// Parameters for channels opened without explicit ones
    pub channel: ChannelParams,
    /// AT engine settings
    pub at: AtConfig,
    /// Outbound queue depth (chunks)
    pub write_queue: usize,
    /// Event bus capacity
    pub event_capacity: usize,
    /// Read buffer size for the receiver task
    pub read_buffer: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            channel: ChannelParams::default(),
            at: AtConfig::default(),
            write_queue: 64,
            event_capacity: 256,
            read_buffer: 1024,
        }
    }
}

/// State shared between the handle and the receiver task
#[derive(Debug)]
struct Shared {
    link: Arc<Link>,
    mode: Mutex<MuxMode>,
    channels: RwLock<BTreeMap<u8, Arc<LogicalChannel>>>,
    direct: Arc<DirectPort>,
    dispatcher: Arc<UrcDispatcher>,
    config: MuxConfig,
}

impl Shared {
    fn mode(&self) -> MuxMode {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel(&self, dlci: u8) -> Option<Arc<LogicalChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&dlci)
            .cloned()
    }

    fn all_channels(&self) -> Vec<Arc<LogicalChannel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn enter_cmux_mode(&self) {
        *self.mode.lock().unwrap_or_else(PoisonError::into_inner) = MuxMode::Cmux;
        info!("[MUX] CMUX mode");
        self.link.publish(ModemEvent::ModeChanged { mode: MuxMode::Cmux });
    }

    /// Drop every channel and go back to plain AT
    fn enter_at_mode(&self, reason: &str) {
        {
            let mut mode = self.mode.lock().unwrap_or_else(PoisonError::into_inner);
            if *mode == MuxMode::At {
                return;
            }
            *mode = MuxMode::At;
        }
        let channels = std::mem::take(&mut *self.channels.write().unwrap_or_else(PoisonError::into_inner));
        for (dlci, channel) in channels {
            if channel.state() != ChannelState::Closed {
                channel.set_state(ChannelState::Closed);
                self.link.publish(ModemEvent::ChannelClosed { dlci });
            }
        }
        self.direct.reset();
        info!("[MUX] AT mode ({})", reason);
        self.link.publish(ModemEvent::ModeChanged { mode: MuxMode::At });
    }

    async fn send_control(&self, message: &ControlMessage) -> Result<(), MuxError> {
        self.link
            .send_frame(&Frame::new(0, FrameType::Uih, message.encode()))
            .await
    }

    async fn route(&self, frame: Frame) {
        if frame.dlci == 0 && matches!(frame.frame_type, FrameType::Uih | FrameType::Ui) {
            self.handle_control(frame).await;
            return;
        }

        match frame.frame_type {
            FrameType::Disc => self.handle_peer_disc(frame.dlci).await,
            FrameType::Sabm => {
                debug!("[MUX] refusing peer SABM on DLCI {}", frame.dlci);
                self.reply(Frame::response(frame.dlci, FrameType::Dm, Vec::new())).await;
            }
            _ => match self.channel(frame.dlci) {
                Some(channel) => {
                    channel.parse_input_data(frame);
                }
                None => debug!(
                    "[MUX] {} for unknown DLCI {} dropped",
                    frame.frame_type.name(),
                    frame.dlci
                ),
            },
        }
    }

    async fn reply(&self, frame: Frame) {
        if let Err(e) = self.link.send_frame(&frame).await {
            warn!("[MUX] reply on DLCI {} not sent: {}", frame.dlci, e);
        }
    }

    async fn handle_peer_disc(&self, dlci: u8) {
        if dlci == 0 {
            self.reply(Frame::response(dlci, FrameType::Ua, Vec::new())).await;
            self.enter_at_mode("peer closed the control channel");
            return;
        }
        match self.channel(dlci) {
            Some(channel) if channel.state() != ChannelState::Closed => {
                channel.set_state(ChannelState::Closed);
                self.reply(Frame::response(dlci, FrameType::Ua, Vec::new())).await;
                info!("[DLC {}] closed by peer", dlci);
                self.link.publish(ModemEvent::ChannelClosed { dlci });
            }
            // Already disconnected
            _ => {
                debug!("[MUX] DISC on disconnected DLCI {}", dlci);
                self.reply(Frame::response(dlci, FrameType::Dm, Vec::new())).await;
            }
        }
    }

    async fn handle_control(&self, frame: Frame) {
        let messages = match ControlMessage::decode_all(&frame.payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("[MUX] malformed control message: {}", e);
                self.link.publish(ModemEvent::Error {
                    source: "control".to_string(),
                    message: e.to_string(),
                });
                return;
            }
        };

        for message in messages {
            if !message.command {
                // Answers to our own control commands go to whoever waits on DLCI 0
                if let Some(control) = self.channel(0) {
                    control.parse_input_data(Frame::new(0, frame.frame_type, message.encode()));
                }
                continue;
            }

            let answer = match message.kind {
                ControlType::ModemStatus => {
                    self.apply_modem_status(&message);
                    message.response()
                }
                ControlType::Test | ControlType::ParameterNegotiation => message.response(),
                ControlType::FlowControlOn | ControlType::FlowControlOff => {
                    let allowed = message.kind == ControlType::FlowControlOn;
                    for channel in self.all_channels() {
                        channel.set_sending_allowed(allowed);
                    }
                    debug!("[MUX] aggregate flow control: sending allowed = {}", allowed);
                    self.link.publish(ModemEvent::FlowControl {
                        dlci: 0,
                        sending_allowed: allowed,
                    });
                    message.response()
                }
                ControlType::CloseDown => {
                    if let Err(e) = self.send_control(&message.response()).await {
                        warn!("[MUX] CLD response not sent: {}", e);
                    }
                    self.enter_at_mode("peer requested close-down");
                    return;
                }
                other => {
                    debug!("[MUX] unsupported control command {}", other.name());
                    ControlMessage::not_supported(other, true)
                }
            };

            if let Err(e) = self.send_control(&answer).await {
                warn!("[MUX] {} response not sent: {}", answer.kind.name(), e);
            }
        }
    }

    fn apply_modem_status(&self, message: &ControlMessage) {
        let status = match ModemStatus::from_values(&message.values) {
            Ok(status) => status,
            Err(e) => {
                warn!("[MUX] {}", e);
                return;
            }
        };
        let allowed = status.sending_allowed();
        debug!("[DLC {}] MSC: {}", status.dlci, status.describe());
        if let Some(channel) = self.channel(status.dlci) {
            channel.set_sending_allowed(allowed);
        }
        self.link.publish(ModemEvent::FlowControl {
            dlci: status.dlci,
            sending_allowed: allowed,
        });
    }
}

/// Read from the transport until EOF, routing by mode
async fn run_receiver<R>(mut io: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; shared.config.read_buffer.max(64)];
    let mut codec = FrameCodec::with_config(shared.config.frame);
    let mut last_mode = shared.mode();

    loop {
        let n = match io.read(&mut buf).await {
            Ok(0) => {
                shared.link.mark_closed("end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                shared.link.mark_closed(format!("read failed: {}", e));
                break;
            }
        };
        let data = &buf[..n];
        shared.link.publish(ModemEvent::DataIn { data: data.to_vec() });

        let mode = shared.mode();
        if mode != last_mode {
            codec.clear();
            last_mode = mode;
        }

        match mode {
            MuxMode::At => {
                shared.direct.process_new_data(data);
            }
            MuxMode::Cmux => {
                codec.push_bytes(data);
                while let Some(frame) = codec.next_item() {
                    shared.route(frame).await;
                    // A close-down handled above switches back to AT
                    if shared.mode() != MuxMode::Cmux {
                        let rest = codec.pending().to_vec();
                        codec.clear();
                        last_mode = MuxMode::At;
                        if !rest.is_empty() {
                            shared.direct.process_new_data(&rest);
                        }
                        break;
                    }
                }
            }
        }
    }
    debug!("Receiver task ended");
}

/// GSM 07.10 multiplexer over one transport
///
/// Created in AT mode. Commands go through [`Multiplexer::at`], which uses
/// the raw link until [`start_multiplexer`](Multiplexer::start_multiplexer)
/// switches to CMUX and the command channel after that.
pub struct Multiplexer {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("mode", &self.shared.mode())
            .field("channels", &self.shared.all_channels().len())
            .finish()
    }
}

impl Multiplexer {
    /// Wrap a transport and start the receiver and writer tasks
    ///
    /// Must be called within a tokio runtime.
    pub fn new<T>(io: T, config: MuxConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        let (write_tx, write_rx) = mpsc::channel(config.write_queue.max(1));
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let link = Arc::new(Link::new(write_tx, config.frame, event_tx));
        let dispatcher = Arc::new(UrcDispatcher::new(link.clone()));
        let direct = Arc::new(DirectPort::new(link.clone(), dispatcher.clone(), &config.at));
        let shared = Arc::new(Shared {
            link: link.clone(),
            mode: Mutex::new(MuxMode::At),
            channels: RwLock::new(BTreeMap::new()),
            direct,
            dispatcher,
            config,
        });

        let tasks = vec![
            tokio::spawn(run_writer(writer, write_rx, Arc::downgrade(&link))),
            tokio::spawn(run_receiver(reader, shared.clone())),
        ];
        Self { shared, tasks }
    }

    /// Open a serial port and wrap it
    pub fn open_serial(port: &str, baud_rate: u32, config: MuxConfig) -> Result<Self, MuxError> {
        let stream = tokio_serial::new(port, baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()?;
        info!("Opened {} at {} baud", port, baud_rate);
        Ok(Self::new(stream, config))
    }

    /// Subscribe to stack events
    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.shared.link.subscribe()
    }

    /// Current line protocol
    pub fn mode(&self) -> MuxMode {
        self.shared.mode()
    }

    /// Multiplexer configuration
    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Whether the transport has closed
    pub fn is_closed(&self) -> bool {
        self.shared.link.is_closed()
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.shared.link
    }

    pub(crate) fn dispatcher(&self) -> &Arc<UrcDispatcher> {
        &self.shared.dispatcher
    }

    pub(crate) fn enter_cmux_mode(&self) {
        self.shared.enter_cmux_mode();
    }

    /// AT engine on the raw link
    pub fn direct_channel(&self) -> AtChannel {
        AtChannel::direct(
            self.shared.direct.clone(),
            self.shared.dispatcher.clone(),
            self.shared.config.at.clone(),
        )
    }

    /// AT engine on the command DLC, if it is open
    pub fn command_channel(&self) -> Option<AtChannel> {
        self.shared
            .all_channels()
            .into_iter()
            .find(|channel| channel.role() == ChannelRole::Commands && channel.is_open())
            .map(|channel| {
                AtChannel::muxed(
                    channel,
                    self.shared.dispatcher.clone(),
                    self.shared.config.at.clone(),
                )
            })
    }

    /// AT engine for the current mode
    pub fn at(&self) -> AtChannel {
        match self.mode() {
            MuxMode::Cmux => self.command_channel().unwrap_or_else(|| self.direct_channel()),
            MuxMode::At => self.direct_channel(),
        }
    }

    /// Channel registered for `dlci`
    pub fn channel(&self, dlci: u8) -> Option<Arc<LogicalChannel>> {
        self.shared.channel(dlci)
    }

    /// All registered channels, in DLCI order
    pub fn channels(&self) -> Vec<Arc<LogicalChannel>> {
        self.shared.all_channels()
    }

    /// Register a channel without establishing it
    ///
    /// Returns the existing channel when `dlci` is already registered.
    pub fn add_channel(&self, dlci: u8, role: ChannelRole) -> Result<Arc<LogicalChannel>, MuxError> {
        self.add_channel_with(dlci, role, self.shared.config.channel.clone())
    }

    /// Register a channel with explicit parameters
    pub fn add_channel_with(
        &self,
        dlci: u8,
        role: ChannelRole,
        params: ChannelParams,
    ) -> Result<Arc<LogicalChannel>, MuxError> {
        if dlci > MAX_DLCI {
            return Err(ProtocolError::InvalidDlci(dlci).into());
        }
        let mut channels = self
            .shared
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let channel = channels
            .entry(dlci)
            .or_insert_with(|| Arc::new(LogicalChannel::new(dlci, role, params, self.shared.link.clone())));
        Ok(channel.clone())
    }

    /// Register and establish a channel
    pub async fn open_channel(&self, dlci: u8, role: ChannelRole) -> Result<Arc<LogicalChannel>, MuxError> {
        let params = self.shared.config.channel.clone();
        self.open_channel_with(dlci, role, params).await
    }

    /// Register and establish a channel with explicit parameters
    pub async fn open_channel_with(
        &self,
        dlci: u8,
        role: ChannelRole,
        params: ChannelParams,
    ) -> Result<Arc<LogicalChannel>, MuxError> {
        if self.mode() != MuxMode::Cmux {
            return Err(MuxError::ChannelNotOpen(0));
        }
        let channel = self.add_channel_with(dlci, role, params)?;
        if channel.is_open() {
            return Ok(channel);
        }
        if channel.establish().await {
            Ok(channel)
        } else {
            Err(MuxError::EstablishmentFailed(dlci))
        }
    }

    /// Release a channel with DISC and unregister it
    pub async fn close_channel(&self, dlci: u8) -> Result<(), MuxError> {
        let channel = self.channel(dlci).ok_or(MuxError::ChannelNotFound(dlci))?;
        channel.release().await?;
        self.shared
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&dlci);
        Ok(())
    }

    /// Send a test command on DLCI 0 and wait for the peer to echo it
    pub async fn echo_test(&self, pattern: &[u8], timeout: Duration) -> Result<bool, MuxError> {
        let control = self.channel(0).ok_or(MuxError::ChannelNotFound(0))?;
        let mut waiter = control.acquire()?;
        let deadline = Instant::now() + timeout;

        self.shared
            .send_control(&ControlMessage::command(ControlType::Test, pattern))
            .await?;

        while let Some(frame) = waiter.pop_until(deadline).await {
            let Ok(messages) = ControlMessage::decode_all(&frame.payload) else {
                continue;
            };
            if messages
                .iter()
                .any(|m| m.kind == ControlType::Test && !m.command && m.values == pattern)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Leave CMUX mode with a close-down command
    ///
    /// The link is back in AT mode afterwards even if the peer never
    /// acknowledges.
    pub async fn close(&self) -> Result<(), MuxError> {
        if self.mode() != MuxMode::Cmux {
            return Ok(());
        }
        let ack_time = self.shared.config.channel.ack_time();

        let control = self.channel(0);
        let mut waiter = control.as_ref().and_then(|control| control.acquire().ok());
        self.shared.send_control(&ControlMessage::close_down()).await?;

        let mut acknowledged = false;
        if let Some(waiter) = waiter.as_mut() {
            let deadline = Instant::now() + ack_time;
            while let Some(frame) = waiter.pop_until(deadline).await {
                let Ok(messages) = ControlMessage::decode_all(&frame.payload) else {
                    continue;
                };
                if messages.iter().any(|m| m.kind == ControlType::CloseDown) {
                    acknowledged = true;
                    break;
                }
            }
        }
        drop(waiter);

        if !acknowledged {
            debug!("[MUX] close-down not acknowledged");
        }
        self.shared.enter_at_mode("close-down");
        Ok(())
    }

    /// Allow the next boot sequence to be reported again
    pub fn reset_boot_detection(&self) {
        self.shared.dispatcher.reset_boot_detection();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = MuxConfig::default();
        assert_eq!(config.channel.max_retransmissions, 3);
        assert_eq!(config.channel.ack_time(), Duration::from_millis(100));
        assert_eq!(config.at.default_timeout(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_starts_in_at_mode() {
        let (host, _peer) = tokio::io::duplex(256);
        let mux = Multiplexer::new(host, MuxConfig::default());
        assert_eq!(mux.mode(), MuxMode::At);
        assert!(mux.channels().is_empty());
        assert_eq!(mux.at().dlci(), None);
    }

    #[tokio::test]
    async fn test_add_channel_rejects_invalid_dlci() {
        let (host, _peer) = tokio::io::duplex(256);
        let mux = Multiplexer::new(host, MuxConfig::default());
        assert!(matches!(
            mux.add_channel(62, ChannelRole::Data),
            Err(MuxError::Protocol(ProtocolError::InvalidDlci(62)))
        ));

        let first = mux.add_channel(3, ChannelRole::Data).unwrap();
        let again = mux.add_channel(3, ChannelRole::Data).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }

    #[tokio::test]
    async fn test_open_channel_requires_cmux() {
        let (host, _peer) = tokio::io::duplex(256);
        let mux = Multiplexer::new(host, MuxConfig::default());
        assert!(mux.open_channel(1, ChannelRole::Commands).await.is_err());
    }

    async fn read_frame(peer: &mut tokio::io::DuplexStream, codec: &mut FrameCodec) -> Frame {
        let mut buf = [0u8; 64];
        loop {
            if let Some(frame) = codec.next_item() {
                return frame;
            }
            let n = tokio::time::timeout(Duration::from_secs(1), peer.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            codec.push_bytes(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn test_peer_disc_answer_depends_on_channel_state() {
        use tokio::io::AsyncWriteExt;

        let (host, mut peer) = tokio::io::duplex(256);
        let mux = Multiplexer::new(host, MuxConfig::default());
        mux.enter_cmux_mode();
        mux.add_channel(2, ChannelRole::Notifications).unwrap();
        let open = mux.add_channel(3, ChannelRole::Data).unwrap();
        open.set_state(ChannelState::Open);

        let mut codec = FrameCodec::new();
        for (dlci, expected) in [(5, FrameType::Dm), (2, FrameType::Dm), (3, FrameType::Ua)] {
            let disc = codec.encode(&Frame::new(dlci, FrameType::Disc, Vec::new())).unwrap();
            peer.write_all(&disc).await.unwrap();
            let reply = read_frame(&mut peer, &mut codec).await;
            assert_eq!(reply.dlci, dlci);
            assert_eq!(reply.frame_type, expected);
        }
        assert_eq!(open.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_eof_closes_link() {
        let (host, peer) = tokio::io::duplex(256);
        let mux = Multiplexer::new(host, MuxConfig::default());
        let mut events = mux.subscribe();
        drop(peer);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, ModemEvent::LinkClosed { .. }));
        assert!(mux.is_closed());
    }
}
