//! Logical channels (DLCs)
//!
//! Each DLC has its own establishment state machine, response buffer and
//! flow-control state:
//!
//! ```text
//! Closed --SABM--> Establishing --UA--> Open
//!                  Establishing --retries exhausted--> Closed
//! Open --DISC/UA or peer DISC--> Closed
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use cell_protocol::at::{format_command, AtStream};
use cell_protocol::{AtResult, Frame, FrameType, ResultCode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::{ResponseBuffer, ResponseChunk, Waiter};
use crate::error::MuxError;
use crate::events::ModemEvent;
use crate::link::Link;

/// What a channel is used for, bound at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    /// DLCI 0: multiplexer control
    Control,
    /// AT commands and their responses
    Commands,
    /// URCs only, delivered through the callback
    Notifications,
    /// Packet data
    Data,
}

impl ChannelRole {
    /// DLCI conventionally assigned to the role
    pub fn default_dlci(&self) -> u8 {
        match self {
            ChannelRole::Control => 0,
            ChannelRole::Commands => 1,
            ChannelRole::Notifications => 2,
            ChannelRole::Data => 3,
        }
    }
}

/// Establishment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Not established (initial state, or after release/failure)
    Closed,
    /// SABM sent, waiting for UA
    Establishing,
    /// UA received
    Open,
}

/// DLC parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelParams {
    /// Time to wait for UA after each SABM/DISC, in milliseconds
    pub ack_time_ms: u64,
    /// Largest UIH payload sent on this channel
    pub max_frame_size: usize,
    /// SABM/DISC attempts before giving up
    pub max_retransmissions: u32,
    /// Error-recovery window (advertised only)
    pub window_size: u8,
    /// Frames held for a waiting task before the buffer reports full
    pub response_buffer: usize,
    /// How long `send_data` waits for the peer to allow sending, in milliseconds
    pub flow_control_wait_ms: u64,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            ack_time_ms: 100,
            max_frame_size: 128,
            max_retransmissions: 3,
            window_size: 2,
            response_buffer: 5,
            flow_control_wait_ms: 1000,
        }
    }
}

impl ChannelParams {
    /// Acknowledgement timeout
    pub fn ack_time(&self) -> Duration {
        Duration::from_millis(self.ack_time_ms)
    }

    /// Flow-control wait
    pub fn flow_control_wait(&self) -> Duration {
        Duration::from_millis(self.flow_control_wait_ms)
    }
}

/// Handler for data arriving while nobody waits on the channel
pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// One multiplexed channel
pub struct LogicalChannel {
    dlci: u8,
    role: ChannelRole,
    params: ChannelParams,
    state: Mutex<ChannelState>,
    buffer: ResponseBuffer<Frame>,
    sending_allowed: watch::Sender<bool>,
    callback: Mutex<Option<DataCallback>>,
    link: Arc<Link>,
}

impl std::fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalChannel")
            .field("dlci", &self.dlci)
            .field("role", &self.role)
            .field("state", &self.state())
            .finish()
    }
}

impl LogicalChannel {
    pub(crate) fn new(dlci: u8, role: ChannelRole, params: ChannelParams, link: Arc<Link>) -> Self {
        let buffer = ResponseBuffer::new(params.response_buffer);
        Self {
            dlci,
            role,
            params,
            state: Mutex::new(ChannelState::Closed),
            buffer,
            sending_allowed: watch::Sender::new(true),
            callback: Mutex::new(None),
            link,
        }
    }

    /// Channel id
    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    /// Channel role
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Channel parameters
    pub fn params(&self) -> &ChannelParams {
        &self.params
    }

    /// Current establishment state
    pub fn state(&self) -> ChannelState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the channel is established
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Whether the peer currently allows sending
    pub fn sending_allowed(&self) -> bool {
        *self.sending_allowed.borrow()
    }

    pub(crate) fn set_sending_allowed(&self, allowed: bool) {
        self.sending_allowed.send_replace(allowed);
    }

    /// Install the handler for data arriving while nobody waits
    pub fn set_callback(&self, callback: DataCallback) {
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    /// Take the waiter slot or report the channel busy
    pub(crate) fn acquire(&self) -> Result<Waiter<'_, Frame>, MuxError> {
        self.buffer.acquire().ok_or(MuxError::ChannelBusy(self.dlci))
    }

    /// Establish the channel with SABM/UA
    ///
    /// Sends SABM up to `max_retransmissions` times, waiting `ack_time` for
    /// a UA on this DLCI after each one. On failure the channel is left
    /// Closed and may be retried.
    pub async fn establish(&self) -> bool {
        let mut waiter = match self.acquire() {
            Ok(waiter) => waiter,
            Err(e) => {
                warn!("[DLC {}] cannot establish: {}", self.dlci, e);
                return false;
            }
        };
        self.set_state(ChannelState::Establishing);

        for attempt in 1..=self.params.max_retransmissions {
            debug!("[DLC {}] SABM attempt {}/{}", self.dlci, attempt, self.params.max_retransmissions);
            if let Err(e) = self.link.send_frame(&Frame::new(self.dlci, FrameType::Sabm, Vec::new())).await {
                warn!("[DLC {}] SABM not sent: {}", self.dlci, e);
                break;
            }

            let deadline = Instant::now() + self.params.ack_time();
            while let Some(frame) = waiter.pop_until(deadline).await {
                match frame.frame_type {
                    FrameType::Ua if frame.is_for(self.dlci) => {
                        self.set_state(ChannelState::Open);
                        info!("[DLC {}] {:?} channel open", self.dlci, self.role);
                        self.link.publish(ModemEvent::ChannelOpened {
                            dlci: self.dlci,
                            role: self.role,
                        });
                        return true;
                    }
                    FrameType::Dm => {
                        debug!("[DLC {}] peer refused with DM", self.dlci);
                        break;
                    }
                    other => debug!("[DLC {}] ignoring {} while establishing", self.dlci, other.name()),
                }
            }
        }

        self.set_state(ChannelState::Closed);
        warn!("[DLC {}] establishment failed", self.dlci);
        false
    }

    /// Release the channel with DISC
    ///
    /// Waits for UA or DM (bounded by the retry budget); the channel is
    /// Closed afterwards either way.
    pub async fn release(&self) -> Result<(), MuxError> {
        let mut waiter = self.acquire()?;
        let result = self.disconnect(&mut waiter).await;

        self.set_state(ChannelState::Closed);
        self.link.publish(ModemEvent::ChannelClosed { dlci: self.dlci });
        result
    }

    async fn disconnect(&self, waiter: &mut Waiter<'_, Frame>) -> Result<(), MuxError> {
        for _ in 0..self.params.max_retransmissions.max(1) {
            self.link.send_frame(&Frame::new(self.dlci, FrameType::Disc, Vec::new())).await?;
            let deadline = Instant::now() + self.params.ack_time();
            while let Some(frame) = waiter.pop_until(deadline).await {
                if matches!(frame.frame_type, FrameType::Ua | FrameType::Dm) {
                    return Ok(());
                }
            }
        }
        debug!("[DLC {}] no answer to DISC", self.dlci);
        Ok(())
    }

    /// Send data as UIH frames no larger than `max_frame_size`
    ///
    /// Waits up to `flow_control_wait` for the peer to allow sending.
    pub async fn send_data(&self, data: &[u8]) -> Result<(), MuxError> {
        self.send_data_until(data, Instant::now() + self.params.flow_control_wait())
            .await
    }

    async fn send_data_until(&self, data: &[u8], flow_deadline: Instant) -> Result<(), MuxError> {
        if !self.is_open() {
            return Err(MuxError::ChannelNotOpen(self.dlci));
        }
        self.wait_for_flow_control(flow_deadline).await?;
        for chunk in data.chunks(self.params.max_frame_size.max(1)) {
            self.link.send_frame(&Frame::new(self.dlci, FrameType::Uih, chunk)).await?;
        }
        Ok(())
    }

    async fn wait_for_flow_control(&self, deadline: Instant) -> Result<(), MuxError> {
        if self.sending_allowed() {
            return Ok(());
        }
        debug!("[DLC {}] waiting for the peer to allow sending", self.dlci);
        let mut rx = self.sending_allowed.subscribe();
        let result = match tokio::time::timeout_at(deadline, rx.wait_for(|allowed| *allowed)).await {
            Ok(Ok(_)) => Ok(()),
            _ => Err(MuxError::FlowControlled(self.dlci)),
        };
        result
    }

    /// Send a command and collect its response
    ///
    /// Resolves on a terminal line, `expected_tokens` lines (when
    /// non-zero), or the timeout.
    pub async fn cmd(&self, cmd: &str, timeout: Duration, expected_tokens: usize) -> Result<AtResult, MuxError> {
        self.exchange(cmd, timeout, AtStream::new(expected_tokens)).await
    }

    /// Send a command that may be answered with the `>` data prompt
    pub async fn send_command_prompt(
        &self,
        cmd: &str,
        expected_tokens: usize,
        timeout: Duration,
    ) -> Result<AtResult, MuxError> {
        self.exchange(cmd, timeout, AtStream::with_prompt(expected_tokens)).await
    }

    pub(crate) async fn exchange(&self, cmd: &str, timeout: Duration, stream: AtStream) -> Result<AtResult, MuxError> {
        if !self.is_open() {
            return Err(MuxError::ChannelNotOpen(self.dlci));
        }
        let mut waiter = self.acquire()?;
        let deadline = Instant::now() + timeout;

        if self.link.is_closed() {
            return Ok(AtResult::new(ResultCode::CmuxFrameError));
        }
        // Neither the flow-control wait nor a full write queue may outlast the command
        let flow_deadline = deadline.min(Instant::now() + self.params.flow_control_wait());
        let bytes = format_command(cmd);
        match tokio::time::timeout_at(deadline, self.send_data_until(bytes.as_bytes(), flow_deadline)).await {
            Ok(Ok(())) => {}
            Ok(Err(MuxError::LinkClosed)) => return Ok(AtResult::new(ResultCode::CmuxFrameError)),
            Ok(Err(MuxError::FlowControlled(_))) | Err(_) => {
                return Ok(AtResult::new(ResultCode::TransmissionNotStarted))
            }
            Ok(Err(e)) => return Err(e),
        }

        Ok(collect_response(&mut waiter, stream, deadline).await)
    }

    /// Route a received frame: to the waiter if present, else to the callback
    pub(crate) fn parse_input_data(&self, frame: Frame) -> ResultCode {
        if self.buffer.is_awaiting() {
            return match self.buffer.try_push(frame) {
                Ok(()) => ResultCode::Ok,
                Err(_) => {
                    warn!("[DLC {}] response buffer full, frame dropped", self.dlci);
                    ResultCode::FullMsgBuffer
                }
            };
        }

        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) if !frame.payload.is_empty() => {
                callback(&frame.payload);
                ResultCode::Ok
            }
            _ => {
                debug!(
                    "[DLC {}] unsolicited {} dropped",
                    self.dlci,
                    frame.frame_type.name()
                );
                ResultCode::DataNotUsed
            }
        }
    }
}

/// Feed chunks from a waiter into an [`AtStream`] until it resolves or the deadline passes
///
/// Each wait is capped by the remaining budget and the deadline is
/// re-checked before every pop.
pub(crate) async fn collect_response<T: ResponseChunk>(
    waiter: &mut Waiter<'_, T>,
    mut stream: AtStream,
    deadline: Instant,
) -> AtResult {
    while Instant::now() < deadline {
        let Some(chunk) = waiter.pop_until(deadline).await else {
            break;
        };
        stream.write(&chunk.text());
        if stream.is_ready() {
            break;
        }
    }
    stream.into_result(ResultCode::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_protocol::{FrameConfig, ProtocolCodec};
    use tokio::sync::{broadcast, mpsc};

    fn test_channel(dlci: u8) -> (Arc<LogicalChannel>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(16);
        let (events, _) = broadcast::channel(16);
        let link = Arc::new(Link::new(tx, FrameConfig::default(), events));
        let channel = Arc::new(LogicalChannel::new(
            dlci,
            ChannelRole::Commands,
            ChannelParams {
                ack_time_ms: 20,
                ..Default::default()
            },
            link,
        ));
        (channel, rx)
    }

    fn decode(bytes: &[u8]) -> Frame {
        let mut codec = cell_protocol::FrameCodec::new();
        codec.push_bytes(bytes);
        codec.next_item().unwrap()
    }

    #[tokio::test]
    async fn test_establish_retries_then_fails() {
        let (channel, mut rx) = test_channel(1);
        assert!(!channel.establish().await);
        assert_eq!(channel.state(), ChannelState::Closed);

        let mut sabm_count = 0;
        while let Ok(bytes) = rx.try_recv() {
            assert_eq!(decode(&bytes).frame_type, FrameType::Sabm);
            sabm_count += 1;
        }
        assert_eq!(sabm_count, 3);
    }

    #[tokio::test]
    async fn test_establish_accepts_matching_ua() {
        let (channel, mut rx) = test_channel(1);
        let peer = {
            let channel = channel.clone();
            tokio::spawn(async move {
                let sabm = decode(&rx.recv().await.unwrap());
                // Wrong DLCI first; must be ignored
                channel.parse_input_data(Frame::response(2, FrameType::Ua, Vec::new()));
                channel.parse_input_data(Frame::response(sabm.dlci, FrameType::Ua, Vec::new()));
            })
        };
        assert!(channel.establish().await);
        assert!(channel.is_open());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsolicited_data_goes_to_callback() {
        let (channel, _rx) = test_channel(2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.set_callback(Arc::new(move |data: &[u8]| {
            sink.lock().unwrap().extend_from_slice(data);
        }));

        let code = channel.parse_input_data(Frame::new(2, FrameType::Uih, b"RING".to_vec()));
        assert_eq!(code, ResultCode::Ok);
        assert_eq!(seen.lock().unwrap().as_slice(), b"RING");
    }

    #[tokio::test]
    async fn test_unsolicited_without_callback_is_unused() {
        let (channel, _rx) = test_channel(3);
        let code = channel.parse_input_data(Frame::new(3, FrameType::Uih, b"x".to_vec()));
        assert_eq!(code, ResultCode::DataNotUsed);
    }

    #[tokio::test]
    async fn test_cmd_requires_open_channel() {
        let (channel, _rx) = test_channel(1);
        let err = channel.cmd("AT", Duration::from_millis(10), 0).await.unwrap_err();
        assert!(matches!(err, MuxError::ChannelNotOpen(1)));
    }

    #[tokio::test]
    async fn test_send_data_splits_frames() {
        let (channel, mut rx) = test_channel(3);
        channel.set_state(ChannelState::Open);
        channel.send_data(&[0x55; 300]).await.unwrap();

        let sizes: Vec<usize> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|bytes| decode(&bytes).payload.len())
            .collect();
        assert_eq!(sizes, vec![128, 128, 44]);
    }

    #[tokio::test]
    async fn test_send_data_waits_for_flow_control() {
        let (channel, _rx) = test_channel(1);
        channel.set_state(ChannelState::Open);
        channel.set_sending_allowed(false);

        let err = tokio::time::timeout(Duration::from_secs(2), channel.send_data(b"AT\r"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, MuxError::FlowControlled(1)));

        let channel2 = channel.clone();
        let pending = tokio::spawn(async move { channel2.send_data(b"AT\r").await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.set_sending_allowed(true);
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_flow_controlled_command_keeps_its_timeout() {
        let (channel, _rx) = test_channel(1);
        channel.set_state(ChannelState::Open);
        channel.set_sending_allowed(false);

        let started = Instant::now();
        let result = channel.cmd("AT+CFUN=1", Duration::from_millis(50), 0).await.unwrap();
        assert_eq!(result.code, ResultCode::TransmissionNotStarted);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_concurrent_command_is_busy() {
        let (channel, _rx) = test_channel(1);
        channel.set_state(ChannelState::Open);
        let _held = channel.acquire().unwrap();
        let err = channel.cmd("AT", Duration::from_millis(10), 0).await.unwrap_err();
        assert!(matches!(err, MuxError::ChannelBusy(1)));
    }
}
