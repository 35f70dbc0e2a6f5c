//! Modem configuration and CMUX start-up
//!
//! [`configure`] puts a freshly booted modem into a known state over the
//! raw link. [`Multiplexer::start_multiplexer`] then switches the link to
//! GSM 07.10 and opens the standard channel set:
//!
//! | DLCI | Role          |
//! |------|---------------|
//! | 0    | Control       |
//! | 1    | Commands      |
//! | 2    | Notifications |
//! | 3    | Data          |

use std::sync::Arc;
use std::time::Duration;

use cell_protocol::registry::MODEM_INIT;
use cell_protocol::{AtCommand, ResultCode};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::at_channel::{AtChannel, UrcSplitter};
use crate::channel::{ChannelParams, ChannelRole, DataCallback};
use crate::error::MuxError;
use crate::multiplexer::{Multiplexer, MuxMode};

/// Serial speeds the CMUX command can announce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PortSpeed {
    /// 9600 baud
    B9600,
    /// 19200 baud
    B19200,
    /// 38400 baud
    B38400,
    /// 57600 baud
    B57600,
    /// 115200 baud
    #[default]
    B115200,
    /// 230400 baud
    B230400,
    /// 460800 baud
    B460800,
}

/// Baud rate and CMUX speed code for each [`PortSpeed`]
static PORT_SPEEDS: &[(PortSpeed, u32, u8)] = &[
    (PortSpeed::B9600, 9600, 1),
    (PortSpeed::B19200, 19200, 2),
    (PortSpeed::B38400, 38400, 3),
    (PortSpeed::B57600, 57600, 4),
    (PortSpeed::B115200, 115200, 5),
    (PortSpeed::B230400, 230400, 6),
    (PortSpeed::B460800, 460800, 7),
];

impl PortSpeed {
    fn entry(&self) -> (u32, u8) {
        PORT_SPEEDS
            .iter()
            .find(|(speed, _, _)| speed == self)
            .map(|(_, baud, code)| (*baud, *code))
            .unwrap_or((115200, 5))
    }

    /// Baud rate
    pub fn baud(&self) -> u32 {
        self.entry().0
    }

    /// Speed code used in `AT+CMUX`
    pub fn cmux_code(&self) -> u8 {
        self.entry().1
    }

    /// Speed for a baud rate, if it can be announced
    pub fn from_baud(baud: u32) -> Option<Self> {
        PORT_SPEEDS
            .iter()
            .find(|(_, b, _)| *b == baud)
            .map(|(speed, _, _)| *speed)
    }
}

/// Parameters of the `AT+CMUX` command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CmuxParams {
    pub port_speed: PortSpeed,
    /// N1
    pub max_frame_size: u16,
    /// T1, in units of 10 ms
    pub ack_timer: u8,
    /// N2
    pub max_retransmissions: u8,
    /// T2, in units of 10 ms
    pub max_ctrl_resp_time: u8,
    /// T3, in seconds
    pub wake_up_resp_time: u8,
    /// k
    pub window: u8,
}

impl Default for CmuxParams {
    fn default() -> Self {
        Self {
            port_speed: PortSpeed::default(),
            max_frame_size: 127,
            ack_timer: 10,
            max_retransmissions: 3,
            max_ctrl_resp_time: 30,
            wake_up_resp_time: 10,
            window: 2,
        }
    }
}

impl CmuxParams {
    /// Arguments after `AT+CMUX=`
    pub fn arguments(&self) -> String {
        format!(
            "0,0,{},{},{},{},{},{},{}",
            self.port_speed.cmux_code(),
            self.max_frame_size,
            self.ack_timer,
            self.max_retransmissions,
            self.max_ctrl_resp_time,
            self.wake_up_resp_time,
            self.window
        )
    }

    /// The full command line
    pub fn command(&self) -> String {
        format!("AT+CMUX={}", self.arguments())
    }

    /// Channel parameters matching what the command announces
    pub fn channel_params(&self, base: &ChannelParams) -> ChannelParams {
        ChannelParams {
            ack_time_ms: u64::from(self.ack_timer) * 10,
            max_frame_size: usize::from(self.max_frame_size),
            max_retransmissions: u32::from(self.max_retransmissions),
            window_size: self.window,
            ..base.clone()
        }
    }
}

/// Outcome of [`configure`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfState {
    /// Every step succeeded
    Success,
    /// A configuration command failed
    Failure,
    /// The modem never accepted sleep configuration
    ModemNeedsReset,
}

/// Settings for [`configure`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfOptions {
    /// Enable RTS/CTS flow control (`AT+IFC=2,2`) instead of disabling it
    pub hardware_flow_control: bool,
    /// Delay between sleep-mode attempts, in milliseconds
    pub sleep_retry_ms: u64,
    /// Give up on sleep mode after this long, in milliseconds
    pub sleep_timeout_ms: u64,
}

impl Default for ConfOptions {
    fn default() -> Self {
        Self {
            hardware_flow_control: false,
            sleep_retry_ms: 1000,
            sleep_timeout_ms: 30_000,
        }
    }
}

/// Configure a modem over `at`
///
/// Runs factory reset, echo off, flow control, identification, the
/// initialization set and finally enables sleep mode, retrying the last
/// step until `sleep_timeout_ms` has passed.
pub async fn configure(at: &AtChannel, options: &ConfOptions) -> Result<ConfState, MuxError> {
    let flow = if options.hardware_flow_control {
        AtCommand::FlowCtrlOn
    } else {
        AtCommand::FlowCtrlOff
    };
    for id in [AtCommand::FactoryReset, AtCommand::EchoOff, flow] {
        if !at.cmd_id(id).await?.is_ok() {
            error!("Modem configuration failed at {:?}", id);
            return Ok(ConfState::Failure);
        }
    }

    let info = at.cmd_id(AtCommand::SwInfo).await?;
    if info.is_ok() {
        let lines: Vec<&str> = info
            .response
            .iter()
            .map(String::as_str)
            .filter(|line| *line != "OK")
            .collect();
        info!("Modem: {}", lines.join(" "));
    }

    for &id in MODEM_INIT {
        if !at.cmd_id(id).await?.is_ok() {
            error!("Modem configuration failed at {:?}", id);
            return Ok(ConfState::Failure);
        }
    }

    let deadline = Instant::now() + Duration::from_millis(options.sleep_timeout_ms);
    loop {
        if at.cmd_id(AtCommand::QsclkOn).await?.is_ok() {
            info!("Modem configured");
            return Ok(ConfState::Success);
        }
        if Instant::now() + Duration::from_millis(options.sleep_retry_ms) > deadline {
            error!("Sleep mode not accepted, modem needs a reset");
            return Ok(ConfState::ModemNeedsReset);
        }
        tokio::time::sleep(Duration::from_millis(options.sleep_retry_ms)).await;
    }
}

impl Multiplexer {
    /// Switch the link to CMUX and open the standard channel set
    ///
    /// Does nothing when multiplexing is already active. If a channel
    /// cannot be established the link is closed down again.
    pub async fn start_multiplexer(&self, params: &CmuxParams) -> Result<(), MuxError> {
        if self.mode() == MuxMode::Cmux {
            return Ok(());
        }

        let result = self
            .direct_channel()
            .cmd_with(AtCommand::Cmux, &params.arguments())
            .await?;
        if result.code != ResultCode::Ok {
            return Err(MuxError::CommandFailed {
                command: params.command(),
                code: result.code,
            });
        }
        self.enter_cmux_mode();

        let channel_params = params.channel_params(&self.config().channel);
        for role in [
            ChannelRole::Control,
            ChannelRole::Commands,
            ChannelRole::Notifications,
            ChannelRole::Data,
        ] {
            let dlci = role.default_dlci();
            let channel = self.add_channel_with(dlci, role, channel_params.clone())?;
            if let Some(callback) = self.idle_callback(dlci, role) {
                channel.set_callback(callback);
            }
            if let Err(e) = self.open_channel_with(dlci, role, channel_params.clone()).await {
                error!("[MUX] {:?} channel failed: {}", role, e);
                if let Err(close) = self.close().await {
                    warn!("[MUX] close-down after failed start-up: {}", close);
                }
                return Err(e);
            }
        }

        if let Some(commands) = self.command_channel() {
            match commands.cmd_id(AtCommand::SetUrcChannel).await {
                Ok(result) if result.is_ok() => {}
                Ok(result) => warn!("[MUX] URC channel not selected: {}", result.code),
                Err(e) => warn!("[MUX] URC channel not selected: {}", e),
            }
        }
        info!("[MUX] multiplexer started");
        Ok(())
    }

    /// Handler for text arriving on a channel while no command waits
    fn idle_callback(&self, dlci: u8, role: ChannelRole) -> Option<DataCallback> {
        match role {
            ChannelRole::Commands | ChannelRole::Notifications => {
                let dispatcher = self.dispatcher().clone();
                let urcs = UrcSplitter::new(Some(dlci), self.link().clone());
                Some(Arc::new(move |data: &[u8]| {
                    urcs.feed(data);
                    dispatcher.process_idle_data(&String::from_utf8_lossy(data));
                }))
            }
            ChannelRole::Control | ChannelRole::Data => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmux_command() {
        assert_eq!(CmuxParams::default().command(), "AT+CMUX=0,0,5,127,10,3,30,10,2");

        let fast = CmuxParams {
            port_speed: PortSpeed::B460800,
            ..Default::default()
        };
        assert_eq!(fast.command(), "AT+CMUX=0,0,7,127,10,3,30,10,2");
    }

    #[test]
    fn test_port_speed_codes() {
        assert_eq!(PortSpeed::B9600.cmux_code(), 1);
        assert_eq!(PortSpeed::B230400.cmux_code(), 6);
        assert_eq!(PortSpeed::from_baud(57600), Some(PortSpeed::B57600));
        assert_eq!(PortSpeed::from_baud(1200), None);
        assert_eq!(PortSpeed::B460800.baud(), 460800);
    }

    #[test]
    fn test_channel_params_follow_command() {
        let params = CmuxParams {
            ack_timer: 25,
            ..Default::default()
        }
        .channel_params(&ChannelParams::default());
        assert_eq!(params.ack_time(), Duration::from_millis(250));
        assert_eq!(params.max_frame_size, 127);
        assert_eq!(params.max_retransmissions, 3);
    }
}
