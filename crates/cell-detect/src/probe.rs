//! Baud-rate probing for modem detection
//!
//! A modem is present when `AT` is answered with `OK`. A modem left in
//! CMUX mode by an earlier session ignores plain text, so a failed attempt
//! is followed by the multiplexer close-down frame and one more try.

use std::time::Duration;

use cell_protocol::at::{format_command, AtStream};
use cell_protocol::{ControlMessage, FrameCodec, FrameType, ResultCode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::DetectError;

/// Baud rates tried by [`probe_port`], fastest first
pub const DEFAULT_BAUDS: &[u32] = &[460800, 115200];

/// Result of probing a serial port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Baud rate the modem answered at (`None` when probing a bare stream)
    pub baud_rate: Option<u32>,
    /// The modem had to be taken out of CMUX mode first
    pub was_multiplexed: bool,
    /// Identification lines from `ATI`
    pub identity: Vec<String>,
}

impl ProbeResult {
    /// Identification as one line
    pub fn identity_line(&self) -> String {
        self.identity.join(" ")
    }
}

/// Configuration for probing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Timeout for each command, in milliseconds
    pub timeout_ms: u64,
    /// Delay after the close-down frame, in milliseconds
    pub inter_probe_delay_ms: u64,
    /// Settle time after opening a port, in milliseconds
    pub settle_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            inter_probe_delay_ms: 100,
            settle_ms: 50,
        }
    }
}

impl ProbeConfig {
    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Modem prober
pub struct ModemProber {
    config: ProbeConfig,
}

impl ModemProber {
    /// Create a new prober with default configuration
    pub fn new() -> Self {
        Self {
            config: ProbeConfig::default(),
        }
    }

    /// Create a prober with custom configuration
    pub fn with_config(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Probe a stream for a modem
    pub async fn probe<S>(&self, stream: &mut S) -> Option<ProbeResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut was_multiplexed = false;
        if !self.try_at(stream).await {
            debug!("No answer to AT, sending CMUX close-down");
            if !self.send_close_down(stream).await {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(self.config.inter_probe_delay_ms)).await;
            if !self.try_at(stream).await {
                debug!("No modem detected");
                return None;
            }
            was_multiplexed = true;
        }

        let identity = match self.exchange(stream, "ATI").await {
            Some(result) if result.code == ResultCode::Ok => result
                .response
                .into_iter()
                .filter(|line| line != "OK")
                .collect(),
            _ => Vec::new(),
        };
        info!("Modem detected: {}", identity.join(" "));

        Some(ProbeResult {
            baud_rate: None,
            was_multiplexed,
            identity,
        })
    }

    async fn try_at<S>(&self, stream: &mut S) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        matches!(self.exchange(stream, "AT").await, Some(result) if result.code == ResultCode::Ok)
    }

    async fn send_close_down<S>(&self, stream: &mut S) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let frame = match FrameCodec::new().serialize(0, FrameType::Uih, &ControlMessage::close_down().encode()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Cannot build close-down frame: {}", e);
                return false;
            }
        };
        trace!("Sending close-down {:02X?}", frame);
        if let Err(e) = stream.write_all(&frame).await {
            warn!("Failed to write close-down frame: {}", e);
            return false;
        }
        true
    }

    /// Send one command and collect its response until a terminal line or timeout
    async fn exchange<S>(&self, stream: &mut S, cmd: &str) -> Option<cell_protocol::AtResult>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("Sending {} probe", cmd);
        if let Err(e) = stream.write_all(format_command(cmd).as_bytes()).await {
            warn!("Failed to write {} probe: {}", cmd, e);
            return None;
        }

        let deadline = Instant::now() + self.config.timeout();
        let mut response = AtStream::new(0);
        let mut buf = [0u8; 256];
        while !response.is_ready() {
            match timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => {
                    trace!("{} response: {:?}", cmd, String::from_utf8_lossy(&buf[..n]));
                    response.write(&String::from_utf8_lossy(&buf[..n]));
                }
                Ok(Ok(_)) => {
                    trace!("Stream closed during {} probe", cmd);
                    break;
                }
                Ok(Err(e)) => {
                    trace!("{} read error: {}", cmd, e);
                    break;
                }
                Err(_) => {
                    trace!("{} probe timeout", cmd);
                    break;
                }
            }
        }
        Some(response.into_result(ResultCode::Timeout))
    }
}

impl Default for ModemProber {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe a port at each of `bauds` until a modem answers
pub async fn probe_port(port_name: &str, bauds: &[u32], config: &ProbeConfig) -> Result<ProbeResult, DetectError> {
    use tokio_serial::SerialPortBuilderExt;

    for &baud_rate in bauds {
        debug!("Probing {} at {} baud", port_name, baud_rate);

        let mut stream = tokio_serial::new(port_name, baud_rate)
            .timeout(Duration::from_millis(100))
            .open_native_async()
            .map_err(|e| DetectError::OpenFailed {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        // Give the port a moment to settle
        tokio::time::sleep(Duration::from_millis(config.settle_ms)).await;

        let prober = ModemProber::with_config(config.clone());
        if let Some(result) = prober.probe(&mut stream).await {
            info!("Modem on {} at {} baud", port_name, baud_rate);
            return Ok(ProbeResult {
                baud_rate: Some(baud_rate),
                ..result
            });
        }
    }

    Err(DetectError::NoResponse {
        port: port_name.to_string(),
        bauds: bauds.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cell_protocol::ProtocolCodec;
    use tokio::io::DuplexStream;

    fn fast_config() -> ProbeConfig {
        ProbeConfig {
            timeout_ms: 100,
            inter_probe_delay_ms: 10,
            settle_ms: 0,
        }
    }

    /// Answers `AT` and `ATI`; stays silent until a close-down frame when `multiplexed`
    async fn fake_modem(mut io: DuplexStream, mut multiplexed: bool) {
        let mut codec = FrameCodec::new();
        let mut line = String::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = io.read(&mut buf).await {
            if n == 0 {
                break;
            }
            if multiplexed {
                codec.push_bytes(&buf[..n]);
                while let Some(frame) = codec.next_item() {
                    if frame.dlci == 0 && frame.payload.first() == Some(&0xC3) {
                        let ack = codec.serialize(0, FrameType::Uih, &[0xC1, 0x01]).unwrap();
                        io.write_all(&ack).await.unwrap();
                        multiplexed = false;
                    }
                }
                continue;
            }
            line.push_str(&String::from_utf8_lossy(&buf[..n]));
            while let Some(pos) = line.find('\r') {
                let cmd: String = line.drain(..=pos).collect();
                let reply: &[u8] = match cmd.trim() {
                    "ATI" => b"\r\nQuectel\r\nEC25\r\n\r\nOK\r\n",
                    _ => b"\r\nOK\r\n",
                };
                io.write_all(reply).await.unwrap();
            }
        }
    }

    #[test]
    fn test_probe_config_default() {
        let config = ProbeConfig::default();
        assert_eq!(config.timeout(), Duration::from_millis(500));
        assert_eq!(DEFAULT_BAUDS, &[460800, 115200]);
    }

    #[tokio::test]
    async fn test_probe_answering_modem() {
        let (mut host, modem) = tokio::io::duplex(1024);
        tokio::spawn(fake_modem(modem, false));

        let result = ModemProber::with_config(fast_config())
            .probe(&mut host)
            .await
            .unwrap();
        assert!(!result.was_multiplexed);
        assert_eq!(result.identity_line(), "Quectel EC25");
    }

    #[tokio::test]
    async fn test_probe_recovers_multiplexed_modem() {
        let (mut host, modem) = tokio::io::duplex(1024);
        tokio::spawn(fake_modem(modem, true));

        let result = ModemProber::with_config(fast_config())
            .probe(&mut host)
            .await
            .unwrap();
        assert!(result.was_multiplexed);
        assert_eq!(result.identity, vec!["Quectel".to_string(), "EC25".to_string()]);
    }

    #[tokio::test]
    async fn test_probe_silent_stream() {
        let (mut host, _modem) = tokio::io::duplex(1024);
        let result = ModemProber::with_config(fast_config()).probe(&mut host).await;
        assert!(result.is_none());
    }
}
