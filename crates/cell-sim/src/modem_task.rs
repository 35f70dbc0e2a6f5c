//! Virtual modem actor task
//!
//! This module provides a pure async task that owns a VirtualModem and talks
//! to the host over an async stream. The task uses a select! loop to:
//! - Read bytes from the host and feed them to the modem
//! - Inject URCs and handle shutdown from a command channel
//! - Emit observations via a broadcast channel

use std::io;
use std::time::Duration;

use cell_protocol::ModemStatus;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{VirtualModem, VirtualModemEvent};

/// Commands that can be sent to a virtual modem actor
#[derive(Debug, Clone)]
pub enum VirtualModemCommand {
    /// Emit an unsolicited line
    InjectUrc(String),
    /// Emit the power-up sequence
    Boot,
    /// Answer a command with the given lines from now on
    SetReply { command: String, lines: Vec<String> },
    /// Send an MSC command announcing DLC signals
    SendModemStatus { dlci: u8, signals: u8 },
    /// Release a DLC from the modem side
    Disconnect(u8),
    /// Delay before each reply (simulates a slow modem)
    SetLatency(Duration),
    /// Shutdown the virtual modem actor
    Shutdown,
}

/// Run the virtual modem actor task
///
/// This task owns the VirtualModem and processes:
/// 1. Bytes written by the host (AT text or CMUX frames)
/// 2. Commands from the command channel
///
/// Observations are emitted via the broadcast channel for tests and UI.
pub async fn run_virtual_modem_task<S>(
    mut stream: S,
    mut modem: VirtualModem,
    mut cmd_rx: mpsc::Receiver<VirtualModemCommand>,
    event_tx: broadcast::Sender<VirtualModemEvent>,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 1024];
    let mut latency = Duration::ZERO;

    info!("Starting virtual modem task for {}", modem.id());

    loop {
        tokio::select! {
            result = stream.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        debug!("Virtual modem stream closed for {}", modem.id());
                        break;
                    }
                    Ok(n) => {
                        debug!("Virtual modem {} received {} bytes: {:02X?}", modem.id(), n, &buf[..n]);
                        modem.process_bytes(&buf[..n]);
                        if !latency.is_zero() && modem.has_output() {
                            tokio::time::sleep(latency).await;
                        }
                    }
                    Err(e) => {
                        warn!("Virtual modem {} stream error: {}", modem.id(), e);
                        return Err(e);
                    }
                }
            }

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(VirtualModemCommand::InjectUrc(line)) => modem.inject_urc(&line),
                    Some(VirtualModemCommand::Boot) => modem.boot(),
                    Some(VirtualModemCommand::SetReply { command, lines }) => {
                        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
                        modem.set_reply(command, &lines);
                    }
                    Some(VirtualModemCommand::SendModemStatus { dlci, signals }) => {
                        modem.send_modem_status(ModemStatus { dlci, signals });
                    }
                    Some(VirtualModemCommand::Disconnect(dlci)) => modem.disconnect(dlci),
                    Some(VirtualModemCommand::SetLatency(delay)) => latency = delay,
                    Some(VirtualModemCommand::Shutdown) => {
                        info!("Shutdown requested for virtual modem {}", modem.id());
                        break;
                    }
                    None => {
                        debug!("Command channel closed for virtual modem {}", modem.id());
                        break;
                    }
                }
            }
        }

        while let Some(bytes) = modem.take_output() {
            stream.write_all(&bytes).await?;
        }
        stream.flush().await?;

        while let Some(event) = modem.take_event() {
            let _ = event_tx.send(event);
        }
    }

    info!("Virtual modem task ended for {}", modem.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ModemMode;
    use cell_protocol::{FrameCodec, FrameType, ProtocolCodec};

    async fn read_some(stream: &mut tokio::io::DuplexStream) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let n = tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn test_virtual_modem_answers_at() {
        let (mut host, modem_stream) = tokio::io::duplex(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, mut event_rx) = broadcast::channel(32);

        let task = tokio::spawn(run_virtual_modem_task(
            modem_stream,
            VirtualModem::new("Test"),
            cmd_rx,
            event_tx,
        ));

        host.write_all(b"AT+CSQ\r").await.unwrap();
        assert_eq!(read_some(&mut host).await, b"\r\n+CSQ: 21,99\r\n\r\nOK\r\n");

        let event = event_rx.recv().await.unwrap();
        assert_eq!(
            event,
            VirtualModemEvent::CommandReceived {
                dlci: None,
                command: "AT+CSQ".into()
            }
        );

        drop(cmd_tx);
        drop(host);
        let _ = task.await;
    }

    #[tokio::test]
    async fn test_virtual_modem_boot_urcs() {
        let (mut host, modem_stream) = tokio::io::duplex(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, _event_rx) = broadcast::channel(32);

        let task = tokio::spawn(run_virtual_modem_task(
            modem_stream,
            VirtualModem::new("Test"),
            cmd_rx,
            event_tx,
        ));

        cmd_tx.send(VirtualModemCommand::Boot).await.unwrap();
        let text = String::from_utf8(read_some(&mut host).await).unwrap();
        assert!(text.starts_with("\r\nRDY\r\n\r\n+CFUN: 1\r\n"));

        cmd_tx.send(VirtualModemCommand::Shutdown).await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_virtual_modem_enters_cmux() {
        let (mut host, modem_stream) = tokio::io::duplex(1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (event_tx, mut event_rx) = broadcast::channel(32);

        let task = tokio::spawn(run_virtual_modem_task(
            modem_stream,
            VirtualModem::new("Test"),
            cmd_rx,
            event_tx,
        ));

        host.write_all(b"AT+CMUX=0,0,5,127,10,3,30,10,2\r").await.unwrap();
        assert_eq!(read_some(&mut host).await, b"\r\nOK\r\n");

        let mut codec = FrameCodec::new();
        host.write_all(&codec.serialize(0, FrameType::Sabm, &[]).unwrap())
            .await
            .unwrap();
        codec.push_bytes(&read_some(&mut host).await);
        let ua = codec.next_item().unwrap();
        assert_eq!(ua.frame_type, FrameType::Ua);
        assert_eq!(ua.dlci, 0);

        let mut saw_mode_change = false;
        while let Ok(event) = event_rx.try_recv() {
            if event == VirtualModemEvent::ModeChanged(ModemMode::Cmux) {
                saw_mode_change = true;
            }
        }
        assert!(saw_mode_change);

        drop(cmd_tx);
        drop(host);
        let _ = task.await;
    }
}
