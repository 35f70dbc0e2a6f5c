//! Integration tests for the cellular multiplexer
//!
//! These tests run the multiplexer against the virtual modem over an
//! in-memory duplex stream and verify:
//! - AT command exchanges on the raw link (results, timeouts, prompts)
//! - Boot detection and its one-shot latch
//! - CMUX start-up, channel establishment and retries
//! - Control channel handling (MSC flow control, peer DISC, close-down)
//! - URC delivery on the notification channel

use std::time::Duration;

use cell_mux::{
    configure, ChannelRole, ChannelState, CmuxParams, ConfOptions, ConfState, ModemEvent,
    Multiplexer, MuxConfig, MuxError, MuxMode,
};
use cell_protocol::control::signals;
use cell_protocol::{FrameType, ResultCode, UrcKind};
use cell_sim::{run_virtual_modem_task, VirtualModem, VirtualModemCommand, VirtualModemEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub struct Harness {
        pub mux: Multiplexer,
        pub modem: mpsc::Sender<VirtualModemCommand>,
        pub modem_events: broadcast::Receiver<VirtualModemEvent>,
        pub events: broadcast::Receiver<ModemEvent>,
    }

    /// Connect a multiplexer to a virtual modem
    pub fn connect(modem: VirtualModem) -> Harness {
        let (host, modem_io) = tokio::io::duplex(4096);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (sim_tx, sim_rx) = broadcast::channel(512);
        tokio::spawn(run_virtual_modem_task(modem_io, modem, cmd_rx, sim_tx));

        let mux = Multiplexer::new(host, MuxConfig::default());
        let events = mux.subscribe();
        Harness {
            mux,
            modem: cmd_tx,
            modem_events: sim_rx,
            events,
        }
    }

    /// Connect and switch to CMUX with the standard channels
    pub async fn connect_muxed(modem: VirtualModem) -> Harness {
        let harness = connect(modem);
        harness
            .mux
            .start_multiplexer(&CmuxParams::default())
            .await
            .unwrap();
        harness
    }

    /// Wait for the first event matching `pred`, skipping everything else
    pub async fn wait_for<F>(
        events: &mut broadcast::Receiver<ModemEvent>,
        timeout: Duration,
        pred: F,
    ) -> Option<ModemEvent>
    where
        F: Fn(&ModemEvent) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) if pred(&event) => return Some(event),
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    /// Count matching events that arrive within `window`
    pub async fn count_events<F>(
        events: &mut broadcast::Receiver<ModemEvent>,
        window: Duration,
        pred: F,
    ) -> usize
    where
        F: Fn(&ModemEvent) -> bool,
    {
        let mut count = 0;
        while wait_for(events, window, &pred).await.is_some() {
            count += 1;
        }
        count
    }

    /// Drain virtual modem observations collected so far
    pub fn modem_observations(rx: &mut broadcast::Receiver<VirtualModemEvent>) -> Vec<VirtualModemEvent> {
        let mut seen = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => seen.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        seen
    }
}

use helpers::*;

const CMD_TIMEOUT: Duration = Duration::from_millis(300);

// ============================================================================
// AT Commands on the Raw Link
// ============================================================================

#[tokio::test]
async fn test_command_on_raw_link() {
    let h = connect(VirtualModem::new("Test"));

    let result = h.mux.at().cmd("AT+CSQ", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(
        result.tokens_for("+CSQ:"),
        Some(vec!["21".to_string(), "99".to_string()])
    );
}

#[tokio::test]
async fn test_silent_command_times_out_then_link_recovers() {
    let mut modem = VirtualModem::new("Test");
    modem.set_silent("AT+CFUN");
    let h = connect(modem);
    let at = h.mux.at();

    let start = Instant::now();
    let result = at.cmd("AT+CFUN=1", Duration::from_millis(50), 0).await.unwrap();
    let elapsed = start.elapsed();
    assert_eq!(result.code, ResultCode::Timeout);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));

    let result = at.cmd("AT", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);
}

#[tokio::test]
async fn test_cme_error_result() {
    let mut modem = VirtualModem::new("Test");
    modem.set_reply("AT+COPS?", &["+CME ERROR: 10"]);
    let h = connect(modem);

    let result = h.mux.at().cmd("AT+COPS?", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::CmeError(10));
    assert_eq!(result.line_for("+COPS:"), None);
}

#[tokio::test]
async fn test_expected_token_count_resolves_early() {
    let h = connect(VirtualModem::new("Test"));

    let result = h.mux.at().cmd("AT+GSN", CMD_TIMEOUT, 1).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.response, vec!["867698040000000".to_string()]);
}

#[tokio::test]
async fn test_prompt_and_message_body() {
    let h = connect(VirtualModem::new("Test"));
    let at = h.mux.at();

    let result = at
        .send_command_prompt("AT+CMGS=\"+48123456789\"", 0, CMD_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.last_line(), Some(">"));

    let result = at.send_message_body("hello", Duration::from_secs(1)).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);
    assert_eq!(result.line_for("+CMGS:"), Some("1"));
}

#[tokio::test]
async fn test_concurrent_command_is_rejected() {
    let mut modem = VirtualModem::new("Test");
    modem.set_silent("AT+CFUN");
    let h = connect(modem);
    let at = h.mux.at();

    let (first, second) = tokio::join!(at.cmd("AT+CFUN=1", Duration::from_millis(200), 0), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        at.cmd("AT", CMD_TIMEOUT, 0).await
    });
    assert_eq!(first.unwrap().code, ResultCode::Timeout);
    assert!(matches!(second, Err(MuxError::PortBusy)));
}

#[tokio::test]
async fn test_registry_command() {
    let h = connect(VirtualModem::new("Test"));

    let result = h.mux.at().cmd_id(cell_protocol::AtCommand::SwInfo).await.unwrap();
    assert!(result.is_ok());
    assert_eq!(result.response.first().map(String::as_str), Some("Quectel"));
}

#[tokio::test]
async fn test_configure_runs_setup_sequence() {
    let mut h = connect(VirtualModem::new("Test"));

    let state = configure(&h.mux.direct_channel(), &ConfOptions::default()).await.unwrap();
    assert_eq!(state, ConfState::Success);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let commands: Vec<String> = modem_observations(&mut h.modem_events)
        .into_iter()
        .filter_map(|event| match event {
            VirtualModemEvent::CommandReceived { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    assert_eq!(commands.first().map(String::as_str), Some("AT&F"));
    assert!(commands.iter().any(|c| c == "AT+IFC=0,0"));
    assert_eq!(commands.last().map(String::as_str), Some("AT+QSCLK=1"));
}

#[tokio::test]
async fn test_configure_reports_failed_step() {
    let mut modem = VirtualModem::new("Test");
    modem.set_reply("AT+IFC=0,0", &["ERROR"]);
    let h = connect(modem);

    let state = configure(&h.mux.direct_channel(), &ConfOptions::default()).await.unwrap();
    assert_eq!(state, ConfState::Failure);
}

#[tokio::test]
async fn test_configure_gives_up_on_sleep_mode() {
    let mut modem = VirtualModem::new("Test");
    modem.set_reply("AT+QSCLK=1", &["ERROR"]);
    let h = connect(modem);

    let options = ConfOptions {
        sleep_retry_ms: 20,
        sleep_timeout_ms: 100,
        ..Default::default()
    };
    let state = configure(&h.mux.direct_channel(), &options).await.unwrap();
    assert_eq!(state, ConfState::ModemNeedsReset);
}

// ============================================================================
// Boot Detection
// ============================================================================

#[tokio::test]
async fn test_power_up_reported_once() {
    let mut h = connect(VirtualModem::new("Test"));

    h.modem.send(VirtualModemCommand::Boot).await.unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::PowerUpComplete)
    })
    .await;
    assert!(event.is_some());

    h.modem.send(VirtualModemCommand::Boot).await.unwrap();
    let repeats = count_events(&mut h.events, Duration::from_millis(200), |e| {
        matches!(e, ModemEvent::PowerUpComplete)
    })
    .await;
    assert_eq!(repeats, 0);

    h.mux.reset_boot_detection();
    h.modem.send(VirtualModemCommand::Boot).await.unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::PowerUpComplete)
    })
    .await;
    assert!(event.is_some());
}

#[tokio::test]
async fn test_firmware_update_progress_forwarded() {
    let mut h = connect(VirtualModem::new("Test"));

    h.modem
        .send(VirtualModemCommand::InjectUrc("+QIND: \"FOTA\",\"UPDATING\",50".into()))
        .await
        .unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::FirmwareUpdateProgress { .. })
    })
    .await;
    match event {
        Some(ModemEvent::FirmwareUpdateProgress { raw }) => assert!(raw.contains("UPDATING")),
        other => panic!("expected firmware update progress, got {:?}", other),
    }
}

// ============================================================================
// CMUX Start-up and Channels
// ============================================================================

#[tokio::test]
async fn test_start_multiplexer_opens_standard_channels() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    assert_eq!(h.mux.mode(), MuxMode::Cmux);
    for (dlci, role) in [
        (0, ChannelRole::Control),
        (1, ChannelRole::Commands),
        (2, ChannelRole::Notifications),
        (3, ChannelRole::Data),
    ] {
        let channel = h.mux.channel(dlci).unwrap();
        assert_eq!(channel.role(), role);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    let at = h.mux.at();
    assert_eq!(at.dlci(), Some(1));
    let result = at.cmd("AT+CSQ", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = modem_observations(&mut h.modem_events);
    assert!(seen.contains(&VirtualModemEvent::CommandReceived {
        dlci: Some(1),
        command: "AT+QCFG=\"cmux/urcport\",2".into(),
    }));
    assert!(seen.contains(&VirtualModemEvent::CommandReceived {
        dlci: Some(1),
        command: "AT+CSQ".into(),
    }));
}

#[tokio::test]
async fn test_urc_on_notification_channel() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    h.modem
        .send(VirtualModemCommand::InjectUrc("+CREG: 1,\"0A1B\"".into()))
        .await
        .unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::Urc { .. })
    })
    .await;
    match event {
        Some(ModemEvent::Urc { dlci, urc }) => {
            assert_eq!(dlci, Some(2));
            assert_eq!(urc.kind, UrcKind::Registration);
            assert_eq!(urc.tokens, vec!["1".to_string(), "0A1B".to_string()]);
        }
        other => panic!("expected URC, got {:?}", other),
    }
}

#[tokio::test]
async fn test_power_up_detected_while_multiplexed() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    h.modem.send(VirtualModemCommand::Boot).await.unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::PowerUpComplete)
    })
    .await;
    assert!(event.is_some());
}

#[tokio::test]
async fn test_unresponsive_dlci_gets_three_sabms() {
    let mut modem = VirtualModem::new("Test");
    modem.set_unresponsive(3);
    let mut h = connect(modem);

    let err = h
        .mux
        .start_multiplexer(&CmuxParams::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MuxError::EstablishmentFailed(3)));
    assert_eq!(h.mux.mode(), MuxMode::At);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sabms = modem_observations(&mut h.modem_events)
        .into_iter()
        .filter(|e| {
            *e == VirtualModemEvent::FrameReceived {
                dlci: 3,
                frame_type: FrameType::Sabm,
            }
        })
        .count();
    assert_eq!(sabms, 3);
}

#[tokio::test]
async fn test_failed_establishment_leaves_channel_closed() {
    let mut modem = VirtualModem::new("Test");
    modem.set_unresponsive(5);
    let h = connect_muxed(modem).await;

    let err = h.mux.open_channel(5, ChannelRole::Data).await.unwrap_err();
    assert!(matches!(err, MuxError::EstablishmentFailed(5)));
    assert_eq!(h.mux.channel(5).unwrap().state(), ChannelState::Closed);
    assert_eq!(h.mux.mode(), MuxMode::Cmux);
}

#[tokio::test]
async fn test_echo_test_on_control_channel() {
    let h = connect_muxed(VirtualModem::new("Test")).await;

    let echoed = h
        .mux
        .echo_test(b"ping", Duration::from_millis(500))
        .await
        .unwrap();
    assert!(echoed);
}

// ============================================================================
// Control Channel Handling
// ============================================================================

#[tokio::test]
async fn test_modem_status_flow_control() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    h.modem
        .send(VirtualModemCommand::SendModemStatus {
            dlci: 1,
            signals: signals::RTC | signals::FC,
        })
        .await
        .unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(
            e,
            ModemEvent::FlowControl {
                dlci: 1,
                sending_allowed: false
            }
        )
    })
    .await;
    assert!(event.is_some());
    assert!(!h.mux.channel(1).unwrap().sending_allowed());

    let result = h.mux.at().cmd("AT", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::TransmissionNotStarted);

    h.modem
        .send(VirtualModemCommand::SendModemStatus {
            dlci: 1,
            signals: signals::RTC | signals::RTR,
        })
        .await
        .unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(
            e,
            ModemEvent::FlowControl {
                dlci: 1,
                sending_allowed: true
            }
        )
    })
    .await;
    assert!(event.is_some());

    let result = h.mux.at().cmd("AT", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);
}

#[tokio::test]
async fn test_peer_disconnect() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    h.modem.send(VirtualModemCommand::Disconnect(3)).await.unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::ChannelClosed { dlci: 3 })
    })
    .await;
    assert!(event.is_some());
    assert_eq!(h.mux.channel(3).unwrap().state(), ChannelState::Closed);
    assert_eq!(h.mux.mode(), MuxMode::Cmux);

    h.modem.send(VirtualModemCommand::Disconnect(0)).await.unwrap();
    let event = wait_for(&mut h.events, Duration::from_secs(1), |e| {
        matches!(e, ModemEvent::ModeChanged { mode: MuxMode::At })
    })
    .await;
    assert!(event.is_some());
    assert!(h.mux.channels().is_empty());

    let result = h.mux.at().cmd("AT", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(h.mux.at().dlci(), None);
    assert_eq!(result.code, ResultCode::Ok);
}

#[tokio::test]
async fn test_close_returns_to_at_mode() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    h.mux.close().await.unwrap();
    assert_eq!(h.mux.mode(), MuxMode::At);

    let result = h.mux.at().cmd("AT+CSQ", CMD_TIMEOUT, 0).await.unwrap();
    assert_eq!(result.code, ResultCode::Ok);

    let seen = modem_observations(&mut h.modem_events);
    assert!(seen.contains(&VirtualModemEvent::ModeChanged(cell_sim::ModemMode::At)));
}

#[tokio::test]
async fn test_release_channel() {
    let h = connect_muxed(VirtualModem::new("Test")).await;

    h.mux.close_channel(3).await.unwrap();
    assert!(h.mux.channel(3).is_none());

    let reopened = h.mux.open_channel(3, ChannelRole::Data).await.unwrap();
    assert!(reopened.is_open());
}

#[tokio::test]
async fn test_data_channel_send() {
    let mut h = connect_muxed(VirtualModem::new("Test")).await;

    let data = h.mux.channel(3).unwrap();
    data.send_data(b"AT\r").await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let seen = modem_observations(&mut h.modem_events);
    assert!(seen.contains(&VirtualModemEvent::CommandReceived {
        dlci: Some(3),
        command: "AT".into(),
    }));
}
