//! cellmux - drive a cellular modem from the command line
//!
//! ```text
//! cellmux ports                      list serial ports, modems first
//! cellmux probe --port /dev/ttyUSB2  find the baud rate a modem answers at
//! cellmux at AT+CSQ --mux            run one command, optionally over CMUX
//! cellmux monitor --configure        multiplex and print events until Ctrl-C
//! ```
//!
//! `--simulate` replaces the serial port with a virtual modem.

mod settings;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cell_detect::{probe_port, PortScanner};
use cell_mux::{configure, ConfState, ModemEvent, Multiplexer};
use cell_sim::{run_virtual_modem_task, VirtualModem, VirtualModemCommand};
use clap::{Parser, Subcommand};
use tokio::sync::{broadcast, mpsc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "cellmux", version, about = "Cellular modem multiplexer")]
struct Cli {
    /// Settings file (defaults to $XDG_CONFIG_HOME/cellmux/settings.json)
    #[arg(long, global = true, env = "CELLMUX_SETTINGS")]
    settings: Option<PathBuf>,

    /// Talk to a virtual modem instead of a serial port
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, clap::Args)]
struct PortArgs {
    /// Serial port
    #[arg(short, long, env = "CELLMUX_PORT")]
    port: Option<String>,

    /// Baud rate
    #[arg(short, long)]
    baud: Option<u32>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List serial ports
    Ports {
        /// Only list known cellular modules
        #[arg(long)]
        modems_only: bool,
    },
    /// Probe a port for a modem
    Probe {
        #[command(flatten)]
        port: PortArgs,
    },
    /// Run one AT command
    At {
        /// Command line, e.g. AT+CSQ
        command: String,

        #[command(flatten)]
        port: PortArgs,

        /// Start multiplexing and send on the command channel
        #[arg(long)]
        mux: bool,

        /// Response timeout in milliseconds
        #[arg(short, long, default_value_t = 300)]
        timeout: u64,

        /// Resolve after this many response lines (0 waits for a result code)
        #[arg(long, default_value_t = 0)]
        tokens: usize,
    },
    /// Start multiplexing and print modem events until Ctrl-C
    Monitor {
        #[command(flatten)]
        port: PortArgs,

        /// Configure the modem before multiplexing
        #[arg(long)]
        configure: bool,

        /// Also print raw traffic
        #[arg(long)]
        traffic: bool,
    },
    /// Print the effective settings
    Settings {
        /// Write them to the settings file
        #[arg(long)]
        save: bool,
    },
}

/// An open modem link, plus the virtual modem behind it when simulating
struct Session {
    mux: Multiplexer,
    sim: Option<mpsc::Sender<VirtualModemCommand>>,
}

impl Session {
    fn open(cli: &Cli, settings: &Settings, port: &PortArgs) -> Result<Self> {
        if cli.simulate {
            let (host, modem_io) = tokio::io::duplex(4096);
            let (cmd_tx, cmd_rx) = mpsc::channel(16);
            let (sim_tx, _) = broadcast::channel(64);
            tokio::spawn(run_virtual_modem_task(
                modem_io,
                VirtualModem::new("Virtual EC25"),
                cmd_rx,
                sim_tx,
            ));
            tracing::info!("Using a virtual modem");
            return Ok(Self {
                mux: Multiplexer::new(host, settings.mux.clone()),
                sim: Some(cmd_tx),
            });
        }

        let name = port
            .port
            .clone()
            .or_else(|| settings.port.clone())
            .context("no serial port given (use --port or set \"port\" in settings)")?;
        let baud = port.baud.unwrap_or(settings.baud_rate);
        let mux = Multiplexer::open_serial(&name, baud, settings.mux.clone())
            .with_context(|| format!("failed to open {}", name))?;
        tracing::info!("Opened {} at {} baud", name, baud);
        Ok(Self { mux, sim: None })
    }

    async fn start(&self, settings: &Settings, configure_first: bool) -> Result<()> {
        if configure_first {
            match configure(&self.mux.direct_channel(), &settings.configure).await? {
                ConfState::Success => {}
                state => bail!("modem configuration ended with {:?}", state),
            }
        }
        self.mux.start_multiplexer(&settings.cmux).await?;
        Ok(())
    }

    async fn shutdown(self) {
        if let Err(e) = self.mux.close().await {
            tracing::warn!("Close-down failed: {}", e);
        }
        if let Some(sim) = self.sim {
            let _ = sim.send(VirtualModemCommand::Shutdown).await;
        }
    }
}

fn print_event(event: &ModemEvent, traffic: bool) {
    match event {
        ModemEvent::DataIn { data } if traffic => println!("<< {:02X?}", data),
        ModemEvent::DataOut { data } if traffic => println!(">> {:02X?}", data),
        ModemEvent::DataIn { .. } | ModemEvent::DataOut { .. } => {}
        ModemEvent::PowerUpComplete => println!("modem powered up"),
        ModemEvent::FirmwareUpdateProgress { raw } => println!("firmware update: {}", raw.trim()),
        ModemEvent::Urc { dlci, urc } => match dlci {
            Some(dlci) => println!("URC [{}] {:?}: {}", dlci, urc.kind, urc.body),
            None => println!("URC {:?}: {}", urc.kind, urc.body),
        },
        ModemEvent::ModeChanged { mode } => println!("mode: {:?}", mode),
        ModemEvent::ChannelOpened { dlci, role } => println!("channel {} open ({:?})", dlci, role),
        ModemEvent::ChannelClosed { dlci } => println!("channel {} closed", dlci),
        ModemEvent::FlowControl {
            dlci,
            sending_allowed,
        } => println!(
            "channel {} flow {}",
            dlci,
            if *sending_allowed { "on" } else { "off" }
        ),
        ModemEvent::LinkClosed { reason } => println!("link closed: {}", reason),
        ModemEvent::Error { source, message } => println!("error ({}): {}", source, message),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::load(cli.settings.clone());

    match &cli.command {
        Command::Ports { modems_only } => {
            let mut config = settings.scanner.clone();
            config.modems_only |= *modems_only;
            let ports = PortScanner::with_config(config).enumerate_ports()?;
            for port in ports {
                println!("{:<24} {:?} {}", port.port, port.classification, port.description());
            }
        }
        Command::Probe { port } => {
            let name = port
                .port
                .clone()
                .or_else(|| settings.port.clone())
                .context("no serial port given")?;
            let bauds = match port.baud {
                Some(baud) => vec![baud],
                None => settings.baud_rates.clone(),
            };
            let result = probe_port(&name, &bauds, &settings.probe).await?;
            println!(
                "{}: {} baud{}",
                name,
                result.baud_rate.unwrap_or_default(),
                if result.was_multiplexed {
                    " (was multiplexed)"
                } else {
                    ""
                }
            );
            if !result.identity.is_empty() {
                println!("{}", result.identity_line());
            }
        }
        Command::At {
            command,
            port,
            mux,
            timeout,
            tokens,
        } => {
            let session = Session::open(&cli, &settings, port)?;
            if *mux {
                session.start(&settings, false).await?;
            }
            let result = session
                .mux
                .at()
                .cmd(command, Duration::from_millis(*timeout), *tokens)
                .await;
            session.shutdown().await;

            let result = result?;
            for line in &result.response {
                println!("{}", line);
            }
            if !result.is_ok() {
                bail!("{} returned {}", command, result.code);
            }
        }
        Command::Monitor {
            port,
            configure,
            traffic,
        } => {
            let session = Session::open(&cli, &settings, port)?;
            let mut events = session.mux.subscribe();
            if let Some(sim) = &session.sim {
                let _ = sim.send(VirtualModemCommand::Boot).await;
            }
            session.start(&settings, *configure).await?;

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(event) => {
                            print_event(&event, *traffic);
                            if matches!(event, ModemEvent::LinkClosed { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Monitor dropped {} events", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            session.shutdown().await;
        }
        Command::Settings { save } => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            if *save {
                let path = settings.save().map_err(anyhow::Error::msg)?;
                eprintln!("Saved to {}", path.display());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cellmux=info,cell_protocol=info,cell_detect=info,cell_mux=info,cell_sim=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    run(Cli::parse()).await
}
