//! Cellular Modem Multiplexer
//!
//! This crate drives a cellular modem over one serial link: it sends AT
//! commands, watches unsolicited output for boot and firmware-update
//! markers, and switches the link into GSM 07.10 multiplexing so commands,
//! notifications and data travel on separate logical channels.
//!
//! # Architecture
//!
//! - [`Multiplexer`] owns the transport through a receiver task and a
//!   writer task, and routes received frames to [`LogicalChannel`]s
//! - [`AtChannel`] runs command/response exchanges on the raw link or a
//!   channel, resolving on a terminal line, token count or timeout
//! - [`UrcDispatcher`] detects power-up (`RDY` then `+CFUN: 1`) and
//!   forwards firmware-update progress
//! - All activity is published as [`ModemEvent`]s on one broadcast bus
//!
//! # Example
//!
//! ```rust,no_run
//! use cell_mux::{CmuxParams, Multiplexer, MuxConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), cell_mux::MuxError> {
//! let mux = Multiplexer::open_serial("/dev/ttyUSB2", 115200, MuxConfig::default())?;
//! mux.start_multiplexer(&CmuxParams::default()).await?;
//!
//! let result = mux.at().cmd("AT+CSQ", Duration::from_millis(300), 0).await?;
//! println!("{:?}", result.tokens_for("+CSQ:"));
//! # Ok(())
//! # }
//! ```

pub mod at_channel;
pub mod buffer;
pub mod channel;
pub mod error;
pub mod events;
pub mod link;
pub mod multiplexer;
pub mod startup;

pub use at_channel::{AtChannel, AtConfig, DirectPort, UrcDispatcher};
pub use buffer::{ResponseBuffer, ResponseChunk, Waiter};
pub use channel::{ChannelParams, ChannelRole, ChannelState, DataCallback, LogicalChannel};
pub use error::MuxError;
pub use events::ModemEvent;
pub use link::Link;
pub use multiplexer::{Multiplexer, MuxConfig, MuxMode};
pub use startup::{configure, CmuxParams, ConfOptions, ConfState, PortSpeed};
