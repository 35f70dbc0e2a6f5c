//! Outbound half of the transport shared by every channel
//!
//! All writes go through a bounded queue drained by the writer task, so
//! channels never touch the transport directly.

use std::sync::atomic::{AtomicBool, Ordering};

use cell_protocol::{Frame, FrameCodec, FrameConfig};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::error::MuxError;
use crate::events::ModemEvent;

/// Handle used to queue bytes for the transport and publish events
#[derive(Debug)]
pub struct Link {
    writer: mpsc::Sender<Vec<u8>>,
    encoder: FrameCodec,
    events: broadcast::Sender<ModemEvent>,
    closed: AtomicBool,
}

impl Link {
    pub(crate) fn new(
        writer: mpsc::Sender<Vec<u8>>,
        frame_config: FrameConfig,
        events: broadcast::Sender<ModemEvent>,
    ) -> Self {
        Self {
            writer,
            encoder: FrameCodec::with_config(frame_config),
            events,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue raw bytes for the transport
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), MuxError> {
        if self.is_closed() {
            return Err(MuxError::LinkClosed);
        }
        self.writer.send(bytes).await.map_err(|_| MuxError::LinkClosed)
    }

    /// Encode and queue a frame
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), MuxError> {
        let bytes = self.encoder.encode(frame)?;
        trace!(
            "Queue {} on DLCI {} ({} payload bytes)",
            frame.frame_type.name(),
            frame.dlci,
            frame.payload.len()
        );
        self.send_raw(bytes).await
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ModemEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribe to the event bus
    pub fn subscribe(&self) -> broadcast::Receiver<ModemEvent> {
        self.events.subscribe()
    }

    /// Whether the transport has failed or reached EOF
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the transport dead and tell subscribers why (once)
    pub(crate) fn mark_closed(&self, reason: impl Into<String>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let reason = reason.into();
            warn!("Link closed: {}", reason);
            self.publish(ModemEvent::LinkClosed { reason });
        }
    }
}

/// Drain the outbound queue into the transport until either side closes
pub(crate) async fn run_writer<W>(mut io: W, mut rx: mpsc::Receiver<Vec<u8>>, link: std::sync::Weak<Link>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = rx.recv().await {
        trace!("TX {:02X?}", bytes);
        let result = async {
            io.write_all(&bytes).await?;
            io.flush().await
        }
        .await;

        let Some(link) = link.upgrade() else {
            break;
        };
        match result {
            Ok(()) => link.publish(ModemEvent::DataOut { data: bytes }),
            Err(e) => {
                link.mark_closed(format!("write failed: {}", e));
                break;
            }
        }
    }
    debug!("Writer task ended");
}
