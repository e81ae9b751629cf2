//! Transport bindings.
//!
//! A [`Transport`] moves encoded buffers over the physical link. It behaves
//! like a DMA engine: `write` and `read` only start a transfer, and the
//! outcome is reported later through the [`LinkHandle`] it was given at
//! `open`:
//!
//! ```text
//!            open(link)
//!  NpiTask ──────────────► Transport ──► UART stream / SPI bus
//!     ▲                        │
//!     │  LinkEvent / queues    │ frame_received, transfer_complete,
//!     └──────── LinkHandle ◄───┘ flow_edge, closed, fault
//! ```
//!
//! Two bindings ship with the crate:
//! - [`UartTransport`]: any `AsyncRead + AsyncWrite` byte stream
//! - [`SpiTransport`]: a blocking full-duplex [`SpiBus`]

mod spi;
mod uart;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::context::NpiContext;
use crate::error::Result;
use crate::events;
use crate::flow::FlowEdge;
use crate::protocol::{Frame, WireFormat};
use crate::queue::QueueId;
use crate::stats::Counter;

pub use spi::{SpiBus, SpiTransport};
pub use uart::UartTransport;

/// Outcome of starting a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// The transfer has started; completion arrives via the link handle.
    Accepted,
    /// A transfer is already running; try again after it completes.
    Busy,
}

/// Physical link driver.
pub trait Transport: Send + 'static {
    /// Start the driver. Called once, from inside the runtime.
    fn open(&mut self, link: LinkHandle) -> Result<()>;

    /// Arm a receive.
    fn read(&mut self) -> Result<()>;

    /// Finish the running receive; its completion is reported as usual.
    fn stop_read(&mut self) -> Result<()>;

    /// Start transmitting one encoded buffer.
    fn write(&mut self, wire: Bytes) -> Result<WriteStatus>;

    /// Stop the driver and release the link.
    fn close(&mut self);

    /// Envelope this link speaks.
    fn wire_format(&self) -> WireFormat;

    /// Largest payload the driver's buffers hold.
    fn capacity(&self) -> usize;
}

/// Notification from the link side that is not a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A transfer finished.
    TransferComplete {
        /// Bytes received in the transfer.
        rx_len: usize,
        /// Bytes transmitted in the transfer.
        tx_len: usize,
    },
    /// The remote-ready line moved.
    FlowEdge(FlowEdge),
    /// The peer closed the link.
    Closed,
    /// The driver failed and cannot continue.
    Fault(String),
}

/// The link side's view of the NPI: where transports deliver what happens.
///
/// Cheap to clone; every method only enqueues and signals, so it is safe
/// to call from driver tasks and blocking threads.
#[derive(Clone)]
pub struct LinkHandle {
    ctx: Arc<NpiContext>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkHandle {
    pub(crate) fn new(ctx: Arc<NpiContext>, events_tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { ctx, events_tx }
    }

    /// Payload capacity the decoder must enforce.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ctx.capacity()
    }

    /// Hand a decoded frame to the NPI.
    ///
    /// The frame lands in the inbound queue for its message type. Poll
    /// frames are not queued; they prompt the task to push out async data.
    pub fn frame_received(&self, frame: Frame) {
        let Some(kind) = frame.message_type() else {
            tracing::warn!(cmd0 = frame.cmd0(), "unknown message type, dropping frame");
            self.ctx.stats.record(Counter::FramesRejected);
            return;
        };
        self.ctx.stats.record(Counter::FramesReceived);

        let Some(id) = QueueId::inbound(kind) else {
            tracing::trace!("poll from host");
            self.ctx.events.signal(events::ASYNC_TX);
            return;
        };

        match self.ctx.queues.get(id).push(frame) {
            Ok(()) => self.ctx.events.signal(id.event_bit()),
            Err(dropped) => {
                tracing::warn!(
                    queue = ?id,
                    subsystem_id = dropped.subsystem_id(),
                    "inbound queue full, dropping frame"
                );
                self.ctx.stats.record(Counter::RxQueueDrops);
            }
        }
    }

    /// The decoder discarded a malformed frame.
    pub fn frame_rejected(&self) {
        self.ctx.stats.record(Counter::FramesRejected);
    }

    /// A transfer finished.
    pub fn transfer_complete(&self, rx_len: usize, tx_len: usize) {
        self.post(LinkEvent::TransferComplete { rx_len, tx_len });
    }

    /// The remote-ready line changed.
    pub fn flow_edge(&self, edge: FlowEdge) {
        self.post(LinkEvent::FlowEdge(edge));
    }

    /// The peer closed the link.
    pub fn closed(&self) {
        self.post(LinkEvent::Closed);
    }

    /// The driver hit an unrecoverable error.
    pub fn fault(&self, reason: impl Into<String>) {
        self.post(LinkEvent::Fault(reason.into()));
    }

    fn post(&self, event: LinkEvent) {
        if self.events_tx.send(event).is_ok() {
            self.ctx.events.signal(events::LINK);
        } else {
            tracing::trace!("link event after task exit ignored");
        }
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("capacity", &self.ctx.capacity())
            .finish()
    }
}
