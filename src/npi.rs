//! Builder, running instance and handle.
//!
//! The [`NpiBuilder`] collects configuration, routes and observers, then
//! `start` opens the transport and spawns the task. The [`Npi`] owns that
//! task; [`NpiHandle`] is the cloneable front end collaborating
//! subsystems use to send frames and register routes.
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use npi_transport::protocol::{Frame, MessageType};
//! use npi_transport::{Npi, UartTransport};
//!
//! # async fn run() -> npi_transport::Result<()> {
//! let (stream, _host) = tokio::io::duplex(1024);
//!
//! let npi = Npi::builder()
//!     .max_payload(128)
//!     .route(0x02, |frame: Frame| println!("got {:?}", frame))
//!     .start(UartTransport::new(stream, 128))
//!     .await?;
//!
//! let handle = npi.handle();
//! handle.send(Frame::build(MessageType::Async, 0x02, 0x01, Bytes::from_static(b"hi")))?;
//!
//! npi.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NpiConfig;
use crate::context::NpiContext;
use crate::error::{NpiError, Result};
use crate::flow::{FlowControl, FlowEdge, FlowLines};
use crate::protocol::{self, Frame, MessageType, WireFormat};
use crate::queue::QueueId;
use crate::router::{ObserverMode, RouteHandler, SharedHandler};
use crate::stats::LinkStats;
use crate::sync_tracker::SyncTracker;
use crate::task::NpiTask;
use crate::transport::{LinkHandle, Transport};

/// Builder for configuring and starting an NPI.
pub struct NpiBuilder {
    config: NpiConfig,
    routes: Vec<(u8, SharedHandler)>,
    rx_observer: Option<(ObserverMode, SharedHandler)>,
    tx_observer: Option<SharedHandler>,
    flow_lines: Option<Box<dyn FlowLines>>,
}

impl NpiBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::from_config(NpiConfig::default())
    }

    /// Create a builder from a loaded configuration.
    pub fn from_config(config: NpiConfig) -> Self {
        Self {
            config,
            routes: Vec::new(),
            rx_observer: None,
            tx_observer: None,
            flow_lines: None,
        }
    }

    /// Largest payload accepted in either direction.
    ///
    /// Default: 256
    pub fn max_payload(mut self, bytes: usize) -> Self {
        self.config.max_payload = bytes;
        self
    }

    /// How long a sync transaction may stay unanswered.
    ///
    /// Default: 1 second
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Route table capacity.
    ///
    /// Default: 8
    pub fn max_routes(mut self, routes: usize) -> Self {
        self.config.max_routes = routes;
        self
    }

    /// Depth of each inbound queue.
    ///
    /// Default: 16
    pub fn rx_queue_depth(mut self, depth: usize) -> Self {
        self.config.rx_queue_depth = depth;
        self
    }

    /// Depth of each outbound queue. A full queue makes `send` return `Busy`.
    ///
    /// Default: 16
    pub fn tx_queue_depth(mut self, depth: usize) -> Self {
        self.config.tx_queue_depth = depth;
        self
    }

    /// Gap between idle reads on an SPI link without handshake lines.
    ///
    /// Default: 10 ms
    pub fn spi_poll_interval(mut self, interval: Duration) -> Self {
        self.config.spi_poll_interval_ms = interval.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Use the remote-ready / local-ready handshake over `lines`.
    pub fn flow_lines<L: FlowLines + 'static>(mut self, lines: L) -> Self {
        self.config.flow_control = true;
        self.flow_lines = Some(Box::new(lines));
        self
    }

    /// Register a route for `subsystem_id`.
    pub fn route<H: RouteHandler>(mut self, subsystem_id: u8, handler: H) -> Self {
        self.routes.push((subsystem_id, Arc::new(handler)));
        self
    }

    /// See every inbound frame, either instead of or as well as the routes.
    pub fn rx_observer<H: RouteHandler>(mut self, mode: ObserverMode, handler: H) -> Self {
        self.rx_observer = Some((mode, Arc::new(handler)));
        self
    }

    /// See every frame handed to the transport.
    pub fn tx_observer<H: RouteHandler>(mut self, handler: H) -> Self {
        self.tx_observer = Some(Arc::new(handler));
        self
    }

    /// Open `transport` and start the task.
    ///
    /// Fails if the configuration is invalid, a route does not fit the
    /// table, or the transport cannot be opened.
    pub async fn start<T: Transport>(self, transport: T) -> Result<Npi> {
        Npi::start(self, Box::new(transport)).await
    }
}

impl Default for NpiBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running NPI.
pub struct Npi {
    handle: NpiHandle,
    task: JoinHandle<Result<()>>,
}

impl Npi {
    /// Create a new builder.
    pub fn builder() -> NpiBuilder {
        NpiBuilder::new()
    }

    async fn start(builder: NpiBuilder, mut transport: Box<dyn Transport>) -> Result<Self> {
        let NpiBuilder {
            config,
            routes,
            rx_observer,
            tx_observer,
            flow_lines,
        } = builder;
        config.validate()?;

        // 1. Effective capacity: the tightest of config, driver and envelope
        let mut capacity = config.max_payload.min(transport.capacity());
        if let Some(limit) = transport.wire_format().payload_limit() {
            capacity = capacity.min(limit);
        }
        if capacity == 0 {
            return Err(NpiError::InvalidConfig(
                "transport leaves no room for payload".into(),
            ));
        }

        // 2. Shared state and routes
        let ctx = Arc::new(NpiContext::new(&config, capacity));
        for (subsystem_id, handler) in routes {
            ctx.router.register_shared(subsystem_id, handler)?;
        }
        if let Some((mode, handler)) = rx_observer {
            ctx.router.set_rx_observer(mode, handler);
        }
        if let Some(handler) = tx_observer {
            ctx.router.set_tx_observer(handler);
        }

        // 3. Flow control
        let flow = match (config.flow_control, flow_lines) {
            (true, Some(lines)) => FlowControl::new(lines),
            (true, None) => {
                return Err(NpiError::InvalidConfig(
                    "flow_control is enabled but no flow lines were given".into(),
                ))
            }
            (false, _) => FlowControl::disabled(),
        };

        // 4. Open the link
        let format = transport.wire_format();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = LinkHandle::new(ctx.clone(), events_tx);
        transport.open(link.clone())?;

        // 5. Spawn the task
        let task = NpiTask::new(
            ctx.clone(),
            transport,
            flow,
            SyncTracker::new(config.sync_timeout()),
            events_rx,
            config.spi_poll_interval(),
        );
        let task = tokio::spawn(async move {
            let result = task.run().await;
            if let Err(e) = &result {
                tracing::error!("NPI task error: {}", e);
            }
            result
        });

        tracing::info!(
            capacity,
            routes = ctx.router.len(),
            flow_control = config.flow_control,
            "NPI started"
        );
        Ok(Npi {
            handle: NpiHandle { ctx, format, link },
            task,
        })
    }

    /// A cloneable handle for sending and registering.
    pub fn handle(&self) -> NpiHandle {
        self.handle.clone()
    }

    /// Stop the task, close the transport and wait for the loop to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown();
        self.wait().await
    }

    /// Wait for the task to exit (peer close, fault or shutdown).
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(NpiError::Transport(format!("NPI task aborted: {}", e))),
        }
    }
}

/// Front end for collaborating subsystems.
///
/// Cheap to clone; every method returns immediately.
#[derive(Clone)]
pub struct NpiHandle {
    ctx: Arc<NpiContext>,
    format: WireFormat,
    link: LinkHandle,
}

impl NpiHandle {
    /// Queue a frame for the host.
    ///
    /// Checks, in order: the message type is sendable (not Poll), the
    /// payload fits and its length can be framed on this link, the sending
    /// subsystem has a route, and the outbound queue has room. A rejected
    /// frame is never queued.
    pub fn send(&self, frame: Frame) -> Result<()> {
        let kind = match frame.message_type() {
            Some(MessageType::Poll) => {
                return Err(NpiError::InvalidFrame("poll frames cannot be sent".into()))
            }
            Some(kind) => kind,
            None => {
                return Err(NpiError::InvalidFrame(format!(
                    "unknown message type in cmd0 {:#04x}",
                    frame.cmd0()
                )))
            }
        };
        frame.check_capacity(self.ctx.capacity())?;
        protocol::check_sendable(self.format, &frame)?;

        let subsystem_id = frame.subsystem_id();
        if !self.ctx.router.is_registered(subsystem_id) {
            return Err(NpiError::SubsystemNotFound(subsystem_id));
        }
        if self.ctx.is_closed() {
            return Err(NpiError::LinkClosed);
        }

        let id = QueueId::outbound(kind)
            .ok_or_else(|| NpiError::InvalidFrame(format!("{:?} has no outbound queue", kind)))?;
        self.ctx.queues.get(id).push(frame).map_err(|_| NpiError::Busy)?;
        self.ctx.events.signal(id.event_bit());
        Ok(())
    }

    /// Register a route after start.
    pub fn register<H: RouteHandler>(&self, subsystem_id: u8, handler: H) -> Result<()> {
        self.ctx.router.register(subsystem_id, handler)
    }

    /// Report a remote-ready edge from the line's interrupt.
    ///
    /// Only meaningful when the NPI was built with
    /// [`flow_lines`](NpiBuilder::flow_lines).
    pub fn flow_edge(&self, edge: FlowEdge) {
        self.link.flow_edge(edge);
    }

    /// Snapshot of the link counters.
    pub fn stats(&self) -> LinkStats {
        self.ctx.stats.snapshot()
    }

    /// Effective payload capacity.
    pub fn capacity(&self) -> usize {
        self.ctx.capacity()
    }

    /// The task has stopped or been asked to stop.
    pub fn is_closed(&self) -> bool {
        self.ctx.is_closed()
    }

    /// Ask the task to stop. Returns immediately.
    pub fn shutdown(&self) {
        self.ctx.close();
    }
}

impl std::fmt::Debug for NpiHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NpiHandle")
            .field("capacity", &self.ctx.capacity())
            .field("closed", &self.ctx.is_closed())
            .finish()
    }
}
