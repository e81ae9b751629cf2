//! The NPI task: single consumer of every queue.
//!
//! The task blocks on the event word (and the sync watchdog deadline, when
//! armed). On each wake it takes a snapshot of the raised bits and services
//! them in fixed order, one item per category:
//!
//! 1. flow-control edges
//! 2. transfer completions (release the last transmitted buffer)
//! 3. sync frames from the host
//! 4. sync frames to the host
//! 5. async frames from the host
//! 6. async frames to the host
//!
//! A category whose queue still holds work re-raises its own bit, so the
//! next wake picks it up without starving the others. Only one buffer is
//! ever handed to the transport at a time; the TX categories wait for its
//! completion, which re-raises them.
//!
//! An SPI link without handshake lines has no edge telling it the host
//! wants to talk, so the task clocks a read on a timer: straight away after
//! a transfer that brought data in, one poll interval later otherwise.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::context::NpiContext;
use crate::error::{NpiError, Result};
use crate::events::{self, EventFlags};
use crate::flow::{FlowAction, FlowControl, StageOutcome};
use crate::protocol::{self, Frame, MessageType, WireFormat};
use crate::queue::QueueId;
use crate::router::Dispatch;
use crate::stats::Counter;
use crate::sync_tracker::{SyncDecision, SyncTracker};
use crate::transport::{LinkEvent, Transport, WriteStatus};

/// Whether the loop keeps going after a wake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Stop,
}

pub(crate) struct NpiTask {
    ctx: Arc<NpiContext>,
    transport: Box<dyn Transport>,
    format: WireFormat,
    flow: FlowControl,
    sync: SyncTracker,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    last_tx: Option<Bytes>,
    staged: Option<(Frame, Bytes)>,
    write_blocked: bool,
    poll_interval: Option<Duration>,
    next_poll: Option<Instant>,
    read_pending: bool,
}

impl NpiTask {
    pub(crate) fn new(
        ctx: Arc<NpiContext>,
        transport: Box<dyn Transport>,
        flow: FlowControl,
        sync: SyncTracker,
        link_rx: mpsc::UnboundedReceiver<LinkEvent>,
        poll_interval: Duration,
    ) -> Self {
        let format = transport.wire_format();
        let poll_interval = match format {
            WireFormat::Spi { .. } if !flow.is_enabled() => Some(poll_interval),
            _ => None,
        };
        Self {
            ctx,
            transport,
            format,
            flow,
            sync,
            link_rx,
            last_tx: None,
            staged: None,
            write_blocked: false,
            poll_interval,
            next_poll: None,
            read_pending: false,
        }
    }

    /// Schedule the first idle read, if this link polls.
    fn arm_poll(&mut self) {
        if self.poll_interval.is_some() {
            self.next_poll = Some(Instant::now());
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.sync.deadline(), self.next_poll) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Run until shutdown, peer close or a transport fault.
    pub(crate) async fn run(mut self) -> Result<()> {
        tracing::debug!(
            format = ?self.format,
            polling = self.poll_interval.is_some(),
            "NPI task started"
        );
        self.arm_poll();

        let result = loop {
            let bits = wait_for_events(&self.ctx.events, self.next_deadline()).await;
            if bits & events::SHUTDOWN != 0 {
                tracing::debug!("NPI task shutting down");
                break Ok(());
            }
            match self.service(bits) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.teardown();
        result
    }

    /// Service one snapshot of event bits.
    pub(crate) fn service(&mut self, bits: u32) -> Result<Step> {
        if bits & events::LINK != 0 && self.service_link()? == Step::Stop {
            return Ok(Step::Stop);
        }

        let now = Instant::now();
        if self.sync.check_watchdog(now) {
            self.ctx.stats.record(Counter::WatchdogExpiries);
            self.kick_sync();
        }
        if self.next_poll.is_some_and(|at| at <= now) {
            self.poll_read()?;
        }

        if bits & events::SYNC_RX != 0 {
            self.service_sync_rx(now);
        }
        if bits & events::SYNC_TX != 0 {
            self.service_sync_tx()?;
        }
        if bits & events::ASYNC_RX != 0 {
            self.service_async_rx();
        }
        if bits & events::ASYNC_TX != 0 {
            self.service_async_tx()?;
        }
        Ok(Step::Continue)
    }

    fn service_link(&mut self) -> Result<Step> {
        let mut edges = Vec::new();
        let mut completions = Vec::new();
        let mut terminal = None;

        while let Ok(event) = self.link_rx.try_recv() {
            match event {
                LinkEvent::FlowEdge(edge) => edges.push(edge),
                LinkEvent::TransferComplete { rx_len, tx_len } => {
                    completions.push((rx_len, tx_len))
                }
                other => {
                    terminal.get_or_insert(other);
                }
            }
        }

        for edge in edges {
            if let Some(action) = self.flow.on_edge(edge) {
                self.apply(action)?;
            }
        }
        for (rx_len, tx_len) in completions {
            self.on_transfer_complete(rx_len, tx_len)?;
        }

        match terminal {
            Some(LinkEvent::Fault(reason)) => {
                tracing::error!("transport fault: {}", reason);
                Err(NpiError::Transport(reason))
            }
            Some(_) => {
                tracing::info!("link closed by peer");
                Ok(Step::Stop)
            }
            None => Ok(Step::Continue),
        }
    }

    fn on_transfer_complete(&mut self, rx_len: usize, tx_len: usize) -> Result<()> {
        tracing::trace!(rx_len, tx_len, "transfer complete");
        self.write_blocked = false;
        if tx_len > 0 && self.last_tx.take().is_some() {
            self.ctx.stats.record(Counter::FramesTransmitted);
        }
        if let Some(action) = self.flow.on_transfer_complete(tx_len) {
            self.apply(action)?;
        }
        if tx_len == 0 {
            self.read_pending = false;
        }
        if let Some(interval) = self.poll_interval {
            // Data in means the host may have more queued.
            let wait = if rx_len > 0 { Duration::ZERO } else { interval };
            self.next_poll = Some(Instant::now() + wait);
        }
        self.kick_tx();
        Ok(())
    }

    fn poll_read(&mut self) -> Result<()> {
        self.next_poll = None;
        // A running transfer reschedules the poll when it completes.
        if self.read_pending || self.tx_busy() {
            return Ok(());
        }
        tracing::trace!("idle read");
        self.read_pending = true;
        self.transport.read()
    }

    fn apply(&mut self, action: FlowAction) -> Result<()> {
        match action {
            FlowAction::BeginRead => self.transport.read(),
            FlowAction::StopRead => self.transport.stop_read(),
            FlowAction::BeginTransmit => match self.staged.take() {
                Some((frame, wire)) => self.write(frame, wire),
                None => {
                    tracing::debug!("remote ready with nothing staged");
                    self.flow.reset();
                    Ok(())
                }
            },
        }
    }

    fn tx_busy(&self) -> bool {
        self.last_tx.is_some() || self.staged.is_some() || self.write_blocked || self.flow.is_busy()
    }

    fn kick_sync(&self) {
        let queues = &self.ctx.queues;
        if !queues.get(QueueId::SyncFromHost).is_empty() {
            self.ctx.events.signal(events::SYNC_RX);
        }
        if !queues.get(QueueId::SyncToHost).is_empty() {
            self.ctx.events.signal(events::SYNC_TX);
        }
    }

    fn kick_tx(&self) {
        let queues = &self.ctx.queues;
        if !queues.get(QueueId::SyncToHost).is_empty() {
            self.ctx.events.signal(events::SYNC_TX);
        }
        if !queues.get(QueueId::AsyncToHost).is_empty() {
            self.ctx.events.signal(events::ASYNC_TX);
        }
    }

    fn route(&self, frame: Frame) -> Dispatch {
        let outcome = self.ctx.router.dispatch(frame);
        if outcome == Dispatch::NotFound {
            self.ctx.stats.record(Counter::RoutingFailures);
        }
        outcome
    }

    fn drop_stale(&self, queue: QueueId) {
        if let Some(frame) = self.ctx.queues.get(queue).pop() {
            tracing::warn!(
                ?queue,
                subsystem_id = frame.subsystem_id(),
                cmd1 = frame.cmd1(),
                "no sync exchange waiting, dropping stale response"
            );
            self.ctx.stats.record(Counter::StaleSyncDropped);
        }
    }

    fn service_sync_rx(&mut self, now: Instant) {
        let ctx = self.ctx.clone();
        let queue = ctx.queues.get(QueueId::SyncFromHost);
        let Some(kind) = queue.front_type().flatten() else {
            return;
        };

        match self.sync.rx_decision(kind) {
            SyncDecision::Proceed => {
                if let Some(frame) = queue.pop() {
                    let outcome = self.route(frame);
                    // An unrouted request will never be answered; a response
                    // ends the exchange whether or not anyone took it.
                    if outcome.is_consumed() || kind == MessageType::SyncResponse {
                        self.sync.on_dispatched(kind, now);
                        self.kick_sync();
                    }
                }
            }
            SyncDecision::Hold => {
                tracing::trace!(state = ?self.sync.state(), "holding inbound sync request");
                return;
            }
            SyncDecision::DropStale => self.drop_stale(QueueId::SyncFromHost),
        }

        if !queue.is_empty() {
            ctx.events.signal(events::SYNC_RX);
        }
    }

    fn service_sync_tx(&mut self) -> Result<()> {
        if self.tx_busy() {
            return Ok(());
        }
        let ctx = self.ctx.clone();
        let queue = ctx.queues.get(QueueId::SyncToHost);
        let Some(kind) = queue.front_type().flatten() else {
            return Ok(());
        };

        match self.sync.tx_decision(kind) {
            SyncDecision::Proceed => {
                if let Some(frame) = queue.pop() {
                    self.transmit(frame)?;
                }
            }
            SyncDecision::Hold => {
                tracing::trace!(state = ?self.sync.state(), "holding outbound sync request");
                return Ok(());
            }
            SyncDecision::DropStale => self.drop_stale(QueueId::SyncToHost),
        }

        if !queue.is_empty() && !self.tx_busy() {
            ctx.events.signal(events::SYNC_TX);
        }
        Ok(())
    }

    fn service_async_rx(&mut self) {
        let ctx = self.ctx.clone();
        let queue = ctx.queues.get(QueueId::AsyncFromHost);
        if let Some(frame) = queue.pop() {
            self.route(frame);
        }
        if !queue.is_empty() {
            ctx.events.signal(events::ASYNC_RX);
        }
    }

    fn service_async_tx(&mut self) -> Result<()> {
        if self.tx_busy() {
            return Ok(());
        }
        let ctx = self.ctx.clone();

        // A sendable sync frame always goes first.
        let sync_ready = ctx
            .queues
            .get(QueueId::SyncToHost)
            .front_type()
            .flatten()
            .map_or(false, |kind| {
                self.sync.tx_decision(kind) != SyncDecision::Hold
            });
        if sync_ready {
            ctx.events.signal(events::SYNC_TX | events::ASYNC_TX);
            return Ok(());
        }

        let queue = ctx.queues.get(QueueId::AsyncToHost);
        if let Some(frame) = queue.pop() {
            self.transmit(frame)?;
        }
        if !queue.is_empty() && !self.tx_busy() {
            ctx.events.signal(events::ASYNC_TX);
        }
        Ok(())
    }

    fn transmit(&mut self, frame: Frame) -> Result<()> {
        let wire = match protocol::encode(self.format, &frame) {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!("dropping frame that cannot be encoded: {}", e);
                return Ok(());
            }
        };

        match self.flow.stage_transmit() {
            StageOutcome::SendNow => self.write(frame, wire),
            StageOutcome::Staged => {
                tracing::trace!("frame staged until remote is ready");
                self.staged = Some((frame, wire));
                Ok(())
            }
            StageOutcome::Busy => {
                self.requeue(frame);
                Ok(())
            }
        }
    }

    fn write(&mut self, frame: Frame, wire: Bytes) -> Result<()> {
        match self.transport.write(wire.clone())? {
            WriteStatus::Accepted => {
                if let Some(kind) = frame.message_type().filter(|k| k.is_sync()) {
                    self.sync.on_transmitted(kind, Instant::now());
                    self.kick_sync();
                }
                self.ctx.router.observe_tx(&frame);
                self.last_tx = Some(wire);
            }
            WriteStatus::Busy => {
                tracing::debug!("transport busy, frame requeued until next completion");
                self.write_blocked = true;
                self.flow.reset();
                self.requeue(frame);
            }
        }
        Ok(())
    }

    fn requeue(&self, frame: Frame) {
        if let Some(id) = frame.message_type().and_then(QueueId::outbound) {
            self.ctx.queues.get(id).requeue(frame);
        }
    }

    fn teardown(&mut self) {
        self.ctx.mark_closed();
        self.flow.reset();
        self.transport.close();
        self.last_tx = None;
        self.staged = None;
        let released = self.ctx.queues.clear_all();
        tracing::debug!(released, "NPI task stopped");
    }
}

/// Block until an event bit is raised or the deadline (watchdog or idle
/// read) passes.
async fn wait_for_events(flags: &EventFlags, deadline: Option<Instant>) -> u32 {
    match deadline {
        Some(deadline) => tokio::select! {
            bits = flags.wait() => bits,
            _ = tokio::time::sleep_until(deadline) => events::WATCHDOG,
        },
        None => flags.wait().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NpiConfig;
    use crate::flow::{FlowEdge, FlowLines};
    use crate::protocol::decode_uart;
    use crate::transport::LinkHandle;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_millis(100);
    const SUBSYSTEM: u8 = 1;
    const POLL: Duration = Duration::from_millis(10);
    const SPI: WireFormat = WireFormat::Spi {
        transaction_size: 64,
    };

    /// Records every write; completions are driven by the test.
    struct Recorder {
        writes: Arc<Mutex<Vec<Bytes>>>,
        reads: Arc<Mutex<usize>>,
        busy: Arc<AtomicBool>,
        format: WireFormat,
    }

    impl Transport for Recorder {
        fn open(&mut self, _link: LinkHandle) -> Result<()> {
            Ok(())
        }
        fn read(&mut self) -> Result<()> {
            *self.reads.lock().unwrap() += 1;
            Ok(())
        }
        fn stop_read(&mut self) -> Result<()> {
            Ok(())
        }
        fn write(&mut self, wire: Bytes) -> Result<WriteStatus> {
            if self.busy.load(Ordering::Acquire) {
                return Ok(WriteStatus::Busy);
            }
            self.writes.lock().unwrap().push(wire);
            Ok(WriteStatus::Accepted)
        }
        fn close(&mut self) {}
        fn wire_format(&self) -> WireFormat {
            self.format
        }
        fn capacity(&self) -> usize {
            64
        }
    }

    struct Remote(Arc<AtomicBool>);

    impl FlowLines for Remote {
        fn remote_ready(&self) -> bool {
            self.0.load(Ordering::Acquire)
        }
        fn set_local_ready(&mut self, _asserted: bool) {}
    }

    struct Harness {
        task: NpiTask,
        ctx: Arc<NpiContext>,
        link: LinkHandle,
        writes: Arc<Mutex<Vec<Bytes>>>,
        reads: Arc<Mutex<usize>>,
        busy: Arc<AtomicBool>,
        delivered: Arc<Mutex<Vec<Frame>>>,
    }

    impl Harness {
        fn new(flow: FlowControl) -> Self {
            Self::with_format(flow, WireFormat::Uart)
        }

        fn with_format(flow: FlowControl, format: WireFormat) -> Self {
            let config = NpiConfig::default();
            let ctx = Arc::new(NpiContext::new(&config, 64));
            let (tx, rx) = mpsc::unbounded_channel();
            let link = LinkHandle::new(ctx.clone(), tx);

            let delivered = Arc::new(Mutex::new(Vec::new()));
            let sink = delivered.clone();
            ctx.router
                .register(SUBSYSTEM, move |f: Frame| sink.lock().unwrap().push(f))
                .unwrap();

            let writes = Arc::new(Mutex::new(Vec::new()));
            let reads = Arc::new(Mutex::new(0));
            let busy = Arc::new(AtomicBool::new(false));
            let transport = Recorder {
                writes: writes.clone(),
                reads: reads.clone(),
                busy: busy.clone(),
                format,
            };
            let task = NpiTask::new(
                ctx.clone(),
                Box::new(transport),
                flow,
                SyncTracker::new(TIMEOUT),
                rx,
                POLL,
            );
            Self {
                task,
                ctx,
                link,
                writes,
                reads,
                busy,
                delivered,
            }
        }

        fn plain() -> Self {
            Self::new(FlowControl::disabled())
        }

        /// Service until no bits remain.
        fn pump(&mut self) -> Step {
            for _ in 0..64 {
                let bits = self.ctx.events.take();
                if bits == 0 {
                    return Step::Continue;
                }
                if self.task.service(bits).unwrap() == Step::Stop {
                    return Step::Stop;
                }
            }
            panic!("task never settled");
        }

        fn queue_tx(&self, frame: Frame) {
            let id = QueueId::outbound(frame.message_type().unwrap()).unwrap();
            self.ctx.queues.get(id).push(frame).unwrap();
            self.ctx.events.signal(id.event_bit());
        }

        fn sent(&self) -> Vec<Frame> {
            self.writes
                .lock()
                .unwrap()
                .iter()
                .map(|w| decode_uart(w, 64).unwrap())
                .collect()
        }

        fn complete_tx(&mut self) {
            let len = self.writes.lock().unwrap().last().map_or(1, |w| w.len());
            self.link.transfer_complete(0, len);
            self.pump();
        }

        fn delivered(&self) -> Vec<Frame> {
            self.delivered.lock().unwrap().clone()
        }
    }

    fn frame(kind: MessageType, cmd1: u8) -> Frame {
        Frame::build(kind, SUBSYSTEM, cmd1, Bytes::copy_from_slice(&[cmd1]))
    }

    #[tokio::test]
    async fn test_async_from_host_routed() {
        let mut h = Harness::plain();
        h.link.frame_received(frame(MessageType::Async, 1));
        h.link.frame_received(frame(MessageType::Async, 2));
        h.pump();

        let cmds: Vec<u8> = h.delivered().iter().map(Frame::cmd1).collect();
        assert_eq!(cmds, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unrouted_frame_counted() {
        let mut h = Harness::plain();
        h.link
            .frame_received(Frame::build(MessageType::Async, 9, 0, Bytes::new()));
        h.pump();

        assert!(h.delivered().is_empty());
        assert_eq!(h.ctx.stats.snapshot().routing_failures, 1);
    }

    #[tokio::test]
    async fn test_second_sync_request_waits_for_response() {
        let mut h = Harness::plain();
        h.link.frame_received(frame(MessageType::SyncRequest, 1));
        h.link.frame_received(frame(MessageType::SyncRequest, 2));
        h.pump();

        assert_eq!(h.delivered().len(), 1);
        assert_eq!(h.task.sync.in_progress(), 1);
        assert_eq!(h.ctx.queues.get(QueueId::SyncFromHost).len(), 1);

        h.queue_tx(frame(MessageType::SyncResponse, 1));
        h.pump();
        assert_eq!(h.sent()[0].message_type(), Some(MessageType::SyncResponse));

        // Response on the wire: the second request may now proceed.
        assert_eq!(h.delivered().len(), 2);
        assert_eq!(h.delivered()[1].cmd1(), 2);
        assert_eq!(h.task.sync.in_progress(), 1);
    }

    #[tokio::test]
    async fn test_sync_tx_before_async_tx() {
        let mut h = Harness::plain();
        h.queue_tx(frame(MessageType::Async, 1));
        h.queue_tx(frame(MessageType::SyncRequest, 2));
        h.pump();

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_type(), Some(MessageType::SyncRequest));

        h.complete_tx();
        let sent = h.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].message_type(), Some(MessageType::Async));
    }

    #[tokio::test]
    async fn test_one_transmission_in_flight() {
        let mut h = Harness::plain();
        for i in 0..3 {
            h.queue_tx(frame(MessageType::Async, i));
        }
        h.pump();
        assert_eq!(h.writes.lock().unwrap().len(), 1);
        assert!(h.task.last_tx.is_some());

        h.complete_tx();
        assert_eq!(h.writes.lock().unwrap().len(), 2);
        h.complete_tx();
        h.complete_tx();

        let cmds: Vec<u8> = h.sent().iter().map(Frame::cmd1).collect();
        assert_eq!(cmds, vec![0, 1, 2]);
        assert!(h.task.last_tx.is_none());
        assert_eq!(h.ctx.stats.snapshot().frames_transmitted, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_releases_unanswered_request() {
        let mut h = Harness::plain();
        h.link.frame_received(frame(MessageType::SyncRequest, 1));
        h.link.frame_received(frame(MessageType::SyncRequest, 2));
        h.pump();
        assert_eq!(h.delivered().len(), 1);

        tokio::time::advance(TIMEOUT / 2).await;
        h.task.service(events::WATCHDOG).unwrap();
        h.pump();
        assert_eq!(h.delivered().len(), 1);

        tokio::time::advance(TIMEOUT).await;
        h.task.service(events::WATCHDOG).unwrap();
        h.pump();
        assert_eq!(h.delivered().len(), 2);
        assert_eq!(h.ctx.stats.snapshot().watchdog_expiries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_dropped_after_watchdog() {
        let mut h = Harness::plain();
        h.link.frame_received(frame(MessageType::SyncRequest, 1));
        h.pump();

        tokio::time::advance(TIMEOUT * 2).await;
        h.task.service(events::WATCHDOG).unwrap();

        h.queue_tx(frame(MessageType::SyncResponse, 1));
        h.pump();
        assert!(h.writes.lock().unwrap().is_empty());
        assert_eq!(h.ctx.stats.snapshot().stale_sync_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_fires_watchdog() {
        let h = Harness::plain();
        let ctx = h.ctx.clone();
        h.link.frame_received(frame(MessageType::SyncRequest, 1));
        let task = tokio::spawn(h.task.run());

        tokio::time::sleep(TIMEOUT * 2).await;
        assert_eq!(ctx.stats.snapshot().watchdog_expiries, 1);

        ctx.close();
        task.await.unwrap().unwrap();
        assert!(ctx.is_closed());
    }

    #[tokio::test]
    async fn test_busy_transport_requeues_at_front() {
        let mut h = Harness::plain();
        h.busy.store(true, Ordering::Release);
        h.queue_tx(frame(MessageType::Async, 1));
        h.queue_tx(frame(MessageType::Async, 2));
        h.pump();

        assert!(h.writes.lock().unwrap().is_empty());
        assert_eq!(h.ctx.queues.get(QueueId::AsyncToHost).len(), 2);

        h.busy.store(false, Ordering::Release);
        h.link.transfer_complete(0, 0);
        h.pump();
        assert_eq!(h.sent()[0].cmd1(), 1);
    }

    #[tokio::test]
    async fn test_poll_pushes_async_data() {
        let mut h = Harness::plain();
        h.ctx
            .queues
            .get(QueueId::AsyncToHost)
            .push(frame(MessageType::Async, 5))
            .unwrap();
        h.link.frame_received(frame(MessageType::Poll, 0));
        h.pump();
        assert_eq!(h.sent()[0].cmd1(), 5);
    }

    #[tokio::test]
    async fn test_flow_control_stages_until_remote_ready() {
        let remote = Arc::new(AtomicBool::new(false));
        let mut h = Harness::new(FlowControl::new(Box::new(Remote(remote.clone()))));

        h.queue_tx(frame(MessageType::Async, 7));
        h.pump();
        assert!(h.writes.lock().unwrap().is_empty());
        assert!(h.task.staged.is_some());

        remote.store(true, Ordering::Release);
        h.link.flow_edge(FlowEdge::Asserted);
        h.pump();
        assert_eq!(h.sent()[0].cmd1(), 7);
        assert_eq!(*h.reads.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_assert_starts_read() {
        let remote = Arc::new(AtomicBool::new(false));
        let mut h = Harness::new(FlowControl::new(Box::new(Remote(remote.clone()))));

        remote.store(true, Ordering::Release);
        h.link.flow_edge(FlowEdge::Asserted);
        h.pump();
        assert_eq!(*h.reads.lock().unwrap(), 1);

        // TX waits for the read to finish.
        h.queue_tx(frame(MessageType::Async, 1));
        h.pump();
        assert!(h.writes.lock().unwrap().is_empty());

        h.link.frame_received(frame(MessageType::Async, 3));
        h.link.transfer_complete(8, 0);
        h.pump();
        assert_eq!(h.delivered()[0].cmd1(), 3);
        assert_eq!(h.sent()[0].cmd1(), 1);
    }

    #[tokio::test]
    async fn test_peer_close_stops_task() {
        let mut h = Harness::plain();
        h.link.closed();
        assert_eq!(h.pump(), Step::Stop);
    }

    #[tokio::test]
    async fn test_fault_is_error() {
        let mut h = Harness::plain();
        h.link.fault("wire cut");
        let bits = h.ctx.events.take();
        let result = h.task.service(bits);
        assert!(matches!(result, Err(NpiError::Transport(ref r)) if r == "wire cut"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spi_without_handshake_polls_for_reads() {
        let mut h = Harness::with_format(FlowControl::disabled(), SPI);
        h.task.arm_poll();
        h.task.service(0).unwrap();
        assert_eq!(*h.reads.lock().unwrap(), 1);

        // One read at a time.
        h.task.service(0).unwrap();
        assert_eq!(*h.reads.lock().unwrap(), 1);

        // A read that brought a frame is followed by another straight away.
        h.link.frame_received(frame(MessageType::Async, 4));
        h.link.transfer_complete(9, 0);
        h.pump();
        assert_eq!(h.delivered()[0].cmd1(), 4);
        assert_eq!(*h.reads.lock().unwrap(), 2);

        // An empty one backs off for the poll interval.
        h.link.transfer_complete(0, 0);
        h.pump();
        assert_eq!(*h.reads.lock().unwrap(), 2);

        tokio::time::advance(POLL).await;
        h.task.service(0).unwrap();
        assert_eq!(*h.reads.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_waits_for_transmit() {
        let mut h = Harness::with_format(FlowControl::disabled(), SPI);
        h.ctx
            .queues
            .get(QueueId::AsyncToHost)
            .push(frame(MessageType::Async, 1))
            .unwrap();
        h.task.service(events::ASYNC_TX).unwrap();
        assert_eq!(h.writes.lock().unwrap().len(), 1);

        h.task.arm_poll();
        h.task.service(0).unwrap();
        assert_eq!(*h.reads.lock().unwrap(), 0);

        // The write's completion reschedules the read.
        h.link.transfer_complete(0, 64);
        h.pump();
        tokio::time::advance(POLL).await;
        h.task.service(0).unwrap();
        assert_eq!(*h.reads.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_polling_with_handshake_or_uart() {
        let remote = Arc::new(AtomicBool::new(false));
        let mut spi = Harness::with_format(FlowControl::new(Box::new(Remote(remote))), SPI);
        spi.task.arm_poll();
        spi.task.service(0).unwrap();
        assert_eq!(*spi.reads.lock().unwrap(), 0);

        let mut uart = Harness::plain();
        uart.task.arm_poll();
        uart.task.service(0).unwrap();
        assert_eq!(*uart.reads.lock().unwrap(), 0);
    }
}
