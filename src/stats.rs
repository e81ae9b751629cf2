//! Link statistics.
//!
//! Conditions that are recovered internally (bad checksums, unrouted
//! frames, watchdog expiries) never surface as errors; they are counted
//! here instead.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Something worth counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    FramesReceived,
    FramesTransmitted,
    FramesRejected,
    RoutingFailures,
    RxQueueDrops,
    WatchdogExpiries,
    StaleSyncDropped,
}

/// Live counters shared between the link side and the task.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    frames_received: AtomicU64,
    frames_transmitted: AtomicU64,
    frames_rejected: AtomicU64,
    routing_failures: AtomicU64,
    rx_queue_drops: AtomicU64,
    watchdog_expiries: AtomicU64,
    stale_sync_dropped: AtomicU64,
}

impl StatsCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::FramesReceived => &self.frames_received,
            Counter::FramesTransmitted => &self.frames_transmitted,
            Counter::FramesRejected => &self.frames_rejected,
            Counter::RoutingFailures => &self.routing_failures,
            Counter::RxQueueDrops => &self.rx_queue_drops,
            Counter::WatchdogExpiries => &self.watchdog_expiries,
            Counter::StaleSyncDropped => &self.stale_sync_dropped,
        }
    }

    #[inline]
    pub(crate) fn record(&self, counter: Counter) {
        self.slot(counter).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LinkStats {
        let get = |counter| self.slot(counter).load(Ordering::Relaxed);
        LinkStats {
            frames_received: get(Counter::FramesReceived),
            frames_transmitted: get(Counter::FramesTransmitted),
            frames_rejected: get(Counter::FramesRejected),
            routing_failures: get(Counter::RoutingFailures),
            rx_queue_drops: get(Counter::RxQueueDrops),
            watchdog_expiries: get(Counter::WatchdogExpiries),
            stale_sync_dropped: get(Counter::StaleSyncDropped),
        }
    }
}

/// Point-in-time copy of the link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    /// Well-formed frames delivered by the transport.
    pub frames_received: u64,
    /// Frames whose transfer completed.
    pub frames_transmitted: u64,
    /// Inbound frames discarded by the decoder (checksum, oversize, bad type).
    pub frames_rejected: u64,
    /// Inbound frames with no registered route.
    pub routing_failures: u64,
    /// Inbound frames dropped because their queue was full.
    pub rx_queue_drops: u64,
    /// Sync transactions cleared by the watchdog.
    pub watchdog_expiries: u64,
    /// Sync responses dropped because no exchange was waiting for them.
    pub stale_sync_dropped: u64,
}
