//! State shared by the link side, the public handle and the task.
//!
//! Built once when the NPI starts and torn down when the last owner
//! drops it. Nothing in the crate lives in a static.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::NpiConfig;
use crate::events::{self, EventFlags};
use crate::queue::QueueSet;
use crate::router::SubsystemRouter;
use crate::stats::StatsCounters;

/// Queues, event word, route table and counters for one link.
#[derive(Debug)]
pub struct NpiContext {
    pub(crate) queues: QueueSet,
    pub(crate) events: EventFlags,
    pub(crate) router: SubsystemRouter,
    pub(crate) stats: StatsCounters,
    capacity: usize,
    closed: AtomicBool,
}

impl NpiContext {
    /// Build the shared state. `capacity` is the effective payload limit.
    pub(crate) fn new(config: &NpiConfig, capacity: usize) -> Self {
        Self {
            queues: QueueSet::new(config.rx_queue_depth, config.tx_queue_depth),
            events: EventFlags::new(),
            router: SubsystemRouter::new(config.max_routes),
            stats: StatsCounters::default(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Largest payload accepted in either direction.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The task has stopped or is stopping.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and wake the task so it can exit.
    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.events.signal(events::SHUTDOWN);
        }
    }

    /// Mark closed without waking anyone; used by the task on its way out.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
