//! At most one outstanding synchronous transaction.
//!
//! The tracker keeps a signed counter in `-1..=1`:
//!
//! | count | state                  | meaning                                        |
//! |-------|------------------------|------------------------------------------------|
//! |  0    | `Idle`                 | no sync exchange in flight                     |
//! | +1    | `RequestPending`       | host request dispatched, our response owed     |
//! | -1    | `ResponseAwaitingSend` | our request is on the wire, host response owed |
//!
//! Dispatching a host request or sending our own request arms the watchdog.
//! When it fires the counter returns to zero, so an unanswered exchange
//! cannot wedge the link; a response that turns up afterwards is stale and
//! dropped.

use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::MessageType;

/// Tracker state derived from the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Counter is 0.
    Idle,
    /// Counter is +1.
    RequestPending,
    /// Counter is -1.
    ResponseAwaitingSend,
}

/// What to do with the sync frame at the head of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Proceed; apply the matching transition afterwards.
    Proceed,
    /// Leave it queued until the current exchange ends.
    Hold,
    /// No exchange is waiting for it; release it.
    DropStale,
}

/// Sync transaction tracker with watchdog.
#[derive(Debug)]
pub struct SyncTracker {
    in_progress: i8,
    deadline: Option<Instant>,
    timeout: Duration,
    expiries: u64,
}

impl SyncTracker {
    /// Create an idle tracker.
    pub fn new(timeout: Duration) -> Self {
        Self {
            in_progress: 0,
            deadline: None,
            timeout,
            expiries: 0,
        }
    }

    /// Raw counter value.
    #[inline]
    pub fn in_progress(&self) -> i8 {
        self.in_progress
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        match self.in_progress {
            0 => SyncState::Idle,
            n if n > 0 => SyncState::RequestPending,
            _ => SyncState::ResponseAwaitingSend,
        }
    }

    /// When the watchdog fires, if armed.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of watchdog expiries so far.
    #[inline]
    pub fn expiries(&self) -> u64 {
        self.expiries
    }

    /// May an inbound sync frame of `kind` be dispatched now?
    pub fn rx_decision(&self, kind: MessageType) -> SyncDecision {
        match (kind, self.state()) {
            (MessageType::SyncRequest, SyncState::Idle) => SyncDecision::Proceed,
            (MessageType::SyncRequest, _) => SyncDecision::Hold,
            (MessageType::SyncResponse, SyncState::ResponseAwaitingSend) => SyncDecision::Proceed,
            (MessageType::SyncResponse, _) => SyncDecision::DropStale,
            _ => SyncDecision::Proceed,
        }
    }

    /// May an outbound sync frame of `kind` go on the wire now?
    pub fn tx_decision(&self, kind: MessageType) -> SyncDecision {
        match (kind, self.state()) {
            (MessageType::SyncResponse, SyncState::RequestPending) => SyncDecision::Proceed,
            (MessageType::SyncResponse, _) => SyncDecision::DropStale,
            (MessageType::SyncRequest, SyncState::Idle) => SyncDecision::Proceed,
            (MessageType::SyncRequest, _) => SyncDecision::Hold,
            _ => SyncDecision::Proceed,
        }
    }

    /// Record that an inbound sync frame was handed to its route.
    pub fn on_dispatched(&mut self, kind: MessageType, now: Instant) {
        match kind {
            MessageType::SyncRequest if self.in_progress == 0 => {
                self.in_progress = 1;
                self.deadline = Some(now + self.timeout);
                tracing::debug!("sync request dispatched, watchdog armed");
            }
            MessageType::SyncResponse if self.in_progress == -1 => {
                self.in_progress = 0;
                self.deadline = None;
                tracing::debug!("sync response dispatched, exchange complete");
            }
            _ => {}
        }
    }

    /// Record that an outbound sync frame was handed to the transport.
    pub fn on_transmitted(&mut self, kind: MessageType, now: Instant) {
        match kind {
            MessageType::SyncResponse if self.in_progress == 1 => {
                self.in_progress = 0;
                self.deadline = None;
                tracing::debug!("sync response sent, watchdog stopped");
            }
            MessageType::SyncRequest if self.in_progress == 0 => {
                self.in_progress = -1;
                self.deadline = Some(now + self.timeout);
                tracing::debug!("sync request sent, watchdog armed");
            }
            _ => {}
        }
    }

    /// Fire the watchdog if its deadline has passed.
    ///
    /// Returns `true` if the outstanding exchange was cleared.
    pub fn check_watchdog(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline && self.in_progress != 0 => {
                tracing::warn!(
                    state = ?self.state(),
                    "sync watchdog expired, releasing transaction slot"
                );
                self.in_progress = 0;
                self.deadline = None;
                self.expiries += 1;
                true
            }
            _ => false,
        }
    }
}
