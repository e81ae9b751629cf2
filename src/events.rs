//! Event word the NPI task blocks on.
//!
//! Producers OR bits in and wake the task; the task swaps the whole word
//! to zero in one atomic step, so bits raised while it is busy are kept for
//! the next wake rather than lost.

use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

/// Link notifications (flow edges, transfer completions, faults) are waiting.
pub const LINK: u32 = 1 << 0;
/// A frame is waiting in the sync inbound queue.
pub const SYNC_RX: u32 = 1 << 1;
/// A frame is waiting in the sync outbound queue.
pub const SYNC_TX: u32 = 1 << 2;
/// A frame is waiting in the async inbound queue.
pub const ASYNC_RX: u32 = 1 << 3;
/// A frame is waiting in the async outbound queue.
pub const ASYNC_TX: u32 = 1 << 4;
/// The sync watchdog expired.
pub const WATCHDOG: u32 = 1 << 5;
/// Stop the task.
pub const SHUTDOWN: u32 = 1 << 6;

/// Multi-bit event word with async wait.
#[derive(Debug, Default)]
pub struct EventFlags {
    bits: AtomicU32,
    notify: Notify,
}

impl EventFlags {
    /// Create an empty event word.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `bits` and wake the waiter.
    pub fn signal(&self, bits: u32) {
        self.bits.fetch_or(bits, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Snapshot and clear without waiting.
    pub fn take(&self) -> u32 {
        self.bits.swap(0, Ordering::AcqRel)
    }

    /// Peek without clearing.
    pub fn pending(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }

    /// Wait until at least one bit is set, then snapshot and clear.
    pub async fn wait(&self) -> u32 {
        loop {
            let bits = self.take();
            if bits != 0 {
                return bits;
            }
            self.notify.notified().await;
        }
    }
}
