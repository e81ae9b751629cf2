//! Frame queues shared between the link side and the NPI task.
//!
//! Four bounded FIFOs carry frames between the transport callbacks,
//! the public send API and the task loop:
//!
//! ```text
//! LinkHandle ──► SyncFromHost / AsyncFromHost ──► task ──► router
//! NpiHandle  ──► SyncToHost   / AsyncToHost   ──► task ──► transport
//! ```
//!
//! Every access takes the queue's mutex for the length of one push or pop.
//! The guard is scoped, so it is released on every return path, and no
//! lock is ever held across an await.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::events;
use crate::protocol::{Frame, MessageType};

/// Identifies one of the four queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// Notifications waiting to go to the host.
    AsyncToHost,
    /// Notifications from the host waiting for dispatch.
    AsyncFromHost,
    /// Sync requests/responses waiting to go to the host.
    SyncToHost,
    /// Sync requests/responses from the host waiting for dispatch.
    SyncFromHost,
}

impl QueueId {
    /// Inbound queue for a received message type. Poll frames are not queued.
    pub fn inbound(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::SyncRequest | MessageType::SyncResponse => Some(QueueId::SyncFromHost),
            MessageType::Async => Some(QueueId::AsyncFromHost),
            MessageType::Poll => None,
        }
    }

    /// Outbound queue for a message type. Poll frames cannot be sent.
    pub fn outbound(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::SyncRequest | MessageType::SyncResponse => Some(QueueId::SyncToHost),
            MessageType::Async => Some(QueueId::AsyncToHost),
            MessageType::Poll => None,
        }
    }

    /// Event bit that tells the task this queue has work.
    pub fn event_bit(self) -> u32 {
        match self {
            QueueId::AsyncToHost => events::ASYNC_TX,
            QueueId::AsyncFromHost => events::ASYNC_RX,
            QueueId::SyncToHost => events::SYNC_TX,
            QueueId::SyncFromHost => events::SYNC_RX,
        }
    }
}

/// A bounded FIFO of frames.
#[derive(Debug)]
pub struct FrameQueue {
    id: QueueId,
    depth: usize,
    inner: Mutex<VecDeque<Frame>>,
}

impl FrameQueue {
    /// Create an empty queue holding at most `depth` frames.
    pub fn new(id: QueueId, depth: usize) -> Self {
        Self {
            id,
            depth,
            inner: Mutex::new(VecDeque::with_capacity(depth)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Frame>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a frame. Hands the frame back if the queue is full.
    pub fn push(&self, frame: Frame) -> std::result::Result<(), Frame> {
        let mut queue = self.lock();
        if queue.len() >= self.depth {
            return Err(frame);
        }
        queue.push_back(frame);
        Ok(())
    }

    /// Put a frame back at the head after a failed hand-off.
    ///
    /// Ignores the depth limit: the slot was ours a moment ago.
    pub fn requeue(&self, frame: Frame) {
        self.lock().push_front(frame);
    }

    /// Remove the oldest frame.
    pub fn pop(&self) -> Option<Frame> {
        self.lock().pop_front()
    }

    /// Message type of the oldest frame without removing it.
    pub fn front_type(&self) -> Option<Option<MessageType>> {
        self.lock().front().map(Frame::message_type)
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Which queue this is.
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Drop everything queued, returning how many frames were released.
    pub fn clear(&self) -> usize {
        let mut queue = self.lock();
        let n = queue.len();
        queue.clear();
        n
    }
}

/// The four NPI queues.
#[derive(Debug)]
pub struct QueueSet {
    async_to_host: FrameQueue,
    async_from_host: FrameQueue,
    sync_to_host: FrameQueue,
    sync_from_host: FrameQueue,
}

impl QueueSet {
    /// Create the queue set with separate inbound and outbound depths.
    pub fn new(rx_depth: usize, tx_depth: usize) -> Self {
        Self {
            async_to_host: FrameQueue::new(QueueId::AsyncToHost, tx_depth),
            async_from_host: FrameQueue::new(QueueId::AsyncFromHost, rx_depth),
            sync_to_host: FrameQueue::new(QueueId::SyncToHost, tx_depth),
            sync_from_host: FrameQueue::new(QueueId::SyncFromHost, rx_depth),
        }
    }

    /// Borrow a queue by ID.
    pub fn get(&self, id: QueueId) -> &FrameQueue {
        match id {
            QueueId::AsyncToHost => &self.async_to_host,
            QueueId::AsyncFromHost => &self.async_from_host,
            QueueId::SyncToHost => &self.sync_to_host,
            QueueId::SyncFromHost => &self.sync_from_host,
        }
    }

    /// Release every queued frame.
    pub fn clear_all(&self) -> usize {
        [
            QueueId::AsyncToHost,
            QueueId::AsyncFromHost,
            QueueId::SyncToHost,
            QueueId::SyncFromHost,
        ]
        .iter()
        .map(|&id| self.get(id).clear())
        .sum()
    }
}
