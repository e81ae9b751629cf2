//! Subsystem router: delivers inbound frames by subsystem ID.
//!
//! Routes are registered once while a subsystem initialises and are never
//! removed. The table has a fixed capacity; registering past it fails with
//! [`NpiError::RegistrationFull`] instead of silently dropping the route.
//!
//! # Example
//!
//! ```
//! use npi_transport::router::{Dispatch, SubsystemRouter};
//! use npi_transport::protocol::{Frame, MessageType};
//! use bytes::Bytes;
//!
//! let router = SubsystemRouter::new(4);
//! router.register(2, |frame: Frame| {
//!     println!("subsystem 2 got opcode {:#04x}", frame.cmd1());
//! }).unwrap();
//!
//! let frame = Frame::build(MessageType::Async, 2, 0x01, Bytes::new());
//! assert_eq!(router.dispatch(frame), Dispatch::Delivered);
//! ```
//!
//! Besides the routes, one RX observer and one TX observer can be attached.
//! An RX observer in [`ObserverMode::Intercept`] takes every inbound frame
//! before the route table sees it; in [`ObserverMode::Echo`] it gets a copy
//! and routing continues.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{NpiError, Result};
use crate::protocol::{Frame, MAX_SUBSYSTEM_ID};

/// Consumer of routed frames.
///
/// Called from the NPI task; must not block for long.
pub trait RouteHandler: Send + Sync + 'static {
    /// Take ownership of one frame.
    fn deliver(&self, frame: Frame);
}

impl<F> RouteHandler for F
where
    F: Fn(Frame) + Send + Sync + 'static,
{
    fn deliver(&self, frame: Frame) {
        self(frame)
    }
}

/// Shared handler reference.
pub type SharedHandler = Arc<dyn RouteHandler>;

/// How an RX observer sees inbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverMode {
    /// The observer takes the frame; routes never see it.
    Intercept,
    /// The observer gets a copy; the frame is routed as usual.
    Echo,
}

/// Outcome of [`SubsystemRouter::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered to the registered route.
    Delivered,
    /// Taken by an intercepting observer.
    Intercepted,
    /// No route for the subsystem; the frame was released.
    NotFound,
}

impl Dispatch {
    /// Someone took the frame.
    pub fn is_consumed(self) -> bool {
        !matches!(self, Dispatch::NotFound)
    }
}

/// Fixed-capacity route table plus observers.
pub struct SubsystemRouter {
    routes: RwLock<Vec<(u8, SharedHandler)>>,
    capacity: usize,
    rx_observer: RwLock<Option<(ObserverMode, SharedHandler)>>,
    tx_observer: RwLock<Option<SharedHandler>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl SubsystemRouter {
    /// Create an empty table holding at most `capacity` routes.
    pub fn new(capacity: usize) -> Self {
        Self {
            routes: RwLock::new(Vec::with_capacity(capacity)),
            capacity,
            rx_observer: RwLock::new(None),
            tx_observer: RwLock::new(None),
        }
    }

    /// Register a handler for `subsystem_id`.
    ///
    /// Registering an ID that already has a route replaces its handler
    /// without using another slot.
    pub fn register<H: RouteHandler>(&self, subsystem_id: u8, handler: H) -> Result<()> {
        self.register_shared(subsystem_id, Arc::new(handler))
    }

    /// Register an already-shared handler.
    pub fn register_shared(&self, subsystem_id: u8, handler: SharedHandler) -> Result<()> {
        if subsystem_id > MAX_SUBSYSTEM_ID {
            return Err(NpiError::InvalidFrame(format!(
                "subsystem id {} exceeds {}",
                subsystem_id, MAX_SUBSYSTEM_ID
            )));
        }

        let mut routes = write(&self.routes);
        if let Some(entry) = routes.iter_mut().find(|(id, _)| *id == subsystem_id) {
            tracing::debug!(subsystem_id, "replacing route handler");
            entry.1 = handler;
            return Ok(());
        }
        if routes.len() >= self.capacity {
            return Err(NpiError::RegistrationFull {
                capacity: self.capacity,
            });
        }
        routes.push((subsystem_id, handler));
        tracing::debug!(subsystem_id, "route registered");
        Ok(())
    }

    /// Is there a route for `subsystem_id`?
    pub fn is_registered(&self, subsystem_id: u8) -> bool {
        read(&self.routes).iter().any(|(id, _)| *id == subsystem_id)
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        read(&self.routes).len()
    }

    /// True when no routes are registered.
    pub fn is_empty(&self) -> bool {
        read(&self.routes).is_empty()
    }

    /// Maximum number of routes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Attach (or replace) the RX observer.
    pub fn set_rx_observer(&self, mode: ObserverMode, handler: SharedHandler) {
        *write(&self.rx_observer) = Some((mode, handler));
    }

    /// Attach (or replace) the TX observer.
    pub fn set_tx_observer(&self, handler: SharedHandler) {
        *write(&self.tx_observer) = Some(handler);
    }

    fn lookup(&self, subsystem_id: u8) -> Option<SharedHandler> {
        read(&self.routes)
            .iter()
            .find(|(id, _)| *id == subsystem_id)
            .map(|(_, handler)| handler.clone())
    }

    /// Deliver an inbound frame.
    ///
    /// Handlers run after the table lock is released, so a handler may
    /// register further routes.
    pub fn dispatch(&self, frame: Frame) -> Dispatch {
        let observer = read(&self.rx_observer).clone();
        match observer {
            Some((ObserverMode::Intercept, observer)) => {
                observer.deliver(frame);
                return Dispatch::Intercepted;
            }
            Some((ObserverMode::Echo, observer)) => observer.deliver(frame.clone()),
            None => {}
        }

        let subsystem_id = frame.subsystem_id();
        match self.lookup(subsystem_id) {
            Some(handler) => {
                handler.deliver(frame);
                Dispatch::Delivered
            }
            None => {
                tracing::warn!(
                    subsystem_id,
                    cmd1 = frame.cmd1(),
                    "no route for inbound frame, dropping"
                );
                Dispatch::NotFound
            }
        }
    }

    /// Show an outbound frame to the TX observer, if any.
    pub fn observe_tx(&self, frame: &Frame) {
        let observer = read(&self.tx_observer).clone();
        if let Some(observer) = observer {
            observer.deliver(frame.clone());
        }
    }
}

impl std::fmt::Debug for SubsystemRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<u8> = read(&self.routes).iter().map(|(id, _)| *id).collect();
        f.debug_struct("SubsystemRouter")
            .field("routes", &ids)
            .field("capacity", &self.capacity)
            .finish()
    }
}
