//! Error types for npi-transport.

use thiserror::Error;

/// Main error type for all NPI operations.
///
/// Malformed inbound frames and sync watchdog expiries are recovered
/// internally and only show up in [`LinkStats`](crate::LinkStats).
#[derive(Debug, Error)]
pub enum NpiError {
    /// I/O error on the underlying serial stream or bus.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Configuration parsed but is not usable.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Payload exceeds the transport buffer capacity.
    #[error("Frame too large: payload {len} bytes exceeds capacity {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// Frame cannot be sent as given (wrong message type, bad subsystem ID).
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// No route registered for the subsystem ID.
    #[error("Subsystem not found: {0}")]
    SubsystemNotFound(u8),

    /// Outbound queue is full; retry later.
    #[error("Transport busy")]
    Busy,

    /// Route table is at capacity.
    #[error("Route table full (capacity {capacity})")]
    RegistrationFull { capacity: usize },

    /// Link or task has shut down.
    #[error("Link closed")]
    LinkClosed,

    /// Transport-specific failure.
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type alias using NpiError.
pub type Result<T> = std::result::Result<T, NpiError>;
