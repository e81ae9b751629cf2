//! Frame struct with typed accessors.
//!
//! A frame is one application message: two command bytes and an owned
//! payload. Uses `bytes::Bytes` so handing a frame between queues, the
//! router and the transport never copies the payload.
//!
//! # Example
//!
//! ```
//! use npi_transport::protocol::{Frame, MessageType};
//! use bytes::Bytes;
//!
//! let frame = Frame::build(MessageType::Async, 2, 0x01, Bytes::from_static(&[0xAA, 0xBB]));
//!
//! assert_eq!(frame.cmd0(), 0x42);
//! assert_eq!(frame.subsystem_id(), 2);
//! assert_eq!(frame.payload(), &[0xAA, 0xBB]);
//! ```

use bytes::Bytes;

use super::wire_format::{self, MessageType};
use crate::error::{NpiError, Result};

/// A complete NPI frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    cmd0: u8,
    cmd1: u8,
    payload: Bytes,
}

impl Frame {
    /// Create a frame from raw command bytes and payload.
    pub fn new(cmd0: u8, cmd1: u8, payload: Bytes) -> Self {
        Self {
            cmd0,
            cmd1,
            payload,
        }
    }

    /// Create a frame from a message type, subsystem ID and opcode.
    pub fn build(kind: MessageType, subsystem: u8, cmd1: u8, payload: Bytes) -> Self {
        Self::new(wire_format::cmd0(kind, subsystem), cmd1, payload)
    }

    /// Create a frame, rejecting payloads above `capacity`.
    ///
    /// Oversized payloads are refused whole; nothing is truncated.
    pub fn with_capacity(cmd0: u8, cmd1: u8, payload: Bytes, capacity: usize) -> Result<Self> {
        let frame = Self::new(cmd0, cmd1, payload);
        frame.check_capacity(capacity)?;
        Ok(frame)
    }

    /// Fail with `FrameTooLarge` if the payload exceeds `capacity` or the
    /// 16-bit length field.
    pub fn check_capacity(&self, capacity: usize) -> Result<()> {
        let max = capacity.min(u16::MAX as usize);
        if self.payload.len() > max {
            return Err(NpiError::FrameTooLarge {
                len: self.payload.len(),
                max,
            });
        }
        Ok(())
    }

    /// Packed type/subsystem byte.
    #[inline]
    pub fn cmd0(&self) -> u8 {
        self.cmd0
    }

    /// Opcode within the subsystem.
    #[inline]
    pub fn cmd1(&self) -> u8 {
        self.cmd1
    }

    /// Message type, or `None` for an unassigned type code.
    #[inline]
    pub fn message_type(&self) -> Option<MessageType> {
        wire_format::message_type(self.cmd0)
    }

    /// Subsystem ID used for routing.
    #[inline]
    pub fn subsystem_id(&self) -> u8 {
        wire_format::subsystem_id(self.cmd0)
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Clone of the payload (refcount only).
    #[inline]
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    /// Payload length in bytes, excluding command bytes and checksum.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// True for sync requests and responses.
    #[inline]
    pub fn is_sync(&self) -> bool {
        self.message_type().map(MessageType::is_sync).unwrap_or(false)
    }
}
