//! Wire format constants, command-byte layout and the frame check sequence.
//!
//! UART framing:
//! ```text
//! ┌──────┬────────┬────────┬──────┬──────┬─────────┬─────┐
//! │ SOF  │ len_lo │ len_hi │ cmd0 │ cmd1 │ payload │ FCS │
//! │ 0xFE │     u16 LE      │      │      │ len B   │     │
//! └──────┴────────┴────────┴──────┴──────┴─────────┴─────┘
//! ```
//!
//! SPI framing (fixed-size, zero-padded transaction):
//! ```text
//! ┌─────┬──────┬────────┬────────┬──────────────────────┬─────┬───────┐
//! │ pad │ SOF  │ len_lo │ len_hi │ cmd0 cmd1 payload    │ FCS │ 0 ... │
//! └─────┴──────┴────────┴────────┴──────────────────────┴─────┴───────┘
//! ```
//!
//! `cmd0` packs the message type in bits 5-7 and the subsystem ID in bits 0-4.
//! The FCS is the XOR of every byte from `len_lo` through the last byte
//! before the FCS; the SOF is never covered.

/// Start-of-frame marker.
pub const SOF: u8 = 0xFE;

/// Leading byte the SPI driver clocks out before the SOF.
pub const SPI_PAD: u8 = 0x00;

/// Bytes in the command field (`cmd0`, `cmd1`).
pub const CMD_SIZE: usize = 2;

/// Bytes in the length field.
pub const LEN_SIZE: usize = 2;

/// Bytes in the checksum trailer.
pub const FCS_SIZE: usize = 1;

/// UART envelope around the payload: SOF + len + cmd + FCS.
pub const UART_OVERHEAD: usize = 1 + LEN_SIZE + CMD_SIZE + FCS_SIZE;

/// SPI envelope around the payload: pad + SOF + len + cmd + FCS.
pub const SPI_OVERHEAD: usize = 1 + 1 + LEN_SIZE + CMD_SIZE + FCS_SIZE;

/// Largest subsystem ID expressible in `cmd0`.
pub const MAX_SUBSYSTEM_ID: u8 = 0x1F;

const TYPE_SHIFT: u8 = 5;
const SUBSYSTEM_MASK: u8 = 0x1F;

/// Message type carried in the top three bits of `cmd0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Host polls for queued data.
    Poll,
    /// Request expecting exactly one response.
    SyncRequest,
    /// Fire-and-forget notification.
    Async,
    /// Response to a previous sync request.
    SyncResponse,
}

impl MessageType {
    /// Raw 3-bit code.
    #[inline]
    pub fn code(self) -> u8 {
        match self {
            MessageType::Poll => 0,
            MessageType::SyncRequest => 1,
            MessageType::Async => 2,
            MessageType::SyncResponse => 3,
        }
    }

    /// Decode from a 3-bit code. Codes 4-7 are unassigned.
    #[inline]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageType::Poll),
            1 => Some(MessageType::SyncRequest),
            2 => Some(MessageType::Async),
            3 => Some(MessageType::SyncResponse),
            _ => None,
        }
    }

    /// True for either half of a request/response pair.
    #[inline]
    pub fn is_sync(self) -> bool {
        matches!(self, MessageType::SyncRequest | MessageType::SyncResponse)
    }
}

/// Build `cmd0` from a message type and subsystem ID.
///
/// # Example
///
/// ```
/// use npi_transport::protocol::{cmd0, MessageType};
///
/// assert_eq!(cmd0(MessageType::Async, 2), 0x42);
/// ```
#[inline]
pub fn cmd0(kind: MessageType, subsystem: u8) -> u8 {
    (kind.code() << TYPE_SHIFT) | (subsystem & SUBSYSTEM_MASK)
}

/// Extract the message type from `cmd0`.
#[inline]
pub fn message_type(cmd0: u8) -> Option<MessageType> {
    MessageType::from_code(cmd0 >> TYPE_SHIFT)
}

/// Extract the subsystem ID from `cmd0`.
#[inline]
pub fn subsystem_id(cmd0: u8) -> u8 {
    cmd0 & SUBSYSTEM_MASK
}

/// Fold bytes into a running XOR checksum.
#[inline]
pub fn fcs_update(fcs: u8, bytes: &[u8]) -> u8 {
    bytes.iter().fold(fcs, |acc, b| acc ^ b)
}

/// XOR checksum over a complete span.
#[inline]
pub fn fcs(bytes: &[u8]) -> u8 {
    fcs_update(0, bytes)
}

/// Which envelope a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Byte-stream framing with SOF resynchronisation.
    Uart,
    /// Fixed-size full-duplex transactions.
    Spi {
        /// Bytes clocked per transaction.
        transaction_size: usize,
    },
}

impl WireFormat {
    /// Largest payload this envelope can carry, or `None` when the stream
    /// framing itself imposes no bound beyond the length field.
    pub fn payload_limit(&self) -> Option<usize> {
        match self {
            WireFormat::Uart => None,
            WireFormat::Spi { transaction_size } => {
                Some(transaction_size.saturating_sub(SPI_OVERHEAD))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmd0_packing() {
        assert_eq!(cmd0(MessageType::Poll, 0), 0x00);
        assert_eq!(cmd0(MessageType::SyncRequest, 1), 0x21);
        assert_eq!(cmd0(MessageType::Async, 2), 0x42);
        assert_eq!(cmd0(MessageType::SyncResponse, 0x1F), 0x7F);
    }

    #[test]
    fn test_cmd0_subsystem_masked() {
        // Bits above the 5-bit field never leak into the type.
        assert_eq!(cmd0(MessageType::Async, 0xFF), 0x5F);
    }

    #[test]
    fn test_cmd0_unpacking() {
        assert_eq!(message_type(0x42), Some(MessageType::Async));
        assert_eq!(subsystem_id(0x42), 2);
        assert_eq!(message_type(0x7F), Some(MessageType::SyncResponse));
        assert_eq!(subsystem_id(0x7F), 0x1F);
    }

    #[test]
    fn test_unassigned_type_codes() {
        for code in 4..8u8 {
            assert!(MessageType::from_code(code).is_none());
            assert!(message_type(code << 5).is_none());
        }
    }

    #[test]
    fn test_is_sync() {
        assert!(MessageType::SyncRequest.is_sync());
        assert!(MessageType::SyncResponse.is_sync());
        assert!(!MessageType::Async.is_sync());
        assert!(!MessageType::Poll.is_sync());
    }

    #[test]
    fn test_fcs_is_xor() {
        let bytes = [0x02, 0x00, 0x42, 0x01, 0xAA, 0xBB];
        let expected = 0x02 ^ 0x00 ^ 0x42 ^ 0x01 ^ 0xAA ^ 0xBB;
        assert_eq!(fcs(&bytes), expected);
    }

    #[test]
    fn test_fcs_order_independent() {
        assert_eq!(fcs(&[1, 2, 3, 4]), fcs(&[4, 3, 2, 1]));
        assert_eq!(fcs_update(fcs(&[1, 2]), &[3, 4]), fcs(&[1, 2, 3, 4]));
    }

    #[test]
    fn test_payload_limit() {
        assert_eq!(WireFormat::Uart.payload_limit(), None);
        assert_eq!(
            WireFormat::Spi {
                transaction_size: 64
            }
            .payload_limit(),
            Some(64 - SPI_OVERHEAD)
        );
        assert_eq!(
            WireFormat::Spi {
                transaction_size: 3
            }
            .payload_limit(),
            Some(0)
        );
    }
}
