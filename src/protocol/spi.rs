//! SPI framing: fixed-size, zero-padded transactions.
//!
//! SPI is full duplex, so the decoder runs once per completed transaction
//! over the whole receive buffer rather than once per byte. The length
//! field counts the bytes between it and the FCS (command bytes included),
//! so the SPI layer carries the command field as opaque data.

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{fcs, CMD_SIZE, FCS_SIZE, LEN_SIZE, SOF, SPI_OVERHEAD, SPI_PAD};
use crate::error::{NpiError, Result};

/// Outcome of inspecting one receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpiDecode {
    /// Buffer held only padding; the peer had nothing to send.
    Idle,
    /// A complete, checksum-verified frame.
    Frame(Frame),
    /// Marker, length or checksum was wrong; buffer discarded.
    Invalid(SpiRejection),
}

/// Why a receive buffer was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiRejection {
    /// First non-pad byte was not the SOF.
    NoMarker,
    /// Length too short to hold the command bytes.
    Runt { declared: usize },
    /// Declared span exceeds capacity or runs past the buffer.
    Oversize { declared: usize },
    /// FCS mismatch.
    Checksum { expected: u8, received: u8 },
}

/// Encode a frame into a `transaction_size` buffer.
///
/// The tail after the FCS is zero so stale bytes from an earlier
/// transaction are never clocked out.
pub fn encode_spi(frame: &Frame, transaction_size: usize) -> Result<Bytes> {
    let needed = SPI_OVERHEAD + frame.payload_len();
    if needed > transaction_size {
        return Err(NpiError::FrameTooLarge {
            len: frame.payload_len(),
            max: transaction_size.saturating_sub(SPI_OVERHEAD),
        });
    }
    let span = u16::try_from(CMD_SIZE + frame.payload_len()).map_err(|_| {
        NpiError::FrameTooLarge {
            len: frame.payload_len(),
            max: u16::MAX as usize - CMD_SIZE,
        }
    })?;

    let mut buf = BytesMut::with_capacity(transaction_size);
    buf.put_u8(SPI_PAD);
    buf.put_u8(SOF);
    buf.put_u16_le(span);
    buf.put_u8(frame.cmd0());
    buf.put_u8(frame.cmd1());
    buf.put_slice(frame.payload());
    let check = fcs(&buf[2..]);
    buf.put_u8(check);
    buf.resize(transaction_size, 0);
    Ok(buf.freeze())
}

/// An all-zero transaction used when only receiving.
pub fn idle_transaction(transaction_size: usize) -> Bytes {
    Bytes::from(vec![0u8; transaction_size])
}

/// Inspect a completed receive buffer.
///
/// Leading pad bytes are skipped, then the marker, the length and the
/// checksum over the declared span are checked in turn.
pub fn decode_spi(rx: &[u8], capacity: usize) -> SpiDecode {
    let start = match rx.iter().position(|&b| b != SPI_PAD) {
        Some(idx) => idx,
        None => return SpiDecode::Idle,
    };

    if rx[start] != SOF {
        tracing::debug!(byte = rx[start], "no start marker in SPI receive buffer");
        return SpiDecode::Invalid(SpiRejection::NoMarker);
    }

    // Shift past the marker; everything checked from here is FCS-covered.
    let body = &rx[start + 1..];
    if body.len() < LEN_SIZE {
        return SpiDecode::Invalid(SpiRejection::Runt { declared: 0 });
    }

    let declared = u16::from_le_bytes([body[0], body[1]]) as usize;
    if declared < CMD_SIZE {
        return SpiDecode::Invalid(SpiRejection::Runt { declared });
    }
    if declared - CMD_SIZE > capacity || LEN_SIZE + declared + FCS_SIZE > body.len() {
        return SpiDecode::Invalid(SpiRejection::Oversize { declared });
    }

    let covered = &body[..LEN_SIZE + declared];
    let expected = fcs(covered);
    let received = body[LEN_SIZE + declared];
    if expected != received {
        tracing::debug!(expected, received, "SPI checksum mismatch");
        return SpiDecode::Invalid(SpiRejection::Checksum { expected, received });
    }

    let cmd0 = covered[LEN_SIZE];
    let cmd1 = covered[LEN_SIZE + 1];
    let payload = Bytes::copy_from_slice(&covered[LEN_SIZE + CMD_SIZE..]);
    SpiDecode::Frame(Frame::new(cmd0, cmd1, payload))
}
