//! Last-gasp diagnostic path.
//!
//! When the application hits an unrecoverable assertion, the normal task
//! and queues can no longer be trusted. [`last_gasp`] bypasses them: it
//! writes one async frame carrying the assertion text straight to a
//! blocking writer, then spins forever so the host can read it.

use std::io::{self, Write};

use bytes::Bytes;

use crate::protocol::{encode_uart, Frame, MessageType, SOF};

/// Opcode used for assertion reports.
pub const ASSERT_CMD: u8 = 0xFF;

/// Build the assertion frame, truncating `message` to `capacity` bytes.
///
/// A length whose low byte would read as the start marker loses one more
/// byte so the frame stays encodable.
pub fn assert_frame(subsystem: u8, message: &str, capacity: usize) -> Frame {
    let bytes = message.as_bytes();
    let mut len = bytes.len().min(capacity).min(u16::MAX as usize);
    if len.to_le_bytes()[0] == SOF {
        len -= 1;
    }
    Frame::build(
        MessageType::Async,
        subsystem,
        ASSERT_CMD,
        Bytes::copy_from_slice(&bytes[..len]),
    )
}

/// Encode `frame` for a UART and write it out in one blocking call.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    let wire = encode_uart(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&wire)?;
    writer.flush()
}

/// Report `message` to the host and stop.
///
/// `capacity` is the link's payload capacity (see
/// [`NpiHandle::capacity`](crate::NpiHandle::capacity)); longer messages are
/// truncated so the host's decoder accepts the frame.
///
/// Never returns. Write errors are ignored: there is nobody left to tell.
pub fn last_gasp<W: Write>(mut writer: W, subsystem: u8, message: &str, capacity: usize) -> ! {
    tracing::error!(subsystem, "last gasp: {}", message);
    let frame = assert_frame(subsystem, message, capacity);
    let _ = write_frame(&mut writer, &frame);
    loop {
        std::hint::spin_loop();
    }
}
