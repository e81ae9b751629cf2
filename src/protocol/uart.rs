//! UART framing: encoder and byte-at-a-time decoder.
//!
//! The decoder is a restartable state machine fed one byte per call:
//! - `WaitSof`: drop everything that is not the start marker
//! - `LenLow` / `LenHigh`: little-endian payload length. A start marker in
//!   `LenLow` restarts the frame there, so a low length byte may never
//!   equal the start marker; the encoder refuses such lengths.
//! - `Cmd0` / `Cmd1`: command bytes
//! - `Payload`: collect `len` bytes
//! - `Fcs`: compare against the running XOR
//! - `Flush`: discard the rest of a frame whose length exceeds capacity
//!
//! After every terminal outcome (frame or rejection) the decoder is back in
//! `WaitSof`.
//!
//! # Example
//!
//! ```
//! use npi_transport::protocol::{encode_uart, Frame, UartDecoder};
//! use bytes::Bytes;
//!
//! let frame = Frame::new(0x42, 0x01, Bytes::from_static(&[0xAA, 0xBB]));
//! let wire = encode_uart(&frame).unwrap();
//!
//! let mut decoder = UartDecoder::new(256);
//! let frames = decoder.push(&wire);
//! assert_eq!(frames, vec![frame]);
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::frame::Frame;
use super::wire_format::{fcs, CMD_SIZE, FCS_SIZE, SOF, UART_OVERHEAD};
use crate::error::{NpiError, Result};

/// Check that a payload length can be expressed on the wire.
///
/// The length must fit the 16-bit field and its low byte must differ from
/// the start marker, which the decoder treats as a restart.
pub fn check_length(len: usize) -> Result<u16> {
    let field = u16::try_from(len).map_err(|_| NpiError::FrameTooLarge {
        len,
        max: u16::MAX as usize,
    })?;
    if field.to_le_bytes()[0] == SOF {
        return Err(NpiError::InvalidFrame(format!(
            "payload length {} collides with the start marker",
            len
        )));
    }
    Ok(field)
}

/// Encode a frame into UART wire bytes.
///
/// Fails if the payload length cannot be expressed; see [`check_length`].
pub fn encode_uart(frame: &Frame) -> Result<Bytes> {
    let len = check_length(frame.payload_len())?;

    let mut buf = BytesMut::with_capacity(UART_OVERHEAD + frame.payload_len());
    buf.put_u8(SOF);
    buf.put_u16_le(len);
    buf.put_u8(frame.cmd0());
    buf.put_u8(frame.cmd1());
    buf.put_slice(frame.payload());
    let check = fcs(&buf[1..]);
    buf.put_u8(check);
    Ok(buf.freeze())
}

/// Why the decoder discarded a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Received FCS did not match the computed one.
    Checksum { expected: u8, received: u8 },
    /// Declared payload length exceeded the buffer capacity.
    Oversize { declared: usize },
}

/// Outcome of feeding one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// Need more bytes.
    Incomplete,
    /// A complete, checksum-verified frame.
    Frame(Frame),
    /// A frame was discarded whole.
    Invalid(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitSof,
    LenLow,
    LenHigh { low: u8 },
    Cmd0,
    Cmd1,
    Payload,
    Fcs,
    Flush { remaining: usize, declared: usize },
}

/// Streaming UART frame decoder.
pub struct UartDecoder {
    state: State,
    capacity: usize,
    len: usize,
    cmd0: u8,
    cmd1: u8,
    running_fcs: u8,
    payload: BytesMut,
}

impl UartDecoder {
    /// Create a decoder that accepts payloads up to `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: State::WaitSof,
            capacity,
            len: 0,
            cmd0: 0,
            cmd1: 0,
            running_fcs: 0,
            payload: BytesMut::with_capacity(capacity),
        }
    }

    /// Feed one received byte.
    pub fn decode_step(&mut self, byte: u8) -> DecodeStep {
        match self.state {
            State::WaitSof => {
                if byte == SOF {
                    self.state = State::LenLow;
                } else {
                    tracing::trace!("dropping 0x{:02X} while waiting for SOF", byte);
                }
                DecodeStep::Incomplete
            }

            State::LenLow => {
                if byte == SOF {
                    tracing::trace!("repeated SOF, restarting frame");
                } else {
                    self.state = State::LenHigh { low: byte };
                }
                DecodeStep::Incomplete
            }

            State::LenHigh { low } => {
                let declared = u16::from_le_bytes([low, byte]) as usize;

                if declared > self.capacity {
                    tracing::debug!(
                        declared,
                        capacity = self.capacity,
                        "oversize length, flushing"
                    );
                    self.state = State::Flush {
                        remaining: declared + CMD_SIZE + FCS_SIZE,
                        declared,
                    };
                    return DecodeStep::Incomplete;
                }

                self.len = declared;
                self.running_fcs = low ^ byte;
                self.payload.clear();
                self.state = State::Cmd0;
                DecodeStep::Incomplete
            }

            State::Cmd0 => {
                self.cmd0 = byte;
                self.running_fcs ^= byte;
                self.state = State::Cmd1;
                DecodeStep::Incomplete
            }

            State::Cmd1 => {
                self.cmd1 = byte;
                self.running_fcs ^= byte;
                self.state = if self.len == 0 {
                    State::Fcs
                } else {
                    State::Payload
                };
                DecodeStep::Incomplete
            }

            State::Payload => {
                self.payload.put_u8(byte);
                self.running_fcs ^= byte;
                if self.payload.len() == self.len {
                    self.state = State::Fcs;
                }
                DecodeStep::Incomplete
            }

            State::Fcs => {
                self.state = State::WaitSof;
                let payload = self.payload.split().freeze();

                if byte != self.running_fcs {
                    tracing::debug!(
                        expected = self.running_fcs,
                        received = byte,
                        "checksum mismatch, frame discarded"
                    );
                    return DecodeStep::Invalid(Rejection::Checksum {
                        expected: self.running_fcs,
                        received: byte,
                    });
                }

                DecodeStep::Frame(Frame::new(self.cmd0, self.cmd1, payload))
            }

            State::Flush {
                remaining,
                declared,
            } => {
                if remaining <= 1 {
                    self.state = State::WaitSof;
                    DecodeStep::Invalid(Rejection::Oversize { declared })
                } else {
                    self.state = State::Flush {
                        remaining: remaining - 1,
                        declared,
                    };
                    DecodeStep::Incomplete
                }
            }
        }
    }

    /// Feed a chunk and collect every complete frame.
    ///
    /// Rejected frames are dropped silently; use [`decode_step`](Self::decode_step)
    /// directly to observe them.
    pub fn push(&mut self, data: &[u8]) -> Vec<Frame> {
        data.iter()
            .filter_map(|&b| match self.decode_step(b) {
                DecodeStep::Frame(frame) => Some(frame),
                _ => None,
            })
            .collect()
    }

    /// Maximum accepted payload length.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// True when no frame is partially assembled.
    pub fn is_idle(&self) -> bool {
        self.state == State::WaitSof
    }

    /// Drop any partial frame and return to `WaitSof`.
    pub fn reset(&mut self) {
        self.state = State::WaitSof;
        self.payload.clear();
    }

    /// Get the current state for debugging.
    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitSof => "WaitSof",
            State::LenLow => "LenLow",
            State::LenHigh { .. } => "LenHigh",
            State::Cmd0 => "Cmd0",
            State::Cmd1 => "Cmd1",
            State::Payload => "Payload",
            State::Fcs => "Fcs",
            State::Flush { .. } => "Flush",
        }
    }
}

/// Convenience for checking a single buffer holds exactly one frame.
pub fn decode_uart(wire: &[u8], capacity: usize) -> Option<Frame> {
    let mut decoder = UartDecoder::new(capacity);
    let mut frames = decoder.push(wire);
    if frames.len() == 1 && decoder.is_idle() {
        frames.pop()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Frame {
        Frame::new(0x42, 0x01, Bytes::from_static(&[0xAA, 0xBB]))
    }

    #[test]
    fn test_encode_example_bytes() {
        let wire = encode_uart(&sample()).unwrap();
        let fcs = 0x02 ^ 0x00 ^ 0x42 ^ 0x01 ^ 0xAA ^ 0xBB;
        assert_eq!(&wire[..], &[0xFE, 0x02, 0x00, 0x42, 0x01, 0xAA, 0xBB, fcs]);
    }

    #[test]
    fn test_decode_example_bytes() {
        let wire = encode_uart(&sample()).unwrap();
        assert_eq!(decode_uart(&wire, 256), Some(sample()));
    }

    #[test]
    fn test_byte_at_a_time() {
        let wire = encode_uart(&sample()).unwrap();
        let mut decoder = UartDecoder::new(256);

        for &b in &wire[..wire.len() - 1] {
            assert_eq!(decoder.decode_step(b), DecodeStep::Incomplete);
        }
        assert_eq!(
            decoder.decode_step(wire[wire.len() - 1]),
            DecodeStep::Frame(sample())
        );
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(0x21, 0x07, Bytes::new());
        let wire = encode_uart(&frame).unwrap();
        assert_eq!(wire.len(), UART_OVERHEAD);
        assert_eq!(decode_uart(&wire, 256), Some(frame));
    }

    #[test]
    fn test_leading_noise_is_skipped() {
        let mut data = vec![0x00, 0x13, 0x37, 0xFF];
        data.extend_from_slice(&encode_uart(&sample()).unwrap());

        let mut decoder = UartDecoder::new(256);
        assert_eq!(decoder.push(&data), vec![sample()]);
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let mut wire = encode_uart(&sample()).unwrap().to_vec();
        wire[5] ^= 0x10;

        let mut decoder = UartDecoder::new(256);
        let mut outcome = DecodeStep::Incomplete;
        for &b in &wire {
            outcome = decoder.decode_step(b);
        }
        assert!(matches!(
            outcome,
            DecodeStep::Invalid(Rejection::Checksum { .. })
        ));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_every_single_byte_corruption_rejected() {
        let frame = Frame::new(0x42, 0x09, Bytes::from_static(b"payload bytes"));
        let wire = encode_uart(&frame).unwrap();

        // Every byte after the SOF and before the FCS, every bit.
        for idx in 5..wire.len() - 1 {
            for bit in 0..8 {
                let mut bad = wire.to_vec();
                bad[idx] ^= 1 << bit;
                let decoded = decode_uart(&bad, 256);
                assert!(decoded.is_none(), "corruption at {} bit {}", idx, bit);
            }
        }
    }

    #[test]
    fn test_frame_after_rejection_is_decoded() {
        let mut bad = encode_uart(&sample()).unwrap().to_vec();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        bad.extend_from_slice(&encode_uart(&sample()).unwrap());

        let mut decoder = UartDecoder::new(256);
        assert_eq!(decoder.push(&bad), vec![sample()]);
    }

    #[test]
    fn test_double_sof_resynchronises() {
        let mut data = vec![SOF];
        data.extend_from_slice(&encode_uart(&sample()).unwrap());

        let mut decoder = UartDecoder::new(256);
        assert_eq!(decoder.push(&data), vec![sample()]);
    }

    #[test]
    fn test_run_of_sofs_resynchronises() {
        let mut data = vec![SOF, SOF, SOF];
        data.extend_from_slice(&encode_uart(&sample()).unwrap());

        let mut decoder = UartDecoder::new(256);
        assert_eq!(decoder.push(&data), vec![sample()]);
    }

    #[test]
    fn test_stray_sof_before_empty_frame() {
        let frame = Frame::new(0x42, 0x01, Bytes::new());
        let mut data = vec![SOF];
        data.extend_from_slice(&encode_uart(&frame).unwrap());

        let mut decoder = UartDecoder::new(256);
        assert_eq!(decoder.push(&data), vec![frame]);
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_stray_sof_with_large_capacity() {
        // 0xFE | 0xFE << 8 fits a 1024 byte buffer; the restart must not
        // depend on the length being oversize.
        let mut data = vec![SOF];
        data.extend_from_slice(&encode_uart(&sample()).unwrap());

        let mut decoder = UartDecoder::new(1024);
        assert_eq!(decoder.push(&data), vec![sample()]);
        assert!(decoder.is_idle());

        let mut decoder = UartDecoder::new(u16::MAX as usize);
        assert_eq!(decoder.push(&data), vec![sample()]);
    }

    #[test]
    fn test_length_colliding_with_sof_refused() {
        for len in [0xFE, 0x1FE, 0x2FE] {
            let frame = Frame::new(0x42, 0x01, Bytes::from(vec![0x5A; len]));
            assert!(matches!(
                encode_uart(&frame),
                Err(NpiError::InvalidFrame(_))
            ));
        }

        // Neighbouring lengths still go through.
        for len in [0xFD, 0xFF] {
            let frame = Frame::new(0x42, 0x01, Bytes::from(vec![0x5A; len]));
            let wire = encode_uart(&frame).unwrap();
            assert_eq!(decode_uart(&wire, 1024), Some(frame));
        }
    }

    #[test]
    fn test_oversize_is_flushed() {
        // Declares 20 bytes against capacity 8: cmd0, cmd1, 20 payload, fcs flushed.
        let mut data = vec![SOF, 20, 0, 0x42, 0x01];
        data.extend_from_slice(&[SOF; 20]);
        data.push(0x00);

        let mut decoder = UartDecoder::new(8);
        let mut steps = Vec::new();
        for &b in &data {
            steps.push(decoder.decode_step(b));
        }
        assert_eq!(
            steps.last(),
            Some(&DecodeStep::Invalid(Rejection::Oversize { declared: 20 }))
        );
        assert!(steps[..steps.len() - 1]
            .iter()
            .all(|s| *s == DecodeStep::Incomplete));
        assert!(decoder.is_idle());

        // The next frame is recognised even though the flushed bytes held SOFs.
        let small = Frame::new(0x42, 0x01, Bytes::from_static(&[1, 2]));
        assert_eq!(decoder.push(&encode_uart(&small).unwrap()), vec![small]);
    }

    #[test]
    fn test_partial_frame_state() {
        let wire = encode_uart(&sample()).unwrap();
        let mut decoder = UartDecoder::new(256);

        decoder.push(&wire[..4]);
        assert_eq!(decoder.state_name(), "Cmd1");
        decoder.push(&wire[4..6]);
        assert_eq!(decoder.state_name(), "Payload");

        decoder.reset();
        assert_eq!(decoder.state_name(), "WaitSof");
        assert!(decoder.push(&wire[6..]).is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let frames: Vec<Frame> = (0..3u8)
            .map(|i| Frame::new(0x40 | i, i, Bytes::from(vec![i; i as usize])))
            .collect();
        let mut data = Vec::new();
        for f in &frames {
            data.extend_from_slice(&encode_uart(f).unwrap());
        }

        let mut decoder = UartDecoder::new(256);
        assert_eq!(decoder.push(&data), frames);
    }

    #[test]
    fn test_encode_rejects_length_field_overflow() {
        let frame = Frame::new(0x42, 0x01, Bytes::from(vec![0u8; 70_000]));
        assert!(matches!(
            encode_uart(&frame),
            Err(NpiError::FrameTooLarge { len: 70_000, .. })
        ));
    }
}
