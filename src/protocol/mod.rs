//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the NPI framing layer:
//! - `cmd0` bit layout and the XOR frame check sequence
//! - UART stream framing with SOF resynchronisation
//! - SPI fixed-size transaction framing
//! - Frame struct with typed accessors

mod frame;
mod spi;
mod uart;
mod wire_format;

use bytes::Bytes;

pub use frame::Frame;
pub use spi::{decode_spi, encode_spi, idle_transaction, SpiDecode, SpiRejection};
pub use uart::{check_length, decode_uart, encode_uart, DecodeStep, Rejection, UartDecoder};
pub use wire_format::{
    cmd0, fcs, fcs_update, message_type, subsystem_id, MessageType, WireFormat, CMD_SIZE,
    FCS_SIZE, LEN_SIZE, MAX_SUBSYSTEM_ID, SOF, SPI_OVERHEAD, SPI_PAD, UART_OVERHEAD,
};

/// Encode a frame in whichever envelope `format` selects.
pub fn encode(format: WireFormat, frame: &Frame) -> crate::error::Result<Bytes> {
    match format {
        WireFormat::Uart => encode_uart(frame),
        WireFormat::Spi { transaction_size } => encode_spi(frame, transaction_size),
    }
}

/// Reject frames `format` cannot carry, without encoding them.
///
/// The UART length field may not have a low byte equal to the start marker.
/// SPI frames are delimited by the transaction, so any length that fits is
/// fine.
pub fn check_sendable(format: WireFormat, frame: &Frame) -> crate::error::Result<()> {
    match format {
        WireFormat::Uart => check_length(frame.payload_len()).map(|_| ()),
        WireFormat::Spi { .. } => Ok(()),
    }
}
