//! Loopback - echo subsystem over an in-memory UART.
//!
//! This example demonstrates:
//! - Starting an NPI over a `tokio::io::duplex` stream with the builder
//! - Registering a subsystem that answers sync requests
//! - Playing the host: sending a framed request and decoding the response
//!
//! ```text
//! cargo run --example loopback
//! ```

use std::time::Duration;

use bytes::Bytes;
use npi_transport::protocol::{encode_uart, Frame, MessageType, UartDecoder};
use npi_transport::{Npi, ObserverMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const ECHO_SUBSYSTEM: u8 = 0x02;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (device_side, mut host) = tokio::io::duplex(1024);

    let npi = Npi::builder()
        .max_payload(128)
        .sync_timeout(Duration::from_millis(500))
        .rx_observer(ObserverMode::Echo, |frame: Frame| {
            println!("[device] rx {:?}", frame);
        })
        .start(npi_transport::UartTransport::new(device_side, 128))
        .await?;

    // Answer every sync request on the echo subsystem with its own payload.
    let handle = npi.handle();
    let responder = handle.clone();
    handle.register(ECHO_SUBSYSTEM, move |frame: Frame| {
        if frame.message_type() == Some(MessageType::SyncRequest) {
            let reply = Frame::build(
                MessageType::SyncResponse,
                ECHO_SUBSYSTEM,
                frame.cmd1(),
                frame.payload_bytes(),
            );
            if let Err(e) = responder.send(reply) {
                eprintln!("[device] reply failed: {}", e);
            }
        }
    })?;

    // Host: send a request.
    let request = Frame::build(
        MessageType::SyncRequest,
        ECHO_SUBSYSTEM,
        0x10,
        Bytes::from_static(b"ping"),
    );
    host.write_all(&encode_uart(&request)?).await?;

    // Host: read until the response decodes.
    let mut decoder = UartDecoder::new(128);
    let mut buf = [0u8; 64];
    let response = loop {
        let n = host.read(&mut buf).await?;
        if n == 0 {
            return Err("device closed the link".into());
        }
        if let Some(frame) = decoder.push(&buf[..n]).pop() {
            break frame;
        }
    };

    println!(
        "[host] response {:?} opcode {:#04x} payload {:?}",
        response.message_type(),
        response.cmd1(),
        String::from_utf8_lossy(response.payload())
    );
    println!("[host] stats {}", serde_json::to_string(&handle.stats())?);

    npi.shutdown().await?;
    Ok(())
}
