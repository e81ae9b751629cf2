//! UART binding over an async byte stream.
//!
//! The stream is split once at `open`. A reader task runs the streaming
//! decoder over every received byte; a writer task owns the write half and
//! reports each finished buffer back as a transfer completion.
//!
//! ```text
//! write(Bytes) ─► mpsc (1 slot) ─► writer task ─► write_all + flush ─► transfer_complete
//! stream ─► reader task ─► UartDecoder ─► frame_received / frame_rejected
//! ```
//!
//! Only one buffer is ever in flight: `write` answers `Busy` until the
//! writer task has flushed the previous one.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{LinkHandle, Transport, WriteStatus};
use crate::error::{NpiError, Result};
use crate::protocol::{DecodeStep, UartDecoder, WireFormat};

/// Receive chunk size.
const READ_CHUNK: usize = 512;

/// UART transport over any `AsyncRead + AsyncWrite` stream.
pub struct UartTransport<S> {
    stream: Option<S>,
    capacity: usize,
    tx: Option<mpsc::Sender<Bytes>>,
    in_flight: Arc<AtomicBool>,
    rx_count: Arc<AtomicUsize>,
    link: Option<LinkHandle>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl<S> UartTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream. `capacity` bounds accepted payloads.
    pub fn new(stream: S, capacity: usize) -> Self {
        Self {
            stream: Some(stream),
            capacity,
            tx: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            rx_count: Arc::new(AtomicUsize::new(0)),
            link: None,
            reader_task: None,
            writer_task: None,
        }
    }

    /// A write is running.
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

impl<S> Transport for UartTransport<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn open(&mut self, link: LinkHandle) -> Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| NpiError::Transport("UART transport already opened".into()))?;
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(1);

        let decoder = UartDecoder::new(self.capacity.min(link.capacity()));
        self.reader_task = Some(tokio::spawn(reader_loop(
            reader,
            decoder,
            link.clone(),
            self.rx_count.clone(),
        )));
        self.writer_task = Some(tokio::spawn(writer_loop(
            rx,
            writer,
            link.clone(),
            self.in_flight.clone(),
        )));
        self.tx = Some(tx);
        self.link = Some(link);

        tracing::debug!(capacity = self.capacity, "UART transport open");
        Ok(())
    }

    fn read(&mut self) -> Result<()> {
        // The reader task is always receiving.
        Ok(())
    }

    fn stop_read(&mut self) -> Result<()> {
        let link = self.link.as_ref().ok_or(NpiError::LinkClosed)?;
        link.transfer_complete(self.rx_count.swap(0, Ordering::AcqRel), 0);
        Ok(())
    }

    fn write(&mut self, wire: Bytes) -> Result<WriteStatus> {
        let tx = self.tx.as_ref().ok_or(NpiError::LinkClosed)?;
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(WriteStatus::Busy);
        }

        match tx.try_send(wire) {
            Ok(()) => Ok(WriteStatus::Accepted),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Ok(WriteStatus::Busy)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.store(false, Ordering::Release);
                Err(NpiError::LinkClosed)
            }
        }
    }

    fn close(&mut self) {
        // Dropping the sender lets the writer finish what it has and exit.
        self.tx = None;
        self.link = None;
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.writer_task = None;
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Uart
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<S> Drop for UartTransport<S> {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
    }
}

async fn reader_loop<S>(
    mut reader: ReadHalf<S>,
    mut decoder: UartDecoder,
    link: LinkHandle,
    rx_count: Arc<AtomicUsize>,
) where
    S: AsyncRead,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("UART stream closed by peer");
                link.closed();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::error!("UART read error: {}", e);
                link.fault(e.to_string());
                return;
            }
        };
        rx_count.fetch_add(n, Ordering::AcqRel);

        for &byte in &buf[..n] {
            match decoder.decode_step(byte) {
                DecodeStep::Incomplete => {}
                DecodeStep::Frame(frame) => link.frame_received(frame),
                DecodeStep::Invalid(rejection) => {
                    tracing::debug!(?rejection, "discarding malformed UART frame");
                    link.frame_rejected();
                }
            }
        }
    }
}

async fn writer_loop<S>(
    mut rx: mpsc::Receiver<Bytes>,
    mut writer: WriteHalf<S>,
    link: LinkHandle,
    in_flight: Arc<AtomicBool>,
) where
    S: AsyncWrite,
{
    while let Some(wire) = rx.recv().await {
        let result = async {
            writer.write_all(&wire).await?;
            writer.flush().await
        }
        .await;

        in_flight.store(false, Ordering::Release);
        match result {
            Ok(()) => link.transfer_complete(0, wire.len()),
            Err(e) => {
                tracing::error!("UART write error: {}", e);
                link.fault(e.to_string());
                return;
            }
        }
    }
    tracing::debug!("UART writer stopped");
}
