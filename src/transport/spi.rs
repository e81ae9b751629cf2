//! SPI binding over a blocking full-duplex bus.
//!
//! Every transfer clocks exactly `transaction_size` bytes in both
//! directions. A write sends the encoded (zero-padded) frame; a read sends
//! an all-zero transaction. Whatever came back is decoded once the
//! transaction completes.
//!
//! Bus drivers block, so the driver loop runs on tokio's blocking pool and
//! takes jobs from an unbounded channel.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{LinkHandle, Transport, WriteStatus};
use crate::config::NpiConfig;
use crate::error::{NpiError, Result};
use crate::protocol::{decode_spi, idle_transaction, SpiDecode, WireFormat, SPI_OVERHEAD};

/// A full-duplex SPI bus.
pub trait SpiBus: Send + 'static {
    /// Clock `tx` out while filling `rx`; both are the same length.
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()>;
}

impl<F> SpiBus for F
where
    F: FnMut(&[u8], &mut [u8]) -> io::Result<()> + Send + 'static,
{
    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> io::Result<()> {
        self(tx, rx)
    }
}

#[derive(Debug)]
enum Job {
    Read,
    Write(Bytes),
}

/// SPI transport over an [`SpiBus`].
pub struct SpiTransport<B> {
    bus: Option<B>,
    transaction_size: usize,
    jobs: Option<mpsc::UnboundedSender<Job>>,
    in_flight: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
}

impl<B: SpiBus> SpiTransport<B> {
    /// Wrap a bus that clocks `transaction_size` bytes per transfer.
    pub fn new(bus: B, transaction_size: usize) -> Self {
        Self {
            bus: Some(bus),
            transaction_size,
            jobs: None,
            in_flight: Arc::new(AtomicBool::new(false)),
            driver: None,
        }
    }

    /// Wrap a bus using the configured `spi_transaction_size`.
    pub fn from_config(bus: B, config: &NpiConfig) -> Self {
        Self::new(bus, config.spi_transaction_size)
    }

    /// Bytes per transaction.
    pub fn transaction_size(&self) -> usize {
        self.transaction_size
    }

    fn submit(&self, job: Job) -> Result<()> {
        let jobs = self.jobs.as_ref().ok_or(NpiError::LinkClosed)?;
        jobs.send(job).map_err(|_| NpiError::LinkClosed)
    }
}

impl<B: SpiBus> Transport for SpiTransport<B> {
    fn open(&mut self, link: LinkHandle) -> Result<()> {
        let bus = self
            .bus
            .take()
            .ok_or_else(|| NpiError::Transport("SPI transport already opened".into()))?;
        if self.transaction_size <= SPI_OVERHEAD {
            return Err(NpiError::InvalidConfig(format!(
                "SPI transaction size {} leaves no room for payload",
                self.transaction_size
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let size = self.transaction_size;
        let capacity = self.capacity().min(link.capacity());
        let in_flight = self.in_flight.clone();
        self.driver = Some(tokio::task::spawn_blocking(move || {
            driver_loop(bus, rx, link, size, capacity, in_flight)
        }));
        self.jobs = Some(tx);

        tracing::debug!(transaction_size = size, "SPI transport open");
        Ok(())
    }

    fn read(&mut self) -> Result<()> {
        self.submit(Job::Read)
    }

    fn stop_read(&mut self) -> Result<()> {
        // Transactions are fixed-size and end on their own.
        Ok(())
    }

    fn write(&mut self, wire: Bytes) -> Result<WriteStatus> {
        if wire.len() != self.transaction_size {
            return Err(NpiError::InvalidFrame(format!(
                "SPI buffer is {} bytes, transaction is {}",
                wire.len(),
                self.transaction_size
            )));
        }
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Ok(WriteStatus::Busy);
        }
        if let Err(e) = self.submit(Job::Write(wire)) {
            self.in_flight.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(WriteStatus::Accepted)
    }

    fn close(&mut self) {
        // The driver exits once the job channel closes.
        self.jobs = None;
        self.driver = None;
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::Spi {
            transaction_size: self.transaction_size,
        }
    }

    fn capacity(&self) -> usize {
        self.transaction_size.saturating_sub(SPI_OVERHEAD)
    }
}

fn driver_loop<B: SpiBus>(
    mut bus: B,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    link: LinkHandle,
    size: usize,
    capacity: usize,
    in_flight: Arc<AtomicBool>,
) {
    let idle = idle_transaction(size);
    let mut rx = vec![0u8; size];

    while let Some(job) = jobs.blocking_recv() {
        let (tx, writing) = match job {
            Job::Write(wire) => (wire, true),
            Job::Read => (idle.clone(), false),
        };

        rx.iter_mut().for_each(|b| *b = 0);
        if let Err(e) = bus.transfer(&tx, &mut rx) {
            in_flight.store(false, Ordering::Release);
            tracing::error!("SPI transfer failed: {}", e);
            link.fault(e.to_string());
            return;
        }

        let rx_len = match decode_spi(&rx, capacity) {
            SpiDecode::Idle => 0,
            SpiDecode::Frame(frame) => {
                let len = frame.payload_len() + SPI_OVERHEAD;
                link.frame_received(frame);
                len
            }
            SpiDecode::Invalid(rejection) => {
                tracing::debug!(?rejection, "discarding malformed SPI frame");
                link.frame_rejected();
                0
            }
        };

        let tx_len = if writing {
            in_flight.store(false, Ordering::Release);
            size
        } else {
            0
        };
        link.transfer_complete(rx_len, tx_len);
    }
    tracing::debug!("SPI driver stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{encode_spi, Frame, MessageType};
    use crate::queue::QueueId;
    use crate::transport::tests::link;
    use crate::transport::LinkEvent;
    use std::sync::Mutex;
    use std::time::Duration;

    const SIZE: usize = 16;

    /// Bus that records what it was sent and answers from a script.
    fn scripted_bus(
        replies: Vec<Vec<u8>>,
    ) -> (Arc<Mutex<Vec<Vec<u8>>>>, impl SpiBus) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let mut replies = replies.into_iter();
        let bus = move |tx: &[u8], rx: &mut [u8]| -> io::Result<()> {
            log.lock().unwrap().push(tx.to_vec());
            if let Some(reply) = replies.next() {
                rx[..reply.len()].copy_from_slice(&reply);
            }
            Ok(())
        };
        (sent, bus)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> LinkEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_clocks_whole_transaction() {
        let (sent, bus) = scripted_bus(vec![]);
        let (link, _ctx, mut events_rx) = link();
        let mut spi = SpiTransport::new(bus, SIZE);
        spi.open(link).unwrap();

        let frame = Frame::build(MessageType::Async, 2, 1, Bytes::from_static(&[0xAA, 0xBB]));
        let wire = encode_spi(&frame, SIZE).unwrap();
        assert_eq!(spi.write(wire.clone()).unwrap(), WriteStatus::Accepted);

        assert_eq!(
            next_event(&mut events_rx).await,
            LinkEvent::TransferComplete {
                rx_len: 0,
                tx_len: SIZE
            }
        );
        assert_eq!(sent.lock().unwrap()[0], wire.to_vec());
    }

    #[tokio::test]
    async fn test_read_decodes_reply() {
        let frame = Frame::build(MessageType::SyncResponse, 3, 9, Bytes::from_static(b"ok"));
        let reply = encode_spi(&frame, SIZE).unwrap().to_vec();
        let (sent, bus) = scripted_bus(vec![reply]);
        let (link, ctx, mut events_rx) = link();
        let mut spi = SpiTransport::new(bus, SIZE);
        spi.open(link).unwrap();

        spi.read().unwrap();
        assert_eq!(
            next_event(&mut events_rx).await,
            LinkEvent::TransferComplete {
                rx_len: 2 + SPI_OVERHEAD,
                tx_len: 0
            }
        );
        assert_eq!(sent.lock().unwrap()[0], vec![0u8; SIZE]);
        assert_eq!(ctx.queues.get(QueueId::SyncFromHost).pop().unwrap(), frame);
    }

    #[tokio::test]
    async fn test_garbage_reply_rejected() {
        let mut reply = vec![0u8; SIZE];
        reply[1] = 0x55;
        let (_sent, bus) = scripted_bus(vec![reply]);
        let (link, ctx, mut events_rx) = link();
        let mut spi = SpiTransport::new(bus, SIZE);
        spi.open(link).unwrap();

        spi.read().unwrap();
        next_event(&mut events_rx).await;
        assert_eq!(ctx.stats.snapshot().frames_rejected, 1);
    }

    #[tokio::test]
    async fn test_bus_error_is_fault() {
        let bus = |_tx: &[u8], _rx: &mut [u8]| -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "bus stuck"))
        };
        let (link, _ctx, mut events_rx) = link();
        let mut spi = SpiTransport::new(bus, SIZE);
        spi.open(link).unwrap();

        spi.read().unwrap();
        assert_eq!(
            next_event(&mut events_rx).await,
            LinkEvent::Fault("bus stuck".into())
        );
    }

    #[test]
    fn test_wrong_size_buffer_rejected() {
        let (_sent, bus) = scripted_bus(vec![]);
        let mut spi = SpiTransport::new(bus, SIZE);
        let result = spi.write(Bytes::from_static(b"short"));
        assert!(matches!(result, Err(NpiError::InvalidFrame(_))));
    }

    #[test]
    fn test_from_config_uses_transaction_size() {
        let (_sent, bus) = scripted_bus(vec![]);
        let config = NpiConfig {
            spi_transaction_size: 40,
            ..NpiConfig::default()
        };
        let spi = SpiTransport::from_config(bus, &config);
        assert_eq!(spi.transaction_size(), 40);
        assert_eq!(spi.capacity(), 40 - SPI_OVERHEAD);
    }

    #[test]
    fn test_capacity_and_format() {
        let (_sent, bus) = scripted_bus(vec![]);
        let spi = SpiTransport::new(bus, SIZE);
        assert_eq!(spi.capacity(), SIZE - SPI_OVERHEAD);
        assert_eq!(
            spi.wire_format(),
            WireFormat::Spi {
                transaction_size: SIZE
            }
        );
    }
}
