//! # npi-transport
//!
//! Network Processor Interface transport: the layer that multiplexes one
//! serial link (UART or SPI) between a host processor and a network
//! processor, turning a byte stream into routed frames and back.
//!
//! ## Architecture
//!
//! ```text
//!  host ◄──► Transport (UART / SPI) ──► LinkHandle ──► inbound queues ──┐
//!                  ▲                                                   ▼
//!                  └──────────── NpiTask ◄── outbound queues ◄── NpiHandle::send
//!                                   │
//!                                   └──► SubsystemRouter ──► route handlers
//! ```
//!
//! - **Framing**: `SOF | len | cmd0 | cmd1 | payload | fcs`, XOR checksum
//! - **Traffic classes**: sync request/response (one outstanding exchange,
//!   watchdog guarded) strictly ahead of async notifications
//! - **Flow control**: optional remote-ready / local-ready handshake
//!
//! ## Example
//!
//! ```no_run
//! use npi_transport::protocol::Frame;
//! use npi_transport::{Npi, UartTransport};
//!
//! #[tokio::main]
//! async fn main() -> npi_transport::Result<()> {
//!     let (stream, _host) = tokio::io::duplex(1024);
//!
//!     let npi = Npi::builder()
//!         .route(0x02, |frame: Frame| {
//!             println!("opcode {:#04x}: {:?}", frame.cmd1(), frame.payload());
//!         })
//!         .start(UartTransport::new(stream, 256))
//!         .await?;
//!
//!     npi.wait().await
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod last_gasp;
pub mod protocol;
pub mod queue;
pub mod router;
pub mod sync_tracker;
pub mod transport;

mod context;
mod npi;
mod stats;
mod task;

pub use config::NpiConfig;
pub use error::{NpiError, Result};
pub use flow::{AlwaysReady, FlowEdge, FlowLines};
pub use npi::{Npi, NpiBuilder, NpiHandle};
pub use router::ObserverMode;
pub use stats::LinkStats;
pub use transport::{LinkHandle, SpiBus, SpiTransport, Transport, UartTransport, WriteStatus};
