//! Runtime configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! changes:
//!
//! ```
//! use npi_transport::NpiConfig;
//!
//! let config = NpiConfig::from_json(r#"{ "max_payload": 128, "sync_timeout_ms": 250 }"#).unwrap();
//! assert_eq!(config.max_payload, 128);
//! assert_eq!(config.max_routes, 8);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NpiError, Result};
use crate::protocol::SPI_OVERHEAD;

/// Default transport buffer capacity (payload bytes).
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

/// Default sync watchdog timeout.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 1000;

/// Default route table capacity.
pub const DEFAULT_MAX_ROUTES: usize = 8;

/// Default depth of each inbound queue.
pub const DEFAULT_RX_QUEUE_DEPTH: usize = 16;

/// Default depth of each outbound queue.
pub const DEFAULT_TX_QUEUE_DEPTH: usize = 16;

/// Default SPI transaction size: the default payload plus envelope.
pub const DEFAULT_SPI_TRANSACTION_SIZE: usize = DEFAULT_MAX_PAYLOAD + SPI_OVERHEAD;

/// Default gap between idle reads on an SPI link without handshake lines.
pub const DEFAULT_SPI_POLL_INTERVAL_MS: u64 = 10;

/// NPI configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NpiConfig {
    /// Largest payload accepted in either direction.
    pub max_payload: usize,
    /// How long an outstanding sync transaction may wait for its answer.
    pub sync_timeout_ms: u64,
    /// Route table capacity.
    pub max_routes: usize,
    /// Depth of each inbound queue.
    pub rx_queue_depth: usize,
    /// Depth of each outbound queue.
    pub tx_queue_depth: usize,
    /// Bytes per SPI transaction, used by [`SpiTransport::from_config`](crate::SpiTransport::from_config).
    pub spi_transaction_size: usize,
    /// Without handshake lines an SPI link clocks a read this often while
    /// the host has nothing to say.
    pub spi_poll_interval_ms: u64,
    /// Whether the link uses the remote-ready / local-ready handshake.
    pub flow_control: bool,
}

impl Default for NpiConfig {
    fn default() -> Self {
        Self {
            max_payload: DEFAULT_MAX_PAYLOAD,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            max_routes: DEFAULT_MAX_ROUTES,
            rx_queue_depth: DEFAULT_RX_QUEUE_DEPTH,
            tx_queue_depth: DEFAULT_TX_QUEUE_DEPTH,
            spi_transaction_size: DEFAULT_SPI_TRANSACTION_SIZE,
            spi_poll_interval_ms: DEFAULT_SPI_POLL_INTERVAL_MS,
            flow_control: false,
        }
    }
}

impl NpiConfig {
    /// Parse from JSON and validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: NpiConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the task cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            return Err(NpiError::InvalidConfig(format!(
                "max_payload must be 1..=65535, got {}",
                self.max_payload
            )));
        }
        if self.max_routes == 0 {
            return Err(NpiError::InvalidConfig("max_routes must be non-zero".into()));
        }
        if self.rx_queue_depth == 0 || self.tx_queue_depth == 0 {
            return Err(NpiError::InvalidConfig(
                "queue depths must be non-zero".into(),
            ));
        }
        if self.spi_transaction_size <= SPI_OVERHEAD {
            return Err(NpiError::InvalidConfig(format!(
                "spi_transaction_size must exceed the {} byte envelope",
                SPI_OVERHEAD
            )));
        }
        if self.spi_poll_interval_ms == 0 {
            return Err(NpiError::InvalidConfig(
                "spi_poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Watchdog timeout as a `Duration`.
    #[inline]
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Idle SPI read interval as a `Duration`.
    #[inline]
    pub fn spi_poll_interval(&self) -> Duration {
        Duration::from_millis(self.spi_poll_interval_ms)
    }
}
