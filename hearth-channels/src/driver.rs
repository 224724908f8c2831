//! The channel driver contract
//!
//! Concrete protocol drivers (Modbus, M-Bus, vendor buses) implement
//! [`ChannelDriver`]; the binding layer is the only caller. Driver
//! failures are always treated as recoverable: a failed read is retried
//! on the next sampling period, a failed write is reported to the
//! binding's error sink.

use hearth_types::{Quality, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// External hardware address of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelLocator {
    /// Driver interface id, e.g. `"modbus-tcp"`.
    pub interface: String,
    /// Device address within the interface.
    pub device: String,
    /// Channel address within the device.
    pub channel: String,
}

impl ChannelLocator {
    pub fn new(
        interface: impl Into<String>,
        device: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            device: device.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for ChannelLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.interface, self.device, self.channel)
    }
}

/// One timestamped raw sample from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: Timestamp,
    pub raw: f64,
    /// Propagated into cell metadata, never silently dropped.
    pub quality: Quality,
}

/// Driver-side failure. Always recoverable/retryable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    /// Transport or device failure while reading/writing.
    #[error("driver i/o error: {0}")]
    Io(String),
    /// The driver does not know the addressed channel.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

/// Contract implemented by hardware/protocol drivers.
pub trait ChannelDriver: Send {
    /// Enumerate the channels the driver currently knows on an
    /// interface.
    fn list_known_addresses(&self, interface: &str) -> Result<Vec<ChannelLocator>, DriverError>;

    /// Read the latest sample for each locator. One result per
    /// locator, in order; individual channels may fail independently.
    fn read_channels(&mut self, locators: &[ChannelLocator]) -> Vec<Result<Sample, DriverError>>;

    /// Write one raw value to hardware.
    fn write_channel(&mut self, locator: &ChannelLocator, raw: f64) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_display() {
        let locator = ChannelLocator::new("drv1", "dev1", "ch1");
        assert_eq!(locator.to_string(), "drv1/dev1/ch1");
    }
}
