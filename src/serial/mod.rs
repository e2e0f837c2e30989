//! # Serial Communication Module
//!
//! Handles the serial link to the GPS/motion sensor.
//!
//! This module handles:
//! - Opening the device port at a configured baud rate (8N1, no flow control)
//! - Exposing the port as an async [`ByteSource`] of raw chunks
//!
//! Frame boundaries are not preserved by the link; chunks are handed to the
//! stream reassembler as they arrive.

pub mod port_trait;

pub use port_trait::{ByteSource, ReaderSource};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, UplinkError};

/// Default device baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default maximum bytes per read
pub const DEFAULT_READ_CHUNK_SIZE: usize = 256;

/// Sensor serial port
///
/// Reads raw bytes from the device over USB serial.
pub struct DeviceSerial {
    source: ReaderSource<tokio_serial::SerialStream>,
    device_path: String,
}

impl std::fmt::Debug for DeviceSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl DeviceSerial {
    /// Open the sensor port
    ///
    /// # Arguments
    ///
    /// * `path` - Device path (e.g., "/dev/ttyACM0")
    /// * `baud_rate` - Line speed
    /// * `chunk_size` - Maximum bytes returned per read
    ///
    /// # Returns
    ///
    /// * `Result<DeviceSerial>` - Opened port or error
    ///
    /// # Errors
    ///
    /// Returns `Device` error if the port cannot be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use telemetry_uplink::serial::DeviceSerial;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let serial = DeviceSerial::open("/dev/ttyACM0", 115_200, 256)?;
    ///     println!("Reading from {}", serial.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(path: &str, baud_rate: u32, chunk_size: usize) -> Result<Self> {
        debug!("Opening serial port {} at {} baud", path, baud_rate);
        let port = Self::open_port(path, baud_rate)?;
        info!("Opened sensor device at {}", path);

        Ok(Self {
            source: ReaderSource::new(port, chunk_size),
            device_path: path.to_string(),
        })
    }

    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        use tokio_serial::SerialPortBuilderExt;

        tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| UplinkError::Device(format!("Failed to open {}: {}", path, e)))
    }

    /// Path of the opened device
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

#[async_trait]
impl ByteSource for DeviceSerial {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        self.source.read_chunk().await
    }
}
