//! Error types for satflash.

use std::io;
use thiserror::Error;

/// Result type for satflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for satflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Failed to reach the bootloader (port open failure, autobaud exhaustion).
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected bootloader response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The bootloader rejected an image before the first block was accepted.
    ///
    /// Typically means the image was built for a different partition or
    /// module revision. Never retried.
    #[error("Partition mismatch: {0}")]
    PartitionMismatch(String),

    /// XMODEM transfer failure, after bounded retries.
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Invalid merged-binary container.
    #[error("Invalid container: {0}")]
    InvalidContainer(String),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// No matching serial device found.
    #[error("Device not found")]
    DeviceNotFound,

    /// Operation cancelled by the embedding application.
    #[error("Interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
