//! Serial transport seam.
//!
//! Protocol code talks to a [`Port`] trait instead of the OS serial stack
//! directly, so the handshake, transfer, and orchestration layers can be
//! exercised against scripted in-memory doubles. The one production
//! implementation is [`NativePort`] over the `serialport` crate.

pub mod native;

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Lowest baud rate the bootloader autobauds to.
pub const MIN_BAUD: u32 = 9_600;

/// Highest baud rate the bootloader autobauds to.
pub const MAX_BAUD: u32 = 921_600;

/// Default baud rate for a freshly opened session.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Per-call read timeout. Every blocking read is bounded by this, so no
/// single protocol step can stall forever.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Serial port configuration. Framing is fixed at 8N1.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate, within [`MIN_BAUD`]..=[`MAX_BAUD`].
    pub baud_rate: u32,
    /// Per-call read timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: READ_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the per-call read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check that the configured baud rate is one the bootloader can lock to.
    pub fn validate(&self) -> Result<()> {
        if (MIN_BAUD..=MAX_BAUD).contains(&self.baud_rate) {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "baud rate {} outside supported range {MIN_BAUD}..={MAX_BAUD}",
                self.baud_rate
            )))
        }
    }
}

/// Byte-stream transport owned by a bootloader session.
pub trait Port: Read + Write + Send {
    /// Change the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard any pending, unread input.
    fn reset_input_buffer(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release the OS handle. Safe to call twice.
    fn close(&mut self) -> Result<()>;

    /// Close and open the port again with the current settings.
    ///
    /// The autobaud recovery path uses this to clear a wedged line
    /// discipline before re-probing.
    fn reopen(&mut self) -> Result<()>;

    /// Read bytes until a newline or the per-call timeout.
    ///
    /// A timeout returns whatever was accumulated so far, possibly nothing.
    /// The trailing newline is included when present.
    fn read_line(&mut self) -> Result<Vec<u8>> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match self.read(&mut byte) {
                Ok(1) => {
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        break;
                    }
                },
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(line)
    }
}

pub use native::NativePort;
