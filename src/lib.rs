//! # satflash
//!
//! A library for updating satellite IoT module firmware over a serial port.
//!
//! This crate provides the core functionality for talking to the module
//! bootloader, including:
//!
//! - Autobaud bootloader capture and opcode commands
//! - XMODEM 128-byte block transfer with CRC16
//! - Merged multi-image container parsing and building
//! - Update orchestration across dependent image transfers
//! - USB serial device location
//!
//! ## Example
//!
//! ```rust,no_run
//! use satflash::{BootloaderSession, NativePort, SerialConfig, UpdatePlan, Updater};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!     let session = BootloaderSession::new(port);
//!
//!     let plan = UpdatePlan {
//!         merged: Some("firmware.merged".into()),
//!         start_app: true,
//!         ..Default::default()
//!     };
//!
//!     let mut updater = Updater::new(session);
//!     updater.run(
//!         &plan,
//!         &mut |label, sent, total| println!("{label}: {sent}/{total}"),
//!         &mut |text| print!("{text}"),
//!     )?;
//!
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod host;
pub mod image;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod session;
pub mod updater;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
pub use {
    device::{ChipKind, DetectedPort, UsbDeviceProfile, detect_new_port, enumerate},
    error::{Error, Result},
    host::{discover_ports, wait_for_new_port},
    image::merged::{MergedImage, Segment, SegmentType},
    monitor::{clean_debug_text, drain_utf8_lossy},
    port::{NativePort, Port, SerialConfig},
    protocol::{BLOCK_SIZE, XmodemTransfer, crc::crc16_xmodem},
    session::{BootloaderSession, BootloaderState, HardwareReset, NoHardwareReset, SessionConfig},
    updater::{UpdateCommand, UpdatePlan, Updater},
};

#[cfg(test)]
mod tests {
    use super::*;

    // Setting the flag to true here would race with the protocol tests that
    // poll it, so only the quiescent state is asserted.
    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }
}
