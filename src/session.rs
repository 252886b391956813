//! Bootloader session: autobaud capture and single-byte opcode commands.
//!
//! The bootloader infers the host baud rate from a known probe byte (`U`,
//! 0x55, an alternating bit pattern). Capturing it is a small state machine:
//!
//! ```text
//! Unknown -> AutobaudPending -> BootloaderActive
//!                           \-> Failed
//! ```
//!
//! The session owns the transport for its whole lifetime and is passed by
//! reference to every operation; there is no global serial handle.

use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, info, trace, warn};
use std::thread;
use std::time::Duration;

/// Autobaud probe byte.
pub const PROBE_BYTE: u8 = b'U';

/// Probe attempts at the current baud before recovery kicks in.
const INITIAL_PROBE_ATTEMPTS: u32 = 3;

/// Probe attempts after the transport is reopened (and the module optionally
/// hardware-reset).
const RESET_PROBE_ATTEMPTS: u32 = 10;

/// Banner lines read per probe.
const PROBE_BANNER_LINES: u32 = 3;

/// Connection phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootloaderState {
    /// Nothing attempted yet.
    #[default]
    Unknown,
    /// Autobaud capture in progress.
    AutobaudPending,
    /// Bootloader answered a probe; opcodes may be issued.
    BootloaderActive,
    /// Capture exhausted every attempt.
    Failed,
}

/// Optional board-level reset capability.
///
/// Development boards wire the module reset pin to a spare GPIO of the USB
/// bridge; pulsing it (low 100 ms, high 100 ms, release) restarts the module
/// into its bootloader window. The protocol core never depends on this:
/// boards without the wiring fall back to [`NoHardwareReset`] and the
/// operator pressing the reset button.
pub trait HardwareReset {
    /// Pulse the module reset line.
    fn pulse_reset(&mut self) -> Result<()>;
}

/// Fallback [`HardwareReset`] that does nothing.
pub struct NoHardwareReset;

impl HardwareReset for NoHardwareReset {
    fn pulse_reset(&mut self) -> Result<()> {
        debug!("no hardware reset capability; waiting for a manual reset");
        Ok(())
    }
}

/// Session timing options.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between autobaud probes.
    pub probe_spacing: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            probe_spacing: Duration::from_millis(500),
        }
    }
}

/// A bootloader session owning the serial transport.
pub struct BootloaderSession<P: Port> {
    port: P,
    state: BootloaderState,
    reset: Option<Box<dyn HardwareReset>>,
    config: SessionConfig,
}

impl<P: Port> BootloaderSession<P> {
    /// Create a session over an opened transport.
    pub fn new(port: P) -> Self {
        Self {
            port,
            state: BootloaderState::Unknown,
            reset: None,
            config: SessionConfig::default(),
        }
    }

    /// Attach an optional hardware reset capability.
    #[must_use]
    pub fn with_hardware_reset(mut self, reset: Box<dyn HardwareReset>) -> Self {
        self.reset = Some(reset);
        self
    }

    /// Override the session timing options.
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Current connection state.
    pub fn state(&self) -> BootloaderState {
        self.state
    }

    /// Get a mutable reference to the underlying transport.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the transport.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Close the transport. Safe to call on any state.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }

    /// Send one autobaud probe and scan the banner for a bootloader answer.
    ///
    /// Both "Bootloader" (banner) and "Unknown" (the bootloader complaining
    /// about 'U' when it is already captured) count as an answer.
    fn probe(&mut self) -> Result<bool> {
        self.port.write_all(&[PROBE_BYTE])?;
        self.port.flush()?;

        for _ in 0..PROBE_BANNER_LINES {
            let line = self.port.read_line()?;
            if !line.is_empty() {
                trace!("probe banner: {}", String::from_utf8_lossy(&line).trim_end());
            }
            if contains(&line, b"Bootloader") || contains(&line, b"Unknown") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Capture the bootloader, retrying through a transport reopen and an
    /// optional hardware reset.
    ///
    /// Probes [`INITIAL_PROBE_ATTEMPTS`] times at the current baud with
    /// probe-spacing delays; on continued silence reopens the transport,
    /// pulses the reset line if one is attached, and probes another
    /// [`RESET_PROBE_ATTEMPTS`] times. Exhaustion transitions the session to
    /// [`BootloaderState::Failed`] and raises a connection error.
    pub fn capture_bootloader(&mut self) -> Result<()> {
        self.state = BootloaderState::AutobaudPending;
        self.port.reset_input_buffer()?;

        for attempt in 1..=INITIAL_PROBE_ATTEMPTS {
            if crate::is_interrupt_requested() {
                return Err(Error::Interrupted);
            }
            trace!("autobaud probe {attempt}/{INITIAL_PROBE_ATTEMPTS}");
            if self.probe()? {
                info!("Bootloader captured on {}", self.port.name());
                self.state = BootloaderState::BootloaderActive;
                self.port.reset_input_buffer()?;
                return Ok(());
            }
            if attempt < INITIAL_PROBE_ATTEMPTS {
                thread::sleep(self.config.probe_spacing);
            }
        }

        warn!("no answer at current baud; reopening {}", self.port.name());
        self.port.reopen()?;
        if let Some(reset) = self.reset.as_mut() {
            info!("Pulsing hardware reset");
            reset.pulse_reset()?;
        } else {
            info!("Please reset the board");
        }

        for attempt in 1..=RESET_PROBE_ATTEMPTS {
            if crate::is_interrupt_requested() {
                return Err(Error::Interrupted);
            }
            trace!("autobaud probe {attempt}/{RESET_PROBE_ATTEMPTS} (post reset)");
            if self.probe()? {
                info!("Bootloader captured on {}", self.port.name());
                self.state = BootloaderState::BootloaderActive;
                self.port.reset_input_buffer()?;
                return Ok(());
            }
            thread::sleep(self.config.probe_spacing);
        }

        self.state = BootloaderState::Failed;
        Err(Error::Connection(format!(
            "failed to capture the bootloader on {} after {} probes",
            self.port.name(),
            INITIAL_PROBE_ATTEMPTS + RESET_PROBE_ATTEMPTS
        )))
    }

    /// Send an opcode that produces no reply (e.g. jump-to-application).
    pub fn execute_cmd(&mut self, opcode: &str) -> Result<()> {
        trace!("cmd {opcode:?}");
        self.port.write_all(opcode.as_bytes())?;
        self.port.flush()?;
        Ok(())
    }

    /// Send a query opcode and return its one-line reply.
    ///
    /// The bootloader may echo the opcode before answering; an echoed or
    /// empty first line makes the second line the candidate reply. Replies
    /// containing "Unknown", or nothing at all, are retried up to
    /// `max_retries` extra times before a timeout error.
    pub fn execute_cmd_read(&mut self, opcode: &str, max_retries: u32) -> Result<String> {
        for attempt in 0..=max_retries {
            if attempt > 0 {
                debug!("retrying {opcode:?} ({attempt}/{max_retries})");
            }
            self.port.reset_input_buffer()?;
            self.port.write_all(opcode.as_bytes())?;
            self.port.flush()?;

            let first = self.port.read_line()?;
            let first_text = String::from_utf8_lossy(&first).trim().to_string();
            let candidate = if first_text.is_empty() || first_text == opcode {
                let second = self.port.read_line()?;
                String::from_utf8_lossy(&second).trim().to_string()
            } else {
                first_text
            };

            if candidate.is_empty() || candidate.contains("Unknown") {
                continue;
            }
            return Ok(candidate);
        }

        Err(Error::Timeout(format!(
            "no reply to {opcode:?} after {max_retries} retries"
        )))
    }

    /// Query the module ID.
    pub fn get_id(&mut self) -> Result<String> {
        self.execute_cmd_read("i", 2)
    }

    /// Query the module registration code.
    pub fn get_regcode(&mut self) -> Result<String> {
        self.execute_cmd_read("g", 2)
    }

    /// Query the bootloader version.
    pub fn get_version(&mut self) -> Result<String> {
        self.execute_cmd_read("V", 2)
    }

    /// Jump out of the bootloader into the application.
    pub fn jump_to_app(&mut self) -> Result<()> {
        info!("Starting the application");
        self.execute_cmd("b")
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;

    fn fast_session(port: MockPort) -> BootloaderSession<MockPort> {
        let _ = env_logger::builder().is_test(true).try_init();
        BootloaderSession::new(port).with_config(SessionConfig {
            probe_spacing: Duration::from_millis(1),
        })
    }

    /// Queue one probe's worth of silence (three empty banner lines).
    fn push_silent_probe(port: &mut MockPort) {
        for _ in 0..3 {
            port.push_timeout();
        }
    }

    #[test]
    fn test_capture_first_probe() {
        let mut port = MockPort::new();
        port.push_line("Bootloader 1.04");
        let mut session = fast_session(port);
        session.capture_bootloader().unwrap();
        assert_eq!(session.state(), BootloaderState::BootloaderActive);
        assert_eq!(session.port_mut().written, b"U");
        assert_eq!(session.port_mut().reopens, 0);
    }

    #[test]
    fn test_capture_accepts_unknown_banner() {
        // An already-captured bootloader answers 'U' with "Unknown command".
        let mut port = MockPort::new();
        port.push_line("Unknown command");
        let mut session = fast_session(port);
        session.capture_bootloader().unwrap();
        assert_eq!(session.state(), BootloaderState::BootloaderActive);
    }

    #[test]
    fn test_capture_succeeds_via_reset_and_retry_path() {
        let mut port = MockPort::new();
        // Three probes of line garbage at the wrong baud...
        for _ in 0..3 {
            port.push_line("\u{fffd}x\u{fffd}");
            port.push_timeout();
            port.push_timeout();
        }
        // ...then the reopened transport sees the reset banner.
        port.push_line("Bootloader 1.04");

        struct CountingReset(std::rc::Rc<std::cell::Cell<u32>>);
        impl HardwareReset for CountingReset {
            fn pulse_reset(&mut self) -> Result<()> {
                self.0.set(self.0.get() + 1);
                Ok(())
            }
        }

        let pulses = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut session = fast_session(port)
            .with_hardware_reset(Box::new(CountingReset(std::rc::Rc::clone(&pulses))));
        session.capture_bootloader().unwrap();

        assert_eq!(session.state(), BootloaderState::BootloaderActive);
        assert_eq!(pulses.get(), 1);
        assert_eq!(session.port_mut().reopens, 1);
        // Three failed probes plus the successful fourth.
        assert_eq!(session.port_mut().written, b"UUUU");
    }

    #[test]
    fn test_capture_exhaustion_fails_the_session() {
        let mut port = MockPort::new();
        for _ in 0..13 {
            push_silent_probe(&mut port);
        }
        let mut session = fast_session(port);
        let err = session.capture_bootloader().unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {err:?}");
        assert_eq!(session.state(), BootloaderState::Failed);
        assert_eq!(session.port_mut().written.len(), 13);
    }

    #[test]
    fn test_execute_cmd_read_skips_echo() {
        let mut port = MockPort::new();
        port.push_line("i");
        port.push_line("0123456789abcdef");
        let mut session = fast_session(port);
        assert_eq!(session.get_id().unwrap(), "0123456789abcdef");
    }

    #[test]
    fn test_execute_cmd_read_direct_reply() {
        let mut port = MockPort::new();
        port.push_line("1.9");
        let mut session = fast_session(port);
        assert_eq!(session.get_version().unwrap(), "1.9");
        assert_eq!(session.port_mut().written, b"V");
    }

    #[test]
    fn test_execute_cmd_read_retries_unknown_then_succeeds() {
        let mut port = MockPort::new();
        // First attempt: echo then "Unknown command".
        port.push_line("g");
        port.push_line("Unknown command");
        // Second attempt: echo then the real answer.
        port.push_line("g");
        port.push_line("REGCODE42");
        let mut session = fast_session(port);
        assert_eq!(session.get_regcode().unwrap(), "REGCODE42");
        assert_eq!(session.port_mut().written, b"gg");
    }

    #[test]
    fn test_execute_cmd_read_exhaustion_is_timeout() {
        let mut port = MockPort::new();
        // All three attempts (initial + 2 retries) read nothing at all.
        for _ in 0..6 {
            port.push_timeout();
        }
        let mut session = fast_session(port);
        let err = session.get_id().unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {err:?}");
    }

    #[test]
    fn test_execute_cmd_writes_without_reading() {
        let mut session = fast_session(MockPort::new());
        session.jump_to_app().unwrap();
        assert_eq!(session.port_mut().written, b"b");
    }
}
