//! Host-side utilities for serial port discovery.

use crate::device::DetectedPort;

/// Discover all available serial ports.
#[must_use]
pub fn discover_ports() -> Vec<DetectedPort> {
    crate::device::enumerate()
}

/// Block until the operator plugs in a module, ignoring debug-console
/// companion interfaces.
pub fn wait_for_new_port() -> crate::Result<DetectedPort> {
    let ignore: Vec<_> = crate::device::KNOWN_PROFILES
        .iter()
        .filter(|p| p.is_debug_console())
        .collect();
    crate::device::detect_new_port(&ignore)
}
